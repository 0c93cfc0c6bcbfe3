use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ClassifierError, Result};
use crate::model::vocabulary::{LabelVocabulary, NOT_A_CAR_LABEL};

/// OOD判定の既定閾値
pub const DEFAULT_OOD_THRESHOLD: f32 = 0.5;

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// 予測クラス（車でない場合は "Not A Car"）
    pub predicted_class: String,
    /// 信頼度 [0, 1]
    pub confidence: f32,
    /// 車である確率 sigmoid(ood_logit) [0, 1]
    pub ood_probability: f32,
    /// 全クラスの確率（車と判定された場合のみ）
    pub class_probabilities: Option<BTreeMap<String, f32>>,
}

impl Verdict {
    /// 確率から判定結果を作成
    ///
    /// `ood_probability < threshold` なら車ではないと判定し、信頼度は
    /// `1 - ood_probability` とします。閾値と等しい場合は車として扱います。
    /// `class_probabilities` は語彙と同じ順序・同じ長さのsoftmax出力です。
    /// 長さが一致しない場合は `ClassifierError::Inference` を返します。
    pub fn decide(
        vocabulary: &LabelVocabulary,
        ood_probability: f32,
        class_probabilities: &[f32],
        threshold: f32,
    ) -> Result<Self> {
        if class_probabilities.len() != vocabulary.len() {
            return Err(ClassifierError::Inference(format!(
                "{} class probabilities for {} classes",
                class_probabilities.len(),
                vocabulary.len()
            )));
        }

        if ood_probability < threshold {
            // TODO: 信頼度が ood_probability の単純な変換になっており意味が重複している。
            // 互換性のため維持しているが、閾値からの距離に基づく値を検討する
            return Ok(Self {
                predicted_class: NOT_A_CAR_LABEL.to_string(),
                confidence: 1.0 - ood_probability,
                ood_probability,
                class_probabilities: None,
            });
        }

        let (predicted, confidence) = vocabulary
            .iter()
            .zip(class_probabilities.iter().copied())
            .fold(None, |best: Option<(&str, f32)>, (label, p)| match best {
                Some((_, best_p)) if best_p >= p => best,
                _ => Some((label, p)),
            })
            .ok_or_else(|| ClassifierError::Inference("empty class distribution".to_string()))?;

        let distribution = vocabulary
            .iter()
            .zip(class_probabilities)
            .map(|(label, p)| (label.to_string(), *p))
            .collect();

        Ok(Self {
            predicted_class: predicted.to_string(),
            confidence,
            ood_probability,
            class_probabilities: Some(distribution),
        })
    }

    /// 車と判定されたか
    pub fn is_car(&self) -> bool {
        self.class_probabilities.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> LabelVocabulary {
        LabelVocabulary::default_classes()
    }

    #[test]
    fn test_in_distribution_scenario() {
        let probs = [0.1, 0.07, 0.73, 0.1];
        let verdict = Verdict::decide(&vocab(), 0.8, &probs, DEFAULT_OOD_THRESHOLD).unwrap();

        assert_eq!(verdict.predicted_class, "Maruti_Suzuki_Swift");
        assert_eq!(verdict.confidence, 0.73);
        assert_eq!(verdict.ood_probability, 0.8);

        let distribution = verdict.class_probabilities.as_ref().unwrap();
        assert_eq!(distribution.len(), 4);
        assert_eq!(distribution["Maruti_Suzuki_Baleno"], 0.1);
        assert_eq!(distribution["Maruti_Suzuki_WagonR"], 0.1);
        assert!((distribution.values().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(verdict.is_car());
    }

    #[test]
    fn test_rejection_scenario() {
        let probs = [0.1, 0.07, 0.73, 0.1];
        let verdict = Verdict::decide(&vocab(), 0.2, &probs, DEFAULT_OOD_THRESHOLD).unwrap();

        assert_eq!(verdict.predicted_class, NOT_A_CAR_LABEL);
        assert!((verdict.confidence - 0.8).abs() < 1e-6);
        assert_eq!(verdict.ood_probability, 0.2);
        assert!(verdict.class_probabilities.is_none());
        assert!(!verdict.is_car());
    }

    #[test]
    fn test_threshold_boundary_is_in_distribution() {
        let probs = [0.25, 0.25, 0.25, 0.25];
        let verdict = Verdict::decide(&vocab(), 0.5, &probs, 0.5).unwrap();
        assert!(verdict.is_car());

        let verdict = Verdict::decide(&vocab(), 0.4999, &probs, 0.5).unwrap();
        assert!(!verdict.is_car());
    }

    #[test]
    fn test_ties_pick_first_index() {
        let probs = [0.4, 0.4, 0.1, 0.1];
        let verdict = Verdict::decide(&vocab(), 0.9, &probs, 0.5).unwrap();
        assert_eq!(verdict.predicted_class, "Maruti_Suzuki_Baleno");
    }

    #[test]
    fn test_serialize_rejection_as_null_distribution() {
        let verdict = Verdict::decide(&vocab(), 0.1, &[0.25; 4], 0.5).unwrap();
        let json = serde_json::to_value(&verdict).unwrap();

        assert_eq!(json["predicted_class"], "Not A Car");
        assert!(json["class_probabilities"].is_null());
    }

    #[test]
    fn test_distribution_length_must_match_vocabulary() {
        // 語彙より長い分布で最大値が範囲外にある場合
        let err = Verdict::decide(&vocab(), 0.9, &[0.1, 0.1, 0.1, 0.1, 0.6], 0.5).unwrap_err();
        assert!(matches!(err, ClassifierError::Inference(_)));

        let err = Verdict::decide(&vocab(), 0.9, &[0.5, 0.5], 0.5).unwrap_err();
        assert!(matches!(err, ClassifierError::Inference(_)));

        // 棄却される場合でも長さは検証する
        assert!(Verdict::decide(&vocab(), 0.1, &[1.0], 0.5).is_err());
    }
}
