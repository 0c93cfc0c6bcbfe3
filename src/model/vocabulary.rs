//! クラス名一覧（ラベル語彙）
//!
//! インデックス位置がモデル出力層のクラスIDに対応します。
//! 構築後は変更できません。

use std::sync::Arc;

use crate::error::{ClassifierError, Result};
use crate::model::model_metadata::ModelMetadata;

/// 車ではないと判定された場合のラベル
pub const NOT_A_CAR_LABEL: &str = "Not A Car";

/// メタデータが無い場合のクラス名
pub const DEFAULT_CLASS_NAMES: [&str; 4] = [
    "Maruti_Suzuki_Baleno",
    "Maruti_Suzuki_Brezza",
    "Maruti_Suzuki_Swift",
    "Maruti_Suzuki_WagonR",
];

/// 順序付きのクラス名一覧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVocabulary {
    labels: Arc<[String]>,
}

impl LabelVocabulary {
    /// クラス名一覧を作成
    ///
    /// 空・重複・"Not A Car" との衝突はエラーになります。
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();

        if labels.is_empty() {
            return Err(ClassifierError::InvalidVocabulary(
                "class_names must not be empty".to_string(),
            ));
        }

        for (i, label) in labels.iter().enumerate() {
            if label == NOT_A_CAR_LABEL {
                return Err(ClassifierError::InvalidVocabulary(format!(
                    "class name '{}' is reserved",
                    NOT_A_CAR_LABEL
                )));
            }
            if labels[..i].contains(label) {
                return Err(ClassifierError::InvalidVocabulary(format!(
                    "duplicate class name '{}'",
                    label
                )));
            }
        }

        Ok(Self {
            labels: labels.into(),
        })
    }

    /// 組み込みのクラス名一覧
    pub fn default_classes() -> Self {
        Self {
            labels: DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// メタデータのclass_namesから作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Result<Self> {
        Self::new(metadata.class_names.iter().cloned())
    }

    /// クラス数
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// クラス名一覧
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// クラスインデックスからラベルを取得
    pub fn class_index_to_label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// ラベルからクラスインデックスを取得
    pub fn label_to_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}
