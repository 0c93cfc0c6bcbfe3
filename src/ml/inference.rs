//! モデル推論機能

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use burn::module::Module;
use burn::tensor::{
    activation::{sigmoid, softmax},
    backend::Backend,
    Tensor,
};

use crate::error::{ClassifierError, Result};
use crate::ml::preprocess::{ImagePreprocessor, ImageSource};
use crate::ml::CarClassifierWithOod;
use crate::model::config::ModelSettings;
use crate::model::loader::{LoadedModel, ModelLoader};
use crate::model::vocabulary::LabelVocabulary;
use crate::types::{Verdict, DEFAULT_OOD_THRESHOLD};

/// 推論エンジン
///
/// 読み込み済みモデルは推論中に変更されないため、`predict` は `&self` で
/// 呼び出せます。複数スレッドから使う場合はスレッドごとに `clone` してください
/// （重みのストレージは共有されます）。
#[derive(Debug, Clone)]
pub struct InferenceEngine<B: Backend> {
    model: CarClassifierWithOod<B>,
    vocabulary: LabelVocabulary,
    preprocessor: ImagePreprocessor,
    device: B::Device,
    default_threshold: f32,
}

impl<B: Backend> InferenceEngine<B> {
    /// 読み込み済みモデルから推論エンジンを作成
    pub fn new(model: CarClassifierWithOod<B>, vocabulary: LabelVocabulary, device: B::Device) -> Result<Self> {
        if model.num_classes() != vocabulary.len() {
            return Err(ClassifierError::InvalidVocabulary(format!(
                "{} class names for a model with {} outputs",
                vocabulary.len(),
                model.num_classes()
            )));
        }

        Ok(Self {
            model: model.to_device(&device),
            vocabulary,
            preprocessor: ImagePreprocessor::default(),
            device,
            default_threshold: DEFAULT_OOD_THRESHOLD,
        })
    }

    /// アーティファクトを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, loader: &ModelLoader, device: B::Device) -> Result<Self> {
        let LoadedModel { model, vocabulary, .. } = loader.load::<B, _>(model_path, &device)?;
        Self::new(model, vocabulary, device)
    }

    /// モデル設定から推論エンジンを初期化
    pub fn from_settings(settings: &ModelSettings, device: B::Device) -> Result<Self> {
        Self::load(settings.model_path(), &ModelLoader::from_settings(settings), device)
    }

    /// 既定のOOD閾値を変更
    pub fn with_default_threshold(mut self, threshold: f32) -> Result<Self> {
        validate_threshold(threshold)?;
        self.default_threshold = threshold;
        Ok(self)
    }

    /// クラス名一覧
    pub fn classes(&self) -> &[String] {
        self.vocabulary.labels()
    }

    pub fn vocabulary(&self) -> &LabelVocabulary {
        &self.vocabulary
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    /// 単一画像を分類
    pub fn predict<'a, I: Into<ImageSource<'a>>>(&self, image: I, threshold: f32) -> Result<Verdict> {
        validate_threshold(threshold)?;

        let started = Instant::now();
        let tensor = self.preprocessor.preprocess::<B>(&image.into(), &self.device)?;
        let verdict = self.predict_tensor(tensor, threshold)?;

        tracing::debug!(
            predicted = %verdict.predicted_class,
            confidence = verdict.confidence,
            ood_probability = verdict.ood_probability,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Prediction finished"
        );

        Ok(verdict)
    }

    /// 既定の閾値で単一画像を分類
    pub fn predict_with_default_threshold<'a, I: Into<ImageSource<'a>>>(&self, image: I) -> Result<Verdict> {
        self.predict(image, self.default_threshold)
    }

    /// 複数画像を順に分類
    pub fn predict_batch<'a, I>(&self, images: I, threshold: f32) -> Result<Vec<Verdict>>
    where
        I: IntoIterator,
        I::Item: Into<ImageSource<'a>>,
    {
        images
            .into_iter()
            .map(|image| self.predict(image, threshold))
            .collect()
    }

    /// 前処理済みテンソル [1, 3, 224, 224] を分類
    pub fn predict_tensor(&self, images: Tensor<B, 4>, threshold: f32) -> Result<Verdict> {
        validate_threshold(threshold)?;

        let (ood_probability, class_probabilities) = self.forward_probabilities(images)?;
        Verdict::decide(&self.vocabulary, ood_probability, &class_probabilities, threshold)
    }

    /// 順伝播して (sigmoid(ood_logit), softmax(car_logits)) を返す
    fn forward_probabilities(&self, images: Tensor<B, 4>) -> Result<(f32, Vec<f32>)> {
        let [batch_size, ..] = images.dims();
        if batch_size != 1 {
            return Err(ClassifierError::Inference(format!(
                "expected a batch of 1 image, got {}",
                batch_size
            )));
        }

        let outputs = panic::catch_unwind(AssertUnwindSafe(|| {
            let (car_logits, ood_logits) = self.model.forward(images);
            let ood = sigmoid(ood_logits).into_data().convert::<f32>().to_vec::<f32>();
            let probabilities = softmax(car_logits, 1).into_data().convert::<f32>().to_vec::<f32>();
            (ood, probabilities)
        }))
        .map_err(|payload| ClassifierError::Inference(panic_message(payload.as_ref())))?;

        let ood = outputs
            .0
            .map_err(|e| ClassifierError::Inference(format!("推論結果の取得エラー: {:?}", e)))?;
        let probabilities = outputs
            .1
            .map_err(|e| ClassifierError::Inference(format!("推論結果の取得エラー: {:?}", e)))?;

        let ood_probability = match ood.as_slice() {
            [p] if p.is_finite() => *p,
            other => {
                return Err(ClassifierError::Inference(format!(
                    "unexpected OOD output: {:?}",
                    other
                )))
            }
        };

        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(ClassifierError::Inference("non-finite class probability".to_string()));
        }

        Ok((ood_probability, probabilities))
    }
}

fn validate_threshold(threshold: f32) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(ClassifierError::InvalidInput(format!(
            "OOD threshold must be within [0, 1], got {}",
            threshold
        )))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "forward pass panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::tests::{small_backbone, small_config};
    use crate::ml::preprocess::tests::png_bytes;
    use crate::model::loader::ArtifactFormat;
    use crate::model::model_storage::{save_full_bundle, save_weights};
    use crate::model::torch_import::tests::small_state_dict;
    use crate::model::vocabulary::NOT_A_CAR_LABEL;
    use burn_ndarray::{NdArray, NdArrayDevice};

    fn engine(num_classes: usize) -> InferenceEngine<NdArray> {
        let device = NdArrayDevice::default();
        let model = small_config(num_classes).init::<NdArray>(&device);
        let vocabulary = LabelVocabulary::new((0..num_classes).map(|i| format!("car_{}", i))).unwrap();
        InferenceEngine::new(model, vocabulary, device).unwrap()
    }

    fn assert_probability(value: f32) {
        assert!((0.0..=1.0).contains(&value), "{} is not a probability", value);
    }

    #[test]
    fn test_classes_match_head_width() {
        let engine = engine(4);
        assert_eq!(engine.classes().len(), engine.model.num_classes());
    }

    #[test]
    fn test_vocabulary_mismatch_is_rejected() {
        let device = NdArrayDevice::default();
        let model = small_config(3).init::<NdArray>(&device);
        let err = InferenceEngine::new(model, LabelVocabulary::default_classes(), device).unwrap_err();
        assert!(matches!(err, ClassifierError::InvalidVocabulary(_)));
    }

    #[test]
    fn test_in_distribution_when_threshold_is_zero() {
        let engine = engine(4);
        let verdict = engine.predict(png_bytes(64, 48, 3), 0.0).unwrap();

        assert_probability(verdict.ood_probability);
        assert_probability(verdict.confidence);
        assert!(engine.classes().contains(&verdict.predicted_class));

        let distribution = verdict.class_probabilities.as_ref().unwrap();
        assert_eq!(distribution.len(), 4);
        assert!(distribution.values().all(|p| *p >= 0.0));
        assert!((distribution.values().sum::<f32>() - 1.0).abs() < 1e-5);

        let max = distribution.values().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_eq!(verdict.confidence, max);
        assert_eq!(distribution[&verdict.predicted_class], max);
    }

    #[test]
    fn test_probabilities_in_range_for_random_images() {
        use image::{DynamicImage, RgbImage};
        use rand::{Rng, SeedableRng};

        let engine = engine(4);
        let device = NdArrayDevice::default();
        let preprocessor = ImagePreprocessor::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        for _ in 0..3 {
            let (width, height) = (rng.gen_range(8..128), rng.gen_range(8..128));
            let img = RgbImage::from_fn(width, height, |_, _| image::Rgb(rng.gen()));
            let tensor = preprocessor.image_to_tensor::<NdArray>(&DynamicImage::ImageRgb8(img), &device);

            for threshold in [0.0, 0.5, 1.0] {
                let verdict = engine.predict_tensor(tensor.clone(), threshold).unwrap();
                assert_probability(verdict.ood_probability);
                assert_probability(verdict.confidence);
                if !verdict.is_car() {
                    assert_eq!(verdict.predicted_class, NOT_A_CAR_LABEL);
                }
            }
        }
    }

    #[test]
    fn test_threshold_boundary_on_real_forward_pass() {
        let engine = engine(3);
        let image = png_bytes(32, 32, 9);
        let ood_probability = engine.predict(image.as_slice(), 0.0).unwrap().ood_probability;

        // 閾値と等しい場合は車として扱う
        let at_threshold = engine.predict(image.as_slice(), ood_probability).unwrap();
        assert!(at_threshold.is_car());

        if ood_probability < 1.0 {
            let above = (ood_probability + 1e-3).min(1.0);
            let rejected = engine.predict(image.as_slice(), above).unwrap();
            assert_eq!(rejected.predicted_class, NOT_A_CAR_LABEL);
            assert!(rejected.class_probabilities.is_none());
            assert!((rejected.confidence - (1.0 - ood_probability)).abs() < 1e-6);
        }
    }

    #[test]
    fn test_predict_is_idempotent() {
        let engine = engine(4);
        let image = png_bytes(80, 60, 21);

        let first = engine.predict(image.as_slice(), 0.5).unwrap();
        let second = engine.predict(image.as_slice(), 0.5).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_threshold_and_image() {
        let engine = engine(2);
        let image = png_bytes(16, 16, 0);

        assert!(matches!(
            engine.predict(image.as_slice(), 1.5),
            Err(ClassifierError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.predict(image.as_slice(), f32::NAN),
            Err(ClassifierError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.predict(&b"not an image"[..], 0.5),
            Err(ClassifierError::ImageDecode(_))
        ));
    }

    #[test]
    fn test_malformed_tensor_is_inference_error() {
        let engine = engine(2);
        let device = NdArrayDevice::default();

        let batch = Tensor::<NdArray, 4>::zeros([2, 3, 224, 224], &device);
        assert!(matches!(
            engine.predict_tensor(batch, 0.5),
            Err(ClassifierError::Inference(_))
        ));
    }

    #[test]
    fn test_predict_batch_and_default_threshold() {
        let engine = engine(3).with_default_threshold(0.0).unwrap();
        let images = vec![png_bytes(20, 20, 1), png_bytes(30, 10, 2)];

        let verdicts = engine.predict_batch(images.iter().map(|b| b.as_slice()), 0.0).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(
            engine.predict_with_default_threshold(images[0].as_slice()).unwrap(),
            verdicts[0]
        );
        assert!(engine.clone().with_default_threshold(-0.1).is_err());
    }

    #[test]
    fn test_weights_and_full_bundle_give_same_verdict() {
        let device = NdArrayDevice::default();
        let config = small_config(4);
        let model = config.init::<NdArray>(&device);
        let class_names: Vec<String> = LabelVocabulary::default_classes().labels().to_vec();

        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("car_classifier.mpk");
        let bundle = dir.path().join("car_classifier_full.tar.gz");
        save_weights(&weights, &model).unwrap();
        save_full_bundle(&bundle, &model, &config, &class_names).unwrap();

        let loader = ModelLoader::new().with_backbone(small_backbone());
        let from_weights = InferenceEngine::<NdArray>::load(&weights, &loader, device).unwrap();
        let from_bundle = InferenceEngine::<NdArray>::load(&bundle, &loader, device).unwrap();
        assert_eq!(from_weights.classes(), from_bundle.classes());

        let image = png_bytes(100, 70, 5);
        let a = from_weights.predict(image.as_slice(), 0.0).unwrap();
        let b = from_bundle.predict(image.as_slice(), 0.0).unwrap();

        assert_eq!(a.predicted_class, b.predicted_class);
        assert!((a.ood_probability - b.ood_probability).abs() < 1e-5);
        assert!((a.confidence - b.confidence).abs() < 1e-5);
        let (pa, pb) = (a.class_probabilities.unwrap(), b.class_probabilities.unwrap());
        for (label, p) in &pa {
            assert!((p - pb[label]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_loaded_model_matches_in_memory_model() {
        let device = NdArrayDevice::default();
        let config = small_config(4);
        let model = config.init::<NdArray>(&device);
        let in_memory = InferenceEngine::new(model.clone(), LabelVocabulary::default_classes(), device).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("weights.bin");
        save_weights(&weights, &model).unwrap();
        let loader = ModelLoader::new()
            .with_backbone(small_backbone())
            .with_format(ArtifactFormat::WeightsOnly);
        let restored = InferenceEngine::<NdArray>::load(&weights, &loader, device).unwrap();

        let image = png_bytes(40, 40, 77);
        let a = in_memory.predict(image.as_slice(), 0.0).unwrap();
        let b = restored.predict(image.as_slice(), 0.0).unwrap();
        assert!((a.ood_probability - b.ood_probability).abs() < 1e-5);
        assert_eq!(a.predicted_class, b.predicted_class);
    }

    #[test]
    fn test_torch_state_dict_predicts() {
        let device = NdArrayDevice::default();
        let loader = ModelLoader::new().with_backbone(small_backbone());
        let engine = InferenceEngine::<NdArray>::load(small_state_dict(), &loader, device).unwrap();
        assert_eq!(engine.classes(), LabelVocabulary::default_classes().labels());

        let verdict = engine.predict(png_bytes(64, 64, 12), 0.0).unwrap();
        assert_probability(verdict.ood_probability);
        assert!(verdict.is_car());
        let distribution = verdict.class_probabilities.unwrap();
        assert!((distribution.values().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_clones_can_predict_from_threads() {
        let engine = engine(2);
        let image = png_bytes(24, 24, 4);
        let expected = engine.predict(image.as_slice(), 0.5).unwrap();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let engine = engine.clone();
                    let image = image.clone();
                    scope.spawn(move || engine.predict(image, 0.5).unwrap())
                })
                .collect();

            for handle in handles {
                assert_eq!(handle.join().unwrap(), expected);
            }
        });
    }
}
