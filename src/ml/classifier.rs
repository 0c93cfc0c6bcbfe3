//! 計算デバイスを選択して推論エンジンを構築する
//!
//! `DeviceType::Auto` はGPU (WGPU) を試し、使えなければCPUにフォールバックします。
//! 明示的にWGPUを指定して使えない場合は `DeviceUnavailable` になります。

use burn_ndarray::{NdArray, NdArrayDevice};
#[cfg(feature = "wgpu")]
use burn_wgpu::{Wgpu, WgpuDevice};
use tracing::{info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::inference::InferenceEngine;
use crate::ml::preprocess::ImageSource;
use crate::model::config::{ClassifierConfig, DeviceType};
use crate::types::Verdict;

/// 画像分類器の共通インターフェース
pub trait ImageClassifier {
    /// クラス名一覧（モデル出力の順序）
    fn classes(&self) -> &[String];

    /// 閾値を省略した場合に使う値
    fn default_threshold(&self) -> f32;

    fn predict(&self, image: ImageSource<'_>, threshold: f32) -> Result<Verdict>;

    fn predict_with_default_threshold(&self, image: ImageSource<'_>) -> Result<Verdict> {
        self.predict(image, self.default_threshold())
    }
}

impl<B: burn::tensor::backend::Backend> ImageClassifier for InferenceEngine<B> {
    fn classes(&self) -> &[String] {
        InferenceEngine::classes(self)
    }

    fn default_threshold(&self) -> f32 {
        InferenceEngine::default_threshold(self)
    }

    fn predict(&self, image: ImageSource<'_>, threshold: f32) -> Result<Verdict> {
        InferenceEngine::predict(self, image, threshold)
    }
}

/// 実行時に選択したバックエンドの推論エンジン
#[derive(Debug, Clone)]
pub enum Classifier {
    #[cfg(feature = "wgpu")]
    Gpu(InferenceEngine<Wgpu>),
    Cpu(InferenceEngine<NdArray>),
}

impl Classifier {
    /// 設定に従ってデバイスを選択し、モデルを読み込む
    pub fn load(config: &ClassifierConfig) -> Result<Self> {
        let classifier = match resolve_device(config.device_type, wgpu_device)? {
            #[cfg(feature = "wgpu")]
            ResolvedDevice::Gpu(device) => Classifier::Gpu(
                InferenceEngine::from_settings(&config.model, device)?
                    .with_default_threshold(config.ood_threshold)?,
            ),
            ResolvedDevice::Cpu(device) => Classifier::Cpu(
                InferenceEngine::from_settings(&config.model, device)?
                    .with_default_threshold(config.ood_threshold)?,
            ),
        };

        info!(
            device = classifier.device_name(),
            classes = classifier.classes().len(),
            "Classifier ready"
        );
        Ok(classifier)
    }

    /// 使用中のデバイス名
    pub fn device_name(&self) -> &'static str {
        match self {
            #[cfg(feature = "wgpu")]
            Classifier::Gpu(_) => "wgpu",
            Classifier::Cpu(_) => "cpu",
        }
    }
}

impl ImageClassifier for Classifier {
    fn classes(&self) -> &[String] {
        match self {
            #[cfg(feature = "wgpu")]
            Classifier::Gpu(engine) => engine.classes(),
            Classifier::Cpu(engine) => engine.classes(),
        }
    }

    fn default_threshold(&self) -> f32 {
        match self {
            #[cfg(feature = "wgpu")]
            Classifier::Gpu(engine) => engine.default_threshold(),
            Classifier::Cpu(engine) => engine.default_threshold(),
        }
    }

    fn predict(&self, image: ImageSource<'_>, threshold: f32) -> Result<Verdict> {
        match self {
            #[cfg(feature = "wgpu")]
            Classifier::Gpu(engine) => engine.predict(image, threshold),
            Classifier::Cpu(engine) => engine.predict(image, threshold),
        }
    }
}

enum ResolvedDevice {
    #[cfg(feature = "wgpu")]
    Gpu(WgpuDevice),
    Cpu(NdArrayDevice),
}

/// `find_gpu` はGPUが使える場合にそのデバイスを返す
fn resolve_device<F>(device_type: DeviceType, find_gpu: F) -> Result<ResolvedDevice>
where
    F: FnOnce() -> Option<ResolvedDevice>,
{
    match device_type {
        DeviceType::Cpu => Ok(ResolvedDevice::Cpu(NdArrayDevice::default())),
        DeviceType::Wgpu => find_gpu().ok_or_else(|| ClassifierError::DeviceUnavailable {
            device: device_type.to_string(),
        }),
        DeviceType::Auto => Ok(find_gpu().unwrap_or_else(|| {
            warn!("GPU is not available, falling back to CPU");
            ResolvedDevice::Cpu(NdArrayDevice::default())
        })),
    }
}

/// 小さなテンソルを計算してGPUが使えるか確認
#[cfg(feature = "wgpu")]
fn wgpu_device() -> Option<ResolvedDevice> {
    use burn::tensor::Tensor;
    use std::panic::{self, AssertUnwindSafe};

    let device = WgpuDevice::default();
    let computed = panic::catch_unwind(AssertUnwindSafe(|| {
        Tensor::<Wgpu, 1>::ones([4], &device)
            .sum()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
    }));

    match computed {
        Ok(Ok(values)) if values == [4.0] => Some(ResolvedDevice::Gpu(device)),
        _ => None,
    }
}

#[cfg(not(feature = "wgpu"))]
fn wgpu_device() -> Option<ResolvedDevice> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::tests::small_config;
    use crate::ml::preprocess::tests::png_bytes;
    use crate::model::model_storage::save_full_bundle;
    use crate::model::vocabulary::DEFAULT_CLASS_NAMES;

    fn cpu_config(model_path: &std::path::Path) -> ClassifierConfig {
        let mut config = ClassifierConfig::default();
        config.set_device_type(DeviceType::Cpu);
        config.set_model_path(model_path.to_string_lossy().into_owned());
        config.model.metadata_path = None;
        config
    }

    #[test]
    fn test_load_on_cpu() {
        let device = NdArrayDevice::default();
        let model_config = small_config(4);
        let model = model_config.init::<NdArray>(&device);
        let class_names: Vec<String> = DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect();

        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("car_classifier_full.tar.gz");
        save_full_bundle(&bundle, &model, &model_config, &class_names).unwrap();

        let mut config = cpu_config(&bundle);
        config.ood_threshold = 0.0;
        let classifier = Classifier::load(&config).unwrap();

        assert_eq!(classifier.device_name(), "cpu");
        assert_eq!(classifier.classes(), class_names.as_slice());
        assert_eq!(classifier.default_threshold(), 0.0);

        let verdict = classifier
            .predict_with_default_threshold(ImageSource::from(png_bytes(48, 32, 6)))
            .unwrap();
        assert!(verdict.is_car());
        assert!(class_names.contains(&verdict.predicted_class));
    }

    #[test]
    fn test_missing_model_is_construction_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = cpu_config(&dir.path().join("missing.mpk"));

        let err = Classifier::load(&config).unwrap_err();
        assert!(matches!(err, ClassifierError::ArtifactNotFound { .. }));
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_unavailable_gpu() {
        let no_gpu = || None;

        let err = resolve_device(DeviceType::Wgpu, no_gpu).err().unwrap();
        assert!(matches!(err, ClassifierError::DeviceUnavailable { .. }));
        assert!(err.is_construction_error());

        assert!(matches!(resolve_device(DeviceType::Auto, no_gpu), Ok(ResolvedDevice::Cpu(_))));
    }

    #[test]
    fn test_cpu_never_touches_gpu() {
        let resolved = resolve_device(DeviceType::Cpu, || panic!("GPU requested for a CPU config"));
        assert!(matches!(resolved, Ok(ResolvedDevice::Cpu(_))));
    }

    #[test]
    fn test_auto_uses_available_gpu() {
        // CPUデバイスを返すクロージャで選択ロジックだけを確認
        let found = || Some(ResolvedDevice::Cpu(NdArrayDevice::default()));
        assert!(resolve_device(DeviceType::Auto, found).is_ok());
        assert!(resolve_device(DeviceType::Wgpu, found).is_ok());
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn test_explicit_wgpu_without_feature() {
        assert!(matches!(
            resolve_device(DeviceType::Wgpu, wgpu_device),
            Err(ClassifierError::DeviceUnavailable { .. })
        ));
    }
}
