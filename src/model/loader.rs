//! モデルアーティファクトの読み込み
//!
//! アーティファクトの形式はファイル先頭のヘッダで判定します
//! （zip = PyTorch の state_dict、gzip = フルモデルバンドル、それ以外 = 重みのみ）。
//! ヘッダで決まらない場合は拡張子 `.pt` / `.pth` を PyTorch として扱います。
//! `legacy-filename-dispatch` を有効にすると、ファイル名に `_full` を含む
//! アーティファクトをフルモデルとして扱う旧方式が優先されます。

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use burn::{
    module::{Module, ModuleVisitor, Param},
    record::Recorder,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::{CarClassifierWithOod, EfficientNetConfig, ModelConfig};
use crate::model::config::ModelSettings;
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::{self, WeightsRecorder};
use crate::model::torch_import;
use crate::model::vocabulary::LabelVocabulary;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const TORCH_EXTENSIONS: [&str; 2] = ["pt", "pth"];

/// 旧方式でフルモデルを示すファイル名の目印
#[cfg(feature = "legacy-filename-dispatch")]
const FULL_MODEL_MARKER: &str = "_full";

/// アーティファクト形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    /// メタデータ・アーキテクチャ設定・重みを含むバンドル
    FullModel,
    /// 重みのみ（アーキテクチャは外部で再構築）
    WeightsOnly,
    /// PyTorchで保存した state_dict（アーキテクチャは外部で再構築）
    TorchStateDict,
}

impl ArtifactFormat {
    /// ファイルから形式を判定
    pub fn detect(path: &Path) -> Result<Self> {
        #[cfg(feature = "legacy-filename-dispatch")]
        {
            if let Some(format) = Self::from_file_name(path) {
                return Ok(format);
            }
        }

        let mut header = Vec::with_capacity(ZIP_MAGIC.len());
        File::open(path)
            .and_then(|file| file.take(ZIP_MAGIC.len() as u64).read_to_end(&mut header))
            .map_err(|e| ClassifierError::corrupt(path, e.to_string()))?;

        if header.starts_with(&ZIP_MAGIC) {
            Ok(ArtifactFormat::TorchStateDict)
        } else if header.starts_with(&GZIP_MAGIC) {
            Ok(ArtifactFormat::FullModel)
        } else if has_torch_extension(path) {
            // zip化される前の旧形式のtorch.save
            Ok(ArtifactFormat::TorchStateDict)
        } else {
            Ok(ArtifactFormat::WeightsOnly)
        }
    }

    /// ファイル名の目印による判定（大文字小文字を区別しない）
    #[cfg(feature = "legacy-filename-dispatch")]
    pub fn from_file_name(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        name.contains(FULL_MODEL_MARKER)
            .then_some(ArtifactFormat::FullModel)
    }
}

fn has_torch_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| TORCH_EXTENSIONS.contains(&ext.as_str()))
}

/// 読み込み済みモデル
#[derive(Debug)]
pub struct LoadedModel<B: Backend> {
    pub model: CarClassifierWithOod<B>,
    pub config: ModelConfig,
    pub vocabulary: LabelVocabulary,
    pub format: ArtifactFormat,
}

/// モデルアーティファクトのローダー
#[derive(Debug, Clone)]
pub struct ModelLoader {
    metadata_path: Option<PathBuf>,
    format_override: Option<ArtifactFormat>,
    dropout: f64,
    backbone: EfficientNetConfig,
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self {
            metadata_path: None,
            format_override: None,
            dropout: 0.5,
            backbone: EfficientNetConfig::b0(),
        }
    }
}

impl ModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// モデル設定からローダーを作成
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            metadata_path: settings.metadata_path(),
            format_override: settings.artifact_format,
            dropout: settings.dropout,
            ..Self::default()
        }
    }

    /// クラス名を読み込むメタデータファイル
    pub fn with_metadata<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.metadata_path = Some(path.into());
        self
    }

    /// 形式を明示的に指定
    pub fn with_format(mut self, format: ArtifactFormat) -> Self {
        self.format_override = Some(format);
        self
    }

    /// 重みのみの形式で再構築するバックボーン
    pub fn with_backbone(mut self, backbone: EfficientNetConfig) -> Self {
        self.backbone = backbone;
        self
    }

    /// アーティファクトを読み込んでデバイスに配置
    pub fn load<B: Backend, P: AsRef<Path>>(&self, path: P, device: &B::Device) -> Result<LoadedModel<B>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ClassifierError::ArtifactNotFound {
                path: path.to_path_buf(),
            });
        }

        let format = match self.format_override {
            Some(format) => format,
            None => ArtifactFormat::detect(path)?,
        };

        let sidecar = match &self.metadata_path {
            Some(metadata_path) if metadata_path.exists() => {
                Some(LabelVocabulary::from_metadata(&ModelMetadata::load(metadata_path)?)?)
            }
            Some(metadata_path) => {
                warn!(path = %metadata_path.display(), "Metadata file not found, ignoring");
                None
            }
            None => None,
        };

        let loaded = match format {
            ArtifactFormat::FullModel => {
                info!(path = %path.display(), "Loading full model bundle");
                self.load_full_model(path, sidecar, device)?
            }
            ArtifactFormat::WeightsOnly => {
                info!(path = %path.display(), "Loading weights into rebuilt architecture");
                self.load_weights_only(path, sidecar, device)?
            }
            ArtifactFormat::TorchStateDict => {
                info!(path = %path.display(), "Loading PyTorch state dict into rebuilt architecture");
                self.load_torch_state_dict(path, sidecar, device)?
            }
        };

        info!(
            path = %path.display(),
            format = ?loaded.format,
            num_classes = loaded.vocabulary.len(),
            params = loaded.model.num_params(),
            "Model loaded successfully"
        );

        Ok(loaded)
    }

    fn load_full_model<B: Backend>(
        &self,
        path: &Path,
        sidecar: Option<LabelVocabulary>,
        device: &B::Device,
    ) -> Result<LoadedModel<B>> {
        let (metadata, model_binary) = model_storage::load_model_with_metadata(path)
            .map_err(|e| ClassifierError::corrupt(path, format!("{:#}", e)))?;

        let vocabulary = match sidecar {
            Some(vocabulary) => vocabulary,
            None => LabelVocabulary::from_metadata(&metadata)?,
        };
        let config = metadata
            .architecture
            .unwrap_or_else(|| ModelConfig::new(metadata.class_names.len()));

        let model = restore(config.init::<B>(device), model_binary, path, device)?;
        validate(&model, &config, &vocabulary, path)?;

        Ok(LoadedModel {
            model,
            config,
            vocabulary,
            format: ArtifactFormat::FullModel,
        })
    }

    /// 外部で決まった語彙の幅でアーキテクチャ設定を組み立てる
    fn rebuilt_config(&self, vocabulary: &LabelVocabulary) -> ModelConfig {
        ModelConfig::new(vocabulary.len())
            .with_dropout(self.dropout)
            .with_backbone(self.backbone.clone())
    }

    fn load_weights_only<B: Backend>(
        &self,
        path: &Path,
        sidecar: Option<LabelVocabulary>,
        device: &B::Device,
    ) -> Result<LoadedModel<B>> {
        let vocabulary = sidecar.unwrap_or_else(LabelVocabulary::default_classes);
        let config = self.rebuilt_config(&vocabulary);

        let bytes = std::fs::read(path).map_err(|e| ClassifierError::corrupt(path, e.to_string()))?;
        let model = restore(config.init::<B>(device), bytes, path, device)?;
        validate(&model, &config, &vocabulary, path)?;

        Ok(LoadedModel {
            model,
            config,
            vocabulary,
            format: ArtifactFormat::WeightsOnly,
        })
    }

    fn load_torch_state_dict<B: Backend>(
        &self,
        path: &Path,
        sidecar: Option<LabelVocabulary>,
        device: &B::Device,
    ) -> Result<LoadedModel<B>> {
        let vocabulary = sidecar.unwrap_or_else(LabelVocabulary::default_classes);
        let config = self.rebuilt_config(&vocabulary);

        let mut model = config.init::<B>(device);
        let expected = param_shapes::<B, _>(&model);
        torch_import::apply_state_dict(&mut model, &config.backbone, path)?;
        check_shapes(&expected, &model, path)?;
        validate(&model, &config, &vocabulary, path)?;

        Ok(LoadedModel {
            model,
            config,
            vocabulary,
            format: ArtifactFormat::TorchStateDict,
        })
    }
}

/// 新しく構築したモデルに名前で対応付けて重みを読み込む
fn restore<B: Backend>(
    model: CarClassifierWithOod<B>,
    bytes: Vec<u8>,
    path: &Path,
    device: &B::Device,
) -> Result<CarClassifierWithOod<B>> {
    let expected = param_shapes::<B, _>(&model);

    let record: <CarClassifierWithOod<B> as Module<B>>::Record = WeightsRecorder::default()
        .load(bytes, device)
        .map_err(|e| ClassifierError::corrupt(path, format!("failed to decode weights: {:?}", e)))?;

    let model = panic::catch_unwind(AssertUnwindSafe(|| model.load_record(record)))
        .map_err(|_| ClassifierError::corrupt(path, "weights do not match the architecture"))?;

    // load_record は形状を確認しないため、構築直後の形状と突き合わせる
    check_shapes(&expected, &model, path)?;
    Ok(model)
}

/// モジュールパスごとのパラメータ形状
pub(crate) type ParamShapeMap = BTreeMap<String, Vec<usize>>;

/// モジュールを走査してパラメータ形状を集める
#[derive(Debug, Default)]
struct ParamShapes {
    path: Vec<String>,
    shapes: ParamShapeMap,
}

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.shapes.insert(self.path.join("."), param.val().dims().to_vec());
    }
}

pub(crate) fn param_shapes<B: Backend, M: Module<B>>(module: &M) -> ParamShapeMap {
    let mut visitor = ParamShapes::default();
    module.visit(&mut visitor);
    visitor.shapes
}

/// 全パラメータの形状が構築時と一致するか確認
fn check_shapes<B: Backend>(
    expected: &ParamShapeMap,
    model: &CarClassifierWithOod<B>,
    path: &Path,
) -> Result<()> {
    let actual = param_shapes::<B, _>(model);

    for (name, shape) in expected {
        match actual.get(name) {
            Some(found) if found == shape => {}
            Some(found) => {
                return Err(ClassifierError::corrupt(
                    path,
                    format!("parameter `{}` has shape {:?}, expected {:?}", name, found, shape),
                ))
            }
            None => {
                return Err(ClassifierError::corrupt(
                    path,
                    format!("parameter `{}` is missing", name),
                ))
            }
        }
    }

    if actual.len() != expected.len() {
        return Err(ClassifierError::corrupt(
            path,
            format!("{} parameters, expected {}", actual.len(), expected.len()),
        ));
    }

    Ok(())
}

/// ヘッドの形状と語彙の整合性を検証
fn validate<B: Backend>(
    model: &CarClassifierWithOod<B>,
    config: &ModelConfig,
    vocabulary: &LabelVocabulary,
    path: &Path,
) -> Result<()> {
    let feature_dim = config.backbone.feature_dim();
    let [car_in, car_out] = model.car_head().dims();
    let [ood_in, ood_out] = model.ood_head().dims();

    if car_in != feature_dim || ood_in != feature_dim {
        return Err(ClassifierError::corrupt(
            path,
            format!("head input width {}/{}, expected {}", car_in, ood_in, feature_dim),
        ));
    }
    if ood_out != 1 {
        return Err(ClassifierError::corrupt(
            path,
            format!("OOD head width {}, expected 1", ood_out),
        ));
    }
    if car_out != vocabulary.len() {
        return Err(ClassifierError::corrupt(
            path,
            format!("car head width {}, expected {} classes", car_out, vocabulary.len()),
        ));
    }

    Ok(())
}
