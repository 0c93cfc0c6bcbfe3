//! 分類器設定管理モジュール
//!
//! 計算デバイスやモデルファイルの場所、OOD閾値をJSON形式で保存・読み込みします。
//! 設定は起動時に一度だけ解決され、その後は変更されません。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::loader::ArtifactFormat;
use crate::types::DEFAULT_OOD_THRESHOLD;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// GPUが使えればWGPU、使えなければCPU
    #[default]
    Auto,
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Auto => write!(f, "Auto"),
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// モデルアーティファクトのパス
    pub model_path: String,
    /// メタデータ（class_names）のパス
    #[serde(default)]
    pub metadata_path: Option<String>,
    /// アーティファクト形式の明示指定（未指定ならファイルから判定）
    #[serde(default)]
    pub artifact_format: Option<ArtifactFormat>,
    /// ドロップアウト率（重みのみの形式でアーキテクチャを再構築する際に使用）
    #[serde(default = "default_dropout")]
    pub dropout: f64,
}

fn default_dropout() -> f64 {
    0.5
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "saved_models/car_classifier.mpk".to_string(),
            metadata_path: Some("saved_models/car_classifier_metadata.json".to_string()),
            artifact_format: None,
            dropout: default_dropout(),
        }
    }
}

impl ModelSettings {
    pub fn model_path(&self) -> PathBuf {
        PathBuf::from(&self.model_path)
    }

    pub fn metadata_path(&self) -> Option<PathBuf> {
        self.metadata_path.as_ref().map(PathBuf::from)
    }
}

/// 分類器設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// OOD判定の既定閾値
    #[serde(default = "default_ood_threshold")]
    pub ood_threshold: f32,
}

fn default_ood_threshold() -> f32 {
    DEFAULT_OOD_THRESHOLD
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            model: ModelSettings::default(),
            ood_threshold: default_ood_threshold(),
        }
    }
}

impl ClassifierConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ClassifierConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded classifier config");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load classifier config, using defaults"
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        }
    }

    /// デフォルトパスから設定を読み込む
    pub fn load_or_default() -> Self {
        Self::load_or_default_from(Self::default_path())
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// モデルパスを設定
    pub fn set_model_path(&mut self, path: String) {
        self.model.model_path = path;
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== 分類器設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("モデルパス: {}", self.model.model_path);
        if let Some(ref metadata) = self.model.metadata_path {
            println!("メタデータ: {}", metadata);
        }
        if let Some(format) = self.model.artifact_format {
            println!("アーティファクト形式: {:?}", format);
        }
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("OOD閾値: {}", self.ood_threshold);
        println!("==================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClassifierConfig::default();
        assert_eq!(config.device_type, DeviceType::Auto);
        assert_eq!(config.ood_threshold, 0.5);
        assert!(config.model.artifact_format.is_none());
    }

    #[test]
    fn test_serialize_deserialize() {
        let mut config = ClassifierConfig::default();
        config.set_device_type(DeviceType::Cpu);
        config.model.artifact_format = Some(ArtifactFormat::FullModel);

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: ClassifierConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.device_type, DeviceType::Cpu);
        assert_eq!(deserialized.model.artifact_format, Some(ArtifactFormat::FullModel));
        assert_eq!(deserialized.model.model_path, config.model.model_path);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClassifierConfig =
            serde_json::from_str(r#"{"model": {"model_path": "models/weights.mpk"}}"#).unwrap();

        assert_eq!(config.device_type, DeviceType::Auto);
        assert_eq!(config.model.model_path(), PathBuf::from("models/weights.mpk"));
        assert!(config.model.metadata_path().is_none());
        assert_eq!(config.model.dropout, 0.5);
        assert_eq!(config.ood_threshold, 0.5);

        let forced: ClassifierConfig = serde_json::from_str(
            r#"{"model": {"model_path": "models/car_classifier.pth", "artifact_format": "torch_state_dict"}}"#,
        )
        .unwrap();
        assert_eq!(forced.model.artifact_format, Some(ArtifactFormat::TorchStateDict));
    }

    #[test]
    fn test_load_or_default_from_missing_file() {
        let config = ClassifierConfig::load_or_default_from("no/such/config.json");
        assert_eq!(config.model.model_path, ModelSettings::default().model_path);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = ClassifierConfig::default();
        config.set_model_path("models/car_classifier_full.tar.gz".to_string());
        config.ood_threshold = 0.7;
        config.save(&path).unwrap();

        let loaded = ClassifierConfig::load(&path).unwrap();
        assert_eq!(loaded.model.model_path, "models/car_classifier_full.tar.gz");
        assert_eq!(loaded.ood_threshold, 0.7);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
