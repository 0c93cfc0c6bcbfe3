//! モデルメタデータの定義と永続化
//!
//! 学習処理が出力するメタデータJSONを表します。推論に必須なのは
//! `class_names` のみで、その他の項目は情報として保持します。
//! フルモデルバンドルではアーキテクチャ設定もここに格納されます。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::ml::ModelConfig;

/// モデルメタデータ
///
/// 例:
/// ```json
/// { "class_names": ["Maruti_Suzuki_Baleno", "Maruti_Suzuki_Swift"] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（インデックス順）
    pub class_names: Vec<String>,

    /// アーキテクチャ設定（フルモデルバンドルのみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<ModelConfig>,

    /// モデル入力サイズ（正方形）
    #[serde(default = "default_input_size")]
    pub input_size: u32,

    /// 学習エポック数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_epochs: Option<u32>,

    /// モデルの学習時刻（ISO8601形式）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trained_at: Option<String>,
}

fn default_input_size() -> u32 {
    crate::ml::IMAGE_SIZE as u32
}

impl ModelMetadata {
    /// 新しいメタデータを作成（作成時刻を記録）
    pub fn new(class_names: Vec<String>, architecture: Option<ModelConfig>) -> Self {
        Self {
            class_names,
            architecture,
            input_size: default_input_size(),
            num_epochs: None,
            trained_at: Some(chrono::Local::now().to_rfc3339()),
        }
    }

    /// メタデータファイルを読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClassifierError::metadata(path, e))?;
        serde_json::from_str(&content).map_err(|e| ClassifierError::metadata(path, e))
    }

    /// メタデータファイルを保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
