//! 分類器のエラー定義
//!
//! 構築時のエラー（アーティファクト・メタデータ・デバイス）と
//! リクエスト単位のエラー（画像デコード・推論・入力不正）を区別します。

use std::path::PathBuf;
use thiserror::Error;

/// 分類器で発生するエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// モデルアーティファクトが存在しない
    #[error("model artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    /// アーティファクトの読み込み・復元に失敗、または構造が一致しない
    #[error("model artifact is corrupt ({}): {reason}", path.display())]
    ArtifactCorrupt { path: PathBuf, reason: String },

    /// 要求された計算デバイスを確保できない
    #[error("compute device unavailable: {device}")]
    DeviceUnavailable { device: String },

    /// メタデータファイルの読み込みエラー
    #[error("failed to read model metadata ({})", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// クラス名一覧が不正
    #[error("invalid label vocabulary: {0}")]
    InvalidVocabulary(String),

    /// 画像をデコードできない
    #[error("failed to decode image")]
    ImageDecode(#[source] image::ImageError),

    /// 順伝播または出力の取り出しに失敗
    #[error("inference failed: {0}")]
    Inference(String),

    /// 呼び出し側の入力が不正（閾値、エンコード済み画像など）
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ClassifierError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ArtifactCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn metadata(
        path: impl Into<PathBuf>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Metadata {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// エンジン構築時のエラーか（発生した場合エンジンはプロセス終了まで利用不可）
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::ArtifactNotFound { .. }
                | Self::ArtifactCorrupt { .. }
                | Self::DeviceUnavailable { .. }
                | Self::Metadata { .. }
                | Self::InvalidVocabulary(_)
        )
    }

    /// 呼び出し側の入力に起因するエラーか
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ImageDecode(_) | Self::InvalidInput(_))
    }
}

/// 分類器の結果型
pub type Result<T> = std::result::Result<T, ClassifierError>;
