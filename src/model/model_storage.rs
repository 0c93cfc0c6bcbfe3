//! モデルアーティファクトの永続化
//!
//! 2つの形式を扱います:
//! - 重みのみ: burnの名前付きMessagePackレコード（アーキテクチャは外部で再構築）
//! - フルモデルバンドル: Tar.gz形式でメタデータと重みを1ファイルに統合
//!
//! バンドルのファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、アーキテクチャ設定など）
//! - model.bin       - モデルの重み（名前付きMessagePack）

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::ml::{CarClassifierWithOod, ModelConfig};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 重みのシリアライザ
pub type WeightsRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// モデルの重みをバイト列に変換
pub fn encode_weights<B: Backend>(model: &CarClassifierWithOod<B>) -> Result<Vec<u8>> {
    WeightsRecorder::default()
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("Failed to encode model weights: {:?}", e))
}

/// 重みのみのアーティファクトを保存
pub fn save_weights<B: Backend>(output_path: &Path, model: &CarClassifierWithOod<B>) -> Result<()> {
    let bytes = encode_weights(model)?;
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }
    std::fs::write(output_path, bytes)
        .context(format!("Failed to write weights file: {:?}", output_path))
}

/// フルモデルバンドルを保存
///
/// アーキテクチャ設定とクラス名をメタデータに埋め込むため、
/// 読み込み時に外部の設定は不要です。
pub fn save_full_bundle<B: Backend>(
    output_path: &Path,
    model: &CarClassifierWithOod<B>,
    config: &ModelConfig,
    class_names: &[String],
) -> Result<()> {
    let metadata = ModelMetadata::new(class_names.to_vec(), Some(config.clone()));
    let model_binary = encode_weights(model)?;
    save_model_with_metadata(output_path, &metadata, &model_binary)
}

/// メタデータと共にモデルをTar.gz形式で保存
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(output_path)
        .context(format!("Failed to create tar.gz file: {:?}", output_path))?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    // メタデータをJSONとして追加
    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())
        .context("Failed to add metadata.json to tar")?;

    // モデルバイナリを追加
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)
        .context("Failed to add model.bin to tar")?;

    // tarアーカイブを完成させ、gzipストリームを閉じる
    tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?
        .finish()
        .context("Failed to finalize tar.gz archive")?;

    Ok(())
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let (metadata, _) = read_bundle(tar_gz_path, false)?;
    metadata.ok_or_else(|| anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    let (_, binary) = read_bundle(tar_gz_path, true)?;
    binary.ok_or_else(|| anyhow::anyhow!("model.bin not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    match read_bundle(tar_gz_path, true)? {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

fn read_bundle(tar_gz_path: &Path, with_binary: bool) -> Result<(Option<ModelMetadata>, Option<Vec<u8>>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt = None;
    let mut model_binary_opt = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(
                    ModelMetadata::from_json_string(&json_str)
                        .context("Failed to deserialize metadata from JSON")?,
                );
                if !with_binary {
                    break;
                }
            }
            MODEL_ENTRY if with_binary => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata_opt, model_binary_opt))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラス名: {}", metadata.class_names.join(", "));
    println!("モデル入力サイズ: {}x{}", metadata.input_size, metadata.input_size);
    if let Some(ref architecture) = metadata.architecture {
        println!("特徴次元: {}", architecture.backbone.feature_dim());
        println!("ドロップアウト率: {}", architecture.dropout);
    }
    if let Some(num_epochs) = metadata.num_epochs {
        println!("学習エポック数: {}", num_epochs);
    }
    if let Some(ref trained_at) = metadata.trained_at {
        println!("学習日時: {}", trained_at);
    }
    println!("========================");
}
