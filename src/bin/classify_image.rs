//! 画像を分類して結果をJSONで表示する動作確認用バイナリ
//!
//! 使い方: classify_image [--config config.json] [--threshold 0.5] <image>...

use anyhow::{bail, Context, Result};
use car_classifier::model::{load_metadata, print_metadata_info, ArtifactFormat};
use car_classifier::{Classifier, ClassifierConfig, ImageClassifier, ImageSource};
use std::path::PathBuf;

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

struct Args {
    config_path: PathBuf,
    threshold: Option<f32>,
    images: Vec<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args {
        config_path: ClassifierConfig::default_path(),
        threshold: None,
        images: Vec::new(),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                parsed.config_path = args.next().context("--config requires a path")?.into();
            }
            "--threshold" => {
                let value = args.next().context("--threshold requires a value")?;
                parsed.threshold = Some(value.parse().context("invalid threshold")?);
            }
            _ => parsed.images.push(PathBuf::from(arg)),
        }
    }

    if parsed.images.is_empty() {
        bail!("usage: classify_image [--config config.json] [--threshold 0.5] <image>...");
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    init_tracing();
    let args = parse_args()?;

    let config = ClassifierConfig::load_or_default_from(&args.config_path);
    config.display();

    let model_path = config.model.model_path();
    if ArtifactFormat::detect(&model_path).ok() == Some(ArtifactFormat::FullModel) {
        match load_metadata(&model_path) {
            Ok(metadata) => print_metadata_info(&metadata),
            Err(e) => eprintln!("✗ メタデータ読み込みエラー: {:#}", e),
        }
    }

    let classifier = Classifier::load(&config).context("分類器の初期化エラー")?;
    println!("デバイス: {}", classifier.device_name());
    println!("クラス: {}\n", classifier.classes().join(", "));

    let threshold = args.threshold.unwrap_or_else(|| classifier.default_threshold());
    let mut failures = 0;

    for image in &args.images {
        match classifier.predict(ImageSource::from(image.as_path()), threshold) {
            Ok(verdict) => {
                println!("✓ {}", image.display());
                println!("{}", serde_json::to_string_pretty(&verdict)?);
            }
            Err(e) if e.is_client_error() => {
                failures += 1;
                eprintln!("✗ {}: {:#}", image.display(), anyhow::Error::from(e));
            }
            Err(e) => return Err(e).context("推論エラー"),
        }
    }

    if failures > 0 {
        bail!("{} of {} images could not be classified", failures, args.images.len());
    }
    Ok(())
}
