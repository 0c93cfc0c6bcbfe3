//! PyTorchで学習した state_dict の読み込み
//!
//! torchvision の `efficientnet_b0` をバックボーンに持つチェックポイントのキーを
//! このクレートのモジュールパスに読み替えてから `PytorchStore` で適用します。
//! Linear の重みは `[out, in]` から `[in, out]` に転置されます。

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use burn::tensor::backend::Backend;
use burn_store::{KeyRemapper, ModuleSnapshot, PytorchStore};
use tracing::{debug, info};

use crate::error::{ClassifierError, Result};
use crate::ml::{CarClassifierWithOod, EfficientNetConfig};

const CLASSIFIER_HEADS: [&str; 2] = ["car_classifier", "ood_classifier"];

/// 先頭一致の置換規則 (正規表現, 置換後)
fn prefix_rule(from: &str, to: &str) -> (String, String) {
    (format!("^{}", from.replace('.', r"\.")), to.to_string())
}

/// torchvision のキー名をモジュールパスに読み替える規則
///
/// ブロック番号はステージをまたいだ通し番号になります
/// （B0 の `features.6.3` は `blocks.14`）。
pub fn torch_key_rules(backbone: &EfficientNetConfig) -> Vec<(String, String)> {
    let mut rules = vec![
        prefix_rule("backbone.features.0.0.", "backbone.stem.conv."),
        prefix_rule("backbone.features.0.1.", "backbone.stem.norm."),
    ];

    let mut block = 0;
    for (stage_index, stage) in backbone.stages.iter().enumerate() {
        let mut parts = Vec::with_capacity(4);
        if stage.expand_ratio != 1 {
            parts.push("expand");
        }
        parts.extend(["depthwise", "se", "project"]);

        for layer in 0..stage.num_layers {
            let torch = format!("backbone.features.{}.{}.block", stage_index + 1, layer);
            let burn = format!("backbone.blocks.{}", block);

            for (index, part) in parts.iter().enumerate() {
                if *part == "se" {
                    rules.push(prefix_rule(
                        &format!("{}.{}.fc1.", torch, index),
                        &format!("{}.se.reduce.", burn),
                    ));
                    rules.push(prefix_rule(
                        &format!("{}.{}.fc2.", torch, index),
                        &format!("{}.se.expand.", burn),
                    ));
                } else {
                    rules.push(prefix_rule(
                        &format!("{}.{}.0.", torch, index),
                        &format!("{}.{}.conv.", burn, part),
                    ));
                    rules.push(prefix_rule(
                        &format!("{}.{}.1.", torch, index),
                        &format!("{}.{}.norm.", burn, part),
                    ));
                }
            }
            block += 1;
        }
    }

    let head = backbone.stages.len() + 1;
    rules.push(prefix_rule(&format!("backbone.features.{}.0.", head), "backbone.head.conv."));
    rules.push(prefix_rule(&format!("backbone.features.{}.1.", head), "backbone.head.norm."));

    for name in CLASSIFIER_HEADS {
        rules.push(prefix_rule(&format!("{}.1.", name), &format!("{}.linear.", name)));
    }

    rules
}

/// state_dict をモデルに適用
///
/// 足りないテンソルや形状の合わないテンソルがあればエラーになります。
/// `num_batches_tracked` のようにモデル側に対応先のないキーは無視します。
pub fn apply_state_dict<B: Backend>(
    model: &mut CarClassifierWithOod<B>,
    backbone: &EfficientNetConfig,
    path: &Path,
) -> Result<()> {
    let remapper = KeyRemapper::from_pattern_iter(torch_key_rules(backbone))
        .map_err(|e| ClassifierError::corrupt(path, format!("invalid key rule: {}", e)))?;
    let mut store = PytorchStore::from_file(path).remap(remapper);

    let result = panic::catch_unwind(AssertUnwindSafe(|| model.load_from(&mut store)))
        .map_err(|_| ClassifierError::corrupt(path, "state dict does not match the architecture"))?
        .map_err(|e| ClassifierError::corrupt(path, e.to_string()))?;

    if !result.unused.is_empty() {
        debug!(unused = ?result.unused, "Ignored state dict entries");
    }
    info!(
        path = %path.display(),
        applied = result.applied.len(),
        "State dict applied"
    );

    Ok(())
}
