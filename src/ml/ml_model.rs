//! 車種分類モデルの定義
//!
//! 共有バックボーンの特徴ベクトルから、車種分類ヘッドと
//! OOD（車かどうか）判定ヘッドの2つの出力を計算します。

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};

use crate::ml::backbone::{EfficientNet, EfficientNetConfig};

/// 画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// EfficientNet-B0 の特徴次元
pub const FEATURE_DIM: usize = 1280;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 車種クラス数
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.5)]
    pub dropout: f64,
    /// バックボーン構成
    #[config(default = "EfficientNetConfig::b0()")]
    pub backbone: EfficientNetConfig,
}

impl ModelConfig {
    /// モデルを初期化（重みは未学習）
    pub fn init<B: Backend>(&self, device: &B::Device) -> CarClassifierWithOod<B> {
        let feature_dim = self.backbone.feature_dim();

        tracing::debug!(
            num_classes = self.num_classes,
            feature_dim,
            dropout = self.dropout,
            "Building dual-head classifier"
        );

        CarClassifierWithOod {
            backbone: self.backbone.init(device),
            car_classifier: ClassifierHead::new(feature_dim, self.num_classes, self.dropout, device),
            ood_classifier: ClassifierHead::new(feature_dim, 1, self.dropout, device),
        }
    }
}

/// Dropout -> Linear
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    fn new(d_input: usize, d_output: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            dropout: DropoutConfig::new(dropout).init(),
            linear: LinearConfig::new(d_input, d_output).init(device),
        }
    }

    fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(self.dropout.forward(features))
    }

    /// (入力次元, 出力次元)
    pub fn dims(&self) -> [usize; 2] {
        self.linear.weight.val().dims()
    }
}

/// OOD判定付き車種分類モデル
///
/// # アーキテクチャ
/// - バックボーン: EfficientNet（分類層なし）-> 特徴ベクトル
/// - 車種分類ヘッド: Dropout -> Linear(feature_dim -> num_classes)
/// - OODヘッド: Dropout -> Linear(feature_dim -> 1)
///
/// バックボーンは1回だけ計算し、両ヘッドで同じ特徴を使います。
#[derive(Module, Debug)]
pub struct CarClassifierWithOod<B: Backend> {
    backbone: EfficientNet<B>,
    car_classifier: ClassifierHead<B>,
    ood_classifier: ClassifierHead<B>,
}

impl<B: Backend> CarClassifierWithOod<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, 224, 224]
    ///
    /// # 戻り値
    /// - (車種ロジット [batch_size, num_classes], OODロジット [batch_size, 1])
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let features = self.backbone.forward(images);

        let car_logits = self.car_classifier.forward(features.clone());
        let ood_logits = self.ood_classifier.forward(features);

        (car_logits, ood_logits)
    }

    /// 車種分類ヘッドの出力次元
    pub fn num_classes(&self) -> usize {
        self.car_classifier.dims()[1]
    }

    /// 車種分類ヘッド
    pub fn car_head(&self) -> &ClassifierHead<B> {
        &self.car_classifier
    }

    /// OODヘッド
    pub fn ood_head(&self) -> &ClassifierHead<B> {
        &self.ood_classifier
    }
}
