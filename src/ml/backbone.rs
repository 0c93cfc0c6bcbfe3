//! EfficientNet特徴抽出バックボーン
//!
//! 元の分類層を取り除き、グローバル平均プーリング後の特徴ベクトル
//! (既定では1280次元) を出力します。推論専用のため BatchNorm は
//! 学習済みの統計量のみを使う固定版です。

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};

/// MBConvステージ設定
#[derive(Config, Debug)]
pub struct MbConvStageConfig {
    /// 拡張率（1の場合は拡張convを省略）
    pub expand_ratio: usize,
    /// depthwise convのカーネルサイズ
    pub kernel_size: usize,
    /// ステージ先頭ブロックのストライド
    pub stride: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    /// ブロック数
    pub num_layers: usize,
}

/// バックボーン設定
#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    /// stem convの出力チャネル数
    pub stem_channels: usize,
    /// MBConvステージ
    pub stages: Vec<MbConvStageConfig>,
    /// 最終1x1 convの出力チャネル数（= 特徴次元）
    #[config(default = 1280)]
    pub head_channels: usize,
    #[config(default = 1e-5)]
    pub bn_epsilon: f64,
}

impl EfficientNetConfig {
    /// EfficientNet-B0 の構成
    pub fn b0() -> Self {
        let stage = MbConvStageConfig::new;
        Self::new(
            32,
            vec![
                stage(1, 3, 1, 32, 16, 1),
                stage(6, 3, 2, 16, 24, 2),
                stage(6, 5, 2, 24, 40, 2),
                stage(6, 3, 2, 40, 80, 3),
                stage(6, 5, 1, 80, 112, 3),
                stage(6, 5, 2, 112, 192, 4),
                stage(6, 3, 1, 192, 320, 1),
            ],
        )
    }

    /// 出力特徴ベクトルの次元
    pub fn feature_dim(&self) -> usize {
        self.head_channels
    }

    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        let eps = self.bn_epsilon;
        let stem = conv_norm(3, self.stem_channels, 3, 2, 1, true, eps, device);

        let mut blocks = Vec::new();
        for stage in &self.stages {
            for layer in 0..stage.num_layers {
                let (in_channels, stride) = if layer == 0 {
                    (stage.in_channels, stage.stride)
                } else {
                    (stage.out_channels, 1)
                };
                blocks.push(MbConv::new(
                    in_channels,
                    stage.out_channels,
                    stage.expand_ratio,
                    stage.kernel_size,
                    stride,
                    eps,
                    device,
                ));
            }
        }

        let last_channels = self
            .stages
            .last()
            .map(|s| s.out_channels)
            .unwrap_or(self.stem_channels);
        let head = conv_norm(last_channels, self.head_channels, 1, 1, 1, true, eps, device);

        tracing::debug!(
            blocks = blocks.len(),
            feature_dim = self.head_channels,
            "EfficientNet backbone initialized"
        );

        EfficientNet { stem, blocks, head }
    }
}

/// EfficientNetバックボーン
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    stem: ConvNormActivation<B>,
    blocks: Vec<MbConv<B>>,
    head: ConvNormActivation<B>,
}

impl<B: Backend> EfficientNet<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, H, W]
    ///
    /// # 戻り値
    /// - 特徴ベクトル [batch_size, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        let x = self.head.forward(x);

        // グローバル平均プーリング
        let [batch_size, channels, _, _] = x.dims();
        x.mean_dim(3).mean_dim(2).reshape([batch_size, channels])
    }
}

/// 学習済み統計量で正規化する BatchNorm
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    weight: Param<Tensor<B, 1>>,
    bias: Param<Tensor<B, 1>>,
    running_mean: Param<Tensor<B, 1>>,
    running_var: Param<Tensor<B, 1>>,
    epsilon: f64,
}

impl<B: Backend> FrozenBatchNorm<B> {
    fn new(num_features: usize, epsilon: f64, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([num_features], device)),
            bias: Param::from_tensor(Tensor::zeros([num_features], device)),
            running_mean: Param::from_tensor(Tensor::zeros([num_features], device)),
            running_var: Param::from_tensor(Tensor::ones([num_features], device)),
            epsilon,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.weight.val().dims();
        let scale = self
            .weight
            .val()
            .div(self.running_var.val().add_scalar(self.epsilon).sqrt());
        let shift = self
            .bias
            .val()
            .sub(self.running_mean.val().mul(scale.clone()));

        x.mul(scale.reshape([1, channels, 1, 1]))
            .add(shift.reshape([1, channels, 1, 1]))
    }
}

/// Conv + BatchNorm (+ SiLU)
#[derive(Module, Debug)]
pub struct ConvNormActivation<B: Backend> {
    conv: Conv2d<B>,
    norm: FrozenBatchNorm<B>,
    activate: bool,
}

impl<B: Backend> ConvNormActivation<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.norm.forward(self.conv.forward(x));
        if self.activate {
            silu(x)
        } else {
            x
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn conv_norm<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    groups: usize,
    activate: bool,
    epsilon: f64,
    device: &B::Device,
) -> ConvNormActivation<B> {
    let padding = (kernel_size - 1) / 2;
    ConvNormActivation {
        conv: Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device),
        norm: FrozenBatchNorm::new(out_channels, epsilon, device),
        activate,
    }
}

/// Squeeze-and-Excitation
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    fn new(channels: usize, squeeze_channels: usize, device: &B::Device) -> Self {
        Self {
            reduce: Conv2dConfig::new([channels, squeeze_channels], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeeze_channels, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = x.clone().mean_dim(3).mean_dim(2);
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x.mul(scale)
    }
}

/// 反転ボトルネックブロック
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand: Option<ConvNormActivation<B>>,
    depthwise: ConvNormActivation<B>,
    se: SqueezeExcitation<B>,
    project: ConvNormActivation<B>,
    use_residual: bool,
}

impl<B: Backend> MbConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel_size: usize,
        stride: usize,
        epsilon: f64,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1)
            .then(|| conv_norm(in_channels, hidden, 1, 1, 1, true, epsilon, device));

        Self {
            expand,
            depthwise: conv_norm(hidden, hidden, kernel_size, stride, hidden, true, epsilon, device),
            se: SqueezeExcitation::new(hidden, (in_channels / 4).max(1), device),
            project: conv_norm(hidden, out_channels, 1, 1, 1, false, epsilon, device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        // 推論時は stochastic depth を行わない
        if self.use_residual {
            x.add(input)
        } else {
            x
        }
    }
}
