//! EfficientNet-B0 系バックボーン
//!
//! MBConv (拡張 1x1 → depthwise → squeeze-excitation → 射影 1x1) を7段重ねる。
//! 活性化は SiLU。

use burn::{
    module::Module,
    nn::conv::{Conv2d, Conv2dConfig},
    tensor::{
        activation::{sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};

use super::blocks::{global_max_pool, scaled, ConvNorm};

/// (拡張率, カーネル, stride, 出力チャネル, 繰り返し)
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 3, 1, 16, 1),
    (6, 3, 2, 24, 2),
    (6, 5, 2, 40, 2),
    (6, 3, 2, 80, 3),
    (6, 5, 1, 112, 3),
    (6, 5, 2, 192, 4),
    (6, 3, 1, 320, 1),
];
const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;
const SE_RATIO: usize = 4;

/// チャネルごとの重み付け
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Self {
        Self {
            reduce: Conv2dConfig::new([channels, squeezed], [1, 1]).init(device),
            expand: Conv2dConfig::new([squeezed, channels], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let dims = x.dims();
        let scale = x.clone().mean_dim(3).mean_dim(2);
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale.expand(dims)
    }
}

#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand: Option<ConvNorm<B>>,
    depthwise: ConvNorm<B>,
    se: SqueezeExcite<B>,
    project: ConvNorm<B>,
}

impl<B: Backend> MBConv<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expand_ratio;
        let expand = (expand_ratio != 1)
            .then(|| ConvNorm::new([in_channels, hidden], [1, 1], 1, device));

        Self {
            expand,
            depthwise: ConvNorm::grouped([hidden, hidden], [kernel, kernel], stride, hidden, device),
            se: SqueezeExcite::new(hidden, (in_channels / SE_RATIO).max(1), device),
            project: ConvNorm::new([hidden, out_channels], [1, 1], 1, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let input_dims = x.dims();
        let mut out = x.clone();
        if let Some(expand) = &self.expand {
            out = silu(expand.forward(out));
        }
        let out = silu(self.depthwise.forward(out));
        let out = self.se.forward(out);
        let out = self.project.forward(out);

        // stride 1 かつ入出力チャネルが等しいときだけ残差接続
        if out.dims() == input_dims {
            out + x
        } else {
            out
        }
    }
}

/// 出力特徴の次元
pub fn feature_dim(width_divisor: usize) -> usize {
    scaled(HEAD_CHANNELS, width_divisor)
}

#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    stem: ConvNorm<B>,
    blocks: Vec<MBConv<B>>,
    head: ConvNorm<B>,
}

impl<B: Backend> EfficientNetB0<B> {
    pub fn new(width_divisor: usize, device: &B::Device) -> Self {
        let stem_channels = scaled(STEM_CHANNELS, width_divisor);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for (expand_ratio, kernel, stride, out, repeats) in STAGES {
            let out = scaled(out, width_divisor);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(MBConv::new(in_channels, out, expand_ratio, kernel, stride, device));
                in_channels = out;
            }
        }

        Self {
            stem: ConvNorm::new([3, stem_channels], [3, 3], 2, device),
            blocks,
            head: ConvNorm::new([in_channels, feature_dim(width_divisor)], [1, 1], 1, device),
        }
    }

    /// [B, 3, H, W] -> [B, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = silu(self.head.forward(x));

        global_max_pool(x)
    }
}
