//! Xception 系バックボーン
//!
//! entry flow (stride 2 ブロック x3) → middle flow (残差ブロック x8) → exit flow。
//! 畳み込みはすべて depthwise separable。

use burn::{
    module::Module,
    nn::{pool::MaxPool2d, Relu},
    tensor::{backend::Backend, Tensor},
};

use super::blocks::{global_max_pool, max_pool_3x3_s2, scaled, ConvNorm};

const MIDDLE_BLOCKS: usize = 8;

/// depthwise 3x3 + pointwise 1x1
#[derive(Module, Debug)]
pub struct SeparableConv<B: Backend> {
    depthwise: ConvNorm<B>,
    pointwise: ConvNorm<B>,
}

impl<B: Backend> SeparableConv<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            depthwise: ConvNorm::grouped([in_channels, in_channels], [3, 3], 1, in_channels, device),
            pointwise: ConvNorm::new([in_channels, out_channels], [1, 1], 1, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pointwise.forward(self.depthwise.forward(x))
    }
}

/// ReLU → SeparableConv の繰り返しに残差を足すブロック
#[derive(Module, Debug)]
pub struct XceptionBlock<B: Backend> {
    convs: Vec<SeparableConv<B>>,
    pool: Option<MaxPool2d>,
    shortcut: Option<ConvNorm<B>>,
    activation: Relu,
}

impl<B: Backend> XceptionBlock<B> {
    /// 縮小ブロック: チャネル変更 + stride 2
    fn reduction(widths: &[usize], device: &B::Device) -> Self {
        let convs = widths
            .windows(2)
            .map(|w| SeparableConv::new(w[0], w[1], device))
            .collect();
        let (first, last) = (widths[0], widths[widths.len() - 1]);

        Self {
            convs,
            pool: Some(max_pool_3x3_s2()),
            shortcut: Some(ConvNorm::new([first, last], [1, 1], 2, device)),
            activation: Relu::new(),
        }
    }

    /// middle flow: 同じチャネル数で3層
    fn identity(channels: usize, device: &B::Device) -> Self {
        Self {
            convs: (0..3).map(|_| SeparableConv::new(channels, channels, device)).collect(),
            pool: None,
            shortcut: None,
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(x.clone()),
            None => x.clone(),
        };

        let mut out = x;
        for conv in &self.convs {
            out = conv.forward(self.activation.forward(out));
        }
        if let Some(pool) = &self.pool {
            out = pool.forward(out);
        }

        out + residual
    }
}

/// 出力特徴の次元
pub fn feature_dim(width_divisor: usize) -> usize {
    scaled(2048, width_divisor)
}

#[derive(Module, Debug)]
pub struct Xception<B: Backend> {
    stem1: ConvNorm<B>,
    stem2: ConvNorm<B>,
    blocks: Vec<XceptionBlock<B>>,
    exit1: SeparableConv<B>,
    exit2: SeparableConv<B>,
    activation: Relu,
}

impl<B: Backend> Xception<B> {
    pub fn new(width_divisor: usize, device: &B::Device) -> Self {
        let c = |n| scaled(n, width_divisor);

        let mut blocks = vec![
            XceptionBlock::reduction(&[c(64), c(128), c(128)], device),
            XceptionBlock::reduction(&[c(128), c(256), c(256)], device),
            XceptionBlock::reduction(&[c(256), c(728), c(728)], device),
        ];
        blocks.extend((0..MIDDLE_BLOCKS).map(|_| XceptionBlock::identity(c(728), device)));
        blocks.push(XceptionBlock::reduction(&[c(728), c(728), c(1024)], device));

        Self {
            stem1: ConvNorm::new([3, c(32)], [3, 3], 2, device),
            stem2: ConvNorm::new([c(32), c(64)], [3, 3], 1, device),
            blocks,
            exit1: SeparableConv::new(c(1024), c(1536), device),
            exit2: SeparableConv::new(c(1536), c(2048), device),
            activation: Relu::new(),
        }
    }

    /// [B, 3, H, W] -> [B, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.stem1.forward(images));
        let mut x = self.activation.forward(self.stem2.forward(x));

        for block in &self.blocks {
            x = block.forward(x);
        }

        let x = self.activation.forward(self.exit1.forward(x));
        let x = self.activation.forward(self.exit2.forward(x));

        global_max_pool(x)
    }
}
