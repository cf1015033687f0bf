//! ResNet-50 系バックボーン
//!
//! stem (7x7 stride 2 + max pool) → bottleneck [3, 4, 6, 3] → グローバル最大値プーリング

use burn::{
    module::Module,
    nn::{pool::MaxPool2d, Relu},
    tensor::{backend::Backend, Tensor},
};

use super::blocks::{global_max_pool, max_pool_3x3_s2, scaled, ConvNorm};

const STAGES: [(usize, usize); 4] = [(64, 3), (128, 4), (256, 6), (512, 3)];
const EXPANSION: usize = 4;

/// 1x1 → 3x3 → 1x1 のボトルネック残差ブロック
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    reduce: ConvNorm<B>,
    conv: ConvNorm<B>,
    expand: ConvNorm<B>,
    downsample: Option<ConvNorm<B>>,
    activation: Relu,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * EXPANSION;
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| ConvNorm::new([in_channels, out_channels], [1, 1], stride, device));

        Self {
            reduce: ConvNorm::new([in_channels, width], [1, 1], 1, device),
            conv: ConvNorm::new([width, width], [3, 3], stride, device),
            expand: ConvNorm::new([width, out_channels], [1, 1], 1, device),
            downsample,
            activation: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.activation.forward(self.reduce.forward(x));
        let out = self.activation.forward(self.conv.forward(out));
        let out = self.expand.forward(out);

        self.activation.forward(out + identity)
    }
}

/// 出力特徴の次元
pub fn feature_dim(width_divisor: usize) -> usize {
    scaled(512, width_divisor) * EXPANSION
}

#[derive(Module, Debug)]
pub struct ResNet50<B: Backend> {
    stem: ConvNorm<B>,
    pool: MaxPool2d,
    blocks: Vec<Bottleneck<B>>,
    activation: Relu,
}

impl<B: Backend> ResNet50<B> {
    pub fn new(width_divisor: usize, device: &B::Device) -> Self {
        let stem_channels = scaled(64, width_divisor);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for (stage, (width, repeats)) in STAGES.into_iter().enumerate() {
            let width = scaled(width, width_divisor);
            for i in 0..repeats {
                // 2段目以降の先頭ブロックで解像度を半分にする
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(Bottleneck::new(in_channels, width, stride, device));
                in_channels = width * EXPANSION;
            }
        }

        Self {
            stem: ConvNorm::new([3, stem_channels], [7, 7], 2, device),
            pool: max_pool_3x3_s2(),
            blocks,
            activation: Relu::new(),
        }
    }

    /// [B, 3, H, W] -> [B, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.activation.forward(self.stem.forward(images));
        let mut x = self.pool.forward(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        global_max_pool(x)
    }
}
