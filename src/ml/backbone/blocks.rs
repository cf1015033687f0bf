//! バックボーン共通の部品

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        GroupNorm, GroupNormConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

/// チャネル数を縮小率で割る（最低8チャネル）
pub fn scaled(channels: usize, divisor: usize) -> usize {
    (channels / divisor.max(1)).max(8)
}

fn norm_groups(channels: usize) -> usize {
    if channels % 8 == 0 {
        8
    } else {
        1
    }
}

/// Conv (bias なし) + GroupNorm
///
/// パディングはカーネルの半分。stride 1 なら空間サイズを保つ。
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    conv: Conv2d<B>,
    norm: GroupNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    pub fn new(channels: [usize; 2], kernel: [usize; 2], stride: usize, device: &B::Device) -> Self {
        Self::grouped(channels, kernel, stride, 1, device)
    }

    /// groups = 入力チャネル数で depthwise 畳み込み
    pub fn grouped(
        channels: [usize; 2],
        kernel: [usize; 2],
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new(channels, kernel)
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(kernel[0] / 2, kernel[1] / 2))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let norm = GroupNormConfig::new(norm_groups(channels[1]), channels[1]).init(device);

        Self { conv, norm }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// 3x3 / stride 2 の最大値プーリング
pub fn max_pool_3x3_s2() -> MaxPool2d {
    MaxPool2dConfig::new([3, 3])
        .with_strides([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init()
}

/// 3x3 / stride 1 の平均プーリング（サイズを保つ）
pub fn avg_pool_3x3_s1() -> AvgPool2d {
    AvgPool2dConfig::new([3, 3])
        .with_strides([1, 1])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init()
}

/// グローバル最大値プーリング: [B, C, H, W] -> [B, C]
pub fn global_max_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch_size, channels, _, _] = x.dims();
    x.max_dim(3).max_dim(2).reshape([batch_size, channels])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_global_max_pool_picks_spatial_max() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats(
            [1.0, 5.0, 2.0, 3.0, -1.0, -4.0, -2.0, -3.0].as_slice(),
            &device,
        )
        .reshape([1, 2, 2, 2]);

        let pooled = global_max_pool(x).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(pooled, vec![5.0, -1.0]);
    }

    #[test]
    fn test_strided_conv_never_collapses_to_zero() {
        let device = Default::default();
        let block = ConvNorm::<TestBackend>::new([3, 8], [3, 3], 2, &device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 1, 1], &device);
        assert_eq!(block.forward(x).dims(), [1, 8, 1, 1]);
    }

    #[test]
    fn test_scaled_has_floor() {
        assert_eq!(scaled(2048, 1), 2048);
        assert_eq!(scaled(2048, 16), 128);
        assert_eq!(scaled(32, 16), 8);
    }
}
