//! InceptionV3 系バックボーン
//!
//! stem → A x3 → 縮小 → C x2 (7x7 を 1x7 / 7x1 に分解) → 縮小 → E x2 (分岐を並列に連結)

use burn::{
    module::Module,
    nn::{
        pool::{AvgPool2d, MaxPool2d},
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::blocks::{avg_pool_3x3_s1, global_max_pool, max_pool_3x3_s2, scaled, ConvNorm};

/// (出力チャネル, カーネル, stride)
type ConvSpec = (usize, [usize; 2], usize);

const fn conv(out: usize, kernel: [usize; 2]) -> ConvSpec {
    (out, kernel, 1)
}

const fn conv_s2(out: usize, kernel: [usize; 2]) -> ConvSpec {
    (out, kernel, 2)
}

struct BranchSpec<'a> {
    avg_pool: bool,
    convs: &'a [ConvSpec],
    split: &'a [ConvSpec],
}

const fn seq(convs: &[ConvSpec]) -> BranchSpec<'_> {
    BranchSpec {
        avg_pool: false,
        convs,
        split: &[],
    }
}

const fn pooled(convs: &[ConvSpec]) -> BranchSpec<'_> {
    BranchSpec {
        avg_pool: true,
        convs,
        split: &[],
    }
}

const fn forked<'a>(convs: &'a [ConvSpec], split: &'a [ConvSpec]) -> BranchSpec<'a> {
    BranchSpec {
        avg_pool: false,
        convs,
        split,
    }
}

/// 1本の分岐（任意で先頭に平均プーリング、末尾で並列分岐）
#[derive(Module, Debug)]
pub struct Branch<B: Backend> {
    pool: Option<AvgPool2d>,
    convs: Vec<ConvNorm<B>>,
    split: Vec<ConvNorm<B>>,
    activation: Relu,
}

impl<B: Backend> Branch<B> {
    fn build(in_channels: usize, spec: &BranchSpec, divisor: usize, device: &B::Device) -> (Self, usize) {
        let mut channels = in_channels;
        let mut convs = Vec::with_capacity(spec.convs.len());
        for &(out, kernel, stride) in spec.convs {
            let out = scaled(out, divisor);
            convs.push(ConvNorm::new([channels, out], kernel, stride, device));
            channels = out;
        }

        let mut split = Vec::with_capacity(spec.split.len());
        let mut split_channels = 0;
        for &(out, kernel, stride) in spec.split {
            let out = scaled(out, divisor);
            split.push(ConvNorm::new([channels, out], kernel, stride, device));
            split_channels += out;
        }
        if !split.is_empty() {
            channels = split_channels;
        }

        let branch = Self {
            pool: spec.avg_pool.then(avg_pool_3x3_s1),
            convs,
            split,
            activation: Relu::new(),
        };
        (branch, channels)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        };
        for conv in &self.convs {
            x = self.activation.forward(conv.forward(x));
        }
        if self.split.is_empty() {
            return x;
        }

        let outputs = self
            .split
            .iter()
            .map(|conv| self.activation.forward(conv.forward(x.clone())))
            .collect();
        Tensor::cat(outputs, 1)
    }
}

/// 分岐を並べてチャネル方向に連結するモジュール
#[derive(Module, Debug)]
pub struct InceptionModule<B: Backend> {
    branches: Vec<Branch<B>>,
    max_pool: Option<MaxPool2d>,
}

impl<B: Backend> InceptionModule<B> {
    fn build(
        in_channels: usize,
        specs: &[BranchSpec],
        reduction: bool,
        divisor: usize,
        device: &B::Device,
    ) -> (Self, usize) {
        let mut out_channels = if reduction { in_channels } else { 0 };
        let mut branches = Vec::with_capacity(specs.len());
        for spec in specs {
            let (branch, channels) = Branch::build(in_channels, spec, divisor, device);
            branches.push(branch);
            out_channels += channels;
        }

        let module = Self {
            branches,
            max_pool: reduction.then(max_pool_3x3_s2),
        };
        (module, out_channels)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut outputs: Vec<Tensor<B, 4>> = self
            .branches
            .iter()
            .map(|branch| branch.forward(x.clone()))
            .collect();
        if let Some(pool) = &self.max_pool {
            outputs.push(pool.forward(x));
        }
        Tensor::cat(outputs, 1)
    }
}

/// 出力特徴の次元
pub fn feature_dim(divisor: usize) -> usize {
    let c = |n| scaled(n, divisor);
    c(320) + 4 * c(384) + c(192)
}

#[derive(Module, Debug)]
pub struct InceptionV3<B: Backend> {
    stem_a: Vec<ConvNorm<B>>,
    pool_a: MaxPool2d,
    stem_b: Vec<ConvNorm<B>>,
    pool_b: MaxPool2d,
    modules: Vec<InceptionModule<B>>,
    activation: Relu,
}

impl<B: Backend> InceptionV3<B> {
    pub fn new(divisor: usize, device: &B::Device) -> Self {
        let c = |n| scaled(n, divisor);

        let stem_a = vec![
            ConvNorm::new([3, c(32)], [3, 3], 2, device),
            ConvNorm::new([c(32), c(32)], [3, 3], 1, device),
            ConvNorm::new([c(32), c(64)], [3, 3], 1, device),
        ];
        let stem_b = vec![
            ConvNorm::new([c(64), c(80)], [1, 1], 1, device),
            ConvNorm::new([c(80), c(192)], [3, 3], 1, device),
        ];

        let mut modules = Vec::new();
        let mut channels = c(192);
        let mut push = |specs: &[BranchSpec], reduction: bool| {
            let (module, out) = InceptionModule::build(channels, specs, reduction, divisor, device);
            modules.push(module);
            channels = out;
        };

        for pool_features in [32, 64, 64] {
            push(
                &[
                    seq(&[conv(64, [1, 1])]),
                    seq(&[conv(48, [1, 1]), conv(64, [5, 5])]),
                    seq(&[conv(64, [1, 1]), conv(96, [3, 3]), conv(96, [3, 3])]),
                    pooled(&[conv(pool_features, [1, 1])]),
                ],
                false,
            );
        }

        push(
            &[
                seq(&[conv_s2(384, [3, 3])]),
                seq(&[conv(64, [1, 1]), conv(96, [3, 3]), conv_s2(96, [3, 3])]),
            ],
            true,
        );

        for c7 in [128, 192] {
            push(
                &[
                    seq(&[conv(192, [1, 1])]),
                    seq(&[conv(c7, [1, 1]), conv(c7, [1, 7]), conv(192, [7, 1])]),
                    seq(&[
                        conv(c7, [1, 1]),
                        conv(c7, [7, 1]),
                        conv(c7, [1, 7]),
                        conv(c7, [7, 1]),
                        conv(192, [1, 7]),
                    ]),
                    pooled(&[conv(192, [1, 1])]),
                ],
                false,
            );
        }

        push(
            &[
                seq(&[conv(192, [1, 1]), conv_s2(320, [3, 3])]),
                seq(&[
                    conv(192, [1, 1]),
                    conv(192, [1, 7]),
                    conv(192, [7, 1]),
                    conv_s2(192, [3, 3]),
                ]),
            ],
            true,
        );

        for _ in 0..2 {
            push(
                &[
                    seq(&[conv(320, [1, 1])]),
                    forked(&[conv(384, [1, 1])], &[conv(384, [1, 3]), conv(384, [3, 1])]),
                    forked(
                        &[conv(448, [1, 1]), conv(384, [3, 3])],
                        &[conv(384, [1, 3]), conv(384, [3, 1])],
                    ),
                    pooled(&[conv(192, [1, 1])]),
                ],
                false,
            );
        }

        Self {
            stem_a,
            pool_a: max_pool_3x3_s2(),
            stem_b,
            pool_b: max_pool_3x3_s2(),
            modules,
            activation: Relu::new(),
        }
    }

    /// [B, 3, H, W] -> [B, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.stem_a {
            x = self.activation.forward(conv.forward(x));
        }
        x = self.pool_a.forward(x);
        for conv in &self.stem_b {
            x = self.activation.forward(conv.forward(x));
        }
        x = self.pool_b.forward(x);

        for module in &self.modules {
            x = module.forward(x);
        }

        global_max_pool(x)
    }
}
