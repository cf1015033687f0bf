//! 分類モデルの定義
//!
//! バックボーン + 共通ヘッド（dropout → dense(128, relu) → dropout → dense(num_classes)）。

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{
        activation::{log_softmax, softmax},
        backend::Backend,
        Int, Tensor,
    },
    train::ClassificationOutput,
};

use crate::error::ClassifierError;
use crate::ml::backbone::{Backbone, BackboneFactory, BackboneKind, InputShape};

/// クラス数（glioma, meningioma, notumor, pituitary）
pub const NUM_CLASSES: usize = 4;

/// 入力画像サイズ
pub const IMAGE_SIZE: usize = 299;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    pub backbone: BackboneKind,
    /// 入力画像サイズ（正方形）
    #[config(default = 299)]
    pub image_size: usize,
    /// バックボーンのチャネル幅の縮小率（1 で標準幅）
    #[config(default = 1)]
    pub width_divisor: usize,
    #[config(default = 128)]
    pub hidden_units: usize,
    /// バックボーン出力直後のドロップアウト率
    #[config(default = 0.3)]
    pub dropout: f64,
    /// 隠れ層後のドロップアウト率
    #[config(default = 0.25)]
    pub head_dropout: f64,
}

impl ModelConfig {
    pub fn input_shape(&self) -> InputShape {
        InputShape::square(self.image_size)
    }

    /// ランダム初期化のモデル（保存済みレコードの読み込み先）
    pub fn init<B: Backend>(&self, device: &B::Device) -> TumorClassifier<B> {
        let backbone = self.backbone.init(self.width_divisor, device);
        self.with_backbone(backbone, self.backbone.feature_dim(self.width_divisor), device)
    }

    /// バックボーン生成器を使ってモデルを初期化
    pub fn init_with<B: Backend, F: BackboneFactory>(
        &self,
        factory: &F,
        device: &B::Device,
    ) -> crate::error::Result<TumorClassifier<B>> {
        let backbone = factory.build::<B>(self.input_shape(), device)?;
        Ok(self.with_backbone(backbone, factory.feature_dim(), device))
    }

    fn with_backbone<B: Backend>(
        &self,
        backbone: Backbone<B>,
        feature_dim: usize,
        device: &B::Device,
    ) -> TumorClassifier<B> {
        log::debug!(
            "[Model] {}: 特徴次元 {} -> {} -> {}",
            self.backbone,
            feature_dim,
            self.hidden_units,
            self.num_classes
        );

        TumorClassifier {
            backbone,
            dropout1: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(feature_dim, self.hidden_units).init(device),
            dropout2: DropoutConfig::new(self.head_dropout).init(),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// 脳MRI腫瘍分類モデル
///
/// # アーキテクチャ
/// - バックボーン（グローバル最大値プーリングで [B, feature_dim]）
/// - Dropout(0.3)
/// - FC: feature_dim -> 128 + ReLU
/// - Dropout(0.25)
/// - FC: 128 -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct TumorClassifier<B: Backend> {
    backbone: Backbone<B>,
    dropout1: Dropout,
    fc1: Linear<B>,
    dropout2: Dropout,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> TumorClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images);

        let x = self.dropout1.forward(x);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        let x = self.dropout2.forward(x);
        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    /// - `labels`: ワンホットラベル [batch_size, num_classes]
    /// - `targets`: クラスインデックス [batch_size]
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        labels: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = categorical_cross_entropy(output.clone(), labels);

        ClassificationOutput::new(loss, output, targets)
    }
}

/// ワンホットラベルに対するカテゴリカル交差エントロピー（バッチ平均）
pub fn categorical_cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 2>) -> Tensor<B, 1> {
    let log_probs = log_softmax(logits, 1);
    (labels * log_probs).sum_dim(1).mean().neg()
}

/// バッチ形状が [batch, 3, H, W] と一致するか確認
pub fn ensure_input_shape<B: Backend>(images: &Tensor<B, 4>, shape: InputShape) -> crate::error::Result<()> {
    let actual = images.dims();
    let expected = shape.batch_dims(actual[0]);
    if actual != expected {
        return Err(ClassifierError::ShapeMismatch { expected, actual });
    }
    Ok(())
}
