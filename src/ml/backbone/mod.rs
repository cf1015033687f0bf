//! 特徴抽出バックボーン
//!
//! 4種類のバックボーンを同じ契約（[B, 3, H, W] → [B, feature_dim]）で扱います。
//! 分類ヘッドはどのバックボーンでも共通です。

mod blocks;
pub mod efficientnet;
pub mod inception;
pub mod resnet;
pub mod xception;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

pub use efficientnet::EfficientNetB0;
pub use inception::InceptionV3;
pub use resnet::ResNet50;
pub use xception::Xception;

/// バックボーンの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackboneKind {
    Xception,
    ResNet50,
    InceptionV3,
    EfficientNetB0,
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 4] = [
        BackboneKind::Xception,
        BackboneKind::ResNet50,
        BackboneKind::InceptionV3,
        BackboneKind::EfficientNetB0,
    ];

    /// 結果表に載せる名前
    pub fn display_name(&self) -> &'static str {
        match self {
            BackboneKind::Xception => "Xception",
            BackboneKind::ResNet50 => "ResNet-50",
            BackboneKind::InceptionV3 => "InceptionV3",
            BackboneKind::EfficientNetB0 => "EfficientNet-B0",
        }
    }

    /// 重みファイル・モデルアーカイブのファイル名
    pub fn file_stem(&self) -> &'static str {
        match self {
            BackboneKind::Xception => "xception",
            BackboneKind::ResNet50 => "resnet50",
            BackboneKind::InceptionV3 => "inception_v3",
            BackboneKind::EfficientNetB0 => "efficientnet_b0",
        }
    }

    /// 出力特徴の次元
    pub fn feature_dim(&self, width_divisor: usize) -> usize {
        match self {
            BackboneKind::Xception => xception::feature_dim(width_divisor),
            BackboneKind::ResNet50 => resnet::feature_dim(width_divisor),
            BackboneKind::InceptionV3 => inception::feature_dim(width_divisor),
            BackboneKind::EfficientNetB0 => efficientnet::feature_dim(width_divisor),
        }
    }

    /// ランダム初期化したバックボーンを作る
    pub fn init<B: Backend>(&self, width_divisor: usize, device: &B::Device) -> Backbone<B> {
        match self {
            BackboneKind::Xception => Backbone::Xception(Xception::new(width_divisor, device)),
            BackboneKind::ResNet50 => Backbone::ResNet50(ResNet50::new(width_divisor, device)),
            BackboneKind::InceptionV3 => {
                Backbone::InceptionV3(InceptionV3::new(width_divisor, device))
            }
            BackboneKind::EfficientNetB0 => {
                Backbone::EfficientNetB0(EfficientNetB0::new(width_divisor, device))
            }
        }
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for BackboneKind {
    type Err = String;

    /// 表示名・ファイル名のどちらでも受け付ける（大文字小文字は無視）
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let key = s.to_ascii_lowercase();
        BackboneKind::ALL
            .into_iter()
            .find(|kind| {
                kind.file_stem() == key
                    || kind.display_name().to_ascii_lowercase() == key
                    || kind.file_stem().replace('_', "") == key.replace(['-', '_'], "")
            })
            .ok_or_else(|| {
                format!(
                    "不明なバックボーン: {} (xception, resnet50, inception_v3, efficientnet_b0)",
                    s
                )
            })
    }
}

/// 入力形状（チャネルは常に RGB の 3）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub const CHANNELS: usize = 3;

    pub fn square(size: usize) -> Self {
        Self {
            height: size,
            width: size,
        }
    }

    /// バッチサイズ込みの期待形状 [B, 3, H, W]
    pub fn batch_dims(&self, batch_size: usize) -> [usize; 4] {
        [batch_size, Self::CHANNELS, self.height, self.width]
    }
}

/// バックボーン本体
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Xception(Xception<B>),
    ResNet50(ResNet50<B>),
    InceptionV3(InceptionV3<B>),
    EfficientNetB0(EfficientNetB0<B>),
}

impl<B: Backend> Backbone<B> {
    /// [B, 3, H, W] -> [B, feature_dim]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Backbone::Xception(net) => net.forward(images),
            Backbone::ResNet50(net) => net.forward(images),
            Backbone::InceptionV3(net) => net.forward(images),
            Backbone::EfficientNetB0(net) => net.forward(images),
        }
    }
}

/// バックボーンの生成方法
///
/// 学習ルーチンはこのトレイト越しにバックボーンを受け取るため、
/// どのバックボーンでもヘッドとハイパーパラメータは共通になります。
pub trait BackboneFactory {
    fn kind(&self) -> BackboneKind;

    fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    fn feature_dim(&self) -> usize;

    fn build<B: Backend>(&self, input_shape: InputShape, device: &B::Device) -> Result<Backbone<B>>;
}

/// 事前学習済み重みを読み込むバックボーン生成器
///
/// `weights_dir` に `<file_stem>.mpk` があれば読み込み、
/// ディレクトリ未指定ならランダム初期化のまま返します。
#[derive(Debug, Clone)]
pub struct PretrainedBackbone {
    pub kind: BackboneKind,
    pub width_divisor: usize,
    pub weights_dir: Option<PathBuf>,
}

impl PretrainedBackbone {
    pub fn new(kind: BackboneKind, width_divisor: usize, weights_dir: Option<PathBuf>) -> Self {
        Self {
            kind,
            width_divisor,
            weights_dir,
        }
    }

    /// 重みファイルのパス
    pub fn weights_path(&self) -> Option<PathBuf> {
        self.weights_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.mpk", self.kind.file_stem())))
    }
}

impl BackboneFactory for PretrainedBackbone {
    fn kind(&self) -> BackboneKind {
        self.kind
    }

    fn feature_dim(&self) -> usize {
        self.kind.feature_dim(self.width_divisor)
    }

    fn build<B: Backend>(&self, input_shape: InputShape, device: &B::Device) -> Result<Backbone<B>> {
        if input_shape.height == 0 || input_shape.width == 0 {
            return Err(ClassifierError::InvalidLoaderConfig(format!(
                "入力サイズは 1 以上が必要です: {}x{}",
                input_shape.height, input_shape.width
            )));
        }

        let backbone = self.kind.init::<B>(self.width_divisor, device);

        let (Some(dir), Some(path)) = (&self.weights_dir, self.weights_path()) else {
            log::warn!(
                "{}: 事前学習済み重みのディレクトリが未指定のためランダム初期化で学習します",
                self.name()
            );
            return Ok(backbone);
        };

        if !path.is_file() {
            return Err(ClassifierError::BackboneUnavailable {
                backbone: self.name().to_string(),
                reason: format!("重みファイルが見つかりません: {}", path.display()),
            });
        }

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let backbone = backbone
            .load_file(dir.join(self.kind.file_stem()), &recorder, device)
            .map_err(|e| ClassifierError::BackboneUnavailable {
                backbone: self.name().to_string(),
                reason: format!("{:?}", e),
            })?;

        log::info!("{}: 事前学習済み重みを読み込みました: {}", self.name(), path.display());
        Ok(backbone)
    }
}
