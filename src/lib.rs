//! 脳MRI画像の腫瘍分類
//!
//! クラスごとのディレクトリからマニフェストを作り、層化分割したデータで
//! 4種類のバックボーン（Xception, ResNet-50, InceptionV3, EfficientNet-B0）に
//! 共通の分類ヘッドを付けて学習・評価・比較します。

pub mod data;
pub mod error;
pub mod ml;
pub mod model;
pub mod report;

pub use error::{ClassifierError, Result};
