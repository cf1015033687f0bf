//! エラー定義
//!
//! データ読み込みから推論までの失敗をひとつの列挙型にまとめます。
//! 構造的な入力エラーと設定の不整合は常に呼び出し側へ返し、
//! 画像単位の `Decode` だけはローダー内で警告を出して読み飛ばせます。

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClassifierError>;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("ディレクトリが存在しません: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("画像ファイルが見つかりません: {0}")]
    EmptyManifest(PathBuf),

    /// 層化分割にはクラスごとに2枚以上必要
    #[error("クラス '{label}' のサンプル数が不足しています: {count} 枚 (最低 2 枚)")]
    InsufficientSamples { label: String, count: usize },

    #[error("分割比率が範囲外です: {0} (0 < fraction < 1)")]
    InvalidFraction(f64),

    #[error("画像を読み込めません {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("ラベル '{label}' はクラスインデックスに存在しません (既知: {known})")]
    ClassMismatch { label: String, known: String },

    #[error("入力形状が一致しません: {actual:?} (期待: {expected:?})")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: [usize; 4],
    },

    #[error("バックボーン {backbone} の事前学習済み重みを取得できません: {reason}")]
    BackboneUnavailable { backbone: String, reason: String },

    #[error("ローダー設定が不正です: {0}")]
    InvalidLoaderConfig(String),

    #[error("モデルレコードのエラー: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ClassifierError {
    /// 画像単位で読み飛ばしてよいエラーか
    pub fn is_skippable(&self) -> bool {
        matches!(self, ClassifierError::Decode { .. })
    }
}
