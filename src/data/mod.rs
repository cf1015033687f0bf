//! データパイプライン
//!
//! マニフェスト構築 → 層化分割 → 前処理 → バッチローダー

pub mod class_index;
pub mod loader;
pub mod manifest;
pub mod preprocess;
pub mod split;

pub use class_index::{argmax, ClassIndex, TumorClass};
pub use loader::{EpochBatches, ImageBatch, ImageBatcher, ImageLoader, LoaderConfig, LoaderItem};
pub use manifest::{Manifest, Sample};
pub use split::stratified_split;
