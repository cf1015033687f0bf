//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（モデル設定、クラスラベル、学習履歴、指標）
//! - model.bin       - モデルの重み（BinBytesRecorder, full precision）

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::ml::TumorClassifier;
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先を `.tar.gz` に揃える
pub fn archive_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// モデルの重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: TumorClassifier<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    recorder
        .record(model.into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// 学習済みモデルをメタデータ付きで保存
///
/// 保存したファイルのパスを返します。
pub fn save_classifier<B: Backend>(
    output_path: &Path,
    metadata: &ModelMetadata,
    model: TumorClassifier<B>,
) -> Result<PathBuf> {
    let model_binary = model_to_bytes(model)?;
    save_model_with_metadata(output_path, metadata, &model_binary)
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    log::info!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .context(format!("Failed to add {} to tar", name))
}

/// Tar.gzから指定エントリを読み込む
fn read_entry(tar_gz_path: &Path, name: &str) -> Result<Vec<u8>> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some(name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(anyhow::anyhow!("{} not found in tar.gz archive", name))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let bytes = read_entry(tar_gz_path, METADATA_ENTRY)?;
    let json_str = String::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(&json_str)
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// アーカイブからモデルを復元
pub fn load_classifier<B: Backend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, TumorClassifier<B>)> {
    let (metadata, model_binary) = load_model_with_metadata(tar_gz_path)?;

    let model = metadata.model_config.init::<B>(device);
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok((metadata, model.load_record(record)))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let config = &metadata.model_config;
    println!("\n=== モデルメタデータ ===");
    println!("モデル: {}", metadata.model_name);
    println!("クラスラベル: {}", metadata.class_labels.join(", "));
    println!("モデル入力サイズ: {}x{}", config.image_size, config.image_size);
    println!("幅の縮小率: 1/{}", config.width_divisor);
    println!(
        "ヘッド: dropout({}) → dense({}) → dropout({}) → dense({})",
        config.dropout, config.hidden_units, config.head_dropout, config.num_classes
    );
    println!("事前学習済み重み: {}", if metadata.pretrained { "あり" } else { "なし" });
    println!("学習エポック数: {}", metadata.training.num_epochs);
    println!("学習率: {}", metadata.training.learning_rate);

    if !metadata.history.is_empty() {
        println!("学習履歴:");
        for record in metadata.history.epochs() {
            println!(
                "  Epoch {:>3}: loss {:.4} acc {:.4} | val_loss {:.4} val_acc {:.4}",
                record.epoch,
                record.train_loss,
                record.train_accuracy,
                record.valid_loss,
                record.valid_accuracy
            );
        }
    }
    if let Some(metrics) = &metadata.test_metrics {
        println!(
            "テスト指標: accuracy {:.4}, precision {:.4}, recall {:.4}, f1 {:.4}",
            metrics.accuracy, metrics.precision, metrics.recall, metrics.f1
        );
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ClassIndex;
    use crate::ml::backbone::BackboneKind;
    use crate::ml::{ModelConfig, NUM_CLASSES};
    use crate::model::config::TrainingSettings;

    fn metadata() -> ModelMetadata {
        let config = ModelConfig::new(NUM_CLASSES, BackboneKind::EfficientNetB0)
            .with_image_size(32)
            .with_width_divisor(16)
            .with_hidden_units(8);
        ModelMetadata::new(
            "EfficientNet-B0",
            config,
            &ClassIndex::standard(),
            TrainingSettings::default(),
        )
    }

    #[test]
    fn test_archive_path_appends_extension() {
        assert_eq!(archive_path(Path::new("models/xception")), PathBuf::from("models/xception.tar.gz"));
        assert_eq!(archive_path(Path::new("a/b.tar.gz")), PathBuf::from("a/b.tar.gz"));
    }

    #[test]
    fn test_save_and_load_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_model_with_metadata(&dir.path().join("m"), &metadata(), &[1, 2, 3]).unwrap();

        let (loaded, binary) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded.model_name, "EfficientNet-B0");
        assert_eq!(binary, vec![1, 2, 3]);
        assert_eq!(load_metadata(&path).unwrap().class_labels.len(), 4);
    }

    #[test]
    fn test_classifier_round_trip_keeps_weights() {
        type TestBackend = burn_ndarray::NdArray<f32>;
        use burn::tensor::Tensor;

        let device = Default::default();
        let metadata = metadata();
        let model = metadata.model_config.init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let before = model
            .probabilities(images.clone())
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = save_classifier(&dir.path().join("effnet"), &metadata, model).unwrap();
        let (_, restored) = load_classifier::<TestBackend>(&path, &device).unwrap();
        let after = restored
            .probabilities(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();

        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
