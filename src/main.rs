//! 脳MRI腫瘍分類 CLI
//!
//! - train: バックボーンごとに学習・評価し、モデルと結果表を保存
//! - evaluate: 保存済みモデルをテストデータで評価
//! - predict: 1枚の画像のクラス確率を表示
//! - write-config: デフォルト設定を書き出す

#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::{Autodiff, Wgpu};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use clap::{Parser, Subcommand, ValueHint};

use mri_tumor_classifier::data::{ImageLoader, LoaderConfig, Manifest};
use mri_tumor_classifier::ml::{evaluate, run_experiment, BackboneKind, InferenceEngine};
use mri_tumor_classifier::model::{load_classifier, AppConfig, DeviceType};

#[derive(Parser)]
#[command(author, version, about = "Brain MRI tumour classification with interchangeable backbones")]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(long, global = true, default_value = "config.json", value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// 設定に関わらず CPU (NdArray) で実行
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 設定されたバックボーンを学習して比較する
    Train {
        /// 学習するバックボーン（省略時は設定ファイルの一覧）
        #[arg(long = "backbone")]
        backbones: Vec<BackboneKind>,
    },

    /// 保存済みモデルをテストデータで評価する
    Evaluate {
        #[arg(long, value_hint = ValueHint::FilePath)]
        model: PathBuf,
        #[arg(long, value_hint = ValueHint::DirPath)]
        test_dir: PathBuf,
        #[arg(long, default_value_t = 16)]
        batch_size: usize,
    },

    /// 1枚の画像を分類する
    Predict {
        #[arg(long, value_hint = ValueHint::FilePath)]
        model: PathBuf,
        #[arg(long, value_hint = ValueHint::FilePath)]
        image: PathBuf,
    },

    /// デフォルト設定を書き出す
    WriteConfig {
        #[arg(long, default_value = "config.json", value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Command::WriteConfig { path } = &cli.command {
        AppConfig::default().save(path)?;
        println!("設定ファイルを保存しました: {}", path.display());
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(&cli.config);
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }

    match config.device_type {
        DeviceType::Wgpu => run::<Autodiff<Wgpu>>(cli.command, &config, WgpuDevice::default()),
        DeviceType::Cpu => run::<Autodiff<NdArray>>(cli.command, &config, NdArrayDevice::Cpu),
    }
}

fn run<B: AutodiffBackend>(command: Command, config: &AppConfig, device: B::Device) -> Result<()> {
    log::info!("計算デバイス: {}", config.device_type);

    match command {
        Command::Train { backbones } => {
            config.display();
            let summary = run_experiment::<B>(config, &backbones, &device)?;
            summary.print();
            if summary.table.is_empty() {
                anyhow::bail!("すべてのバックボーンの学習に失敗しました");
            }
            Ok(())
        }
        Command::Evaluate {
            model,
            test_dir,
            batch_size,
        } => evaluate_archive::<B::InnerBackend>(&model, &test_dir, batch_size, device),
        Command::Predict { model, image } => predict_image::<B::InnerBackend>(&model, &image, device),
        Command::WriteConfig { .. } => Ok(()),
    }
}

fn evaluate_archive<B: Backend>(
    model_path: &Path,
    test_dir: &Path,
    batch_size: usize,
    device: B::Device,
) -> Result<()> {
    let (metadata, model) = load_classifier::<B>(model_path, &device)?;
    let class_index = metadata.class_index();
    let manifest = Manifest::from_directory(test_dir)?;

    let mut loader = ImageLoader::<B>::new(
        manifest,
        class_index.clone(),
        LoaderConfig::evaluation(batch_size, metadata.model_config.image_size),
        device,
    )?;
    let evaluation = evaluate(&model, &mut loader, metadata.model_config.input_shape())
        .with_context(|| format!("評価に失敗しました: {}", model_path.display()))?;

    evaluation.print_summary(&metadata.model_name, &class_index);
    Ok(())
}

fn predict_image<B: Backend>(model_path: &Path, image_path: &Path, device: B::Device) -> Result<()> {
    let (engine, metadata) = InferenceEngine::<B>::load(model_path, device)?;
    let prediction = engine
        .predict_image(image_path)
        .with_context(|| format!("推論に失敗しました: {}", image_path.display()))?;

    println!("モデル: {}", metadata.model_name);
    println!("画像: {}", image_path.display());
    print!("{}", prediction);
    Ok(())
}
