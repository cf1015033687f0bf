//! バックボーン比較実験
//!
//! 設定されたバックボーンを順に学習・評価し、アーカイブと結果表を出力します。
//! 1つのバックボーンの失敗は記録だけして、残りのバックボーンは続行します。

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};

use crate::ml::backbone::{BackboneFactory, BackboneKind, PretrainedBackbone};
use crate::ml::training::{train_and_evaluate, DataSplits, TrainingRun};
use crate::model::{save_classifier, AppConfig, ModelMetadata};
use crate::report::ResultsTable;

/// 結果表の保存ファイル名
pub const RESULTS_FILE: &str = "results.csv";

/// 学習に失敗したバックボーン
#[derive(Debug, Clone)]
pub struct BackboneFailure {
    pub backbone: BackboneKind,
    pub reason: String,
}

/// 実験全体の結果
#[derive(Debug, Clone, Default)]
pub struct ExperimentSummary {
    pub table: ResultsTable,
    /// 保存したモデルアーカイブ（学習順）
    pub archives: Vec<PathBuf>,
    pub failures: Vec<BackboneFailure>,
}

impl ExperimentSummary {
    pub fn print(&self) {
        println!("\n=== モデル比較 ===");
        print!("{}", self.table);
        if let Some(best) = self.table.best_by_accuracy() {
            println!("\n最高精度: {} ({:.2}%)", best.model_name, best.accuracy * 100.0);
        }
        for failure in &self.failures {
            println!("失敗: {} - {}", failure.backbone, failure.reason);
        }
    }
}

fn report_run<B: Backend>(run: &TrainingRun<B>, splits: &DataSplits) {
    println!("\n=== {} ===", run.name);
    run.scores.print();
    run.test_evaluation
        .print_summary(&format!("{} (test)", run.name), &splits.class_index);
}

/// 1つのバックボーンを学習してアーカイブを保存
fn run_backbone<B: AutodiffBackend>(
    factory: &PretrainedBackbone,
    splits: &DataSplits,
    config: &AppConfig,
    device: &B::Device,
) -> Result<(PathBuf, TrainingRun<B::InnerBackend>)> {
    let run = train_and_evaluate::<B, _>(factory, splits, config, device)
        .with_context(|| format!("{} の学習に失敗しました", factory.name()))?;
    report_run(&run, splits);

    let metadata = ModelMetadata::new(
        run.name.clone(),
        run.model_config.clone(),
        &splits.class_index,
        config.training.clone(),
    )
    .with_history(run.history.clone())
    .with_scores(run.scores)
    .with_test_metrics(run.metrics.clone())
    .with_pretrained(factory.weights_dir.is_some());

    let path = config.output_dir.join(factory.kind().file_stem());
    let archive = save_classifier(&path, &metadata, run.model.clone())?;
    Ok((archive, run))
}

/// 実験を実行
///
/// # 引数
/// - `config`: アプリケーション設定
/// - `backbones`: 学習するバックボーン（空なら設定ファイルの一覧）
/// - `device`: 学習デバイス
pub fn run_experiment<B: AutodiffBackend>(
    config: &AppConfig,
    backbones: &[BackboneKind],
    device: &B::Device,
) -> Result<ExperimentSummary> {
    let backbones = if backbones.is_empty() {
        config.model.backbones.as_slice()
    } else {
        backbones
    };

    let splits = DataSplits::prepare(&config.data).context("データセットの準備に失敗しました")?;
    for (name, manifest) in [("train", &splits.train), ("valid", &splits.valid), ("test", &splits.test)] {
        log::info!("{} のクラス別枚数: {:?}", name, manifest.class_counts());
    }

    let mut summary = ExperimentSummary::default();
    for &kind in backbones {
        let factory = PretrainedBackbone::new(
            kind,
            config.model.width_divisor,
            config.model.pretrained_dir.clone(),
        );

        match run_backbone::<B>(&factory, &splits, config, device) {
            Ok((archive, run)) => {
                summary.table.push(run.metrics);
                summary.archives.push(archive);
            }
            Err(e) => {
                log::error!("{}: {:#}", kind, e);
                summary.failures.push(BackboneFailure {
                    backbone: kind,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    if !summary.table.is_empty() {
        let results_path = config.output_dir.join(RESULTS_FILE);
        summary.table.write_csv(&results_path)?;
        log::info!("結果表を保存しました: {}", results_path.display());
    }

    Ok(summary)
}
