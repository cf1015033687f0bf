//! モデル学習
//!
//! 固定エポック数の学習ループ（早期終了・チェックポイント・学習率スケジュールなし）と、
//! バックボーンを差し替えて学習から評価までを行う `train_and_evaluate` を提供します。

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use serde::{Deserialize, Serialize};

use crate::data::{stratified_split, ClassIndex, ImageLoader, LoaderConfig, Manifest};
use crate::error::Result;
use crate::ml::backbone::{BackboneFactory, InputShape};
use crate::ml::evaluation::{evaluate, Evaluation};
use crate::ml::metrics::MetricsRow;
use crate::ml::ml_model::{ensure_input_shape, ModelConfig, TumorClassifier};
use crate::model::config::{AppConfig, DataSettings, TrainingSettings};

/// 1エポック分の記録
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1始まり
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
}

/// エポック順の学習履歴
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn epochs(&self) -> &[EpochRecord] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// 検証損失が最小のエポック（同値なら早い方）
    pub fn best_valid_loss_epoch(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .reduce(|best, r| if r.valid_loss < best.valid_loss { r } else { best })
    }

    /// 検証精度が最大のエポック（同値なら早い方）
    pub fn best_valid_accuracy_epoch(&self) -> Option<&EpochRecord> {
        self.epochs
            .iter()
            .reduce(|best, r| if r.valid_accuracy > best.valid_accuracy { r } else { best })
    }
}

/// 学習・検証・テストのマニフェスト
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub class_index: ClassIndex,
    pub train: Manifest,
    pub valid: Manifest,
    pub test: Manifest,
}

impl DataSplits {
    /// 学習用ルートはそのまま、テスト用ルートを検証用とテスト用に層化分割する
    pub fn prepare(settings: &DataSettings) -> Result<Self> {
        let train = Manifest::from_directory(&settings.train_dir)?;
        let held_out = Manifest::from_directory(&settings.test_dir)?;
        let (valid, test) = stratified_split(&held_out, settings.valid_fraction, settings.split_seed)?;

        let class_index = train.class_index();
        log::info!(
            "データ分割: train {} / valid {} / test {} (クラス: {})",
            train.len(),
            valid.len(),
            test.len(),
            class_index.labels().join(", ")
        );

        Ok(Self {
            class_index,
            train,
            valid,
            test,
        })
    }
}

/// 損失と精度
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SplitScore {
    pub loss: f64,
    pub accuracy: f64,
}

impl From<&Evaluation> for SplitScore {
    fn from(evaluation: &Evaluation) -> Self {
        Self {
            loss: evaluation.loss,
            accuracy: evaluation.accuracy,
        }
    }
}

/// 学習後の各分割でのスコア
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SplitScores {
    pub train: SplitScore,
    pub valid: SplitScore,
    pub test: SplitScore,
}

impl SplitScores {
    pub fn print(&self) {
        for (name, score) in [("Train", self.train), ("Validation", self.valid), ("Test", self.test)] {
            println!("{:<10} Loss: {:.4}  Accuracy: {:.2}%", name, score.loss, score.accuracy * 100.0);
        }
    }
}

/// 1つのバックボーンの学習結果
pub struct TrainingRun<B: Backend> {
    pub name: String,
    pub model_config: ModelConfig,
    /// 学習済みモデル（推論用バックエンド）
    pub model: TumorClassifier<B>,
    pub history: TrainingHistory,
    pub scores: SplitScores,
    pub test_evaluation: Evaluation,
    pub metrics: MetricsRow,
}

/// バッチ中の正解数
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [batch_size, _] = logits.dims();
    let predictions = logits.argmax(1).reshape([batch_size]);
    predictions.equal(targets).int().sum().into_scalar().elem::<i64>() as usize
}

/// 固定エポック数の学習ループ
///
/// 毎エポック後に検証ローダーで評価し、履歴に記録します。
/// バッチ処理でエラーが出たら学習全体を中断します。
pub fn train<B: AutodiffBackend>(
    mut model: TumorClassifier<B>,
    train_loader: &mut ImageLoader<B>,
    valid_loader: &mut ImageLoader<B::InnerBackend>,
    settings: &TrainingSettings,
    input_shape: InputShape,
) -> Result<(TumorClassifier<B>, TrainingHistory)> {
    let mut optimizer = AdamConfig::new().init::<B, TumorClassifier<B>>();
    let mut history = TrainingHistory::default();

    for epoch in 1..=settings.num_epochs {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut seen = 0;

        for batch in train_loader.epoch() {
            ensure_input_shape(&batch.images, input_shape)?;
            let batch_size = batch.len();

            let output = model.forward_classification(batch.images, batch.labels, batch.targets);
            loss_sum += output.loss.clone().into_scalar().elem::<f64>() * batch_size as f64;
            correct += count_correct(output.output.clone(), output.targets.clone());
            seen += batch_size;

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(settings.learning_rate, model, grads);
        }

        let valid = evaluate(&model.valid(), valid_loader, input_shape)?;
        let record = EpochRecord {
            epoch,
            train_loss: if seen == 0 { 0.0 } else { loss_sum / seen as f64 },
            train_accuracy: if seen == 0 { 0.0 } else { correct as f64 / seen as f64 },
            valid_loss: valid.loss,
            valid_accuracy: valid.accuracy,
        };
        log::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            epoch,
            settings.num_epochs,
            record.train_loss,
            record.train_accuracy,
            record.valid_loss,
            record.valid_accuracy
        );
        history.push(record);
    }

    if let (Some(loss), Some(acc)) = (history.best_valid_loss_epoch(), history.best_valid_accuracy_epoch()) {
        log::info!(
            "Best epoch: val_loss {} (epoch {}), val_accuracy {} (epoch {})",
            loss.valid_loss,
            loss.epoch,
            acc.valid_accuracy,
            acc.epoch
        );
    }

    Ok((model, history))
}

/// モデル設定をアプリケーション設定から組み立てる
pub fn model_config_for<F: BackboneFactory>(factory: &F, num_classes: usize, config: &AppConfig) -> ModelConfig {
    ModelConfig::new(num_classes, factory.kind())
        .with_image_size(config.training.image_size)
        .with_width_divisor(config.model.width_divisor)
        .with_hidden_units(config.model.hidden_units)
        .with_dropout(config.model.dropout)
        .with_head_dropout(config.model.head_dropout)
}

fn evaluation_loader<B: Backend>(
    manifest: &Manifest,
    class_index: &ClassIndex,
    settings: &TrainingSettings,
    device: &B::Device,
) -> Result<ImageLoader<B>> {
    ImageLoader::new(
        manifest.clone(),
        class_index.clone(),
        LoaderConfig::evaluation(settings.eval_batch_size, settings.image_size),
        device.clone(),
    )
}

/// バックボーンを1つ選んで学習し、テストデータで評価する
///
/// ヘッドとハイパーパラメータはどのバックボーンでも共通です。
pub fn train_and_evaluate<B: AutodiffBackend, F: BackboneFactory>(
    factory: &F,
    splits: &DataSplits,
    config: &AppConfig,
    device: &B::Device,
) -> Result<TrainingRun<B::InnerBackend>> {
    let settings = &config.training;
    let class_index = &splits.class_index;
    let model_config = model_config_for(factory, class_index.len(), config);
    let input_shape = model_config.input_shape();

    log::info!("=== {} の学習を開始します ===", factory.name());
    let model = model_config.init_with::<B, F>(factory, device)?;

    let mut train_loader = ImageLoader::<B>::new(
        splits.train.clone(),
        class_index.clone(),
        LoaderConfig::training(settings.batch_size, settings.image_size, settings.seed),
        device.clone(),
    )?;
    let mut valid_loader = evaluation_loader::<B::InnerBackend>(&splits.valid, class_index, settings, device)?;

    let (model, history) = train(model, &mut train_loader, &mut valid_loader, settings, input_shape)?;
    let model = model.valid();

    // 学習後のスコアはすべてオーグメンテーションなしで計算
    let mut train_eval_loader = evaluation_loader::<B::InnerBackend>(&splits.train, class_index, settings, device)?;
    let mut test_loader = evaluation_loader::<B::InnerBackend>(&splits.test, class_index, settings, device)?;

    let train_eval = evaluate(&model, &mut train_eval_loader, input_shape)?;
    let valid_eval = evaluate(&model, &mut valid_loader, input_shape)?;
    let test_eval = evaluate(&model, &mut test_loader, input_shape)?;

    let scores = SplitScores {
        train: SplitScore::from(&train_eval),
        valid: SplitScore::from(&valid_eval),
        test: SplitScore::from(&test_eval),
    };
    let metrics = test_eval.metrics_row(factory.name());

    Ok(TrainingRun {
        name: factory.name().to_string(),
        model_config,
        model,
        history,
        scores,
        test_evaluation: test_eval,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::manifest::tests::write_class_tree;
    use crate::ml::backbone::{BackboneKind, PretrainedBackbone};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn record(epoch: usize, valid_loss: f64, valid_accuracy: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            train_loss: 1.0,
            train_accuracy: 0.5,
            valid_loss,
            valid_accuracy,
        }
    }

    #[test]
    fn test_best_epochs() {
        let mut history = TrainingHistory::default();
        assert!(history.best_valid_loss_epoch().is_none());

        history.push(record(1, 0.9, 0.4));
        history.push(record(2, 0.5, 0.7));
        history.push(record(3, 0.6, 0.7));

        assert_eq!(history.best_valid_loss_epoch().unwrap().epoch, 2);
        assert_eq!(history.best_valid_accuracy_epoch().unwrap().epoch, 2);
        assert_eq!(history.len(), 3);
    }

    fn tiny_config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.data.train_dir = root.join("Training");
        config.data.test_dir = root.join("Testing");
        config.training.num_epochs = 1;
        config.training.batch_size = 4;
        config.training.eval_batch_size = 4;
        config.training.image_size = 32;
        config.model.width_divisor = 16;
        config.model.hidden_units = 16;
        config
    }

    fn write_dataset(root: &std::path::Path) {
        let counts = [("glioma", 3), ("meningioma", 3), ("notumor", 3), ("pituitary", 3)];
        write_class_tree(&root.join("Training"), &counts, 16);
        write_class_tree(&root.join("Testing"), &counts, 16);
    }

    #[test]
    fn test_prepare_splits_held_out_data_in_half() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());

        let splits = DataSplits::prepare(&tiny_config(dir.path()).data).unwrap();
        assert_eq!(splits.train.len(), 12);
        assert_eq!(splits.valid.len(), 6);
        assert_eq!(splits.test.len(), 6);
        for count in splits.test.class_counts().values() {
            assert!((1..=2).contains(count));
        }
    }

    #[test]
    fn test_train_and_evaluate_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let config = tiny_config(dir.path());

        let splits = DataSplits::prepare(&config.data).unwrap();
        let factory = PretrainedBackbone::new(BackboneKind::EfficientNetB0, 16, None);
        let run = train_and_evaluate::<TestBackend, _>(&factory, &splits, &config, &Default::default())
            .unwrap();

        assert_eq!(run.name, "EfficientNet-B0");
        assert_eq!(run.history.len(), 1);
        assert_eq!(run.test_evaluation.confusion.total(), 6);
        assert_eq!(run.test_evaluation.confusion.num_classes(), 4);
        assert!((0.0..=1.0).contains(&run.metrics.accuracy));
        assert!(run.scores.train.loss.is_finite());
    }

    #[test]
    fn test_train_aborts_on_input_shape_mismatch() {
        use crate::error::ClassifierError;
        use crate::ml::NUM_CLASSES;

        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let manifest = Manifest::from_directory(&dir.path().join("Training")).unwrap();
        let class_index = ClassIndex::standard();
        let device = burn_ndarray::NdArrayDevice::Cpu;

        let model_config = ModelConfig::new(NUM_CLASSES, BackboneKind::Xception)
            .with_image_size(32)
            .with_width_divisor(16)
            .with_hidden_units(8);
        let settings = TrainingSettings {
            num_epochs: 3,
            ..tiny_config(dir.path()).training
        };
        let loader_at = |size: usize| {
            ImageLoader::<TestBackend>::new(
                manifest.clone(),
                class_index.clone(),
                LoaderConfig::training(4, size, 1),
                device,
            )
            .unwrap()
        };
        let valid_at = |size: usize| {
            ImageLoader::<NdArray<f32>>::new(
                manifest.clone(),
                class_index.clone(),
                LoaderConfig::evaluation(4, size),
                device,
            )
            .unwrap()
        };

        // 学習ローダーが 16px
        let result = train(
            model_config.init::<TestBackend>(&device),
            &mut loader_at(16),
            &mut valid_at(32),
            &settings,
            model_config.input_shape(),
        );
        match result {
            Err(ClassifierError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected[1..], [3, 32, 32]);
                assert_eq!(actual[1..], [3, 16, 16]);
            }
            other => panic!("ShapeMismatch になるべき: {:?}", other.map(|(_, h)| h)),
        }

        // 検証ローダーが 16px: 1エポック目の検証で中断
        let mut valid = valid_at(16);
        let result = train(
            model_config.init::<TestBackend>(&device),
            &mut loader_at(32),
            &mut valid,
            &settings,
            model_config.input_shape(),
        );
        assert!(matches!(result, Err(ClassifierError::ShapeMismatch { .. })));
        assert_eq!(valid.epochs_started(), 1);
    }
}
