//! 評価機能
//!
//! シャッフルなしのローダーを1周し、予測を位置で正解ラベルに対応付けます。

use burn::tensor::{activation::softmax, backend::Backend, ElementConversion};

use crate::data::{argmax, ClassIndex, ImageLoader};
use crate::error::{ClassifierError, Result};
use crate::ml::metrics::{ClassificationReport, ConfusionMatrix, MetricsRow};
use crate::ml::ml_model::{categorical_cross_entropy, ensure_input_shape, TumorClassifier};
use crate::ml::backbone::InputShape;

/// 評価結果
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// サンプル平均の交差エントロピー
    pub loss: f64,
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
    /// 予測したクラスインデックス（評価したサンプル順）
    pub predictions: Vec<usize>,
}

impl Evaluation {
    pub fn num_samples(&self) -> usize {
        self.predictions.len()
    }

    pub fn metrics_row(&self, model_name: impl Into<String>) -> MetricsRow {
        MetricsRow::from_report(model_name, &self.report)
    }

    pub fn print_summary(&self, name: &str, class_index: &ClassIndex) {
        println!("=== {} ===", name);
        println!("Loss: {:.4}", self.loss);
        println!("Accuracy: {:.2}%", self.accuracy * 100.0);
        println!("{}", self.report);
        println!("混同行列（行 = 正解, 列 = 予測）:");
        print!("{}", self.confusion.to_table(class_index));
    }
}

/// モデルを評価
///
/// # 引数
/// - `model`: 学習済みモデル（推論用バックエンド）
/// - `loader`: シャッフル無効のローダー
/// - `input_shape`: モデルの入力形状
pub fn evaluate<B: Backend>(
    model: &TumorClassifier<B>,
    loader: &mut ImageLoader<B>,
    input_shape: InputShape,
) -> Result<Evaluation> {
    if loader.is_shuffled() {
        return Err(ClassifierError::InvalidLoaderConfig(
            "評価にはシャッフルなしのローダーが必要です".to_string(),
        ));
    }

    let class_index = loader.class_index().clone();
    let ground_truth = loader.ground_truth().to_vec();
    let num_classes = class_index.len();

    let mut confusion = ConfusionMatrix::new(num_classes);
    let mut predictions = Vec::with_capacity(ground_truth.len());
    let mut loss_sum = 0.0;

    for batch in loader.epoch() {
        ensure_input_shape(&batch.images, input_shape)?;
        let batch_len = batch.len();

        let logits = model.forward(batch.images);
        let loss = categorical_cross_entropy(logits.clone(), batch.labels)
            .into_scalar()
            .elem::<f64>();
        loss_sum += loss * batch_len as f64;

        let probs = softmax(logits, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Record(format!("{:?}", e)))?;

        for (row, &sample_index) in probs.chunks(num_classes).zip(&batch.sample_indices) {
            let predicted = argmax(row).unwrap_or(0);
            confusion.add(ground_truth[sample_index], predicted);
            predictions.push(predicted);
        }
    }

    let evaluated = predictions.len();
    let report = ClassificationReport::from_confusion(&confusion, &class_index);
    let loss = if evaluated == 0 { 0.0 } else { loss_sum / evaluated as f64 };

    log::debug!(
        "評価: {} 枚, loss {:.4}, accuracy {:.4}",
        evaluated,
        loss,
        report.accuracy
    );

    Ok(Evaluation {
        loss,
        accuracy: report.accuracy,
        confusion,
        report,
        predictions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::manifest::tests::write_class_tree;
    use crate::data::{LoaderConfig, Manifest};
    use crate::ml::backbone::BackboneKind;
    use crate::ml::ml_model::{ModelConfig, NUM_CLASSES};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_model() -> (ModelConfig, TumorClassifier<TestBackend>) {
        let config = ModelConfig::new(NUM_CLASSES, BackboneKind::ResNet50)
            .with_image_size(32)
            .with_width_divisor(16)
            .with_hidden_units(16);
        let model = config.init::<TestBackend>(&Default::default());
        (config, model)
    }

    #[test]
    fn test_evaluation_covers_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(
            dir.path(),
            &[("glioma", 2), ("meningioma", 1), ("notumor", 2), ("pituitary", 1)],
            12,
        );
        let manifest = Manifest::from_directory(dir.path()).unwrap();
        let mut loader = ImageLoader::<TestBackend>::new(
            manifest,
            ClassIndex::standard(),
            LoaderConfig::evaluation(4, 32),
            Default::default(),
        )
        .unwrap();

        let (config, model) = small_model();
        let evaluation = evaluate(&model, &mut loader, config.input_shape()).unwrap();

        assert_eq!(evaluation.num_samples(), 6);
        assert_eq!(evaluation.confusion.total(), 6);
        assert_eq!(evaluation.confusion.num_classes(), 4);
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert!(evaluation.loss.is_finite());
    }

    #[test]
    fn test_shuffled_loader_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("glioma", 2)], 8);
        let manifest = Manifest::from_directory(dir.path()).unwrap();
        let mut loader = ImageLoader::<TestBackend>::new(
            manifest,
            ClassIndex::standard(),
            LoaderConfig::training(2, 32, 0),
            Default::default(),
        )
        .unwrap();

        let (config, model) = small_model();
        let result = evaluate(&model, &mut loader, config.input_shape());
        assert!(matches!(result, Err(ClassifierError::InvalidLoaderConfig(_))));
    }

    #[test]
    fn test_wrong_image_size_is_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("glioma", 1)], 8);
        let manifest = Manifest::from_directory(dir.path()).unwrap();
        let mut loader = ImageLoader::<TestBackend>::new(
            manifest,
            ClassIndex::standard(),
            LoaderConfig::evaluation(1, 16),
            Default::default(),
        )
        .unwrap();

        let (config, model) = small_model();
        let result = evaluate(&model, &mut loader, config.input_shape());
        assert!(matches!(result, Err(ClassifierError::ShapeMismatch { .. })));
    }
}
