//! 分類指標
//!
//! 混同行列（行 = 正解、列 = 予測、クラスインデックス順）からクラス別・全体の
//! precision / recall / F1 を計算します。分母が 0 のときの値は 0 とします。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::ClassIndex;

/// 混同行列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// (正解, 予測) の組から作る
    pub fn from_pairs(num_classes: usize, truth: &[usize], predicted: &[usize]) -> Self {
        let mut matrix = Self::new(num_classes);
        for (&t, &p) in truth.iter().zip(predicted) {
            matrix.add(t, p);
        }
        matrix
    }

    pub fn add(&mut self, truth: usize, predicted: usize) {
        self.counts[truth][predicted] += 1;
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts[truth][predicted]
    }

    pub fn rows(&self) -> &[Vec<u64>] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> u64 {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    /// クラスの正解数
    pub fn support(&self, class: usize) -> u64 {
        self.counts[class].iter().sum()
    }

    /// クラスと予測された数
    pub fn predicted_count(&self, class: usize) -> u64 {
        self.counts.iter().map(|row| row[class]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// ラベル付きのテキスト表
    pub fn to_table(&self, class_index: &ClassIndex) -> String {
        let labels = class_index.labels();
        let width = labels.iter().map(|l| l.len()).max().unwrap_or(0).max(6);

        let mut out = format!("{:>width$} |", "真\\予測", width = width);
        for label in labels {
            out.push_str(&format!(" {:>width$}", label, width = width));
        }
        out.push('\n');
        out.push_str(&"-".repeat((width + 1) * (labels.len() + 1) + 1));
        out.push('\n');

        for (label, row) in labels.iter().zip(&self.counts) {
            out.push_str(&format!("{:>width$} |", label, width = width));
            for count in row {
                out.push_str(&format!(" {:>width$}", count, width = width));
            }
            out.push('\n');
        }
        out
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// クラス別の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

/// 平均した指標
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AveragedMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// 分類レポート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AveragedMetrics,
    /// サポート数で重み付けした平均
    pub weighted_avg: AveragedMetrics,
    pub total: u64,
}

impl ClassificationReport {
    pub fn from_confusion(confusion: &ConfusionMatrix, class_index: &ClassIndex) -> Self {
        let classes: Vec<ClassMetrics> = (0..confusion.num_classes())
            .map(|class| {
                let true_positives = confusion.get(class, class);
                let precision = ratio(true_positives, confusion.predicted_count(class));
                let recall = ratio(true_positives, confusion.support(class));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: class_index.label_of(class).unwrap_or("?").to_string(),
                    precision,
                    recall,
                    f1,
                    support: confusion.support(class),
                }
            })
            .collect();

        let total = confusion.total();
        let n = classes.len().max(1) as f64;
        let macro_avg = AveragedMetrics {
            precision: classes.iter().map(|c| c.precision).sum::<f64>() / n,
            recall: classes.iter().map(|c| c.recall).sum::<f64>() / n,
            f1: classes.iter().map(|c| c.f1).sum::<f64>() / n,
        };

        let weighted = |metric: fn(&ClassMetrics) -> f64| {
            if total == 0 {
                return 0.0;
            }
            classes
                .iter()
                .map(|c| metric(c) * c.support as f64)
                .sum::<f64>()
                / total as f64
        };
        let weighted_avg = AveragedMetrics {
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1: weighted(|c| c.f1),
        };

        Self {
            accuracy: confusion.accuracy(),
            classes,
            macro_avg,
            weighted_avg,
            total,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.label.len())
            .max()
            .unwrap_or(0)
            .max(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;
        for class in &self.classes {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                class.label, class.precision, class.recall, class.f1, class.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.total
        )?;
        for (name, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                name, avg.precision, avg.recall, avg.f1, self.total
            )?;
        }
        Ok(())
    }
}

/// 結果表の1行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub model_name: String,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl MetricsRow {
    pub fn from_report(model_name: impl Into<String>, report: &ClassificationReport) -> Self {
        Self {
            model_name: model_name.into(),
            accuracy: report.accuracy,
            precision: report.weighted_avg.precision,
            recall: report.weighted_avg.recall,
            f1: report.weighted_avg.f1,
        }
    }
}
