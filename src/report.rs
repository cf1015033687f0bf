//! モデル比較の結果表

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use csv::ReaderBuilder;

use crate::ml::MetricsRow;

/// バックボーンごとの指標を並べた表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsTable {
    rows: Vec<MetricsRow>,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: MetricsRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[MetricsRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 精度が最も高い行
    pub fn best_by_accuracy(&self) -> Option<&MetricsRow> {
        self.rows
            .iter()
            .reduce(|best, row| if row.accuracy > best.accuracy { row } else { best })
    }

    /// CSVに書き出す
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create parent directory: {:?}", parent))?;
        }

        let mut csv_writer = csv::Writer::from_path(path)
            .context(format!("CSV作成エラー: {:?}", path))?;
        for row in &self.rows {
            csv_writer
                .serialize(row)
                .context("CSV書き込みエラー")?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    /// CSVから読み込む
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .context(format!("CSV読み込みエラー: {:?}", path))?;

        let mut table = Self::new();
        for result in reader.deserialize() {
            let row: MetricsRow = result?;
            table.push(row);
        }
        Ok(table)
    }
}

impl FromIterator<MetricsRow> for ResultsTable {
    fn from_iter<I: IntoIterator<Item = MetricsRow>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for ResultsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self
            .rows
            .iter()
            .map(|r| r.model_name.len())
            .max()
            .unwrap_or(0)
            .max("Model".len());

        writeln!(
            f,
            "{:<name_width$}  {:>8}  {:>9}  {:>8}  {:>8}",
            "Model", "Accuracy", "Precision", "Recall", "F1"
        )?;
        writeln!(f, "{}", "-".repeat(name_width + 43))?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<name_width$}  {:>8.4}  {:>9.4}  {:>8.4}  {:>8.4}",
                row.model_name, row.accuracy, row.precision, row.recall, row.f1
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, accuracy: f64) -> MetricsRow {
        MetricsRow {
            model_name: name.to_string(),
            accuracy,
            precision: accuracy,
            recall: accuracy,
            f1: accuracy,
        }
    }

    #[test]
    fn test_display_lists_every_model() {
        let table: ResultsTable = vec![row("Xception", 0.9), row("EfficientNet-B0", 0.95)]
            .into_iter()
            .collect();
        let text = table.to_string();

        assert!(text.starts_with("Model"));
        assert!(text.contains("EfficientNet-B0"));
        assert!(text.contains("0.9500"));
        assert_eq!(text.lines().count(), 4);
        assert_eq!(table.best_by_accuracy().unwrap().model_name, "EfficientNet-B0");
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.csv");

        let mut table = ResultsTable::new();
        table.push(row("ResNet-50", 0.75));
        table.push(row("InceptionV3", 0.5));
        table.write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("model_name,accuracy,precision,recall,f1"));
        assert_eq!(ResultsTable::read_csv(&path).unwrap(), table);
    }
}
