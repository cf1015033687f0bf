//! クラスラベルとインデックスの対応表
//!
//! 学習・検証・テストの各ローダーと評価・推論で同一の対応表を共有しないと
//! ラベルインデックスを比較できないため、構築後は変更しません。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};

/// 分類対象の4クラス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TumorClass {
    Glioma,
    Meningioma,
    NoTumor,
    Pituitary,
}

impl TumorClass {
    /// ディレクトリ名の辞書順（学習時のインデックス順）
    pub const ALL: [TumorClass; 4] = [
        TumorClass::Glioma,
        TumorClass::Meningioma,
        TumorClass::NoTumor,
        TumorClass::Pituitary,
    ];

    /// データセットのディレクトリ名
    pub fn dir_name(&self) -> &'static str {
        match self {
            TumorClass::Glioma => "glioma",
            TumorClass::Meningioma => "meningioma",
            TumorClass::NoTumor => "notumor",
            TumorClass::Pituitary => "pituitary",
        }
    }
}

impl fmt::Display for TumorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for TumorClass {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self> {
        TumorClass::ALL
            .iter()
            .copied()
            .find(|class| class.dir_name() == s)
            .ok_or_else(|| ClassifierError::ClassMismatch {
                label: s.to_string(),
                known: TumorClass::ALL.map(|c| c.dir_name()).join(", "),
            })
    }
}

/// ラベル文字列 → インデックスの固定マッピング
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassIndex {
    labels: Vec<String>,
}

impl ClassIndex {
    /// ラベルを辞書順に並べて対応表を作る（重複は除去）
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        labels.sort();
        labels.dedup();
        Self { labels }
    }

    /// glioma / meningioma / notumor / pituitary の標準4クラス
    pub fn standard() -> Self {
        Self::from_labels(TumorClass::ALL.iter().map(|c| c.dir_name()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn index_of(&self, label: &str) -> Result<usize> {
        self.labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| ClassifierError::ClassMismatch {
                label: label.to_string(),
                known: self.labels.join(", "),
            })
    }

    pub fn label_of(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// ワンホットベクトルに変換
    pub fn one_hot(&self, label: &str) -> Result<Vec<f32>> {
        let index = self.index_of(label)?;
        let mut encoded = vec![0.0; self.labels.len()];
        encoded[index] = 1.0;
        Ok(encoded)
    }

    /// 最大値の位置のラベルを返す（同値の場合は先頭）
    pub fn decode_one_hot(&self, encoded: &[f32]) -> Option<&str> {
        argmax(encoded).and_then(|index| self.label_of(index))
    }
}

/// 最大値のインデックス（同値の場合は先頭、空なら None）
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, best_v)) if best_v >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_order_is_alphabetical() {
        let index = ClassIndex::standard();
        assert_eq!(index.labels(), &["glioma", "meningioma", "notumor", "pituitary"]);
        assert_eq!(index.index_of("notumor").unwrap(), 2);
    }

    #[test]
    fn test_one_hot_round_trip_for_every_class() {
        let index = ClassIndex::standard();
        for class in TumorClass::ALL {
            let encoded = index.one_hot(class.dir_name()).unwrap();
            assert_eq!(encoded.iter().sum::<f32>(), 1.0);
            assert_eq!(index.decode_one_hot(&encoded), Some(class.dir_name()));
        }
    }

    #[test]
    fn test_unknown_label_is_class_mismatch() {
        let index = ClassIndex::standard();
        let err = index.one_hot("astrocytoma").unwrap_err();
        assert!(matches!(err, ClassifierError::ClassMismatch { .. }));
    }

    #[test]
    fn test_from_labels_deduplicates() {
        let index = ClassIndex::from_labels(["b", "a", "b", "c", "a"]);
        assert_eq!(index.labels(), &["a", "b", "c"]);
    }

    #[test]
    fn test_tumor_class_parse() {
        assert_eq!("pituitary".parse::<TumorClass>().unwrap(), TumorClass::Pituitary);
        assert!("Pituitary".parse::<TumorClass>().is_err());
    }

    #[test]
    fn test_argmax_ties_pick_first() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}
