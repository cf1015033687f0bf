//! 画像マニフェストの構築
//!
//! `root/<クラス名>/<画像ファイル>` 形式のディレクトリを走査し、
//! (画像パス, クラスラベル) の一覧を作ります。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::ClassIndex;
use crate::error::{ClassifierError, Result};

/// 学習サンプル（画像パスとクラスラベル）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    path: PathBuf,
    label: String,
}

impl Sample {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// サンプルの順序付き一覧
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    samples: Vec<Sample>,
}

impl Manifest {
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// ディレクトリからマニフェストを構築
    ///
    /// クラスディレクトリ・画像ファイルとも名前順に並べるため、
    /// 同じディレクトリからは常に同じ順序のマニフェストが得られます。
    pub fn from_directory(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(ClassifierError::DirectoryNotFound(root.to_path_buf()));
        }

        let mut class_dirs = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                class_dirs.push(path);
            }
        }
        class_dirs.sort();

        let mut samples = Vec::new();
        for class_dir in class_dirs {
            let label = match class_dir.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    log::warn!("クラス名として使えないディレクトリを無視します: {}", class_dir.display());
                    continue;
                }
            };

            let mut files = Vec::new();
            for entry in std::fs::read_dir(&class_dir)? {
                let path = entry?.path();
                if path.is_file() {
                    files.push(path);
                }
            }
            files.sort();

            samples.extend(files.into_iter().map(|path| Sample::new(path, label.clone())));
        }

        if samples.is_empty() {
            return Err(ClassifierError::EmptyManifest(root.to_path_buf()));
        }

        let manifest = Self { samples };
        log::info!("{} から {} 枚を読み込みました", root.display(), manifest.len());
        for (label, count) in manifest.class_counts() {
            log::info!("  クラス '{}': {} 枚", label, count);
        }

        Ok(manifest)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// ラベルごとの枚数（ラベル名順）
    pub fn class_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.label.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// 出現するラベルから対応表を作る
    pub fn class_index(&self) -> ClassIndex {
        ClassIndex::from_labels(self.samples.iter().map(|s| s.label.as_str()))
    }

    /// 各サンプルのクラスインデックス（マニフェスト順）
    pub fn class_ids(&self, class_index: &ClassIndex) -> Result<Vec<usize>> {
        self.samples
            .iter()
            .map(|sample| class_index.index_of(&sample.label))
            .collect()
    }
}

impl FromIterator<Sample> for Manifest {
    fn from_iter<T: IntoIterator<Item = Sample>>(iter: T) -> Self {
        Self {
            samples: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::TumorClass;

    /// `root/<class>/img_<i>.png` を作成（中身は単色画像）
    pub(crate) fn write_class_tree(root: &Path, per_class: &[(&str, usize)], size: u32) {
        for (class_id, (label, count)) in per_class.iter().enumerate() {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let shade = (40 * class_id as u32 + 10 * i as u32).min(255) as u8;
                let img = image::RgbImage::from_pixel(size, size, image::Rgb([shade, 255 - shade, shade / 2]));
                img.save(dir.join(format!("img_{i}.png"))).unwrap();
            }
        }
    }

    #[test]
    fn test_manifest_counts_every_file() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(
            dir.path(),
            &[("glioma", 3), ("meningioma", 2), ("notumor", 4), ("pituitary", 1)],
            8,
        );

        let manifest = Manifest::from_directory(dir.path()).unwrap();
        assert_eq!(manifest.len(), 10);

        let known: Vec<&str> = TumorClass::ALL.iter().map(|c| c.dir_name()).collect();
        assert!(manifest.samples().iter().all(|s| known.contains(&s.label())));
        assert_eq!(manifest.class_counts()["notumor"], 4);
    }

    #[test]
    fn test_label_matches_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("glioma", 2), ("pituitary", 2)], 8);

        let manifest = Manifest::from_directory(dir.path()).unwrap();
        for sample in manifest.samples() {
            let parent = sample.path().parent().unwrap().file_name().unwrap();
            assert_eq!(parent.to_str().unwrap(), sample.label());
        }
    }

    #[test]
    fn test_manifest_order_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("meningioma", 3), ("glioma", 3)], 8);

        let first = Manifest::from_directory(dir.path()).unwrap();
        let second = Manifest::from_directory(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.samples()[0].label(), "glioma");
    }

    #[test]
    fn test_missing_root_is_directory_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::from_directory(&dir.path().join("Training")).unwrap_err();
        assert!(matches!(err, ClassifierError::DirectoryNotFound(_)));
    }

    #[test]
    fn test_empty_tree_is_empty_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("glioma")).unwrap();
        let err = Manifest::from_directory(dir.path()).unwrap_err();
        assert!(matches!(err, ClassifierError::EmptyManifest(_)));
    }
}
