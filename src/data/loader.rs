//! バッチローダー
//!
//! burn の `Batcher` と `DataLoaderBuilder` でマニフェストからバッチを遅延生成します。
//!
//! - `epoch()` を呼ぶたびに先頭からやり直せる（1エポック = マニフェスト1周）
//! - `shuffle` が有効なローダーだけがエポックごとに順序を並べ替える
//! - 評価用ローダー（`shuffle = false`）はマニフェスト順を保つため、
//!   予測結果を位置で正解ラベルに対応付けられる
//! - 読めない画像は警告を出して除外し、ラベルの不一致は構築時にエラーにする

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder, DataLoaderIterator};
use burn::data::dataset::Dataset;
use burn::tensor::{backend::Backend, Int, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::{preprocess, ClassIndex, Manifest};
use crate::error::{ClassifierError, Result};

/// ローダー設定
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 明るさ変動を掛けるか
    pub augment: bool,
    /// エポックごとに順序を並べ替えるか
    pub shuffle: bool,
    pub seed: u64,
}

impl LoaderConfig {
    /// 学習用: オーグメンテーションとシャッフルあり
    pub fn training(batch_size: usize, image_size: usize, seed: u64) -> Self {
        Self {
            batch_size,
            image_size,
            augment: true,
            shuffle: true,
            seed,
        }
    }

    /// 評価用: マニフェスト順を保ったまま1周する
    pub fn evaluation(batch_size: usize, image_size: usize) -> Self {
        Self {
            batch_size,
            image_size,
            augment: false,
            shuffle: false,
            seed: 0,
        }
    }
}

/// データセットアイテム（画像パスとクラスID、マニフェスト上の位置）
#[derive(Clone, Debug)]
pub struct LoaderItem {
    pub index: usize,
    pub path: PathBuf,
    pub label: usize,
}

/// マニフェストをクラスID付きで引けるデータセット
struct ManifestDataset {
    items: Vec<LoaderItem>,
}

impl ManifestDataset {
    fn new(manifest: &Manifest, class_ids: &[usize]) -> Self {
        let items = manifest
            .samples()
            .iter()
            .zip(class_ids)
            .enumerate()
            .map(|(index, (sample, &label))| LoaderItem {
                index,
                path: sample.path().to_path_buf(),
                label,
            })
            .collect();
        Self { items }
    }
}

impl Dataset<LoaderItem> for ManifestDataset {
    fn get(&self, index: usize) -> Option<LoaderItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, size, size]、値は [0, 1]
    pub images: Tensor<B, 4>,
    /// ワンホットラベル [batch_size, num_classes]
    pub labels: Tensor<B, 2>,
    /// クラスインデックス [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// 各行に対応するマニフェスト上の位置
    pub sample_indices: Vec<usize>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.sample_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_indices.is_empty()
    }
}

/// バッチャー
///
/// 読めない画像を除いた結果が空なら `None` を返します。
pub struct ImageBatcher {
    image_size: usize,
    num_classes: usize,
    augment: bool,
    rng: Mutex<StdRng>,
}

impl ImageBatcher {
    pub fn new(image_size: usize, num_classes: usize, augment: bool, seed: u64) -> Self {
        Self {
            image_size,
            num_classes,
            augment,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn brightness(&self) -> f32 {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        preprocess::sample_brightness(&mut *rng)
    }
}

impl<B: Backend> Batcher<B, LoaderItem, Option<ImageBatch<B>>> for ImageBatcher {
    fn batch(&self, items: Vec<LoaderItem>, device: &B::Device) -> Option<ImageBatch<B>> {
        let size = self.image_size;

        let mut pixels = Vec::with_capacity(items.len() * 3 * size * size);
        let mut one_hot = vec![0.0f32; items.len() * self.num_classes];
        let mut targets = Vec::with_capacity(items.len());
        let mut kept = Vec::with_capacity(items.len());

        for item in items {
            let img = match preprocess::load_resized(&item.path, size) {
                Ok(img) => img,
                Err(e) => {
                    log::warn!("画像をスキップします: {}", e);
                    continue;
                }
            };

            let mut data = preprocess::to_chw(&img);
            if self.augment {
                preprocess::apply_brightness(&mut data, self.brightness());
            }

            pixels.extend_from_slice(&data);
            one_hot[kept.len() * self.num_classes + item.label] = 1.0;
            targets.push(item.label as i64);
            kept.push(item.index);
        }

        if kept.is_empty() {
            return None;
        }

        let batch_size = kept.len();
        one_hot.truncate(batch_size * self.num_classes);

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(pixels.as_slice(), device)
            .reshape([batch_size, 3, size, size]);
        let labels = Tensor::<B, 1>::from_floats(one_hot.as_slice(), device)
            .reshape([batch_size, self.num_classes]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), device);

        Some(ImageBatch {
            images,
            labels,
            targets,
            sample_indices: kept,
        })
    }
}

pub struct ImageLoader<B: Backend> {
    manifest: Manifest,
    class_index: ClassIndex,
    class_ids: Vec<usize>,
    config: LoaderConfig,
    dataloader: Arc<dyn DataLoader<B, Option<ImageBatch<B>>>>,
    epochs_started: usize,
}

impl<B: Backend> ImageLoader<B> {
    pub fn new(
        manifest: Manifest,
        class_index: ClassIndex,
        config: LoaderConfig,
        device: B::Device,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(ClassifierError::InvalidLoaderConfig(
                "batch_size は 1 以上が必要です".to_string(),
            ));
        }
        if config.image_size == 0 {
            return Err(ClassifierError::InvalidLoaderConfig(
                "image_size は 1 以上が必要です".to_string(),
            ));
        }
        if manifest.is_empty() {
            return Err(ClassifierError::InvalidLoaderConfig(
                "空のマニフェストからはローダーを作れません".to_string(),
            ));
        }

        let class_ids = manifest.class_ids(&class_index)?;
        let dataset = ManifestDataset::new(&manifest, &class_ids);
        let batcher = ImageBatcher::new(config.image_size, class_index.len(), config.augment, config.seed);

        // num_workers=0 で順序どおりにオンデマンド読み込み
        let builder = DataLoaderBuilder::<B, LoaderItem, Option<ImageBatch<B>>>::new(batcher)
            .batch_size(config.batch_size)
            .num_workers(0)
            .set_device(device);
        let dataloader = if config.shuffle {
            builder.shuffle(config.seed).build(dataset)
        } else {
            builder.build(dataset)
        };

        Ok(Self {
            manifest,
            class_index,
            class_ids,
            config,
            dataloader,
            epochs_started: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.config.batch_size)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn class_index(&self) -> &ClassIndex {
        &self.class_index
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_shuffled(&self) -> bool {
        self.config.shuffle
    }

    /// マニフェスト順の正解クラスインデックス
    pub fn ground_truth(&self) -> &[usize] {
        &self.class_ids
    }

    pub fn epochs_started(&self) -> usize {
        self.epochs_started
    }

    /// 1エポック分のバッチ列を開始する
    pub fn epoch(&mut self) -> EpochBatches<'_, B> {
        self.epochs_started += 1;
        EpochBatches {
            inner: self.dataloader.iter(),
        }
    }
}

/// 1エポック分のバッチイテレータ（空になったバッチは飛ばす）
pub struct EpochBatches<'a, B: Backend> {
    inner: Box<dyn DataLoaderIterator<Option<ImageBatch<B>>> + 'a>,
}

impl<B: Backend> Iterator for EpochBatches<'_, B> {
    type Item = ImageBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.find_map(|batch| batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::manifest::tests::write_class_tree;
    use crate::data::Sample;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn loader(dir: &std::path::Path, config: LoaderConfig) -> ImageLoader<TestBackend> {
        let manifest = Manifest::from_directory(dir).unwrap();
        let class_index = ClassIndex::standard();
        ImageLoader::new(manifest, class_index, config, Default::default()).unwrap()
    }

    #[test]
    fn test_evaluation_loader_keeps_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("glioma", 3), ("notumor", 2), ("pituitary", 2)], 12);

        let mut loader = loader(dir.path(), LoaderConfig::evaluation(3, 8));
        assert_eq!(loader.num_batches(), 3);

        for _ in 0..2 {
            let indices: Vec<usize> = loader
                .epoch()
                .flat_map(|batch| batch.sample_indices)
                .collect();
            assert_eq!(indices, (0..7).collect::<Vec<_>>());
        }
        assert_eq!(loader.epochs_started(), 2);
    }

    #[test]
    fn test_batch_shapes_and_one_hot_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("meningioma", 2), ("pituitary", 2)], 10);

        let mut loader = loader(dir.path(), LoaderConfig::evaluation(4, 16));
        let batch = loader.epoch().next().unwrap();

        assert_eq!(batch.images.dims(), [4, 3, 16, 16]);
        assert_eq!(batch.labels.dims(), [4, 4]);

        let labels = batch.labels.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(&labels[0..4], &[0.0, 1.0, 0.0, 0.0]);
        assert_eq!(&labels[12..16], &[0.0, 0.0, 0.0, 1.0]);

        let pixels = batch.images.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_training_loader_reshuffles_each_epoch() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(
            dir.path(),
            &[("glioma", 5), ("meningioma", 5), ("notumor", 5), ("pituitary", 5)],
            8,
        );

        let mut loader = loader(dir.path(), LoaderConfig::training(20, 8, 1));
        let first: Vec<usize> = loader.epoch().flat_map(|b| b.sample_indices).collect();
        let second: Vec<usize> = loader.epoch().flat_map(|b| b.sample_indices).collect();

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
        assert_ne!(first, second);
    }

    #[test]
    fn test_corrupt_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_class_tree(dir.path(), &[("glioma", 2)], 8);
        std::fs::write(dir.path().join("glioma").join("zz_broken.jpg"), b"garbage").unwrap();

        let mut loader = loader(dir.path(), LoaderConfig::evaluation(8, 8));
        let batches: Vec<_> = loader.epoch().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sample_indices, vec![0, 1]);
    }

    #[test]
    fn test_unknown_label_is_class_mismatch() {
        let manifest = Manifest::from_samples(vec![Sample::new("/tmp/a.png", "astrocytoma")]);
        let result = ImageLoader::<TestBackend>::new(
            manifest,
            ClassIndex::standard(),
            LoaderConfig::evaluation(1, 8),
            Default::default(),
        );
        assert!(matches!(result, Err(ClassifierError::ClassMismatch { .. })));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let manifest = Manifest::from_samples(vec![Sample::new("/tmp/a.png", "glioma")]);
        let result = ImageLoader::<TestBackend>::new(
            manifest,
            ClassIndex::standard(),
            LoaderConfig::evaluation(0, 8),
            Default::default(),
        );
        assert!(matches!(result, Err(ClassifierError::InvalidLoaderConfig(_))));
    }

    /// 単色画像のピクセル値を画像ごとに返す
    fn image_values(loader: &mut ImageLoader<TestBackend>, size: usize) -> Vec<Vec<f32>> {
        loader
            .epoch()
            .flat_map(|batch| {
                let pixels = batch.images.into_data().convert::<f32>().to_vec::<f32>().unwrap();
                pixels.chunks(3 * size * size).map(<[f32]>::to_vec).collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_augmentation_scales_brightness_within_range() {
        let dir = tempfile::tempdir().unwrap();
        let class_dir = dir.path().join("glioma");
        std::fs::create_dir_all(&class_dir).unwrap();
        for i in 0..4 {
            image::RgbImage::from_pixel(8, 8, image::Rgb([100, 100, 100]))
                .save(class_dir.join(format!("gray_{i}.png")))
                .unwrap();
        }
        let base = 100.0 / 255.0;

        let mut plain = loader(dir.path(), LoaderConfig::evaluation(4, 8));
        for image in image_values(&mut plain, 8) {
            assert!(image.iter().all(|v| (v - base).abs() < 1e-3));
        }

        let mut augmented = loader(dir.path(), LoaderConfig::training(2, 8, 5));
        let mut factors = Vec::new();
        for _ in 0..3 {
            for image in image_values(&mut augmented, 8) {
                let factor = image[0] / base;
                assert!(image.iter().all(|v| (v - image[0]).abs() < 1e-5));
                assert!((0.8 - 1e-3..=1.2 + 1e-3).contains(&factor), "factor {factor}");
                factors.push(factor);
            }
        }

        assert_eq!(factors.len(), 12);
        assert!(factors.iter().any(|f| (f - 1.0).abs() > 1e-3));
        assert!(factors.windows(2).any(|w| (w[0] - w[1]).abs() > 1e-4));
    }
}
