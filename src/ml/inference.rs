//! モデル推論機能
//!
//! 1枚の画像に学習時と同じ前処理（オーグメンテーションなし）を掛けて
//! クラスごとの確率を返します。推論用バックエンドではドロップアウトが無効なので、
//! 同じ画像・同じモデルなら結果は常に同じです。

use std::fmt;
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::RgbImage;

use crate::data::{argmax, preprocess, ClassIndex};
use crate::error::{ClassifierError, Result};
use crate::ml::ml_model::{ModelConfig, TumorClassifier};
use crate::model::{load_classifier, ModelMetadata};

/// 1枚の画像の推論結果
#[derive(Debug, Clone)]
pub struct Prediction {
    /// (ラベル, 確率) をクラスインデックス順に並べたもの
    pub probabilities: Vec<(String, f32)>,
    /// モデル入力サイズにリサイズした画像（表示用）
    pub image: RgbImage,
}

impl Prediction {
    /// 最も確率の高いクラス
    pub fn top(&self) -> Option<(&str, f32)> {
        let values: Vec<f32> = self.probabilities.iter().map(|(_, p)| *p).collect();
        argmax(&values).map(|i| (self.probabilities[i].0.as_str(), self.probabilities[i].1))
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const BAR_WIDTH: usize = 40;
        let label_width = self
            .probabilities
            .iter()
            .map(|(l, _)| l.len())
            .max()
            .unwrap_or(0);

        for (label, probability) in &self.probabilities {
            let filled = (probability.clamp(0.0, 1.0) * BAR_WIDTH as f32).round() as usize;
            writeln!(
                f,
                "{:<label_width$} {:<BAR_WIDTH$} {:>6.2}%",
                label,
                "#".repeat(filled),
                probability * 100.0
            )?;
        }
        if let Some((label, probability)) = self.top() {
            writeln!(f, "予測: {} ({:.2}%)", label, probability * 100.0)?;
        }
        Ok(())
    }
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: TumorClassifier<B>,
    model_config: ModelConfig,
    class_index: ClassIndex,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    pub fn new(
        model: TumorClassifier<B>,
        model_config: ModelConfig,
        class_index: ClassIndex,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            model_config,
            class_index,
            device,
        }
    }

    /// モデルアーカイブを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> anyhow::Result<(Self, ModelMetadata)> {
        let (metadata, model) = load_classifier::<B>(model_path.as_ref(), &device)?;
        let engine = Self::new(
            model,
            metadata.model_config.clone(),
            metadata.class_index(),
            device,
        );
        Ok((engine, metadata))
    }

    pub fn class_index(&self) -> &ClassIndex {
        &self.class_index
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    /// 単一画像のクラス確率
    pub fn predict_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let size = self.model_config.image_size;
        let image = preprocess::load_resized(image_path.as_ref(), size)?;
        let data = preprocess::to_chw(&image);

        let tensor = Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([1, 3, size, size]);
        let probs = self
            .model
            .probabilities(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Record(format!("推論結果の取得エラー: {:?}", e)))?;

        let probabilities = self
            .class_index
            .labels()
            .iter()
            .cloned()
            .zip(probs)
            .collect();

        Ok(Prediction {
            probabilities,
            image,
        })
    }

    /// 単一画像を分類してラベルを返す
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<String> {
        let prediction = self.predict_image(image_path)?;
        prediction
            .top()
            .map(|(label, _)| label.to_string())
            .ok_or_else(|| ClassifierError::Record("クラスが空です".to_string()))
    }
}
