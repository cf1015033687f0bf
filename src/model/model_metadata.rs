//! モデルメタデータの定義と永続化
//!
//! tar.gz形式でモデルと関連するメタデータを保存・読み込みします。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::ClassIndex;
use crate::ml::metrics::MetricsRow;
use crate::ml::training::{SplitScores, TrainingHistory};
use crate::ml::ModelConfig;
use crate::model::config::TrainingSettings;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// 結果表に載せるモデル名（例: "ResNet-50"）
    pub model_name: String,

    /// モデル構造の設定（推論時に同じ構造を再構築する）
    pub model_config: ModelConfig,

    /// クラスラベル（インデックス順）
    /// 例: ["glioma", "meningioma", "notumor", "pituitary"]
    pub class_labels: Vec<String>,

    /// 学習時の設定
    pub training: TrainingSettings,

    /// エポックごとの損失・精度
    #[serde(default)]
    pub history: TrainingHistory,

    /// 学習後の train / valid / test スコア
    #[serde(default)]
    pub scores: Option<SplitScores>,

    /// テストデータでの指標
    #[serde(default)]
    pub test_metrics: Option<MetricsRow>,

    /// 事前学習済み重みを使ったか
    #[serde(default)]
    pub pretrained: bool,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model_name: impl Into<String>,
        model_config: ModelConfig,
        class_index: &ClassIndex,
        training: TrainingSettings,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            model_name: model_name.into(),
            model_config,
            class_labels: class_index.labels().to_vec(),
            training,
            history: TrainingHistory::default(),
            scores: None,
            test_metrics: None,
            pretrained: false,
            trained_at,
        }
    }

    pub fn with_history(mut self, history: TrainingHistory) -> Self {
        self.history = history;
        self
    }

    pub fn with_scores(mut self, scores: SplitScores) -> Self {
        self.scores = Some(scores);
        self
    }

    pub fn with_test_metrics(mut self, metrics: MetricsRow) -> Self {
        self.test_metrics = Some(metrics);
        self
    }

    pub fn with_pretrained(mut self, pretrained: bool) -> Self {
        self.pretrained = pretrained;
        self
    }

    /// 保存されたクラスラベルから対応表を復元
    pub fn class_index(&self) -> ClassIndex {
        ClassIndex::from_labels(self.class_labels.iter().cloned())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::BackboneKind;
    use crate::ml::NUM_CLASSES;

    #[test]
    fn test_metadata_json_round_trip() {
        let config = ModelConfig::new(NUM_CLASSES, BackboneKind::InceptionV3).with_image_size(64);
        let metadata = ModelMetadata::new(
            "InceptionV3",
            config,
            &ClassIndex::standard(),
            TrainingSettings::default(),
        )
        .with_test_metrics(MetricsRow {
            model_name: "InceptionV3".to_string(),
            accuracy: 0.5,
            precision: 0.4,
            recall: 0.5,
            f1: 0.45,
        });

        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored.model_name, "InceptionV3");
        assert_eq!(restored.model_config.backbone, BackboneKind::InceptionV3);
        assert_eq!(restored.model_config.image_size, 64);
        assert_eq!(restored.class_index(), ClassIndex::standard());
        assert_eq!(restored.test_metrics, metadata.test_metrics);
    }

    #[test]
    fn test_broken_json_is_error() {
        assert!(ModelMetadata::from_json_string("{}").is_err());
    }
}
