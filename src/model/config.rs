//! アプリケーション設定管理モジュール
//!
//! データセットの場所、学習設定、バックボーン設定などをJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::ml::backbone::BackboneKind;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSettings {
    /// 学習用ルート（クラスごとのサブディレクトリ）
    pub train_dir: PathBuf,
    /// テスト用ルート（検証用とテスト用に分割される）
    pub test_dir: PathBuf,
    /// テスト用ルートのうち検証用に回す割合
    pub valid_fraction: f64,
    /// 検証/テスト分割のシード
    pub split_seed: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/Training"),
            test_dir: PathBuf::from("data/Testing"),
            valid_fraction: 0.5,
            split_seed: 20,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// 学習時のバッチサイズ
    pub batch_size: usize,
    /// 評価時のバッチサイズ
    pub eval_batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// ランダムシード（シャッフル・オーグメンテーション）
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            eval_batch_size: 16,
            learning_rate: 1e-3,
            image_size: 299,
            seed: 42,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 学習するバックボーン（この順に学習）
    pub backbones: Vec<BackboneKind>,
    /// 事前学習済み重み（`<backbone>.mpk`）のディレクトリ
    #[serde(default)]
    pub pretrained_dir: Option<PathBuf>,
    /// チャネル幅の縮小率
    pub width_divisor: usize,
    /// ドロップアウト率
    pub dropout: f64,
    /// 隠れ層後のドロップアウト率
    pub head_dropout: f64,
    /// 隠れ層のユニット数
    pub hidden_units: usize,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            backbones: BackboneKind::ALL.to_vec(),
            pretrained_dir: None,
            width_divisor: 1,
            dropout: 0.3,
            head_dropout: 0.25,
            hidden_units: 128,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセット設定
    pub data: DataSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// モデル設定
    pub model: ModelSettings,
    /// モデルアーカイブと結果表の出力先
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            data: DataSettings::default(),
            training: TrainingSettings::default(),
            model: ModelSettings::default(),
            output_dir: PathBuf::from("models"),
        }
    }
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("設定ファイルの形式が不正です: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しないか読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}",
                        path.display(),
                        e
                    );
                    log::warn!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("\n--- データ設定 ---");
        println!("学習データ: {}", self.data.train_dir.display());
        println!("テストデータ: {}", self.data.test_dir.display());
        println!(
            "検証/テスト分割: {} (seed {})",
            self.data.valid_fraction, self.data.split_seed
        );
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {} (評価 {})", self.training.batch_size, self.training.eval_batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("画像サイズ: {}x{}", self.training.image_size, self.training.image_size);
        println!("シード: {}", self.training.seed);
        println!("\n--- モデル設定 ---");
        let names: Vec<&str> = self.model.backbones.iter().map(|b| b.display_name()).collect();
        println!("バックボーン: {}", names.join(", "));
        match &self.model.pretrained_dir {
            Some(dir) => println!("事前学習済み重み: {}", dir.display()),
            None => println!("事前学習済み重み: なし（ランダム初期化）"),
        }
        println!("幅の縮小率: 1/{}", self.model.width_divisor);
        println!(
            "ドロップアウト率: {} / {}",
            self.model.dropout, self.model.head_dropout
        );
        println!("隠れ層ユニット数: {}", self.model.hidden_units);
        println!("\n出力先: {}", self.output_dir.display());
        println!("========================\n");
    }
}
