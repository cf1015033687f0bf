//! 画像の読み込みと前処理
//!
//! デコード → リサイズ（バイリニア）→ 1/255 スケーリング → (学習時のみ) 明るさ変動。
//! 学習・評価・推論のすべてで同じ関数を通します。

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use rand::Rng;

use crate::error::{ClassifierError, Result};

/// 明るさ変動の範囲
pub const BRIGHTNESS_RANGE: (f32, f32) = (0.8, 1.2);

/// 画像を読み込んで正方形にリサイズ
pub fn load_resized(path: &Path, image_size: usize) -> Result<RgbImage> {
    let img = image::open(path).map_err(|e| ClassifierError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(img
        .resize_exact(image_size as u32, image_size as u32, FilterType::Triangle)
        .to_rgb8())
}

/// [0, 1] に正規化した (C, H, W) 順の画素値
pub fn to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                data.push(pixel[channel] as f32 / 255.0);
            }
        }
    }

    data
}

/// 画像全体に同じ係数を掛ける（値は [0, 1] に収める）
pub fn apply_brightness(data: &mut [f32], factor: f32) {
    for value in data.iter_mut() {
        *value = (*value * factor).clamp(0.0, 1.0);
    }
}

/// 一様分布から明るさ係数を引く
pub fn sample_brightness<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    rng.gen_range(BRIGHTNESS_RANGE.0..=BRIGHTNESS_RANGE.1)
}

/// 画像を読み込んで正規化（オーグメンテーションなし）
pub fn load_and_normalize_image(path: &Path, image_size: usize) -> Result<Vec<f32>> {
    let img = load_resized(path, image_size)?;
    Ok(to_chw(&img))
}
