//! 画像の前処理
//!
//! 学習時と同じ手順で入力画像をテンソルに変換します:
//! デコード -> RGB化 -> 224x224にリサイズ（縦横比は保持しない）
//! -> [0,1]にスケール -> ImageNetの平均・標準偏差で正規化 -> バッチ次元を追加

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};

use crate::error::{ClassifierError, Result};
use crate::ml::IMAGE_SIZE;

/// ImageNetの平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 推論対象の画像
#[derive(Debug, Clone)]
pub enum ImageSource<'a> {
    /// 画像ファイルのパス
    Path(Cow<'a, Path>),
    /// エンコード済み画像のバイト列（PNG, JPEGなど）
    Bytes(Cow<'a, [u8]>),
}

impl ImageSource<'static> {
    /// base64文字列から作成（`data:image/...;base64,` 形式も可）
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let payload = match encoded.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded,
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| ClassifierError::InvalidInput(format!("invalid base64 image: {}", e)))?;
        Ok(Self::Bytes(Cow::Owned(bytes)))
    }
}

impl ImageSource<'_> {
    /// 画像をデコード
    pub fn decode(&self) -> Result<DynamicImage> {
        match self {
            ImageSource::Path(path) => image::open(path).map_err(ClassifierError::ImageDecode),
            ImageSource::Bytes(bytes) => {
                image::load_from_memory(bytes).map_err(ClassifierError::ImageDecode)
            }
        }
    }
}

impl<'a> From<&'a Path> for ImageSource<'a> {
    fn from(path: &'a Path) -> Self {
        ImageSource::Path(Cow::Borrowed(path))
    }
}

impl From<PathBuf> for ImageSource<'static> {
    fn from(path: PathBuf) -> Self {
        ImageSource::Path(Cow::Owned(path))
    }
}

impl<'a> From<&'a PathBuf> for ImageSource<'a> {
    fn from(path: &'a PathBuf) -> Self {
        ImageSource::Path(Cow::Borrowed(path.as_path()))
    }
}

impl<'a> From<&'a [u8]> for ImageSource<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        ImageSource::Bytes(Cow::Borrowed(bytes))
    }
}

impl From<Vec<u8>> for ImageSource<'static> {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(Cow::Owned(bytes))
    }
}

/// 画像前処理
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self {
            image_size: IMAGE_SIZE as u32,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl ImagePreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 出力画像サイズ（正方形）
    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    /// RGB化してリサイズ
    pub fn resize(&self, image: &DynamicImage) -> RgbImage {
        let rgb = image.to_rgb8();
        image::imageops::resize(&rgb, self.image_size, self.image_size, FilterType::Triangle)
    }

    /// 正規化されたRGB画像データ (C, H, W) の順で平坦化
    pub fn normalize(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let mut data = Vec::with_capacity(3 * (width * height) as usize);

        for channel in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let pixel = image.get_pixel(x, y);
                    let value = pixel[channel] as f32 / 255.0;
                    data.push((value - self.mean[channel]) / self.std[channel]);
                }
            }
        }

        data
    }

    /// デコード済み画像をテンソル [1, 3, 224, 224] に変換
    pub fn image_to_tensor<B: Backend>(&self, image: &DynamicImage, device: &B::Device) -> Tensor<B, 4> {
        let size = self.image_size();
        let data = self.normalize(&self.resize(image));

        Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([1, 3, size, size])
    }

    /// 画像ソースをデコードしてテンソルに変換
    pub fn preprocess<B: Backend>(&self, source: &ImageSource<'_>, device: &B::Device) -> Result<Tensor<B, 4>> {
        let image = source.decode()?;
        Ok(self.image_to_tensor(&image, device))
    }
}
