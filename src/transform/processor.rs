use super::ImageTransform;
use crate::models::TargetFormat;
use crate::{Error, Result};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

pub struct ImageProcessor {
    jpeg_quality: u8,
}

impl ImageProcessor {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    fn decode(image: &[u8]) -> Result<(DynamicImage, TargetFormat)> {
        let format = match image::guess_format(image)? {
            ImageFormat::Jpeg => TargetFormat::Jpeg,
            ImageFormat::Png => TargetFormat::Png,
            other => return Err(Error::UnsupportedFormat(format!("{:?}", other))),
        };
        let decoded = image::load_from_memory_with_format(image, format.image_format())?;
        Ok((decoded, format))
    }

    fn encode(image: &DynamicImage, format: TargetFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let mut cursor = Cursor::new(&mut bytes);

        match format {
            TargetFormat::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut cursor, jpeg_quality))?;
            }
            TargetFormat::Png => {
                image.write_with_encoder(PngEncoder::new_with_quality(
                    &mut cursor,
                    CompressionType::Best,
                    PngFilter::Adaptive,
                ))?;
            }
        }

        Ok(bytes)
    }

    fn compress_sync(image: Vec<u8>, width: u32, jpeg_quality: u8) -> Result<Vec<u8>> {
        let (decoded, format) = Self::decode(&image)?;

        let resized = if width > 0 && width < decoded.width() {
            let height = (u64::from(decoded.height()) * u64::from(width)
                / u64::from(decoded.width()))
            .max(1) as u32;
            decoded.resize_exact(width, height, FilterType::Lanczos3)
        } else {
            decoded
        };

        Self::encode(&resized, format, jpeg_quality)
    }

    fn convert_sync(image: Vec<u8>, target: TargetFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
        let (decoded, _) = Self::decode(&image)?;
        Self::encode(&decoded, target, jpeg_quality)
    }

    async fn run_blocking<F>(task: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<Vec<u8>> + Send + 'static,
    {
        tokio::task::spawn_blocking(task)
            .await
            .map_err(|e| Error::Invariant(format!("Image processing task join error: {}", e)))?
    }
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self::new(75)
    }
}

impl TargetFormat {
    fn image_format(&self) -> ImageFormat {
        match self {
            TargetFormat::Png => ImageFormat::Png,
            TargetFormat::Jpeg => ImageFormat::Jpeg,
        }
    }
}

#[async_trait]
impl ImageTransform for ImageProcessor {
    async fn compress(&self, image: &[u8], width: u32) -> Result<Vec<u8>> {
        let image = image.to_vec();
        let quality = self.jpeg_quality;
        Self::run_blocking(move || Self::compress_sync(image, width, quality)).await
    }

    async fn convert(&self, image: &[u8], target: TargetFormat) -> Result<Vec<u8>> {
        let image = image.to_vec();
        let quality = self.jpeg_quality;
        Self::run_blocking(move || Self::convert_sync(image, target, quality)).await
    }
}
