use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use std::io::Cursor;

use crate::core::errors::{PipelineError, PipelineResult};

/// Upper bound on an image's size before it goes upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeLimit {
    /// Longest edge in pixels
    LongSide(u32),
    /// Total pixel count (GPU budgets are expressed this way)
    Pixels(u64),
}

impl SizeLimit {
    /// Dimensions to shrink `width × height` to, or `None` when it already fits.
    /// Aspect ratio is kept and neither side drops below 1.
    pub fn target(self, width: u32, height: u32) -> Option<(u32, u32)> {
        let scale = match self {
            SizeLimit::LongSide(max) => {
                let long = width.max(height);
                if long <= max {
                    return None;
                }
                max as f64 / long as f64
            }
            SizeLimit::Pixels(max) => {
                let pixels = width as u64 * height as u64;
                if pixels <= max {
                    return None;
                }
                (max as f64 / pixels as f64).sqrt()
            }
        };
        let shrink = |side: u32| ((side as f64 * scale).floor() as u32).max(1);
        Some((shrink(width), shrink(height)))
    }
}

/// An input image ready to be sent upstream
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub width: u32,
    pub height: u32,
    /// Whether the image was downscaled and re-encoded
    pub scaled: bool,
}

impl PreparedImage {
    pub fn data_uri(&self) -> String {
        to_data_uri(&self.bytes, self.content_type)
    }
}

/// `data:<type>;base64,<payload>`
pub fn to_data_uri(bytes: &[u8], content_type: &str) -> String {
    format!(
        "data:{};base64,{}",
        content_type,
        general_purpose::STANDARD.encode(bytes)
    )
}

pub fn mime_for(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "image/png",
        ImageFormat::Jpeg => "image/jpeg",
        ImageFormat::WebP => "image/webp",
        ImageFormat::Gif => "image/gif",
        ImageFormat::Bmp => "image/bmp",
        ImageFormat::Tiff => "image/tiff",
        _ => "application/octet-stream",
    }
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}

pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg_bytes = Vec::new();
    let rgb = img.to_rgb8();
    JpegEncoder::new_with_quality(&mut jpeg_bytes, quality.clamp(1, 100))
        .encode_image(&rgb)
        .context("Failed to encode image as JPEG")?;
    Ok(jpeg_bytes)
}

/// Decode an image supplied by the caller. Unreadable bytes are the caller's
/// fault and surface as `UnreadableImage`.
pub fn decode_input(bytes: &[u8]) -> PipelineResult<(ImageFormat, DynamicImage)> {
    let format = image::guess_format(bytes).map_err(PipelineError::UnreadableImage)?;
    let img = image::load_from_memory_with_format(bytes, format).map_err(PipelineError::UnreadableImage)?;
    Ok((format, img))
}

/// Shrink `img` to fit `limit`; images already within it are returned as is
pub fn shrink_to(img: DynamicImage, limit: SizeLimit) -> DynamicImage {
    let (width, height) = img.dimensions();
    match limit.target(width, height) {
        Some((w, h)) => img.resize_exact(w, h, FilterType::Lanczos3),
        None => img,
    }
}

/// Decode `bytes`; if the image exceeds `limit`, downscale (aspect kept)
/// and re-encode as JPEG at `quality`, otherwise pass the bytes through
pub fn prescale(bytes: Vec<u8>, limit: SizeLimit, quality: u8) -> PipelineResult<PreparedImage> {
    let (format, img) = decode_input(&bytes)?;
    let (width, height) = img.dimensions();

    if limit.target(width, height).is_none() {
        return Ok(PreparedImage {
            bytes,
            content_type: mime_for(format),
            width,
            height,
            scaled: false,
        });
    }

    let resized = shrink_to(img, limit);
    let (width, height) = resized.dimensions();
    Ok(PreparedImage {
        bytes: encode_jpeg(&resized, quality).map_err(PipelineError::Image)?,
        content_type: "image/jpeg",
        width,
        height,
        scaled: true,
    })
}

/// [`prescale`] on the blocking pool
pub async fn prescale_async(bytes: Vec<u8>, limit: SizeLimit, quality: u8) -> PipelineResult<PreparedImage> {
    tokio::task::spawn_blocking(move || prescale(bytes, limit, quality))
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
}
