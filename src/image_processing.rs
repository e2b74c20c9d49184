//! Reference media encoder behind the `MediaStore::Encode` boundary.
//!
//! Images are decoded with hard resource limits, downscaled so neither side
//! exceeds the configured maximum, re-encoded as lossy WebP at reduced
//! quality, and wrapped into a base64 `data:` URL. Videos pass through
//! unchanged apart from the `data:` URL wrapping. Native shells link this
//! crate and call [`prepare_media`] to answer encode requests; the test
//! suite resolves encode effects through it as well.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capabilities::EncodedMedia;
use crate::media::MediaKind;

pub const MAX_SOURCE_BYTES: usize = 50 * 1024 * 1024;
pub const MAX_SOURCE_DIMENSION: u32 = 10_000;
pub const MAX_SOURCE_PIXELS: u64 = 80_000_000;
pub const MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

pub const PROCESSED_MAX_DIMENSION: u32 = 1280;
pub const PROCESSED_WEBP_QUALITY: u8 = 80;

#[derive(Debug, Error)]
pub enum MediaProcessError {
    #[error("input bytes empty")]
    EmptyInput,

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("webp encoding failed: width={width}, height={height}, reason={reason}")]
    WebpEncode {
        width: u32,
        height: u32,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeConfig {
    pub max_dimension: u32,
    pub quality: u8,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            max_dimension: PROCESSED_MAX_DIMENSION,
            quality: PROCESSED_WEBP_QUALITY,
        }
    }
}

/// Turn one raw file into its durable embeddable representation.
pub fn prepare_media(
    kind: MediaKind,
    mime_type: &str,
    data: &[u8],
    config: &EncodeConfig,
) -> Result<EncodedMedia, MediaProcessError> {
    match kind {
        MediaKind::Image => prepare_image(data, config),
        MediaKind::Video => Ok(EncodedMedia {
            mime_type: mime_type.to_string(),
            data_url: to_data_url(mime_type, data),
        }),
    }
}

fn prepare_image(data: &[u8], config: &EncodeConfig) -> Result<EncodedMedia, MediaProcessError> {
    let image = decode_image(data)?;
    let (source_w, source_h) = image.dimensions();

    let image = downscale(image, config.max_dimension);
    let (w, h) = image.dimensions();
    debug!(source_w, source_h, w, h, "image downscaled for embedding");

    let webp = encode_webp_lossy(&image, config.quality)?;
    Ok(EncodedMedia {
        mime_type: "image/webp".into(),
        data_url: to_data_url("image/webp", &webp),
    })
}

fn decode_image(raw_bytes: &[u8]) -> Result<DynamicImage, MediaProcessError> {
    if raw_bytes.is_empty() {
        return Err(MediaProcessError::EmptyInput);
    }

    if raw_bytes.len() > MAX_SOURCE_BYTES {
        return Err(MediaProcessError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: MAX_SOURCE_BYTES,
        });
    }

    let reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;

    if reader.format().is_none() {
        return Err(MediaProcessError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_SOURCE_DIMENSION);
    limits.max_image_height = Some(MAX_SOURCE_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?;
    reader.limits(limits);

    let image = reader.decode()?;
    let (w, h) = image.dimensions();
    let pixels = u64::from(w) * u64::from(h);

    if pixels > MAX_SOURCE_PIXELS {
        return Err(MediaProcessError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: MAX_SOURCE_PIXELS,
        });
    }

    Ok(image)
}

fn downscale(image: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (w, h) = image.dimensions();
    if w.max(h) <= max_dimension {
        return image;
    }
    image.resize(
        max_dimension,
        max_dimension,
        image::imageops::FilterType::Triangle,
    )
}

fn encode_webp_lossy(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, MediaProcessError> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();

    if width == 0 || height == 0 {
        return Err(MediaProcessError::WebpEncode {
            width,
            height,
            reason: "zero dimension".into(),
        });
    }

    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), width, height);
    let memory = encoder
        .encode_simple(false, f32::from(quality))
        .map_err(|e| MediaProcessError::WebpEncode {
            width,
            height,
            reason: format!("{e:?}"),
        })?;
    let buffer = memory.to_vec();

    if buffer.len() < 12 || &buffer[0..4] != b"RIFF" || &buffer[8..12] != b"WEBP" {
        return Err(MediaProcessError::WebpEncode {
            width,
            height,
            reason: "invalid webp magic bytes".into(),
        });
    }

    Ok(buffer)
}

#[must_use]
pub fn to_data_url(mime_type: &str, data: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64.encode(data))
}
