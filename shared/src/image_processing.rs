use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageReader, Limits};
use metrics::{counter, histogram};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodingError {
    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("jpeg encoding failed: width={width}, height={height}, reason={reason}")]
    Encode {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("no encoding within {max_bytes} bytes after {iterations} steps (smallest {smallest} bytes)")]
    BudgetExhausted {
        iterations: u32,
        smallest: usize,
        max_bytes: usize,
    },

    #[error("encoding task was cancelled")]
    Cancelled,
}

/// An image as selected by the user or as produced by compression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBlob {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

impl ImageBlob {
    const ALLOWED_EXTENSIONS: [&'static str; 6] = ["jpg", "jpeg", "png", "webp", "gif", "avif"];

    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: None,
            file_name: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowercased extension of the file name if it is a known image type,
    /// `jpg` otherwise.
    pub fn extension(&self) -> &'static str {
        let ext = self
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        ext.and_then(|ext| Self::ALLOWED_EXTENSIONS.into_iter().find(|a| *a == ext))
            .unwrap_or("jpg")
    }

    pub fn content_type_or_default(&self) -> String {
        self.content_type
            .clone()
            .unwrap_or_else(|| format!("image/{}", self.extension()))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub max_image_pixels: u64,
    pub max_input_bytes: usize,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
    /// Byte budget for uploaded photos.
    pub max_output_bytes: usize,
    pub initial_quality: f32,
    pub quality_step: f32,
    pub quality_floor: f32,
    pub scale_ratio: f32,
    pub max_iterations: u32,
    /// Encodes running at once; further calls wait for a slot.
    pub max_concurrent_ops: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_image_pixels: 100_000_000,
            max_input_bytes: 50 * 1024 * 1024,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_dimension: 15_000,
            max_output_bytes: 1024 * 1024,
            initial_quality: 0.92,
            quality_step: 0.1,
            quality_floor: 0.5,
            scale_ratio: 0.85,
            max_iterations: 10,
            max_concurrent_ops: 2,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_output_bytes == 0 {
            return Err("max_output_bytes must be > 0".into());
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.quality_floor)
            || !(self.quality_floor..=1.0).contains(&self.initial_quality)
        {
            return Err("qualities must satisfy 0 <= floor <= initial <= 1".into());
        }
        if self.quality_step <= 0.0 {
            return Err("quality_step must be > 0".into());
        }
        if !(self.scale_ratio > 0.0 && self.scale_ratio < 1.0) {
            return Err("scale_ratio must be in (0, 1)".into());
        }
        if self.max_concurrent_ops == 0 {
            return Err("max_concurrent_ops must be > 0".into());
        }
        Ok(())
    }
}

pub struct ImageProcessor {
    config: CompressionConfig,
    semaphore: Arc<Semaphore>,
}

impl ImageProcessor {
    pub fn new(config: CompressionConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops));
        Self { config, semaphore }
    }

    pub fn with_defaults() -> Self {
        Self::new(CompressionConfig::default())
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Re-encodes `blob` until it fits in `max_bytes`. The encode loop runs
    /// on the blocking pool so the interaction task keeps running.
    #[instrument(skip(self, blob), fields(input_size = blob.len()))]
    pub async fn compress(
        &self,
        blob: ImageBlob,
        max_bytes: usize,
    ) -> Result<ImageBlob, EncodingError> {
        if blob.len() <= max_bytes {
            counter!("image.compress.passthrough").increment(1);
            return Ok(blob);
        }

        let start = Instant::now();
        counter!("image.compress.requests").increment(1);

        // waits for a slot; overlapping attaches queue up instead of failing
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EncodingError::Cancelled)?;

        let config = self.config.clone();
        let result =
            tokio::task::spawn_blocking(move || Self::compress_sync(&config, &blob, max_bytes))
                .await
                .map_err(|_| EncodingError::Cancelled)?;

        histogram!("image.compress.duration_ms").record(start.elapsed().as_millis() as f64);

        match &result {
            Ok(data) => {
                histogram!("image.compress.output_size").record(data.len() as f64);
            }
            Err(e) => {
                counter!("image.compress.errors").increment(1);
                warn!(error = %e, "compress failed");
            }
        }

        result
    }

    fn compress_sync(
        config: &CompressionConfig,
        blob: &ImageBlob,
        max_bytes: usize,
    ) -> Result<ImageBlob, EncodingError> {
        if blob.len() <= max_bytes {
            return Ok(blob.clone());
        }

        let original = decode_image(config, &blob.bytes)?;
        let (mut width, mut height) = original.dimensions();
        let mut scaled: Option<DynamicImage> = None;
        let mut quality = config.initial_quality;
        let mut smallest = usize::MAX;

        for iteration in 1..=config.max_iterations {
            let frame = scaled.as_ref().unwrap_or(&original);
            let encoded = encode_jpeg(frame, quality)?;
            debug!(iteration, quality, width, height, size = encoded.len(), "encode step");

            if encoded.len() <= max_bytes {
                return Ok(ImageBlob {
                    bytes: Bytes::from(encoded),
                    content_type: Some("image/jpeg".into()),
                    file_name: Some(jpeg_file_name(blob.file_name.as_deref())),
                });
            }
            smallest = smallest.min(encoded.len());

            if quality - config.quality_floor > f32::EPSILON {
                quality = (quality - config.quality_step).max(config.quality_floor);
            } else if width > 1 || height > 1 {
                width = shrink(width, config.scale_ratio);
                height = shrink(height, config.scale_ratio);
                scaled = Some(original.resize_exact(
                    width,
                    height,
                    image::imageops::FilterType::Triangle,
                ));
            }
        }

        Err(EncodingError::BudgetExhausted {
            iterations: config.max_iterations,
            smallest,
            max_bytes,
        })
    }
}

fn shrink(dimension: u32, ratio: f32) -> u32 {
    ((dimension as f32 * ratio).round() as u32).max(1)
}

fn jpeg_file_name(source: Option<&str>) -> String {
    let stem = source
        .map(|name| name.rsplit_once('.').map_or(name, |(stem, _)| stem))
        .filter(|stem| !stem.is_empty())
        .unwrap_or("photo");
    format!("{stem}.jpg")
}

fn decode_image(
    config: &CompressionConfig,
    raw_bytes: &[u8],
) -> Result<DynamicImage, EncodingError> {
    if raw_bytes.is_empty() {
        return Err(EncodingError::EmptyInput);
    }

    if raw_bytes.len() > config.max_input_bytes {
        return Err(EncodingError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: config.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| EncodingError::Decode(e.to_string()))?;

    if reader.format().is_none() {
        return Err(EncodingError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader
        .decode()
        .map_err(|e| EncodingError::Decode(e.to_string()))?;
    let (w, h) = img.dimensions();
    let pixels = w as u64 * h as u64;

    if pixels > config.max_image_pixels {
        return Err(EncodingError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    Ok(img)
}

fn encode_jpeg(img: &DynamicImage, quality: f32) -> Result<Vec<u8>, EncodingError> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();

    if width == 0 || height == 0 {
        return Err(EncodingError::Encode {
            width,
            height,
            reason: "zero dimension".into(),
        });
    }

    let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
    let mut buffer = Vec::with_capacity((width * height * 3) as usize / 10);
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);

    encoder
        .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| EncodingError::Encode {
            width,
            height,
            reason: e.to_string(),
        })?;

    if buffer.len() < 2 || buffer[0..2] != [0xFF, 0xD8] {
        return Err(EncodingError::Encode {
            width,
            height,
            reason: "invalid jpeg magic bytes".into(),
        });
    }

    Ok(buffer)
}
