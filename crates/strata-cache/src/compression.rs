//! Image re-encoding and blob compression for the media cache

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, GenericImageView};
use tracing::debug;

use crate::{
    config::MediaSettings,
    error::{CacheError, Result},
};

const THUMBNAIL_QUALITIES: [u8; 3] = [80, 60, 40];

/// Re-encodes images to bounded dimensions and quality
#[derive(Debug, Clone)]
pub struct ImageCompressor {
    settings: MediaSettings,
}

impl ImageCompressor {
    pub fn new(settings: MediaSettings) -> Self {
        Self { settings }
    }

    /// Downscale and re-encode `bytes` as JPEG for storage
    ///
    /// Images above the large-image pixel count get the lower quality setting.
    pub fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let image = decode(bytes)?;
        let (width, height) = image.dimensions();
        let quality = if u64::from(width) * u64::from(height) > self.settings.large_image_pixels {
            self.settings.large_image_jpeg_quality
        } else {
            self.settings.jpeg_quality
        };

        let max_dimension = self.settings.max_image_dimension;
        let image = if width > max_dimension || height > max_dimension {
            image.resize(
                max_dimension,
                max_dimension,
                image::imageops::FilterType::Triangle,
            )
        } else {
            image
        };

        let encoded = encode_jpeg(&image, quality)?;
        debug!(
            original_bytes = bytes.len(),
            compressed_bytes = encoded.len(),
            quality,
            "Compressed image"
        );
        Ok(encoded)
    }

    /// Produce a small JPEG thumbnail, lowering quality until it fits the byte limit
    ///
    /// If even the lowest quality is too large the smallest encoding is returned.
    pub fn thumbnail(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let dimension = self.settings.thumbnail_dimension;
        let thumbnail = decode(bytes)?.thumbnail(dimension, dimension);

        let mut smallest: Option<Vec<u8>> = None;
        for quality in THUMBNAIL_QUALITIES {
            let encoded = encode_jpeg(&thumbnail, quality)?;
            if encoded.len() as u64 <= self.settings.thumbnail_max_bytes {
                return Ok(encoded);
            }
            smallest = Some(encoded);
        }
        smallest.ok_or_else(|| CacheError::InvalidImage {
            message: "thumbnail encoding produced no output".to_string(),
        })
    }
}

fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|err| CacheError::InvalidImage {
        message: err.to_string(),
    })
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality).encode_image(&rgb)?;
    Ok(encoded)
}

/// Gzip `bytes`
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Inflate gzip data produced by [`gzip`]
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|err| CacheError::Decode {
            message: err.to_string(),
        })?;
    Ok(decoded)
}
