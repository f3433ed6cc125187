/// Badge photo handling
///
/// Captured frames are downscaled and embedded in the badge record as a
/// PNG data URL, so a record carries its photo inline rather than by path.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Largest edge of an embedded photo
const MAX_PHOTO_EDGE: u32 = 512;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Placeholder colour, used when a stored photo cannot be shown
const PLACEHOLDER_COLOR: Rgb<u8> = Rgb([0x00, 0x33, 0x66]);
const PLACEHOLDER_SIZE: u32 = 100;

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("Failed to encode photo: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Stored photo is not a base64 data URL")]
    NotDataUrl,

    #[error("Stored photo could not be decoded: {0}")]
    Decode(String),
}

/// An image embedded in a badge record as a data URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Photo {
    data_url: String,
}

impl Photo {
    /// Downscale a captured frame and embed it as PNG
    pub fn from_frame(frame: &DynamicImage) -> Result<Self, PhotoError> {
        let optimized = optimize(frame, MAX_PHOTO_EDGE, MAX_PHOTO_EDGE);

        let mut png = Cursor::new(Vec::new());
        optimized
            .write_to(&mut png, ImageFormat::Png)
            .map_err(PhotoError::Encode)?;

        Ok(Self {
            data_url: format!("{DATA_URL_PREFIX}{}", STANDARD.encode(png.into_inner())),
        })
    }

    /// Wrap an existing data URL without validating it
    #[cfg(test)]
    pub fn from_data_url(data_url: impl Into<String>) -> Self {
        Self {
            data_url: data_url.into(),
        }
    }

    pub fn data_url(&self) -> &str {
        &self.data_url
    }

    /// Raw encoded image bytes behind the data URL
    pub fn bytes(&self) -> Result<Vec<u8>, PhotoError> {
        let (header, payload) = self
            .data_url
            .split_once(',')
            .ok_or(PhotoError::NotDataUrl)?;
        if !header.starts_with("data:image/") || !header.ends_with(";base64") {
            return Err(PhotoError::NotDataUrl);
        }
        STANDARD
            .decode(payload)
            .map_err(|e| PhotoError::Decode(e.to_string()))
    }

    pub fn decode(&self) -> Result<DynamicImage, PhotoError> {
        let bytes = self.bytes()?;
        image::load_from_memory(&bytes).map_err(|e| PhotoError::Decode(e.to_string()))
    }
}

/// Fit an image inside `max_width` x `max_height`, keeping its aspect ratio.
/// Images that already fit are returned unchanged.
pub fn optimize(frame: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if frame.width() <= max_width && frame.height() <= max_height {
        return frame.clone();
    }
    frame.resize(max_width, max_height, FilterType::Lanczos3)
}

/// Solid placeholder shown in place of an unreadable photo
pub fn placeholder() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(
        PLACEHOLDER_SIZE,
        PLACEHOLDER_SIZE,
        PLACEHOLDER_COLOR,
    ))
}
