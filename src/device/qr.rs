/// QR code services
///
/// Decoding reads the event code off camera frames at the scan gate;
/// encoding draws the per-participant badge code and the printable event
/// code handed to the organisers.
use image::{DynamicImage, GrayImage, Luma};
use qrcode::{Color, EcLevel, QrCode};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use super::camera::CameraError;

/// Badge QR codes: 128px, medium error correction
pub const BADGE_QR_SIZE: u32 = 128;
pub const BADGE_QR_LEVEL: EcLevel = EcLevel::M;

/// Printable event code: 512px, high error correction, 2-module margin
pub const EVENT_QR_SIZE: u32 = 512;
const EVENT_QR_LEVEL: EcLevel = EcLevel::H;
const EVENT_QR_MARGIN: u32 = 2;

#[derive(Error, Debug)]
pub enum QrError {
    #[error("QR encoding failed: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("Failed to write QR image: {0}")]
    Write(#[from] image::ImageError),
}

/// Why a scan attempt produced no text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("QR decode failed: {0}")]
    Decode(String),
}

/// QR decode service
pub trait QrDecoder {
    /// `Ok(None)` when the frame holds no QR code at all
    fn decode(&self, frame: &DynamicImage) -> Result<Option<String>, ScanError>;
}

/// QR encode service
pub trait QrEncoder {
    fn render(&self, text: &str, size: u32) -> Result<GrayImage, QrError>;
}

/// Decoder backed by `rqrr`
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDecoder;

impl QrDecoder for RqrrDecoder {
    fn decode(&self, frame: &DynamicImage) -> Result<Option<String>, ScanError> {
        let luma = frame.to_luma8();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            luma.width() as usize,
            luma.height() as usize,
            |x, y| luma.get_pixel(x as u32, y as u32).0[0],
        );

        let grids = prepared.detect_grids();
        if grids.is_empty() {
            return Ok(None);
        }

        let mut last_error = None;
        for grid in grids {
            match grid.decode() {
                Ok((_meta, content)) => return Ok(Some(content)),
                Err(e) => last_error = Some(format!("{e:?}")),
            }
        }

        let reason = last_error.unwrap_or_else(|| "unreadable code".to_string());
        debug!(%reason, "QR grid found but not decodable");
        Err(ScanError::Decode(reason))
    }
}

/// Encoder backed by `qrcode`
#[derive(Debug, Clone, Copy)]
pub struct QrCodeEncoder {
    level: EcLevel,
    margin: u32,
}

impl QrCodeEncoder {
    pub fn new(level: EcLevel, margin: u32) -> Self {
        Self { level, margin }
    }

    /// Settings used for the badge's own QR code
    pub fn badge() -> Self {
        Self::new(BADGE_QR_LEVEL, 4)
    }

    /// Settings used for the printable event code
    pub fn event() -> Self {
        Self::new(EVENT_QR_LEVEL, EVENT_QR_MARGIN)
    }
}

impl QrEncoder for QrCodeEncoder {
    /// Render black modules on white, scaled to the largest whole module
    /// size that fits `size`, and centered.
    fn render(&self, text: &str, size: u32) -> Result<GrayImage, QrError> {
        let code = QrCode::with_error_correction_level(text.as_bytes(), self.level)?;
        let modules = code.width() as u32;
        let colors = code.to_colors();

        let total_modules = modules + 2 * self.margin;
        let scale = (size / total_modules).max(1);
        let side = (total_modules * scale).max(size);
        let offset = (side - total_modules * scale) / 2 + self.margin * scale;

        let mut img = GrayImage::from_pixel(side, side, Luma([255]));
        for (index, color) in colors.iter().enumerate() {
            if *color != Color::Dark {
                continue;
            }
            let mx = index as u32 % modules;
            let my = index as u32 / modules;
            for dy in 0..scale {
                for dx in 0..scale {
                    img.put_pixel(offset + mx * scale + dx, offset + my * scale + dy, Luma([0]));
                }
            }
        }

        Ok(img)
    }
}

/// Write the printable event code as PNG
pub fn write_event_code(event_code: &str, output: &Path, size: u32) -> Result<(), QrError> {
    let img = QrCodeEncoder::event().render(event_code, size)?;
    img.save(output)?;
    info!(path = %output.display(), size, "event QR code saved");
    Ok(())
}
