/// Device collaborators of the kiosk
///
/// This module handles:
/// - Camera streams and still capture from the tether folder
/// - QR decoding (scan gate) and encoding (badges, event code)
/// - Embedding captured photos into badge records

pub mod camera;
pub mod photo;
pub mod qr;
