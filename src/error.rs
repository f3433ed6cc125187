/// Error types for the badge kiosk
///
/// Every step of the flow recovers its own errors and shows them to the
/// user; none of these end the application.
use thiserror::Error;

use crate::device::camera::CameraError;
use crate::device::photo::PhotoError;
use crate::state::store::StoreError;

/// Errors raised by the badge-issuance flow
#[derive(Error, Debug)]
pub enum BadgeError {
    #[error("Please enter the participant's name.")]
    Validation,

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("Badge limit ({max}) reached for this device.")]
    CapReached { max: usize },

    #[error("Registration session expired. Please scan again.")]
    SessionExpired,

    #[error("Please capture a photo first.")]
    MissingPhoto,

    #[error("Participant name is missing. Please go back.")]
    MissingName,

    #[error("Stored badge data under `{key}` is corrupt: {reason}")]
    StorageCorrupt { key: String, reason: String },

    #[error("Badge storage is unavailable: {0}")]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Photo(#[from] PhotoError),
}

impl BadgeError {
    pub fn corrupt(key: &str, reason: impl ToString) -> Self {
        BadgeError::StorageCorrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the user must explicitly reset storage before continuing
    pub fn is_corrupt_storage(&self) -> bool {
        matches!(self, BadgeError::StorageCorrupt { .. })
    }

    /// Storage key holding the unreadable data, if any
    pub fn corrupt_key(&self) -> Option<&str> {
        match self {
            BadgeError::StorageCorrupt { key, .. } => Some(key.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_user_readable() {
        assert_eq!(
            BadgeError::CapReached { max: 5 }.to_string(),
            "Badge limit (5) reached for this device."
        );
        assert_eq!(
            BadgeError::Camera(CameraError::NotFound).to_string(),
            "No camera found on this device."
        );
    }

    #[test]
    fn test_corrupt_helper() {
        let err = BadgeError::corrupt("badges", "expected value at line 1 column 1");
        assert!(err.is_corrupt_storage());
        assert!(err.to_string().contains("`badges`"));
        assert_eq!(err.corrupt_key(), Some("badges"));
        assert!(!BadgeError::MissingPhoto.is_corrupt_storage());
        assert_eq!(BadgeError::MissingPhoto.corrupt_key(), None);
    }
}
