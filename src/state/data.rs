/// Shared data structures for the badge store
///
/// These structs represent the data model that flows between
/// the storage layer and the UI layer.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::photo::Photo;

/// Most badges a single device may issue
pub const MAX_BADGES_PER_DEVICE: usize = 5;

/// Number given to the first badge issued on a device
pub const STARTING_BADGE_NUMBER: u32 = 2520;

/// Prefix of the printed badge identifier (GR2520, GR2521, ...)
pub const BADGE_ID_PREFIX: &str = "GR";

/// Derive the printed identifier from a badge number
pub fn badge_id_for(badge_number: u32) -> String {
    format!("{BADGE_ID_PREFIX}{badge_number}")
}

/// One issued badge. Never modified after issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredBadge", into = "StoredBadge")]
pub struct BadgeRecord {
    participant_name: String,
    badge_number: u32,
    photo: Photo,
    issued_at: DateTime<Utc>,
}

impl BadgeRecord {
    /// Build a record. The name is trimmed and must not be empty.
    pub fn new(
        participant_name: &str,
        badge_number: u32,
        photo: Photo,
        issued_at: DateTime<Utc>,
    ) -> Option<Self> {
        let participant_name = participant_name.trim();
        if participant_name.is_empty() {
            return None;
        }
        Some(Self {
            participant_name: participant_name.to_string(),
            badge_number,
            photo,
            issued_at,
        })
    }

    pub fn participant_name(&self) -> &str {
        &self.participant_name
    }

    pub fn badge_number(&self) -> u32 {
        self.badge_number
    }

    /// Printed identifier, always recomputed from the number
    pub fn badge_id(&self) -> String {
        badge_id_for(self.badge_number)
    }

    pub fn photo(&self) -> &Photo {
        &self.photo
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Text encoded in the badge's own QR code
    pub fn qr_payload(&self) -> String {
        let payload = QrPayload {
            name: &self.participant_name,
            badge_id: self.badge_id(),
        };
        // Serializing two string fields cannot fail
        serde_json::to_string(&payload).unwrap_or_default()
    }
}

#[derive(Serialize)]
struct QrPayload<'a> {
    name: &'a str,
    #[serde(rename = "badgeId")]
    badge_id: String,
}

/// On-disk shape of a badge record
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredBadge {
    name: String,
    badge_id: String,
    badge_number: u32,
    #[serde(rename = "photoDataUrl")]
    photo: Photo,
    #[serde(rename = "timestamp")]
    issued_at: DateTime<Utc>,
}

impl TryFrom<StoredBadge> for BadgeRecord {
    type Error = String;

    fn try_from(stored: StoredBadge) -> Result<Self, Self::Error> {
        let expected = badge_id_for(stored.badge_number);
        if stored.badge_id != expected {
            return Err(format!(
                "badge id {} does not match badge number {}",
                stored.badge_id, stored.badge_number
            ));
        }
        BadgeRecord::new(&stored.name, stored.badge_number, stored.photo, stored.issued_at)
            .ok_or_else(|| format!("badge {expected} has an empty participant name"))
    }
}

impl From<BadgeRecord> for StoredBadge {
    fn from(record: BadgeRecord) -> Self {
        StoredBadge {
            badge_id: record.badge_id(),
            name: record.participant_name,
            badge_number: record.badge_number,
            photo: record.photo,
            issued_at: record.issued_at,
        }
    }
}
