use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::data::{BadgeRecord, MAX_BADGES_PER_DEVICE, STARTING_BADGE_NUMBER};
use super::store::KeyValueStore;
use crate::device::photo::Photo;
use crate::error::BadgeError;

/// Key of the JSON array of issued badges
pub const BADGES_KEY: &str = "badges";
/// Key of the cached last issued badge number
pub const LAST_BADGE_NUMBER_KEY: &str = "last_badge_number";

/// The BadgeLedger owns the device's badge collection.
///
/// It is the single place that reads and writes the collection and the
/// last-number cursor, and `issue` is the only operation that adds a badge.
#[derive(Debug)]
pub struct BadgeLedger<S> {
    store: S,
}

impl<S: KeyValueStore> BadgeLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read every issued badge, in issuance order.
    /// A missing key is an empty collection; unparseable text is corrupt.
    pub fn load(&self) -> Result<Vec<BadgeRecord>, BadgeError> {
        match self.store.get(BADGES_KEY)? {
            None => Ok(Vec::new()),
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                warn!(error = %e, "stored badge collection is corrupt");
                BadgeError::corrupt(BADGES_KEY, e)
            }),
        }
    }

    /// The cached cursor, if one has been written
    pub fn last_issued_number(&self) -> Result<Option<u32>, BadgeError> {
        match self.store.get(LAST_BADGE_NUMBER_KEY)? {
            None => Ok(None),
            Some(text) => text.trim().parse::<u32>().map(Some).map_err(|e| {
                warn!(value = %text, "stored last badge number is corrupt");
                BadgeError::corrupt(LAST_BADGE_NUMBER_KEY, e)
            }),
        }
    }

    pub fn count(&self) -> Result<usize, BadgeError> {
        Ok(self.load()?.len())
    }

    /// Fail with `CapReached` once the device holds the maximum number of
    /// badges. Every gate in the flow goes through this check.
    pub fn ensure_capacity(&self) -> Result<(), BadgeError> {
        check_capacity(self.count()?)
    }

    pub fn is_full(&self) -> Result<bool, BadgeError> {
        match self.ensure_capacity() {
            Ok(()) => Ok(false),
            Err(BadgeError::CapReached { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Number the next badge will receive
    pub fn next_badge_number(&self) -> Result<u32, BadgeError> {
        let records = self.load()?;
        next_number(&records, self.last_issued_number()?)
    }

    /// Issue a new badge: the single authoritative write point.
    ///
    /// The cap is re-checked against freshly read storage, then the
    /// collection and the cursor are written together in one transaction.
    pub fn issue(
        &mut self,
        participant_name: &str,
        photo: Photo,
        issued_at: DateTime<Utc>,
    ) -> Result<BadgeRecord, BadgeError> {
        let mut records = self.load()?;
        check_capacity(records.len())?;

        let badge_number = next_number(&records, self.last_issued_number()?)?;
        let record = BadgeRecord::new(participant_name, badge_number, photo, issued_at)
            .ok_or(BadgeError::MissingName)?;

        records.push(record.clone());
        let json = serde_json::to_string(&records)
            .map_err(|e| BadgeError::corrupt(BADGES_KEY, e))?;
        let cursor = badge_number.to_string();

        self.store
            .set_many(&[(BADGES_KEY, json.as_str()), (LAST_BADGE_NUMBER_KEY, cursor.as_str())])?;

        info!(
            badge_id = %record.badge_id(),
            issued = records.len(),
            max = MAX_BADGES_PER_DEVICE,
            "badge issued"
        );
        Ok(record)
    }

    /// The badge with the highest number, if any
    pub fn latest(&self) -> Result<Option<BadgeRecord>, BadgeError> {
        let records = self.load()?;
        Ok(select_latest(&records).cloned())
    }

    /// Guided recovery after corruption, only ever triggered by an explicit
    /// user action. A readable collection is kept and the cursor is rebuilt
    /// from its highest number; an unreadable one is removed with the cursor.
    pub fn reset(&mut self) -> Result<(), BadgeError> {
        let records = match self.load() {
            Ok(records) => records,
            Err(e) if e.is_corrupt_storage() => {
                warn!("badge storage reset requested, removing all badges");
                self.store.remove(BADGES_KEY)?;
                self.store.remove(LAST_BADGE_NUMBER_KEY)?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let cursor = self.last_issued_number().ok().flatten();
        match select_latest(&records).map(BadgeRecord::badge_number) {
            Some(highest) if cursor.is_some_and(|c| c >= highest) => {}
            Some(highest) => {
                warn!(highest, "rebuilding last badge number from stored badges");
                self.store.set(LAST_BADGE_NUMBER_KEY, &highest.to_string())?;
            }
            None => self.store.remove(LAST_BADGE_NUMBER_KEY)?,
        }
        Ok(())
    }
}

fn check_capacity(count: usize) -> Result<(), BadgeError> {
    if count >= MAX_BADGES_PER_DEVICE {
        return Err(BadgeError::CapReached {
            max: MAX_BADGES_PER_DEVICE,
        });
    }
    Ok(())
}

/// Next badge number from the cursor, validated against the collection
fn next_number(records: &[BadgeRecord], cursor: Option<u32>) -> Result<u32, BadgeError> {
    let highest = records.iter().map(BadgeRecord::badge_number).max();

    match (cursor, highest) {
        (None, None) => Ok(STARTING_BADGE_NUMBER),
        (None, Some(highest)) => Err(BadgeError::corrupt(
            LAST_BADGE_NUMBER_KEY,
            format!("missing while badges up to {highest} exist"),
        )),
        (Some(cursor), Some(highest)) if cursor < highest => Err(BadgeError::corrupt(
            LAST_BADGE_NUMBER_KEY,
            format!("cursor {cursor} is behind issued badge {highest}"),
        )),
        (Some(cursor), _) => cursor
            .checked_add(1)
            .ok_or_else(|| BadgeError::corrupt(LAST_BADGE_NUMBER_KEY, "badge number overflow")),
    }
}

/// Pick the badge with the highest number, regardless of its position
pub fn select_latest(records: &[BadgeRecord]) -> Option<&BadgeRecord> {
    records.iter().max_by_key(|record| record.badge_number())
}
