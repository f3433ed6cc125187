use std::{env, path::PathBuf};

use tracing::{info, warn};

/// Text encoded in the organisers' event QR code
pub const DEFAULT_EVENT_CODE: &str = "MITUKI-BADGE-SCAN";

const APP_DIR: &str = "event-badge";
const DB_FILE: &str = "badges.db";
const TETHER_DIR: &str = "tether";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub tether_dir: PathBuf,
    pub event_code: String,
}

/// Values given on the command line; anything missing falls back to the
/// environment, then to defaults.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub tether_dir: Option<PathBuf>,
    pub event_code: Option<String>,
}

impl Config {
    pub fn load(overrides: Overrides) -> Self {
        Self::resolve(overrides, var)
    }

    /// Resolve against `lookup` instead of the process environment
    fn resolve(overrides: Overrides, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = overrides
            .data_dir
            .or_else(|| lookup("BADGE_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let tether_dir = overrides
            .tether_dir
            .or_else(|| lookup("BADGE_TETHER_DIR").map(PathBuf::from))
            .unwrap_or_else(|| data_dir.join(TETHER_DIR));

        let event_code = overrides
            .event_code
            .or_else(|| lookup("BADGE_EVENT_CODE"))
            .unwrap_or_else(|| {
                info!("BADGE_EVENT_CODE not set, using default: {DEFAULT_EVENT_CODE}");
                DEFAULT_EVENT_CODE.to_string()
            });

        Self {
            data_dir,
            tether_dir,
            event_code,
        }
    }

    /// Location of the SQLite badge store
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}

fn var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Ok(_) => {
            warn!("{key} is empty, ignoring it");
            None
        }
        Err(_) => None,
    }
}

/// The user's data directory:
/// - Linux: ~/.local/share/event-badge
/// - macOS: ~/Library/Application Support/event-badge
/// - Windows: %APPDATA%\event-badge
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}
