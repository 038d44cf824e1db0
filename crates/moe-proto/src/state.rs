use crate::protocol::Channel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// User preferences persisted between runs.  Every field has a default so a
/// partial or missing file loads as a complete record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Preferences {
    pub volume: u8,
    pub enable_autoplay: bool,
    pub enable_notifications: bool,
    pub enable_event_notifications: bool,
    pub radio_type: Channel,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            volume: 50,
            enable_autoplay: false,
            enable_notifications: true,
            enable_event_notifications: true,
            radio_type: Channel::Jpop,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("preferences io: {0}")]
    Io(#[from] std::io::Error),
    #[error("preferences encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Key-value store for [`Preferences`].
pub trait Storage: Send + Sync {
    /// Never fails: unreadable or missing data yields defaults.
    fn load(&self) -> Preferences;
    fn persist(&self, prefs: &Preferences) -> Result<(), StorageError>;
}

/// Preferences as a pretty-printed JSON file.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for JsonFileStorage {
    fn load(&self) -> Preferences {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!("[storage] no preferences at {:?}: {}", self.path, e);
                return Preferences::default();
            }
        };
        match serde_json::from_str::<Preferences>(&content) {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!("[storage] ignoring unreadable preferences {:?}: {}", self.path, e);
                Preferences::default()
            }
        }
    }

    fn persist(&self, prefs: &Preferences) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(prefs)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
