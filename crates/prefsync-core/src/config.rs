//! Sync configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::DEFAULT_SETTINGS_PATH;

/// Default debounce window for batching local changes
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Runtime configuration of a sync node.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long to wait after the latest local change before flushing
    pub debounce_ms: u64,
    /// Settings root path on the PAN
    pub settings_path: String,
    /// Ask the transport to deliver puts without its usual batching delay
    pub urgent: bool,
    /// Named preference store to sync instead of the default one
    pub store_name: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            settings_path: DEFAULT_SETTINGS_PATH.to_string(),
            urgent: true,
            store_name: None,
        }
    }
}

impl SyncConfig {
    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: SyncConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the coordinator cannot work with
    pub fn validate(&self) -> SyncResult<()> {
        if !self.settings_path.starts_with('/') {
            return Err(SyncError::Config(format!(
                "settings_path must be absolute, got '{}'",
                self.settings_path
            )));
        }
        if self.settings_path.len() > 1 && self.settings_path.ends_with('/') {
            return Err(SyncError::Config(
                "settings_path must not end with '/'".to_string(),
            ));
        }
        if matches!(self.store_name.as_deref(), Some("")) {
            return Err(SyncError::Config("store_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Debounce window as a duration
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = Some(store_name.into());
        self
    }
}
