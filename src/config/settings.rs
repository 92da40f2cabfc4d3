//! Bus settings loaded from a JSON file.

use super::XdgDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Settings file not found: {0}")]
    NotFound(PathBuf),
}

/// Tunables for one bus instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Deepest allowed hierarchy level (root = 0).
    pub max_depth: usize,

    /// Per-owner resource ceiling consulted before plugin creation.
    pub resource_ceiling: u64,

    /// Hop limit for ancestor-chain walks.
    pub max_traversal_depth: usize,

    /// Default bound for readiness waits.
    pub ready_timeout_ms: u64,

    /// Topics declared parallel-safe in addition to the built-in list.
    pub parallel_safe_topics: Vec<String>,

    /// Honour the per-message `parallel_safe` flag in batch dispatch.
    pub trust_parallel_flag: bool,

    /// Route `IntentRequest` messages published on the bus through the intent router.
    pub route_inbound_intents: bool,

    /// Number of recent intents kept for stats.
    pub intent_history_limit: usize,

    /// Buffer size for channel transports created from these settings.
    pub channel_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_depth: 10,
            resource_ceiling: 100,
            max_traversal_depth: 100,
            ready_timeout_ms: 30_000,
            parallel_safe_topics: Vec::new(),
            trust_parallel_flag: true,
            route_inbound_intents: true,
            intent_history_limit: 200,
            channel_capacity: 256,
        }
    }
}

impl BusSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default path: `$XDG_CONFIG_HOME/plugbus/settings.json`
    pub fn default_path() -> PathBuf {
        XdgDirs::new().settings_file()
    }

    /// Load from the default path.
    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load_from_path(&Self::default_path())
    }

    /// Load from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Err(SettingsError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let settings: BusSettings = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded bus settings");
        Ok(settings)
    }

    /// Load from the default path, falling back to defaults.
    pub fn load_or_default() -> Self {
        match Self::load_default() {
            Ok(settings) => settings,
            Err(SettingsError::NotFound(_)) => Self::default(),
            Err(e) => {
                warn!("Ignoring unreadable settings: {}", e);
                Self::default()
            }
        }
    }

    /// Write to a specific path, creating parent directories.
    pub fn save_to_path(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_resource_ceiling(mut self, ceiling: u64) -> Self {
        self.resource_ceiling = ceiling;
        self
    }

    pub fn with_ready_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.ready_timeout_ms = timeout_ms;
        self
    }

    pub fn with_parallel_safe_topic(mut self, topic: impl Into<String>) -> Self {
        self.parallel_safe_topics.push(topic.into());
        self
    }
}
