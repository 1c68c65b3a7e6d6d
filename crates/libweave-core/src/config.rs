use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::presence::{DEFAULT_BROADCAST_INTERVAL_MS, DEFAULT_PRESENCE_TIMEOUT_MS};
use crate::resolver::{Strategy, DEFAULT_HISTORY_LIMIT, DEFAULT_HISTORY_NODE_LIMIT};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Sync configuration, usually stored as `weave.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Conflict strategy: "last_write_wins" or "operational_transform"
    pub strategy: Strategy,
    /// Operations kept per node for concurrency detection
    pub history_limit: usize,
    /// Nodes whose history windows are kept; least recently edited go first
    pub history_node_limit: usize,
    /// Drop clock entries of peers silent for this long (off when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_retention_ms: Option<u64>,
    /// Frames buffered in each peer inbound queue
    pub channel_capacity: usize,
    pub presence: PresenceConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_node_limit: DEFAULT_HISTORY_NODE_LIMIT,
            clock_retention_ms: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            presence: PresenceConfig::default(),
        }
    }
}

/// Presence broadcast and expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub timeout_ms: u64,
    pub broadcast_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
        }
    }
}

impl SyncConfig {
    /// Reject values that would stall the worker or disable conflict detection
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.history_limit == 0 {
            return Err(SyncError::Config("history_limit must be at least 1".into()));
        }
        if self.history_node_limit == 0 {
            return Err(SyncError::Config("history_node_limit must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(SyncError::Config("channel_capacity must be at least 1".into()));
        }
        if self.presence.broadcast_interval_ms == 0 {
            return Err(SyncError::Config(
                "presence.broadcast_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Load sync config from `path`; `Ok(None)` when the file does not exist
pub fn load_config(path: &Path) -> Result<Option<SyncConfig>, SyncError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let config: SyncConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(Some(config))
}

/// Save sync config to `path`, creating parent directories
pub fn save_config(path: &Path, config: &SyncConfig) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
