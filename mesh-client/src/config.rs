//! Configuration loading for a mesh node.
//!
//! Configuration is loaded from a TOML file (default: `mesh.toml`). Every
//! section and field is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a mesh node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Node configuration.
    pub node: NodeConfig,
    /// Peer discovery configuration.
    pub discovery: DiscoveryConfig,
    /// Sync scheduling configuration.
    pub sync: SyncConfig,
    /// Network timeouts.
    pub timeouts: TimeoutsConfig,
    /// Inventory storage configuration.
    pub store: StoreConfig,
}

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Directory holding `peer-id.json` and `last-sync.json` (default: data/mesh).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Listen port, 0 for OS-assigned (default: 0).
    #[serde(default)]
    pub port: u16,
}

/// Peer discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// How often discovered but unconnected peers are redialed (default: 20).
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    /// Enable mDNS discovery (default: true).
    #[serde(default = "default_discovery_enabled")]
    pub enabled: bool,
}

/// Sync scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Delay before pushing inventory to a newly connected peer (default: 2000).
    #[serde(default = "default_auto_push_delay")]
    pub auto_push_delay_ms: u64,
    /// Periodic sync request interval, 0 to disable (default: 0).
    #[serde(default)]
    pub interval_secs: u64,
}

/// Network timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Connection establishment timeout in seconds (default: 30).
    #[serde(default = "default_dial_secs")]
    pub dial_secs: u64,
    /// Timeout for reading a whole message or its acknowledgement (default: 60).
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
}

/// Inventory storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file (default: data/prepper.db).
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("data/mesh")
}

fn default_discovery_interval() -> u64 {
    20
}

fn default_discovery_enabled() -> bool {
    true
}

fn default_auto_push_delay() -> u64 {
    2000
}

fn default_dial_secs() -> u64 {
    30
}

fn default_read_secs() -> u64 {
    60
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/prepper.db")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            port: 0,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_discovery_interval(),
            enabled: default_discovery_enabled(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_push_delay_ms: default_auto_push_delay(),
            interval_secs: 0,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            dial_secs: default_dial_secs(),
            read_secs: default_read_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Runtime settings for [`MeshNode`](crate::MeshNode).
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            data_dir: self.node.data_dir.clone(),
            port: self.node.port,
            discovery: self.discovery.enabled,
            discovery_interval: Duration::from_secs(self.discovery.interval_secs.max(1)),
            auto_push_delay: Duration::from_millis(self.sync.auto_push_delay_ms),
            dial_timeout: Duration::from_secs(self.timeouts.dial_secs),
            read_timeout: Duration::from_secs(self.timeouts.read_secs),
        }
    }

    /// Periodic sync interval, if enabled.
    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync.interval_secs > 0).then(|| Duration::from_secs(self.sync.interval_secs))
    }
}

/// Runtime settings of a node, resolved from [`MeshConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    /// Directory for identity and sync state.
    pub data_dir: PathBuf,
    /// Listen port, 0 for OS-assigned.
    pub port: u16,
    /// Whether to discover peers on the local network.
    pub discovery: bool,
    /// Redial interval for discovered peers.
    pub discovery_interval: Duration,
    /// Delay before the automatic push to a new peer.
    pub auto_push_delay: Duration,
    /// Connection establishment timeout.
    pub dial_timeout: Duration,
    /// Message and acknowledgement read timeout.
    pub read_timeout: Duration,
}

impl NodeSettings {
    /// Default settings rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = MeshConfig::default();
        config.node.data_dir = data_dir.into();
        config.node_settings()
    }

    /// Override the automatic push delay.
    pub fn with_auto_push_delay(mut self, delay: Duration) -> Self {
        self.auto_push_delay = delay;
        self
    }

    /// Override the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
