//! Daemon configuration.
//!
//! Loaded from `$UMBRA_CONFIG` or `<data_dir>/umbra.toml`; every section
//! and field has a default so an empty file is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Content store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// DHT settings.
    #[serde(default)]
    pub dht: DhtSection,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// QUIC listen port; 0 = OS-assigned ephemeral port.
    #[serde(default)]
    pub listen_port: u16,
    /// Local control protocol port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Hex-encoded hello records of bootstrap peers.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Outbound bandwidth budget in bytes per second.
    #[serde(default = "default_bandwidth")]
    pub bandwidth_bytes_per_sec: u64,
    /// Idle seconds before an unreferenced session is destroyed.
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            control_port: default_control_port(),
            bootstrap: Vec::new(),
            max_sessions: default_max_sessions(),
            bandwidth_bytes_per_sec: default_bandwidth(),
            session_idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Content store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data directory. Empty = `./umbra-data`.
    #[serde(default)]
    pub data_dir: String,
    /// Maximum content entries.
    #[serde(default = "default_store_entries")]
    pub max_entries: usize,
    /// Keep the content store in memory instead of SQLite.
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            max_entries: default_store_entries(),
            in_memory: false,
        }
    }
}

/// DHT configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtSection {
    /// Maintenance period in seconds.
    #[serde(default = "default_maintain_secs")]
    pub maintain_secs: u64,
    /// Buckets over the distance space.
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    /// Peers per bucket.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,
    /// Entries per table datastore.
    #[serde(default = "default_table_entries")]
    pub table_store_entries: usize,
}

impl Default for DhtSection {
    fn default() -> Self {
        Self {
            maintain_secs: default_maintain_secs(),
            bucket_count: default_bucket_count(),
            bucket_size: default_bucket_size(),
            table_store_entries: default_table_entries(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load from `$UMBRA_CONFIG` or the default path. A missing file
    /// yields the default configuration.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("UMBRA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("umbra.toml"));
        Self::load_from(&path)
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// The resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        if self.store.data_dir.is_empty() {
            PathBuf::from("umbra-data")
        } else {
            PathBuf::from(&self.store.data_dir)
        }
    }
}

// Default value functions

fn default_control_port() -> u16 {
    2087
}

fn default_max_sessions() -> usize {
    64
}

fn default_bandwidth() -> u64 {
    64 * 1024
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_store_entries() -> usize {
    65536
}

fn default_maintain_secs() -> u64 {
    15
}

fn default_bucket_count() -> usize {
    64
}

fn default_bucket_size() -> usize {
    8
}

fn default_table_entries() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_valid() {
        let config: NodeConfig = toml::from_str("").expect("parse");
        assert_eq!(config.network.control_port, 2087);
        assert_eq!(config.dht.maintain_secs, 15);
        assert_eq!(config.data_dir(), PathBuf::from("umbra-data"));
    }

    #[test]
    fn test_partial_config_overrides() {
        let text = r#"
            [network]
            listen_port = 4433
            bootstrap = ["deadbeef"]

            [store]
            data_dir = "/tmp/umbra"
            in_memory = true
        "#;
        let config: NodeConfig = toml::from_str(text).expect("parse");
        assert_eq!(config.network.listen_port, 4433);
        assert_eq!(config.network.bootstrap, vec!["deadbeef".to_string()]);
        assert!(config.store.in_memory);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/umbra"));
        // untouched sections keep defaults
        assert_eq!(config.network.max_sessions, 64);
    }

    #[test]
    fn test_missing_file_defaults() {
        let config =
            NodeConfig::load_from(std::path::Path::new("/nonexistent/umbra.toml")).expect("load");
        assert_eq!(config.log.level, "info");
    }
}
