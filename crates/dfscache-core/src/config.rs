//! Configuration for the cache layer
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/dfscache/config.toml
//! - Linux: ~/.config/dfscache/config.toml
//! - Windows: %APPDATA%/dfscache/config.toml

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    DEFAULT_BANDWIDTH_BPS, DEFAULT_CHUNK_BYTES, DEFAULT_HISTORY_CAPACITY, DEFAULT_LONG_WORKERS,
    DEFAULT_SHORT_WORKERS,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Local cache storage settings
    pub cache: CacheSection,
    /// Transfer tuning
    pub transfer: TransferConfig,
    /// Worker pool sizing
    pub pools: PoolConfig,
    /// Default remote endpoint for descriptor resolution
    pub remote: RemoteConfig,
}

/// Local cache storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Root directory for cached files (uses system cache dir if None)
    pub root: Option<PathBuf>,
}

/// Transfer tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for streaming downloads, in bytes
    pub chunk_bytes: usize,
    /// Bandwidth assumption used for time estimates, bytes per second
    pub bandwidth_bps: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            bandwidth_bps: DEFAULT_BANDWIDTH_BPS,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers serving the high-priority (estimate) lane
    pub short_workers: usize,
    /// Workers serving the low-priority (download) lane
    pub long_workers: usize,
    /// Capacity of the finished-requests history ring
    pub history_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            short_workers: DEFAULT_SHORT_WORKERS,
            long_workers: DEFAULT_LONG_WORKERS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Default remote endpoint, used to resolve "default"-scheme descriptors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub default_scheme: String,
    pub default_host: String,
    pub default_port: u16,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            default_scheme: "hdfs".into(),
            default_host: "localhost".into(),
            default_port: 8020,
        }
    }
}

impl CacheConfig {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: CacheConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dfscache").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the default cache root directory
    pub fn default_cache_root() -> Option<PathBuf> {
        ProjectDirs::from("", "", "dfscache").map(|dirs| dirs.cache_dir().join("files"))
    }

    /// Get the effective cache root (config override or system default)
    pub fn cache_root(&self) -> PathBuf {
        self.cache
            .root
            .clone()
            .or_else(Self::default_cache_root)
            .unwrap_or_else(|| PathBuf::from("/tmp/dfscache"))
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.pools.short_workers, 4);
        assert_eq!(config.pools.long_workers, 4);
        assert_eq!(config.pools.history_capacity, 1024);
        assert_eq!(config.transfer.chunk_bytes, 4 * 1024 * 1024);
        assert_eq!(config.transfer.bandwidth_bps, 100_000_000);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = CacheConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CacheConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.pools.short_workers, config.pools.short_workers);
        assert_eq!(parsed.remote.default_port, config.remote.default_port);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [pools]
            long_workers = 8
        "#;
        let config: CacheConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pools.long_workers, 8);
        // Other values should be defaults
        assert_eq!(config.pools.short_workers, 4);
        assert_eq!(config.remote.default_scheme, "hdfs");
    }

    #[test]
    fn test_config_load_missing() {
        let config = CacheConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.pools.short_workers, 4);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = CacheConfig::default();
        config.transfer.bandwidth_bps = 42;
        config.save_to(&path).unwrap();

        let reloaded = CacheConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.transfer.bandwidth_bps, 42);
    }
}
