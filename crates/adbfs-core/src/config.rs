//! Configuration system for adbfs
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/adbfs/config.toml
//! - Linux: ~/.config/adbfs/config.toml
//!
//! Command-line flags override file values; the merged configuration is
//! immutable once the daemon starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{DEFAULT_CACHE_TTL_MS, DEFAULT_POOL_SIZE};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device and mountpoint settings
    pub mount: MountConfig,
    /// Directory-entry cache settings
    pub cache: CacheConfig,
    /// Session pool settings
    pub pool: PoolConfig,
    /// adb program settings
    pub adb: AdbConfig,
    /// Log output settings
    pub logging: LoggingConfig,
}

/// Device and mount settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Serial of the device to mount (as shown by `adb devices`)
    pub serial: Option<String>,
    /// Local directory to mount on
    pub mountpoint: Option<PathBuf>,
    /// Device directory exposed as the mount root
    pub device_root: String,
    /// Seconds to wait for the kernel to finish mounting
    pub startup_timeout_secs: u64,
    /// Allow other users to access the mount
    pub allow_other: bool,
    /// Reject every mutating call with EROFS
    pub read_only: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            serial: None,
            mountpoint: None,
            device_root: "/".to_string(),
            startup_timeout_secs: 5,
            allow_other: false,
            read_only: false,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory-entry TTL in milliseconds (0 disables caching)
    pub ttl_ms: u64,
    /// Maximum cached records before eviction
    pub max_entries: usize,
    /// Seconds between expired-record sweeps (0 disables the sweeper)
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_CACHE_TTL_MS,
            max_entries: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

/// Session pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent device sessions
    pub size: usize,
    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            command_timeout_secs: 10,
        }
    }
}

/// adb program configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbConfig {
    /// Path to the adb executable
    pub program: PathBuf,
    /// Milliseconds between device-list polls
    pub poll_interval_ms: u64,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("adb"),
            poll_interval_ms: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON log records instead of text
    pub json: bool,
    /// Log every call made on an open file
    pub file_ops: bool,
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("No config directory found, using defaults");
                Ok(Self::default())
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

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "adbfs", "adbfs")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check the fields every mount needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mount.serial.as_deref() {
            None | Some("") => return Err(ConfigError::MissingSerial),
            Some(_) => {}
        }
        if self.mount.mountpoint.is_none() {
            return Err(ConfigError::MissingMountpoint);
        }
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool size must be at least 1".into()));
        }
        if !self.mount.device_root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "device root must be absolute: {}",
                self.mount.device_root
            )));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.mount.startup_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.adb.poll_interval_ms)
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("device serial must be specified")]
    MissingSerial,
    #[error("mountpoint must be specified")]
    MissingMountpoint,
    #[error("mountpoint is not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Resolve a mountpoint to an absolute path and check it is a directory.
pub fn check_mountpoint(path: &Path) -> Result<PathBuf, ConfigError> {
    let absolute = path
        .canonicalize()
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;

    if !absolute.is_dir() {
        return Err(ConfigError::NotADirectory(absolute));
    }

    Ok(absolute)
}
