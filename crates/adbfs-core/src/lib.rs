//! adbfs Core - Shared types, errors, path handling and configuration
//!
//! This crate contains the foundational types used by the adbfs daemon.
//! It has no dependencies on device transports or filesystem code.

pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use config::{
    check_mountpoint, AdbConfig, CacheConfig, Config, ConfigError, LoggingConfig, MountConfig,
    PoolConfig,
};
pub use error::*;
pub use types::*;

/// Maximum path length in bytes
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Default TTL for cached directory entries in milliseconds
pub const DEFAULT_CACHE_TTL_MS: u64 = 300;

/// Default number of device sessions
pub const DEFAULT_POOL_SIZE: usize = 2;
