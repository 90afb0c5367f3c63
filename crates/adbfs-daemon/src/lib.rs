//! adbfs Daemon - exposes an adb device's filesystem as a local mount
//!
//! This crate provides:
//! - A path-operation adapter that maps POSIX filesystem calls onto device
//!   commands
//! - A bounded pool of device sessions with a caching client decorator
//! - A mount lifecycle controller and a device watchdog that unmounts when
//!   the device goes away
//!
//! # Architecture
//!
//! The kernel calls in synchronously; device I/O is async:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              fuser Session Thread (sync)                    │
//! │  inode → path, one spawned task per callback                │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ tokio::runtime::Handle
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Tokio Runtime (async)                      │
//! │  AdbFileSystem → CachingClient → PooledClient               │
//! │                                      │                      │
//! │                          SessionPool (bounded)              │
//! │                                      │                      │
//! │                     adb -s <serial> shell -T                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies are sent from the spawned task, so a slow device call never
//! blocks the session thread. The pool size bounds how many device commands
//! run at once; everything past that waits for a session.
//!
//! # Platform Support
//!
//! - **Unix (Linux, macOS)**: Uses FUSE via the `fuser` crate

// FUSE-related modules (Unix-only)
#[cfg(unix)]
pub mod fuse;

// Platform-independent modules
pub mod adb;
pub mod cache;
pub mod client;
pub mod file;
pub mod fs;
pub mod lifecycle;
pub mod pool;
pub mod session;
pub mod sweeper;
pub mod watchdog;

#[cfg(test)]
mod testing;

// FUSE-related re-exports (Unix-only)
#[cfg(unix)]
pub use fuse::{FuserMount, PathFs};

// Platform-independent re-exports
pub use cache::{CacheStatsSnapshot, DirEntryCache};
pub use client::{
    CachingClient, CachingClientFactory, ClientFactory, DeviceClient, PooledClient,
    PooledClientFactory,
};
pub use file::{LoggingFile, OpenFile, RemoteFile};
pub use fs::{AdbFileSystem, FsOptions};
pub use lifecycle::{MountBridge, MountController, MountError, MountPhase, MountState};
pub use pool::{PoolStatsSnapshot, PooledSession, SessionPool};
pub use session::{DeviceSession, SessionOpener};
pub use sweeper::CacheSweeper;
pub use watchdog::DeviceWatchdog;
