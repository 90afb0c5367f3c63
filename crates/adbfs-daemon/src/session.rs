//! Device session capability
//!
//! A session is one logical connection to the device bridge. It runs one
//! command at a time, which is why every method takes `&mut self`; the
//! [`SessionPool`](crate::pool::SessionPool) decides who holds it.
//!
//! Paths handed to a session are absolute device paths.

use std::time::SystemTime;

use async_trait::async_trait;

use adbfs_core::{ClientError, DirEntry, FsStats};

/// Commands one session can run against the device
#[async_trait]
pub trait DeviceSession: Send + 'static {
    async fn stat(&mut self, path: &str) -> Result<DirEntry, ClientError>;

    /// Entries of a directory, in the order the device reports them
    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>, ClientError>;

    async fn read_link(&mut self, path: &str) -> Result<String, ClientError>;

    /// Read up to `size` bytes at `offset`; a short result means end of file
    async fn read_at(&mut self, path: &str, offset: u64, size: u32)
        -> Result<Vec<u8>, ClientError>;

    /// Write `data` at `offset` without truncating, returning bytes written
    async fn write_at(&mut self, path: &str, offset: u64, data: &[u8])
        -> Result<u32, ClientError>;

    /// Create an empty regular file. With `exclusive`, an existing file is
    /// an error; otherwise it is left untouched.
    async fn create(&mut self, path: &str, mode: u32, exclusive: bool)
        -> Result<(), ClientError>;

    async fn truncate(&mut self, path: &str, size: u64) -> Result<(), ClientError>;

    async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), ClientError>;

    async fn remove(&mut self, path: &str) -> Result<(), ClientError>;

    async fn remove_dir(&mut self, path: &str) -> Result<(), ClientError>;

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), ClientError>;

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), ClientError>;

    async fn set_mtime(&mut self, path: &str, mtime: SystemTime) -> Result<(), ClientError>;

    async fn statfs(&mut self, path: &str) -> Result<FsStats, ClientError>;
}

/// Opens new sessions to one device
#[async_trait]
pub trait SessionOpener: Send + Sync + 'static {
    type Session: DeviceSession;

    async fn open(&self) -> Result<Self::Session, ClientError>;
}
