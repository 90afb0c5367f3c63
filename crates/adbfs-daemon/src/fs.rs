//! Path-operation adapter
//!
//! [`AdbFileSystem`] implements the path-based filesystem call surface on top
//! of a [`ClientFactory`]. Every call normalizes its mount-relative path, maps
//! it under the device root, runs the remote command and translates the
//! outcome into an [`FsError`]. Cache invalidation after successful mutations
//! happens in the caching client decorator.
//!
//! The only per-call mutable state is the handle table, whose lock is held
//! for insert and remove only, never across a remote call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use adbfs_core::{path, DirEntry, FsError, FsStats, OpenFlags};

use crate::client::{ClientFactory, DeviceClient};
use crate::file::{LoggingFile, OpenFile, RemoteFile};

/// Adapter behavior switches
#[derive(Debug, Clone)]
pub struct FsOptions {
    /// Device directory exposed as the mount root
    pub device_root: String,
    /// Reject every mutating call with EROFS
    pub read_only: bool,
    /// Wrap opened files in [`LoggingFile`]
    pub log_file_ops: bool,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            device_root: "/".to_string(),
            read_only: false,
            log_file_ops: false,
        }
    }
}

enum Handle {
    File(Arc<dyn OpenFile>),
    /// Listing snapshot taken at opendir
    Dir(Arc<Vec<DirEntry>>),
}

/// Open file and directory handles
struct HandleTable {
    next: AtomicU64,
    handles: Mutex<HashMap<u64, Handle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        fh
    }

    fn file(&self, fh: u64) -> Result<Arc<dyn OpenFile>, FsError> {
        match self.handles.lock().get(&fh) {
            Some(Handle::File(file)) => Ok(Arc::clone(file)),
            _ => Err(FsError::BadHandle),
        }
    }

    fn dir(&self, fh: u64) -> Result<Arc<Vec<DirEntry>>, FsError> {
        match self.handles.lock().get(&fh) {
            Some(Handle::Dir(entries)) => Ok(Arc::clone(entries)),
            _ => Err(FsError::BadHandle),
        }
    }

    fn remove_file(&self, fh: u64) -> Result<Arc<dyn OpenFile>, FsError> {
        let mut handles = self.handles.lock();
        if !matches!(handles.get(&fh), Some(Handle::File(_))) {
            return Err(FsError::BadHandle);
        }
        match handles.remove(&fh) {
            Some(Handle::File(file)) => Ok(file),
            _ => Err(FsError::BadHandle),
        }
    }

    fn remove_dir(&self, fh: u64) -> Result<(), FsError> {
        let mut handles = self.handles.lock();
        match handles.get(&fh) {
            Some(Handle::Dir(_)) => {
                handles.remove(&fh);
                Ok(())
            }
            _ => Err(FsError::BadHandle),
        }
    }

    fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Filesystem adapter for one device
pub struct AdbFileSystem {
    serial: String,
    options: FsOptions,
    factory: Arc<dyn ClientFactory>,
    handles: HandleTable,
}

impl AdbFileSystem {
    pub fn new(serial: impl Into<String>, factory: Arc<dyn ClientFactory>, options: FsOptions) -> Self {
        Self {
            serial: serial.into(),
            options,
            factory,
            handles: HandleTable::new(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Number of open file and directory handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn client(&self) -> Arc<dyn DeviceClient> {
        self.factory.for_device(&self.serial)
    }

    /// Normalize a mount-relative path and map it onto the device
    fn resolve(&self, op: &str, local: &str) -> Result<String, FsError> {
        match path::normalize(local) {
            Ok(normalized) => Ok(path::device_path(&self.options.device_root, &normalized)),
            Err(e) => {
                trace!("{} rejected {:?}: {}", op, local, e);
                Err(e.into())
            }
        }
    }

    /// Like [`resolve`](Self::resolve), for calls that change the tree. The
    /// mount root itself cannot be removed or renamed.
    fn resolve_mutable(&self, op: &str, local: &str, structural: bool) -> Result<String, FsError> {
        if self.is_read_only() {
            trace!("{} rejected on read-only mount: {}", op, local);
            return Err(FsError::ReadOnly);
        }
        let device = self.resolve(op, local)?;
        if structural && path::normalize(local).map(|p| p == "/").unwrap_or(false) {
            return Err(FsError::PermissionDenied);
        }
        Ok(device)
    }

    /// Run a remote call, logging failures with their context
    async fn call<T, E, F>(&self, op: &'static str, path: &str, fut: F) -> Result<T, FsError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<FsError>,
    {
        let start = Instant::now();
        fut.await.map_err(|e| {
            let err = e.into();
            log_failure(op, path, &err, start.elapsed());
            err
        })
    }

    pub async fn getattr(&self, local: &str) -> Result<DirEntry, FsError> {
        let device = self.resolve("getattr", local)?;
        let client = self.client();
        self.call("getattr", &device, client.stat(&device)).await
    }

    /// Attributes through an open handle, falling back to the path
    pub async fn fgetattr(&self, fh: u64, local: &str) -> Result<DirEntry, FsError> {
        match self.handles.file(fh) {
            Ok(file) => self.call("getattr", file.path(), file.getattr()).await,
            Err(_) => self.getattr(local).await,
        }
    }

    /// Snapshot a directory listing into a new handle
    pub async fn opendir(&self, local: &str) -> Result<u64, FsError> {
        let device = self.resolve("opendir", local)?;
        let client = self.client();
        let entries = self.call("opendir", &device, client.list(&device)).await?;
        let fh = self.handles.insert(Handle::Dir(Arc::new(entries)));
        debug!("opendir {} -> fh {}", device, fh);
        Ok(fh)
    }

    /// Entries captured by `opendir`, in device order
    pub fn readdir(&self, fh: u64) -> Result<Arc<Vec<DirEntry>>, FsError> {
        self.handles.dir(fh)
    }

    pub fn releasedir(&self, fh: u64) -> Result<(), FsError> {
        self.handles.remove_dir(fh)
    }

    pub async fn open(&self, local: &str, flags: OpenFlags) -> Result<u64, FsError> {
        if !flags.is_valid() {
            return Err(FsError::InvalidArgument(format!("open flags {:#o}", flags.0)));
        }

        let device = if flags.writable() || flags.truncate() {
            self.resolve_mutable("open", local, false)?
        } else {
            self.resolve("open", local)?
        };

        let client = self.client();
        let entry = self.call("open", &device, client.stat(&device)).await?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory);
        }

        if flags.truncate() && flags.writable() {
            self.call("open", &device, client.truncate(&device, 0)).await?;
        }

        Ok(self.insert_file(device, flags, client))
    }

    fn insert_file(&self, device: String, flags: OpenFlags, client: Arc<dyn DeviceClient>) -> u64 {
        let remote = RemoteFile::new(device, flags, client);
        let file: Arc<dyn OpenFile> = if self.options.log_file_ops {
            Arc::new(LoggingFile::new(Box::new(remote)))
        } else {
            Arc::new(remote)
        };
        self.handles.insert(Handle::File(file))
    }

    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let file = self.handles.file(fh)?;
        self.call("read", file.path(), file.read(offset, size)).await
    }

    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let file = self.handles.file(fh)?;
        self.call("write", file.path(), file.write(offset, data)).await
    }

    pub async fn flush(&self, fh: u64) -> Result<(), FsError> {
        let file = self.handles.file(fh)?;
        self.call("flush", file.path(), file.flush()).await
    }

    pub async fn fsync(&self, fh: u64, datasync: bool) -> Result<(), FsError> {
        let file = self.handles.file(fh)?;
        let flags = if datasync { libc::O_DSYNC } else { libc::O_SYNC };
        self.call("fsync", file.path(), file.fsync(flags)).await
    }

    /// Close a file handle; the handle is gone even if the release call fails
    pub async fn release(&self, fh: u64) -> Result<(), FsError> {
        let file = self.handles.remove_file(fh)?;
        self.call("release", file.path(), file.release()).await
    }

    /// Create a file and open it, returning the handle and the new entry
    pub async fn create(
        &self,
        local: &str,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<(u64, DirEntry), FsError> {
        let device = self.resolve_mutable("create", local, true)?;
        let client = self.client();

        self.call(
            "create",
            &device,
            client.create(&device, mode & 0o7777, flags.exclusive()),
        )
        .await?;
        if flags.truncate() {
            self.call("create", &device, client.truncate(&device, 0)).await?;
        }
        let entry = self.call("create", &device, client.stat(&device)).await?;

        // A file created for reading only can still be written through its
        // creating handle
        let flags = if flags.writable() {
            flags
        } else {
            OpenFlags((flags.0 & !libc::O_ACCMODE) | libc::O_RDWR)
        };
        let fh = self.insert_file(device, flags, client);
        Ok((fh, entry))
    }

    pub async fn mkdir(&self, local: &str, mode: u32) -> Result<DirEntry, FsError> {
        let device = self.resolve_mutable("mkdir", local, true)?;
        let client = self.client();
        self.call("mkdir", &device, client.mkdir(&device, mode & 0o7777))
            .await?;
        self.call("mkdir", &device, client.stat(&device)).await
    }

    pub async fn rmdir(&self, local: &str) -> Result<(), FsError> {
        let device = self.resolve_mutable("rmdir", local, true)?;
        let client = self.client();
        self.call("rmdir", &device, client.remove_dir(&device)).await
    }

    pub async fn unlink(&self, local: &str) -> Result<(), FsError> {
        let device = self.resolve_mutable("unlink", local, true)?;
        let client = self.client();
        self.call("unlink", &device, client.remove(&device)).await
    }

    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let source = self.resolve_mutable("rename", from, true)?;
        let target = self.resolve_mutable("rename", to, true)?;
        let client = self.client();
        if source == target {
            // Renaming onto itself changes nothing, but the file must exist
            return self
                .call("rename", &source, client.stat(&source))
                .await
                .map(drop);
        }
        if path::is_within(&target, &source) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} into itself",
                from
            )));
        }
        self.call("rename", &source, client.rename(&source, &target))
            .await
    }

    pub async fn truncate(&self, local: &str, size: u64) -> Result<(), FsError> {
        let device = self.resolve_mutable("truncate", local, false)?;
        let client = self.client();
        self.call("truncate", &device, client.truncate(&device, size))
            .await
    }

    /// Truncate through an open handle
    pub async fn ftruncate(&self, fh: u64, size: u64) -> Result<(), FsError> {
        if self.is_read_only() {
            return Err(FsError::ReadOnly);
        }
        let file = self.handles.file(fh)?;
        self.call("truncate", file.path(), file.truncate(size)).await
    }

    pub async fn chmod(&self, local: &str, mode: u32) -> Result<(), FsError> {
        let device = self.resolve_mutable("chmod", local, false)?;
        let client = self.client();
        self.call("chmod", &device, client.chmod(&device, mode & 0o7777))
            .await
    }

    /// Set timestamps. The device only keeps mtime; `atime` is accepted and
    /// ignored.
    pub async fn utimens(
        &self,
        local: &str,
        _atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<(), FsError> {
        let device = self.resolve_mutable("utimens", local, false)?;
        let Some(mtime) = mtime else {
            return Ok(());
        };
        let client = self.client();
        self.call("utimens", &device, client.set_mtime(&device, mtime))
            .await
    }

    pub async fn readlink(&self, local: &str) -> Result<String, FsError> {
        let device = self.resolve("readlink", local)?;
        let client = self.client();
        self.call("readlink", &device, client.read_link(&device))
            .await
    }

    pub async fn statfs(&self, local: &str) -> Result<FsStats, FsError> {
        let device = self.resolve("statfs", local)?;
        let client = self.client();
        self.call("statfs", &device, client.statfs(&device)).await
    }
}

fn log_failure(op: &str, path: &str, err: &FsError, elapsed: Duration) {
    match err {
        e if e.is_validation() => trace!(op, path, "rejected: {}", e),
        FsError::NotFound => debug!(op, path, ?elapsed, "not found"),
        e => warn!(op, path, ?elapsed, errno = e.to_errno(), "{} failed: {}", op, e),
    }
}
