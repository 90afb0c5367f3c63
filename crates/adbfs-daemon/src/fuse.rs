//! FUSE bridge
//!
//! The kernel addresses files by inode; the adapter addresses them by path.
//! `PathFs` keeps the mapping between the two and forwards every callback to
//! [`AdbFileSystem`] on the tokio runtime, replying from the spawned task so
//! the fuser session thread never blocks on the device.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, Sender};
use fuser::{
    FileAttr as FuserAttr, FileType as FuserFileType, Filesystem, KernelConfig, MountOption,
    ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use adbfs_core::{path, DirEntry, FileType, FsError, OpenFlags};

use crate::fs::AdbFileSystem;
use crate::lifecycle::MountBridge;

/// TTL for FUSE kernel cache
const TTL: Duration = Duration::from_secs(1);

/// Inode of the mount root
pub const ROOT_INO: u64 = 1;

/// Reported for readdir entries the kernel has not looked up yet
const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Bidirectional inode/path map with kernel lookup counts
#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Inodes>,
}

#[derive(Debug)]
struct Inodes {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    lookups: HashMap<u64, u64>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut paths = HashMap::new();
        let mut inos = HashMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        inos.insert("/".to_string(), ROOT_INO);

        Self {
            inner: RwLock::new(Inodes {
                paths,
                inos,
                lookups: HashMap::new(),
                next: ROOT_INO + 1,
            }),
        }
    }

    pub fn path(&self, ino: u64) -> Option<String> {
        self.inner.read().paths.get(&ino).cloned()
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        self.inner.read().inos.get(path).copied()
    }

    /// Inode for `path`, assigning one if needed, and count one kernel lookup
    pub fn lookup(&self, path: &str) -> u64 {
        let mut inner = self.inner.write();
        let ino = match inner.inos.get(path) {
            Some(&ino) => ino,
            None => {
                let ino = inner.next;
                inner.next += 1;
                inner.paths.insert(ino, path.to_string());
                inner.inos.insert(path.to_string(), ino);
                ino
            }
        };
        if ino != ROOT_INO {
            *inner.lookups.entry(ino).or_insert(0) += 1;
        }
        ino
    }

    /// Drop `nlookup` kernel references; the inode is released at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inner = self.inner.write();
        let remaining = match inner.lookups.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(nlookup);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            inner.lookups.remove(&ino);
            if let Some(path) = inner.paths.remove(&ino) {
                if inner.inos.get(&path) == Some(&ino) {
                    inner.inos.remove(&path);
                }
            }
        }
    }

    /// Detach `path` and everything beneath it from new lookups. Inodes the
    /// kernel still holds keep resolving to their old path until forgotten.
    pub fn remove(&self, path: &str) {
        let mut inner = self.inner.write();
        inner.inos.retain(|p, _| !path::is_within(p, path));
    }

    /// Move every path at or under `from` to the same place under `to`
    pub fn rename(&self, from: &str, to: &str) {
        let mut inner = self.inner.write();
        inner.inos.retain(|p, _| !path::is_within(p, to));

        let moved: Vec<(String, u64)> = inner
            .inos
            .iter()
            .filter(|(p, _)| path::is_within(p, from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();

        for (old, ino) in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            inner.inos.remove(&old);
            inner.inos.insert(new.clone(), ino);
            inner.paths.insert(ino, new);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a device entry to fuser's FileAttr
pub fn to_fuser_attr(ino: u64, entry: &DirEntry, uid: u32, gid: u32) -> FuserAttr {
    FuserAttr {
        ino,
        size: entry.size,
        blocks: entry.size.div_ceil(512),
        atime: entry.mtime,
        mtime: entry.mtime,
        ctime: entry.mtime,
        crtime: entry.mtime,
        kind: to_fuser_kind(entry.file_type()),
        perm: entry.permissions() as u16,
        nlink: if entry.is_dir() { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn to_fuser_kind(file_type: FileType) -> FuserFileType {
    match file_type {
        FileType::File => FuserFileType::RegularFile,
        FileType::Directory => FuserFileType::Directory,
        FileType::Symlink => FuserFileType::Symlink,
        FileType::CharDevice => FuserFileType::CharDevice,
        FileType::BlockDevice => FuserFileType::BlockDevice,
        FileType::NamedPipe => FuserFileType::NamedPipe,
        FileType::Socket => FuserFileType::Socket,
    }
}

/// One readdir record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuseDirEntry {
    pub ino: u64,
    pub kind: FuserFileType,
    pub name: String,
    pub mode: u32,
}

/// Translate a listing into readdir records, keeping the device order
pub fn to_dir_entries(
    dir: &str,
    entries: &[DirEntry],
    inodes: &InodeTable,
) -> Vec<FuseDirEntry> {
    entries
        .iter()
        .map(|entry| {
            let ino = inodes
                .get(&path::join(dir, path::file_name(&entry.name)))
                .unwrap_or(UNKNOWN_INO);
            FuseDirEntry {
                ino,
                kind: to_fuser_kind(entry.file_type()),
                name: entry.name.clone(),
                mode: entry.mode,
            }
        })
        .collect()
}

/// The mounting user; the INIT request may come from root under fusermount
fn process_owner() -> (u32, u32) {
    // SAFETY: libc::getuid() and libc::getgid() are thread-safe syscall wrappers
    unsafe { (libc::getuid(), libc::getgid()) }
}

fn to_system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// fuser filesystem over the path adapter
pub struct PathFs {
    fs: Arc<AdbFileSystem>,
    runtime: Handle,
    inodes: Arc<InodeTable>,
    ready: Option<Sender<()>>,
    uid: u32,
    gid: u32,
}

impl PathFs {
    pub fn new(fs: Arc<AdbFileSystem>, runtime: Handle, ready: Sender<()>) -> Self {
        let (uid, gid) = process_owner();
        Self {
            fs,
            runtime,
            inodes: Arc::new(InodeTable::new()),
            ready: Some(ready),
            uid,
            gid,
        }
    }

    /// Owner reported for every file in the mount
    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    pub fn inodes(&self) -> Arc<InodeTable> {
        Arc::clone(&self.inodes)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        let dir = self.inodes.path(parent).ok_or(libc::ENOENT)?;
        path::validate_filename(name).map_err(|e| FsError::from(e).to_errno())?;
        Ok(path::join(&dir, name))
    }
}

impl Filesystem for PathFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("Filesystem for {} initialized", self.fs.serial());
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("Filesystem for {} destroyed", self.fs.serial());
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);

        self.runtime.spawn(async move {
            match fs.getattr(&path).await {
                Ok(entry) => {
                    let ino = inodes.lookup(&path);
                    reply.entry(&TTL, &to_fuser_attr(ino, &entry, uid, gid), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);
        let (uid, gid) = (self.uid, self.gid);

        self.runtime.spawn(async move {
            let result = match fh {
                Some(fh) => fs.fgetattr(fh, &path).await,
                None => fs.getattr(&path).await,
            };
            match result {
                Ok(entry) => reply.attr(&TTL, &to_fuser_attr(ino, &entry, uid, gid)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);
        let (uid, gid) = (self.uid, self.gid);

        self.runtime.spawn(async move {
            let result = async {
                if let Some(mode) = mode {
                    fs.chmod(&path, mode).await?;
                }
                if let Some(size) = size {
                    match fh {
                        Some(fh) => fs.ftruncate(fh, size).await?,
                        None => fs.truncate(&path, size).await?,
                    }
                }
                if atime.is_some() || mtime.is_some() {
                    fs.utimens(&path, atime.map(to_system_time), mtime.map(to_system_time))
                        .await?;
                }
                fs.getattr(&path).await
            }
            .await;

            match result {
                Ok(entry) => reply.attr(&TTL, &to_fuser_attr(ino, &entry, uid, gid)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.readlink(&path).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);

        self.runtime.spawn(async move {
            match fs.mkdir(&path, mode & !umask).await {
                Ok(entry) => {
                    let ino = inodes.lookup(&path);
                    reply.entry(&TTL, &to_fuser_attr(ino, &entry, uid, gid), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);

        self.runtime.spawn(async move {
            match fs.unlink(&path).await {
                Ok(()) => {
                    inodes.remove(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);

        self.runtime.spawn(async move {
            match fs.rmdir(&path).await {
                Ok(()) => {
                    inodes.remove(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE and RENAME_EXCHANGE cannot be honored atomically
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (from, to) = match (self.child(parent, name), self.child(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);

        self.runtime.spawn(async move {
            match fs.rename(&from, &to).await {
                Ok(()) => {
                    inodes.rename(&from, &to);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.open(&path, OpenFlags(flags)).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.read(fh, offset as u64, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let fs = Arc::clone(&self.fs);
        let data = data.to_vec();

        self.runtime.spawn(async move {
            match fs.write(fh, offset as u64, &data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.flush(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.release(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.fsync(fh, datasync).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.opendir(&path).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!("readdir: ino={}, offset={}", ino, offset);

        let Some(dir) = self.inodes.path(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // Served from the snapshot taken at opendir
        let entries = match self.fs.readdir(fh) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let parent_ino = path::parent(&dir)
            .and_then(|p| self.inodes.get(p))
            .unwrap_or(ROOT_INO);

        let mut records = vec![
            FuseDirEntry {
                ino,
                kind: FuserFileType::Directory,
                name: ".".to_string(),
                mode: 0,
            },
            FuseDirEntry {
                ino: parent_ino,
                kind: FuserFileType::Directory,
                name: "..".to_string(),
                mode: 0,
            },
        ];
        records.extend(to_dir_entries(&dir, &entries, &self.inodes));

        for (i, record) in records.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(record.ino, (i + 1) as i64, record.kind, &record.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.fs.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.inodes.path(ino).unwrap_or_else(|| "/".to_string());
        let fs = Arc::clone(&self.fs);

        self.runtime.spawn(async move {
            match fs.statfs(&path).await {
                Ok(stats) => reply.statfs(
                    stats.blocks,
                    stats.blocks_free,
                    stats.blocks_available,
                    stats.files,
                    stats.files_free,
                    stats.block_size,
                    stats.name_max,
                    stats.block_size,
                ),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let fs = Arc::clone(&self.fs);
        let inodes = Arc::clone(&self.inodes);
        let (uid, gid) = (self.uid, self.gid);

        self.runtime.spawn(async move {
            match fs.create(&path, mode & !umask, OpenFlags(flags)).await {
                Ok((fh, entry)) => {
                    let ino = inodes.lookup(&path);
                    reply.created(&TTL, &to_fuser_attr(ino, &entry, uid, gid), 0, fh, 0);
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }
}

/// Mount options for a device mount
pub fn mount_options(serial: &str, allow_other: bool, read_only: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(format!("adbfs:{}", serial)),
        MountOption::Subtype("adbfs".to_string()),
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }
    options.push(if read_only {
        MountOption::RO
    } else {
        MountOption::RW
    });
    options
}

/// [`MountBridge`] backed by a fuser session on a local directory
pub struct FuserMount {
    filesystem: Mutex<Option<PathFs>>,
    mountpoint: PathBuf,
    options: Vec<MountOption>,
    ready: Receiver<()>,
}

impl FuserMount {
    pub fn new(
        fs: Arc<AdbFileSystem>,
        runtime: Handle,
        mountpoint: &Path,
        options: Vec<MountOption>,
    ) -> Self {
        let (ready_tx, ready_rx) = bounded(1);
        Self {
            filesystem: Mutex::new(Some(PathFs::new(fs, runtime, ready_tx))),
            mountpoint: mountpoint.to_path_buf(),
            options,
            ready: ready_rx,
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl MountBridge for FuserMount {
    fn serve(&self) -> io::Result<()> {
        let filesystem = self.filesystem.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "filesystem already served")
        })?;

        info!("Mounting at {:?}", self.mountpoint);
        // This blocks until unmounted
        fuser::mount2(filesystem, &self.mountpoint, &self.options)?;
        info!("Filesystem unmounted");
        Ok(())
    }

    fn wait_until_ready(&self) -> io::Result<()> {
        self.ready.recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "filesystem exited before initialization",
            )
        })
    }

    fn unmount(&self) -> io::Result<()> {
        let mountpoint = self.mountpoint.to_string_lossy().to_string();

        #[cfg(target_os = "macos")]
        let output = Command::new("umount").arg(&mountpoint).output()?;

        #[cfg(not(target_os = "macos"))]
        let output = match Command::new("fusermount3").args(["-u", mountpoint.as_str()]).output() {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Command::new("fusermount").args(["-u", mountpoint.as_str()]).output()?
            }
            other => other?,
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("Unmount of {} failed: {}", mountpoint, stderr);
            Err(io::Error::new(io::ErrorKind::Other, stderr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn listing() -> Vec<DirEntry> {
        vec![
            DirEntry::new("/foo.txt", 24, 0o444, UNIX_EPOCH),
            DirEntry::new("/bar.txt", 42, 0o444, UNIX_EPOCH),
        ]
    }

    #[test]
    fn test_attr_conversion() {
        let entry = DirEntry::file("a.txt", 1024);
        let attr = to_fuser_attr(42, &entry, 1000, 1000);

        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 1024);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.uid, 1000);
        assert!(matches!(attr.kind, FuserFileType::RegularFile));
    }

    #[test]
    fn test_dir_attr_conversion() {
        let attr = to_fuser_attr(ROOT_INO, &DirEntry::directory("/"), 0, 0);

        assert_eq!(attr.ino, ROOT_INO);
        assert_eq!(attr.nlink, 2);
        assert!(matches!(attr.kind, FuserFileType::Directory));
    }

    #[test]
    fn test_dir_entries_keep_order_and_mode() {
        let inodes = InodeTable::new();
        let records = to_dir_entries("/", &listing(), &inodes);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "/foo.txt");
        assert_eq!(records[1].name, "/bar.txt");
        assert!(records.iter().all(|r| r.mode != 0));
        assert!(records.iter().all(|r| r.ino == UNKNOWN_INO));
    }

    #[test]
    fn test_dir_entries_use_known_inodes() {
        let inodes = InodeTable::new();
        let ino = inodes.lookup("/foo.txt");
        let records = to_dir_entries("/", &listing(), &inodes);

        assert_eq!(records[0].ino, ino);
        assert_eq!(records[1].ino, UNKNOWN_INO);
    }

    #[test]
    fn test_inode_lookup_is_stable() {
        let inodes = InodeTable::new();
        assert_eq!(inodes.path(ROOT_INO).as_deref(), Some("/"));

        let a = inodes.lookup("/a");
        let b = inodes.lookup("/b");
        assert_ne!(a, b);
        assert_eq!(inodes.lookup("/a"), a);
        assert_eq!(inodes.path(a).as_deref(), Some("/a"));
    }

    #[test]
    fn test_inode_forget() {
        let inodes = InodeTable::new();
        let ino = inodes.lookup("/a");
        inodes.lookup("/a");

        inodes.forget(ino, 1);
        assert_eq!(inodes.path(ino).as_deref(), Some("/a"));

        inodes.forget(ino, 1);
        assert_eq!(inodes.path(ino), None);
        assert_eq!(inodes.get("/a"), None);

        // Root survives any forget
        inodes.forget(ROOT_INO, 100);
        assert_eq!(inodes.path(ROOT_INO).as_deref(), Some("/"));
    }

    #[test]
    fn test_inode_rename_moves_subtree() {
        let inodes = InodeTable::new();
        let dir = inodes.lookup("/dir");
        let child = inodes.lookup("/dir/child");
        let sibling = inodes.lookup("/dirt");
        let replaced = inodes.lookup("/new");

        inodes.rename("/dir", "/new");

        assert_eq!(inodes.path(dir).as_deref(), Some("/new"));
        assert_eq!(inodes.path(child).as_deref(), Some("/new/child"));
        assert_eq!(inodes.path(sibling).as_deref(), Some("/dirt"));
        assert_eq!(inodes.get("/new"), Some(dir));
        assert_eq!(inodes.get("/dir"), None);
        // The overwritten target no longer resolves by path
        assert_ne!(inodes.get("/new"), Some(replaced));
    }

    #[test]
    fn test_inode_remove_detaches_path() {
        let inodes = InodeTable::new();
        let ino = inodes.lookup("/gone");
        inodes.remove("/gone");

        assert_eq!(inodes.get("/gone"), None);
        assert_ne!(inodes.lookup("/gone"), ino);
    }

    #[tokio::test]
    async fn test_files_owned_by_mounting_user() {
        use crate::client::PooledClientFactory;
        use crate::fs::FsOptions;
        use crate::testing::{MemoryDevice, MemoryOpener};

        let device = MemoryDevice::new();
        let factory = Arc::new(PooledClientFactory::new(1, move |_| {
            MemoryOpener::new(Arc::clone(&device))
        }));
        let fs = Arc::new(AdbFileSystem::new("emulator-5554", factory, FsOptions::default()));
        let (ready_tx, _ready_rx) = bounded(1);

        let path_fs = PathFs::new(fs, Handle::current(), ready_tx);
        let expected = unsafe { (libc::getuid(), libc::getgid()) };
        assert_eq!(path_fs.owner(), expected);
    }

    #[test]
    fn test_mount_options() {
        let options = mount_options("abc", false, true);
        assert!(options.contains(&MountOption::RO));
        assert!(!options.contains(&MountOption::AllowOther));

        let options = mount_options("abc", true, false);
        assert!(options.contains(&MountOption::AllowOther));
        assert!(options.contains(&MountOption::RW));
    }
}
