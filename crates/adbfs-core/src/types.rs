//! Core type definitions for adbfs
//!
//! These types describe remote metadata as reported by the device and the
//! flags the kernel hands us on open.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Type of filesystem entry, decoded from the `S_IFMT` bits of a mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
}

impl FileType {
    /// Decode from a raw `st_mode`. Modes without type bits are treated as
    /// regular files, which is what `stat` on the device reports for them.
    pub fn from_mode(mode: u32) -> Self {
        #[allow(clippy::unnecessary_cast)]
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => FileType::File,
        }
    }
}

/// Snapshot of remote metadata for one path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Base name (or full path, for a direct stat)
    pub name: String,
    pub size: u64,
    /// File type and permission bits, as in `st_mode`
    pub mode: u32,
    pub mtime: SystemTime,
}

impl DirEntry {
    /// Default permissions for directories (rwxr-xr-x)
    pub const DIR_MODE: u32 = 0o755;
    /// Default permissions for files (rw-r--r--)
    pub const FILE_MODE: u32 = 0o644;

    pub fn new(name: impl Into<String>, size: u64, mode: u32, mtime: SystemTime) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            mtime,
        }
    }

    /// Create an entry for a directory
    #[allow(clippy::unnecessary_cast)]
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, 0, libc::S_IFDIR as u32 | Self::DIR_MODE, SystemTime::now())
    }

    /// Create an entry for a regular file
    #[allow(clippy::unnecessary_cast)]
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self::new(name, size, libc::S_IFREG as u32 | Self::FILE_MODE, SystemTime::now())
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// Permission bits only (including setuid/setgid/sticky)
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Modification time as seconds since the epoch
    pub fn mtime_secs(&self) -> u64 {
        self.mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Build a time from epoch seconds as reported by the device
    pub fn time_from_secs(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }
}

/// Filesystem statistics (statfs)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Flags passed to open/create
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const READ_ONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRITE_ONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const READ_WRITE: OpenFlags = OpenFlags(libc::O_RDWR);

    pub fn readable(self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_RDONLY || mode == libc::O_RDWR
    }

    pub fn writable(self) -> bool {
        let mode = self.0 & libc::O_ACCMODE;
        mode == libc::O_WRONLY || mode == libc::O_RDWR
    }

    pub fn truncate(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 & libc::O_EXCL != 0
    }

    /// Access modes outside RDONLY/WRONLY/RDWR are invalid
    pub fn is_valid(self) -> bool {
        (self.0 & libc::O_ACCMODE) != libc::O_ACCMODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(FileType::from_mode(0o040755), FileType::Directory);
        assert_eq!(FileType::from_mode(0o100644), FileType::File);
        assert_eq!(FileType::from_mode(0o120777), FileType::Symlink);
        // No type bits at all
        assert_eq!(FileType::from_mode(0o444), FileType::File);
    }

    #[test]
    fn test_dir_entry_helpers() {
        let dir = DirEntry::directory("sdcard");
        assert!(dir.is_dir());
        assert_eq!(dir.permissions(), DirEntry::DIR_MODE);

        let file = DirEntry::file("a.txt", 12);
        assert!(!file.is_dir());
        assert_eq!(file.size, 12);
    }

    #[test]
    fn test_mtime_secs() {
        let entry = DirEntry::new("x", 0, 0o644, DirEntry::time_from_secs(1_700_000_000));
        assert_eq!(entry.mtime_secs(), 1_700_000_000);
    }

    #[test]
    fn test_open_flags() {
        assert!(OpenFlags::READ_ONLY.readable());
        assert!(!OpenFlags::READ_ONLY.writable());
        assert!(OpenFlags::WRITE_ONLY.writable());
        assert!(!OpenFlags::WRITE_ONLY.readable());
        assert!(OpenFlags::READ_WRITE.readable() && OpenFlags::READ_WRITE.writable());

        let trunc = OpenFlags(libc::O_WRONLY | libc::O_TRUNC);
        assert!(trunc.truncate());
        assert!(!OpenFlags(libc::O_ACCMODE).is_valid());
    }
}
