//! Open file handles
//!
//! [`RemoteFile`] forwards each call to the device client at an explicit
//! offset. [`LoggingFile`] wraps any [`OpenFile`] and emits one structured
//! record per call without touching the result.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::info;

use adbfs_core::{DirEntry, FsError, OpenFlags};

use crate::client::DeviceClient;

/// Operations on one open file
#[async_trait]
pub trait OpenFile: Send + Sync {
    /// Device path this handle refers to
    fn path(&self) -> &str;

    async fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError>;
    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError>;
    async fn flush(&self) -> Result<(), FsError>;
    async fn fsync(&self, flags: i32) -> Result<(), FsError>;
    async fn truncate(&self, size: u64) -> Result<(), FsError>;
    async fn getattr(&self) -> Result<DirEntry, FsError>;
    async fn release(&self) -> Result<(), FsError>;
}

/// File handle backed by positional reads and writes on the device
pub struct RemoteFile {
    path: String,
    flags: OpenFlags,
    client: Arc<dyn DeviceClient>,
}

impl RemoteFile {
    pub fn new(path: String, flags: OpenFlags, client: Arc<dyn DeviceClient>) -> Self {
        Self {
            path,
            flags,
            client,
        }
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }
}

#[async_trait]
impl OpenFile for RemoteFile {
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        if !self.flags.readable() {
            return Err(FsError::BadHandle);
        }
        Ok(self.client.read_at(&self.path, offset, size).await?)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        if !self.flags.writable() {
            return Err(FsError::BadHandle);
        }
        Ok(self.client.write_at(&self.path, offset, data).await?)
    }

    // Writes reach the device before `write` returns; nothing is buffered here
    async fn flush(&self) -> Result<(), FsError> {
        Ok(())
    }

    async fn fsync(&self, _flags: i32) -> Result<(), FsError> {
        Ok(())
    }

    async fn truncate(&self, size: u64) -> Result<(), FsError> {
        if !self.flags.writable() {
            return Err(FsError::BadHandle);
        }
        Ok(self.client.truncate(&self.path, size).await?)
    }

    async fn getattr(&self) -> Result<DirEntry, FsError> {
        Ok(self.client.stat(&self.path).await?)
    }

    async fn release(&self) -> Result<(), FsError> {
        Ok(())
    }
}

/// One argument of a logged call
#[derive(Clone, Copy, Debug)]
pub enum LogArg<'a> {
    Int(i64),
    UInt(u64),
    Str(&'a str),
    /// Logged as a length-tagged placeholder, never as content
    Bytes(&'a [u8]),
}

impl fmt::Display for LogArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogArg::Int(n) => write!(f, "{}", n),
            LogArg::UInt(n) => write!(f, "{}", n),
            LogArg::Str(s) => write!(f, "{:?}", s),
            LogArg::Bytes(b) => write!(f, "bytes({})", b.len()),
        }
    }
}

/// Render call arguments as `[a, b, ...]`
pub fn summarize_args(args: &[LogArg<'_>]) -> String {
    let parts: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn summarize_result<T>(result: &Result<T, FsError>, describe: impl FnOnce(&T) -> String) -> String {
    match result {
        Ok(value) => describe(value),
        Err(e) => format!("error({}): {}", e.to_errno(), e),
    }
}

/// Decorator logging every call made on the wrapped file
pub struct LoggingFile {
    inner: Box<dyn OpenFile>,
}

impl LoggingFile {
    pub fn new(inner: Box<dyn OpenFile>) -> Self {
        Self { inner }
    }

    fn record(&self, operation: &str, args: &[LogArg<'_>], result: String, start: Instant) {
        let elapsed = start.elapsed();
        info!(
            operation,
            args = %summarize_args(args),
            result = %result,
            elapsed = ?elapsed,
            path = %self.inner.path(),
            "file operation"
        );
    }
}

#[async_trait]
impl OpenFile for LoggingFile {
    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let start = Instant::now();
        let result = self.inner.read(offset, size).await;
        let summary = summarize_result(&result, |data| LogArg::Bytes(data).to_string());
        self.record(
            "Read",
            &[LogArg::UInt(offset), LogArg::UInt(size as u64)],
            summary,
            start,
        );
        result
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let start = Instant::now();
        let result = self.inner.write(offset, data).await;
        let summary = summarize_result(&result, |n| n.to_string());
        self.record(
            "Write",
            &[LogArg::UInt(offset), LogArg::Bytes(data)],
            summary,
            start,
        );
        result
    }

    async fn flush(&self) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.flush().await;
        let summary = summarize_result(&result, |_| "ok".to_string());
        self.record("Flush", &[], summary, start);
        result
    }

    async fn fsync(&self, flags: i32) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.fsync(flags).await;
        let summary = summarize_result(&result, |_| "ok".to_string());
        self.record("Fsync", &[LogArg::Int(flags as i64)], summary, start);
        result
    }

    async fn truncate(&self, size: u64) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.truncate(size).await;
        let summary = summarize_result(&result, |_| "ok".to_string());
        self.record("Truncate", &[LogArg::UInt(size)], summary, start);
        result
    }

    async fn getattr(&self) -> Result<DirEntry, FsError> {
        let start = Instant::now();
        let result = self.inner.getattr().await;
        let summary = summarize_result(&result, |entry| {
            format!("size={} mode={:o}", entry.size, entry.mode)
        });
        self.record("Getattr", &[], summary, start);
        result
    }

    async fn release(&self) -> Result<(), FsError> {
        let start = Instant::now();
        let result = self.inner.release().await;
        let summary = summarize_result(&result, |_| "ok".to_string());
        self.record("Release", &[], summary, start);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientFactory, PooledClientFactory};
    use crate::testing::{MemoryDevice, MemoryOpener};
    use parking_lot::Mutex;
    use std::io;

    /// Collects formatted log output
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn records(&self) -> Vec<serde_json::Value> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
                .filter(|record| record["fields"]["message"] == "file operation")
                .collect()
        }
    }

    fn capture<F: FnOnce()>(f: F) -> Vec<serde_json::Value> {
        let buf = SharedBuf::default();
        let writer = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        buf.records()
    }

    fn remote(device: &Arc<MemoryDevice>, path: &str, flags: OpenFlags) -> RemoteFile {
        let device = Arc::clone(device);
        let factory = PooledClientFactory::new(1, move |_| MemoryOpener::new(Arc::clone(&device)));
        RemoteFile::new(path.to_string(), flags, factory.for_device("serial"))
    }

    #[test]
    fn test_summarize_args() {
        assert_eq!(summarize_args(&[LogArg::Int(42)]), "[42]");
        assert_eq!(
            summarize_args(&[LogArg::UInt(0), LogArg::Bytes(b"bar")]),
            "[0, bytes(3)]"
        );
        assert_eq!(summarize_args(&[LogArg::Str("/a")]), "[\"/a\"]");
        assert_eq!(summarize_args(&[]), "[]");
    }

    #[test]
    fn test_fsync_is_logged() {
        let device = MemoryDevice::new();
        device.add_file("/x", b"");
        let file = LoggingFile::new(Box::new(remote(&device, "/x", OpenFlags::READ_WRITE)));

        let records = capture(|| {
            futures::executor::block_on(file.fsync(42)).unwrap();
        });

        assert_eq!(records.len(), 1);
        let fields = &records[0]["fields"];
        assert_eq!(fields["operation"], "Fsync");
        assert_eq!(fields["args"], "[42]");
        assert!(fields["args"].as_str().unwrap().contains("42"));
        assert!(!fields["result"].as_str().unwrap().is_empty());
        assert!(!fields["elapsed"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_contents_are_not_logged() {
        let device = MemoryDevice::new();
        device.add_file("/secret", b"hunter2");
        let file = LoggingFile::new(Box::new(remote(&device, "/secret", OpenFlags::READ_WRITE)));

        let records = capture(|| {
            let data = futures::executor::block_on(file.read(0, 64)).unwrap();
            assert_eq!(data, b"hunter2");
            futures::executor::block_on(file.write(0, b"swordfish")).unwrap();
        });

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["fields"]["result"], "bytes(7)");
        assert_eq!(records[1]["fields"]["args"], "[0, bytes(9)]");
        for record in &records {
            let text = record.to_string();
            assert!(!text.contains("hunter2"));
            assert!(!text.contains("swordfish"));
        }
    }

    #[test]
    fn test_errors_pass_through() {
        let device = MemoryDevice::new();
        device.add_file("/ro", b"data");
        let file = LoggingFile::new(Box::new(remote(&device, "/ro", OpenFlags::READ_ONLY)));

        let records = capture(|| {
            let result = futures::executor::block_on(file.write(0, b"x"));
            assert_eq!(result, Err(FsError::BadHandle));
        });

        let result = records[0]["fields"]["result"].as_str().unwrap();
        assert!(result.starts_with(&format!("error({})", libc::EBADF)));
    }

    #[tokio::test]
    async fn test_remote_file_flags() {
        let device = MemoryDevice::new();
        device.add_file("/f", b"0123456789");

        let reader = remote(&device, "/f", OpenFlags::READ_ONLY);
        assert_eq!(reader.read(2, 3).await.unwrap(), b"234");
        assert_eq!(reader.write(0, b"x").await, Err(FsError::BadHandle));
        assert_eq!(reader.truncate(0).await, Err(FsError::BadHandle));

        let writer = remote(&device, "/f", OpenFlags::WRITE_ONLY);
        assert_eq!(writer.read(0, 1).await, Err(FsError::BadHandle));
        assert_eq!(writer.write(10, b"ab").await.unwrap(), 2);
        assert_eq!(device.contents("/f").unwrap(), b"0123456789ab");
        assert_eq!(writer.getattr().await.unwrap().size, 12);
    }

    #[tokio::test]
    async fn test_remote_file_missing() {
        let device = MemoryDevice::new();
        let file = remote(&device, "/gone", OpenFlags::READ_ONLY);
        assert_eq!(file.read(0, 1).await, Err(FsError::NotFound));
    }
}
