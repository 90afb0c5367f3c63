//! In-memory device used by unit tests
//!
//! Behaves like a small POSIX tree and counts every command it receives so
//! tests can tell cache hits from remote calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use adbfs_core::{path, ClientError, DirEntry, FsStats};

use crate::session::{DeviceSession, SessionOpener};

#[derive(Clone, Debug)]
enum Node {
    File { data: Vec<u8>, perm: u32, mtime: SystemTime },
    Dir { perm: u32, mtime: SystemTime },
    Symlink { target: String, mtime: SystemTime },
}

impl Node {
    #[allow(clippy::unnecessary_cast)]
    fn entry(&self, name: &str) -> DirEntry {
        match self {
            Node::File { data, perm, mtime } => {
                DirEntry::new(name, data.len() as u64, libc::S_IFREG as u32 | perm, *mtime)
            }
            Node::Dir { perm, mtime } => DirEntry::new(name, 4096, libc::S_IFDIR as u32 | perm, *mtime),
            Node::Symlink { target, mtime } => {
                DirEntry::new(name, target.len() as u64, libc::S_IFLNK as u32 | 0o777, *mtime)
            }
        }
    }
}

type Tree = BTreeMap<String, Node>;

/// Shared in-memory device tree
pub struct MemoryDevice {
    nodes: Mutex<Tree>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<VecDeque<ClientError>>,
    fail_opens: AtomicBool,
    opens: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    latency: Mutex<Duration>,
    reply_delays: Mutex<HashMap<&'static str, Duration>>,
}

impl MemoryDevice {
    pub fn new() -> Arc<Self> {
        let mut nodes = Tree::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                perm: 0o755,
                mtime: SystemTime::now(),
            },
        );
        Arc::new(Self {
            nodes: Mutex::new(nodes),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            fail_opens: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            reply_delays: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_dir(&self, path: &str) {
        self.nodes.lock().insert(
            path.to_string(),
            Node::Dir {
                perm: 0o755,
                mtime: SystemTime::now(),
            },
        );
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.add_file_with_mode(path, data, 0o644);
    }

    pub fn add_file_with_mode(&self, path: &str, data: &[u8], perm: u32) {
        self.nodes.lock().insert(
            path.to_string(),
            Node::File {
                data: data.to_vec(),
                perm,
                mtime: SystemTime::now(),
            },
        );
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        self.nodes.lock().insert(
            path.to_string(),
            Node::Symlink {
                target: target.to_string(),
                mtime: SystemTime::now(),
            },
        );
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.lock().contains_key(path)
    }

    pub fn entry(&self, path: &str) -> Option<DirEntry> {
        self.nodes
            .lock()
            .get(path)
            .map(|node| node.entry(path::file_name(path)))
    }

    /// Commands of one kind received so far
    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Fail the next command with `err`
    pub fn fail_next(&self, err: ClientError) {
        self.failures.lock().push_back(err);
    }

    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Hold the reply of every `op` command for `delay` after the tree was read
    pub fn delay_reply(&self, op: &'static str, delay: Duration) {
        self.reply_delays.lock().insert(op, delay);
    }

    /// Most commands ever in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Opens [`MemorySession`]s on a shared [`MemoryDevice`]
pub struct MemoryOpener {
    device: Arc<MemoryDevice>,
}

impl MemoryOpener {
    pub fn new(device: Arc<MemoryDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl SessionOpener for MemoryOpener {
    type Session = MemorySession;

    async fn open(&self) -> Result<MemorySession, ClientError> {
        if self.device.fail_opens.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("device offline".into()));
        }
        self.device.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            device: Arc::clone(&self.device),
        })
    }
}

pub struct MemorySession {
    device: Arc<MemoryDevice>,
}

impl MemorySession {
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, ClientError>
    where
        F: FnOnce(&mut Tree) -> Result<T, ClientError> + Send,
    {
        *self.device.calls.lock().entry(op).or_insert(0) += 1;
        let active = self.device.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.device.peak.fetch_max(active, Ordering::SeqCst);

        let latency = *self.device.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = self.device.failures.lock().pop_front();
        let result = match injected {
            Some(err) => Err(err),
            None => f(&mut *self.device.nodes.lock()),
        };

        let reply_delay = self.device.reply_delays.lock().get(op).copied();
        if let Some(delay) = reply_delay {
            tokio::time::sleep(delay).await;
        }

        self.device.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn not_found(path: &str) -> ClientError {
    ClientError::NotFound(path.to_string())
}

fn require_parent_dir(tree: &Tree, path: &str) -> Result<(), ClientError> {
    match path::parent(path).and_then(|p| tree.get(p)) {
        Some(Node::Dir { .. }) => Ok(()),
        Some(_) => Err(ClientError::NotADirectory(path.to_string())),
        None => Err(not_found(path)),
    }
}

fn has_children(tree: &Tree, dir: &str) -> bool {
    tree.keys()
        .any(|key| key != dir && path::is_within(key, dir))
}

#[async_trait]
impl DeviceSession for MemorySession {
    async fn stat(&mut self, path: &str) -> Result<DirEntry, ClientError> {
        self.run("stat", |tree| {
            let name = if path == "/" { "/" } else { path::file_name(path) };
            tree.get(path)
                .map(|node| node.entry(name))
                .ok_or_else(|| not_found(path))
        })
        .await
    }

    async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>, ClientError> {
        self.run("list", |tree| match tree.get(path) {
            Some(Node::Dir { .. }) => Ok(tree
                .iter()
                .filter(|(key, _)| key.as_str() != "/" && path::parent(key) == Some(path))
                .map(|(key, node)| node.entry(path::file_name(key)))
                .collect()),
            Some(_) => Err(ClientError::NotADirectory(path.to_string())),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn read_link(&mut self, path: &str) -> Result<String, ClientError> {
        self.run("read_link", |tree| match tree.get(path) {
            Some(Node::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(ClientError::InvalidArgument(path.to_string())),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ClientError> {
        self.run("read_at", |tree| match tree.get(path) {
            Some(Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(size as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Node::Dir { .. }) => Err(ClientError::IsADirectory(path.to_string())),
            Some(_) => Err(ClientError::InvalidArgument(path.to_string())),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn write_at(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<u32, ClientError> {
        self.run("write_at", |tree| match tree.get_mut(path) {
            Some(Node::File {
                data: contents,
                mtime,
                ..
            }) => {
                let start = offset as usize;
                let end = start + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(data);
                *mtime = SystemTime::now();
                Ok(data.len() as u32)
            }
            Some(Node::Dir { .. }) => Err(ClientError::IsADirectory(path.to_string())),
            Some(_) => Err(ClientError::InvalidArgument(path.to_string())),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn create(&mut self, path: &str, mode: u32, exclusive: bool) -> Result<(), ClientError> {
        self.run("create", |tree| {
            require_parent_dir(tree, path)?;
            match tree.get(path) {
                Some(Node::Dir { .. }) => Err(ClientError::IsADirectory(path.to_string())),
                Some(_) if exclusive => Err(ClientError::AlreadyExists(path.to_string())),
                Some(_) => Ok(()),
                None => {
                    tree.insert(
                        path.to_string(),
                        Node::File {
                            data: Vec::new(),
                            perm: mode & 0o7777,
                            mtime: SystemTime::now(),
                        },
                    );
                    Ok(())
                }
            }
        })
        .await
    }

    async fn truncate(&mut self, path: &str, size: u64) -> Result<(), ClientError> {
        self.run("truncate", |tree| match tree.get_mut(path) {
            Some(Node::File { data, mtime, .. }) => {
                data.resize(size as usize, 0);
                *mtime = SystemTime::now();
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(ClientError::IsADirectory(path.to_string())),
            Some(_) => Err(ClientError::InvalidArgument(path.to_string())),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.run("mkdir", |tree| {
            require_parent_dir(tree, path)?;
            if tree.contains_key(path) {
                return Err(ClientError::AlreadyExists(path.to_string()));
            }
            tree.insert(
                path.to_string(),
                Node::Dir {
                    perm: mode & 0o7777,
                    mtime: SystemTime::now(),
                },
            );
            Ok(())
        })
        .await
    }

    async fn remove(&mut self, path: &str) -> Result<(), ClientError> {
        self.run("remove", |tree| match tree.get(path) {
            Some(Node::Dir { .. }) => Err(ClientError::IsADirectory(path.to_string())),
            Some(_) => {
                tree.remove(path);
                Ok(())
            }
            None => Err(not_found(path)),
        })
        .await
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), ClientError> {
        self.run("remove_dir", |tree| match tree.get(path) {
            Some(Node::Dir { .. }) if path == "/" => {
                Err(ClientError::PermissionDenied(path.to_string()))
            }
            Some(Node::Dir { .. }) if has_children(tree, path) => {
                Err(ClientError::NotEmpty(path.to_string()))
            }
            Some(Node::Dir { .. }) => {
                tree.remove(path);
                Ok(())
            }
            Some(_) => Err(ClientError::NotADirectory(path.to_string())),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<(), ClientError> {
        self.run("rename", |tree| {
            if !tree.contains_key(from) {
                return Err(not_found(from));
            }
            require_parent_dir(tree, to)?;
            if let Some(Node::Dir { .. }) = tree.get(to) {
                if has_children(tree, to) {
                    return Err(ClientError::NotEmpty(to.to_string()));
                }
            }
            tree.remove(to);

            let moved: Vec<String> = tree
                .keys()
                .filter(|key| path::is_within(key, from))
                .cloned()
                .collect();
            for old in moved {
                if let Some(node) = tree.remove(&old) {
                    let new = format!("{}{}", to, &old[from.len()..]);
                    tree.insert(new, node);
                }
            }
            Ok(())
        })
        .await
    }

    async fn chmod(&mut self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.run("chmod", |tree| match tree.get_mut(path) {
            Some(Node::File { perm, .. }) | Some(Node::Dir { perm, .. }) => {
                *perm = mode & 0o7777;
                Ok(())
            }
            Some(Node::Symlink { .. }) => Ok(()),
            None => Err(not_found(path)),
        })
        .await
    }

    async fn set_mtime(&mut self, path: &str, new_mtime: SystemTime) -> Result<(), ClientError> {
        self.run("set_mtime", |tree| match tree.get_mut(path) {
            Some(Node::File { mtime, .. })
            | Some(Node::Dir { mtime, .. })
            | Some(Node::Symlink { mtime, .. }) => {
                *mtime = new_mtime;
                Ok(())
            }
            None => Err(not_found(path)),
        })
        .await
    }

    async fn statfs(&mut self, path: &str) -> Result<FsStats, ClientError> {
        self.run("statfs", |tree| {
            if !tree.contains_key(path) {
                return Err(not_found(path));
            }
            Ok(FsStats {
                block_size: 4096,
                blocks: 1024,
                blocks_free: 512,
                blocks_available: 500,
                files: 100,
                files_free: 90,
                name_max: 255,
            })
        })
        .await
    }
}
