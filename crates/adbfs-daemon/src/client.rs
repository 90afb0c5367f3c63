//! Device clients and the factories that hand them out
//!
//! [`PooledClientFactory`] binds each serial to a [`SessionPool`] and runs
//! every call on a session drawn from it. [`CachingClientFactory`] decorates
//! any factory: listings and stats go through the [`DirEntryCache`], and
//! successful mutations invalidate the records they affect.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use adbfs_core::{path, ClientError, DirEntry, FsStats};

use crate::cache::DirEntryCache;
use crate::pool::SessionPool;
use crate::session::{DeviceSession, SessionOpener};

/// Client operations on one device. Paths are absolute device paths.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn serial(&self) -> &str;

    async fn stat(&self, path: &str) -> Result<DirEntry, ClientError>;
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, ClientError>;
    async fn read_link(&self, path: &str) -> Result<String, ClientError>;
    async fn read_at(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, ClientError>;
    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, ClientError>;
    async fn create(&self, path: &str, mode: u32, exclusive: bool) -> Result<(), ClientError>;
    async fn truncate(&self, path: &str, size: u64) -> Result<(), ClientError>;
    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), ClientError>;
    async fn remove(&self, path: &str) -> Result<(), ClientError>;
    async fn remove_dir(&self, path: &str) -> Result<(), ClientError>;
    async fn rename(&self, from: &str, to: &str) -> Result<(), ClientError>;
    async fn chmod(&self, path: &str, mode: u32) -> Result<(), ClientError>;
    async fn set_mtime(&self, path: &str, mtime: SystemTime) -> Result<(), ClientError>;
    async fn statfs(&self, path: &str) -> Result<FsStats, ClientError>;
}

/// Produces clients bound to one device serial
pub trait ClientFactory: Send + Sync {
    fn for_device(&self, serial: &str) -> Arc<dyn DeviceClient>;
}

type OpenerFn<O> = Box<dyn Fn(&str) -> O + Send + Sync>;

/// Factory whose clients share one session pool per serial
pub struct PooledClientFactory<O: SessionOpener> {
    pools: DashMap<String, Arc<SessionPool<O>>>,
    make_opener: OpenerFn<O>,
    pool_size: usize,
}

impl<O: SessionOpener> PooledClientFactory<O> {
    pub fn new(pool_size: usize, make_opener: impl Fn(&str) -> O + Send + Sync + 'static) -> Self {
        Self {
            pools: DashMap::new(),
            make_opener: Box::new(make_opener),
            pool_size,
        }
    }

    /// Pool for `serial`, created on first use
    pub fn pool(&self, serial: &str) -> Arc<SessionPool<O>> {
        self.pools
            .entry(serial.to_string())
            .or_insert_with(|| {
                debug!("Creating session pool for {} (size {})", serial, self.pool_size);
                SessionPool::new((self.make_opener)(serial), self.pool_size)
            })
            .clone()
    }

    /// Close every pool; calls in flight finish, new ones fail with PoolClosed
    pub fn close(&self) {
        for pool in self.pools.iter() {
            pool.close();
        }
    }
}

impl<O: SessionOpener> ClientFactory for PooledClientFactory<O> {
    fn for_device(&self, serial: &str) -> Arc<dyn DeviceClient> {
        Arc::new(PooledClient {
            serial: serial.to_string(),
            pool: self.pool(serial),
        })
    }
}

/// Client that runs each call on a pooled session
pub struct PooledClient<O: SessionOpener> {
    serial: String,
    pool: Arc<SessionPool<O>>,
}

#[async_trait]
impl<O: SessionOpener> DeviceClient for PooledClient<O> {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.stat(path).await;
        session.check(&result);
        result
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.list(path).await;
        session.check(&result);
        result
    }

    async fn read_link(&self, path: &str) -> Result<String, ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.read_link(path).await;
        session.check(&result);
        result
    }

    async fn read_at(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.read_at(path, offset, size).await;
        session.check(&result);
        result
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.write_at(path, offset, data).await;
        session.check(&result);
        result
    }

    async fn create(&self, path: &str, mode: u32, exclusive: bool) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.create(path, mode, exclusive).await;
        session.check(&result);
        result
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.truncate(path, size).await;
        session.check(&result);
        result
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.mkdir(path, mode).await;
        session.check(&result);
        result
    }

    async fn remove(&self, path: &str) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.remove(path).await;
        session.check(&result);
        result
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.remove_dir(path).await;
        session.check(&result);
        result
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.rename(from, to).await;
        session.check(&result);
        result
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.chmod(path, mode).await;
        session.check(&result);
        result
    }

    async fn set_mtime(&self, path: &str, mtime: SystemTime) -> Result<(), ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.set_mtime(path, mtime).await;
        session.check(&result);
        result
    }

    async fn statfs(&self, path: &str) -> Result<FsStats, ClientError> {
        let mut session = self.pool.acquire().await?;
        let result = session.statfs(path).await;
        session.check(&result);
        result
    }
}

/// Decorator adding the directory-entry cache to another factory.
///
/// The cache is keyed by device path, so one caching factory serves one
/// mounted device.
pub struct CachingClientFactory {
    cache: Arc<DirEntryCache>,
    ttl: Duration,
    inner: Arc<dyn ClientFactory>,
}

impl CachingClientFactory {
    pub fn new(cache: Arc<DirEntryCache>, ttl: Duration, inner: Arc<dyn ClientFactory>) -> Self {
        Self { cache, ttl, inner }
    }
}

impl ClientFactory for CachingClientFactory {
    fn for_device(&self, serial: &str) -> Arc<dyn DeviceClient> {
        Arc::new(CachingClient {
            inner: self.inner.for_device(serial),
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
        })
    }
}

/// Client serving listings and stats from the cache
pub struct CachingClient {
    inner: Arc<dyn DeviceClient>,
    cache: Arc<DirEntryCache>,
    ttl: Duration,
}

impl CachingClient {
    /// A path changed: its own records and its parent's listing are stale
    fn invalidate_entry(&self, path: &str) {
        self.cache.invalidate(path);
        if let Some(parent) = path::parent(path) {
            self.cache.invalidate(parent);
        }
    }

    /// A directory moved or vanished: everything under it is stale too
    fn invalidate_tree(&self, path: &str) {
        self.cache.invalidate_tree(path);
        if let Some(parent) = path::parent(path) {
            self.cache.invalidate(parent);
        }
    }
}

#[async_trait]
impl DeviceClient for CachingClient {
    fn serial(&self) -> &str {
        self.inner.serial()
    }

    async fn stat(&self, path: &str) -> Result<DirEntry, ClientError> {
        if let Some(entry) = self.cache.get_entry(path) {
            return Ok(entry);
        }

        // A fresh listing of the parent answers for its children, including
        // the negative case
        if let Some(parent) = path::parent(path) {
            if let Some(listing) = self.cache.get(parent) {
                let name = path::file_name(path);
                trace!("stat {} served from listing of {}", path, parent);
                return listing
                    .iter()
                    .find(|entry| entry.name == name)
                    .cloned()
                    .ok_or_else(|| ClientError::NotFound(path.to_string()));
            }
        }

        let generation = self.cache.generation();
        let entry = self.inner.stat(path).await?;
        self.cache.fill_entry(path, entry.clone(), self.ttl, generation);
        Ok(entry)
    }

    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, ClientError> {
        if let Some(listing) = self.cache.get(path) {
            return Ok(listing.as_ref().clone());
        }

        // A mutation finishing while this fetch is in flight makes its result stale
        let generation = self.cache.generation();
        let entries = self.inner.list(path).await?;
        self.cache.fill(path, entries.clone(), self.ttl, generation);
        Ok(entries)
    }

    async fn read_link(&self, path: &str) -> Result<String, ClientError> {
        self.inner.read_link(path).await
    }

    async fn read_at(&self, path: &str, offset: u64, size: u32) -> Result<Vec<u8>, ClientError> {
        self.inner.read_at(path, offset, size).await
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, ClientError> {
        let written = self.inner.write_at(path, offset, data).await?;
        self.invalidate_entry(path);
        Ok(written)
    }

    async fn create(&self, path: &str, mode: u32, exclusive: bool) -> Result<(), ClientError> {
        self.inner.create(path, mode, exclusive).await?;
        self.invalidate_entry(path);
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<(), ClientError> {
        self.inner.truncate(path, size).await?;
        self.invalidate_entry(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.inner.mkdir(path, mode).await?;
        self.invalidate_entry(path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), ClientError> {
        self.inner.remove(path).await?;
        self.invalidate_entry(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ClientError> {
        self.inner.remove_dir(path).await?;
        self.invalidate_tree(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ClientError> {
        self.inner.rename(from, to).await?;
        self.invalidate_tree(from);
        self.invalidate_tree(to);
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), ClientError> {
        self.inner.chmod(path, mode).await?;
        self.invalidate_entry(path);
        Ok(())
    }

    async fn set_mtime(&self, path: &str, mtime: SystemTime) -> Result<(), ClientError> {
        self.inner.set_mtime(path, mtime).await?;
        self.invalidate_entry(path);
        Ok(())
    }

    async fn statfs(&self, path: &str) -> Result<FsStats, ClientError> {
        self.inner.statfs(path).await
    }
}
