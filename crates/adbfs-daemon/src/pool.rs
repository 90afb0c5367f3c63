//! Bounded device session pool
//!
//! A fixed number of permits bounds how many sessions are checked out at once.
//! Idle sessions are kept for reuse; a session that failed at the connection
//! level is discarded and a fresh one is opened lazily on a later acquire.
//!
//! # Design
//! - `tokio::sync::Semaphore` with one permit per session slot
//! - Idle set guarded as a whole, locked only to push or pop
//! - [`PooledSession`] guard returns the session (and then its permit) on
//!   every exit path, including early returns and panics

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use adbfs_core::ClientError;

use crate::session::SessionOpener;

/// Statistics for pool monitoring
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total successful acquires
    pub acquires: AtomicU64,
    /// Acquires that found every session busy and had to wait
    pub waits: AtomicU64,
    /// Sessions opened
    pub opened: AtomicU64,
    /// Sessions discarded as broken
    pub discarded: AtomicU64,
    /// Sessions currently checked out
    pub in_use: AtomicUsize,
    /// Highest `in_use` observed
    pub peak_in_use: AtomicUsize,
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub acquires: u64,
    pub waits: u64,
    pub opened: u64,
    pub discarded: u64,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub idle: usize,
}

/// Fixed-size pool of sessions to one device
pub struct SessionPool<O: SessionOpener> {
    opener: O,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<O::Session>>,
    size: usize,
    stats: PoolStats,
}

impl<O: SessionOpener> SessionPool<O> {
    /// Create a pool of `size` sessions; none are opened until first use
    pub fn new(opener: O, size: usize) -> Arc<Self> {
        let size = size.max(1);
        Arc::new(Self {
            opener,
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            size,
            stats: PoolStats::default(),
        })
    }

    /// Check out a session, waiting while all of them are busy.
    ///
    /// Fails immediately with [`ClientError::PoolClosed`] once the pool is
    /// closed, including for callers already waiting.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession<O>, ClientError> {
        if self.permits.available_permits() == 0 {
            self.stats.waits.fetch_add(1, Ordering::Relaxed);
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ClientError::PoolClosed)?;

        let reused = self.idle.lock().pop();
        let session = match reused {
            Some(session) => session,
            None => {
                // The permit is released if opening fails
                let session = self.opener.open().await?;
                let opened = self.stats.opened.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Opened device session ({} total)", opened);
                session
            }
        };

        self.stats.acquires.fetch_add(1, Ordering::Relaxed);
        let in_use = self.stats.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.peak_in_use.fetch_max(in_use, Ordering::Relaxed);

        Ok(PooledSession {
            session: Some(session),
            healthy: true,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Return a session to the idle set, or drop it if broken or closed
    fn return_session(&self, session: O::Session, healthy: bool) {
        self.stats.in_use.fetch_sub(1, Ordering::Relaxed);

        if !healthy {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Discarded broken device session");
            return;
        }

        if self.permits.is_closed() {
            return;
        }

        self.idle.lock().push(session);
    }

    /// Close the pool: pending and future acquires fail, idle sessions drop
    pub fn close(&self) {
        self.permits.close();
        let drained = std::mem::take(&mut *self.idle.lock());
        debug!("Session pool closed ({} idle sessions dropped)", drained.len());
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            acquires: self.stats.acquires.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            opened: self.stats.opened.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            in_use: self.stats.in_use.load(Ordering::Relaxed),
            peak_in_use: self.stats.peak_in_use.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
        }
    }
}

/// Checked-out session guard - returns the session to the pool on drop
pub struct PooledSession<O: SessionOpener> {
    session: Option<O::Session>,
    healthy: bool,
    pool: Arc<SessionPool<O>>,
    // Dropped after `Drop::drop` has put the session back
    _permit: OwnedSemaphorePermit,
}

impl<O: SessionOpener> PooledSession<O> {
    /// Inspect a command result; a connection-level failure marks the
    /// session broken so it is not handed to another caller
    pub fn check<T>(&mut self, result: &Result<T, ClientError>) {
        if let Err(e) = result {
            if e.is_connection_error() {
                warn!("Device session failed, discarding: {}", e);
                self.healthy = false;
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Return the session explicitly
    pub fn release(mut self, healthy: bool) {
        self.healthy = self.healthy && healthy;
    }
}

impl<O: SessionOpener> Deref for PooledSession<O> {
    type Target = O::Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session held until drop")
    }
}

impl<O: SessionOpener> DerefMut for PooledSession<O> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session held until drop")
    }
}

impl<O: SessionOpener> Drop for PooledSession<O> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_session(session, self.healthy);
        }
    }
}
