//! Background cache sweep
//!
//! Lookups drop expired records they touch; this task periodically purges the
//! rest so paths that are never asked for again do not pin memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::cache::DirEntryCache;

/// Default sweep interval in seconds
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Periodic purger for a [`DirEntryCache`]
pub struct CacheSweeper {
    cache: Arc<DirEntryCache>,
    interval: Duration,
}

impl CacheSweeper {
    pub fn new(cache: Arc<DirEntryCache>) -> Self {
        Self::with_interval(cache, Duration::from_secs(SWEEP_INTERVAL_SECS))
    }

    pub fn with_interval(cache: Arc<DirEntryCache>, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Run the sweep loop (call from a tokio task)
    pub async fn run_loop(self) {
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tick.tick().await;
            self.sweep();
        }
    }

    /// Purge expired records once
    pub fn sweep(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(
                "Cache sweep: purged {} expired records, {} remain",
                purged,
                self.cache.len()
            );
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adbfs_core::DirEntry;

    #[test]
    fn test_sweep_purges_expired() {
        let cache = Arc::new(DirEntryCache::default());
        cache.put("/old", vec![DirEntry::file("x", 1)], Duration::from_millis(5));
        cache.put("/new", vec![DirEntry::file("y", 1)], Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));

        let sweeper = CacheSweeper::new(Arc::clone(&cache));
        assert_eq!(sweeper.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_sweeps_periodically() {
        let cache = Arc::new(DirEntryCache::default());
        cache.put("/old", vec![DirEntry::file("x", 1)], Duration::from_millis(5));

        let sweeper = CacheSweeper::with_interval(Arc::clone(&cache), Duration::from_millis(20));
        let task = tokio::spawn(sweeper.run_loop());

        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        assert!(cache.is_empty());
    }
}
