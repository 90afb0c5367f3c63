//! Directory-entry cache
//!
//! Maps device paths to directory listings and single stat results, each with
//! an expiry. Expired records are treated as absent and dropped lazily on the
//! next lookup; the [`CacheSweeper`](crate::sweeper::CacheSweeper) reclaims the
//! ones nobody asks for again.
//!
//! Records are replaced whole: a reader sees either the old listing or the new
//! one, never a mix.
//!
//! Every invalidation advances a generation counter. A fetch that started
//! before an invalidation stores its result with [`DirEntryCache::fill`],
//! which refuses results read under an older generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use adbfs_core::{path, DirEntry};

/// Default record limit per record kind
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Cache record with TTL
#[derive(Clone)]
struct CacheRecord<T> {
    data: T,
    expires_at: Instant,
    generation: u64,
}

impl<T> CacheRecord<T> {
    fn new(data: T, ttl: Duration, generation: u64) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
            generation,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Cache counters
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub invalidations: AtomicU64,
    pub stale_fills: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub stale_fills: u64,
}

/// TTL cache of directory listings and single entries, keyed by device path
pub struct DirEntryCache {
    listings: DashMap<String, CacheRecord<Arc<Vec<DirEntry>>>>,
    entries: DashMap<String, CacheRecord<DirEntry>>,
    max_entries: usize,
    generation: AtomicU64,
    stats: CacheStats,
}

impl DirEntryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            listings: DashMap::new(),
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            generation: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Current invalidation generation; read it before fetching from the device
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Cached listing of `path`, if present and not expired
    pub fn get(&self, path: &str) -> Option<Arc<Vec<DirEntry>>> {
        if let Some(record) = self.listings.get(path) {
            if !record.is_expired() {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&record.data));
            }
        }

        self.listings.remove_if(path, |_, record| record.is_expired());
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a listing, replacing any previous record. A zero TTL stores nothing.
    pub fn put(&self, path: &str, entries: Vec<DirEntry>, ttl: Duration) -> Arc<Vec<DirEntry>> {
        self.fill(path, entries, ttl, self.generation())
    }

    /// Store a listing fetched at `generation`. Nothing is kept if any
    /// invalidation happened since then.
    pub fn fill(
        &self,
        path: &str,
        entries: Vec<DirEntry>,
        ttl: Duration,
        generation: u64,
    ) -> Arc<Vec<DirEntry>> {
        let entries = Arc::new(entries);
        if ttl.is_zero() {
            return entries;
        }
        if self.generation() != generation {
            self.stats.stale_fills.fetch_add(1, Ordering::Relaxed);
            trace!("dropped stale listing of {}", path);
            return entries;
        }

        make_room(&self.listings, self.max_entries, &self.stats);
        self.listings.insert(
            path.to_string(),
            CacheRecord::new(Arc::clone(&entries), ttl, generation),
        );
        // An invalidation may have landed between the check and the insert
        if self.generation() != generation {
            self.listings
                .remove_if(path, |_, record| record.generation == generation);
            self.stats.stale_fills.fetch_add(1, Ordering::Relaxed);
            return entries;
        }
        trace!("cached listing of {} ({} entries)", path, entries.len());
        entries
    }

    /// Cached stat result for `path`
    pub fn get_entry(&self, path: &str) -> Option<DirEntry> {
        if let Some(record) = self.entries.get(path) {
            if !record.is_expired() {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(record.data.clone());
            }
        }

        self.entries.remove_if(path, |_, record| record.is_expired());
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put_entry(&self, path: &str, entry: DirEntry, ttl: Duration) {
        self.fill_entry(path, entry, ttl, self.generation());
    }

    /// Store a stat result fetched at `generation`, like [`Self::fill`]
    pub fn fill_entry(&self, path: &str, entry: DirEntry, ttl: Duration, generation: u64) {
        if ttl.is_zero() {
            return;
        }
        if self.generation() != generation {
            self.stats.stale_fills.fetch_add(1, Ordering::Relaxed);
            return;
        }

        make_room(&self.entries, self.max_entries, &self.stats);
        self.entries
            .insert(path.to_string(), CacheRecord::new(entry, ttl, generation));
        if self.generation() != generation {
            self.entries
                .remove_if(path, |_, record| record.generation == generation);
            self.stats.stale_fills.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop the listing and the stat record for one path
    pub fn invalidate(&self, path: &str) {
        self.bump_generation();
        let listing = self.listings.remove(path).is_some();
        let entry = self.entries.remove(path).is_some();
        if listing || entry {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            trace!("invalidated {}", path);
        }
    }

    /// Drop every record for `dir` and anything beneath it
    pub fn invalidate_tree(&self, dir: &str) {
        self.bump_generation();
        let before = self.len();
        self.listings.retain(|key, _| !path::is_within(key, dir));
        self.entries.retain(|key, _| !path::is_within(key, dir));
        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            self.stats
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
            trace!("invalidated {} records under {}", removed, dir);
        }
    }

    pub fn invalidate_all(&self) {
        self.bump_generation();
        self.listings.clear();
        self.entries.clear();
    }

    /// Remove every expired record, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.len();
        self.listings.retain(|_, record| !record.is_expired());
        self.entries.retain(|_, record| !record.is_expired());
        before.saturating_sub(self.len())
    }

    /// Number of stored records, expired or not
    pub fn len(&self) -> usize {
        self.listings.len() + self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            stale_fills: self.stats.stale_fills.load(Ordering::Relaxed),
        }
    }
}

impl Default for DirEntryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

/// Evict expired records if at capacity, then an arbitrary one if still full
fn make_room<T>(map: &DashMap<String, CacheRecord<T>>, max_entries: usize, stats: &CacheStats) {
    if map.len() < max_entries {
        return;
    }

    let before = map.len();
    map.retain(|_, record| !record.is_expired());

    if map.len() >= max_entries {
        let victim = map.iter().next().map(|record| record.key().clone());
        if let Some(key) = victim {
            map.remove(&key);
        }
    }

    let evicted = before.saturating_sub(map.len());
    stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Vec<DirEntry> {
        vec![DirEntry::file("a.txt", 1), DirEntry::directory("b")]
    }

    #[test]
    fn test_put_then_get_within_ttl() {
        let cache = DirEntryCache::default();
        cache.put("/sdcard", listing(), Duration::from_secs(60));

        let hit = cache.get("/sdcard").unwrap();
        assert_eq!(*hit, listing());
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_expired_record_is_absent() {
        let cache = DirEntryCache::default();
        cache.put("/sdcard", listing(), Duration::from_millis(20));
        assert!(cache.get("/sdcard").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("/sdcard").is_none());
        // Lazy expiry removed the record
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = DirEntryCache::default();
        cache.put("/sdcard", listing(), Duration::ZERO);
        cache.put_entry("/sdcard/a.txt", DirEntry::file("a.txt", 1), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let cache = DirEntryCache::default();
        cache.put("/d", listing(), Duration::from_secs(60));
        cache.put("/d", vec![DirEntry::file("c", 3)], Duration::from_secs(60));

        let hit = cache.get("/d").unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].name, "c");
    }

    #[test]
    fn test_invalidate() {
        let cache = DirEntryCache::default();
        let ttl = Duration::from_secs(60);
        cache.put("/d", listing(), ttl);
        cache.put_entry("/d", DirEntry::directory("d"), ttl);
        cache.put("/other", listing(), ttl);

        cache.invalidate("/d");
        assert!(cache.get("/d").is_none());
        assert!(cache.get_entry("/d").is_none());
        assert!(cache.get("/other").is_some());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidate_tree() {
        let cache = DirEntryCache::default();
        let ttl = Duration::from_secs(60);
        cache.put("/a", listing(), ttl);
        cache.put("/a/b", listing(), ttl);
        cache.put_entry("/a/b/c", DirEntry::file("c", 1), ttl);
        cache.put("/ab", listing(), ttl);

        cache.invalidate_tree("/a");
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/a/b").is_none());
        assert!(cache.get_entry("/a/b/c").is_none());
        assert!(cache.get("/ab").is_some());
    }

    #[test]
    fn test_invalidate_all() {
        let cache = DirEntryCache::default();
        cache.put("/a", listing(), Duration::from_secs(60));
        cache.put_entry("/b", DirEntry::file("b", 1), Duration::from_secs(60));
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fill_after_invalidation_is_dropped() {
        let cache = DirEntryCache::default();
        let ttl = Duration::from_secs(60);

        let generation = cache.generation();
        cache.invalidate("/d");
        cache.fill("/d", listing(), ttl, generation);
        cache.fill_entry("/d/a.txt", DirEntry::file("a.txt", 1), ttl, generation);

        assert!(cache.get("/d").is_none());
        assert!(cache.get_entry("/d/a.txt").is_none());
        assert_eq!(cache.stats().stale_fills, 2);

        // A fetch started after the invalidation is kept
        cache.fill("/d", listing(), ttl, cache.generation());
        assert!(cache.get("/d").is_some());
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = DirEntryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.put("/1", listing(), ttl);
        cache.put("/2", listing(), ttl);
        cache.put("/3", listing(), ttl);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("/3").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = DirEntryCache::default();
        cache.put("/short", listing(), Duration::from_millis(10));
        cache.put("/long", listing(), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("/long").is_some());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(DirEntryCache::default());
        let mut handles = vec![];

        for i in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for j in 0..200 {
                    let len = (i + j) % 4 + 1;
                    let entries = (0..len).map(|n| DirEntry::file(format!("f{}", n), 0)).collect();
                    cache.put("/shared", entries, Duration::from_secs(60));
                    if let Some(hit) = cache.get("/shared") {
                        // Always a complete listing from one put
                        assert!(!hit.is_empty() && hit.len() <= 4);
                        assert_eq!(hit[0].name, "f0");
                    }
                    cache.invalidate("/shared");
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
