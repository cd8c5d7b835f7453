//! Process-wide cache of unwrapped data keys.
//!
//! Entries expire `ttl` after they were cached and are evicted lazily when a
//! read finds them stale; there is no background sweep. Misses are
//! single-flight per key id so concurrent readers trigger one unwrap call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;
use crate::key::{DataKey, KeyId};

/// Default time-to-live for a cached key.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CachedKey {
    key: DataKey,
    cached_at: Instant,
}

/// Snapshot of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently held, fresh or not.
    pub total_cached: usize,
    /// Entries still inside the TTL window.
    pub active: usize,
    /// Stale entries awaiting lazy eviction.
    pub expired: usize,
    /// Configured TTL.
    pub ttl_seconds: u64,
}

/// TTL cache of plaintext data keys keyed by [`KeyId`].
pub struct DekCache {
    ttl: Duration,
    entries: DashMap<KeyId, CachedKey>,
    fill_locks: DashMap<KeyId, Arc<Mutex<()>>>,
}

impl DekCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            fill_locks: DashMap::new(),
        }
    }

    /// Configured TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached key if it is younger than the TTL. A stale entry
    /// is removed on the way out.
    #[must_use]
    pub fn get(&self, id: &KeyId) -> Option<DataKey> {
        let stale = match self.entries.get(id) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                return Some(entry.key.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries
                .remove_if(id, |_, entry| entry.cached_at.elapsed() >= self.ttl);
        }
        None
    }

    /// Cache `key` under `id`, restarting its TTL window.
    pub fn insert(&self, id: KeyId, key: DataKey) {
        self.entries.insert(
            id,
            CachedKey {
                key,
                cached_at: Instant::now(),
            },
        );
    }

    /// Return the cached key or run `fill` exactly once per concurrent miss.
    ///
    /// # Errors
    ///
    /// Propagates the error from `fill`; nothing is cached in that case.
    pub fn get_or_fill<F>(&self, id: &KeyId, fill: F) -> Result<DataKey>
    where
        F: FnOnce() -> Result<DataKey>,
    {
        if let Some(key) = self.get(id) {
            return Ok(key);
        }

        let lock = self
            .fill_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let filled = {
            let _guard = lock.lock();
            // Another thread may have filled it while we waited.
            match self.get(id) {
                Some(key) => Ok(key),
                None => fill().map(|key| {
                    self.insert(id.clone(), key.clone());
                    key
                }),
            }
        };
        drop(lock);

        // The map's own reference is the last one once every waiter is done.
        self.fill_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        filled
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Count fresh and stale entries.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let total_cached = self.entries.len();
        let active = self
            .entries
            .iter()
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .count();
        CacheStats {
            total_cached,
            active,
            expired: total_cached.saturating_sub(active),
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

impl Default for DekCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl std::fmt::Debug for DekCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DekCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn hit_within_ttl() {
        let cache = DekCache::new(Duration::from_secs(60));
        let id = KeyId::from("k1");
        let key = DataKey::generate();
        cache.insert(id.clone(), key.clone());
        assert_eq!(cache.get(&id), Some(key));
        assert!(cache.get(&KeyId::from("other")).is_none());
    }

    #[test]
    fn stale_entries_are_evicted_on_read() {
        let cache = DekCache::new(Duration::from_millis(20));
        let id = KeyId::from("k1");
        cache.insert(id.clone(), DataKey::generate());
        thread::sleep(Duration::from_millis(40));

        let stats = cache.stats();
        assert_eq!((stats.total_cached, stats.active, stats.expired), (1, 0, 1));

        assert!(cache.get(&id).is_none());
        assert_eq!(cache.stats().total_cached, 0);
    }

    #[test]
    fn fill_errors_are_not_cached() {
        let cache = DekCache::default();
        let id = KeyId::from("k1");
        let err = cache.get_or_fill(&id, || Err(crate::CryptoError::Unavailable("down".into())));
        assert!(err.is_err());
        assert_eq!(cache.stats().total_cached, 0);
    }

    #[test]
    fn concurrent_misses_fill_once() {
        let cache = Arc::new(DekCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let id = KeyId::from("shared");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let id = id.clone();
                thread::spawn(move || {
                    cache
                        .get_or_fill(&id, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(DataKey::from_slice(&[3u8; 32]).expect("key"))
                        })
                        .expect("fill")
                })
            })
            .collect();

        for handle in handles {
            let key = handle.join().expect("join");
            assert_eq!(key.as_bytes(), &[3u8; 32]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.fill_locks.is_empty());
    }

    #[test]
    fn fill_locks_do_not_accumulate() {
        let cache = DekCache::default();
        for i in 0..16 {
            let id = KeyId::from(format!("k{i}").as_str());
            cache
                .get_or_fill(&id, || Ok(DataKey::generate()))
                .expect("fill");
        }
        let missing = KeyId::from("down");
        assert!(cache
            .get_or_fill(&missing, || Err(crate::CryptoError::Unavailable("down".into())))
            .is_err());
        assert_eq!(cache.stats().total_cached, 16);
        assert!(cache.fill_locks.is_empty());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = DekCache::default();
        cache.insert(KeyId::from("a"), DataKey::generate());
        cache.insert(KeyId::from("b"), DataKey::generate());
        cache.clear();
        assert_eq!(cache.stats().total_cached, 0);
        assert_eq!(cache.stats().ttl_seconds, 300);
    }
}
