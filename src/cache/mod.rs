//! Known-key caches
//!
//! The write path consults three caches (serialized row keys, metric
//! names, tag names) to suppress redundant index writes. A miss only
//! costs a redundant insert, so entries may expire or be evicted at any
//! time; the one hard rule is that an entry is added only after the
//! corresponding store write has been submitted, so a hit never hides a
//! missing index row.

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Cache over serialized row keys
pub type RowKeyCache = KnownKeyCache<Vec<u8>>;
/// Cache over metric and tag names
pub type StringKeyCache = KnownKeyCache<String>;

/// Bounded, concurrent set of recently written keys
///
/// Entries expire after a per-entry TTL (zero = never) and the oldest
/// entries are evicted once the capacity is reached.
#[derive(Debug)]
pub struct KnownKeyCache<K: Eq + Hash + Clone> {
    entries: DashMap<K, Instant>,
    capacity: usize,
    ttl: Duration,
    enabled: bool,
}

impl<K: Eq + Hash + Clone> KnownKeyCache<K> {
    /// Create a cache holding at most `capacity` entries, each expiring
    /// after `ttl`. A zero `ttl` disables expiry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            enabled: true,
        }
    }

    /// A no-op cache: every lookup misses and inserts are dropped. Turns
    /// the write path into write-through without changing its behavior.
    pub fn disabled() -> Self {
        Self {
            entries: DashMap::new(),
            capacity: 1,
            ttl: Duration::ZERO,
            enabled: false,
        }
    }

    /// Whether `key` was recently marked as written
    pub fn is_known<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.enabled {
            return false;
        }
        let expired = match self.entries.get(key) {
            None => return false,
            Some(entry) => !self.ttl.is_zero() && entry.elapsed() >= self.ttl,
        };
        if expired {
            self.entries.remove(key);
            return false;
        }
        true
    }

    /// Mark `key` as written. Call only after the corresponding store
    /// write has been submitted.
    pub fn insert(&self, key: K) {
        if !self.enabled {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.prune();
        }
        self.entries.insert(key, Instant::now());
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; if the cache is still full, evict the oldest
    /// eighth so inserts stay cheap on average.
    fn prune(&self) {
        if !self.ttl.is_zero() {
            let now = Instant::now();
            self.entries
                .retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
        }
        if self.entries.len() < self.capacity {
            return;
        }
        let mut stamps: Vec<Instant> = self.entries.iter().map(|e| *e.value()).collect();
        if stamps.is_empty() {
            return;
        }
        stamps.sort_unstable();
        let cutoff = stamps[stamps.len() / 8];
        self.entries.retain(|_, inserted| *inserted > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let cache: StringKeyCache = KnownKeyCache::new(16, Duration::ZERO);
        assert!(!cache.is_known("cpu"));
        cache.insert("cpu".to_string());
        assert!(cache.is_known("cpu"));
        assert!(!cache.is_known("mem"));
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let cache: StringKeyCache = KnownKeyCache::new(16, Duration::ZERO);
        cache.insert("cpu".to_string());
        assert!(cache.is_known("cpu"));
    }

    #[test]
    fn test_expiry() {
        let cache: StringKeyCache = KnownKeyCache::new(16, Duration::from_millis(5));
        cache.insert("cpu".to_string());
        std::thread::sleep(Duration::from_millis(10));
        assert!(!cache.is_known("cpu"));
        // The expired entry is dropped on lookup.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache: StringKeyCache = KnownKeyCache::new(8, Duration::ZERO);
        for i in 0..100 {
            cache.insert(format!("key-{i}"));
        }
        assert!(cache.len() <= 9);
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache: StringKeyCache = KnownKeyCache::disabled();
        cache.insert("cpu".to_string());
        assert!(!cache.is_known("cpu"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache: RowKeyCache = KnownKeyCache::new(16, Duration::ZERO);
        cache.insert(vec![1, 2, 3]);
        cache.clear();
        assert!(!cache.is_known(&vec![1, 2, 3][..]));
    }
}
