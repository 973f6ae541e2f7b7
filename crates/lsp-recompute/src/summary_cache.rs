//
// summary_cache.rs
//
// Bounded, time-expiring memo for values derived from analysis results
//

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// LRU cache whose entries also expire `ttl` after insertion.
///
/// A zero `ttl` disables expiry. Superseded results age out instead of being
/// pinned for the life of the process.
pub struct SummaryCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V> std::fmt::Debug for SummaryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryCache")
            .field("len", &self.inner.lock().len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> SummaryCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    fn is_expired(&self, inserted: Instant, now: Instant) -> bool {
        !self.ttl.is_zero() && now.duration_since(inserted) >= self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock();
        let inserted = guard.peek(key)?.inserted;
        if self.is_expired(inserted, Instant::now()) {
            guard.pop(key);
            return None;
        }
        guard.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.lock().push(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// `compute` runs outside the lock, so two racing callers may both run it;
    /// the later insert wins.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key).map(|entry| entry.value)
    }

    /// Remove every entry matching `predicate`. Returns the number removed.
    pub fn remove_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut guard = self.inner.lock();
        let doomed: Vec<K> = guard
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            guard.pop(key);
        }
        doomed.len()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let mut guard = self.inner.lock();
        let now = Instant::now();
        let stale: Vec<K> = guard
            .iter()
            .filter(|(_, entry)| self.is_expired(entry.inserted, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            guard.pop(key);
        }
        if !stale.is_empty() {
            log::trace!("Purged {} expired summary cache entries", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
