//
// lazy_cache.rs
//
// Last value of a pure recomputation, refreshed on demand after invalidation
//

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

type Update<T> = Box<dyn Fn(&T) -> T + Send + Sync + 'static>;

/// Caches the result of `update(previous)` until [`LazyCache::invalidate`].
///
/// Validity is tracked with generations: `invalidate` bumps the requested
/// generation, and a recompute records the generation it started from. An
/// invalidation that lands while a recompute is running therefore leaves the
/// cache invalid instead of being lost.
pub struct LazyCache<T> {
    value: RwLock<T>,
    update: Update<T>,
    /// Serializes recomputes
    refresh: Mutex<()>,
    requested: AtomicU64,
    computed: AtomicU64,
}

impl<T: fmt::Debug + Clone> fmt::Debug for LazyCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyCache")
            .field("value", &*self.value.read())
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

impl<T: Clone> LazyCache<T> {
    /// Start invalid: the first `get` runs `update(&initial)`.
    pub fn new<F>(initial: T, update: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        Self {
            value: RwLock::new(initial),
            update: Box::new(update),
            refresh: Mutex::new(()),
            requested: AtomicU64::new(1),
            computed: AtomicU64::new(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.computed.load(Ordering::Acquire) == self.requested.load(Ordering::Acquire)
    }

    /// Mark the cached value stale. Never blocks.
    pub fn invalidate(&self) {
        self.requested.fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self) -> T {
        if self.is_valid() {
            return self.value.read().clone();
        }

        let _refresh = self.refresh.lock();
        // Another caller may have refreshed while we waited
        if self.is_valid() {
            return self.value.read().clone();
        }

        let generation = self.requested.load(Ordering::Acquire);
        let previous = self.value.read().clone();
        let next = (self.update)(&previous);
        *self.value.write() = next.clone();
        self.computed.store(generation, Ordering::Release);
        log::trace!("Lazy cache refreshed at generation {generation}");
        next
    }
}
