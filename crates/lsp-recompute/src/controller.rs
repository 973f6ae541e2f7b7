//
// controller.rs
//
// Per-resource glue: debounced requests start provider computations that
// supersede each other in one slot, and the last good result is kept
//

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;

use crate::computation::Computation;
use crate::debounce::{Debouncer, LazyComputation};
use crate::scheduler::DelayScheduler;
use crate::slot::SupersedingSlot;

/// Produces a fresh analysis result for a resource.
///
/// Implementations usually hand the work to [`DelayScheduler::compute`] or
/// [`Computation::spawn`] and should honour cancellation.
pub trait AnalysisProvider<K, T>: Send + Sync + 'static {
    fn recompute(&self, key: &K) -> Computation<T>;
}

impl<K, T, F> AnalysisProvider<K, T> for F
where
    F: Fn(&K) -> Computation<T> + Send + Sync + 'static,
{
    fn recompute(&self, key: &K) -> Computation<T> {
        self(key)
    }
}

/// A successful result together with where it came from.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    /// Producer generation that started the computation
    pub generation: u64,
    /// Identity of the computation that produced `value`
    pub computation: u64,
    pub value: T,
}

/// Recompute state for one resource key.
pub struct ResourceController<K, T: Clone> {
    key: K,
    provider: Arc<dyn AnalysisProvider<K, T>>,
    slot: SupersedingSlot<T>,
    debouncer: Debouncer<T>,
    generation: Arc<AtomicU64>,
    last_good: Arc<ArcSwapOption<Snapshot<T>>>,
}

impl<K: fmt::Debug, T: Clone> fmt::Debug for ResourceController<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceController")
            .field("key", &self.key)
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .field("debouncer", &self.debouncer)
            .finish_non_exhaustive()
    }
}

impl<K, T> ResourceController<K, T>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: K,
        provider: Arc<dyn AnalysisProvider<K, T>>,
        scheduler: DelayScheduler,
        retry_period: Duration,
    ) -> Self {
        let slot = SupersedingSlot::new();
        let generation = Arc::new(AtomicU64::new(0));
        let last_good = Arc::new(ArcSwapOption::empty());
        let producer = make_producer(
            key.clone(),
            provider.clone(),
            slot.clone(),
            generation.clone(),
            last_good.clone(),
        );
        Self {
            key,
            provider,
            slot,
            debouncer: Debouncer::new(producer, scheduler, retry_period),
            generation,
            last_good,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// The resource changed: the next request recomputes. Returns the new
    /// producer generation.
    pub fn update(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("{:?} updated to generation {}", self.key, generation);
        self.debouncer.set_producer(make_producer(
            self.key.clone(),
            self.provider.clone(),
            self.slot.clone(),
            self.generation.clone(),
            self.last_good.clone(),
        ));
        generation
    }

    /// Result for the current generation, starting it once `delay` has
    /// passed without a newer change.
    pub fn request(&self, delay: Duration) -> Computation<T> {
        self.debouncer.get(delay)
    }

    pub fn request_now(&self) -> Computation<T> {
        self.debouncer.get(Duration::ZERO)
    }

    /// Value of the newest computation that succeeded while current.
    pub fn latest(&self) -> Option<T> {
        self.last_good.load_full().map(|s| s.value.clone())
    }

    pub fn latest_snapshot(&self) -> Option<Arc<Snapshot<T>>> {
        self.last_good.load_full()
    }

    /// The in-flight or most recent provider computation.
    pub fn current(&self) -> Option<Computation<T>> {
        self.slot.current()
    }

    pub fn is_debouncing(&self) -> bool {
        self.debouncer.has_pending_retry()
    }

    /// Drop the pending debounce and cancel the in-flight computation.
    pub fn cancel(&self) {
        self.debouncer.cancel();
        if let Some(cleared) = self.slot.clear() {
            log::debug!("Cancelled computation {:#x} for {:?}", cleared.id(), self.key);
        }
    }
}

fn make_producer<K, T>(
    key: K,
    provider: Arc<dyn AnalysisProvider<K, T>>,
    slot: SupersedingSlot<T>,
    generation: Arc<AtomicU64>,
    last_good: Arc<ArcSwapOption<Snapshot<T>>>,
) -> Arc<LazyComputation<T>>
where
    K: fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    Arc::new(LazyComputation::new(move || {
        let started_at = generation.load(Ordering::Acquire);
        let computation = provider.recompute(&key);
        log::debug!(
            "Recomputing {:?} (generation {}, computation {:#x})",
            key,
            started_at,
            computation.id()
        );

        let view = slot.replace(computation.clone());
        let id = computation.id();
        let watched = slot.clone();
        computation.on_settled(move |outcome| {
            let Ok(value) = outcome else {
                return;
            };
            if !watched.current().is_some_and(|c| c.id() == id) {
                return;
            }
            record(
                &last_good,
                Snapshot {
                    generation: started_at,
                    computation: id,
                    value: value.clone(),
                },
            );
        });
        view
    }))
}

/// Store `snapshot` unless a newer generation is already recorded.
fn record<T>(last_good: &ArcSwapOption<Snapshot<T>>, snapshot: Snapshot<T>) {
    let snapshot = Arc::new(snapshot);
    loop {
        let observed = last_good.load_full();
        if observed
            .as_ref()
            .is_some_and(|o| o.generation > snapshot.generation)
        {
            return;
        }
        let previous = last_good.compare_and_swap(&observed, Some(snapshot.clone()));
        let won = match (&*previous, &observed) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if won {
            return;
        }
    }
}
