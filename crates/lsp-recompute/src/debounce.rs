//
// debounce.rs
//
// Debounced initialization of lazily-started computations
//

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::computation::{Completer, Computation};
use crate::error::ComputationError;
use crate::perf;
use crate::scheduler::{DelayScheduler, ScheduledTask};

type Init<T> = Box<dyn FnOnce() -> Computation<T> + Send + 'static>;

/// A computation that is started on first demand.
///
/// The init closure runs at most once, no matter how many callers race on
/// [`LazyComputation::force`].
pub struct LazyComputation<T> {
    started: OnceLock<Computation<T>>,
    init: Mutex<Option<Init<T>>>,
}

impl<T> fmt::Debug for LazyComputation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyComputation")
            .field("started", &self.started.get())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> LazyComputation<T> {
    pub fn new<F>(init: F) -> Self
    where
        F: FnOnce() -> Computation<T> + Send + 'static,
    {
        Self {
            started: OnceLock::new(),
            init: Mutex::new(Some(Box::new(init))),
        }
    }

    /// A producer that is already initialized with `computation`.
    pub fn started(computation: Computation<T>) -> Self {
        let started = OnceLock::new();
        let _ = started.set(computation);
        Self {
            started,
            init: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.started.get().is_some()
    }

    /// The in-flight or completed computation, if started.
    pub fn current(&self) -> Option<Computation<T>> {
        self.started.get().cloned()
    }

    /// Start the computation now, or return it if already started.
    ///
    /// A panicking init settles the producer as
    /// [`ComputationError::Panicked`] instead of unwinding into the caller.
    pub fn force(&self) -> Computation<T> {
        self.started
            .get_or_init(|| {
                let Some(init) = self.init.lock().take() else {
                    return Computation::ready(Err(ComputationError::Abandoned));
                };
                match catch_unwind(AssertUnwindSafe(init)) {
                    Ok(computation) => computation,
                    Err(payload) => {
                        let err = ComputationError::from_panic(payload);
                        log::warn!("Producer initialization panicked: {}", err);
                        Computation::ready(Err(err))
                    }
                }
            })
            .clone()
    }
}

/// Outstanding retry: a waiter handed to callers, settled once the debounce
/// resolves.
struct Retry<T: Clone> {
    waiter: Computation<T>,
    completer: Mutex<Option<Completer<T>>>,
    timer: Mutex<Option<ScheduledTask>>,
}

impl<T: Clone + Send + Sync + 'static> Retry<T> {
    fn new() -> Arc<Self> {
        let (waiter, completer) = Computation::uninterruptible();
        Arc::new(Self {
            waiter,
            completer: Mutex::new(Some(completer)),
            timer: Mutex::new(None),
        })
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn resolve_with(&self, target: &Computation<T>) {
        self.stop_timer();
        if let Some(completer) = self.completer.lock().take() {
            target.forward_to(completer);
        }
    }

    fn abandon(&self, err: ComputationError) {
        self.stop_timer();
        if let Some(completer) = self.completer.lock().take() {
            completer.complete(Err(err));
        }
    }
}

/// Immutable snapshot of the debounce bookkeeping; replaced wholesale by CAS.
struct DebounceState<T: Clone> {
    remaining: Duration,
    retry: Option<Arc<Retry<T>>>,
}

impl<T: Clone> DebounceState<T> {
    fn idle() -> Self {
        Self {
            remaining: Duration::ZERO,
            retry: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.remaining.is_zero() && self.retry.is_none()
    }

    fn holds(&self, retry: &Arc<Retry<T>>) -> bool {
        self.retry.as_ref().is_some_and(|r| Arc::ptr_eq(r, retry))
    }
}

struct DebouncerInner<T: Clone> {
    producer: ArcSwap<LazyComputation<T>>,
    state: ArcSwap<DebounceState<T>>,
    scheduler: DelayScheduler,
    retry_period: Duration,
}

/// Decides when a lazily-started producer is forced.
///
/// `get(delay)` returns the producer's computation right away if it has
/// started, forces it once the (merged) delay has elapsed, and otherwise
/// waits it out with short periodic retries of `retry_period` instead of one
/// long timer. Concurrent requests merge by taking the larger remaining delay
/// and share one outstanding retry.
pub struct Debouncer<T: Clone> {
    inner: Arc<DebouncerInner<T>>,
}

impl<T: Clone> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for Debouncer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.load();
        f.debug_struct("Debouncer")
            .field("remaining", &state.remaining)
            .field("retry_pending", &state.retry.is_some())
            .field("retry_period", &self.inner.retry_period)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Debouncer<T> {
    pub fn new(
        producer: Arc<LazyComputation<T>>,
        scheduler: DelayScheduler,
        retry_period: Duration,
    ) -> Self {
        let retry_period = if retry_period.is_zero() {
            log::warn!("Debounce retry period must be positive; using 1ms");
            Duration::from_millis(1)
        } else {
            retry_period
        };
        Self {
            inner: Arc::new(DebouncerInner {
                producer: ArcSwap::new(producer),
                state: ArcSwap::from_pointee(DebounceState::idle()),
                scheduler,
                retry_period,
            }),
        }
    }

    pub fn producer(&self) -> Arc<LazyComputation<T>> {
        self.inner.producer.load_full()
    }

    /// Swap in a newer producer. An outstanding retry keeps its remaining
    /// delay and resolves against the new producer.
    pub fn set_producer(&self, producer: Arc<LazyComputation<T>>) {
        self.inner.producer.store(producer);
    }

    /// Delay still to wait out before the producer is forced.
    pub fn remaining(&self) -> Duration {
        self.inner.state.load().remaining
    }

    pub fn has_pending_retry(&self) -> bool {
        self.inner.state.load().retry.is_some()
    }

    pub fn retry_period(&self) -> Duration {
        self.inner.retry_period
    }

    pub fn get(&self, delay: Duration) -> Computation<T> {
        self.inner.get(delay)
    }

    /// Drop any outstanding retry without forcing the producer. Callers
    /// waiting on it settle with [`ComputationError::Cancelled`].
    pub fn cancel(&self) {
        loop {
            let observed = self.inner.state.load_full();
            if observed.is_idle() {
                return;
            }
            if self.inner.transition(&observed, DebounceState::idle()) {
                if let Some(retry) = &observed.retry {
                    log::trace!("Debounce retry cancelled");
                    retry.abandon(ComputationError::Cancelled);
                }
                return;
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> DebouncerInner<T> {
    /// Atomically move from `observed` to `next`. False if another thread won.
    fn transition(&self, observed: &Arc<DebounceState<T>>, next: DebounceState<T>) -> bool {
        let previous = self.state.compare_and_swap(observed, Arc::new(next));
        Arc::ptr_eq(&previous, observed)
    }

    /// Go idle and hand `target` to whoever waits on the outstanding retry.
    fn settle(&self, observed: &Arc<DebounceState<T>>, target: &Computation<T>) -> bool {
        if observed.is_idle() {
            return true;
        }
        if !self.transition(observed, DebounceState::idle()) {
            return false;
        }
        if let Some(retry) = &observed.retry {
            retry.resolve_with(target);
        }
        true
    }

    fn get(self: &Arc<Self>, delay: Duration) -> Computation<T> {
        loop {
            let observed = self.state.load_full();
            let producer = self.producer.load_full();

            if let Some(current) = producer.current() {
                if self.settle(&observed, &current) {
                    return current;
                }
                continue;
            }

            let remaining = delay.max(observed.remaining);
            if remaining.is_zero() {
                let forced = producer.force();
                if self.settle(&observed, &forced) {
                    log::trace!("Debounce delay elapsed; forced producer");
                    perf::record_forced_initialization();
                    return forced;
                }
                continue;
            }

            match &observed.retry {
                None => {
                    let retry = Retry::new();
                    let next = DebounceState {
                        remaining,
                        retry: Some(retry.clone()),
                    };
                    if self.transition(&observed, next) {
                        log::trace!(
                            "Debouncing for {:?} in steps of {:?}",
                            remaining,
                            self.retry_period
                        );
                        self.schedule_tick(&retry);
                        return retry.waiter.clone();
                    }
                }
                Some(retry) => {
                    if remaining == observed.remaining {
                        return retry.waiter.clone();
                    }
                    let next = DebounceState {
                        remaining,
                        retry: Some(retry.clone()),
                    };
                    if self.transition(&observed, next) {
                        return retry.waiter.clone();
                    }
                }
            }
        }
    }

    fn schedule_tick(self: &Arc<Self>, retry: &Arc<Retry<T>>) {
        let inner = Arc::clone(self);
        let ticking = retry.clone();
        let task = self
            .scheduler
            .schedule(self.retry_period, move || inner.tick(&ticking));
        *retry.timer.lock() = Some(task);
    }

    /// One retry step: re-evaluate, then either resolve or wait another period.
    fn tick(self: &Arc<Self>, retry: &Arc<Retry<T>>) {
        perf::record_debounce_tick();
        loop {
            let observed = self.state.load_full();
            if !observed.holds(retry) {
                // Resolved or cancelled by someone else
                return;
            }
            let producer = self.producer.load_full();

            if let Some(current) = producer.current() {
                if self.settle(&observed, &current) {
                    return;
                }
                continue;
            }

            let remaining = observed.remaining.saturating_sub(self.retry_period);
            if remaining.is_zero() {
                let forced = producer.force();
                if self.settle(&observed, &forced) {
                    log::trace!("Debounce retry exhausted delay; forced producer");
                    perf::record_forced_initialization();
                    return;
                }
                continue;
            }

            let next = DebounceState {
                remaining,
                retry: Some(retry.clone()),
            };
            if self.transition(&observed, next) {
                self.schedule_tick(retry);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const PERIOD: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(5);
    // Scheduling slack for loaded CI machines
    const SLACK: Duration = Duration::from_millis(250);

    fn counting_producer(value: u32, inits: &Arc<AtomicUsize>) -> Arc<LazyComputation<u32>> {
        let inits = inits.clone();
        Arc::new(LazyComputation::new(move || {
            inits.fetch_add(1, Ordering::SeqCst);
            Computation::ready(Ok(value))
        }))
    }

    fn debouncer(producer: Arc<LazyComputation<u32>>) -> Debouncer<u32> {
        let scheduler = DelayScheduler::new(2).unwrap();
        Debouncer::new(producer, scheduler, PERIOD)
    }

    async fn await_value(computation: Computation<u32>) -> u32 {
        tokio::time::timeout(WAIT, computation.result())
            .await
            .expect("debounced result timed out")
            .unwrap()
    }

    #[test]
    fn test_lazy_computation_runs_init_once() {
        let inits = Arc::new(AtomicUsize::new(0));
        let producer = counting_producer(1, &inits);
        assert!(!producer.is_initialized());
        assert!(producer.current().is_none());

        let first = producer.force();
        let second = producer.force();
        assert!(first.same_as(&second));
        assert!(producer.is_initialized());
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialized_producer_returns_immediately() {
        let computation = Computation::ready(Ok(3u32));
        let producer = Arc::new(LazyComputation::started(computation.clone()));
        let debouncer = debouncer(producer);

        let result = debouncer.get(Duration::from_secs(60));
        assert!(result.same_as(&computation));
        assert!(!debouncer.has_pending_retry());
    }

    #[tokio::test]
    async fn test_zero_delay_forces_now() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(8, &inits));
        let result = debouncer.get(Duration::ZERO);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(await_value(result).await, 8);
    }

    #[tokio::test]
    async fn test_delay_elapses_then_forces_once() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(5, &inits));
        let delay = Duration::from_millis(60);

        let start = Instant::now();
        let result = debouncer.get(delay);
        assert!(debouncer.has_pending_retry());
        assert_eq!(inits.load(Ordering::SeqCst), 0);

        assert_eq!(await_value(result).await, 5);
        let elapsed = start.elapsed();
        assert!(elapsed >= delay, "resolved early after {elapsed:?}");
        assert!(elapsed <= delay + PERIOD + SLACK, "resolved late after {elapsed:?}");
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(!debouncer.has_pending_retry());
    }

    #[tokio::test]
    async fn test_concurrent_requests_force_exactly_once() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(13, &inits));
        let delay = Duration::from_millis(30);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let debouncer = debouncer.clone();
                std::thread::spawn(move || debouncer.get(delay))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for result in results {
            assert_eq!(await_value(result).await, 13);
        }
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_initialization_short_circuits_wait() {
        let inits = Arc::new(AtomicUsize::new(0));
        let producer = counting_producer(21, &inits);
        let debouncer = debouncer(producer.clone());
        let delay = Duration::from_secs(30);

        let start = Instant::now();
        let result = debouncer.get(delay);
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.force();

        assert_eq!(await_value(result).await, 21);
        assert!(start.elapsed() < Duration::from_millis(20) + PERIOD + SLACK);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_longer_request_extends_pending_wait() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(2, &inits));

        let start = Instant::now();
        let first = debouncer.get(Duration::from_millis(20));
        let second = debouncer.get(Duration::from_millis(120));
        assert!(first.same_as(&second));
        assert_eq!(debouncer.remaining(), Duration::from_millis(120));

        assert_eq!(await_value(first).await, 2);
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_shorter_request_never_shortens_wait() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(4, &inits));

        let start = Instant::now();
        let first = debouncer.get(Duration::from_millis(100));
        let second = debouncer.get(Duration::from_millis(10));
        assert!(first.same_as(&second));
        assert_eq!(debouncer.remaining(), Duration::from_millis(100));

        assert_eq!(await_value(second).await, 4);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_remaining_decreases_by_period_per_tick() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(0, &inits));
        let delay = Duration::from_millis(200);

        debouncer.get(delay);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let remaining = debouncer.remaining();
        assert!(remaining < delay, "no tick ran: {remaining:?}");
        assert!(remaining > Duration::ZERO);
        // Each tick removes exactly one period
        assert_eq!((delay - remaining).as_millis() % PERIOD.as_millis(), 0);
    }

    #[tokio::test]
    async fn test_cancel_settles_waiters_without_forcing() {
        let inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(6, &inits));

        let result = debouncer.get(Duration::from_millis(50));
        debouncer.cancel();
        assert!(!debouncer.has_pending_retry());

        let err = tokio::time::timeout(WAIT, result.result())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_producer_is_forced_instead_of_old() {
        let old_inits = Arc::new(AtomicUsize::new(0));
        let new_inits = Arc::new(AtomicUsize::new(0));
        let debouncer = debouncer(counting_producer(1, &old_inits));

        let result = debouncer.get(Duration::from_millis(40));
        debouncer.set_producer(counting_producer(2, &new_inits));

        assert_eq!(await_value(result).await, 2);
        assert_eq!(old_inits.load(Ordering::SeqCst), 0);
        assert_eq!(new_inits.load(Ordering::SeqCst), 1);
    }

    fn panicking_producer() -> Arc<LazyComputation<u32>> {
        Arc::new(LazyComputation::new(|| -> Computation<u32> {
            panic!("init exploded")
        }))
    }

    #[test]
    fn test_force_turns_init_panic_into_failure() {
        let producer = panicking_producer();
        let forced = producer.force();
        assert!(matches!(
            forced.try_result(),
            Some(Err(ComputationError::Panicked(ref m))) if m == "init exploded"
        ));
        assert!(forced.same_as(&producer.force()));
    }

    #[tokio::test]
    async fn test_init_panic_during_retry_settles_waiter() {
        let debouncer = debouncer(panicking_producer());

        let waiter = debouncer.get(Duration::from_millis(20));
        assert!(debouncer.has_pending_retry());
        let outcome = tokio::time::timeout(WAIT, waiter.result())
            .await
            .expect("waiter hung after init panic");
        assert!(matches!(outcome, Err(ComputationError::Panicked(_))));
        assert!(!debouncer.has_pending_retry());

        // The debouncer is idle again and serves the next producer
        let inits = Arc::new(AtomicUsize::new(0));
        debouncer.set_producer(counting_producer(9, &inits));
        assert_eq!(await_value(debouncer.get(Duration::from_millis(20))).await, 9);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
    }
}
