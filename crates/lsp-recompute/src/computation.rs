//
// computation.rs
//
// Cancellable computations: a pending result paired with an interrupt action
//

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::error::{ComputationError, Outcome};

/// Interrupt action invoked at most once, and only before the result settles.
pub type Interrupt = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

enum State<T> {
    Pending {
        interrupt: Option<Interrupt>,
        callbacks: Vec<Callback<T>>,
        /// The interrupt action is running outside the lock
        interrupting: bool,
        /// Outcome that arrived while interrupting; published afterwards
        deferred: Option<Outcome<T>>,
    },
    Settled(Outcome<T>),
}

struct Inner<T> {
    id: u64,
    state: Mutex<State<T>>,
    /// Flipped to `true` under the state lock when the outcome is stored
    settled: watch::Sender<bool>,
}

impl<T: Clone> Inner<T> {
    fn new(interrupt: Option<Interrupt>) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::Pending {
                interrupt,
                callbacks: Vec::new(),
                interrupting: false,
                deferred: None,
            }),
            settled,
        }
    }

    /// Store the outcome and run continuations. Returns false if already settled.
    ///
    /// An outcome arriving while the interrupt runs is held back until the
    /// interrupt returns, so the interrupt never sees a settled computation.
    fn settle(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            State::Settled(_) => return false,
            State::Pending {
                interrupting: true,
                deferred,
                ..
            } => {
                if deferred.is_some() {
                    return false;
                }
                *deferred = Some(outcome);
                return true;
            }
            State::Pending { .. } => {}
        }
        self.publish(state, outcome);
        true
    }

    /// Called once the interrupt action has returned.
    fn finish_interrupt(&self) {
        let mut state = self.state.lock();
        let deferred = match &mut *state {
            State::Pending {
                interrupting,
                deferred,
                ..
            } => {
                *interrupting = false;
                deferred.take()
            }
            State::Settled(_) => None,
        };
        if let Some(outcome) = deferred {
            self.publish(state, outcome);
        }
    }

    fn publish(&self, mut state: MutexGuard<'_, State<T>>, outcome: Outcome<T>) {
        let previous = std::mem::replace(&mut *state, State::Settled(outcome.clone()));
        self.settled.send_replace(true);
        drop(state);

        // The interrupt is dropped unused here: it can no longer fire.
        if let State::Pending { callbacks, .. } = previous {
            for callback in callbacks {
                callback(&outcome);
            }
        }
    }
}

/// An in-flight or completed asynchronous result of type `T`.
///
/// Cloning is cheap and yields a handle to the same computation; identity is
/// compared with [`Computation::same_as`]. Observers suspend on
/// [`Computation::result`] or chain a continuation with
/// [`Computation::on_settled`]; neither blocks a thread.
pub struct Computation<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Computation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(*self.inner.state.lock(), State::Settled(_));
        f.debug_struct("Computation")
            .field("id", &self.id())
            .field("done", &done)
            .finish()
    }
}

impl<T> Computation<T> {
    /// Process-unique identity of this computation (shared by all clones).
    /// Never reused, even after the computation is dropped.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn same_as(&self, other: &Computation<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Settled(_))
    }

    /// Invoke the interrupt action if the result is not yet available.
    ///
    /// Returns true if the interrupt ran. Calling this after completion, or a
    /// second time, is a no-op. A failing or panicking interrupt is logged and
    /// otherwise ignored.
    pub fn cancel(&self) -> bool
    where
        T: Clone,
    {
        let interrupt = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending {
                    interrupt,
                    interrupting,
                    ..
                } => {
                    let taken = interrupt.take();
                    *interrupting = taken.is_some();
                    taken
                }
                State::Settled(_) => None,
            }
        };
        let Some(interrupt) = interrupt else {
            return false;
        };

        log::trace!("Interrupting computation {:#x}", self.id());
        match catch_unwind(AssertUnwindSafe(interrupt)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("Interrupt action failed: {:#}", err),
            Err(payload) => log::warn!(
                "Interrupt action panicked: {}",
                ComputationError::from_panic(payload)
            ),
        }
        self.inner.finish_interrupt();
        true
    }
}

impl<T: Clone + Send + Sync + 'static> Computation<T> {
    /// Create an unsettled computation and the handle that settles it.
    pub fn pending<F>(interrupt: F) -> (Self, Completer<T>)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self::with_interrupt(Some(Box::new(interrupt)))
    }

    /// Like [`Computation::pending`], with no interrupt action.
    pub fn uninterruptible() -> (Self, Completer<T>) {
        Self::with_interrupt(None)
    }

    fn with_interrupt(interrupt: Option<Interrupt>) -> (Self, Completer<T>) {
        let inner = Arc::new(Inner::new(interrupt));
        let completer = Completer {
            inner: Some(inner.clone()),
        };
        (Self { inner }, completer)
    }

    /// An already-settled computation.
    pub fn ready(outcome: Outcome<T>) -> Self {
        let (computation, completer) = Self::uninterruptible();
        completer.complete(outcome);
        computation
    }

    /// Run `work` on the tokio runtime, pairing it with `interrupt`.
    ///
    /// Interrupting is advisory: the future keeps running unless it observes
    /// whatever signal `interrupt` raises.
    pub fn start<Fut, F>(work: Fut, interrupt: F) -> Self
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let (computation, completer) = Self::pending(interrupt);
        let handle = tokio::spawn(work);
        tokio::spawn(async move {
            completer.complete(settle_join(handle.await, false));
        });
        computation
    }

    /// Run `work` on the tokio runtime with a cancellation token that the
    /// interrupt action cancels. An error returned after cancellation settles
    /// as [`ComputationError::Cancelled`].
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let interrupt_token = token.clone();
        let (computation, completer) = Self::pending(move || {
            interrupt_token.cancel();
            Ok(())
        });
        let handle = tokio::spawn(work(token.clone()));
        tokio::spawn(async move {
            completer.complete(settle_join(handle.await, token.is_cancelled()));
        });
        computation
    }

    /// The settled outcome, if available.
    pub fn try_result(&self) -> Option<Outcome<T>> {
        match &*self.inner.state.lock() {
            State::Settled(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Wait for the outcome.
    pub async fn result(&self) -> Outcome<T> {
        let mut settled = self.inner.settled.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = settled.wait_for(|done| *done).await;
        self.try_result().unwrap_or(Err(ComputationError::Abandoned))
    }

    /// Chain a continuation that runs exactly once with the outcome.
    ///
    /// Runs immediately on the calling thread if already settled, otherwise on
    /// whichever thread settles the computation. Continuations must not block.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending { callbacks, .. } => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        callback(&outcome);
    }

    /// Settle `completer` with this computation's outcome once available.
    pub fn forward_to(&self, completer: Completer<T>) {
        self.on_settled(move |outcome| {
            completer.complete(outcome.clone());
        });
    }
}

/// Map a joined task into an outcome.
pub(crate) fn settle_join<T>(
    joined: Result<anyhow::Result<T>, JoinError>,
    cancelled: bool,
) -> Outcome<T> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) if cancelled => Err(ComputationError::Cancelled),
        Ok(Err(err)) => Err(ComputationError::failed(err)),
        Err(err) if err.is_panic() => Err(ComputationError::from_panic(err.into_panic())),
        Err(_) => Err(ComputationError::Cancelled),
    }
}

/// Settles exactly one [`Computation`].
///
/// Dropping a completer without calling [`Completer::complete`] settles the
/// computation with [`ComputationError::Abandoned`] so that no observer waits
/// forever.
pub struct Completer<T: Clone> {
    inner: Option<Arc<Inner<T>>>,
}

impl<T: Clone> Completer<T> {
    /// Returns false if the computation had already settled.
    pub fn complete(mut self, outcome: Outcome<T>) -> bool {
        match self.inner.take() {
            Some(inner) => inner.settle(outcome),
            None => false,
        }
    }

    pub fn succeed(self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(self, err: anyhow::Error) -> bool {
        self.complete(Err(ComputationError::failed(err)))
    }
}

impl<T: Clone> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.settle(Err(ComputationError::Abandoned)) {
                log::debug!("Computation abandoned without a result");
            }
        }
    }
}
