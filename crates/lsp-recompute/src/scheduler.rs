//
// scheduler.rs
//
// Delay scheduling on top of a fixed-size worker pool.
//
// Work runs on a `rayon` pool. Delayed submissions go through one dedicated
// timer thread that only tracks deadlines and hands expired tasks to the
// pool; it never runs a task body itself, so long analyses cannot starve it.
//

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rayon::ThreadPool;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::computation::Computation;
use crate::error::ComputationError;
use crate::perf::TimingGuard;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum TimerCommand {
    Schedule(TimerEntry),
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle to a delayed task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Prevent the task from being handed to the pool. No effect once it has
    /// been handed off.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct SchedulerInner {
    pool: Arc<ThreadPool>,
    commands: Sender<TimerCommand>,
    timer: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
    /// Runtime entered around every job so work may spawn async tasks
    runtime: Option<Handle>,
}

impl SchedulerInner {
    fn wrap<F>(&self, job: F) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        match self.runtime.clone() {
            Some(runtime) => Box::new(move || {
                let _entered = runtime.enter();
                job()
            }),
            None => Box::new(job),
        }
    }

    fn stop_timer(&self) {
        let _ = self.commands.send(TimerCommand::Shutdown);
        if let Some(handle) = self.timer.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("Timer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

/// A worker pool that also accepts delayed submissions.
#[derive(Clone)]
pub struct DelayScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("workers", &self.inner.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl DelayScheduler {
    /// Jobs run inside the tokio runtime current at construction, if any.
    pub fn new(worker_threads: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .thread_name(|i| format!("recompute-worker-{i}"))
            .panic_handler(|payload| {
                log::error!(
                    "Worker task panicked: {}",
                    ComputationError::from_panic(payload)
                );
            })
            .build()
            .context("failed to build recompute worker pool")?;
        let pool = Arc::new(pool);

        let (commands, receiver) = crossbeam_channel::unbounded();
        let timer_pool = pool.clone();
        let timer = std::thread::Builder::new()
            .name("recompute-timer".to_string())
            .spawn(move || run_timer(receiver, timer_pool))
            .context("failed to spawn recompute timer thread")?;

        log::info!(
            "Recompute scheduler started with {} worker threads",
            pool.current_num_threads()
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                pool,
                commands,
                timer: Mutex::new(Some(timer)),
                next_seq: AtomicU64::new(0),
                runtime: Handle::try_current().ok(),
            }),
        })
    }

    pub fn worker_threads(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// Run `job` on the pool as soon as a worker is free.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.pool.spawn(self.inner.wrap(job));
    }

    /// Hand `job` to the pool once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = ScheduledTask {
            deadline: Instant::now() + delay,
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        if delay.is_zero() {
            self.execute(job);
            return handle;
        }

        let entry = TimerEntry {
            deadline: handle.deadline,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: handle.cancelled.clone(),
            job: self.inner.wrap(job),
        };
        if self
            .inner
            .commands
            .send(TimerCommand::Schedule(entry))
            .is_err()
        {
            log::warn!("Timer thread has stopped; dropping task delayed by {delay:?}");
            handle.cancel();
        }
        handle
    }

    /// Run `work` on the pool as a cancellable computation.
    ///
    /// Cancelling the returned computation cancels the token passed to `work`.
    /// Work that has not started by then is skipped.
    pub fn compute<T, F>(&self, work: F) -> Computation<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&CancellationToken) -> anyhow::Result<T> + Send + 'static,
    {
        let token = CancellationToken::new();
        let interrupt = token.clone();
        let (computation, completer) = Computation::pending(move || {
            interrupt.cancel();
            Ok(())
        });

        self.execute(move || {
            if token.is_cancelled() {
                completer.complete(Err(ComputationError::Cancelled));
                return;
            }
            let _timing = TimingGuard::with_threshold("recompute", 500);
            let outcome = match catch_unwind(AssertUnwindSafe(|| work(&token))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) if token.is_cancelled() => Err(ComputationError::Cancelled),
                Ok(Err(err)) => Err(ComputationError::failed(err)),
                Err(payload) => Err(ComputationError::from_panic(payload)),
            };
            completer.complete(outcome);
        });
        computation
    }

    /// Stop the timer thread. Pending delayed tasks are dropped; tasks already
    /// on the pool run to completion.
    pub fn shutdown(&self) {
        self.inner.stop_timer();
    }
}

fn run_timer(commands: Receiver<TimerCommand>, pool: Arc<ThreadPool>) {
    let mut queue: BinaryHeap<TimerEntry> = BinaryHeap::new();

    loop {
        let command = match queue.peek() {
            Some(next) => match commands.recv_deadline(next.deadline) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            },
        };

        match command {
            Some(TimerCommand::Schedule(entry)) => queue.push(entry),
            Some(TimerCommand::Shutdown) => break,
            None => {}
        }

        let now = Instant::now();
        while let Some(entry) = pop_due(&mut queue, now) {
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            pool.spawn(entry.job);
        }
    }

    log::debug!(
        "Recompute timer stopped ({} delayed tasks dropped)",
        queue.len()
    );
}

fn pop_due(queue: &mut BinaryHeap<TimerEntry>, now: Instant) -> Option<TimerEntry> {
    if queue.peek()?.deadline <= now {
        queue.pop()
    } else {
        None
    }
}
