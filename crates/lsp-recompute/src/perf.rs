// perf.rs - Performance timing infrastructure for the recompute core
//
// Timing instrumentation and event counters for diagnosing recompute latency.
// Controlled via LSP_RECOMPUTE_PERF environment variable.
//
// Usage:
//   LSP_RECOMPUTE_PERF=1        # Enable basic timing logs
//   LSP_RECOMPUTE_PERF=verbose  # Enable detailed timing with thresholds

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Global flag indicating whether performance timing is enabled
static PERF_ENABLED: OnceLock<bool> = OnceLock::new();

/// Global flag indicating verbose mode (includes threshold warnings)
static PERF_VERBOSE: OnceLock<bool> = OnceLock::new();

/// Check if performance timing is enabled
pub fn is_enabled() -> bool {
    *PERF_ENABLED.get_or_init(|| {
        std::env::var("LSP_RECOMPUTE_PERF")
            .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
            .unwrap_or(false)
    })
}

/// Check if verbose mode is enabled
pub fn is_verbose() -> bool {
    *PERF_VERBOSE.get_or_init(|| {
        std::env::var("LSP_RECOMPUTE_PERF")
            .map(|v| v.to_lowercase() == "verbose")
            .unwrap_or(false)
    })
}

/// RAII timing guard that logs duration on drop
///
/// ```
/// use lsp_recompute::perf::TimingGuard;
///
/// let _guard = TimingGuard::new("operation_name");
/// // ... do work ...
/// // Duration logged when _guard goes out of scope
/// ```
pub struct TimingGuard {
    start: Instant,
    name: &'static str,
    threshold_warn_ms: Option<u64>,
    enabled: bool,
}

impl TimingGuard {
    /// Duration will be logged at INFO level when the guard is dropped.
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
            threshold_warn_ms: None,
            enabled: is_enabled(),
        }
    }

    /// If the operation takes longer than `threshold_ms`, a warning is logged
    /// in verbose mode.
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            name,
            threshold_warn_ms: Some(threshold_ms),
            enabled: is_enabled(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Consume the guard without logging and return the duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        std::mem::forget(self); // Prevent Drop from running
        elapsed
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }

        let elapsed = self.start.elapsed();
        log::info!("[PERF] {} completed in {:?}", self.name, elapsed);

        if let Some(threshold) = self.threshold_warn_ms {
            if elapsed.as_millis() > threshold as u128 && is_verbose() {
                log::warn!(
                    "[PERF] {} exceeded threshold ({}ms > {}ms)",
                    self.name,
                    elapsed.as_millis(),
                    threshold
                );
            }
        }
    }
}

static FORCED_INITIALIZATIONS: AtomicU64 = AtomicU64::new(0);
static DEBOUNCE_TICKS: AtomicU64 = AtomicU64::new(0);
static DIAGNOSTIC_NOTIFICATIONS: AtomicU64 = AtomicU64::new(0);

/// Counters for scheduling events since process start
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecomputeCounters {
    /// Producers started because a debounce deadline elapsed
    pub forced_initializations: u64,
    /// Retry ticks executed by debouncers
    pub debounce_ticks: u64,
    /// Per-file diagnostic notifications dispatched
    pub diagnostic_notifications: u64,
}

impl RecomputeCounters {
    pub fn snapshot() -> Self {
        Self {
            forced_initializations: FORCED_INITIALIZATIONS.load(Ordering::Relaxed),
            debounce_ticks: DEBOUNCE_TICKS.load(Ordering::Relaxed),
            diagnostic_notifications: DIAGNOSTIC_NOTIFICATIONS.load(Ordering::Relaxed),
        }
    }

    /// Log a summary of the counters
    pub fn log_summary(&self) {
        if !is_enabled() {
            return;
        }
        log::info!("[PERF] === Recompute Summary ===");
        log::info!("[PERF] Forced initializations: {}", self.forced_initializations);
        log::info!("[PERF] Debounce ticks: {}", self.debounce_ticks);
        log::info!(
            "[PERF] Diagnostic notifications: {}",
            self.diagnostic_notifications
        );
    }
}

pub(crate) fn record_forced_initialization() {
    FORCED_INITIALIZATIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_debounce_tick() {
    DEBOUNCE_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_diagnostic_notifications(count: usize) {
    DIAGNOSTIC_NOTIFICATIONS.fetch_add(count as u64, Ordering::Relaxed);
}
