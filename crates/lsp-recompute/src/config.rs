//
// config.rs
//
// Tunables for debouncing, worker pool sizing and summary caching
//

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_DEBOUNCE_MS: u64 = 200;
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 25;
pub const DEFAULT_SUMMARY_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_SUMMARY_CACHE_TTL_MS: u64 = 30_000;

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Settings read from the `recompute` section of the client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecomputeConfig {
    /// Delay applied by `Session::changed` before recomputing
    pub debounce_ms: u64,
    /// Period at which a pending debounce re-checks its deadline
    pub retry_period_ms: u64,
    pub worker_threads: usize,
    pub summary_cache_capacity: usize,
    pub summary_cache_ttl_ms: u64,
}

impl Default for RecomputeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            retry_period_ms: DEFAULT_RETRY_PERIOD_MS,
            worker_threads: default_worker_threads(),
            summary_cache_capacity: DEFAULT_SUMMARY_CACHE_CAPACITY,
            summary_cache_ttl_ms: DEFAULT_SUMMARY_CACHE_TTL_MS,
        }
    }
}

impl RecomputeConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Never zero; a zero period would spin the timer.
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms.max(1))
    }

    pub fn summary_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.summary_cache_ttl_ms)
    }
}

/// Parse the `recompute` section of initialization options or workspace
/// settings. Only keys that are present override the defaults; returns
/// `None` when the section is missing.
pub fn parse_config(settings: &serde_json::Value) -> Option<RecomputeConfig> {
    let section = settings.get("recompute")?;
    let mut config = RecomputeConfig::default();

    if let Some(v) = section.get("debounceMs").and_then(|v| v.as_u64()) {
        config.debounce_ms = v;
    }
    if let Some(v) = section.get("retryPeriodMs").and_then(|v| v.as_u64()) {
        if v == 0 {
            log::warn!("retryPeriodMs must be positive; keeping {}", config.retry_period_ms);
        } else {
            config.retry_period_ms = v;
        }
    }
    if let Some(v) = section.get("workerThreads").and_then(|v| v.as_u64()) {
        if v == 0 {
            log::warn!("workerThreads must be positive; keeping {}", config.worker_threads);
        } else {
            config.worker_threads = v as usize;
        }
    }
    if let Some(v) = section.get("summaryCacheCapacity").and_then(|v| v.as_u64()) {
        config.summary_cache_capacity = v as usize;
    }
    if let Some(v) = section.get("summaryCacheTtlMs").and_then(|v| v.as_u64()) {
        config.summary_cache_ttl_ms = v;
    }

    log::trace!("Parsed recompute config: {:?}", config);
    Some(config)
}
