//
// session.rs
//
// Server-side entry point: tracks open resources, routes change and request
// events to their controllers, and feeds producer passes into diagnostics
//

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tower_lsp::lsp_types::{Diagnostic, Url};

use crate::computation::Computation;
use crate::config::RecomputeConfig;
use crate::controller::{AnalysisProvider, ResourceController};
use crate::diagnostics::{DiagnosticAggregator, DiagnosticsNotifier};
use crate::lazy_cache::LazyCache;
use crate::perf::RecomputeCounters;
use crate::scheduler::DelayScheduler;
use crate::summary_cache::SummaryCache;
use crate::vfs::VfsContext;

/// One producer pass: the complete diagnostics it has for every file.
pub type FileDiagnostics = HashMap<Url, Vec<Diagnostic>>;

type Controllers<K, T> = DashMap<K, Arc<ResourceController<K, T>>>;
type SummaryKey<K> = (K, u64, TypeId);
type Summary = Arc<dyn Any + Send + Sync>;

pub struct Session<K, T, P>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    config: RecomputeConfig,
    scheduler: DelayScheduler,
    provider: Arc<dyn AnalysisProvider<K, T>>,
    controllers: Arc<Controllers<K, T>>,
    open_keys: LazyCache<Vec<K>>,
    aggregator: Arc<DiagnosticAggregator<P>>,
    summaries: SummaryCache<SummaryKey<K>, Summary>,
    vfs: Arc<VfsContext>,
}

impl<K, T, P> fmt::Debug for Session<K, T, P>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("open", &self.controllers.len())
            .field("summaries", &self.summaries)
            .field("vfs", &self.vfs)
            .finish_non_exhaustive()
    }
}

impl<K, T, P> Session<K, T, P>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    P: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Build a session with its own worker pool sized from `config`.
    pub fn new(
        config: RecomputeConfig,
        provider: Arc<dyn AnalysisProvider<K, T>>,
        notifier: Arc<dyn DiagnosticsNotifier>,
    ) -> anyhow::Result<Self> {
        let scheduler = DelayScheduler::new(config.worker_threads)?;
        Ok(Self::with_scheduler(config, scheduler, provider, notifier))
    }

    /// Build a session on an existing scheduler, typically one the provider
    /// also submits its work to.
    pub fn with_scheduler(
        config: RecomputeConfig,
        scheduler: DelayScheduler,
        provider: Arc<dyn AnalysisProvider<K, T>>,
        notifier: Arc<dyn DiagnosticsNotifier>,
    ) -> Self {
        let controllers: Arc<Controllers<K, T>> = Arc::new(DashMap::new());
        let listed = controllers.clone();
        let open_keys = LazyCache::new(Vec::new(), move |_| {
            listed.iter().map(|entry| entry.key().clone()).collect()
        });
        log::info!(
            "Recompute session started with {} worker(s), debounce {:?}",
            scheduler.worker_threads(),
            config.debounce()
        );
        Self {
            summaries: SummaryCache::new(config.summary_cache_capacity, config.summary_cache_ttl()),
            config,
            scheduler,
            provider,
            controllers,
            open_keys,
            aggregator: Arc::new(DiagnosticAggregator::new(notifier)),
            vfs: Arc::new(VfsContext::new()),
        }
    }

    /// Share `vfs` with whatever else resolves resources, such as the provider.
    pub fn with_vfs(mut self, vfs: Arc<VfsContext>) -> Self {
        self.vfs = vfs;
        self
    }

    pub fn config(&self) -> &RecomputeConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &DelayScheduler {
        &self.scheduler
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticAggregator<P>> {
        &self.aggregator
    }

    pub fn vfs(&self) -> &Arc<VfsContext> {
        &self.vfs
    }

    fn controller(&self, key: &K) -> Option<Arc<ResourceController<K, T>>> {
        // Clone out so no map shard lock is held while the provider runs
        self.controllers.get(key).map(|entry| entry.value().clone())
    }

    /// Start tracking `key`. Returns false if it was already open.
    pub fn open(&self, key: K) -> bool {
        if self.controllers.contains_key(&key) {
            return false;
        }
        let inserted = match self.controllers.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(ResourceController::new(
                    key.clone(),
                    self.provider.clone(),
                    self.scheduler.clone(),
                    self.config.retry_period(),
                )));
                true
            }
        };
        if inserted {
            log::debug!("Opened {:?}", key);
            self.open_keys.invalidate();
        }
        inserted
    }

    pub fn is_open(&self, key: &K) -> bool {
        self.controllers.contains_key(key)
    }

    /// Keys currently open. Recomputed only after an open or close.
    pub fn open_keys(&self) -> Vec<K> {
        self.open_keys.get()
    }

    /// `key` changed: schedule a recompute after the configured debounce.
    /// Returns `None` if `key` is not open.
    pub fn changed(&self, key: &K) -> Option<Computation<T>> {
        let controller = self.controller(key)?;
        controller.update();
        Some(controller.request(self.config.debounce()))
    }

    /// Result for the current version of `key`, started no sooner than `delay`
    /// after the last change. Returns `None` if `key` is not open.
    pub fn request(&self, key: &K, delay: Duration) -> Option<Computation<T>> {
        Some(self.controller(key)?.request(delay))
    }

    pub fn request_now(&self, key: &K) -> Option<Computation<T>> {
        Some(self.controller(key)?.request_now())
    }

    /// Most recent successful result for `key`, without starting anything.
    pub fn latest(&self, key: &K) -> Option<T> {
        self.controller(key)?.latest()
    }

    /// Derive a value from the latest result of `key`, memoized per result
    /// and per summary type until it ages out of the cache.
    pub fn summary<S, F>(&self, key: &K, summarize: F) -> Option<S>
    where
        S: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> S,
    {
        let snapshot = self.controller(key)?.latest_snapshot()?;
        let cache_key = (key.clone(), snapshot.computation, TypeId::of::<S>());
        let cached = self.summaries.get_or_insert_with(cache_key, || {
            log::trace!("Computing summary for {:?}", key);
            Arc::new(summarize(&snapshot.value)) as Summary
        });
        cached.downcast::<S>().ok().map(|s| S::clone(&s))
    }

    /// Stop tracking `key`: cancel its work and forget its summaries.
    /// Returns false if it was not open.
    pub fn close(&self, key: &K) -> bool {
        let Some((_, controller)) = self.controllers.remove(key) else {
            return false;
        };
        controller.cancel();
        self.summaries.remove_where(|(k, _, _)| k == key);
        self.open_keys.invalidate();
        log::debug!("Closed {:?}", key);
        true
    }

    /// Publish the outcome of a producer pass once it settles. Failed or
    /// cancelled passes leave the producer's previous diagnostics in place.
    pub fn report(&self, project: P, pass: Computation<FileDiagnostics>) {
        let aggregator = self.aggregator.clone();
        pass.on_settled(move |outcome| match outcome {
            Ok(files) => {
                aggregator.publish(project, files.clone());
            }
            Err(err) if err.is_cancelled() => {
                log::debug!("Diagnostics pass for {:?} cancelled", project);
            }
            Err(err) => {
                log::warn!("Diagnostics pass for {:?} failed: {}", project, err);
            }
        });
    }

    pub fn clear_project(&self, project: &P) -> usize {
        self.aggregator.clear(project)
    }

    /// Cancel everything and release the worker pool timer and VFS connection.
    pub async fn shutdown(&self) {
        let keys: Vec<K> = self.controllers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.close(&key);
        }
        self.summaries.clear();
        self.vfs.close().await;
        self.scheduler.shutdown();
        RecomputeCounters::snapshot().log_summary();
        log::info!("Recompute session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<(Url, usize)>>,
    }

    impl DiagnosticsNotifier for Recorder {
        fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
            self.published.lock().push((uri, diagnostics.len()));
        }
    }

    fn session() -> (Session<String, usize, &'static str>, Arc<AtomicUsize>, Arc<Recorder>) {
        crate::test_utils::init_logging();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = move |key: &String| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Computation::ready(Ok(key.len() * 100 + n))
        };
        let config = RecomputeConfig {
            debounce_ms: 20,
            retry_period_ms: 5,
            worker_threads: 2,
            ..RecomputeConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let session = Session::new(config, Arc::new(provider), recorder.clone()).unwrap();
        (session, calls, recorder)
    }

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///{name}")).unwrap()
    }

    #[tokio::test]
    async fn test_open_close_tracks_keys() {
        let (session, _, _) = session();
        assert!(session.open("a".to_string()));
        assert!(!session.open("a".to_string()));
        assert!(session.open("bb".to_string()));

        let mut keys = session.open_keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "bb".to_string()]);

        assert!(session.close(&"a".to_string()));
        assert!(!session.close(&"a".to_string()));
        assert_eq!(session.open_keys(), vec!["bb".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_key_is_none() {
        let (session, calls, _) = session();
        let missing = "nope".to_string();
        assert!(session.changed(&missing).is_none());
        assert!(session.request_now(&missing).is_none());
        assert!(session.latest(&missing).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_changed_debounces_then_latest() {
        let (session, calls, _) = session();
        let key = "a".to_string();
        session.open(key.clone());

        let first = session.changed(&key).unwrap();
        let second = session.changed(&key).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(first.result().await.unwrap(), 101);
        assert_eq!(second.result().await.unwrap(), 101);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.latest(&key), Some(101));
    }

    #[tokio::test]
    async fn test_summary_is_memoized_per_result() {
        let (session, _, _) = session();
        let key = "abc".to_string();
        session.open(key.clone());
        session.request_now(&key).unwrap().result().await.unwrap();

        let summarized = AtomicUsize::new(0);
        let summarize = |value: &usize| {
            summarized.fetch_add(1, Ordering::SeqCst);
            format!("value={value}")
        };
        assert_eq!(session.summary(&key, summarize).as_deref(), Some("value=301"));
        assert_eq!(session.summary(&key, summarize).as_deref(), Some("value=301"));
        assert_eq!(summarized.load(Ordering::SeqCst), 1);

        // A different summary type does not collide
        assert_eq!(session.summary(&key, |v: &usize| *v as u64 * 2), Some(602));

        session.changed(&key).unwrap().result().await.unwrap();
        assert_eq!(session.summary(&key, summarize).as_deref(), Some("value=302"));
        assert_eq!(summarized.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_summary_follows_every_new_result() {
        crate::test_utils::init_logging();
        let counter = AtomicUsize::new(0);
        let provider = move |_: &String| {
            Computation::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
        };
        let config = RecomputeConfig {
            debounce_ms: 0,
            ..RecomputeConfig::default()
        };
        let session: Session<String, usize, &str> =
            Session::new(config, Arc::new(provider), Arc::new(Recorder::default())).unwrap();
        let key = "cycle.R".to_string();
        session.open(key.clone());

        // Superseded results are freed each round; their summaries must never resurface
        for round in 1..=200 {
            let value = session.changed(&key).unwrap().result().await.unwrap();
            assert_eq!(value, round);
            assert_eq!(session.latest(&key), Some(round));
            assert_eq!(session.summary(&key, |v: &usize| *v), Some(round));
        }
    }

    #[tokio::test]
    async fn test_report_publishes_success_and_skips_failure() {
        let (session, _, recorder) = session();
        let f = uri("f.R");

        let mut files = FileDiagnostics::new();
        files.insert(f.clone(), vec![Diagnostic::default()]);
        session.report("lint", Computation::ready(Ok(files)));
        assert_eq!(recorder.published.lock().clone(), vec![(f.clone(), 1)]);

        let failed = Computation::ready(Err(crate::error::ComputationError::failed(
            anyhow::anyhow!("boom"),
        )));
        session.report("lint", failed);
        assert_eq!(session.diagnostics().diagnostics_for(&f).len(), 1);

        assert_eq!(session.clear_project(&"lint"), 1);
        assert_eq!(recorder.published.lock().last(), Some(&(f, 0)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (session, _, _) = session();
        session.open("a".to_string());
        session.vfs().connect(Arc::new(crate::vfs::LocalFsConnection)).await;

        session.shutdown().await;
        assert!(session.open_keys().is_empty());
        assert!(!session.vfs().is_connected());
    }
}
