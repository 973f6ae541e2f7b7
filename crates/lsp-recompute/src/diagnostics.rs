//
// diagnostics.rs
//
// Merges diagnostics from independent producers per file and decides which
// files must be re-published
//

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tower_lsp::lsp_types::{Diagnostic, Url};
use tower_lsp::Client;

use crate::perf;

/// Receives the merged diagnostics of one file.
///
/// Called outside the aggregator's lock, in the order the aggregation passes
/// happened. Implementations may call back into the aggregator.
pub trait DiagnosticsNotifier: Send + Sync {
    fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>);
}

/// Forwards notifications, in order, to an async sink running on tokio.
pub struct ForwardingNotifier {
    tx: mpsc::UnboundedSender<(Url, Vec<Diagnostic>)>,
}

impl ForwardingNotifier {
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(sink: F) -> Self
    where
        F: Fn(Url, Vec<Diagnostic>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Url, Vec<Diagnostic>)>();
        tokio::spawn(async move {
            while let Some((uri, diagnostics)) = rx.recv().await {
                sink(uri, diagnostics).await;
            }
            log::debug!("Diagnostics forwarder stopped");
        });
        Self { tx }
    }
}

impl DiagnosticsNotifier for ForwardingNotifier {
    fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
        if let Err(err) = self.tx.send((uri, diagnostics)) {
            let (uri, _) = err.0;
            log::warn!("Diagnostics forwarder has stopped; dropping update for {}", uri);
        }
    }
}

/// Publishes merged diagnostics to the editor through `textDocument/publishDiagnostics`.
pub struct LspClientNotifier {
    forwarder: ForwardingNotifier,
}

impl LspClientNotifier {
    pub fn spawn(client: Client) -> Self {
        let forwarder = ForwardingNotifier::spawn(move |uri, diagnostics| {
            let client = client.clone();
            async move {
                client.publish_diagnostics(uri, diagnostics, None).await;
            }
        });
        Self { forwarder }
    }
}

impl DiagnosticsNotifier for LspClientNotifier {
    fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
        self.forwarder.publish(uri, diagnostics);
    }
}

struct Table<P> {
    /// Producers in registration order; the index orders merged output
    projects: IndexSet<P>,
    /// Latest non-empty list per (file, producer index)
    files: HashMap<Url, BTreeMap<usize, Vec<Diagnostic>>>,
    /// Files each producer index currently has entries for
    reported: HashMap<usize, IndexSet<Url>>,
}

impl<P: Eq + Hash> Table<P> {
    fn new() -> Self {
        Self {
            projects: IndexSet::new(),
            files: HashMap::new(),
            reported: HashMap::new(),
        }
    }

    fn register(&mut self, project: P) -> usize {
        self.projects.insert_full(project).0
    }

    /// Replace everything `project` reports and return the files whose merged
    /// diagnostics changed.
    fn apply(
        &mut self,
        project: usize,
        incoming: impl IntoIterator<Item = (Url, Vec<Diagnostic>)>,
    ) -> IndexSet<Url> {
        let mut dirty = IndexSet::new();
        let mut now_reported = IndexSet::new();
        // A repeated file keeps its last list. An empty list is the same as
        // not mentioning the file.
        let mut incoming: IndexMap<Url, Vec<Diagnostic>> = incoming.into_iter().collect();
        incoming.retain(|_, diagnostics| !diagnostics.is_empty());

        for (uri, diagnostics) in incoming {
            now_reported.insert(uri.clone());
            let per_project = self.files.entry(uri.clone()).or_default();
            if per_project.get(&project) != Some(&diagnostics) {
                per_project.insert(project, diagnostics);
                dirty.insert(uri);
            }
        }

        let previously = self.reported.remove(&project).unwrap_or_default();
        for uri in previously {
            if now_reported.contains(&uri) {
                continue;
            }
            if let Some(per_project) = self.files.get_mut(&uri) {
                if per_project.remove(&project).is_some() {
                    dirty.insert(uri.clone());
                }
                if per_project.is_empty() {
                    self.files.remove(&uri);
                }
            }
        }

        if !now_reported.is_empty() {
            self.reported.insert(project, now_reported);
        }
        dirty
    }

    fn merged(&self, uri: &Url) -> Vec<Diagnostic> {
        self.files
            .get(uri)
            .map(|per_project| per_project.values().flatten().cloned().collect())
            .unwrap_or_default()
    }
}

/// Per-file merge of diagnostics contributed by several producers.
///
/// Each `publish` fully replaces what that producer previously reported. A
/// file's visible diagnostics are the concatenation of every producer's
/// latest list for it, in producer registration order. Only files whose
/// merged list changed are re-published, exactly once per pass.
pub struct DiagnosticAggregator<P> {
    table: Mutex<Table<P>>,
    outbox: Sender<(Url, Vec<Diagnostic>)>,
    pending: Receiver<(Url, Vec<Diagnostic>)>,
    dispatching: Mutex<()>,
    notifier: Arc<dyn DiagnosticsNotifier>,
}

impl<P: fmt::Debug> fmt::Debug for DiagnosticAggregator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        f.debug_struct("DiagnosticAggregator")
            .field("projects", &table.projects)
            .field("files", &table.files.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<P: Eq + Hash + Clone + fmt::Debug> DiagnosticAggregator<P> {
    pub fn new(notifier: Arc<dyn DiagnosticsNotifier>) -> Self {
        let (outbox, pending) = crossbeam_channel::unbounded();
        Self {
            table: Mutex::new(Table::new()),
            outbox,
            pending,
            dispatching: Mutex::new(()),
            notifier,
        }
    }

    /// Fix the merge position of `project` ahead of its first publish.
    /// Returns its registration index; registering twice is a no-op.
    pub fn register(&self, project: P) -> usize {
        self.table.lock().register(project)
    }

    /// Replace everything `project` reports with `diagnostics` and notify each
    /// file whose merged diagnostics changed. Returns the number of files
    /// re-published.
    pub fn publish<I>(&self, project: P, diagnostics: I) -> usize
    where
        I: IntoIterator<Item = (Url, Vec<Diagnostic>)>,
    {
        let queued = {
            let mut table = self.table.lock();
            let index = table.register(project.clone());
            let dirty = table.apply(index, diagnostics);
            for uri in &dirty {
                let merged = table.merged(uri);
                // Queued under the lock so dispatch order matches merge order
                let _ = self.outbox.send((uri.clone(), merged));
            }
            dirty.len()
        };

        log::debug!(
            "Aggregated diagnostics from {:?}: {} file(s) to re-publish",
            project,
            queued
        );
        self.dispatch();
        queued
    }

    /// Drop everything `project` reports.
    pub fn clear(&self, project: &P) -> usize {
        self.publish(project.clone(), std::iter::empty())
    }

    /// Current merged diagnostics for `uri`.
    pub fn diagnostics_for(&self, uri: &Url) -> Vec<Diagnostic> {
        self.table.lock().merged(uri)
    }

    /// Files that currently have diagnostics from at least one producer.
    pub fn files(&self) -> Vec<Url> {
        let mut files: Vec<_> = self.table.lock().files.keys().cloned().collect();
        files.sort();
        files
    }

    /// Producers currently reporting diagnostics for `uri`, in merge order.
    pub fn projects_for(&self, uri: &Url) -> Vec<P> {
        let table = self.table.lock();
        let Some(per_project) = table.files.get(uri) else {
            return Vec::new();
        };
        per_project
            .keys()
            .filter_map(|index| table.projects.get_index(*index).cloned())
            .collect()
    }

    /// Drain queued notifications. Only one thread drains at a time; a
    /// notifier that re-enters `publish` leaves its batch to the active drainer.
    fn dispatch(&self) {
        loop {
            let Some(guard) = self.dispatching.try_lock() else {
                return;
            };
            let mut sent = 0;
            while let Ok((uri, diagnostics)) = self.pending.try_recv() {
                log::trace!("Publishing {} diagnostic(s) for {}", diagnostics.len(), uri);
                self.notifier.publish(uri, diagnostics);
                sent += 1;
            }
            perf::record_diagnostic_notifications(sent);
            drop(guard);
            // Work queued between the last try_recv and the unlock
            if self.pending.is_empty() {
                return;
            }
        }
    }
}
