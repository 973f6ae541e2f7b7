// lib.rs — Incremental recomputation core for language servers.
//
// Resources are recomputed on demand after edits. Requests are debounced,
// newer computations supersede older ones, and diagnostics from independent
// producers are merged per file before being published.

pub mod computation;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod diagnostics;
pub mod error;
pub mod lazy_cache;
pub mod perf;
pub mod scheduler;
pub mod session;
pub mod slot;
pub mod summary_cache;
pub mod vfs;

// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;


pub use computation::{Completer, Computation};
pub use config::{parse_config, RecomputeConfig};
pub use controller::{AnalysisProvider, ResourceController, Snapshot};
pub use debounce::{Debouncer, LazyComputation};
pub use diagnostics::{
    DiagnosticAggregator, DiagnosticsNotifier, ForwardingNotifier, LspClientNotifier,
};
pub use error::{ComputationError, Outcome};
pub use lazy_cache::LazyCache;
pub use scheduler::{DelayScheduler, ScheduledTask};
pub use session::{FileDiagnostics, Session};
pub use slot::SupersedingSlot;
pub use summary_cache::SummaryCache;
pub use vfs::{LocalFsConnection, VfsConnection, VfsContext};
