//
// test_utils/mod.rs
//
// Helpers shared by unit tests, integration tests and benchmarks.
// Available in test builds and with the `test-support` feature.
//

pub mod fixture_diagnostics;

use std::sync::Once;

use parking_lot::Mutex;
use tower_lsp::lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range, Url};

use crate::diagnostics::DiagnosticsNotifier;

static INIT_LOGGING: Once = Once::new();

/// Route `log` output through env_logger's test writer. Honours `RUST_LOG`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// `file:///workspace/<name>`
pub fn test_uri(name: &str) -> Url {
    Url::parse(&format!("file:///workspace/{name}")).expect("valid test URI")
}

/// An error diagnostic on the first character of `line`.
pub fn diagnostic(line: u32, message: &str) -> Diagnostic {
    Diagnostic {
        range: Range::new(Position::new(line, 0), Position::new(line, 1)),
        severity: Some(DiagnosticSeverity::ERROR),
        message: message.to_string(),
        ..Default::default()
    }
}

/// Records every notification it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    published: Mutex<Vec<(Url, Vec<Diagnostic>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain recorded notifications as `(uri, messages)`.
    pub fn take_messages(&self) -> Vec<(Url, Vec<String>)> {
        std::mem::take(&mut *self.published.lock())
            .into_iter()
            .map(|(uri, diagnostics)| {
                let messages = diagnostics.into_iter().map(|d| d.message).collect();
                (uri, messages)
            })
            .collect()
    }
}

impl DiagnosticsNotifier for RecordingNotifier {
    fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
        self.published.lock().push((uri, diagnostics));
    }
}
