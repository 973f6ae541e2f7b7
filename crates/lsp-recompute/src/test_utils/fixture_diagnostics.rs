//! Deterministic diagnostics batches for benchmarks and tests.
//!
//! Generates producer passes with controlled characteristics: number of
//! producers, files, diagnostics per file, and how much of each pass changes
//! between rounds. No randomness, so benchmarks are reproducible.

use std::collections::HashMap;

use tower_lsp::lsp_types::{Diagnostic, Url};

use super::{diagnostic, test_uri};

/// Shape of the generated workload.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub producers: usize,
    pub file_count: usize,
    pub diagnostics_per_file: usize,
    /// Every `churn_every`-th file changes between rounds (0 = none)
    pub churn_every: usize,
}

impl FixtureConfig {
    /// 2 producers over 10 files.
    pub fn small() -> Self {
        Self {
            producers: 2,
            file_count: 10,
            diagnostics_per_file: 3,
            churn_every: 5,
        }
    }

    /// 3 producers over 200 files.
    pub fn medium() -> Self {
        Self {
            producers: 3,
            file_count: 200,
            diagnostics_per_file: 5,
            churn_every: 10,
        }
    }

    /// 4 producers over 2000 files.
    pub fn large() -> Self {
        Self {
            producers: 4,
            file_count: 2000,
            diagnostics_per_file: 8,
            churn_every: 20,
        }
    }
}

pub fn producer_name(index: usize) -> String {
    format!("producer_{index}")
}

pub fn fixture_uri(index: usize) -> Url {
    test_uri(&format!("file_{index}.R"))
}

/// One full pass of `producer` in round `round`.
///
/// Files a producer does not own (every `producers`-th file starting at its
/// index is skipped) are left out, so passes overlap only partially.
pub fn producer_pass(
    config: &FixtureConfig,
    producer: usize,
    round: usize,
) -> HashMap<Url, Vec<Diagnostic>> {
    let mut pass = HashMap::with_capacity(config.file_count);
    for file in 0..config.file_count {
        if config.producers > 1 && file % config.producers == producer {
            continue;
        }
        let churned = config.churn_every > 0 && file % config.churn_every == 0;
        let version = if churned { round } else { 0 };
        let diagnostics = (0..config.diagnostics_per_file)
            .map(|i| {
                diagnostic(
                    i as u32,
                    &format!("{} issue {} in file {} v{}", producer_name(producer), i, file, version),
                )
            })
            .collect();
        pass.insert(fixture_uri(file), diagnostics);
    }
    pass
}
