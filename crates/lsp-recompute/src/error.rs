//
// error.rs
//
// Failure taxonomy for recomputations
//

use std::sync::Arc;

use thiserror::Error;

/// Why a computation did not produce a value.
///
/// Cloneable so that every observer waiting on the same computation sees the
/// same failure.
#[derive(Debug, Clone, Error)]
pub enum ComputationError {
    /// The work function returned an error
    #[error("computation failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
    /// The work function panicked
    #[error("computation panicked: {0}")]
    Panicked(String),
    /// The work observed its cancellation token and stopped early
    #[error("computation was cancelled")]
    Cancelled,
    /// The completion handle was dropped without settling the computation
    #[error("computation was abandoned before producing a result")]
    Abandoned,
}

impl ComputationError {
    pub fn failed(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked(message)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Settled state of a computation.
pub type Outcome<T> = Result<T, ComputationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_message_includes_context() {
        let err = anyhow::anyhow!("parse error").context("recomputing main.R");
        let err = ComputationError::failed(err);
        let msg = err.to_string();
        assert!(msg.contains("recomputing main.R"));
        assert!(msg.contains("parse error"));
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = ComputationError::from_panic(Box::new("boom"));
        assert!(matches!(err, ComputationError::Panicked(ref m) if m == "boom"));

        let err = ComputationError::from_panic(Box::new(String::from("bang")));
        assert!(matches!(err, ComputationError::Panicked(ref m) if m == "bang"));

        let err = ComputationError::from_panic(Box::new(42u32));
        assert!(matches!(err, ComputationError::Panicked(_)));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(ComputationError::Cancelled.is_cancelled());
        assert!(!ComputationError::Abandoned.is_cancelled());
    }
}
