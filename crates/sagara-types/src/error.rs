//! Error families shared across the orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::step::{Phase, StepState, StepStatus};

/// An illegal state or status change; a programming error, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTransition {
    #[error("invalid state transition: {from:?} -> {to:?}")]
    State { from: StepState, to: StepState },

    #[error("invalid status transition: {from:?} -> {to:?}")]
    Status { from: StepStatus, to: StepStatus },
}

impl InvalidTransition {
    pub fn state(from: StepState, to: StepState) -> Self {
        Self::State { from, to }
    }

    pub fn status(from: StepStatus, to: StepStatus) -> Self {
        Self::Status { from, to }
    }
}

/// A failure signalled by a step handler.
///
/// Transient failures are subject to the step's retry budget; permanent
/// failures bypass it and fail the step immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    #[error("transient step failure: {0}")]
    Transient(String),

    #[error("permanent step failure: {0}")]
    Permanent(String),
}

impl StepFailure {
    /// Whether this failure bypasses the retry budget.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StepFailure::Permanent(_))
    }

    /// The underlying message.
    pub fn message(&self) -> &str {
        match self {
            StepFailure::Transient(msg) | StepFailure::Permanent(msg) => msg,
        }
    }
}

/// One step-level error captured into a transaction's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowErrorRecord {
    /// Action name of the failed step.
    pub action: String,
    /// Phase in which the failure occurred.
    pub phase: Phase,
    /// Error message.
    pub error: String,
}

/// Errors from storage operations (used by the port trait in sagara-core).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("checkpoint not found for key '{0}'")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("lock for key '{0}' is not held")]
    LockNotHeld(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_display() {
        let err = InvalidTransition::state(StepState::Done, StepState::Invoking);
        assert!(err.to_string().contains("Done"));
        assert!(err.to_string().contains("Invoking"));

        let err = InvalidTransition::status(StepStatus::Ok, StepStatus::Idle);
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn step_failure_permanence() {
        assert!(StepFailure::Permanent("x".into()).is_permanent());
        assert!(!StepFailure::Transient("x".into()).is_permanent());
        assert_eq!(StepFailure::Transient("boom".into()).message(), "boom");
    }

    #[test]
    fn flow_error_record_roundtrip() {
        let record = FlowErrorRecord {
            action: "charge".to_string(),
            phase: Phase::Invoke,
            error: "card declined".to_string(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"phase\":\"invoke\""));
        let parsed: FlowErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
