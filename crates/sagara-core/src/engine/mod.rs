//! Orchestration engine: the "brain" of sagara.
//!
//! - `definition` -- YAML parsing and structural validation of step trees
//! - `topology` -- step table construction, orderings, acyclicity check
//! - `eligibility` -- forward/backward movement rules over the step table
//! - `orchestrator` -- scheduling pass, execution driver, step outcome rules
//! - `completion` -- external completion, cancellation, timer-fire entries
//! - `checkpoint` -- checkpoint codec and rehydration
//! - `registry` -- write-once model registry

pub mod checkpoint;
pub mod completion;
pub mod definition;
pub mod eligibility;
pub mod orchestrator;
pub mod registry;
pub mod topology;

pub use orchestrator::{
    HandlerOutcome, ModelOptions, Orchestrator, SchedulerPass, StepHandler, Transaction,
};

use sagara_types::error::{InvalidTransition, StorageError};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the orchestrator API.
///
/// Step-level handler failures never appear here; they are captured into the
/// transaction's error list and drive retry or compensation instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An illegal state/status change; a programming error.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Two definition nodes share an action name.
    #[error("duplicate action '{0}'")]
    DuplicateAction(String),

    /// External completion referenced an action not in the flow.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// External completion against a step not in a completable state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// No checkpoint exists for the referenced transaction.
    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),

    /// The definition failed structural validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// An idempotency key could not be parsed.
    #[error("{0}")]
    MalformedKey(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Runtime execution failure (task join, codec).
    #[error("execution error: {0}")]
    Execution(String),
}
