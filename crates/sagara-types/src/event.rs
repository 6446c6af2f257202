//! Lifecycle events emitted by the orchestrator.
//!
//! `FlowEvent` is the unified event type published to the event bus. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels.
//! Within one transaction, delivery order is the order of the state changes
//! that produced the events; across transactions no ordering is guaranteed.

use serde::{Deserialize, Serialize};

use crate::error::FlowErrorRecord;
use crate::flow::FlowState;
use crate::step::Phase;

/// Events emitted across a transaction's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A transaction was created.
    Begin {
        model_id: String,
        transaction_id: String,
    },

    /// Forward execution (re)started.
    Resume {
        model_id: String,
        transaction_id: String,
    },

    /// A step handler was dispatched.
    StepBegin {
        transaction_id: String,
        action: String,
        phase: Phase,
        attempt: u32,
    },

    /// A forward step completed successfully.
    StepSuccess {
        transaction_id: String,
        action: String,
    },

    /// A forward step failed.
    StepFailure {
        transaction_id: String,
        action: String,
        error: String,
        will_retry: bool,
    },

    /// An async step's handler returned without completing; the step stays
    /// waiting for external completion.
    StepAwaiting {
        transaction_id: String,
        action: String,
        phase: Phase,
        idempotency_key: String,
    },

    /// A step was skipped because an ancestor permanently failed with
    /// continue-on-permanent-failure.
    StepSkipped {
        transaction_id: String,
        action: String,
    },

    /// Rollback began.
    CompensateBegin {
        model_id: String,
        transaction_id: String,
    },

    /// A compensation step completed successfully.
    CompensateStepSuccess {
        transaction_id: String,
        action: String,
    },

    /// A compensation step failed.
    CompensateStepFailure {
        transaction_id: String,
        action: String,
        error: String,
        will_retry: bool,
    },

    /// A transaction or step timer fired.
    Timeout {
        transaction_id: String,
        action: Option<String>,
    },

    /// The flow reached a terminal state.
    Finish {
        model_id: String,
        transaction_id: String,
        state: FlowState,
        errors: Vec<FlowErrorRecord>,
    },
}

impl FlowEvent {
    /// The transaction this event belongs to.
    pub fn transaction_id(&self) -> &str {
        match self {
            FlowEvent::Begin { transaction_id, .. }
            | FlowEvent::Resume { transaction_id, .. }
            | FlowEvent::StepBegin { transaction_id, .. }
            | FlowEvent::StepSuccess { transaction_id, .. }
            | FlowEvent::StepFailure { transaction_id, .. }
            | FlowEvent::StepAwaiting { transaction_id, .. }
            | FlowEvent::StepSkipped { transaction_id, .. }
            | FlowEvent::CompensateBegin { transaction_id, .. }
            | FlowEvent::CompensateStepSuccess { transaction_id, .. }
            | FlowEvent::CompensateStepFailure { transaction_id, .. }
            | FlowEvent::Timeout { transaction_id, .. }
            | FlowEvent::Finish { transaction_id, .. } => transaction_id,
        }
    }
}
