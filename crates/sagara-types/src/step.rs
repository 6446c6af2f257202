//! Per-transaction step state: phases, state machines, and transition tables.
//!
//! A `Step` tracks one action's runtime state within a flow. Each step carries
//! two phase executions (`invoke` and `compensate`), each a (state, status)
//! pair. Transitions outside the allowed tables are programming errors and
//! are rejected with `InvalidTransition` without mutating the step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::StepPolicy;
use crate::error::InvalidTransition;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Id of the synthetic root step. The root carries no action and never runs.
pub const ROOT_ID: &str = "_root";

/// Separator between path segments in a step id (`_root.reserve.charge`).
pub const PATH_SEPARATOR: char = '.';

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Execution phase of a step: forward or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Invoke,
    Compensate,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Invoke => write!(f, "invoke"),
            Phase::Compensate => write!(f, "compensate"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(Phase::Invoke),
            "compensate" => Ok(Phase::Compensate),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

/// Lifecycle state of one phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Phase exists but has not been armed (compensate before rollback begins).
    Dormant,
    /// Armed and waiting to be dispatched.
    NotStarted,
    /// Forward handler dispatched.
    Invoking,
    /// Compensation handler dispatched.
    Compensating,
    /// Forward execution finished successfully.
    Done,
    /// Compensation finished successfully.
    Reverted,
    /// Permanently failed in this phase.
    Failed,
    /// Never executed because an ancestor permanently failed with
    /// continue-on-permanent-failure.
    Skipped,
}

impl StepState {
    /// Whether `self -> next` is an allowed state transition.
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Dormant, NotStarted)
                | (NotStarted, Invoking)
                | (NotStarted, Compensating)
                | (NotStarted, Failed)
                | (NotStarted, Skipped)
                | (Invoking, Failed)
                | (Invoking, Done)
                | (Compensating, Reverted)
                | (Compensating, Failed)
                | (Done, Compensating)
        )
    }

    /// Whether this state is terminal for its phase.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Done | StepState::Reverted | StepState::Failed | StepState::Skipped
        )
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Dispatch status of one phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Idle,
    Ok,
    Waiting,
    TemporaryFailure,
    PermanentFailure,
}

impl StepStatus {
    /// Whether `self -> next` is an allowed status transition.
    ///
    /// Any status may move to `Waiting` (rescheduling).
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        if next == Waiting {
            return true;
        }
        matches!(
            (self, next),
            (Waiting, Ok)
                | (Waiting, TemporaryFailure)
                | (Waiting, PermanentFailure)
                | (TemporaryFailure, Idle)
                | (TemporaryFailure, PermanentFailure)
                | (PermanentFailure, Idle)
        )
    }
}

// ---------------------------------------------------------------------------
// PhaseExecution
// ---------------------------------------------------------------------------

/// The (state, status) pair for one phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub state: StepState,
    pub status: StepStatus,
}

impl PhaseExecution {
    /// Fresh invoke phase: armed, idle.
    pub fn armed() -> Self {
        Self {
            state: StepState::NotStarted,
            status: StepStatus::Idle,
        }
    }

    /// Fresh compensate phase: dormant until rollback begins.
    pub fn dormant() -> Self {
        Self {
            state: StepState::Dormant,
            status: StepStatus::Idle,
        }
    }

    /// Move to `next` state, rejecting transitions outside the allowed table.
    pub fn set_state(&mut self, next: StepState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition::state(self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Move to `next` status, rejecting transitions outside the allowed table.
    pub fn set_status(&mut self, next: StepStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition::status(self.status, next));
        }
        self.status = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One action's runtime state within a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Path id: `_root.<action>...`. The root step's id is `_root`.
    pub id: String,
    /// User action name. `None` only for the root.
    pub action: Option<String>,
    /// Distance from the root (root is 0).
    pub depth: u32,
    /// Ordered ids of child steps.
    pub next: Vec<String>,
    /// Execution policy taken from the definition node.
    pub policy: StepPolicy,
    /// Forward phase execution.
    pub invoke: PhaseExecution,
    /// Rollback phase execution.
    pub compensate: PhaseExecution,
    /// Number of handler dispatches across the active phase.
    pub attempts: u32,
    /// Number of failures observed in the active phase.
    pub failures: u32,
    /// Timestamp of the most recent dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Timestamp of the first dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Saved handler response (for forwarding to children).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// True once compensation has begun for this step.
    #[serde(default)]
    pub step_failed: bool,
}

impl Step {
    /// Create a fresh step at the given path.
    pub fn new(id: String, action: Option<String>, depth: u32, policy: StepPolicy) -> Self {
        Self {
            id,
            action,
            depth,
            next: Vec::new(),
            policy,
            invoke: PhaseExecution::armed(),
            compensate: PhaseExecution::dormant(),
            attempts: 0,
            failures: 0,
            last_attempt: None,
            started_at: None,
            response: None,
            step_failed: false,
        }
    }

    /// Whether this is the synthetic root step.
    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// The phase currently driving this step.
    pub fn active_phase(&self) -> Phase {
        if self.step_failed {
            Phase::Compensate
        } else {
            Phase::Invoke
        }
    }

    /// The active (state, status) pair: `compensate` once compensation has
    /// begun, otherwise `invoke`.
    pub fn states(&self) -> &PhaseExecution {
        if self.step_failed {
            &self.compensate
        } else {
            &self.invoke
        }
    }

    /// Mutable access to the active phase execution.
    pub fn states_mut(&mut self) -> &mut PhaseExecution {
        if self.step_failed {
            &mut self.compensate
        } else {
            &mut self.invoke
        }
    }

    /// The execution pair for an explicit phase.
    pub fn phase(&self, phase: Phase) -> &PhaseExecution {
        match phase {
            Phase::Invoke => &self.invoke,
            Phase::Compensate => &self.compensate,
        }
    }

    /// Id of this step's parent, derived from the path. `None` for the root.
    pub fn parent_id(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.id.rfind(PATH_SEPARATOR).map(|idx| &self.id[..idx])
    }

    /// Arm the compensate phase: reset attempt counters and move the phase
    /// from dormant to armed. Called when the transaction begins rollback.
    pub fn begin_compensation(&mut self) -> Result<(), InvalidTransition> {
        self.step_failed = true;
        self.attempts = 0;
        self.failures = 0;
        self.last_attempt = None;
        if self.compensate.state == StepState::Dormant {
            self.compensate.set_state(StepState::NotStarted)?;
        }
        self.compensate.status = StepStatus::Idle;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
