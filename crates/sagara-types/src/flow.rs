//! The flow: a transaction's DAG plus its transaction-wide state and flags.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::StepNode;
use crate::step::Step;

// ---------------------------------------------------------------------------
// FlowState
// ---------------------------------------------------------------------------

/// Transaction-wide state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    NotStarted,
    Invoking,
    /// A permanent failure occurred; rollback begins once in-flight steps
    /// settle.
    WaitingToCompensate,
    Compensating,
    Done,
    Reverted,
    Failed,
}

impl FlowState {
    /// Whether the flow has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Done | FlowState::Reverted | FlowState::Failed)
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// The DAG plus runtime state for one transaction.
///
/// The flow exclusively owns its steps; siblings and parents are resolved by
/// path manipulation on step ids, never by back-pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Id of the transaction model (orchestrator) this flow belongs to.
    pub model_id: String,
    /// Unique id of this transaction.
    pub transaction_id: String,
    /// Transaction-wide state.
    pub state: FlowState,
    /// Input handed to `begin_transaction`; the base of every step payload.
    pub input: Value,
    #[serde(default)]
    pub has_skipped_steps: bool,
    #[serde(default)]
    pub has_failed_steps: bool,
    #[serde(default)]
    pub has_async_steps: bool,
    #[serde(default)]
    pub has_remote_steps: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Step table keyed by path id (includes the root).
    pub steps: HashMap<String, Step>,
    /// The original input DAG definition.
    pub definition: StepNode,
}

impl Flow {
    /// Number of executable steps (the root is excluded).
    pub fn total_steps(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Look up a step by its action name.
    pub fn step_by_action(&self, action: &str) -> Option<&Step> {
        self.steps
            .values()
            .find(|s| s.action.as_deref() == Some(action))
    }

    /// Mutable lookup by action name.
    pub fn step_by_action_mut(&mut self, action: &str) -> Option<&mut Step> {
        self.steps
            .values_mut()
            .find(|s| s.action.as_deref() == Some(action))
    }

    /// A flow that finished forward execution but skipped or failed past
    /// steps marked continue-on-permanent-failure.
    pub fn is_partially_completed(&self) -> bool {
        self.state == FlowState::Done && (self.has_skipped_steps || self.has_failed_steps)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepPolicy;
    use crate::step::ROOT_ID;

    fn sample_flow() -> Flow {
        let mut steps = HashMap::new();
        let mut root = Step::new(ROOT_ID.to_string(), None, 0, StepPolicy::default());
        root.next = vec!["_root.charge".to_string()];
        steps.insert(ROOT_ID.to_string(), root);
        steps.insert(
            "_root.charge".to_string(),
            Step::new(
                "_root.charge".to_string(),
                Some("charge".to_string()),
                1,
                StepPolicy::default(),
            ),
        );

        Flow {
            model_id: "orders".to_string(),
            transaction_id: "tx-1".to_string(),
            state: FlowState::NotStarted,
            input: serde_json::json!({"order": 7}),
            has_skipped_steps: false,
            has_failed_steps: false,
            has_async_steps: false,
            has_remote_steps: false,
            cancelled_at: None,
            started_at: None,
            steps,
            definition: StepNode::root(vec![StepNode::action("charge")]),
        }
    }

    #[test]
    fn total_excludes_root() {
        assert_eq!(sample_flow().total_steps(), 1);
    }

    #[test]
    fn lookup_by_action() {
        let flow = sample_flow();
        assert!(flow.step_by_action("charge").is_some());
        assert!(flow.step_by_action("refund").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(FlowState::Done.is_terminal());
        assert!(FlowState::Reverted.is_terminal());
        assert!(FlowState::Failed.is_terminal());
        assert!(!FlowState::Invoking.is_terminal());
        assert!(!FlowState::WaitingToCompensate.is_terminal());
    }

    #[test]
    fn partial_completion_requires_done() {
        let mut flow = sample_flow();
        flow.has_failed_steps = true;
        assert!(!flow.is_partially_completed());
        flow.state = FlowState::Done;
        assert!(flow.is_partially_completed());
    }

    #[test]
    fn flow_serde_roundtrip() {
        let flow = sample_flow();
        let json = serde_json::to_string(&flow).unwrap();
        let parsed: Flow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.model_id, "orders");
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.state, FlowState::NotStarted);
        assert_eq!(parsed.input, serde_json::json!({"order": 7}));
    }
}
