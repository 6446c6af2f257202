//! Eligibility rules: which steps may move in a given flow state.
//!
//! Forward movement is gated on the parent's sibling group: a step may
//! dispatch once every sibling of its parent has settled, or immediately
//! when the parent is marked `no_wait`. Backward movement (compensation) is
//! bottom-up: a step may compensate only after all of its children have
//! finished compensating.

use sagara_types::flow::{Flow, FlowState};
use sagara_types::step::{Step, StepState, StepStatus};

// ---------------------------------------------------------------------------
// Forward / backward movement
// ---------------------------------------------------------------------------

/// Whether execution may move past `previous` to its successors.
///
/// True when `previous` is `no_wait`, or when every sibling of `previous`
/// (every child of its parent) has settled its invoke phase. The root is
/// always a valid predecessor.
pub fn can_move_forward(flow: &Flow, previous: &Step) -> bool {
    if previous.is_root() {
        return true;
    }
    if previous.policy.no_wait {
        return true;
    }
    let Some(parent_id) = previous.parent_id() else {
        return true;
    };
    let Some(parent) = flow.steps.get(parent_id) else {
        return false;
    };
    parent.next.iter().all(|sibling_id| {
        flow.steps
            .get(sibling_id)
            .is_some_and(|sibling| invoke_settled(sibling))
    })
}

fn invoke_settled(step: &Step) -> bool {
    matches!(
        step.invoke.state,
        StepState::Done | StepState::Failed | StepState::Skipped
    )
}

/// Whether `step` may compensate: all of its children must have reached a
/// terminal compensate state (or never been armed).
pub fn can_move_backward(flow: &Flow, step: &Step) -> bool {
    step.next.iter().all(|child_id| {
        flow.steps.get(child_id).is_some_and(|child| {
            matches!(
                child.compensate.state,
                StepState::Done | StepState::Reverted | StepState::Failed | StepState::Dormant
            )
        })
    })
}

/// Whether the scheduling pass should consider `step` at all in the flow's
/// current direction.
pub fn can_continue(flow: &Flow, step: &Step) -> bool {
    if flow.state == FlowState::Compensating {
        return can_move_backward(flow, step);
    }
    match step.parent_id() {
        None => true,
        Some(parent_id) => {
            let Some(parent) = flow.steps.get(parent_id) else {
                return false;
            };
            if parent.is_root() {
                true
            } else {
                can_move_forward(flow, parent)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch eligibility
// ---------------------------------------------------------------------------

/// Whether `step` is ready for a forward dispatch.
///
/// Fresh steps are armed (`NotStarted`/`Idle`). A step in `TemporaryFailure`
/// without a retry interval is rescheduled by the next pass; one with an
/// interval stays put until the storage retry timer resets its status to
/// `Idle`.
pub fn can_invoke(flow_state: FlowState, step: &Step) -> bool {
    if flow_state != FlowState::Invoking || step.step_failed || step.is_root() {
        return false;
    }
    if step.failures > step.policy.max_retries {
        return false;
    }
    match (step.invoke.state, step.invoke.status) {
        (StepState::NotStarted, StepStatus::Idle) => true,
        (StepState::Invoking, StepStatus::TemporaryFailure) => {
            step.policy.retry_interval.is_none()
        }
        (StepState::Invoking, StepStatus::Idle) => true,
        _ => false,
    }
}

/// Whether `step` is ready for a compensation dispatch.
pub fn can_compensate(flow_state: FlowState, step: &Step) -> bool {
    if flow_state != FlowState::Compensating || !step.step_failed || step.is_root() {
        return false;
    }
    if step.failures > step.policy.max_retries {
        return false;
    }
    match (step.compensate.state, step.compensate.status) {
        (StepState::NotStarted, StepStatus::Idle) => true,
        (StepState::Compensating, StepStatus::TemporaryFailure) => {
            step.policy.retry_interval.is_none()
        }
        (StepState::Compensating, StepStatus::Idle) => true,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::topology::build_steps;
    use sagara_types::definition::{StepNode, StepPolicy};
    use serde_json::json;

    fn flow_for(def: StepNode, state: FlowState) -> Flow {
        let steps = build_steps(&def, None).unwrap();
        Flow {
            model_id: "m".to_string(),
            transaction_id: "tx".to_string(),
            state,
            input: json!({}),
            has_skipped_steps: false,
            has_failed_steps: false,
            has_async_steps: false,
            has_remote_steps: false,
            cancelled_at: None,
            started_at: None,
            steps,
            definition: def,
        }
    }

    fn fanout() -> StepNode {
        // root -> [a, b -> c]
        StepNode::root(vec![
            StepNode::action("a"),
            StepNode {
                action: Some("b".to_string()),
                next: vec![StepNode::action("c")],
                policy: StepPolicy::default(),
            },
        ])
    }

    fn settle(flow: &mut Flow, id: &str, state: StepState) {
        flow.steps.get_mut(id).unwrap().invoke.state = state;
    }

    // -----------------------------------------------------------------------
    // can_move_forward
    // -----------------------------------------------------------------------

    #[test]
    fn forward_blocked_until_sibling_group_settles() {
        let mut flow = flow_for(fanout(), FlowState::Invoking);
        let b = flow.steps["_root.b"].clone();
        assert!(!can_move_forward(&flow, &b), "a not yet settled");

        settle(&mut flow, "_root.a", StepState::Done);
        settle(&mut flow, "_root.b", StepState::Done);
        let b = flow.steps["_root.b"].clone();
        assert!(can_move_forward(&flow, &b));
    }

    #[test]
    fn forward_allows_failed_and_skipped_siblings() {
        let mut flow = flow_for(fanout(), FlowState::Invoking);
        settle(&mut flow, "_root.a", StepState::Skipped);
        settle(&mut flow, "_root.b", StepState::Failed);
        let b = flow.steps["_root.b"].clone();
        assert!(can_move_forward(&flow, &b));
    }

    #[test]
    fn no_wait_bypasses_sibling_group() {
        let mut def = fanout();
        def.next[1].policy.no_wait = true;
        let flow = flow_for(def, FlowState::Invoking);
        let b = flow.steps["_root.b"].clone();
        assert!(can_move_forward(&flow, &b));
    }

    #[test]
    fn root_is_always_a_valid_predecessor() {
        let flow = flow_for(fanout(), FlowState::Invoking);
        let root = flow.steps["_root"].clone();
        assert!(can_move_forward(&flow, &root));
    }

    // -----------------------------------------------------------------------
    // can_move_backward
    // -----------------------------------------------------------------------

    #[test]
    fn backward_requires_children_terminal() {
        let mut flow = flow_for(fanout(), FlowState::Compensating);
        let b = flow.steps["_root.b"].clone();
        // c's compensate phase is still dormant -- terminal for this purpose.
        assert!(can_move_backward(&flow, &b));

        flow.steps.get_mut("_root.b.c").unwrap().compensate.state = StepState::Compensating;
        let b = flow.steps["_root.b"].clone();
        assert!(!can_move_backward(&flow, &b));

        flow.steps.get_mut("_root.b.c").unwrap().compensate.state = StepState::Reverted;
        let b = flow.steps["_root.b"].clone();
        assert!(can_move_backward(&flow, &b));
    }

    #[test]
    fn leaf_always_moves_backward() {
        let flow = flow_for(fanout(), FlowState::Compensating);
        let c = flow.steps["_root.b.c"].clone();
        assert!(can_move_backward(&flow, &c));
    }

    // -----------------------------------------------------------------------
    // can_continue
    // -----------------------------------------------------------------------

    #[test]
    fn children_of_root_always_continue_forward() {
        let flow = flow_for(fanout(), FlowState::Invoking);
        assert!(can_continue(&flow, &flow.steps["_root.a"]));
        assert!(can_continue(&flow, &flow.steps["_root.b"]));
    }

    #[test]
    fn grandchild_waits_on_parent_sibling_group() {
        let mut flow = flow_for(fanout(), FlowState::Invoking);
        assert!(!can_continue(&flow, &flow.steps["_root.b.c"]));

        settle(&mut flow, "_root.a", StepState::Done);
        settle(&mut flow, "_root.b", StepState::Done);
        assert!(can_continue(&flow, &flow.steps["_root.b.c"]));
    }

    #[test]
    fn continue_uses_backward_rule_while_compensating() {
        let mut flow = flow_for(fanout(), FlowState::Compensating);
        flow.steps.get_mut("_root.b.c").unwrap().compensate.state = StepState::Compensating;
        assert!(!can_continue(&flow, &flow.steps["_root.b"]));
        assert!(can_continue(&flow, &flow.steps["_root.b.c"]));
    }

    // -----------------------------------------------------------------------
    // can_invoke / can_compensate
    // -----------------------------------------------------------------------

    #[test]
    fn fresh_step_can_invoke_only_while_flow_invoking() {
        let flow = flow_for(fanout(), FlowState::Invoking);
        assert!(can_invoke(FlowState::Invoking, &flow.steps["_root.a"]));
        assert!(!can_invoke(FlowState::WaitingToCompensate, &flow.steps["_root.a"]));
        assert!(!can_invoke(FlowState::Compensating, &flow.steps["_root.a"]));
    }

    #[test]
    fn temporary_failure_redispatch_depends_on_retry_interval() {
        let mut flow = flow_for(fanout(), FlowState::Invoking);
        {
            let a = flow.steps.get_mut("_root.a").unwrap();
            a.invoke.state = StepState::Invoking;
            a.invoke.status = StepStatus::TemporaryFailure;
            a.failures = 1;
        }
        assert!(can_invoke(FlowState::Invoking, &flow.steps["_root.a"]));

        flow.steps.get_mut("_root.a").unwrap().policy.retry_interval = Some(30);
        assert!(
            !can_invoke(FlowState::Invoking, &flow.steps["_root.a"]),
            "with an interval the storage timer owns the retry"
        );

        // Timer fired: status reset to Idle.
        flow.steps.get_mut("_root.a").unwrap().invoke.status = StepStatus::Idle;
        assert!(can_invoke(FlowState::Invoking, &flow.steps["_root.a"]));
    }

    #[test]
    fn exhausted_retry_budget_blocks_dispatch() {
        let mut flow = flow_for(fanout(), FlowState::Invoking);
        {
            let a = flow.steps.get_mut("_root.a").unwrap();
            a.invoke.state = StepState::Invoking;
            a.invoke.status = StepStatus::TemporaryFailure;
            a.failures = a.policy.max_retries + 1;
        }
        assert!(!can_invoke(FlowState::Invoking, &flow.steps["_root.a"]));
    }

    #[test]
    fn waiting_step_is_never_dispatchable() {
        let mut flow = flow_for(fanout(), FlowState::Invoking);
        {
            let a = flow.steps.get_mut("_root.a").unwrap();
            a.invoke.state = StepState::Invoking;
            a.invoke.status = StepStatus::Waiting;
        }
        assert!(!can_invoke(FlowState::Invoking, &flow.steps["_root.a"]));
    }

    #[test]
    fn compensation_requires_armed_phase() {
        let mut flow = flow_for(fanout(), FlowState::Compensating);
        flow.steps.get_mut("_root.a").unwrap().invoke.state = StepState::Done;
        // Not yet armed for compensation.
        assert!(!can_compensate(FlowState::Compensating, &flow.steps["_root.a"]));

        flow.steps.get_mut("_root.a").unwrap().begin_compensation().unwrap();
        assert!(can_compensate(FlowState::Compensating, &flow.steps["_root.a"]));
        assert!(!can_invoke(FlowState::Compensating, &flow.steps["_root.a"]));
    }

    #[test]
    fn root_never_dispatches() {
        let flow = flow_for(fanout(), FlowState::Invoking);
        assert!(!can_invoke(FlowState::Invoking, &flow.steps["_root"]));
    }
}
