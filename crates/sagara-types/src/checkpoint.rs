//! Checkpoint schema: the durable serialization of a flow.
//!
//! A checkpoint is `{flow, errors, context}` where `context` holds per-step
//! invoke/compensate outputs keyed by action. It is sufficient to rehydrate
//! the exact step table, flow state, and error list, and must survive a
//! round-trip through storage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowErrorRecord;
use crate::flow::Flow;

/// Outputs recorded for one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate: Option<Value>,
}

/// The durable snapshot of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The flow, including its full step table.
    pub flow: Flow,
    /// Step-level errors accumulated so far.
    #[serde(default)]
    pub errors: Vec<FlowErrorRecord>,
    /// Per-action handler outputs.
    #[serde(default)]
    pub context: HashMap<String, StepOutputs>,
}
