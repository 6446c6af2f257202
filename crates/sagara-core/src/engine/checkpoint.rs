//! Checkpoint codec: serialize a transaction for storage and rehydrate it.
//!
//! Encoding goes through `serde_json::Value` so any backend that can hold
//! JSON can hold a checkpoint. Rehydration rebuilds the step table through
//! the topology builder, preserving runtime fields and recomputing
//! structural ones, so a checkpoint written by an older layout of the same
//! definition still loads.

use sagara_types::checkpoint::{Checkpoint, StepOutputs};
use sagara_types::flow::Flow;
use sagara_types::step::Phase;
use serde_json::Value;
use std::collections::HashMap;

use super::EngineError;
use super::topology::build_steps;

/// Encode a checkpoint to its storage representation.
pub fn encode(checkpoint: &Checkpoint) -> Result<Value, EngineError> {
    serde_json::to_value(checkpoint).map_err(|e| EngineError::Execution(e.to_string()))
}

/// Decode a checkpoint from its storage representation and rehydrate the
/// step table against the definition it carries.
pub fn decode(value: Value) -> Result<Checkpoint, EngineError> {
    let mut checkpoint: Checkpoint =
        serde_json::from_value(value).map_err(|e| EngineError::Execution(e.to_string()))?;
    rehydrate(&mut checkpoint.flow)?;
    Ok(checkpoint)
}

/// Rebuild a flow's step table from its definition, carrying over the
/// runtime state of matching steps.
pub fn rehydrate(flow: &mut Flow) -> Result<(), EngineError> {
    let rebuilt = build_steps(&flow.definition, Some(&flow.steps))?;
    flow.steps = rebuilt;
    Ok(())
}

/// Record a handler output into the per-action context map.
pub fn record_output(
    context: &mut HashMap<String, StepOutputs>,
    action: &str,
    phase: Phase,
    output: Value,
) {
    let entry = context.entry(action.to_string()).or_default();
    match phase {
        Phase::Invoke => entry.invoke = Some(output),
        Phase::Compensate => entry.compensate = Some(output),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
