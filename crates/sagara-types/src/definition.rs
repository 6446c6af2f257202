//! Step definition tree: the authoring-time input to the orchestrator.
//!
//! A definition is a nested tree of `StepNode`s. Each node names an action,
//! carries an execution policy, and lists its successors under `next` (a
//! single node or a list of nodes). The root node has no action and serves
//! only as the anchor for top-level steps.

use serde::{Deserialize, Deserializer, Serialize};

/// Default retry budget when a node does not set `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// StepPolicy
// ---------------------------------------------------------------------------

/// Execution policy for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    /// Maximum number of retries after the first failure (default 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between retries. When unset, failed steps are rescheduled by
    /// the next eligibility pass instead of a storage timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<u64>,
    /// Per-dispatch timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// The invoke handler completes out-of-band via external completion.
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// The compensate handler completes out-of-band.
    #[serde(default)]
    pub compensate_async: bool,
    /// Successors may dispatch before this step's sibling branch settles.
    #[serde(default)]
    pub no_wait: bool,
    /// This step is never compensated during rollback.
    #[serde(default)]
    pub no_compensation: bool,
    /// On permanent failure, skip descendants and keep the flow moving
    /// instead of rolling back.
    #[serde(default)]
    pub continue_on_permanent_failure: bool,
    /// Inject this step's response into its children's payloads.
    #[serde(default)]
    pub forward_response: bool,
    /// Persist the handler response on the step (default true).
    #[serde(default = "default_true")]
    pub save_response: bool,
    /// The step executes on a remote worker.
    #[serde(default)]
    pub background_execution: bool,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_true() -> bool {
    true
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: None,
            timeout: None,
            is_async: false,
            compensate_async: false,
            no_wait: false,
            no_compensation: false,
            continue_on_permanent_failure: false,
            forward_response: false,
            save_response: true,
            background_execution: false,
        }
    }
}

// ---------------------------------------------------------------------------
// StepNode
// ---------------------------------------------------------------------------

/// One node in the step definition tree.
///
/// `next` accepts either a single nested node or a list of nodes:
///
/// ```yaml
/// next:
///   action: charge
///   next:
///     - action: notify
///     - action: audit
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Action name, unique within a definition. Absent only on the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Successor nodes.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<StepNode>,
    /// Execution policy for this node.
    #[serde(flatten)]
    pub policy: StepPolicy,
}

impl StepNode {
    /// A root node with the given top-level steps.
    pub fn root(next: Vec<StepNode>) -> Self {
        Self {
            action: None,
            next,
            policy: StepPolicy::default(),
        }
    }

    /// A leaf node for the given action with default policy.
    pub fn action(name: impl Into<String>) -> Self {
        Self {
            action: Some(name.into()),
            next: Vec::new(),
            policy: StepPolicy::default(),
        }
    }

    /// Count of action nodes in this subtree (excluding a root without action).
    pub fn action_count(&self) -> usize {
        let own = usize::from(self.action.is_some());
        own + self.next.iter().map(StepNode::action_count).sum::<usize>()
    }
}

/// Deserialize `next` from either a single node or a sequence of nodes.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<StepNode>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(Box<StepNode>),
        Many(Vec<StepNode>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(node) => vec![*node],
        OneOrMany::Many(nodes) => nodes,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
