//! Step table construction and execution orderings.
//!
//! `build_steps` walks the definition tree breadth-first, appending each
//! action name to the parent path to form step ids rooted at `_root`.
//! `build_orderings` models the resulting edges as a `petgraph` directed
//! graph, verifies acyclicity via topological sort, and groups steps by
//! depth: the invoke ordering is ascending depth (root's children first),
//! the compensate ordering descending (leaves first).
//!
//! When rehydrating from a checkpoint, existing runtime attributes are
//! preserved; only structural fields (`id`, `depth`, `next`, policy) are
//! recomputed from the definition.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use sagara_types::definition::StepNode;
use sagara_types::step::{PATH_SEPARATOR, ROOT_ID, Step};

use super::EngineError;

// ---------------------------------------------------------------------------
// Step table construction
// ---------------------------------------------------------------------------

/// Build the id -> step table for a definition tree.
///
/// `existing` carries the step table of a checkpointed flow during
/// rehydration; runtime fields of matching ids are preserved.
///
/// Fails with `DuplicateAction` when an action name repeats anywhere in the
/// tree.
pub fn build_steps(
    definition: &StepNode,
    existing: Option<&HashMap<String, Step>>,
) -> Result<HashMap<String, Step>, EngineError> {
    let mut steps = HashMap::new();
    let mut seen_actions: HashSet<String> = HashSet::new();

    let mut root = Step::new(ROOT_ID.to_string(), None, 0, definition.policy.clone());
    let mut queue: VecDeque<(String, u32, &StepNode)> = VecDeque::new();

    for child in &definition.next {
        queue.push_back((ROOT_ID.to_string(), 1, child));
    }
    root.next = child_ids(ROOT_ID, &definition.next)?;
    steps.insert(ROOT_ID.to_string(), root);

    while let Some((parent_id, depth, node)) = queue.pop_front() {
        let action = node
            .action
            .as_deref()
            .ok_or_else(|| EngineError::Validation("non-root node without action".to_string()))?;
        if !seen_actions.insert(action.to_string()) {
            return Err(EngineError::DuplicateAction(action.to_string()));
        }

        let id = format!("{parent_id}{PATH_SEPARATOR}{action}");
        let mut step = match existing.and_then(|table| table.get(&id)) {
            Some(prior) => prior.clone(),
            None => Step::new(id.clone(), Some(action.to_string()), depth, node.policy.clone()),
        };
        // Structural fields are always recomputed.
        step.id = id.clone();
        step.action = Some(action.to_string());
        step.depth = depth;
        step.policy = node.policy.clone();
        step.next = child_ids(&id, &node.next)?;

        for child in &node.next {
            queue.push_back((id.clone(), depth + 1, child));
        }
        steps.insert(id, step);
    }

    Ok(steps)
}

fn child_ids(parent_id: &str, children: &[StepNode]) -> Result<Vec<String>, EngineError> {
    children
        .iter()
        .map(|child| {
            let action = child.action.as_deref().ok_or_else(|| {
                EngineError::Validation("non-root node without action".to_string())
            })?;
            Ok(format!("{parent_id}{PATH_SEPARATOR}{action}"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Orderings
// ---------------------------------------------------------------------------

/// Precomputed traversal orders for one definition.
#[derive(Debug, Clone)]
pub struct Orderings {
    /// All step ids sorted by ascending depth, definition order within a
    /// depth level. Excludes the root.
    pub invoke: Vec<String>,
    /// All step ids sorted by descending depth. Excludes the root.
    pub compensate: Vec<String>,
}

/// Compute the invoke and compensate orderings for a step table.
///
/// Builds a `DiGraph` with parent -> child edges and runs a topological
/// sort; a cycle is a structural error (the tree shape makes one impossible,
/// so hitting this indicates table corruption).
pub fn build_orderings(steps: &HashMap<String, Step>) -> Result<Orderings, EngineError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();

    // Insert in BFS order from the root so that within-depth order follows
    // the definition.
    let mut bfs: Vec<&Step> = Vec::with_capacity(steps.len());
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(ROOT_ID);
    while let Some(id) = queue.pop_front() {
        let step = steps
            .get(id)
            .ok_or_else(|| EngineError::Execution(format!("step table missing id '{id}'")))?;
        bfs.push(step);
        for child in &step.next {
            queue.push_back(child);
        }
    }

    for step in &bfs {
        let idx = graph.add_node(step.id.as_str());
        indices.insert(step.id.as_str(), idx);
    }
    for step in &bfs {
        for child in &step.next {
            graph.add_edge(indices[step.id.as_str()], indices[child.as_str()], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        EngineError::Execution(format!(
            "cycle detected involving step '{}'",
            graph[cycle.node_id()]
        ))
    })?;

    let mut invoke: Vec<String> = bfs
        .iter()
        .filter(|s| !s.is_root())
        .map(|s| s.id.clone())
        .collect();
    invoke.sort_by_key(|id| steps[id].depth);

    let mut compensate = invoke.clone();
    compensate.sort_by_key(|id| std::cmp::Reverse(steps[id].depth));

    Ok(Orderings { invoke, compensate })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sagara_types::definition::StepPolicy;
    use sagara_types::step::{StepState, StepStatus};

    fn tree(next: Vec<StepNode>) -> StepNode {
        StepNode::root(next)
    }

    fn chain(actions: &[&str]) -> StepNode {
        let mut node: Option<StepNode> = None;
        for action in actions.iter().rev() {
            let mut current = StepNode::action(*action);
            if let Some(child) = node.take() {
                current.next = vec![child];
            }
            node = Some(current);
        }
        tree(vec![node.expect("chain requires at least one action")])
    }

    // -----------------------------------------------------------------------
    // build_steps
    // -----------------------------------------------------------------------

    #[test]
    fn linear_chain_ids_and_depths() {
        // _root -> a -> b
        let steps = build_steps(&chain(&["a", "b"]), None).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps["_root"].next, vec!["_root.a"]);
        assert_eq!(steps["_root.a"].depth, 1);
        assert_eq!(steps["_root.a"].next, vec!["_root.a.b"]);
        assert_eq!(steps["_root.a.b"].depth, 2);
        assert_eq!(steps["_root.a.b"].action.as_deref(), Some("b"));
    }

    #[test]
    fn root_has_no_action() {
        let steps = build_steps(&chain(&["a"]), None).unwrap();
        assert!(steps["_root"].action.is_none());
        assert_eq!(steps["_root"].depth, 0);
    }

    #[test]
    fn duplicate_action_rejected() {
        let def = tree(vec![
            StepNode::action("charge"),
            StepNode {
                action: Some("notify".to_string()),
                next: vec![StepNode::action("charge")],
                policy: StepPolicy::default(),
            },
        ]);
        let err = build_steps(&def, None).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAction(a) if a == "charge"));
    }

    #[test]
    fn fresh_steps_are_armed() {
        let steps = build_steps(&chain(&["a"]), None).unwrap();
        let step = &steps["_root.a"];
        assert_eq!(step.invoke.state, StepState::NotStarted);
        assert_eq!(step.invoke.status, StepStatus::Idle);
        assert_eq!(step.compensate.state, StepState::Dormant);
    }

    #[test]
    fn rehydration_preserves_runtime_fields() {
        let def = chain(&["a", "b"]);
        let mut prior = build_steps(&def, None).unwrap();
        {
            let a = prior.get_mut("_root.a").unwrap();
            a.attempts = 2;
            a.failures = 1;
            a.invoke.state = StepState::Invoking;
            a.invoke.status = StepStatus::Waiting;
            a.response = Some(serde_json::json!({"ok": true}));
        }

        let rebuilt = build_steps(&def, Some(&prior)).unwrap();
        let a = &rebuilt["_root.a"];
        assert_eq!(a.attempts, 2);
        assert_eq!(a.failures, 1);
        assert_eq!(a.invoke.state, StepState::Invoking);
        assert_eq!(a.response, Some(serde_json::json!({"ok": true})));
        // Structural fields recomputed
        assert_eq!(a.next, vec!["_root.a.b"]);
        assert_eq!(a.depth, 1);
    }

    // -----------------------------------------------------------------------
    // build_orderings
    // -----------------------------------------------------------------------

    #[test]
    fn invoke_order_is_depth_waves_in_definition_order() {
        //        root
        //       / |  \
        //      a  b   d
        //         |   |
        //         c   f
        //         |
        //         e
        let def = tree(vec![
            StepNode::action("a"),
            StepNode {
                action: Some("b".to_string()),
                next: vec![StepNode {
                    action: Some("c".to_string()),
                    next: vec![StepNode::action("e")],
                    policy: StepPolicy::default(),
                }],
                policy: StepPolicy::default(),
            },
            StepNode {
                action: Some("d".to_string()),
                next: vec![StepNode::action("f")],
                policy: StepPolicy::default(),
            },
        ]);
        let steps = build_steps(&def, None).unwrap();
        let orderings = build_orderings(&steps).unwrap();

        let actions: Vec<&str> = orderings
            .invoke
            .iter()
            .map(|id| steps[id].action.as_deref().unwrap())
            .collect();
        assert_eq!(actions, vec!["a", "b", "d", "c", "f", "e"]);
    }

    #[test]
    fn compensate_order_is_leaves_first() {
        let def = chain(&["a", "b", "c"]);
        let steps = build_steps(&def, None).unwrap();
        let orderings = build_orderings(&steps).unwrap();

        let actions: Vec<&str> = orderings
            .compensate
            .iter()
            .map(|id| steps[id].action.as_deref().unwrap())
            .collect();
        assert_eq!(actions, vec!["c", "b", "a"]);
    }

    #[test]
    fn orderings_exclude_root() {
        let steps = build_steps(&chain(&["a"]), None).unwrap();
        let orderings = build_orderings(&steps).unwrap();
        assert_eq!(orderings.invoke, vec!["_root.a"]);
        assert_eq!(orderings.compensate, vec!["_root.a"]);
    }
}
