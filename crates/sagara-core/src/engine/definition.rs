//! Definition parsing and structural validation.
//!
//! Converts between YAML text and the `StepNode` tree, and validates the
//! constraints the topology builder relies on: every non-root node names an
//! action, action names use a restricted character set, and no action
//! repeats anywhere in the tree.

use std::collections::HashSet;

use sagara_types::definition::StepNode;

use super::EngineError;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated definition tree.
///
/// The YAML document is the root node; top-level steps go under `next`:
///
/// ```yaml
/// next:
///   - action: reserve
///     forward_response: true
///     next:
///       action: charge
///       max_retries: 5
///   - action: audit
///     no_wait: true
/// ```
pub fn parse_definition_yaml(yaml: &str) -> Result<StepNode, EngineError> {
    let def: StepNode =
        serde_yaml_ng::from_str(yaml).map_err(|e| EngineError::Validation(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a definition tree to YAML.
pub fn serialize_definition_yaml(def: &StepNode) -> Result<String, EngineError> {
    serde_yaml_ng::to_string(def).map_err(|e| EngineError::Validation(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition tree.
///
/// Checks:
/// - The root carries no action and at least one step exists
/// - Every non-root node names a non-empty action
/// - Action names contain only alphanumerics, hyphens, and underscores
/// - Action names are unique across the whole tree
pub fn validate_definition(def: &StepNode) -> Result<(), EngineError> {
    if def.action.is_some() {
        return Err(EngineError::Validation(
            "the root node must not carry an action".to_string(),
        ));
    }
    if def.next.is_empty() {
        return Err(EngineError::Validation(
            "a definition must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    let mut stack: Vec<&StepNode> = def.next.iter().collect();
    while let Some(node) = stack.pop() {
        let action = node.action.as_deref().ok_or_else(|| {
            EngineError::Validation("non-root node without action".to_string())
        })?;
        if action.is_empty() {
            return Err(EngineError::Validation("action name must not be empty".to_string()));
        }
        if !action
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EngineError::Validation(format!(
                "action name '{action}' contains invalid characters \
                 (only alphanumeric, hyphens, and underscores allowed)"
            )));
        }
        if !seen.insert(action) {
            return Err(EngineError::DuplicateAction(action.to_string()));
        }
        stack.extend(node.next.iter());
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
next:
  - action: reserve
    forward_response: true
    next:
      action: charge
      max_retries: 5
      retry_interval: 30
      next:
        - action: notify
        - action: audit
          no_wait: true
  - action: provision
    async: true
    timeout: 120
"#;

    #[test]
    fn parse_realistic_yaml_definition() {
        let def = parse_definition_yaml(SAMPLE).unwrap();
        assert!(def.action.is_none());
        assert_eq!(def.next.len(), 2);

        let reserve = &def.next[0];
        assert_eq!(reserve.action.as_deref(), Some("reserve"));
        assert!(reserve.policy.forward_response);

        let charge = &reserve.next[0];
        assert_eq!(charge.policy.max_retries, 5);
        assert_eq!(charge.policy.retry_interval, Some(30));
        assert_eq!(charge.next.len(), 2);
        assert!(charge.next[1].policy.no_wait);

        let provision = &def.next[1];
        assert!(provision.policy.is_async);
        assert_eq!(provision.policy.timeout, Some(120));
    }

    #[test]
    fn yaml_roundtrip() {
        let def = parse_definition_yaml(SAMPLE).unwrap();
        let yaml = serialize_definition_yaml(&def).unwrap();
        let reparsed = parse_definition_yaml(&yaml).unwrap();
        assert_eq!(reparsed, def);
    }

    #[test]
    fn rejects_root_with_action() {
        let err = parse_definition_yaml("action: oops\nnext: [{action: a}]").unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn rejects_empty_definition() {
        let err = parse_definition_yaml("next: []").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn rejects_invalid_action_charset() {
        let err = parse_definition_yaml("next: [{action: 'bad action'}]").unwrap_err();
        assert!(err.to_string().contains("invalid characters"));
    }

    #[test]
    fn rejects_duplicate_actions() {
        let yaml = "next: [{action: a}, {action: b, next: {action: a}}]";
        let err = parse_definition_yaml(yaml).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateAction(a) if a == "a"));
    }
}
