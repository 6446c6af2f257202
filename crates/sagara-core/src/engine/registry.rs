//! Write-once model registry: model id -> step definition.
//!
//! Registration is write-once per id unless the incoming definition is
//! byte-equal to the registered one (re-registration on process restart is
//! common and must not fail). Concurrent reads are safe.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sagara_types::definition::StepNode;

use super::EngineError;
use super::definition::validate_definition;

/// Registry of transaction model definitions.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: DashMap<String, StepNode>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under a model id.
    ///
    /// Fails with `Validation` when the id is already taken by a different
    /// definition.
    pub fn register(&self, model_id: &str, definition: StepNode) -> Result<(), EngineError> {
        validate_definition(&definition)?;

        match self.models.entry(model_id.to_string()) {
            Entry::Occupied(existing) => {
                if *existing.get() == definition {
                    Ok(())
                } else {
                    Err(EngineError::Validation(format!(
                        "model '{model_id}' is already registered with a different definition"
                    )))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(definition);
                Ok(())
            }
        }
    }

    /// Fetch a registered definition.
    pub fn get(&self, model_id: &str) -> Option<StepNode> {
        self.models.get(model_id).map(|entry| entry.clone())
    }

    /// List registered model ids.
    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StepNode {
        StepNode::root(vec![StepNode::action("charge")])
    }

    #[test]
    fn register_and_get() {
        let registry = ModelRegistry::new();
        registry.register("orders", sample()).unwrap();
        assert_eq!(registry.get("orders"), Some(sample()));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reregistering_identical_definition_is_ok() {
        let registry = ModelRegistry::new();
        registry.register("orders", sample()).unwrap();
        registry.register("orders", sample()).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reregistering_different_definition_fails() {
        let registry = ModelRegistry::new();
        registry.register("orders", sample()).unwrap();
        let other = StepNode::root(vec![StepNode::action("refund")]);
        let err = registry.register("orders", other).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn invalid_definition_rejected() {
        let registry = ModelRegistry::new();
        let err = registry.register("orders", StepNode::root(vec![])).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
        assert!(registry.is_empty());
    }
}
