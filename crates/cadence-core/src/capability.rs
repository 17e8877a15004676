use crate::blackboard::DataMap;
use crate::registry::Registry;
use crate::{CadenceError, CadenceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Context handed to a capability alongside its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Workflow the execution belongs to; `None` for on-demand runs.
    pub workflow_id: Option<Uuid>,
    pub chain_id: u32,
    pub unit_id: String,
    pub correlation_id: Uuid,
    /// 1-based attempt number.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Results of the unit's declared dependencies, keyed by unit id.
    #[serde(default)]
    pub dependency_results: DataMap,
    #[serde(default)]
    pub metadata: DataMap,
}

fn first_attempt() -> u32 {
    1
}

impl ExecutionContext {
    pub fn new(unit_id: impl Into<String>, chain_id: u32) -> Self {
        Self {
            workflow_id: None,
            chain_id,
            unit_id: unit_id.into(),
            correlation_id: Uuid::new_v4(),
            attempt: 1,
            dependency_results: DataMap::new(),
            metadata: DataMap::new(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self.correlation_id = workflow_id;
        self
    }
}

/// Trait implemented by every unit of work.
///
/// The orchestrator only ever sees this interface; what a unit actually does
/// (calling an API, generating content, persisting data) is its own business.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn execute(&self, input: DataMap, ctx: &ExecutionContext) -> CadenceResult<DataMap>;

    /// Reject malformed input before execution.
    fn validate(&self, _input: &DataMap) -> bool {
        true
    }

    /// Release resources held by the unit.
    async fn cleanup(&self) {}
}

/// Static mapping from unit id to its capability implementation.
///
/// Populated once at startup; lookups of unknown ids fail with a validation error.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    pub fn register(&mut self, unit_id: impl Into<String>, capability: Arc<dyn Capability>) {
        let unit_id = unit_id.into();
        info!(unit = %unit_id, "Registered capability");
        self.capabilities.insert(unit_id, capability);
    }

    pub fn get(&self, unit_id: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(unit_id)
    }

    pub fn require(&self, unit_id: &str) -> CadenceResult<Arc<dyn Capability>> {
        self.capabilities.get(unit_id).cloned().ok_or_else(|| {
            CadenceError::Validation(format!("no capability registered for unit '{unit_id}'"))
        })
    }

    /// Units declared in the registry that have no implementation, sorted.
    pub fn missing_for(&self, registry: &Registry) -> Vec<String> {
        registry
            .units()
            .into_iter()
            .filter(|u| !self.capabilities.contains_key(&u.id))
            .map(|u| u.id.clone())
            .collect()
    }

    /// Run `cleanup` on every registered capability.
    pub async fn cleanup_all(&self) {
        for capability in self.capabilities.values() {
            capability.cleanup().await;
        }
    }

    pub fn capability_count(&self) -> usize {
        self.capabilities.len()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{ChainDefinition, UnitDefinition};
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Capability for Upper {
        async fn execute(&self, input: DataMap, _ctx: &ExecutionContext) -> CadenceResult<DataMap> {
            let text = input
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CadenceError::Validation("text required".into()))?;
            let mut out = DataMap::new();
            out.insert("upper".into(), json!(text.to_uppercase()));
            Ok(out)
        }

        fn validate(&self, input: &DataMap) -> bool {
            input.contains_key("text")
        }
    }

    #[tokio::test]
    async fn test_registry_executes_capability() {
        let mut caps = CapabilityRegistry::new();
        caps.register("upper", Arc::new(Upper));
        let cap = caps.require("upper").unwrap();
        let mut input = DataMap::new();
        input.insert("text".into(), json!("abc"));
        assert!(cap.validate(&input));
        let out = cap
            .execute(input, &ExecutionContext::new("upper", 1))
            .await
            .unwrap();
        assert_eq!(out["upper"], json!("ABC"));
    }

    #[test]
    fn test_unknown_capability_is_validation_error() {
        let caps = CapabilityRegistry::new();
        let err = caps.require("ghost").err().unwrap();
        assert!(matches!(err, CadenceError::Validation(_)));
    }

    #[test]
    fn test_missing_for_registry() {
        let registry = Registry::new(
            vec![UnitDefinition::new("a", 1), UnitDefinition::new("b", 1)],
            vec![ChainDefinition::new(1, "c", &["a", "b"])],
        )
        .unwrap();
        let mut caps = CapabilityRegistry::new();
        caps.register("a", Arc::new(Upper));
        assert_eq!(caps.missing_for(&registry), vec!["b".to_string()]);
    }

    #[test]
    fn test_context_with_workflow_sets_correlation() {
        let wf = Uuid::new_v4();
        let ctx = ExecutionContext::new("a", 1).with_workflow(wf);
        assert_eq!(ctx.workflow_id, Some(wf));
        assert_eq!(ctx.correlation_id, wf);
    }
}
