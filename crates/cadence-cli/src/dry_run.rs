use async_trait::async_trait;
use cadence_core::{CadenceResult, Capability, CapabilityRegistry, DataMap, ExecutionContext, Registry};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Stand-in capability that performs no work and fills every declared
/// output with a marker describing the call.
pub struct DryRun {
    outputs: Vec<String>,
}

impl DryRun {
    pub fn new(outputs: Vec<String>) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl Capability for DryRun {
    async fn execute(&self, input: DataMap, ctx: &ExecutionContext) -> CadenceResult<DataMap> {
        debug!(unit = %ctx.unit_id, attempt = ctx.attempt, inputs = input.len(), "Dry run");
        Ok(self
            .outputs
            .iter()
            .map(|field| {
                let marker = json!({
                    "dry_run": true,
                    "unit": ctx.unit_id,
                    "attempt": ctx.attempt,
                    "inputs": input.keys().collect::<Vec<_>>(),
                });
                (field.clone(), marker)
            })
            .collect())
    }
}

/// A [`DryRun`] capability for every unit in the registry.
pub fn dry_run_capabilities(registry: &Registry) -> CapabilityRegistry {
    let mut capabilities = CapabilityRegistry::new();
    for unit in registry.units() {
        capabilities.register(unit.id.clone(), Arc::new(DryRun::new(unit.outputs.clone())));
    }
    capabilities
}
