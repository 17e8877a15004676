use crate::config::CadenceConfig;
use crate::engine::Orchestrator;
use crate::events::EventBus;
use crate::modes::ModeController;
use crate::monitor::HealthMonitor;
use crate::queue::WorkQueue;
use crate::{shared_registry, SharedRegistry};
use cadence_core::{CadenceResult, CapabilityRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

const DEAD_LETTER_SWEEP: Duration = Duration::from_secs(60);

/// Every service of a running engine, wired from one configuration.
pub struct AppContext {
    pub config: CadenceConfig,
    pub registry: SharedRegistry,
    pub events: EventBus,
    pub queue: Arc<RwLock<WorkQueue>>,
    pub monitor: Arc<HealthMonitor>,
    pub orchestrator: Arc<Orchestrator>,
    pub modes: Arc<ModeController>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AppContext {
    /// Validate the configuration, construct the services and apply the
    /// initial mode. Fails if any unit lacks a capability.
    pub async fn build(config: CadenceConfig, capabilities: CapabilityRegistry) -> CadenceResult<Self> {
        let registry = shared_registry(config.build_registry()?);
        let events = EventBus::new(config.orchestrator.event_capacity);
        let queue = Arc::new(RwLock::new(WorkQueue::new(
            registry.clone(),
            config.queue.clone(),
            events.clone(),
        )));
        let monitor = Arc::new(HealthMonitor::new(config.monitor.clone(), events.clone()));

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            Arc::new(capabilities),
            queue.clone(),
            monitor.clone(),
            events.clone(),
            config.orchestrator.clone(),
        ));
        orchestrator.initialize().await?;

        let modes = Arc::new(ModeController::new(
            orchestrator.clone(),
            config.modes.clone(),
            config.presets.clone(),
            config.schedules.clone(),
        )?);
        if let Some(initial) = &config.modes.initial_mode {
            modes.set_mode(initial, None).await?;
        }

        info!(
            units = registry.read().unit_count(),
            modes = modes.list_modes().len(),
            "Application context built"
        );
        Ok(Self {
            config,
            registry,
            events,
            queue,
            monitor,
            orchestrator,
            modes,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start the engine through the mode controller, then the schedule loop
    /// and the dead-letter sweep.
    pub async fn start(&self) -> CadenceResult<Uuid> {
        let workflow_id = self.modes.start_production().await?;

        let mut tasks = self.tasks.lock();
        tasks.push(self.modes.start_schedule_loop());
        let queue = self.queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEAD_LETTER_SWEEP);
            loop {
                ticker.tick().await;
                let purged = queue.write().await.purge_old_dead_letters();
                if purged > 0 {
                    debug!(purged, "Swept expired dead letters");
                }
            }
        }));
        Ok(workflow_id)
    }

    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.orchestrator.shutdown().await;
        info!("Application context shut down");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::{Capability, CadenceError, DataMap, ExecutionContext};

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        async fn execute(&self, input: DataMap, _ctx: &ExecutionContext) -> CadenceResult<DataMap> {
            Ok(input)
        }
    }

    const CONFIG: &str = r#"
[modes]
initial_mode = "development"
approval_gate_unit = "review"

[[chains]]
id = 1
name = "content"
units = ["draft", "review"]

[[units]]
id = "draft"
chain_id = 1

[[units]]
id = "review"
chain_id = 1
dependencies = ["draft"]
approval_required = true
"#;

    fn capabilities(ids: &[&str]) -> CapabilityRegistry {
        let mut capabilities = CapabilityRegistry::new();
        for id in ids {
            capabilities.register(*id, Arc::new(Echo));
        }
        capabilities
    }

    #[tokio::test]
    async fn test_build_applies_initial_mode() {
        let config = CadenceConfig::from_toml(CONFIG).unwrap();
        let ctx = AppContext::build(config, capabilities(&["draft", "review"]))
            .await
            .unwrap();
        assert_eq!(ctx.modes.active_mode().await.unwrap().name, "development");
        // Development auto-approves the gate.
        assert!(!ctx.registry.read().unit("review").unwrap().approval_required);
    }

    #[tokio::test]
    async fn test_build_fails_without_capability() {
        let config = CadenceConfig::from_toml(CONFIG).unwrap();
        let result = AppContext::build(config, capabilities(&["draft"])).await;
        assert!(matches!(result, Err(CadenceError::Validation(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let config = CadenceConfig::from_toml(CONFIG).unwrap();
        let ctx = AppContext::build(config, capabilities(&["draft", "review"]))
            .await
            .unwrap();
        let workflow_id = ctx.start().await.unwrap();
        assert!(ctx.orchestrator.is_running());

        ctx.shutdown().await;
        assert!(!ctx.orchestrator.is_running());
        let wf = ctx.orchestrator.workflow(workflow_id).await.unwrap();
        assert!(wf.status.is_terminal());
    }
}
