//! Orchestration engine: workflow state machine, priority work queue,
//! health monitor and mode/schedule controller.
//!
//! The four services are constructed explicitly and wired together by
//! [`AppContext`]; they share the unit/chain [`Registry`] and publish
//! notifications on a common [`EventBus`].
//!
//! # Main types
//!
//! - [`Orchestrator`] - Advances workflows through their chains one unit per tick.
//! - [`WorkQueue`] - Per-chain prioritized, retryable queues with a dead-letter store.
//! - [`HealthMonitor`] - Liveness, rolling metrics and alerting per unit.
//! - [`ModeController`] - Applies mode presets and switches them on a schedule.
//! - [`AppContext`] - Owns every service and their background loops.

/// Top-level application context wiring the services together.
pub mod context;
/// TOML configuration file format and loader.
pub mod config;
/// Workflow orchestrator and its execution tick.
pub mod engine;
/// Event types and the broadcast bus.
pub mod events;
/// Operating modes, presets and production schedules.
pub mod modes;
/// Health checks, execution metrics and alerts.
pub mod monitor;
/// Prioritized retryable work queue.
pub mod queue;
/// Workflow, approval and runtime-setting types.
pub mod types;

pub use config::{load_config, CadenceConfig};
pub use context::AppContext;
pub use engine::{Orchestrator, StepSelection, TickOutcome};
pub use events::{Event, EventBus};
pub use modes::{ModeConfig, ModeController, ModeOverrides, ProductionSchedule, TimeWindow};
pub use monitor::{Alert, AlertFilter, AlertSeverity, HealthMonitor, MonitorConfig, UnitStatus};
pub use queue::{EnqueueOptions, QueueConfig, QueueItem, QueueSnapshot, WorkQueue};
pub use types::{
    ApprovalState, ApprovalStatus, ChainStatus, OrchestratorConfig, RuntimeSettings,
    WorkflowError, WorkflowState, WorkflowStatus,
};

use cadence_core::Registry;
use std::sync::Arc;

/// Registry handle shared by every service.
///
/// Guarded by a synchronous lock: it is read from non-async queue code and
/// the guard is never held across an await point.
pub type SharedRegistry = Arc<parking_lot::RwLock<Registry>>;

/// Wrap a validated registry for sharing.
pub fn shared_registry(registry: Registry) -> SharedRegistry {
    Arc::new(parking_lot::RwLock::new(registry))
}
