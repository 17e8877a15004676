use crate::events::{Event, EventBus};
use crate::monitor::{AlertSeverity, HealthMonitor, UnitStatus};
use crate::queue::{compute_retry_delay, EnqueueOptions, FailOutcome, QueueItem, QueueStats, WorkQueue};
use crate::types::{
    span_millis, span_secs, ApprovalState, ApprovalStatus, ChainStatus, OrchestratorConfig,
    RuntimeSettings, WorkflowError, WorkflowState, WorkflowStatus,
};
use crate::SharedRegistry;
use cadence_core::{
    Blackboard, CadenceError, CadenceResult, CapabilityRegistry, ChainDefinition, DataMap,
    ExecutionContext, Registry, UnitDefinition,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of step selection within one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSelection {
    /// The first enabled, incomplete unit whose dependencies are all complete.
    Ready(String),
    /// Nothing is ready but some member waits for a queued retry.
    AwaitingRetry,
    /// No eligible unit remains this cycle.
    Complete,
}

/// Pick the next unit of a chain, scanning members in declared order.
pub fn select_step(members: &[&UnitDefinition], data: &Blackboard) -> StepSelection {
    let mut awaiting_retry = false;
    for unit in members {
        if !unit.enabled || data.is_completed(&unit.id) {
            continue;
        }
        if data.is_retry_pending(&unit.id) {
            awaiting_retry = true;
            continue;
        }
        if unit.dependencies.iter().all(|dep| data.is_completed(dep)) {
            return StepSelection::Ready(unit.id.clone());
        }
    }
    if awaiting_retry {
        StepSelection::AwaitingRetry
    } else {
        StepSelection::Complete
    }
}

/// What one execution tick did to one workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// The workflow is not running.
    Idle,
    /// Inside an inter-cycle or inter-chain delay.
    Delayed { until: DateTime<Utc> },
    ChainBlocked { chain_id: u32, status: ChainStatus },
    ChainSkipped { chain_id: u32, next_chain: u32 },
    AwaitingApproval { unit_id: String },
    AwaitingRetry { chain_id: u32 },
    UnitCompleted { unit_id: String },
    UnitFailed {
        unit_id: String,
        error: String,
        retrying: bool,
    },
    ChainCompleted {
        chain_id: u32,
        next_chain: u32,
        cycle_completed: bool,
    },
}

/// Payload of a retry item placed on the work queue.
///
/// Items enqueued by other callers with an arbitrary object payload are
/// executed with that object as their input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryJob {
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub input: DataMap,
    #[serde(default)]
    pub context: Option<ExecutionContext>,
    #[serde(default)]
    pub error: Option<String>,
    /// Unit epoch of the workflow when the retry was queued.
    #[serde(default)]
    pub epoch: u64,
}

impl RetryJob {
    fn from_payload(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_else(|_| Self {
            workflow_id: None,
            input: payload.as_object().cloned().unwrap_or_default(),
            context: None,
            error: None,
            epoch: 0,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub status: WorkflowStatus,
    pub current_chain: u32,
    pub current_unit: Option<String>,
    pub cycle: u64,
    pub error_count: usize,
    pub pending_approvals: Vec<String>,
}

impl From<&WorkflowState> for WorkflowSummary {
    fn from(wf: &WorkflowState) -> Self {
        Self {
            id: wf.id,
            status: wf.status,
            current_chain: wf.current_chain,
            current_unit: wf.current_unit.clone(),
            cycle: wf.cycle,
            error_count: wf.errors.len(),
            pending_approvals: wf
                .approvals
                .values()
                .filter(|a| a.status.is_blocking())
                .map(|a| a.unit_id.clone())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    pub status: ChainStatus,
}

/// Snapshot returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub active_workflow: Option<Uuid>,
    pub workflows: Vec<WorkflowSummary>,
    pub chains: Vec<ChainSummary>,
    pub queue: QueueStats,
    pub settings: RuntimeSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitView {
    pub id: String,
    pub enabled: bool,
    pub approval_required: bool,
    pub dependencies: Vec<String>,
    pub health: Option<UnitStatus>,
    pub completed: bool,
    pub skipped: bool,
    pub retry_pending: bool,
    pub approval: Option<ApprovalStatus>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainView {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    pub status: ChainStatus,
    pub loop_back: Option<u32>,
    pub current: bool,
    pub units: Vec<UnitView>,
}

/// Chain/unit graph with live status, for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct Visualization {
    pub workflow_id: Option<Uuid>,
    pub cycle: Option<u64>,
    pub chains: Vec<ChainView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub unit_id: String,
    pub error: String,
}

/// Result of an on-demand chain run.
#[derive(Debug, Clone, Serialize)]
pub struct ChainRun {
    pub chain_id: u32,
    pub completed: Vec<String>,
    /// First failure; the run stops there.
    pub failed: Option<UnitFailure>,
    pub data: Blackboard,
}

enum Plan {
    SkipChain {
        members: Vec<String>,
        next: u32,
        wrapped: bool,
    },
    Blocked(ChainStatus),
    Approvals(Vec<String>),
    AwaitRetry,
    Execute(UnitDefinition),
    CompleteChain {
        members: Vec<String>,
        next: u32,
        wrapped: bool,
    },
}

/// A queued retry still applies: the workflow is live, the unit has not
/// completed since, and nobody reset it after the retry was queued.
fn retry_is_current(wf: &WorkflowState, unit_id: &str, epoch: u64) -> bool {
    !wf.status.is_terminal() && !wf.data.is_completed(unit_id) && wf.unit_epoch(unit_id) == epoch
}

/// Chain to enter after `chain`, and whether doing so ends the cycle.
fn successor(registry: &Registry, chain: &ChainDefinition) -> (u32, bool) {
    if let Some(target) = chain.loop_back {
        return (target, true);
    }
    match registry.next_chain_id(chain.id) {
        Some(next) => (next, false),
        None => (registry.first_chain_id().unwrap_or(chain.id), true),
    }
}

fn derive_chain_status(
    chain: &ChainDefinition,
    overrides: &BTreeMap<u32, ChainStatus>,
    workflow: Option<&WorkflowState>,
) -> ChainStatus {
    if let Some(status) = overrides.get(&chain.id) {
        return *status;
    }
    match workflow {
        Some(wf) if wf.blocking_approvals(&chain.units).next().is_some() => {
            ChainStatus::WaitingApproval
        }
        _ => ChainStatus::Active,
    }
}

fn workflow_not_found(id: Uuid) -> CadenceError {
    CadenceError::NotFound(format!("workflow {id}"))
}

fn pending_approval<'a>(
    wf: &'a mut WorkflowState,
    unit_id: &str,
) -> CadenceResult<&'a mut ApprovalState> {
    let approval = wf
        .approvals
        .get_mut(unit_id)
        .ok_or_else(|| CadenceError::NotFound(format!("approval for unit '{unit_id}'")))?;
    if approval.status != ApprovalStatus::Pending {
        return Err(CadenceError::Approval(format!(
            "approval for unit '{unit_id}' is {:?}, not pending",
            approval.status
        )));
    }
    Ok(approval)
}

/// Drives workflows through their chains.
///
/// Each execution tick dispatches at most one unit per running workflow.
/// Failures with retry budget are handed to the [`WorkQueue`] and executed
/// by the queue tick; the chain waits until the retry resolves.
pub struct Orchestrator {
    registry: SharedRegistry,
    capabilities: Arc<CapabilityRegistry>,
    queue: Arc<RwLock<WorkQueue>>,
    monitor: Arc<HealthMonitor>,
    events: EventBus,
    config: OrchestratorConfig,
    settings: RwLock<RuntimeSettings>,
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    active: RwLock<Option<Uuid>>,
    chain_overrides: RwLock<BTreeMap<u32, ChainStatus>>,
    tick_lock: Mutex<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        registry: SharedRegistry,
        capabilities: Arc<CapabilityRegistry>,
        queue: Arc<RwLock<WorkQueue>>,
        monitor: Arc<HealthMonitor>,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let settings = RuntimeSettings::from(&config);
        Self {
            registry,
            capabilities,
            queue,
            monitor,
            events,
            config,
            settings: RwLock::new(settings),
            workflows: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            chain_overrides: RwLock::new(BTreeMap::new()),
            tick_lock: Mutex::new(()),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<RwLock<WorkQueue>> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn settings(&self) -> RuntimeSettings {
        self.settings.read().await.clone()
    }

    pub async fn apply_settings(&self, settings: RuntimeSettings) {
        debug!(?settings, "Applying runtime settings");
        *self.settings.write().await = settings;
    }

    /// Check every unit has a capability and register the units with the monitor.
    pub async fn initialize(&self) -> CadenceResult<()> {
        let (missing, unit_ids) = {
            let registry = self.registry.read();
            let ids: Vec<String> = registry.units().iter().map(|u| u.id.clone()).collect();
            (self.capabilities.missing_for(&registry), ids)
        };
        if !missing.is_empty() {
            return Err(CadenceError::Validation(format!(
                "no capability registered for units: {}",
                missing.join(", ")
            )));
        }
        self.monitor.register_units(&unit_ids).await;
        info!(units = unit_ids.len(), "Orchestrator initialized");
        Ok(())
    }

    /// Create a running workflow at the first chain without starting any loop.
    pub async fn create_workflow(&self) -> CadenceResult<Uuid> {
        let first = self
            .registry
            .read()
            .first_chain_id()
            .ok_or_else(|| CadenceError::Validation("registry has no chains".to_string()))?;
        let state = WorkflowState::new(first);
        let id = state.id;
        self.workflows.write().await.insert(id, state);
        *self.active.write().await = Some(id);

        info!(workflow_id = %id, chain_id = first, "Workflow started");
        self.events.emit(Event::WorkflowStarted { workflow_id: id });
        Ok(id)
    }

    /// Create a workflow and make sure the background loops are running.
    pub async fn start(self: &Arc<Self>) -> CadenceResult<Uuid> {
        let id = self.create_workflow().await?;
        self.spawn_loops();
        Ok(id)
    }

    /// Spawn the monitor passes, the execution tick and the queue tick.
    /// Does nothing if they already run.
    pub fn spawn_loops(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.extend(self.monitor.start());

        let engine = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.tick_interval_ms.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                engine.tick().await;
            }
        }));

        let engine = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.queue_tick_interval_ms.max(1));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                engine.process_queue_once().await;
            }
        }));
        info!(tick_ms = self.config.tick_interval_ms, "Orchestrator loops started");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Advance every running workflow by one step.
    pub async fn tick(&self) -> Vec<(Uuid, TickOutcome)> {
        let _guard = self.tick_lock.lock().await;
        let ids: Vec<Uuid> = {
            let workflows = self.workflows.read().await;
            let mut running: Vec<&WorkflowState> = workflows
                .values()
                .filter(|wf| wf.status == WorkflowStatus::Running)
                .collect();
            running.sort_by_key(|wf| wf.started_at);
            running.iter().map(|wf| wf.id).collect()
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.advance_workflow(id).await {
                Ok(outcome) => outcomes.push((id, outcome)),
                Err(e) => error!(workflow_id = %id, error = %e, "Execution tick failed"),
            }
        }
        outcomes
    }

    async fn advance_workflow(&self, id: Uuid) -> CadenceResult<TickOutcome> {
        let now = Utc::now();
        let overrides = self.chain_overrides.read().await.clone();
        let settings = self.settings.read().await.clone();

        let mut workflows = self.workflows.write().await;
        let wf = workflows.get_mut(&id).ok_or_else(|| workflow_not_found(id))?;
        if wf.status != WorkflowStatus::Running {
            return Ok(TickOutcome::Idle);
        }
        if let Some(until) = wf.resume_at {
            if now < until {
                return Ok(TickOutcome::Delayed { until });
            }
            wf.resume_at = None;
        }

        let chain_id = wf.current_chain;
        let plan = {
            let registry = self.registry.read();
            let chain = registry.require_chain(chain_id)?;
            if !chain.enabled {
                let next = registry.next_chain_id(chain_id);
                let (next, wrapped) = match next {
                    Some(next) => (next, false),
                    None => (registry.first_chain_id().unwrap_or(chain_id), true),
                };
                Plan::SkipChain {
                    members: chain.units.clone(),
                    next,
                    wrapped,
                }
            } else {
                match derive_chain_status(chain, &overrides, Some(&*wf)) {
                    ChainStatus::Active => {
                        let members = registry.members(chain_id);
                        match select_step(&members, &wf.data) {
                            StepSelection::Ready(unit_id) => {
                                Plan::Execute(registry.require_unit(&unit_id)?.clone())
                            }
                            StepSelection::AwaitingRetry => Plan::AwaitRetry,
                            StepSelection::Complete => {
                                let (next, wrapped) = successor(&registry, chain);
                                Plan::CompleteChain {
                                    members: chain.units.clone(),
                                    next,
                                    wrapped,
                                }
                            }
                        }
                    }
                    ChainStatus::WaitingApproval => Plan::Approvals(chain.units.clone()),
                    status => Plan::Blocked(status),
                }
            }
        };

        match plan {
            Plan::SkipChain {
                members,
                next,
                wrapped,
            } => {
                debug!(workflow_id = %id, chain_id, next, "Skipping disabled chain");
                wf.reset_chain(&members);
                self.enter_chain(wf, next, wrapped, &settings, now);
                Ok(TickOutcome::ChainSkipped {
                    chain_id,
                    next_chain: next,
                })
            }
            Plan::Blocked(status) => Ok(TickOutcome::ChainBlocked { chain_id, status }),
            Plan::Approvals(members) => {
                self.expire_approvals(wf, &members, now);
                Ok(TickOutcome::ChainBlocked {
                    chain_id,
                    status: ChainStatus::WaitingApproval,
                })
            }
            Plan::AwaitRetry => Ok(TickOutcome::AwaitingRetry { chain_id }),
            Plan::CompleteChain {
                members,
                next,
                wrapped,
            } => {
                wf.reset_chain(&members);
                let elapsed_ms = (now - wf.chain_started_at).num_milliseconds().max(0) as u64;
                self.monitor.record_chain_cycle(chain_id, elapsed_ms).await;

                info!(workflow_id = %id, chain_id, cycle = wf.cycle, "Chain completed");
                self.events.emit(Event::ChainCompleted {
                    workflow_id: id,
                    chain_id,
                    cycle: wf.cycle,
                });
                self.enter_chain(wf, next, wrapped, &settings, now);
                Ok(TickOutcome::ChainCompleted {
                    chain_id,
                    next_chain: next,
                    cycle_completed: wrapped,
                })
            }
            Plan::Execute(unit) => {
                wf.current_unit = Some(unit.id.clone());
                if unit.approval_required {
                    self.monitor.record_execution_start(&unit.id).await;
                    self.monitor.set_status(&unit.id, UnitStatus::Paused).await;
                    let approval = ApprovalState::new(&unit.id, wf.data.flatten());
                    wf.approvals.insert(unit.id.clone(), approval);
                    info!(workflow_id = %id, unit = %unit.id, "Approval requested");
                    self.events.emit(Event::ApprovalRequested {
                        workflow_id: id,
                        unit_id: unit.id.clone(),
                    });
                    return Ok(TickOutcome::AwaitingApproval { unit_id: unit.id });
                }

                let input = wf.data.gather(&unit.inputs);
                let mut ctx = ExecutionContext::new(&unit.id, chain_id).with_workflow(id);
                ctx.dependency_results = wf.data.gather_results(&unit.dependencies);
                ctx.metadata.insert("cycle".into(), json!(wf.cycle));
                drop(workflows);

                // In-flight units run to completion even if the workflow is
                // paused meanwhile.
                let (result, _) = self.execute_unit(&unit, input.clone(), &ctx).await;

                let mut workflows = self.workflows.write().await;
                let wf = workflows.get_mut(&id).ok_or_else(|| workflow_not_found(id))?;
                if wf.status.is_terminal() {
                    debug!(workflow_id = %id, unit = %unit.id, "Discarding result of stopped workflow");
                    return Ok(TickOutcome::Idle);
                }
                match result {
                    Ok(output) => {
                        Self::apply_success(wf, &unit, output);
                        Ok(TickOutcome::UnitCompleted { unit_id: unit.id })
                    }
                    Err(err) => self.handle_failure(wf, &unit, input, ctx, err).await,
                }
            }
        }
    }

    fn enter_chain(
        &self,
        wf: &mut WorkflowState,
        next: u32,
        wrapped: bool,
        settings: &RuntimeSettings,
        now: DateTime<Utc>,
    ) {
        if wrapped {
            wf.cycle += 1;
            info!(workflow_id = %wf.id, cycle = wf.cycle, "Cycle completed");
            self.events.emit(Event::CycleCompleted {
                workflow_id: wf.id,
                cycle: wf.cycle,
            });
            if settings.inter_cycle_delay_ms > 0 {
                wf.resume_at = Some(now + span_millis(settings.inter_cycle_delay_ms));
            }
        } else if self.config.inter_chain_delay_ms > 0 {
            wf.resume_at =
                Some(now + span_millis(self.config.inter_chain_delay_ms));
        }
        wf.current_chain = next;
        wf.current_unit = None;
        wf.chain_started_at = now;
    }

    /// Time out stale approvals of the given units; any timeout pauses the workflow.
    fn expire_approvals(&self, wf: &mut WorkflowState, members: &[String], now: DateTime<Utc>) {
        let limit = span_secs(self.config.approval_timeout_secs);
        let mut expired = Vec::new();
        for approval in wf.approvals.values_mut() {
            if approval.status == ApprovalStatus::Pending
                && members.contains(&approval.unit_id)
                && now - approval.requested_at > limit
            {
                approval.status = ApprovalStatus::Timeout;
                expired.push(approval.unit_id.clone());
            }
        }
        if expired.is_empty() {
            return;
        }
        for unit_id in expired {
            warn!(workflow_id = %wf.id, unit = %unit_id, "Approval timed out");
            self.events.emit(Event::ApprovalTimedOut {
                workflow_id: wf.id,
                unit_id,
            });
        }
        wf.status = WorkflowStatus::Paused;
        wf.paused_at = Some(now);
        self.events.emit(Event::WorkflowPaused { workflow_id: wf.id });
    }

    async fn execute_unit(
        &self,
        unit: &UnitDefinition,
        input: DataMap,
        ctx: &ExecutionContext,
    ) -> (CadenceResult<DataMap>, u64) {
        self.monitor.record_execution_start(&unit.id).await;
        self.events.emit(Event::UnitStarted {
            workflow_id: ctx.workflow_id,
            unit_id: unit.id.clone(),
        });
        debug!(unit = %unit.id, attempt = ctx.attempt, "Dispatching unit");

        let started = Instant::now();
        let result = self.invoke(unit, input, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let error_text = result.as_ref().err().map(ToString::to_string);
        self.monitor
            .record_execution_complete(&unit.id, duration_ms, result.is_ok(), error_text.as_deref())
            .await;
        match &error_text {
            None => info!(unit = %unit.id, duration_ms, "Unit completed"),
            Some(e) => warn!(unit = %unit.id, duration_ms, error = %e, "Unit failed"),
        }
        self.events.emit(Event::UnitCompleted {
            workflow_id: ctx.workflow_id,
            unit_id: unit.id.clone(),
            success: result.is_ok(),
            duration_ms,
        });
        (result, duration_ms)
    }

    async fn invoke(
        &self,
        unit: &UnitDefinition,
        input: DataMap,
        ctx: &ExecutionContext,
    ) -> CadenceResult<DataMap> {
        let capability = self.capabilities.require(&unit.id)?;
        if !capability.validate(&input) {
            return Err(CadenceError::Validation(format!(
                "input rejected by unit '{}'",
                unit.id
            )));
        }
        let budget = std::time::Duration::from_millis(unit.timeout_ms);
        match tokio::time::timeout(budget, capability.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(CadenceError::Timeout(format!(
                "unit '{}' exceeded {}ms",
                unit.id, unit.timeout_ms
            ))),
        }
    }

    fn apply_success(wf: &mut WorkflowState, unit: &UnitDefinition, output: DataMap) {
        let written = wf.data.absorb_outputs(&unit.outputs, &output);
        wf.data.set_result(&unit.id, Value::Object(output));
        wf.data.mark_completed(&unit.id);
        if wf.current_unit.as_deref() == Some(unit.id.as_str()) {
            wf.current_unit = None;
        }
        debug!(workflow_id = %wf.id, unit = %unit.id, fields = written, "Outputs written");
    }

    async fn handle_failure(
        &self,
        wf: &mut WorkflowState,
        unit: &UnitDefinition,
        input: DataMap,
        ctx: ExecutionContext,
        err: CadenceError,
    ) -> CadenceResult<TickOutcome> {
        let message = err.to_string();
        wf.errors.push(WorkflowError {
            unit_id: unit.id.clone(),
            chain_id: unit.chain_id,
            kind: err.kind().to_string(),
            message: message.clone(),
            attempt: ctx.attempt,
            timestamp: Utc::now(),
        });
        wf.current_unit = None;

        if unit.retry_limit == 0 {
            self.fail_workflow(wf, &unit.id, &message);
            return Ok(TickOutcome::UnitFailed {
                unit_id: unit.id.clone(),
                error: message,
                retrying: false,
            });
        }

        let job = RetryJob {
            workflow_id: Some(wf.id),
            input,
            context: Some(ctx),
            error: Some(message.clone()),
            epoch: wf.unit_epoch(&unit.id),
        };
        let payload = serde_json::to_value(&job)?;
        let item = {
            let mut queue = self.queue.write().await;
            let delay_ms = compute_retry_delay(
                unit.retry_delay_ms,
                queue.config().backoff_multiplier,
                1,
                queue.config().max_retry_delay_ms,
            );
            let options = EnqueueOptions::default()
                .with_correlation(wf.id)
                .with_prior_attempts(1)
                .scheduled_for(Utc::now() + span_millis(delay_ms));
            queue.enqueue(&unit.id, payload, options)?
        };
        wf.data.mark_retry_pending(&unit.id);
        warn!(
            workflow_id = %wf.id,
            unit = %unit.id,
            item_id = %item.id,
            error = %message,
            "Unit failed, retry queued"
        );
        Ok(TickOutcome::UnitFailed {
            unit_id: unit.id.clone(),
            error: message,
            retrying: true,
        })
    }

    fn fail_workflow(&self, wf: &mut WorkflowState, unit_id: &str, message: &str) {
        wf.status = WorkflowStatus::Error;
        error!(workflow_id = %wf.id, unit = %unit_id, error = %message, "Workflow failed");
        self.events.emit(Event::WorkflowFailed {
            workflow_id: wf.id,
            unit_id: unit_id.to_string(),
            error: message.to_string(),
        });
    }

    /// Process due queue items: one, or up to the concurrency cap when
    /// parallel execution is enabled. Returns the number processed.
    pub async fn process_queue_once(&self) -> usize {
        let batch = self.settings.read().await.queue_batch();
        let items: Vec<QueueItem> = {
            let mut queue = self.queue.write().await;
            std::iter::from_fn(|| queue.dequeue(None)).take(batch).collect()
        };
        let count = items.len();
        if count > 0 {
            debug!(count, "Processing queue items");
            join_all(items.into_iter().map(|item| self.process_item(item))).await;
        }
        count
    }

    async fn process_item(&self, item: QueueItem) {
        let unit = self.registry.read().unit(&item.unit_id).cloned();
        let Some(unit) = unit else {
            if let Err(e) = self.queue.write().await.fail(item.id, "unit no longer registered") {
                warn!(item_id = %item.id, error = %e, "Could not fail queue item");
            }
            return;
        };
        let job = RetryJob::from_payload(&item.payload);

        if let Some(workflow_id) = job.workflow_id {
            if !self.wants_retry(workflow_id, &unit.id, job.epoch).await {
                debug!(item_id = %item.id, unit = %unit.id, "Retry no longer needed");
                self.discard_item(item.id).await;
                return;
            }
        }

        let mut ctx = job.context.unwrap_or_else(|| {
            let ctx = ExecutionContext::new(&unit.id, unit.chain_id);
            match job.workflow_id {
                Some(workflow_id) => ctx.with_workflow(workflow_id),
                None => ctx,
            }
        });
        ctx.attempt = item.metadata.attempts + 1;

        let (result, _) = self.execute_unit(&unit, job.input, &ctx).await;
        match result {
            Ok(output) => {
                let settled = self
                    .queue
                    .write()
                    .await
                    .complete(item.id, Value::Object(output.clone()));
                if let Err(e) = settled {
                    warn!(item_id = %item.id, error = %e, "Could not complete queue item");
                }
                if let Some(workflow_id) = job.workflow_id {
                    let mut workflows = self.workflows.write().await;
                    if let Some(wf) = workflows.get_mut(&workflow_id) {
                        if retry_is_current(wf, &unit.id, job.epoch) {
                            Self::apply_success(wf, &unit, output);
                        } else {
                            debug!(item_id = %item.id, unit = %unit.id, "Dropping result of a reset unit");
                        }
                    }
                }
            }
            Err(err) => {
                if let Some(workflow_id) = job.workflow_id {
                    if !self.wants_retry(workflow_id, &unit.id, job.epoch).await {
                        debug!(item_id = %item.id, unit = %unit.id, "Dropping failure of a reset unit");
                        self.discard_item(item.id).await;
                        return;
                    }
                }
                let message = err.to_string();
                let outcome = self.queue.write().await.fail(item.id, &message);
                let exhausted = match outcome {
                    Ok(FailOutcome::Retrying { .. }) => false,
                    Ok(FailOutcome::Failed | FailOutcome::DeadLettered) => true,
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "Could not fail queue item");
                        false
                    }
                };
                if exhausted {
                    self.monitor
                        .create_alert(
                            AlertSeverity::Critical,
                            &unit.id,
                            format!(
                                "unit '{}' exhausted its retries after {} attempts: {message}",
                                unit.id, ctx.attempt
                            ),
                        )
                        .await;
                }
                if let Some(workflow_id) = job.workflow_id {
                    let mut workflows = self.workflows.write().await;
                    if let Some(wf) = workflows.get_mut(&workflow_id) {
                        wf.errors.push(WorkflowError {
                            unit_id: unit.id.clone(),
                            chain_id: unit.chain_id,
                            kind: err.kind().to_string(),
                            message: message.clone(),
                            attempt: ctx.attempt,
                            timestamp: Utc::now(),
                        });
                        if exhausted {
                            wf.data.clear_retry_pending(&unit.id);
                            if !wf.status.is_terminal() {
                                self.fail_workflow(wf, &unit.id, &message);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn wants_retry(&self, workflow_id: Uuid, unit_id: &str, epoch: u64) -> bool {
        let workflows = self.workflows.read().await;
        workflows
            .get(&workflow_id)
            .is_some_and(|wf| retry_is_current(wf, unit_id, epoch))
    }

    async fn discard_item(&self, item_id: Uuid) {
        let settled = self
            .queue
            .write()
            .await
            .complete(item_id, json!({ "discarded": true }));
        if let Err(e) = settled {
            warn!(item_id = %item_id, error = %e, "Could not settle queue item");
        }
    }

    /// Cancel queued retries of a workflow, optionally only those of one unit.
    async fn cancel_retries(&self, workflow_id: Uuid, unit_id: Option<&str>) -> usize {
        let chain_ids = self.registry.read().chain_ids();
        let mut queue = self.queue.write().await;
        let doomed: Vec<Uuid> = chain_ids
            .into_iter()
            .flat_map(|chain| queue.pending_items(chain))
            .filter(|item| item.metadata.correlation_id == workflow_id)
            .filter(|item| unit_id.map_or(true, |u| item.unit_id == u))
            .map(|item| item.id)
            .collect();
        doomed
            .into_iter()
            .filter(|id| queue.cancel(*id).is_ok())
            .count()
    }

    /// Approve a pending approval: the gated unit is marked completed.
    pub async fn approve(&self, workflow_id: Uuid, unit_id: &str, approver: &str) -> CadenceResult<()> {
        {
            let mut workflows = self.workflows.write().await;
            let wf = workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| workflow_not_found(workflow_id))?;
            let approval = pending_approval(wf, unit_id)?;
            approval.status = ApprovalStatus::Approved;
            approval.approved_at = Some(Utc::now());
            approval.approver = Some(approver.to_string());
            wf.data.mark_completed(unit_id);
            if wf.current_unit.as_deref() == Some(unit_id) {
                wf.current_unit = None;
            }
        }
        self.monitor.set_status(unit_id, UnitStatus::Completed).await;
        info!(workflow_id = %workflow_id, unit = %unit_id, approver = %approver, "Approval granted");
        self.events.emit(Event::ApprovalGranted {
            workflow_id,
            unit_id: unit_id.to_string(),
            approver: approver.to_string(),
        });
        Ok(())
    }

    /// Reject a pending approval; the whole workflow pauses until resumed.
    pub async fn reject(&self, workflow_id: Uuid, unit_id: &str, approver: &str) -> CadenceResult<()> {
        let paused = {
            let mut workflows = self.workflows.write().await;
            let wf = workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| workflow_not_found(workflow_id))?;
            let now = Utc::now();
            let approval = pending_approval(wf, unit_id)?;
            approval.status = ApprovalStatus::Rejected;
            approval.rejected_at = Some(now);
            approval.approver = Some(approver.to_string());
            let running = wf.status == WorkflowStatus::Running;
            if running {
                wf.status = WorkflowStatus::Paused;
                wf.paused_at = Some(now);
            }
            running
        };
        warn!(workflow_id = %workflow_id, unit = %unit_id, approver = %approver, "Approval rejected");
        self.events.emit(Event::ApprovalRejected {
            workflow_id,
            unit_id: unit_id.to_string(),
            approver: approver.to_string(),
        });
        if paused {
            self.events.emit(Event::WorkflowPaused { workflow_id });
        }
        Ok(())
    }

    async fn transition<F>(
        &self,
        workflow_id: Option<Uuid>,
        mut apply: F,
        event: fn(Uuid) -> Event,
    ) -> CadenceResult<Vec<Uuid>>
    where
        F: FnMut(&mut WorkflowState, DateTime<Utc>) -> bool,
    {
        let now = Utc::now();
        let mut workflows = self.workflows.write().await;
        let targets: Vec<Uuid> = match workflow_id {
            Some(id) if !workflows.contains_key(&id) => return Err(workflow_not_found(id)),
            Some(id) => vec![id],
            None => workflows.keys().copied().collect(),
        };
        let mut changed = Vec::new();
        for id in targets {
            if let Some(wf) = workflows.get_mut(&id) {
                if apply(wf, now) {
                    changed.push(id);
                }
            }
        }
        drop(workflows);
        for id in &changed {
            self.events.emit(event(*id));
        }
        Ok(changed)
    }

    /// Pause one workflow, or every running workflow when `None`.
    /// Returns how many changed state.
    pub async fn pause(&self, workflow_id: Option<Uuid>) -> CadenceResult<usize> {
        let changed = self
            .transition(
                workflow_id,
                |wf, now| {
                    if wf.status != WorkflowStatus::Running {
                        return false;
                    }
                    wf.status = WorkflowStatus::Paused;
                    wf.paused_at = Some(now);
                    true
                },
                |id| Event::WorkflowPaused { workflow_id: id },
            )
            .await?;
        info!(count = changed.len(), "Paused workflows");
        Ok(changed.len())
    }

    /// Resume paused or failed workflows. Timed-out approvals are re-armed.
    pub async fn resume(&self, workflow_id: Option<Uuid>) -> CadenceResult<usize> {
        let changed = self
            .transition(
                workflow_id,
                |wf, now| {
                    if !matches!(wf.status, WorkflowStatus::Paused | WorkflowStatus::Error) {
                        return false;
                    }
                    wf.status = WorkflowStatus::Running;
                    wf.paused_at = None;
                    for approval in wf.approvals.values_mut() {
                        if approval.status == ApprovalStatus::Timeout {
                            approval.status = ApprovalStatus::Pending;
                            approval.requested_at = now;
                        }
                    }
                    true
                },
                |id| Event::WorkflowResumed { workflow_id: id },
            )
            .await?;
        info!(count = changed.len(), "Resumed workflows");
        Ok(changed.len())
    }

    /// Stop workflows for good and cancel their queued retries.
    pub async fn stop(&self, workflow_id: Option<Uuid>) -> CadenceResult<usize> {
        let changed = self
            .transition(
                workflow_id,
                |wf, now| {
                    if wf.status.is_terminal() {
                        return false;
                    }
                    wf.status = WorkflowStatus::Stopped;
                    wf.completed_at = Some(now);
                    wf.current_unit = None;
                    true
                },
                |id| Event::WorkflowStopped { workflow_id: id },
            )
            .await?;
        for id in &changed {
            let cancelled = self.cancel_retries(*id, None).await;
            info!(workflow_id = %id, cancelled, "Workflow stopped");
        }
        Ok(changed.len())
    }

    async fn set_chain_override(
        &self,
        chain_id: u32,
        status: Option<ChainStatus>,
    ) -> CadenceResult<()> {
        let members = self.registry.read().require_chain(chain_id)?.units.clone();
        let unit_status = match status {
            Some(ChainStatus::Stopped) => UnitStatus::Stopped,
            Some(_) => UnitStatus::Paused,
            None => UnitStatus::Idle,
        };
        {
            let mut overrides = self.chain_overrides.write().await;
            match status {
                Some(status) => overrides.insert(chain_id, status),
                None => overrides.remove(&chain_id),
            };
        }
        for unit in &members {
            self.monitor.set_status(unit, unit_status).await;
        }
        info!(chain_id, ?status, "Chain status changed");
        Ok(())
    }

    /// Hold a chain regardless of workflow status.
    pub async fn pause_chain(&self, chain_id: u32) -> CadenceResult<()> {
        self.set_chain_override(chain_id, Some(ChainStatus::Paused)).await
    }

    pub async fn stop_chain(&self, chain_id: u32) -> CadenceResult<()> {
        self.set_chain_override(chain_id, Some(ChainStatus::Stopped)).await
    }

    /// Clear a chain-level pause or stop.
    pub async fn resume_chain(&self, chain_id: u32) -> CadenceResult<()> {
        self.set_chain_override(chain_id, None).await
    }

    /// Force-mark a unit completed and skipped for the current cycle.
    pub async fn skip_agent(&self, workflow_id: Uuid, unit_id: &str) -> CadenceResult<()> {
        self.registry.read().require_unit(unit_id).map(|_| ())?;
        {
            let mut workflows = self.workflows.write().await;
            let wf = workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| workflow_not_found(workflow_id))?;
            wf.data.mark_skipped(unit_id);
            wf.approvals.remove(unit_id);
            wf.bump_unit_epoch(unit_id);
            if wf.current_unit.as_deref() == Some(unit_id) {
                wf.current_unit = None;
            }
        }
        let cancelled = self.cancel_retries(workflow_id, Some(unit_id)).await;
        info!(workflow_id = %workflow_id, unit = %unit_id, cancelled, "Unit skipped");
        Ok(())
    }

    /// Clear a unit's completion and result so it executes again.
    pub async fn force_retry(&self, workflow_id: Uuid, unit_id: &str) -> CadenceResult<()> {
        self.registry.read().require_unit(unit_id).map(|_| ())?;
        {
            let mut workflows = self.workflows.write().await;
            let wf = workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| workflow_not_found(workflow_id))?;
            wf.data.reset_unit(unit_id);
            wf.approvals.remove(unit_id);
            wf.bump_unit_epoch(unit_id);
        }
        let cancelled = self.cancel_retries(workflow_id, Some(unit_id)).await;
        info!(workflow_id = %workflow_id, unit = %unit_id, cancelled, "Unit reset for retry");
        Ok(())
    }

    /// Write a field straight into a workflow's blackboard.
    pub async fn inject_data(
        &self,
        workflow_id: Uuid,
        key: impl Into<String>,
        value: Value,
    ) -> CadenceResult<()> {
        let mut workflows = self.workflows.write().await;
        let wf = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| workflow_not_found(workflow_id))?;
        let key = key.into();
        debug!(workflow_id = %workflow_id, key = %key, "Injected data");
        wf.data.set_field(key, value);
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: Uuid) -> Option<WorkflowState> {
        self.workflows.read().await.get(&workflow_id).cloned()
    }

    pub async fn active_workflow(&self) -> Option<Uuid> {
        *self.active.read().await
    }

    pub async fn get_status(&self) -> OrchestratorStatus {
        let overrides = self.chain_overrides.read().await.clone();
        let settings = self.settings.read().await.clone();
        let queue = self.queue.read().await.stats();
        let active_workflow = *self.active.read().await;
        let workflows = self.workflows.read().await;

        let mut summaries: Vec<WorkflowSummary> = workflows.values().map(WorkflowSummary::from).collect();
        summaries.sort_by_key(|s| s.id);
        let active = active_workflow.and_then(|id| workflows.get(&id));
        let chains = {
            let registry = self.registry.read();
            registry
                .chains()
                .map(|chain| ChainSummary {
                    id: chain.id,
                    name: chain.name.clone(),
                    enabled: chain.enabled,
                    status: derive_chain_status(chain, &overrides, active),
                })
                .collect()
        };

        OrchestratorStatus {
            running: self.is_running(),
            active_workflow,
            workflows: summaries,
            chains,
            queue,
            settings,
        }
    }

    /// Chain/unit graph for a workflow (the active one when `None`).
    pub async fn get_visualization(&self, workflow_id: Option<Uuid>) -> CadenceResult<Visualization> {
        let workflow_id = match workflow_id {
            Some(id) => Some(id),
            None => *self.active.read().await,
        };
        let workflow = match workflow_id {
            Some(id) => Some(self.workflow(id).await.ok_or_else(|| workflow_not_found(id))?),
            None => None,
        };
        let overrides = self.chain_overrides.read().await.clone();
        let health: HashMap<String, UnitStatus> = self
            .monitor
            .health_summary()
            .await
            .units
            .into_iter()
            .map(|h| (h.unit_id, h.status))
            .collect();

        let unit_ids: Vec<String> = self.registry.read().units().iter().map(|u| u.id.clone()).collect();
        let depths: HashMap<String, usize> = {
            let queue = self.queue.read().await;
            unit_ids
                .into_iter()
                .map(|id| {
                    let depth = queue.queue_depth(&id);
                    (id, depth)
                })
                .collect()
        };

        let registry = self.registry.read();
        let chains = registry
            .chains()
            .map(|chain| ChainView {
                id: chain.id,
                name: chain.name.clone(),
                enabled: chain.enabled,
                status: derive_chain_status(chain, &overrides, workflow.as_ref()),
                loop_back: chain.loop_back,
                current: workflow.as_ref().is_some_and(|wf| wf.current_chain == chain.id),
                units: registry
                    .members(chain.id)
                    .into_iter()
                    .map(|unit| UnitView {
                        id: unit.id.clone(),
                        enabled: unit.enabled,
                        approval_required: unit.approval_required,
                        dependencies: unit.dependencies.clone(),
                        health: health.get(&unit.id).copied(),
                        completed: workflow.as_ref().is_some_and(|wf| wf.data.is_completed(&unit.id)),
                        skipped: workflow.as_ref().is_some_and(|wf| wf.data.is_skipped(&unit.id)),
                        retry_pending: workflow
                            .as_ref()
                            .is_some_and(|wf| wf.data.is_retry_pending(&unit.id)),
                        approval: workflow
                            .as_ref()
                            .and_then(|wf| wf.approvals.get(&unit.id))
                            .map(|a| a.status),
                        queue_depth: depths.get(&unit.id).copied().unwrap_or(0),
                    })
                    .collect(),
            })
            .collect();

        Ok(Visualization {
            workflow_id,
            cycle: workflow.as_ref().map(|wf| wf.cycle),
            chains,
        })
    }

    /// Execute one unit on demand, outside any workflow.
    pub async fn run_unit(&self, unit_id: &str, input: DataMap) -> CadenceResult<DataMap> {
        let unit = self.registry.read().require_unit(unit_id)?.clone();
        let ctx = ExecutionContext::new(&unit.id, unit.chain_id);
        let (result, _) = self.execute_unit(&unit, input, &ctx).await;
        result
    }

    /// Execute a chain's enabled units in order on a scratch blackboard,
    /// stopping at the first failure.
    pub async fn run_chain(&self, chain_id: u32, seed: DataMap) -> CadenceResult<ChainRun> {
        let units: Vec<UnitDefinition> = {
            let registry = self.registry.read();
            registry.require_chain(chain_id)?;
            registry
                .members(chain_id)
                .into_iter()
                .filter(|u| u.enabled)
                .cloned()
                .collect()
        };

        let mut board = Blackboard::new();
        for (key, value) in seed {
            board.set_field(key, value);
        }
        let correlation_id = Uuid::new_v4();
        let mut completed = Vec::new();
        info!(chain_id, units = units.len(), "Running chain on demand");

        for unit in &units {
            let input = board.gather(&unit.inputs);
            let mut ctx = ExecutionContext::new(&unit.id, chain_id);
            ctx.correlation_id = correlation_id;
            ctx.dependency_results = board.gather_results(&unit.dependencies);

            match self.execute_unit(unit, input, &ctx).await.0 {
                Ok(output) => {
                    board.absorb_outputs(&unit.outputs, &output);
                    board.set_result(&unit.id, Value::Object(output));
                    board.mark_completed(&unit.id);
                    completed.push(unit.id.clone());
                }
                Err(e) => {
                    return Ok(ChainRun {
                        chain_id,
                        completed,
                        failed: Some(UnitFailure {
                            unit_id: unit.id.clone(),
                            error: e.to_string(),
                        }),
                        data: board,
                    });
                }
            }
        }

        Ok(ChainRun {
            chain_id,
            completed,
            failed: None,
            data: board,
        })
    }

    /// Abort background loops, stop all workflows and release capabilities.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        if let Err(e) = self.stop(None).await {
            warn!(error = %e, "Failed to stop workflows during shutdown");
        }
        self.capabilities.cleanup_all().await;
        info!(aborted = handles.len(), "Orchestrator shut down");
    }
}
