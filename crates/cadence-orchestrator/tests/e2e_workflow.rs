//! End-to-end tests for cadence-orchestrator: queue ordering and retries,
//! workflow failure handling, approval flow, mode scaling and schedules.

use async_trait::async_trait;
use cadence_core::{
    Blackboard, CadenceError, CadenceResult, Capability, CapabilityRegistry, ChainDefinition,
    DataMap, ExecutionContext, Priority, Registry, UnitDefinition,
};
use cadence_orchestrator::engine::select_step;
use cadence_orchestrator::queue::FailOutcome;
use cadence_orchestrator::{
    shared_registry, AppContext, CadenceConfig, EnqueueOptions, EventBus, ModeOverrides,
    QueueConfig, StepSelection, TickOutcome, TimeWindow, WorkQueue, WorkflowStatus,
};
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Echo;

#[async_trait]
impl Capability for Echo {
    async fn execute(&self, input: DataMap, _ctx: &ExecutionContext) -> CadenceResult<DataMap> {
        Ok(input)
    }
}

struct Failing(AtomicU32);

#[async_trait]
impl Capability for Failing {
    async fn execute(&self, _input: DataMap, _ctx: &ExecutionContext) -> CadenceResult<DataMap> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(CadenceError::Capability("connection refused".into()))
    }
}

/// Writes `summary` from whatever `notes` it was given.
struct Summarize;

#[async_trait]
impl Capability for Summarize {
    async fn execute(&self, input: DataMap, _ctx: &ExecutionContext) -> CadenceResult<DataMap> {
        let notes = input.get("notes").cloned().unwrap_or(json!(null));
        let mut out = DataMap::new();
        out.insert("summary".into(), json!({ "from": notes }));
        Ok(out)
    }
}

fn single_chain_queue(units: Vec<UnitDefinition>, config: QueueConfig) -> WorkQueue {
    let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
    let chain = ChainDefinition::new(1, "main", &ids);
    let registry = shared_registry(Registry::new(units.clone(), vec![chain]).unwrap());
    WorkQueue::new(registry, config, EventBus::default())
}

// --- Scenario A: priority ordering ---

#[test]
fn test_scenario_a_priority_order() {
    let mut queue = single_chain_queue(vec![UnitDefinition::new("worker", 1)], QueueConfig::default());
    for priority in [Priority::Low, Priority::Critical, Priority::High] {
        queue
            .enqueue(
                "worker",
                json!({ "p": priority.to_string() }),
                EnqueueOptions::default().with_priority(priority),
            )
            .unwrap();
    }
    let order: Vec<Priority> = std::iter::from_fn(|| queue.dequeue(Some(1)))
        .map(|item| item.priority)
        .collect();
    assert_eq!(order, vec![Priority::Critical, Priority::High, Priority::Low]);
}

// --- Scenario B: backoff then dead letter ---

#[test]
fn test_scenario_b_backoff_and_dead_letter() {
    let unit = UnitDefinition::new("flaky", 1).with_retry(2, 100);
    let config = QueueConfig {
        backoff_multiplier: 2.0,
        ..QueueConfig::default()
    };
    let mut queue = single_chain_queue(vec![unit], config);
    let item = queue.enqueue("flaky", json!({}), EnqueueOptions::default()).unwrap();
    assert_eq!(item.metadata.max_attempts, 3);

    let mut delays = Vec::new();
    let mut later = Utc::now();
    loop {
        later += Duration::seconds(10);
        let taken = queue.dequeue_at(Some(1), later).unwrap();
        let before = Utc::now();
        match queue.fail(taken.id, "boom").unwrap() {
            FailOutcome::Retrying { scheduled_for, .. } => {
                delays.push((scheduled_for - before).num_milliseconds());
            }
            FailOutcome::DeadLettered => break,
            FailOutcome::Failed => panic!("dead-lettering is enabled"),
        }
    }
    assert_eq!(delays.len(), 2);
    assert!((95..=150).contains(&delays[0]), "first delay {}", delays[0]);
    assert!((195..=250).contains(&delays[1]), "second delay {}", delays[1]);
    assert_eq!(queue.dead_letter_items().len(), 1);
    assert_eq!(queue.dead_letter_items()[0].metadata.attempts, 3);
    assert!(queue.get_item(item.id).is_some());
}

// --- Scenario C: failure without retries halts the chain ---

const FAILING_CHAIN: &str = r#"
[orchestrator]
inter_cycle_delay_ms = 0

[[chains]]
id = 1
name = "ingest"
units = ["fetch", "parse"]

[[units]]
id = "fetch"
chain_id = 1
retry_limit = 0

[[units]]
id = "parse"
chain_id = 1
dependencies = ["fetch"]
"#;

#[tokio::test]
async fn test_scenario_c_failure_halts_chain() {
    let config = CadenceConfig::from_toml(FAILING_CHAIN).unwrap();
    let fetch = Arc::new(Failing(AtomicU32::new(0)));
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register("fetch", fetch.clone());
    capabilities.register("parse", Arc::new(Echo));
    let ctx = AppContext::build(config, capabilities).await.unwrap();

    let workflow_id = ctx.orchestrator.create_workflow().await.unwrap();
    for _ in 0..3 {
        ctx.orchestrator.tick().await;
    }

    let wf = ctx.orchestrator.workflow(workflow_id).await.unwrap();
    assert_eq!(wf.errors.len(), 1);
    assert_eq!(wf.errors[0].unit_id, "fetch");
    assert_eq!(wf.errors[0].kind, "capability");
    assert_eq!(wf.status, WorkflowStatus::Error);
    assert_eq!(wf.current_chain, 1);
    assert!(!wf.data.is_completed("parse"));
    assert_eq!(fetch.0.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.queue.read().await.stats().pending, 0);

    // Resuming retries the failed step.
    ctx.orchestrator.resume(Some(workflow_id)).await.unwrap();
    ctx.orchestrator.tick().await;
    assert_eq!(fetch.0.load(Ordering::SeqCst), 2);
}

// --- Full cycle through an approval gate and a queued retry ---

const PIPELINE: &str = r#"
[orchestrator]
inter_cycle_delay_ms = 0

[queue]
backoff_multiplier = 1.0

[modes]
initial_mode = "staging"
approval_gate_unit = "review"

[[presets]]
name = "staging"
auto_approve = false
inter_cycle_delay_ms = 0

[[chains]]
id = 1
name = "content"
units = ["research", "summarize", "review"]

[[chains]]
id = 2
name = "distribution"
units = ["publish"]

[[units]]
id = "research"
chain_id = 1
outputs = ["notes"]

[[units]]
id = "summarize"
chain_id = 1
dependencies = ["research"]
inputs = ["notes"]
outputs = ["summary"]

[[units]]
id = "review"
chain_id = 1
dependencies = ["summarize"]

[[units]]
id = "publish"
chain_id = 2
inputs = ["summary"]
retry_limit = 1
retry_delay_ms = 0
"#;

/// Fails its first call only.
struct FailOnce(AtomicU32);

#[async_trait]
impl Capability for FailOnce {
    async fn execute(&self, input: DataMap, _ctx: &ExecutionContext) -> CadenceResult<DataMap> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CadenceError::Timeout("publisher did not answer".into()));
        }
        Ok(input)
    }
}

#[tokio::test]
async fn test_pipeline_with_approval_and_retry() {
    let config = CadenceConfig::from_toml(PIPELINE).unwrap();
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register("research", Arc::new(Echo));
    capabilities.register("summarize", Arc::new(Summarize));
    capabilities.register("review", Arc::new(Echo));
    capabilities.register("publish", Arc::new(FailOnce(AtomicU32::new(0))));
    let ctx = AppContext::build(config, capabilities).await.unwrap();
    assert!(ctx.registry.read().unit("review").unwrap().approval_required);

    let orchestrator = &ctx.orchestrator;
    let wf_id = orchestrator.create_workflow().await.unwrap();
    orchestrator
        .inject_data(wf_id, "notes", json!(["rust 2024 edition"]))
        .await
        .unwrap();

    let step = |outcomes: Vec<(uuid::Uuid, TickOutcome)>| outcomes.into_iter().next().unwrap().1;
    assert!(matches!(step(orchestrator.tick().await), TickOutcome::UnitCompleted { .. }));
    assert!(matches!(step(orchestrator.tick().await), TickOutcome::UnitCompleted { .. }));
    assert!(matches!(step(orchestrator.tick().await), TickOutcome::AwaitingApproval { .. }));
    orchestrator.approve(wf_id, "review", "editor").await.unwrap();
    assert!(matches!(step(orchestrator.tick().await), TickOutcome::ChainCompleted { next_chain: 2, .. }));

    assert!(matches!(
        step(orchestrator.tick().await),
        TickOutcome::UnitFailed { retrying: true, .. }
    ));
    assert_eq!(orchestrator.process_queue_once().await, 1);
    assert!(matches!(
        step(orchestrator.tick().await),
        TickOutcome::ChainCompleted { cycle_completed: true, .. }
    ));

    let wf = orchestrator.workflow(wf_id).await.unwrap();
    assert_eq!(wf.cycle, 1);
    assert_eq!(wf.errors.len(), 1);
    assert_eq!(wf.errors[0].kind, "timeout");
    assert_eq!(
        wf.data.result("publish").unwrap()["summary"]["from"],
        json!(["rust 2024 edition"])
    );
    let stats = ctx.queue.read().await.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead, 0);
}

// --- Scenario D: overnight schedule window ---

#[tokio::test]
async fn test_scenario_d_overnight_schedule() {
    let window = TimeWindow::parse("23:00", "06:00").unwrap();
    let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
    assert!(window.contains(hm(1, 0)));
    assert!(window.contains(hm(23, 30)));
    assert!(!window.contains(hm(12, 0)));

    let config = CadenceConfig::from_toml(&format!(
        "{FAILING_CHAIN}\n[[schedules]]\nname = \"overnight\"\nmode = \"maintenance\"\nstart = \"23:00\"\nend = \"06:00\"\n"
    ))
    .unwrap();
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register("fetch", Arc::new(Echo));
    capabilities.register("parse", Arc::new(Echo));
    let ctx = AppContext::build(config, capabilities).await.unwrap();

    let day = NaiveDate::from_ymd_opt(2024, 3, 12).unwrap();
    let noon = day.and_hms_opt(12, 0, 0).unwrap();
    let late = day.and_hms_opt(23, 30, 0).unwrap();
    assert!(ctx.modes.active_schedule_at(noon).await.is_none());
    assert_eq!(
        ctx.modes.check_schedules_at(late).await.unwrap().as_deref(),
        Some("maintenance")
    );
    assert!(!ctx.registry.read().chain(1).unwrap().enabled);
}

// --- Scenario E: rate-limit scaling is not cumulative ---

#[tokio::test]
async fn test_scenario_e_rate_limit_scaling() {
    let config = CadenceConfig::from_toml(
        r#"
[[chains]]
id = 1
name = "outreach"
units = ["mailer"]

[[units]]
id = "mailer"
chain_id = 1
rate_limits = { emails_per_hour = 200.0 }
"#,
    )
    .unwrap();
    let mut capabilities = CapabilityRegistry::new();
    capabilities.register("mailer", Arc::new(Echo));
    let ctx = AppContext::build(config, capabilities).await.unwrap();

    let half = || ModeOverrides {
        rate_limit_multiplier: Some(0.5),
        ..ModeOverrides::default()
    };
    let limit = || ctx.registry.read().unit("mailer").unwrap().rate_limits["emails_per_hour"];
    ctx.modes.set_mode("production", Some(half())).await.unwrap();
    assert_eq!(limit(), 100.0);
    ctx.modes.set_mode("production", Some(half())).await.unwrap();
    assert_eq!(limit(), 100.0);
}

// --- Step selection never violates dependencies ---

#[test]
fn test_step_selection_respects_dependencies_for_all_small_dags() {
    const N: usize = 4;
    // Candidate edges j -> i with j < i keep every generated graph acyclic.
    let edges: Vec<(usize, usize)> = (0..N)
        .flat_map(|i| (0..i).map(move |j| (i, j)))
        .collect();

    for graph in 0u32..(1 << edges.len()) {
        let units: Vec<UnitDefinition> = (0..N)
            .map(|i| {
                let deps: Vec<String> = edges
                    .iter()
                    .enumerate()
                    .filter(|(bit, (unit, _))| graph & (1 << bit) != 0 && *unit == i)
                    .map(|(_, (_, dep))| format!("u{dep}"))
                    .collect();
                let mut unit = UnitDefinition::new(format!("u{i}"), 1);
                unit.dependencies = deps;
                unit
            })
            .collect();
        let members: Vec<&UnitDefinition> = units.iter().collect();

        for done in 0u32..(1 << N) {
            let mut board = Blackboard::new();
            for i in (0..N).filter(|i| done & (1 << i) != 0) {
                board.mark_completed(format!("u{i}"));
            }
            match select_step(&members, &board) {
                StepSelection::Ready(id) => {
                    let unit = units.iter().find(|u| u.id == id).unwrap();
                    assert!(!board.is_completed(&id));
                    for dep in &unit.dependencies {
                        assert!(board.is_completed(dep), "graph {graph}: {id} selected before {dep}");
                    }
                }
                StepSelection::Complete => {
                    // Nothing runnable: every incomplete unit has an incomplete dependency.
                    for unit in units.iter().filter(|u| !board.is_completed(&u.id)) {
                        assert!(unit.dependencies.iter().any(|d| !board.is_completed(d)));
                    }
                }
                StepSelection::AwaitingRetry => panic!("no retries pending"),
            }
        }
    }
}
