use cadence_core::{Blackboard, DataMap};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Stopped | WorkflowStatus::Completed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Stopped => write!(f, "stopped"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Error => write!(f, "error"),
        }
    }
}

/// Derived status of a chain as seen by the execution tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Active,
    Paused,
    Stopped,
    WaitingApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl ApprovalStatus {
    /// Whether the approval still blocks its chain.
    pub fn is_blocking(self) -> bool {
        matches!(self, ApprovalStatus::Pending | ApprovalStatus::Timeout)
    }
}

/// A request for an external decision on a gated unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalState {
    pub unit_id: String,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub approver: Option<String>,
    /// Flattened blackboard at request time.
    pub snapshot: DataMap,
}

impl ApprovalState {
    pub fn new(unit_id: impl Into<String>, snapshot: DataMap) -> Self {
        Self {
            unit_id: unit_id.into(),
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            approver: None,
            snapshot,
        }
    }
}

/// One failed unit execution recorded against a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowError {
    pub unit_id: String,
    pub chain_id: u32,
    /// Error class, see [`cadence_core::CadenceError::kind`].
    pub kind: String,
    pub message: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Ceiling for spans read from config (100 years). Keeps timestamp
/// arithmetic on configured delays and ages from overflowing.
const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// A configured number of seconds as a `Duration`, clamped to the ceiling.
pub(crate) fn span_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_SPAN_SECS) as i64)
}

/// A configured number of milliseconds as a `Duration`, clamped to the ceiling.
pub(crate) fn span_millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_SPAN_SECS * 1000) as i64)
}

/// State of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: Uuid,
    pub status: WorkflowStatus,
    pub current_chain: u32,
    pub current_unit: Option<String>,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// When the current chain was entered; used for cycle-time reporting.
    pub chain_started_at: DateTime<Utc>,
    /// Ticks before this instant are no-ops (inter-cycle / inter-chain delay).
    pub resume_at: Option<DateTime<Utc>>,
    pub cycle: u64,
    pub data: Blackboard,
    pub approvals: BTreeMap<String, ApprovalState>,
    pub errors: Vec<WorkflowError>,
    /// Bumped each time a unit is reset outside normal execution. Queued
    /// retries remember the epoch they were created in.
    #[serde(default)]
    pub unit_epochs: BTreeMap<String, u64>,
}

impl WorkflowState {
    pub fn new(first_chain: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: WorkflowStatus::Running,
            current_chain: first_chain,
            current_unit: None,
            started_at: now,
            paused_at: None,
            completed_at: None,
            chain_started_at: now,
            resume_at: None,
            cycle: 0,
            data: Blackboard::new(),
            approvals: BTreeMap::new(),
            errors: Vec::new(),
            unit_epochs: BTreeMap::new(),
        }
    }

    pub fn unit_epoch(&self, unit_id: &str) -> u64 {
        self.unit_epochs.get(unit_id).copied().unwrap_or(0)
    }

    /// Invalidate every retry of `unit_id` queued so far.
    pub fn bump_unit_epoch(&mut self, unit_id: &str) {
        *self.unit_epochs.entry(unit_id.to_string()).or_insert(0) += 1;
    }

    /// Start a chain over for the next pass: completion, skip and retry
    /// markers and approvals of `members` are dropped, and their in-flight
    /// retries become stale.
    pub fn reset_chain(&mut self, members: &[String]) {
        self.data.clear_markers(members.iter().map(String::as_str));
        for unit_id in members {
            self.data.clear_retry_pending(unit_id);
            self.bump_unit_epoch(unit_id);
        }
        self.approvals.retain(|unit, _| !members.contains(unit));
    }

    /// Units of the given set with an approval that still blocks.
    pub fn blocking_approvals<'a>(
        &'a self,
        members: &'a [String],
    ) -> impl Iterator<Item = &'a ApprovalState> + 'a {
        self.approvals
            .values()
            .filter(move |a| a.status.is_blocking() && members.contains(&a.unit_id))
    }
}

/// Static engine timing, from the `[orchestrator]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_queue_tick_interval_ms")]
    pub queue_tick_interval_ms: u64,
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_inter_cycle_delay_ms")]
    pub inter_cycle_delay_ms: u64,
    #[serde(default)]
    pub inter_chain_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_tick_interval_ms() -> u64 {
    1_000
}
fn default_queue_tick_interval_ms() -> u64 {
    1_000
}
fn default_approval_timeout_secs() -> u64 {
    3_600
}
fn default_inter_cycle_delay_ms() -> u64 {
    5_000
}
fn default_event_capacity() -> usize {
    1_024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            queue_tick_interval_ms: default_queue_tick_interval_ms(),
            approval_timeout_secs: default_approval_timeout_secs(),
            inter_cycle_delay_ms: default_inter_cycle_delay_ms(),
            inter_chain_delay_ms: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Settings the mode controller may change while the engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub parallel_execution: bool,
    /// Upper bound on queue items processed per queue tick.
    pub max_concurrency: usize,
    pub inter_cycle_delay_ms: u64,
}

impl RuntimeSettings {
    /// Items the queue tick may process at once.
    pub fn queue_batch(&self) -> usize {
        if self.parallel_execution {
            self.max_concurrency.max(1)
        } else {
            1
        }
    }
}

impl From<&OrchestratorConfig> for RuntimeSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            parallel_execution: false,
            max_concurrency: 1,
            inter_cycle_delay_ms: config.inter_cycle_delay_ms,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_workflow_starts_running_at_cycle_zero() {
        let wf = WorkflowState::new(1);
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.current_chain, 1);
        assert_eq!(wf.cycle, 0);
        assert!(wf.errors.is_empty());
    }

    #[test]
    fn test_blocking_approvals_filters_by_member_and_status() {
        let mut wf = WorkflowState::new(1);
        wf.approvals
            .insert("review".into(), ApprovalState::new("review", DataMap::new()));
        let mut done = ApprovalState::new("legal", DataMap::new());
        done.status = ApprovalStatus::Approved;
        wf.approvals.insert("legal".into(), done);

        let members = vec!["review".to_string(), "legal".to_string()];
        assert_eq!(wf.blocking_approvals(&members).count(), 1);
        assert_eq!(wf.blocking_approvals(&["other".to_string()]).count(), 0);
    }

    #[test]
    fn test_reset_chain_clears_members_only() {
        let mut wf = WorkflowState::new(1);
        wf.data.mark_completed("a");
        wf.data.mark_retry_pending("b");
        wf.data.mark_completed("other");
        wf.approvals
            .insert("b".into(), ApprovalState::new("b", DataMap::new()));
        wf.approvals
            .insert("other".into(), ApprovalState::new("other", DataMap::new()));

        wf.reset_chain(&["a".to_string(), "b".to_string()]);

        assert!(!wf.data.is_completed("a"));
        assert!(!wf.data.is_retry_pending("b"));
        assert!(wf.data.is_completed("other"));
        assert!(!wf.approvals.contains_key("b"));
        assert!(wf.approvals.contains_key("other"));
        assert_eq!(wf.unit_epoch("a"), 1);
        assert_eq!(wf.unit_epoch("b"), 1);
        assert_eq!(wf.unit_epoch("other"), 0);
    }

    #[test]
    fn test_unit_epochs_default_when_absent_from_json() {
        let wf = WorkflowState::new(1);
        let mut value = serde_json::to_value(&wf).unwrap();
        value.as_object_mut().unwrap().remove("unit_epochs");
        let restored: WorkflowState = serde_json::from_value(value).unwrap();
        assert_eq!(restored.unit_epoch("a"), 0);
    }

    #[test]
    fn test_config_spans_clamp_instead_of_overflowing() {
        assert_eq!(span_secs(90), Duration::seconds(90));
        assert_eq!(span_millis(1500), Duration::milliseconds(1500));
        let now = Utc::now();
        assert!(now + span_secs(u64::MAX) > now);
        assert!(now - span_secs(u64::MAX) < now);
        assert_eq!(span_millis(u64::MAX), span_secs(u64::MAX));
    }

    #[test]
    fn test_queue_batch_respects_parallel_flag() {
        let mut settings = RuntimeSettings::from(&OrchestratorConfig::default());
        settings.max_concurrency = 4;
        assert_eq!(settings.queue_batch(), 1);
        settings.parallel_execution = true;
        assert_eq!(settings.queue_batch(), 4);
    }

    #[test]
    fn test_status_display_and_terminal() {
        assert_eq!(WorkflowStatus::Error.to_string(), "error");
        assert!(WorkflowStatus::Stopped.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }
}
