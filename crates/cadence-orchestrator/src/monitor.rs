use crate::events::{Event, EventBus};
use crate::types::span_secs;
use cadence_core::{CadenceError, CadenceResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Liveness state of a unit as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Idle,
    Running,
    Completed,
    Error,
    Paused,
    Stopped,
}

/// Last reported resource consumption of a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Health record kept for every registered unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub unit_id: String,
    pub status: UnitStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub uptime_ms: u64,
    pub downtime_ms: u64,
    pub consecutive_errors: u32,
    pub resource_usage: ResourceUsage,
}

impl AgentHealth {
    fn idle(unit_id: &str) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            status: UnitStatus::Idle,
            last_heartbeat: None,
            last_execution: None,
            healthy: true,
            uptime_ms: 0,
            downtime_ms: 0,
            consecutive_errors: 0,
            resource_usage: ResourceUsage::default(),
        }
    }
}

/// Fixed taxonomy failures are bucketed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    Network,
    RateLimit,
    Auth,
    NotFound,
    Validation,
    ApiError,
    Unknown,
}

/// Bucket an error message by case-insensitive substring match.
pub fn categorize_error(message: &str) -> ErrorType {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out"]) {
        ErrorType::Timeout
    } else if has(&["rate limit", "rate-limit", "429", "too many requests"]) {
        ErrorType::RateLimit
    } else if has(&["unauthorized", "forbidden", "auth", "401", "403"]) {
        ErrorType::Auth
    } else if has(&["not found", "404"]) {
        ErrorType::NotFound
    } else if has(&["network", "connection", "econnrefused", "econnreset", "socket", "dns"]) {
        ErrorType::Network
    } else if has(&["validation", "invalid"]) {
        ErrorType::Validation
    } else if has(&["api", "500", "502", "503", "504"]) {
        ErrorType::ApiError
    } else {
        ErrorType::Unknown
    }
}

/// Performance statistics for one unit.
///
/// Counters are cumulative; latency, throughput and success rate cover the
/// last hour of execution history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub unit_id: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Percentage, 0–100.
    pub success_rate: f64,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub throughput_per_minute: u64,
    pub throughput_per_hour: u64,
    /// Executions per minute over the last hour; index 0 is the current minute.
    pub executions_per_minute: Vec<u32>,
    pub error_types: BTreeMap<ErrorType, u32>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    unit_id: String,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    success: bool,
    error_type: Option<ErrorType>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// An actionable notice raised by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    /// Unit (or component) the alert is about.
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Criteria for [`HealthMonitor::alerts`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<AlertSeverity>,
    pub source: Option<String>,
    pub acknowledged: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

impl AlertFilter {
    fn matches(&self, alert: &Alert) -> bool {
        self.severity.map_or(true, |s| alert.severity == s)
            && self.source.as_ref().map_or(true, |s| &alert.source == s)
            && self.acknowledged.map_or(true, |a| alert.acknowledged == a)
            && self.since.map_or(true, |t| alert.timestamp >= t)
    }
}

/// Monitor thresholds and intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    /// Heartbeat age after which a running unit is considered down.
    #[serde(default = "default_downtime_threshold_secs")]
    pub downtime_threshold_secs: u64,
    /// Fraction of failed executions tolerated before a warning (0.1 = 10%).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    #[serde(default = "default_consecutive_error_threshold")]
    pub consecutive_error_threshold: u32,
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_metrics_interval_secs() -> u64 {
    60
}
fn default_downtime_threshold_secs() -> u64 {
    300
}
fn default_error_rate_threshold() -> f64 {
    0.1
}
fn default_latency_threshold_ms() -> u64 {
    30_000
}
fn default_consecutive_error_threshold() -> u32 {
    3
}
fn default_max_alerts() -> usize {
    1_000
}
fn default_history_limit() -> usize {
    50_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            downtime_threshold_secs: default_downtime_threshold_secs(),
            error_rate_threshold: default_error_rate_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            consecutive_error_threshold: default_consecutive_error_threshold(),
            max_alerts: default_max_alerts(),
            history_limit: default_history_limit(),
        }
    }
}

/// Aggregate health view.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub by_status: BTreeMap<UnitStatus, usize>,
    pub units: Vec<AgentHealth>,
}

/// Rolled-up status of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-chain rollup of member health and performance.
#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    pub chain_id: u32,
    pub status: ChainHealthStatus,
    pub units: usize,
    pub healthy_units: usize,
    pub avg_cycle_time_ms: f64,
    pub throughput_per_minute: u64,
}

/// Success rate of one unit, used for the performer rankings.
#[derive(Debug, Clone, Serialize)]
pub struct UnitScore {
    pub unit_id: String,
    pub success_rate: f64,
    pub executions: u64,
}

/// Whole-system view.
#[derive(Debug, Clone, Serialize)]
pub struct SystemOverview {
    pub uptime_secs: i64,
    pub total_units: usize,
    pub healthy_units: usize,
    pub total_executions: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub unacknowledged_alerts: usize,
    pub top_performers: Vec<UnitScore>,
    pub bottom_performers: Vec<UnitScore>,
}

#[derive(Default)]
struct MonitorState {
    health: HashMap<String, AgentHealth>,
    metrics: HashMap<String, AgentMetrics>,
    history: VecDeque<ExecutionRecord>,
    alerts: VecDeque<Alert>,
    chain_cycles: HashMap<u32, VecDeque<u64>>,
    last_check: Option<DateTime<Utc>>,
}

const CHAIN_CYCLE_SAMPLES: usize = 100;

/// `sorted[floor(n * q)]`, clamped to the last element; 0 for an empty slice.
pub fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((sorted.len() as f64) * q).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Tracks liveness and performance of every registered unit and raises alerts.
pub struct HealthMonitor {
    state: RwLock<MonitorState>,
    config: MonitorConfig,
    events: EventBus,
    started_at: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(config: MonitorConfig, events: EventBus) -> Self {
        Self {
            state: RwLock::new(MonitorState::default()),
            config,
            events,
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Create an idle health record for each unit not yet known.
    pub async fn register_units<I, S>(&self, unit_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.write().await;
        for id in unit_ids {
            let id = id.as_ref();
            state
                .health
                .entry(id.to_string())
                .or_insert_with(|| AgentHealth::idle(id));
            state
                .metrics
                .entry(id.to_string())
                .or_insert_with(|| AgentMetrics {
                    unit_id: id.to_string(),
                    success_rate: 100.0,
                    ..AgentMetrics::default()
                });
        }
    }

    pub async fn heartbeat(&self, unit_id: &str) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(unit_id) {
            health.last_heartbeat = Some(Utc::now());
        } else {
            warn!(unit = %unit_id, "Heartbeat from unregistered unit");
        }
    }

    pub async fn heartbeat_with_usage(&self, unit_id: &str, usage: ResourceUsage) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(unit_id) {
            health.last_heartbeat = Some(Utc::now());
            health.resource_usage = usage;
        }
    }

    pub async fn set_status(&self, unit_id: &str, status: UnitStatus) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(unit_id) {
            health.status = status;
        }
    }

    pub async fn record_execution_start(&self, unit_id: &str) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(unit_id) {
            let now = Utc::now();
            health.status = UnitStatus::Running;
            health.last_heartbeat = Some(now);
            health.last_execution = Some(now);
        } else {
            warn!(unit = %unit_id, "Execution start for unregistered unit");
        }
    }

    pub async fn record_execution_complete(
        &self,
        unit_id: &str,
        duration_ms: u64,
        success: bool,
        error: Option<&str>,
    ) {
        let now = Utc::now();
        let error_type = (!success).then(|| categorize_error(error.unwrap_or_default()));
        let mut state = self.state.write().await;

        let Some(health) = state.health.get_mut(unit_id) else {
            warn!(unit = %unit_id, "Execution result for unregistered unit");
            return;
        };
        health.last_heartbeat = Some(now);
        health.last_execution = Some(now);
        if success {
            health.status = UnitStatus::Completed;
            health.consecutive_errors = 0;
        } else {
            health.status = UnitStatus::Error;
            health.consecutive_errors += 1;
        }

        if let Some(metrics) = state.metrics.get_mut(unit_id) {
            metrics.total_executions += 1;
            if success {
                metrics.successful_executions += 1;
            } else {
                metrics.failed_executions += 1;
            }
        }

        state.history.push_back(ExecutionRecord {
            unit_id: unit_id.to_string(),
            timestamp: now,
            duration_ms,
            success,
            error_type,
        });
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }

        if duration_ms > self.config.latency_threshold_ms {
            self.push_alert(
                &mut state,
                AlertSeverity::Warning,
                unit_id,
                format!(
                    "slow response: {duration_ms}ms exceeds {}ms",
                    self.config.latency_threshold_ms
                ),
            );
        }
        debug!(unit = %unit_id, duration_ms, success, "Recorded execution");
    }

    /// Record how long one pass over a chain took.
    pub async fn record_chain_cycle(&self, chain_id: u32, duration_ms: u64) {
        let mut state = self.state.write().await;
        let samples = state.chain_cycles.entry(chain_id).or_default();
        samples.push_back(duration_ms);
        while samples.len() > CHAIN_CYCLE_SAMPLES {
            samples.pop_front();
        }
    }

    /// Health-check pass at the current time. Returns the unhealthy unit ids.
    pub async fn run_health_check(&self) -> Vec<String> {
        self.health_check_at(Utc::now()).await
    }

    pub async fn health_check_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = self.state.write().await;
        let elapsed_ms = state
            .last_check
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        state.last_check = Some(now);
        let threshold = span_secs(self.config.downtime_threshold_secs);

        let mut unhealthy = Vec::new();
        let mut failing = Vec::new();
        for health in state.health.values_mut() {
            let stale = health
                .last_heartbeat
                .map_or(true, |beat| now - beat > threshold);
            if health.status == UnitStatus::Running && stale {
                if health.healthy {
                    warn!(unit = %health.unit_id, "Unit missed its heartbeat window");
                }
                health.healthy = false;
                health.downtime_ms += elapsed_ms;
            } else if !matches!(health.status, UnitStatus::Error | UnitStatus::Stopped) {
                health.healthy = true;
                health.uptime_ms += elapsed_ms;
            }
            if !health.healthy {
                unhealthy.push(health.unit_id.clone());
            }
            if health.consecutive_errors >= self.config.consecutive_error_threshold {
                failing.push((health.unit_id.clone(), health.consecutive_errors));
            }
        }

        failing.sort();
        for (unit_id, count) in failing {
            self.push_alert(
                &mut state,
                AlertSeverity::Critical,
                &unit_id,
                format!("{count} consecutive errors"),
            );
        }
        unhealthy.sort();
        unhealthy
    }

    /// Metrics-collection pass at the current time.
    pub async fn collect_metrics(&self) {
        self.collect_metrics_at(Utc::now()).await;
    }

    pub async fn collect_metrics_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().await;
        let hour_ago = now - Duration::hours(1);
        let minute_ago = now - Duration::minutes(1);
        while state
            .history
            .front()
            .is_some_and(|r| r.timestamp < hour_ago)
        {
            state.history.pop_front();
        }

        let mut per_unit: HashMap<&str, Vec<&ExecutionRecord>> = HashMap::new();
        for record in &state.history {
            per_unit.entry(record.unit_id.as_str()).or_default().push(record);
        }

        let mut computed = Vec::new();
        for unit_id in state.metrics.keys() {
            let records = per_unit.get(unit_id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let mut durations: Vec<u64> = records.iter().map(|r| r.duration_ms).collect();
            durations.sort_unstable();

            let mut histogram = vec![0u32; 60];
            let mut error_types = BTreeMap::new();
            let mut successes = 0u64;
            let mut last_minute = 0u64;
            for record in records {
                let age_min = (now - record.timestamp).num_minutes().max(0) as usize;
                if let Some(bucket) = histogram.get_mut(age_min) {
                    *bucket += 1;
                }
                if record.timestamp >= minute_ago {
                    last_minute += 1;
                }
                if record.success {
                    successes += 1;
                }
                if let Some(kind) = record.error_type {
                    *error_types.entry(kind).or_insert(0) += 1;
                }
            }

            let n = durations.len();
            let success_rate = if n == 0 {
                100.0
            } else {
                successes as f64 / n as f64 * 100.0
            };
            computed.push((
                unit_id.clone(),
                n,
                success_rate,
                durations,
                histogram,
                error_types,
                last_minute,
            ));
        }

        let floor = (1.0 - self.config.error_rate_threshold) * 100.0;
        let mut low_success = Vec::new();
        for (unit_id, n, success_rate, durations, histogram, error_types, last_minute) in computed
        {
            let Some(metrics) = state.metrics.get_mut(&unit_id) else {
                continue;
            };
            metrics.success_rate = success_rate;
            metrics.min_latency_ms = durations.first().copied().unwrap_or(0);
            metrics.max_latency_ms = durations.last().copied().unwrap_or(0);
            metrics.avg_latency_ms = if n == 0 {
                0.0
            } else {
                durations.iter().sum::<u64>() as f64 / n as f64
            };
            metrics.p95_latency_ms = percentile(&durations, 0.95);
            metrics.p99_latency_ms = percentile(&durations, 0.99);
            metrics.throughput_per_minute = last_minute;
            metrics.throughput_per_hour = n as u64;
            metrics.executions_per_minute = histogram;
            metrics.error_types = error_types;
            metrics.last_updated = Some(now);

            if n > 0 && success_rate < floor {
                low_success.push((unit_id, success_rate));
            }
        }

        low_success.sort_by(|a, b| a.0.cmp(&b.0));
        for (unit_id, rate) in low_success {
            self.push_alert(
                &mut state,
                AlertSeverity::Warning,
                &unit_id,
                format!("success rate {rate:.1}% below {floor:.1}%"),
            );
        }
    }

    fn push_alert(
        &self,
        state: &mut MonitorState,
        severity: AlertSeverity,
        source: &str,
        message: String,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            severity,
            source: source.to_string(),
            message,
            timestamp: Utc::now(),
            acknowledged: false,
        };
        match severity {
            AlertSeverity::Critical | AlertSeverity::Error => {
                error!(source = %alert.source, severity = ?severity, message = %alert.message, "Alert");
            }
            _ => warn!(source = %alert.source, severity = ?severity, message = %alert.message, "Alert"),
        }

        state.alerts.push_back(alert.clone());
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }

        self.events.emit(Event::AlertCreated {
            alert: alert.clone(),
        });
        if severity == AlertSeverity::Critical {
            self.events.emit(Event::CriticalAlert {
                alert: alert.clone(),
            });
        }
        alert
    }

    /// Raise an alert on behalf of another component.
    pub async fn create_alert(
        &self,
        severity: AlertSeverity,
        source: &str,
        message: impl Into<String>,
    ) -> Alert {
        let mut state = self.state.write().await;
        self.push_alert(&mut state, severity, source, message.into())
    }

    /// Alerts matching the filter, oldest first.
    pub async fn alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        let state = self.state.read().await;
        state
            .alerts
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect()
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid) -> CadenceResult<()> {
        let mut state = self.state.write().await;
        let alert = state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| CadenceError::NotFound(format!("alert {alert_id}")))?;
        alert.acknowledged = true;
        Ok(())
    }

    /// Remove every acknowledged alert. Returns how many were removed.
    pub async fn clear_acknowledged(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.alerts.len();
        state.alerts.retain(|a| !a.acknowledged);
        before - state.alerts.len()
    }

    pub async fn unit_health(&self, unit_id: &str) -> Option<AgentHealth> {
        self.state.read().await.health.get(unit_id).cloned()
    }

    pub async fn health_summary(&self) -> HealthSummary {
        let state = self.state.read().await;
        let mut units: Vec<AgentHealth> = state.health.values().cloned().collect();
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        let mut by_status = BTreeMap::new();
        for unit in &units {
            *by_status.entry(unit.status).or_insert(0) += 1;
        }
        let healthy = units.iter().filter(|u| u.healthy).count();
        HealthSummary {
            total: units.len(),
            healthy,
            unhealthy: units.len() - healthy,
            by_status,
            units,
        }
    }

    pub async fn unit_metrics(&self, unit_id: &str) -> Option<AgentMetrics> {
        self.state.read().await.metrics.get(unit_id).cloned()
    }

    /// Metrics of every unit, sorted by unit id.
    pub async fn all_metrics(&self) -> Vec<AgentMetrics> {
        let state = self.state.read().await;
        let mut all: Vec<AgentMetrics> = state.metrics.values().cloned().collect();
        all.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        all
    }

    /// Roll up the health of a chain's members.
    pub async fn chain_health(&self, chain_id: u32, members: &[String]) -> ChainHealth {
        let state = self.state.read().await;
        let healths: Vec<&AgentHealth> = members.iter().filter_map(|m| state.health.get(m)).collect();

        let status = if healths
            .iter()
            .any(|h| matches!(h.status, UnitStatus::Error | UnitStatus::Stopped))
        {
            ChainHealthStatus::Unhealthy
        } else if healths.iter().any(|h| h.status == UnitStatus::Paused) {
            ChainHealthStatus::Degraded
        } else {
            ChainHealthStatus::Healthy
        };

        let avg_cycle_time_ms = state
            .chain_cycles
            .get(&chain_id)
            .filter(|s| !s.is_empty())
            .map(|s| s.iter().sum::<u64>() as f64 / s.len() as f64)
            .unwrap_or(0.0);

        let throughput_per_minute = members
            .iter()
            .filter_map(|m| state.metrics.get(m))
            .map(|m| m.throughput_per_minute)
            .sum();

        ChainHealth {
            chain_id,
            status,
            units: healths.len(),
            healthy_units: healths.iter().filter(|h| h.healthy).count(),
            avg_cycle_time_ms,
            throughput_per_minute,
        }
    }

    pub async fn system_overview(&self) -> SystemOverview {
        let state = self.state.read().await;

        let total_executions: u64 = state.metrics.values().map(|m| m.total_executions).sum();
        let successful: u64 = state.metrics.values().map(|m| m.successful_executions).sum();
        let success_rate = if total_executions == 0 {
            100.0
        } else {
            successful as f64 / total_executions as f64 * 100.0
        };
        let avg_latency_ms = if state.history.is_empty() {
            0.0
        } else {
            state.history.iter().map(|r| r.duration_ms).sum::<u64>() as f64
                / state.history.len() as f64
        };

        let mut scores: Vec<UnitScore> = state
            .metrics
            .values()
            .filter(|m| m.total_executions > 0)
            .map(|m| UnitScore {
                unit_id: m.unit_id.clone(),
                success_rate: m.successful_executions as f64 / m.total_executions as f64 * 100.0,
                executions: m.total_executions,
            })
            .collect();
        scores.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        let top_performers: Vec<UnitScore> = scores.iter().take(5).cloned().collect();
        let bottom_performers: Vec<UnitScore> = scores.iter().rev().take(5).cloned().collect();

        SystemOverview {
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            total_units: state.health.len(),
            healthy_units: state.health.values().filter(|h| h.healthy).count(),
            total_executions,
            success_rate,
            avg_latency_ms,
            unacknowledged_alerts: state.alerts.iter().filter(|a| !a.acknowledged).count(),
            top_performers,
            bottom_performers,
        }
    }

    /// Serialize the current state as JSON (for dashboards).
    pub async fn to_json(&self) -> serde_json::Value {
        let summary = self.health_summary().await;
        let metrics = self.all_metrics().await;
        let overview = self.system_overview().await;
        serde_json::json!({
            "health": summary,
            "metrics": metrics,
            "overview": overview,
        })
    }

    /// Spawn the periodic health-check and metrics-collection passes.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let health = {
            let monitor = Arc::clone(self);
            let period = std::time::Duration::from_secs(self.config.health_check_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let unhealthy = monitor.run_health_check().await;
                    if !unhealthy.is_empty() {
                        debug!(count = unhealthy.len(), "Health check found unhealthy units");
                    }
                }
            })
        };
        let metrics = {
            let monitor = Arc::clone(self);
            let period = std::time::Duration::from_secs(self.config.metrics_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    monitor.collect_metrics().await;
                }
            })
        };
        vec![health, metrics]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn monitor_with(config: MonitorConfig) -> HealthMonitor {
        let monitor = HealthMonitor::new(config, EventBus::default());
        monitor.register_units(["writer", "editor", "publisher"]).await;
        monitor
    }

    async fn monitor() -> HealthMonitor {
        monitor_with(MonitorConfig::default()).await
    }

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = monitor().await;
        let summary = monitor.health_summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.healthy, 3);
        assert_eq!(summary.by_status[&UnitStatus::Idle], 3);
    }

    #[tokio::test]
    async fn test_consecutive_errors_reset_on_success() {
        let monitor = monitor().await;
        monitor.record_execution_start("writer").await;
        monitor.record_execution_complete("writer", 10, false, Some("boom")).await;
        monitor.record_execution_complete("writer", 10, false, Some("boom")).await;
        let health = monitor.unit_health("writer").await.unwrap();
        assert_eq!(health.consecutive_errors, 2);
        assert_eq!(health.status, UnitStatus::Error);

        monitor.record_execution_complete("writer", 10, true, None).await;
        let health = monitor.unit_health("writer").await.unwrap();
        assert_eq!(health.consecutive_errors, 0);
        assert_eq!(health.status, UnitStatus::Completed);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_marks_unhealthy_then_recovers() {
        let monitor = monitor().await;
        monitor.record_execution_start("writer").await;
        let now = Utc::now();
        assert!(monitor.health_check_at(now).await.is_empty());

        let later = now + Duration::seconds(301);
        assert_eq!(monitor.health_check_at(later).await, vec!["writer".to_string()]);
        let health = monitor.unit_health("writer").await.unwrap();
        assert!(!health.healthy);
        assert!(health.downtime_ms > 0);

        monitor.heartbeat("writer").await;
        let next = Utc::now() + Duration::seconds(1);
        assert!(monitor.health_check_at(next).await.is_empty());
        assert!(monitor.unit_health("writer").await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_uptime_accrues_for_idle_units() {
        let monitor = monitor().await;
        let now = Utc::now();
        monitor.health_check_at(now).await;
        monitor.health_check_at(now + Duration::seconds(30)).await;
        let health = monitor.unit_health("editor").await.unwrap();
        assert_eq!(health.uptime_ms, 30_000);
        assert_eq!(health.downtime_ms, 0);
    }

    #[tokio::test]
    async fn test_consecutive_errors_raise_critical_each_pass() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let monitor = HealthMonitor::new(MonitorConfig::default(), bus);
        monitor.register_units(["writer"]).await;
        for _ in 0..3 {
            monitor.record_execution_complete("writer", 5, false, Some("timeout")).await;
        }
        monitor.run_health_check().await;
        monitor.run_health_check().await;

        let critical = monitor
            .alerts(&AlertFilter {
                severity: Some(AlertSeverity::Critical),
                ..AlertFilter::default()
            })
            .await;
        assert_eq!(critical.len(), 2);
        assert_eq!(critical[0].source, "writer");

        let names: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok().map(|e| e.name())).collect();
        assert_eq!(names.iter().filter(|n| **n == "critical_alert").count(), 2);
    }

    #[test]
    fn test_percentile_indexing() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 0.95), 96);
        assert_eq!(percentile(&sorted, 0.99), 100);
        assert_eq!(percentile(&[7], 0.99), 7);
        assert_eq!(percentile(&[], 0.95), 0);

        let twenty: Vec<u64> = (0..20).map(|i| i * 10).collect();
        assert_eq!(percentile(&twenty, 0.95), twenty[19]);
        assert_eq!(percentile(&twenty, 0.99), twenty[19]);
    }

    #[tokio::test]
    async fn test_metrics_collection() {
        let monitor = monitor().await;
        for ms in [50, 10, 40, 20, 30] {
            monitor.record_execution_complete("editor", ms, true, None).await;
        }
        monitor.record_execution_complete("editor", 60, false, Some("HTTP 429 Too Many Requests")).await;
        monitor.collect_metrics().await;

        let m = monitor.unit_metrics("editor").await.unwrap();
        assert_eq!(m.total_executions, 6);
        assert_eq!(m.min_latency_ms, 10);
        assert_eq!(m.max_latency_ms, 60);
        assert_eq!(m.avg_latency_ms, 35.0);
        // sorted [10,20,30,40,50,60]: floor(6*0.95)=5
        assert_eq!(m.p95_latency_ms, 60);
        assert_eq!(m.throughput_per_minute, 6);
        assert_eq!(m.throughput_per_hour, 6);
        assert_eq!(m.executions_per_minute[0], 6);
        assert_eq!(m.error_types[&ErrorType::RateLimit], 1);
        assert!((m.success_rate - 83.333).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_low_success_rate_warning() {
        let monitor = monitor().await;
        monitor.record_execution_complete("publisher", 5, true, None).await;
        monitor.record_execution_complete("publisher", 5, false, Some("boom")).await;
        monitor.collect_metrics().await;

        let warnings = monitor
            .alerts(&AlertFilter {
                severity: Some(AlertSeverity::Warning),
                source: Some("publisher".into()),
                ..AlertFilter::default()
            })
            .await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("success rate"));
    }

    #[tokio::test]
    async fn test_old_history_pruned() {
        let monitor = monitor().await;
        monitor.record_execution_complete("writer", 5, true, None).await;
        monitor.collect_metrics_at(Utc::now() + Duration::hours(2)).await;
        let m = monitor.unit_metrics("writer").await.unwrap();
        assert_eq!(m.throughput_per_hour, 0);
        assert_eq!(m.total_executions, 1);
    }

    #[tokio::test]
    async fn test_slow_execution_raises_warning() {
        let config = MonitorConfig {
            latency_threshold_ms: 100,
            ..MonitorConfig::default()
        };
        let monitor = monitor_with(config).await;
        monitor.record_execution_complete("writer", 150, true, None).await;
        let alerts = monitor.alerts(&AlertFilter::default()).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert!(alerts[0].message.contains("slow response"));
    }

    #[test]
    fn test_categorize_error() {
        assert_eq!(categorize_error("Request Timed Out"), ErrorType::Timeout);
        assert_eq!(categorize_error("ECONNREFUSED 127.0.0.1"), ErrorType::Network);
        assert_eq!(categorize_error("rate limit exceeded"), ErrorType::RateLimit);
        assert_eq!(categorize_error("401 Unauthorized"), ErrorType::Auth);
        assert_eq!(categorize_error("resource not found"), ErrorType::NotFound);
        assert_eq!(categorize_error("Validation failed: title"), ErrorType::Validation);
        assert_eq!(categorize_error("upstream API returned 502"), ErrorType::ApiError);
        assert_eq!(categorize_error("something odd"), ErrorType::Unknown);
    }

    #[tokio::test]
    async fn test_alert_acknowledge_and_clear() {
        let monitor = monitor().await;
        let a = monitor.create_alert(AlertSeverity::Info, "system", "hello").await;
        monitor.create_alert(AlertSeverity::Error, "writer", "bad").await;
        monitor.acknowledge_alert(a.id).await.unwrap();
        assert!(monitor.acknowledge_alert(Uuid::new_v4()).await.is_err());

        let unacked = monitor
            .alerts(&AlertFilter {
                acknowledged: Some(false),
                ..AlertFilter::default()
            })
            .await;
        assert_eq!(unacked.len(), 1);
        assert_eq!(monitor.clear_acknowledged().await, 1);
        assert_eq!(monitor.alerts(&AlertFilter::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_alert_log_capped() {
        let config = MonitorConfig {
            max_alerts: 3,
            ..MonitorConfig::default()
        };
        let monitor = monitor_with(config).await;
        for i in 0..5 {
            monitor.create_alert(AlertSeverity::Info, "system", format!("n{i}")).await;
        }
        let alerts = monitor.alerts(&AlertFilter::default()).await;
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].message, "n2");
    }

    #[tokio::test]
    async fn test_chain_health_rollup() {
        let monitor = monitor().await;
        let members = vec!["writer".to_string(), "editor".to_string()];
        assert_eq!(
            monitor.chain_health(1, &members).await.status,
            ChainHealthStatus::Healthy
        );
        monitor.set_status("editor", UnitStatus::Paused).await;
        assert_eq!(
            monitor.chain_health(1, &members).await.status,
            ChainHealthStatus::Degraded
        );
        monitor.record_execution_complete("writer", 5, false, Some("x")).await;
        monitor.record_chain_cycle(1, 100).await;
        monitor.record_chain_cycle(1, 300).await;
        let rollup = monitor.chain_health(1, &members).await;
        assert_eq!(rollup.status, ChainHealthStatus::Unhealthy);
        assert_eq!(rollup.avg_cycle_time_ms, 200.0);
        assert_eq!(rollup.units, 2);
    }

    #[tokio::test]
    async fn test_system_overview_rankings() {
        let monitor = monitor().await;
        monitor.record_execution_complete("writer", 10, true, None).await;
        monitor.record_execution_complete("editor", 30, false, Some("x")).await;
        monitor.record_execution_complete("editor", 30, true, None).await;

        let overview = monitor.system_overview().await;
        assert_eq!(overview.total_executions, 3);
        assert!((overview.success_rate - 66.666).abs() < 0.01);
        assert!((overview.avg_latency_ms - 23.333).abs() < 0.01);
        assert_eq!(overview.top_performers[0].unit_id, "writer");
        assert_eq!(overview.bottom_performers[0].unit_id, "editor");
        assert_eq!(overview.total_units, 3);
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = monitor().await;
        let json = monitor.to_json().await;
        assert!(json["health"]["units"].is_array());
        assert!(json["metrics"].is_array());
        assert!(json["overview"].is_object());
    }
}
