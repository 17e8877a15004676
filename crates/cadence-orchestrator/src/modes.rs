use crate::engine::{ChainRun, Orchestrator};
use crate::events::Event;
use crate::types::RuntimeSettings;
use cadence_core::{CadenceError, CadenceResult, DataMap};
use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A named operating preset.
///
/// `None` for the chain or unit set means "everything enabled".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub name: String,
    #[serde(default)]
    pub enabled_chains: Option<BTreeSet<u32>>,
    #[serde(default)]
    pub enabled_units: Option<BTreeSet<String>>,
    /// When set, the approval-gate unit does not require approval.
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub parallel_execution: bool,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_inter_cycle_delay_ms")]
    pub inter_cycle_delay_ms: u64,
    /// Applied to every unit's declared rate limits.
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: f64,
    /// `start_production` waits for an explicit confirmation.
    #[serde(default)]
    pub require_confirmation: bool,
}

fn default_max_concurrency() -> usize {
    1
}
fn default_inter_cycle_delay_ms() -> u64 {
    5_000
}
fn default_rate_limit_multiplier() -> f64 {
    1.0
}

impl ModeConfig {
    pub fn chain_enabled(&self, chain_id: u32) -> bool {
        self.enabled_chains
            .as_ref()
            .map_or(true, |chains| chains.contains(&chain_id))
    }

    pub fn unit_enabled(&self, unit_id: &str) -> bool {
        self.enabled_units
            .as_ref()
            .map_or(true, |units| units.contains(unit_id))
    }

    fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            parallel_execution: self.parallel_execution,
            max_concurrency: self.max_concurrency.max(1),
            inter_cycle_delay_ms: self.inter_cycle_delay_ms,
        }
    }
}

/// Per-call adjustments layered over a preset by [`ModeController::set_mode`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeOverrides {
    pub enabled_chains: Option<BTreeSet<u32>>,
    pub enabled_units: Option<BTreeSet<String>>,
    pub auto_approve: Option<bool>,
    pub parallel_execution: Option<bool>,
    pub max_concurrency: Option<usize>,
    pub inter_cycle_delay_ms: Option<u64>,
    pub rate_limit_multiplier: Option<f64>,
    pub require_confirmation: Option<bool>,
}

impl ModeOverrides {
    fn apply(self, mut mode: ModeConfig) -> ModeConfig {
        if self.enabled_chains.is_some() {
            mode.enabled_chains = self.enabled_chains;
        }
        if self.enabled_units.is_some() {
            mode.enabled_units = self.enabled_units;
        }
        mode.auto_approve = self.auto_approve.unwrap_or(mode.auto_approve);
        mode.parallel_execution = self.parallel_execution.unwrap_or(mode.parallel_execution);
        mode.max_concurrency = self.max_concurrency.unwrap_or(mode.max_concurrency);
        mode.inter_cycle_delay_ms = self.inter_cycle_delay_ms.unwrap_or(mode.inter_cycle_delay_ms);
        mode.rate_limit_multiplier = self
            .rate_limit_multiplier
            .unwrap_or(mode.rate_limit_multiplier);
        mode.require_confirmation = self
            .require_confirmation
            .unwrap_or(mode.require_confirmation);
        mode
    }
}

/// Presets available without any configuration.
pub fn builtin_modes() -> Vec<ModeConfig> {
    vec![production_mode(), development_mode(), maintenance_mode()]
}

fn production_mode() -> ModeConfig {
    ModeConfig {
        name: "production".to_string(),
        enabled_chains: None,
        enabled_units: None,
        auto_approve: false,
        parallel_execution: true,
        max_concurrency: 4,
        inter_cycle_delay_ms: 5_000,
        rate_limit_multiplier: 1.0,
        require_confirmation: true,
    }
}

fn development_mode() -> ModeConfig {
    ModeConfig {
        name: "development".to_string(),
        enabled_chains: None,
        enabled_units: None,
        auto_approve: true,
        parallel_execution: false,
        max_concurrency: 1,
        inter_cycle_delay_ms: 1_000,
        rate_limit_multiplier: 0.5,
        require_confirmation: false,
    }
}

/// Nothing runs; retries drain one at a time.
fn maintenance_mode() -> ModeConfig {
    ModeConfig {
        name: "maintenance".to_string(),
        enabled_chains: Some(BTreeSet::new()),
        enabled_units: Some(BTreeSet::new()),
        auto_approve: false,
        parallel_execution: false,
        max_concurrency: 1,
        inter_cycle_delay_ms: 60_000,
        rate_limit_multiplier: 0.1,
        require_confirmation: false,
    }
}

mod hh_mm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Daily local-time window `[start, end)`.
///
/// A window whose start is after its end wraps midnight: `23:00`-`06:00`
/// covers late evening and early morning. Equal bounds cover nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hh_mm")]
    pub start: NaiveTime,
    #[serde(with = "hh_mm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parse `"HH:MM"` bounds.
    pub fn parse(start: &str, end: &str) -> CadenceResult<Self> {
        let parse = |raw: &str| {
            NaiveTime::parse_from_str(raw, "%H:%M")
                .map_err(|e| CadenceError::Validation(format!("invalid time '{raw}': {e}")))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }

    pub fn is_overnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.is_overnight() {
            time >= self.start || time < self.end
        } else {
            time >= self.start && time < self.end
        }
    }
}

/// Switches to `mode` while the current local time is inside the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionSchedule {
    pub name: String,
    pub mode: String,
    #[serde(flatten)]
    pub window: TimeWindow,
    /// Days the schedule applies on; empty means every day.
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default = "default_schedule_enabled")]
    pub enabled: bool,
}

fn default_schedule_enabled() -> bool {
    true
}

impl ProductionSchedule {
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        self.enabled
            && (self.days.is_empty() || self.days.contains(&now.weekday()))
            && self.window.contains(now.time())
    }
}

/// The `[modes]` section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModesConfig {
    /// Mode applied when the context is built.
    #[serde(default)]
    pub initial_mode: Option<String>,
    /// Unit whose approval flag follows the active mode's `auto_approve`.
    #[serde(default)]
    pub approval_gate_unit: Option<String>,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_schedule_check_interval_secs")]
    pub schedule_check_interval_secs: u64,
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}
fn default_schedule_check_interval_secs() -> u64 {
    60
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            initial_mode: None,
            approval_gate_unit: None,
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            schedule_check_interval_secs: default_schedule_check_interval_secs(),
        }
    }
}

/// Applies mode presets to the shared registry and the orchestrator's
/// runtime settings, and switches presets on a weekly schedule.
pub struct ModeController {
    orchestrator: Arc<Orchestrator>,
    settings: ModesConfig,
    presets: BTreeMap<String, ModeConfig>,
    /// Rate limits as declared, before any mode scaled them.
    original_rate_limits: HashMap<String, BTreeMap<String, f64>>,
    active: RwLock<Option<ModeConfig>>,
    schedules: RwLock<Vec<ProductionSchedule>>,
    confirmation: Mutex<Option<oneshot::Sender<bool>>>,
}

impl ModeController {
    /// Build a controller over the built-in presets plus `presets`; a
    /// configured preset replaces a built-in one of the same name.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        settings: ModesConfig,
        presets: Vec<ModeConfig>,
        schedules: Vec<ProductionSchedule>,
    ) -> CadenceResult<Self> {
        let presets: BTreeMap<String, ModeConfig> = builtin_modes()
            .into_iter()
            .chain(presets)
            .map(|mode| (mode.name.clone(), mode))
            .collect();
        for schedule in &schedules {
            if !presets.contains_key(&schedule.mode) {
                return Err(CadenceError::Validation(format!(
                    "schedule '{}' refers to unknown mode '{}'",
                    schedule.name, schedule.mode
                )));
            }
        }
        let original_rate_limits = orchestrator
            .registry()
            .read()
            .units()
            .into_iter()
            .map(|unit| (unit.id.clone(), unit.rate_limits.clone()))
            .collect();

        Ok(Self {
            orchestrator,
            settings,
            presets,
            original_rate_limits,
            active: RwLock::new(None),
            schedules: RwLock::new(schedules),
            confirmation: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ModesConfig {
        &self.settings
    }

    pub fn list_modes(&self) -> Vec<String> {
        self.presets.keys().cloned().collect()
    }

    pub fn preset(&self, name: &str) -> Option<&ModeConfig> {
        self.presets.get(name)
    }

    pub async fn active_mode(&self) -> Option<ModeConfig> {
        self.active.read().await.clone()
    }

    /// Apply a preset, optionally adjusted, and make it the active mode.
    pub async fn set_mode(
        &self,
        name: &str,
        overrides: Option<ModeOverrides>,
    ) -> CadenceResult<ModeConfig> {
        let preset = self
            .presets
            .get(name)
            .cloned()
            .ok_or_else(|| CadenceError::NotFound(format!("mode '{name}'")))?;
        let mode = match overrides {
            Some(overrides) => overrides.apply(preset),
            None => preset,
        };

        {
            let mut registry = self.orchestrator.registry().write();
            for chain in registry.chains_mut() {
                chain.enabled = mode.chain_enabled(chain.id);
            }
            for unit in registry.units_mut() {
                unit.enabled = mode.unit_enabled(&unit.id);
                if let Some(original) = self.original_rate_limits.get(&unit.id) {
                    unit.rate_limits = original
                        .iter()
                        .map(|(key, limit)| (key.clone(), limit * mode.rate_limit_multiplier))
                        .collect();
                }
            }
            if let Some(gate) = &self.settings.approval_gate_unit {
                match registry.unit_mut(gate) {
                    Some(unit) => unit.approval_required = !mode.auto_approve,
                    None => warn!(unit = %gate, "Approval gate unit is not registered"),
                }
            }
        }
        self.orchestrator
            .apply_settings(mode.runtime_settings())
            .await;

        let previous = self
            .active
            .write()
            .await
            .replace(mode.clone())
            .map(|m| m.name);
        info!(from = ?previous, to = %mode.name, "Mode changed");
        self.orchestrator.events().emit(Event::ModeChanged {
            from: previous,
            to: mode.name.clone(),
        });
        Ok(mode)
    }

    /// Start the orchestrator, first waiting for [`confirm`](Self::confirm)
    /// when the active mode requires it.
    pub async fn start_production(&self) -> CadenceResult<Uuid> {
        let mode = self.active_mode().await;
        if let Some(mode) = mode.filter(|m| m.require_confirmation) {
            let (tx, rx) = oneshot::channel();
            *self.confirmation.lock().await = Some(tx);
            info!(mode = %mode.name, "Waiting for production start confirmation");
            self.orchestrator
                .events()
                .emit(Event::ConfirmationRequired {
                    mode: mode.name.clone(),
                });

            let timeout = std::time::Duration::from_secs(self.settings.confirmation_timeout_secs);
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(true)) => info!(mode = %mode.name, "Production start confirmed"),
                Ok(Ok(false)) => {
                    return Err(CadenceError::Approval("production start cancelled".into()))
                }
                Ok(Err(_)) => {
                    return Err(CadenceError::Approval(
                        "confirmation channel closed".into(),
                    ))
                }
                Err(_) => {
                    self.confirmation.lock().await.take();
                    warn!(
                        timeout_secs = self.settings.confirmation_timeout_secs,
                        "Production start confirmation timed out"
                    );
                    return Err(CadenceError::Timeout(format!(
                        "no confirmation within {}s",
                        self.settings.confirmation_timeout_secs
                    )));
                }
            }
        }
        self.orchestrator.start().await
    }

    async fn resolve_confirmation(&self, confirmed: bool) -> CadenceResult<()> {
        let sender = self
            .confirmation
            .lock()
            .await
            .take()
            .ok_or_else(|| CadenceError::NotFound("pending confirmation".into()))?;
        sender
            .send(confirmed)
            .map_err(|_| CadenceError::Approval("confirmation no longer awaited".into()))
    }

    pub async fn confirm(&self) -> CadenceResult<()> {
        self.resolve_confirmation(true).await
    }

    pub async fn cancel(&self) -> CadenceResult<()> {
        self.resolve_confirmation(false).await
    }

    pub async fn awaiting_confirmation(&self) -> bool {
        self.confirmation.lock().await.is_some()
    }

    pub async fn add_schedule(&self, schedule: ProductionSchedule) -> CadenceResult<()> {
        if !self.presets.contains_key(&schedule.mode) {
            return Err(CadenceError::Validation(format!(
                "unknown mode '{}'",
                schedule.mode
            )));
        }
        let mut schedules = self.schedules.write().await;
        if schedules.iter().any(|s| s.name == schedule.name) {
            return Err(CadenceError::Validation(format!(
                "schedule '{}' already exists",
                schedule.name
            )));
        }
        info!(schedule = %schedule.name, mode = %schedule.mode, "Schedule added");
        schedules.push(schedule);
        Ok(())
    }

    /// Replace the schedule named `name`, keeping its evaluation position.
    pub async fn update_schedule(&self, name: &str, schedule: ProductionSchedule) -> CadenceResult<()> {
        if !self.presets.contains_key(&schedule.mode) {
            return Err(CadenceError::Validation(format!(
                "unknown mode '{}'",
                schedule.mode
            )));
        }
        let mut schedules = self.schedules.write().await;
        let slot = schedules
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| CadenceError::NotFound(format!("schedule '{name}'")))?;
        *slot = schedule;
        Ok(())
    }

    pub async fn remove_schedule(&self, name: &str) -> CadenceResult<ProductionSchedule> {
        let mut schedules = self.schedules.write().await;
        let index = schedules
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| CadenceError::NotFound(format!("schedule '{name}'")))?;
        Ok(schedules.remove(index))
    }

    pub async fn list_schedules(&self) -> Vec<ProductionSchedule> {
        self.schedules.read().await.clone()
    }

    /// First enabled schedule covering `now`.
    pub async fn active_schedule_at(&self, now: NaiveDateTime) -> Option<ProductionSchedule> {
        self.schedules
            .read()
            .await
            .iter()
            .find(|s| s.matches(now))
            .cloned()
    }

    pub async fn active_schedule(&self) -> Option<ProductionSchedule> {
        self.active_schedule_at(Local::now().naive_local()).await
    }

    /// Switch to the mode of the schedule covering `now`, if it is not
    /// already active. Returns the mode switched to.
    pub async fn check_schedules_at(&self, now: NaiveDateTime) -> CadenceResult<Option<String>> {
        let Some(schedule) = self.active_schedule_at(now).await else {
            return Ok(None);
        };
        let current = self.active.read().await.as_ref().map(|m| m.name.clone());
        if current.as_deref() == Some(schedule.mode.as_str()) {
            return Ok(None);
        }

        info!(schedule = %schedule.name, mode = %schedule.mode, "Schedule triggered");
        self.orchestrator.events().emit(Event::ScheduleTriggered {
            schedule: schedule.name.clone(),
            mode: schedule.mode.clone(),
        });
        self.set_mode(&schedule.mode, None).await?;
        Ok(Some(schedule.mode))
    }

    pub async fn check_schedules(&self) -> CadenceResult<Option<String>> {
        self.check_schedules_at(Local::now().naive_local()).await
    }

    /// Spawn the periodic schedule evaluation.
    pub fn start_schedule_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let period = std::time::Duration::from_secs(self.settings.schedule_check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                match controller.check_schedules().await {
                    Ok(Some(mode)) => debug!(mode = %mode, "Scheduled mode applied"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Schedule evaluation failed"),
                }
            }
        })
    }

    /// Run one chain on demand, outside the normal cycle.
    pub async fn run_chain(&self, chain_id: u32, seed: DataMap) -> CadenceResult<ChainRun> {
        self.orchestrator.run_chain(chain_id, seed).await
    }

    /// Run one unit on demand, outside the normal cycle.
    pub async fn run_agent(&self, unit_id: &str, input: DataMap) -> CadenceResult<DataMap> {
        self.orchestrator.run_unit(unit_id, input).await
    }
}
