use crate::modes::{ModeConfig, ModesConfig, ProductionSchedule};
use crate::monitor::MonitorConfig;
use crate::queue::QueueConfig;
use crate::types::OrchestratorConfig;
use cadence_core::{CadenceError, CadenceResult, ChainDefinition, Registry, UnitDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Contents of a `cadence.toml` file.
///
/// Every section is optional; missing values fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub modes: ModesConfig,
    #[serde(default)]
    pub chains: Vec<ChainDefinition>,
    #[serde(default)]
    pub units: Vec<UnitDefinition>,
    #[serde(default)]
    pub schedules: Vec<ProductionSchedule>,
    /// Extra mode presets; a preset named like a built-in one replaces it.
    #[serde(default)]
    pub presets: Vec<ModeConfig>,
}

impl CadenceConfig {
    pub fn from_toml(raw: &str) -> CadenceResult<Self> {
        toml::from_str(raw).map_err(|e| CadenceError::Config(e.to_string()))
    }

    /// Validate the declared units and chains into a [`Registry`].
    pub fn build_registry(&self) -> CadenceResult<Registry> {
        Registry::new(self.units.clone(), self.chains.clone())
    }
}

/// Read and parse a TOML config file.
pub fn load_config(path: &Path) -> CadenceResult<CadenceConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        CadenceError::Config(format!("failed to read '{}': {e}", path.display()))
    })?;
    let config: CadenceConfig = toml::from_str(&raw).map_err(|e| {
        CadenceError::Config(format!("failed to parse '{}': {e}", path.display()))
    })?;
    info!(
        path = %path.display(),
        units = config.units.len(),
        chains = config.chains.len(),
        schedules = config.schedules.len(),
        "Loaded configuration"
    );
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cadence_core::Priority;
    use std::io::Write;

    const SAMPLE: &str = r#"
[orchestrator]
tick_interval_ms = 250
approval_timeout_secs = 600

[queue]
backoff_multiplier = 3.0
dead_letter_enabled = false

[modes]
initial_mode = "development"
approval_gate_unit = "review"

[[chains]]
id = 1
name = "content"
units = ["research", "review"]

[[chains]]
id = 2
name = "distribution"
units = ["publish"]
loop_back = 1

[[units]]
id = "research"
chain_id = 1
outputs = ["notes"]
priority = "high"
rate_limits = { requests_per_minute = 60.0 }

[[units]]
id = "review"
chain_id = 1
dependencies = ["research"]
approval_required = true

[[units]]
id = "publish"
chain_id = 2
retry_limit = 0

[[schedules]]
name = "night"
mode = "production"
start = "23:00"
end = "06:00"

[[presets]]
name = "staging"
auto_approve = true
max_concurrency = 2
"#;

    #[test]
    fn test_parse_full_file() {
        let config = CadenceConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.orchestrator.tick_interval_ms, 250);
        assert_eq!(config.orchestrator.inter_cycle_delay_ms, 5_000);
        assert_eq!(config.queue.backoff_multiplier, 3.0);
        assert!(!config.queue.dead_letter_enabled);
        assert_eq!(config.modes.initial_mode.as_deref(), Some("development"));
        assert_eq!(config.modes.confirmation_timeout_secs, 300);
        assert_eq!(config.presets[0].max_concurrency, 2);
        assert_eq!(config.presets[0].rate_limit_multiplier, 1.0);

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.chain_count(), 2);
        let research = registry.unit("research").unwrap();
        assert_eq!(research.priority, Priority::High);
        assert_eq!(research.retry_limit, 3);
        assert_eq!(registry.chain(2).unwrap().loop_back, Some(1));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = CadenceConfig::from_toml("").unwrap();
        assert_eq!(config.orchestrator.tick_interval_ms, 1_000);
        assert!(config.queue.dead_letter_enabled);
        assert!(config.units.is_empty());
    }

    #[test]
    fn test_load_config_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.units.len(), 3);
        assert_eq!(config.schedules[0].name, "night");
    }

    #[test]
    fn test_load_errors_name_the_path() {
        let err = load_config(Path::new("/nonexistent/cadence.toml")).unwrap_err();
        assert!(matches!(err, CadenceError::Config(ref m) if m.contains("/nonexistent/cadence.toml")));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[orchestrator]\ntick_interval_ms = \"fast\"\n").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_invalid_registry_is_rejected() {
        let config = CadenceConfig::from_toml(
            r#"
[[chains]]
id = 1
name = "c"
units = ["ghost"]
"#,
        )
        .unwrap();
        assert!(config.build_registry().is_err());
    }
}
