use crate::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Priority class of a unit and of the queue items it produces.
///
/// Variants are declared lowest-first so the derived `Ord` ranks
/// `Critical` above everything else.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priority classes, highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Static definition of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub id: String,
    /// Owning chain.
    pub chain_id: u32,
    #[serde(default)]
    pub description: String,
    /// Units of the same chain that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Blackboard fields read as input.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output fields copied back into the blackboard.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Number of retries after the first failed attempt.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Declared rate limits (e.g. `requests_per_minute`), scaled by the active mode.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, f64>,
}

fn default_retry_limit() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_enabled() -> bool {
    true
}

impl UnitDefinition {
    /// Create a unit with default policy in the given chain.
    pub fn new(id: impl Into<String>, chain_id: u32) -> Self {
        Self {
            id: id.into(),
            chain_id,
            description: String::new(),
            dependencies: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            priority: Priority::Normal,
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            approval_required: false,
            enabled: true,
            rate_limits: BTreeMap::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    pub fn with_inputs(mut self, fields: &[&str]) -> Self {
        self.inputs = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, fields: &[&str]) -> Self {
        self.outputs = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry_limit: u32, retry_delay_ms: u64) -> Self {
        self.retry_limit = retry_limit;
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.approval_required = true;
        self
    }

    pub fn with_rate_limit(mut self, name: impl Into<String>, value: f64) -> Self {
        self.rate_limits.insert(name.into(), value);
        self
    }

    /// Total attempts a queue item for this unit may make.
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit + 1
    }
}

/// An ordered stage of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    /// Member unit ids in execution order.
    pub units: Vec<String>,
    /// Chain to jump to once this one completes, ending the cycle.
    #[serde(default)]
    pub loop_back: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ChainDefinition {
    pub fn new(id: u32, name: impl Into<String>, units: &[&str]) -> Self {
        Self {
            id,
            name: name.into(),
            units: units.iter().map(|u| (*u).to_string()).collect(),
            loop_back: None,
            enabled: true,
        }
    }

    pub fn with_loop_back(mut self, target: u32) -> Self {
        self.loop_back = Some(target);
        self
    }
}

/// Validated registry of units and chains.
///
/// Built once from static configuration. Only the enabled flags, priorities,
/// approval flags and rate limits are mutated afterwards (by the mode controller).
#[derive(Debug, Clone, Default)]
pub struct Registry {
    units: HashMap<String, UnitDefinition>,
    chains: BTreeMap<u32, ChainDefinition>,
}

impl Registry {
    /// Build and validate a registry.
    pub fn new(units: Vec<UnitDefinition>, chains: Vec<ChainDefinition>) -> CadenceResult<Self> {
        let mut unit_map = HashMap::new();
        for unit in units {
            if unit_map.contains_key(&unit.id) {
                return Err(CadenceError::Validation(format!(
                    "duplicate unit id '{}'",
                    unit.id
                )));
            }
            unit_map.insert(unit.id.clone(), unit);
        }
        let mut chain_map = BTreeMap::new();
        for chain in chains {
            if chain_map.contains_key(&chain.id) {
                return Err(CadenceError::Validation(format!(
                    "duplicate chain id {}",
                    chain.id
                )));
            }
            chain_map.insert(chain.id, chain);
        }

        let registry = Self {
            units: unit_map,
            chains: chain_map,
        };
        registry.validate()?;
        debug!(
            units = registry.units.len(),
            chains = registry.chains.len(),
            "Registry validated"
        );
        Ok(registry)
    }

    fn validate(&self) -> CadenceResult<()> {
        for chain in self.chains.values() {
            let mut seen_outputs: HashMap<&str, &str> = HashMap::new();
            for member in &chain.units {
                let unit = self.units.get(member).ok_or_else(|| {
                    CadenceError::Validation(format!(
                        "chain {} lists unknown unit '{member}'",
                        chain.id
                    ))
                })?;
                if unit.chain_id != chain.id {
                    return Err(CadenceError::Validation(format!(
                        "unit '{member}' is listed in chain {} but declares chain {}",
                        chain.id, unit.chain_id
                    )));
                }
                for field in &unit.outputs {
                    if let Some(other) = seen_outputs.insert(field.as_str(), member.as_str()) {
                        return Err(CadenceError::Validation(format!(
                            "output field '{field}' is declared by both '{other}' and '{member}' in chain {}",
                            chain.id
                        )));
                    }
                }
            }
            if let Some(target) = chain.loop_back {
                if !self.chains.contains_key(&target) {
                    return Err(CadenceError::Validation(format!(
                        "chain {} loops back to unknown chain {target}",
                        chain.id
                    )));
                }
            }
        }

        for unit in self.units.values() {
            let chain = self.chains.get(&unit.chain_id).ok_or_else(|| {
                CadenceError::Validation(format!(
                    "unit '{}' declares unknown chain {}",
                    unit.id, unit.chain_id
                ))
            })?;
            if !chain.units.contains(&unit.id) {
                return Err(CadenceError::Validation(format!(
                    "unit '{}' is not listed in chain {}",
                    unit.id, unit.chain_id
                )));
            }
            for dep in &unit.dependencies {
                if dep == &unit.id {
                    return Err(CadenceError::Validation(format!(
                        "unit '{}' depends on itself",
                        unit.id
                    )));
                }
                let dep_unit = self.units.get(dep).ok_or_else(|| {
                    CadenceError::Validation(format!(
                        "unit '{}' depends on unknown unit '{dep}'",
                        unit.id
                    ))
                })?;
                if dep_unit.chain_id != unit.chain_id {
                    return Err(CadenceError::Validation(format!(
                        "unit '{}' depends on '{dep}' from another chain",
                        unit.id
                    )));
                }
            }
        }

        if let Some(path) = self.find_cycle() {
            return Err(CadenceError::Validation(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }
        Ok(())
    }

    /// True when some unit transitively depends on itself.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// A dependency path that starts and ends at the same unit, if any.
    ///
    /// Walks dependencies depth-first from every unit in id order, keeping
    /// the current path on an explicit stack.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy)]
        enum Walk {
            OnPath,
            Cleared,
        }

        let mut roots: Vec<&str> = self.units.keys().map(String::as_str).collect();
        roots.sort_unstable();
        let mut walk: HashMap<&str, Walk> = HashMap::new();

        for root in roots {
            if walk.contains_key(root) {
                continue;
            }
            walk.insert(root, Walk::OnPath);
            // (unit, index of the next dependency to follow)
            let mut path: Vec<(&str, usize)> = vec![(root, 0)];
            while let Some(&(unit_id, next)) = path.last() {
                let deps = self
                    .units
                    .get(unit_id)
                    .map_or(&[][..], |unit| unit.dependencies.as_slice());
                let Some(dep) = deps.get(next).map(String::as_str) else {
                    walk.insert(unit_id, Walk::Cleared);
                    path.pop();
                    continue;
                };
                if let Some(top) = path.last_mut() {
                    top.1 += 1;
                }
                match walk.get(dep) {
                    Some(Walk::OnPath) => {
                        let start = path.iter().position(|(id, _)| *id == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|(id, _)| (*id).to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    Some(Walk::Cleared) => {}
                    None => {
                        walk.insert(dep, Walk::OnPath);
                        path.push((dep, 0));
                    }
                }
            }
        }
        None
    }

    pub fn unit(&self, id: &str) -> Option<&UnitDefinition> {
        self.units.get(id)
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut UnitDefinition> {
        self.units.get_mut(id)
    }

    pub fn chain(&self, id: u32) -> Option<&ChainDefinition> {
        self.chains.get(&id)
    }

    pub fn chain_mut(&mut self, id: u32) -> Option<&mut ChainDefinition> {
        self.chains.get_mut(&id)
    }

    /// Look up a unit, failing with a validation error when it is unknown.
    pub fn require_unit(&self, id: &str) -> CadenceResult<&UnitDefinition> {
        self.units
            .get(id)
            .ok_or_else(|| CadenceError::Validation(format!("unknown unit '{id}'")))
    }

    /// Look up a chain, failing with a validation error when it is unknown.
    pub fn require_chain(&self, id: u32) -> CadenceResult<&ChainDefinition> {
        self.chains
            .get(&id)
            .ok_or_else(|| CadenceError::Validation(format!("unknown chain {id}")))
    }

    /// Units sorted by id.
    pub fn units(&self) -> Vec<&UnitDefinition> {
        let mut units: Vec<&UnitDefinition> = self.units.values().collect();
        units.sort_by(|a, b| a.id.cmp(&b.id));
        units
    }

    pub fn units_mut(&mut self) -> impl Iterator<Item = &mut UnitDefinition> {
        self.units.values_mut()
    }

    /// Chains in ascending id order.
    pub fn chains(&self) -> impl Iterator<Item = &ChainDefinition> {
        self.chains.values()
    }

    pub fn chains_mut(&mut self) -> impl Iterator<Item = &mut ChainDefinition> {
        self.chains.values_mut()
    }

    pub fn chain_ids(&self) -> Vec<u32> {
        self.chains.keys().copied().collect()
    }

    /// Members of a chain in declared order.
    pub fn members(&self, chain_id: u32) -> Vec<&UnitDefinition> {
        self.chains
            .get(&chain_id)
            .map(|c| c.units.iter().filter_map(|u| self.units.get(u)).collect())
            .unwrap_or_default()
    }

    /// Lowest chain id, where every cycle starts.
    pub fn first_chain_id(&self) -> Option<u32> {
        self.chains.keys().next().copied()
    }

    /// `chain_id + 1` if such a chain exists.
    pub fn next_chain_id(&self, chain_id: u32) -> Option<u32> {
        let next = chain_id.checked_add(1)?;
        self.chains.contains_key(&next).then_some(next)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }
}
