//! The blackboard is the data bus between the units of one workflow.
//!
//! Instead of a single string-keyed map, each kind of entry lives in its own
//! namespace so a unit id can never collide with a data field name:
//!
//! | namespace      | flattened key        | written by                          |
//! |----------------|----------------------|-------------------------------------|
//! | data field     | `<field>`            | unit outputs, `inject_data`         |
//! | unit result    | `<unit>_result`      | successful execution                |
//! | completion     | `<unit>_completed`   | success, approval, skip             |
//! | skip           | `<unit>_skipped`     | `skip_agent`                        |
//! | retry pending  | `<unit>_retrying`    | failure with remaining retry budget |
//!
//! The flattened form is only used for export and display.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// JSON object used for unit inputs and outputs.
pub type DataMap = serde_json::Map<String, Value>;

/// Address of a single blackboard entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlackboardKey {
    Field(String),
    Result(String),
    Completed(String),
    Skipped(String),
    RetryPending(String),
}

impl std::fmt::Display for BlackboardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlackboardKey::Field(name) => write!(f, "{name}"),
            BlackboardKey::Result(unit) => write!(f, "{unit}_result"),
            BlackboardKey::Completed(unit) => write!(f, "{unit}_completed"),
            BlackboardKey::Skipped(unit) => write!(f, "{unit}_skipped"),
            BlackboardKey::RetryPending(unit) => write!(f, "{unit}_retrying"),
        }
    }
}

/// Per-workflow key/value store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blackboard {
    fields: BTreeMap<String, Value>,
    results: BTreeMap<String, Value>,
    completed: BTreeSet<String>,
    skipped: BTreeSet<String>,
    retry_pending: BTreeSet<String>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Collect the named fields that are present.
    pub fn gather(&self, names: &[String]) -> DataMap {
        names
            .iter()
            .filter_map(|name| self.fields.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Copy the declared output fields present in `output` into the store.
    ///
    /// Returns the number of fields written.
    pub fn absorb_outputs(&mut self, declared: &[String], output: &DataMap) -> usize {
        let mut written = 0;
        for name in declared {
            if let Some(value) = output.get(name) {
                self.fields.insert(name.clone(), value.clone());
                written += 1;
            }
        }
        written
    }

    pub fn result(&self, unit: &str) -> Option<&Value> {
        self.results.get(unit)
    }

    pub fn set_result(&mut self, unit: impl Into<String>, value: Value) {
        self.results.insert(unit.into(), value);
    }

    /// Results of the given units, keyed by unit id.
    pub fn gather_results(&self, units: &[String]) -> DataMap {
        units
            .iter()
            .filter_map(|u| self.results.get(u).map(|v| (u.clone(), v.clone())))
            .collect()
    }

    pub fn mark_completed(&mut self, unit: impl Into<String>) {
        let unit = unit.into();
        self.retry_pending.remove(&unit);
        self.completed.insert(unit);
    }

    pub fn is_completed(&self, unit: &str) -> bool {
        self.completed.contains(unit)
    }

    /// Force-complete a unit without running it.
    pub fn mark_skipped(&mut self, unit: impl Into<String>) {
        let unit = unit.into();
        self.skipped.insert(unit.clone());
        self.mark_completed(unit);
    }

    pub fn is_skipped(&self, unit: &str) -> bool {
        self.skipped.contains(unit)
    }

    pub fn mark_retry_pending(&mut self, unit: impl Into<String>) {
        self.retry_pending.insert(unit.into());
    }

    pub fn clear_retry_pending(&mut self, unit: &str) {
        self.retry_pending.remove(unit);
    }

    pub fn is_retry_pending(&self, unit: &str) -> bool {
        self.retry_pending.contains(unit)
    }

    /// Forget everything recorded about a unit's execution so it runs again.
    pub fn reset_unit(&mut self, unit: &str) {
        self.completed.remove(unit);
        self.skipped.remove(unit);
        self.retry_pending.remove(unit);
        self.results.remove(unit);
    }

    /// Clear completion and skip markers for a set of units. Results and
    /// data fields survive into the next cycle.
    pub fn clear_markers<'a>(&mut self, units: impl IntoIterator<Item = &'a str>) {
        for unit in units {
            self.completed.remove(unit);
            self.skipped.remove(unit);
        }
    }

    /// Read any entry by key.
    pub fn get(&self, key: &BlackboardKey) -> Option<Value> {
        match key {
            BlackboardKey::Field(name) => self.fields.get(name).cloned(),
            BlackboardKey::Result(unit) => self.results.get(unit).cloned(),
            BlackboardKey::Completed(unit) => {
                self.completed.contains(unit).then_some(Value::Bool(true))
            }
            BlackboardKey::Skipped(unit) => self.skipped.contains(unit).then_some(Value::Bool(true)),
            BlackboardKey::RetryPending(unit) => {
                self.retry_pending.contains(unit).then_some(Value::Bool(true))
            }
        }
    }

    /// Render the store as a single flat map using the documented key convention.
    pub fn flatten(&self) -> DataMap {
        let mut out = DataMap::new();
        for (name, value) in &self.fields {
            out.insert(BlackboardKey::Field(name.clone()).to_string(), value.clone());
        }
        for (unit, value) in &self.results {
            out.insert(BlackboardKey::Result(unit.clone()).to_string(), value.clone());
        }
        for unit in &self.completed {
            out.insert(BlackboardKey::Completed(unit.clone()).to_string(), Value::Bool(true));
        }
        for unit in &self.skipped {
            out.insert(BlackboardKey::Skipped(unit.clone()).to_string(), Value::Bool(true));
        }
        for unit in &self.retry_pending {
            out.insert(BlackboardKey::RetryPending(unit.clone()).to_string(), Value::Bool(true));
        }
        out
    }
}
