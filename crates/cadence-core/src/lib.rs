//! Core types and error definitions for the Cadence orchestration engine.
//!
//! This crate provides the foundational types shared by the orchestrator and
//! its front-ends: the unified error type, the static unit/chain registry, the
//! typed blackboard that units exchange data through, and the capability trait
//! that business-logic units implement.
//!
//! # Main types
//!
//! - [`CadenceError`] - Unified error enum for all Cadence subsystems.
//! - [`CadenceResult`] - Convenience alias for `Result<T, CadenceError>`.
//! - [`Registry`] - Validated set of unit and chain definitions.
//! - [`Blackboard`] - Per-workflow key/value store with completion markers.
//! - [`Capability`] - Trait implemented by every unit of work.
//! - [`CapabilityRegistry`] - Static mapping from unit id to implementation.

/// Typed key/value store shared by the units of a workflow.
pub mod blackboard;
/// Capability trait and the static capability registry.
pub mod capability;
/// Unit and chain definitions and their validation.
pub mod registry;

pub use blackboard::{Blackboard, BlackboardKey, DataMap};
pub use capability::{Capability, CapabilityRegistry, ExecutionContext};
pub use registry::{ChainDefinition, Priority, Registry, UnitDefinition};

use uuid::Uuid;

/// Top-level error type for the Cadence engine.
///
/// Each variant corresponds to one class of failure the engine distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    /// Unknown unit/chain id or malformed input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A capability exceeded its declared execution budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The unit's own logic raised an error.
    #[error("Capability error: {0}")]
    Capability(String),

    /// An approval was rejected, timed out, or is not in a resolvable state.
    #[error("Approval error: {0}")]
    Approval(String),

    /// A workflow, alert, schedule or mode with the given id does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A queue item is not in the state required by the operation.
    #[error("Queue item not found: {0}")]
    ItemNotFound(Uuid),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CadenceError`].
pub type CadenceResult<T> = Result<T, CadenceError>;

impl CadenceError {
    /// Short machine-friendly label for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            CadenceError::Validation(_) => "validation",
            CadenceError::Timeout(_) => "timeout",
            CadenceError::Capability(_) => "capability",
            CadenceError::Approval(_) => "approval",
            CadenceError::NotFound(_) | CadenceError::ItemNotFound(_) => "not_found",
            CadenceError::Config(_) => "config",
            CadenceError::Json(_) => "json",
            CadenceError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CadenceError::Timeout("unit 'writer' exceeded 500ms".into());
        assert_eq!(err.to_string(), "Timeout: unit 'writer' exceeded 500ms");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(CadenceError::Validation("x".into()).kind(), "validation");
        assert_eq!(CadenceError::ItemNotFound(Uuid::nil()).kind(), "not_found");
        assert_eq!(CadenceError::NotFound("wf".into()).kind(), "not_found");
    }

    #[test]
    fn test_json_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: CadenceError = parse.unwrap_err().into();
        assert!(matches!(err, CadenceError::Json(_)));
    }
}
