//! Error taxonomy for the orchestration core.
//!
//! Descriptor, graph and configuration errors fail fast before any module
//! runs. Execution errors are handled by the recovery controller during the
//! run. State errors indicate an orchestration bug and abort the run.

use crate::models::{ModuleState, Phase};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration document could not be loaded or is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Malformed or duplicate module metadata.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Duplicate module identifier: {0}")]
    Duplicate(String),

    #[error("Invalid module descriptor in {origin}: {reason}")]
    Invalid { origin: String, reason: String },

    #[error("Cannot read module source {}: {source}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The dependency graph cannot be built.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Cyclic dependency: {}", .path.join(" -> "))]
    Cyclic { path: Vec<String> },

    #[error("Module '{module}' depends on unknown or disabled module '{dependency}'")]
    Unresolved { module: String, dependency: String },

    #[error("Module '{0}' depends on itself")]
    SelfDependency(String),

    #[error(
        "Module '{module}' ({module_phase}) depends on '{dependency}' from later phase {dependency_phase}"
    )]
    PhaseInversion {
        module: String,
        module_phase: Phase,
        dependency: String,
        dependency_phase: Phase,
    },
}

/// A single execution attempt failed.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Module '{module}' timed out after {}s", timeout.as_secs())]
    Timeout { module: String, timeout: Duration },

    #[error("Module '{module}' failed: {reason}")]
    Fault {
        module: String,
        reason: String,
        status: Option<i32>,
    },

    #[error("Backend unavailable for module '{module}': {reason}")]
    BackendUnavailable {
        module: String,
        reason: String,
        transient: bool,
    },

    #[error("Module '{module}' was cancelled")]
    Cancelled { module: String },
}

impl ExecutionError {
    /// Structured status code recorded for this failure.
    pub fn status_code(&self) -> i32 {
        match self {
            ExecutionError::Timeout { .. } => 124,
            ExecutionError::Fault { status, .. } => status.unwrap_or(1),
            ExecutionError::BackendUnavailable { .. } => 125,
            ExecutionError::Cancelled { .. } => 130,
        }
    }

    /// Short label used in attempt logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "timeout",
            ExecutionError::Fault { .. } => "fault",
            ExecutionError::BackendUnavailable { .. } => "backend-unavailable",
            ExecutionError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Orchestration invariant violated.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid state transition for module '{module}': {from} -> {to}")]
    InvalidTransition {
        module: String,
        from: ModuleState,
        to: ModuleState,
    },

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Run state lock poisoned")]
    Poisoned,
}

/// Top-level error surfaced to the operator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Failed to prepare run directory {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Dependency check failed: {0}")]
    Preflight(String),
}

impl OrchestratorError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::Config(_)
            | OrchestratorError::Workspace { .. }
            | OrchestratorError::Preflight(_) => crate::EXIT_CONFIG_ERROR,
            OrchestratorError::Descriptor(_)
            | OrchestratorError::Graph(_)
            | OrchestratorError::State(_) => crate::EXIT_ABORTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::Cyclic {
            path: vec!["P01".into(), "P02".into(), "P01".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: P01 -> P02 -> P01");
    }

    #[test]
    fn test_execution_status_codes() {
        let timeout = ExecutionError::Timeout {
            module: "P50".into(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(timeout.status_code(), 124);
        assert_eq!(timeout.kind(), "timeout");

        let fault = ExecutionError::Fault {
            module: "P50".into(),
            reason: "exit 3".into(),
            status: Some(3),
        };
        assert_eq!(fault.status_code(), 3);
    }

    #[test]
    fn test_exit_codes() {
        let config = OrchestratorError::from(ConfigError::Invalid("bad".into()));
        assert_eq!(config.exit_code(), 3);

        let graph = OrchestratorError::from(GraphError::SelfDependency("P01".into()));
        assert_eq!(graph.exit_code(), 2);
    }
}
