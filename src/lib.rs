//! firmorch - orchestration core for firmware security analysis pipelines.
//!
//! Modules are discovered from manifests ([`registry`]), ordered into a
//! phase-gated DAG ([`graph`]), and driven to completion on a bounded
//! worker pool ([`scheduler`]) that routes each job to an in-process or
//! containerized backend ([`backend`]). Module state lives in a single
//! tracker ([`state`]); failures are classified by [`recovery`].
//! Backend availability is checked up front by [`preflight`].

pub mod backend;
pub mod builtin;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod models;
pub mod preflight;
pub mod recovery;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod state;

/// Every module succeeded.
pub const EXIT_SUCCESS: i32 = 0;
/// The run completed but some modules failed or were skipped.
pub const EXIT_PARTIAL: i32 = 1;
/// The run was aborted, or could not start because of invalid modules.
pub const EXIT_ABORTED: i32 = 2;
/// The configuration could not be loaded.
pub const EXIT_CONFIG_ERROR: i32 = 3;

pub use error::{
    ConfigError, DescriptorError, ExecutionError, GraphError, OrchestratorError, StateError,
};
pub use models::{ModuleState, Phase, RunOutcome, RunSnapshot, RunStatus};
