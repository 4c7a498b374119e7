//! Execution backend routing.
//!
//! The router dispatches a job to the native or container backend based on
//! the module's tagged entry, and enforces the job's timeout and the run's
//! cancellation token on both uniformly. It keeps no state between jobs.

pub mod container;
pub mod native;

pub use container::{
    CliContainerEngine, ContainerEngine, ContainerInvocation, ContainerSpec, MountSpec,
    RuntimeStatus,
};
pub use native::{native_fn, ModuleOutcome, NativeCatalog, NativeContext, NativeModule};

use crate::error::ExecutionError;
use crate::models::{BackendKind, ExecutionResult, RunSnapshot};
use container::{Mount, TeardownGuard, FIRMWARE_MOUNT, SCRATCH_MOUNT, WORK_MOUNT};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a registered module is executed.
#[derive(Clone)]
pub enum ModuleEntry {
    Native(Arc<dyn NativeModule>),
    Container(ContainerSpec),
}

impl ModuleEntry {
    pub fn kind(&self) -> BackendKind {
        match self {
            ModuleEntry::Native(_) => BackendKind::Native,
            ModuleEntry::Container(_) => BackendKind::Container,
        }
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleEntry::Native(_) => f.write_str("Native(..)"),
            ModuleEntry::Container(spec) => f.debug_tuple("Container").field(spec).finish(),
        }
    }
}

/// One unit of work handed to a backend.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub run_id: String,
    pub module: String,
    pub attempt: u32,
    pub entry: ModuleEntry,
    pub timeout: Duration,
    pub firmware: PathBuf,
    pub work_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub log_file: PathBuf,
    /// Extra mounts are writable for exclusive-mount modules.
    pub exclusive_mount: bool,
    pub prior: Arc<RunSnapshot>,
}

/// Dispatches jobs to the native or container backend.
pub struct Router {
    engine: Arc<dyn ContainerEngine>,
}

impl Router {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Execute one attempt of a job.
    ///
    /// Returns `Timeout` when the job outlives its budget and `Cancelled`
    /// when the token fires first. Container resources are released before
    /// this returns on every path.
    pub async fn execute(
        &self,
        job: &ExecutionJob,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        fresh_scratch(job).await?;

        match job.entry {
            ModuleEntry::Native(ref module) => self.run_native(job, Arc::clone(module), cancel).await,
            ModuleEntry::Container(ref spec) => self.run_container(job, spec, cancel).await,
        }
    }

    async fn run_native(
        &self,
        job: &ExecutionJob,
        module: Arc<dyn NativeModule>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let ctx = NativeContext {
            module: job.module.clone(),
            attempt: job.attempt,
            firmware: job.firmware.clone(),
            work_dir: job.work_dir.clone(),
            scratch_dir: job.scratch_dir.clone(),
            prior: Arc::clone(&job.prior),
        };

        let outcome = bounded(job, cancel, native::execute(module, ctx)).await?;
        let output_log = write_log(&job.log_file, &outcome.summary).await;

        Ok(ExecutionResult {
            status: outcome.status,
            artifact: outcome.artifact.unwrap_or_else(|| job.scratch_dir.clone()),
            output_log,
            summary: outcome.summary,
        })
    }

    async fn run_container(
        &self,
        job: &ExecutionJob,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        let invocation = invocation_for(job, spec);
        let mut guard = TeardownGuard::new(Arc::clone(&self.engine), invocation.name.clone());

        debug!(module = %job.module, container = %invocation.name, "Starting container");
        let result = bounded(job, cancel, self.engine.run(&invocation)).await;

        self.engine.remove(&invocation.name).await;
        guard.disarm();

        let output = result?;
        let output_log = write_log(&job.log_file, &output.output).await;

        match output.exit_code {
            Some(0) => Ok(ExecutionResult {
                status: 0,
                artifact: job.scratch_dir.clone(),
                output_log,
                summary: summarize(&output.output),
            }),
            Some(code) => Err(ExecutionError::Fault {
                module: job.module.clone(),
                reason: format!("container exited with status {}", code),
                status: Some(code),
            }),
            None => Err(ExecutionError::Fault {
                module: job.module.clone(),
                reason: "container runtime terminated by signal".to_string(),
                status: None,
            }),
        }
    }
}

/// Give every attempt an empty scratch directory.
async fn fresh_scratch(job: &ExecutionJob) -> Result<(), ExecutionError> {
    let unavailable = |action: &str, e: std::io::Error| ExecutionError::BackendUnavailable {
        module: job.module.clone(),
        reason: format!("cannot {} scratch dir {}: {}", action, job.scratch_dir.display(), e),
        transient: false,
    };

    match tokio::fs::remove_dir_all(&job.scratch_dir).await {
        Ok(()) => debug!(module = %job.module, attempt = job.attempt, "Cleared scratch dir"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(unavailable("clear", e)),
    }
    tokio::fs::create_dir_all(&job.scratch_dir)
        .await
        .map_err(|e| unavailable("create", e))
}

/// Race a backend future against the job timeout and the cancel token.
async fn bounded<T, F>(
    job: &ExecutionJob,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, ExecutionError>
where
    F: Future<Output = Result<T, ExecutionError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled {
            module: job.module.clone(),
        }),
        result = tokio::time::timeout(job.timeout, work) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ExecutionError::Timeout {
                module: job.module.clone(),
                timeout: job.timeout,
            }),
        },
    }
}

fn invocation_for(job: &ExecutionJob, spec: &ContainerSpec) -> ContainerInvocation {
    // Only the image itself is bound, never its host directory.
    let firmware_name = job
        .firmware
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firmware.bin".to_string());
    let firmware_target = format!("{}/{}", FIRMWARE_MOUNT, firmware_name);

    let mut mounts = vec![
        Mount {
            source: job.firmware.clone(),
            target: firmware_target.clone(),
            read_only: true,
        },
        Mount {
            source: job.work_dir.clone(),
            target: WORK_MOUNT.to_string(),
            read_only: true,
        },
        Mount {
            source: job.scratch_dir.clone(),
            target: SCRATCH_MOUNT.to_string(),
            read_only: false,
        },
    ];
    mounts.extend(spec.mounts.iter().map(|m| Mount {
        source: job.work_dir.join(&m.source),
        target: m.target.clone(),
        read_only: !job.exclusive_mount,
    }));

    let mut env = BTreeMap::new();
    env.insert("FIRMORCH_MODULE".to_string(), job.module.clone());
    env.insert("FIRMORCH_ATTEMPT".to_string(), job.attempt.to_string());
    env.insert("FIRMORCH_FIRMWARE".to_string(), firmware_target);
    env.insert("FIRMORCH_WORK".to_string(), WORK_MOUNT.to_string());
    env.insert("FIRMORCH_SCRATCH".to_string(), SCRATCH_MOUNT.to_string());
    for (key, value) in &spec.env {
        env.insert(key.clone(), value.clone());
    }

    ContainerInvocation {
        module: job.module.clone(),
        name: container::container_name(&job.run_id, &job.module, job.attempt),
        image: spec.image.clone(),
        command: spec.command.clone(),
        env,
        mounts,
    }
}

/// Last non-empty output line, trimmed for the report.
fn summarize(output: &str) -> String {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.chars().take(200).collect()
}

async fn write_log(path: &Path, content: &str) -> Option<PathBuf> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Failed to create log dir {}: {}", parent.display(), e);
            return None;
        }
    }
    match tokio::fs::write(path, content).await {
        Ok(()) => Some(path.to_path_buf()),
        Err(e) => {
            warn!("Failed to write module log {}: {}", path.display(), e);
            None
        }
    }
}
