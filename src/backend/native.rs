//! In-process module execution.

use crate::error::ExecutionError;
use crate::models::RunSnapshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

/// Inputs handed to a native module for one attempt.
#[derive(Debug, Clone)]
pub struct NativeContext {
    pub module: String,
    pub attempt: u32,
    /// Firmware image under analysis.
    pub firmware: PathBuf,
    /// Run directory. Upstream artifacts live under `scratch/<id>`.
    pub work_dir: PathBuf,
    /// Private scratch directory for this module.
    pub scratch_dir: PathBuf,
    /// Run state at admission time.
    pub prior: Arc<RunSnapshot>,
}

/// What a native module reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleOutcome {
    /// Zero on success. Anything else is recorded as a fault.
    pub status: i32,
    pub artifact: Option<PathBuf>,
    pub summary: String,
}

impl ModuleOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            status: 0,
            artifact: None,
            summary: summary.into(),
        }
    }

    pub fn with_artifact(mut self, artifact: PathBuf) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

pub type NativeFuture = BoxFuture<'static, Result<ModuleOutcome, String>>;

/// An analysis module implemented in-process.
pub trait NativeModule: Send + Sync {
    fn run(&self, ctx: NativeContext) -> NativeFuture;
}

struct FnModule<F>(F);

impl<F, Fut> NativeModule for FnModule<F>
where
    F: Fn(NativeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ModuleOutcome, String>> + Send + 'static,
{
    fn run(&self, ctx: NativeContext) -> NativeFuture {
        (self.0)(ctx).boxed()
    }
}

/// Wrap an async closure as a native module.
pub fn native_fn<F, Fut>(f: F) -> Arc<dyn NativeModule>
where
    F: Fn(NativeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ModuleOutcome, String>> + Send + 'static,
{
    Arc::new(FnModule(f))
}

/// Named native entry points that manifests may reference.
#[derive(Clone, Default)]
pub struct NativeCatalog {
    entries: BTreeMap<String, Arc<dyn NativeModule>>,
}

impl NativeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: impl Into<String>, module: Arc<dyn NativeModule>) {
        self.entries.insert(entry.into(), module);
    }

    pub fn get(&self, entry: &str) -> Option<Arc<dyn NativeModule>> {
        self.entries.get(entry).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl fmt::Debug for NativeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

/// Aborts the spawned module task if the attempt is abandoned.
struct AbortOnDrop(tokio::task::JoinHandle<Result<ModuleOutcome, String>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one attempt of a native module on its own task.
///
/// A panic inside the module is reported as a fault instead of tearing
/// down the worker. Dropping the returned future aborts the task at its
/// next await point.
pub(crate) async fn execute(
    module: Arc<dyn NativeModule>,
    ctx: NativeContext,
) -> Result<ModuleOutcome, ExecutionError> {
    let id = ctx.module.clone();
    let mut handle = AbortOnDrop(tokio::spawn(module.run(ctx)));

    match (&mut handle.0).await {
        Ok(Ok(outcome)) if outcome.status == 0 => Ok(outcome),
        Ok(Ok(outcome)) => Err(ExecutionError::Fault {
            module: id,
            reason: if outcome.summary.is_empty() {
                format!("exited with status {}", outcome.status)
            } else {
                outcome.summary
            },
            status: Some(outcome.status),
        }),
        Ok(Err(reason)) => Err(ExecutionError::Fault {
            module: id,
            reason,
            status: None,
        }),
        Err(e) if e.is_panic() => Err(ExecutionError::Fault {
            module: id,
            reason: "module panicked".to_string(),
            status: None,
        }),
        Err(_) => Err(ExecutionError::Cancelled { module: id }),
    }
}
