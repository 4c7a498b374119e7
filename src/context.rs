//! Per-run context: firmware input, directories, configuration and state.

use crate::backend::ExecutionJob;
use crate::config::Config;
use crate::error::{ConfigError, OrchestratorError};
use crate::graph::ExecutionGraph;
use crate::models::RunSnapshot;
use crate::registry::ModuleSpec;
use crate::state::RunStateTracker;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a run shares across modules. Read-only once the run starts,
/// except for the tracker.
pub struct RunContext {
    run_id: String,
    firmware: PathBuf,
    firmware_size: u64,
    work_dir: PathBuf,
    config: Arc<Config>,
    tracker: Arc<RunStateTracker>,
}

impl RunContext {
    /// Validate the firmware path, create the run directories and a tracker
    /// for every module in `graph`.
    pub fn prepare(
        firmware: &Path,
        config: Arc<Config>,
        graph: &ExecutionGraph,
    ) -> Result<Self, OrchestratorError> {
        let metadata = std::fs::metadata(firmware).map_err(|e| {
            ConfigError::Invalid(format!("firmware {}: {}", firmware.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(ConfigError::Invalid(format!(
                "firmware {} is not a regular file",
                firmware.display()
            ))
            .into());
        }
        let firmware = canonical(firmware)?;

        let log_dir = &config.general.log_dir;
        if is_populated(log_dir)? {
            if !config.general.reset {
                return Err(OrchestratorError::Workspace {
                    path: log_dir.clone(),
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "run directory is not empty; pass --reset to clear it",
                    ),
                });
            }
            let keep = [firmware.as_path(), config.general.module_dir.as_path()];
            reset_dir(&canonical(log_dir)?, &keep)?;
        }
        create_dir(log_dir)?;
        let work_dir = canonical(log_dir)?;
        create_dir(&work_dir.join("scratch"))?;

        let tracker = Arc::new(RunStateTracker::new(
            graph.ids().filter_map(|id| graph.descriptor(id)),
        ));

        let run_id = format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), std::process::id());
        debug!("Run {} in {}", run_id, work_dir.display());

        Ok(Self {
            run_id,
            firmware,
            firmware_size: metadata.len(),
            work_dir,
            config,
            tracker,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn firmware(&self) -> &Path {
        &self.firmware
    }

    pub fn firmware_size(&self) -> u64 {
        self.firmware_size
    }

    /// Shared run directory. Also holds module logs and scratch space.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn scratch_dir(&self, id: &str) -> PathBuf {
        self.work_dir.join("scratch").join(id)
    }

    pub fn log_file(&self, id: &str) -> PathBuf {
        self.work_dir.join(format!("{}.txt", id))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<RunStateTracker> {
        &self.tracker
    }

    /// First-attempt job for a module.
    pub fn job(&self, spec: &ModuleSpec, prior: Arc<RunSnapshot>) -> ExecutionJob {
        let id = spec.id();
        ExecutionJob {
            run_id: self.run_id.clone(),
            module: id.to_string(),
            attempt: 1,
            entry: spec.entry.clone(),
            timeout: spec.descriptor.timeout,
            firmware: self.firmware.clone(),
            work_dir: self.work_dir.clone(),
            scratch_dir: self.scratch_dir(id),
            log_file: self.log_file(id),
            exclusive_mount: spec.descriptor.hints.exclusive_mount,
            prior,
        }
    }
}

fn workspace(path: &Path) -> impl FnOnce(io::Error) -> OrchestratorError + '_ {
    move |source| OrchestratorError::Workspace {
        path: path.to_path_buf(),
        source,
    }
}

fn is_populated(path: &Path) -> Result<bool, OrchestratorError> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(workspace(path)(e)),
    }
}

/// Empty `dir`, keeping the directory itself.
///
/// Refuses when `dir` holds any of `keep` or the current directory.
fn reset_dir(dir: &Path, keep: &[&Path]) -> Result<(), OrchestratorError> {
    let cwd = std::env::current_dir().map_err(workspace(dir))?;
    let inside = keep
        .iter()
        .filter_map(|p| p.canonicalize().ok())
        .chain(std::iter::once(cwd))
        .find(|p| p.starts_with(dir));
    if let Some(path) = inside {
        return Err(OrchestratorError::Workspace {
            path: dir.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("refusing to clear a directory containing {}", path.display()),
            ),
        });
    }

    info!("Clearing run directory {}", dir.display());
    for entry in std::fs::read_dir(dir).map_err(workspace(dir))? {
        let entry = entry.map_err(workspace(dir))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(workspace(&path))?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(&path).map_err(workspace(&path))?;
        } else {
            std::fs::remove_file(&path).map_err(workspace(&path))?;
        }
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), OrchestratorError> {
    std::fs::create_dir_all(path).map_err(|source| OrchestratorError::Workspace {
        path: path.to_path_buf(),
        source,
    })
}

fn canonical(path: &Path) -> Result<PathBuf, OrchestratorError> {
    path.canonicalize()
        .map_err(|source| OrchestratorError::Workspace {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Arc<Config> {
        let mut config = Config::default();
        config.general.log_dir = dir.path().join("logs");
        Arc::new(config)
    }

    #[test]
    fn test_prepare_creates_directories() {
        let dir = TempDir::new().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"hsqs0000").unwrap();
        let graph = ExecutionGraph::build(Vec::new()).unwrap();

        let ctx = RunContext::prepare(&firmware, config(&dir), &graph).unwrap();
        assert!(ctx.work_dir().join("scratch").is_dir());
        assert!(ctx.firmware().is_absolute());
        assert_eq!(ctx.firmware_size(), 8);
        assert!(ctx.log_file("P02").ends_with("P02.txt"));
        assert!(ctx.scratch_dir("P02").ends_with("scratch/P02"));
        assert!(matches!(
            ctx.tracker().state("P02"),
            Err(crate::error::StateError::UnknownModule(_))
        ));
    }

    #[test]
    fn test_prepare_rejects_missing_firmware() {
        let dir = TempDir::new().unwrap();
        let graph = ExecutionGraph::build(Vec::new()).unwrap();
        let err = RunContext::prepare(&dir.path().join("missing.bin"), config(&dir), &graph)
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), crate::EXIT_CONFIG_ERROR);

        let err = RunContext::prepare(dir.path(), config(&dir), &graph)
            .err()
            .unwrap();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn test_prepare_refuses_populated_run_dir() {
        let dir = TempDir::new().unwrap();
        let firmware = dir.path().join("fw.bin");
        std::fs::write(&firmware, b"hsqs").unwrap();
        let stale = dir.path().join("logs").join("scratch").join("P50");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("old.bin"), b"stale").unwrap();
        let graph = ExecutionGraph::build(Vec::new()).unwrap();

        let err = RunContext::prepare(&firmware, config(&dir), &graph)
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), crate::EXIT_CONFIG_ERROR);
        assert!(err.to_string().contains("--reset"));
        assert!(stale.join("old.bin").exists());

        let mut reset = Config::default();
        reset.general.log_dir = dir.path().join("logs");
        reset.general.reset = true;
        let ctx = RunContext::prepare(&firmware, Arc::new(reset), &graph).unwrap();
        assert!(!stale.exists());
        assert!(ctx.work_dir().join("scratch").is_dir());
        assert!(firmware.exists());
    }

    #[test]
    fn test_reset_keeps_firmware_inside_run_dir() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("logs");
        std::fs::create_dir_all(&run).unwrap();
        let firmware = run.join("fw.bin");
        std::fs::write(&firmware, b"hsqs").unwrap();
        let graph = ExecutionGraph::build(Vec::new()).unwrap();

        let mut config = Config::default();
        config.general.log_dir = run;
        config.general.reset = true;
        let err = RunContext::prepare(&firmware, Arc::new(config), &graph)
            .err()
            .unwrap();
        assert!(err.to_string().contains("refusing to clear"));
        assert!(firmware.exists());
    }
}
