//! Containerized module execution.
//!
//! Each attempt runs in a uniquely named container. The container is
//! removed on every exit path: after the attempt finishes, fails, times
//! out or is cancelled, and from a drop guard if the attempt future itself
//! is abandoned.

use crate::config::ContainerConfig;
use crate::error::ExecutionError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Directory under which the firmware image is bound, as a single file.
pub const FIRMWARE_MOUNT: &str = "/firmware";
/// Mount point of the (read-only) run directory.
pub const WORK_MOUNT: &str = "/work";
/// Mount point of the module's writable scratch directory.
pub const SCRATCH_MOUNT: &str = "/scratch";

/// Image and command declared by a container module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Additional binds of run-directory paths.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

/// Bind of a path relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
}

/// One bind mount on the runtime command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    fn to_arg(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.source.display(), self.target, mode)
    }
}

/// Fully resolved `run` request for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInvocation {
    pub module: String,
    /// Unique per attempt.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

impl ContainerInvocation {
    /// Arguments following the runtime binary (and host flag).
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--rm".to_string(),
            "--network".to_string(),
            config.network.clone(),
        ];

        if !config.memory.is_empty() {
            args.push("--memory".to_string());
            args.push(config.memory.clone());
        }
        if let Some(cpus) = config.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if config.pids_limit > 0 {
            args.push("--pids-limit".to_string());
            args.push(config.pids_limit.to_string());
        }
        if config.read_only_rootfs {
            args.push("--read-only".to_string());
            args.push("--tmpfs".to_string());
            args.push("/tmp".to_string());
        }

        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(mount.to_arg());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.extend(config.extra_args.iter().cloned());
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Captured result of a container that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerOutput {
    /// `None` when the runtime process was killed by a signal.
    pub exit_code: Option<i32>,
    pub output: String,
}

/// Answer of the runtime to a liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Runtime answered. Holds its first line of version output.
    Ready(String),
    Unavailable { reason: String, transient: bool },
}

/// Container runtime seam.
pub trait ContainerEngine: Send + Sync {
    /// Ask the runtime whether it can start containers.
    fn check(&self) -> BoxFuture<'_, RuntimeStatus>;

    fn run<'a>(
        &'a self,
        invocation: &'a ContainerInvocation,
    ) -> BoxFuture<'a, Result<ContainerOutput, ExecutionError>>;

    /// Force-remove a container. Must not fail if it is already gone.
    fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ()>;
}

/// Runtime exit status reserved for daemon-side errors.
const RUNTIME_ERROR_STATUS: i32 = 125;

/// Drives `docker`/`podman` through its command line.
#[derive(Debug, Clone)]
pub struct CliContainerEngine {
    config: ContainerConfig,
}

impl CliContainerEngine {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.runtime);
        if let Some(ref socket) = self.config.socket {
            cmd.arg("--host").arg(format!("unix://{}", socket.display()));
        }
        cmd
    }

    async fn run_container(
        &self,
        invocation: &ContainerInvocation,
    ) -> Result<ContainerOutput, ExecutionError> {
        if let Some(ref socket) = self.config.socket {
            if !socket.exists() {
                return Err(ExecutionError::BackendUnavailable {
                    module: invocation.module.clone(),
                    reason: format!("container socket {} not found", socket.display()),
                    transient: true,
                });
            }
        }

        let args = invocation.run_args(&self.config);
        debug!("{} {}", self.config.runtime, args.join(" "));

        let child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::BackendUnavailable {
                module: invocation.module.clone(),
                reason: format!("cannot start {}: {}", self.config.runtime, e),
                transient: e.kind() != std::io::ErrorKind::NotFound,
            })?;

        let output =
            child
                .wait_with_output()
                .await
                .map_err(|e| ExecutionError::BackendUnavailable {
                    module: invocation.module.clone(),
                    reason: format!("lost {} process: {}", self.config.runtime, e),
                    transient: true,
                })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        match output.status.code() {
            Some(RUNTIME_ERROR_STATUS) => Err(ExecutionError::BackendUnavailable {
                module: invocation.module.clone(),
                reason: last_line(&combined)
                    .unwrap_or("container runtime error")
                    .to_string(),
                transient: true,
            }),
            code => Ok(ContainerOutput {
                exit_code: code,
                output: combined,
            }),
        }
    }
}

impl CliContainerEngine {
    async fn check_runtime(&self) -> RuntimeStatus {
        if let Some(ref socket) = self.config.socket {
            if !socket.exists() {
                return RuntimeStatus::Unavailable {
                    reason: format!("container socket {} not found", socket.display()),
                    transient: true,
                };
            }
        }

        let output = self
            .command()
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let version = stdout
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or(self.config.runtime.as_str());
                RuntimeStatus::Ready(version.to_string())
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                RuntimeStatus::Unavailable {
                    reason: last_line(&stderr)
                        .unwrap_or("runtime did not answer")
                        .to_string(),
                    transient: true,
                }
            }
            Err(e) => RuntimeStatus::Unavailable {
                reason: format!("cannot start {}: {}", self.config.runtime, e),
                transient: e.kind() != std::io::ErrorKind::NotFound,
            },
        }
    }
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

impl ContainerEngine for CliContainerEngine {
    fn check(&self) -> BoxFuture<'_, RuntimeStatus> {
        self.check_runtime().boxed()
    }

    fn run<'a>(
        &'a self,
        invocation: &'a ContainerInvocation,
    ) -> BoxFuture<'a, Result<ContainerOutput, ExecutionError>> {
        self.run_container(invocation).boxed()
    }

    fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ()> {
        async move {
            let status = self
                .command()
                .args(["rm", "--force", name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(s) if s.success() => debug!("Removed container {}", name),
                Ok(_) => debug!("Container {} already gone", name),
                Err(e) => warn!("Failed to remove container {}: {}", name, e),
            }
        }
        .boxed()
    }
}

/// Removes the container if the owning attempt is dropped before
/// cleanup ran.
pub(crate) struct TeardownGuard {
    engine: Arc<dyn ContainerEngine>,
    name: Option<String>,
}

impl TeardownGuard {
    pub(crate) fn new(engine: Arc<dyn ContainerEngine>, name: String) -> Self {
        Self {
            engine,
            name: Some(name),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.name = None;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(&self.engine);
                handle.spawn(async move { engine.remove(&name).await });
            }
            Err(_) => warn!("No runtime to remove abandoned container {}", name),
        }
    }
}

/// Container name unique to one attempt of one module in one run.
pub fn container_name(run_id: &str, module: &str, attempt: u32) -> String {
    let module: String = module
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("firmorch-{}-{}-a{}", run_id, module, attempt)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> ContainerInvocation {
        let mut env = BTreeMap::new();
        env.insert("FIRMORCH_MODULE".to_string(), "P50".to_string());
        ContainerInvocation {
            module: "P50".to_string(),
            name: container_name("run1", "P50", 2),
            image: "firmorch/binwalk:latest".to_string(),
            command: vec!["binwalk".to_string(), "-e".to_string()],
            env,
            mounts: vec![
                Mount {
                    source: PathBuf::from("/tmp/fw/image.bin"),
                    target: format!("{}/image.bin", FIRMWARE_MOUNT),
                    read_only: true,
                },
                Mount {
                    source: PathBuf::from("/tmp/run/scratch/P50"),
                    target: SCRATCH_MOUNT.to_string(),
                    read_only: false,
                },
            ],
        }
    }

    #[test]
    fn test_container_name_is_per_attempt() {
        assert_eq!(container_name("run1", "P50", 2), "firmorch-run1-p50-a2");
        assert_ne!(
            container_name("run1", "P50", 1),
            container_name("run1", "P50", 2)
        );
        assert_eq!(container_name("r", "S 10/x", 1), "firmorch-r-s-10-x-a1");
    }

    #[test]
    fn test_run_args_apply_sandbox_policy() {
        let config = ContainerConfig {
            cpus: Some(1.5),
            extra_args: vec!["--cap-drop".to_string(), "ALL".to_string()],
            ..ContainerConfig::default()
        };
        let args = invocation().run_args(&config);

        assert_eq!(args[0], "run");
        assert!(args.windows(2).any(|w| w == ["--name", "firmorch-run1-p50-a2"]));
        assert!(args.windows(2).any(|w| w == ["--network", "none"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "2g"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "1.5"]));
        assert!(args.windows(2).any(|w| w == ["--pids-limit", "512"]));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args
            .windows(2)
            .any(|w| w == ["-v", "/tmp/fw/image.bin:/firmware/image.bin:ro"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["-v", "/tmp/run/scratch/P50:/scratch:rw"]));
        assert!(args.windows(2).any(|w| w == ["-e", "FIRMORCH_MODULE=P50"]));

        let image_pos = args
            .iter()
            .position(|a| a == "firmorch/binwalk:latest")
            .unwrap();
        let extra_pos = args.iter().position(|a| a == "--cap-drop").unwrap();
        assert!(extra_pos < image_pos);
        assert_eq!(&args[image_pos + 1..], ["binwalk", "-e"]);
    }

    #[test]
    fn test_run_args_without_limits() {
        let config = ContainerConfig {
            memory: String::new(),
            pids_limit: 0,
            read_only_rootfs: false,
            ..ContainerConfig::default()
        };
        let args = invocation().run_args(&config);
        assert!(!args.contains(&"--memory".to_string()));
        assert!(!args.contains(&"--pids-limit".to_string()));
        assert!(!args.contains(&"--read-only".to_string()));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_permanent() {
        let engine = CliContainerEngine::new(ContainerConfig {
            runtime: "firmorch-no-such-runtime".to_string(),
            ..ContainerConfig::default()
        });
        let err = engine.run(&invocation()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::BackendUnavailable {
                transient: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_check_missing_runtime() {
        let engine = CliContainerEngine::new(ContainerConfig {
            runtime: "firmorch-no-such-runtime".to_string(),
            ..ContainerConfig::default()
        });
        match engine.check().await {
            RuntimeStatus::Unavailable { reason, transient } => {
                assert!(!transient);
                assert!(reason.contains("firmorch-no-such-runtime"));
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_missing_socket() {
        let engine = CliContainerEngine::new(ContainerConfig {
            socket: Some(PathBuf::from("/nonexistent/firmorch.sock")),
            ..ContainerConfig::default()
        });
        assert!(matches!(
            engine.check().await,
            RuntimeStatus::Unavailable {
                transient: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_socket_is_transient() {
        let engine = CliContainerEngine::new(ContainerConfig {
            socket: Some(PathBuf::from("/nonexistent/firmorch.sock")),
            ..ContainerConfig::default()
        });
        let err = engine.run(&invocation()).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::BackendUnavailable {
                transient: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_guard_removes_when_dropped_armed() {
        let engine = Arc::new(mock::MockEngine::default());
        {
            let _guard = TeardownGuard::new(engine.clone(), "c1".to_string());
        }
        {
            let mut guard = TeardownGuard::new(engine.clone(), "c2".to_string());
            guard.disarm();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.removed(), vec!["c1".to_string()]);
    }
}
