//! Configuration file handling.
//!
//! This module handles loading, validating and merging configuration from
//! `.firmorch.toml` files. Unknown keys are rejected at every level.

use crate::cli::{Args, OutputFormat};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = ".firmorch.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Module selection and per-module overrides.
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Retry policy for recoverable failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Container backend environment.
    #[serde(default)]
    pub container: ContainerConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// General run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Directory for per-module logs, scratch space and the report.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory scanned for module manifests.
    #[serde(default = "default_module_dir")]
    pub module_dir: PathBuf,

    /// Worker pool size. Derived from host parallelism when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Timeout for modules that declare none.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    /// Run live-emulation modules.
    #[serde(default)]
    pub full_emulation: bool,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Clear a populated log directory instead of refusing to reuse it.
    #[serde(default)]
    pub reset: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            module_dir: default_module_dir(),
            concurrency: None,
            default_timeout_secs: default_timeout(),
            full_emulation: false,
            verbose: false,
            reset: false,
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("firmorch_logs")
}

fn default_module_dir() -> PathBuf {
    PathBuf::from("modules")
}

fn default_timeout() -> u64 {
    1800 // extraction of large images regularly exceeds 15 min
}

/// Host-derived worker count: half the cores plus one.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus / 2 + 1
}

/// Module selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModulesConfig {
    /// Modules to run. Empty means every discovered module.
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Modules never to run. Wins over `enabled`.
    #[serde(default)]
    pub disabled: Vec<String>,

    /// Per-module overrides keyed by identifier.
    #[serde(default)]
    pub overrides: BTreeMap<String, ModuleOverride>,
}

/// Overrides applied on top of a module's manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts per module, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff() -> u64 {
    30_000
}

/// Container runtime environment and sandbox policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    /// Runtime CLI (docker, podman).
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Daemon socket. Passed as `--host unix://<socket>` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,

    /// Memory limit (`--memory`). Empty means no limit.
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (`--cpus`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,

    /// Process limit (`--pids-limit`). Zero means no limit.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// Network mode (`--network`).
    #[serde(default = "default_network")]
    pub network: String,

    /// Mount the container root filesystem read-only.
    #[serde(default = "default_true")]
    pub read_only_rootfs: bool,

    /// Extra arguments inserted before the image name.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            socket: None,
            memory: default_memory(),
            cpus: None,
            pids_limit: default_pids_limit(),
            network: default_network(),
            read_only_rootfs: true,
            extra_args: Vec::new(),
        }
    }
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_pids_limit() -> u32 {
    512
}

fn default_network() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

/// Report generation settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Report path. Defaults to `<log_dir>/firmorch_report.{md,json}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path)
    }

    /// Parse a configuration document. `origin` is only used in errors.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>, ConfigError> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.concurrency == Some(0) {
            return Err(ConfigError::Invalid(
                "general.concurrency must be at least 1".to_string(),
            ));
        }
        if self.general.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "general.default_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.container.runtime.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "container.runtime must not be empty".to_string(),
            ));
        }
        for (id, module) in &self.modules.overrides {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "modules.overrides keys must not be empty".to_string(),
                ));
            }
            if module.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "modules.overrides.{}.timeout_secs must be at least 1",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Effective worker pool size.
    pub fn concurrency(&self) -> usize {
        self.general.concurrency.unwrap_or_else(default_concurrency)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.general.default_timeout_secs)
    }

    /// Report path, falling back to the log directory.
    pub fn report_path(&self) -> PathBuf {
        self.report.output.clone().unwrap_or_else(|| {
            let ext = match self.report.format {
                OutputFormat::Markdown => "md",
                OutputFormat::Json => "json",
            };
            self.general.log_dir.join(format!("firmorch_report.{}", ext))
        })
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &Args) {
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = Some(concurrency);
        }
        if let Some(ref log_dir) = args.log_dir {
            self.general.log_dir = log_dir.clone();
        }
        if let Some(ref module_dir) = args.module_dir {
            self.general.module_dir = module_dir.clone();
        }
        if let Some(format) = args.format {
            self.report.format = format;
        }
        if let Some(ref output) = args.output {
            self.report.output = Some(output.clone());
        }
        if args.full_emulation {
            self.general.full_emulation = true;
        }
        if args.verbose {
            self.general.verbose = true;
        }
        if args.reset {
            self.general.reset = true;
        }
    }

    /// Serialize to a TOML document.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        Config::default().to_toml().unwrap_or_default()
    }
}
