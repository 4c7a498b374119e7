//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// firmorch - phase-gated firmware analysis orchestrator
///
/// Discovers analysis modules, resolves their dependencies and runs them
/// on a bounded worker pool, natively or inside containers.
///
/// Exit codes: 0 all modules succeeded, 1 partial failure (report written),
/// 2 run aborted, 3 configuration error.
///
/// Examples:
///   firmorch firmware.bin
///   firmorch firmware.bin --config scan.toml --concurrency 8
///   firmorch firmware.bin --dry-run
///   firmorch --list-modules
///   firmorch --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Firmware image to analyze
    #[arg(
        value_name = "FIRMWARE",
        required_unless_present_any = ["init_config", "list_modules", "dep_check"]
    )]
    pub firmware: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .firmorch.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory for module logs, scratch space and the report
    #[arg(long, value_name = "DIR", env = "FIRMORCH_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Directory containing module manifests
    #[arg(long, value_name = "DIR", env = "FIRMORCH_MODULE_DIR")]
    pub module_dir: Option<PathBuf>,

    /// Number of modules allowed to run concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Report format (markdown, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Report output path
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Include live-emulation modules
    #[arg(long)]
    pub full_emulation: bool,

    /// Clear a log directory left over from a previous run
    #[arg(long)]
    pub reset: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Resolve the execution plan, print it and exit without running modules
    #[arg(long)]
    pub dry_run: bool,

    /// List discovered modules and exit
    #[arg(long)]
    pub list_modules: bool,

    /// Check that the selected modules' backends are available and exit
    #[arg(long)]
    pub dep_check: bool,

    /// Generate a default .firmorch.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.list_modules || self.dep_check {
            return Ok(());
        }

        match self.firmware {
            Some(ref path) if !path.exists() => {
                Err(format!("Firmware path does not exist: {}", path.display()))
            }
            Some(_) => Ok(()),
            None => Err("A firmware path is required".to_string()),
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
