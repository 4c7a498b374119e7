//! firmorch - phase-gated firmware analysis orchestrator
//!
//! Discovers analysis modules, resolves their dependency graph and runs
//! them on a bounded worker pool, natively or inside containers.
//!
//! Exit codes:
//!   0 - Every module succeeded
//!   1 - Some modules failed or were skipped, report written
//!   2 - Run aborted (critical failure, interrupt, invalid modules)
//!   3 - Configuration, workspace or dependency check error

use anyhow::{Context, Result};
use firmorch::backend::{CliContainerEngine, ContainerEngine, Router};
use firmorch::builtin;
use firmorch::cli::Args;
use firmorch::config::{Config, DEFAULT_CONFIG_FILE};
use firmorch::context::RunContext;
use firmorch::graph::ExecutionGraph;
use firmorch::models::{format_runtime, ModuleState, RunOutcome};
use firmorch::preflight::{self, Check, PreflightReport};
use firmorch::recovery::{RecoveryController, RetryPolicy};
use firmorch::registry::{ModuleRegistry, ModuleSpec};
use firmorch::report::{write_report, RunReport};
use firmorch::scheduler::Scheduler;
use firmorch::state::RunStateTracker;
use firmorch::{ConfigError, OrchestratorError, EXIT_CONFIG_ERROR, EXIT_SUCCESS};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Configuration decides the log level, so it is loaded first
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("\n❌ Error: {}", e);
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    init_logging(log_level(&args, &config))?;

    info!("firmorch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            let code = e
                .downcast_ref::<OrchestratorError>()
                .map(OrchestratorError::exit_code)
                .unwrap_or(EXIT_CONFIG_ERROR);
            std::process::exit(code);
        }
    }
}

/// Handle --init-config: generate a default .firmorch.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(EXIT_CONFIG_ERROR);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to select modules, tune retries and the container sandbox.");
    Ok(())
}

/// Load configuration from file or use defaults, then apply CLI overrides.
fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match args.config {
        Some(ref config_path) => Config::load(config_path)?,
        None => Config::load_default()?.unwrap_or_default(),
    };
    config.merge_with_args(args);
    config.validate()?;
    Ok(config)
}

fn log_level(args: &Args, config: &Config) -> Level {
    if args.quiet {
        Level::ERROR
    } else if config.general.verbose {
        Level::DEBUG
    } else {
        args.log_level()
    }
}

/// Initialize logging. `RUST_LOG` wins over the verbosity flags.
fn init_logging(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Run the complete pipeline. Returns the process exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    // Step 1: Discover modules
    let catalog = builtin::catalog();
    let mut registry = ModuleRegistry::new();
    registry
        .load_dir(&config.general.module_dir, &catalog, config.default_timeout())
        .map_err(OrchestratorError::from)?;

    for unknown in registry.apply_overrides(&config.modules.overrides) {
        warn!("Override for unknown module '{}' ignored", unknown);
    }

    if args.list_modules {
        handle_list_modules(&registry);
        return Ok(EXIT_SUCCESS);
    }

    let selected = registry.filtered(
        &config.modules.enabled,
        &config.modules.disabled,
        config.general.full_emulation,
    );
    info!(
        "Selected {} of {} module(s)",
        selected.len(),
        registry.len()
    );

    // Step 2: Resolve the execution graph
    let graph = Arc::new(ExecutionGraph::build(selected).map_err(OrchestratorError::from)?);

    if args.dry_run {
        handle_dry_run(&graph);
        return Ok(EXIT_SUCCESS);
    }

    let engine: Arc<dyn ContainerEngine> =
        Arc::new(CliContainerEngine::new(config.container.clone()));

    // Step 3: Check backend dependencies
    let checks = preflight::run_checks(&graph, engine.as_ref(), preflight::CHECK_TIMEOUT).await;
    if args.dep_check {
        return handle_dep_check(&checks);
    }
    if let Some(check) = checks.blocking().next() {
        return Err(preflight_error(check).into());
    }
    for check in checks.failures() {
        warn!(
            "{} unavailable ({}), {} will fail",
            check.name,
            check.detail,
            check.needed_by.join(", ")
        );
    }

    let Some(firmware) = args.firmware.clone() else {
        return Err(OrchestratorError::from(ConfigError::Invalid(
            "A firmware path is required".to_string(),
        ))
        .into());
    };

    // Step 4: Prepare the run directory
    let concurrency = config.concurrency();
    let report_path = config.report_path();
    let report_format = config.report.format;
    let retry = RetryPolicy::from(&config.retry);

    let ctx = Arc::new(RunContext::prepare(&firmware, Arc::new(config), &graph)?);

    println!("🔬 Analyzing firmware: {}", ctx.firmware().display());
    println!("   Run ID: {}", ctx.run_id());
    println!("   Modules: {}", graph.len());
    println!("   Concurrency: {}", concurrency);
    println!("   Logs: {}\n", ctx.work_dir().display());

    // Step 5: Run the scheduler
    let router = Router::new(engine);
    let scheduler = Scheduler::new(concurrency, router, RecoveryController::new(retry));

    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_handler(cancel.clone());

    let progress_done = CancellationToken::new();
    let progress = if args.quiet {
        None
    } else {
        Some(spawn_progress(
            Arc::clone(ctx.tracker()),
            graph.len(),
            progress_done.clone(),
        ))
    };

    let outcome = scheduler
        .run(Arc::clone(&graph), Arc::clone(&ctx), cancel)
        .await;

    progress_done.cancel();
    if let Some(handle) = progress {
        let _ = handle.await;
    }
    interrupt.abort();

    let snapshot = outcome.map_err(OrchestratorError::from)?;

    // Step 6: Write the report
    let report = RunReport::new(snapshot, &graph, &ctx, concurrency);
    let written = match write_report(&report, report_format, &report_path) {
        Ok(()) => true,
        Err(e) => {
            error!("Report not written: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            false
        }
    };
    let saved = if written {
        format!("Report saved to: {}", report_path.display())
    } else {
        "No report was written.".to_string()
    };

    // Print summary
    let summary = &report.summary;
    println!("\n📊 Run Summary:");
    println!("   Modules: {}", summary.total);
    println!(
        "   - {} Succeeded: {} | {} Failed: {} | {} Skipped: {}",
        ModuleState::Succeeded.emoji(),
        summary.succeeded,
        ModuleState::Failed.emoji(),
        summary.failed,
        ModuleState::Skipped.emoji(),
        summary.skipped
    );
    if summary.retries > 0 {
        println!("   Retries: {}", summary.retries);
    }
    if let Some(secs) = report.run.duration_secs() {
        println!("   Duration: {}", format_runtime(secs));
    }

    match report.outcome {
        RunOutcome::Succeeded => println!("\n✅ Analysis complete! {}", saved),
        RunOutcome::Partial => println!("\n⚠️  Analysis finished with failures. {}", saved),
        RunOutcome::Aborted => {
            if let Some(ref reason) = report.run.abort_reason {
                eprintln!("\n🛑 Run aborted: {}", reason);
            }
            println!("   {}", saved);
        }
    }

    Ok(final_exit_code(report.exit_code, written))
}

/// Exit code once the report has been attempted.
///
/// A failed run keeps its own code so the outcome stays visible. A clean
/// run without a report is a workspace error.
fn final_exit_code(run_code: i32, report_written: bool) -> i32 {
    if report_written || run_code != EXIT_SUCCESS {
        run_code
    } else {
        EXIT_CONFIG_ERROR
    }
}

/// Handle --dep-check: print every check, fail if any did not pass.
fn handle_dep_check(report: &PreflightReport) -> Result<i32> {
    println!("\n🔎 Dependency check\n");

    if report.checks.is_empty() {
        println!("   No external dependencies needed by the selected modules.");
    }
    for check in &report.checks {
        let mark = if check.ok { "✅" } else { "❌" };
        println!("   {} {}: {}", mark, check.name, check.detail);
        println!("      needed by: {}", check.needed_by.join(", "));
    }

    match report.failures().next() {
        Some(check) => Err(preflight_error(check).into()),
        None => {
            println!("\n✅ All dependencies available.");
            Ok(EXIT_SUCCESS)
        }
    }
}

fn preflight_error(check: &Check) -> OrchestratorError {
    OrchestratorError::Preflight(format!("{} unavailable: {}", check.name, check.detail))
}

/// Handle --list-modules: print every discovered module.
fn handle_list_modules(registry: &ModuleRegistry) {
    if registry.is_empty() {
        println!("No modules found.");
        return;
    }

    println!("Found {} module(s):\n", registry.len());
    for spec in registry.iter() {
        print_module(spec);
    }
}

fn print_module(spec: &ModuleSpec) {
    let d = &spec.descriptor;
    let mut flags = Vec::new();
    if d.critical {
        flags.push("critical");
    }
    if d.hints.exclusive_mount {
        flags.push("exclusive");
    }

    println!(
        "  {:<6} [{}] {:<9} {}{}",
        d.id,
        d.phase.letter(),
        d.backend.to_string(),
        d.name,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        }
    );
    if !d.depends_on.is_empty() {
        let deps: Vec<&str> = d.depends_on.iter().map(String::as_str).collect();
        println!("         requires: {}", deps.join(", "));
    }
    if !d.soft_depends_on.is_empty() {
        let deps: Vec<&str> = d.soft_depends_on.iter().map(String::as_str).collect();
        println!("         after:    {}", deps.join(", "));
    }
}

/// Handle --dry-run: print the resolved layers, exit.
fn handle_dry_run(graph: &ExecutionGraph) {
    println!("\n🔍 Dry run: execution plan (no modules run)...\n");

    if graph.is_empty() {
        println!("   No modules selected.");
    } else {
        for (index, layer) in graph.layers().iter().enumerate() {
            let modules: Vec<String> = layer
                .iter()
                .map(|id| match graph.descriptor(id) {
                    Some(d) => format!("{} [{}]", id, d.phase.letter()),
                    None => id.clone(),
                })
                .collect();
            println!("   Layer {:>2}: {}", index + 1, modules.join(", "));
        }
        println!("\n   Total: {} module(s)", graph.len());
    }

    println!("\n✅ Dry run complete. No modules were executed.");
}

/// Cancel `token` on the first Ctrl-C.
fn spawn_interrupt_handler(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    })
}

/// Poll the tracker and render a progress bar until `done` fires.
fn spawn_progress(
    tracker: Arc<RunStateTracker>,
    total: usize,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let mut interval = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Ok(states) = tracker.states() else {
                break;
            };
            let finished = states.values().filter(|s| s.is_terminal()).count();
            let running: Vec<&str> = states
                .iter()
                .filter(|(_, s)| matches!(s, ModuleState::Running | ModuleState::Retrying))
                .map(|(id, _)| id.as_str())
                .collect();

            pb.set_position(finished as u64);
            pb.set_message(running.join(", "));
        }

        pb.finish_and_clear();
    })
}
