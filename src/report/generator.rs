//! Markdown and JSON report generation.
//!
//! The Markdown report groups modules by phase, lists the slowest modules
//! and traces every failure to the modules it caused to be skipped.

use super::{
    group_by_phase, slowest_modules, state_counts, FailureRoot, ReportMetadata, RunReport,
};
use crate::cli::OutputFormat;
use crate::models::{format_runtime, ModuleRecord, ModuleState, RunOutcome, RunSummary};
use anyhow::{Context, Result};
use std::path::Path;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("# firmorch Run Report\n\n");
    output.push_str(&generate_metadata_section(&report.metadata, report.outcome));

    if let Some(ref reason) = report.run.abort_reason {
        output.push_str(&format!("> 🛑 **Run aborted:** {}\n\n", reason));
    }

    output.push_str(&generate_summary_section(&report.summary));
    output.push_str(&generate_phases_section(report));
    output.push_str(&generate_slowest_section(report));
    output.push_str(&generate_failures_section(&report.failure_roots));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata, outcome: RunOutcome) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Firmware:** `{}`\n", metadata.firmware));
    section.push_str(&format!("- **Firmware Size:** {} bytes\n", metadata.firmware_size));
    section.push_str(&format!("- **Run ID:** `{}`\n", metadata.run_id));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(secs) = metadata.duration_seconds {
        section.push_str(&format!("- **Run Duration:** {}\n", format_runtime(secs)));
    }
    section.push_str(&format!("- **Concurrency:** {}\n", metadata.concurrency));
    section.push_str(&format!("- **Outcome:** {}\n", outcome_label(outcome)));
    section.push('\n');

    section
}

fn outcome_label(outcome: RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Succeeded => "✅ all modules succeeded",
        RunOutcome::Partial => "⚠️ partial failure",
        RunOutcome::Aborted => "🛑 aborted",
    }
}

/// Generate the summary section.
fn generate_summary_section(summary: &RunSummary) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str(&format!(
        "| {} Succeeded | {} Failed | {} Skipped | **Total** |\n",
        ModuleState::Succeeded.emoji(),
        ModuleState::Failed.emoji(),
        ModuleState::Skipped.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | **{}** |\n\n",
        summary.succeeded, summary.failed, summary.skipped, summary.total
    ));

    if summary.retries > 0 {
        section.push_str(&format!("- **Retries:** {}\n", summary.retries));
    }
    section.push_str(&format!(
        "- **Total Module Time:** {}\n",
        format_runtime(summary.total_module_secs)
    ));
    section.push_str(&format!(
        "- **Average Module Time:** {:.1}s\n\n",
        summary.average_module_secs
    ));

    section
}

/// One table per phase, in gate order.
fn generate_phases_section(report: &RunReport) -> String {
    let mut section = String::new();

    section.push_str("## Modules by Phase\n\n");

    let grouped = group_by_phase(&report.run);
    if grouped.is_empty() {
        section.push_str("No modules were selected for this run.\n\n");
        return section;
    }

    for (phase, records) in grouped {
        section.push_str(&format!("### {} ({})\n\n", phase, phase.letter()));
        let counts: Vec<String> = state_counts(records.iter().copied())
            .into_iter()
            .map(|(state, n)| format!("{} {}", n, state))
            .collect();
        section.push_str(&format!("{}\n\n", counts.join(", ")));
        section.push_str("| Module | State | Backend | Attempts | Time | Result |\n");
        section.push_str("|:---|:---|:---|:---:|:---:|:---|\n");
        for record in records {
            section.push_str(&generate_module_row(record));
        }
        section.push('\n');
    }

    section
}

fn generate_module_row(record: &ModuleRecord) -> String {
    let time = record
        .elapsed_secs
        .map(|s| format!("{:.1}s", s))
        .unwrap_or_else(|| "-".to_string());

    let detail = match (&record.result, &record.error) {
        (Some(result), _) => result.summary.clone(),
        (None, Some(error)) => error.clone(),
        (None, None) => String::new(),
    };

    format!(
        "| `{}` | {} {} | {} | {} | {} | {} |\n",
        record.id,
        record.state.emoji(),
        record.state,
        record.backend,
        record.attempts.len(),
        time,
        detail.replace('|', "\\|")
    )
}

/// Generate the slowest modules section.
fn generate_slowest_section(report: &RunReport) -> String {
    let slowest = slowest_modules(&report.run, 5);
    if slowest.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Slowest Modules\n\n");
    section.push_str("| Module | Phase | Time |\n");
    section.push_str("|:---|:---|:---:|\n");
    for (record, secs) in slowest {
        section.push_str(&format!(
            "| `{}` | {} | {} |\n",
            record.id,
            record.phase,
            format_runtime(secs)
        ));
    }
    section.push('\n');

    section
}

/// Generate the failures section.
fn generate_failures_section(roots: &[FailureRoot]) -> String {
    if roots.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Failures\n\n");
    for root in roots {
        section.push_str(&format!("### ❌ `{}`\n\n", root.module));
        if let Some(ref error) = root.error {
            section.push_str(&format!("**Error:** {}\n\n", error));
        }
        if let Some(code) = root.status_code {
            section.push_str(&format!("**Status code:** {}\n\n", code));
        }
        if !root.skipped_dependents.is_empty() {
            let skipped: Vec<String> = root
                .skipped_dependents
                .iter()
                .map(|id| format!("`{}`", id))
                .collect();
            section.push_str(&format!("> ⏭️ **Skipped as a result:** {}\n\n", skipped.join(", ")));
        }
    }

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    "---\n\n*Report generated by firmorch*\n".to_string()
}

/// Generate a JSON report.
pub fn generate_json_report(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Render the report in `format` and write it to `path`.
pub fn write_report(report: &RunReport, format: OutputFormat, path: &Path) -> Result<()> {
    let content = match format {
        OutputFormat::Markdown => generate_markdown_report(report),
        OutputFormat::Json => generate_json_report(report)?,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;

    Ok(())
}
