//! Run report: the final snapshot plus metadata and derived statistics.

pub mod aggregator;
pub mod generator;

pub use aggregator::{failure_roots, group_by_phase, slowest_modules, state_counts, FailureRoot};
pub use generator::{generate_json_report, generate_markdown_report, write_report};

use crate::context::RunContext;
use crate::graph::ExecutionGraph;
use crate::models::{RunOutcome, RunSnapshot, RunSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Information about the run itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub run_id: String,
    pub firmware: String,
    pub firmware_size: u64,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub concurrency: usize,
    pub tool_version: String,
}

/// Everything rendered into the Markdown or JSON report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: ReportMetadata,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub summary: RunSummary,
    pub failure_roots: Vec<FailureRoot>,
    pub run: RunSnapshot,
}

impl RunReport {
    pub fn new(
        snapshot: RunSnapshot,
        graph: &ExecutionGraph,
        ctx: &RunContext,
        concurrency: usize,
    ) -> Self {
        let outcome = snapshot.outcome();
        Self {
            metadata: ReportMetadata {
                run_id: ctx.run_id().to_string(),
                firmware: ctx.firmware().display().to_string(),
                firmware_size: ctx.firmware_size(),
                generated_at: Utc::now(),
                duration_seconds: snapshot.duration_secs(),
                concurrency,
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            outcome,
            exit_code: outcome.exit_code(),
            summary: snapshot.summary(),
            failure_roots: failure_roots(&snapshot, graph),
            run: snapshot,
        }
    }
}
