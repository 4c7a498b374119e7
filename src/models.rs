//! Data models for the orchestration core.
//!
//! This module contains the descriptors, states and result records shared
//! by the registry, resolver, scheduler and report generators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Pipeline phase of a module.
///
/// Declaration order is gate order: no module of a phase is admitted before
/// every module of all earlier phases has reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Pre-checking and extraction (P-modules)
    PreExtract,
    /// Static security analysis (S-modules)
    Static,
    /// Live emulation (L-modules)
    Live,
    /// AI-assisted analysis (Q-modules)
    Ai,
    /// Differential analysis (D-modules)
    Diff,
    /// Final reporting (F-modules)
    Report,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::PreExtract,
        Phase::Static,
        Phase::Live,
        Phase::Ai,
        Phase::Diff,
        Phase::Report,
    ];

    /// Single-letter module prefix used by the pipeline's naming scheme.
    pub fn letter(&self) -> char {
        match self {
            Phase::PreExtract => 'P',
            Phase::Static => 'S',
            Phase::Live => 'L',
            Phase::Ai => 'Q',
            Phase::Diff => 'D',
            Phase::Report => 'F',
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::PreExtract => write!(f, "Pre-extraction"),
            Phase::Static => write!(f, "Static analysis"),
            Phase::Live => write!(f, "Live emulation"),
            Phase::Ai => write!(f, "AI analysis"),
            Phase::Diff => write!(f, "Differential analysis"),
            Phase::Report => write!(f, "Final reporting"),
        }
    }
}

/// How a module is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Native,
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => write!(f, "native"),
            BackendKind::Container => write!(f, "container"),
        }
    }
}

/// Declared resource requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    /// Module mutates extracted content and must not overlap with other
    /// exclusive modules.
    #[serde(default)]
    pub exclusive_mount: bool,
}

/// Immutable metadata describing one analysis module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub phase: Phase,
    pub backend: BackendKind,
    /// Hard dependencies: must succeed before this module runs.
    pub depends_on: BTreeSet<String>,
    /// Soft dependencies: must be terminal, any outcome.
    pub soft_depends_on: BTreeSet<String>,
    pub hints: ResourceHints,
    pub timeout: Duration,
    /// Failure after exhausting retries aborts the whole run.
    pub critical: bool,
}

impl ModuleDescriptor {
    /// Hard and soft dependencies together.
    pub fn all_dependencies(&self) -> impl Iterator<Item = &String> {
        self.depends_on.iter().chain(self.soft_depends_on.iter())
    }
}

/// Per-module lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl ModuleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ModuleState::Succeeded | ModuleState::Failed | ModuleState::Skipped
        )
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            ModuleState::Pending | ModuleState::Ready => "⏳",
            ModuleState::Running | ModuleState::Retrying => "🔄",
            ModuleState::Succeeded => "✅",
            ModuleState::Failed => "❌",
            ModuleState::Skipped => "⏭️",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Pending => write!(f, "pending"),
            ModuleState::Ready => write!(f, "ready"),
            ModuleState::Running => write!(f, "running"),
            ModuleState::Retrying => write!(f, "retrying"),
            ModuleState::Succeeded => write!(f, "succeeded"),
            ModuleState::Failed => write!(f, "failed"),
            ModuleState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Structured status code (0 on success).
    pub status: i32,
    /// Opaque artifact reference handed to reporting collaborators.
    pub artifact: PathBuf,
    /// Captured module output, if any was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_log: Option<PathBuf>,
    /// One-line summary produced by the module.
    #[serde(default)]
    pub summary: String,
}

/// One attempt at running a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
    /// "succeeded" or an error kind such as "timeout".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// Everything the tracker knows about one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: String,
    pub phase: Phase,
    pub backend: BackendKind,
    pub state: ModuleState,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    /// Wall time from first admission to terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
}

impl ModuleRecord {
    pub fn new(descriptor: &ModuleDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            phase: descriptor.phase,
            backend: descriptor.backend,
            state: ModuleState::Pending,
            attempts: Vec::new(),
            result: None,
            error: None,
            status_code: None,
            elapsed_secs: None,
        }
    }
}

/// Run-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Init,
    Running,
    Completed,
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Init => write!(f, "init"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Point-in-time copy of the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub modules: BTreeMap<String, ModuleRecord>,
    /// Module identifiers in the order they were first admitted to a worker.
    pub admission_order: Vec<String>,
    /// Highest number of modules observed running at the same time.
    pub peak_running: usize,
}

impl RunSnapshot {
    pub fn state_of(&self, id: &str) -> Option<ModuleState> {
        self.modules.get(id).map(|r| r.state)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::from_records(self.modules.values())
    }

    /// Final classification for the exit code.
    pub fn outcome(&self) -> RunOutcome {
        if self.status == RunStatus::Aborted {
            return RunOutcome::Aborted;
        }
        let summary = self.summary();
        if summary.succeeded == summary.total {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Partial
        }
    }

    /// Run duration in seconds, if started and finished.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

/// Final classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every module succeeded.
    Succeeded,
    /// The run completed but some modules failed or were skipped.
    Partial,
    /// The run was aborted by policy or by the operator.
    Aborted,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Succeeded => crate::EXIT_SUCCESS,
            RunOutcome::Partial => crate::EXIT_PARTIAL,
            RunOutcome::Aborted => crate::EXIT_ABORTED,
        }
    }
}

/// Counts by state plus timing statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Modules not yet terminal.
    pub unfinished: usize,
    /// Attempts beyond the first, across all modules.
    pub retries: usize,
    pub total_module_secs: f64,
    pub average_module_secs: f64,
}

impl RunSummary {
    pub fn from_records<'a>(records: impl Iterator<Item = &'a ModuleRecord>) -> Self {
        let mut summary = Self::default();
        let mut timed = 0usize;

        for record in records {
            summary.total += 1;
            match record.state {
                ModuleState::Succeeded => summary.succeeded += 1,
                ModuleState::Failed => summary.failed += 1,
                ModuleState::Skipped => summary.skipped += 1,
                _ => summary.unfinished += 1,
            }
            summary.retries += record.attempts.len().saturating_sub(1);
            if let Some(secs) = record.elapsed_secs {
                summary.total_module_secs += secs;
                timed += 1;
            }
        }

        if timed > 0 {
            summary.average_module_secs = summary.total_module_secs / timed as f64;
        }
        summary
    }
}

/// Format a duration as `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_runtime(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, state: ModuleState, attempts: usize, secs: Option<f64>) -> ModuleRecord {
        ModuleRecord {
            id: id.to_string(),
            phase: Phase::PreExtract,
            backend: BackendKind::Native,
            state,
            attempts: (0..attempts)
                .map(|i| AttemptRecord {
                    number: i as u32 + 1,
                    started_at: Utc::now(),
                    elapsed_secs: None,
                    outcome: None,
                })
                .collect(),
            result: None,
            error: None,
            status_code: None,
            elapsed_secs: secs,
        }
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::PreExtract < Phase::Static);
        assert!(Phase::Static < Phase::Live);
        assert!(Phase::Diff < Phase::Report);
        assert_eq!(Phase::Report.letter(), 'F');
        assert_eq!(Phase::Ai.letter(), 'Q');
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let all = [
            ModuleState::Pending,
            ModuleState::Ready,
            ModuleState::Running,
            ModuleState::Retrying,
            ModuleState::Succeeded,
            ModuleState::Failed,
            ModuleState::Skipped,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in &all {
                assert!(!from.can_transition_to(*to), "{} -> {}", from, to);
            }
        }
        assert!(ModuleState::Running.can_transition_to(ModuleState::Retrying));
        assert!(!ModuleState::Pending.can_transition_to(ModuleState::Running));
    }

    #[test]
    fn test_run_summary() {
        let records = vec![
            record("P01", ModuleState::Succeeded, 1, Some(2.0)),
            record("P02", ModuleState::Failed, 3, Some(4.0)),
            record("P03", ModuleState::Skipped, 0, None),
            record("P04", ModuleState::Running, 1, None),
        ];

        let summary = RunSummary::from_records(records.iter());
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.unfinished, 1);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.total_module_secs, 6.0);
        assert_eq!(summary.average_module_secs, 3.0);
    }

    #[test]
    fn test_outcome_distinguishes_partial() {
        let mut snapshot = RunSnapshot {
            status: RunStatus::Completed,
            abort_reason: None,
            started_at: None,
            finished_at: None,
            modules: BTreeMap::new(),
            admission_order: Vec::new(),
            peak_running: 0,
        };
        snapshot
            .modules
            .insert("P01".into(), record("P01", ModuleState::Succeeded, 1, None));
        assert_eq!(snapshot.outcome(), RunOutcome::Succeeded);

        snapshot
            .modules
            .insert("P02".into(), record("P02", ModuleState::Skipped, 0, None));
        assert_eq!(snapshot.outcome(), RunOutcome::Partial);

        snapshot.status = RunStatus::Aborted;
        assert_eq!(snapshot.outcome(), RunOutcome::Aborted);
        assert_eq!(snapshot.outcome().exit_code(), 2);
    }

    #[test]
    fn test_format_runtime() {
        assert_eq!(format_runtime(3.9), "3s");
        assert_eq!(format_runtime(125.0), "2m 5s");
        assert_eq!(format_runtime(3723.0), "1h 2m 3s");
    }
}
