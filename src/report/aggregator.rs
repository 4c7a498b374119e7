//! Run statistics for the report.

use crate::graph::ExecutionGraph;
use crate::models::{ModuleRecord, ModuleState, Phase, RunSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A failed module and everything that was skipped because of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRoot {
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    /// Transitive hard dependents that ended up skipped.
    pub skipped_dependents: Vec<String>,
}

/// Group module records by phase, in gate order.
pub fn group_by_phase(snapshot: &RunSnapshot) -> BTreeMap<Phase, Vec<&ModuleRecord>> {
    let mut grouped: BTreeMap<Phase, Vec<&ModuleRecord>> = BTreeMap::new();
    for record in snapshot.modules.values() {
        grouped.entry(record.phase).or_default().push(record);
    }
    grouped
}

/// Per-state counts within one group of records.
pub fn state_counts<'a>(records: impl IntoIterator<Item = &'a ModuleRecord>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.state.to_string()).or_default() += 1;
    }
    counts
}

/// The `n` modules with the longest wall time, slowest first.
pub fn slowest_modules(snapshot: &RunSnapshot, n: usize) -> Vec<(&ModuleRecord, f64)> {
    let mut timed: Vec<_> = snapshot
        .modules
        .values()
        .filter_map(|r| r.elapsed_secs.map(|secs| (r, secs)))
        .collect();

    timed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
    timed.truncate(n);
    timed
}

/// Failed modules with the skipped subtree hanging off each of them.
pub fn failure_roots(snapshot: &RunSnapshot, graph: &ExecutionGraph) -> Vec<FailureRoot> {
    snapshot
        .modules
        .values()
        .filter(|r| r.state == ModuleState::Failed)
        .map(|failed| {
            let mut skipped = BTreeSet::new();
            let mut queue: VecDeque<&str> = VecDeque::from([failed.id.as_str()]);

            while let Some(current) = queue.pop_front() {
                for dependent in graph.dependents(current) {
                    let hard = graph
                        .descriptor(dependent)
                        .is_some_and(|d| d.depends_on.contains(current));
                    if hard
                        && snapshot.state_of(dependent) == Some(ModuleState::Skipped)
                        && skipped.insert(dependent.to_string())
                    {
                        queue.push_back(dependent);
                    }
                }
            }

            FailureRoot {
                module: failed.id.clone(),
                error: failed.error.clone(),
                status_code: failed.status_code,
                skipped_dependents: skipped.into_iter().collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{native_fn, ModuleEntry, ModuleOutcome};
    use crate::models::{BackendKind, ModuleDescriptor, ResourceHints, RunStatus};
    use crate::registry::ModuleSpec;
    use std::time::Duration;

    fn spec(id: &str, phase: Phase, deps: &[&str]) -> ModuleSpec {
        ModuleSpec {
            descriptor: ModuleDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                phase,
                backend: BackendKind::Native,
                depends_on: deps.iter().map(|s| s.to_string()).collect(),
                soft_depends_on: Default::default(),
                hints: ResourceHints::default(),
                timeout: Duration::from_secs(1),
                critical: false,
            },
            entry: ModuleEntry::Native(native_fn(|_| async { Ok(ModuleOutcome::ok("")) })),
        }
    }

    fn record(id: &str, phase: Phase, state: ModuleState, secs: Option<f64>) -> ModuleRecord {
        let mut record = ModuleRecord::new(&spec(id, phase, &[]).descriptor);
        record.state = state;
        record.elapsed_secs = secs;
        record
    }

    fn snapshot(records: Vec<ModuleRecord>) -> RunSnapshot {
        RunSnapshot {
            status: RunStatus::Completed,
            abort_reason: None,
            started_at: None,
            finished_at: None,
            modules: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            admission_order: Vec::new(),
            peak_running: 0,
        }
    }

    #[test]
    fn test_group_by_phase() {
        let snap = snapshot(vec![
            record("S01", Phase::Static, ModuleState::Succeeded, Some(1.0)),
            record("P01", Phase::PreExtract, ModuleState::Succeeded, Some(1.0)),
            record("P02", Phase::PreExtract, ModuleState::Failed, Some(1.0)),
        ]);
        let grouped = group_by_phase(&snap);
        let phases: Vec<_> = grouped.keys().copied().collect();
        assert_eq!(phases, vec![Phase::PreExtract, Phase::Static]);
        assert_eq!(grouped[&Phase::PreExtract].len(), 2);

        let counts = state_counts(grouped[&Phase::PreExtract].iter().copied());
        assert_eq!(counts["succeeded"], 1);
        assert_eq!(counts["failed"], 1);
    }

    #[test]
    fn test_slowest_modules() {
        let snap = snapshot(vec![
            record("P01", Phase::PreExtract, ModuleState::Succeeded, Some(1.0)),
            record("P50", Phase::PreExtract, ModuleState::Succeeded, Some(90.0)),
            record("P55", Phase::PreExtract, ModuleState::Succeeded, Some(30.0)),
            record("S01", Phase::Static, ModuleState::Skipped, None),
        ]);
        let slowest = slowest_modules(&snap, 2);
        let ids: Vec<_> = slowest.iter().map(|(r, _)| r.id.as_str()).collect();
        assert_eq!(ids, vec!["P50", "P55"]);
    }

    #[test]
    fn test_failure_roots_follow_hard_edges() {
        let mut soft = spec("P03", Phase::PreExtract, &[]);
        soft.descriptor.soft_depends_on.insert("P50".to_string());
        let graph = ExecutionGraph::build(vec![
            spec("P02", Phase::PreExtract, &[]),
            spec("P50", Phase::PreExtract, &["P02"]),
            spec("P99", Phase::PreExtract, &["P50"]),
            soft,
            spec("S01", Phase::Static, &["P99"]),
        ])
        .unwrap();

        let mut failed = record("P50", Phase::PreExtract, ModuleState::Failed, Some(2.0));
        failed.status_code = Some(124);
        let snap = snapshot(vec![
            record("P02", Phase::PreExtract, ModuleState::Succeeded, Some(1.0)),
            failed,
            record("P99", Phase::PreExtract, ModuleState::Skipped, None),
            record("P03", Phase::PreExtract, ModuleState::Succeeded, Some(1.0)),
            record("S01", Phase::Static, ModuleState::Skipped, None),
        ]);

        let roots = failure_roots(&snap, &graph);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].module, "P50");
        assert_eq!(roots[0].status_code, Some(124));
        assert_eq!(roots[0].skipped_dependents, vec!["P99", "S01"]);
    }
}
