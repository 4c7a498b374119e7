//! Pre-run dependency checks.
//!
//! Native modules resolve against the built-in catalog when manifests are
//! loaded, so the only external dependency left is the container runtime.
//! It is asked once, and only when a selected module needs it.

use crate::backend::{ContainerEngine, RuntimeStatus};
use crate::graph::ExecutionGraph;
use crate::models::BackendKind;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for a single runtime check.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of one dependency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    /// A critical module depends on it.
    pub required: bool,
    pub detail: String,
    /// Modules that need this dependency.
    pub needed_by: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub checks: Vec<Check>,
}

impl PreflightReport {
    /// Every check passed.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    /// Failed checks that a critical module depends on.
    pub fn blocking(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.ok && c.required)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.ok)
    }
}

/// Check the dependencies of every module in `graph`.
pub async fn run_checks(
    graph: &ExecutionGraph,
    engine: &dyn ContainerEngine,
    timeout: Duration,
) -> PreflightReport {
    let containers: Vec<_> = graph
        .ids()
        .filter_map(|id| graph.descriptor(id))
        .filter(|d| d.backend == BackendKind::Container)
        .collect();

    let mut report = PreflightReport::default();
    if containers.is_empty() {
        debug!("No container modules selected, skipping runtime check");
        return report;
    }

    let status = match tokio::time::timeout(timeout, engine.check()).await {
        Ok(status) => status,
        Err(_) => RuntimeStatus::Unavailable {
            reason: format!("no answer within {}s", timeout.as_secs()),
            transient: true,
        },
    };

    let (ok, detail) = match status {
        RuntimeStatus::Ready(version) => (true, version),
        RuntimeStatus::Unavailable { reason, transient } => {
            warn!("Container runtime unavailable: {}", reason);
            let detail = if transient {
                format!("{} (may recover)", reason)
            } else {
                reason
            };
            (false, detail)
        }
    };

    report.checks.push(Check {
        name: "container runtime".to_string(),
        ok,
        required: containers.iter().any(|d| d.critical),
        detail,
        needed_by: containers.iter().map(|d| d.id.clone()).collect(),
    });
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::container::mock::MockEngine;
    use crate::backend::{native_fn, ContainerSpec, ModuleEntry, ModuleOutcome};
    use crate::models::{ModuleDescriptor, Phase, ResourceHints};
    use crate::registry::ModuleSpec;
    use std::collections::{BTreeMap, BTreeSet};

    fn spec(id: &str, backend: BackendKind, critical: bool) -> ModuleSpec {
        let entry = match backend {
            BackendKind::Native => {
                ModuleEntry::Native(native_fn(|_| async { Ok(ModuleOutcome::ok("")) }))
            }
            BackendKind::Container => ModuleEntry::Container(ContainerSpec {
                image: "firmorch/binwalk:latest".to_string(),
                command: Vec::new(),
                env: BTreeMap::new(),
                mounts: Vec::new(),
            }),
        };
        ModuleSpec {
            descriptor: ModuleDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                phase: Phase::PreExtract,
                backend,
                depends_on: BTreeSet::new(),
                soft_depends_on: BTreeSet::new(),
                hints: ResourceHints::default(),
                timeout: Duration::from_secs(10),
                critical,
            },
            entry,
        }
    }

    #[tokio::test]
    async fn test_native_only_skips_runtime() {
        let graph = ExecutionGraph::build(vec![spec("P02", BackendKind::Native, true)]).unwrap();
        let engine = MockEngine::default();

        let report = run_checks(&graph, &engine, CHECK_TIMEOUT).await;
        assert!(report.is_ok());
        assert!(report.checks.is_empty());
        assert_eq!(engine.checks(), 0);
    }

    #[tokio::test]
    async fn test_container_module_checks_runtime() {
        let graph = ExecutionGraph::build(vec![
            spec("P02", BackendKind::Native, true),
            spec("P50", BackendKind::Container, false),
            spec("P55", BackendKind::Container, false),
        ])
        .unwrap();
        let engine = MockEngine::default();

        let report = run_checks(&graph, &engine, CHECK_TIMEOUT).await;
        assert!(report.is_ok());
        assert_eq!(engine.checks(), 1);
        assert_eq!(report.checks[0].detail, "mock 1.0");
        assert_eq!(report.checks[0].needed_by, vec!["P50", "P55"]);
    }

    #[tokio::test]
    async fn test_unavailable_runtime() {
        let graph = ExecutionGraph::build(vec![spec("P50", BackendKind::Container, false)]).unwrap();
        let engine = MockEngine::default();
        engine.set_status(RuntimeStatus::Unavailable {
            reason: "docker: command not found".to_string(),
            transient: false,
        });

        let report = run_checks(&graph, &engine, CHECK_TIMEOUT).await;
        assert!(!report.is_ok());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.blocking().count(), 0);
        assert!(report.checks[0].detail.contains("command not found"));
    }

    #[tokio::test]
    async fn test_critical_container_module_blocks() {
        let graph = ExecutionGraph::build(vec![spec("P60", BackendKind::Container, true)]).unwrap();
        let engine = MockEngine::default();
        engine.set_status(RuntimeStatus::Unavailable {
            reason: "Cannot connect to the Docker daemon".to_string(),
            transient: true,
        });

        let report = run_checks(&graph, &engine, CHECK_TIMEOUT).await;
        let blocking: Vec<_> = report.blocking().collect();
        assert_eq!(blocking.len(), 1);
        assert!(blocking[0].detail.ends_with("(may recover)"));
    }
}
