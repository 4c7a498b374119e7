//! Module descriptor registry.
//!
//! Holds every known module keyed by identifier. Modules come from
//! manifests on disk or are registered programmatically; either way the
//! identifier must be unique. Once a run selects its module set the
//! registry is no longer mutated.

pub mod manifest;

pub use manifest::{discover, parse_manifest, parse_phase};

use crate::backend::{ModuleEntry, NativeCatalog};
use crate::config::ModuleOverride;
use crate::error::DescriptorError;
use crate::models::{ModuleDescriptor, Phase};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// A descriptor paired with its executable entry.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub descriptor: ModuleDescriptor,
    pub entry: ModuleEntry,
}

impl ModuleSpec {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Registry of discovered modules.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleSpec>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. Identifiers must be unique.
    pub fn register(&mut self, spec: ModuleSpec) -> Result<(), DescriptorError> {
        if self.modules.contains_key(spec.id()) {
            return Err(DescriptorError::Duplicate(spec.descriptor.id));
        }
        self.modules.insert(spec.descriptor.id.clone(), spec);
        Ok(())
    }

    /// Discover manifests in `source` and register all of them.
    pub fn load_dir(
        &mut self,
        source: &Path,
        catalog: &NativeCatalog,
        default_timeout: Duration,
    ) -> Result<usize, DescriptorError> {
        let specs = discover(source, catalog, default_timeout)?;
        let count = specs.len();
        for spec in specs {
            self.register(spec)?;
        }
        info!("Loaded {} module(s) from {}", count, source.display());
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.get(id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// All modules, ordered by identifier.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleSpec> {
        self.modules.values()
    }

    /// Apply per-module timeout and criticality overrides.
    ///
    /// Returns identifiers that matched no registered module.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, ModuleOverride>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (id, o) in overrides {
            let Some(spec) = self.modules.get_mut(id) else {
                debug!("Override for unknown module {}", id);
                unknown.push(id.clone());
                continue;
            };
            if let Some(secs) = o.timeout_secs {
                spec.descriptor.timeout = Duration::from_secs(secs);
            }
            if let Some(critical) = o.critical {
                spec.descriptor.critical = critical;
            }
        }
        unknown
    }

    /// Module set for one run.
    ///
    /// An empty `enabled` list selects everything. `disabled` always wins.
    /// Live-emulation modules are dropped unless `include_live` is set.
    ///
    /// Soft dependencies on modules outside the selection are removed, since
    /// they only order work that will not run. Hard dependencies are kept so
    /// the graph reports them as unresolved.
    pub fn filtered(&self, enabled: &[String], disabled: &[String], include_live: bool) -> Vec<ModuleSpec> {
        let mut selected: Vec<ModuleSpec> = self
            .modules
            .values()
            .filter(|spec| enabled.is_empty() || enabled.iter().any(|id| id == spec.id()))
            .filter(|spec| !disabled.iter().any(|id| id == spec.id()))
            .filter(|spec| include_live || spec.descriptor.phase != Phase::Live)
            .cloned()
            .collect();

        let ids: BTreeSet<String> = selected.iter().map(|s| s.id().to_string()).collect();
        for spec in &mut selected {
            let d = &mut spec.descriptor;
            d.soft_depends_on.retain(|dep| {
                let keep = ids.contains(dep);
                if !keep {
                    debug!(module = %d.id, "Dropping soft dependency on deselected {}", dep);
                }
                keep
            });
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{native_fn, ModuleOutcome};
    use crate::error::GraphError;
    use crate::graph::ExecutionGraph;
    use crate::models::{BackendKind, ResourceHints};

    fn spec(id: &str, phase: Phase) -> ModuleSpec {
        ModuleSpec {
            descriptor: ModuleDescriptor {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                phase,
                backend: BackendKind::Native,
                depends_on: BTreeSet::new(),
                soft_depends_on: BTreeSet::new(),
                hints: ResourceHints::default(),
                timeout: Duration::from_secs(10),
                critical: false,
            },
            entry: ModuleEntry::Native(native_fn(|_| async { Ok(ModuleOutcome::ok("")) })),
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ModuleRegistry::new();
        registry.register(spec("P01", Phase::PreExtract)).unwrap();
        let err = registry.register(spec("P01", Phase::Static)).unwrap_err();
        assert!(matches!(err, DescriptorError::Duplicate(ref id) if id == "P01"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("P01").unwrap().descriptor.phase, Phase::PreExtract);
    }

    #[test]
    fn test_filtered_selection() {
        let mut registry = ModuleRegistry::new();
        for (id, phase) in [
            ("P01", Phase::PreExtract),
            ("P60", Phase::PreExtract),
            ("S01", Phase::Static),
            ("L10", Phase::Live),
        ] {
            registry.register(spec(id, phase)).unwrap();
        }

        let ids = |specs: Vec<ModuleSpec>| -> Vec<String> {
            specs.into_iter().map(|s| s.descriptor.id).collect()
        };

        assert_eq!(ids(registry.filtered(&[], &[], false)), vec!["P01", "P60", "S01"]);
        assert_eq!(ids(registry.filtered(&[], &[], true)).len(), 4);
        assert_eq!(
            ids(registry.filtered(&[], &["P60".to_string()], false)),
            vec!["P01", "S01"]
        );
        assert_eq!(
            ids(registry.filtered(
                &["P01".to_string(), "P60".to_string()],
                &["P60".to_string()],
                false
            )),
            vec!["P01"]
        );
    }

    #[test]
    fn test_apply_overrides() {
        let mut registry = ModuleRegistry::new();
        registry.register(spec("P50", Phase::PreExtract)).unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "P50".to_string(),
            ModuleOverride {
                timeout_secs: Some(600),
                critical: Some(true),
            },
        );
        overrides.insert("X99".to_string(), ModuleOverride::default());

        let unknown = registry.apply_overrides(&overrides);
        assert_eq!(unknown, vec!["X99"]);
        let d = &registry.get("P50").unwrap().descriptor;
        assert_eq!(d.timeout, Duration::from_secs(600));
        assert!(d.critical);
    }

    #[test]
    fn test_shipped_modules_resolve() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("modules");
        let mut registry = ModuleRegistry::new();
        let count = registry
            .load_dir(&dir, &crate::builtin::catalog(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(count, registry.len());
        assert!(registry.get("P02").unwrap().descriptor.critical);

        let graph = ExecutionGraph::build(registry.filtered(&[], &[], false)).unwrap();
        let order = graph.order();
        let pos = |id: &str| order.iter().position(|m| *m == id).unwrap();
        assert!(pos("P02") < pos("P50"));
        assert!(pos("P50") < pos("P60"));
        assert!(pos("P99") < pos("S09"));
    }

    #[test]
    fn test_deselected_soft_dependency_dropped() {
        let mut registry = ModuleRegistry::new();
        registry.register(spec("P02", Phase::PreExtract)).unwrap();
        registry.register(spec("P60", Phase::PreExtract)).unwrap();
        let mut p99 = spec("P99", Phase::PreExtract);
        p99.descriptor.depends_on.insert("P02".to_string());
        p99.descriptor.soft_depends_on.insert("P60".to_string());
        registry.register(p99).unwrap();
        let mut s20 = spec("S20", Phase::Static);
        s20.descriptor.soft_depends_on.insert("L10".to_string());
        registry.register(s20).unwrap();
        registry.register(spec("L10", Phase::Live)).unwrap();

        let selected = registry.filtered(&[], &["P60".to_string()], false);
        let p99 = selected.iter().find(|s| s.id() == "P99").unwrap();
        assert!(p99.descriptor.soft_depends_on.is_empty());
        assert!(p99.descriptor.depends_on.contains("P02"));
        let s20 = selected.iter().find(|s| s.id() == "S20").unwrap();
        assert!(s20.descriptor.soft_depends_on.is_empty());

        // The registry itself keeps the declared edges.
        assert!(registry.get("P99").unwrap().descriptor.soft_depends_on.contains("P60"));
        assert!(ExecutionGraph::build(selected).is_ok());
    }

    #[test]
    fn test_deselected_hard_dependency_unresolved() {
        let mut registry = ModuleRegistry::new();
        registry.register(spec("P50", Phase::PreExtract)).unwrap();
        let mut p60 = spec("P60", Phase::PreExtract);
        p60.descriptor.depends_on.insert("P50".to_string());
        registry.register(p60).unwrap();

        let selected = registry.filtered(&[], &["P50".to_string()], false);
        let err = ExecutionGraph::build(selected).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Unresolved { ref module, ref dependency } if module == "P60" && dependency == "P50"
        ));
    }

    #[test]
    fn test_shipped_modules_without_deep_extractor() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("modules");
        let mut registry = ModuleRegistry::new();
        registry
            .load_dir(&dir, &crate::builtin::catalog(), Duration::from_secs(60))
            .unwrap();

        let graph = ExecutionGraph::build(registry.filtered(&[], &["P60".to_string()], false))
            .unwrap();
        assert!(graph.descriptor("P60").is_none());
        assert!(!graph.descriptor("P99").unwrap().soft_depends_on.contains("P60"));
    }
}
