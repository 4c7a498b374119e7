//! Dependency graph resolver.
//!
//! Builds the execution DAG from declared hard and soft dependencies, with
//! phase as an implicit coarse dependency: every module of an earlier phase
//! precedes every module of a later one.

use crate::error::GraphError;
use crate::models::{ModuleDescriptor, Phase};
use crate::registry::ModuleSpec;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Validated, acyclic module graph with its topological layers.
#[derive(Debug)]
pub struct ExecutionGraph {
    nodes: BTreeMap<String, ModuleSpec>,
    /// Reverse edges: module -> modules that depend on it.
    dependents: BTreeMap<String, BTreeSet<String>>,
    layers: Vec<Vec<String>>,
    layer_of: HashMap<String, usize>,
}

impl ExecutionGraph {
    /// Validate edges, reject cycles and compute layers.
    pub fn build(specs: Vec<ModuleSpec>) -> Result<Self, GraphError> {
        let nodes: BTreeMap<String, ModuleSpec> = specs
            .into_iter()
            .map(|spec| (spec.descriptor.id.clone(), spec))
            .collect();

        let mut dependents: BTreeMap<String, BTreeSet<String>> =
            nodes.keys().map(|id| (id.clone(), BTreeSet::new())).collect();

        for (id, spec) in &nodes {
            let d = &spec.descriptor;
            for dep in d.all_dependencies() {
                if dep == id {
                    return Err(GraphError::SelfDependency(id.clone()));
                }
                let Some(target) = nodes.get(dep) else {
                    return Err(GraphError::Unresolved {
                        module: id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if target.descriptor.phase > d.phase {
                    return Err(GraphError::PhaseInversion {
                        module: id.clone(),
                        module_phase: d.phase,
                        dependency: dep.clone(),
                        dependency_phase: target.descriptor.phase,
                    });
                }
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(id.clone());
                }
            }
        }

        if let Some(path) = find_cycle(&nodes) {
            return Err(GraphError::Cyclic { path });
        }

        let layers = compute_layers(&nodes, &dependents)?;
        let layer_of = layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| layer.iter().map(move |id| (id.clone(), i)))
            .collect();

        Ok(Self {
            nodes,
            dependents,
            layers,
            layer_of,
        })
    }

    /// Topological layers. Modules within a layer are sorted by identifier.
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// Flattened topological order.
    pub fn order(&self) -> Vec<&str> {
        self.layers
            .iter()
            .flat_map(|layer| layer.iter().map(String::as_str))
            .collect()
    }

    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layer_of.get(id).copied()
    }

    /// Modules that declare `id` as a hard or soft dependency.
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(id)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn descriptor(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.nodes.get(id).map(|spec| &spec.descriptor)
    }

    pub fn spec(&self, id: &str) -> Option<&ModuleSpec> {
        self.nodes.get(id)
    }

    /// Identifiers of every module in a phase before `phase`.
    pub fn earlier_phase_modules(&self, phase: Phase) -> impl Iterator<Item = &str> {
        self.nodes
            .values()
            .filter(move |spec| spec.descriptor.phase < phase)
            .map(|spec| spec.descriptor.id.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Depth-first search with a recursion stack. Returns the first cycle found
/// as a path whose first and last elements are the same module.
fn find_cycle(nodes: &BTreeMap<String, ModuleSpec>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = nodes.keys().map(|id| (id.as_str(), Mark::Unvisited)).collect();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        nodes: &'a BTreeMap<String, ModuleSpec>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::OnStack);
        stack.push(id);

        if let Some(spec) = nodes.get(id) {
            let mut deps: Vec<&String> = spec.descriptor.all_dependencies().collect();
            deps.sort();
            for dep in deps {
                match marks.get(dep.as_str()).copied() {
                    Some(Mark::OnStack) => {
                        let start = stack.iter().position(|s| *s == dep.as_str()).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.clone());
                        return Some(path);
                    }
                    Some(Mark::Unvisited) => {
                        if let Some(path) = visit(dep.as_str(), nodes, marks, stack) {
                            return Some(path);
                        }
                    }
                    _ => {}
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
        None
    }

    for id in nodes.keys() {
        if marks.get(id.as_str()) == Some(&Mark::Unvisited) {
            if let Some(path) = visit(id.as_str(), nodes, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

/// Kahn's algorithm, one phase at a time.
fn compute_layers(
    nodes: &BTreeMap<String, ModuleSpec>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Vec<String>>, GraphError> {
    let mut in_degree: HashMap<&str, usize> = nodes
        .iter()
        .map(|(id, spec)| (id.as_str(), spec.descriptor.all_dependencies().count()))
        .collect();

    let mut layers = Vec::new();
    for phase in Phase::ALL {
        let mut remaining: BTreeSet<&str> = nodes
            .values()
            .filter(|spec| spec.descriptor.phase == phase)
            .map(|spec| spec.descriptor.id.as_str())
            .collect();

        while !remaining.is_empty() {
            let layer: Vec<String> = remaining
                .iter()
                .filter(|id| in_degree.get(*id) == Some(&0))
                .map(|id| id.to_string())
                .collect();

            if layer.is_empty() {
                // Unreachable after find_cycle; kept so a bug cannot loop forever.
                return Err(GraphError::Cyclic {
                    path: remaining.iter().map(|s| s.to_string()).collect(),
                });
            }

            for id in &layer {
                remaining.remove(id.as_str());
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(n) = in_degree.get_mut(dependent.as_str()) {
                        *n = n.saturating_sub(1);
                    }
                }
            }
            layers.push(layer);
        }
    }
    Ok(layers)
}
