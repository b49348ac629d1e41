// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::unit::UnitSpec;
use crate::errors::{BuilddagError, Result};
use crate::types::UnitId;

/// Internal node structure: the unit plus adjacency and its layer.
#[derive(Debug, Clone)]
struct GraphNode {
    spec: UnitSpec,
    /// Dependencies that are themselves units in this graph.
    internal_deps: Vec<UnitId>,
    /// Dependencies on ids this graph does not contain.
    external_deps: Vec<UnitId>,
    /// Units that list this one as a dependency.
    dependents: Vec<UnitId>,
    layer: usize,
}

/// Directed acyclic graph of units keyed by id.
///
/// Layers are informational: 0 for a unit with no in-graph dependencies,
/// otherwise one more than its deepest dependency. Scheduling never waits on
/// whole layers; the layer only breaks ties between equally ready units.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<UnitId, GraphNode>,
}

impl DependencyGraph {
    /// Build a graph from a flat list of units.
    ///
    /// Fails with [`BuilddagError::DuplicateUnit`] if an id appears twice and
    /// with [`BuilddagError::CycleDetected`] if any cycle (including a unit
    /// depending on itself) exists. The error names every unit on a cycle.
    pub fn build(units: Vec<UnitSpec>) -> Result<Self> {
        let mut nodes: BTreeMap<UnitId, GraphNode> = BTreeMap::new();

        for spec in units {
            if nodes.contains_key(&spec.id) {
                return Err(BuilddagError::DuplicateUnit(spec.id));
            }
            nodes.insert(
                spec.id.clone(),
                GraphNode {
                    spec,
                    internal_deps: Vec::new(),
                    external_deps: Vec::new(),
                    dependents: Vec::new(),
                    layer: 0,
                },
            );
        }

        // Split declared dependencies into in-graph and external ones, and
        // populate the reverse edges.
        let ids: Vec<UnitId> = nodes.keys().cloned().collect();
        for id in ids.iter() {
            let deps = nodes
                .get(id)
                .map(|n| n.spec.dependencies.clone())
                .unwrap_or_default();

            let (internal, external): (Vec<_>, Vec<_>) =
                deps.into_iter().partition(|d| nodes.contains_key(d));

            for dep in internal.iter() {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.push(id.clone());
                }
            }
            if let Some(node) = nodes.get_mut(id) {
                node.internal_deps = internal;
                node.external_deps = external;
            }
        }

        let order = topological_order(&nodes)?;

        // Layers in topological order: every dependency is assigned first.
        for id in order.iter() {
            let layer = nodes
                .get(id)
                .map(|n| {
                    n.internal_deps
                        .iter()
                        .filter_map(|d| nodes.get(d).map(|dn| dn.layer + 1))
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            if let Some(node) = nodes.get_mut(id) {
                node.layer = layer;
            }
        }

        debug!(units = nodes.len(), "dependency graph built");
        Ok(Self { nodes })
    }

    /// Return a new graph with `unit` added (or replaced), re-validating
    /// acyclicity. `self` is left untouched on error.
    pub fn with_unit(&self, unit: UnitSpec) -> Result<Self> {
        self.with_units(vec![unit])
    }

    /// Batch form of [`with_unit`](Self::with_unit): one rebuild for all of
    /// `units`.
    pub fn with_units(&self, units: Vec<UnitSpec>) -> Result<Self> {
        let replaced: BTreeSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
        let mut specs: Vec<UnitSpec> = self
            .nodes
            .values()
            .filter(|n| !replaced.contains(n.spec.id.as_str()))
            .map(|n| n.spec.clone())
            .collect();
        specs.extend(units);
        Self::build(specs)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All unit ids, in id order.
    pub fn unit_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    /// All unit specs, in id order.
    pub fn units(&self) -> impl Iterator<Item = &UnitSpec> {
        self.nodes.values().map(|n| &n.spec)
    }

    pub fn spec(&self, id: &str) -> Option<&UnitSpec> {
        self.nodes.get(id).map(|n| &n.spec)
    }

    pub fn layer(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|n| n.layer)
    }

    /// Every declared dependency of a unit, in-graph or external.
    pub fn dependencies_of(&self, id: &str) -> &[UnitId] {
        self.nodes
            .get(id)
            .map(|n| n.spec.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Declared dependencies that are not units of this graph.
    pub fn external_dependencies_of(&self, id: &str) -> &[UnitId] {
        self.nodes
            .get(id)
            .map(|n| n.external_deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a unit.
    pub fn dependents_of(&self, id: &str) -> &[UnitId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every unit that depends on `id`, directly or through other units.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<UnitId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents_of(id).iter().map(|s| s.as_str()).collect();

        while let Some(name) = stack.pop() {
            if seen.insert(name.to_string()) {
                stack.extend(self.dependents_of(name).iter().map(|s| s.as_str()));
            }
        }

        seen
    }

    /// Units with no in-graph dependencies.
    pub fn roots(&self) -> Vec<UnitId> {
        self.nodes
            .values()
            .filter(|n| n.internal_deps.is_empty())
            .map(|n| n.spec.id.clone())
            .collect()
    }

    /// Unit ids grouped by layer (diagnostics and dry-run output).
    pub fn ids_by_layer(&self) -> BTreeMap<usize, Vec<UnitId>> {
        let mut layers: BTreeMap<usize, Vec<UnitId>> = BTreeMap::new();
        for node in self.nodes.values() {
            layers
                .entry(node.layer)
                .or_default()
                .push(node.spec.id.clone());
        }
        layers
    }
}

/// Topologically sort the in-graph edges, reporting every cycle member on
/// failure.
fn topological_order(nodes: &BTreeMap<UnitId, GraphNode>) -> Result<Vec<UnitId>> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in nodes.keys() {
        graph.add_node(id.as_str());
    }
    for (id, node) in nodes.iter() {
        for dep in node.internal_deps.iter() {
            graph.add_edge(dep.as_str(), id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(_) => {
            let mut members: BTreeSet<String> = BTreeSet::new();
            for component in tarjan_scc(&graph) {
                let is_cycle = component.len() > 1
                    || component
                        .first()
                        .map(|n| graph.contains_edge(*n, *n))
                        .unwrap_or(false);
                if is_cycle {
                    members.extend(component.into_iter().map(str::to_string));
                }
            }
            Err(BuilddagError::CycleDetected {
                members: members.into_iter().collect(),
            })
        }
    }
}
