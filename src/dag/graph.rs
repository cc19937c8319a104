// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet};

use crate::manifest::Manifest;
use crate::types::ServiceId;

/// Immediate neighbours of one service.
#[derive(Debug, Clone, Default)]
struct DagNode {
    /// Services this one depends on.
    deps: Vec<ServiceId>,
    /// Services that depend on this one.
    dependents: Vec<ServiceId>,
}

/// Adjacency view of `depends_on`, keyed by service id.
///
/// Acyclicity and reference validity are established by manifest
/// validation; this type only answers reachability and ordering questions.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ServiceId, DagNode>,
}

impl DependencyGraph {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self::from_edges(
            manifest
                .services()
                .map(|def| (def.id.clone(), def.depends_on.iter().cloned().collect())),
        )
    }

    /// Build from `(service, dependencies)` pairs. Dependencies that are not
    /// themselves listed are ignored.
    pub fn from_edges(edges: impl IntoIterator<Item = (ServiceId, Vec<ServiceId>)>) -> Self {
        let mut nodes: BTreeMap<ServiceId, DagNode> = edges
            .into_iter()
            .map(|(id, deps)| {
                (
                    id,
                    DagNode {
                        deps,
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        let pairs: Vec<(ServiceId, ServiceId)> = nodes
            .iter()
            .flat_map(|(id, node)| node.deps.iter().map(move |dep| (dep.clone(), id.clone())))
            .collect();

        for (dep, dependent) in pairs {
            if let Some(node) = nodes.get_mut(&dep) {
                node.dependents.push(dependent);
            }
        }
        let known: BTreeSet<ServiceId> = nodes.keys().cloned().collect();
        for node in nodes.values_mut() {
            node.deps.retain(|d| known.contains(d));
            node.deps.sort();
            node.deps.dedup();
            node.dependents.sort();
            node.dependents.dedup();
        }

        Self { nodes }
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn dependencies_of(&self, id: &str) -> &[ServiceId] {
        self.nodes.get(id).map(|n| n.deps.as_slice()).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[ServiceId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every service that (directly or indirectly) depends on `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<ServiceId> {
        self.walk(id, |n| &n.dependents)
    }

    /// Every service `id` (directly or indirectly) depends on.
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<ServiceId> {
        self.walk(id, |n| &n.deps)
    }

    /// `ids` plus all of their transitive dependencies.
    pub fn with_dependencies<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<ServiceId> {
        let mut out = BTreeSet::new();
        for id in ids {
            if self.contains(id) {
                out.insert(id.to_string());
                out.extend(self.transitive_dependencies(id));
            }
        }
        out
    }

    /// `ids` plus all of their transitive dependents.
    pub fn with_dependents<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<ServiceId> {
        let mut out = BTreeSet::new();
        for id in ids {
            if self.contains(id) {
                out.insert(id.to_string());
                out.extend(self.transitive_dependents(id));
            }
        }
        out
    }

    /// Dependencies first; ties broken by id so the order is stable.
    pub fn start_order(&self) -> Vec<ServiceId> {
        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id.as_str(), n.deps.len()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_first() {
            remaining.remove(id);
            order.push(id.to_string());
            for dependent in self.dependents_of(id) {
                if let Some(deg) = remaining.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        order
    }

    /// Dependents first: the reverse of [`DependencyGraph::start_order`].
    pub fn stop_order(&self) -> Vec<ServiceId> {
        let mut order = self.start_order();
        order.reverse();
        order
    }

    fn walk<'a>(&'a self, id: &str, next: impl Fn(&'a DagNode) -> &'a Vec<ServiceId>) -> BTreeSet<ServiceId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = match self.nodes.get(id) {
            Some(node) => next(node).iter().map(|s| s.as_str()).collect(),
            None => return seen,
        };

        while let Some(name) = stack.pop() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            if let Some(node) = self.nodes.get(name) {
                stack.extend(next(node).iter().map(|s| s.as_str()));
            }
        }

        seen
    }
}
