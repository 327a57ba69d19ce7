//! Update Scheduler
//!
//! The scheduler owns every node of one scope and the edges between them. It
//! determines which nodes a change can reach and the order in which they
//! should be brought up to date.
//!
//! # Algorithm
//!
//! Invalidation is push-pull:
//!
//! 1. When a node's committed value changes, mark all its direct dependents as
//!    "maybe dirty"
//! 2. Propagate "maybe dirty" to their dependents, recursively
//! 3. Nothing is recomputed yet. A maybe-dirty node re-reads its
//!    dependencies the next time it is read and only recomputes if one of
//!    them reports a new epoch
//! 4. The store pulls mounted nodes eagerly, in topological order
//!    (dependencies before dependents), so listeners see a consistent graph
//!
//! This keeps unmounted parts of the graph lazy while mounted parts are
//! refreshed once per batch.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;

use super::node::AtomNode;
use crate::atom::AtomId;

/// Edges added and removed by [`Scheduler::set_dependencies`].
#[derive(Debug, Default)]
pub(crate) struct EdgeDiff {
    pub(crate) added: Vec<AtomId>,
    pub(crate) removed: Vec<AtomId>,
}

/// The update scheduler manages the dependency graph of one scope.
#[derive(Default)]
pub(crate) struct Scheduler {
    /// All nodes in the graph, indexed by atom.
    nodes: HashMap<AtomId, AtomNode>,
}

impl Scheduler {
    /// Create a new empty scheduler.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph.
    pub(crate) fn insert(&mut self, node: AtomNode) -> AtomId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node.
    pub(crate) fn remove(&mut self, node_id: AtomId) -> Option<AtomNode> {
        let node = self.nodes.remove(&node_id)?;

        // Remove this node from its dependencies' dependent lists
        for dep_id in node.dependencies().keys() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }

        // Remove this node from its dependents' dependency lists
        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        Some(node)
    }

    pub(crate) fn contains(&self, node_id: AtomId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Get a reference to a node.
    pub(crate) fn get(&self, node_id: AtomId) -> Option<&AtomNode> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub(crate) fn get_mut(&mut self, node_id: AtomId) -> Option<&mut AtomNode> {
        self.nodes.get_mut(&node_id)
    }

    /// Iterate over all nodes.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = &AtomNode> {
        self.nodes.values()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = &mut AtomNode> {
        self.nodes.values_mut()
    }

    /// IDs of all nodes.
    pub(crate) fn ids(&self) -> Vec<AtomId> {
        self.nodes.keys().copied().collect()
    }

    /// Add a dependency edge: `dependent` read `dependency` at `epoch`.
    ///
    /// This means when `dependency` changes, `dependent` may need to update.
    pub(crate) fn add_edge(&mut self, dependency: AtomId, dependent: AtomId, epoch: u64) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency, epoch);
        }
    }

    /// Replace the dependency edges of `node_id` with the reads of its
    /// latest evaluation.
    ///
    /// Edges that were read again keep existing with their new epoch; edges
    /// that were not read again are pruned from both sides.
    pub(crate) fn set_dependencies(
        &mut self,
        node_id: AtomId,
        dependencies: IndexMap<AtomId, u64>,
    ) -> EdgeDiff {
        let mut diff = EdgeDiff::default();
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return diff;
        };

        let previous = node.replace_dependencies(dependencies);

        let current: Vec<AtomId> = node.dependencies().keys().copied().collect();
        for dep_id in current {
            if !previous.contains_key(&dep_id) {
                diff.added.push(dep_id);
            }
            if let Some(dep) = self.nodes.get_mut(&dep_id) {
                dep.add_dependent(node_id);
            }
        }

        for dep_id in previous.keys() {
            let still_read = self
                .nodes
                .get(&node_id)
                .is_some_and(|node| node.dependencies().contains_key(dep_id));
            if !still_read {
                if let Some(dep) = self.nodes.get_mut(dep_id) {
                    dep.remove_dependent(node_id);
                }
                diff.removed.push(*dep_id);
            }
        }

        diff
    }

    /// Mark a node as changed and propagate dirty flags.
    ///
    /// Returns every transitive dependent, in topological order.
    pub(crate) fn mark_changed(&mut self, source_id: AtomId) -> Vec<AtomId> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        // Start with the source node's direct dependents
        if let Some(source) = self.nodes.get(&source_id) {
            queue.extend(source.dependents().iter().copied());
        }

        // BFS to propagate maybe-dirty status
        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.mark_maybe_dirty();
                to_process.push(node_id);

                // Propagate to dependents
                queue.extend(node.dependents().iter().copied());
            }
        }

        self.topological_sort(to_process)
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    /// Nodes are seeded in ascending id order so the result is deterministic.
    pub(crate) fn topological_sort(&self, nodes: Vec<AtomId>) -> Vec<AtomId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<AtomId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        let mut seeds: Vec<AtomId> = node_set.iter().copied().collect();
        seeds.sort_unstable();

        // Calculate in-degrees (only counting edges within the node set)
        for node_id in seeds {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .keys()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                let mut dependents: Vec<AtomId> = node.dependents().iter().copied().collect();
                dependents.sort_unstable();
                for dependent_id in dependents {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        result
    }

    /// Get the total number of nodes in the graph.
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
