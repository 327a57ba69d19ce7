//! Graph Nodes
//!
//! This module defines the live state the store keeps for each atom in a
//! scope.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::atom::{AnyValue, AtomId, Cleanup, ErasedAtom, SubscriptionId};
use crate::error::AtomError;

/// Callback registered through [`Store::sub`](crate::Store::sub).
pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A primitive atom. Its value is written, never computed, so it has
    /// no dependencies, only dependents.
    Source,

    /// A derived atom. It has dependencies and may have dependents, and
    /// caches its computed value.
    Derived,
}

/// Dirty state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The node's value is up-to-date.
    Clean,

    /// The node might need to recompute. One of its dependencies changed,
    /// but we have not yet verified if the actual input values are different.
    MaybeDirty,

    /// The node definitely needs to recompute.
    Dirty,
}

/// Committed state of a node.
#[derive(Clone)]
pub(crate) enum NodeValue {
    /// Never evaluated.
    Uninitialized,
    /// Settled with a value.
    Value(AnyValue),
    /// Settled with an error.
    Error(AtomError),
    /// Waiting on its own async computation or on a pending dependency.
    Pending,
}

impl NodeValue {
    pub(crate) fn is_settled(&self) -> bool {
        matches!(self, Self::Value(_) | Self::Error(_))
    }
}

/// Mount record: present while the node has listeners or mounted dependents.
pub(crate) struct Mount {
    /// Listeners in registration order.
    pub(crate) listeners: IndexMap<SubscriptionId, Listener>,

    /// Mounted nodes that depend on this one.
    pub(crate) dependents: HashSet<AtomId>,

    /// Cleanup returned by the atom's mount hook.
    pub(crate) cleanup: Option<Cleanup>,

    /// Epoch the listeners last saw.
    pub(crate) notified_epoch: u64,

    /// Settled value the listeners last saw.
    pub(crate) notified_value: Option<NodeValue>,
}

impl Mount {
    fn new(epoch: u64, settled: Option<NodeValue>) -> Self {
        Self {
            listeners: IndexMap::new(),
            dependents: HashSet::new(),
            cleanup: None,
            notified_epoch: epoch,
            notified_value: settled,
        }
    }

    /// Whether anything still keeps this node mounted.
    pub(crate) fn is_referenced(&self) -> bool {
        !self.listeners.is_empty() || !self.dependents.is_empty()
    }
}

/// A node in the dependency graph.
pub(crate) struct AtomNode {
    /// The definition this node holds state for.
    atom: Arc<dyn ErasedAtom>,

    /// What kind of node this is.
    kind: NodeKind,

    /// Committed value.
    value: NodeValue,

    /// Last committed value that was settled. Survives trips through
    /// pending.
    settled: Option<NodeValue>,

    /// Bumped on every committed change, including entering pending.
    epoch: u64,

    /// Bumped when an evaluation starts or an in-flight one is abandoned.
    eval_token: u64,

    /// Whether an async computation for `eval_token` is outstanding.
    in_flight: bool,

    /// Current dirty state.
    dirty: DirtyState,

    /// Retire generation the dependency edges were last validated against.
    validated_generation: u64,

    /// Nodes this node read during its last evaluation, with the epoch each
    /// had when it was read.
    dependencies: IndexMap<AtomId, u64>,

    /// Reads recorded by the in-flight async computation so far.
    pending_dependencies: Option<IndexMap<AtomId, u64>>,

    /// Nodes that read this node during their last evaluation.
    dependents: HashSet<AtomId>,

    /// Mount record, if mounted.
    mount: Option<Mount>,
}

impl AtomNode {
    /// Create a node for `atom`.
    ///
    /// Primitive nodes start clean with their initial value; derived nodes
    /// start dirty to ensure the first read evaluates them.
    pub(crate) fn new(atom: Arc<dyn ErasedAtom>, generation: u64) -> Self {
        let (kind, value, dirty) = match atom.initial_value() {
            Some(initial) => (NodeKind::Source, NodeValue::Value(initial), DirtyState::Clean),
            None => (NodeKind::Derived, NodeValue::Uninitialized, DirtyState::Dirty),
        };
        let settled = value.is_settled().then(|| value.clone());

        Self {
            atom,
            kind,
            value,
            settled,
            epoch: 0,
            eval_token: 0,
            in_flight: false,
            dirty,
            validated_generation: generation,
            dependencies: IndexMap::new(),
            pending_dependencies: None,
            dependents: HashSet::new(),
            mount: None,
        }
    }

    pub(crate) fn id(&self) -> AtomId {
        self.atom.id()
    }

    pub(crate) fn atom(&self) -> &Arc<dyn ErasedAtom> {
        &self.atom
    }

    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn value(&self) -> &NodeValue {
        &self.value
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn eval_token(&self) -> u64 {
        self.eval_token
    }

    /// Get the current dirty state.
    pub(crate) fn dirty_state(&self) -> DirtyState {
        self.dirty
    }

    pub(crate) fn validated_generation(&self) -> u64 {
        self.validated_generation
    }

    /// Check if the node needs any processing.
    pub(crate) fn is_clean(&self) -> bool {
        self.dirty == DirtyState::Clean
    }

    /// Mark the node as clean as of `generation`.
    pub(crate) fn mark_clean(&mut self, generation: u64) {
        self.dirty = DirtyState::Clean;
        self.validated_generation = generation;
    }

    /// Mark the node as maybe dirty (a dependency might have changed).
    pub(crate) fn mark_maybe_dirty(&mut self) {
        if self.dirty == DirtyState::Clean {
            self.dirty = DirtyState::MaybeDirty;
        }
    }

    /// Mark the node as definitely dirty (needs recomputation).
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = DirtyState::Dirty;
    }

    /// Start a new evaluation and return its token.
    pub(crate) fn begin_evaluation(&mut self) -> u64 {
        self.eval_token += 1;
        self.in_flight = false;
        self.eval_token
    }

    /// Record that the evaluation `token` handed off to an async computation.
    pub(crate) fn set_in_flight(&mut self, token: u64) {
        if self.eval_token == token {
            self.in_flight = true;
            self.pending_dependencies = Some(IndexMap::new());
        }
    }

    /// Abandon any outstanding async computation so its result is discarded
    /// on arrival.
    pub(crate) fn abandon_in_flight(&mut self) -> bool {
        if self.in_flight {
            self.in_flight = false;
            self.pending_dependencies = None;
            self.eval_token += 1;
            self.dirty = DirtyState::Dirty;
            true
        } else {
            false
        }
    }

    /// Whether an async result tagged `token` may still be committed.
    pub(crate) fn accepts_settlement(&self, token: u64) -> bool {
        self.in_flight && self.eval_token == token
    }

    /// The last settled value, even while the node is pending again.
    pub(crate) fn last_settled(&self) -> Option<&NodeValue> {
        self.settled.as_ref()
    }

    /// Whether `a` and `b` hold the same state of this node.
    fn same_value(&self, a: &NodeValue, b: &NodeValue) -> bool {
        match (a, b) {
            (NodeValue::Value(a), NodeValue::Value(b)) => self.atom.values_equal(a, b),
            (NodeValue::Error(a), NodeValue::Error(b)) => a == b,
            (NodeValue::Pending, NodeValue::Pending) => true,
            (NodeValue::Uninitialized, NodeValue::Uninitialized) => true,
            _ => false,
        }
    }

    /// Whether the last settled value equals `seen`.
    pub(crate) fn settled_matches(&self, seen: Option<&NodeValue>) -> bool {
        match (&self.settled, seen) {
            (Some(current), Some(seen)) => self.same_value(current, seen),
            (None, None) => true,
            _ => false,
        }
    }

    /// Commit a new value. Returns whether it differs from the previous one,
    /// in which case the epoch is bumped.
    ///
    /// Entering and leaving pending always moves the epoch, so dependents
    /// that saw the pending state re-read.
    pub(crate) fn commit(&mut self, value: NodeValue) -> bool {
        let changed = !self.same_value(&self.value, &value);

        if value.is_settled() {
            self.settled = Some(value.clone());
        }
        self.value = value;
        if changed {
            self.epoch += 1;
        }
        changed
    }

    /// Settle an in-flight computation.
    pub(crate) fn settle(&mut self, value: NodeValue) -> bool {
        self.in_flight = false;
        self.commit(value)
    }

    /// Get all dependencies with the epochs observed for them.
    pub(crate) fn dependencies(&self) -> &IndexMap<AtomId, u64> {
        &self.dependencies
    }

    /// Replace the dependency set, returning the previous one.
    pub(crate) fn replace_dependencies(
        &mut self,
        dependencies: IndexMap<AtomId, u64>,
    ) -> IndexMap<AtomId, u64> {
        std::mem::replace(&mut self.dependencies, dependencies)
    }

    /// Add a dependency (a node that this node reads from).
    pub(crate) fn add_dependency(&mut self, node_id: AtomId, epoch: u64) {
        self.dependencies.insert(node_id, epoch);
    }

    /// Remove a dependency.
    pub(crate) fn remove_dependency(&mut self, node_id: AtomId) {
        self.dependencies.shift_remove(&node_id);
    }

    /// Record a read made by the in-flight computation.
    pub(crate) fn record_pending_dependency(&mut self, node_id: AtomId, epoch: u64) {
        if let Some(pending) = self.pending_dependencies.as_mut() {
            pending.insert(node_id, epoch);
        }
    }

    /// Take the reads recorded by the computation that just settled.
    pub(crate) fn take_pending_dependencies(&mut self) -> Option<IndexMap<AtomId, u64>> {
        self.pending_dependencies.take()
    }

    /// Get all dependents.
    pub(crate) fn dependents(&self) -> &HashSet<AtomId> {
        &self.dependents
    }

    /// Add a dependent (a node that reads from this node).
    pub(crate) fn add_dependent(&mut self, node_id: AtomId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub(crate) fn remove_dependent(&mut self, node_id: AtomId) {
        self.dependents.remove(&node_id);
    }

    pub(crate) fn mount(&self) -> Option<&Mount> {
        self.mount.as_ref()
    }

    pub(crate) fn mount_mut(&mut self) -> Option<&mut Mount> {
        self.mount.as_mut()
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    /// Create the mount record if missing. Returns whether it was created.
    pub(crate) fn ensure_mount(&mut self) -> bool {
        if self.mount.is_some() {
            return false;
        }
        self.mount = Some(Mount::new(self.epoch, self.settled.clone()));
        true
    }

    /// Drop the mount record.
    pub(crate) fn take_mount(&mut self) -> Option<Mount> {
        self.mount.take()
    }

    /// Whether the definition is held by anything besides this node.
    pub(crate) fn is_referenced_elsewhere(&self) -> bool {
        Arc::strong_count(&self.atom) > 1 && !self.atom.is_retired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{atom, Atom};

    fn erased_primitive(value: i32) -> Arc<dyn ErasedAtom> {
        atom(value).erased().clone()
    }

    #[test]
    fn source_node_starts_clean() {
        let node = AtomNode::new(erased_primitive(1), 0);
        assert_eq!(node.kind(), NodeKind::Source);
        assert!(node.is_clean());
        assert!(node.value().is_settled());
    }

    #[test]
    fn derived_node_starts_dirty() {
        let derived = Atom::derived(|_| Ok(1));
        let node = AtomNode::new(derived.erased().clone(), 0);
        assert_eq!(node.kind(), NodeKind::Derived);
        assert_eq!(node.dirty_state(), DirtyState::Dirty);
        assert!(matches!(node.value(), NodeValue::Uninitialized));
    }

    #[test]
    fn dependency_management() {
        let mut node = AtomNode::new(Atom::derived(|_| Ok(1)).erased().clone(), 0);
        let dep1 = atom(1).id();
        let dep2 = atom(2).id();

        node.add_dependency(dep1, 0);
        node.add_dependency(dep2, 3);

        assert_eq!(node.dependencies().get(&dep1), Some(&0));
        assert_eq!(node.dependencies().get(&dep2), Some(&3));
        assert_eq!(node.dependencies().len(), 2);

        node.remove_dependency(dep1);
        assert!(!node.dependencies().contains_key(&dep1));
        assert_eq!(node.dependencies().len(), 1);
    }

    #[test]
    fn dirty_state_transitions() {
        let mut node = AtomNode::new(Atom::derived(|_| Ok(1)).erased().clone(), 0);

        // Start dirty
        assert_eq!(node.dirty_state(), DirtyState::Dirty);

        // Mark clean
        node.mark_clean(0);
        assert_eq!(node.dirty_state(), DirtyState::Clean);

        // Mark maybe dirty
        node.mark_maybe_dirty();
        assert_eq!(node.dirty_state(), DirtyState::MaybeDirty);

        // Mark dirty
        node.mark_dirty();
        assert_eq!(node.dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn commit_bumps_epoch_only_on_change() {
        let mut node = AtomNode::new(erased_primitive(1), 0);
        assert_eq!(node.epoch(), 0);

        assert!(!node.commit(NodeValue::Value(Arc::new(1))));
        assert_eq!(node.epoch(), 0);

        assert!(node.commit(NodeValue::Value(Arc::new(2))));
        assert_eq!(node.epoch(), 1);

        assert!(node.commit(NodeValue::Pending));
        assert!(!node.commit(NodeValue::Pending));
        assert_eq!(node.epoch(), 2);
    }

    #[test]
    fn abandoned_computation_is_rejected() {
        let mut node = AtomNode::new(Atom::derived(|_| Ok(1)).erased().clone(), 0);
        let token = node.begin_evaluation();
        node.set_in_flight(token);
        assert!(node.accepts_settlement(token));

        assert!(node.abandon_in_flight());
        assert!(!node.accepts_settlement(token));
        assert_eq!(node.dirty_state(), DirtyState::Dirty);
    }

    #[test]
    fn settled_value_survives_pending() {
        let mut node = AtomNode::new(Atom::derived(|_| Ok(1)).erased().clone(), 0);
        assert!(node.last_settled().is_none());

        node.commit(NodeValue::Value(Arc::new(1)));
        let seen = node.last_settled().cloned();

        assert!(node.commit(NodeValue::Pending));
        assert!(node.settled_matches(seen.as_ref()));

        // Leaving pending moves the epoch even when the value is the same.
        assert!(node.commit(NodeValue::Value(Arc::new(1))));
        assert!(node.settled_matches(seen.as_ref()));

        node.commit(NodeValue::Value(Arc::new(2)));
        assert!(!node.settled_matches(seen.as_ref()));
    }
}
