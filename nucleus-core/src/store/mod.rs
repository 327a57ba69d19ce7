//! Store
//!
//! A [`Store`] is one scope: it holds the live node of every atom read or
//! written through it, the edges between them, and the listeners registered
//! on them. The same atom definition can be used with any number of stores
//! and holds independent values in each.
//!
//! # How Reads Work
//!
//! 1. The node for the atom is found or created
//! 2. If the node is fresh, its committed value is returned as-is
//! 3. A node that may be stale re-reads its dependencies first. If none of
//!    them reports a new epoch, it is fresh after all
//! 4. Otherwise the read function runs in a new evaluation frame. Every atom
//!    read through the getter is recorded, and the recorded set replaces the
//!    node's previous edges
//!
//! # How Writes Work
//!
//! Writes run inside a batch. A primitive write commits the value, bumps the
//! epoch and marks every transitive dependent maybe-dirty. When the outermost
//! batch closes, the store flushes:
//!
//! 1. Cleanups of atoms that were unmounted run
//! 2. Mounted dependents are re-read in topological order
//! 3. Mount hooks of atoms that were mounted run
//! 4. Listeners of every mounted, settled node whose settled value differs
//!    from the one they last saw are called once
//!
//! Writes made while flushing (by mount hooks or listeners) are picked up by
//! the same flush in a further pass.
//!
//! # Async Settlement
//!
//! An async read function hands back a future, which is spawned on the
//! configured runtime while the node is committed as pending. The future is
//! tagged with the node's evaluation token; a result whose token is no longer
//! current is discarded when it arrives.

mod config;
mod snapshot;
mod subscription;

pub use config::{StoreBuilder, StoreConfig};
pub use snapshot::Snapshot;
pub use subscription::Subscription;

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::atom::{
    retire_generation, AnyValue, Atom, AtomId, AtomValue, Cleanup, ErasedAtom, EvalFrame,
    Evaluation, FrameGuard, Getter, Loadable, PrimitiveAtom, ScopeId, SubscriptionId,
    WritableAtom, WriteContext,
};
use crate::error::{AtomError, Result};
use crate::graph::{AtomNode, DirtyState, Listener, NodeKind, NodeValue, Scheduler};

type Ids = SmallVec<[AtomId; 8]>;

// ----------------------------------------------------------------------------
// State
// ----------------------------------------------------------------------------

/// Work collected by the open batch, applied when it flushes.
#[derive(Default)]
struct Batch {
    /// Nesting depth of open batches.
    depth: usize,

    /// Whether a flush is running.
    flushing: bool,

    /// Nodes whose committed value changed.
    changed: IndexSet<AtomId>,

    /// Transitive dependents of changed nodes.
    stale: IndexSet<AtomId>,

    /// Nodes that became mounted and carry a mount hook.
    mount_hooks: IndexSet<AtomId>,

    /// Cleanups of nodes that were unmounted.
    cleanups: Vec<Cleanup>,
}

/// One flush pass worth of work.
struct Pass {
    changed: IndexSet<AtomId>,
    stale: IndexSet<AtomId>,
    mount_hooks: IndexSet<AtomId>,
    cleanups: Vec<Cleanup>,
}

impl Batch {
    fn take_pass(&mut self) -> Option<Pass> {
        if self.changed.is_empty()
            && self.stale.is_empty()
            && self.mount_hooks.is_empty()
            && self.cleanups.is_empty()
        {
            return None;
        }

        Some(Pass {
            changed: std::mem::take(&mut self.changed),
            stale: std::mem::take(&mut self.stale),
            mount_hooks: std::mem::take(&mut self.mount_hooks),
            cleanups: std::mem::take(&mut self.cleanups),
        })
    }
}

/// Mutable state of one store.
pub(crate) struct StoreState {
    pub(crate) graph: Scheduler,

    /// Evaluation stack, innermost last.
    pub(crate) frames: Vec<EvalFrame>,

    batch: Batch,

    /// Atoms already seeded by [`Store::hydrate`].
    hydrated: HashSet<AtomId>,

    /// Nodes removed by garbage collection, dropped once the state is no
    /// longer borrowed.
    graveyard: Vec<AtomNode>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            graph: Scheduler::new(),
            frames: Vec::new(),
            batch: Batch::default(),
            hydrated: HashSet::new(),
            graveyard: Vec::new(),
        }
    }

    fn ensure_node(&mut self, atom: &Arc<dyn ErasedAtom>) {
        if !self.graph.contains(atom.id()) {
            trace!(atom = %atom.name(), "node created");
            self.graph
                .insert(AtomNode::new(Arc::clone(atom), retire_generation()));
        }
    }

    fn name_of(&self, id: AtomId) -> String {
        self.graph
            .get(id)
            .map(|node| node.atom().name())
            .unwrap_or_else(|| id.to_string())
    }

    /// The evaluation path leading back to `id`, if `id` is being evaluated.
    fn cycle_path(&self, id: AtomId) -> Option<String> {
        let start = self.frames.iter().position(|frame| frame.atom == id)?;
        let mut path: Vec<String> = self.frames[start..]
            .iter()
            .map(|frame| self.name_of(frame.atom))
            .collect();
        path.push(self.name_of(id));
        Some(path.join(" -> "))
    }

    fn node_result(&self, atom: &Arc<dyn ErasedAtom>) -> Result<AnyValue> {
        match self.graph.get(atom.id()).map(AtomNode::value) {
            Some(NodeValue::Value(value)) => Ok(Arc::clone(value)),
            Some(NodeValue::Error(error)) => Err(error.clone()),
            _ => Err(AtomError::pending(atom.name())),
        }
    }

    /// Record that `id`'s committed value changed.
    fn propagate(&mut self, id: AtomId) {
        let stale = self.graph.mark_changed(id);
        self.batch.changed.insert(id);
        self.batch.stale.extend(stale);
    }

    /// Commit the outcome of a finished evaluation.
    ///
    /// `dependencies` replaces the node's edges; `None` keeps them, which is
    /// what an async evaluation does until its future settles.
    fn commit_evaluation(
        &mut self,
        id: AtomId,
        value: NodeValue,
        dependencies: Option<IndexMap<AtomId, u64>>,
        generation: u64,
    ) {
        let Some(node) = self.graph.get_mut(id) else {
            return;
        };

        let changed = node.commit(value);
        node.mark_clean(generation);
        if changed {
            trace!(atom = %node.atom().name(), epoch = node.epoch(), "committed");
        }

        if let Some(dependencies) = dependencies {
            self.apply_dependencies(id, dependencies);
        }
        if changed {
            self.propagate(id);
        }
    }

    /// Accept the result of an async computation if it is still current.
    fn settle(&mut self, id: AtomId, token: u64, result: Result<AnyValue>) -> bool {
        let Some(node) = self.graph.get_mut(id) else {
            return false;
        };
        if !node.accepts_settlement(token) {
            return false;
        }

        let value = match result {
            Ok(value) => NodeValue::Value(value),
            Err(error) if error.is_pending() => NodeValue::Pending,
            Err(error) => NodeValue::Error(error),
        };
        let suspended = matches!(value, NodeValue::Pending);

        let changed = node.settle(value);
        if suspended {
            // Settled on a dependency that is itself pending; evaluate again
            // on the next read.
            node.mark_dirty();
        }
        debug!(atom = %node.atom().name(), epoch = node.epoch(), token, "settled");

        let dependencies = node.take_pending_dependencies().unwrap_or_default();
        self.apply_dependencies(id, dependencies);
        if changed {
            self.propagate(id);
        }
        true
    }

    fn apply_dependencies(&mut self, id: AtomId, dependencies: IndexMap<AtomId, u64>) {
        let diff = self.graph.set_dependencies(id, dependencies);
        if diff.added.is_empty() && diff.removed.is_empty() {
            return;
        }
        trace!(
            atom = %self.name_of(id),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "edges updated"
        );

        let mounted = self.graph.get(id).is_some_and(AtomNode::is_mounted);
        if mounted {
            for dep in &diff.added {
                self.mount_dependency(*dep, id);
            }
        }
        for dep in diff.removed {
            if mounted {
                self.unmount_dependency(dep, id);
            }
            self.try_collect(dep);
        }
    }

    /// Record a read made through a getter.
    fn record_dependency(&mut self, reader: AtomId, token: u64, dep: AtomId, epoch: u64) {
        if reader == dep {
            return;
        }

        // Synchronous evaluation: the frame collects the read.
        if let Some(frame) = self
            .frames
            .iter_mut()
            .rev()
            .find(|frame| frame.atom == reader && frame.token == token)
        {
            frame.dependencies.insert(dep, epoch);
            return;
        }

        // In-flight async evaluation: add the edge right away so changes to
        // the dependency reach the reader before it settles.
        let Some(node) = self.graph.get_mut(reader) else {
            return;
        };
        if !node.accepts_settlement(token) {
            return;
        }
        node.record_pending_dependency(dep, epoch);
        let mounted = node.is_mounted();

        self.graph.add_edge(dep, reader, epoch);
        if mounted {
            self.mount_dependency(dep, reader);
        }
    }

    fn mount_node(&mut self, id: AtomId) {
        let Some(node) = self.graph.get_mut(id) else {
            return;
        };
        if !node.ensure_mount() {
            return;
        }
        debug!(atom = %node.atom().name(), "mounted");

        if node.atom().has_on_mount() {
            self.batch.mount_hooks.insert(id);
        }
        let dependencies: Ids = node.dependencies().keys().copied().collect();
        for dep in dependencies {
            self.mount_dependency(dep, id);
        }
    }

    fn mount_dependency(&mut self, dep: AtomId, dependent: AtomId) {
        self.mount_node(dep);
        if let Some(mount) = self.graph.get_mut(dep).and_then(AtomNode::mount_mut) {
            mount.dependents.insert(dependent);
        }
    }

    fn unmount_dependency(&mut self, dep: AtomId, dependent: AtomId) {
        if let Some(mount) = self.graph.get_mut(dep).and_then(AtomNode::mount_mut) {
            mount.dependents.remove(&dependent);
        }
        self.unmount_if_unreferenced(dep);
    }

    fn unmount_if_unreferenced(&mut self, id: AtomId) {
        let Some(node) = self.graph.get_mut(id) else {
            return;
        };
        if node.mount().map_or(true, |mount| mount.is_referenced()) {
            return;
        }
        let Some(mount) = node.take_mount() else {
            return;
        };
        debug!(atom = %node.atom().name(), "unmounted");

        // The computation keeps running; its result is dropped on arrival.
        if node.abandon_in_flight() {
            trace!(atom = %node.atom().name(), "abandoned in-flight computation");
        }

        let dependencies: Ids = node.dependencies().keys().copied().collect();
        self.batch.mount_hooks.shift_remove(&id);
        if let Some(cleanup) = mount.cleanup {
            self.batch.cleanups.push(cleanup);
        }

        for dep in dependencies {
            self.unmount_dependency(dep, id);
        }
        self.try_collect(id);
    }

    /// Drop the node for `id` if nothing can observe it any more.
    fn try_collect(&mut self, id: AtomId) {
        let collectible = self.graph.get(id).is_some_and(|node| {
            !node.is_mounted()
                && node.dependents().is_empty()
                && !node.is_referenced_elsewhere()
        }) && !self.frames.iter().any(|frame| frame.atom == id);
        if !collectible {
            return;
        }

        let Some(node) = self.graph.remove(id) else {
            return;
        };
        debug!(atom = %node.atom().name(), "collected");
        self.hydrated.remove(&id);

        let dependencies: Ids = node.dependencies().keys().copied().collect();
        self.graveyard.push(node);
        for dep in dependencies {
            self.try_collect(dep);
        }
    }

    /// Listeners to call for `candidates`, marking them notified.
    fn take_notifications(&mut self, candidates: impl IntoIterator<Item = AtomId>) -> Vec<Listener> {
        let mut listeners = Vec::new();
        for id in candidates {
            let Some(node) = self.graph.get_mut(id) else {
                continue;
            };
            let epoch = node.epoch();
            let Some(mount) = node.mount() else {
                continue;
            };
            if !node.value().is_settled() || mount.notified_epoch == epoch {
                continue;
            }
            // A trip through pending that settles on the same value is not
            // a change for listeners.
            let changed = !node.settled_matches(mount.notified_value.as_ref());
            let settled = node.last_settled().cloned();

            let Some(mount) = node.mount_mut() else {
                continue;
            };
            mount.notified_epoch = epoch;
            if changed {
                mount.notified_value = settled;
                listeners.extend(mount.listeners.values().cloned());
            }
        }
        listeners
    }
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

struct StoreInner {
    scope: ScopeId,
    config: StoreConfig,
    state: ReentrantMutex<RefCell<StoreState>>,

    /// Fires after every async settlement, accepted or not, and after every
    /// flush that committed changes.
    settled: Notify,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        let mut cleanups = std::mem::take(&mut state.batch.cleanups);
        cleanups.extend(
            state
                .graph
                .nodes_mut()
                .filter_map(|node| node.mount_mut().and_then(|mount| mount.cleanup.take())),
        );
        for cleanup in cleanups {
            cleanup();
        }
    }
}

/// A scope of atom values.
///
/// Cloning a store yields another handle to the same scope.
///
/// # Example
///
/// ```rust,ignore
/// let count = atom(0);
/// let doubled = Atom::derived({
///     let count = count.clone();
///     move |get| Ok(get.get(&count)? * 2)
/// });
///
/// let store = Store::new();
/// let _sub = store.sub(&doubled, || println!("doubled changed"));
/// store.set(&count, 5)?;
/// assert_eq!(store.get(&doubled)?, 10);
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// Non-owning handle to a store.
#[derive(Clone)]
pub(crate) struct WeakStore {
    inner: Weak<StoreInner>,
}

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }
}

/// Keeps a batch open; flushes when the outermost one closes.
struct BatchGuard<'a> {
    store: &'a Store,
    _lock: ReentrantMutexGuard<'a, RefCell<StoreState>>,
}

impl<'a> BatchGuard<'a> {
    fn open(store: &'a Store) -> Self {
        let lock = store.inner.state.lock();
        lock.borrow_mut().batch.depth += 1;
        Self { store, _lock: lock }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let flush = self.store.with_state(|state| {
            state.batch.depth -= 1;
            state.batch.depth == 0 && !state.batch.flushing
        });
        if flush && !std::thread::panicking() {
            self.store.flush();
        }
    }
}

/// Clears the flushing flag even if a listener panics.
struct FlushGuard<'a>(&'a Store);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.with_state(|state| state.batch.flushing = false);
    }
}

impl Store {
    /// Create a store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Start building a configured store.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let scope = ScopeId::next();
        debug!(%scope, label = ?config.label, "store created");
        Self {
            inner: Arc::new(StoreInner {
                scope,
                config,
                state: ReentrantMutex::new(RefCell::new(StoreState::new())),
                settled: Notify::new(),
            }),
        }
    }

    /// This store's scope.
    pub fn scope(&self) -> ScopeId {
        self.inner.scope
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run `f` with exclusive access to the state.
    ///
    /// `f` must not call back into user code. Nodes collected while `f` runs
    /// are dropped after the state is released.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let guard = self.inner.state.lock();
        let (result, collected) = {
            let mut state = guard.borrow_mut();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.graveyard))
        };
        drop(collected);
        result
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read the current value of `atom`.
    ///
    /// Returns [`AtomError::Pending`] while an async computation the value
    /// depends on is outstanding, and the committed error if the atom
    /// failed.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        self.read_erased(atom.erased())
    }

    /// Read `atom` as a [`Loadable`], never suspending.
    pub fn get_loadable<T: AtomValue>(&self, atom: &Atom<T>) -> Loadable<T> {
        Loadable::from_result(self.get(atom))
    }

    /// Wait until `atom` settles and return its value.
    pub async fn wait<T: AtomValue>(&self, atom: &Atom<T>) -> Result<T> {
        self.wait_settled(|| self.get(atom)).await
    }

    pub(crate) fn read_erased<T: AtomValue>(&self, atom: &Arc<dyn ErasedAtom>) -> Result<T> {
        let _batch = BatchGuard::open(self);
        let value = self.read_node(atom)?;
        downcast(atom, value)
    }

    /// Read through a getter, recording the dependency for `reader`.
    pub(crate) fn read_tracked<U: AtomValue>(
        &self,
        reader: AtomId,
        token: u64,
        atom: &Atom<U>,
    ) -> Result<U> {
        let _batch = BatchGuard::open(self);
        let result = self.read_node(atom.erased());

        let cyclic = matches!(&result, Err(error) if error.is_cycle());
        if !cyclic {
            self.with_state(|state| {
                if let Some(epoch) = state.graph.get(atom.id()).map(AtomNode::epoch) {
                    state.record_dependency(reader, token, atom.id(), epoch);
                }
            });
        }

        result.and_then(|value| downcast(atom.erased(), value))
    }

    /// Re-run `read` until it no longer reports pending.
    pub(crate) async fn wait_settled<U>(&self, read: impl Fn() -> Result<U>) -> Result<U> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            // Register before reading so a settlement in between is not lost.
            notified.as_mut().enable();

            match read() {
                Err(error) if error.is_pending() => notified.await,
                result => return result,
            }
        }
    }

    /// Last settled value of `id`, kept while it is pending again.
    pub(crate) fn committed_value<T: AtomValue>(&self, id: AtomId) -> Option<T> {
        self.with_state(|state| match state.graph.get(id).and_then(AtomNode::last_settled) {
            Some(NodeValue::Value(value)) => value.downcast_ref::<T>().cloned(),
            _ => None,
        })
    }

    pub(crate) fn is_current_evaluation(&self, id: AtomId, token: u64) -> bool {
        self.with_state(|state| {
            state
                .graph
                .get(id)
                .is_some_and(|node| node.eval_token() == token)
        })
    }

    pub(crate) fn atom_name(&self, id: AtomId) -> String {
        self.with_state(|state| state.name_of(id))
    }

    fn read_node(&self, atom: &Arc<dyn ErasedAtom>) -> Result<AnyValue> {
        let id = atom.id();

        if let Some(path) = self.with_state(|state| state.cycle_path(id)) {
            warn!(atom = %atom.name(), %path, "cyclic dependency");
            return Err(AtomError::CyclicDependency {
                atom: atom.name(),
                path,
            });
        }

        self.with_state(|state| state.ensure_node(atom));
        if !self.is_fresh(id) {
            self.evaluate(atom)?;
        }
        self.with_state(|state| state.node_result(atom))
    }

    /// Whether the committed value of `id` can be returned without running
    /// its read function.
    fn is_fresh(&self, id: AtomId) -> bool {
        let generation = retire_generation();
        let status = self.with_state(|state| {
            state.graph.get(id).map(|node| {
                (
                    node.kind(),
                    node.dirty_state(),
                    node.is_clean() && node.validated_generation() == generation,
                    matches!(node.value(), NodeValue::Uninitialized),
                )
            })
        });
        let Some((kind, dirty, validated, uninitialized)) = status else {
            return false;
        };

        if kind == NodeKind::Source {
            return true;
        }
        if uninitialized || dirty == DirtyState::Dirty {
            return false;
        }
        if validated {
            return true;
        }

        // Maybe dirty: bring every dependency up to date and compare epochs.
        let dependencies = self.with_state(|state| {
            state
                .graph
                .get(id)
                .map(|node| node.dependencies().clone())
                .unwrap_or_default()
        });
        for (dep_id, seen) in dependencies {
            let dep = self.with_state(|state| state.graph.get(dep_id).map(|n| Arc::clone(n.atom())));
            let Some(dep) = dep else {
                return false;
            };
            if dep.is_retired() {
                return false;
            }
            // Errors are committed values too; only the epoch matters here.
            // A dependency that is mid-evaluation cannot vouch for us, so
            // re-run and let the evaluation report the cycle.
            if let Err(error) = self.read_node(&dep) {
                if error.is_cycle() {
                    return false;
                }
            }
            let epoch = self.with_state(|state| state.graph.get(dep_id).map(AtomNode::epoch));
            if epoch != Some(seen) {
                return false;
            }
        }

        self.with_state(|state| {
            if let Some(node) = state.graph.get_mut(id) {
                node.mark_clean(generation);
            }
        });
        true
    }

    fn evaluate(&self, atom: &Arc<dyn ErasedAtom>) -> Result<()> {
        let id = atom.id();
        let Some(token) = self.with_state(|state| state.graph.get_mut(id).map(AtomNode::begin_evaluation))
        else {
            return Ok(());
        };
        trace!(atom = %atom.name(), token, "evaluating");

        let frame = FrameGuard::enter(self, id, token);
        let evaluation = atom.evaluate(Getter::new(self.clone(), id, token));
        let dependencies = frame.finish();
        let generation = retire_generation();

        match evaluation {
            Evaluation::Ready(Err(error)) if error.is_cycle() => {
                // Leave the previous value in place and retry on the next read.
                self.with_state(|state| {
                    if let Some(node) = state.graph.get_mut(id) {
                        node.mark_dirty();
                    }
                });
                Err(error)
            }
            Evaluation::Ready(result) => {
                let value = match result {
                    Ok(value) => NodeValue::Value(value),
                    Err(error) if error.is_pending() => NodeValue::Pending,
                    Err(error) => NodeValue::Error(error),
                };
                self.with_state(|state| {
                    state.commit_evaluation(id, value, Some(dependencies), generation)
                });
                Ok(())
            }
            Evaluation::Pending(computation) => {
                let Some(runtime) = self.inner.config.runtime() else {
                    warn!(atom = %atom.name(), "async read without a runtime");
                    let error = AtomError::NoRuntime { atom: atom.name() };
                    self.with_state(|state| {
                        state.commit_evaluation(
                            id,
                            NodeValue::Error(error),
                            Some(dependencies),
                            generation,
                        )
                    });
                    return Ok(());
                };

                self.with_state(|state| {
                    state.commit_evaluation(id, NodeValue::Pending, None, generation);
                    if let Some(node) = state.graph.get_mut(id) {
                        node.set_in_flight(token);
                    }
                });

                let store = self.downgrade();
                runtime.spawn(async move {
                    let result = computation.await;
                    if let Some(store) = store.upgrade() {
                        store.settle(id, token, result);
                    }
                });
                Ok(())
            }
        }
    }

    fn settle(&self, id: AtomId, token: u64, result: Result<AnyValue>) {
        {
            let _batch = BatchGuard::open(self);
            let accepted = self.with_state(|state| state.settle(id, token, result));
            if !accepted {
                trace!(atom = %id, token, "discarded stale async result");
            }
        }
        self.inner.settled.notify_waiters();
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Write `atom` through its write function.
    ///
    /// Listeners are notified once, after the write function returns.
    pub fn set<T: AtomValue, A: Send + 'static>(
        &self,
        atom: &WritableAtom<T, A>,
        args: A,
    ) -> Result<()> {
        self.write_atom(atom, args)
    }

    /// Replace the value of a primitive atom with `f(current)`.
    pub fn update<T: AtomValue>(
        &self,
        atom: &PrimitiveAtom<T>,
        f: impl FnOnce(&T) -> T,
    ) -> Result<()> {
        let _batch = BatchGuard::open(self);
        let current = self.get(atom)?;
        self.set(atom, f(&current))
    }

    /// Run `f` as one batch: listeners are notified once, after it returns.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _batch = BatchGuard::open(self);
        f()
    }

    pub(crate) fn write_atom<T: AtomValue, A: Send + 'static>(
        &self,
        atom: &WritableAtom<T, A>,
        args: A,
    ) -> Result<()> {
        let _batch = BatchGuard::open(self);
        trace!(atom = %atom, "write");
        let ctx = WriteContext::new(self, atom.as_atom().erased());
        atom.write(&ctx, args)
    }

    /// Commit `value` into a primitive atom's node.
    pub(crate) fn write_primitive(&self, atom: &Arc<dyn ErasedAtom>, value: AnyValue) -> Result<()> {
        if !atom.is_primitive() {
            return Err(AtomError::NotWritable { atom: atom.name() });
        }

        let _batch = BatchGuard::open(self);
        self.with_state(|state| {
            state.ensure_node(atom);
            let Some(node) = state.graph.get_mut(atom.id()) else {
                return;
            };
            if node.commit(NodeValue::Value(value)) {
                debug!(atom = %atom.name(), epoch = node.epoch(), "primitive written");
                state.propagate(atom.id());
            }
        });
        Ok(())
    }

    fn flush(&self) {
        self.with_state(|state| state.batch.flushing = true);
        let _flushing = FlushGuard(self);

        let mut passes = 0;
        while let Some(pass) = self.with_state(|state| state.batch.take_pass()) {
            passes += 1;
            for cleanup in pass.cleanups {
                cleanup();
            }

            // Pull mounted dependents, dependencies first.
            let pull = self.with_state(|state| {
                let mounted: Vec<AtomId> = pass
                    .stale
                    .iter()
                    .copied()
                    .filter(|id| state.graph.get(*id).is_some_and(AtomNode::is_mounted))
                    .collect();
                state
                    .graph
                    .topological_sort(mounted)
                    .into_iter()
                    .filter_map(|id| state.graph.get(id).map(|node| Arc::clone(node.atom())))
                    .collect::<Vec<_>>()
            });
            for atom in &pull {
                let _ = self.read_node(atom);
            }

            for id in pass.mount_hooks {
                self.run_mount_hook(id);
            }

            let candidates = pass.changed.into_iter().chain(pass.stale);
            let listeners = self.with_state(|state| state.take_notifications(candidates));
            if !listeners.is_empty() {
                trace!(listeners = listeners.len(), "notifying");
            }
            for listener in listeners {
                listener();
            }
        }

        if passes > 0 {
            self.inner.settled.notify_waiters();
        }
    }

    fn run_mount_hook(&self, id: AtomId) {
        let atom = self.with_state(|state| {
            state
                .graph
                .get(id)
                .filter(|node| node.is_mounted())
                .map(|node| Arc::clone(node.atom()))
        });
        let Some(atom) = atom else {
            return;
        };

        let Some(cleanup) = atom.mount(&atom, self) else {
            return;
        };
        // The hook may have unmounted its own atom.
        let leftover = self.with_state(move |state| {
            match state.graph.get_mut(id).and_then(AtomNode::mount_mut) {
                Some(mount) => {
                    mount.cleanup = Some(cleanup);
                    None
                }
                None => Some(cleanup),
            }
        });
        if let Some(cleanup) = leftover {
            cleanup();
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Call `listener` whenever the settled value of `atom` changes.
    ///
    /// The atom and everything it depends on stay mounted until the returned
    /// handle is dropped.
    pub fn sub<T, F>(&self, atom: &Atom<T>, listener: F) -> Subscription
    where
        T: AtomValue,
        F: Fn() + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let batch = BatchGuard::open(self);

        // Evaluate first so the node's dependencies mount with it.
        if let Err(error) = self.read_node(atom.erased()) {
            trace!(atom = %atom, %error, "subscribed to unsettled atom");
        }
        self.with_state(|state| {
            state.ensure_node(atom.erased());
            state.mount_node(atom.id());
            if let Some(mount) = state.graph.get_mut(atom.id()).and_then(AtomNode::mount_mut) {
                mount.listeners.insert(id, Arc::new(listener));
            }
        });
        drop(batch);

        Subscription::new(self.downgrade(), atom.id(), id)
    }

    /// Keep `atom` mounted without a listener.
    pub fn mount<T: AtomValue>(&self, atom: &Atom<T>) -> Subscription {
        self.sub(atom, || {})
    }

    pub(crate) fn unsubscribe(&self, atom: AtomId, id: SubscriptionId) {
        let _batch = BatchGuard::open(self);
        let removed = self.with_state(|state| {
            let removed = state
                .graph
                .get_mut(atom)
                .and_then(AtomNode::mount_mut)
                .and_then(|mount| mount.listeners.shift_remove(&id));
            state.unmount_if_unreferenced(atom);
            removed
        });
        drop(removed);
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Capture the committed values of all mounted atoms.
    ///
    /// Nothing is evaluated: pending and failed atoms are left out.
    pub fn snapshot(&self) -> Snapshot {
        self.with_state(|state| {
            let mut entries: Vec<(Arc<dyn ErasedAtom>, AnyValue)> = state
                .graph
                .nodes()
                .filter(|node| node.is_mounted())
                .filter_map(|node| match node.value() {
                    NodeValue::Value(value) => Some((Arc::clone(node.atom()), Arc::clone(value))),
                    _ => None,
                })
                .collect();
            entries.sort_unstable_by_key(|(atom, _)| atom.id());

            let mut snapshot = Snapshot::new(self.inner.scope);
            for (atom, value) in entries {
                snapshot.insert_raw(atom, value);
            }
            snapshot
        })
    }

    /// Write every primitive atom in `snapshot` back, as one batch.
    ///
    /// Derived entries are skipped; they follow from the primitives. Atoms
    /// with a restore hook (see [`WritableAtom::with_restore`]) are written
    /// through it.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        self.check_scope(snapshot)?;

        let _batch = BatchGuard::open(self);
        for entry in snapshot.entries() {
            if entry.atom.is_primitive() {
                entry.atom.restore(&entry.atom, self, Arc::clone(&entry.value))?;
            }
        }
        debug!(scope = %self.inner.scope, entries = snapshot.len(), "restored snapshot");
        Ok(())
    }

    /// Seed primitive atoms with initial values.
    ///
    /// Each atom is hydrated at most once per store; later calls leave atoms
    /// that were already hydrated untouched. Fails without writing anything
    /// if an entry is not a primitive atom.
    pub fn hydrate(&self, values: &Snapshot) -> Result<()> {
        self.check_scope(values)?;
        if let Some(entry) = values.entries().find(|entry| !entry.atom.is_primitive()) {
            return Err(AtomError::NotWritable {
                atom: entry.atom.name(),
            });
        }

        let _batch = BatchGuard::open(self);
        for entry in values.entries() {
            let first = self.with_state(|state| state.hydrated.insert(entry.atom.id()));
            if first {
                entry.atom.restore(&entry.atom, self, Arc::clone(&entry.value))?;
            }
        }
        Ok(())
    }

    fn check_scope(&self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.scope() != self.inner.scope {
            return Err(AtomError::ScopeMismatch {
                expected: self.inner.scope,
                found: snapshot.scope(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Drop every node that is unmounted, has no dependents and whose atom
    /// is no longer referenced. Returns the number of nodes dropped.
    pub fn collect_garbage(&self) -> usize {
        let _batch = BatchGuard::open(self);
        self.with_state(|state| {
            let before = state.graph.node_count();
            for id in state.graph.ids() {
                state.try_collect(id);
            }
            before - state.graph.node_count()
        })
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.with_state(|state| state.graph.node_count())
    }

    pub fn is_mounted(&self, atom: AtomId) -> bool {
        self.with_state(|state| state.graph.get(atom).is_some_and(AtomNode::is_mounted))
    }

    /// Mounted atoms in ascending id order.
    pub fn mounted_atoms(&self) -> Vec<AtomId> {
        self.with_state(|state| {
            let mut ids: Vec<AtomId> = state
                .graph
                .nodes()
                .filter(|node| node.is_mounted())
                .map(AtomNode::id)
                .collect();
            ids.sort_unstable();
            ids
        })
    }

    /// Epoch of the node for `atom`, if it exists.
    pub fn epoch(&self, atom: AtomId) -> Option<u64> {
        self.with_state(|state| state.graph.get(atom).map(AtomNode::epoch))
    }

    pub fn dirty_state(&self, atom: AtomId) -> Option<DirtyState> {
        self.with_state(|state| state.graph.get(atom).map(AtomNode::dirty_state))
    }

    /// Atoms read by the last evaluation of `atom`.
    pub fn dependencies_of(&self, atom: AtomId) -> Vec<AtomId> {
        self.with_state(|state| {
            state
                .graph
                .get(atom)
                .map(|node| node.dependencies().keys().copied().collect())
                .unwrap_or_default()
        })
    }

    /// Atoms whose last evaluation read `atom`.
    pub fn dependents_of(&self, atom: AtomId) -> Vec<AtomId> {
        self.with_state(|state| {
            let mut ids: Vec<AtomId> = state
                .graph
                .get(atom)
                .map(|node| node.dependents().iter().copied().collect())
                .unwrap_or_default();
            ids.sort_unstable();
            ids
        })
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.inner.state.try_lock().and_then(|guard| {
            let count = guard.try_borrow().ok().map(|state| state.graph.node_count());
            count
        });
        f.debug_struct("Store")
            .field("scope", &self.inner.scope)
            .field("label", &self.inner.config.label)
            .field("nodes", &nodes)
            .finish()
    }
}

/// The process-wide default store, created on first use.
pub fn default_store() -> Store {
    static DEFAULT: OnceLock<Store> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Store::builder().label("default").build())
        .clone()
}

fn downcast<T: AtomValue>(atom: &Arc<dyn ErasedAtom>, value: AnyValue) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| AtomError::message(atom.name(), "committed value has an unexpected type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::atom;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::time::Duration;

    fn counter() -> (Arc<AtomicI32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicI32::new(0));
        let clone = count.clone();
        (count, move || {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn doubled_of(count: &PrimitiveAtom<i32>, runs: Arc<AtomicI32>) -> Atom<i32> {
        let count = count.clone();
        Atom::derived(move |get| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(get.get(&count)? * 2)
        })
    }

    #[test]
    fn primitive_read_and_write() {
        let store = Store::new();
        let count = atom(1);

        assert_eq!(store.get(&count), Ok(1));
        store.set(&count, 7).unwrap();
        assert_eq!(store.get(&count), Ok(7));

        store.update(&count, |n| n + 1).unwrap();
        assert_eq!(store.get(&count), Ok(8));
    }

    #[test]
    fn derived_values_are_memoized() {
        let store = Store::new();
        let count = atom(2);
        let runs = Arc::new(AtomicI32::new(0));
        let doubled = doubled_of(&count, runs.clone());

        assert_eq!(store.get(&doubled), Ok(4));
        assert_eq!(store.get(&doubled), Ok(4));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        store.set(&count, 3).unwrap();
        assert_eq!(store.get(&doubled), Ok(6));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_notifies_mounted_dependent_once() {
        let store = Store::new();
        let count = atom(0);
        let runs = Arc::new(AtomicI32::new(0));
        let doubled = doubled_of(&count, runs.clone());

        let (hits, listener) = counter();
        let _sub = store.sub(&doubled, listener);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        store.set(&count, 5).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(&doubled), Ok(10));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_write_is_not_a_change() {
        let store = Store::new();
        let count = atom(4);
        let (hits, listener) = counter();
        let _sub = store.sub(&count, listener);

        let before = store.epoch(count.id());
        store.set(&count, 4).unwrap();
        assert_eq!(store.epoch(count.id()), before);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unchanged_intermediate_stops_propagation() {
        let store = Store::new();
        let count = atom(1);
        let parity = Atom::derived({
            let count = count.clone();
            move |get| Ok(get.get(&count)? % 2)
        });
        let runs = Arc::new(AtomicI32::new(0));
        let label = Atom::derived({
            let parity = parity.clone();
            let runs = runs.clone();
            move |get| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(if get.get(&parity)? == 0 { "even" } else { "odd" })
            }
        });

        let (hits, listener) = counter();
        let _sub = store.sub(&label, listener);
        store.set(&count, 3).unwrap();

        // parity stayed 1, so label is not recomputed.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dynamic_dependencies_are_pruned() {
        let store = Store::new();
        let use_left = atom(true);
        let left = atom(1);
        let right = atom(2);
        let pick = Atom::derived({
            let (use_left, left, right) = (use_left.clone(), left.clone(), right.clone());
            move |get| {
                if get.get(&use_left)? {
                    get.get(&left)
                } else {
                    get.get(&right)
                }
            }
        });

        assert_eq!(store.get(&pick), Ok(1));
        assert_eq!(store.dependencies_of(pick.id()), vec![use_left.id(), left.id()]);

        store.set(&use_left, false).unwrap();
        assert_eq!(store.get(&pick), Ok(2));
        assert_eq!(store.dependencies_of(pick.id()), vec![use_left.id(), right.id()]);
        assert!(store.dependents_of(left.id()).is_empty());
    }

    #[test]
    fn cycles_are_reported_and_not_committed() {
        let store = Store::new();
        let slot: Arc<parking_lot::Mutex<Option<Atom<i32>>>> = Arc::default();
        let looped = Atom::derived({
            let slot = slot.clone();
            move |get| {
                let me = slot.lock().clone();
                match me {
                    Some(me) => get.get(&me),
                    None => Ok(0),
                }
            }
        })
        .with_label("looped");
        *slot.lock() = Some(looped.clone());

        let error = store.get(&looped).unwrap_err();
        assert!(error.is_cycle(), "{error}");
        assert!(store.with_state(|s| s.frames.is_empty()));
        assert_eq!(store.epoch(looped.id()), Some(0));
    }

    #[test]
    fn batch_coalesces_notifications() {
        let store = Store::new();
        let a = atom(1);
        let b = atom(2);
        let sum = Atom::derived({
            let (a, b) = (a.clone(), b.clone());
            move |get| Ok(get.get(&a)? + get.get(&b)?)
        });

        let (hits, listener) = counter();
        let _sub = store.sub(&sum, listener);

        store.batch(|| {
            store.set(&a, 10).unwrap();
            store.set(&b, 20).unwrap();
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&sum), Ok(30));
    }

    #[test]
    fn nested_writes_in_write_fn_notify_once() {
        let store = Store::new();
        let a = atom(0);
        let b = atom(0);
        let both = WritableAtom::write_only({
            let (a, b) = (a.clone(), b.clone());
            move |ctx, n: i32| {
                ctx.set(&a, n)?;
                ctx.set(&b, n)
            }
        });
        let sum = Atom::derived({
            let (a, b) = (a.clone(), b.clone());
            move |get| Ok(get.get(&a)? + get.get(&b)?)
        });

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _sub = store.sub(&sum, {
            let (store, sum, seen) = (store.clone(), sum.clone(), seen.clone());
            move || seen.lock().push(store.get(&sum).unwrap())
        });

        store.set(&both, 4).unwrap();
        assert_eq!(*seen.lock(), vec![8]);
    }

    #[test]
    fn unsubscribe_unmounts_dependencies() {
        let store = Store::new();
        let count = atom(0);
        let doubled = doubled_of(&count, Arc::default());

        let sub = store.sub(&doubled, || {});
        assert!(store.is_mounted(doubled.id()));
        assert!(store.is_mounted(count.id()));
        assert_eq!(store.mounted_atoms().len(), 2);

        sub.unsubscribe();
        assert!(!store.is_mounted(doubled.id()));
        assert!(!store.is_mounted(count.id()));
    }

    #[test]
    fn mount_hook_runs_and_cleans_up() {
        let store = Store::new();
        let mounts = Arc::new(AtomicI32::new(0));
        let cleanups = Arc::new(AtomicI32::new(0));

        let source = atom(0).with_on_mount({
            let (mounts, cleanups) = (mounts.clone(), cleanups.clone());
            move |set| {
                mounts.fetch_add(1, Ordering::SeqCst);
                set.set(42).unwrap();
                let cleanups = cleanups.clone();
                Some(Box::new(move || {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                }) as Cleanup)
            }
        });

        let (hits, listener) = counter();
        let sub = store.sub(&source, listener);
        assert_eq!(mounts.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&source), Ok(42));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unreferenced_nodes_are_collected() {
        let store = Store::new();
        let keep = atom(1);
        {
            let temporary = Atom::derived({
                let keep = keep.clone();
                move |get| get.get(&keep)
            });
            assert_eq!(store.get(&temporary), Ok(1));
            assert_eq!(store.node_count(), 2);
        }

        assert_eq!(store.collect_garbage(), 1);
        assert_eq!(store.node_count(), 1);
        assert!(store.dependents_of(keep.id()).is_empty());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let store = Store::new();
        let count = atom(1);
        let doubled = doubled_of(&count, Arc::default());
        let (hits, listener) = counter();
        let _sub = store.sub(&doubled, listener);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&count), Some(1));

        store.restore(&snapshot).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        store.set(&count, 9).unwrap();
        store.restore(&snapshot).unwrap();
        assert_eq!(store.get(&doubled), Ok(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn restore_rejects_other_scope() {
        let store = Store::new();
        let other = Store::new();
        let count = atom(1);

        let foreign = Snapshot::new(other.scope()).with(&count, 5);
        let error = store.restore(&foreign).unwrap_err();
        assert_eq!(
            error,
            AtomError::ScopeMismatch {
                expected: store.scope(),
                found: other.scope(),
            }
        );
        assert_eq!(store.get(&count), Ok(1));
    }

    #[test]
    fn hydrate_applies_once() {
        let store = Store::new();
        let count = atom(0);

        store
            .hydrate(&Snapshot::new(store.scope()).with(&count, 3))
            .unwrap();
        assert_eq!(store.get(&count), Ok(3));

        store.set(&count, 4).unwrap();
        store
            .hydrate(&Snapshot::new(store.scope()).with(&count, 10))
            .unwrap();
        assert_eq!(store.get(&count), Ok(4));
    }

    #[test]
    fn hydrate_rejects_derived_atoms() {
        let store = Store::new();
        let count = atom(0);
        let doubled = doubled_of(&count, Arc::default());

        let values = Snapshot::new(store.scope())
            .with(&count, 1)
            .with(&doubled, 2);
        let error = store.hydrate(&values).unwrap_err();
        assert!(matches!(error, AtomError::NotWritable { .. }));
        assert_eq!(store.get(&count), Ok(0));
    }

    #[test]
    fn async_read_without_runtime_fails() {
        let store = Store::new();
        let remote = Atom::derived_async(|_| async { Ok(1) });

        let error = store.get(&remote).unwrap_err();
        assert!(matches!(error, AtomError::NoRuntime { .. }));
    }

    #[tokio::test]
    async fn async_read_settles_and_notifies() {
        let store = Store::new();
        let user = Atom::derived_async(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok("#3".to_string())
        });

        let (hits, listener) = counter();
        let _sub = store.sub(&user, listener);
        assert!(store.get(&user).unwrap_err().is_pending());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(store.wait(&user).await, Ok("#3".to_string()));
        assert_eq!(store.get(&user), Ok("#3".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_async_result_is_discarded() {
        let store = Store::new();
        let id = atom(1);
        let user = Atom::derived_async({
            let id = id.clone();
            move |get| {
                let id = id.clone();
                async move {
                    let n = get.get(&id)?;
                    let delay = if n == 1 { 60 } else { 5 };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok(format!("#{n}"))
                }
            }
        });

        let (hits, listener) = counter();
        let _sub = store.sub(&user, listener);
        // Let the first computation start and record its read of `id`.
        tokio::time::sleep(Duration::from_millis(1)).await;

        store.set(&id, 3).unwrap();
        assert_eq!(store.wait(&user).await, Ok("#3".to_string()));

        // The first computation finishes later and must not win.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get(&user), Ok("#3".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn derived_of_pending_waits_for_dependency() {
        let store = Store::new();
        let base = Atom::derived_async(|_| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(20)
        });
        let plus_one = Atom::derived({
            let base = base.clone();
            move |get| Ok(get.get(&base)? + 1)
        });

        assert!(store.get(&plus_one).unwrap_err().is_pending());
        assert_eq!(store.wait(&plus_one).await, Ok(21));
    }
}
