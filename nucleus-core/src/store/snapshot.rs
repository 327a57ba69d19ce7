//! Snapshots
//!
//! A [`Snapshot`] is an ordered set of `(atom, value)` pairs tagged with the
//! scope they belong to. [`Store::snapshot`](crate::Store::snapshot) captures
//! one from the mounted nodes of a store; applications can also build one by
//! hand to seed a store through [`Store::hydrate`](crate::Store::hydrate).

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::atom::{AnyValue, Atom, AtomId, AtomValue, ErasedAtom, ScopeId};

/// One captured value.
#[derive(Clone)]
pub(crate) struct SnapshotEntry {
    pub(crate) atom: Arc<dyn ErasedAtom>,
    pub(crate) value: AnyValue,
}

/// Committed values of a set of atoms in one scope, ordered by atom.
#[derive(Clone)]
pub struct Snapshot {
    scope: ScopeId,
    entries: IndexMap<AtomId, SnapshotEntry>,
}

impl Snapshot {
    /// Create an empty snapshot for `scope`.
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            entries: IndexMap::new(),
        }
    }

    /// The scope the values belong to.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Add or replace the value for `atom`.
    pub fn insert<T: AtomValue>(&mut self, atom: &Atom<T>, value: T) {
        self.insert_raw(Arc::clone(atom.erased()), Arc::new(value));
        self.entries.sort_unstable_keys();
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with<T: AtomValue>(mut self, atom: &Atom<T>, value: T) -> Self {
        self.insert(atom, value);
        self
    }

    /// Insert without re-sorting. Callers insert in ascending id order.
    pub(crate) fn insert_raw(&mut self, atom: Arc<dyn ErasedAtom>, value: AnyValue) {
        let id = atom.id();
        self.entries.insert(id, SnapshotEntry { atom, value });
    }

    /// The captured value for `atom`.
    pub fn get<T: AtomValue>(&self, atom: &Atom<T>) -> Option<T> {
        self.entries
            .get(&atom.id())
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains(&self, atom: AtomId) -> bool {
        self.entries.contains_key(&atom)
    }

    /// Captured atoms in ascending id order.
    pub fn atoms(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in self.entries.values() {
            map.entry(
                &format_args!("{}", entry.atom.name()),
                &format_args!("{}", entry.atom.debug_value(&entry.value)),
            );
        }
        map.finish()?;
        write!(f, " @ {}", self.scope)
    }
}
