//! Identifier types for the atom store.
//!
//! Atoms, scopes and subscriptions are addressed by small copyable ids drawn
//! from process-wide counters. Ids never repeat within a process, so an
//! `AtomId` is a stable identity for a definition no matter how many handles
//! to it are cloned.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for an atom definition.
///
/// Ids are allocated in creation order, which the store relies on to give
/// snapshots a deterministic ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u64);

impl AtomId {
    /// Allocate a new unique atom ID.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom{}", self.0)
    }
}

/// Identifier of a store scope.
///
/// Every [`Store`](crate::Store) is its own scope; values captured in one
/// scope can only be restored into that same scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope{}", self.0)
    }
}

/// Unique identifier for a subscription listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}
