//! Error Types
//!
//! Every fallible store operation returns [`AtomError`]. Errors are cheap to
//! clone because an error committed to a node is handed to every reader of
//! that node, and they compare by variant and identity so they can live
//! inside atom values (see [`Loadable`](crate::atom::Loadable)).

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::atom::ScopeId;

/// Shared error source carried by [`AtomError`] variants.
pub type BoxError = Arc<dyn StdError + Send + Sync + 'static>;

/// Result type alias for atom operations.
pub type Result<T, E = AtomError> = std::result::Result<T, E>;

/// Errors raised by the store, by read/write functions and by utilities.
#[derive(Debug, Clone, Error)]
pub enum AtomError {
    /// An evaluation read its own node, directly or transitively.
    #[error("cyclic dependency while evaluating {atom} ({path})")]
    CyclicDependency {
        /// The atom that was read while already being evaluated.
        atom: String,
        /// The evaluation stack at the point of the cycle.
        path: String,
    },

    /// A write was attempted on an atom without a write function.
    #[error("atom {atom} is not writable")]
    NotWritable {
        /// The atom that rejected the write.
        atom: String,
    },

    /// Restore or hydrate was handed values captured for another scope.
    #[error("scope mismatch: store is {expected}, values belong to {found}")]
    ScopeMismatch {
        /// Scope of the store the call targeted.
        expected: ScopeId,
        /// Scope the values were captured for.
        found: ScopeId,
    },

    /// A reducer refused an action.
    #[error("reducer for {atom} rejected the action: {source}")]
    ReducerRejected {
        /// The reducer atom.
        atom: String,
        /// The reducer's own error.
        source: BoxError,
    },

    /// The atom has an asynchronous computation outstanding.
    #[error("atom {atom} is pending")]
    Pending {
        /// The atom that is not yet settled.
        atom: String,
    },

    /// A read or write function failed, or an async computation rejected.
    #[error("atom {atom} failed: {source}")]
    Failed {
        /// The atom whose computation failed.
        atom: String,
        /// The underlying error.
        source: BoxError,
    },

    /// A storage collaborator or codec failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// An async read was evaluated with no tokio runtime to drive it.
    #[error("no async runtime available to evaluate {atom}")]
    NoRuntime {
        /// The async atom.
        atom: String,
    },
}

/// Plain message error, used when a failure has no richer source.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Message(pub String);

impl AtomError {
    /// Wrap an arbitrary error as a failure of `atom`.
    pub fn failed<E>(atom: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed {
            atom: atom.into(),
            source: Arc::new(source),
        }
    }

    /// Build a failure of `atom` from a message.
    pub fn message(atom: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failed(atom, Message(message.into()))
    }

    /// Build the suspension signal for `atom`.
    pub fn pending(atom: impl Into<String>) -> Self {
        Self::Pending { atom: atom.into() }
    }

    /// Whether this is the suspension signal rather than a real failure.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    /// Whether this error reports a dependency cycle.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CyclicDependency { .. })
    }
}

impl PartialEq for AtomError {
    fn eq(&self, other: &Self) -> bool {
        use AtomError::*;

        match (self, other) {
            (
                CyclicDependency { atom: a, path: p },
                CyclicDependency { atom: b, path: q },
            ) => a == b && p == q,
            (NotWritable { atom: a }, NotWritable { atom: b }) => a == b,
            (
                ScopeMismatch { expected: a, found: b },
                ScopeMismatch { expected: c, found: d },
            ) => a == c && b == d,
            (
                ReducerRejected { atom: a, source: s },
                ReducerRejected { atom: b, source: t },
            ) => a == b && Arc::ptr_eq(s, t),
            (Pending { atom: a }, Pending { atom: b }) => a == b,
            (Failed { atom: a, source: s }, Failed { atom: b, source: t }) => {
                a == b && Arc::ptr_eq(s, t)
            }
            (Storage(a), Storage(b)) => a == b,
            (NoRuntime { atom: a }, NoRuntime { atom: b }) => a == b,
            _ => false,
        }
    }
}
