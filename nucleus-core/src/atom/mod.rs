//! Atoms
//!
//! This module defines what an atom is: an immutable definition describing
//! how one piece of state is produced and written. Definitions carry no
//! state; the [`Store`](crate::Store) keeps the live value of every atom per
//! scope.
//!
//! # Concepts
//!
//! ## Primitive Atoms
//!
//! A primitive atom holds an initial value and whatever is written to it
//! afterwards. Writing a value equal to the current one is not a change.
//!
//! ## Derived Atoms
//!
//! A derived atom computes its value from other atoms. Dependencies are not
//! declared up front: every atom read through the [`Getter`] during an
//! evaluation becomes an edge, and the edge set is rediscovered each time
//! the atom is recomputed.
//!
//! ## Async Atoms
//!
//! A derived atom may return a future. Until it settles the atom is pending,
//! and readers receive [`AtomError::Pending`](crate::AtomError::Pending) as a
//! suspension signal.
//!
//! ## Writable Atoms
//!
//! A writable atom adds a write function. Inside it, [`WriteContext`] reads
//! atoms, writes other atoms and stores values into the atom's own node.

mod context;
mod definition;
mod id;
mod loadable;

pub use context::{Getter, SetSelf, WriteContext};
pub use definition::{atom, Atom, AtomHandle, AtomValue, Cleanup, PrimitiveAtom, WritableAtom};
pub use id::{AtomId, ScopeId, SubscriptionId};
pub use loadable::Loadable;

pub(crate) use context::{EvalFrame, FrameGuard};
pub(crate) use definition::{retire_generation, AnyValue, ErasedAtom, Evaluation};
