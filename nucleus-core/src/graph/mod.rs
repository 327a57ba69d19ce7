//! Dependency Graph
//!
//! This module implements the dependency graph a [`Store`](crate::Store)
//! keeps for one scope.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes hold the live state of one atom: its committed value, epoch,
//!   dirty state and mount record
//! - Edges represent dependencies: if A read B during its last evaluation,
//!   there is an edge from B to A
//!
//! Edges are not declared. They are whatever the last evaluation read, so the
//! graph is rewritten every time a derived atom recomputes.
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena indexed by [`AtomId`](crate::atom::AtomId)
//!    rather than pointing at each other, so edges can be added and pruned
//!    without touching ownership.
//!
//! 2. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.

mod node;
mod scheduler;

pub use node::{DirtyState, NodeKind};

pub(crate) use node::{AtomNode, Listener, NodeValue};
pub(crate) use scheduler::Scheduler;
