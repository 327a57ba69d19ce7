//! Nucleus Core
//!
//! This crate provides the core runtime for Nucleus, a scoped reactive atom
//! store. It implements:
//!
//! - Atom definitions: primitive, derived, async and writable atoms
//! - A per-scope dependency graph with push-pull invalidation
//! - Batched, glitch-free subscriber notification
//! - Async settlement with last-writer-wins by evaluation token
//! - Snapshots, restore and hydration
//! - Utilities: families, selectors, resettable/reducer atoms and adapters
//!   for key/value storage, push sources and location fragments
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `atom`: Atom definitions and the contexts handed to read/write functions
//! - `graph`: Per-scope nodes, dependency edges and update ordering
//! - `store`: The store (one scope), subscriptions and snapshots
//! - `utils`: Atoms built on top of the public API
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use nucleus_core::{atom, Atom, Store};
//!
//! // Create a primitive atom
//! let count = atom(1);
//!
//! // Create a derived atom
//! let doubled = Atom::derived({
//!     let count = count.clone();
//!     move |get| Ok(get.get(&count)? * 2)
//! });
//!
//! // Subscribe to it
//! let store = Store::new();
//! let _sub = store.sub(&doubled, || println!("doubled changed"));
//!
//! // Update the primitive
//! store.set(&count, 5)?;
//! // Listener runs once, store.get(&doubled) is now 10
//! ```

pub mod atom;
pub mod error;
mod graph;
pub mod store;
pub mod utils;

pub use atom::{
    atom, Atom, AtomHandle, AtomId, AtomValue, Cleanup, Getter, Loadable, PrimitiveAtom,
    ScopeId, SetSelf, SubscriptionId, WritableAtom, WriteContext,
};
pub use error::{AtomError, BoxError, Result};
pub use graph::{DirtyState, NodeKind};
pub use store::{default_store, Snapshot, Store, StoreBuilder, StoreConfig, Subscription};
pub use utils::{
    atom_with_default, atom_with_location, atom_with_observable, atom_with_reducer,
    atom_with_reset, atom_with_storage, loadable, select_atom, select_atom_with, AtomFamily,
    Codec, Emission, JsonCodec, KeyValueStorage, Location, MemoryLocation, MemoryStorage,
    MessagePackCodec, Observable, Resettable, ResettableAtom,
};
