//! Utilities
//!
//! Everything in this module is built from the public atom and store API;
//! none of it reaches into the graph.
//!
//! - [`AtomFamily`]: a cache of atoms created on demand per parameter
//! - [`select_atom`] / [`select_atom_with`]: equality-gated projections
//! - [`atom_with_reset`] / [`atom_with_default`]: atoms that accept
//!   [`Resettable::Reset`]
//! - [`atom_with_reducer`]: atoms written with actions
//! - [`atom_with_storage`]: atoms persisted in a [`KeyValueStorage`]
//! - [`atom_with_observable`]: atoms fed by an [`Observable`] while mounted
//! - [`atom_with_location`]: atoms bound to a parameter of a [`Location`]
//!   fragment
//! - [`loadable`]: a view of any atom that never suspends

mod default;
mod family;
mod loadable;
mod location;
mod observable;
mod reducer;
mod reset;
mod select;
mod storage;

pub use default::atom_with_default;
pub use family::AtomFamily;
pub use loadable::loadable;
pub use location::{atom_with_location, Location, MemoryLocation};
pub use observable::{atom_with_observable, Emission, Observable};
pub use reducer::atom_with_reducer;
pub use reset::{atom_with_reset, Resettable, ResettableAtom};
pub use select::{select_atom, select_atom_with};
pub use storage::{
    atom_with_storage, Codec, JsonCodec, KeyValueStorage, MemoryStorage, MessagePackCodec,
};
