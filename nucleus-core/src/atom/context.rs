//! Evaluation Context
//!
//! Read and write functions never touch the store directly. They receive a
//! context object that knows which node is running:
//!
//! - [`Getter`] is handed to read functions. Every atom read through it is
//!   recorded as a dependency of the evaluating node.
//! - [`WriteContext`] is handed to write functions. It reads untracked and
//!   routes writes to other atoms or to the atom's own node.
//! - [`SetSelf`] is handed to mount hooks so external sources can write into
//!   the atom while it is mounted.
//!
//! # Evaluation Frames
//!
//! While a read function runs, the store keeps an [`EvalFrame`] for it on a
//! per-store stack. Reads made through the getter land in the frame on top;
//! the frame is diffed against the node's previous edges when the function
//! returns. The stack doubles as the cycle detector: reading an atom that
//! already has a frame on the stack is a cycle.

use std::marker::PhantomData;
use std::sync::Arc;

use indexmap::IndexMap;

use super::definition::{AtomValue, ErasedAtom, WritableAtom};
use super::id::AtomId;
use super::Atom;
use crate::error::{AtomError, Result};
use crate::store::{Store, WeakStore};

// ----------------------------------------------------------------------------
// Getter
// ----------------------------------------------------------------------------

/// Tracking read handle passed to read functions.
///
/// A getter is cheap to clone and `'static`, so async read functions can
/// keep it across await points. Reads made after the evaluation has been
/// superseded still return values but no longer record edges.
#[derive(Clone)]
pub struct Getter {
    store: Store,
    atom: AtomId,
    token: u64,
}

impl Getter {
    pub(crate) fn new(store: Store, atom: AtomId, token: u64) -> Self {
        Self { store, atom, token }
    }

    /// Read `atom` and record it as a dependency.
    ///
    /// Returns [`AtomError::Pending`] when the dependency has not settled.
    pub fn get<U: AtomValue>(&self, atom: &Atom<U>) -> Result<U> {
        self.store.read_tracked(self.atom, self.token, atom)
    }

    /// Wait for `atom` to settle, recording it as a dependency.
    pub async fn wait<U: AtomValue>(&self, atom: &Atom<U>) -> Result<U> {
        self.store.wait_settled(|| self.get(atom)).await
    }

    /// The evaluating atom's last committed value, read without tracking.
    ///
    /// Used by read functions that want to keep returning the previous value
    /// when a recomputation produces something equivalent.
    pub fn previous<T: AtomValue>(&self) -> Option<T> {
        self.store.committed_value(self.atom)
    }

    /// Whether this evaluation is still the node's latest one.
    pub fn is_current(&self) -> bool {
        self.store.is_current_evaluation(self.atom, self.token)
    }

    /// ID of the atom being evaluated.
    pub fn atom_id(&self) -> AtomId {
        self.atom
    }

    /// The suspension signal for the evaluating atom.
    pub fn pending(&self) -> AtomError {
        AtomError::pending(self.store.atom_name(self.atom))
    }

    /// A failure of the evaluating atom with the given message.
    pub fn error(&self, message: impl Into<String>) -> AtomError {
        AtomError::message(self.store.atom_name(self.atom), message)
    }
}

impl std::fmt::Debug for Getter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Getter")
            .field("atom", &self.atom)
            .field("token", &self.token)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Write Context
// ----------------------------------------------------------------------------

/// Context passed to write functions.
///
/// All writes made through one context belong to the same batch: subscribers
/// are notified once, after the outermost write returns.
pub struct WriteContext<'a, T> {
    store: &'a Store,
    this: &'a Arc<dyn ErasedAtom>,
    _value: PhantomData<fn() -> T>,
}

impl<'a, T: AtomValue> WriteContext<'a, T> {
    pub(crate) fn new(store: &'a Store, this: &'a Arc<dyn ErasedAtom>) -> Self {
        Self {
            store,
            this,
            _value: PhantomData,
        }
    }

    /// Read any atom without tracking.
    pub fn get<U: AtomValue>(&self, atom: &Atom<U>) -> Result<U> {
        self.store.get(atom)
    }

    /// Read the atom being written.
    pub fn get_self(&self) -> Result<T> {
        self.store.read_erased(self.this)
    }

    /// Write another atom through its own write function.
    pub fn set<U: AtomValue, B: Send + 'static>(
        &self,
        atom: &WritableAtom<U, B>,
        args: B,
    ) -> Result<()> {
        self.store.write_atom(atom, args)
    }

    /// Store `value` directly in the atom's own node.
    pub fn set_self(&self, value: T) -> Result<()> {
        self.store.write_primitive(self.this, Arc::new(value))
    }

    /// The store the write is running against.
    pub fn store(&self) -> &Store {
        self.store
    }

    /// A failure of the written atom with the given message.
    pub fn error(&self, message: impl Into<String>) -> AtomError {
        AtomError::message(self.this.name(), message)
    }

    /// Display name of the written atom.
    pub fn atom_name(&self) -> String {
        self.this.name()
    }
}

// ----------------------------------------------------------------------------
// Mount Setter
// ----------------------------------------------------------------------------

/// Setter handed to mount hooks.
///
/// Holds the store weakly; once the store is dropped, writes become no-ops.
pub struct SetSelf<A> {
    set: Arc<dyn Fn(A) -> Result<()> + Send + Sync>,
}

impl<A: Send + 'static> SetSelf<A> {
    pub(crate) fn new<T: AtomValue>(store: &Store, atom: WritableAtom<T, A>) -> Self {
        let store: WeakStore = store.downgrade();
        Self {
            set: Arc::new(move |args| match store.upgrade() {
                Some(store) => store.set(&atom, args),
                None => Ok(()),
            }),
        }
    }

    /// Write the atom through its own write function.
    pub fn set(&self, args: A) -> Result<()> {
        (self.set)(args)
    }
}

impl<A> Clone for SetSelf<A> {
    fn clone(&self) -> Self {
        Self {
            set: Arc::clone(&self.set),
        }
    }
}

// ----------------------------------------------------------------------------
// Evaluation Frames
// ----------------------------------------------------------------------------

/// An entry in the evaluation stack.
#[derive(Debug, Clone)]
pub(crate) struct EvalFrame {
    /// The atom being evaluated.
    pub(crate) atom: AtomId,
    /// Token of this evaluation.
    pub(crate) token: u64,
    /// Dependencies read so far, with the epoch observed for each.
    pub(crate) dependencies: IndexMap<AtomId, u64>,
}

/// Guard that pops the frame when dropped.
///
/// This keeps the stack balanced even if a read function panics.
pub(crate) struct FrameGuard<'a> {
    store: &'a Store,
    atom: AtomId,
    finished: bool,
}

impl<'a> FrameGuard<'a> {
    /// Push a frame for `atom` onto the store's evaluation stack.
    pub(crate) fn enter(store: &'a Store, atom: AtomId, token: u64) -> Self {
        store.with_state(|state| {
            state.frames.push(EvalFrame {
                atom,
                token,
                dependencies: IndexMap::new(),
            })
        });

        Self {
            store,
            atom,
            finished: false,
        }
    }

    /// Pop the frame and return the dependencies it collected.
    pub(crate) fn finish(mut self) -> IndexMap<AtomId, u64> {
        self.finished = true;
        self.pop()
            .map(|frame| frame.dependencies)
            .unwrap_or_default()
    }

    fn pop(&self) -> Option<EvalFrame> {
        let popped = self.store.with_state(|state| state.frames.pop());

        // Catch mismatched frames early.
        if let Some(frame) = &popped {
            debug_assert_eq!(
                frame.atom, self.atom,
                "EvalFrame mismatch: expected {:?}, got {:?}",
                self.atom, frame.atom
            );
        }
        popped
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}
