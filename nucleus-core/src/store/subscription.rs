//! Subscription handles.

use crate::atom::{AtomId, SubscriptionId};

use super::WeakStore;

/// Keeps a listener registered and its atom mounted.
///
/// Dropping the handle unsubscribes. Use [`Subscription::detach`] to keep the
/// listener for the lifetime of the store instead.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    store: WeakStore,
    atom: AtomId,
    id: SubscriptionId,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(store: WeakStore, atom: AtomId, id: SubscriptionId) -> Self {
        Self {
            store,
            atom,
            id,
            active: true,
        }
    }

    /// The subscribed atom.
    pub fn atom_id(&self) -> AtomId {
        self.atom
    }

    /// This subscription's ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener now. Unmounts the atom if nothing else keeps it
    /// mounted.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the listener registered without holding the handle.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.atom, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("atom", &self.atom)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
