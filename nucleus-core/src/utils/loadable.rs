//! Loadable wrapper.

use crate::atom::{Atom, AtomValue, Loadable};

/// Wrap `source` so that reading it never suspends.
///
/// The wrapper is [`Loadable::Loading`] while `source` is pending, then holds
/// its value or its error. It depends on `source`, so it moves between the
/// three states as `source` does.
pub fn loadable<T: AtomValue>(source: &Atom<T>) -> Atom<Loadable<T>> {
    let source = source.clone();
    Atom::derived(move |get| Ok(Loadable::from_result(get.get(&source))))
}
