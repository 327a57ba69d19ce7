//! Atoms with a computed default.

use crate::atom::{atom, AtomValue, Getter, WritableAtom};
use crate::error::Result;

use super::reset::{Resettable, ResettableAtom};

/// Create an atom that follows `read` until it is written.
///
/// A written value overrides the default until [`Resettable::Reset`] is
/// written, after which the atom follows `read` again.
pub fn atom_with_default<T, F>(read: F) -> ResettableAtom<T>
where
    T: AtomValue,
    F: Fn(&Getter) -> Result<T> + Send + Sync + 'static,
{
    let overwrite = atom(None::<T>);
    let current = overwrite.clone();

    WritableAtom::new(
        move |get| match get.get(&current)? {
            Some(value) => Ok(value),
            None => read(get),
        },
        move |ctx, update| match update {
            Resettable::Set(value) => ctx.set(&overwrite, Some(value)),
            Resettable::Reset => ctx.set(&overwrite, None),
        },
    )
}
