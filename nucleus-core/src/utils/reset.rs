//! Resettable atoms.

use crate::atom::{AtomValue, WritableAtom};

/// Write argument of resettable atoms: a new value, or a request to go back
/// to the initial one.
#[derive(Debug, Clone, PartialEq)]
pub enum Resettable<T> {
    Set(T),
    Reset,
}

impl<T> From<T> for Resettable<T> {
    fn from(value: T) -> Self {
        Self::Set(value)
    }
}

/// An atom written with [`Resettable`] arguments.
pub type ResettableAtom<T> = WritableAtom<T, Resettable<T>>;

/// Create a primitive atom that [`Resettable::Reset`] puts back to `initial`.
///
/// ```rust,ignore
/// let draft = atom_with_reset(String::new());
/// store.set(&draft, "hello".to_string().into())?;
/// store.set(&draft, Resettable::Reset)?;
/// assert_eq!(store.get(&draft)?, "");
/// ```
pub fn atom_with_reset<T: AtomValue>(initial: T) -> ResettableAtom<T> {
    let reset_to = initial.clone();
    WritableAtom::primitive(initial, move |ctx, update| match update {
        Resettable::Set(value) => ctx.set_self(value),
        Resettable::Reset => ctx.set_self(reset_to.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn reset_restores_initial_value() {
        let store = Store::new();
        let count = atom_with_reset(5);

        store.set(&count, Resettable::Set(9)).unwrap();
        assert_eq!(store.get(&count), Ok(9));

        store.set(&count, Resettable::Reset).unwrap();
        assert_eq!(store.get(&count), Ok(5));
    }

    #[test]
    fn reset_notifies_only_when_value_moves() {
        let store = Store::new();
        let count = atom_with_reset(0);

        let hits = Arc::new(AtomicI32::new(0));
        let _sub = store.sub(&count, {
            let hits = hits.clone();
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.set(&count, Resettable::Reset).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        store.set(&count, 3.into()).unwrap();
        store.set(&count, Resettable::Reset).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
