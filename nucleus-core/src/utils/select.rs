//! Selectors.

use crate::atom::{Atom, AtomValue};

/// Derive a slice of `source`.
///
/// The selector recomputes whenever `source` changes, but only counts as
/// changed when the projection does.
pub fn select_atom<T, U, F>(source: &Atom<T>, select: F) -> Atom<U>
where
    T: AtomValue,
    U: AtomValue,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    select_atom_with(source, select, |a: &U, b: &U| a == b)
}

/// Derive a slice of `source`, deciding change with `equal`.
///
/// When `equal(previous, next)` holds, the previous projection is kept, so
/// neither the selector's dependents nor its listeners see a change.
///
/// ```rust,ignore
/// // Only notify when the name changes, ignoring case.
/// let name = select_atom_with(
///     &user,
///     |user| user.name.clone(),
///     |a, b| a.eq_ignore_ascii_case(b),
/// );
/// ```
pub fn select_atom_with<T, U, F, E>(source: &Atom<T>, select: F, equal: E) -> Atom<U>
where
    T: AtomValue,
    U: AtomValue,
    F: Fn(&T) -> U + Send + Sync + 'static,
    E: Fn(&U, &U) -> bool + Send + Sync + 'static,
{
    let source = source.clone();
    Atom::derived(move |get| {
        let next = select(&get.get(&source)?);
        match get.previous::<U>() {
            Some(previous) if equal(&previous, &next) => Ok(previous),
            _ => Ok(next),
        }
    })
}
