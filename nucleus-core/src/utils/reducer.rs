//! Reducer atoms.

use std::error::Error as StdError;
use std::sync::Arc;

use crate::atom::{AtomValue, WritableAtom};
use crate::error::AtomError;

/// Create a primitive atom written with actions.
///
/// Each write hands the current value and the action to `reducer` and stores
/// what it returns. A reducer error leaves the value untouched and reaches
/// the writer as [`AtomError::ReducerRejected`].
///
/// ```rust,ignore
/// let count = atom_with_reducer(0, |count: &i32, action: Action| match action {
///     Action::Increment => Ok(count + 1),
///     Action::Decrement if *count == 0 => Err(Underflow),
///     Action::Decrement => Ok(count - 1),
/// });
/// store.set(&count, Action::Increment)?;
/// ```
pub fn atom_with_reducer<T, A, E, F>(initial: T, reducer: F) -> WritableAtom<T, A>
where
    T: AtomValue,
    A: Send + 'static,
    E: StdError + Send + Sync + 'static,
    F: Fn(&T, A) -> Result<T, E> + Send + Sync + 'static,
{
    WritableAtom::primitive(initial, move |ctx, action| {
        let current = ctx.get_self()?;
        let next = reducer(&current, action).map_err(|error| AtomError::ReducerRejected {
            atom: ctx.atom_name(),
            source: Arc::new(error),
        })?;
        ctx.set_self(next)
    })
}
