//! Three-state view of an atom's value.

use crate::error::AtomError;

/// Settled-or-not view of an atom, for consumers that must not suspend.
#[derive(Debug, Clone, PartialEq)]
pub enum Loadable<T> {
    /// An async computation is outstanding.
    Loading,
    /// The atom settled with a value.
    HasData(T),
    /// The atom settled with an error.
    HasError(AtomError),
}

impl<T> Loadable<T> {
    /// Build a loadable from a read result, mapping the suspension signal
    /// to [`Loadable::Loading`].
    pub fn from_result(result: Result<T, AtomError>) -> Self {
        match result {
            Ok(value) => Self::HasData(value),
            Err(error) if error.is_pending() => Self::Loading,
            Err(error) => Self::HasError(error),
        }
    }

    /// Whether the atom is still loading.
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// The settled value, if any.
    pub fn data(&self) -> Option<&T> {
        match self {
            Self::HasData(value) => Some(value),
            _ => None,
        }
    }

    /// The settled error, if any.
    pub fn error(&self) -> Option<&AtomError> {
        match self {
            Self::HasError(error) => Some(error),
            _ => None,
        }
    }

    /// Map the settled value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Loadable<U> {
        match self {
            Self::Loading => Loadable::Loading,
            Self::HasData(value) => Loadable::HasData(f(value)),
            Self::HasError(error) => Loadable::HasError(error),
        }
    }
}
