//! Atom Definitions
//!
//! An atom is an immutable recipe for one addressable piece of state: how its
//! value is produced and, optionally, how writes to it are applied. The
//! definition holds no state of its own. Live values are kept per scope by a
//! [`Store`](crate::Store), keyed by the definition's [`AtomId`].
//!
//! # Kinds of Atoms
//!
//! - Primitive atoms carry an initial value and store whatever is written to
//!   them ([`atom`]).
//! - Derived atoms compute their value from other atoms through a tracking
//!   [`Getter`] ([`Atom::derived`], [`Atom::derived_async`]).
//! - Writable derived atoms pair a read function with a write function
//!   ([`WritableAtom::new`]); write-only atoms are writable atoms whose value
//!   is `()` ([`WritableAtom::write_only`]).
//!
//! # Handles
//!
//! [`Atom<T>`] is the read side of any definition. [`WritableAtom<T, A>`]
//! dereferences to `Atom<T>` and adds a write function taking arguments of
//! type `A`. Cloning a handle shares the definition, so a clone has the same
//! identity as the original.

use std::any::Any;
use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;

use super::context::{Getter, SetSelf, WriteContext};
use super::id::AtomId;
use crate::error::{AtomError, Result};
use crate::store::Store;

/// Bound shared by every value an atom can hold.
///
/// `PartialEq` decides whether a write or a recomputation actually changed
/// the value. Equal values do not bump the node's epoch and never notify.
pub trait AtomValue: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> AtomValue for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

/// Cleanup returned by mount hooks, run when the atom is unmounted.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Type-erased committed value as stored in graph nodes.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

type SyncRead<T> = Arc<dyn Fn(&Getter) -> Result<T> + Send + Sync>;
type AsyncRead<T> = Arc<dyn Fn(Getter) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type WriteFn<T, A> = Arc<dyn Fn(&WriteContext<'_, T>, A) -> Result<()> + Send + Sync>;
type OnMountFn<A> = Arc<dyn Fn(SetSelf<A>) -> Option<Cleanup> + Send + Sync>;
type RestoreFn<T> = Arc<dyn Fn(&WriteContext<'_, T>, T) -> Result<()> + Send + Sync>;

/// Bumped whenever a definition is retired, so stores know to re-validate
/// cached dependency edges.
static RETIRE_GENERATION: AtomicU64 = AtomicU64::new(0);

pub(crate) fn retire_generation() -> u64 {
    RETIRE_GENERATION.load(Ordering::Acquire)
}

/// How a definition produces its value.
enum Read<T> {
    /// Primitive: the initial value, replaced by writes.
    Value(T),
    Sync(SyncRead<T>),
    Async(AsyncRead<T>),
}

/// Outcome of running a read function once.
pub(crate) enum Evaluation {
    /// The read settled synchronously.
    Ready(Result<AnyValue>),
    /// The read returned a computation that settles later.
    Pending(BoxFuture<'static, Result<AnyValue>>),
}

/// Object-safe view of a definition used by the store.
pub(crate) trait ErasedAtom: Send + Sync + 'static {
    fn id(&self) -> AtomId;

    fn label(&self) -> Option<String>;

    fn set_label(&self, label: String);

    /// Name used in logs and errors: `atom7` or `atom7:count`.
    fn name(&self) -> String {
        match self.label() {
            Some(label) => format!("{}:{}", self.id(), label),
            None => self.id().to_string(),
        }
    }

    fn is_primitive(&self) -> bool;

    fn initial_value(&self) -> Option<AnyValue>;

    fn evaluate(&self, getter: Getter) -> Evaluation;

    fn values_equal(&self, a: &AnyValue, b: &AnyValue) -> bool;

    fn debug_value(&self, value: &AnyValue) -> String;

    fn has_on_mount(&self) -> bool;

    /// Run the mount hook, if any. `this` is the erased handle of `self`.
    fn mount(&self, this: &Arc<dyn ErasedAtom>, store: &Store) -> Option<Cleanup>;

    /// Put a snapshot value back into a primitive atom, through its restore
    /// hook if it has one.
    fn restore(&self, this: &Arc<dyn ErasedAtom>, store: &Store, value: AnyValue) -> Result<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn retire(&self);

    fn is_retired(&self) -> bool;
}

pub(crate) struct AtomInner<T, A> {
    id: AtomId,
    label: RwLock<Option<Arc<str>>>,
    read: Read<T>,
    write: Option<WriteFn<T, A>>,
    on_mount: RwLock<Option<OnMountFn<A>>>,
    restore: RwLock<Option<RestoreFn<T>>>,
    retired: AtomicBool,
}

impl<T, A> AtomInner<T, A> {
    fn new(read: Read<T>, write: Option<WriteFn<T, A>>) -> Self {
        Self {
            id: AtomId::next(),
            label: RwLock::new(None),
            read,
            write,
            on_mount: RwLock::new(None),
            restore: RwLock::new(None),
            retired: AtomicBool::new(false),
        }
    }
}

impl<T, A> ErasedAtom for AtomInner<T, A>
where
    T: AtomValue,
    A: Send + 'static,
{
    fn id(&self) -> AtomId {
        self.id
    }

    fn label(&self) -> Option<String> {
        self.label.read().as_deref().map(str::to_owned)
    }

    fn set_label(&self, label: String) {
        *self.label.write() = Some(Arc::from(label));
    }

    fn is_primitive(&self) -> bool {
        matches!(self.read, Read::Value(_))
    }

    fn initial_value(&self) -> Option<AnyValue> {
        match &self.read {
            Read::Value(value) => Some(Arc::new(value.clone())),
            _ => None,
        }
    }

    fn evaluate(&self, getter: Getter) -> Evaluation {
        match &self.read {
            Read::Value(value) => Evaluation::Ready(Ok(Arc::new(value.clone()))),
            Read::Sync(read) => {
                Evaluation::Ready(read(&getter).map(|value| Arc::new(value) as AnyValue))
            }
            Read::Async(read) => {
                let computation = read(getter);
                Evaluation::Pending(
                    async move { computation.await.map(|value| Arc::new(value) as AnyValue) }
                        .boxed(),
                )
            }
        }
    }

    fn values_equal(&self, a: &AnyValue, b: &AnyValue) -> bool {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn debug_value(&self, value: &AnyValue) -> String {
        match value.downcast_ref::<T>() {
            Some(value) => format!("{value:?}"),
            None => "<foreign value>".to_owned(),
        }
    }

    fn has_on_mount(&self) -> bool {
        self.on_mount.read().is_some()
    }

    fn mount(&self, this: &Arc<dyn ErasedAtom>, store: &Store) -> Option<Cleanup> {
        let hook = self.on_mount.read().clone()?;
        let inner = Arc::clone(this).into_any().downcast::<Self>().ok()?;
        hook(SetSelf::new(store, WritableAtom::from_inner(inner)))
    }

    fn restore(&self, this: &Arc<dyn ErasedAtom>, store: &Store, value: AnyValue) -> Result<()> {
        let Some(hook) = self.restore.read().clone() else {
            return store.write_primitive(this, value);
        };
        let Some(value) = value.downcast_ref::<T>().cloned() else {
            return Err(AtomError::NotWritable { atom: self.name() });
        };
        hook(&WriteContext::new(store, this), value)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn retire(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            RETIRE_GENERATION.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Read Handles
// ----------------------------------------------------------------------------

/// Read handle to an atom definition producing values of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = atom(1);
/// let doubled = Atom::derived({
///     let count = count.clone();
///     move |get| Ok(get.get(&count)? * 2)
/// });
///
/// let store = Store::new();
/// assert_eq!(store.get(&doubled)?, 2);
/// ```
pub struct Atom<T> {
    erased: Arc<dyn ErasedAtom>,
    _value: PhantomData<fn() -> T>,
}

impl<T: AtomValue> Atom<T> {
    fn from_erased(erased: Arc<dyn ErasedAtom>) -> Self {
        Self {
            erased,
            _value: PhantomData,
        }
    }

    /// Create a read-only atom computed from other atoms.
    ///
    /// Every atom read through the getter becomes a dependency; the set of
    /// dependencies is rediscovered on each evaluation.
    pub fn derived<F>(read: F) -> Self
    where
        F: Fn(&Getter) -> Result<T> + Send + Sync + 'static,
    {
        let inner: AtomInner<T, Infallible> = AtomInner::new(Read::Sync(Arc::new(read)), None);
        Self::from_erased(Arc::new(inner))
    }

    /// Create a read-only atom whose computation settles asynchronously.
    ///
    /// The future runs on the store's tokio runtime. Reads made through the
    /// getter are tracked for as long as the evaluation is still current.
    pub fn derived_async<F, Fut>(read: F) -> Self
    where
        F: Fn(Getter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let read: AsyncRead<T> = Arc::new(move |get| read(get).boxed());
        let inner: AtomInner<T, Infallible> = AtomInner::new(Read::Async(read), None);
        Self::from_erased(Arc::new(inner))
    }

    /// Get the atom's unique ID.
    pub fn id(&self) -> AtomId {
        self.erased.id()
    }

    /// Get the debug label, if one was set.
    pub fn label(&self) -> Option<String> {
        self.erased.label()
    }

    /// Whether this atom stores written values directly.
    pub fn is_primitive(&self) -> bool {
        self.erased.is_primitive()
    }

    pub(crate) fn erased(&self) -> &Arc<dyn ErasedAtom> {
        &self.erased
    }
}


impl<T> Atom<T> {
    /// Set the debug label shown in logs, errors and snapshots.
    pub fn set_label(&self, label: impl Into<String>) {
        self.erased.set_label(label.into());
    }

    /// Builder form of [`set_label`](Self::set_label).
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.set_label(label);
        self
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            erased: Arc::clone(&self.erased),
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.erased.id() == other.erased.id()
    }
}

impl<T> Eq for Atom<T> {}

impl<T> Hash for Atom<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.erased.id().hash(state);
    }
}

impl<T> Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.erased.id())
            .field("label", &self.erased.label())
            .field("primitive", &self.erased.is_primitive())
            .finish()
    }
}

impl<T> fmt::Display for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.erased.name())
    }
}

// ----------------------------------------------------------------------------
// Writable Handles
// ----------------------------------------------------------------------------

/// An atom that also accepts writes with arguments of type `A`.
///
/// Dereferences to [`Atom<T>`], so a writable atom can be read anywhere a
/// read handle is expected.
pub struct WritableAtom<T, A> {
    atom: Atom<T>,
    inner: Arc<AtomInner<T, A>>,
}

/// A primitive atom: written values replace the stored value.
pub type PrimitiveAtom<T> = WritableAtom<T, T>;

/// Create a primitive atom holding `initial` until it is written.
///
/// ```rust,ignore
/// let count = atom(0).with_label("count");
/// store.set(&count, 5)?;
/// ```
pub fn atom<T: AtomValue>(initial: T) -> PrimitiveAtom<T> {
    WritableAtom::primitive(initial, |ctx, value| ctx.set_self(value))
}

impl<T, A> WritableAtom<T, A>
where
    T: AtomValue,
    A: Send + 'static,
{
    fn from_inner(inner: Arc<AtomInner<T, A>>) -> Self {
        let erased: Arc<dyn ErasedAtom> = inner.clone();
        Self {
            atom: Atom::from_erased(erased),
            inner,
        }
    }

    /// Create a derived atom with a custom write function.
    pub fn new<R, W>(read: R, write: W) -> Self
    where
        R: Fn(&Getter) -> Result<T> + Send + Sync + 'static,
        W: Fn(&WriteContext<'_, T>, A) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_inner(Arc::new(AtomInner::new(
            Read::Sync(Arc::new(read)),
            Some(Arc::new(write)),
        )))
    }

    /// Create an async derived atom with a custom write function.
    pub fn new_async<R, Fut, W>(read: R, write: W) -> Self
    where
        R: Fn(Getter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        W: Fn(&WriteContext<'_, T>, A) -> Result<()> + Send + Sync + 'static,
    {
        let read: AsyncRead<T> = Arc::new(move |get| read(get).boxed());
        Self::from_inner(Arc::new(AtomInner::new(
            Read::Async(read),
            Some(Arc::new(write)),
        )))
    }

    /// Create a primitive atom whose writes go through `write`.
    ///
    /// The write function decides what reaches the stored value, usually via
    /// [`WriteContext::set_self`].
    pub fn primitive<W>(initial: T, write: W) -> Self
    where
        W: Fn(&WriteContext<'_, T>, A) -> Result<()> + Send + Sync + 'static,
    {
        Self::from_inner(Arc::new(AtomInner::new(
            Read::Value(initial),
            Some(Arc::new(write)),
        )))
    }

    /// Install a hook run when the atom becomes mounted in a store.
    ///
    /// The hook receives a setter bound to this atom and may return a cleanup
    /// that runs when the atom is unmounted again.
    pub fn set_on_mount<F>(&self, on_mount: F)
    where
        F: Fn(SetSelf<A>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        *self.inner.on_mount.write() = Some(Arc::new(on_mount));
    }

    /// Builder form of [`set_on_mount`](Self::set_on_mount).
    pub fn with_on_mount<F>(self, on_mount: F) -> Self
    where
        F: Fn(SetSelf<A>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        self.set_on_mount(on_mount);
        self
    }

    /// Install the write path used when [`Store::restore`] or
    /// [`Store::hydrate`] puts a value back into this atom.
    ///
    /// Without one, the value is committed as-is. Atoms that mirror their
    /// value somewhere else use this to keep the mirror in step; the hook
    /// should end with [`WriteContext::set_self`].
    pub fn set_restore<F>(&self, restore: F)
    where
        F: Fn(&WriteContext<'_, T>, T) -> Result<()> + Send + Sync + 'static,
    {
        *self.inner.restore.write() = Some(Arc::new(restore));
    }

    /// Builder form of [`set_restore`](Self::set_restore).
    pub fn with_restore<F>(self, restore: F) -> Self
    where
        F: Fn(&WriteContext<'_, T>, T) -> Result<()> + Send + Sync + 'static,
    {
        self.set_restore(restore);
        self
    }

    /// Builder form of [`Atom::set_label`].
    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.atom.set_label(label);
        self
    }

    /// Borrow the read handle.
    pub fn as_atom(&self) -> &Atom<T> {
        &self.atom
    }

    /// Apply the write function.
    pub(crate) fn write(&self, ctx: &WriteContext<'_, T>, args: A) -> Result<()> {
        match &self.inner.write {
            Some(write) => write(ctx, args),
            None => Err(AtomError::NotWritable {
                atom: self.inner.name(),
            }),
        }
    }
}

impl<A: Send + 'static> WritableAtom<(), A> {
    /// Create an atom that only carries a write function.
    ///
    /// Reading it yields `()`; it exists to bundle writes to other atoms.
    pub fn write_only<W>(write: W) -> Self
    where
        W: Fn(&WriteContext<'_, ()>, A) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(|_| Ok(()), write)
    }
}

impl<T, A> Deref for WritableAtom<T, A> {
    type Target = Atom<T>;

    fn deref(&self) -> &Atom<T> {
        &self.atom
    }
}

impl<T, A> AsRef<Atom<T>> for WritableAtom<T, A> {
    fn as_ref(&self) -> &Atom<T> {
        &self.atom
    }
}

impl<T, A> Clone for WritableAtom<T, A> {
    fn clone(&self) -> Self {
        Self {
            atom: self.atom.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, A> PartialEq for WritableAtom<T, A> {
    fn eq(&self, other: &Self) -> bool {
        self.atom == other.atom
    }
}

impl<T, A> Eq for WritableAtom<T, A> {}

impl<T, A> Hash for WritableAtom<T, A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.atom.hash(state);
    }
}

impl<T, A> Debug for WritableAtom<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableAtom")
            .field("id", &self.atom.erased.id())
            .field("label", &self.atom.erased.label())
            .field("primitive", &self.atom.erased.is_primitive())
            .finish()
    }
}

impl<T, A> fmt::Display for WritableAtom<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.atom, f)
    }
}

// ----------------------------------------------------------------------------
// Handle Trait
// ----------------------------------------------------------------------------

/// Surface shared by every atom handle, used by caches that hand out atoms.
pub trait AtomHandle: Clone + Send + Sync + 'static {
    /// The definition's identity.
    fn atom_id(&self) -> AtomId;

    /// Mark the definition as discarded by its owner, so stores rebuild
    /// anything derived from it.
    #[doc(hidden)]
    fn retire(&self);

    /// Whether [`retire`](Self::retire) was called.
    fn is_retired(&self) -> bool;
}

impl<T: AtomValue> AtomHandle for Atom<T> {
    fn atom_id(&self) -> AtomId {
        self.erased.id()
    }

    fn retire(&self) {
        self.erased.retire();
    }

    fn is_retired(&self) -> bool {
        self.erased.is_retired()
    }
}

impl<T: AtomValue, A: Send + 'static> AtomHandle for WritableAtom<T, A> {
    fn atom_id(&self) -> AtomId {
        self.atom.atom_id()
    }

    fn retire(&self) {
        self.atom.retire();
    }

    fn is_retired(&self) -> bool {
        AtomHandle::is_retired(&self.atom)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_ids_are_unique() {
        let a1 = atom(0);
        let a2 = atom(0);
        let a3 = Atom::derived(|_| Ok(0));

        assert_ne!(a1.id(), a2.id());
        assert_ne!(a2.id(), a3.id());
        assert_ne!(a1.id(), a3.id());
    }

    #[test]
    fn clone_shares_identity() {
        let count = atom(0);
        let clone = count.clone();

        assert_eq!(count, clone);
        assert_eq!(count.id(), clone.id());

        clone.set_label("count");
        assert_eq!(count.label().as_deref(), Some("count"));
    }

    #[test]
    fn display_includes_label() {
        let plain = atom(1);
        let labeled = atom(1).with_label("total");

        assert_eq!(plain.to_string(), plain.id().to_string());
        assert_eq!(labeled.to_string(), format!("{}:total", labeled.id()));
    }

    #[test]
    fn primitive_and_derived_kinds() {
        let count = atom(0);
        let doubled = Atom::derived(|_| Ok(0));
        let writer = WritableAtom::write_only(|_, _: i32| Ok(()));

        assert!(count.is_primitive());
        assert!(!doubled.is_primitive());
        assert!(!writer.is_primitive());
    }

    #[test]
    fn retire_bumps_generation() {
        let count = atom(0);
        let before = retire_generation();

        count.retire();
        assert!(AtomHandle::is_retired(&count));
        assert!(retire_generation() > before);

        // Retiring twice is a no-op for this atom.
        let after = retire_generation();
        count.retire();
        assert!(retire_generation() >= after);
    }

    #[test]
    fn mount_hook_is_recorded() {
        let count = atom(0);
        assert!(!count.erased().has_on_mount());

        count.set_on_mount(|_| None);
        assert!(count.erased().has_on_mount());
    }
}
