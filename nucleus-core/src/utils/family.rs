//! Atom Families
//!
//! A family hands out one atom definition per parameter, creating it on the
//! first request and returning the cached definition afterwards. Entries
//! live until they are removed explicitly or an eviction predicate installed
//! with [`AtomFamily::set_should_remove`] says they are stale.
//!
//! Parameters are matched with `Eq + Hash` by default. Families created with
//! [`AtomFamily::with_equality`] match with a caller-supplied predicate
//! instead, for parameters that have no useful `Hash` or that should compare
//! by identity.
//!
//! Removed and evicted definitions are retired: stores treat edges to them
//! as stale, so derived atoms that looked them up through the family look
//! them up again and get the fresh definition.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::atom::AtomHandle;

type Create<P, W> = Arc<dyn Fn(&P) -> W + Send + Sync>;
type ShouldRemove<P> = Arc<dyn Fn(Instant, &P) -> bool + Send + Sync>;
type Equality<P> = Arc<dyn Fn(&P, &P) -> bool + Send + Sync>;

struct Entry<W> {
    atom: W,
    created_at: Instant,
}

impl<W> Entry<W> {
    fn new(atom: W) -> Self {
        Self {
            atom,
            created_at: Instant::now(),
        }
    }
}

/// Storage behind a family. Every method is one critical section.
trait FamilyCache<P, W>: Send + Sync {
    /// The cached atom for `param`, or a new one from `create` when there is
    /// none or `stale` rejects it. Also returns the atom that was replaced.
    fn get_or_insert(
        &self,
        param: &P,
        stale: &dyn Fn(Instant, &P) -> bool,
        create: &dyn Fn() -> W,
    ) -> (W, Option<W>);

    fn remove(&self, param: &P) -> Option<W>;

    /// Drop every entry `remove` selects and return their atoms.
    fn remove_where(&self, remove: &dyn Fn(Instant, &P) -> bool) -> Vec<W>;

    fn params(&self) -> Vec<P>;

    fn len(&self) -> usize;
}

/// Hashed cache for `Eq + Hash` parameters.
struct KeyedCache<P, W> {
    map: DashMap<P, Entry<W>>,
}

impl<P, W> FamilyCache<P, W> for KeyedCache<P, W>
where
    P: Eq + Hash + Clone + Send + Sync,
    W: AtomHandle,
{
    fn get_or_insert(
        &self,
        param: &P,
        stale: &dyn Fn(Instant, &P) -> bool,
        create: &dyn Fn() -> W,
    ) -> (W, Option<W>) {
        match self.map.entry(param.clone()) {
            MapEntry::Occupied(mut occupied) => {
                if !stale(occupied.get().created_at, param) {
                    return (occupied.get().atom.clone(), None);
                }
                let atom = create();
                let evicted = occupied.insert(Entry::new(atom.clone()));
                (atom, Some(evicted.atom))
            }
            MapEntry::Vacant(vacant) => {
                let atom = create();
                vacant.insert(Entry::new(atom.clone()));
                (atom, None)
            }
        }
    }

    fn remove(&self, param: &P) -> Option<W> {
        self.map.remove(param).map(|(_, entry)| entry.atom)
    }

    fn remove_where(&self, remove: &dyn Fn(Instant, &P) -> bool) -> Vec<W> {
        let mut removed = Vec::new();
        self.map.retain(|param, entry| {
            if remove(entry.created_at, param) {
                removed.push(entry.atom.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn params(&self) -> Vec<P> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Linear cache for parameters matched by a custom predicate.
struct ScannedCache<P, W> {
    entries: Mutex<Vec<(P, Entry<W>)>>,
    equal: Equality<P>,
}

impl<P, W> FamilyCache<P, W> for ScannedCache<P, W>
where
    P: Clone + Send + Sync,
    W: AtomHandle,
{
    fn get_or_insert(
        &self,
        param: &P,
        stale: &dyn Fn(Instant, &P) -> bool,
        create: &dyn Fn() -> W,
    ) -> (W, Option<W>) {
        let mut entries = self.entries.lock();
        let found = entries.iter().position(|(key, _)| (self.equal)(key, param));

        match found {
            Some(index) => {
                let (key, entry) = &entries[index];
                if !stale(entry.created_at, key) {
                    return (entry.atom.clone(), None);
                }
                let atom = create();
                let (_, evicted) =
                    std::mem::replace(&mut entries[index], (param.clone(), Entry::new(atom.clone())));
                (atom, Some(evicted.atom))
            }
            None => {
                let atom = create();
                entries.push((param.clone(), Entry::new(atom.clone())));
                (atom, None)
            }
        }
    }

    fn remove(&self, param: &P) -> Option<W> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|(key, _)| (self.equal)(key, param))?;
        Some(entries.remove(index).1.atom)
    }

    fn remove_where(&self, remove: &dyn Fn(Instant, &P) -> bool) -> Vec<W> {
        let mut removed = Vec::new();
        self.entries.lock().retain(|(param, entry)| {
            if remove(entry.created_at, param) {
                removed.push(entry.atom.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    fn params(&self) -> Vec<P> {
        self.entries.lock().iter().map(|(param, _)| param.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A cache of atoms created on demand, one per parameter.
///
/// `create` runs inside the cache's critical section and must not call back
/// into the same family.
///
/// # Example
///
/// ```rust,ignore
/// let todos = AtomFamily::new(|id: &u32| atom(Todo::new(*id)));
///
/// let first = todos.get(&1);
/// assert_eq!(first, todos.get(&1));
///
/// // Evict entries older than a minute on their next lookup.
/// todos.set_should_remove(|created_at, _| created_at.elapsed() > Duration::from_secs(60));
/// ```
pub struct AtomFamily<P, W> {
    create: Create<P, W>,
    cache: Box<dyn FamilyCache<P, W>>,
    should_remove: RwLock<Option<ShouldRemove<P>>>,
}

impl<P, W> AtomFamily<P, W>
where
    P: Clone + Send + Sync + 'static,
    W: AtomHandle,
{
    /// Create a family whose parameters are matched with `Eq + Hash`.
    pub fn new<F>(create: F) -> Self
    where
        P: Eq + Hash,
        F: Fn(&P) -> W + Send + Sync + 'static,
    {
        Self {
            create: Arc::new(create),
            cache: Box::new(KeyedCache {
                map: DashMap::new(),
            }),
            should_remove: RwLock::new(None),
        }
    }

    /// Create a family whose parameters are matched with `equal`.
    ///
    /// Lookups scan the cached entries, so this suits small families.
    pub fn with_equality<F, E>(create: F, equal: E) -> Self
    where
        F: Fn(&P) -> W + Send + Sync + 'static,
        E: Fn(&P, &P) -> bool + Send + Sync + 'static,
    {
        Self {
            create: Arc::new(create),
            cache: Box::new(ScannedCache {
                entries: Mutex::new(Vec::new()),
                equal: Arc::new(equal),
            }),
            should_remove: RwLock::new(None),
        }
    }

    /// The atom for `param`, created if it is not cached or was evicted.
    pub fn get(&self, param: &P) -> W {
        let should_remove = self.should_remove.read().clone();
        let stale = |created_at: Instant, param: &P| {
            should_remove
                .as_ref()
                .is_some_and(|should_remove| should_remove(created_at, param))
        };
        let create = || (self.create)(param);

        let (atom, evicted) = self.cache.get_or_insert(param, &stale, &create);
        if let Some(evicted) = evicted {
            debug!(atom = %evicted.atom_id(), "family entry evicted on lookup");
            evicted.retire();
        }
        atom
    }

    /// Drop the entry for `param` and retire its atom.
    ///
    /// The next [`get`](Self::get) for `param` creates a new definition.
    ///
    /// A family is not tied to any store, so nothing is pushed to stores
    /// here. A store rebuilds dependents of the retired atom on their next
    /// read and drops its node at that point; until then mounted dependents
    /// keep their last value and their listeners stay quiet. Unmounted,
    /// unread entries go on [`Store::collect_garbage`].
    ///
    /// [`Store::collect_garbage`]: crate::Store::collect_garbage
    pub fn remove(&self, param: &P) -> Option<W> {
        let removed = self.cache.remove(param)?;
        debug!(atom = %removed.atom_id(), "family entry removed");
        removed.retire();
        Some(removed)
    }

    /// Install an eviction predicate.
    ///
    /// It runs right away over every cached entry, then on each lookup;
    /// entries it selects are dropped and their atoms retired, with the
    /// same effect on stores as [`remove`](Self::remove).
    pub fn set_should_remove<F>(&self, should_remove: F)
    where
        F: Fn(Instant, &P) -> bool + Send + Sync + 'static,
    {
        let should_remove: ShouldRemove<P> = Arc::new(should_remove);
        *self.should_remove.write() = Some(Arc::clone(&should_remove));

        let removed = self
            .cache
            .remove_where(&|created_at, param| should_remove(created_at, param));
        if !removed.is_empty() {
            debug!(count = removed.len(), "family entries evicted");
        }
        for atom in removed {
            atom.retire();
        }
    }

    /// Remove the eviction predicate.
    pub fn clear_should_remove(&self) {
        *self.should_remove.write() = None;
    }

    /// Parameters with a cached entry.
    pub fn params(&self) -> Vec<P> {
        self.cache.params()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.len() == 0
    }
}

impl<P, W> fmt::Debug for AtomFamily<P, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomFamily")
            .field("len", &self.cache.len())
            .field("should_remove", &self.should_remove.read().is_some())
            .finish()
    }
}
