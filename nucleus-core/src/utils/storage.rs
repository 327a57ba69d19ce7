//! Storage-Backed Atoms
//!
//! [`atom_with_storage`] binds an atom to one key of a [`KeyValueStorage`]:
//!
//! - The stored value, if any, is read the first time a store reads the
//!   atom and again when it is mounted
//! - Every write is encoded with a [`Codec`] and written through before the
//!   atom commits it
//! - [`Resettable::Reset`] removes the key and restores the initial value
//! - [`Store::restore`](crate::Store::restore) and
//!   [`Store::hydrate`](crate::Store::hydrate) write through as well
//! - While mounted, changes the storage reports through
//!   [`KeyValueStorage::subscribe`] are applied to the atom
//!
//! The storage sees bytes only; the codec owns the serialization format.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use crate::atom::{atom, AtomValue, Cleanup, SetSelf, WritableAtom};
use crate::error::{AtomError, Result};

use super::reset::{Resettable, ResettableAtom};

/// Callback invoked with the new bytes of a key, `None` once it is removed.
pub type StorageWatcher = Box<dyn Fn(Option<Vec<u8>>) + Send + Sync>;

/// Byte-oriented key/value store used by [`atom_with_storage`].
pub trait KeyValueStorage: Send + Sync + 'static {
    /// The bytes stored under `key`.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn write(&self, key: &str, value: Vec<u8>) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Watch `key` for changes made outside this process's atoms.
    ///
    /// Storages that cannot observe outside changes keep the default, which
    /// watches nothing.
    fn subscribe(&self, key: &str, on_change: StorageWatcher) -> Option<Cleanup> {
        let _ = (key, on_change);
        None
    }
}

impl<S: KeyValueStorage> KeyValueStorage for Arc<S> {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        (**self).write(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn subscribe(&self, key: &str, on_change: StorageWatcher) -> Option<Cleanup> {
        (**self).subscribe(key, on_change)
    }
}

/// Converts atom values to and from stored bytes.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON encoding through `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| AtomError::Storage(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| AtomError::Storage(e.to_string()))
    }
}

/// MessagePack encoding through `rmp-serde`, with named struct fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl<T: Serialize + DeserializeOwned> Codec<T> for MessagePackCodec {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| AtomError::Storage(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| AtomError::Storage(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// In-Memory Storage
// ----------------------------------------------------------------------------

type Watcher = Arc<dyn Fn(Option<Vec<u8>>) + Send + Sync>;

#[derive(Default)]
struct MemoryInner {
    values: DashMap<String, Vec<u8>>,
    watchers: DashMap<String, Vec<(u64, Watcher)>>,
    next_watcher: AtomicU64,
}

/// Process-local [`KeyValueStorage`].
///
/// Clones share the same data. [`publish`](Self::publish) stands in for a
/// change made by another writer: it updates the value and tells watchers,
/// whereas writes made through the trait do not.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change `key` as an outside writer would and notify its watchers.
    pub fn publish(&self, key: &str, value: Option<Vec<u8>>) {
        match &value {
            Some(bytes) => {
                self.inner.values.insert(key.to_owned(), bytes.clone());
            }
            None => {
                self.inner.values.remove(key);
            }
        }

        // Call watchers without holding the shard lock.
        let watchers: Vec<Watcher> = self
            .inner
            .watchers
            .get(key)
            .map(|list| list.iter().map(|(_, watcher)| Arc::clone(watcher)).collect())
            .unwrap_or_default();
        trace!(key, watchers = watchers.len(), "storage change published");
        for watcher in watchers {
            watcher(value.clone());
        }
    }

    /// Number of active watchers on `key`.
    pub fn watcher_count(&self, key: &str) -> usize {
        self.inner.watchers.get(key).map_or(0, |list| list.len())
    }

    pub fn len(&self) -> usize {
        self.inner.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.is_empty()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.values.get(key).map(|value| value.value().clone()))
    }

    fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.values.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.values.remove(key);
        Ok(())
    }

    fn subscribe(&self, key: &str, on_change: StorageWatcher) -> Option<Cleanup> {
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers
            .entry(key.to_owned())
            .or_default()
            .push((id, Arc::from(on_change)));

        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        Some(Box::new(move || {
            if let Some(mut list) = inner.watchers.get_mut(&key) {
                list.retain(|(watcher, _)| *watcher != id);
            }
            inner.watchers.remove_if(&key, |_, list| list.is_empty());
        }))
    }
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("keys", &self.inner.values.len())
            .field("watched", &self.inner.watchers.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Storage Atoms
// ----------------------------------------------------------------------------

/// Read and decode `key`, treating failures as "nothing stored".
fn load<T, S, C>(storage: &S, codec: &C, key: &str) -> Option<T>
where
    S: KeyValueStorage + ?Sized,
    C: Codec<T> + ?Sized,
{
    match storage.read(key) {
        Ok(Some(bytes)) => match codec.decode(&bytes) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(key, %error, "stored value could not be decoded");
                None
            }
        },
        Ok(None) => None,
        Err(error) => {
            warn!(key, %error, "storage read failed");
            None
        }
    }
}

/// Create an atom persisted under `key` in `storage`.
///
/// ```rust,ignore
/// let storage = MemoryStorage::new();
/// let theme = atom_with_storage("theme", Theme::Light, storage.clone(), JsonCodec);
///
/// store.set(&theme, Theme::Dark.into())?;
/// assert!(storage.read("theme")?.is_some());
/// ```
pub fn atom_with_storage<T, S, C>(
    key: impl Into<String>,
    initial: T,
    storage: S,
    codec: C,
) -> ResettableAtom<T>
where
    T: AtomValue,
    S: KeyValueStorage,
    C: Codec<T>,
{
    let key: Arc<str> = Arc::from(key.into());
    let storage = Arc::new(storage);
    let codec = Arc::new(codec);

    // `None` until something is written or the atom is mounted; reads then
    // fall back to whatever the storage holds at that point.
    let base = atom(None::<T>)
        .with_on_mount({
            let key = Arc::clone(&key);
            let storage = Arc::clone(&storage);
            let codec = Arc::clone(&codec);
            let initial = initial.clone();
            move |set: SetSelf<Option<T>>| {
                // Catch up with changes made while nothing was watching.
                let current = load(&*storage, &*codec, &key).unwrap_or_else(|| initial.clone());
                if let Err(error) = set.set(Some(current)) {
                    warn!(key = %key, %error, "failed to apply stored value");
                }

                let codec = Arc::clone(&codec);
                let initial = initial.clone();
                let watched = Arc::clone(&key);
                let watcher: StorageWatcher = Box::new(move |bytes| {
                    let value = match bytes {
                        Some(bytes) => match codec.decode(&bytes) {
                            Ok(value) => value,
                            Err(error) => {
                                warn!(key = %watched, %error, "ignoring undecodable storage change");
                                return;
                            }
                        },
                        None => initial.clone(),
                    };
                    if let Err(error) = set.set(Some(value)) {
                        warn!(key = %watched, %error, "failed to apply storage change");
                    }
                });
                storage.subscribe(&key, watcher)
            }
        })
        .with_restore({
            let key = Arc::clone(&key);
            let storage = Arc::clone(&storage);
            let codec = Arc::clone(&codec);
            move |ctx, value: Option<T>| {
                if let Some(value) = &value {
                    storage.write(&key, codec.encode(value)?)?;
                }
                ctx.set_self(value)
            }
        });

    let read_base = base.clone();
    let read_key = Arc::clone(&key);
    let read_storage = Arc::clone(&storage);
    let read_codec = Arc::clone(&codec);
    let read_initial = initial.clone();
    WritableAtom::new(
        move |get| match get.get(&read_base)? {
            Some(value) => Ok(value),
            None => Ok(load(&*read_storage, &*read_codec, &read_key)
                .unwrap_or_else(|| read_initial.clone())),
        },
        move |ctx, update| match update {
            Resettable::Set(value) => {
                storage.write(&key, codec.encode(&value)?)?;
                ctx.set(&base, Some(value))
            }
            Resettable::Reset => {
                storage.remove(&key)?;
                ctx.set(&base, Some(initial.clone()))
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde::Deserialize;
    use std::sync::atomic::AtomicI32;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        volume: u8,
        muted: bool,
    }

    #[test]
    fn seeds_from_stored_value() {
        let storage = MemoryStorage::new();
        storage.write("volume", b"7".to_vec()).unwrap();

        let store = Store::new();
        let volume = atom_with_storage("volume", 3, storage.clone(), JsonCodec);
        assert_eq!(store.get(&volume), Ok(7));
    }

    #[test]
    fn undecodable_value_falls_back_to_initial() {
        let storage = MemoryStorage::new();
        storage.write("volume", b"loud".to_vec()).unwrap();

        let store = Store::new();
        let volume = atom_with_storage("volume", 3, storage, JsonCodec);
        assert_eq!(store.get(&volume), Ok(3));
    }

    #[test]
    fn writes_persist_and_reset_removes() {
        let storage = MemoryStorage::new();
        let store = Store::new();
        let volume = atom_with_storage("volume", 3, storage.clone(), JsonCodec);

        store.set(&volume, 9.into()).unwrap();
        assert_eq!(store.get(&volume), Ok(9));
        assert_eq!(storage.read("volume").unwrap(), Some(b"9".to_vec()));

        store.set(&volume, Resettable::Reset).unwrap();
        assert_eq!(store.get(&volume), Ok(3));
        assert_eq!(storage.read("volume").unwrap(), None);
    }

    #[test]
    fn follows_outside_changes_while_mounted() {
        let storage = MemoryStorage::new();
        let store = Store::new();
        let volume = atom_with_storage("volume", 3, storage.clone(), JsonCodec);

        let hits = Arc::new(AtomicI32::new(0));
        let sub = store.sub(&volume, {
            let hits = hits.clone();
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(storage.watcher_count("volume"), 1);

        storage.publish("volume", Some(b"5".to_vec()));
        assert_eq!(store.get(&volume), Ok(5));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        storage.publish("volume", None);
        assert_eq!(store.get(&volume), Ok(3));

        drop(sub);
        assert_eq!(storage.watcher_count("volume"), 0);
        storage.publish("volume", Some(b"8".to_vec()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stored_value_is_read_on_first_access() {
        let storage = MemoryStorage::new();
        let volume = atom_with_storage("volume", 3, storage.clone(), JsonCodec);

        // Written after the atom was defined, before any store read it.
        storage.write("volume", b"6".to_vec()).unwrap();
        assert_eq!(Store::new().get(&volume), Ok(6));

        storage.write("volume", b"8".to_vec()).unwrap();
        assert_eq!(Store::new().get(&volume), Ok(8));
    }

    #[test]
    fn restore_writes_through() {
        let storage = MemoryStorage::new();
        let store = Store::new();
        let volume = atom_with_storage("volume", 3, storage.clone(), JsonCodec);
        let _sub = store.mount(&volume);

        store.set(&volume, 9.into()).unwrap();
        let snapshot = store.snapshot();
        store.set(&volume, 4.into()).unwrap();
        assert_eq!(storage.read("volume").unwrap(), Some(b"4".to_vec()));

        store.restore(&snapshot).unwrap();
        assert_eq!(store.get(&volume), Ok(9));
        assert_eq!(storage.read("volume").unwrap(), Some(b"9".to_vec()));
    }

    #[test]
    fn message_pack_round_trips_structs() {
        let storage = MemoryStorage::new();
        let store = Store::new();
        let initial = Settings {
            volume: 4,
            muted: false,
        };
        let settings = atom_with_storage("settings", initial, storage.clone(), MessagePackCodec);

        let loud = Settings {
            volume: 11,
            muted: false,
        };
        store.set(&settings, loud.clone().into()).unwrap();

        let bytes = storage.read("settings").unwrap().unwrap();
        let decoded: Settings = MessagePackCodec.decode(&bytes).unwrap();
        assert_eq!(decoded, loud);

        // A second atom over the same key starts from the stored value.
        let again = atom_with_storage(
            "settings",
            Settings {
                volume: 0,
                muted: true,
            },
            storage,
            MessagePackCodec,
        );
        assert_eq!(store.get(&again), Ok(loud));
    }
}
