//! Location-Bound Atoms
//!
//! [`atom_with_location`] binds an atom to one parameter of a location
//! fragment such as `#tab=%22home%22&page=2`. Values are JSON-encoded and
//! then percent-encoded, so any serde type fits in a parameter.
//!
//! The binding is two-way: writing the atom rewrites the fragment through
//! [`Location::set`], and while the atom is mounted, changes reported by
//! [`Location::on_change`] are written back into the atom. Restoring a
//! snapshot rewrites the fragment too.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use crate::atom::{atom, AtomValue, Cleanup, SetSelf, WritableAtom};
use crate::error::AtomError;

use super::reset::{Resettable, ResettableAtom};

/// Characters left as-is in fragment keys and values.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Ambient location state holding a fragment.
pub trait Location: Send + Sync + 'static {
    /// The current fragment, including the leading `#` if there is one.
    fn get(&self) -> String;

    fn set(&self, fragment: &str);

    /// Call `callback` whenever the fragment is changed from outside.
    fn on_change(&self, callback: Box<dyn Fn() + Send + Sync>) -> Cleanup;
}

type Watcher = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct LocationInner {
    fragment: RwLock<String>,
    watchers: Mutex<Vec<(u64, Watcher)>>,
    next_watcher: AtomicU64,
}

/// In-memory [`Location`].
///
/// [`set`](Location::set) replaces the fragment quietly; use
/// [`navigate`](Self::navigate) to change it the way a user would, which
/// notifies watchers.
#[derive(Clone, Default)]
pub struct MemoryLocation {
    inner: Arc<LocationInner>,
}

impl MemoryLocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `fragment`.
    pub fn with_fragment(fragment: impl Into<String>) -> Self {
        let location = Self::default();
        *location.inner.fragment.write() = fragment.into();
        location
    }

    /// Replace the fragment and notify watchers.
    pub fn navigate(&self, fragment: impl Into<String>) {
        *self.inner.fragment.write() = fragment.into();

        let watchers: Vec<Watcher> = self
            .inner
            .watchers
            .lock()
            .iter()
            .map(|(_, watcher)| Arc::clone(watcher))
            .collect();
        trace!(watchers = watchers.len(), "location changed");
        for watcher in watchers {
            watcher();
        }
    }

    pub fn current(&self) -> String {
        self.inner.fragment.read().clone()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.lock().len()
    }
}

impl Location for MemoryLocation {
    fn get(&self) -> String {
        self.current()
    }

    fn set(&self, fragment: &str) {
        *self.inner.fragment.write() = fragment.to_owned();
    }

    fn on_change(&self, callback: Box<dyn Fn() + Send + Sync>) -> Cleanup {
        let id = self.inner.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.inner.watchers.lock().push((id, Arc::from(callback)));

        let inner = Arc::clone(&self.inner);
        Box::new(move || inner.watchers.lock().retain(|(watcher, _)| *watcher != id))
    }
}

impl fmt::Debug for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLocation")
            .field("fragment", &*self.inner.fragment.read())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Fragment Parameters
// ----------------------------------------------------------------------------

fn decode_component(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(Cow::into_owned)
}

/// Split a fragment into decoded parameters, keeping their order.
fn parse_fragment(fragment: &str) -> IndexMap<String, String> {
    fragment
        .trim_start_matches('#')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            // Split on the first '=' only; encoded values never contain one.
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((decode_component(key)?, decode_component(value)?))
        })
        .collect()
}

fn render_fragment(params: &IndexMap<String, String>) -> String {
    if params.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = params
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(key, COMPONENT),
                utf8_percent_encode(value, COMPONENT)
            )
        })
        .collect();
    format!("#{}", pairs.join("&"))
}

fn read_param<T, L>(location: &L, key: &str) -> Option<T>
where
    T: DeserializeOwned,
    L: Location + ?Sized,
{
    let params = parse_fragment(&location.get());
    let raw = params.get(key)?;
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(key, %error, "ignoring malformed location parameter");
            None
        }
    }
}

/// Rewrite the `key` parameter of `location`, removing it for `None`.
fn write_param<T, L>(location: &L, key: &str, value: Option<&T>) -> serde_json::Result<()>
where
    T: Serialize,
    L: Location + ?Sized,
{
    let mut params = parse_fragment(&location.get());
    match value {
        Some(value) => {
            params.insert(key.to_owned(), serde_json::to_string(value)?);
        }
        None => {
            params.shift_remove(key);
        }
    }
    location.set(&render_fragment(&params));
    Ok(())
}

/// Create an atom bound to the `key` parameter of `location`.
///
/// The atom starts from the parameter if it is present and decodes,
/// otherwise from `initial`. [`Resettable::Reset`] removes the parameter.
///
/// ```rust,ignore
/// let location = MemoryLocation::with_fragment("#page=2");
/// let page = atom_with_location("page", 1, location.clone());
/// assert_eq!(store.get(&page)?, 2);
///
/// store.set(&page, 3.into())?;
/// assert_eq!(location.current(), "#page=3");
/// ```
pub fn atom_with_location<T, L>(key: impl Into<String>, initial: T, location: L) -> ResettableAtom<T>
where
    T: AtomValue + Serialize + DeserializeOwned,
    L: Location,
{
    let key: Arc<str> = Arc::from(key.into());
    let location = Arc::new(location);

    let seed = read_param(&*location, &key).unwrap_or_else(|| initial.clone());
    let base = atom(seed).with_on_mount({
        let key = Arc::clone(&key);
        let location = Arc::clone(&location);
        let initial = initial.clone();
        move |set: SetSelf<T>| {
            let key = Arc::clone(&key);
            let watched = Arc::clone(&location);
            let initial = initial.clone();
            let sync = move || {
                let value = read_param(&*watched, &key).unwrap_or_else(|| initial.clone());
                if let Err(error) = set.set(value) {
                    warn!(key = %key, %error, "failed to apply location change");
                }
            };

            // Catch up with navigation that happened while unmounted.
            sync();
            Some(location.on_change(Box::new(sync)))
        }
    })
    .with_restore({
        let key = Arc::clone(&key);
        let location = Arc::clone(&location);
        move |ctx, value: T| {
            write_param(&*location, &key, Some(&value))
                .map_err(|error| AtomError::failed(ctx.atom_name(), error))?;
            ctx.set_self(value)
        }
    });

    let read_base = base.clone();
    WritableAtom::new(
        move |get| get.get(&read_base),
        move |ctx, update| {
            let (written, value) = match update {
                Resettable::Set(value) => (write_param(&*location, &key, Some(&value)), value),
                Resettable::Reset => (write_param::<T, _>(&*location, &key, None), initial.clone()),
            };
            written.map_err(|error| AtomError::failed(ctx.atom_name(), error))?;
            ctx.set(&base, value)
        },
    )
}
