//! Observable-Backed Atoms
//!
//! [`atom_with_observable`] adapts a push source into an atom. The source is
//! subscribed once each time the atom becomes mounted, and every emission is
//! written into the atom. Unmounting runs the source's unsubscription, so an
//! atom nothing observes never keeps the source alive.

use std::sync::Arc;

use tracing::warn;

use crate::atom::{atom, AtomValue, Cleanup, SetSelf, WritableAtom};
use crate::error::AtomError;

/// A push source of values.
pub trait Observable<T>: Send + Sync + 'static {
    /// Start delivering values to `on_next` and failures to `on_error`.
    /// Calling the returned cleanup stops delivery.
    fn subscribe(
        &self,
        on_next: Box<dyn Fn(T) + Send + Sync>,
        on_error: Box<dyn Fn(AtomError) + Send + Sync>,
    ) -> Cleanup;
}

/// Latest state of an observed source.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission<T> {
    /// Nothing emitted yet.
    Waiting,
    Next(T),
    Failed(AtomError),
}

/// Create an atom that holds the latest value emitted by `source`.
///
/// Until the first emission the atom is pending, unless `initial` is given.
/// A failure emitted by the source becomes the atom's error. Writing the atom
/// stores a value as if the source had emitted it.
pub fn atom_with_observable<T, O>(source: O, initial: Option<T>) -> WritableAtom<T, T>
where
    T: AtomValue,
    O: Observable<T>,
{
    let source = Arc::new(source);
    let start = match initial {
        Some(value) => Emission::Next(value),
        None => Emission::Waiting,
    };

    let latest = atom(start).with_on_mount(move |set: SetSelf<Emission<T>>| {
        let on_error = set.clone();
        let cleanup = source.subscribe(
            Box::new(move |value| {
                if let Err(error) = set.set(Emission::Next(value)) {
                    warn!(%error, "failed to store observed value");
                }
            }),
            Box::new(move |failure| {
                if let Err(error) = on_error.set(Emission::Failed(failure)) {
                    warn!(%error, "failed to store observed error");
                }
            }),
        );
        Some(cleanup)
    });

    let read_latest = latest.clone();
    WritableAtom::new(
        move |get| match get.get(&read_latest)? {
            Emission::Waiting => Err(get.pending()),
            Emission::Next(value) => Ok(value),
            Emission::Failed(error) => Err(error),
        },
        move |ctx, value| ctx.set(&latest, Emission::Next(value)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

    type Next<T> = Arc<dyn Fn(T) + Send + Sync>;
    type Fail = Arc<dyn Fn(AtomError) + Send + Sync>;

    /// Hand-driven source for tests.
    struct Subject<T> {
        subscribers: Arc<Mutex<Vec<(u64, Next<T>, Fail)>>>,
        next_id: AtomicU64,
    }

    impl<T: Clone + Send + 'static> Subject<T> {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                subscribers: Arc::new(Mutex::new(Vec::new())),
                next_id: AtomicU64::new(0),
            })
        }

        fn emit(&self, value: T) {
            let targets: Vec<Next<T>> = self.subscribers.lock().iter().map(|s| s.1.clone()).collect();
            for next in targets {
                next(value.clone());
            }
        }

        fn fail(&self, error: AtomError) {
            let targets: Vec<Fail> = self.subscribers.lock().iter().map(|s| s.2.clone()).collect();
            for fail in targets {
                fail(error.clone());
            }
        }

        fn subscriber_count(&self) -> usize {
            self.subscribers.lock().len()
        }
    }

    struct Shared<T>(Arc<Subject<T>>);

    impl<T: Clone + Send + 'static> Observable<T> for Shared<T> {
        fn subscribe(
            &self,
            on_next: Box<dyn Fn(T) + Send + Sync>,
            on_error: Box<dyn Fn(AtomError) + Send + Sync>,
        ) -> Cleanup {
            let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
            self.0
                .subscribers
                .lock()
                .push((id, Arc::from(on_next), Arc::from(on_error)));

            let subscribers = Arc::clone(&self.0.subscribers);
            Box::new(move || subscribers.lock().retain(|s| s.0 != id))
        }
    }

    #[test]
    fn pending_until_first_emission() {
        let store = Store::new();
        let subject = Subject::new();
        let ticks = atom_with_observable(Shared(subject.clone()), None);

        // Not mounted: nothing subscribes.
        assert!(store.get(&ticks).unwrap_err().is_pending());
        assert_eq!(subject.subscriber_count(), 0);

        let hits = Arc::new(AtomicI32::new(0));
        let sub = store.sub(&ticks, {
            let hits = hits.clone();
            move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(subject.subscriber_count(), 1);

        subject.emit(1);
        assert_eq!(store.get(&ticks), Ok(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        subject.emit(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[test]
    fn initial_value_and_errors() {
        let store = Store::new();
        let subject = Subject::new();
        let ticks = atom_with_observable(Shared(subject.clone()), Some(0));
        let _sub = store.mount(&ticks);

        assert_eq!(store.get(&ticks), Ok(0));

        let failure = AtomError::message("ticks", "source closed");
        subject.fail(failure.clone());
        assert_eq!(store.get(&ticks), Err(failure));

        store.set(&ticks, 5).unwrap();
        assert_eq!(store.get(&ticks), Ok(5));
    }

    #[tokio::test]
    async fn wait_resolves_on_emission() {
        let store = Store::new();
        let subject = Subject::new();
        let ticks = atom_with_observable(Shared(subject.clone()), None);
        let _sub = store.mount(&ticks);

        tokio::spawn({
            let subject = subject.clone();
            async move {
                tokio::task::yield_now().await;
                subject.emit(42);
            }
        });

        assert_eq!(store.wait(&ticks).await, Ok(42));
    }
}
