//! Integration Tests for Async Atoms
//!
//! Async read functions run on the tokio runtime of the test. These tests
//! cover suspension, settlement, rejection and superseded computations.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nucleus_core::{atom, loadable, Atom, AtomError, Loadable, Store};

fn counter() -> (Arc<AtomicI32>, impl Fn() + Send + Sync + 'static) {
    let hits = Arc::new(AtomicI32::new(0));
    let listener = {
        let hits = hits.clone();
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    };
    (hits, listener)
}

/// Reading before resolution suspends; afterwards the value is there and
/// subscribers fired once.
#[tokio::test]
async fn async_atom_resolves_once() {
    let store = Store::new();
    let tag = Atom::derived_async(|_| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok("#3".to_string())
    })
    .with_label("tag");

    let (hits, listener) = counter();
    let _sub = store.sub(&tag, listener);

    let early = store.get(&tag).unwrap_err();
    assert!(early.is_pending(), "{early}");
    assert!(store.get_loadable(&tag).is_loading());
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert_eq!(store.wait(&tag).await.as_deref(), Ok("#3"));
    assert_eq!(store.get(&tag).as_deref(), Ok("#3"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Derived atoms over a pending atom are pending too, then resolve.
#[tokio::test]
async fn pending_flows_through_derived_atoms() {
    let store = Store::new();
    let greeting = Atom::derived_async(|_| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok("hello".to_string())
    });
    let shout = Atom::derived({
        let greeting = greeting.clone();
        move |get| Ok(get.get(&greeting)?.to_uppercase())
    });

    let (hits, listener) = counter();
    let _sub = store.sub(&shout, listener);
    assert!(store.get(&shout).unwrap_err().is_pending());

    assert_eq!(store.wait(&shout).await.as_deref(), Ok("HELLO"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// A rejected computation is committed as the atom's error; a loadable view
/// over it recovers.
#[tokio::test]
async fn rejection_is_committed_as_error() {
    let store = Store::new();
    let failing = Atom::derived_async(|get| async move {
        tokio::task::yield_now().await;
        Err::<i32, _>(get.error("backend unavailable"))
    });
    let view = loadable(&failing);
    let _sub = store.mount(&view);

    let error = store.wait(&failing).await.unwrap_err();
    assert!(matches!(error, AtomError::Failed { .. }));
    assert_eq!(error, store.get(&failing).unwrap_err());
    assert_eq!(store.get(&view), Ok(Loadable::HasError(error)));
}

/// A result computed against a superseded dependency value is dropped.
#[tokio::test]
async fn last_writer_wins_by_dependency() {
    let store = Store::new();
    let user_id = atom(1u32);
    let user = Atom::derived_async({
        let user_id = user_id.clone();
        move |get| {
            let user_id = user_id.clone();
            async move {
                let id = get.get(&user_id)?;
                // The first request is the slow one.
                let delay = if id == 1 { 40 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(format!("user {id}"))
            }
        }
    });

    let (hits, listener) = counter();
    let _sub = store.sub(&user, listener);
    tokio::task::yield_now().await;

    store.set(&user_id, 2).unwrap();
    assert_eq!(store.wait(&user).await.as_deref(), Ok("user 2"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.get(&user).as_deref(), Ok("user 2"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

/// Without a runtime, async atoms fail instead of hanging.
#[test]
fn async_atom_without_runtime_fails() {
    let store = Store::new();
    let never = Atom::derived_async(|_| async { Ok(1) });

    let error = store.get(&never).unwrap_err();
    assert!(matches!(error, AtomError::NoRuntime { .. }));
}

/// A store built with an explicit runtime handle drives async atoms from
/// outside that runtime.
#[test]
fn configured_runtime_drives_async_atoms() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let store = Store::builder()
        .label("configured")
        .runtime(runtime.handle().clone())
        .build();
    let answer = Atom::derived_async(|_| async { Ok(42) });

    assert!(store.get(&answer).unwrap_err().is_pending());
    assert_eq!(runtime.block_on(store.wait(&answer)), Ok(42));
}

/// Going pending and settling on the value it already had is not a change
/// for listeners.
#[tokio::test]
async fn settling_on_the_same_value_is_silent() {
    let store = Store::new();
    let n = atom(1);
    let parity = Atom::derived_async({
        let n = n.clone();
        move |get| {
            let n = n.clone();
            async move {
                let value = get.get(&n)?;
                tokio::task::yield_now().await;
                Ok(value % 2)
            }
        }
    });

    let (hits, listener) = counter();
    let _sub = store.sub(&parity, listener);
    assert_eq!(store.wait(&parity).await, Ok(1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    store.set(&n, 3).unwrap();
    assert!(store.get(&parity).unwrap_err().is_pending());
    assert_eq!(store.wait(&parity).await, Ok(1));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    store.set(&n, 4).unwrap();
    assert_eq!(store.wait(&parity).await, Ok(0));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

/// Unmounting an atom with a computation in flight lets the computation
/// finish but drops its result; the next read starts over.
#[tokio::test]
async fn unmounted_computation_result_is_dropped() {
    let store = Store::new();
    let runs = Arc::new(AtomicI32::new(0));
    let slow = Atom::derived_async({
        let runs = runs.clone();
        move |_| {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(run)
            }
        }
    });

    let (hits, listener) = counter();
    let sub = store.sub(&slow, listener);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(store.get(&slow).unwrap_err().is_pending());

    drop(sub);
    assert!(!store.is_mounted(slow.id()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(store.epoch(slow.id()), Some(1));

    // Nothing was committed, so this read evaluates again.
    assert!(store.get(&slow).unwrap_err().is_pending());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(store.wait(&slow).await, Ok(2));
}
