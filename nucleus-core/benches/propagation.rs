//! Benchmark: propagating a primitive write through mounted graphs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nucleus_core::{atom, Atom, Store};

fn chain(length: usize) -> (nucleus_core::PrimitiveAtom<u64>, Atom<u64>) {
    let source = atom(0u64);
    let mut tail: Atom<u64> = source.as_atom().clone();
    for _ in 0..length {
        let previous = tail.clone();
        tail = Atom::derived(move |get| Ok(get.get(&previous)? + 1));
    }
    (source, tail)
}

fn benchmark_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    for length in [10, 100, 500] {
        let store = Store::new();
        let (source, tail) = chain(length);
        let _sub = store.mount(&tail);

        let mut next = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| {
                next += 1;
                store.set(&source, next).unwrap();
                black_box(store.get(&tail).unwrap())
            });
        });
    }
    group.finish();
}

fn benchmark_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    for width in [10, 100, 1000] {
        let store = Store::new();
        let source = atom(0u64);
        let subs: Vec<_> = (0..width)
            .map(|offset| {
                let source = source.clone();
                let derived = Atom::derived(move |get| Ok(get.get(&source)? + offset));
                store.mount(&derived)
            })
            .collect();

        let mut next = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                black_box(store.set(&source, next).unwrap())
            });
        });
        drop(subs);
    }
    group.finish();
}

fn benchmark_unchanged_intermediate(c: &mut Criterion) {
    // Writes that do not change the parity stop at the first derived atom.
    let store = Store::new();
    let source = atom(0u64);
    let parity = Atom::derived({
        let source = source.clone();
        move |get| Ok(get.get(&source)? % 2)
    });
    let mut tail = parity;
    for _ in 0..100 {
        let previous = tail.clone();
        tail = Atom::derived(move |get| Ok(get.get(&previous)? + 1));
    }
    let _sub = store.mount(&tail);

    let mut next = 0u64;
    c.bench_function("unchanged_intermediate", |b| {
        b.iter(|| {
            next += 2;
            black_box(store.set(&source, next).unwrap())
        });
    });
}

criterion_group!(
    benches,
    benchmark_chain,
    benchmark_fan_out,
    benchmark_unchanged_intermediate
);
criterion_main!(benches);
