//! Basic benchmarks for the `ref_ledger` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use ref_ledger::Ledger;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const BLOCK_SIZE: usize = 64;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("rl_track");

    group.bench_function("allocate_and_sweep_one", |b| {
        let mut ledger = Ledger::new();

        b.iter(|| {
            black_box(ledger.allocate_and_track(BLOCK_SIZE, 1, 0));
            ledger.sweep()
        });
    });

    group.bench_function("allocate_and_sweep_ten_thousand", |b| {
        let mut ledger = Ledger::new();

        b.iter(|| {
            for _ in 0..10_000 {
                black_box(ledger.allocate_and_track(BLOCK_SIZE, 1, 0));
            }

            ledger.sweep()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("rl_count");

    group.bench_function("increment_decrement", |b| {
        let mut ledger = Ledger::new();
        let ptr = ledger.allocate_and_track(BLOCK_SIZE, 1, 1).unwrap();

        b.iter(|| {
            ledger.increment(black_box(ptr.as_ptr()));
            ledger.decrement(black_box(ptr.as_ptr()))
        });

        ledger.decrement(ptr.as_ptr());
        ledger.sweep();
    });

    group.bench_function("count_among_ten_thousand", |b| {
        let mut ledger = Ledger::new();
        let pointers = (0..10_000)
            .map(|_| ledger.allocate_and_track(BLOCK_SIZE, 1, 1).unwrap())
            .collect::<Vec<_>>();
        let probe = pointers[pointers.len() / 2];

        b.iter(|| ledger.count(black_box(probe.as_ptr())));

        for ptr in pointers {
            ledger.decrement(ptr.as_ptr());
        }
        ledger.sweep();
    });

    group.finish();

    let mut group = c.benchmark_group("rl_sweep");

    group.bench_function("mostly_live_ten_thousand", |b| {
        b.iter_batched(
            || {
                let mut ledger = Ledger::new();

                for i in 0..10_000 {
                    let refs = usize::from(i % 10 != 0);
                    ledger.allocate_and_track(BLOCK_SIZE, 1, refs).unwrap();
                }

                ledger
            },
            |mut ledger| ledger.sweep(),
            BatchSize::LargeInput,
        );
    });

    group.finish();
}
