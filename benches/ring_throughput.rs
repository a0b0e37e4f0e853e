// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(clippy::missing_panics_doc)] // Bench code panics on setup failure

//! Ring buffer throughput benchmarks.
//!
//! Measures the two hot paths the pool leans on:
//! - paired enqueue/dequeue (claim + recycle of one slot index)
//! - free-list cycling at capacity (preloaded ring, steady churn)

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sockpool::AtomicRing;

fn bench_enqueue_dequeue_pair(c: &mut Criterion) {
    let ring = AtomicRing::<u64>::with_capacity(1024).expect("Failed to create ring");

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(1));
    group.bench_function("enqueue_dequeue_pair", |b| {
        b.iter(|| {
            ring.enqueue(black_box(0xDEAD_BEEF));
            black_box(ring.dequeue());
        });
    });
    group.finish();
}

fn bench_free_list_churn(c: &mut Criterion) {
    let mut ring = AtomicRing::<u32>::with_capacity(1024).expect("Failed to create ring");
    let cap = ring.capacity() as u32;
    ring.preload(0..cap);

    let mut group = c.benchmark_group("free_list");
    group.throughput(Throughput::Elements(1));
    group.bench_function("claim_recycle", |b| {
        b.iter(|| {
            let idx = ring.dequeue();
            ring.enqueue(black_box(idx));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue_dequeue_pair, bench_free_list_churn);
criterion_main!(benches);
