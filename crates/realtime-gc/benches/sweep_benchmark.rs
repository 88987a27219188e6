//! Benchmark: allocation throughput and collection pause time across heap
//! sizes — pause time at increasing live-object counts, sustained
//! alloc/collect cycles — driven through the explicit `RealtimeHeap` /
//! `allocate` / `collect_cycle` API.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use realtime_gc::{HeapConfig, RealtimeHeap, StorageClass};
use std::hint::black_box;

fn bench_heap() -> std::sync::Arc<RealtimeHeap> {
    RealtimeHeap::new(HeapConfig {
        default_heap_bytes: 64 * 1024 * 1024,
        ..HeapConfig::default()
    })
    .unwrap()
}

fn bench_pause_time(c: &mut Criterion, label: &str, object_count: usize) {
    let heap = bench_heap();
    heap.register_mutator_thread();
    c.bench_function(label, |b| {
        b.iter(|| {
            for _ in 0..object_count {
                let ptr = heap.allocate(32, StorageClass::NoPointers).unwrap();
                black_box(ptr);
            }
            let stats = heap.collect_cycle().unwrap();
            black_box(stats);
        });
    });
    heap.unregister_mutator_thread();
}

fn bench_pause_time_100(c: &mut Criterion) {
    bench_pause_time(c, "pause_time_100_objects", 100);
}

fn bench_pause_time_1000(c: &mut Criterion) {
    bench_pause_time(c, "pause_time_1000_objects", 1_000);
}

fn bench_pause_time_10000(c: &mut Criterion) {
    bench_pause_time(c, "pause_time_10000_objects", 10_000);
}

fn bench_throughput_alloc(c: &mut Criterion) {
    let heap = bench_heap();
    heap.register_mutator_thread();
    c.bench_function("throughput_alloc_10000", |b| {
        b.iter(|| {
            for _ in 0..10_000 {
                black_box(heap.allocate(32, StorageClass::NoPointers).unwrap());
            }
            black_box(heap.collect_cycle().unwrap());
        });
    });
    heap.unregister_mutator_thread();
}

fn bench_big_object_allocate(c: &mut Criterion) {
    let heap = bench_heap();
    heap.register_mutator_thread();
    c.bench_function("big_object_allocate_1mib", |b| {
        b.iter(|| {
            let ptr = heap.big_allocate(1024 * 1024, StorageClass::NoPointers).unwrap();
            black_box(ptr);
            black_box(heap.collect_cycle().unwrap());
        });
    });
    heap.unregister_mutator_thread();
}

fn bench_sustained_cycles(c: &mut Criterion) {
    let heap = bench_heap();
    heap.register_mutator_thread();
    c.bench_function("sustained_100_cycles", |b| {
        b.iter(|| {
            for _ in 0..100 {
                for _ in 0..100 {
                    black_box(heap.allocate(32, StorageClass::NoPointers).unwrap());
                }
                heap.collect_cycle().unwrap();
            }
        });
    });
    heap.unregister_mutator_thread();
}

criterion_group!(
    name = sweep_comparison;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(2))
        .noise_threshold(0.05)
        .confidence_level(0.99);
    targets =
        bench_pause_time_100,
        bench_pause_time_1000,
        bench_pause_time_10000,
        bench_throughput_alloc,
        bench_big_object_allocate,
        bench_sustained_cycles,
);

criterion_main!(sweep_comparison);
