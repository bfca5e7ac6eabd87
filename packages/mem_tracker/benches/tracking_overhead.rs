//! Benchmarks to measure the compute overhead of the event fast path.
//!
//! These benchmarks measure the per-event cost of recording through the
//! different routing paths (per-thread recorder, global recorder) without
//! any safepoint activity, so the numbers reflect pure capture overhead.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use mem_tracker::{MemTracker, MemoryCategory, MemoryOperation, TrackingLevel};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("mem_tracker_overhead");

    // Baseline: tracking disabled, every entry point short-circuits.
    {
        let tracker = MemTracker::new(TrackingLevel::Off);
        group.bench_function("disabled_malloc", |b| {
            b.iter(|| {
                tracker.record_malloc(
                    black_box(0x1000),
                    black_box(64),
                    MemoryCategory::Gc,
                    None,
                    None,
                );
            });
        });
    }

    // Global routing: events go through the critical section. Events are
    // recorded as malloc/free pairs and drained with a periodic sync so the
    // benchmark does not accumulate unbounded state.
    {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker.bootstrap_multi_thread();
        tracker.start().expect("failed to start tracking");
        group.bench_function("global_route_malloc_free", |b| {
            let mut iterations = 0u64;
            b.iter(|| {
                tracker.record_malloc(black_box(0x1000), 64, MemoryCategory::Gc, None, None);
                tracker.record_free(black_box(0x1000), None);
                iterations += 1;
                if iterations % 4096 == 0 {
                    tracker.sync();
                }
            });
        });
        tracker.shutdown(mem_tracker::ShutdownReason::Normal);
    }

    // Per-thread routing: the lock-free fast path.
    {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker.bootstrap_multi_thread();
        tracker.start().expect("failed to start tracking");
        let registered = tracker.attach_thread();
        group.bench_function("per_thread_malloc_free", |b| {
            let mut iterations = 0u64;
            b.iter(|| {
                tracker.record_malloc(black_box(0x1000), 64, MemoryCategory::Gc, None, None);
                tracker.record_free(black_box(0x1000), None);
                iterations += 1;
                if iterations % 4096 == 0 {
                    tracker.sync();
                }
            });
        });
        tracker.thread_exiting(&registered);
        tracker.shutdown(mem_tracker::ShutdownReason::Normal);
    }

    // Handle construction alone, for operations that end up discarded.
    {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        group.bench_function("handle_construct_discard", |b| {
            b.iter(|| {
                let mut handle = tracker.tracker(MemoryOperation::Malloc, None);
                handle.discard();
                black_box(());
            });
        });
    }

    group.finish();
}
