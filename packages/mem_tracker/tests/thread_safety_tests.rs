//! Multi-threaded stress tests: concurrent event recording, safepoint
//! drains, and shutdown while threads are busy.

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use mem_tracker::{
    ExecutionState, MemTracker, MemoryCategory, ShutdownReason, TrackerState, TrackingLevel,
};

fn started_tracker() -> Arc<MemTracker> {
    let tracker = MemTracker::new(TrackingLevel::Summary);
    tracker.bootstrap_single_thread();
    tracker.bootstrap_multi_thread();
    tracker.start().unwrap();
    tracker
}

fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {what}");
}

#[test]
fn events_from_many_threads_are_all_merged() {
    const THREADS: usize = 8;
    const EVENTS_PER_THREAD: usize = 200;

    let tracker = started_tracker();
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut workers = Vec::new();
    for thread_index in 0..THREADS {
        let tracker = Arc::clone(&tracker);
        let barrier = Arc::clone(&barrier);
        workers.push(std::thread::spawn(move || {
            let registered = tracker.attach_thread();
            // Native-state threads run through safepoints, so their events
            // synchronize through the critical section and stay safe even if
            // a drain happens mid-burst.
            registered.set_execution_state(ExecutionState::InNative);
            barrier.wait();

            for event_index in 0..EVENTS_PER_THREAD {
                let addr = 0x100_0000 + thread_index * 0x1_0000 + event_index * 16;
                tracker.record_malloc(addr, 16, MemoryCategory::Internal, None, None);
            }
            tracker.thread_exiting(&registered);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    tracker.sync();
    wait_until("all events merged", || {
        tracker
            .to_usage_report(1, true)
            .is_some_and(|report| {
                report.category(MemoryCategory::Internal).malloc_count
                    == (THREADS * EVENTS_PER_THREAD) as u64
            })
    });

    let report = tracker.to_usage_report(1, true).expect("report");
    assert_eq!(
        report.category(MemoryCategory::Internal).malloc_bytes,
        (THREADS * EVENTS_PER_THREAD * 16) as u64
    );

    tracker.shutdown(ShutdownReason::Normal);
    wait_until("worker exit", || {
        tracker.state() >= TrackerState::FinalShutdown
    });
    tracker.sync();
    assert_eq!(tracker.stats().instance_count, 0);
}

#[test]
fn interleaved_mallocs_and_frees_balance_out() {
    const THREADS: usize = 4;
    const BLOCKS_PER_THREAD: usize = 100;

    let tracker = started_tracker();

    let mut workers = Vec::new();
    for thread_index in 0..THREADS {
        let tracker = Arc::clone(&tracker);
        workers.push(std::thread::spawn(move || {
            let registered = tracker.attach_thread();
            registered.set_execution_state(ExecutionState::InNative);

            for block_index in 0..BLOCKS_PER_THREAD {
                let addr = 0x200_0000 + thread_index * 0x1_0000 + block_index * 32;
                tracker.record_malloc(addr, 32, MemoryCategory::Gc, None, None);
                tracker.record_free(addr, None);
            }
            tracker.thread_exiting(&registered);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    tracker.sync();
    wait_until("balanced state merged", || {
        tracker
            .to_usage_report(1, true)
            .is_some_and(|report| report.category(MemoryCategory::Gc).is_empty())
    });

    tracker.shutdown(ShutdownReason::Normal);
    wait_until("worker exit", || {
        tracker.state() >= TrackerState::FinalShutdown
    });
    tracker.sync();
    assert_eq!(tracker.state(), TrackerState::Shutdown);
}

#[test]
fn shutdown_while_busy_reaches_quiescence() {
    const THREADS: usize = 10;
    const EVENTS_PER_THREAD: usize = 50;

    let tracker = started_tracker();
    let mut registrations = Vec::new();

    let mut workers = Vec::new();
    let (senders, receiver) = {
        let (tx, rx) = std::sync::mpsc::channel();
        (tx, rx)
    };
    for thread_index in 0..THREADS {
        let tracker = Arc::clone(&tracker);
        let senders = senders.clone();
        workers.push(std::thread::spawn(move || {
            let registered = tracker.attach_thread();
            registered.set_execution_state(ExecutionState::InNative);

            for event_index in 0..EVENTS_PER_THREAD {
                let addr = 0x300_0000 + thread_index * 0x1_0000 + event_index * 16;
                tracker.record_malloc(addr, 16, MemoryCategory::Thread, None, None);
            }
            // Leave the thread registered so the final cleanup has real
            // per-thread recorders to dispose of.
            senders.send(registered).unwrap();
        }));
    }
    drop(senders);
    for worker in workers {
        worker.join().unwrap();
    }
    while let Ok(registered) = receiver.recv() {
        registrations.push(registered);
    }

    tracker.shutdown(ShutdownReason::User);
    assert!(tracker.shutdown_in_progress());

    // Events arriving after shutdown-pending are dropped silently.
    tracker.record_malloc(0xdead_0000, 64, MemoryCategory::Gc, None, None);

    wait_until("worker exit", || {
        tracker.state() >= TrackerState::FinalShutdown
    });
    tracker.sync();

    assert_eq!(tracker.state(), TrackerState::Shutdown);
    assert_eq!(tracker.stats().instance_count, 0);
    assert_eq!(tracker.reason(), ShutdownReason::User);
    assert_eq!(tracker.tracking_level(), TrackingLevel::Off);
}

#[test]
fn tracker_is_shareable_across_threads() {
    let tracker = started_tracker();

    let clone = Arc::clone(&tracker);
    let handle = std::thread::spawn(move || {
        clone.record_malloc(0x1000, 8, MemoryCategory::Other, None, None);
        clone.stats().instance_count
    });
    let instance_count = handle.join().unwrap();
    assert!(instance_count >= 1);

    tracker.shutdown(ShutdownReason::Normal);
    wait_until("worker exit", || {
        tracker.state() >= TrackerState::FinalShutdown
    });
    tracker.sync();
    assert_eq!(tracker.stats().instance_count, 0);
}

#[test]
fn reallocs_race_safely_with_allocations() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;

    let tracker = started_tracker();

    let mut workers = Vec::new();
    for thread_index in 0..THREADS {
        let tracker = Arc::clone(&tracker);
        workers.push(std::thread::spawn(move || {
            let registered = tracker.attach_thread();
            registered.set_execution_state(ExecutionState::InNative);

            let base = 0x400_0000 + thread_index * 0x10_0000;
            for round in 0..ROUNDS {
                let old_addr = base + round * 64;
                let new_addr = base + round * 64 + 32;
                tracker.record_malloc(old_addr, 16, MemoryCategory::Compiler, None, None);

                let mut handle = tracker.realloc_tracker();
                if round % 3 == 0 {
                    // Simulated realloc failure.
                    handle.discard();
                    tracker.record_free(old_addr, None);
                } else {
                    handle.record_realloc(old_addr, new_addr, 32, MemoryCategory::Compiler, None);
                    tracker.record_free(new_addr, None);
                }
            }
            tracker.thread_exiting(&registered);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(tracker.pending_op_count(), 0);

    tracker.sync();
    wait_until("all blocks freed", || {
        tracker
            .to_usage_report(1, true)
            .is_some_and(|report| report.category(MemoryCategory::Compiler).is_empty())
    });

    tracker.shutdown(ShutdownReason::Normal);
    wait_until("worker exit", || {
        tracker.state() >= TrackerState::FinalShutdown
    });
    tracker.sync();
    assert_eq!(tracker.stats().instance_count, 0);
}
