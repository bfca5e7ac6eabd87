//! The safepoint-driven sync coordinator.
//!
//! `sync` runs on the thread that initiated safepoint synchronization, while
//! every safepoint-visible cooperative thread is stopped and everything else
//! is excluded by the process-wide critical section. It detaches all
//! per-thread recorders, appends the global recorder, drains the pending
//! queue into one batch, resets the sequence generator (advancing the
//! generation) and hands the batch to the merge worker.

use std::sync::atomic;

use crate::error::ShutdownReason;
use crate::tracker::{MemTracker, TrackerState};
use crate::worker::MAX_GENERATIONS;

// Consecutive safepoints that may skip the drain before one is forced.
pub(crate) const MAX_SAFEPOINTS_TO_SKIP: u32 = 128;
// Skip is allowed only while sequence usage stays below this percentage...
pub(crate) const SAFE_SEQUENCE_THRESHOLD: u64 = 30;
// ...and generation ring usage is at least this percentage.
pub(crate) const HIGH_GENERATION_THRESHOLD: usize = 60;
// Above this many recorders per thread the calling threads get slowed down.
pub(crate) const MAX_RECORDER_THREAD_RATIO: usize = 30;
// Above this many recorders per thread the tracker shuts itself down.
pub(crate) const MAX_RECORDER_PER_THREAD: usize = 100;

impl MemTracker {
    /// Safepoint callback. Must be called at global quiescence, i.e. while
    /// all safepoint-visible threads are stopped.
    pub fn sync(&self) {
        if self.tracking_level() == crate::TrackingLevel::Off {
            return;
        }

        if self.state() == TrackerState::Started {
            // Without a worker nobody manages the generation ring; skip.
            if self.worker_handle.lock().is_none() {
                return;
            }

            if self.should_skip_sync_point() {
                self.sync_skip_count.fetch_add(1, atomic::Ordering::Relaxed);
                return;
            }

            {
                let mut state = self.critical.lock();

                // A pre-reserved sequence number must not straddle a
                // generation boundary; let this safepoint pass.
                if self.pending_op_count() == 0 {
                    self.seqgen.reset();
                    self.sync_skip_count.store(0, atomic::Ordering::Relaxed);

                    // Detach every per-thread recorder into the pending
                    // queue.
                    let walked = self.registry.for_each(|thread| {
                        if let Some(recorder) = thread.slot.take() {
                            self.enqueue_pending(recorder);
                        }
                    });
                    // At least the safepoint initiator exists even when no
                    // cooperative threads are registered.
                    self.thread_count
                        .store(walked.max(1), atomic::Ordering::Relaxed);

                    let mut batch = self.pending.drain();
                    if let Some(global) = state.global_recorder.take() {
                        batch.push_front(global);
                    }

                    self.apply_backpressure();

                    if self.shutdown_in_progress() {
                        drop(batch);
                    } else {
                        if !state
                            .generations
                            .add_generation(batch, self.class_count())
                        {
                            self.shutdown(ShutdownReason::OutOfGenerationBuffer);
                        }
                        self.generations_in_use.store(
                            state.generations.generations_in_use(),
                            atomic::Ordering::Relaxed,
                        );
                        self.sync_point_count
                            .fetch_add(1, atomic::Ordering::Relaxed);
                    }

                    debug_assert_eq!(
                        self.seqgen.peek(),
                        1,
                        "memory activity during the safepoint drain"
                    );
                } else {
                    self.sync_skip_count.fetch_add(1, atomic::Ordering::Relaxed);
                }
            }

            // Wake the worker to consume the new generation.
            if let Some(snapshot) = self.get_snapshot() {
                snapshot.notify();
            }
        }

        if self.state() == TrackerState::FinalShutdown {
            self.final_safepoint_cleanup();
        }
    }

    // Frequent safepoints with little event traffic would burn through the
    // generation ring; skip the drain while sequence pressure is low and
    // ring pressure is high, but never more than MAX_SAFEPOINTS_TO_SKIP
    // times in a row.
    #[expect(
        clippy::integer_division,
        reason = "whole-percent pressure values are all the thresholds need"
    )]
    fn should_skip_sync_point(&self) -> bool {
        if self.sync_skip_count.load(atomic::Ordering::Relaxed) >= MAX_SAFEPOINTS_TO_SKIP {
            return false;
        }
        let seq_in_use_pct = u64::from(self.seqgen.peek()) * 100 / u64::from(u32::MAX);
        let generations_in_use_pct =
            self.generations_in_use.load(atomic::Ordering::Relaxed) * 100 / MAX_GENERATIONS;
        seq_in_use_pct < SAFE_SEQUENCE_THRESHOLD
            && generations_in_use_pct >= HIGH_GENERATION_THRESHOLD
    }

    // Too many outstanding recorder instances mean the worker is lagging.
    // With auto-shutdown the tracker gives up past the hard bound; otherwise
    // event-recording threads are slowed until the worker catches up.
    fn apply_backpressure(&self) {
        let instance_count = self.counters.instance_count();
        let thread_count = self.thread_count.load(atomic::Ordering::Relaxed);

        if self.auto_shutdown() {
            if instance_count >= thread_count.saturating_mul(MAX_RECORDER_PER_THREAD) {
                self.shutdown(ShutdownReason::OutOfMemory);
            }
        } else {
            self.set_slowdown(
                instance_count > thread_count.saturating_mul(MAX_RECORDER_THREAD_RATIO),
            );
        }
    }

    // The safepoint after the worker finished: delete every remaining
    // recorder, and once the instance count reaches zero, complete the
    // shutdown and disable tracking.
    fn final_safepoint_cleanup(&self) {
        self.registry.for_each(|thread| {
            drop(thread.slot.take());
        });
        {
            let mut state = self.critical.lock();
            state.global_recorder = None;
        }
        drop(self.pending.drain());

        if self.counters.instance_count() == 0 {
            self.set_state(TrackerState::Shutdown);
            self.disable_tracking();
            if let Some(handle) = self.worker_handle.lock().take() {
                // The worker exits right after setting FinalShutdown; this
                // only reaps the thread.
                let _ = handle.join();
            }
            tracing::debug!("memory tracking shutdown complete");
        }
    }
}
