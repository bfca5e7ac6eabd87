//! The merge worker thread and its generation ring buffer.

use std::io;
use std::sync::Arc;
use std::sync::atomic;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::ShutdownReason;
use crate::recorder::Recorder;
use crate::snapshot::Snapshot;
use crate::stacks::RecorderChain;
use crate::tracker::MemTracker;

/// Capacity of the generation ring: how many drained-but-unmerged
/// generations can be outstanding before the tracker gives up.
pub(crate) const MAX_GENERATIONS: usize = 512;

#[derive(Debug)]
struct GenerationSlot {
    class_count: usize,
    recorders: RecorderChain,
}

/// A fixed ring of generation slots between the sync coordinator (producer,
/// at the tail) and the merge worker (consumer, at the head). Accessed only
/// under the process-wide critical section.
#[derive(Debug)]
pub(crate) struct GenerationRing {
    slots: Vec<GenerationSlot>,
    head: usize,
    tail: usize,
}

impl GenerationRing {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..MAX_GENERATIONS)
                .map(|_| GenerationSlot {
                    class_count: 0,
                    recorders: RecorderChain::empty(),
                })
                .collect(),
            head: 0,
            tail: 0,
        }
    }

    pub(crate) fn generations_in_use(&self) -> usize {
        if self.tail >= self.head {
            self.tail - self.head + 1
        } else {
            MAX_GENERATIONS - (self.head - self.tail) + 1
        }
    }

    /// Appends one drained batch as the current generation and closes it.
    ///
    /// A batch with no recorders does not close the slot (the empty
    /// generation folds into the next one) unless the ring is otherwise
    /// empty. Returns `false` when the ring has been exhausted.
    pub(crate) fn add_generation(&mut self, batch: RecorderChain, class_count: usize) -> bool {
        let slot = &mut self.slots[self.tail];
        slot.class_count = class_count;
        slot.recorders.append(batch);

        if !self.slots[self.tail].recorders.is_empty() || self.head == self.tail {
            self.tail = (self.tail + 1) % MAX_GENERATIONS;
            if self.tail == self.head {
                return false;
            }
        }
        true
    }

    /// Takes the next unmerged recorder of the oldest generation.
    pub(crate) fn next_recorder(&mut self) -> Option<Box<Recorder>> {
        self.slots[self.head].recorders.pop()
    }

    pub(crate) fn head_has_more(&self) -> bool {
        !self.slots[self.head].recorders.is_empty()
    }

    pub(crate) fn has_pending_generations(&self) -> bool {
        self.head != self.tail
    }

    /// Closes out the oldest generation once all of its recorders have been
    /// consumed, returning its class count for promotion. Returns `None`
    /// while the generation still has unmerged recorders (or nothing is
    /// pending).
    pub(crate) fn try_advance_head(&mut self) -> Option<usize> {
        if self.head == self.tail || self.head_has_more() {
            return None;
        }
        let class_count = self.slots[self.head].class_count;
        self.slots[self.head].class_count = 0;
        self.head = (self.head + 1) % MAX_GENERATIONS;
        Some(class_count)
    }

    /// Adds late-arriving recorders (overflow from the pending queue) to the
    /// generation currently being consumed.
    pub(crate) fn add_to_head(&mut self, chain: RecorderChain) {
        self.slots[self.head].recorders.append(chain);
    }

    #[cfg(test)]
    pub(crate) fn count_recorders(&self) -> usize {
        self.slots.iter().map(|slot| slot.recorders.count()).sum()
    }
}

/// Starts the merge worker. Its lifetime spans `Started` until it performs
/// the final shutdown.
pub(crate) fn spawn_worker(
    tracker: Arc<MemTracker>,
    snapshot: Arc<Snapshot>,
) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mem-tracker-worker".to_string())
        .spawn(move || worker_loop(&tracker, &snapshot))
}

// How long the idle worker sleeps before re-checking for work; it is also
// woken explicitly whenever a sync hands over a batch.
const IDLE_WAIT: Duration = Duration::from_millis(100);

fn worker_loop(tracker: &MemTracker, snapshot: &Snapshot) {
    let mut processing_generation: u64 = 0;
    let mut worker_idle = false;

    while !tracker.shutdown_in_progress() {
        let recorder = tracker.critical.lock().generations.next_recorder();

        if let Some(recorder) = recorder {
            if recorder.generation() != processing_generation || worker_idle {
                processing_generation = recorder.generation();
                worker_idle = false;
                tracker.set_processing_generation(processing_generation);
            }

            if snapshot.merge(&recorder) {
                tracker.merge_count.fetch_add(1, atomic::Ordering::Relaxed);
            } else {
                tracker.shutdown(ShutdownReason::OutOfMemory);
            }
            tracker.release_recorder(recorder);
            continue;
        }

        // The oldest generation is fully staged; promote it, or go idle if
        // nothing is pending at all.
        let promoted_class_count = {
            let mut state = tracker.critical.lock();
            if state.generations.has_pending_generations() {
                let advanced = state.generations.try_advance_head();
                if advanced.is_some() {
                    tracker.generations_in_use.store(
                        state.generations.generations_in_use(),
                        atomic::Ordering::Relaxed,
                    );
                }
                // `None` here means new recorders arrived for the head
                // generation in the meantime; retry the outer loop.
                match advanced {
                    Some(class_count) => Some(class_count),
                    None => continue,
                }
            } else {
                None
            }
        };

        if let Some(class_count) = promoted_class_count {
            if !snapshot.promote(class_count) {
                tracker.shutdown(ShutdownReason::OutOfMemory);
            }
            continue;
        }

        // Read the generation before re-checking emptiness: anything at or
        // past this number may still be accumulating, but once the ring and
        // the pending queue are observed empty, every earlier generation has
        // been fully merged and can be published as processed.
        let generation_before = tracker.seqgen.current_generation();
        let has_work = {
            let mut state = tracker.critical.lock();
            if !state.generations.head_has_more() {
                let pending = tracker.pending.drain();
                state.generations.add_to_head(pending);
            }
            state.generations.head_has_more()
        };
        if has_work {
            continue;
        }

        worker_idle = true;
        processing_generation = generation_before;
        tracker.set_processing_generation(generation_before);
        tracker.report_worker_idle();
        snapshot.wait(IDLE_WAIT);
    }

    tracker.final_shutdown();
}
