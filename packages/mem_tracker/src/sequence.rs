//! The global event sequence and generation counters.

use std::sync::atomic;
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Hands out the sequence numbers that serialize memory events, and counts
/// the generations those sequence numbers are scoped to.
///
/// Sequence numbers start at 1 within each generation and increase strictly;
/// a generation ends when the sync coordinator calls [`reset`](Self::reset)
/// during a safepoint drain, which also advances the generation counter.
#[derive(Debug)]
pub(crate) struct SequenceGenerator {
    // The next sequence number to hand out. 1-based so that 0 can mean
    // "no sequence reserved" in tracker handles.
    seq: AtomicU32,
    generation: AtomicU64,
}

impl SequenceGenerator {
    pub(crate) fn new() -> Self {
        Self {
            seq: AtomicU32::new(1),
            generation: AtomicU64::new(0),
        }
    }

    /// Allocates the next sequence number. Always positive.
    ///
    /// Saturating the 32-bit range within one generation is a protocol
    /// violation: the sync coordinator resets the counter long before the
    /// range can be exhausted under the throttling rules.
    pub(crate) fn next(&self) -> u32 {
        let seq = self.seq.fetch_add(1, atomic::Ordering::Relaxed);
        debug_assert!(seq != u32::MAX, "sequence number range exhausted");
        seq
    }

    /// The next sequence number that `next` would return.
    pub(crate) fn peek(&self) -> u32 {
        self.seq.load(atomic::Ordering::Relaxed)
    }

    /// Starts a new generation.
    ///
    /// May only be called from the safepoint drain, while no operation is
    /// mid-record; the caller guarantees this by holding the process-wide
    /// critical section and checking the pending-operation count first.
    pub(crate) fn reset(&self) {
        self.seq.store(1, atomic::Ordering::Relaxed);
        self.generation.fetch_add(1, atomic::Ordering::Release);
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(atomic::Ordering::Acquire)
    }
}
