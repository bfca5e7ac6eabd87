//! Fixed-capacity per-thread event recorders.

use std::num::NonZeroUsize;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic;
use std::sync::atomic::AtomicUsize;

use new_zealand::nz;

use crate::record::EventRecord;

/// Default number of records a recorder can hold before it is handed off to
/// the pending queue.
pub(crate) const DEFAULT_RECORDER_CAPACITY: NonZeroUsize = nz!(512);

/// Process-wide recorder bookkeeping, shared by every recorder of one tracker
/// instance. The instance count drives the sync coordinator's backpressure
/// decisions; it must be conserved: whatever is incremented at construction
/// is decremented exactly once at drop.
#[derive(Debug, Default)]
pub(crate) struct RecorderCounters {
    instances: AtomicUsize,
}

impl RecorderCounters {
    pub(crate) fn instance_count(&self) -> usize {
        self.instances.load(atomic::Ordering::Relaxed)
    }
}

/// An append-only buffer of event records with a fixed capacity.
///
/// A recorder is owned by exactly one party at a time: a thread slot, the
/// global slot, the pool, the pending queue, or the merge worker. Transfer
/// between owners happens only through the atomic slot/stack heads, so the
/// owning party always has exclusive access to the buffer.
#[derive(Debug)]
pub(crate) struct Recorder {
    records: Vec<EventRecord>,
    capacity: NonZeroUsize,
    // Intrusive link used while the recorder sits on the pool or the pending
    // queue. Null whenever the recorder is individually owned.
    next: *mut Recorder,
    // The generation this recorder is allowed to hold records for; stamped
    // when the recorder is created or taken from the pool.
    generation: u64,
    counters: Arc<RecorderCounters>,
}

// SAFETY: The raw `next` pointer is only ever traversed by the stack that
// links the recorder, under that stack's CAS protocol; an individually owned
// recorder has a null link. Everything else in the struct is Send.
unsafe impl Send for Recorder {}

impl Recorder {
    pub(crate) fn new(
        capacity: NonZeroUsize,
        generation: u64,
        counters: Arc<RecorderCounters>,
    ) -> Box<Self> {
        counters.instances.fetch_add(1, atomic::Ordering::Relaxed);
        Box::new(Self {
            records: Vec::with_capacity(capacity.get()),
            capacity,
            next: ptr::null_mut(),
            generation,
            counters,
        })
    }

    /// Appends a record. Returns `false` if the recorder was already full.
    pub(crate) fn record(&mut self, record: EventRecord) -> bool {
        debug_assert!(record.seq > 0, "records must carry a sequence number");
        debug_assert!(
            !self.records.iter().any(|existing| existing.seq == record.seq),
            "duplicate sequence number within one recorder"
        );

        if self.is_full() {
            return false;
        }
        self.records.push(record);
        true
    }

    pub(crate) fn is_full(&self) -> bool {
        self.records.len() >= self.capacity.get()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Re-stamps the recorder when it is taken from the pool for a new
    /// generation.
    pub(crate) fn set_generation(&mut self, generation: u64) {
        debug_assert!(self.is_empty(), "cannot re-stamp a recorder holding records");
        self.generation = generation;
    }

    pub(crate) fn set_next(&mut self, next: *mut Recorder) {
        self.next = next;
    }

    pub(crate) fn next(&self) -> *mut Recorder {
        self.next
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let previous = self.counters.instances.fetch_sub(1, atomic::Ordering::Relaxed);
        debug_assert!(previous > 0, "recorder instance count underflow");
    }
}
