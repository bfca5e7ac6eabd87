//! The scoped event handle bracketing every memory operation.

use std::sync::Arc;

use crate::callsite::CallSite;
use crate::record::{EventRecord, MemoryCategory, Tags};
use crate::snapshot::ARENA_SIZE_OFFSET;
use crate::thread::{self, RuntimeThread};
use crate::tracker::MemTracker;

/// The kind of memory operation a [`Tracker`] handle brackets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryOperation {
    /// Nothing will be recorded.
    NoOp,
    /// A heap allocation.
    Malloc,
    /// A heap reallocation; emits a free record and a malloc record.
    Realloc,
    /// A heap free.
    Free,
    /// A virtual memory reservation.
    Reserve,
    /// A virtual memory commit.
    Commit,
    /// Reservation and commit in one step; emits both records.
    ReserveAndCommit,
    /// Assigning a category to an existing virtual memory region.
    Type,
    /// A virtual memory uncommit.
    Uncommit,
    /// A virtual memory release.
    Release,
    /// Publishing an arena's current size.
    ArenaSize,
    /// Releasing a thread stack.
    StackRelease,
}

impl MemoryOperation {
    /// Release-class operations whose underlying syscall can fail must
    /// reserve their sequence number up front, so that a concurrent
    /// allocation reusing the same address cannot be ordered ahead of the
    /// release.
    fn pre_reserves_sequence(self) -> bool {
        matches!(self, Self::Realloc | Self::Uncommit | Self::Release)
    }
}

/// A short-lived handle created at each memory operation site.
///
/// Construction decides whether the operation needs the process-wide
/// critical section and whether a sequence number must be reserved before
/// the operation runs. The caller then reports the outcome with exactly one
/// of [`record`](Self::record), [`record_realloc`](Self::record_realloc) or
/// [`discard`](Self::discard):
///
/// ```
/// use mem_tracker::{MemTracker, TrackingLevel};
///
/// let tracker = MemTracker::new(TrackingLevel::Summary);
/// tracker.bootstrap_single_thread();
///
/// let mut handle = tracker.realloc_tracker();
/// // let new_ptr = realloc(old_ptr, new_size);
/// let realloc_succeeded = true;
/// if realloc_succeeded {
///     handle.record_realloc(0xA000, 0xB000, 128, mem_tracker::MemoryCategory::Compiler, None);
/// } else {
///     handle.discard();
/// }
/// ```
#[derive(Debug)]
#[must_use = "the handle must observe record() or discard()"]
pub struct Tracker<'t> {
    tracker: &'t MemTracker,
    op: MemoryOperation,
    thread: Option<Arc<RuntimeThread>>,
    need_critical_lock: bool,
    seq: u32,
    consumed: bool,
}

impl MemTracker {
    /// Creates an event handle for one memory operation.
    ///
    /// When `thread` is `None` the calling thread's registration is looked
    /// up in thread-local storage; events from unregistered threads route
    /// through the global recorder.
    pub fn tracker(&self, op: MemoryOperation, thread: Option<Arc<RuntimeThread>>) -> Tracker<'_> {
        let mut handle = Tracker {
            tracker: self,
            op: MemoryOperation::NoOp,
            thread: None,
            need_critical_lock: false,
            seq: 0,
            consumed: true,
        };

        if !self.is_on() {
            return handle;
        }
        handle.op = op;
        handle.consumed = matches!(op, MemoryOperation::NoOp);

        let target = if self.is_single_threaded_bootstrap() {
            // Still one thread in the whole process; everything goes through
            // the global recorder without locking.
            None
        } else {
            thread.or_else(|| thread::current_for(self.id()))
        };

        match target {
            Some(target) => {
                self.check_load();

                if target.is_safepoint_visible() {
                    // Threads in safepoint-safe states keep running through
                    // the drain, so their writes must hold the critical
                    // section; threads executing inside the runtime stop at
                    // the safepoint and need no lock.
                    handle.need_critical_lock =
                        target.execution_state().is_safepoint_safe();
                    handle.thread = Some(target);
                } else {
                    // Not visited by the safepoint scan: global routing.
                    handle.need_critical_lock = true;
                }
            }
            None => {
                handle.need_critical_lock = !self.is_single_threaded_bootstrap();
            }
        }

        if handle.op.pre_reserves_sequence() {
            if handle.need_critical_lock {
                let _guard = self.critical.lock();
                self.inc_pending_ops();
                handle.seq = self.seqgen.next();
            } else {
                // Safepoint-honoring threads cannot cross a generation
                // boundary mid-operation, so the reservation needs no
                // pending-operation accounting.
                handle.seq = self.seqgen.next();
            }
        }

        handle
    }
}

impl Tracker<'_> {
    /// Records the completed operation.
    ///
    /// A null `addr` means the underlying allocation itself failed; the
    /// handle is consumed without emitting a record.
    pub fn record(
        &mut self,
        addr: usize,
        size: usize,
        category: MemoryCategory,
        callsite: Option<CallSite>,
    ) {
        debug_assert!(
            !matches!(self.op, MemoryOperation::Realloc),
            "realloc operations use record_realloc"
        );

        if !self.tracker.is_on() || matches!(self.op, MemoryOperation::NoOp) {
            self.consumed = true;
            return;
        }
        if addr == 0 {
            self.release_reservation();
            self.consumed = true;
            return;
        }

        let pre_reserved = self.seq != 0;
        let (tags, addr) = match self.op {
            MemoryOperation::Malloc => (Tags::malloc(category), addr),
            MemoryOperation::Free => (Tags::free(), addr),
            MemoryOperation::Reserve | MemoryOperation::ReserveAndCommit => {
                (Tags::vm_reserve(category), addr)
            }
            MemoryOperation::Commit => (Tags::vm_commit(MemoryCategory::None), addr),
            MemoryOperation::Type => (Tags::vm_type(category), addr),
            MemoryOperation::Uncommit => {
                debug_assert!(pre_reserved, "uncommit requires a pre-reserved sequence");
                (Tags::vm_uncommit(), addr)
            }
            MemoryOperation::Release => {
                debug_assert!(pre_reserved, "release requires a pre-reserved sequence");
                (Tags::vm_release(), addr)
            }
            MemoryOperation::StackRelease => (Tags::vm_release(), addr),
            // The size record is placed one pointer width above the arena
            // address so an address-sorted view keeps it next to its arena.
            MemoryOperation::ArenaSize => {
                (Tags::arena_size(), addr.wrapping_add(ARENA_SIZE_OFFSET))
            }
            MemoryOperation::NoOp | MemoryOperation::Realloc => unreachable!(),
        };
        let callsite = self.tracker.track_callsite().then_some(callsite).flatten();

        if self.need_critical_lock {
            let mut state = self.tracker.critical.lock();
            if self.seq == 0 {
                self.seq = self.tracker.seqgen.next();
            }
            self.tracker.write_record(
                Some(&mut state),
                self.thread.as_deref(),
                EventRecord {
                    addr,
                    size,
                    tags,
                    seq: self.seq,
                    callsite,
                },
            );
            if matches!(self.op, MemoryOperation::ReserveAndCommit) {
                self.tracker.write_record(
                    Some(&mut state),
                    self.thread.as_deref(),
                    EventRecord {
                        addr,
                        size,
                        tags: Tags::vm_commit(category),
                        seq: self.tracker.seqgen.next(),
                        callsite,
                    },
                );
            }
            if pre_reserved {
                self.tracker.dec_pending_ops();
            }
        } else {
            if self.seq == 0 {
                self.seq = self.tracker.seqgen.next();
            }
            self.tracker.write_record(
                None,
                self.thread.as_deref(),
                EventRecord {
                    addr,
                    size,
                    tags,
                    seq: self.seq,
                    callsite,
                },
            );
            if matches!(self.op, MemoryOperation::ReserveAndCommit) {
                self.tracker.write_record(
                    None,
                    self.thread.as_deref(),
                    EventRecord {
                        addr,
                        size,
                        tags: Tags::vm_commit(category),
                        seq: self.tracker.seqgen.next(),
                        callsite,
                    },
                );
            }
        }

        self.seq = 0;
        self.consumed = true;
    }

    /// Records a successful reallocation from `old_addr` to `new_addr`.
    ///
    /// Emits a free record for the old address on the pre-reserved sequence
    /// number, then a malloc record for the new address on a fresh one, so
    /// the free is ordered first even against concurrent allocations reusing
    /// `old_addr`.
    pub fn record_realloc(
        &mut self,
        old_addr: usize,
        new_addr: usize,
        size: usize,
        category: MemoryCategory,
        callsite: Option<CallSite>,
    ) {
        debug_assert!(
            matches!(self.op, MemoryOperation::Realloc | MemoryOperation::NoOp),
            "record_realloc is only valid on realloc handles"
        );
        debug_assert!(old_addr != 0 && new_addr != 0, "null realloc addresses");

        if !self.tracker.is_on() || !matches!(self.op, MemoryOperation::Realloc) {
            self.consumed = true;
            return;
        }
        debug_assert!(self.seq > 0, "realloc requires a pre-reserved sequence");
        let callsite = self.tracker.track_callsite().then_some(callsite).flatten();

        let free_record = EventRecord {
            addr: old_addr,
            size: 0,
            tags: Tags::free(),
            seq: self.seq,
            callsite,
        };

        if self.need_critical_lock {
            let mut state = self.tracker.critical.lock();
            self.tracker
                .write_record(Some(&mut state), self.thread.as_deref(), free_record);
            self.tracker.write_record(
                Some(&mut state),
                self.thread.as_deref(),
                EventRecord {
                    addr: new_addr,
                    size,
                    tags: Tags::malloc(category),
                    seq: self.tracker.seqgen.next(),
                    callsite,
                },
            );
            self.tracker.dec_pending_ops();
        } else {
            self.tracker
                .write_record(None, self.thread.as_deref(), free_record);
            self.tracker.write_record(
                None,
                self.thread.as_deref(),
                EventRecord {
                    addr: new_addr,
                    size,
                    tags: Tags::malloc(category),
                    seq: self.tracker.seqgen.next(),
                    callsite,
                },
            );
        }

        self.seq = 0;
        self.consumed = true;
    }

    /// Abandons the operation, releasing any pre-reserved sequence number.
    ///
    /// Idempotent, and a no-op after [`record`](Self::record).
    pub fn discard(&mut self) {
        self.release_reservation();
        self.consumed = true;
    }

    fn release_reservation(&mut self) {
        if self.tracker.is_on() && self.seq != 0 {
            if self.need_critical_lock {
                let _guard = self.tracker.critical.lock();
                self.tracker.dec_pending_ops();
            }
            self.seq = 0;
        }
    }
}

impl Drop for Tracker<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.consumed,
            "tracker handle dropped without record() or discard()"
        );
        // A leaked reservation would stall generation advancement forever.
        self.release_reservation();
    }
}

// Convenience entry points mirroring the memory operations the embedding
// runtime instruments.
impl MemTracker {
    /// Records a completed `malloc`.
    pub fn record_malloc(
        &self,
        addr: usize,
        size: usize,
        category: MemoryCategory,
        callsite: Option<CallSite>,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        let mut handle = self.tracker(MemoryOperation::Malloc, thread);
        handle.record(addr, size, category, callsite);
    }

    /// Records a completed `free`.
    pub fn record_free(&self, addr: usize, thread: Option<Arc<RuntimeThread>>) {
        let mut handle = self.tracker(MemoryOperation::Free, thread);
        handle.record(addr, 0, MemoryCategory::None, None);
    }

    /// Records an arena's current size.
    pub fn record_arena_size(&self, addr: usize, size: usize) {
        let mut handle = self.tracker(MemoryOperation::ArenaSize, None);
        handle.record(addr, size, MemoryCategory::None, None);
    }

    /// Records a virtual memory reservation.
    pub fn record_virtual_memory_reserve(
        &self,
        addr: usize,
        size: usize,
        category: MemoryCategory,
        callsite: Option<CallSite>,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        debug_assert!(size > 0, "reserving an empty range");
        let mut handle = self.tracker(MemoryOperation::Reserve, thread);
        handle.record(addr, size, category, callsite);
    }

    /// Records a combined reserve-and-commit.
    pub fn record_virtual_memory_reserve_and_commit(
        &self,
        addr: usize,
        size: usize,
        category: MemoryCategory,
        callsite: Option<CallSite>,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        let mut handle = self.tracker(MemoryOperation::ReserveAndCommit, thread);
        handle.record(addr, size, category, callsite);
    }

    /// Records a virtual memory commit.
    pub fn record_virtual_memory_commit(
        &self,
        addr: usize,
        size: usize,
        callsite: Option<CallSite>,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        let mut handle = self.tracker(MemoryOperation::Commit, thread);
        handle.record(addr, size, MemoryCategory::None, callsite);
    }

    /// Records a virtual memory release that cannot fail. For releases that
    /// can fail, use [`virtual_memory_release_tracker`](Self::virtual_memory_release_tracker).
    pub fn record_virtual_memory_release(
        &self,
        addr: usize,
        size: usize,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        if self.is_on() {
            let mut handle = self.tracker(MemoryOperation::Release, thread);
            handle.record(addr, size, MemoryCategory::None, None);
        }
    }

    /// Assigns a category to a reserved virtual memory region.
    pub fn record_virtual_memory_type(
        &self,
        addr: usize,
        category: MemoryCategory,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        let mut handle = self.tracker(MemoryOperation::Type, thread);
        handle.record(addr, 0, category, None);
    }

    /// Records a thread stack allocation.
    pub fn record_thread_stack(
        &self,
        addr: usize,
        size: usize,
        thread: Option<Arc<RuntimeThread>>,
        callsite: Option<CallSite>,
    ) {
        let mut handle = self.tracker(MemoryOperation::ReserveAndCommit, thread);
        handle.record(addr, size, MemoryCategory::ThreadStack, callsite);
    }

    /// Records a thread stack release.
    pub fn release_thread_stack(
        &self,
        addr: usize,
        size: usize,
        thread: Option<Arc<RuntimeThread>>,
    ) {
        let mut handle = self.tracker(MemoryOperation::StackRelease, thread);
        handle.record(addr, size, MemoryCategory::ThreadStack, None);
    }

    /// An event handle for a reallocation that may fail. Call
    /// [`Tracker::record_realloc`] on success or [`Tracker::discard`] on
    /// failure.
    pub fn realloc_tracker(&self) -> Tracker<'_> {
        self.tracker(MemoryOperation::Realloc, None)
    }

    /// An event handle for an uncommit that may fail.
    pub fn virtual_memory_uncommit_tracker(&self) -> Tracker<'_> {
        self.tracker(MemoryOperation::Uncommit, None)
    }

    /// An event handle for a release that may fail.
    pub fn virtual_memory_release_tracker(&self) -> Tracker<'_> {
        self.tracker(MemoryOperation::Release, None)
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::TrackingLevel;

    assert_impl_all!(MemoryOperation: Send, Sync, Copy);

    fn bootstrapped_tracker() -> Arc<MemTracker> {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker
    }

    fn global_record_count(tracker: &MemTracker) -> usize {
        let state = tracker.critical.lock();
        state
            .global_recorder
            .as_ref()
            .map_or(0, |recorder| recorder.len())
    }

    #[test]
    fn noop_handle_records_nothing() {
        let tracker = bootstrapped_tracker();
        let mut handle = tracker.tracker(MemoryOperation::NoOp, None);
        handle.record(0x1000, 64, MemoryCategory::Gc, None);

        assert_eq!(global_record_count(&tracker), 0);
        assert_eq!(tracker.seqgen.peek(), 1);
    }

    #[test]
    fn malloc_emits_exactly_one_record() {
        let tracker = bootstrapped_tracker();
        tracker.record_malloc(0x1000, 64, MemoryCategory::Gc, None, None);
        assert_eq!(global_record_count(&tracker), 1);
    }

    #[test]
    fn reserve_and_commit_emits_two_records() {
        let tracker = bootstrapped_tracker();
        tracker.record_virtual_memory_reserve_and_commit(
            0x10000,
            4096,
            MemoryCategory::Code,
            None,
            None,
        );

        let state = tracker.critical.lock();
        let recorder = state.global_recorder.as_ref().unwrap();
        assert_eq!(recorder.len(), 2);

        let records = recorder.records();
        assert!(records[0].tags.is_allocation());
        assert!(records[0].tags.is_vm());
        assert!(records[1].tags.is_commit());
        assert_eq!(records[1].tags.category(), MemoryCategory::Code);
        assert!(records[0].seq < records[1].seq);
    }

    #[test]
    fn realloc_orders_free_before_malloc() {
        let tracker = bootstrapped_tracker();
        let mut handle = tracker.realloc_tracker();
        handle.record_realloc(0xA000, 0xB000, 128, MemoryCategory::Compiler, None);

        let state = tracker.critical.lock();
        let records = state.global_recorder.as_ref().unwrap().records();
        assert_eq!(records.len(), 2);

        let free = &records[0];
        let malloc = &records[1];
        assert!(free.tags.is_deallocation());
        assert_eq!(free.addr, 0xA000);
        assert!(malloc.tags.is_allocation());
        assert_eq!(malloc.addr, 0xB000);
        assert!(free.seq < malloc.seq);
    }

    #[test]
    fn discarded_handle_emits_nothing_and_restores_pending_count() {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker.bootstrap_multi_thread();

        // Multi-thread mode with no registered thread: the reservation path
        // goes through the critical section and the pending-op count.
        let mut handle = tracker.realloc_tracker();
        assert_eq!(tracker.pending_op_count(), 1);

        handle.discard();
        assert_eq!(tracker.pending_op_count(), 0);

        // Idempotent.
        handle.discard();
        assert_eq!(tracker.pending_op_count(), 0);
        assert_eq!(global_record_count(&tracker), 0);
    }

    #[test]
    fn discard_after_record_is_a_no_op() {
        let tracker = bootstrapped_tracker();
        let mut handle = tracker.tracker(MemoryOperation::Malloc, None);
        handle.record(0x2000, 32, MemoryCategory::Internal, None);
        handle.discard();

        assert_eq!(global_record_count(&tracker), 1);
        assert_eq!(tracker.pending_op_count(), 0);
    }

    #[test]
    fn single_thread_bootstrap_reserves_without_pending_ops() {
        let tracker = bootstrapped_tracker();
        let mut handle = tracker.realloc_tracker();

        // Safepoints cannot happen in single-thread mode, so no
        // pending-operation accounting is needed.
        assert_eq!(tracker.pending_op_count(), 0);
        handle.discard();
    }

    #[test]
    fn null_address_consumes_the_handle_silently() {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker.bootstrap_multi_thread();

        let mut handle = tracker.virtual_memory_uncommit_tracker();
        assert_eq!(tracker.pending_op_count(), 1);
        handle.record(0, 4096, MemoryCategory::None, None);

        assert_eq!(tracker.pending_op_count(), 0);
        assert_eq!(global_record_count(&tracker), 0);
    }

    #[test]
    fn arena_size_offsets_the_address() {
        let tracker = bootstrapped_tracker();
        tracker.record_arena_size(0x3000, 4096);

        let state = tracker.critical.lock();
        let records = state.global_recorder.as_ref().unwrap().records();
        assert_eq!(records[0].addr, 0x3000 + ARENA_SIZE_OFFSET);
        assert!(records[0].tags.is_arena_size());
    }

    #[test]
    fn per_thread_events_go_to_the_thread_recorder() {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker.bootstrap_multi_thread();
        let attached = tracker.attach_thread();

        tracker.record_malloc(0x5000, 16, MemoryCategory::Thread, None, None);

        let recorder = attached.slot.take().expect("per-thread recorder");
        assert_eq!(recorder.len(), 1);
        assert_eq!(global_record_count(&tracker), 0);
        attached.slot.install(recorder);

        tracker.thread_exiting(&attached);
    }

    #[test]
    fn invisible_threads_route_globally() {
        let tracker = MemTracker::new(TrackingLevel::Summary);
        tracker.bootstrap_single_thread();
        tracker.bootstrap_multi_thread();
        let attached = tracker.attach_thread();
        attached.set_safepoint_visible(false);

        tracker.record_malloc(0x6000, 16, MemoryCategory::Thread, None, None);

        assert!(attached.slot.take().is_none());
        assert_eq!(global_record_count(&tracker), 1);

        tracker.thread_exiting(&attached);
    }

    #[test]
    fn callsites_are_dropped_in_summary_mode() {
        let tracker = bootstrapped_tracker();
        tracker.record_malloc(
            0x7000,
            8,
            MemoryCategory::Gc,
            CallSite::new(0x1234),
            None,
        );

        let state = tracker.critical.lock();
        let records = state.global_recorder.as_ref().unwrap().records();
        assert!(records[0].callsite.is_none());
    }

    #[test]
    fn off_tracker_handles_are_inert() {
        let tracker = MemTracker::new(TrackingLevel::Off);
        let mut handle = tracker.tracker(MemoryOperation::Malloc, None);
        handle.record(0x1000, 64, MemoryCategory::Gc, None);
        let mut realloc = tracker.realloc_tracker();
        realloc.discard();

        assert_eq!(tracker.pending_op_count(), 0);
    }
}
