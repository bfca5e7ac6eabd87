//! The authoritative aggregated memory state.
//!
//! The snapshot is owned by the merge worker: recorders are merged into a
//! staging buffer as they arrive, and a completed generation is promoted into
//! the live maps in one step, applying records in sequence order. Readers
//! (baseline, reports) take the snapshot lock briefly to summarize the live
//! maps.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::callsite::CallSite;
use crate::record::{EventRecord, MemoryCategory};
use crate::recorder::Recorder;

/// Offset applied to arena-size record addresses; the size record of an
/// arena lives one pointer width above the arena's own address.
pub(crate) const ARENA_SIZE_OFFSET: usize = mem::size_of::<*const ()>();

/// A live malloc'd block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MallocRecord {
    pub(crate) size: usize,
    pub(crate) category: MemoryCategory,
    pub(crate) callsite: Option<CallSite>,
}

/// A live reserved virtual memory region.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VmRegion {
    pub(crate) size: usize,
    pub(crate) committed: usize,
    pub(crate) category: MemoryCategory,
}

#[derive(Debug, Default)]
pub(crate) struct SnapshotInner {
    staged: Vec<EventRecord>,
    pub(crate) live_malloc: BTreeMap<usize, MallocRecord>,
    // Keyed by the (already offset) size-record address.
    pub(crate) arena_sizes: BTreeMap<usize, usize>,
    pub(crate) vm_regions: BTreeMap<usize, VmRegion>,
    pub(crate) class_count: usize,
}

/// The aggregated per-category memory accounting.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    inner: Mutex<SnapshotInner>,
    merge_done: Condvar,
    oom: AtomicBool,
}

impl Snapshot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stages one recorder's records for the generation being processed.
    ///
    /// Returns `false` if staging memory could not be reserved, which the
    /// worker treats as an out-of-memory shutdown condition.
    pub(crate) fn merge(&self, recorder: &Recorder) -> bool {
        let mut inner = self.inner.lock();
        if inner.staged.try_reserve(recorder.len()).is_err() {
            self.oom.store(true, atomic::Ordering::Relaxed);
            return false;
        }
        inner.staged.extend_from_slice(recorder.records());
        true
    }

    /// Applies the staged generation to the live maps, in sequence order,
    /// and publishes the class count captured with the generation.
    pub(crate) fn promote(&self, class_count: usize) -> bool {
        let mut inner = self.inner.lock();
        let mut staged = mem::take(&mut inner.staged);
        staged.sort_unstable_by_key(|record| record.seq);

        for record in &staged {
            Self::apply(&mut inner, record);
        }

        inner.class_count = class_count;
        drop(inner);

        self.merge_done.notify_all();
        true
    }

    fn apply(inner: &mut SnapshotInner, record: &EventRecord) {
        if record.tags.is_vm() {
            Self::apply_vm(inner, record);
        } else {
            Self::apply_malloc(inner, record);
        }
    }

    fn apply_malloc(inner: &mut SnapshotInner, record: &EventRecord) {
        if record.tags.is_allocation() {
            inner.live_malloc.insert(
                record.addr,
                MallocRecord {
                    size: record.size,
                    category: record.tags.category(),
                    callsite: record.callsite,
                },
            );
        } else if record.tags.is_deallocation() {
            inner.live_malloc.remove(&record.addr);
            // Freeing an arena object also retires its size record.
            inner
                .arena_sizes
                .remove(&(record.addr.wrapping_add(ARENA_SIZE_OFFSET)));
        } else if record.tags.is_arena_size() {
            if record.size == 0 {
                inner.arena_sizes.remove(&record.addr);
            } else {
                inner.arena_sizes.insert(record.addr, record.size);
            }
        }
    }

    fn apply_vm(inner: &mut SnapshotInner, record: &EventRecord) {
        if record.tags.is_allocation() {
            let category = record.tags.category();
            inner
                .vm_regions
                .entry(record.addr)
                .and_modify(|region| {
                    region.size = record.size;
                    region.committed = region.committed.min(record.size);
                    region.category = category;
                })
                .or_insert(VmRegion {
                    size: record.size,
                    committed: 0,
                    category,
                });
        } else if record.tags.is_commit() {
            if let Some(region) = Self::region_containing(inner, record.addr) {
                region.committed = region.committed.saturating_add(record.size).min(region.size);
            }
        } else if record.tags.is_uncommit() {
            if let Some(region) = Self::region_containing(inner, record.addr) {
                region.committed = region.committed.saturating_sub(record.size);
            }
        } else if record.tags.is_type_assignment() {
            let category = record.tags.category();
            if let Some(region) = Self::region_containing(inner, record.addr) {
                region.category = category;
            }
        } else if record.tags.is_deallocation() {
            Self::release_region(inner, record.addr, record.size);
        }
    }

    fn region_containing(inner: &mut SnapshotInner, addr: usize) -> Option<&mut VmRegion> {
        inner
            .vm_regions
            .range_mut(..=addr)
            .next_back()
            .filter(|(base, region)| addr < base.wrapping_add(region.size))
            .map(|(_, region)| region)
    }

    fn release_region(inner: &mut SnapshotInner, addr: usize, size: usize) {
        let Some((&base, &region)) = inner
            .vm_regions
            .range(..=addr)
            .next_back()
            .filter(|(base, region)| addr < base.wrapping_add(region.size))
        else {
            return;
        };

        let region_end = base.wrapping_add(region.size);
        let release_end = addr.wrapping_add(size);

        if addr == base && release_end >= region_end {
            inner.vm_regions.remove(&base);
        } else if addr == base {
            // Shrink from the front: the remaining range gets a new base.
            inner.vm_regions.remove(&base);
            inner.vm_regions.insert(
                release_end,
                VmRegion {
                    size: region_end - release_end,
                    committed: region.committed.min(region_end - release_end),
                    category: region.category,
                },
            );
        } else if release_end >= region_end {
            // Shrink from the back.
            let remaining = addr - base;
            if let Some(region) = inner.vm_regions.get_mut(&base) {
                region.size = remaining;
                region.committed = region.committed.min(remaining);
            }
        } else {
            // Releasing the middle of a region leaves no well-formed single
            // range; retire the whole region.
            inner.vm_regions.remove(&base);
        }
    }

    /// Blocks until new merged data is published or the timeout elapses.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        let _ = self.merge_done.wait_for(&mut inner, timeout);
    }

    /// Wakes anyone blocked in [`wait`](Self::wait).
    pub(crate) fn notify(&self) {
        self.merge_done.notify_all();
    }

    /// Whether the snapshot has hit an allocation failure.
    pub(crate) fn out_of_memory(&self) -> bool {
        self.oom.load(atomic::Ordering::Relaxed)
    }

    /// Empties all accumulated state. Used during final shutdown.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.staged.clear();
        inner.live_malloc.clear();
        inner.arena_sizes.clear();
        inner.vm_regions.clear();
        inner.class_count = 0;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SnapshotInner> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::record::Tags;
    use crate::recorder::RecorderCounters;

    assert_impl_all!(Snapshot: Send, Sync);

    const CAPACITY: NonZeroUsize = nz!(64);

    fn staged(snapshot: &Snapshot, records: &[EventRecord]) {
        let counters = Arc::new(RecorderCounters::default());
        let mut recorder = Recorder::new(CAPACITY, 0, counters);
        for record in records {
            assert!(recorder.record(*record));
        }
        assert!(snapshot.merge(&recorder));
    }

    fn malloc(addr: usize, size: usize, category: MemoryCategory, seq: u32) -> EventRecord {
        EventRecord {
            addr,
            size,
            tags: Tags::malloc(category),
            seq,
            callsite: None,
        }
    }

    fn free(addr: usize, seq: u32) -> EventRecord {
        EventRecord {
            addr,
            size: 0,
            tags: Tags::free(),
            seq,
            callsite: None,
        }
    }

    #[test]
    fn malloc_then_free_cancels_out() {
        let snapshot = Snapshot::new();
        staged(
            &snapshot,
            &[malloc(0x1000, 64, MemoryCategory::Gc, 1), free(0x1000, 2)],
        );
        assert!(snapshot.promote(0));

        assert!(snapshot.lock().live_malloc.is_empty());
    }

    #[test]
    fn promote_applies_in_sequence_order_not_arrival_order() {
        let snapshot = Snapshot::new();
        // Free arrives staged before the malloc, but carries the later
        // sequence number: the block must end up dead.
        staged(
            &snapshot,
            &[free(0x2000, 2), malloc(0x2000, 128, MemoryCategory::Code, 1)],
        );
        assert!(snapshot.promote(0));

        assert!(snapshot.lock().live_malloc.is_empty());
    }

    #[test]
    fn realloc_moves_the_block() {
        let snapshot = Snapshot::new();
        staged(
            &snapshot,
            &[
                malloc(0xA, 64, MemoryCategory::Compiler, 1),
                free(0xA, 2),
                malloc(0xB, 128, MemoryCategory::Compiler, 3),
            ],
        );
        assert!(snapshot.promote(0));

        let inner = snapshot.lock();
        assert!(!inner.live_malloc.contains_key(&0xA));
        let moved = inner.live_malloc.get(&0xB).unwrap();
        assert_eq!(moved.size, 128);
        assert_eq!(moved.category, MemoryCategory::Compiler);
    }

    #[test]
    fn commit_is_tracked_inside_its_region() {
        let snapshot = Snapshot::new();
        staged(
            &snapshot,
            &[
                EventRecord {
                    addr: 0x10000,
                    size: 0x4000,
                    tags: Tags::vm_reserve(MemoryCategory::Code),
                    seq: 1,
                    callsite: None,
                },
                EventRecord {
                    addr: 0x11000,
                    size: 0x1000,
                    tags: Tags::vm_commit(MemoryCategory::Code),
                    seq: 2,
                    callsite: None,
                },
            ],
        );
        assert!(snapshot.promote(0));

        let inner = snapshot.lock();
        let region = inner.vm_regions.get(&0x10000).unwrap();
        assert_eq!(region.size, 0x4000);
        assert_eq!(region.committed, 0x1000);
        assert_eq!(region.category, MemoryCategory::Code);
    }

    #[test]
    fn release_shrinks_or_removes_regions() {
        let snapshot = Snapshot::new();
        staged(
            &snapshot,
            &[
                EventRecord {
                    addr: 0x10000,
                    size: 0x4000,
                    tags: Tags::vm_reserve(MemoryCategory::Gc),
                    seq: 1,
                    callsite: None,
                },
                // Release the front quarter.
                EventRecord {
                    addr: 0x10000,
                    size: 0x1000,
                    tags: Tags::vm_release(),
                    seq: 2,
                    callsite: None,
                },
            ],
        );
        assert!(snapshot.promote(0));

        {
            let inner = snapshot.lock();
            let region = inner.vm_regions.get(&0x11000).unwrap();
            assert_eq!(region.size, 0x3000);
        }

        // Release the rest.
        staged(
            &snapshot,
            &[EventRecord {
                addr: 0x11000,
                size: 0x3000,
                tags: Tags::vm_release(),
                seq: 1,
                callsite: None,
            }],
        );
        assert!(snapshot.promote(0));
        assert!(snapshot.lock().vm_regions.is_empty());
    }

    #[test]
    fn type_assignment_recategorizes_a_region() {
        let snapshot = Snapshot::new();
        staged(
            &snapshot,
            &[
                EventRecord {
                    addr: 0x20000,
                    size: 0x2000,
                    tags: Tags::vm_reserve(MemoryCategory::None),
                    seq: 1,
                    callsite: None,
                },
                EventRecord {
                    addr: 0x20000,
                    size: 0,
                    tags: Tags::vm_type(MemoryCategory::ClassMetadata),
                    seq: 2,
                    callsite: None,
                },
            ],
        );
        assert!(snapshot.promote(0));

        let inner = snapshot.lock();
        assert_eq!(
            inner.vm_regions.get(&0x20000).unwrap().category,
            MemoryCategory::ClassMetadata
        );
    }

    #[test]
    fn arena_size_records_follow_their_arena() {
        let snapshot = Snapshot::new();
        let arena_addr = 0x3000;
        staged(
            &snapshot,
            &[
                malloc(arena_addr, 32, MemoryCategory::Compiler, 1),
                EventRecord {
                    addr: arena_addr + ARENA_SIZE_OFFSET,
                    size: 4096,
                    tags: Tags::arena_size(),
                    seq: 2,
                    callsite: None,
                },
            ],
        );
        assert!(snapshot.promote(0));

        {
            let inner = snapshot.lock();
            assert_eq!(
                inner.arena_sizes.get(&(arena_addr + ARENA_SIZE_OFFSET)),
                Some(&4096)
            );
        }

        // Freeing the arena retires the size record too.
        staged(&snapshot, &[free(arena_addr, 1)]);
        assert!(snapshot.promote(0));

        let inner = snapshot.lock();
        assert!(inner.live_malloc.is_empty());
        assert!(inner.arena_sizes.is_empty());
    }

    #[test]
    fn clear_leaves_nothing_behind() {
        let snapshot = Snapshot::new();
        staged(&snapshot, &[malloc(0x1000, 64, MemoryCategory::Gc, 1)]);
        assert!(snapshot.promote(5));

        snapshot.clear();
        let inner = snapshot.lock();
        assert!(inner.live_malloc.is_empty());
        assert_eq!(inner.class_count, 0);
    }
}
