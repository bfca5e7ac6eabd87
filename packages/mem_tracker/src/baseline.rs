//! Baseline capture and per-category diffing.

use std::collections::BTreeMap;

use crate::callsite::CallSite;
use crate::record::MemoryCategory;
use crate::snapshot::{ARENA_SIZE_OFFSET, Snapshot};

/// Aggregated usage for one memory category.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CategoryUsage {
    /// Bytes currently malloc'd in this category.
    pub malloc_bytes: u64,
    /// Number of live malloc'd blocks.
    pub malloc_count: u64,
    /// Bytes currently held by arenas in this category.
    pub arena_bytes: u64,
    /// Number of live arenas.
    pub arena_count: u64,
    /// Bytes of reserved virtual memory.
    pub reserved_bytes: u64,
    /// Bytes of committed virtual memory.
    pub committed_bytes: u64,
}

impl CategoryUsage {
    /// Whether nothing at all is charged to this category.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn accumulate(&mut self, other: &Self) {
        self.malloc_bytes += other.malloc_bytes;
        self.malloc_count += other.malloc_count;
        self.arena_bytes += other.arena_bytes;
        self.arena_count += other.arena_count;
        self.reserved_bytes += other.reserved_bytes;
        self.committed_bytes += other.committed_bytes;
    }
}

/// Change in one category between a baseline and the current state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CategoryDelta {
    /// Change in malloc'd bytes.
    pub malloc_bytes: i64,
    /// Change in live malloc'd block count.
    pub malloc_count: i64,
    /// Change in arena bytes.
    pub arena_bytes: i64,
    /// Change in reserved virtual memory bytes.
    pub reserved_bytes: i64,
    /// Change in committed virtual memory bytes.
    pub committed_bytes: i64,
}

impl CategoryDelta {
    /// Whether the category did not change at all.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Malloc'd bytes attributed to one call site (detail mode only).
#[derive(Clone, Copy, Debug)]
pub struct CallSiteUsage {
    /// The recorded caller address.
    pub callsite: CallSite,
    /// Bytes currently malloc'd from this call site.
    pub bytes: u64,
    /// Number of live blocks allocated from this call site.
    pub count: u64,
}

/// A point-in-time aggregation of the snapshot, used both as the latched
/// baseline and as the working copy behind every report.
#[derive(Clone, Debug, Default)]
pub(crate) struct Baseline {
    categories: [CategoryUsage; MemoryCategory::COUNT],
    call_sites: Vec<CallSiteUsage>,
    class_count: usize,
    baselined: bool,
}

impl Baseline {
    /// Replaces this baseline's contents with an aggregation of the given
    /// snapshot. With `summary_only` the per-call-site breakdown is skipped.
    pub(crate) fn capture(&mut self, snapshot: &Snapshot, summary_only: bool) -> bool {
        self.clear();

        let inner = snapshot.lock();

        let mut sites: BTreeMap<CallSite, (u64, u64)> = BTreeMap::new();
        for record in inner.live_malloc.values() {
            let usage = &mut self.categories[record.category.index()];
            usage.malloc_bytes += record.size as u64;
            usage.malloc_count += 1;

            if !summary_only
                && let Some(site) = record.callsite
            {
                let entry = sites.entry(site).or_insert((0, 0));
                entry.0 += record.size as u64;
                entry.1 += 1;
            }
        }

        for (&size_addr, &size) in &inner.arena_sizes {
            // The size record sits one pointer width above its arena.
            let category = inner
                .live_malloc
                .get(&size_addr.wrapping_sub(ARENA_SIZE_OFFSET))
                .map_or(MemoryCategory::None, |arena| arena.category);
            let usage = &mut self.categories[category.index()];
            usage.arena_bytes += size as u64;
            usage.arena_count += 1;
        }

        for region in inner.vm_regions.values() {
            let usage = &mut self.categories[region.category.index()];
            usage.reserved_bytes += region.size as u64;
            usage.committed_bytes += region.committed as u64;
        }

        self.class_count = inner.class_count;
        drop(inner);

        self.call_sites = sites
            .into_iter()
            .map(|(callsite, (bytes, count))| CallSiteUsage {
                callsite,
                bytes,
                count,
            })
            .collect();
        // Largest consumers first.
        self.call_sites
            .sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.callsite.cmp(&b.callsite)));

        self.baselined = true;
        true
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn baselined(&self) -> bool {
        self.baselined
    }

    pub(crate) fn category(&self, category: MemoryCategory) -> CategoryUsage {
        self.categories[category.index()]
    }

    pub(crate) fn call_sites(&self) -> &[CallSiteUsage] {
        &self.call_sites
    }

    pub(crate) fn class_count(&self) -> usize {
        self.class_count
    }

    /// Sums usage across all categories.
    pub(crate) fn total(&self) -> CategoryUsage {
        let mut total = CategoryUsage::default();
        for usage in &self.categories {
            total.accumulate(usage);
        }
        total
    }

    /// Per-category change from `earlier` to `self`.
    pub(crate) fn diff_from(&self, earlier: &Self) -> [CategoryDelta; MemoryCategory::COUNT] {
        let mut deltas = [CategoryDelta::default(); MemoryCategory::COUNT];
        for category in MemoryCategory::ALL {
            let current = self.category(category);
            let base = earlier.category(category);
            deltas[category.index()] = CategoryDelta {
                malloc_bytes: signed_delta(current.malloc_bytes, base.malloc_bytes),
                malloc_count: signed_delta(current.malloc_count, base.malloc_count),
                arena_bytes: signed_delta(current.arena_bytes, base.arena_bytes),
                reserved_bytes: signed_delta(current.reserved_bytes, base.reserved_bytes),
                committed_bytes: signed_delta(current.committed_bytes, base.committed_bytes),
            };
        }
        deltas
    }
}

fn signed_delta(current: u64, earlier: u64) -> i64 {
    if current >= earlier {
        i64::try_from(current - earlier).expect("byte delta exceeds i64 range")
    } else {
        -i64::try_from(earlier - current).expect("byte delta exceeds i64 range")
    }
}
