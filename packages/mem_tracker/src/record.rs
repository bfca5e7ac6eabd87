//! Event records and their tag encoding.

use derive_more::Display;

use crate::callsite::CallSite;

/// The logical bucket a memory operation is charged to.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MemoryCategory {
    /// Not attributed to any particular subsystem.
    #[display("Unknown")]
    None = 0,

    /// Garbage collector data structures and auxiliary memory.
    #[display("GC")]
    Gc,

    /// Generated code and the code cache.
    #[display("Code")]
    Code,

    /// The just-in-time compiler's working memory.
    #[display("Compiler")]
    Compiler,

    /// Class/type metadata.
    #[display("Class Metadata")]
    ClassMetadata,

    /// Interned symbols and string tables.
    #[display("Symbols")]
    Symbol,

    /// Thread bookkeeping structures.
    #[display("Thread")]
    Thread,

    /// Thread stacks.
    #[display("Thread Stack")]
    ThreadStack,

    /// Runtime-internal allocations that fit no other bucket.
    #[display("Internal")]
    Internal,

    /// Memory used by the tracking subsystem itself.
    #[display("Memory Tracking")]
    Tracking,

    /// Everything else.
    #[display("Other")]
    Other,
}

impl MemoryCategory {
    /// Number of categories, for fixed-size per-category tables.
    pub const COUNT: usize = 11;

    /// All categories in display order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::None,
        Self::Gc,
        Self::Code,
        Self::Compiler,
        Self::ClassMetadata,
        Self::Symbol,
        Self::Thread,
        Self::ThreadStack,
        Self::Internal,
        Self::Tracking,
        Self::Other,
    ];

    /// Index into per-category tables.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    fn from_u8(value: u8) -> Self {
        *Self::ALL.get(value as usize).unwrap_or(&Self::None)
    }
}

// Operation tag values double as a sorting order: allocation records sort
// ahead of tagging records, which sort ahead of deallocation records for the
// same address.
const TAG_ALLOC: u16 = 0x0001;
const TAG_COMMIT: u16 = 0x0002;
const TAG_TYPE: u16 = 0x0003;
const TAG_UNCOMMIT: u16 = 0x0004;
const TAG_RELEASE: u16 = 0x0005;
const TAG_ARENA_SIZE: u16 = 0x0006;
const TAG_MASK: u16 = 0x0007;
const VM_BIT: u16 = 0x0008;
const CATEGORY_SHIFT: u32 = 8;

/// The packed operation + category bits stored in every event record.
///
/// The low three bits carry the operation tag, bit 3 marks virtual-memory
/// records, and the high byte carries the [`MemoryCategory`]. Deallocation
/// tags carry no category: the live record being removed already knows its
/// own.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Tags(u16);

impl Tags {
    #[must_use]
    pub(crate) fn malloc(category: MemoryCategory) -> Self {
        Self(TAG_ALLOC | Self::category_bits(category))
    }

    #[must_use]
    pub(crate) fn free() -> Self {
        Self(TAG_RELEASE)
    }

    #[must_use]
    pub(crate) fn arena_size() -> Self {
        Self(TAG_ARENA_SIZE)
    }

    #[must_use]
    pub(crate) fn vm_reserve(category: MemoryCategory) -> Self {
        Self(TAG_ALLOC | VM_BIT | Self::category_bits(category))
    }

    #[must_use]
    pub(crate) fn vm_commit(category: MemoryCategory) -> Self {
        Self(TAG_COMMIT | VM_BIT | Self::category_bits(category))
    }

    #[must_use]
    pub(crate) fn vm_uncommit() -> Self {
        Self(TAG_UNCOMMIT | VM_BIT)
    }

    #[must_use]
    pub(crate) fn vm_release() -> Self {
        Self(TAG_RELEASE | VM_BIT)
    }

    #[must_use]
    pub(crate) fn vm_type(category: MemoryCategory) -> Self {
        Self(TAG_TYPE | VM_BIT | Self::category_bits(category))
    }

    fn category_bits(category: MemoryCategory) -> u16 {
        u16::from(category as u8) << CATEGORY_SHIFT
    }

    /// The category carried by this record, if the operation kind keeps one.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "the shift leaves exactly the category byte"
    )]
    #[must_use]
    pub fn category(self) -> MemoryCategory {
        MemoryCategory::from_u8((self.0 >> CATEGORY_SHIFT) as u8)
    }

    /// The operation tag bits, which define the within-address sort order.
    #[must_use]
    pub(crate) fn op_rank(self) -> u16 {
        self.0 & TAG_MASK
    }

    #[must_use]
    pub(crate) fn is_vm(self) -> bool {
        self.0 & VM_BIT != 0
    }

    #[must_use]
    pub(crate) fn is_allocation(self) -> bool {
        self.op_rank() == TAG_ALLOC
    }

    #[must_use]
    pub(crate) fn is_deallocation(self) -> bool {
        self.op_rank() == TAG_RELEASE
    }

    #[must_use]
    pub(crate) fn is_commit(self) -> bool {
        self.op_rank() == TAG_COMMIT
    }

    #[must_use]
    pub(crate) fn is_uncommit(self) -> bool {
        self.op_rank() == TAG_UNCOMMIT
    }

    #[must_use]
    pub(crate) fn is_type_assignment(self) -> bool {
        self.op_rank() == TAG_TYPE
    }

    #[must_use]
    pub(crate) fn is_arena_size(self) -> bool {
        self.op_rank() == TAG_ARENA_SIZE
    }
}

/// One recorded memory event.
///
/// Records are immutable once written into a recorder. For arena-size events
/// the address has already been offset by one pointer width (see the tracker
/// handle), so that a sorted-by-address view places an arena's size record
/// directly after the arena's own allocation record.
#[derive(Clone, Copy, Debug)]
pub struct EventRecord {
    /// The memory block address the event applies to.
    pub addr: usize,
    /// Byte count for the operation; zero for frees and type assignments.
    pub size: usize,
    /// Operation + category bits.
    pub tags: Tags,
    /// Position in the global event order, unique within a generation.
    pub seq: u32,
    /// Caller address, populated only in detail mode.
    pub callsite: Option<CallSite>,
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(EventRecord: Send, Sync, Copy);

    #[test]
    fn category_survives_the_round_trip() {
        for category in MemoryCategory::ALL {
            assert_eq!(Tags::malloc(category).category(), category);
            assert_eq!(Tags::vm_reserve(category).category(), category);
        }
    }

    #[test]
    fn deallocation_tags_carry_no_category() {
        assert_eq!(Tags::free().category(), MemoryCategory::None);
        assert_eq!(Tags::vm_uncommit().category(), MemoryCategory::None);
        assert_eq!(Tags::vm_release().category(), MemoryCategory::None);
        assert_eq!(Tags::arena_size().category(), MemoryCategory::None);
    }

    #[test]
    fn vm_bit_distinguishes_malloc_from_reserve() {
        let malloc = Tags::malloc(MemoryCategory::Code);
        let reserve = Tags::vm_reserve(MemoryCategory::Code);

        assert!(!malloc.is_vm());
        assert!(reserve.is_vm());
        assert!(malloc.is_allocation());
        assert!(reserve.is_allocation());
    }

    #[test]
    fn op_ranks_order_allocs_before_frees() {
        let alloc = Tags::malloc(MemoryCategory::Gc);
        let free = Tags::free();
        let commit = Tags::vm_commit(MemoryCategory::Gc);
        let release = Tags::vm_release();

        assert!(alloc.op_rank() < commit.op_rank());
        assert!(commit.op_rank() < release.op_rank());
        assert!(alloc.op_rank() < free.op_rank());
    }

    #[test]
    fn predicates_match_their_constructors() {
        assert!(Tags::vm_commit(MemoryCategory::None).is_commit());
        assert!(Tags::vm_uncommit().is_uncommit());
        assert!(Tags::vm_type(MemoryCategory::Gc).is_type_assignment());
        assert!(Tags::arena_size().is_arena_size());
        assert!(Tags::free().is_deallocation());
    }

    #[test]
    fn category_indexes_are_dense_and_distinct() {
        for (position, category) in MemoryCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), position);
        }
    }
}
