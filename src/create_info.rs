//! Request shapes passed into the facade (spec §3/§4.2/§4.6).

use crate::{
    block_metadata::Strategy, device::MemoryPropertyFlags, suballocation::SuballocationType,
    type_selector::MemoryUsage,
};

bitflags::bitflags! {
    /// Per-allocation request flags (spec §4.6).
    #[derive(Default)]
    pub struct AllocationCreateFlags: u32 {
        /// Force a dedicated (whole-block) allocation.
        const DEDICATED_MEMORY = 0b0000_0001;
        /// Fail rather than create a new block.
        const NEVER_ALLOCATE = 0b0000_0010;
        /// Map the allocation immediately and keep it mapped.
        const MAPPED = 0b0000_0100;
        /// This request may evict other lost-eligible allocations to fit.
        const CAN_MAKE_OTHER_LOST = 0b0000_1000;
        /// This allocation itself may later be evicted.
        const CAN_BECOME_LOST = 0b0001_0000;
        /// Recheck the heap budget before granting a dedicated allocation.
        const WITHIN_BUDGET = 0b0010_0000;
    }
}

impl AllocationCreateFlags {
    /// Spec §4.6: reject `Mapped`+`CanBecomeLost`,
    /// `DedicatedMemory`+`NeverAllocate`, and `CanBecomeLost` without
    /// `CanMakeOtherLost` is legal (an allocation may be a pure victim), but
    /// `CanMakeOtherLost`+`DedicatedMemory` is not (dedicated allocations
    /// can't contain other allocations to evict).
    pub fn validate(self) -> Result<(), &'static str> {
        if self.contains(Self::MAPPED) && self.contains(Self::CAN_BECOME_LOST) {
            return Err("Mapped is incompatible with CanBecomeLost");
        }
        if self.contains(Self::DEDICATED_MEMORY) && self.contains(Self::NEVER_ALLOCATE) {
            return Err("DedicatedMemory is incompatible with NeverAllocate");
        }
        if self.contains(Self::DEDICATED_MEMORY) && self.contains(Self::CAN_MAKE_OTHER_LOST) {
            return Err("DedicatedMemory is incompatible with CanMakeOtherLost");
        }
        Ok(())
    }
}

/// Caller-attached tag, carried on the handle for diagnostics (spec §3).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum UserData {
    #[default]
    None,
    Tag(u64),
    Name(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) u32);

#[derive(Clone, Debug, Default)]
pub struct AllocationCreateInfo {
    pub usage: MemoryUsage,
    pub required_flags: MemoryPropertyFlags,
    pub preferred_flags: MemoryPropertyFlags,
    pub memory_type_bits: u32,
    pub pool: Option<PoolId>,
    pub flags: AllocationCreateFlags,
    pub strategy: Strategy,
    pub user_data: UserData,
    /// Buffer/image/unknown, for buffer-image granularity conflict checks
    /// against neighbouring suballocations (spec §4.1).
    pub suballoc_type: SuballocationType,
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct PoolCreateFlags: u32 {
        /// Suballocations in this pool ignore buffer/image granularity
        /// conflicts with each other (caller guarantees homogeneity).
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 0b0000_0001;
    }
}

#[derive(Clone, Debug)]
pub struct PoolCreateInfo {
    pub memory_type_index: u32,
    pub flags: PoolCreateFlags,
    /// `None` lets blocks vary in size starting from the type's preferred
    /// block size; `Some` pins every block in the pool to this exact size.
    pub block_size: Option<u64>,
    pub min_block_count: usize,
    pub max_block_count: usize,
    pub frame_in_use_count: u64,
}

impl Default for PoolCreateInfo {
    fn default() -> Self {
        PoolCreateInfo {
            memory_type_index: 0,
            flags: PoolCreateFlags::empty(),
            block_size: None,
            min_block_count: 0,
            max_block_count: usize::MAX,
            frame_in_use_count: 0,
        }
    }
}

#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapSizeLimit {
    pub heap_index: u32,
    pub limit: u64,
}

/// Mirrors `tvma::Config`'s shape: plain, copyable, hashable construction
/// parameters (spec §9 ambient configuration).
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct AllocatorCreateInfo {
    pub preferred_large_heap_block_size: u64,
    /// Per-heap hard ceiling on `block_bytes`; absent heaps are unlimited.
    pub heap_size_limits: Vec<HeapSizeLimit>,
    /// Opt in to `VK_AMD_device_coherent_memory` types participating in
    /// automatic type selection (spec §4.4).
    pub allow_amd_device_coherent_memory: bool,
    pub frame_in_use_count: u64,
    /// Tunes memory-type selection cost: UMA heaps don't benefit from
    /// preferring `DeviceLocal` the way discrete VRAM does (spec §4.4).
    pub integrated_gpu: bool,
}
