//! The allocation handle returned to callers (spec §3, L9) and the shared
//! lost-allocation state it carries.

use {
    crate::{
        create_info::UserData,
        device::{DeviceMemoryHandle, MappedRange, MemoryDevice},
        error::Error,
        suballocation::SuballocationType,
        util::align_up_non_pot,
    },
    std::{
        ptr::NonNull,
        sync::{
            atomic::{AtomicU32, AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Sentinel `last_use_frame` value published once a block-backed allocation
/// is evicted. Never a real frame index since frame counters start at 0 and
/// only ever increase by small steps (spec §9).
pub const LOST_SENTINEL: u64 = u64::MAX;

/// Shared, atomically-updated state behind a block-backed handle. The
/// suballocation record in [`crate::block_metadata::BlockMetadata`] holds
/// only the lightweight [`crate::suballocation::AllocationId`] that indexes
/// back to one of these — never this `Arc` itself (spec §9: a weak,
/// invalidatable relation, not ownership).
#[derive(Debug)]
pub struct HandleState {
    pub can_become_lost: bool,
    last_use_frame: AtomicU64,
    map_count: AtomicU32,
}

impl HandleState {
    pub fn new(can_become_lost: bool, current_frame: u64) -> Self {
        HandleState {
            can_become_lost,
            last_use_frame: AtomicU64::new(current_frame),
            map_count: AtomicU32::new(0),
        }
    }

    pub fn last_use_frame(&self) -> Option<u64> {
        if !self.can_become_lost {
            return None;
        }
        match self.last_use_frame.load(Ordering::Acquire) {
            LOST_SENTINEL => None,
            frame => Some(frame),
        }
    }

    pub fn try_mark_lost(&self, observed: u64) -> bool {
        self.last_use_frame
            .compare_exchange(
                observed,
                LOST_SENTINEL,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_lost(&self) -> bool {
        self.last_use_frame.load(Ordering::Acquire) == LOST_SENTINEL
    }

    /// Publishes that the allocation was touched this frame (spec §4.2:
    /// "Touch" bumps `last_use_frame` so a recent allocation can't be
    /// evicted out from under in-flight GPU work).
    pub fn touch(&self, current_frame: u64) {
        self.last_use_frame
            .fetch_max(current_frame, Ordering::AcqRel);
    }
}

/// An allocation suballocated out of a shared device block.
#[derive(Debug)]
pub struct BlockBackedAllocation {
    pub(crate) type_index: u32,
    pub(crate) pool: Option<u32>,
    pub(crate) block_key: usize,
    pub(crate) memory: DeviceMemoryHandle,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) alignment: u64,
    pub(crate) suballoc_type: SuballocationType,
    pub(crate) user_data: UserData,
    pub(crate) state: Arc<HandleState>,
}

/// An allocation that owns an entire device memory object (spec §4.3).
#[derive(Debug)]
pub struct DedicatedAllocation {
    pub(crate) type_index: u32,
    pub(crate) memory: DeviceMemoryHandle,
    pub(crate) size: u64,
    pub(crate) user_data: UserData,
    mapped_ptr: parking_lot::Mutex<Option<NonNull<u8>>>,
    map_count: AtomicU32,
}

// SAFETY: `mapped_ptr` is only ever read/written under `mapped_ptr`'s own
// lock, and the pointee is device-mapped memory the driver guarantees is
// valid for the handle's lifetime.
unsafe impl Send for DedicatedAllocation {}
unsafe impl Sync for DedicatedAllocation {}

impl DedicatedAllocation {
    pub(crate) fn new(
        type_index: u32,
        memory: DeviceMemoryHandle,
        size: u64,
        user_data: UserData,
    ) -> Self {
        DedicatedAllocation {
            type_index,
            memory,
            size,
            user_data,
            mapped_ptr: parking_lot::Mutex::new(None),
            map_count: AtomicU32::new(0),
        }
    }
}

#[derive(Debug)]
pub enum AllocationHandle {
    BlockBacked(BlockBackedAllocation),
    Dedicated(Arc<DedicatedAllocation>),
}

impl AllocationHandle {
    pub fn size(&self) -> u64 {
        match self {
            AllocationHandle::BlockBacked(a) => {
                if a.state.is_lost() {
                    0
                } else {
                    a.size
                }
            }
            AllocationHandle::Dedicated(a) => a.size,
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        match self {
            AllocationHandle::BlockBacked(a) => a.type_index,
            AllocationHandle::Dedicated(a) => a.type_index,
        }
    }

    pub fn user_data(&self) -> &UserData {
        match self {
            AllocationHandle::BlockBacked(a) => &a.user_data,
            AllocationHandle::Dedicated(a) => &a.user_data,
        }
    }

    /// `true` once a `CanBecomeLost` allocation has been evicted by another
    /// request (spec §4.2, glossary "Lost allocation").
    pub fn is_lost(&self) -> bool {
        match self {
            AllocationHandle::BlockBacked(a) => a.state.is_lost(),
            AllocationHandle::Dedicated(_) => false,
        }
    }

    /// Records that the allocation was used this frame, protecting it from
    /// the losing sweep until `frame_in_use_count` frames have passed.
    pub fn touch(&self, current_frame: u64) {
        if let AllocationHandle::BlockBacked(a) = self {
            a.state.touch(current_frame);
        }
    }

    /// Maps a dedicated allocation's own memory object directly (spec
    /// §4.7). Block-backed allocations share their block's reference-counted
    /// mapping and go through `BlockList::map_allocation` instead, since the
    /// handle alone doesn't own the block.
    pub fn map_dedicated(&self, device: &dyn MemoryDevice) -> Result<NonNull<u8>, Error> {
        match self {
            AllocationHandle::BlockBacked(_) => Err(Error::invalid_state(
                "block-backed allocations map through their owning block list",
            )),
            AllocationHandle::Dedicated(a) => {
                let mut guard = a.mapped_ptr.lock();
                if guard.is_none() {
                    let ptr = unsafe { device.map_memory(a.memory, 0, a.size)? };
                    *guard = Some(ptr);
                }
                a.map_count.fetch_add(1, Ordering::AcqRel);
                Ok(guard.unwrap())
            }
        }
    }

    pub fn unmap_dedicated(&self, device: &dyn MemoryDevice) {
        if let AllocationHandle::Dedicated(a) = self {
            let prev = a.map_count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "unbalanced unmap");
            if prev == 1 {
                let mut guard = a.mapped_ptr.lock();
                if guard.take().is_some() {
                    unsafe { device.unmap_memory(a.memory) };
                }
            }
        }
    }

    pub(crate) fn as_block_backed(&self) -> Option<&BlockBackedAllocation> {
        match self {
            AllocationHandle::BlockBacked(a) => Some(a),
            AllocationHandle::Dedicated(_) => None,
        }
    }

    pub fn flush(
        &self,
        device: &dyn MemoryDevice,
        offset: u64,
        size: u64,
    ) -> Result<(), Error> {
        let atom = device.non_coherent_atom_size();
        match self {
            AllocationHandle::BlockBacked(a) => {
                let range = aligned_range(a.memory, a.offset + offset, size, atom);
                unsafe { device.flush_ranges(&[range])? };
            }
            AllocationHandle::Dedicated(a) => {
                let range = aligned_range(a.memory, offset, size, atom);
                unsafe { device.flush_ranges(&[range])? };
            }
        }
        Ok(())
    }

    pub fn invalidate(
        &self,
        device: &dyn MemoryDevice,
        offset: u64,
        size: u64,
    ) -> Result<(), Error> {
        let atom = device.non_coherent_atom_size();
        match self {
            AllocationHandle::BlockBacked(a) => {
                let range = aligned_range(a.memory, a.offset + offset, size, atom);
                unsafe { device.invalidate_ranges(&[range])? };
            }
            AllocationHandle::Dedicated(a) => {
                let range = aligned_range(a.memory, offset, size, atom);
                unsafe { device.invalidate_ranges(&[range])? };
            }
        }
        Ok(())
    }
}

fn aligned_range(memory: DeviceMemoryHandle, offset: u64, size: u64, atom: u64) -> MappedRange {
    if atom <= 1 {
        return MappedRange {
            handle: memory,
            offset,
            size,
        };
    }
    let aligned_offset = offset - (offset % atom);
    let aligned_end = align_up_non_pot(offset + size, atom);
    MappedRange {
        handle: memory,
        offset: aligned_offset,
        size: aligned_end - aligned_offset,
    }
}
