//! Pool-of-blocks suballocation policy for one memory type (spec §4.2, L4).
//!
//! One exclusive `parking_lot::Mutex` covers block creation/destruction and
//! structural edits to every block's metadata in the list — the same
//! single-big-lock shape `tvma`'s chunk lists used, generalized to the
//! ordered first-scan / grow / losing-sweep policy spec §4.2 describes.

use {
    crate::{
        allocation::{BlockBackedAllocation, HandleState},
        block_metadata::{LostAllocationOracle, PlacementContext, Strategy},
        budget::BudgetTracker,
        create_info::{AllocationCreateFlags, UserData},
        device::MemoryDevice,
        device_block::DeviceBlock,
        error::{DriverError, Error},
        suballocation::{AllocationId, SuballocationType},
    },
    parking_lot::Mutex,
    slab::Slab,
    std::{ptr::NonNull, sync::Arc},
};

/// Free-standing oracle over one block's handle table, handed to
/// `BlockMetadata` so it never has to know handles exist (spec §9).
struct BlockOracle<'a>(&'a Slab<Arc<HandleState>>);

impl<'a> LostAllocationOracle for BlockOracle<'a> {
    fn last_use_frame(&self, owner: AllocationId) -> Option<u64> {
        self.0.get(owner.0)?.last_use_frame()
    }

    fn try_mark_lost(&self, owner: AllocationId, observed: u64) -> bool {
        match self.0.get(owner.0) {
            Some(state) => state.try_mark_lost(observed),
            None => false,
        }
    }
}

struct TrackedBlock {
    block: DeviceBlock,
    handles: Slab<Arc<HandleState>>,
}

impl TrackedBlock {
    fn oracle(&self) -> BlockOracle<'_> {
        BlockOracle(&self.handles)
    }
}

pub struct BlockListConfig {
    pub memory_type_index: u32,
    pub heap_index: u32,
    pub preferred_block_size: u64,
    pub fixed_block_size: Option<u64>,
    pub min_block_count: usize,
    pub max_block_count: usize,
    pub buffer_image_granularity: u64,
    pub frame_in_use_count: u64,
}

struct Inner {
    blocks: Slab<TrackedBlock>,
    /// Block keys ordered by descending `sum_free`, so the first scan tries
    /// the emptiest block first (spec §4.2).
    order: Vec<usize>,
}

pub struct BlockList {
    config: BlockListConfig,
    inner: Mutex<Inner>,
}

pub struct AllocateRequest<'a> {
    pub size: u64,
    pub alignment: u64,
    pub suballoc_type: SuballocationType,
    pub flags: AllocationCreateFlags,
    pub strategy: Strategy,
    pub current_frame: u64,
    pub pool: Option<u32>,
    pub user_data: UserData,
    pub device: &'a dyn MemoryDevice,
    pub budget: &'a BudgetTracker,
}

impl BlockList {
    pub fn new(config: BlockListConfig) -> Self {
        BlockList {
            config,
            inner: Mutex::new(Inner {
                blocks: Slab::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.config.memory_type_index
    }

    pub fn preferred_block_size(&self) -> u64 {
        self.config.fixed_block_size.unwrap_or(self.config.preferred_block_size)
    }

    /// Eagerly creates `min_block_count` blocks (spec §4.2 pool
    /// construction).
    pub fn ensure_min_blocks(
        &self,
        device: &dyn MemoryDevice,
        budget: &BudgetTracker,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        while inner.blocks.len() < self.config.min_block_count {
            let size = self
                .config
                .fixed_block_size
                .unwrap_or(self.config.preferred_block_size);
            let block = self.create_block(device, budget, size)?;
            Self::insert_block(&mut inner, block);
        }
        Ok(())
    }

    fn candidate_sizes(&self, alloc_size: u64) -> Vec<u64> {
        if let Some(fixed) = self.config.fixed_block_size {
            return vec![fixed];
        }
        let start = self.config.preferred_block_size.max(alloc_size);
        let min_size = (self.config.preferred_block_size / 8).max(alloc_size);
        let mut sizes = Vec::new();
        let mut cur = start;
        loop {
            sizes.push(cur);
            if cur <= min_size {
                break;
            }
            let next = (cur / 2).max(min_size);
            if next == cur {
                break;
            }
            cur = next;
        }
        sizes
    }

    fn create_block(
        &self,
        device: &dyn MemoryDevice,
        budget: &BudgetTracker,
        size: u64,
    ) -> Result<TrackedBlock, Error> {
        if !budget.try_reserve_block(self.config.heap_index as usize, size) {
            return Err(Error::from(DriverError::OutOfDeviceMemory));
        }
        let memory = match unsafe {
            device.allocate_memory(self.config.memory_type_index, size, None, false)
        } {
            Ok(m) => m,
            Err(e) => {
                budget.release_block(self.config.heap_index as usize, size);
                return Err(Error::from(e));
            }
        };
        budget.note_operation(device);
        Ok(TrackedBlock {
            block: DeviceBlock::new(memory, size),
            handles: Slab::new(),
        })
    }

    fn insert_block(inner: &mut Inner, block: TrackedBlock) -> usize {
        let sum_free = block.block.metadata.sum_free();
        let key = inner.blocks.insert(block);
        let pos = inner
            .order
            .partition_point(|&k| inner.blocks[k].block.metadata.sum_free() > sum_free);
        inner.order.insert(pos, key);
        key
    }

    fn reposition(inner: &mut Inner, key: usize) {
        let pos = inner.order.iter().position(|&k| k == key).expect("tracked");
        inner.order.remove(pos);
        let sum_free = inner.blocks[key].block.metadata.sum_free();
        let new_pos = inner
            .order
            .partition_point(|&k| inner.blocks[k].block.metadata.sum_free() > sum_free);
        inner.order.insert(new_pos, key);
    }

    fn ctx(&self, req: &AllocateRequest, can_make_other_lost: bool) -> PlacementContext {
        PlacementContext {
            size: req.size,
            alignment: req.alignment,
            granularity: self.config.buffer_image_granularity,
            suballoc_type: req.suballoc_type,
            strategy: req.strategy,
            current_frame: req.current_frame,
            frame_in_use_count: self.config.frame_in_use_count,
            can_make_other_lost,
        }
    }

    /// The full ordered allocation policy of spec §4.2: first scan, then
    /// (unless `NeverAllocate`) grow a new block, then (if
    /// `CanMakeOtherLost`) a losing sweep.
    pub fn allocate(&self, req: AllocateRequest<'_>) -> Result<BlockBackedAllocation, Error> {
        let never_allocate = req.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE);
        let can_make_other_lost = req.flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST)
            && !never_allocate;
        let can_become_lost = req.flags.contains(AllocationCreateFlags::CAN_BECOME_LOST);

        let mut inner = self.inner.lock();

        // First scan: every existing block, no eviction.
        let ctx = self.ctx(&req, false);
        let order = inner.order.clone();
        for key in order {
            if let Some(request) = inner.blocks[key].block.metadata.try_request(
                ctx,
                &inner.blocks[key].oracle(),
            ) {
                return Ok(self.commit(
                    &mut inner,
                    key,
                    request,
                    &req,
                    can_become_lost,
                ));
            }
        }

        if never_allocate {
            return Err(Error::from(DriverError::OutOfDeviceMemory));
        }

        // Grow: try a new block, halving size on OOM.
        if inner.blocks.len() < self.config.max_block_count {
            for size in self.candidate_sizes(req.size) {
                let tracked = match self.create_block(req.device, req.budget, size) {
                    Ok(tracked) => tracked,
                    Err(Error::OutOfDeviceMemory { .. }) => continue,
                    Err(e) => return Err(e),
                };
                let key = Self::insert_block(&mut inner, tracked);
                match inner.blocks[key]
                    .block
                    .metadata
                    .try_request(ctx, &inner.blocks[key].oracle())
                {
                    Some(request) => {
                        return Ok(self.commit(&mut inner, key, request, &req, can_become_lost));
                    }
                    None => {
                        // Alignment padding ate the slack this candidate
                        // size was supposed to leave; give the block back
                        // and try a smaller one.
                        let tracked = inner.blocks.remove(key);
                        let pos = inner
                            .order
                            .iter()
                            .position(|&k| k == key)
                            .expect("just inserted");
                        inner.order.remove(pos);
                        unsafe { req.device.free_memory(tracked.block.memory) };
                        req.budget
                            .release_block(self.config.heap_index as usize, tracked.block.size);
                    }
                }
            }
        }

        // Losing sweep: evict the cheapest-to-evict set across all blocks.
        if can_make_other_lost {
            let lose_ctx = self.ctx(&req, true);
            let mut best: Option<(usize, crate::block_metadata::AllocationRequest)> = None;
            for key in inner.order.clone() {
                if let Some(request) = inner.blocks[key]
                    .block
                    .metadata
                    .try_request(lose_ctx, &inner.blocks[key].oracle())
                {
                    let better = match &best {
                        Some((_, b)) => request.calc_cost() < b.calc_cost(),
                        None => true,
                    };
                    if better {
                        best = Some((key, request));
                    }
                }
            }
            if let Some((key, request)) = best {
                let lost = {
                    let tracked = &mut inner.blocks[key];
                    let oracle = BlockOracle(&tracked.handles);
                    tracked.block.metadata.make_requested_lost(
                        &request,
                        req.current_frame,
                        self.config.frame_in_use_count,
                        &oracle,
                    )
                };
                if lost {
                    // The evicted records' handle-table entries are now
                    // orphaned; the handles themselves detect their own
                    // loss via `HandleState::is_lost` and never touch the
                    // table again, so we leave cleanup to their eventual
                    // explicit `free`.
                    return Ok(self.commit(&mut inner, key, request, &req, can_become_lost));
                }
            }
        }

        Err(Error::from(DriverError::OutOfDeviceMemory))
    }

    fn commit(
        &self,
        inner: &mut Inner,
        key: usize,
        request: crate::block_metadata::AllocationRequest,
        req: &AllocateRequest<'_>,
        can_become_lost: bool,
    ) -> BlockBackedAllocation {
        let state = Arc::new(HandleState::new(can_become_lost, req.current_frame));
        let tracked = &mut inner.blocks[key];
        let id = AllocationId(tracked.handles.insert(state.clone()));
        tracked.block.metadata.commit(
            &request,
            req.size,
            req.suballoc_type,
            id,
        );
        let memory = tracked.block.memory;
        req.budget.add_allocation(self.config.heap_index as usize, req.size);
        Self::reposition(inner, key);

        BlockBackedAllocation {
            type_index: self.config.memory_type_index,
            pool: req.pool,
            block_key: key,
            memory,
            offset: request.offset(),
            size: req.size,
            alignment: req.alignment,
            suballoc_type: req.suballoc_type,
            user_data: req.user_data.clone(),
            state,
        }
    }

    /// Frees a block-backed allocation and, if its block is now empty and
    /// the list is above its minimum, destroys the block (spec §4.2 free
    /// path).
    pub fn free(
        &self,
        device: &dyn MemoryDevice,
        budget: &BudgetTracker,
        allocation: &BlockBackedAllocation,
    ) {
        let mut inner = self.inner.lock();
        let size = {
            let tracked = &mut inner.blocks[allocation.block_key];
            let (size, owner) = tracked.block.metadata.free_at_offset(allocation.offset);
            tracked.handles.remove(owner.0);
            size
        };
        budget.remove_allocation(self.config.heap_index as usize, size);

        let key = allocation.block_key;
        let is_empty = inner.blocks[key].block.metadata.is_empty();
        let above_min = inner.blocks.len() > self.config.min_block_count;
        if is_empty && above_min && self.config.fixed_block_size.is_none() {
            let tracked = inner.blocks.remove(key);
            let pos = inner.order.iter().position(|&k| k == key).expect("tracked");
            inner.order.remove(pos);
            unsafe { device.free_memory(tracked.block.memory) };
            budget.release_block(self.config.heap_index as usize, tracked.block.size);
        } else {
            Self::reposition(&mut inner, key);
        }
    }

    /// Forcibly evicts every lost-eligible allocation in the list,
    /// regardless of recency (spec §4.2 pool-wide reset).
    pub fn lose_all_allocations(&self) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<usize> = inner.order.clone();
        let mut total = 0;
        for key in keys {
            let tracked = &mut inner.blocks[key];
            let oracle = BlockOracle(&tracked.handles);
            total += tracked.block.metadata.lose_all(&oracle);
        }
        for key in inner.order.clone() {
            Self::reposition(&mut inner, key);
        }
        total
    }

    /// Maps the block backing `allocation`, returning a pointer to the
    /// allocation's own range within it (spec §4.7). Mapping is reference
    /// counted at the block level: concurrent mappings of sibling
    /// allocations in the same block share one driver mapping.
    pub fn map_allocation(
        &self,
        device: &dyn MemoryDevice,
        allocation: &BlockBackedAllocation,
    ) -> Result<NonNull<u8>, Error> {
        let mut inner = self.inner.lock();
        let base = inner.blocks[allocation.block_key].block.map(device)?;
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(allocation.offset as usize)) })
    }

    pub fn unmap_allocation(&self, device: &dyn MemoryDevice, allocation: &BlockBackedAllocation) {
        let mut inner = self.inner.lock();
        inner.blocks[allocation.block_key].block.unmap(device);
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(|(_, t)| t.block.metadata.live_count())
            .sum()
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(|(_, t)| t.block.metadata.block_size() - t.block.metadata.sum_free())
            .sum()
    }

    pub fn unused_bytes(&self) -> u64 {
        self.inner
            .lock()
            .blocks
            .iter()
            .map(|(_, t)| t.block.metadata.sum_free())
            .sum()
    }

    /// Tears down every block in the list. Callers must ensure nothing is
    /// still live (spec §4.6: disposing with live allocations is an error
    /// the facade rejects before ever reaching here).
    pub fn dispose(&self, device: &dyn MemoryDevice, budget: &BudgetTracker) {
        let mut inner = self.inner.lock();
        for tracked in inner.blocks.drain() {
            debug_assert!(tracked.block.is_empty(), "disposing a non-empty block");
            unsafe { device.free_memory(tracked.block.memory) };
            budget.release_block(self.config.heap_index as usize, tracked.block.size);
        }
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{mock::MockDevice, MemoryHeap, MemoryProperties, MemoryType, MemoryPropertyFlags};

    fn device() -> MockDevice {
        MockDevice::new(MemoryProperties {
            memory_types: vec![MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
            memory_heaps: vec![MemoryHeap {
                size: 1 << 30,
                device_local: true,
            }],
        })
    }

    fn config() -> BlockListConfig {
        BlockListConfig {
            memory_type_index: 0,
            heap_index: 0,
            preferred_block_size: 4096,
            fixed_block_size: None,
            min_block_count: 0,
            max_block_count: 4,
            buffer_image_granularity: 1,
            frame_in_use_count: 0,
        }
    }

    fn request<'a>(
        size: u64,
        flags: AllocationCreateFlags,
        device: &'a dyn MemoryDevice,
        budget: &'a BudgetTracker,
    ) -> AllocateRequest<'a> {
        AllocateRequest {
            size,
            alignment: 1,
            suballoc_type: SuballocationType::Buffer,
            flags,
            strategy: Strategy::BestFit,
            current_frame: 0,
            pool: None,
            user_data: UserData::None,
            device,
            budget,
        }
    }

    #[test]
    fn allocates_and_frees_reclaiming_the_block() {
        let list = BlockList::new(config());
        let dev = device();
        let budget = BudgetTracker::new(&[1 << 30], &[None], false);
        let a = list
            .allocate(request(1024, AllocationCreateFlags::empty(), &dev, &budget))
            .unwrap();
        assert_eq!(list.block_count(), 1);
        list.free(&dev, &budget, &a);
        assert_eq!(list.block_count(), 0);
        assert_eq!(budget.block_bytes(0), 0);
        assert_eq!(budget.allocation_bytes(0), 0);
    }

    #[test]
    fn never_allocate_fails_when_no_block_exists() {
        let list = BlockList::new(config());
        let dev = device();
        let budget = BudgetTracker::new(&[1 << 30], &[None], false);
        let err = list
            .allocate(request(
                1024,
                AllocationCreateFlags::NEVER_ALLOCATE,
                &dev,
                &budget,
            ))
            .unwrap_err();
        assert!(matches!(err, Error::OutOfDeviceMemory { .. }));
    }

    #[test]
    fn losing_sweep_evicts_to_make_room() {
        let mut cfg = config();
        cfg.preferred_block_size = 1024;
        cfg.max_block_count = 1;
        let list = BlockList::new(cfg);
        let dev = device();
        let budget = BudgetTracker::new(&[1 << 30], &[None], false);

        let victim = list
            .allocate(request(
                1024,
                AllocationCreateFlags::CAN_BECOME_LOST,
                &dev,
                &budget,
            ))
            .unwrap();

        let req = AllocateRequest {
            current_frame: 100,
            ..request(
                1024,
                AllocationCreateFlags::CAN_MAKE_OTHER_LOST,
                &dev,
                &budget,
            )
        };
        let _winner = list.allocate(req).unwrap();
        assert!(victim.state.is_lost());
    }
}
