//! Device memory suballocator for Vulkan-family APIs.
//!
//! The allocation engine never talks to a driver directly; every driver
//! call goes through [`MemoryDevice`], which [`Allocator`] is generic over.
//! This is what lets the placement, block-list, budget, and type-selection
//! logic be exercised in tests without a live GPU (a `mock::MockDevice`
//! backs them there), while a real program instantiates
//! `Allocator<device::erupt_backend::EruptDevice>`.

mod allocation;
mod block_list;
mod block_metadata;
mod budget;
mod create_info;
mod dedicated;
pub mod device;
mod device_block;
mod error;
mod pool;
mod requirements;
pub mod resource;
mod stats;
mod suballocation;
mod type_selector;
mod util;

pub use crate::{
    allocation::AllocationHandle,
    block_metadata::Strategy,
    budget::HeapReport,
    create_info::{
        AllocationCreateFlags, AllocationCreateInfo, AllocatorCreateInfo, HeapSizeLimit,
        PoolCreateFlags, PoolCreateInfo, PoolId, UserData,
    },
    device::{
        DedicatedResource, DeviceMemoryHandle, MemoryDevice, MemoryHeap, MemoryProperties,
        MemoryPropertyFlags, MemoryType,
    },
    error::{DriverError, Error},
    requirements::MemoryRequirements,
    stats::{StatTotal, Stats},
    suballocation::SuballocationType,
    type_selector::MemoryUsage,
};

use {
    crate::{
        block_list::{AllocateRequest, BlockList, BlockListConfig},
        budget::BudgetTracker,
        dedicated::DedicatedSet,
        pool::Pool,
        type_selector::TypeSelector,
        util::align_up_non_pot,
    },
    parking_lot::RwLock,
    slab::Slab,
    std::{
        ptr::NonNull,
        sync::atomic::{AtomicU64, Ordering},
    },
};

/// Default `preferred_large_heap_block_size` (spec §6).
const DEFAULT_PREFERRED_BLOCK_SIZE: u64 = 256 * 1024 * 1024;
/// Heaps at or below this size use `heap_size/8` instead of the configured
/// preferred block size (spec §6).
const SMALL_HEAP_MAX: u64 = 1024 * 1024 * 1024;
/// Rounding applied to every computed preferred block size (spec §6).
const PREFERRED_BLOCK_SIZE_ALIGNMENT: u64 = 32;

fn preferred_block_size_for_heap(heap_size: u64, preferred_large: u64) -> u64 {
    if heap_size <= SMALL_HEAP_MAX {
        align_up_non_pot(heap_size / 8, PREFERRED_BLOCK_SIZE_ALIGNMENT)
    } else {
        preferred_large
    }
}

/// Entry point: routes allocation requests to the block-list or dedicated
/// path and owns every default pool, user pool, and the per-heap budget
/// (spec §2 L8).
pub struct Allocator<D: MemoryDevice> {
    device: D,
    properties: MemoryProperties,
    /// One default block list per memory type, indexed by type index.
    block_lists: Vec<BlockList>,
    /// One dedicated-allocation registry per memory type, indexed the same
    /// way.
    dedicated_sets: Vec<DedicatedSet>,
    budget: BudgetTracker,
    /// User pools. Slab key `k` is exposed as `PoolId(k + 1)`; id 0 is
    /// reserved and never assigned (spec §4.6).
    pools: RwLock<Slab<Pool>>,
    current_frame: AtomicU64,
    config: AllocatorCreateInfo,
}

impl<D: MemoryDevice> Allocator<D> {
    /// Builds the default pools and budget tracker from the device's
    /// reported memory properties (spec §6 construction options).
    #[tracing::instrument(skip(device))]
    pub fn new(device: D, config: AllocatorCreateInfo) -> Result<Self, Error> {
        let properties = device.memory_properties();
        if properties.memory_types.is_empty() || properties.memory_heaps.is_empty() {
            return Err(Error::invalid_argument(
                "device reports no memory types or heaps",
            ));
        }

        let preferred_large = if config.preferred_large_heap_block_size == 0 {
            DEFAULT_PREFERRED_BLOCK_SIZE
        } else {
            align_up_non_pot(
                config.preferred_large_heap_block_size,
                PREFERRED_BLOCK_SIZE_ALIGNMENT,
            )
        };

        let mut heap_limits = vec![None; properties.memory_heaps.len()];
        for limit in &config.heap_size_limits {
            if let Some(slot) = heap_limits.get_mut(limit.heap_index as usize) {
                *slot = Some(limit.limit);
            }
        }
        let heap_sizes: Vec<u64> = properties.memory_heaps.iter().map(|h| h.size).collect();
        let budget = BudgetTracker::new(&heap_sizes, &heap_limits, device.budget_extension_enabled());

        let granularity = device.buffer_image_granularity();
        let block_lists = properties
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                let heap_size = properties.memory_heaps[ty.heap_index as usize].size;
                BlockList::new(BlockListConfig {
                    memory_type_index: index as u32,
                    heap_index: ty.heap_index,
                    preferred_block_size: preferred_block_size_for_heap(heap_size, preferred_large),
                    fixed_block_size: None,
                    min_block_count: 0,
                    max_block_count: usize::MAX,
                    buffer_image_granularity: granularity,
                    frame_in_use_count: config.frame_in_use_count,
                })
            })
            .collect();

        let dedicated_sets = properties
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, ty)| DedicatedSet::new(ty, index as u32))
            .collect();

        Ok(Allocator {
            device,
            properties,
            block_lists,
            dedicated_sets,
            budget,
            pools: RwLock::new(Slab::new()),
            current_frame: AtomicU64::new(0),
            config,
        })
    }

    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    /// Validates flags, selects a memory type (or honors a user pool),
    /// routes to block-list placement, and escalates to the dedicated path
    /// when required, preferred, or the request is large (spec §4.6).
    #[tracing::instrument(skip(self, requirements, dedicated_resource, info))]
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        dedicated_resource: Option<DedicatedResource>,
        info: &AllocationCreateInfo,
    ) -> Result<AllocationHandle, Error> {
        requirements.validate().map_err(Error::invalid_argument)?;
        info.flags.validate().map_err(Error::invalid_argument)?;
        if info.pool.is_some() {
            if info.flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
                return Err(Error::invalid_argument(
                    "Pool is incompatible with DedicatedMemory",
                ));
            }
            if requirements.requires_dedicated {
                return Err(Error::invalid_argument(
                    "Pool cannot host a driver-required dedicated allocation",
                ));
            }
        }

        let current_frame = self.current_frame.load(Ordering::Acquire);

        if let Some(pool_id) = info.pool {
            return self.allocate_from_pool(pool_id, requirements, info, current_frame);
        }

        let selector = TypeSelector::new(
            &self.properties.memory_types,
            self.config.allow_amd_device_coherent_memory,
            self.config.integrated_gpu,
        );
        let type_index = selector
            .select(
                requirements.memory_type_bits,
                info.memory_type_bits,
                info.required_flags,
                info.preferred_flags,
                info.usage,
            )
            .ok_or(Error::FeatureNotPresent)?;

        let preferred_block_size = self.block_lists[type_index as usize].preferred_block_size();
        let want_dedicated = requirements.requires_dedicated
            || info.flags.contains(AllocationCreateFlags::DEDICATED_MEMORY)
            || info.usage == MemoryUsage::GpuLazilyAllocated
            || requirements.size > preferred_block_size / 2;

        let handle = if want_dedicated {
            self.allocate_dedicated(type_index, requirements, dedicated_resource, info)?
        } else {
            let alignment = requirements
                .alignment
                .max(self.device.type_min_alignment(type_index));
            match self.block_lists[type_index as usize].allocate(AllocateRequest {
                size: requirements.size,
                alignment,
                suballoc_type: info.suballoc_type,
                flags: info.flags,
                strategy: info.strategy,
                current_frame,
                pool: None,
                user_data: info.user_data.clone(),
                device: &self.device,
                budget: &self.budget,
            }) {
                Ok(a) => AllocationHandle::BlockBacked(a),
                Err(Error::OutOfDeviceMemory { .. }) if requirements.prefers_dedicated => {
                    self.allocate_dedicated(type_index, requirements, dedicated_resource, info)?
                }
                Err(e) => return Err(e),
            }
        };

        if info.flags.contains(AllocationCreateFlags::MAPPED) {
            self.map(&handle)?;
        }
        Ok(handle)
    }

    fn allocate_from_pool(
        &self,
        pool_id: PoolId,
        requirements: &MemoryRequirements,
        info: &AllocationCreateInfo,
        current_frame: u64,
    ) -> Result<AllocationHandle, Error> {
        let pools = self.pools.read();
        let pool = self.lookup_pool(&pools, pool_id)?;
        let type_index = pool.block_list().memory_type_index();
        if requirements.memory_type_bits & (1 << type_index) == 0 {
            return Err(Error::FeatureNotPresent);
        }
        let alignment = requirements
            .alignment
            .max(self.device.type_min_alignment(type_index));
        let allocation = pool.block_list().allocate(AllocateRequest {
            size: requirements.size,
            alignment,
            suballoc_type: info.suballoc_type,
            flags: info.flags,
            strategy: info.strategy,
            current_frame,
            pool: Some(pool_id.0),
            user_data: info.user_data.clone(),
            device: &self.device,
            budget: &self.budget,
        })?;
        drop(pools);

        let handle = AllocationHandle::BlockBacked(allocation);
        if info.flags.contains(AllocationCreateFlags::MAPPED) {
            self.map(&handle)?;
        }
        Ok(handle)
    }

    fn allocate_dedicated(
        &self,
        type_index: u32,
        requirements: &MemoryRequirements,
        dedicated_resource: Option<DedicatedResource>,
        info: &AllocationCreateInfo,
    ) -> Result<AllocationHandle, Error> {
        if info.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
            return Err(Error::from(DriverError::OutOfDeviceMemory));
        }
        let within_budget = info.flags.contains(AllocationCreateFlags::WITHIN_BUDGET);
        let allocation = self.dedicated_sets[type_index as usize].allocate(
            &self.device,
            &self.budget,
            requirements.size,
            dedicated_resource,
            self.device.device_address_enabled(),
            within_budget,
            info.user_data.clone(),
        )?;
        Ok(AllocationHandle::Dedicated(allocation))
    }

    /// Idempotent with respect to a handle already freed through another
    /// clone of the same `Arc` (dedicated handles only — block-backed
    /// handles are consumed by value, so Rust ownership already rules out a
    /// double free there) (spec §4.6).
    #[tracing::instrument(skip(self, allocation))]
    pub fn free_memory(&self, allocation: AllocationHandle) {
        match allocation {
            AllocationHandle::BlockBacked(a) => match a.pool {
                Some(pool_id) => {
                    let pools = self.pools.read();
                    if let Some(pool) = pools.get((pool_id - 1) as usize) {
                        pool.block_list().free(&self.device, &self.budget, &a);
                    }
                }
                None => {
                    self.block_lists[a.type_index as usize].free(&self.device, &self.budget, &a);
                }
            },
            AllocationHandle::Dedicated(a) => {
                self.dedicated_sets[a.type_index as usize].free(&self.device, &self.budget, &a);
            }
        }
    }

    /// Maps a handle, going through the owning block's reference-counted
    /// mapping for block-backed allocations or the dedicated memory object
    /// directly otherwise (spec §4.7).
    pub fn map(&self, allocation: &AllocationHandle) -> Result<NonNull<u8>, Error> {
        match allocation {
            AllocationHandle::Dedicated(_) => allocation.map_dedicated(&self.device),
            AllocationHandle::BlockBacked(a) => match a.pool {
                Some(pool_id) => {
                    let pools = self.pools.read();
                    let pool = self.lookup_pool(&pools, PoolId(pool_id))?;
                    pool.block_list().map_allocation(&self.device, a)
                }
                None => self.block_lists[a.type_index as usize].map_allocation(&self.device, a),
            },
        }
    }

    pub fn unmap(&self, allocation: &AllocationHandle) {
        match allocation {
            AllocationHandle::Dedicated(_) => allocation.unmap_dedicated(&self.device),
            AllocationHandle::BlockBacked(a) => match a.pool {
                Some(pool_id) => {
                    let pools = self.pools.read();
                    if let Some(pool) = pools.get((pool_id - 1) as usize) {
                        pool.block_list().unmap_allocation(&self.device, a);
                    }
                }
                None => self.block_lists[a.type_index as usize].unmap_allocation(&self.device, a),
            },
        }
    }

    pub fn flush(&self, allocation: &AllocationHandle, offset: u64, size: u64) -> Result<(), Error> {
        allocation.flush(&self.device, offset, size)
    }

    pub fn invalidate(
        &self,
        allocation: &AllocationHandle,
        offset: u64,
        size: u64,
    ) -> Result<(), Error> {
        allocation.invalidate(&self.device, offset, size)
    }

    /// Creates a user pool, eagerly materializing its `min_block_count`
    /// blocks (spec §4.2/§4.6).
    pub fn create_pool(&self, info: PoolCreateInfo) -> Result<PoolId, Error> {
        let ty = self
            .properties
            .memory_types
            .get(info.memory_type_index as usize)
            .ok_or_else(|| Error::invalid_argument("pool memory_type_index out of range"))?;
        let preferred_block_size = self.block_lists[info.memory_type_index as usize].preferred_block_size();
        let granularity = self.device.buffer_image_granularity();

        let mut pools = self.pools.write();
        let key = pools.insert(Pool::new(
            PoolId(0),
            &info,
            ty,
            preferred_block_size,
            granularity,
        ));
        let id = PoolId(key as u32 + 1);
        pools[key].id = id;

        if let Err(e) = pools[key].block_list().ensure_min_blocks(&self.device, &self.budget) {
            pools.remove(key);
            return Err(e);
        }
        Ok(id)
    }

    /// Destroys an empty pool (spec §4.6: "destruction requires the pool to
    /// be empty").
    pub fn destroy_pool(&self, id: PoolId) -> Result<(), Error> {
        let mut pools = self.pools.write();
        self.lookup_pool(&pools, id)?;
        let key = (id.0 - 1) as usize;
        if !pools[key].is_empty() {
            return Err(Error::invalid_state(
                "cannot destroy a pool with live allocations",
            ));
        }
        let pool = pools.remove(key);
        pool.block_list().dispose(&self.device, &self.budget);
        Ok(())
    }

    /// Forcibly evicts every lost-eligible allocation in a pool, regardless
    /// of recency (spec §4.2 `make_pool_allocations_lost`).
    pub fn make_pool_allocations_lost(&self, id: PoolId) -> Result<usize, Error> {
        let pools = self.pools.read();
        let pool = self.lookup_pool(&pools, id)?;
        Ok(pool.block_list().lose_all_allocations())
    }

    pub fn pool_stats(&self, id: PoolId) -> Result<StatTotal, Error> {
        let pools = self.pools.read();
        let pool = self.lookup_pool(&pools, id)?;
        let bl = pool.block_list();
        Ok(StatTotal {
            block_count: bl.block_count(),
            allocation_count: bl.allocation_count(),
            used_bytes: bl.used_bytes(),
            unused_bytes: bl.unused_bytes(),
        })
    }

    /// Rolls up block count, allocation count, and used/unused bytes across
    /// every default pool, user pool, and dedicated allocation, grouped by
    /// memory type and by heap (spec §4.2/§4.6 `calculate_stats`).
    pub fn calculate_stats(&self) -> Stats {
        let mut per_memory_type = vec![StatTotal::default(); self.block_lists.len()];

        for (index, bl) in self.block_lists.iter().enumerate() {
            per_memory_type[index] += block_list_totals(bl);
        }
        for (_, pool) in self.pools.read().iter() {
            let bl = pool.block_list();
            per_memory_type[bl.memory_type_index() as usize] += block_list_totals(bl);
        }
        for (index, set) in self.dedicated_sets.iter().enumerate() {
            per_memory_type[index].allocation_count += set.len();
            per_memory_type[index].used_bytes += set.total_bytes();
        }

        let mut per_heap = vec![StatTotal::default(); self.properties.memory_heaps.len()];
        for (index, ty) in self.properties.memory_types.iter().enumerate() {
            per_heap[ty.heap_index as usize] += per_memory_type[index];
        }

        let mut total = StatTotal::default();
        for stat in &per_memory_type {
            total += *stat;
        }

        Stats {
            per_memory_type,
            per_heap,
            total,
        }
    }

    pub fn heap_report(&self, heap_index: u32) -> HeapReport {
        self.budget.report(heap_index as usize)
    }

    pub fn current_frame_index(&self) -> u64 {
        self.current_frame.load(Ordering::Acquire)
    }

    /// The only input to the lost-allocation machinery; advanced by the
    /// host once per frame (spec §4.6). Must never move backward.
    pub fn set_current_frame_index(&self, frame: u64) {
        self.current_frame.fetch_max(frame, Ordering::AcqRel);
    }

    /// Tears down every default pool. Fails, returning ownership of `self`,
    /// if any user pool or dedicated allocation is still live (spec §7
    /// `InvalidState`).
    pub fn try_dispose(self) -> Result<(), (Self, Error)> {
        if !self.pools.read().is_empty() {
            return Err((
                self,
                Error::invalid_state("cannot dispose an allocator with live pools"),
            ));
        }
        if self.dedicated_sets.iter().any(|set| !set.is_empty()) {
            return Err((
                self,
                Error::invalid_state("cannot dispose an allocator with live dedicated allocations"),
            ));
        }
        for block_list in &self.block_lists {
            block_list.dispose(&self.device, &self.budget);
        }
        Ok(())
    }

    fn lookup_pool<'a>(
        &self,
        pools: &'a Slab<Pool>,
        id: PoolId,
    ) -> Result<&'a Pool, Error> {
        if id.0 == 0 {
            return Err(Error::invalid_argument("pool id 0 is reserved"));
        }
        pools
            .get((id.0 - 1) as usize)
            .ok_or_else(|| Error::invalid_argument("unknown pool id"))
    }

    /// Not yet implemented (spec §9 "Stubbed defragmentation").
    pub fn defragmentation_begin(&self) -> Result<(), Error> {
        Err(Error::Unsupported("defragmentation_begin"))
    }

    pub fn defragmentation_end(&self) -> Result<(), Error> {
        Err(Error::Unsupported("defragmentation_end"))
    }

    pub fn defragment_pass_begin(&self) -> Result<(), Error> {
        Err(Error::Unsupported("defragment_pass_begin"))
    }

    pub fn defragment_pass_end(&self) -> Result<(), Error> {
        Err(Error::Unsupported("defragment_pass_end"))
    }

    /// Not yet implemented; re-implementers should keep declaring this
    /// surface rather than inventing corruption-detection behavior (spec §9
    /// "Unresolved in source").
    pub fn check_corruption(&self) -> Result<(), Error> {
        Err(Error::Unsupported("check_corruption"))
    }
}

fn block_list_totals(bl: &BlockList) -> StatTotal {
    StatTotal {
        block_count: bl.block_count(),
        allocation_count: bl.allocation_count(),
        used_bytes: bl.used_bytes(),
        unused_bytes: bl.unused_bytes(),
    }
}
