//! Dedicated (whole-block) allocations, one registry per memory type (spec
//! §4.3, L5).

use {
    crate::{
        allocation::DedicatedAllocation,
        budget::BudgetTracker,
        create_info::UserData,
        device::{DedicatedResource, DeviceMemoryHandle, MemoryDevice, MemoryType},
        error::{DriverError, Error},
    },
    parking_lot::RwLock,
    std::{collections::BTreeMap, sync::Arc},
};

/// All dedicated allocations made against one memory type, ordered by the
/// driver handle's numeric identity so iteration (stats, leak checks at
/// teardown) is deterministic.
pub struct DedicatedSet {
    type_index: u32,
    heap_index: u32,
    entries: RwLock<BTreeMap<u64, Arc<DedicatedAllocation>>>,
}

impl DedicatedSet {
    pub fn new(memory_type: &MemoryType, type_index: u32) -> Self {
        DedicatedSet {
            type_index,
            heap_index: memory_type.heap_index,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.read().values().map(|a| a.size).sum()
    }

    /// Allocates a whole device memory object and registers it (spec §4.3
    /// steps 1-4).
    pub fn allocate(
        &self,
        device: &dyn MemoryDevice,
        budget: &BudgetTracker,
        size: u64,
        resource: Option<DedicatedResource>,
        device_address: bool,
        within_budget: bool,
        user_data: UserData,
    ) -> Result<Arc<DedicatedAllocation>, Error> {
        if within_budget && !budget.within_budget(self.heap_index as usize, size, device) {
            return Err(Error::from(DriverError::OutOfDeviceMemory));
        }
        if !budget.try_reserve_block(self.heap_index as usize, size) {
            return Err(Error::from(DriverError::OutOfDeviceMemory));
        }
        let memory = match unsafe {
            device.allocate_memory(self.type_index, size, resource, device_address)
        } {
            Ok(m) => m,
            Err(e) => {
                budget.release_block(self.heap_index as usize, size);
                return Err(Error::from(e));
            }
        };
        budget.add_allocation(self.heap_index as usize, size);
        budget.note_operation(device);

        let allocation = Arc::new(DedicatedAllocation::new(
            self.type_index,
            memory,
            size,
            user_data,
        ));
        self.entries
            .write()
            .insert(memory.0.get(), allocation.clone());
        Ok(allocation)
    }

    /// Frees and deregisters a dedicated allocation. A second free of the
    /// same handle (possible since `Arc<DedicatedAllocation>` is cloneable)
    /// is a no-op rather than a double free (spec §4.6 idempotent free).
    pub fn free(
        &self,
        device: &dyn MemoryDevice,
        budget: &BudgetTracker,
        allocation: &Arc<DedicatedAllocation>,
    ) {
        let key = allocation.memory.0.get();
        if self.entries.write().remove(&key).is_none() {
            return;
        }
        unsafe { device.free_memory(allocation.memory) };
        budget.remove_allocation(self.heap_index as usize, allocation.size);
        budget.release_block(self.heap_index as usize, allocation.size);
    }

    pub fn memory_handles(&self) -> Vec<DeviceMemoryHandle> {
        self.entries.read().values().map(|a| a.memory).collect()
    }
}
