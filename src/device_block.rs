//! One device memory object and the suballocations carved out of it (spec
//! §3, L3).

use {
    crate::{
        block_metadata::BlockMetadata,
        device::{DeviceMemoryHandle, MemoryDevice},
        error::Error,
    },
    std::ptr::NonNull,
};

#[derive(Debug)]
pub struct DeviceBlock {
    pub memory: DeviceMemoryHandle,
    pub size: u64,
    pub metadata: BlockMetadata,
    map_count: u32,
    mapped_ptr: Option<NonNull<u8>>,
}

// SAFETY: `mapped_ptr` always points at device-mapped memory the driver
// guarantees is valid while `map_count > 0`; all access is synchronized by
// the block list's mutex, which guards every `DeviceBlock`.
unsafe impl Send for DeviceBlock {}

impl DeviceBlock {
    pub fn new(memory: DeviceMemoryHandle, size: u64) -> Self {
        DeviceBlock {
            memory,
            size,
            metadata: BlockMetadata::new(size),
            map_count: 0,
            mapped_ptr: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// First map calls the driver; nested maps just bump the count (spec
    /// §4.7).
    pub fn map(&mut self, device: &dyn MemoryDevice) -> Result<NonNull<u8>, Error> {
        if self.map_count == 0 {
            let ptr = unsafe { device.map_memory(self.memory, 0, self.size)? };
            self.mapped_ptr = Some(ptr);
        }
        self.map_count += 1;
        Ok(self.mapped_ptr.expect("just set above"))
    }

    /// Last unmap releases the driver mapping.
    pub fn unmap(&mut self, device: &dyn MemoryDevice) {
        debug_assert!(self.map_count > 0, "unbalanced block unmap");
        self.map_count -= 1;
        if self.map_count == 0 {
            unsafe { device.unmap_memory(self.memory) };
            self.mapped_ptr = None;
        }
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }
}
