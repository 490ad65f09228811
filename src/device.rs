//! Driver collaborator contract (spec §6).
//!
//! The allocation engine never talks to `erupt` directly; it goes through
//! [`MemoryDevice`]. This keeps the block-metadata/block-list/budget/type
//! selection logic — the actual core — exercisable without a live GPU, and
//! is the seam an `EruptDevice` and, in tests, a `mock::MockDevice` both
//! implement.

use {
    crate::error::DriverError,
    std::{fmt::Debug, num::NonZeroU64, ptr::NonNull},
};

bitflags::bitflags! {
    /// Mirrors `VkMemoryPropertyFlagBits`, including the AMD extension bits,
    /// as our own type so the core does not have to track which `erupt`
    /// extension module a given bit lives in.
    #[derive(Default)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL     = 0x0000_0001;
        const HOST_VISIBLE     = 0x0000_0002;
        const HOST_COHERENT    = 0x0000_0004;
        const HOST_CACHED      = 0x0000_0008;
        const LAZILY_ALLOCATED = 0x0000_0010;
        const PROTECTED        = 0x0000_0020;
        const DEVICE_COHERENT_AMD = 0x0000_0040;
        const DEVICE_UNCACHED_AMD = 0x0000_0080;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

/// Per-heap driver-reported budget, as returned by the budget query
/// extension. `None` fields are sanitized by the budget tracker (spec §4.5).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapBudget {
    pub budget: u64,
    pub usage: u64,
}

/// Opaque driver memory object identity. Never interpreted by the core.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemoryHandle(pub NonZeroU64);

impl Debug for DeviceMemoryHandle {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "DeviceMemoryHandle({:#x})", self.0.get())
    }
}

/// A dedicated-allocation hint attached to the driver allocate call (spec
/// §4.3 step 2). The core only ever threads this value through; it never
/// inspects the wrapped handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedicatedResource {
    Buffer(NonZeroU64),
    Image(NonZeroU64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedRange {
    pub handle: DeviceMemoryHandle,
    pub offset: u64,
    pub size: u64,
}

/// Driver collaborator contract (spec §6). One implementation forwards to
/// `erupt::DeviceLoader`; tests use an in-process mock.
pub trait MemoryDevice: Debug {
    fn memory_properties(&self) -> MemoryProperties;

    /// `true` if the allocator was constructed with the budget-query
    /// capability (spec §4.5, §6).
    fn budget_extension_enabled(&self) -> bool;

    /// `true` if the allocator was constructed with the buffer-device-address
    /// capability (spec §4.3 step 2).
    fn device_address_enabled(&self) -> bool;

    /// Polls the driver budget extension. Only called when
    /// `budget_extension_enabled()` is true.
    fn query_budgets(&self, heap_count: usize) -> Vec<HeapBudget>;

    /// Non-coherent atom size used to align flush/invalidate ranges (spec
    /// §4.7).
    fn non_coherent_atom_size(&self) -> u64;

    /// Minimum alignment the driver enforces for the given memory type,
    /// beyond whatever the resource's own requirements ask for.
    fn type_min_alignment(&self, type_index: u32) -> u64;

    /// `VkPhysicalDeviceLimits::bufferImageGranularity` — the page size
    /// within which a buffer and an image must never share memory (spec
    /// §4.1 granularity conflicts).
    fn buffer_image_granularity(&self) -> u64;

    /// # Safety
    /// `type_index` must be a valid index into `memory_properties().memory_types`.
    unsafe fn allocate_memory(
        &self,
        type_index: u32,
        size: u64,
        dedicated: Option<DedicatedResource>,
        device_address: bool,
    ) -> Result<DeviceMemoryHandle, DriverError>;

    /// # Safety
    /// `handle` must have come from `allocate_memory` on `self` and must not
    /// be currently mapped.
    unsafe fn free_memory(&self, handle: DeviceMemoryHandle);

    /// # Safety
    /// `handle` must be live and `[offset, offset+size)` within its bounds.
    unsafe fn map_memory(
        &self,
        handle: DeviceMemoryHandle,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DriverError>;

    /// # Safety
    /// `handle` must currently be mapped.
    unsafe fn unmap_memory(&self, handle: DeviceMemoryHandle);

    /// # Safety
    /// Every range must reference a currently mapped, non-coherent
    /// allocation.
    unsafe fn flush_ranges(
        &self,
        ranges: &[MappedRange],
    ) -> Result<(), DriverError>;

    /// # Safety
    /// Every range must reference a currently mapped, non-coherent
    /// allocation.
    unsafe fn invalidate_ranges(
        &self,
        ranges: &[MappedRange],
    ) -> Result<(), DriverError>;
}

/// Forwards the [`MemoryDevice`] contract to a live `erupt::DeviceLoader`.
pub mod erupt_backend {
    use {
        super::*,
        erupt::{vk1_0, vk1_1, DeviceLoader, ExtendableFrom},
    };

    #[derive(Debug)]
    pub struct EruptDevice<'a> {
        logical: &'a DeviceLoader,
        properties: vk1_0::PhysicalDeviceMemoryProperties,
        non_coherent_atom_size: u64,
        buffer_image_granularity: u64,
        budget_extension: bool,
        device_address: bool,
    }

    impl<'a> EruptDevice<'a> {
        /// # Safety
        /// `logical` must outlive every block allocated through this device
        /// and every call below must be made with the same `logical`.
        pub unsafe fn new(
            logical: &'a DeviceLoader,
            properties: vk1_0::PhysicalDeviceMemoryProperties,
            non_coherent_atom_size: u64,
            buffer_image_granularity: u64,
            budget_extension: bool,
            device_address: bool,
        ) -> Self {
            EruptDevice {
                logical,
                properties,
                non_coherent_atom_size,
                buffer_image_granularity,
                budget_extension,
                device_address,
            }
        }

        fn flags_to_erupt(flags: MemoryPropertyFlags) -> vk1_0::MemoryPropertyFlags {
            vk1_0::MemoryPropertyFlags::from_bits_truncate(flags.bits())
        }
    }

    impl<'a> MemoryDevice for EruptDevice<'a> {
        fn memory_properties(&self) -> MemoryProperties {
            let types = &self.properties.memory_types
                [..self.properties.memory_type_count as usize];
            let heaps = &self.properties.memory_heaps
                [..self.properties.memory_heap_count as usize];

            MemoryProperties {
                memory_types: types
                    .iter()
                    .map(|t| MemoryType {
                        property_flags: MemoryPropertyFlags::from_bits_truncate(
                            t.property_flags.bits(),
                        ),
                        heap_index: t.heap_index,
                    })
                    .collect(),
                memory_heaps: heaps
                    .iter()
                    .map(|h| MemoryHeap {
                        size: h.size,
                        device_local: h.flags.contains(
                            vk1_0::MemoryHeapFlags::DEVICE_LOCAL,
                        ),
                    })
                    .collect(),
            }
        }

        fn budget_extension_enabled(&self) -> bool {
            self.budget_extension
        }

        fn device_address_enabled(&self) -> bool {
            self.device_address
        }

        fn query_budgets(&self, heap_count: usize) -> Vec<HeapBudget> {
            // The `VK_EXT_memory_budget` query chains a
            // `PhysicalDeviceMemoryBudgetPropertiesEXT` onto
            // `PhysicalDeviceMemoryProperties2`; wiring that chain requires
            // the physical device handle, which isn't in this contract's
            // scope. Budget tracker falls back to the heuristic sanitization
            // path (spec §4.5) whenever this returns an empty vector.
            let _ = heap_count;
            Vec::new()
        }

        fn non_coherent_atom_size(&self) -> u64 {
            self.non_coherent_atom_size
        }

        fn type_min_alignment(&self, _type_index: u32) -> u64 {
            1
        }

        fn buffer_image_granularity(&self) -> u64 {
            self.buffer_image_granularity
        }

        unsafe fn allocate_memory(
            &self,
            type_index: u32,
            size: u64,
            dedicated: Option<DedicatedResource>,
            device_address: bool,
        ) -> Result<DeviceMemoryHandle, DriverError> {
            let mut alloc_info = vk1_0::MemoryAllocateInfo::default()
                .into_builder()
                .allocation_size(size)
                .memory_type_index(type_index);

            let mut dedicated_info;
            if let Some(resource) = dedicated {
                dedicated_info = vk1_1::MemoryDedicatedAllocateInfo::default()
                    .into_builder();
                dedicated_info = match resource {
                    DedicatedResource::Buffer(handle) => dedicated_info
                        .buffer(vk1_0::Buffer(handle.get())),
                    DedicatedResource::Image(handle) => {
                        dedicated_info.image(vk1_0::Image(handle.get()))
                    }
                };
                alloc_info = alloc_info.extend_from(&mut dedicated_info);
            }

            let mut flags_info;
            if device_address && self.device_address {
                flags_info = vk1_1::MemoryAllocateFlagsInfo::default()
                    .into_builder()
                    .flags(vk1_1::MemoryAllocateFlags::DEVICE_ADDRESS);
                alloc_info = alloc_info.extend_from(&mut flags_info);
            }

            match self
                .logical
                .allocate_memory(&alloc_info, None, None)
                .result()
            {
                Ok(memory) => Ok(DeviceMemoryHandle(
                    NonZeroU64::new(memory.0)
                        .expect("successful allocation returns non-null handle"),
                )),
                Err(vk1_0::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                    Err(DriverError::OutOfHostMemory)
                }
                Err(vk1_0::Result::ERROR_OUT_OF_DEVICE_MEMORY) => {
                    Err(DriverError::OutOfDeviceMemory)
                }
                Err(vk1_0::Result::ERROR_TOO_MANY_OBJECTS) => {
                    Err(DriverError::TooManyObjects)
                }
                Err(other) => Err(DriverError::Other(other.0)),
            }
        }

        unsafe fn free_memory(&self, handle: DeviceMemoryHandle) {
            self.logical
                .free_memory(Some(vk1_0::DeviceMemory(handle.0.get())), None);
        }

        unsafe fn map_memory(
            &self,
            handle: DeviceMemoryHandle,
            offset: u64,
            size: u64,
        ) -> Result<NonNull<u8>, DriverError> {
            let mut ptr = std::ptr::null_mut();
            match self
                .logical
                .map_memory(
                    vk1_0::DeviceMemory(handle.0.get()),
                    offset,
                    size,
                    Some(vk1_0::MemoryMapFlags::empty()),
                    &mut ptr,
                )
                .result()
            {
                Ok(()) => Ok(NonNull::new(ptr as *mut u8)
                    .expect("successful mapping returns non-null pointer")),
                Err(vk1_0::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                    Err(DriverError::OutOfHostMemory)
                }
                Err(vk1_0::Result::ERROR_MEMORY_MAP_FAILED) => {
                    Err(DriverError::Other(
                        vk1_0::Result::ERROR_MEMORY_MAP_FAILED.0,
                    ))
                }
                Err(other) => Err(DriverError::Other(other.0)),
            }
        }

        unsafe fn unmap_memory(&self, handle: DeviceMemoryHandle) {
            self.logical
                .unmap_memory(vk1_0::DeviceMemory(handle.0.get()));
        }

        unsafe fn flush_ranges(
            &self,
            ranges: &[MappedRange],
        ) -> Result<(), DriverError> {
            let ranges: Vec<_> = ranges
                .iter()
                .map(|r| {
                    vk1_0::MappedMemoryRange::default()
                        .into_builder()
                        .memory(vk1_0::DeviceMemory(r.handle.0.get()))
                        .offset(r.offset)
                        .size(r.size)
                })
                .collect();
            self.logical
                .flush_mapped_memory_ranges(&ranges)
                .result()
                .map_err(|err| DriverError::Other(err.0))
        }

        unsafe fn invalidate_ranges(
            &self,
            ranges: &[MappedRange],
        ) -> Result<(), DriverError> {
            let ranges: Vec<_> = ranges
                .iter()
                .map(|r| {
                    vk1_0::MappedMemoryRange::default()
                        .into_builder()
                        .memory(vk1_0::DeviceMemory(r.handle.0.get()))
                        .offset(r.offset)
                        .size(r.size)
                })
                .collect();
            self.logical
                .invalidate_mapped_memory_ranges(&ranges)
                .result()
                .map_err(|err| DriverError::Other(err.0))
        }
    }
}

#[cfg(test)]
pub mod mock {
    //! In-process stand-in for the driver, used only by unit tests so the
    //! block-metadata/block-list/budget/type-selector logic can be exercised
    //! without a GPU.

    use {
        super::*,
        parking_lot::Mutex,
        std::{
            collections::HashMap,
            sync::atomic::{AtomicU64, Ordering},
        },
    };

    #[derive(Debug)]
    pub struct MockDevice {
        pub properties: MemoryProperties,
        next_handle: AtomicU64,
        arenas: Mutex<HashMap<u64, Vec<u8>>>,
        budget_extension: bool,
        device_address: bool,
        pub non_coherent_atom_size: u64,
        pub buffer_image_granularity: u64,
        /// When `Some`, `allocate_memory` fails with this error instead of
        /// succeeding — lets tests exercise rollback paths deterministically.
        pub fail_next_allocate: Mutex<Option<DriverError>>,
        pub budgets: Mutex<Vec<HeapBudget>>,
    }

    impl MockDevice {
        pub fn new(properties: MemoryProperties) -> Self {
            MockDevice {
                properties,
                next_handle: AtomicU64::new(1),
                arenas: Mutex::new(HashMap::new()),
                budget_extension: false,
                device_address: false,
                non_coherent_atom_size: 256,
                buffer_image_granularity: 1,
                fail_next_allocate: Mutex::new(None),
                budgets: Mutex::new(Vec::new()),
            }
        }

        pub fn with_granularity(mut self, granularity: u64) -> Self {
            self.buffer_image_granularity = granularity;
            self
        }

        pub fn with_budget_extension(mut self) -> Self {
            self.budget_extension = true;
            self
        }
    }

    impl MemoryDevice for MockDevice {
        fn memory_properties(&self) -> MemoryProperties {
            self.properties.clone()
        }

        fn budget_extension_enabled(&self) -> bool {
            self.budget_extension
        }

        fn device_address_enabled(&self) -> bool {
            self.device_address
        }

        fn query_budgets(&self, heap_count: usize) -> Vec<HeapBudget> {
            let budgets = self.budgets.lock();
            if budgets.is_empty() {
                vec![HeapBudget::default(); heap_count]
            } else {
                budgets.clone()
            }
        }

        fn non_coherent_atom_size(&self) -> u64 {
            self.non_coherent_atom_size
        }

        fn type_min_alignment(&self, _type_index: u32) -> u64 {
            1
        }

        fn buffer_image_granularity(&self) -> u64 {
            self.buffer_image_granularity
        }

        unsafe fn allocate_memory(
            &self,
            _type_index: u32,
            size: u64,
            _dedicated: Option<DedicatedResource>,
            _device_address: bool,
        ) -> Result<DeviceMemoryHandle, DriverError> {
            if let Some(err) = self.fail_next_allocate.lock().take() {
                return Err(err);
            }
            let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
            self.arenas.lock().insert(raw, vec![0u8; size as usize]);
            Ok(DeviceMemoryHandle(NonZeroU64::new(raw).unwrap()))
        }

        unsafe fn free_memory(&self, handle: DeviceMemoryHandle) {
            self.arenas.lock().remove(&handle.0.get());
        }

        unsafe fn map_memory(
            &self,
            handle: DeviceMemoryHandle,
            offset: u64,
            _size: u64,
        ) -> Result<NonNull<u8>, DriverError> {
            let mut arenas = self.arenas.lock();
            let arena = arenas.get_mut(&handle.0.get()).expect("live handle");
            let ptr = unsafe { arena.as_mut_ptr().add(offset as usize) };
            Ok(NonNull::new(ptr).unwrap())
        }

        unsafe fn unmap_memory(&self, _handle: DeviceMemoryHandle) {}

        unsafe fn flush_ranges(
            &self,
            _ranges: &[MappedRange],
        ) -> Result<(), DriverError> {
            Ok(())
        }

        unsafe fn invalidate_ranges(
            &self,
            _ranges: &[MappedRange],
        ) -> Result<(), DriverError> {
            Ok(())
        }
    }
}
