//! Buffer/image create-and-bind glue (spec §9 supplement), grounded in
//! `illume::device::Device::create_buffer`'s create → get_requirements →
//! allocate → bind → rollback-on-failure sequence.

use crate::{
    allocation::AllocationHandle,
    create_info::AllocationCreateInfo,
    device::{DedicatedResource, MemoryDevice},
    error::Error,
    requirements::MemoryRequirements,
    Allocator,
};

/// The subset of buffer/image lifecycle operations the allocator needs to
/// drive the create → bind sequence, independent of which driver object
/// kind (`VkBuffer` or `VkImage`) is involved.
pub trait BindableResource {
    type Handle: Copy;

    fn requirements(&self, handle: Self::Handle) -> MemoryRequirements;

    /// `Some` when the driver reported a dedicated-allocation preference or
    /// requirement for this resource (spec §4.3 step 2). Most resources
    /// have none.
    fn dedicated_resource(&self, _handle: Self::Handle) -> Option<DedicatedResource> {
        None
    }

    fn bind(&self, handle: Self::Handle, allocation: &AllocationHandle) -> Result<(), Error>;
    /// # Safety
    /// `handle` must not be bound or otherwise in use.
    unsafe fn destroy(&self, handle: Self::Handle);
}

/// Creates a resource-backed allocation: queries requirements, allocates,
/// binds, and on bind failure destroys the resource and frees the
/// allocation so the caller never has to reconcile a half-bound resource
/// (spec §7 rollback policy).
pub fn create_and_bind<D: MemoryDevice, R: BindableResource>(
    allocator: &Allocator<D>,
    device: &R,
    handle: R::Handle,
    info: &AllocationCreateInfo,
) -> Result<AllocationHandle, Error> {
    let requirements = device.requirements(handle);
    let dedicated = device.dedicated_resource(handle);
    let allocation = allocator.allocate_memory(&requirements, dedicated, info)?;
    match device.bind(handle, &allocation) {
        Ok(()) => Ok(allocation),
        Err(e) => {
            // SAFETY: the resource was never successfully bound, so it's
            // safe to tear down without touching the memory it would have
            // referenced.
            unsafe { device.destroy(handle) };
            allocator.free_memory(allocation);
            Err(e)
        }
    }
}
