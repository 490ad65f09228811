//! `MemoryRequirements` (spec §3) — the part of
//! `get_buffer/image_memory_requirements2`'s result the allocator consumes.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
    /// Driver says this resource must use a dedicated allocation.
    pub requires_dedicated: bool,
    /// Driver says this resource performs better with a dedicated
    /// allocation, but doesn't require one.
    pub prefers_dedicated: bool,
}

impl MemoryRequirements {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.size == 0 {
            return Err("allocation size must be non-zero");
        }
        if !self.alignment.is_power_of_two() {
            return Err("alignment must be a power of two");
        }
        if self.memory_type_bits == 0 {
            return Err("memory_type_bits must name at least one type");
        }
        Ok(())
    }
}
