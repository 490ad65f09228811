//! Memory-type selection (spec §4.4, L7): turns a usage hint plus explicit
//! flag constraints into the cheapest matching memory type index.

use crate::device::{MemoryPropertyFlags, MemoryType};

/// Coarse usage hint the caller picks instead of naming raw property flags
/// directly (spec §4.4 table).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    #[default]
    Unknown,
    GpuOnly,
    CpuOnly,
    CpuToGpu,
    GpuToCpu,
    CpuCopy,
    GpuLazilyAllocated,
}

pub struct TypeSelector<'a> {
    memory_types: &'a [MemoryType],
    global_mask: u32,
    integrated_gpu: bool,
}

impl<'a> TypeSelector<'a> {
    /// `amd_coherent_opt_in` excludes `VK_AMD_device_coherent_memory` types
    /// from the candidate set entirely unless the caller opted in (spec
    /// §4.4); `integrated_gpu` tunes the `DeviceLocal` preference since UMA
    /// heaps don't benefit from it the way discrete VRAM does.
    pub fn new(
        memory_types: &'a [MemoryType],
        amd_coherent_opt_in: bool,
        integrated_gpu: bool,
    ) -> Self {
        let amd_bits =
            MemoryPropertyFlags::DEVICE_COHERENT_AMD | MemoryPropertyFlags::DEVICE_UNCACHED_AMD;
        let mut global_mask = 0u32;
        for (index, ty) in memory_types.iter().enumerate() {
            if amd_coherent_opt_in || !ty.property_flags.intersects(amd_bits) {
                global_mask |= 1 << index;
            }
        }
        TypeSelector {
            memory_types,
            global_mask,
            integrated_gpu,
        }
    }

    /// `requirements_mask` is the driver's `memoryTypeBits` for this
    /// resource; `type_bits` is an additional caller-supplied restriction
    /// (0 = unrestricted). Returns the winning type index, or `None` if no
    /// type satisfies the required flags.
    pub fn select(
        &self,
        requirements_mask: u32,
        type_bits: u32,
        required_flags: MemoryPropertyFlags,
        preferred_flags: MemoryPropertyFlags,
        usage: MemoryUsage,
    ) -> Option<u32> {
        let mut mask = self.global_mask & requirements_mask;
        if type_bits != 0 {
            mask &= type_bits;
        }

        let mut required = required_flags;
        let mut preferred = preferred_flags;
        let mut not_preferred = MemoryPropertyFlags::empty();
        let wants_host_visible = required.contains(MemoryPropertyFlags::HOST_VISIBLE);

        match usage {
            MemoryUsage::Unknown => {}
            MemoryUsage::GpuOnly => {
                if !(self.integrated_gpu && wants_host_visible) {
                    preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::CpuOnly => {
                required |= MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
            }
            MemoryUsage::CpuToGpu => {
                required |= MemoryPropertyFlags::HOST_VISIBLE;
                if !self.integrated_gpu {
                    preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::GpuToCpu => {
                required |= MemoryPropertyFlags::HOST_VISIBLE;
                preferred |= MemoryPropertyFlags::HOST_CACHED;
            }
            MemoryUsage::CpuCopy => {
                not_preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
            }
            MemoryUsage::GpuLazilyAllocated => {
                required |= MemoryPropertyFlags::LAZILY_ALLOCATED;
            }
        }

        let amd_bits =
            MemoryPropertyFlags::DEVICE_COHERENT_AMD | MemoryPropertyFlags::DEVICE_UNCACHED_AMD;
        if !required.intersects(amd_bits) && !preferred.intersects(amd_bits) {
            not_preferred |= amd_bits;
        }

        let mut best: Option<(u32, u32)> = None;
        for index in 0..self.memory_types.len() as u32 {
            if mask & (1 << index) == 0 {
                continue;
            }
            let flags = self.memory_types[index as usize].property_flags;
            if !flags.contains(required) {
                continue;
            }
            let cost = (preferred & !flags).bits().count_ones()
                + (flags & not_preferred).bits().count_ones();
            match best {
                Some((_, best_cost)) if cost >= best_cost => {}
                _ => best = Some((index, cost)),
            }
            if cost == 0 {
                break;
            }
        }
        best.map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types() -> Vec<MemoryType> {
        vec![
            MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT
                    | MemoryPropertyFlags::HOST_CACHED,
                heap_index: 1,
            },
        ]
    }

    #[test]
    fn gpu_only_prefers_device_local() {
        let t = types();
        let sel = TypeSelector::new(&t, false, false);
        let idx = sel
            .select(
                0b111,
                0,
                MemoryPropertyFlags::empty(),
                MemoryPropertyFlags::empty(),
                MemoryUsage::GpuOnly,
            )
            .unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn cpu_only_requires_host_visible_coherent() {
        let t = types();
        let sel = TypeSelector::new(&t, false, false);
        let idx = sel
            .select(
                0b111,
                0,
                MemoryPropertyFlags::empty(),
                MemoryPropertyFlags::empty(),
                MemoryUsage::CpuOnly,
            )
            .unwrap();
        assert_ne!(idx, 0);
    }

    #[test]
    fn gpu_to_cpu_prefers_cached() {
        let t = types();
        let sel = TypeSelector::new(&t, false, false);
        let idx = sel
            .select(
                0b111,
                0,
                MemoryPropertyFlags::empty(),
                MemoryPropertyFlags::empty(),
                MemoryUsage::GpuToCpu,
            )
            .unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn type_bits_restriction_is_honored() {
        let t = types();
        let sel = TypeSelector::new(&t, false, false);
        let idx = sel.select(
            0b111,
            0b010,
            MemoryPropertyFlags::empty(),
            MemoryPropertyFlags::empty(),
            MemoryUsage::GpuOnly,
        );
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn amd_coherent_excluded_unless_opted_in() {
        let mut t = types();
        t.push(MemoryType {
            property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                | MemoryPropertyFlags::DEVICE_COHERENT_AMD,
            heap_index: 0,
        });
        let sel = TypeSelector::new(&t, false, false);
        // Index 3 carries the AMD bit and should be masked out of the
        // global candidate set even though it otherwise satisfies GpuOnly.
        let idx = sel
            .select(
                0b1111,
                0,
                MemoryPropertyFlags::empty(),
                MemoryPropertyFlags::empty(),
                MemoryUsage::GpuOnly,
            )
            .unwrap();
        assert_eq!(idx, 0);
    }
}
