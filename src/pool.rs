//! A named, independently-sized `BlockList` a caller can carve out of a
//! memory type for allocations it wants isolated (spec §4.2 "Pools").

use crate::{
    block_list::{BlockList, BlockListConfig},
    create_info::{PoolCreateInfo, PoolId},
    device::MemoryType,
    error::Error,
};

pub struct Pool {
    pub(crate) id: PoolId,
    pub(crate) block_list: BlockList,
}

impl Pool {
    pub(crate) fn new(
        id: PoolId,
        info: &PoolCreateInfo,
        memory_type: &MemoryType,
        preferred_block_size: u64,
        buffer_image_granularity: u64,
    ) -> Self {
        let config = BlockListConfig {
            memory_type_index: info.memory_type_index,
            heap_index: memory_type.heap_index,
            preferred_block_size: info.block_size.unwrap_or(preferred_block_size),
            fixed_block_size: info.block_size,
            min_block_count: info.min_block_count,
            max_block_count: info.max_block_count,
            buffer_image_granularity: if info
                .flags
                .contains(crate::create_info::PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY)
            {
                1
            } else {
                buffer_image_granularity
            },
            frame_in_use_count: info.frame_in_use_count,
        };
        Pool {
            id,
            block_list: BlockList::new(config),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn block_list(&self) -> &BlockList {
        &self.block_list
    }

    /// A pool is safe to destroy only once it holds no live allocations
    /// (spec §4.6).
    pub fn is_empty(&self) -> bool {
        self.block_list.allocation_count() == 0
    }

    /// Not yet implemented; re-implementers should keep declaring this
    /// surface rather than inventing corruption-detection behavior (spec §9
    /// "Unresolved in source").
    pub fn check_corruption(&self) -> Result<(), Error> {
        Err(Error::Unsupported("check_corruption"))
    }
}
