//! Aggregate usage statistics (spec §4.2/§4.6: `Stats`/`StatTotal`, named but
//! left undetailed by the distilled spec — shaped here after the
//! block/allocation counters every block list already keeps).

use std::ops::AddAssign;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatTotal {
    pub block_count: usize,
    pub allocation_count: usize,
    pub used_bytes: u64,
    pub unused_bytes: u64,
}

impl AddAssign for StatTotal {
    fn add_assign(&mut self, other: Self) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
    }
}

#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub per_memory_type: Vec<StatTotal>,
    pub per_heap: Vec<StatTotal>,
    pub total: StatTotal,
}
