//! Per-heap budget tracking (spec §4.5, L6): the allocator's own bookkeeping
//! of `block_bytes`/`allocation_bytes`, reconciled against the driver's
//! budget-extension numbers when available.

use {
    crate::device::{HeapBudget, MemoryDevice},
    parking_lot::RwLock,
    std::sync::atomic::{AtomicU64, Ordering},
};

/// Re-poll the driver budget extension after this many successful
/// allocations rather than on every one (spec §4.5).
const OPS_BEFORE_REPOLL: u64 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
    pub block_bytes: u64,
    pub allocation_bytes: u64,
    pub vulkan_usage: u64,
    pub vulkan_budget: u64,
}

struct Heap {
    size: u64,
    limit: Option<u64>,
    block_bytes: AtomicU64,
    allocation_bytes: AtomicU64,
}

#[derive(Clone, Copy, Default)]
struct CachedBudget {
    reported: HeapBudget,
    block_bytes_at_fetch: u64,
}

pub struct BudgetTracker {
    heaps: Vec<Heap>,
    has_extension: bool,
    ops_since_fetch: AtomicU64,
    cache: RwLock<Vec<CachedBudget>>,
}

impl BudgetTracker {
    pub fn new(heap_sizes: &[u64], limits: &[Option<u64>], has_extension: bool) -> Self {
        let heaps = heap_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| Heap {
                size,
                limit: limits.get(i).copied().flatten(),
                block_bytes: AtomicU64::new(0),
                allocation_bytes: AtomicU64::new(0),
            })
            .collect();
        BudgetTracker {
            heaps,
            has_extension,
            ops_since_fetch: AtomicU64::new(0),
            cache: RwLock::new(vec![CachedBudget::default(); heap_sizes.len()]),
        }
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn block_bytes(&self, heap: usize) -> u64 {
        self.heaps[heap].block_bytes.load(Ordering::Acquire)
    }

    pub fn allocation_bytes(&self, heap: usize) -> u64 {
        self.heaps[heap].allocation_bytes.load(Ordering::Acquire)
    }

    /// Reserves `size` bytes of `block_bytes` against `heap`'s hard limit
    /// (spec §4.5/§8 "heap_size_limits"), if one is configured. A CAS loop
    /// since multiple block lists can race to grow their heap concurrently.
    pub fn try_reserve_block(&self, heap: usize, size: u64) -> bool {
        let h = &self.heaps[heap];
        match h.limit {
            None => {
                h.block_bytes.fetch_add(size, Ordering::AcqRel);
                true
            }
            Some(limit) => loop {
                let current = h.block_bytes.load(Ordering::Acquire);
                let next = match current.checked_add(size) {
                    Some(v) if v <= limit => v,
                    _ => return false,
                };
                if h.block_bytes
                    .compare_exchange_weak(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return true;
                }
            },
        }
    }

    pub fn release_block(&self, heap: usize, size: u64) {
        self.heaps[heap].block_bytes.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn add_allocation(&self, heap: usize, size: u64) {
        self.heaps[heap]
            .allocation_bytes
            .fetch_add(size, Ordering::AcqRel);
    }

    pub fn remove_allocation(&self, heap: usize, size: u64) {
        self.heaps[heap]
            .allocation_bytes
            .fetch_sub(size, Ordering::AcqRel);
    }

    /// Call after every successful allocation; re-polls the driver once
    /// every [`OPS_BEFORE_REPOLL`] calls.
    pub fn note_operation(&self, device: &dyn MemoryDevice) {
        if !self.has_extension {
            return;
        }
        let count = self.ops_since_fetch.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= OPS_BEFORE_REPOLL {
            self.refresh(device);
        }
    }

    /// Unconditionally re-polls and re-sanitizes the cached budget (spec
    /// §4.3 `WithinBudget` recheck).
    pub fn refresh(&self, device: &dyn MemoryDevice) {
        if !self.has_extension {
            return;
        }
        let raw = device.query_budgets(self.heaps.len());
        let mut cache = self.cache.write();
        for (i, h) in self.heaps.iter().enumerate() {
            let block_bytes = h.block_bytes.load(Ordering::Acquire);
            let mut reported = raw.get(i).copied().unwrap_or_default();
            if reported.budget == 0 {
                reported.budget = h.size * 8 / 10;
            }
            if reported.budget > h.size {
                reported.budget = h.size;
            }
            if reported.usage == 0 && block_bytes > 0 {
                reported.usage = block_bytes;
            }
            cache[i] = CachedBudget {
                reported,
                block_bytes_at_fetch: block_bytes,
            };
        }
        self.ops_since_fetch.store(0, Ordering::Release);
    }

    pub fn report(&self, heap: usize) -> HeapReport {
        let block_bytes = self.heaps[heap].block_bytes.load(Ordering::Acquire);
        let allocation_bytes = self.heaps[heap].allocation_bytes.load(Ordering::Acquire);
        if !self.has_extension {
            return HeapReport {
                block_bytes,
                allocation_bytes,
                vulkan_usage: block_bytes,
                vulkan_budget: self.heaps[heap].size * 8 / 10,
            };
        }
        let cache = self.cache.read();
        let cached = cache[heap];
        HeapReport {
            block_bytes,
            allocation_bytes,
            vulkan_usage: cached.reported.usage,
            vulkan_budget: cached.reported.budget,
        }
    }

    /// Forces a fresh poll and checks whether `heap` has room for
    /// `extra_bytes` more usage (spec §4.3 `WithinBudget`: "recompute the
    /// heap budget and reject if usage + size > budget" — `usage` here is
    /// `vulkan_usage`, not `allocation_bytes`).
    pub fn within_budget(&self, heap: usize, extra_bytes: u64, device: &dyn MemoryDevice) -> bool {
        self.refresh(device);
        let report = self.report(heap);
        report.vulkan_usage + extra_bytes <= report.vulkan_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{mock::MockDevice, MemoryProperties};

    #[test]
    fn heap_limit_denies_overcommit() {
        let tracker = BudgetTracker::new(&[1000], &[Some(600)], false);
        assert!(tracker.try_reserve_block(0, 500));
        assert!(!tracker.try_reserve_block(0, 200));
        assert!(tracker.try_reserve_block(0, 100));
    }

    #[test]
    fn unlimited_heap_has_no_ceiling() {
        let tracker = BudgetTracker::new(&[1000], &[None], false);
        assert!(tracker.try_reserve_block(0, 1_000_000));
    }

    #[test]
    fn sanitizes_zero_budget_to_heuristic() {
        let device = MockDevice::new(MemoryProperties::default()).with_budget_extension();
        let tracker = BudgetTracker::new(&[1000], &[None], true);
        tracker.refresh(&device);
        let report = tracker.report(0);
        assert_eq!(report.vulkan_budget, 800);
    }

    #[test]
    fn falls_back_without_extension() {
        let tracker = BudgetTracker::new(&[1000], &[None], false);
        tracker.try_reserve_block(0, 200);
        let report = tracker.report(0);
        assert_eq!(report.vulkan_budget, 800);
        assert_eq!(report.vulkan_usage, 200);
    }

    #[test]
    fn within_budget_compares_against_usage_not_allocation_bytes() {
        let device = MockDevice::new(MemoryProperties::default());
        let tracker = BudgetTracker::new(&[2000], &[None], false);
        // A block much larger than what's actually handed out to callers:
        // block_bytes (and so vulkan_usage, with no budget extension) is
        // 1000, but allocation_bytes is only 200.
        tracker.try_reserve_block(0, 1000);
        tracker.add_allocation(0, 200);

        assert!(tracker.within_budget(0, 500, &device));
        assert!(!tracker.within_budget(0, 700, &device));
    }
}
