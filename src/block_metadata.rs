//! Suballocation placement within one device block (spec §4.1, L2).
//!
//! The ordered suballocation list is a doubly-linked list threaded through a
//! `slab::Slab` (O(1) insert/remove around a chosen node, O(1) next/prev
//! granularity walks — spec §9). A size-sorted `Vec` indexes `Free` records
//! whose size meets [`MIN_FREE_SUBALLOC_SIZE_TO_REGISTER`] for `BestFit`
//! binary search; a `BTreeMap` indexes every record by offset since handles
//! only ever carry `(block, offset)` identity (spec §9) and free-by-handle
//! reduces to free-by-offset.

use {
    crate::{
        suballocation::{AllocationId, Suballocation, SuballocationType},
        util::{align_up, same_granularity_page},
    },
    slab::Slab,
    std::collections::BTreeMap,
};

/// Size at/above which a free record is kept in the size index. Below this,
/// a free sliver is assumed too small to ever satisfy a real request and
/// isn't worth the index upkeep.
pub const MIN_FREE_SUBALLOC_SIZE_TO_REGISTER: u64 = 16;

/// Extra slack reserved around every suballocation in debug builds to catch
/// out-of-bounds writes. Zero in release; kept as a named constant so the
/// placement math always routes through it (spec §9 build-time knob).
#[cfg(debug_assertions)]
pub const DEBUG_MARGIN: u64 = 0;
#[cfg(not(debug_assertions))]
pub const DEBUG_MARGIN: u64 = 0;

/// Cost in synthetic bytes charged per suballocation a request would evict
/// (spec §6).
pub const LOST_ALLOCATION_COST: u64 = 1_048_576;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    BestFit,
    FirstFit,
    WorstFit,
    /// Internal: used by the losing sweep to walk in offset order.
    MinOffset,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::BestFit
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PlacementContext {
    pub size: u64,
    pub alignment: u64,
    pub granularity: u64,
    pub suballoc_type: SuballocationType,
    pub strategy: Strategy,
    pub current_frame: u64,
    pub frame_in_use_count: u64,
    pub can_make_other_lost: bool,
}

/// Lets the placement algorithm inspect and atomically retire the handles
/// that own non-free suballocations, without metadata ever owning a handle
/// itself (spec §9: a weak relation, invalidated independently).
pub trait LostAllocationOracle {
    /// `None` means the owner can never become lost (`can_become_lost ==
    /// false`).
    fn last_use_frame(&self, owner: AllocationId) -> Option<u64>;

    /// Attempts the publish-once transition from `observed` to the lost
    /// sentinel. Fails if the owner's frame index moved since `observed`
    /// was read.
    fn try_mark_lost(&self, owner: AllocationId, observed: u64) -> bool;
}

#[derive(Clone, Debug)]
struct Node {
    record: Suballocation,
    prev: Option<usize>,
    next: Option<usize>,
}

/// One item a request would evict to make room, captured at `try_request`
/// time so `make_requested_lost` can re-validate with a compare-and-swap
/// instead of trusting stale state.
#[derive(Clone, Copy, Debug)]
struct LostItem {
    node: usize,
    owner: AllocationId,
    observed_frame: u64,
}

#[derive(Clone, Debug)]
pub struct AllocationRequest {
    anchor: usize,
    start: u64,
    covered_end: u64,
    offset: u64,
    size: u64,
    padding_begin: u64,
    padding_end: u64,
    items_to_make_lost: Vec<LostItem>,
    sum_item_size: u64,
}

impl AllocationRequest {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn items_to_make_lost_count(&self) -> usize {
        self.items_to_make_lost.len()
    }

    /// `sum_item_size + items_to_make_lost * LOST_ALLOCATION_COST` (spec
    /// §4.2 step 7).
    pub fn calc_cost(&self) -> u64 {
        self.sum_item_size
            + self.items_to_make_lost.len() as u64 * LOST_ALLOCATION_COST
    }
}

#[derive(Debug)]
pub struct BlockMetadata {
    nodes: Slab<Node>,
    head: usize,
    tail: usize,
    offset_index: BTreeMap<u64, usize>,
    size_index: Vec<usize>,
    sum_free: u64,
    free_count: usize,
    live_count: usize,
    block_size: u64,
}

impl BlockMetadata {
    pub fn new(block_size: u64) -> Self {
        let mut nodes = Slab::with_capacity(16);
        let key = nodes.insert(Node {
            record: Suballocation::free(0, block_size),
            prev: None,
            next: None,
        });
        let mut offset_index = BTreeMap::new();
        offset_index.insert(0, key);

        let size_index = if block_size >= MIN_FREE_SUBALLOC_SIZE_TO_REGISTER {
            vec![key]
        } else {
            Vec::new()
        };

        BlockMetadata {
            nodes,
            head: key,
            tail: key,
            offset_index,
            size_index,
            sum_free: block_size,
            free_count: 1,
            live_count: 0,
            block_size,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn sum_free(&self) -> u64 {
        self.sum_free
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && self.nodes[self.head].record.is_free()
    }

    /// Visits every non-free record still holding an owner, for the losing
    /// sweep and for stats aggregation (spec §4.2/§4.6).
    pub fn for_each_live(&self, mut f: impl FnMut(&Suballocation)) {
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            if !node.record.is_free() {
                f(&node.record);
            }
            cursor = node.next;
        }
    }

    /// Forcibly retires every live record whose owner reports
    /// `can_become_lost`, regardless of recency (spec §4.2 pool-wide reset).
    /// Returns the number of records retired.
    pub fn lose_all(&mut self, oracle: &dyn LostAllocationOracle) -> usize {
        let mut victims = Vec::new();
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            if let Some(owner) = node.record.owner {
                if let Some(observed) = oracle.last_use_frame(owner) {
                    victims.push((key, owner, observed));
                }
            }
            cursor = node.next;
        }
        let mut lost = 0;
        for (key, owner, observed) in victims {
            if self.nodes.get(key).map_or(false, |n| !n.record.is_free())
                && oracle.try_mark_lost(owner, observed)
            {
                self.free_node(key);
                lost += 1;
            }
        }
        lost
    }

    // ---- size index -----------------------------------------------------

    fn register_free(&mut self, key: usize) {
        let size = self.nodes[key].record.size;
        if size < MIN_FREE_SUBALLOC_SIZE_TO_REGISTER {
            return;
        }
        let pos = self
            .size_index
            .partition_point(|&k| self.nodes[k].record.size < size);
        self.size_index.insert(pos, key);
    }

    fn unregister_free(&mut self, key: usize) {
        let size = self.nodes[key].record.size;
        if size < MIN_FREE_SUBALLOC_SIZE_TO_REGISTER {
            return;
        }
        let start = self
            .size_index
            .partition_point(|&k| self.nodes[k].record.size < size);
        let end = self
            .size_index
            .partition_point(|&k| self.nodes[k].record.size <= size);
        let pos = self.size_index[start..end]
            .iter()
            .position(|&k| k == key)
            .map(|i| start + i)
            .expect("free node must be registered");
        self.size_index.remove(pos);
    }

    // ---- linked-list surgery ---------------------------------------------

    fn insert_after(&mut self, key: usize, record: Suballocation) -> usize {
        let next = self.nodes[key].next;
        let new_key = self.nodes.insert(Node {
            record,
            prev: Some(key),
            next,
        });
        self.nodes[key].next = Some(new_key);
        match next {
            Some(n) => self.nodes[n].prev = Some(new_key),
            None => self.tail = new_key,
        }
        self.offset_index.insert(record.offset, new_key);
        new_key
    }

    fn insert_before(&mut self, key: usize, record: Suballocation) -> usize {
        let prev = self.nodes[key].prev;
        let new_key = self.nodes.insert(Node {
            record,
            prev,
            next: Some(key),
        });
        self.nodes[key].prev = Some(new_key);
        match prev {
            Some(p) => self.nodes[p].next = Some(new_key),
            None => self.head = new_key,
        }
        self.offset_index.insert(record.offset, new_key);
        new_key
    }

    fn unlink_and_remove(&mut self, key: usize) {
        let (prev, next, offset) = {
            let node = &self.nodes[key];
            (node.prev, node.next, node.record.offset)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next.expect("removing the only node"),
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev.expect("removing the only node"),
        }
        self.offset_index.remove(&offset);
        self.nodes.remove(key);
    }

    fn set_offset(&mut self, key: usize, new_offset: u64) {
        let old_offset = self.nodes[key].record.offset;
        if old_offset == new_offset {
            return;
        }
        self.offset_index.remove(&old_offset);
        self.nodes[key].record.offset = new_offset;
        self.offset_index.insert(new_offset, key);
    }

    // ---- placement ---------------------------------------------------

    pub fn try_request(
        &self,
        ctx: PlacementContext,
        oracle: &dyn LostAllocationOracle,
    ) -> Option<AllocationRequest> {
        match ctx.strategy {
            Strategy::BestFit => self.best_fit(&ctx, oracle),
            Strategy::MinOffset => self.min_offset(&ctx, oracle),
            Strategy::FirstFit | Strategy::WorstFit => {
                self.scan_from_largest(&ctx, oracle)
            }
        }
    }

    fn best_fit(
        &self,
        ctx: &PlacementContext,
        oracle: &dyn LostAllocationOracle,
    ) -> Option<AllocationRequest> {
        let needed = ctx.size + 2 * DEBUG_MARGIN;
        let start = self
            .size_index
            .partition_point(|&k| self.nodes[k].record.size < needed);
        for &key in &self.size_index[start..] {
            if let Some(req) = self.check(key, ctx, oracle) {
                return Some(req);
            }
        }
        None
    }

    fn scan_from_largest(
        &self,
        ctx: &PlacementContext,
        oracle: &dyn LostAllocationOracle,
    ) -> Option<AllocationRequest> {
        for &key in self.size_index.iter().rev() {
            if let Some(req) = self.check(key, ctx, oracle) {
                return Some(req);
            }
        }
        None
    }

    fn min_offset(
        &self,
        ctx: &PlacementContext,
        oracle: &dyn LostAllocationOracle,
    ) -> Option<AllocationRequest> {
        let mut cursor = Some(self.head);
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            if node.record.is_free() {
                if let Some(req) = self.check(key, ctx, oracle) {
                    return Some(req);
                }
            }
            cursor = node.next;
        }
        None
    }

    /// Runs the six-step check of spec §4.1 against one candidate `Free`
    /// record.
    fn check(
        &self,
        free_key: usize,
        ctx: &PlacementContext,
        oracle: &dyn LostAllocationOracle,
    ) -> Option<AllocationRequest> {
        let free_node = &self.nodes[free_key];
        debug_assert!(free_node.record.is_free());
        let start = free_node.record.offset;

        let mut proposed_offset =
            align_up(start + DEBUG_MARGIN, ctx.alignment)?;

        // Step 3: backward granularity conflict.
        if ctx.granularity > 1 {
            let mut cursor = free_node.prev;
            while let Some(key) = cursor {
                let node = &self.nodes[key];
                if !same_granularity_page(
                    ctx.granularity,
                    node.record.offset + node.record.size,
                    proposed_offset,
                ) {
                    break;
                }
                if node.record.ty.conflicts_with(ctx.suballoc_type) {
                    proposed_offset =
                        align_up(proposed_offset, ctx.granularity)?;
                    break;
                }
                cursor = node.prev;
            }
        }

        let padding_begin = proposed_offset - start;
        let total_needed = padding_begin + ctx.size + DEBUG_MARGIN;
        let range_end = proposed_offset + ctx.size;

        let mut items_to_make_lost: Vec<LostItem> = Vec::new();
        let mut sum_item_size = 0u64;
        let mut covered_end = start + free_node.record.size;
        let mut cursor = free_node.next;

        while covered_end < start + total_needed {
            let key = cursor?;
            let node = &self.nodes[key];
            if node.record.is_free() {
                covered_end = node.record.offset + node.record.size;
                cursor = node.next;
                continue;
            }
            if !ctx.can_make_other_lost {
                return None;
            }
            let owner = node.record.owner.expect("non-free record has owner");
            let observed_frame = oracle.last_use_frame(owner)?;
            if observed_frame + ctx.frame_in_use_count >= ctx.current_frame {
                return None;
            }
            items_to_make_lost.push(LostItem {
                node: key,
                owner,
                observed_frame,
            });
            sum_item_size += node.record.size;
            covered_end = node.record.offset + node.record.size;
            cursor = node.next;
        }

        // Step 5: forward granularity conflict, over whatever lies beyond
        // the allocated range and wasn't already claimed above.
        if ctx.granularity > 1 {
            while let Some(key) = cursor {
                let node = &self.nodes[key];
                if !same_granularity_page(
                    ctx.granularity,
                    range_end,
                    node.record.offset,
                ) {
                    break;
                }
                if node.record.is_free() {
                    break;
                }
                if items_to_make_lost.iter().any(|i| i.node == key) {
                    cursor = node.next;
                    continue;
                }
                if node.record.ty.conflicts_with(ctx.suballoc_type) {
                    if !ctx.can_make_other_lost {
                        return None;
                    }
                    let owner =
                        node.record.owner.expect("non-free record has owner");
                    let observed_frame = oracle.last_use_frame(owner)?;
                    if observed_frame + ctx.frame_in_use_count
                        >= ctx.current_frame
                    {
                        return None;
                    }
                    items_to_make_lost.push(LostItem {
                        node: key,
                        owner,
                        observed_frame,
                    });
                    sum_item_size += node.record.size;
                    covered_end = node.record.offset + node.record.size;
                }
                cursor = node.next;
            }
        }

        Some(AllocationRequest {
            anchor: free_key,
            start,
            covered_end,
            offset: proposed_offset,
            size: ctx.size,
            padding_begin,
            padding_end: covered_end - range_end,
            items_to_make_lost,
            sum_item_size,
        })
    }

    /// Retires every suballocation the request would evict (spec §4.2
    /// "Losing sweep"). Items are freed (and coalesced) as they're retired,
    /// so a partial failure leaves the already-retired ones permanently
    /// lost — losing is publish-once and never reverses (spec §9).
    pub fn make_requested_lost(
        &mut self,
        request: &AllocationRequest,
        current_frame: u64,
        frame_in_use_count: u64,
        oracle: &dyn LostAllocationOracle,
    ) -> bool {
        for item in &request.items_to_make_lost {
            debug_assert!(
                item.observed_frame + frame_in_use_count < current_frame
            );
            if !oracle.try_mark_lost(item.owner, item.observed_frame) {
                return false;
            }
            self.free_node(item.node);
        }
        true
    }

    /// Commits a validated, already-delossed request: splits the anchor's
    /// free span into `[padding_begin][allocation][padding_end]` (spec
    /// §4.1 "Commit").
    pub fn commit(
        &mut self,
        request: &AllocationRequest,
        size: u64,
        ty: SuballocationType,
        owner: AllocationId,
    ) {
        debug_assert_eq!(size, request.size);
        let key = request.anchor;
        self.unregister_free(key);
        debug_assert_eq!(self.nodes[key].record.offset, request.start);
        debug_assert_eq!(
            self.nodes[key].record.offset + self.nodes[key].record.size,
            request.covered_end
        );

        self.free_count -= 1;
        self.sum_free -= request.covered_end - request.start;

        self.set_offset(key, request.offset);
        {
            let node = &mut self.nodes[key];
            node.record.size = request.size;
            node.record.ty = ty;
            node.record.owner = Some(owner);
        }
        self.live_count += 1;

        if request.padding_end > 0 {
            let new_key = self.insert_after(
                key,
                Suballocation::free(
                    request.offset + request.size,
                    request.padding_end,
                ),
            );
            self.free_count += 1;
            self.sum_free += request.padding_end;
            self.register_free(new_key);
        }
        if request.padding_begin > 0 {
            let new_key = self.insert_before(
                key,
                Suballocation::free(request.start, request.padding_begin),
            );
            self.free_count += 1;
            self.sum_free += request.padding_begin;
            self.register_free(new_key);
        }
    }

    /// Marks the record starting at `offset` free and coalesces it with
    /// free neighbours. Returns the freed size and the record's former
    /// owner (for budget bookkeeping and handle-table cleanup).
    pub fn free_at_offset(&mut self, offset: u64) -> (u64, AllocationId) {
        let key = *self
            .offset_index
            .get(&offset)
            .expect("offset must name a live suballocation");
        let size = self.nodes[key].record.size;
        debug_assert!(!self.nodes[key].record.is_free());
        let owner = self.nodes[key].record.owner.expect("live record has owner");
        self.free_node(key);
        (size, owner)
    }

    fn free_node(&mut self, key: usize) -> usize {
        {
            let node = &mut self.nodes[key];
            debug_assert!(!node.record.is_free());
            node.record.ty = SuballocationType::Free;
            node.record.owner = None;
        }
        self.live_count -= 1;
        self.free_count += 1;
        self.sum_free += self.nodes[key].record.size;

        let mut surviving = key;

        if let Some(next_key) = self.nodes[surviving].next {
            if self.nodes[next_key].record.is_free() {
                self.unregister_free(next_key);
                let next_size = self.nodes[next_key].record.size;
                self.nodes[surviving].record.size += next_size;
                self.unlink_and_remove(next_key);
                self.free_count -= 1;
            }
        }

        if let Some(prev_key) = self.nodes[surviving].prev {
            if self.nodes[prev_key].record.is_free() {
                self.unregister_free(prev_key);
                let cur_size = self.nodes[surviving].record.size;
                self.nodes[prev_key].record.size += cur_size;
                self.unlink_and_remove(surviving);
                self.free_count -= 1;
                surviving = prev_key;
            }
        }

        self.register_free(surviving);
        surviving
    }

    /// Debug-only invariant check (spec §4.1 "Invariants verified by a
    /// debug `Validate`").
    #[cfg(any(test, debug_assertions))]
    pub fn validate(&self) {
        let mut offset = 0u64;
        let mut sum_free = 0u64;
        let mut free_count = 0usize;
        let mut prev_was_free = false;
        let mut cursor = Some(self.head);
        let mut visited = 0usize;

        while let Some(key) = cursor {
            let node = &self.nodes[key];
            assert_eq!(
                node.record.offset, offset,
                "suballocations must be contiguous"
            );
            if node.record.is_free() {
                assert!(!prev_was_free, "adjacent free records forbidden");
                sum_free += node.record.size;
                free_count += 1;
                prev_was_free = true;
            } else {
                assert!(node.record.owner.is_some());
                prev_was_free = false;
            }
            offset += node.record.size;
            visited += 1;
            cursor = node.next;
        }

        assert_eq!(offset, self.block_size, "must cover the whole block");
        assert_eq!(visited, self.nodes.len());
        assert_eq!(sum_free, self.sum_free);
        assert_eq!(free_count, self.free_count);

        let mut last_size = 0u64;
        for &key in &self.size_index {
            let size = self.nodes[key].record.size;
            assert!(self.nodes[key].record.is_free());
            assert!(size >= MIN_FREE_SUBALLOC_SIZE_TO_REGISTER);
            assert!(size >= last_size);
            last_size = size;
        }
        let expected_registered = self
            .nodes
            .iter()
            .filter(|(_, n)| {
                n.record.is_free() && n.record.size >= MIN_FREE_SUBALLOC_SIZE_TO_REGISTER
            })
            .count();
        assert_eq!(expected_registered, self.size_index.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoLost;
    impl LostAllocationOracle for NoLost {
        fn last_use_frame(&self, _owner: AllocationId) -> Option<u64> {
            None
        }
        fn try_mark_lost(&self, _owner: AllocationId, _observed: u64) -> bool {
            false
        }
    }

    fn ctx(size: u64, alignment: u64, granularity: u64, ty: SuballocationType) -> PlacementContext {
        PlacementContext {
            size,
            alignment,
            granularity,
            suballoc_type: ty,
            strategy: Strategy::BestFit,
            current_frame: 0,
            frame_in_use_count: 0,
            can_make_other_lost: false,
        }
    }

    fn place(
        meta: &mut BlockMetadata,
        size: u64,
        alignment: u64,
        granularity: u64,
        ty: SuballocationType,
        owner: usize,
    ) -> u64 {
        let req = meta
            .try_request(ctx(size, alignment, granularity, ty), &NoLost)
            .expect("placement should succeed");
        let offset = req.offset();
        meta.commit(&req, size, ty, AllocationId(owner));
        meta.validate();
        offset
    }

    #[test]
    fn basic_placement_scenario() {
        // Scenario 1 (spec §8): block 1MiB, granularity 64.
        let mut meta = BlockMetadata::new(1024 * 1024);
        let a = place(&mut meta, 256 * 1024, 64, 64, SuballocationType::Buffer, 1);
        assert_eq!(a, 0);
        let b = place(&mut meta, 256 * 1024, 64, 64, SuballocationType::Buffer, 2);
        assert_eq!(b, 262144);

        meta.free_at_offset(a);
        meta.validate();

        let c = place(&mut meta, 128 * 1024, 64, 64, SuballocationType::Buffer, 3);
        assert_eq!(c, 0);
        meta.validate();
    }

    #[test]
    fn granularity_conflict_bumps_offset() {
        // Scenario 2 (spec §8): block 1MiB, granularity 1024.
        let mut meta = BlockMetadata::new(1024 * 1024);
        let a = place(&mut meta, 600, 1, 1024, SuballocationType::Buffer, 1);
        assert_eq!(a, 0);
        let b = place(&mut meta, 600, 1, 1024, SuballocationType::ImageOptimal, 2);
        assert_eq!(b, 1024);
    }

    #[test]
    fn coalescing_after_freeing_middle_then_first() {
        // Scenario 3 (spec §8).
        let mut meta = BlockMetadata::new(1024 * 1024);
        let a = place(&mut meta, 64 * 1024, 1, 1, SuballocationType::Buffer, 1);
        let b = place(&mut meta, 64 * 1024, 1, 1, SuballocationType::Buffer, 2);
        let _c = place(&mut meta, 64 * 1024, 1, 1, SuballocationType::Buffer, 3);
        assert_eq!(a, 0);
        assert_eq!(b, 65536);

        meta.free_at_offset(b);
        meta.validate();
        meta.free_at_offset(a);
        meta.validate();

        assert_eq!(meta.free_count(), 2);
    }

    #[test]
    fn allocate_then_free_restores_emptiness() {
        let mut meta = BlockMetadata::new(4096);
        assert!(meta.is_empty());
        let off = place(&mut meta, 1024, 16, 1, SuballocationType::Buffer, 1);
        assert!(!meta.is_empty());
        meta.free_at_offset(off);
        meta.validate();
        assert!(meta.is_empty());
    }

    #[test]
    fn granularity_conflict_refused_without_make_other_lost() {
        // Block just big enough for the 600-byte buffer but not for an
        // image bumped onto the next granularity page.
        let mut meta = BlockMetadata::new(2048);
        let _a = place(&mut meta, 600, 1, 2048, SuballocationType::Buffer, 1);
        let request = meta.try_request(
            ctx(2000, 1, 2048, SuballocationType::ImageOptimal),
            &NoLost,
        );
        assert!(request.is_none());
    }
}
