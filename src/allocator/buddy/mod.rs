//! Power-of-two sub-allocation of upload buffers.
use std::collections::BTreeSet;

mod constant;
pub use constant::{ConstantBufferAllocator, ConstantBufferAllocatorDesc};

mod multi;
pub use multi::{BuddyAllocatorDesc, MultiBuddyAllocator, RetiredBlock};

/// Buddy buffers never span more than `1 << MAX_BUDDY_ADDRESS_BITS` bytes.
pub(crate) const MAX_BUDDY_ADDRESS_BITS: u32 = 48;

/// A block handed out by [`BuddyAllocator::try_allocate()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuddyAllocation {
    pub offset: u64,
    pub order: u32,
}

/// Buddy allocator over `min_block_size << max_order` bytes.
///
/// A free block of order `k` splits into two order `k - 1` buddies on demand; a freed block
/// merges with its buddy (`offset ^ block_size`) for as long as the buddy is free.
#[derive(Debug)]
pub struct BuddyAllocator {
    min_block_size: u64,
    max_order: u32,
    /// Free block offsets per order.
    free_blocks: Vec<BTreeSet<u64>>,
    allocated_size: u64,
    allocation_count: usize,
}

impl BuddyAllocator {
    pub fn new(min_block_size: u64, max_order: u32) -> Self {
        assert!(
            min_block_size.is_power_of_two(),
            "Minimum block size must be a power of two"
        );
        assert!(
            min_block_size.trailing_zeros() + max_order < 64,
            "Buddy allocator of order {} is too large",
            max_order
        );

        let mut free_blocks = vec![BTreeSet::new(); max_order as usize + 1];
        free_blocks[max_order as usize].insert(0);

        Self {
            min_block_size,
            max_order,
            free_blocks,
            allocated_size: 0,
            allocation_count: 0,
        }
    }

    /// Number of minimum-size blocks a request needs, before rounding to a power of two.
    pub fn unit_size(&self, size: u64, alignment: u64) -> u64 {
        // Blocks are aligned to their own size, so a large alignment is a large size.
        let size = size.max(alignment).max(1);
        size / self.min_block_size + u64::from(size % self.min_block_size != 0)
    }

    /// Returns `u64::BITS` when the unit count has no power of two above it.
    pub fn order_for_size(&self, size: u64, alignment: u64) -> u32 {
        let units = self.unit_size(size, alignment);
        units
            .checked_next_power_of_two()
            .map_or(u64::BITS, u64::trailing_zeros)
    }

    pub fn block_size(&self, order: u32) -> u64 {
        self.min_block_size << order
    }

    /// Returns [`None`] when the request exceeds `max_order` or no block is free.
    pub fn try_allocate(&mut self, size: u64, alignment: u64) -> Option<BuddyAllocation> {
        debug_assert!(alignment.is_power_of_two());

        let order = self.order_for_size(size, alignment);
        if order > self.max_order {
            return None;
        }

        let offset = self.allocate_block(order)?;
        self.allocated_size += self.block_size(order);
        self.allocation_count += 1;
        Some(BuddyAllocation { offset, order })
    }

    fn allocate_block(&mut self, order: u32) -> Option<u64> {
        if order > self.max_order {
            return None;
        }

        if let Some(offset) = self.free_blocks[order as usize].pop_first() {
            return Some(offset);
        }

        let offset = self.allocate_block(order + 1)?;
        let buddy = offset + self.block_size(order);
        self.free_blocks[order as usize].insert(buddy);
        Some(offset)
    }

    pub fn deallocate(&mut self, allocation: BuddyAllocation) {
        let BuddyAllocation { offset, order } = allocation;
        assert!(order <= self.max_order, "Invalid buddy order {}", order);
        debug_assert_eq!(offset % self.block_size(order), 0);

        self.allocated_size -= self.block_size(order);
        self.allocation_count -= 1;
        self.deallocate_block(offset, order);
    }

    fn deallocate_block(&mut self, offset: u64, order: u32) {
        if order < self.max_order {
            let buddy = self.buddy_offset(offset, order);
            if self.free_blocks[order as usize].remove(&buddy) {
                self.deallocate_block(offset.min(buddy), order + 1);
                return;
            }
        }

        let inserted = self.free_blocks[order as usize].insert(offset);
        assert!(inserted, "Double free of buddy block at 0x{:x}", offset);
    }

    /// Offset of the sibling that `offset` merges with at `order`.
    pub fn buddy_offset(&self, offset: u64, order: u32) -> u64 {
        offset ^ self.block_size(order)
    }

    pub fn min_block_size(&self) -> u64 {
        self.min_block_size
    }

    pub fn max_order(&self) -> u32 {
        self.max_order
    }

    pub fn size(&self) -> u64 {
        self.block_size(self.max_order)
    }

    pub fn allocated_size(&self) -> u64 {
        self.allocated_size
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    /// Free block count per order, lowest order first.
    pub fn free_block_counts(&self) -> Vec<usize> {
        self.free_blocks.iter().map(BTreeSet::len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rounds_to_power_of_two_units() {
        let mut allocator = BuddyAllocator::new(256, 10);

        assert_eq!(allocator.unit_size(1000, 1), 4);
        let allocation = allocator.try_allocate(1000, 1).unwrap();
        assert_eq!(allocation.order, 2);
        assert_eq!(allocator.block_size(allocation.order), 1024);
        assert_eq!(allocator.allocated_size(), 1024);

        for (size, order) in [(1, 0), (256, 0), (257, 1), (768, 2), (1025, 3), (256 << 10, 10)] {
            assert_eq!(allocator.order_for_size(size, 1), order, "size {}", size);
        }
    }

    #[test]
    fn split_and_merge_restore_the_root_block() {
        let mut allocator = BuddyAllocator::new(256, 4);

        let a = allocator.try_allocate(256, 256).unwrap();
        let b = allocator.try_allocate(256, 256).unwrap();
        let c = allocator.try_allocate(512, 256).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(c.offset, 512);
        assert_eq!(allocator.free_block_counts(), vec![0, 0, 1, 1, 0]);
        assert_eq!(allocator.buddy_offset(a.offset, 0), b.offset);
        assert_eq!(allocator.buddy_offset(c.offset, 1), 0);

        allocator.deallocate(b);
        allocator.deallocate(a);
        allocator.deallocate(c);

        assert!(allocator.is_empty());
        assert_eq!(allocator.free_block_counts(), vec![0, 0, 0, 0, 1]);
    }

    #[test]
    fn oversized_and_exhausted_requests_fail() {
        let mut allocator = BuddyAllocator::new(256, 2);
        assert!(allocator.try_allocate(2048, 1).is_none());

        let whole = allocator.try_allocate(1024, 1).unwrap();
        assert!(allocator.try_allocate(1, 1).is_none());

        allocator.deallocate(whole);
        assert!(allocator.try_allocate(1, 1).is_some());
    }

    #[test]
    fn large_alignment_picks_an_aligned_block() {
        let mut allocator = BuddyAllocator::new(256, 6);

        let _small = allocator.try_allocate(256, 256).unwrap();
        let aligned = allocator.try_allocate(256, 4096).unwrap();
        assert_eq!(aligned.offset % 4096, 0);
        assert_eq!(aligned.order, 4);
    }

    #[test]
    fn huge_requests_do_not_wrap_to_small_orders() {
        let mut allocator = BuddyAllocator::new(256, 4);
        assert_eq!(allocator.unit_size(u64::MAX, 1), 1 << 56);
        assert_eq!(allocator.order_for_size(u64::MAX, 1), 56);
        assert!(allocator.try_allocate(u64::MAX, 1).is_none());

        let bytes = BuddyAllocator::new(1, 4);
        assert_eq!(bytes.order_for_size(u64::MAX, 1), u64::BITS);
    }
}
