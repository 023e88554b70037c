use std::fmt;

/// Snapshot of one pool, handed to the [`DefragPolicy`] after every cleanup pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_index: u32,
    pub pool_size: u64,
    pub free_size: u64,
    pub free_block_count: usize,
    pub largest_free_block: u64,
    pub allocation_count: usize,
    /// Allocations pinned with [`crate::PoolAllocator::lock()`]; these must not be relocated.
    pub locked_count: usize,
    pub last_used_frame_fence: u64,
}

impl PoolStats {
    /// Share of the free memory that isn't part of the largest free block.
    pub fn fragmentation(&self) -> f32 {
        if self.free_size == 0 {
            0.0
        } else {
            1.0 - self.largest_free_block as f32 / self.free_size as f32
        }
    }
}

/// Extension point for relocating pool allocations.
///
/// [`crate::PoolAllocator::cleanup_allocations()`] calls the policy once reclamation is done,
/// while still holding the allocator lock. No compaction algorithm is provided; [`NoDefrag`]
/// is the default.
pub trait DefragPolicy: Send + Sync + fmt::Debug {
    fn defragment(&self, allocator_name: &str, pools: &[PoolStats]);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoDefrag;

impl DefragPolicy for NoDefrag {
    fn defragment(&self, _allocator_name: &str, _pools: &[PoolStats]) {}
}
