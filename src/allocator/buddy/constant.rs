use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::MultiBuddyAllocator;
use crate::deferred::{FrameFenced, FrameFencedQueue};
use crate::fence::FenceTimeline;
use crate::math::align_up;
use crate::resource::ResourceLocation;
use crate::{AllocationError, Result};

/// Placement alignment constant buffer views require.
const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

#[derive(Clone, Debug)]
pub struct ConstantBufferAllocatorDesc<'a> {
    pub name: &'a str,
    /// Size of the blocks carved out of the buddy allocator.
    pub block_size: u64,
}

impl Default for ConstantBufferAllocatorDesc<'_> {
    fn default() -> Self {
        Self {
            name: "Constant buffer allocator",
            block_size: 64 * 1024,
        }
    }
}

#[derive(Debug)]
struct ConstantBlock {
    location: ResourceLocation,
    next_offset: u64,
    retire_frame_fence: u64,
}

impl FrameFenced for ConstantBlock {
    fn frame_fence(&self) -> u64 {
        self.retire_frame_fence
    }
}

#[derive(Debug, Default)]
struct ConstantBufferAllocatorInner {
    current: Option<ConstantBlock>,
    retired: FrameFencedQueue<ConstantBlock>,
}

/// Bump allocator for short-lived constant data, carved out of a [`MultiBuddyAllocator`].
///
/// Constants are written once and read by the next submission, so they are tracked per coarse
/// block instead of per allocation: a full block is retired with the current submission fence
/// and reused as a whole once that fence completed.
#[derive(Debug)]
pub struct ConstantBufferAllocator {
    name: String,
    block_size: u64,
    buddy: Arc<MultiBuddyAllocator>,
    timeline: Arc<dyn FenceTimeline>,
    inner: Mutex<ConstantBufferAllocatorInner>,
}

impl ConstantBufferAllocator {
    pub fn new(
        desc: &ConstantBufferAllocatorDesc<'_>,
        buddy: Arc<MultiBuddyAllocator>,
        timeline: Arc<dyn FenceTimeline>,
    ) -> Result<Self> {
        if desc.block_size < CONSTANT_BUFFER_ALIGNMENT
            || desc.block_size % CONSTANT_BUFFER_ALIGNMENT != 0
        {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "ConstantBufferAllocatorDesc field `block_size` must be a multiple of 256.".into(),
            ));
        }

        Ok(Self {
            name: desc.name.to_owned(),
            block_size: desc.block_size,
            buddy,
            timeline,
            inner: Mutex::new(ConstantBufferAllocatorInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Allocates `size` bytes of constant data.
    ///
    /// The location is a [`crate::LocationKind::FastAllocation`] that stays valid until the
    /// block it lives in is retired and reused. Requests larger than a block are sub-allocated
    /// from the buddy allocator directly.
    pub fn allocate(&self, size: u64, location: &mut ResourceLocation) -> Result<()> {
        location.clear();

        if size == 0 {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        if size > self.block_size {
            return self
                .buddy
                .try_allocate(&self.name, size, CONSTANT_BUFFER_ALIGNMENT, location);
        }
        // `block_size` is a multiple of the alignment, so this can't overflow or exceed it.
        let aligned_size = align_up(size, CONSTANT_BUFFER_ALIGNMENT);

        let mut inner = self.inner.lock();

        let has_room = matches!(
            &inner.current,
            Some(block) if block.next_offset + aligned_size <= self.block_size
        );
        if !has_room {
            let block = self.next_block(&mut inner)?;
            if let Some(mut full) = inner.current.replace(block) {
                full.retire_frame_fence = self.timeline.current_submission_fence();
                inner.retired.push(full);
            }
        }

        let block = inner
            .current
            .as_mut()
            .ok_or_else(|| AllocationError::Internal("Constant block must be Some.".into()))?;
        let resource = block
            .location
            .resource()
            .cloned()
            .ok_or_else(|| AllocationError::Internal("Constant block has no resource.".into()))?;

        let offset = block.location.offset_from_base_of_resource() + block.next_offset;
        block.next_offset += aligned_size;
        location.init_fast_allocation(resource, offset, size);

        Ok(())
    }

    /// Reuses the oldest retired block if the device finished with it, otherwise carves a new
    /// one out of the buddy allocator.
    fn next_block(&self, inner: &mut ConstantBufferAllocatorInner) -> Result<ConstantBlock> {
        let completed_fence = self.timeline.completed_fence();
        if let Some(mut block) = inner.retired.pop_ready(completed_fence, 0) {
            block.next_offset = 0;
            return Ok(block);
        }

        let mut location = ResourceLocation::new();
        self.buddy.try_allocate(
            &self.name,
            self.block_size,
            CONSTANT_BUFFER_ALIGNMENT,
            &mut location,
        )?;
        debug!(
            "Constant buffer allocator `{}` carved a new block at 0x{:x}",
            self.name,
            location.gpu_address()
        );

        Ok(ConstantBlock {
            location,
            next_offset: 0,
            retire_frame_fence: 0,
        })
    }

    /// Hands retired blocks that are at least `frame_lag` submissions old back to the buddy
    /// allocator. Returns how many were released.
    pub fn cleanup_blocks(&self, frame_lag: u64) -> usize {
        let completed_fence = self.timeline.completed_fence();
        let mut inner = self.inner.lock();
        // Dropping a block clears its location, which defers the buddy free.
        inner.retired.drain_ready(completed_fence, frame_lag, drop)
    }

    pub fn retired_block_count(&self) -> usize {
        self.inner.lock().retired.len()
    }
}
