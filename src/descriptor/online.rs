use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use super::{CpuDescriptorHandle, DescriptorHeapHandle, DescriptorHeapType, GpuDescriptorHandle};
use crate::backend::{DescriptorHeapDesc, DeviceBackend};
use crate::deferred::{FrameFenced, FrameFencedQueue};
use crate::fence::FenceTimeline;
use crate::{AllocationError, Result};

/// Returned by [`OnlineHeap::reserve_slots()`] when the heap has no room.
pub const HEAP_EXHAUSTED_VALUE: u32 = u32::MAX;

/// Outcome of [`OnlineHeap::roll_over()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapRollOver {
    /// New slots come from the same device heap; bound tables stay valid.
    SameHeap,
    /// The device heap changed: every descriptor table bound from the old heap must be
    /// re-emitted before the next draw or dispatch.
    HeapChanged,
}

/// A shader-visible descriptor heap (or a range of one) that slots are bump-reserved from.
///
/// Slots are relative to [`OnlineHeap::first_slot()`]. A caller that sees
/// [`OnlineHeap::can_reserve_slots()`] return `false` must call [`OnlineHeap::roll_over()`]
/// or give up on the request; reserving anyway is a bug.
pub trait OnlineHeap: Send + fmt::Debug {
    fn heap(&self) -> &DescriptorHeapHandle;

    /// Number of slots available between roll-overs.
    fn capacity(&self) -> u32;

    fn next_slot(&self) -> u32;

    fn set_next_slot(&mut self, next_slot: u32);

    /// Moves on to fresh slots once the current ones are used up.
    fn roll_over(&mut self) -> Result<HeapRollOver>;

    /// Offset of slot 0 in [`OnlineHeap::heap()`].
    fn first_slot(&self) -> u32 {
        0
    }

    fn can_reserve_slots(&self, count: u32) -> bool {
        u64::from(self.next_slot()) + u64::from(count) <= u64::from(self.capacity())
    }

    /// Reserves `count` consecutive slots and returns the first one, or
    /// [`HEAP_EXHAUSTED_VALUE`] if they don't fit.
    fn reserve_slots(&mut self, count: u32) -> u32 {
        if !self.can_reserve_slots(count) {
            debug_assert!(false, "Reserving {} slots in a full online heap", count);
            return HEAP_EXHAUSTED_VALUE;
        }
        let first = self.next_slot();
        self.set_next_slot(first + count);
        first
    }

    fn cpu_slot_handle(&self, slot: u32) -> CpuDescriptorHandle {
        self.heap().cpu_slot_handle(self.first_slot() + slot)
    }

    fn gpu_slot_handle(&self, slot: u32) -> GpuDescriptorHandle {
        self.heap().gpu_slot_handle(self.first_slot() + slot)
    }
}

/// A fixed range of the global online heap, owned by one context at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OnlineHeapBlock {
    pub first_slot: u32,
    pub size: u32,
}

#[derive(Debug)]
struct ReleasedBlock {
    block: OnlineHeapBlock,
    frame_fence: u64,
}

impl FrameFenced for ReleasedBlock {
    fn frame_fence(&self) -> u64 {
        self.frame_fence
    }
}

#[derive(Debug)]
struct OnlineDescriptorManagerInner {
    free_blocks: VecDeque<OnlineHeapBlock>,
    released: FrameFencedQueue<ReleasedBlock>,
}

/// The global shader-visible heap of one type, split into [`OnlineHeapBlock`]s that contexts
/// borrow through a [`SubAllocatedOnlineHeap`].
///
/// A released block goes back to the free queue only after [`Self::cleanup()`] saw its fence
/// complete, so a block is never handed out while the device still reads it.
#[derive(Debug)]
pub struct OnlineDescriptorManager {
    heap: DescriptorHeapHandle,
    block_size: u32,
    timeline: Arc<dyn FenceTimeline>,
    inner: Mutex<OnlineDescriptorManagerInner>,
}

impl OnlineDescriptorManager {
    pub fn new(
        name: &str,
        heap_type: DescriptorHeapType,
        block_size: u32,
        num_blocks: u32,
        backend: &dyn DeviceBackend,
        timeline: Arc<dyn FenceTimeline>,
    ) -> Result<Self> {
        let num_descriptors = block_size
            .checked_mul(num_blocks)
            .filter(|&num_descriptors| num_descriptors > 0)
            .ok_or_else(|| {
                AllocationError::InvalidAllocatorCreateDesc(format!(
                    "Online heap `{}` can't hold {} blocks of {} descriptors",
                    name, num_blocks, block_size
                ))
            })?;

        let heap = backend.create_descriptor_heap(&DescriptorHeapDesc {
            name,
            heap_type,
            num_descriptors,
            shader_visible: true,
        })?;

        let free_blocks = (0..num_blocks)
            .map(|index| OnlineHeapBlock {
                first_slot: index * block_size,
                size: block_size,
            })
            .collect();

        Ok(Self {
            heap,
            block_size,
            timeline,
            inner: Mutex::new(OnlineDescriptorManagerInner {
                free_blocks,
                released: FrameFencedQueue::default(),
            }),
        })
    }

    pub fn heap(&self) -> &DescriptorHeapHandle {
        &self.heap
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn allocate_heap_block(&self) -> Option<OnlineHeapBlock> {
        self.inner.lock().free_blocks.pop_front()
    }

    /// Returns `block` once the current submission completed.
    pub fn free_heap_block(&self, block: OnlineHeapBlock) {
        let frame_fence = self.timeline.current_submission_fence();
        self.inner
            .lock()
            .released
            .push(ReleasedBlock { block, frame_fence });
    }

    /// Makes blocks released at least `frame_lag` submissions ago available again.
    pub fn cleanup(&self, frame_lag: u64) -> usize {
        let completed_fence = self.timeline.completed_fence();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let free_blocks = &mut inner.free_blocks;
        inner
            .released
            .drain_ready(completed_fence, frame_lag, |released| {
                free_blocks.push_back(released.block)
            })
    }

    pub fn free_block_count(&self) -> usize {
        self.inner.lock().free_blocks.len()
    }
}

/// Per-context view of the global online heap: bump-reserves inside a borrowed block and
/// swaps it for a fresh one when full.
#[derive(Debug)]
pub struct SubAllocatedOnlineHeap {
    manager: Arc<OnlineDescriptorManager>,
    block: OnlineHeapBlock,
    next_slot: u32,
}

impl SubAllocatedOnlineHeap {
    /// Fails with [`AllocationError::HeapExhausted`] when the manager has no free block.
    pub fn new(manager: Arc<OnlineDescriptorManager>) -> Result<Self> {
        let block = manager
            .allocate_heap_block()
            .ok_or(AllocationError::HeapExhausted)?;
        Ok(Self {
            manager,
            block,
            next_slot: 0,
        })
    }

    pub fn block(&self) -> OnlineHeapBlock {
        self.block
    }
}

impl OnlineHeap for SubAllocatedOnlineHeap {
    fn heap(&self) -> &DescriptorHeapHandle {
        self.manager.heap()
    }

    fn capacity(&self) -> u32 {
        self.block.size
    }

    fn next_slot(&self) -> u32 {
        self.next_slot
    }

    fn set_next_slot(&mut self, next_slot: u32) {
        self.next_slot = next_slot;
    }

    fn first_slot(&self) -> u32 {
        self.block.first_slot
    }

    /// Keeps the current block when the manager has nothing to give.
    fn roll_over(&mut self) -> Result<HeapRollOver> {
        let block = self
            .manager
            .allocate_heap_block()
            .ok_or(AllocationError::HeapExhausted)?;
        let retired = std::mem::replace(&mut self.block, block);
        self.manager.free_heap_block(retired);
        self.next_slot = 0;
        Ok(HeapRollOver::SameHeap)
    }
}

impl Drop for SubAllocatedOnlineHeap {
    fn drop(&mut self) {
        self.manager.free_heap_block(self.block);
    }
}

#[derive(Debug)]
struct RetiredHeap {
    heap: DescriptorHeapHandle,
    frame_fence: u64,
}

impl FrameFenced for RetiredHeap {
    fn frame_fence(&self) -> u64 {
        self.frame_fence
    }
}

/// A context-private shader-visible heap.
///
/// Rolling over retires the heap with the current submission fence and continues in the oldest
/// retired heap the device is done with, or in a brand-new heap if there is none.
#[derive(Debug)]
pub struct LocalOnlineHeap {
    name: String,
    heap_type: DescriptorHeapType,
    num_descriptors: u32,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    heap: DescriptorHeapHandle,
    next_slot: u32,
    reclaim: FrameFencedQueue<RetiredHeap>,
    heaps_created: usize,
}

impl LocalOnlineHeap {
    pub fn new(
        name: &str,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
    ) -> Result<Self> {
        if num_descriptors == 0 {
            return Err(AllocationError::InvalidAllocatorCreateDesc(format!(
                "Local online heap `{}` must hold at least one descriptor",
                name
            )));
        }

        let heap = Self::create_heap(backend.as_ref(), name, heap_type, num_descriptors)?;
        Ok(Self {
            name: name.to_owned(),
            heap_type,
            num_descriptors,
            backend,
            timeline,
            heap,
            next_slot: 0,
            reclaim: FrameFencedQueue::default(),
            heaps_created: 1,
        })
    }

    fn create_heap(
        backend: &dyn DeviceBackend,
        name: &str,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<DescriptorHeapHandle> {
        backend.create_descriptor_heap(&DescriptorHeapDesc {
            name,
            heap_type,
            num_descriptors,
            shader_visible: true,
        })
    }

    pub fn heaps_created(&self) -> usize {
        self.heaps_created
    }

    pub fn retired_heap_count(&self) -> usize {
        self.reclaim.len()
    }
}

impl OnlineHeap for LocalOnlineHeap {
    fn heap(&self) -> &DescriptorHeapHandle {
        &self.heap
    }

    fn capacity(&self) -> u32 {
        self.num_descriptors
    }

    fn next_slot(&self) -> u32 {
        self.next_slot
    }

    fn set_next_slot(&mut self, next_slot: u32) {
        self.next_slot = next_slot;
    }

    fn roll_over(&mut self) -> Result<HeapRollOver> {
        let completed_fence = self.timeline.completed_fence();
        let heap = match self.reclaim.pop_ready(completed_fence, 0) {
            Some(retired) => {
                debug!("Local online heap `{}` reuses a retired heap", self.name);
                retired.heap
            }
            None => {
                warn!(
                    "Local online heap `{}` is out of {:?} descriptors, creating heap #{}. \
                     Consider a larger heap.",
                    self.name,
                    self.heap_type,
                    self.heaps_created + 1
                );
                let heap = Self::create_heap(
                    self.backend.as_ref(),
                    &self.name,
                    self.heap_type,
                    self.num_descriptors,
                )?;
                self.heaps_created += 1;
                heap
            }
        };

        let retired = std::mem::replace(&mut self.heap, heap);
        self.reclaim.push(RetiredHeap {
            heap: retired,
            frame_fence: self.timeline.current_submission_fence(),
        });
        self.next_slot = 0;
        Ok(HeapRollOver::HeapChanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::fence::ManualFenceTimeline;

    #[test]
    fn reservation_advances_by_exactly_the_count() {
        let backend = Arc::new(HostBackend::new());
        let mut heap = LocalOnlineHeap::new(
            "context",
            DescriptorHeapType::Standard,
            8,
            backend,
            Arc::new(ManualFenceTimeline::new()),
        )
        .unwrap();

        assert_eq!(heap.reserve_slots(3), 0);
        assert_eq!(heap.next_slot(), 3);
        assert_eq!(heap.reserve_slots(5), 3);
        assert_eq!(heap.next_slot(), 8);
        assert!(!heap.can_reserve_slots(1));
        assert!(heap.can_reserve_slots(0));
    }

    #[test]
    fn local_heap_reuses_retired_heaps_after_their_fence() {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(HostBackend::new());
        let timeline = Arc::new(ManualFenceTimeline::new());
        let mut heap = LocalOnlineHeap::new(
            "context",
            DescriptorHeapType::Standard,
            4,
            backend.clone(),
            timeline.clone(),
        )
        .unwrap();
        let first = heap.heap().clone();

        heap.reserve_slots(4);
        assert_eq!(heap.roll_over().unwrap(), HeapRollOver::HeapChanged);
        assert_eq!(heap.heaps_created(), 2);
        assert_eq!(heap.next_slot(), 0);
        assert!(!heap.heap().same_heap(&first));

        timeline.submit_and_signal();
        heap.reserve_slots(4);
        assert_eq!(heap.roll_over().unwrap(), HeapRollOver::HeapChanged);
        assert_eq!(heap.heaps_created(), 2);
        assert!(heap.heap().same_heap(&first));
        assert_eq!(backend.descriptor_heaps_created(), 2);
    }

    #[test]
    fn sub_allocated_heap_swaps_blocks() {
        let timeline = Arc::new(ManualFenceTimeline::new());
        let manager = Arc::new(
            OnlineDescriptorManager::new(
                "global views",
                DescriptorHeapType::Standard,
                4,
                2,
                &HostBackend::new(),
                timeline.clone(),
            )
            .unwrap(),
        );

        let mut heap = SubAllocatedOnlineHeap::new(manager.clone()).unwrap();
        let slot = heap.reserve_slots(4);
        let first_handle = heap.gpu_slot_handle(slot);

        assert_eq!(heap.roll_over().unwrap(), HeapRollOver::SameHeap);
        assert_eq!(heap.block().first_slot, 4);
        assert_eq!(
            heap.gpu_slot_handle(0).ptr - first_handle.ptr,
            4 * u64::from(HostBackend::DESCRIPTOR_SIZE)
        );

        // The first block is still fenced.
        heap.reserve_slots(4);
        assert!(matches!(
            heap.roll_over(),
            Err(AllocationError::HeapExhausted)
        ));
        assert_eq!(heap.block().first_slot, 4);

        timeline.submit_and_signal();
        assert_eq!(manager.cleanup(0), 1);
        assert_eq!(heap.roll_over().unwrap(), HeapRollOver::SameHeap);
        assert_eq!(heap.block().first_slot, 0);

        drop(heap);
        assert_eq!(manager.free_block_count(), 0);
        timeline.submit_and_signal();
        manager.cleanup(0);
        assert_eq!(manager.free_block_count(), 2);
    }
}
