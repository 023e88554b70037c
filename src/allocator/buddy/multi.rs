use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, warn, Level};
use parking_lot::RwLock;

use super::{BuddyAllocation, BuddyAllocator, MAX_BUDDY_ADDRESS_BITS};
use crate::allocator::{
    fmt_allocation_breakdown, AllocationReport, AllocatorReport, MemoryBlockReport,
};
use crate::backend::{DeviceBackend, HeapCategory, HeapCreateDesc, ResourceDesc, ResourceFlags};
use crate::deferred::{FrameFenced, FrameFencedQueue};
use crate::fence::FenceTimeline;
use crate::resource::{
    AllocatorPrivateData, BuddyAllocatorPrivateData, Owner, ResourceHolder, ResourceLocation,
    ResourceStateMode,
};
use crate::{capture_backtrace, AllocationError, AllocatorDebugSettings, HeapKind, Result};

const BUDDY_HEAP_ALIGNMENT: u64 = 64 * 1024;

#[derive(Clone, Debug)]
pub struct BuddyAllocatorDesc<'a> {
    pub name: &'a str,
    pub heap_kind: HeapKind,
    /// Smallest block handed out. Must be a power of two.
    pub min_block_size: u64,
    /// Each buddy buffer spans `min_block_size << max_order` bytes, unless a single request
    /// needs more.
    pub max_order: u32,
    pub resource_flags: ResourceFlags,
    pub state_mode: ResourceStateMode,
}

impl Default for BuddyAllocatorDesc<'_> {
    fn default() -> Self {
        Self {
            name: "Buddy allocator",
            heap_kind: HeapKind::CpuToGpu,
            min_block_size: 256,
            max_order: 14,
            resource_flags: ResourceFlags::empty(),
            state_mode: ResourceStateMode::Default,
        }
    }
}

/// A block waiting for the device to finish with it.
#[derive(Clone, Copy, Debug)]
pub struct RetiredBlock {
    pub frame_fence: u64,
    pub data: BuddyAllocatorPrivateData,
}

impl FrameFenced for RetiredBlock {
    fn frame_fence(&self) -> u64 {
        self.frame_fence
    }
}

#[derive(Debug)]
struct LiveAllocation {
    name: String,
    size: u64,
    backtrace: Arc<Backtrace>,
}

struct BuddyBlock {
    allocator: BuddyAllocator,
    resource: Arc<ResourceHolder>,
    /// Keyed by offset.
    allocations: BTreeMap<u64, LiveAllocation>,
    last_used_frame_fence: u64,
}

struct MultiBuddyAllocatorInner {
    blocks: Vec<Option<BuddyBlock>>,
    retired: FrameFencedQueue<RetiredBlock>,
    active_blocks: usize,
}

/// A growable list of [`BuddyAllocator`]s, each backed by one buffer placed in its own heap.
///
/// Requests are routed to the first buffer with a free block of the right order. Frees are
/// deferred in the same way as [`crate::PoolAllocator`] does it.
pub struct MultiBuddyAllocator {
    name: String,
    heap_kind: HeapKind,
    min_block_size: u64,
    max_order: u32,
    resource_flags: ResourceFlags,
    state_mode: ResourceStateMode,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    debug_settings: AllocatorDebugSettings,
    inner: RwLock<MultiBuddyAllocatorInner>,
}

impl MultiBuddyAllocator {
    pub fn new(
        desc: &BuddyAllocatorDesc<'_>,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
        debug_settings: AllocatorDebugSettings,
    ) -> Result<Self> {
        if !desc.min_block_size.is_power_of_two() {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "BuddyAllocatorDesc field `min_block_size` must be a power of two.".into(),
            ));
        }
        if desc.min_block_size.trailing_zeros() + desc.max_order >= MAX_BUDDY_ADDRESS_BITS {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "BuddyAllocatorDesc field `max_order` is too large.".into(),
            ));
        }

        if debug_settings.log_memory_information {
            debug!(
                "Buddy allocator `{}`: {:?}, min block: {}, max order: {}",
                desc.name, desc.heap_kind, desc.min_block_size, desc.max_order
            );
        }

        Ok(Self {
            name: desc.name.to_owned(),
            heap_kind: desc.heap_kind,
            min_block_size: desc.min_block_size,
            max_order: desc.max_order,
            resource_flags: desc.resource_flags,
            state_mode: desc.state_mode,
            backend,
            timeline,
            debug_settings,
            inner: RwLock::new(MultiBuddyAllocatorInner {
                blocks: Vec::default(),
                retired: FrameFencedQueue::default(),
                active_blocks: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.heap_kind
    }

    pub fn min_block_size(&self) -> u64 {
        self.min_block_size
    }

    /// Size of a regular buddy buffer.
    pub fn block_size(&self) -> u64 {
        self.min_block_size << self.max_order
    }

    pub fn is_owner(&self, location: &ResourceLocation) -> bool {
        matches!(location.owner(), Some(Owner::Buddy(allocator)) if std::ptr::eq(Arc::as_ptr(allocator), self))
    }

    /// Allocates a power-of-two block of at least `size` bytes aligned to `alignment`.
    ///
    /// Creates a new buddy buffer when none of the existing ones has room. Whatever `location`
    /// held before is released first.
    pub fn try_allocate(
        self: &Arc<Self>,
        name: &str,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation,
    ) -> Result<()> {
        location.clear();

        if self.debug_settings.log_allocations {
            debug!(
                "Allocating `{}` of {} bytes with an alignment of {} from `{}`.",
                name, size, alignment, self.name
            );
            if self.debug_settings.log_stack_traces {
                let backtrace = Backtrace::force_capture();
                debug!("Allocation stack trace: {}", backtrace);
            }
        }

        if size == 0 || !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        let backtrace = capture_backtrace(self.debug_settings.store_stack_traces);
        let frame_fence = self.timeline.current_submission_fence();

        let (resource, allocator_index, allocation) = {
            let mut inner = self.inner.write();
            let (allocator_index, allocation) =
                self.allocate_from_blocks(&mut inner, size, alignment)?;

            let block = inner.blocks[allocator_index].as_mut().ok_or_else(|| {
                AllocationError::Internal("Buddy block must be Some.".into())
            })?;
            block.last_used_frame_fence = frame_fence;
            block.allocations.insert(
                allocation.offset,
                LiveAllocation {
                    name: name.to_owned(),
                    size,
                    backtrace,
                },
            );
            (block.resource.clone(), allocator_index, allocation)
        };

        location.init_sub_allocation(
            Owner::Buddy(self.clone()),
            resource,
            allocation.offset,
            size,
            AllocatorPrivateData::Buddy(BuddyAllocatorPrivateData {
                allocator_index: allocator_index as u32,
                offset: allocation.offset,
                order: allocation.order,
            }),
        );

        Ok(())
    }

    fn allocate_from_blocks(
        &self,
        inner: &mut MultiBuddyAllocatorInner,
        size: u64,
        alignment: u64,
    ) -> Result<(usize, BuddyAllocation)> {
        let mut empty_slot = None;
        for (index, block) in inner.blocks.iter_mut().enumerate() {
            match block {
                Some(block) => {
                    if let Some(allocation) = block.allocator.try_allocate(size, alignment) {
                        return Ok((index, allocation));
                    }
                }
                None if empty_slot.is_none() => empty_slot = Some(index),
                None => {}
            }
        }

        let index = empty_slot.unwrap_or(inner.blocks.len());
        let mut block = self.create_block(index, size, alignment)?;
        let allocation = block
            .allocator
            .try_allocate(size, alignment)
            .ok_or_else(|| {
                AllocationError::Internal(
                    "Allocation that must succeed failed. This is a bug in the allocator.".into(),
                )
            })?;

        if index == inner.blocks.len() {
            inner.blocks.push(Some(block));
        } else {
            inner.blocks[index] = Some(block);
        }
        inner.active_blocks += 1;

        Ok((index, allocation))
    }

    fn create_block(&self, index: usize, size: u64, alignment: u64) -> Result<BuddyBlock> {
        let unit = BuddyAllocator::new(self.min_block_size, 0);
        let max_order = self.max_order.max(unit.order_for_size(size, alignment));
        if self.min_block_size.trailing_zeros() + max_order >= MAX_BUDDY_ADDRESS_BITS {
            return Err(AllocationError::OutOfMemory);
        }
        let allocator = BuddyAllocator::new(self.min_block_size, max_order);
        let block_size = allocator.size();

        let name = format!("{} block {}", self.name, index);
        let heap = self.backend.create_heap(&HeapCreateDesc {
            name: &name,
            size: block_size,
            kind: self.heap_kind,
            alignment: BUDDY_HEAP_ALIGNMENT,
            category: HeapCategory::Buffer,
        })?;
        let desc = ResourceDesc::buffer(&name, block_size).with_flags(self.resource_flags);
        let resource = self.backend.create_placed_resource(&heap, 0, &desc)?;

        debug!(
            "Buddy allocator `{}` created block {} of {} bytes",
            self.name, index, block_size
        );

        Ok(BuddyBlock {
            allocator,
            resource: Arc::new(ResourceHolder::new(
                resource,
                Some(heap),
                self.heap_kind,
                &desc,
                self.state_mode,
            )),
            allocations: BTreeMap::new(),
            last_used_frame_fence: 0,
        })
    }

    /// Releases `location`, which must have been allocated from this allocator.
    pub fn deallocate(&self, location: &mut ResourceLocation) {
        assert!(
            !location.is_valid() || location.owner().is_none() || self.is_owner(location),
            "Deallocating a location owned by another allocator"
        );
        location.clear();
    }

    /// Retires the block of `location` with the current submission fence.
    pub(crate) fn defer_deallocation(&self, location: &ResourceLocation) {
        let Some(data) = location.buddy_private_data().copied() else {
            error!(
                "Buddy allocator `{}` asked to free a location without buddy data",
                self.name
            );
            return;
        };

        if self.debug_settings.log_frees {
            let name = location
                .resource()
                .map(|resource| resource.name())
                .unwrap_or("<null>");
            debug!("Freeing block of `{}` from `{}`.", name, self.name);
            if self.debug_settings.log_stack_traces {
                let backtrace = Backtrace::force_capture();
                debug!("Free stack trace: {}", backtrace);
            }
        }

        let frame_fence = self.timeline.current_submission_fence();
        self.inner.write().retired.push(RetiredBlock { frame_fence, data });
    }

    /// Frees every retired block whose fence is at least `frame_lag` submissions old, then
    /// releases empty buddy buffers that haven't been used for as long.
    pub fn cleanup_allocations(&self, frame_lag: u64) {
        let completed_fence = self.timeline.completed_fence();

        let mut inner = self.inner.write();
        let inner = &mut *inner;

        let blocks = &mut inner.blocks;
        let name = &self.name;
        inner
            .retired
            .drain_ready(completed_fence, frame_lag, |retired| {
                free_retired(blocks, name, retired.data);
            });

        for slot in inner.blocks.iter_mut() {
            if inner.active_blocks <= 1 {
                break;
            }

            let idle = matches!(
                slot,
                Some(block) if block.allocator.is_empty()
                    && block.last_used_frame_fence.saturating_add(frame_lag) <= completed_fence
            );
            if idle {
                slot.take();
                inner.active_blocks -= 1;
                debug!("Buddy allocator `{}` released an idle block", self.name);
            }
        }
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().active_blocks
    }

    pub fn retired_count(&self) -> usize {
        self.inner.read().retired.len()
    }

    /// Bytes held by live and retired blocks, after power-of-two rounding.
    pub fn used_size(&self) -> u64 {
        self.inner
            .read()
            .blocks
            .iter()
            .flatten()
            .map(|block| block.allocator.allocated_size())
            .sum()
    }

    pub fn generate_report(&self) -> AllocatorReport {
        let mut allocations = vec![];
        let mut blocks = vec![];
        let mut total_capacity_bytes = 0;

        let inner = self.inner.read();
        for block in inner.blocks.iter().flatten() {
            let size = block.allocator.size();
            total_capacity_bytes += size;
            let first_allocation = allocations.len();
            allocations.extend(block.allocations.iter().map(|(offset, live)| {
                AllocationReport {
                    name: live.name.clone(),
                    offset: *offset,
                    size: live.size,
                    backtrace: live.backtrace.clone(),
                }
            }));
            blocks.push(MemoryBlockReport {
                size,
                allocations: first_allocation..allocations.len(),
            });
        }

        let total_allocated_bytes = allocations.iter().map(|report| report.size).sum();

        AllocatorReport {
            allocations,
            blocks,
            total_allocated_bytes,
            total_capacity_bytes,
        }
    }

    pub fn report_memory_leaks(&self, log_level: Level) {
        let inner = self.inner.read();
        for (block_index, block) in inner.blocks.iter().enumerate() {
            let Some(block) = block else { continue };
            for (offset, live) in &block.allocations {
                log::log!(
                    log_level,
                    r#"leak detected: {{
    allocator: "{}",
    block: {},
    offset: 0x{:x},
    size: 0x{:x},
    name: "{}",
    backtrace: {}
}}"#,
                    self.name,
                    block_index,
                    offset,
                    live.size,
                    live.name,
                    live.backtrace
                );
            }
        }
    }
}

fn free_retired(blocks: &mut [Option<BuddyBlock>], name: &str, data: BuddyAllocatorPrivateData) {
    let Some(Some(block)) = blocks.get_mut(data.allocator_index as usize) else {
        error!(
            "Buddy allocator `{}` lost block {}",
            name, data.allocator_index
        );
        return;
    };

    if block.allocations.remove(&data.offset).is_none() {
        warn!(
            "Buddy allocator `{}` freed unknown offset 0x{:x}",
            name, data.offset
        );
    }
    block.allocator.deallocate(BuddyAllocation {
        offset: data.offset,
        order: data.order,
    });
}

impl fmt::Debug for MultiBuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_allocation_breakdown(f, &self.name, &self.generate_report())
    }
}

impl Drop for MultiBuddyAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let blocks = &mut inner.blocks;
        let name = &self.name;
        inner.retired.drain_ready(u64::MAX, 0, |retired| {
            free_retired(blocks, name, retired.data);
        });

        if self.debug_settings.log_leaks_on_shutdown {
            self.report_memory_leaks(Level::Warn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::fence::ManualFenceTimeline;
    use crate::resource::LocationKind;

    fn setup(
        max_order: u32,
    ) -> (
        Arc<HostBackend>,
        Arc<ManualFenceTimeline>,
        Arc<MultiBuddyAllocator>,
    ) {
        let backend = Arc::new(HostBackend::new());
        let timeline = Arc::new(ManualFenceTimeline::new());
        let allocator = MultiBuddyAllocator::new(
            &BuddyAllocatorDesc {
                name: "upload buddy",
                max_order,
                ..Default::default()
            },
            backend.clone(),
            timeline.clone(),
            AllocatorDebugSettings::default(),
        )
        .unwrap();
        (backend, timeline, Arc::new(allocator))
    }

    fn allocate(allocator: &Arc<MultiBuddyAllocator>, size: u64) -> ResourceLocation {
        let mut location = ResourceLocation::new();
        allocator
            .try_allocate("constants", size, 256, &mut location)
            .unwrap();
        location
    }

    #[test]
    fn allocations_are_rounded_to_power_of_two_blocks() {
        let (_backend, _timeline, allocator) = setup(10);

        let location = allocate(&allocator, 1000);
        let data = *location.buddy_private_data().unwrap();
        assert_eq!(location.kind(), LocationKind::SubAllocation);
        assert_eq!(data.order, 2);
        assert_eq!(location.size(), 1000);
        assert_eq!(allocator.used_size(), 1024);
        assert!(allocator.is_owner(&location));
    }

    #[test]
    fn retired_blocks_wait_for_the_fence() {
        let (_backend, timeline, allocator) = setup(4);

        let mut location = allocate(&allocator, 256);
        location.clear();
        assert_eq!(allocator.retired_count(), 1);

        allocator.cleanup_allocations(0);
        assert_eq!(allocator.used_size(), 256);

        timeline.submit_and_signal();
        allocator.cleanup_allocations(0);
        assert_eq!(allocator.retired_count(), 0);
        assert_eq!(allocator.used_size(), 0);
    }

    #[test]
    fn full_buffers_grow_and_idle_buffers_are_released() {
        let (backend, timeline, allocator) = setup(2);

        let locations = (0..3).map(|_| allocate(&allocator, 1024)).collect::<Vec<_>>();
        assert_eq!(allocator.block_count(), 3);
        assert_eq!(backend.heaps_created(), 3);
        assert_eq!(locations[2].buddy_private_data().unwrap().allocator_index, 2);

        drop(locations);
        timeline.submit_and_signal();
        allocator.cleanup_allocations(0);
        assert_eq!(allocator.block_count(), 1);
    }

    #[test]
    fn oversized_requests_get_a_larger_buffer() {
        let (_backend, _timeline, allocator) = setup(2);

        let location = allocate(&allocator, 4096);
        let report = allocator.generate_report();
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].size, 4096);
        assert_eq!(report.allocations[0].name, "constants");
        assert_eq!(location.offset_from_base_of_resource(), 0);
    }

    #[test]
    fn mapped_pointers_follow_block_offsets() {
        let (_backend, _timeline, allocator) = setup(4);

        let a = allocate(&allocator, 256);
        let b = allocate(&allocator, 256);
        let a_ptr = a.mapped_ptr().unwrap().as_ptr() as usize;
        let b_ptr = b.mapped_ptr().unwrap().as_ptr() as usize;
        assert_eq!(b_ptr - a_ptr, 256);
        assert_eq!(b.gpu_address() - a.gpu_address(), 256);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let result = MultiBuddyAllocator::new(
            &BuddyAllocatorDesc {
                min_block_size: 300,
                ..Default::default()
            },
            Arc::new(HostBackend::new()),
            Arc::new(ManualFenceTimeline::new()),
            AllocatorDebugSettings::default(),
        );
        assert!(matches!(
            result,
            Err(AllocationError::InvalidAllocatorCreateDesc(_))
        ));
    }

    #[test]
    fn requests_beyond_the_address_range_fail_cleanly() {
        let (backend, _timeline, allocator) = setup(4);

        let mut location = ResourceLocation::new();
        for size in [(1 << 63) + 1, u64::MAX, 1 << 48] {
            assert!(matches!(
                allocator.try_allocate("huge", size, 256, &mut location),
                Err(AllocationError::OutOfMemory)
            ));
            assert_eq!(location.kind(), LocationKind::Undefined);
        }
        assert_eq!(allocator.block_count(), 0);
        assert_eq!(backend.heaps_created(), 0);
    }
}
