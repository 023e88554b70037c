#![deny(clippy::unimplemented, clippy::unwrap_used, clippy::ok_expect)]
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, Level};
use parking_lot::RwLock;

mod defrag;
pub use defrag::{DefragPolicy, NoDefrag, PoolStats};

mod memory_pool;
pub use memory_pool::{MemoryPool, PoolAllocation};

use super::{
    fmt_allocation_breakdown, AllocationReport, AllocationStrategy, AllocatorReport,
    MemoryBlockReport, ResourceAllocatorInitConfig,
};
use crate::backend::{
    BufferAccess, DeviceBackend, HeapCreateDesc, HeapHandle, ResourceDesc, ResourceFlags,
};
use crate::deferred::{FrameFencedAllocationData, FrameFencedOperation, FrameFencedQueue};
use crate::fence::FenceTimeline;
use crate::math::align_up;
use crate::resource::{
    AllocatorPrivateData, Owner, PoolAllocatorPrivateData, ResourceHolder, ResourceLocation,
    ResourceStateMode,
};
use crate::{
    capture_backtrace, AllocationError, AllocationSizes, AllocatorDebugSettings, HeapKind, Result,
};

/// Placement alignment of heaps backing pools.
const POOL_HEAP_ALIGNMENT: u64 = 64 * 1024;

/// Order of the free list inside each [`MemoryPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FreeListOrder {
    /// Ascending by block size: the first fit is the best fit.
    #[default]
    SortBySize,
    /// Ascending by offset: first fit, keeping allocations packed at the front of the pool.
    SortByOffset,
}

#[derive(Clone, Debug)]
pub struct PoolAllocatorDesc<'a> {
    /// Name of the allocator, used for its heaps and in logs and reports
    pub name: &'a str,
    /// Which requests this allocator serves, see [`PoolAllocator::supports_allocation()`].
    pub init_config: ResourceAllocatorInitConfig,
    pub state_mode: ResourceStateMode,
    pub strategy: AllocationStrategy,
    pub order: FreeListOrder,
    /// Size of every pool; larger pools are only created for requests that don't fit.
    pub pool_size: u64,
    /// Granularity of pool blocks. Must be a power of two.
    pub pool_alignment: u64,
    /// Larger requests get a standalone resource instead of a pool block.
    pub max_allocation_size: u64,
}

impl Default for PoolAllocatorDesc<'_> {
    fn default() -> Self {
        let sizes = AllocationSizes::default();
        Self {
            name: "Pool allocator",
            init_config: ResourceAllocatorInitConfig::new(
                HeapKind::GpuOnly,
                ResourceFlags::empty(),
                BufferAccess::empty(),
            ),
            state_mode: ResourceStateMode::Default,
            strategy: AllocationStrategy::ManualSubAllocation,
            order: FreeListOrder::SortBySize,
            pool_size: sizes.device_pool_size,
            pool_alignment: sizes.pool_alignment,
            max_allocation_size: sizes.max_pooled_allocation_size,
        }
    }
}

struct Pool {
    memory: MemoryPool,
    heap: HeapHandle,
    /// Buffer spanning the whole heap, for [`AllocationStrategy::ManualSubAllocation`].
    backing: Option<Arc<ResourceHolder>>,
}

#[derive(Debug)]
struct PendingOperation {
    pool_index: u32,
    node: u32,
    /// Keeps a placed resource alive until the device is done with it.
    _resource: Option<Arc<ResourceHolder>>,
}

struct PoolAllocatorInner {
    pools: Vec<Option<Pool>>,
    frame_fenced_operations: FrameFencedQueue<FrameFencedAllocationData<PendingOperation>>,
    active_pools: usize,
}

/// A growable set of [`MemoryPool`]s serving one kind of request.
///
/// Requests go to the first pool with room, in pool order; a new pool is created when none has.
/// Frees are deferred: [`ResourceLocation::clear()`] only queues the block together with the
/// current submission fence and [`PoolAllocator::cleanup_allocations()`] returns it to its pool
/// once the device finished with it.
pub struct PoolAllocator {
    name: String,
    init_config: ResourceAllocatorInitConfig,
    state_mode: ResourceStateMode,
    strategy: AllocationStrategy,
    order: FreeListOrder,
    pool_size: u64,
    pool_alignment: u64,
    max_allocation_size: u64,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    debug_settings: AllocatorDebugSettings,
    defrag_policy: Box<dyn DefragPolicy>,
    inner: RwLock<PoolAllocatorInner>,
}

impl PoolAllocator {
    pub fn new(
        desc: &PoolAllocatorDesc<'_>,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
        debug_settings: AllocatorDebugSettings,
    ) -> Result<Self> {
        if !desc.pool_alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "PoolAllocatorDesc field `pool_alignment` must be a power of two.".into(),
            ));
        }
        if desc.pool_size < desc.pool_alignment {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "PoolAllocatorDesc field `pool_size` is smaller than `pool_alignment`.".into(),
            ));
        }
        if desc.max_allocation_size > desc.pool_size {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "PoolAllocatorDesc field `max_allocation_size` exceeds `pool_size`.".into(),
            ));
        }

        if debug_settings.log_memory_information {
            debug!(
                "Pool allocator `{}`: {:?}, {:?}, pool size: {}, alignment: {}, max allocation: {}",
                desc.name,
                desc.init_config,
                desc.strategy,
                desc.pool_size,
                desc.pool_alignment,
                desc.max_allocation_size
            );
        }

        Ok(Self {
            name: desc.name.to_owned(),
            init_config: desc.init_config,
            state_mode: desc.state_mode,
            strategy: desc.strategy,
            order: desc.order,
            pool_size: desc.pool_size,
            pool_alignment: desc.pool_alignment,
            max_allocation_size: desc.max_allocation_size,
            backend,
            timeline,
            debug_settings,
            defrag_policy: Box::new(NoDefrag),
            inner: RwLock::new(PoolAllocatorInner {
                pools: Vec::default(),
                frame_fenced_operations: FrameFencedQueue::default(),
                active_pools: 0,
            }),
        })
    }

    pub fn with_defrag_policy(mut self, policy: Box<dyn DefragPolicy>) -> Self {
        self.defrag_policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.init_config.heap_kind
    }

    pub fn init_config(&self) -> ResourceAllocatorInitConfig {
        self.init_config
    }

    pub fn state_mode(&self) -> ResourceStateMode {
        self.state_mode
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn max_allocation_size(&self) -> u64 {
        self.max_allocation_size
    }

    /// Whether requests with this configuration belong to this allocator.
    ///
    /// Only reads configuration that is fixed at creation, so it never blocks.
    pub fn supports_allocation(
        &self,
        heap_kind: HeapKind,
        resource_flags: ResourceFlags,
        buffer_access: BufferAccess,
        state_mode: ResourceStateMode,
    ) -> bool {
        let init_config = ResourceAllocatorInitConfig::new(heap_kind, resource_flags, buffer_access);
        self.init_config == init_config && self.state_mode == state_mode
    }

    pub fn is_owner(&self, location: &ResourceLocation) -> bool {
        matches!(location.owner(), Some(Owner::Pool(allocator)) if std::ptr::eq(Arc::as_ptr(allocator), self))
    }

    /// Allocates `desc.size` bytes aligned to `alignment`.
    ///
    /// Requests above the configured maximum get a standalone resource. Whatever `location` held
    /// before is released first.
    pub fn allocate_resource(
        self: &Arc<Self>,
        desc: &ResourceDesc<'_>,
        alignment: u64,
        location: &mut ResourceLocation,
    ) -> Result<()> {
        location.clear();

        if self.debug_settings.log_allocations {
            debug!(
                "Allocating `{}` of {} bytes with an alignment of {} from `{}`.",
                desc.name, desc.size, alignment, self.name
            );
            if self.debug_settings.log_stack_traces {
                let backtrace = Backtrace::force_capture();
                debug!("Allocation stack trace: {}", backtrace);
            }
        }

        if desc.size == 0 || !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        if desc.size > self.max_allocation_size {
            return self.allocate_standalone(desc, location);
        }

        let backtrace = capture_backtrace(self.debug_settings.store_stack_traces);
        let frame_fence = self.timeline.current_submission_fence();

        let (resource, offset_from_base_of_resource, private_data) = {
            let mut inner = self.inner.write();
            let (pool_index, allocation) =
                self.allocate_from_pools(&mut inner, desc, alignment, backtrace)?;

            let pool = inner.pools[pool_index].as_mut().ok_or_else(|| {
                AllocationError::Internal("Pool must be Some.".into())
            })?;
            pool.memory.set_last_used_frame_fence(frame_fence);

            let (resource, offset_from_base_of_resource) = match &pool.backing {
                Some(backing) => (backing.clone(), allocation.offset),
                None => {
                    let resource =
                        self.backend
                            .create_placed_resource(&pool.heap, allocation.offset, desc);
                    match resource {
                        Ok(resource) => (
                            Arc::new(ResourceHolder::new(
                                resource,
                                Some(pool.heap.clone()),
                                self.heap_kind(),
                                desc,
                                self.state_mode,
                            )),
                            0,
                        ),
                        Err(err) => {
                            pool.memory.deallocate(allocation.node);
                            return Err(err);
                        }
                    }
                }
            };

            let private_data = PoolAllocatorPrivateData {
                pool_index: pool_index as u32,
                node: allocation.node,
                offset: allocation.offset,
                size: allocation.size,
                alignment,
            };
            (resource, offset_from_base_of_resource, private_data)
        };

        location.init_sub_allocation(
            Owner::Pool(self.clone()),
            resource,
            offset_from_base_of_resource,
            desc.size,
            AllocatorPrivateData::Pool(private_data),
        );

        Ok(())
    }

    /// [`PoolAllocator::allocate_resource()`] for callers that still carry the raw request
    /// configuration; asserts that it matches this allocator.
    pub fn alloc_default_resource(
        self: &Arc<Self>,
        desc: &ResourceDesc<'_>,
        buffer_access: BufferAccess,
        alignment: u64,
        location: &mut ResourceLocation,
    ) -> Result<()> {
        debug_assert!(
            self.supports_allocation(self.heap_kind(), desc.flags, buffer_access, self.state_mode),
            "Request for `{}` doesn't match pool allocator `{}`",
            desc.name,
            self.name
        );
        self.allocate_resource(desc, alignment, location)
    }

    fn allocate_from_pools(
        &self,
        inner: &mut PoolAllocatorInner,
        desc: &ResourceDesc<'_>,
        alignment: u64,
        backtrace: Arc<Backtrace>,
    ) -> Result<(usize, PoolAllocation)> {
        let mut empty_slot = None;
        for (pool_index, pool) in inner.pools.iter_mut().enumerate() {
            match pool {
                Some(pool) => {
                    if let Some(allocation) =
                        pool.memory
                            .try_allocate(desc.size, alignment, desc.name, backtrace.clone())
                    {
                        return Ok((pool_index, allocation));
                    }
                }
                None if empty_slot.is_none() => empty_slot = Some(pool_index),
                None => {}
            }
        }

        // A fresh pool starts at offset 0, which satisfies any alignment.
        let pool_size = self
            .pool_size
            .max(align_up(desc.size, self.pool_alignment));
        let pool_index = empty_slot.unwrap_or(inner.pools.len());
        let mut pool = self.create_pool(pool_index as u32, pool_size)?;

        let allocation = pool
            .memory
            .try_allocate(desc.size, alignment, desc.name, backtrace)
            .ok_or_else(|| {
                AllocationError::Internal(
                    "Allocation that must succeed failed. This is a bug in the allocator.".into(),
                )
            })?;

        if pool_index == inner.pools.len() {
            inner.pools.push(Some(pool));
        } else {
            inner.pools[pool_index] = Some(pool);
        }
        inner.active_pools += 1;

        Ok((pool_index, allocation))
    }

    fn create_pool(&self, pool_index: u32, pool_size: u64) -> Result<Pool> {
        let name = format!("{} pool {}", self.name, pool_index);
        let heap = self.backend.create_heap(&HeapCreateDesc {
            name: &name,
            size: pool_size,
            kind: self.heap_kind(),
            alignment: POOL_HEAP_ALIGNMENT.max(self.pool_alignment),
            category: self.init_config.heap_category,
        })?;

        let backing = match self.strategy {
            AllocationStrategy::ManualSubAllocation => {
                let desc = ResourceDesc::buffer(&name, pool_size)
                    .with_flags(self.init_config.resource_flags);
                let resource = self.backend.create_placed_resource(&heap, 0, &desc)?;
                Some(Arc::new(ResourceHolder::new(
                    resource,
                    Some(heap.clone()),
                    self.heap_kind(),
                    &desc,
                    self.state_mode,
                )))
            }
            AllocationStrategy::PlacedResource => None,
        };

        debug!(
            "Pool allocator `{}` created pool {} of {} bytes",
            self.name, pool_index, pool_size
        );

        Ok(Pool {
            memory: MemoryPool::new(
                pool_index,
                pool_size,
                self.pool_alignment,
                self.order,
                self.strategy,
            ),
            heap,
            backing,
        })
    }

    fn allocate_standalone(
        &self,
        desc: &ResourceDesc<'_>,
        location: &mut ResourceLocation,
    ) -> Result<()> {
        let resource = self
            .backend
            .create_standalone_resource(self.heap_kind(), desc)?;
        location.init_standalone(Arc::new(ResourceHolder::new(
            resource,
            None,
            self.heap_kind(),
            desc,
            self.state_mode,
        )));
        Ok(())
    }

    /// Releases `location`, which must have been allocated from this allocator.
    pub fn deallocate(&self, location: &mut ResourceLocation) {
        assert!(
            !location.is_valid() || location.owner().is_none() || self.is_owner(location),
            "Deallocating a location owned by another allocator"
        );
        location.clear();
    }

    /// Queues the block of `location` for reclamation once the current submission completed.
    pub(crate) fn defer_deallocation(&self, location: &ResourceLocation) {
        let Some(data) = location.pool_private_data().copied() else {
            error!(
                "Pool allocator `{}` asked to free a location without pool data",
                self.name
            );
            return;
        };

        if self.debug_settings.log_frees {
            let name = location
                .resource()
                .map(|resource| resource.name())
                .unwrap_or("<null>");
            debug!("Freeing `{}` from `{}`.", name, self.name);
            if self.debug_settings.log_stack_traces {
                let backtrace = Backtrace::force_capture();
                debug!("Free stack trace: {}", backtrace);
            }
        }

        let resource = match self.strategy {
            AllocationStrategy::PlacedResource => location.resource().cloned(),
            AllocationStrategy::ManualSubAllocation => None,
        };
        let frame_fence = self.timeline.current_submission_fence();

        let mut inner = self.inner.write();

        // The free supersedes a pending unlock of the same block.
        for pending in inner.frame_fenced_operations.iter_mut() {
            if pending.operation == FrameFencedOperation::Unlock
                && pending.target.pool_index == data.pool_index
                && pending.target.node == data.node
            {
                pending.operation = FrameFencedOperation::Nop;
            }
        }

        inner.frame_fenced_operations.push(FrameFencedAllocationData {
            operation: FrameFencedOperation::Deallocate,
            target: PendingOperation {
                pool_index: data.pool_index,
                node: data.node,
                _resource: resource,
            },
            frame_fence,
        });
    }

    /// Pins the block of `location`; it stays pinned until a deferred unlock executes.
    pub fn lock(&self, location: &ResourceLocation) {
        let Some(data) = location.pool_private_data() else {
            return;
        };
        debug_assert!(self.is_owner(location));

        let mut inner = self.inner.write();
        if let Some(Some(pool)) = inner.pools.get_mut(data.pool_index as usize) {
            pool.memory.lock(data.node);
        }
    }

    /// Unpins the block of `location` once the current submission completed.
    pub fn unlock_deferred(&self, location: &ResourceLocation) {
        let Some(data) = location.pool_private_data().copied() else {
            return;
        };
        debug_assert!(self.is_owner(location));

        let frame_fence = self.timeline.current_submission_fence();
        self.inner
            .write()
            .frame_fenced_operations
            .push(FrameFencedAllocationData {
                operation: FrameFencedOperation::Unlock,
                target: PendingOperation {
                    pool_index: data.pool_index,
                    node: data.node,
                    _resource: None,
                },
                frame_fence,
            });
    }

    pub fn is_locked(&self, location: &ResourceLocation) -> bool {
        let Some(data) = location.pool_private_data() else {
            return false;
        };
        let inner = self.inner.read();
        matches!(
            inner.pools.get(data.pool_index as usize),
            Some(Some(pool)) if pool.memory.is_locked(data.node)
        )
    }

    /// Performs every deferred operation whose fence is at least `frame_lag` submissions old,
    /// then releases empty pools that haven't been used for as long.
    ///
    /// Must be called once per frame.
    pub fn cleanup_allocations(&self, frame_lag: u64) {
        let completed_fence = self.timeline.completed_fence();

        let mut inner = self.inner.write();
        let inner = &mut *inner;

        let pools = &mut inner.pools;
        let name = &self.name;
        inner
            .frame_fenced_operations
            .drain_ready(completed_fence, frame_lag, |pending| {
                let target = &pending.target;
                let Some(Some(pool)) = pools.get_mut(target.pool_index as usize) else {
                    if pending.operation != FrameFencedOperation::Nop {
                        error!("Pool allocator `{}` lost pool {}", name, target.pool_index);
                    }
                    return;
                };

                match pending.operation {
                    FrameFencedOperation::Deallocate => pool.memory.deallocate(target.node),
                    FrameFencedOperation::Unlock => pool.memory.unlock(target.node),
                    FrameFencedOperation::Nop => {}
                }
            });

        for slot in inner.pools.iter_mut() {
            if inner.active_pools <= 1 {
                break;
            }

            let idle = matches!(
                slot,
                Some(pool) if pool.memory.is_empty()
                    && pool.memory.last_used_frame_fence().saturating_add(frame_lag) <= completed_fence
            );
            if idle {
                if let Some(pool) = slot.take() {
                    debug!(
                        "Pool allocator `{}` released pool {}",
                        self.name,
                        pool.memory.pool_index()
                    );
                }
                inner.active_pools -= 1;
            }
        }

        let stats = inner
            .pools
            .iter()
            .flatten()
            .map(|pool| pool.memory.stats())
            .collect::<Vec<_>>();
        self.defrag_policy.defragment(&self.name, &stats);
    }

    pub fn pool_count(&self) -> usize {
        self.inner.read().active_pools
    }

    pub fn pending_operation_count(&self) -> usize {
        self.inner.read().frame_fenced_operations.len()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.inner
            .read()
            .pools
            .iter()
            .flatten()
            .map(|pool| pool.memory.stats())
            .collect()
    }

    /// Bytes held by live and not yet reclaimed pool blocks.
    pub fn used_size(&self) -> u64 {
        self.inner
            .read()
            .pools
            .iter()
            .flatten()
            .map(|pool| pool.memory.used_size())
            .sum()
    }

    pub fn capacity(&self) -> u64 {
        self.inner
            .read()
            .pools
            .iter()
            .flatten()
            .map(|pool| pool.memory.pool_size())
            .sum()
    }

    pub fn generate_report(&self) -> AllocatorReport {
        let mut allocations: Vec<AllocationReport> = vec![];
        let mut blocks = vec![];
        let mut total_capacity_bytes = 0;

        let inner = self.inner.read();
        for pool in inner.pools.iter().flatten() {
            total_capacity_bytes += pool.memory.pool_size();
            let first_allocation = allocations.len();
            allocations.extend(pool.memory.report_allocations());
            blocks.push(MemoryBlockReport {
                size: pool.memory.pool_size(),
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
        for pool in inner.pools.iter().flatten() {
            pool.memory.report_memory_leaks(log_level, &self.name);
        }
    }
}

impl fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_allocation_breakdown(f, &self.name, &self.generate_report())
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        // Locations keep their allocator alive, so whatever is still queued belongs to
        // allocations that are already gone; the device is expected to be idle here.
        let inner = self.inner.get_mut();
        let pools = &mut inner.pools;
        inner
            .frame_fenced_operations
            .drain_ready(u64::MAX, 0, |pending| {
                if pending.operation != FrameFencedOperation::Deallocate {
                    return;
                }
                if let Some(Some(pool)) = pools.get_mut(pending.target.pool_index as usize) {
                    pool.memory.deallocate(pending.target.node);
                }
            });

        if self.debug_settings.log_leaks_on_shutdown {
            self.report_memory_leaks(Level::Warn);
        }
    }
}

#[cfg(test)]
mod tests;
