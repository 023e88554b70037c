use std::cell::RefCell;
use std::sync::Arc;

use log::{debug, Level};
use parking_lot::ReentrantMutex;

use super::{AllocatorReport, FreeListOrder, PoolAllocator, PoolAllocatorDesc};
use crate::backend::{BufferAccess, DeviceBackend, HeapCategory, ResourceDesc, ResourceFlags};
use crate::fence::FenceTimeline;
use crate::resource::{ResourceLocation, ResourceStateMode};
use crate::{AllocationSizes, AllocatorDebugSettings, HeapKind, Result};

/// The part of a request that decides which [`PoolAllocator`] serves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceAllocatorInitConfig {
    pub heap_kind: HeapKind,
    pub heap_category: HeapCategory,
    pub resource_flags: ResourceFlags,
}

impl ResourceAllocatorInitConfig {
    pub fn new(heap_kind: HeapKind, flags: ResourceFlags, buffer_access: BufferAccess) -> Self {
        let mut resource_flags = flags;
        if buffer_access
            .intersects(BufferAccess::UNORDERED_ACCESS | BufferAccess::ACCELERATION_STRUCTURE)
        {
            resource_flags |= ResourceFlags::ALLOW_UNORDERED_ACCESS;
        }

        Self {
            heap_kind,
            heap_category: HeapCategory::Buffer,
            resource_flags,
        }
    }
}

/// Creates one [`PoolAllocator`] per distinct request configuration, on first use.
///
/// The allocator list sits behind a re-entrant lock: growing it happens on the allocation
/// path, while the lock is already held by the same thread.
pub struct ResourceConfigAllocator {
    name: String,
    sizes: AllocationSizes,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    debug_settings: AllocatorDebugSettings,
    allocators: ReentrantMutex<RefCell<Vec<Arc<PoolAllocator>>>>,
}

impl ResourceConfigAllocator {
    pub fn new(
        name: &str,
        sizes: AllocationSizes,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
        debug_settings: AllocatorDebugSettings,
    ) -> Self {
        Self {
            name: name.to_owned(),
            sizes,
            backend,
            timeline,
            debug_settings,
            allocators: ReentrantMutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Allocates `desc` from the pool allocator matching the request, creating it if needed.
    pub fn allocate(
        &self,
        heap_kind: HeapKind,
        buffer_access: BufferAccess,
        state_mode: ResourceStateMode,
        desc: &ResourceDesc<'_>,
        alignment: u64,
        location: &mut ResourceLocation,
    ) -> Result<()> {
        let _guard = self.allocators.lock();
        let allocator =
            self.find_or_create_allocator(heap_kind, desc.flags, buffer_access, state_mode)?;
        allocator.alloc_default_resource(desc, buffer_access, alignment, location)
    }

    /// Returns the allocator serving this configuration, creating it on first use.
    pub fn find_or_create_allocator(
        &self,
        heap_kind: HeapKind,
        resource_flags: ResourceFlags,
        buffer_access: BufferAccess,
        state_mode: ResourceStateMode,
    ) -> Result<Arc<PoolAllocator>> {
        let allocators = self.allocators.lock();

        if let Some(allocator) = allocators.borrow().iter().find(|allocator| {
            allocator.supports_allocation(heap_kind, resource_flags, buffer_access, state_mode)
        }) {
            return Ok(allocator.clone());
        }

        let index = allocators.borrow().len();
        let name = format!("{} {:?} {}", self.name, heap_kind, index);
        let pool_size = self.sizes.pool_size(heap_kind);
        let allocator = Arc::new(PoolAllocator::new(
            &PoolAllocatorDesc {
                name: &name,
                init_config: ResourceAllocatorInitConfig::new(
                    heap_kind,
                    resource_flags,
                    buffer_access,
                ),
                state_mode,
                order: FreeListOrder::SortBySize,
                pool_size,
                pool_alignment: self.sizes.pool_alignment,
                max_allocation_size: self.sizes.max_pooled_allocation_size.min(pool_size),
                ..Default::default()
            },
            self.backend.clone(),
            self.timeline.clone(),
            self.debug_settings,
        )?);
        debug!("Created pool allocator `{}`", name);

        allocators.borrow_mut().push(allocator.clone());
        Ok(allocator)
    }

    pub fn cleanup_allocations(&self, frame_lag: u64) {
        let allocators = self.allocators.lock().borrow().clone();
        for allocator in allocators {
            allocator.cleanup_allocations(frame_lag);
        }
    }

    pub fn allocator_count(&self) -> usize {
        self.allocators.lock().borrow().len()
    }

    /// Reports of every pool allocator, merged.
    pub fn generate_report(&self) -> AllocatorReport {
        let allocators = self.allocators.lock().borrow().clone();

        let mut report = AllocatorReport {
            allocations: vec![],
            blocks: vec![],
            total_allocated_bytes: 0,
            total_capacity_bytes: 0,
        };
        for allocator in allocators {
            let mut sub_report = allocator.generate_report();
            let base = report.allocations.len();
            for block in &mut sub_report.blocks {
                block.allocations = block.allocations.start + base..block.allocations.end + base;
            }
            report.allocations.append(&mut sub_report.allocations);
            report.blocks.append(&mut sub_report.blocks);
            report.total_allocated_bytes += sub_report.total_allocated_bytes;
            report.total_capacity_bytes += sub_report.total_capacity_bytes;
        }
        report
    }

    pub fn report_memory_leaks(&self, log_level: Level) {
        for allocator in self.allocators.lock().borrow().iter() {
            allocator.report_memory_leaks(log_level);
        }
    }
}

impl std::fmt::Debug for ResourceConfigAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceConfigAllocator")
            .field("name", &self.name)
            .field("allocators", &self.allocator_count())
            .finish()
    }
}
