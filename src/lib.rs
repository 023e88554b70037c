//! This crate provides the GPU memory and descriptor sub-allocation layer of a real-time renderer,
//! written fully in Rust. Every allocator hands out sub-ranges of large device heaps at high call
//! frequency and defers reuse of freed memory until the device timeline proves that the work
//! referencing it has finished.
//!
//! ## Allocators
//!
//! - [`PoolAllocator`]: growable set of fixed-size pools, each with a free list kept ordered by
//!   size (best fit) or offset (first fit).
//! - [`MultiBuddyAllocator`]: power-of-two blocks over one or more upload buffers.
//! - [`ConstantBufferAllocator`]: bump allocation inside coarse buddy blocks, retired per block.
//! - [`FastAllocator`]: per-context bump allocator over recycled pages.
//! - [`ResourceConfigAllocator`]: lazily creates one [`PoolAllocator`] per resource configuration.
//!
//! Descriptor slots are handed out by the types in [`descriptor`].
//!
//! ## Deferred frees
//!
//! Releasing a [`ResourceLocation`] never frees memory synchronously. The owning allocator records
//! the fence of the submission currently being recorded and only recycles the memory in
//! `cleanup_allocations(frame_lag)` once `frame_fence + frame_lag <= completed_fence`.
//!
//! ## Pool allocation example
//!
//! ```
//! use std::sync::Arc;
//! use gpu_frame_allocator::*;
//!
//! let backend = Arc::new(HostBackend::new());
//! let timeline = Arc::new(ManualFenceTimeline::new());
//!
//! let allocator = Arc::new(
//!     PoolAllocator::new(
//!         &PoolAllocatorDesc {
//!             name: "upload buffers",
//!             init_config: ResourceAllocatorInitConfig::new(
//!                 HeapKind::CpuToGpu,
//!                 ResourceFlags::empty(),
//!                 BufferAccess::VERTEX,
//!             ),
//!             ..Default::default()
//!         },
//!         backend,
//!         timeline.clone(),
//!         AllocatorDebugSettings::default(),
//!     )
//!     .unwrap(),
//! );
//!
//! let mut location = ResourceLocation::new();
//! allocator
//!     .allocate_resource(&ResourceDesc::buffer("vertices", 4096), 256, &mut location)
//!     .unwrap();
//! assert!(location.mapped_ptr().is_some());
//!
//! // Freed memory only becomes reusable once the device has finished the current submission.
//! location.clear();
//! let fence = timeline.submit();
//! timeline.signal(fence);
//! allocator.cleanup_allocations(0);
//! ```
#![deny(clippy::unimplemented, clippy::unwrap_used, clippy::ok_expect)]

mod result;
pub use result::*;

mod math;

pub mod fence;
pub use fence::{FenceTimeline, ManualFenceTimeline};

mod deferred;
pub use deferred::{FrameFencedAllocationData, FrameFencedOperation};

pub mod backend;
pub use backend::{
    BufferAccess, DescriptorHeapDesc, DeviceBackend, HeapCategory, HeapCreateDesc, HeapHandle,
    HostBackend, ResourceCategory, ResourceDesc, ResourceDimension, ResourceFlags, ResourceHandle,
};

pub mod resource;
pub use resource::{
    LocationKind, MappedAllocationSlab, Owner, ResourceHolder, ResourceLocation, ResourceState,
    ResourceStateMode, ResourceStates,
};

pub mod allocator;
pub use allocator::{
    AllocationReport, AllocationStrategy, AllocatorReport, BuddyAllocator, BuddyAllocatorDesc,
    ConstantBufferAllocator, ConstantBufferAllocatorDesc, DefragPolicy, FastAllocator,
    FastAllocatorDesc, FastAllocatorPagePool, FreeListOrder, MemoryBlockReport, MemoryPool,
    MultiBuddyAllocator, NoDefrag, PoolAllocator, PoolAllocatorDesc, PoolStats,
    ResourceAllocatorInitConfig, ResourceConfigAllocator,
};

pub mod descriptor;

#[cfg(all(windows, feature = "d3d12"))]
pub mod d3d12;

/// Which kind of device heap an allocation lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Device-local memory that the CPU can't access; most long-lived resources live here.
    GpuOnly,
    /// Memory the CPU writes and the device reads: uploads, constant and dynamic buffers.
    CpuToGpu,
    /// Memory the device writes and the CPU reads back.
    GpuToCpu,
}

impl HeapKind {
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, HeapKind::GpuOnly)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct AllocatorDebugSettings {
    /// Logs out debugging information about the allocator configuration on creation
    pub log_memory_information: bool,
    /// Logs out all memory leaks on shutdown with log level Warn
    pub log_leaks_on_shutdown: bool,
    /// Stores a copy of the full backtrace for every allocation made, this makes it easier to debug leaks
    /// or other memory allocations, but storing stack traces has a RAM overhead so should be disabled
    /// in shipping applications.
    pub store_stack_traces: bool,
    /// Log out every allocation as it's being made with log level Debug, rather spammy so off by default
    pub log_allocations: bool,
    /// Log out every free that is being called with log level Debug, rather spammy so off by default
    pub log_frees: bool,
    /// Log out stack traces when either `log_allocations` or `log_frees` is enabled.
    pub log_stack_traces: bool,
}

impl Default for AllocatorDebugSettings {
    fn default() -> Self {
        Self {
            log_memory_information: false,
            log_leaks_on_shutdown: true,
            store_stack_traces: false,
            log_allocations: false,
            log_frees: false,
            log_stack_traces: false,
        }
    }
}

const DEFAULT_DEVICE_POOL_SIZE: u64 = 32 * 1024 * 1024;
const DEFAULT_HOST_POOL_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_POOL_ALIGNMENT: u64 = 256;

/// Sizes used when [`ResourceConfigAllocator`] creates pool allocators on demand.
#[derive(Clone, Copy, Debug)]
pub struct AllocationSizes {
    /// Size of each pool in [`HeapKind::GpuOnly`] heaps.
    pub device_pool_size: u64,
    /// Size of each pool in CPU-visible heaps.
    pub host_pool_size: u64,
    /// Allocations above this size bypass pooling and get a standalone resource.
    pub max_pooled_allocation_size: u64,
    /// Granularity every pool block is rounded to.
    pub pool_alignment: u64,
}

impl Default for AllocationSizes {
    fn default() -> Self {
        Self {
            device_pool_size: DEFAULT_DEVICE_POOL_SIZE,
            host_pool_size: DEFAULT_HOST_POOL_SIZE,
            max_pooled_allocation_size: DEFAULT_HOST_POOL_SIZE / 2,
            pool_alignment: DEFAULT_POOL_ALIGNMENT,
        }
    }
}

impl AllocationSizes {
    pub fn pool_size(&self, heap_kind: HeapKind) -> u64 {
        match heap_kind {
            HeapKind::GpuOnly => self.device_pool_size,
            HeapKind::CpuToGpu | HeapKind::GpuToCpu => self.host_pool_size,
        }
    }
}

/// Captures a backtrace if `enabled`, otherwise a disabled placeholder.
pub(crate) fn capture_backtrace(enabled: bool) -> std::sync::Arc<std::backtrace::Backtrace> {
    std::sync::Arc::new(if enabled {
        std::backtrace::Backtrace::force_capture()
    } else {
        std::backtrace::Backtrace::disabled()
    })
}
