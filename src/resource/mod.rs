//! Resources handed out by the allocators and the location type that records where they live.
use std::fmt;
use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

mod location;
pub use location::{
    AllocatorPrivateData, BuddyAllocatorPrivateData, LocationKind, Owner, PoolAllocatorPrivateData,
    ResourceLocation,
};

mod presser;
pub use presser::MappedAllocationSlab;

mod state;
pub use state::{ResourceState, ResourceStateMode, ResourceStates};

use crate::backend::{HeapHandle, ResourceDesc, ResourceDimension, ResourceFlags, ResourceHandle};
use crate::HeapKind;

/// A device resource together with the heap it is placed in and its state tracker.
///
/// Holders are shared through `Arc`: every [`ResourceLocation`] sub-allocated from a pool or
/// buddy buffer keeps the backing holder alive.
pub struct ResourceHolder {
    resource: ResourceHandle,
    heap: Option<HeapHandle>,
    heap_kind: HeapKind,
    name: String,
    dimension: ResourceDimension,
    flags: ResourceFlags,
    default_state: ResourceStates,
    state: Option<Mutex<ResourceState>>,
}

impl ResourceHolder {
    pub fn new(
        resource: ResourceHandle,
        heap: Option<HeapHandle>,
        heap_kind: HeapKind,
        desc: &ResourceDesc<'_>,
        state_mode: ResourceStateMode,
    ) -> Self {
        // CPU-visible heaps pin their resources to a single state.
        let default_state = match heap_kind {
            HeapKind::CpuToGpu => ResourceStates::GENERIC_READ,
            HeapKind::GpuToCpu => ResourceStates::COPY_DEST,
            HeapKind::GpuOnly => desc.initial_state,
        };

        let requires_tracking = match state_mode {
            ResourceStateMode::SingleState => false,
            ResourceStateMode::MultiState => true,
            ResourceStateMode::Default => heap_kind == HeapKind::GpuOnly,
        };

        let state = requires_tracking
            .then(|| Mutex::new(ResourceState::new(desc.subresource_count(), default_state)));

        Self {
            resource,
            heap,
            heap_kind,
            name: desc.name.to_owned(),
            dimension: desc.dimension,
            flags: desc.flags,
            default_state,
            state,
        }
    }

    pub fn resource(&self) -> &ResourceHandle {
        &self.resource
    }

    /// The heap a placed resource lives in; [`None`] for standalone resources.
    pub fn heap(&self) -> Option<&HeapHandle> {
        self.heap.as_ref()
    }

    pub fn is_placed(&self) -> bool {
        self.heap.is_some()
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.heap_kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> ResourceDimension {
        self.dimension
    }

    pub fn flags(&self) -> ResourceFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.resource.size()
    }

    pub fn gpu_address(&self) -> u64 {
        self.resource.gpu_address()
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.resource.mapped_ptr()
    }

    /// State every subresource is in when the resource is created.
    pub fn default_state(&self) -> ResourceStates {
        self.default_state
    }

    pub fn requires_state_tracking(&self) -> bool {
        self.state.is_some()
    }

    /// Locks the tracker; [`None`] for single-state resources.
    pub fn resource_state(&self) -> Option<MutexGuard<'_, ResourceState>> {
        self.state.as_ref().map(|state| state.lock())
    }
}

impl fmt::Debug for ResourceHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHolder")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("heap_kind", &self.heap_kind)
            .field("placed", &self.is_placed())
            .field("default_state", &self.default_state)
            .finish()
    }
}
