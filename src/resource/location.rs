use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use super::ResourceHolder;
use crate::allocator::{MultiBuddyAllocator, PoolAllocator};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LocationKind {
    /// Empty; nothing to release.
    #[default]
    Undefined,
    /// A range inside a pool or buddy buffer, released through its [`Owner`].
    SubAllocation,
    /// A bump allocation whose lifetime is tied to a recycled page or block.
    FastAllocation,
    /// A dedicated resource, released when the last reference goes away.
    StandAlone,
}

/// The allocator a sub-allocation is returned to.
#[derive(Clone)]
pub enum Owner {
    Pool(Arc<PoolAllocator>),
    Buddy(Arc<MultiBuddyAllocator>),
}

impl Owner {
    fn name(&self) -> &str {
        match self {
            Owner::Pool(allocator) => allocator.name(),
            Owner::Buddy(allocator) => allocator.name(),
        }
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Pool(_) => write!(f, "Pool({})", self.name()),
            Owner::Buddy(_) => write!(f, "Buddy({})", self.name()),
        }
    }
}

/// Free-list node of a pool allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolAllocatorPrivateData {
    pub pool_index: u32,
    pub node: u32,
    /// Offset of the allocation in its pool, after alignment padding.
    pub offset: u64,
    pub size: u64,
    pub alignment: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuddyAllocatorPrivateData {
    pub allocator_index: u32,
    pub offset: u64,
    pub order: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocatorPrivateData {
    #[default]
    None,
    Pool(PoolAllocatorPrivateData),
    Buddy(BuddyAllocatorPrivateData),
}

/// One live allocation: which resource it lives in, where, and who reclaims it.
///
/// A location has at most one owner. [`ResourceLocation::clear()`] (also run on drop) hands
/// sub-allocations back to that owner, which defers the actual free until the device is done
/// with the memory. [`ResourceLocation::transfer_ownership()`] moves an allocation between
/// locations without releasing it.
#[derive(Default)]
pub struct ResourceLocation {
    kind: LocationKind,
    owner: Option<Owner>,
    resource: Option<Arc<ResourceHolder>>,
    offset_from_base_of_resource: u64,
    size: u64,
    gpu_address: u64,
    mapped_ptr: Option<NonNull<u8>>,
    private_data: AllocatorPrivateData,
}

// The mapped pointer points into memory kept alive by `resource`.
unsafe impl Send for ResourceLocation {}
unsafe impl Sync for ResourceLocation {}

impl ResourceLocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn init_sub_allocation(
        &mut self,
        owner: Owner,
        resource: Arc<ResourceHolder>,
        offset_from_base_of_resource: u64,
        size: u64,
        private_data: AllocatorPrivateData,
    ) {
        self.init(
            LocationKind::SubAllocation,
            resource,
            offset_from_base_of_resource,
            size,
        );
        self.owner = Some(owner);
        self.private_data = private_data;
    }

    pub(crate) fn init_fast_allocation(
        &mut self,
        resource: Arc<ResourceHolder>,
        offset_from_base_of_resource: u64,
        size: u64,
    ) {
        self.init(
            LocationKind::FastAllocation,
            resource,
            offset_from_base_of_resource,
            size,
        );
    }

    pub(crate) fn init_standalone(&mut self, resource: Arc<ResourceHolder>) {
        let size = resource.size();
        self.init(LocationKind::StandAlone, resource, 0, size);
    }

    fn init(
        &mut self,
        kind: LocationKind,
        resource: Arc<ResourceHolder>,
        offset_from_base_of_resource: u64,
        size: u64,
    ) {
        debug_assert!(
            self.kind == LocationKind::Undefined,
            "Initializing a location that still holds an allocation"
        );
        self.clear();

        self.kind = kind;
        self.gpu_address = resource.gpu_address() + offset_from_base_of_resource;
        self.mapped_ptr = resource.mapped_ptr().map(|ptr| unsafe {
            NonNull::new_unchecked(ptr.as_ptr().add(offset_from_base_of_resource as usize))
        });
        self.offset_from_base_of_resource = offset_from_base_of_resource;
        self.size = size;
        self.resource = Some(resource);
    }

    /// Releases the allocation: sub-allocations are queued for deferred reclamation by their
    /// owner, everything else just drops its reference to the backing resource.
    pub fn clear(&mut self) {
        if let Some(owner) = self.owner.take() {
            match &owner {
                Owner::Pool(allocator) => allocator.defer_deallocation(self),
                Owner::Buddy(allocator) => allocator.defer_deallocation(self),
            }
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.kind = LocationKind::Undefined;
        self.owner = None;
        self.resource = None;
        self.offset_from_base_of_resource = 0;
        self.size = 0;
        self.gpu_address = 0;
        self.mapped_ptr = None;
        self.private_data = AllocatorPrivateData::None;
    }

    /// Moves the allocation held by `source` into `destination`, releasing whatever
    /// `destination` held before. `source` is left empty.
    pub fn transfer_ownership(destination: &mut Self, source: &mut Self) {
        *destination = std::mem::take(source);
    }

    pub fn swap(a: &mut Self, b: &mut Self) {
        std::mem::swap(a, b);
    }

    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    pub fn is_valid(&self) -> bool {
        self.kind != LocationKind::Undefined
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    pub fn resource(&self) -> Option<&Arc<ResourceHolder>> {
        self.resource.as_ref()
    }

    pub fn offset_from_base_of_resource(&self) -> u64 {
        self.offset_from_base_of_resource
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// CPU pointer to the start of the allocation, if it lives in CPU-visible memory.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    pub fn private_data(&self) -> AllocatorPrivateData {
        self.private_data
    }

    pub fn pool_private_data(&self) -> Option<&PoolAllocatorPrivateData> {
        match &self.private_data {
            AllocatorPrivateData::Pool(data) => Some(data),
            _ => None,
        }
    }

    pub fn buddy_private_data(&self) -> Option<&BuddyAllocatorPrivateData> {
        match &self.private_data {
            AllocatorPrivateData::Buddy(data) => Some(data),
            _ => None,
        }
    }
}

impl Drop for ResourceLocation {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLocation")
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field(
                "resource",
                &self.resource.as_ref().map(|resource| resource.name()),
            )
            .field("offset", &self.offset_from_base_of_resource)
            .field("size", &self.size)
            .field("gpu_address", &format_args!("0x{:x}", self.gpu_address))
            .field("mapped", &self.mapped_ptr.is_some())
            .field("private_data", &self.private_data)
            .finish()
    }
}
