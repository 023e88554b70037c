//! Contracts this crate needs from the platform layer.
//!
//! Allocators never talk to a graphics API directly; they create heaps, placed and standalone
//! resources and descriptor heaps through a [`DeviceBackend`]. [`HostBackend`] implements it in
//! plain host memory, the `d3d12` module implements it for Direct3D 12.
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::descriptor::{CpuDescriptorHandle, DescriptorHeapHandle, DescriptorHeapType};
use crate::resource::ResourceStates;
use crate::{HeapKind, Result};

mod host;
pub use host::HostBackend;

bitflags! {
    /// Creation flags of a resource, mirroring `D3D12_RESOURCE_FLAGS`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ResourceFlags: u32 {
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
        const DENY_SHADER_RESOURCE = 0x8;
        const ALLOW_CROSS_ADAPTER = 0x10;
        const ALLOW_SIMULTANEOUS_ACCESS = 0x20;
    }
}

bitflags! {
    /// How the front-end intends to use a buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferAccess: u32 {
        const VERTEX = 0x1;
        const INDEX = 0x2;
        const CONSTANT = 0x4;
        const SHADER_RESOURCE = 0x8;
        const UNORDERED_ACCESS = 0x10;
        const INDIRECT_ARGS = 0x20;
        const ACCELERATION_STRUCTURE = 0x40;
        /// Rewritten by the CPU many times, renamed through `ResourceLocation::transfer_ownership`.
        const DYNAMIC = 0x80;
        /// Written once and consumed within the same frame.
        const VOLATILE = 0x100;
    }
}

/// Restricts what a heap may contain on hardware that can't mix resource categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapCategory {
    All,
    Buffer,
    RtvDsvTexture,
    OtherTexture,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceCategory {
    Buffer,
    RtvDsvTexture,
    OtherTexture,
}

impl From<ResourceCategory> for HeapCategory {
    fn from(resource_category: ResourceCategory) -> Self {
        match resource_category {
            ResourceCategory::Buffer => HeapCategory::Buffer,
            ResourceCategory::RtvDsvTexture => HeapCategory::RtvDsvTexture,
            ResourceCategory::OtherTexture => HeapCategory::OtherTexture,
        }
    }
}

impl From<&ResourceDesc<'_>> for ResourceCategory {
    fn from(desc: &ResourceDesc<'_>) -> Self {
        if desc.dimension == ResourceDimension::Buffer {
            ResourceCategory::Buffer
        } else if desc
            .flags
            .intersects(ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL)
        {
            ResourceCategory::RtvDsvTexture
        } else {
            ResourceCategory::OtherTexture
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture2D {
        width: u32,
        height: u32,
        array_size: u16,
        mip_levels: u16,
        /// Platform format code (a `DXGI_FORMAT` value on D3D12).
        format: u32,
    },
}

#[derive(Clone, Debug)]
pub struct ResourceDesc<'a> {
    /// Name of the resource, for tracking and debugging purposes
    pub name: &'a str,
    pub dimension: ResourceDimension,
    /// Size in bytes the resource occupies in its heap.
    pub size: u64,
    pub flags: ResourceFlags,
    /// State a resource in a GPU-only heap starts in.
    pub initial_state: ResourceStates,
}

impl<'a> ResourceDesc<'a> {
    pub fn buffer(name: &'a str, size: u64) -> Self {
        Self {
            name,
            dimension: ResourceDimension::Buffer,
            size,
            flags: ResourceFlags::empty(),
            initial_state: ResourceStates::COMMON,
        }
    }

    pub fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceStates) -> Self {
        self.initial_state = state;
        self
    }

    pub fn subresource_count(&self) -> u32 {
        match self.dimension {
            ResourceDimension::Buffer => 1,
            ResourceDimension::Texture2D {
                array_size,
                mip_levels,
                ..
            } => u32::from(array_size.max(1)) * u32::from(mip_levels.max(1)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HeapCreateDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub kind: HeapKind,
    pub alignment: u64,
    pub category: HeapCategory,
}

/// A reference-counted native object owned by the backend.
pub type NativeObject = Arc<dyn Any + Send + Sync>;

/// A backing heap that placed resources live in.
#[derive(Clone)]
pub struct HeapHandle {
    size: u64,
    kind: HeapKind,
    gpu_base_address: u64,
    mapped_ptr: Option<NonNull<u8>>,
    native: NativeObject,
}

// The mapped pointer refers to memory owned by `native`, which lives as long as any clone.
unsafe impl Send for HeapHandle {}
unsafe impl Sync for HeapHandle {}

impl HeapHandle {
    pub fn new(
        size: u64,
        kind: HeapKind,
        gpu_base_address: u64,
        mapped_ptr: Option<NonNull<u8>>,
        native: NativeObject,
    ) -> Self {
        Self {
            size,
            kind,
            gpu_base_address,
            mapped_ptr,
            native,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn gpu_base_address(&self) -> u64 {
        self.gpu_base_address
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    /// Borrows the backend's native heap object.
    pub fn native<T: Any>(&self) -> Option<&T> {
        self.native.downcast_ref()
    }
}

impl fmt::Debug for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapHandle")
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("gpu_base_address", &format_args!("0x{:x}", self.gpu_base_address))
            .field("mapped", &self.mapped_ptr.is_some())
            .finish()
    }
}

/// A device resource: either placed inside a [`HeapHandle`] or standalone.
#[derive(Clone)]
pub struct ResourceHandle {
    size: u64,
    gpu_address: u64,
    mapped_ptr: Option<NonNull<u8>>,
    native: NativeObject,
}

// Same reasoning as `HeapHandle`.
unsafe impl Send for ResourceHandle {}
unsafe impl Sync for ResourceHandle {}

impl ResourceHandle {
    pub fn new(
        size: u64,
        gpu_address: u64,
        mapped_ptr: Option<NonNull<u8>>,
        native: NativeObject,
    ) -> Self {
        Self {
            size,
            gpu_address,
            mapped_ptr,
            native,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped_ptr
    }

    pub fn native<T: Any>(&self) -> Option<&T> {
        self.native.downcast_ref()
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("size", &self.size)
            .field("gpu_address", &format_args!("0x{:x}", self.gpu_address))
            .field("mapped", &self.mapped_ptr.is_some())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorHeapDesc<'a> {
    pub name: &'a str,
    pub heap_type: DescriptorHeapType,
    pub num_descriptors: u32,
    /// Whether the device reads descriptors straight out of this heap.
    pub shader_visible: bool,
}

/// Platform calls the allocators are built on.
///
/// Implementations must be callable from any thread. Failing to create a heap or resource
/// because the device ran out of memory is reported as [`crate::AllocationError::OutOfMemory`].
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn create_heap(&self, desc: &HeapCreateDesc<'_>) -> Result<HeapHandle>;

    fn create_placed_resource(
        &self,
        heap: &HeapHandle,
        offset: u64,
        desc: &ResourceDesc<'_>,
    ) -> Result<ResourceHandle>;

    fn create_standalone_resource(
        &self,
        kind: HeapKind,
        desc: &ResourceDesc<'_>,
    ) -> Result<ResourceHandle>;

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc<'_>)
        -> Result<DescriptorHeapHandle>;

    /// Copies `src.len()` descriptors into consecutive slots starting at `dst`.
    fn copy_descriptors(
        &self,
        dst: CpuDescriptorHandle,
        src: &[CpuDescriptorHandle],
        heap_type: DescriptorHeapType,
    );
}
