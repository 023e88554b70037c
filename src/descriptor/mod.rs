//! Descriptor slot allocation.
//!
//! Offline (CPU-only) descriptors are minted by [`OfflineDescriptorManager`] and
//! [`DescriptorManager`] and freed immediately, because the device never reads them. Online
//! (shader-visible) slots are reserved from an [`OnlineHeap`] and are subject to the same
//! fence-gated reuse as memory; running out of space rolls the heap over, which invalidates
//! previously bound descriptor tables.
use std::fmt;
use std::sync::Arc;

mod allocator;
pub use allocator::DescriptorAllocator;

mod manager;
pub use manager::{DescriptorManager, OfflineDescriptor, OfflineDescriptorManager};

mod online;
pub use online::{
    HeapRollOver, LocalOnlineHeap, OnlineDescriptorManager, OnlineHeap, OnlineHeapBlock,
    SubAllocatedOnlineHeap, HEAP_EXHAUSTED_VALUE,
};

mod conservative_map;
pub use conservative_map::ConservativeMap;

mod sampler;
pub use sampler::{
    GlobalOnlineSamplerHeap, SamplerArrayDesc, SamplerState, UniqueDescriptorTable,
    MAX_SAMPLERS_PER_TABLE,
};

mod cache;
pub use cache::{DescriptorCache, DescriptorCacheDesc, RollOverCallback};

use crate::backend::NativeObject;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource and unordered access views.
    Standard = 0,
    Sampler = 1,
    RenderTarget = 2,
    DepthStencil = 3,
}

impl DescriptorHeapType {
    pub const COUNT: usize = 4;

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Standard),
            1 => Some(Self::Sampler),
            2 => Some(Self::RenderTarget),
            3 => Some(Self::DepthStencil),
            _ => None,
        }
    }
}

const HANDLE_INDEX_BITS: u32 = 28;
const HANDLE_INDEX_MASK: u32 = (1 << HANDLE_INDEX_BITS) - 1;

/// Packed `{index, heap_type}` naming one descriptor slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle(u32);

impl DescriptorHandle {
    /// Largest representable index; also the "invalid" sentinel.
    pub const MAX_INDEX: u32 = HANDLE_INDEX_MASK;

    pub const INVALID: Self = Self(HANDLE_INDEX_MASK);

    pub fn new(index: u32, heap_type: DescriptorHeapType) -> Self {
        debug_assert!(index < Self::MAX_INDEX, "Descriptor index {} too large", index);
        Self((index & HANDLE_INDEX_MASK) | ((heap_type as u32) << HANDLE_INDEX_BITS))
    }

    pub fn index(self) -> u32 {
        self.0 & HANDLE_INDEX_MASK
    }

    pub fn heap_type(self) -> Option<DescriptorHeapType> {
        DescriptorHeapType::from_bits(self.0 >> HANDLE_INDEX_BITS)
    }

    pub fn is_valid(self) -> bool {
        self.index() != Self::MAX_INDEX
    }
}

impl Default for DescriptorHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for DescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.debug_struct("DescriptorHandle")
                .field("index", &self.index())
                .field("heap_type", &self.heap_type())
                .finish()
        } else {
            f.write_str("DescriptorHandle(invalid)")
        }
    }
}

/// CPU address of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CpuDescriptorHandle {
    pub ptr: usize,
}

impl CpuDescriptorHandle {
    pub fn offset(self, slots: u32, descriptor_size: u32) -> Self {
        Self {
            ptr: self.ptr + slots as usize * descriptor_size as usize,
        }
    }
}

/// Device address of a descriptor in a shader-visible heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GpuDescriptorHandle {
    pub ptr: u64,
}

impl GpuDescriptorHandle {
    pub fn offset(self, slots: u32, descriptor_size: u32) -> Self {
        Self {
            ptr: self.ptr + u64::from(slots) * u64::from(descriptor_size),
        }
    }
}

/// A descriptor heap created by the backend.
#[derive(Clone)]
pub struct DescriptorHeapHandle {
    heap_type: DescriptorHeapType,
    num_descriptors: u32,
    descriptor_size: u32,
    cpu_base: CpuDescriptorHandle,
    gpu_base: Option<GpuDescriptorHandle>,
    native: NativeObject,
}

impl DescriptorHeapHandle {
    pub fn new(
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
        descriptor_size: u32,
        cpu_base: CpuDescriptorHandle,
        gpu_base: Option<GpuDescriptorHandle>,
        native: NativeObject,
    ) -> Self {
        Self {
            heap_type,
            num_descriptors,
            descriptor_size,
            cpu_base,
            gpu_base,
            native,
        }
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    pub fn num_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    pub fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }

    pub fn is_shader_visible(&self) -> bool {
        self.gpu_base.is_some()
    }

    pub fn cpu_slot_handle(&self, slot: u32) -> CpuDescriptorHandle {
        debug_assert!(slot < self.num_descriptors);
        self.cpu_base.offset(slot, self.descriptor_size)
    }

    /// Returns a null handle for heaps that aren't shader visible.
    pub fn gpu_slot_handle(&self, slot: u32) -> GpuDescriptorHandle {
        debug_assert!(slot < self.num_descriptors);
        self.gpu_base
            .map(|base| base.offset(slot, self.descriptor_size))
            .unwrap_or_default()
    }

    /// Two handles refer to the same device heap.
    pub fn same_heap(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.native, &other.native)
    }

    pub fn native<T: std::any::Any>(&self) -> Option<&T> {
        self.native.downcast_ref()
    }
}

impl fmt::Debug for DescriptorHeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeapHandle")
            .field("heap_type", &self.heap_type)
            .field("num_descriptors", &self.num_descriptors)
            .field("descriptor_size", &self.descriptor_size)
            .field("shader_visible", &self.is_shader_visible())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_handle_packing() {
        let handle = DescriptorHandle::new(63, DescriptorHeapType::Sampler);
        assert_eq!(handle.index(), 63);
        assert_eq!(handle.heap_type(), Some(DescriptorHeapType::Sampler));
        assert!(handle.is_valid());

        let handle = DescriptorHandle::new(DescriptorHandle::MAX_INDEX - 1, DescriptorHeapType::DepthStencil);
        assert_eq!(handle.index(), DescriptorHandle::MAX_INDEX - 1);
        assert_eq!(handle.heap_type(), Some(DescriptorHeapType::DepthStencil));

        assert!(!DescriptorHandle::INVALID.is_valid());
        assert!(!DescriptorHandle::default().is_valid());
    }
}
