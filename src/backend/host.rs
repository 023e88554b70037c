use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;

use super::{
    DescriptorHeapDesc, DeviceBackend, HeapCreateDesc, HeapHandle, ResourceDesc, ResourceHandle,
};
use crate::descriptor::{
    CpuDescriptorHandle, DescriptorHeapHandle, DescriptorHeapType, GpuDescriptorHandle,
};
use crate::math::align_up;
use crate::{AllocationError, HeapKind, Result};

const FAKE_ADDRESS_BASE: u64 = 0x1_0000_0000;
const FAKE_ADDRESS_ALIGNMENT: u64 = 64 * 1024;

const HOST_MEMORY_ALIGNMENT: usize = 4096;

/// Zero-initialised, page-aligned host memory standing in for a device heap.
#[derive(Debug)]
struct HostMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostMemory {
    fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), HOST_MEMORY_ALIGNMENT)
            .map_err(|_| AllocationError::OutOfMemory)?;
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            .ok_or(AllocationError::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// The memory is exclusively owned; access goes through mapped pointers handed out by the
// allocators, which take care of never aliasing live sub-allocations.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

#[derive(Debug)]
struct HostHeap {
    memory: Option<HostMemory>,
    size: u64,
    live_bytes: Arc<AtomicU64>,
}

impl Drop for HostHeap {
    fn drop(&mut self) {
        self.live_bytes.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Placed resources keep their heap alive.
#[derive(Debug)]
struct HostPlacedResource {
    _heap: HeapHandle,
}

/// A [`DeviceBackend`] living entirely in host memory.
///
/// CPU-visible heaps are real allocations, so mapped pointers can be written and read back.
/// Device addresses are fabricated from an increasing counter. Descriptor heaps are byte arrays
/// and [`DeviceBackend::copy_descriptors()`] really copies descriptor bytes.
#[derive(Debug)]
pub struct HostBackend {
    next_gpu_address: AtomicU64,
    live_bytes: Arc<AtomicU64>,
    memory_budget: Option<u64>,
    heaps_created: AtomicUsize,
    resources_created: AtomicUsize,
    descriptor_heaps_created: AtomicUsize,
    descriptor_copies: AtomicUsize,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub const DESCRIPTOR_SIZE: u32 = 32;

    pub fn new() -> Self {
        Self {
            next_gpu_address: AtomicU64::new(FAKE_ADDRESS_BASE),
            live_bytes: Arc::new(AtomicU64::new(0)),
            memory_budget: None,
            heaps_created: AtomicUsize::new(0),
            resources_created: AtomicUsize::new(0),
            descriptor_heaps_created: AtomicUsize::new(0),
            descriptor_copies: AtomicUsize::new(0),
        }
    }

    /// Heap creation fails with [`AllocationError::OutOfMemory`] once `bytes` are live.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Bytes held by heaps and standalone resources that are still alive.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub fn heaps_created(&self) -> usize {
        self.heaps_created.load(Ordering::Acquire)
    }

    pub fn resources_created(&self) -> usize {
        self.resources_created.load(Ordering::Acquire)
    }

    pub fn descriptor_heaps_created(&self) -> usize {
        self.descriptor_heaps_created.load(Ordering::Acquire)
    }

    /// Number of individual descriptors written by `copy_descriptors`.
    pub fn descriptor_copies(&self) -> usize {
        self.descriptor_copies.load(Ordering::Acquire)
    }

    fn reserve_gpu_range(&self, size: u64) -> u64 {
        let size = align_up(size.max(1), FAKE_ADDRESS_ALIGNMENT);
        self.next_gpu_address.fetch_add(size, Ordering::AcqRel)
    }

    fn create_host_heap(&self, size: u64, kind: HeapKind) -> Result<HostHeap> {
        let live = self.live_bytes.fetch_add(size, Ordering::AcqRel) + size;
        if let Some(budget) = self.memory_budget {
            if live > budget {
                self.live_bytes.fetch_sub(size, Ordering::AcqRel);
                return Err(AllocationError::OutOfMemory);
            }
        }

        // From here on the accounting is undone by `HostHeap::drop`.
        let mut heap = HostHeap {
            memory: None,
            size,
            live_bytes: self.live_bytes.clone(),
        };

        if kind.is_cpu_visible() {
            let len = usize::try_from(size).map_err(|_| AllocationError::OutOfMemory)?;
            heap.memory = Some(HostMemory::new(len)?);
        }

        Ok(heap)
    }
}

impl DeviceBackend for HostBackend {
    fn create_heap(&self, desc: &HeapCreateDesc<'_>) -> Result<HeapHandle> {
        let heap = self.create_host_heap(desc.size, desc.kind)?;
        let mapped_ptr = heap.memory.as_ref().map(|memory| memory.ptr);
        let gpu_base_address = self.reserve_gpu_range(desc.size);
        self.heaps_created.fetch_add(1, Ordering::AcqRel);

        debug!(
            "Host heap `{}` created: {} bytes, {:?}, {:?}",
            desc.name, desc.size, desc.kind, desc.category
        );

        Ok(HeapHandle::new(
            desc.size,
            desc.kind,
            gpu_base_address,
            mapped_ptr,
            Arc::new(heap),
        ))
    }

    fn create_placed_resource(
        &self,
        heap: &HeapHandle,
        offset: u64,
        desc: &ResourceDesc<'_>,
    ) -> Result<ResourceHandle> {
        if offset + desc.size > heap.size() {
            return Err(AllocationError::Backend(format!(
                "Placed resource `{}` [0x{:x}, 0x{:x}) exceeds its heap of 0x{:x} bytes",
                desc.name,
                offset,
                offset + desc.size,
                heap.size()
            )));
        }

        let mapped_ptr = heap
            .mapped_ptr()
            .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) });
        self.resources_created.fetch_add(1, Ordering::AcqRel);

        Ok(ResourceHandle::new(
            desc.size,
            heap.gpu_base_address() + offset,
            mapped_ptr,
            Arc::new(HostPlacedResource {
                _heap: heap.clone(),
            }),
        ))
    }

    fn create_standalone_resource(
        &self,
        kind: HeapKind,
        desc: &ResourceDesc<'_>,
    ) -> Result<ResourceHandle> {
        let heap = self.create_host_heap(desc.size, kind)?;
        let mapped_ptr = heap.memory.as_ref().map(|memory| memory.ptr);
        let gpu_address = self.reserve_gpu_range(desc.size);
        self.resources_created.fetch_add(1, Ordering::AcqRel);

        Ok(ResourceHandle::new(
            desc.size,
            gpu_address,
            mapped_ptr,
            Arc::new(heap),
        ))
    }

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc<'_>,
    ) -> Result<DescriptorHeapHandle> {
        let len = desc.num_descriptors as usize * Self::DESCRIPTOR_SIZE as usize;
        let memory = HostMemory::new(len)?;
        let cpu_base = CpuDescriptorHandle {
            ptr: memory.ptr.as_ptr() as usize,
        };
        let gpu_base = desc.shader_visible.then(|| GpuDescriptorHandle {
            ptr: self.reserve_gpu_range(len as u64),
        });
        self.descriptor_heaps_created.fetch_add(1, Ordering::AcqRel);

        debug!(
            "Host descriptor heap `{}` created: {} x {:?}",
            desc.name, desc.num_descriptors, desc.heap_type
        );

        Ok(DescriptorHeapHandle::new(
            desc.heap_type,
            desc.num_descriptors,
            Self::DESCRIPTOR_SIZE,
            cpu_base,
            gpu_base,
            Arc::new(memory),
        ))
    }

    fn copy_descriptors(
        &self,
        dst: CpuDescriptorHandle,
        src: &[CpuDescriptorHandle],
        _heap_type: DescriptorHeapType,
    ) {
        for (i, src) in src.iter().enumerate() {
            let dst = dst.offset(i as u32, Self::DESCRIPTOR_SIZE);
            // Both handles point into descriptor heaps created above.
            unsafe {
                std::ptr::copy(
                    src.ptr as *const u8,
                    dst.ptr as *mut u8,
                    Self::DESCRIPTOR_SIZE as usize,
                )
            };
        }
        self.descriptor_copies.fetch_add(src.len(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeapCategory;

    #[test]
    fn placed_resources_alias_heap_memory() {
        let backend = HostBackend::new();
        let heap = backend
            .create_heap(&HeapCreateDesc {
                name: "upload",
                size: 4096,
                kind: HeapKind::CpuToGpu,
                alignment: 4096,
                category: HeapCategory::Buffer,
            })
            .unwrap();

        let resource = backend
            .create_placed_resource(&heap, 256, &ResourceDesc::buffer("buffer", 256))
            .unwrap();

        assert_eq!(resource.gpu_address(), heap.gpu_base_address() + 256);
        let heap_ptr = heap.mapped_ptr().unwrap().as_ptr();
        let resource_ptr = resource.mapped_ptr().unwrap().as_ptr();
        assert_eq!(resource_ptr as usize - heap_ptr as usize, 256);

        assert!(backend
            .create_placed_resource(&heap, 4000, &ResourceDesc::buffer("too big", 256))
            .is_err());
    }

    #[test]
    fn memory_budget_reports_out_of_memory() {
        let backend = HostBackend::new().with_memory_budget(1024);
        let desc = HeapCreateDesc {
            name: "gpu",
            size: 1024,
            kind: HeapKind::GpuOnly,
            alignment: 1024,
            category: HeapCategory::All,
        };

        let heap = backend.create_heap(&desc).unwrap();
        assert!(matches!(
            backend.create_heap(&desc),
            Err(AllocationError::OutOfMemory)
        ));
        assert_eq!(backend.live_bytes(), 1024);

        drop(heap);
        assert_eq!(backend.live_bytes(), 0);
        assert!(backend.create_heap(&desc).is_ok());
    }
}
