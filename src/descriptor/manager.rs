use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::{
    CpuDescriptorHandle, DescriptorAllocator, DescriptorHandle, DescriptorHeapHandle,
    DescriptorHeapType, GpuDescriptorHandle,
};
use crate::backend::{DescriptorHeapDesc, DeviceBackend};
use crate::deferred::{FrameFenced, FrameFencedQueue};
use crate::fence::FenceTimeline;
use crate::{AllocationError, Result};

#[derive(Debug)]
struct PendingFree {
    index: u32,
    frame_fence: u64,
}

impl FrameFenced for PendingFree {
    fn frame_fence(&self) -> u64 {
        self.frame_fence
    }
}

#[derive(Debug)]
struct DescriptorManagerInner {
    allocator: DescriptorAllocator,
    pending: FrameFencedQueue<PendingFree>,
}

/// One descriptor heap whose slots are named by [`DescriptorHandle`]s.
///
/// Used for bindless tables: a handle's index is its slot in the heap. Slots of a
/// shader-visible heap may be read by in-flight work, so freeing them is deferred until
/// [`Self::cleanup()`] sees the fence complete; slots of a CPU-only heap are reusable at once.
#[derive(Debug)]
pub struct DescriptorManager {
    heap: DescriptorHeapHandle,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    inner: Mutex<DescriptorManagerInner>,
}

impl DescriptorManager {
    pub fn new(
        name: &str,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
        shader_visible: bool,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
    ) -> Result<Self> {
        if num_descriptors == 0 || num_descriptors >= DescriptorHandle::MAX_INDEX {
            return Err(AllocationError::InvalidAllocatorCreateDesc(format!(
                "Descriptor heap `{}` can't hold {} descriptors",
                name, num_descriptors
            )));
        }

        let heap = backend.create_descriptor_heap(&DescriptorHeapDesc {
            name,
            heap_type,
            num_descriptors,
            shader_visible,
        })?;

        Ok(Self {
            heap,
            backend,
            timeline,
            inner: Mutex::new(DescriptorManagerInner {
                allocator: DescriptorAllocator::new(num_descriptors),
                pending: FrameFencedQueue::default(),
            }),
        })
    }

    pub fn heap(&self) -> &DescriptorHeapHandle {
        &self.heap
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap.heap_type()
    }

    /// Returns [`None`] when every slot is in use or waiting for its fence.
    pub fn allocate(&self) -> Option<DescriptorHandle> {
        let index = self.inner.lock().allocator.allocate(1)?;
        Some(DescriptorHandle::new(index, self.heap_type()))
    }

    pub fn free(&self, handle: DescriptorHandle) {
        if !handle.is_valid() {
            return;
        }
        debug_assert_eq!(handle.heap_type(), Some(self.heap_type()));

        let mut inner = self.inner.lock();
        if self.heap.is_shader_visible() {
            let frame_fence = self.timeline.current_submission_fence();
            inner.pending.push(PendingFree {
                index: handle.index(),
                frame_fence,
            });
        } else {
            inner.allocator.free(handle.index(), 1);
        }
    }

    /// Returns slots freed at least `frame_lag` submissions ago to the allocator.
    pub fn cleanup(&self, frame_lag: u64) -> usize {
        let completed_fence = self.timeline.completed_fence();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let allocator = &mut inner.allocator;
        inner
            .pending
            .drain_ready(completed_fence, frame_lag, |pending| {
                allocator.free(pending.index, 1)
            })
    }

    /// Writes the descriptor at `src` into the slot of `handle`.
    pub fn update(&self, handle: DescriptorHandle, src: CpuDescriptorHandle) {
        self.backend
            .copy_descriptors(self.cpu_handle(handle), &[src], self.heap_type());
    }

    pub fn cpu_handle(&self, handle: DescriptorHandle) -> CpuDescriptorHandle {
        self.heap.cpu_slot_handle(handle.index())
    }

    pub fn gpu_handle(&self, handle: DescriptorHandle) -> GpuDescriptorHandle {
        self.heap.gpu_slot_handle(handle.index())
    }

    pub fn allocated_count(&self) -> u32 {
        self.inner.lock().allocator.allocated()
    }
}

/// A CPU-only descriptor minted by [`OfflineDescriptorManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfflineDescriptor {
    pub handle: CpuDescriptorHandle,
    pub heap_index: u32,
    pub slot: u32,
}

#[derive(Debug)]
struct OfflineHeap {
    heap: DescriptorHeapHandle,
    allocator: DescriptorAllocator,
}

/// Growable set of CPU-only descriptor heaps of one type.
///
/// The device never reads these descriptors; they are copied into online heaps before use, so
/// handles are stable and frees take effect immediately.
#[derive(Debug)]
pub struct OfflineDescriptorManager {
    name: String,
    heap_type: DescriptorHeapType,
    descriptors_per_heap: u32,
    backend: Arc<dyn DeviceBackend>,
    heaps: Mutex<Vec<OfflineHeap>>,
}

impl OfflineDescriptorManager {
    pub fn new(
        name: &str,
        heap_type: DescriptorHeapType,
        descriptors_per_heap: u32,
        backend: Arc<dyn DeviceBackend>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            heap_type,
            descriptors_per_heap: descriptors_per_heap.max(1),
            backend,
            heaps: Mutex::new(Vec::new()),
        }
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    pub fn allocate(&self) -> Result<OfflineDescriptor> {
        let mut heaps = self.heaps.lock();

        for (heap_index, heap) in heaps.iter_mut().enumerate() {
            if let Some(slot) = heap.allocator.allocate(1) {
                return Ok(OfflineDescriptor {
                    handle: heap.heap.cpu_slot_handle(slot),
                    heap_index: heap_index as u32,
                    slot,
                });
            }
        }

        let heap_index = heaps.len();
        let name = format!("{} {}", self.name, heap_index);
        let heap = self.backend.create_descriptor_heap(&DescriptorHeapDesc {
            name: &name,
            heap_type: self.heap_type,
            num_descriptors: self.descriptors_per_heap,
            shader_visible: false,
        })?;
        debug!(
            "Offline descriptor manager `{}` created heap {}",
            self.name, heap_index
        );

        let mut allocator = DescriptorAllocator::new(self.descriptors_per_heap);
        let slot = allocator
            .allocate(1)
            .ok_or_else(|| AllocationError::Internal("Fresh descriptor heap is full.".into()))?;
        let descriptor = OfflineDescriptor {
            handle: heap.cpu_slot_handle(slot),
            heap_index: heap_index as u32,
            slot,
        };
        heaps.push(OfflineHeap { heap, allocator });

        Ok(descriptor)
    }

    pub fn free(&self, descriptor: OfflineDescriptor) {
        let mut heaps = self.heaps.lock();
        match heaps.get_mut(descriptor.heap_index as usize) {
            Some(heap) => heap.allocator.free(descriptor.slot, 1),
            None => log::error!(
                "Offline descriptor manager `{}` has no heap {}",
                self.name,
                descriptor.heap_index
            ),
        }
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::fence::ManualFenceTimeline;

    #[test]
    fn shader_visible_frees_wait_for_the_fence() {
        let timeline = Arc::new(ManualFenceTimeline::new());
        let manager = DescriptorManager::new(
            "bindless",
            DescriptorHeapType::Standard,
            2,
            true,
            Arc::new(HostBackend::new()),
            timeline.clone(),
        )
        .unwrap();

        let a = manager.allocate().unwrap();
        let b = manager.allocate().unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(a.heap_type(), Some(DescriptorHeapType::Standard));
        assert!(manager.allocate().is_none());
        assert_ne!(manager.gpu_handle(a), manager.gpu_handle(b));

        manager.free(a);
        assert_eq!(manager.cleanup(0), 0);
        assert!(manager.allocate().is_none());

        timeline.submit_and_signal();
        assert_eq!(manager.cleanup(0), 1);
        assert_eq!(manager.allocate(), Some(a));
    }

    #[test]
    fn cpu_only_frees_are_immediate() {
        let manager = DescriptorManager::new(
            "staging",
            DescriptorHeapType::Sampler,
            1,
            false,
            Arc::new(HostBackend::new()),
            Arc::new(ManualFenceTimeline::new()),
        )
        .unwrap();

        let handle = manager.allocate().unwrap();
        manager.free(handle);
        assert_eq!(manager.allocate(), Some(handle));
        assert_eq!(manager.gpu_handle(handle), GpuDescriptorHandle::default());
    }

    #[test]
    fn offline_manager_grows_and_reuses_slots() {
        let backend = Arc::new(HostBackend::new());
        let manager = OfflineDescriptorManager::new(
            "rtv",
            DescriptorHeapType::RenderTarget,
            2,
            backend.clone(),
        );

        let a = manager.allocate().unwrap();
        let b = manager.allocate().unwrap();
        let c = manager.allocate().unwrap();
        assert_eq!(manager.heap_count(), 2);
        assert_eq!(c.heap_index, 1);
        assert_eq!(
            b.handle.ptr - a.handle.ptr,
            HostBackend::DESCRIPTOR_SIZE as usize
        );

        manager.free(b);
        assert_eq!(manager.allocate().unwrap(), b);
        assert_eq!(backend.descriptor_heaps_created(), 2);
    }

    #[test]
    fn update_copies_the_descriptor() {
        let backend = Arc::new(HostBackend::new());
        let offline =
            OfflineDescriptorManager::new("srv", DescriptorHeapType::Standard, 4, backend.clone());
        let manager = DescriptorManager::new(
            "bindless",
            DescriptorHeapType::Standard,
            4,
            true,
            backend.clone(),
            Arc::new(ManualFenceTimeline::new()),
        )
        .unwrap();

        let source = offline.allocate().unwrap();
        unsafe { *(source.handle.ptr as *mut u64) = 0xfeed };

        let handle = manager.allocate().unwrap();
        manager.update(handle, source.handle);
        assert_eq!(backend.descriptor_copies(), 1);
        assert_eq!(unsafe { *(manager.cpu_handle(handle).ptr as *const u64) }, 0xfeed);
    }
}
