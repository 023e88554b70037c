#![deny(clippy::unimplemented, clippy::unwrap_used, clippy::ok_expect)]
//! [`DeviceBackend`] and [`FenceTimeline`] over Direct3D 12.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use windows::core::HRESULT;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC};

use crate::backend::{
    DescriptorHeapDesc, DeviceBackend, HeapCategory, HeapCreateDesc, HeapHandle, ResourceDesc,
    ResourceDimension, ResourceHandle,
};
use crate::descriptor::{
    CpuDescriptorHandle, DescriptorHeapHandle, DescriptorHeapType, GpuDescriptorHandle,
};
use crate::fence::FenceTimeline;
use crate::resource::ResourceStates;
use crate::{AllocationError, HeapKind, Result};

const E_OUTOFMEMORY: HRESULT = HRESULT(0x8007_000E_u32 as i32);

fn map_error(err: windows::core::Error, what: &str) -> AllocationError {
    if err.code() == E_OUTOFMEMORY {
        AllocationError::OutOfMemory
    } else {
        AllocationError::Backend(format!("{} failed: {}", what, err))
    }
}

/// Native heap stored in [`HeapHandle`].
#[derive(Debug)]
pub struct D3D12Heap(pub ID3D12Heap);

/// Native resource stored in [`ResourceHandle`].
#[derive(Debug)]
pub struct D3D12Resource(pub ID3D12Resource);

/// Native descriptor heap stored in [`DescriptorHeapHandle`].
#[derive(Debug)]
pub struct D3D12DescriptorHeap(pub ID3D12DescriptorHeap);

// D3D12 objects are free-threaded.
unsafe impl Send for D3D12Heap {}
unsafe impl Sync for D3D12Heap {}
unsafe impl Send for D3D12Resource {}
unsafe impl Sync for D3D12Resource {}
unsafe impl Send for D3D12DescriptorHeap {}
unsafe impl Sync for D3D12DescriptorHeap {}

fn heap_properties(kind: HeapKind) -> D3D12_HEAP_PROPERTIES {
    match kind {
        HeapKind::GpuOnly => D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        },
        HeapKind::CpuToGpu => D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_CUSTOM,
            CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_WRITE_COMBINE,
            MemoryPoolPreference: D3D12_MEMORY_POOL_L0,
            ..Default::default()
        },
        HeapKind::GpuToCpu => D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_CUSTOM,
            CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_WRITE_BACK,
            MemoryPoolPreference: D3D12_MEMORY_POOL_L0,
            ..Default::default()
        },
    }
}

fn heap_flags(category: HeapCategory) -> D3D12_HEAP_FLAGS {
    match category {
        HeapCategory::All => D3D12_HEAP_FLAG_NONE,
        HeapCategory::Buffer => D3D12_HEAP_FLAG_ALLOW_ONLY_BUFFERS,
        HeapCategory::RtvDsvTexture => D3D12_HEAP_FLAG_ALLOW_ONLY_RT_DS_TEXTURES,
        HeapCategory::OtherTexture => D3D12_HEAP_FLAG_ALLOW_ONLY_NON_RT_DS_TEXTURES,
    }
}

fn resource_desc(desc: &ResourceDesc<'_>) -> D3D12_RESOURCE_DESC {
    let flags = D3D12_RESOURCE_FLAGS(desc.flags.bits() as _);
    match desc.dimension {
        ResourceDimension::Buffer => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: desc.size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: flags,
        },
        ResourceDimension::Texture2D {
            width,
            height,
            array_size,
            mip_levels,
            format,
        } => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: u64::from(width),
            Height: height,
            DepthOrArraySize: array_size.max(1),
            MipLevels: mip_levels.max(1),
            Format: DXGI_FORMAT(format as _),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: flags,
        },
    }
}

fn initial_state(kind: HeapKind, desc: &ResourceDesc<'_>) -> D3D12_RESOURCE_STATES {
    let state = match kind {
        HeapKind::CpuToGpu => ResourceStates::GENERIC_READ,
        HeapKind::GpuToCpu => ResourceStates::COPY_DEST,
        HeapKind::GpuOnly => desc.initial_state,
    };
    D3D12_RESOURCE_STATES(state.bits() as _)
}

fn descriptor_heap_type(heap_type: DescriptorHeapType) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match heap_type {
        DescriptorHeapType::Standard => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapType::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapType::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapType::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

/// A [`DeviceBackend`] creating real D3D12 heaps, resources and descriptor heaps.
#[derive(Debug)]
pub struct D3D12Backend {
    device: ID3D12Device,
}

// See the native wrappers above.
unsafe impl Send for D3D12Backend {}
unsafe impl Sync for D3D12Backend {}

impl D3D12Backend {
    pub fn new(device: ID3D12Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.device
    }

    fn wrap_resource(&self, resource: ID3D12Resource, kind: HeapKind, size: u64) -> Result<ResourceHandle> {
        let gpu_address = unsafe { resource.GetGPUVirtualAddress() };

        let mapped_ptr = if kind.is_cpu_visible() {
            let mut ptr: *mut c_void = std::ptr::null_mut();
            unsafe { resource.Map(0, None, Some(&mut ptr)) }.map_err(|err| {
                AllocationError::FailedToMap(format!("ID3D12Resource::Map failed: {}", err))
            })?;
            Some(NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
                AllocationError::FailedToMap("ID3D12Resource::Map returned null".into())
            })?)
        } else {
            None
        };

        Ok(ResourceHandle::new(
            size,
            gpu_address,
            mapped_ptr,
            Arc::new(D3D12Resource(resource)),
        ))
    }
}

impl DeviceBackend for D3D12Backend {
    fn create_heap(&self, desc: &HeapCreateDesc<'_>) -> Result<HeapHandle> {
        let heap_desc = D3D12_HEAP_DESC {
            SizeInBytes: desc.size,
            Properties: heap_properties(desc.kind),
            Alignment: desc
                .alignment
                .max(u64::from(D3D12_DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT)),
            Flags: heap_flags(desc.category),
        };

        let mut heap: Option<ID3D12Heap> = None;
        unsafe { self.device.CreateHeap(&heap_desc, &mut heap) }
            .map_err(|err| map_error(err, "ID3D12Device::CreateHeap"))?;
        let heap = heap.ok_or_else(|| {
            AllocationError::Internal("CreateHeap succeeded without a heap".into())
        })?;

        debug!("D3D12 heap `{}` created: {} bytes", desc.name, desc.size);

        // Heaps have no address of their own; placed resources do.
        Ok(HeapHandle::new(
            desc.size,
            desc.kind,
            0,
            None,
            Arc::new(D3D12Heap(heap)),
        ))
    }

    fn create_placed_resource(
        &self,
        heap: &HeapHandle,
        offset: u64,
        desc: &ResourceDesc<'_>,
    ) -> Result<ResourceHandle> {
        let native = heap.native::<D3D12Heap>().ok_or_else(|| {
            AllocationError::Backend("Heap wasn't created by the D3D12 backend".into())
        })?;

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreatePlacedResource(
                &native.0,
                offset,
                &resource_desc(desc),
                initial_state(heap.kind(), desc),
                None,
                &mut resource,
            )
        }
        .map_err(|err| map_error(err, "ID3D12Device::CreatePlacedResource"))?;
        let resource = resource.ok_or_else(|| {
            AllocationError::Internal("CreatePlacedResource succeeded without a resource".into())
        })?;

        self.wrap_resource(resource, heap.kind(), desc.size)
    }

    fn create_standalone_resource(
        &self,
        kind: HeapKind,
        desc: &ResourceDesc<'_>,
    ) -> Result<ResourceHandle> {
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap_properties(kind),
                D3D12_HEAP_FLAG_NONE,
                &resource_desc(desc),
                initial_state(kind, desc),
                None,
                &mut resource,
            )
        }
        .map_err(|err| map_error(err, "ID3D12Device::CreateCommittedResource"))?;
        let resource = resource.ok_or_else(|| {
            AllocationError::Internal("CreateCommittedResource succeeded without a resource".into())
        })?;

        debug!("D3D12 committed resource `{}`: {} bytes", desc.name, desc.size);
        self.wrap_resource(resource, kind, desc.size)
    }

    fn create_descriptor_heap(
        &self,
        desc: &DescriptorHeapDesc<'_>,
    ) -> Result<DescriptorHeapHandle> {
        let heap_type = descriptor_heap_type(desc.heap_type);
        let heap: ID3D12DescriptorHeap = unsafe {
            self.device.CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: heap_type,
                NumDescriptors: desc.num_descriptors,
                Flags: if desc.shader_visible {
                    D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                } else {
                    D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                },
                NodeMask: 0,
            })
        }
        .map_err(|err| map_error(err, "ID3D12Device::CreateDescriptorHeap"))?;

        let descriptor_size = unsafe { self.device.GetDescriptorHandleIncrementSize(heap_type) };
        let cpu_base = CpuDescriptorHandle {
            ptr: unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr,
        };
        let gpu_base = desc.shader_visible.then(|| GpuDescriptorHandle {
            ptr: unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr,
        });

        Ok(DescriptorHeapHandle::new(
            desc.heap_type,
            desc.num_descriptors,
            descriptor_size,
            cpu_base,
            gpu_base,
            Arc::new(D3D12DescriptorHeap(heap)),
        ))
    }

    fn copy_descriptors(
        &self,
        dst: CpuDescriptorHandle,
        src: &[CpuDescriptorHandle],
        heap_type: DescriptorHeapType,
    ) {
        let d3d12_heap_type = descriptor_heap_type(heap_type);
        let increment = unsafe { self.device.GetDescriptorHandleIncrementSize(d3d12_heap_type) };
        for (i, src) in src.iter().enumerate() {
            let dst = dst.offset(i as u32, increment);
            unsafe {
                self.device.CopyDescriptorsSimple(
                    1,
                    D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dst.ptr },
                    D3D12_CPU_DESCRIPTOR_HANDLE { ptr: src.ptr },
                    d3d12_heap_type,
                )
            };
        }
    }
}

/// A [`FenceTimeline`] over an `ID3D12Fence` signaled by one command queue.
#[derive(Debug)]
pub struct D3D12FenceTimeline {
    fence: ID3D12Fence,
    next_value: AtomicU64,
}

unsafe impl Send for D3D12FenceTimeline {}
unsafe impl Sync for D3D12FenceTimeline {}

impl D3D12FenceTimeline {
    pub fn new(device: &ID3D12Device) -> Result<Self> {
        let fence: ID3D12Fence = unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }
            .map_err(|err| map_error(err, "ID3D12Device::CreateFence"))?;
        Ok(Self {
            fence,
            next_value: AtomicU64::new(1),
        })
    }

    pub fn fence(&self) -> &ID3D12Fence {
        &self.fence
    }

    /// Signals the current submission fence on `queue` after the work submitted so far, and
    /// returns it.
    pub fn signal(&self, queue: &ID3D12CommandQueue) -> Result<u64> {
        let value = self.next_value.fetch_add(1, Ordering::AcqRel);
        unsafe { queue.Signal(&self.fence, value) }
            .map_err(|err| map_error(err, "ID3D12CommandQueue::Signal"))?;
        Ok(value)
    }
}

impl FenceTimeline for D3D12FenceTimeline {
    fn current_submission_fence(&self) -> u64 {
        self.next_value.load(Ordering::Acquire)
    }

    fn completed_fence(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }
}
