use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, ResourceDesc};
use crate::deferred::{FrameFenced, FrameFencedQueue};
use crate::fence::FenceTimeline;
use crate::math::align_up;
use crate::resource::{ResourceHolder, ResourceLocation, ResourceStateMode};
use crate::{AllocationError, HeapKind, Result};

#[derive(Clone, Debug)]
pub struct FastAllocatorDesc<'a> {
    pub name: &'a str,
    pub heap_kind: HeapKind,
    pub page_size: u64,
}

impl Default for FastAllocatorDesc<'_> {
    fn default() -> Self {
        Self {
            name: "Fast allocator",
            heap_kind: HeapKind::CpuToGpu,
            page_size: 64 * 1024,
        }
    }
}

/// One page of a [`FastAllocator`]: a standalone buffer plus its bump cursor.
#[derive(Debug)]
pub struct FastAllocatorPage {
    holder: Arc<ResourceHolder>,
    next_offset: u64,
    frame_fence: u64,
}

impl FastAllocatorPage {
    pub fn resource(&self) -> &Arc<ResourceHolder> {
        &self.holder
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }
}

impl FrameFenced for FastAllocatorPage {
    fn frame_fence(&self) -> u64 {
        self.frame_fence
    }
}

#[derive(Debug, Default)]
struct PagePoolInner {
    pending: FrameFencedQueue<FastAllocatorPage>,
    available: Vec<FastAllocatorPage>,
}

/// Pages shared by the [`FastAllocator`]s of several contexts.
///
/// A page handed back with [`Self::return_page()`] is stamped with the current submission fence
/// and only handed out again after [`Self::cleanup_pages()`] saw that fence complete.
#[derive(Debug)]
pub struct FastAllocatorPagePool {
    name: String,
    heap_kind: HeapKind,
    page_size: u64,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    pages_created: AtomicUsize,
    inner: Mutex<PagePoolInner>,
}

impl FastAllocatorPagePool {
    pub fn new(
        desc: &FastAllocatorDesc<'_>,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
    ) -> Result<Self> {
        if desc.page_size == 0 {
            return Err(AllocationError::InvalidAllocatorCreateDesc(
                "FastAllocatorDesc field `page_size` must not be zero.".into(),
            ));
        }

        Ok(Self {
            name: desc.name.to_owned(),
            heap_kind: desc.heap_kind,
            page_size: desc.page_size,
            backend,
            timeline,
            pages_created: AtomicUsize::new(0),
            inner: Mutex::new(PagePoolInner::default()),
        })
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn heap_kind(&self) -> HeapKind {
        self.heap_kind
    }

    /// Hands out a recycled page, or creates one when none is available.
    pub fn request_page(&self) -> Result<FastAllocatorPage> {
        if let Some(mut page) = self.inner.lock().available.pop() {
            page.next_offset = 0;
            return Ok(page);
        }

        let index = self.pages_created.fetch_add(1, Ordering::Relaxed);
        let name = format!("{} page {}", self.name, index);
        let desc = ResourceDesc::buffer(&name, self.page_size);
        let resource = self.create_resource(&desc)?;
        debug!("Fast allocator `{}` created page {}", self.name, index);

        Ok(FastAllocatorPage {
            holder: resource,
            next_offset: 0,
            frame_fence: 0,
        })
    }

    /// Takes `page` back; it becomes available once the current submission completed.
    pub fn return_page(&self, mut page: FastAllocatorPage) {
        page.frame_fence = self.timeline.current_submission_fence();
        self.inner.lock().pending.push(page);
    }

    /// Makes every page returned at least `frame_lag` submissions ago available again.
    /// Returns how many pages were recycled.
    pub fn cleanup_pages(&self, frame_lag: u64) -> usize {
        let completed_fence = self.timeline.completed_fence();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let available = &mut inner.available;
        inner
            .pending
            .drain_ready(completed_fence, frame_lag, |page| available.push(page))
    }

    pub fn pages_created(&self) -> usize {
        self.pages_created.load(Ordering::Relaxed)
    }

    pub fn available_page_count(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn pending_page_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn create_resource(&self, desc: &ResourceDesc<'_>) -> Result<Arc<ResourceHolder>> {
        let resource = self
            .backend
            .create_standalone_resource(self.heap_kind, desc)?;
        Ok(Arc::new(ResourceHolder::new(
            resource,
            None,
            self.heap_kind,
            desc,
            ResourceStateMode::SingleState,
        )))
    }
}

/// Per-context bump allocator over pages of a [`FastAllocatorPagePool`].
///
/// There is no per-allocation free: a location handed out by [`Self::allocate()`] is valid
/// until its page went back to the pool and got recycled.
#[derive(Debug)]
pub struct FastAllocator {
    pool: Arc<FastAllocatorPagePool>,
    current: Option<FastAllocatorPage>,
}

impl FastAllocator {
    pub fn new(pool: Arc<FastAllocatorPagePool>) -> Self {
        Self {
            pool,
            current: None,
        }
    }

    pub fn pool(&self) -> &Arc<FastAllocatorPagePool> {
        &self.pool
    }

    /// Allocates `size` bytes aligned to `alignment` and returns the CPU pointer of the
    /// allocation if the pool's heap is CPU-visible.
    ///
    /// Requests larger than a page get a standalone resource.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        location: &mut ResourceLocation,
    ) -> Result<Option<NonNull<u8>>> {
        location.clear();

        if size == 0 || !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        if size > self.pool.page_size {
            let desc = ResourceDesc::buffer(&self.pool.name, size);
            location.init_standalone(self.pool.create_resource(&desc)?);
            return Ok(location.mapped_ptr());
        }

        let fits = |page: &FastAllocatorPage| {
            align_up(page.next_offset, alignment) + size <= self.pool.page_size
        };
        let page = match self.current.take() {
            Some(page) if fits(&page) => page,
            Some(full) => {
                self.pool.return_page(full);
                self.pool.request_page()?
            }
            None => self.pool.request_page()?,
        };
        let page = self.current.insert(page);

        let offset = align_up(page.next_offset, alignment);
        page.next_offset = offset + size;
        location.init_fast_allocation(page.holder.clone(), offset, size);

        Ok(location.mapped_ptr())
    }

    /// Hands the current page back to the pool, e.g. at the end of a frame.
    pub fn flush(&mut self) {
        if let Some(page) = self.current.take() {
            self.pool.return_page(page);
        }
    }
}

impl Drop for FastAllocator {
    fn drop(&mut self) {
        self.flush();
    }
}
