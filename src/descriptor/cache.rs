use std::fmt;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use super::{
    ConservativeMap, CpuDescriptorHandle, DescriptorHeapHandle, DescriptorHeapType,
    GlobalOnlineSamplerHeap, GpuDescriptorHandle, HeapRollOver, LocalOnlineHeap,
    OnlineDescriptorManager, OnlineHeap, SamplerArrayDesc, SamplerState, SubAllocatedOnlineHeap,
    MAX_SAMPLERS_PER_TABLE,
};
use crate::backend::DeviceBackend;
use crate::fence::FenceTimeline;
use crate::{AllocationError, Result};

/// Invoked with the heap type whenever the context's shader-visible heap of that type changes.
///
/// The receiver must mark every bound descriptor table of that type dirty.
pub type RollOverCallback = Box<dyn FnMut(DescriptorHeapType) + Send>;

#[derive(Clone, Debug)]
pub struct DescriptorCacheDesc<'a> {
    pub name: &'a str,
    /// Size of the private view heap used once the global heap is exhausted.
    pub local_view_heap_size: u32,
    pub local_sampler_heap_size: u32,
    /// Slots of the map deduplicating tables in the local sampler heap.
    pub local_sampler_map_size: usize,
}

impl Default for DescriptorCacheDesc<'_> {
    fn default() -> Self {
        Self {
            name: "Descriptor cache",
            local_view_heap_size: 16 * 1024,
            local_sampler_heap_size: 2048,
            local_sampler_map_size: 256,
        }
    }
}

/// Per-context front-end of the online descriptor heaps.
///
/// Views are written into a block of the global online heap; once the global heap has no block
/// left the cache switches to a private [`LocalOnlineHeap`]. Sampler tables come from the shared
/// [`GlobalOnlineSamplerHeap`] until it is full, then from a local sampler heap deduplicated
/// through a [`ConservativeMap`]. Every heap change is reported to the [`RollOverCallback`].
pub struct DescriptorCache {
    name: String,
    local_view_heap_size: u32,
    local_sampler_heap_size: u32,
    backend: Arc<dyn DeviceBackend>,
    timeline: Arc<dyn FenceTimeline>,
    view_heap: Box<dyn OnlineHeap>,
    using_local_view_heap: bool,
    global_sampler_heap: Arc<Mutex<GlobalOnlineSamplerHeap>>,
    local_sampler_heap: Option<LocalOnlineHeap>,
    local_sampler_map: ConservativeMap<SamplerArrayDesc, u32>,
    on_roll_over: Option<RollOverCallback>,
}

impl DescriptorCache {
    pub fn new(
        desc: &DescriptorCacheDesc<'_>,
        online_views: Arc<OnlineDescriptorManager>,
        global_sampler_heap: Arc<Mutex<GlobalOnlineSamplerHeap>>,
        backend: Arc<dyn DeviceBackend>,
        timeline: Arc<dyn FenceTimeline>,
    ) -> Result<Self> {
        let (view_heap, using_local_view_heap): (Box<dyn OnlineHeap>, bool) =
            match SubAllocatedOnlineHeap::new(online_views) {
                Ok(heap) => (Box::new(heap), false),
                Err(AllocationError::HeapExhausted) => (
                    Box::new(Self::create_local_view_heap(
                        desc.name,
                        desc.local_view_heap_size,
                        &backend,
                        &timeline,
                    )?),
                    true,
                ),
                Err(err) => return Err(err),
            };

        Ok(Self {
            name: desc.name.to_owned(),
            local_view_heap_size: desc.local_view_heap_size,
            local_sampler_heap_size: desc.local_sampler_heap_size,
            backend,
            timeline,
            view_heap,
            using_local_view_heap,
            global_sampler_heap,
            local_sampler_heap: None,
            local_sampler_map: ConservativeMap::new(desc.local_sampler_map_size),
            on_roll_over: None,
        })
    }

    fn create_local_view_heap(
        name: &str,
        size: u32,
        backend: &Arc<dyn DeviceBackend>,
        timeline: &Arc<dyn FenceTimeline>,
    ) -> Result<LocalOnlineHeap> {
        warn!(
            "Descriptor cache `{}` has no global view block, using a local heap",
            name
        );
        LocalOnlineHeap::new(
            &format!("{} views", name),
            DescriptorHeapType::Standard,
            size,
            backend.clone(),
            timeline.clone(),
        )
    }

    pub fn set_roll_over_callback(&mut self, callback: RollOverCallback) {
        self.on_roll_over = Some(callback);
    }

    fn notify_heap_changed(&mut self, heap_type: DescriptorHeapType) {
        if let Some(callback) = &mut self.on_roll_over {
            callback(heap_type);
        }
    }

    /// The view heap draws currently have to bind.
    pub fn view_heap(&self) -> &DescriptorHeapHandle {
        self.view_heap.heap()
    }

    /// The sampler heap draws currently have to bind.
    pub fn sampler_heap(&self) -> DescriptorHeapHandle {
        match &self.local_sampler_heap {
            Some(local) => local.heap().clone(),
            None => self.global_sampler_heap.lock().heap().clone(),
        }
    }

    pub fn is_using_local_view_heap(&self) -> bool {
        self.using_local_view_heap
    }

    pub fn is_using_local_sampler_heap(&self) -> bool {
        self.local_sampler_heap.is_some()
    }

    /// Copies `views` into consecutive online slots and returns the GPU handle of the table.
    pub fn build_view_table(&mut self, views: &[CpuDescriptorHandle]) -> Result<GpuDescriptorHandle> {
        let count = views.len() as u32;
        if count == 0 || count > self.local_view_heap_size.max(self.view_heap.capacity()) {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        if !self.view_heap.can_reserve_slots(count) {
            self.roll_over_view_heap(count)?;
            if !self.view_heap.can_reserve_slots(count) {
                return Err(AllocationError::HeapExhausted);
            }
        }

        let first_slot = self.view_heap.reserve_slots(count);
        self.backend.copy_descriptors(
            self.view_heap.cpu_slot_handle(first_slot),
            views,
            DescriptorHeapType::Standard,
        );
        Ok(self.view_heap.gpu_slot_handle(first_slot))
    }

    fn roll_over_view_heap(&mut self, count: u32) -> Result<()> {
        let heap_changed = match self.view_heap.roll_over() {
            Ok(HeapRollOver::SameHeap) => false,
            Ok(HeapRollOver::HeapChanged) => true,
            Err(AllocationError::HeapExhausted) => {
                self.switch_to_local_view_heap()?;
                true
            }
            Err(err) => return Err(err),
        };

        // A global block can be smaller than the table.
        let heap_changed = if !self.using_local_view_heap && !self.view_heap.can_reserve_slots(count)
        {
            self.switch_to_local_view_heap()?;
            true
        } else {
            heap_changed
        };

        if heap_changed {
            self.notify_heap_changed(DescriptorHeapType::Standard);
        }
        Ok(())
    }

    fn switch_to_local_view_heap(&mut self) -> Result<()> {
        let heap = Self::create_local_view_heap(
            &self.name,
            self.local_view_heap_size,
            &self.backend,
            &self.timeline,
        )?;
        self.view_heap = Box::new(heap);
        self.using_local_view_heap = true;
        Ok(())
    }

    /// Returns the GPU handle of a table holding `samplers`, reusing an identical table
    /// written earlier where possible.
    pub fn build_sampler_table(&mut self, samplers: &[SamplerState]) -> Result<GpuDescriptorHandle> {
        let count = samplers.len() as u32;
        if count == 0
            || samplers.len() > MAX_SAMPLERS_PER_TABLE
            || count > self.local_sampler_heap_size
        {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        if self.local_sampler_heap.is_none() {
            if let Some(table) = self.global_sampler_heap.lock().get_or_create_table(samplers)? {
                return Ok(table.gpu_handle);
            }

            warn!(
                "Descriptor cache `{}`: global sampler heap is full, using a local heap",
                self.name
            );
            self.local_sampler_heap = Some(LocalOnlineHeap::new(
                &format!("{} samplers", self.name),
                DescriptorHeapType::Sampler,
                self.local_sampler_heap_size,
                self.backend.clone(),
                self.timeline.clone(),
            )?);
            self.notify_heap_changed(DescriptorHeapType::Sampler);
        }

        let key = SamplerArrayDesc::new(samplers);
        let Some(heap) = self.local_sampler_heap.as_mut() else {
            return Err(AllocationError::Internal(
                "Local sampler heap must be Some.".into(),
            ));
        };

        if let Some(&first_slot) = self.local_sampler_map.get(&key) {
            return Ok(heap.gpu_slot_handle(first_slot));
        }

        let mut heap_changed = false;
        if !heap.can_reserve_slots(count) {
            heap_changed = heap.roll_over()? == HeapRollOver::HeapChanged;
            if !heap.can_reserve_slots(count) {
                return Err(AllocationError::HeapExhausted);
            }
        }
        if heap_changed {
            // Slots of the previous heap mean nothing in the new one.
            self.local_sampler_map.reset();
        }

        let first_slot = heap.reserve_slots(count);
        let sources = samplers
            .iter()
            .map(|sampler| sampler.descriptor)
            .collect::<Vec<_>>();
        self.backend.copy_descriptors(
            heap.cpu_slot_handle(first_slot),
            &sources,
            DescriptorHeapType::Sampler,
        );
        let gpu_handle = heap.gpu_slot_handle(first_slot);
        self.local_sampler_map.insert(key, first_slot);

        if heap_changed {
            self.notify_heap_changed(DescriptorHeapType::Sampler);
        }
        Ok(gpu_handle)
    }
}

impl fmt::Debug for DescriptorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorCache")
            .field("name", &self.name)
            .field("view_heap", &self.view_heap)
            .field("using_local_view_heap", &self.using_local_view_heap)
            .field("local_sampler_heap", &self.local_sampler_heap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::descriptor::OfflineDescriptorManager;
    use crate::fence::ManualFenceTimeline;

    struct Context {
        backend: Arc<HostBackend>,
        timeline: Arc<ManualFenceTimeline>,
        offline: OfflineDescriptorManager,
        online_views: Arc<OnlineDescriptorManager>,
        global_samplers: Arc<Mutex<GlobalOnlineSamplerHeap>>,
    }

    impl Context {
        fn new(view_blocks: u32, global_samplers: u32) -> Self {
            let backend = Arc::new(HostBackend::new());
            let timeline = Arc::new(ManualFenceTimeline::new());
            let offline = OfflineDescriptorManager::new(
                "offline",
                DescriptorHeapType::Standard,
                64,
                backend.clone(),
            );
            let online_views = Arc::new(
                OnlineDescriptorManager::new(
                    "global views",
                    DescriptorHeapType::Standard,
                    4,
                    view_blocks,
                    backend.as_ref(),
                    timeline.clone(),
                )
                .unwrap(),
            );
            let global_samplers = Arc::new(Mutex::new(
                GlobalOnlineSamplerHeap::new("global samplers", global_samplers, backend.clone())
                    .unwrap(),
            ));
            Self {
                backend,
                timeline,
                offline,
                online_views,
                global_samplers,
            }
        }

        fn cache(&self) -> DescriptorCache {
            DescriptorCache::new(
                &DescriptorCacheDesc {
                    name: "context",
                    local_view_heap_size: 8,
                    local_sampler_heap_size: 4,
                    local_sampler_map_size: 16,
                },
                self.online_views.clone(),
                self.global_samplers.clone(),
                self.backend.clone(),
                self.timeline.clone(),
            )
            .unwrap()
        }

        fn views(&self, count: usize) -> Vec<CpuDescriptorHandle> {
            (0..count)
                .map(|_| self.offline.allocate().unwrap().handle)
                .collect()
        }

        fn samplers(&self, ids: &[u32]) -> Vec<SamplerState> {
            ids.iter()
                .map(|&id| SamplerState {
                    id,
                    descriptor: self.offline.allocate().unwrap().handle,
                })
                .collect()
        }
    }

    fn recording_callback() -> (Arc<Mutex<Vec<DescriptorHeapType>>>, RollOverCallback) {
        let events = Arc::new(Mutex::new(vec![]));
        let sink = events.clone();
        (
            events,
            Box::new(move |heap_type| sink.lock().push(heap_type)),
        )
    }

    #[test]
    fn sampler_tables_hit_the_global_heap_without_copies() {
        let context = Context::new(2, 8);
        let mut cache = context.cache();
        let samplers = context.samplers(&[3, 4]);

        let first = cache.build_sampler_table(&samplers).unwrap();
        let copies = context.backend.descriptor_copies();
        let second = cache.build_sampler_table(&samplers).unwrap();

        assert_eq!(first, second);
        assert_eq!(context.backend.descriptor_copies(), copies);
        assert!(!cache.is_using_local_sampler_heap());

        let other = cache.build_sampler_table(&context.samplers(&[4, 3])).unwrap();
        assert_ne!(other, first);
    }

    #[test]
    fn full_global_sampler_heap_falls_back_to_local_heap() {
        let _ = env_logger::builder().is_test(true).try_init();
        let context = Context::new(2, 2);
        let mut cache = context.cache();
        let (events, callback) = recording_callback();
        cache.set_roll_over_callback(callback);

        cache.build_sampler_table(&context.samplers(&[1, 2])).unwrap();
        let local = context.samplers(&[5, 6]);
        let a = cache.build_sampler_table(&local).unwrap();
        assert!(cache.is_using_local_sampler_heap());
        assert_eq!(*events.lock(), vec![DescriptorHeapType::Sampler]);

        let copies = context.backend.descriptor_copies();
        let b = cache.build_sampler_table(&local).unwrap();
        assert_eq!(a, b);
        assert_eq!(context.backend.descriptor_copies(), copies);

        // Fills the local heap and forces a roll-over.
        cache.build_sampler_table(&context.samplers(&[7, 8])).unwrap();
        cache.build_sampler_table(&context.samplers(&[9])).unwrap();
        assert_eq!(
            *events.lock(),
            vec![DescriptorHeapType::Sampler, DescriptorHeapType::Sampler]
        );
    }

    #[test]
    fn view_tables_roll_over_blocks_then_switch_to_local_heap() {
        let _ = env_logger::builder().is_test(true).try_init();
        let context = Context::new(2, 8);
        let mut cache = context.cache();
        let (events, callback) = recording_callback();
        cache.set_roll_over_callback(callback);

        let views = context.views(4);
        let first = cache.build_view_table(&views).unwrap();
        let second = cache.build_view_table(&views).unwrap();
        // Next block of the same heap: nothing to re-bind.
        assert_eq!(
            second.ptr - first.ptr,
            4 * u64::from(HostBackend::DESCRIPTOR_SIZE)
        );
        assert!(events.lock().is_empty());

        // Both global blocks are in use or fenced.
        cache.build_view_table(&views).unwrap();
        assert!(cache.is_using_local_view_heap());
        assert_eq!(*events.lock(), vec![DescriptorHeapType::Standard]);
    }

    #[test]
    fn cache_starts_local_when_global_heap_is_exhausted() {
        let context = Context::new(1, 8);
        let _first = context.cache();
        let second = context.cache();
        assert!(second.is_using_local_view_heap());
    }

    #[test]
    fn oversized_sampler_tables_are_rejected() {
        let context = Context::new(2, 64);
        let mut cache = DescriptorCache::new(
            &DescriptorCacheDesc {
                name: "context",
                local_sampler_heap_size: 2048,
                ..Default::default()
            },
            context.online_views.clone(),
            context.global_samplers.clone(),
            context.backend.clone(),
            context.timeline.clone(),
        )
        .unwrap();

        let ids = (0..MAX_SAMPLERS_PER_TABLE as u32 + 1).collect::<Vec<_>>();
        assert!(matches!(
            cache.build_sampler_table(&context.samplers(&ids)),
            Err(AllocationError::InvalidAllocationCreateDesc)
        ));
        assert!(matches!(
            cache.build_sampler_table(&[]),
            Err(AllocationError::InvalidAllocationCreateDesc)
        ));
        assert!(cache
            .build_sampler_table(&context.samplers(&ids[..MAX_SAMPLERS_PER_TABLE]))
            .is_ok());
        assert!(!cache.is_using_local_sampler_heap());
    }
}
