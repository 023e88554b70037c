use std::collections::HashMap;
use std::sync::Arc;

use foldhash::fast::RandomState;

use super::{
    CpuDescriptorHandle, DescriptorHeapHandle, DescriptorHeapType, GpuDescriptorHandle,
    HeapRollOver, OnlineHeap,
};
use crate::backend::{DescriptorHeapDesc, DeviceBackend};
use crate::{AllocationError, Result};

pub const MAX_SAMPLERS_PER_TABLE: usize = 16;

/// A sampler known to the renderer: a stable id plus its CPU-only descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerState {
    pub id: u32,
    pub descriptor: CpuDescriptorHandle,
}

/// The sampler ids of one descriptor table; the dedup key of sampler tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerArrayDesc {
    count: u32,
    ids: [u32; MAX_SAMPLERS_PER_TABLE],
}

impl SamplerArrayDesc {
    pub fn new(samplers: &[SamplerState]) -> Self {
        assert!(
            samplers.len() <= MAX_SAMPLERS_PER_TABLE,
            "Sampler tables hold at most {} samplers",
            MAX_SAMPLERS_PER_TABLE
        );

        let mut ids = [0; MAX_SAMPLERS_PER_TABLE];
        for (id, sampler) in ids.iter_mut().zip(samplers) {
            *id = sampler.id;
        }
        Self {
            count: samplers.len() as u32,
            ids,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids[..self.count as usize]
    }
}

/// A sampler table written once into the global sampler heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniqueDescriptorTable {
    pub key: SamplerArrayDesc,
    pub first_slot: u32,
    pub cpu_handle: CpuDescriptorHandle,
    pub gpu_handle: GpuDescriptorHandle,
}

/// Shader-visible sampler heap shared by every context.
///
/// Tables are deduplicated by their sampler ids: requesting the same ids again returns the
/// table written the first time. The heap never rolls over, so once it is full new tables have
/// to come from a context's local sampler heap. Share it as `Arc<Mutex<_>>`.
#[derive(Debug)]
pub struct GlobalOnlineSamplerHeap {
    name: String,
    heap: DescriptorHeapHandle,
    next_slot: u32,
    backend: Arc<dyn DeviceBackend>,
    tables: HashMap<SamplerArrayDesc, UniqueDescriptorTable, RandomState>,
}

impl GlobalOnlineSamplerHeap {
    pub fn new(name: &str, num_descriptors: u32, backend: Arc<dyn DeviceBackend>) -> Result<Self> {
        let heap = backend.create_descriptor_heap(&DescriptorHeapDesc {
            name,
            heap_type: DescriptorHeapType::Sampler,
            num_descriptors,
            shader_visible: true,
        })?;

        Ok(Self {
            name: name.to_owned(),
            heap,
            next_slot: 0,
            backend,
            tables: HashMap::default(),
        })
    }

    /// Returns the table holding exactly `samplers`, writing it on first use.
    ///
    /// Returns [`None`] if the table is new and the heap has no room left for it, and an error
    /// for an empty table or one above [`MAX_SAMPLERS_PER_TABLE`].
    pub fn get_or_create_table(
        &mut self,
        samplers: &[SamplerState],
    ) -> Result<Option<UniqueDescriptorTable>> {
        if samplers.is_empty() || samplers.len() > MAX_SAMPLERS_PER_TABLE {
            return Err(AllocationError::InvalidAllocationCreateDesc);
        }

        let key = SamplerArrayDesc::new(samplers);
        if let Some(table) = self.tables.get(&key) {
            return Ok(Some(*table));
        }

        let count = key.count();
        if !self.can_reserve_slots(count) {
            return Ok(None);
        }

        let first_slot = self.reserve_slots(count);
        let cpu_handle = self.cpu_slot_handle(first_slot);
        let sources = samplers
            .iter()
            .map(|sampler| sampler.descriptor)
            .collect::<Vec<_>>();
        self.backend
            .copy_descriptors(cpu_handle, &sources, DescriptorHeapType::Sampler);

        let table = UniqueDescriptorTable {
            key,
            first_slot,
            cpu_handle,
            gpu_handle: self.gpu_slot_handle(first_slot),
        };
        self.tables.insert(key, table);
        Ok(Some(table))
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

impl OnlineHeap for GlobalOnlineSamplerHeap {
    fn heap(&self) -> &DescriptorHeapHandle {
        &self.heap
    }

    fn capacity(&self) -> u32 {
        self.heap.num_descriptors()
    }

    fn next_slot(&self) -> u32 {
        self.next_slot
    }

    fn set_next_slot(&mut self, next_slot: u32) {
        self.next_slot = next_slot;
    }

    fn roll_over(&mut self) -> Result<HeapRollOver> {
        panic!(
            "Global sampler heap `{}` can't roll over: its tables are shared by every context",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::descriptor::OfflineDescriptorManager;
    use parking_lot::Mutex;

    fn samplers(
        offline: &OfflineDescriptorManager,
        ids: &[u32],
    ) -> Vec<SamplerState> {
        ids.iter()
            .map(|&id| SamplerState {
                id,
                descriptor: offline.allocate().unwrap().handle,
            })
            .collect()
    }

    #[test]
    fn identical_tables_are_written_once() {
        let backend = Arc::new(HostBackend::new());
        let offline =
            OfflineDescriptorManager::new("samplers", DescriptorHeapType::Sampler, 16, backend.clone());
        let mut heap = GlobalOnlineSamplerHeap::new("global samplers", 8, backend.clone()).unwrap();

        let linear_point = samplers(&offline, &[1, 2]);
        let a = heap.get_or_create_table(&linear_point).unwrap().unwrap();
        let b = heap.get_or_create_table(&linear_point).unwrap().unwrap();
        assert_eq!(a.gpu_handle, b.gpu_handle);
        assert_eq!(backend.descriptor_copies(), 2);

        let point_linear = samplers(&offline, &[2, 1]);
        let c = heap.get_or_create_table(&point_linear).unwrap().unwrap();
        assert_ne!(c.gpu_handle, a.gpu_handle);
        assert_eq!(heap.table_count(), 2);
        assert_eq!(heap.next_slot(), 4);
    }

    #[test]
    fn full_heap_reports_no_table() {
        let backend = Arc::new(HostBackend::new());
        let offline =
            OfflineDescriptorManager::new("samplers", DescriptorHeapType::Sampler, 16, backend.clone());
        let mut heap = GlobalOnlineSamplerHeap::new("global samplers", 2, backend).unwrap();

        let table = |heap: &mut GlobalOnlineSamplerHeap, ids: &[u32]| {
            heap.get_or_create_table(&samplers(&offline, ids)).unwrap()
        };
        assert!(table(&mut heap, &[1, 2]).is_some());
        assert!(table(&mut heap, &[3]).is_none());
        // Known tables still resolve.
        assert!(table(&mut heap, &[1, 2]).is_some());
    }

    #[test]
    #[should_panic(expected = "can't roll over")]
    fn global_sampler_heap_never_rolls_over() {
        let mut heap =
            GlobalOnlineSamplerHeap::new("global samplers", 2, Arc::new(HostBackend::new()))
                .unwrap();
        let _ = heap.roll_over();
    }

    #[test]
    fn array_desc_only_compares_used_ids() {
        let a = SamplerArrayDesc::new(&[SamplerState {
            id: 7,
            descriptor: CpuDescriptorHandle::default(),
        }]);
        assert_eq!(a.ids(), &[7]);
        assert_eq!(a.count(), 1);
    }

    #[test]
    fn empty_and_oversized_tables_are_rejected() {
        let backend = Arc::new(HostBackend::new());
        let offline =
            OfflineDescriptorManager::new("samplers", DescriptorHeapType::Sampler, 32, backend.clone());
        let mut heap = GlobalOnlineSamplerHeap::new("global samplers", 64, backend).unwrap();

        assert!(matches!(
            heap.get_or_create_table(&[]),
            Err(AllocationError::InvalidAllocationCreateDesc)
        ));
        let ids = (0..MAX_SAMPLERS_PER_TABLE as u32 + 1).collect::<Vec<_>>();
        assert!(matches!(
            heap.get_or_create_table(&samplers(&offline, &ids)),
            Err(AllocationError::InvalidAllocationCreateDesc)
        ));
        assert_eq!(heap.next_slot(), 0);

        let table = heap
            .get_or_create_table(&samplers(&offline, &ids[..MAX_SAMPLERS_PER_TABLE]))
            .unwrap()
            .unwrap();
        assert_eq!(table.key.count(), MAX_SAMPLERS_PER_TABLE as u32);
    }

    #[test]
    fn shared_heap_dedups_tables_across_threads() {
        let backend = Arc::new(HostBackend::new());
        let offline =
            OfflineDescriptorManager::new("samplers", DescriptorHeapType::Sampler, 16, backend.clone());
        let heap = Mutex::new(GlobalOnlineSamplerHeap::new("global samplers", 64, backend).unwrap());
        let tables = [samplers(&offline, &[1, 2]), samplers(&offline, &[3])];

        let handles = std::thread::scope(|scope| {
            let workers = (0..8)
                .map(|thread| {
                    let heap = &heap;
                    let tables = &tables;
                    scope.spawn(move || {
                        (0..100)
                            .map(|i| {
                                let samplers = &tables[(thread + i) % tables.len()];
                                let table = heap.lock().get_or_create_table(samplers).unwrap();
                                (samplers[0].id, table.unwrap().gpu_handle)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect::<Vec<_>>()
        });

        let heap = heap.into_inner();
        assert_eq!(heap.table_count(), 2);
        assert_eq!(heap.next_slot(), 3);
        for (id, gpu_handle) in &handles {
            let expected = handles.iter().find(|(other, _)| other == id).unwrap().1;
            assert_eq!(*gpu_handle, expected);
        }
    }
}
