use std::sync::Arc;

use super::*;
use crate::backend::HostBackend;
use crate::fence::ManualFenceTimeline;
use crate::resource::LocationKind;

const MIB: u64 = 1024 * 1024;

fn upload_desc() -> PoolAllocatorDesc<'static> {
    PoolAllocatorDesc {
        name: "upload pool",
        init_config: ResourceAllocatorInitConfig::new(
            HeapKind::CpuToGpu,
            ResourceFlags::empty(),
            BufferAccess::VERTEX,
        ),
        pool_size: MIB,
        pool_alignment: 256,
        max_allocation_size: MIB / 2,
        ..Default::default()
    }
}

fn setup(
    desc: &PoolAllocatorDesc<'_>,
) -> (
    Arc<HostBackend>,
    Arc<ManualFenceTimeline>,
    Arc<PoolAllocator>,
) {
    let backend = Arc::new(HostBackend::new());
    let timeline = Arc::new(ManualFenceTimeline::new());
    let allocator = PoolAllocator::new(
        desc,
        backend.clone(),
        timeline.clone(),
        AllocatorDebugSettings::default(),
    )
    .unwrap();
    (backend, timeline, Arc::new(allocator))
}

fn allocate(allocator: &Arc<PoolAllocator>, size: u64) -> ResourceLocation {
    let mut location = ResourceLocation::new();
    allocator
        .allocate_resource(&ResourceDesc::buffer("buffer", size), 256, &mut location)
        .unwrap();
    location
}

fn pool_offset(location: &ResourceLocation) -> u64 {
    location.pool_private_data().unwrap().offset
}

#[test]
fn freed_memory_waits_for_frame_lag() {
    let (_backend, timeline, allocator) = setup(&upload_desc());

    let mut location = allocate(&allocator, 4096);
    let offset = pool_offset(&location);
    let used = allocator.used_size();

    // Freed while recording submission 1.
    location.clear();
    assert_eq!(allocator.pending_operation_count(), 1);

    timeline.submit();
    timeline.submit();
    timeline.signal(2);

    // 1 + 2 > 2: still referenced as far as the allocator knows.
    allocator.cleanup_allocations(2);
    assert_eq!(allocator.pending_operation_count(), 1);
    assert_eq!(allocator.used_size(), used);
    let other = allocate(&allocator, 4096);
    assert_ne!(pool_offset(&other), offset);

    timeline.submit();
    timeline.signal(3);
    allocator.cleanup_allocations(2);
    assert_eq!(allocator.pending_operation_count(), 0);

    let reused = allocate(&allocator, 4096);
    assert_eq!(pool_offset(&reused), offset);
}

#[test]
fn sub_allocations_share_the_pool_buffer() {
    let (backend, _timeline, allocator) = setup(&upload_desc());

    let a = allocate(&allocator, 1000);
    let b = allocate(&allocator, 1000);

    assert_eq!(a.kind(), LocationKind::SubAllocation);
    assert!(allocator.is_owner(&a));
    assert!(Arc::ptr_eq(a.resource().unwrap(), b.resource().unwrap()));
    assert_eq!(b.offset_from_base_of_resource(), 1024);
    assert_eq!(b.gpu_address(), a.gpu_address() + 1024);
    assert_eq!(a.size(), 1000);
    assert_eq!(backend.heaps_created(), 1);

    let a_ptr = a.mapped_ptr().unwrap().as_ptr() as usize;
    let b_ptr = b.mapped_ptr().unwrap().as_ptr() as usize;
    assert_eq!(b_ptr - a_ptr, 1024);
}

#[test]
fn placed_strategy_creates_a_resource_per_allocation() {
    let (backend, timeline, allocator) = setup(&PoolAllocatorDesc {
        strategy: AllocationStrategy::PlacedResource,
        ..upload_desc()
    });

    let mut a = allocate(&allocator, 4096);
    let b = allocate(&allocator, 4096);
    assert_eq!(backend.resources_created(), 2);
    assert_eq!(a.offset_from_base_of_resource(), 0);
    assert!(!Arc::ptr_eq(a.resource().unwrap(), b.resource().unwrap()));
    assert!(a.resource().unwrap().is_placed());

    // The queued free keeps the placed resource alive.
    let resource = Arc::downgrade(a.resource().unwrap());
    a.clear();
    assert!(resource.upgrade().is_some());

    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);
    assert!(resource.upgrade().is_none());
}

#[test]
fn oversized_requests_become_standalone() {
    let (backend, _timeline, allocator) = setup(&upload_desc());

    let mut location = allocate(&allocator, MIB);
    assert_eq!(location.kind(), LocationKind::StandAlone);
    assert!(location.owner().is_none());
    assert_eq!(allocator.pool_count(), 0);
    assert_eq!(backend.live_bytes(), MIB);

    // Standalone resources are released straight away.
    location.clear();
    assert_eq!(allocator.pending_operation_count(), 0);
    assert_eq!(backend.live_bytes(), 0);
}

#[test]
fn exhausted_pools_grow_and_idle_pools_are_released() {
    let (backend, timeline, allocator) = setup(&upload_desc());

    let mut locations = (0..3)
        .map(|_| allocate(&allocator, MIB / 2))
        .collect::<Vec<_>>();
    assert_eq!(allocator.pool_count(), 2);
    assert_eq!(backend.heaps_created(), 2);
    assert_eq!(
        locations[2].pool_private_data().unwrap().pool_index,
        1,
        "first pool with room is used"
    );

    locations.clear();
    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);

    // The last pool is kept around for the next frame.
    assert_eq!(allocator.pool_count(), 1);
    assert_eq!(allocator.used_size(), 0);
    assert_eq!(backend.live_bytes(), MIB);
}

#[test]
fn deallocation_cancels_pending_unlock() {
    let (_backend, timeline, allocator) = setup(&upload_desc());

    let mut location = allocate(&allocator, 512);
    allocator.lock(&location);
    assert!(allocator.is_locked(&location));

    allocator.unlock_deferred(&location);
    assert!(allocator.is_locked(&location));

    allocator.deallocate(&mut location);
    assert_eq!(allocator.pending_operation_count(), 2);
    {
        let inner = allocator.inner.read();
        let operations = inner
            .frame_fenced_operations
            .iter()
            .map(|pending| pending.operation)
            .collect::<Vec<_>>();
        assert_eq!(
            operations,
            vec![FrameFencedOperation::Nop, FrameFencedOperation::Deallocate]
        );
    }

    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);
    assert_eq!(allocator.pending_operation_count(), 0);
    assert_eq!(allocator.used_size(), 0);
}

#[test]
fn unlock_executes_after_fence() {
    let (_backend, timeline, allocator) = setup(&upload_desc());

    let location = allocate(&allocator, 512);
    allocator.lock(&location);
    allocator.unlock_deferred(&location);

    allocator.cleanup_allocations(0);
    assert!(allocator.is_locked(&location));

    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);
    assert!(!allocator.is_locked(&location));
}

#[test]
fn supports_allocation_compares_configuration() {
    let (_backend, _timeline, allocator) = setup(&upload_desc());

    assert!(allocator.supports_allocation(
        HeapKind::CpuToGpu,
        ResourceFlags::empty(),
        BufferAccess::INDEX,
        ResourceStateMode::Default
    ));
    assert!(!allocator.supports_allocation(
        HeapKind::GpuOnly,
        ResourceFlags::empty(),
        BufferAccess::INDEX,
        ResourceStateMode::Default
    ));
    assert!(!allocator.supports_allocation(
        HeapKind::CpuToGpu,
        ResourceFlags::empty(),
        BufferAccess::UNORDERED_ACCESS,
        ResourceStateMode::Default
    ));
    assert!(!allocator.supports_allocation(
        HeapKind::CpuToGpu,
        ResourceFlags::empty(),
        BufferAccess::INDEX,
        ResourceStateMode::MultiState
    ));
}

#[test]
#[should_panic(expected = "owned by another allocator")]
fn foreign_deallocation_asserts() {
    let (_backend, _timeline, a) = setup(&upload_desc());
    let (_backend, _timeline, b) = setup(&upload_desc());

    let mut location = allocate(&a, 512);
    b.deallocate(&mut location);
}

#[test]
fn invalid_requests_are_rejected() {
    let (_backend, _timeline, allocator) = setup(&upload_desc());
    let mut location = ResourceLocation::new();

    assert!(matches!(
        allocator.allocate_resource(&ResourceDesc::buffer("empty", 0), 256, &mut location),
        Err(AllocationError::InvalidAllocationCreateDesc)
    ));
    assert!(matches!(
        allocator.allocate_resource(&ResourceDesc::buffer("odd", 64), 3, &mut location),
        Err(AllocationError::InvalidAllocationCreateDesc)
    ));

    let backend = Arc::new(HostBackend::new());
    let timeline = Arc::new(ManualFenceTimeline::new());
    assert!(matches!(
        PoolAllocator::new(
            &PoolAllocatorDesc {
                max_allocation_size: 2 * MIB,
                ..upload_desc()
            },
            backend,
            timeline,
            AllocatorDebugSettings::default(),
        ),
        Err(AllocationError::InvalidAllocatorCreateDesc(_))
    ));
}

#[test]
fn backend_out_of_memory_propagates() {
    let backend = Arc::new(HostBackend::new().with_memory_budget(MIB));
    let timeline = Arc::new(ManualFenceTimeline::new());
    let allocator = Arc::new(
        PoolAllocator::new(
            &upload_desc(),
            backend,
            timeline,
            AllocatorDebugSettings::default(),
        )
        .unwrap(),
    );

    let _first = allocate(&allocator, MIB / 2);
    let _second = allocate(&allocator, MIB / 2);

    let mut location = ResourceLocation::new();
    assert!(matches!(
        allocator.allocate_resource(&ResourceDesc::buffer("third", 256), 256, &mut location),
        Err(AllocationError::OutOfMemory)
    ));
    assert!(!location.is_valid());
}

#[test]
fn report_lists_live_allocations() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (_backend, _timeline, allocator) = setup(&upload_desc());

    let _a = allocate(&allocator, 4096);
    let _b = allocate(&allocator, 300);

    let report = allocator.generate_report();
    assert_eq!(report.blocks.len(), 1);
    assert_eq!(report.blocks[0].allocations, 0..2);
    assert_eq!(report.total_capacity_bytes, MIB);
    // Sizes are rounded to the pool alignment.
    assert_eq!(report.total_allocated_bytes, 4096 + 512);
    assert_eq!(report.allocations[0].name, "buffer");

    let breakdown = format!("{:?}", allocator);
    assert!(breakdown.contains("ALLOCATION BREAKDOWN"));

    allocator.report_memory_leaks(Level::Info);
}

#[test]
fn defrag_policy_sees_every_pool() {
    #[derive(Debug, Default)]
    struct Recorder(parking_lot::Mutex<Vec<PoolStats>>);

    impl DefragPolicy for Arc<Recorder> {
        fn defragment(&self, _allocator_name: &str, pools: &[PoolStats]) {
            *self.0.lock() = pools.to_vec();
        }
    }

    let recorder = Arc::new(Recorder::default());
    let backend = Arc::new(HostBackend::new());
    let timeline = Arc::new(ManualFenceTimeline::new());
    let allocator = Arc::new(
        PoolAllocator::new(
            &upload_desc(),
            backend,
            timeline,
            AllocatorDebugSettings::default(),
        )
        .unwrap()
        .with_defrag_policy(Box::new(recorder.clone())),
    );

    let location = allocate(&allocator, 4096);
    allocator.lock(&location);
    allocator.cleanup_allocations(0);

    let stats = recorder.0.lock().clone();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].allocation_count, 1);
    assert_eq!(stats[0].locked_count, 1);
    assert_eq!(stats[0].free_size, MIB - 4096);
    assert_eq!(stats[0].fragmentation(), 0.0);
}

#[test]
fn concurrent_allocations_keep_pool_accounting_consistent() {
    let (_backend, timeline, allocator) = setup(&upload_desc());

    let survivors = std::thread::scope(|scope| {
        let workers = (0..8u64)
            .map(|thread| {
                let allocator = &allocator;
                let timeline = &timeline;
                scope.spawn(move || {
                    let mut kept = Vec::new();
                    for i in 0..64u64 {
                        let size = 256 * (1 + (thread * 7 + i * 3) % 32);
                        let location = allocate(allocator, size);
                        if i % 4 == 0 {
                            kept.push(location);
                        }
                        if thread == 0 && i % 8 == 0 {
                            timeline.submit_and_signal();
                        }
                        allocator.cleanup_allocations(0);
                    }
                    kept
                })
            })
            .collect::<Vec<_>>();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect::<Vec<_>>()
    });

    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);
    assert_eq!(allocator.pending_operation_count(), 0);

    let free_size = allocator
        .pool_stats()
        .iter()
        .map(|stats| stats.free_size)
        .sum::<u64>();
    assert_eq!(allocator.used_size() + free_size, allocator.capacity());

    let mut ranges = survivors
        .iter()
        .map(|location| {
            let data = location.pool_private_data().unwrap();
            (data.pool_index, data.offset, data.size)
        })
        .collect::<Vec<_>>();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let ((pool_a, offset_a, size_a), (pool_b, offset_b, _)) = (pair[0], pair[1]);
        assert!(pool_a != pool_b || offset_a + size_a <= offset_b);
    }

    drop(survivors);
    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);
    assert_eq!(allocator.used_size(), 0);
}

#[test]
fn transferred_location_is_freed_once() {
    let (_backend, timeline, allocator) = setup(&upload_desc());

    let mut source = allocate(&allocator, 4096);
    let offset = pool_offset(&source);
    let mut destination = ResourceLocation::new();
    ResourceLocation::transfer_ownership(&mut destination, &mut source);

    assert!(!source.is_valid());
    assert_eq!(pool_offset(&destination), offset);
    assert!(allocator.is_owner(&destination));
    assert_eq!(allocator.pending_operation_count(), 0);

    source.clear();
    destination.clear();
    source.clear();
    assert_eq!(allocator.pending_operation_count(), 1);

    timeline.submit_and_signal();
    allocator.cleanup_allocations(0);
    assert_eq!(allocator.pending_operation_count(), 0);
    assert_eq!(allocator.used_size(), 0);
}
