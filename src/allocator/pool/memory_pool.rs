use std::backtrace::Backtrace;
use std::sync::Arc;

use log::{log, Level};

use super::{FreeListOrder, PoolStats};
use crate::allocator::{AllocationReport, AllocationStrategy};
use crate::math::{align_down, align_up};

/// Index of the sentinel node anchoring the free list.
const HEAD: u32 = 0;
const INVALID_NODE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Free,
    Allocated,
    Head,
    /// Slot in the arena waiting to be reused.
    Unused,
}

#[derive(Debug)]
struct AllocationInfo {
    name: String,
    backtrace: Arc<Backtrace>,
}

#[derive(Debug)]
struct Node {
    /// Start of the block, including alignment padding.
    offset: u64,
    /// Size of the block, including alignment padding.
    size: u64,
    alignment: u64,
    padding: u64,
    state: NodeState,
    locked: bool,
    prev: u32,
    next: u32,
    allocation: Option<AllocationInfo>,
}

impl Node {
    fn head() -> Self {
        Self {
            offset: 0,
            size: 0,
            alignment: 0,
            padding: 0,
            state: NodeState::Head,
            locked: false,
            prev: HEAD,
            next: HEAD,
            allocation: None,
        }
    }

    fn free(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            alignment: 0,
            padding: 0,
            state: NodeState::Free,
            locked: false,
            prev: INVALID_NODE,
            next: INVALID_NODE,
            allocation: None,
        }
    }
}

/// A successful [`MemoryPool::try_allocate()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolAllocation {
    /// Handle of the allocated node, passed back to [`MemoryPool::deallocate()`].
    pub node: u32,
    /// Aligned offset of the allocation in the pool.
    pub offset: u64,
    /// Requested size rounded up to the pool alignment.
    pub size: u64,
}

/// One fixed-size heap and the free list describing it.
///
/// Nodes live in an arena and link to each other by index. Only free nodes are linked into the
/// circular list anchored at the sentinel head; allocated nodes are detached until freed, at
/// which point they merge with any address-adjacent free node.
#[derive(Debug)]
pub struct MemoryPool {
    pool_index: u32,
    pool_size: u64,
    pool_alignment: u64,
    order: FreeListOrder,
    strategy: AllocationStrategy,
    nodes: Vec<Node>,
    unused_nodes: Vec<u32>,
    free_size: u64,
    allocation_count: usize,
    last_used_frame_fence: u64,
}

impl MemoryPool {
    pub fn new(
        pool_index: u32,
        pool_size: u64,
        pool_alignment: u64,
        order: FreeListOrder,
        strategy: AllocationStrategy,
    ) -> Self {
        assert!(
            pool_alignment.is_power_of_two(),
            "Pool alignment must be a power of two"
        );
        let pool_size = align_down(pool_size, pool_alignment);

        let mut pool = Self {
            pool_index,
            pool_size,
            pool_alignment,
            order,
            strategy,
            nodes: vec![Node::head()],
            unused_nodes: vec![],
            free_size: 0,
            allocation_count: 0,
            last_used_frame_fence: 0,
        };

        if pool_size > 0 {
            let node = pool.acquire_node(Node::free(0, pool_size));
            pool.insert_sorted(node);
            pool.free_size = pool_size;
        }

        pool
    }

    /// Carves `size` bytes aligned to `alignment` out of the first free block that fits.
    ///
    /// With [`FreeListOrder::SortBySize`] the first fit is the smallest fitting block. Returns
    /// [`None`] when no block is large enough; that's the caller's cue to try another pool.
    pub fn try_allocate(
        &mut self,
        size: u64,
        alignment: u64,
        name: &str,
        backtrace: Arc<Backtrace>,
    ) -> Option<PoolAllocation> {
        debug_assert!(alignment.is_power_of_two());
        let size = align_up(size.max(1), self.pool_alignment);

        let mut current = self.nodes[HEAD as usize].next;
        while current != HEAD {
            let node = &self.nodes[current as usize];
            let padding = align_up(node.offset, alignment) - node.offset;
            if node.size >= padding + size {
                let node = self.split(current, size, alignment, padding, name, backtrace);
                return Some(node);
            }
            current = node.next;
        }

        None
    }

    fn split(
        &mut self,
        free_node: u32,
        size: u64,
        alignment: u64,
        padding: u64,
        name: &str,
        backtrace: Arc<Backtrace>,
    ) -> PoolAllocation {
        let required = padding + size;

        let (offset, remaining) = {
            let free = &mut self.nodes[free_node as usize];
            let offset = free.offset;
            free.offset += required;
            free.size -= required;
            (offset, free.size)
        };

        if remaining == 0 {
            self.unlink(free_node);
            self.release_node(free_node);
        } else if self.order == FreeListOrder::SortBySize {
            // The tail shrank and may now belong further to the front.
            self.unlink(free_node);
            self.insert_sorted(free_node);
        }

        let node = self.acquire_node(Node {
            offset,
            size: required,
            alignment,
            padding,
            state: NodeState::Allocated,
            locked: false,
            prev: INVALID_NODE,
            next: INVALID_NODE,
            allocation: Some(AllocationInfo {
                name: name.to_owned(),
                backtrace,
            }),
        });

        self.free_size -= required;
        self.allocation_count += 1;

        PoolAllocation {
            node,
            offset: offset + padding,
            size,
        }
    }

    /// Returns a block to the free list, merging it with free neighbours.
    pub fn deallocate(&mut self, node: u32) {
        let (mut offset, mut size) = {
            let node = &mut self.nodes[node as usize];
            assert_eq!(
                node.state,
                NodeState::Allocated,
                "Deallocating a pool block that isn't allocated"
            );
            node.state = NodeState::Free;
            node.locked = false;
            node.allocation = None;
            node.alignment = 0;
            node.padding = 0;
            (node.offset, node.size)
        };

        self.free_size += size;
        self.allocation_count -= 1;

        // Free blocks are never adjacent to each other, so at most two merges happen.
        let mut current = self.nodes[HEAD as usize].next;
        while current != HEAD {
            let neighbour = &self.nodes[current as usize];
            let next = neighbour.next;

            if neighbour.offset + neighbour.size == offset || offset + size == neighbour.offset {
                offset = offset.min(neighbour.offset);
                size += neighbour.size;
                self.unlink(current);
                self.release_node(current);
            }

            current = next;
        }

        let freed = &mut self.nodes[node as usize];
        freed.offset = offset;
        freed.size = size;
        self.insert_sorted(node);
    }

    /// Pins an allocated block so it won't be relocated.
    pub fn lock(&mut self, node: u32) {
        debug_assert_eq!(self.nodes[node as usize].state, NodeState::Allocated);
        self.nodes[node as usize].locked = true;
    }

    pub fn unlock(&mut self, node: u32) {
        // The block may already have been freed, which unlocks it as well.
        if self.nodes[node as usize].state == NodeState::Allocated {
            self.nodes[node as usize].locked = false;
        }
    }

    pub fn is_locked(&self, node: u32) -> bool {
        self.nodes[node as usize].locked
    }

    pub fn pool_index(&self) -> u32 {
        self.pool_index
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn pool_alignment(&self) -> u64 {
        self.pool_alignment
    }

    pub fn order(&self) -> FreeListOrder {
        self.order
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    pub fn used_size(&self) -> u64 {
        self.pool_size - self.free_size
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    pub fn locked_count(&self) -> usize {
        self.allocated_nodes().filter(|node| node.locked).count()
    }

    pub fn last_used_frame_fence(&self) -> u64 {
        self.last_used_frame_fence
    }

    pub fn set_last_used_frame_fence(&mut self, frame_fence: u64) {
        self.last_used_frame_fence = self.last_used_frame_fence.max(frame_fence);
    }

    /// `(offset, size)` of every free block, in free-list order.
    pub fn free_blocks(&self) -> Vec<(u64, u64)> {
        let mut blocks = vec![];
        let mut current = self.nodes[HEAD as usize].next;
        while current != HEAD {
            let node = &self.nodes[current as usize];
            blocks.push((node.offset, node.size));
            current = node.next;
        }
        blocks
    }

    pub fn largest_free_block(&self) -> u64 {
        self.free_blocks()
            .into_iter()
            .map(|(_, size)| size)
            .max()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        let mut free_block_count = 0;
        let mut largest_free_block = 0;
        let mut current = self.nodes[HEAD as usize].next;
        while current != HEAD {
            let node = &self.nodes[current as usize];
            free_block_count += 1;
            largest_free_block = largest_free_block.max(node.size);
            current = node.next;
        }

        PoolStats {
            pool_index: self.pool_index,
            pool_size: self.pool_size,
            free_size: self.free_size,
            free_block_count,
            largest_free_block,
            allocation_count: self.allocation_count,
            locked_count: self.locked_count(),
            last_used_frame_fence: self.last_used_frame_fence,
        }
    }

    fn allocated_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|node| node.state == NodeState::Allocated)
    }

    pub fn report_allocations(&self) -> Vec<AllocationReport> {
        let mut reports = self
            .allocated_nodes()
            .map(|node| {
                let (name, backtrace) = match &node.allocation {
                    Some(info) => (info.name.clone(), info.backtrace.clone()),
                    None => (String::new(), Arc::new(Backtrace::disabled())),
                };
                AllocationReport {
                    name,
                    offset: node.offset + node.padding,
                    size: node.size - node.padding,
                    backtrace,
                }
            })
            .collect::<Vec<_>>();
        reports.sort_by_key(|report| report.offset);
        reports
    }

    pub fn report_memory_leaks(&self, log_level: Level, allocator_name: &str) {
        for node in self.allocated_nodes() {
            let (name, backtrace) = match &node.allocation {
                Some(info) => (info.name.as_str(), info.backtrace.to_string()),
                None => ("", String::new()),
            };

            log!(
                log_level,
                r#"leak detected: {{
    allocator: {}
    pool: {}
    allocation: {{
        offset: 0x{:x},
        size: 0x{:x},
        alignment: 0x{:x},
        locked: {},
        name: {},
        backtrace: {}
    }}
}}"#,
                allocator_name,
                self.pool_index,
                node.offset + node.padding,
                node.size - node.padding,
                node.alignment,
                node.locked,
                name,
                backtrace
            );
        }
    }

    fn sort_key(&self, node: u32) -> (u64, u64) {
        let node = &self.nodes[node as usize];
        match self.order {
            FreeListOrder::SortBySize => (node.size, node.offset),
            FreeListOrder::SortByOffset => (node.offset, 0),
        }
    }

    fn insert_sorted(&mut self, node: u32) {
        let key = self.sort_key(node);

        let mut current = self.nodes[HEAD as usize].next;
        while current != HEAD && self.sort_key(current) < key {
            current = self.nodes[current as usize].next;
        }

        let prev = self.nodes[current as usize].prev;
        self.nodes[node as usize].prev = prev;
        self.nodes[node as usize].next = current;
        self.nodes[prev as usize].next = node;
        self.nodes[current as usize].prev = node;
    }

    fn unlink(&mut self, node: u32) {
        let (prev, next) = {
            let node = &self.nodes[node as usize];
            (node.prev, node.next)
        };
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;

        let node = &mut self.nodes[node as usize];
        node.prev = INVALID_NODE;
        node.next = INVALID_NODE;
    }

    fn acquire_node(&mut self, node: Node) -> u32 {
        match self.unused_nodes.pop() {
            Some(index) => {
                self.nodes[index as usize] = node;
                index
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn release_node(&mut self, node: u32) {
        let released = &mut self.nodes[node as usize];
        released.state = NodeState::Unused;
        released.allocation = None;
        self.unused_nodes.push(node);
    }
}
