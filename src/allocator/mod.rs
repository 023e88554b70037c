use std::backtrace::Backtrace;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

mod pool;
pub use pool::{
    DefragPolicy, FreeListOrder, MemoryPool, NoDefrag, PoolAllocation, PoolAllocator,
    PoolAllocatorDesc, PoolStats,
};

mod buddy;
pub use buddy::{
    BuddyAllocation, BuddyAllocator, BuddyAllocatorDesc, ConstantBufferAllocator,
    ConstantBufferAllocatorDesc, MultiBuddyAllocator, RetiredBlock,
};

mod fast;
pub use fast::{FastAllocator, FastAllocatorDesc, FastAllocatorPage, FastAllocatorPagePool};

mod config;
pub use config::{ResourceAllocatorInitConfig, ResourceConfigAllocator};

/// How a pool hands its memory to callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// Every allocation gets its own placed resource at its offset in the pool heap.
    PlacedResource,
    /// One buffer spans the whole pool; allocations are ranges of that buffer.
    #[default]
    ManualSubAllocation,
}

/// A single allocation, as reported by [`AllocatorReport`].
#[derive(Clone)]
pub struct AllocationReport {
    /// The name provided when the allocation was made.
    pub name: String,
    /// The offset in bytes of the allocation in its memory block.
    pub offset: u64,
    /// The size in bytes of the allocation.
    pub size: u64,
    /// Only captured if [`crate::AllocatorDebugSettings::store_stack_traces`] is [`true`].
    pub backtrace: Arc<Backtrace>,
}

impl fmt::Debug for AllocationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if !self.name.is_empty() {
            self.name.as_str()
        } else {
            "--"
        };
        write!(f, "{name:?}: {}", fmt_bytes(self.size))
    }
}

/// One pool or buddy buffer, as reported by [`AllocatorReport`].
#[derive(Clone, Debug)]
pub struct MemoryBlockReport {
    /// The size in bytes of this memory block.
    pub size: u64,
    /// The range of allocations in [`AllocatorReport::allocations`] that are associated
    /// to this memory block.
    pub allocations: Range<usize>,
}

/// A report that can be generated for informational purposes using
/// `generate_report()` on the allocators.
#[derive(Clone)]
pub struct AllocatorReport {
    /// All live allocations, sub-allocated from memory blocks.
    pub allocations: Vec<AllocationReport>,
    /// All memory blocks.
    pub blocks: Vec<MemoryBlockReport>,
    /// Sum of the memory used by all allocations, in bytes.
    pub total_allocated_bytes: u64,
    /// Sum of the memory capacity of all memory blocks including unallocated regions, in bytes.
    pub total_capacity_bytes: u64,
}

impl fmt::Debug for AllocatorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut allocations = self.allocations.clone();
        allocations.sort_by_key(|alloc| std::cmp::Reverse(alloc.size));

        let max_num_allocations_to_print = f.precision().unwrap_or(usize::MAX);
        allocations.truncate(max_num_allocations_to_print);

        f.debug_struct("AllocatorReport")
            .field(
                "summary",
                &format_args!(
                    "{} / {}",
                    fmt_bytes(self.total_allocated_bytes),
                    fmt_bytes(self.total_capacity_bytes)
                ),
            )
            .field("blocks", &self.blocks.len())
            .field("allocations", &self.allocations.len())
            .field("largest", &allocations.as_slice())
            .finish()
    }
}

/// Writes the `ALLOCATION BREAKDOWN` table used by the allocators' `Debug` impls.
pub(crate) fn fmt_allocation_breakdown(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    report: &AllocatorReport,
) -> fmt::Result {
    let mut allocations = report.allocations.iter().enumerate().collect::<Vec<_>>();
    allocations.sort_by_key(|(_, alloc)| std::cmp::Reverse(alloc.size));

    const MAX_NUM_CHARACTERS: usize = 40;

    f.write_str("================================================================\n")?;
    writeln!(
        f,
        "{} ALLOCATION BREAKDOWN ({} / {})",
        title,
        fmt_bytes(report.total_allocated_bytes),
        fmt_bytes(report.total_capacity_bytes)
    )?;

    for (idx, alloc) in &allocations {
        let name = match alloc.name.char_indices().nth(MAX_NUM_CHARACTERS) {
            Some((end, _)) => &alloc.name[..end],
            None => alloc.name.as_str(),
        };

        let num_spaces = MAX_NUM_CHARACTERS - name.chars().count();
        let aligning_spaces = " ".repeat(num_spaces);

        writeln!(
            f,
            "\t\t{}\t- {}{}\t- {}",
            idx,
            name,
            aligning_spaces,
            fmt_bytes(alloc.size)
        )?;
    }

    Ok(())
}

pub(crate) fn fmt_bytes(mut amount: u64) -> String {
    const SUFFIX: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut idx = 0;
    let mut print_amount = amount as f64;
    loop {
        if amount < 1024 {
            return format!("{:.2} {}", print_amount, SUFFIX[idx]);
        }

        print_amount = amount as f64 / 1024.0;
        amount /= 1024;
        idx += 1;
    }
}
