use std::ops::Range;

/// Coalescing first-fit allocator over the index space `[0, capacity)`.
///
/// Free ranges are kept sorted by start; freeing merges with both neighbours when contiguous.
#[derive(Clone, Debug)]
pub struct DescriptorAllocator {
    capacity: u32,
    free_ranges: Vec<Range<u32>>,
    allocated: u32,
}

impl DescriptorAllocator {
    pub fn new(capacity: u32) -> Self {
        let free_ranges = if capacity > 0 {
            vec![0..capacity]
        } else {
            vec![]
        };
        Self {
            capacity,
            free_ranges,
            allocated: 0,
        }
    }

    /// Returns the first index of `count` consecutive free slots.
    pub fn allocate(&mut self, count: u32) -> Option<u32> {
        if count == 0 {
            return None;
        }

        let index = self
            .free_ranges
            .iter()
            .position(|range| range.len() as u32 >= count)?;
        let range = &mut self.free_ranges[index];
        let offset = range.start;
        range.start += count;
        if range.is_empty() {
            self.free_ranges.remove(index);
        }

        self.allocated += count;
        Some(offset)
    }

    pub fn free(&mut self, offset: u32, count: u32) {
        if count == 0 {
            return;
        }
        let end = offset + count;
        assert!(end <= self.capacity, "Freeing slots outside of the heap");

        let index = self
            .free_ranges
            .partition_point(|range| range.start < offset);

        let merges_left = index > 0 && {
            let left = &self.free_ranges[index - 1];
            assert!(left.end <= offset, "Double free of descriptor slot {}", offset);
            left.end == offset
        };
        let merges_right = index < self.free_ranges.len() && {
            let right = &self.free_ranges[index];
            assert!(end <= right.start, "Double free of descriptor slot {}", offset);
            right.start == end
        };

        match (merges_left, merges_right) {
            (true, true) => {
                let right_end = self.free_ranges.remove(index).end;
                self.free_ranges[index - 1].end = right_end;
            }
            (true, false) => self.free_ranges[index - 1].end = end,
            (false, true) => self.free_ranges[index].start = offset,
            (false, false) => self.free_ranges.insert(index, offset..end),
        }

        self.allocated -= count;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn free_ranges(&self) -> &[Range<u32>] {
        &self.free_ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_and_coalescing() {
        let mut allocator = DescriptorAllocator::new(16);

        let a = allocator.allocate(4).unwrap();
        let b = allocator.allocate(4).unwrap();
        let c = allocator.allocate(4).unwrap();
        assert_eq!((a, b, c), (0, 4, 8));

        allocator.free(a, 4);
        allocator.free(c, 4);
        assert_eq!(allocator.free_ranges(), &[0..4, 8..16]);

        // Too large for the hole at the front.
        assert_eq!(allocator.allocate(6), Some(8));
        assert_eq!(allocator.allocate(2), Some(0));

        allocator.free(0, 2);
        allocator.free(b, 4);
        allocator.free(8, 6);
        assert_eq!(allocator.free_ranges(), &[0..16]);
        assert_eq!(allocator.allocated(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut allocator = DescriptorAllocator::new(4);
        assert_eq!(allocator.allocate(5), None);
        assert_eq!(allocator.allocate(4), Some(0));
        assert_eq!(allocator.allocate(1), None);
        assert_eq!(allocator.allocate(0), None);
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn double_free_asserts() {
        let mut allocator = DescriptorAllocator::new(8);
        let slot = allocator.allocate(2).unwrap();
        allocator.free(slot, 2);
        allocator.free(slot, 2);
    }
}
