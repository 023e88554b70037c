//! Fence-gated deferred work shared by every allocator in this crate.
//!
//! Frees are never executed immediately: the allocator records what to do together with the
//! fence of the submission that may still reference the memory, and a periodic maintenance
//! call performs the work once the device timeline has moved far enough past that fence.
use std::collections::VecDeque;

/// Anything stamped with the fence value of the submission that last used it.
pub(crate) trait FrameFenced {
    fn frame_fence(&self) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFencedOperation {
    Deallocate,
    Unlock,
    /// A cancelled operation; it is popped without side effects.
    Nop,
}

#[derive(Clone, Debug)]
pub struct FrameFencedAllocationData<T> {
    pub operation: FrameFencedOperation,
    pub target: T,
    pub frame_fence: u64,
}

impl<T> FrameFenced for FrameFencedAllocationData<T> {
    fn frame_fence(&self) -> u64 {
        self.frame_fence
    }
}

/// FIFO of fenced entries.
///
/// Fence values only grow over the life of a timeline, so entries are appended in fence
/// order and draining can stop at the first entry that isn't eligible yet.
#[derive(Debug)]
pub(crate) struct FrameFencedQueue<E> {
    entries: VecDeque<E>,
}

impl<E> Default for FrameFencedQueue<E> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<E: FrameFenced> FrameFencedQueue<E> {
    pub(crate) fn push(&mut self, entry: E) {
        debug_assert!(
            self.entries
                .back()
                .map_or(true, |back| back.frame_fence() <= entry.frame_fence()),
            "Deferred entries must be queued in fence order"
        );
        self.entries.push_back(entry);
    }

    pub(crate) fn is_ready(entry: &E, completed_fence: u64, frame_lag: u64) -> bool {
        entry.frame_fence().saturating_add(frame_lag) <= completed_fence
    }

    /// Returns the front entry if it became eligible.
    pub(crate) fn pop_ready(&mut self, completed_fence: u64, frame_lag: u64) -> Option<E> {
        match self.entries.front() {
            Some(front) if Self::is_ready(front, completed_fence, frame_lag) => {
                self.entries.pop_front()
            }
            _ => None,
        }
    }

    /// Pops and hands every eligible entry to `f`, returning how many were processed.
    pub(crate) fn drain_ready(
        &mut self,
        completed_fence: u64,
        frame_lag: u64,
        mut f: impl FnMut(E),
    ) -> usize {
        let mut processed = 0;
        while let Some(entry) = self.pop_ready(completed_fence, frame_lag) {
            f(entry);
            processed += 1;
        }
        processed
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.entries.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(frame_fence: u64, target: u32) -> FrameFencedAllocationData<u32> {
        FrameFencedAllocationData {
            operation: FrameFencedOperation::Deallocate,
            target,
            frame_fence,
        }
    }

    #[test]
    fn drain_stops_at_first_pending_entry() {
        let mut queue = FrameFencedQueue::default();
        queue.push(op(1, 10));
        queue.push(op(1, 11));
        queue.push(op(3, 12));
        queue.push(op(4, 13));

        let mut freed = vec![];
        let processed = queue.drain_ready(4, 1, |e| freed.push(e.target));

        assert_eq!(processed, 3);
        assert_eq!(freed, vec![10, 11, 12]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn frame_lag_delays_reclamation() {
        let mut queue = FrameFencedQueue::default();
        queue.push(op(1, 0));

        assert_eq!(queue.drain_ready(2, 2, |_| {}), 0);
        assert_eq!(queue.drain_ready(3, 2, |_| {}), 1);
        assert!(queue.is_empty());
    }
}
