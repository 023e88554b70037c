use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Device timeline used to decide when memory referenced by submitted work may be reused.
///
/// Both values only ever grow. Work recorded "now" signals [`Self::current_submission_fence()`]
/// once the device has finished it, at which point [`Self::completed_fence()`] reaches that value.
pub trait FenceTimeline: Send + Sync + fmt::Debug {
    /// Fence value that the submission currently being recorded will signal.
    fn current_submission_fence(&self) -> u64;

    /// Last fence value the device has finished.
    fn completed_fence(&self) -> u64;

    fn is_fence_complete(&self, fence: u64) -> bool {
        fence <= self.completed_fence()
    }
}

/// A [`FenceTimeline`] driven by hand.
///
/// Useful for tools and tests that have no device: [`Self::submit()`] closes the current
/// submission, [`Self::signal()`] marks fences as finished.
#[derive(Debug)]
pub struct ManualFenceTimeline {
    current: AtomicU64,
    completed: AtomicU64,
}

impl Default for ManualFenceTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualFenceTimeline {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(1),
            completed: AtomicU64::new(0),
        }
    }

    /// Closes the current submission and returns the fence value it will signal.
    pub fn submit(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel)
    }

    /// Marks every submission up to and including `fence` as finished.
    pub fn signal(&self, fence: u64) {
        debug_assert!(
            fence < self.current.load(Ordering::Acquire),
            "Signaled fence {} was never submitted",
            fence
        );
        self.completed.fetch_max(fence, Ordering::AcqRel);
    }

    /// Submits the current work and immediately marks it finished.
    pub fn submit_and_signal(&self) -> u64 {
        let fence = self.submit();
        self.signal(fence);
        fence
    }
}

impl FenceTimeline for ManualFenceTimeline {
    fn current_submission_fence(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn completed_fence(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_timeline_is_monotonic() {
        let timeline = ManualFenceTimeline::new();
        assert_eq!(timeline.current_submission_fence(), 1);
        assert_eq!(timeline.completed_fence(), 0);

        assert_eq!(timeline.submit(), 1);
        assert_eq!(timeline.submit(), 2);
        assert_eq!(timeline.current_submission_fence(), 3);

        timeline.signal(2);
        timeline.signal(1);
        assert_eq!(timeline.completed_fence(), 2);
        assert!(timeline.is_fence_complete(2));
        assert!(!timeline.is_fence_complete(3));
    }
}
