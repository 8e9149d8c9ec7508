// SPDX-License-Identifier: CEPL-1.0
use crate::RenderSize;
use tracing::debug;

/// Latest-wins store for window resize notifications.
///
/// Resizes arrive from the window event queue at any time but are applied
/// once per tick, before the frame is drawn. Zero-area sizes (minimized
/// windows) are swallowed so the swapchain is never rebuilt with them.
#[derive(Debug, Default)]
pub struct ResizeTracker {
    pending: Option<RenderSize>,
}

impl ResizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, size: RenderSize) {
        self.pending = Some(size);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn take(&mut self) -> Option<RenderSize> {
        let size = self.pending.take()?;
        if size.is_zero_area() {
            debug!("ignoring zero-area resize {}x{}", size.width, size.height);
            return None;
        }
        Some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_resize_wins() {
        let mut tracker = ResizeTracker::new();
        tracker.push(RenderSize::new(800, 600));
        tracker.push(RenderSize::new(1024, 768));
        assert_eq!(tracker.take(), Some(RenderSize::new(1024, 768)));
        assert_eq!(tracker.take(), None);
    }

    #[test]
    fn zero_area_is_consumed_and_dropped() {
        let mut tracker = ResizeTracker::new();
        tracker.push(RenderSize::new(0, 0));
        assert!(tracker.is_pending());
        assert_eq!(tracker.take(), None);
        assert!(!tracker.is_pending());

        tracker.push(RenderSize::new(640, 0));
        assert_eq!(tracker.take(), None);
    }
}
