// SPDX-License-Identifier: CEPL-1.0
use std::time::{Duration, Instant};
use tracing::info;

/// Per-tick delta time plus a once-a-second FPS report.
pub struct FrameClock {
    last_tick: Instant,
    last_report: Instant,
    frames: u32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        FrameClock {
            last_tick: now,
            last_report: now,
            frames: 0,
        }
    }

    /// Seconds since the previous tick.
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> f32 {
        let dt = now.saturating_duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;
        dt
    }

    /// Counts a presented frame; returns the FPS figure when a second has elapsed.
    pub fn frame_presented(&mut self) -> Option<u32> {
        self.frame_presented_at(Instant::now())
    }

    pub fn frame_presented_at(&mut self, now: Instant) -> Option<u32> {
        self.frames = self.frames.saturating_add(1);
        if now.saturating_duration_since(self.last_report) < Duration::from_secs(1) {
            return None;
        }
        let fps = self.frames;
        info!("fps ~ {}", fps);
        self.frames = 0;
        self.last_report = now;
        Some(fps)
    }

    /// Drop the partial count, e.g. while the window is paused.
    pub fn reset_count(&mut self) {
        self.frames = 0;
        self.last_report = Instant::now();
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_reports_elapsed_seconds() {
        let start = Instant::now();
        let mut clock = FrameClock::starting_at(start);
        let dt = clock.tick_at(start + Duration::from_millis(500));
        assert!((dt - 0.5).abs() < 1e-4);
        let dt = clock.tick_at(start + Duration::from_millis(750));
        assert!((dt - 0.25).abs() < 1e-4);
    }

    #[test]
    fn fps_reported_once_per_second() {
        let start = Instant::now();
        let mut clock = FrameClock::starting_at(start);
        for i in 1..60 {
            assert_eq!(clock.frame_presented_at(start + Duration::from_millis(i * 10)), None);
        }
        assert_eq!(clock.frame_presented_at(start + Duration::from_secs(1)), Some(60));
        assert_eq!(clock.frame_presented_at(start + Duration::from_millis(1010)), None);
    }
}
