// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use prism_core::RenderCfg;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod resize;

pub use resize::ResizeTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Self {
        RenderSize { width, height }
    }

    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderCfg,
    ) -> Result<Self>
    where
        Self: Sized;

    /// Queues a resize; it is applied at the start of the next `render`.
    fn resize(&mut self, size: RenderSize);
    /// Draws and presents one frame. `dt` is the time since the previous frame.
    fn render(&mut self, dt: f32) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
