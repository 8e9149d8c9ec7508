// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use prism_core::RenderCfg;
use prism_render::{RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::info;

use crate::ash_device::AshDevice;
use crate::bootstrap;
use crate::engine::{Engine, EngineSettings, TickOutcome};

pub struct VkRenderer {
    engine: Engine<AshDevice>,
}

impl VkRenderer {
    pub fn engine(&self) -> &Engine<AshDevice> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<AshDevice> {
        &mut self.engine
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderCfg,
    ) -> Result<Self> {
        let device = bootstrap::create_device(window, display)?;
        let engine = Engine::new(device, size, EngineSettings::from_config(cfg))
            .context("engine setup")?;
        let extent = engine.swapchain().extent();
        info!(
            "Vulkan swapchain ready ({}x{}, fmt 0x{:x})",
            extent.width,
            extent.height,
            engine.swapchain().format().as_raw()
        );
        Ok(VkRenderer { engine })
    }

    fn resize(&mut self, size: RenderSize) {
        self.engine.request_resize(size);
    }

    fn render(&mut self, dt: f32) -> Result<()> {
        match self.engine.tick(dt).context("frame")? {
            TickOutcome::Presented | TickOutcome::Idle => Ok(()),
            TickOutcome::Recreated => {
                let extent = self.engine.swapchain().extent();
                info!("swapchain rebuilt ({}x{})", extent.width, extent.height);
                Ok(())
            }
        }
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.engine.set_clear_color(rgba);
    }
}
