// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use prism_core::{PresentModeCfg, RenderCfg};
use prism_render::{RenderSize, ResizeTracker};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::ResourceId;
use crate::camera::Camera;
use crate::device::Device;
use crate::error::GpuResult;
use crate::frame::{FrameOrchestrator, FrameStatus};
use crate::mesh::{Mesh, Vertex};
use crate::scene::Scene;
use crate::staging::INITIAL_STAGING_SIZE;
use crate::swapchain::{Swapchain, SwapchainSettings};
use crate::system::{ClearSystem, DrawSystem, PresentSystem};
use crate::uniforms::CommonUniformSystem;

#[derive(Clone, Copy, Debug)]
pub struct EngineSettings {
    pub swapchain: SwapchainSettings,
    pub clear_color: [f32; 4],
    pub staging_capacity: vk::DeviceSize,
    /// Bound on fence waits and image acquisition; `u64::MAX` blocks indefinitely.
    pub timeout_ns: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            swapchain: SwapchainSettings::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            staging_capacity: INITIAL_STAGING_SIZE,
            timeout_ns: u64::MAX,
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &RenderCfg) -> Self {
        let present_mode = match cfg.present_mode {
            PresentModeCfg::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeCfg::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeCfg::Immediate => vk::PresentModeKHR::IMMEDIATE,
        };
        EngineSettings {
            swapchain: SwapchainSettings {
                present_mode,
                ..SwapchainSettings::default()
            },
            clear_color: cfg.clear_color,
            staging_capacity: cfg.staging_capacity,
            timeout_ns: cfg.frame_timeout_ns(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Presented,
    /// The swapchain went stale and was rebuilt; the frame was skipped or
    /// presented suboptimally.
    Recreated,
    /// Nothing to draw into yet, e.g. the window has never had a non-zero size.
    Idle,
}

/// Swapchain, frame orchestrator, scene and pending resize, driven by [`Engine::tick`].
pub struct Engine<D: Device> {
    // field order is drop order: everything holding GPU objects goes before `device`
    orchestrator: FrameOrchestrator<D>,
    scene: Scene<D>,
    swapchain: Swapchain<D>,
    resize: ResizeTracker,
    size: RenderSize,
    device: Arc<D>,
}

impl<D: Device> Engine<D> {
    pub fn new(device: Arc<D>, size: RenderSize, settings: EngineSettings) -> GpuResult<Self> {
        let swapchain = Swapchain::new(&device, settings.swapchain, size.width, size.height)?;
        let mut orchestrator =
            FrameOrchestrator::new(&device, settings.staging_capacity, settings.timeout_ns)?;
        orchestrator.push_system(Box::new(CommonUniformSystem::new(&device)?));
        orchestrator.push_system(Box::new(ClearSystem));
        orchestrator.push_system(Box::new(PresentSystem));
        info!(
            "engine ready ({}x{}, {:?})",
            size.width, size.height, settings.swapchain.present_mode
        );
        Ok(Engine {
            orchestrator,
            scene: Scene::new(settings.clear_color),
            swapchain,
            resize: ResizeTracker::new(),
            size,
            device,
        })
    }

    /// Takes effect at the start of the next tick.
    pub fn request_resize(&mut self, size: RenderSize) {
        self.resize.push(size);
    }

    /// Registers a system after the built-in ones and before the present system.
    pub fn add_system(&mut self, system: Box<dyn DrawSystem<D>>) {
        let before_present = self.orchestrator.system_names().len().saturating_sub(1);
        self.orchestrator.insert_system(before_present, system);
    }

    pub fn tick(&mut self, dt: f32) -> GpuResult<TickOutcome> {
        if let Some(size) = self.resize.take() {
            self.swapchain.recreate(size.width, size.height)?;
            self.size = size;
        }
        if self.swapchain.image_count() == 0 {
            return Ok(TickOutcome::Idle);
        }

        match self
            .orchestrator
            .draw_frame(&mut self.swapchain, &self.scene, dt)
        {
            Ok(FrameStatus::Presented) => Ok(TickOutcome::Presented),
            Ok(FrameStatus::Suboptimal) => {
                warn!("swapchain suboptimal, rebuilding");
                self.rebuild()?;
                Ok(TickOutcome::Recreated)
            }
            Err(e) if e.is_out_of_date() => {
                warn!("swapchain out of date, skipping frame");
                self.rebuild()?;
                Ok(TickOutcome::Recreated)
            }
            Err(e) => Err(e),
        }
    }

    /// Stages a mesh for the next frame and adds it to the scene.
    pub fn upload_mesh(
        &mut self,
        name: &str,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> GpuResult<ResourceId> {
        let id = ResourceId::from_name(name);
        if self.scene.mesh(id).is_some() {
            // the replaced buffers may still be read by frames in flight
            self.device.wait_idle()?;
            if let Some(old) = self.scene.remove_mesh(id) {
                self.forget_mesh_uploads(&old);
            }
        }
        let staging = self.orchestrator.staging_for_next_frame(&self.swapchain)?;
        let mesh = Mesh::upload(&self.device, staging, vertices, indices)?;
        Ok(self.scene.add_mesh(name, mesh))
    }

    pub fn remove_mesh(&mut self, id: ResourceId) -> GpuResult<bool> {
        if self.scene.mesh(id).is_none() {
            return Ok(false);
        }
        self.device.wait_idle()?;
        match self.scene.remove_mesh(id) {
            Some(mesh) => {
                self.forget_mesh_uploads(&mesh);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.scene.set_camera(camera);
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.scene.set_clear_color(rgba);
    }

    pub fn scene(&self) -> &Scene<D> {
        &self.scene
    }

    pub fn swapchain(&self) -> &Swapchain<D> {
        &self.swapchain
    }

    pub fn orchestrator(&self) -> &FrameOrchestrator<D> {
        &self.orchestrator
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn size(&self) -> RenderSize {
        self.size
    }

    /// A mesh dropped before the next frame may still have its copies staged.
    fn forget_mesh_uploads(&mut self, mesh: &Mesh<D>) {
        self.orchestrator.forget_uploads(mesh.vertex_buffer().raw());
        self.orchestrator.forget_uploads(mesh.index_buffer().raw());
    }

    fn rebuild(&mut self) -> GpuResult<()> {
        self.swapchain.recreate(self.size.width, self.size.height)
    }
}

impl<D: Device> Drop for Engine<D> {
    fn drop(&mut self) {
        self.device.wait_idle().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDevice;

    #[test]
    fn settings_follow_config() {
        let cfg = RenderCfg {
            present_mode: PresentModeCfg::Mailbox,
            frame_timeout_ms: 20,
            staging_capacity: 4096,
            ..RenderCfg::default()
        };
        let s = EngineSettings::from_config(&cfg);
        assert_eq!(s.swapchain.present_mode, vk::PresentModeKHR::MAILBOX);
        assert_eq!(s.timeout_ns, 20_000_000);
        assert_eq!(s.staging_capacity, 4096);
        assert_eq!(s.clear_color, cfg.clear_color);
    }

    #[test]
    fn user_systems_go_before_present() {
        struct Overlay;
        impl DrawSystem<RecordingDevice> for Overlay {
            fn name(&self) -> &'static str {
                "overlay"
            }
        }

        let dev = Arc::new(RecordingDevice::new());
        let mut engine =
            Engine::new(dev, RenderSize::new(320, 240), EngineSettings::default()).unwrap();
        engine.add_system(Box::new(Overlay));
        assert_eq!(
            engine.orchestrator().system_names(),
            vec!["common-uniforms", "clear", "overlay", "present"]
        );
    }
}
