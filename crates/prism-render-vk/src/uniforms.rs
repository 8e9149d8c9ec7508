// SPDX-License-Identifier: CEPL-1.0
//! Per-frame camera data shared by every drawing system.
//!
//! Each frame slot owns a device-local uniform buffer. The update phase stages
//! the slot's copy through the slot's staging arena, so it lands in the same
//! submission as every other upload of that frame.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use std::mem::size_of;
use std::sync::Arc;
use tracing::trace;

use crate::buffer::Buffer;
use crate::camera::Camera;
use crate::device::{Device, MemoryLocation};
use crate::error::GpuResult;
use crate::scene::Scene;
use crate::swapchain::FRAMES_IN_FLIGHT;
use crate::system::{record_empty, DrawSystem, UpdateContext};

const UNIFORM_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CommonUniforms {
    pub view: Mat4,
    /// Y is flipped so world up stays up in Vulkan clip space.
    pub projection: Mat4,
    /// `w` is always 1.
    pub camera_position: Vec4,
}

impl CommonUniforms {
    pub fn new(camera: &Camera, extent: vk::Extent2D) -> Self {
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        CommonUniforms {
            view: camera.view(),
            projection: camera.projection(aspect) * Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0)),
            camera_position: camera.position.extend(1.0),
        }
    }
}

pub struct CommonUniformSystem<D: Device> {
    buffers: Vec<Buffer<CommonUniforms, D>>,
}

impl<D: Device> CommonUniformSystem<D> {
    pub fn new(device: &Arc<D>) -> GpuResult<Self> {
        let buffers = (0..FRAMES_IN_FLIGHT)
            .map(|_| {
                Buffer::create(
                    device,
                    "common uniforms",
                    size_of::<CommonUniforms>() as vk::DeviceSize,
                    UNIFORM_USAGE,
                    MemoryLocation::GpuOnly,
                )
            })
            .collect::<GpuResult<Vec<_>>>()?;
        Ok(CommonUniformSystem { buffers })
    }

    /// Uniform buffer holding the camera data of frames drawn in `slot`.
    pub fn uniform_buffer(&self, slot: usize) -> Option<vk::Buffer> {
        self.buffers.get(slot).map(Buffer::raw)
    }
}

impl<D: Device> DrawSystem<D> for CommonUniformSystem<D> {
    fn name(&self) -> &'static str {
        "common-uniforms"
    }

    fn update(
        &mut self,
        ctx: &mut UpdateContext<'_, D>,
        cmd: vk::CommandBuffer,
        scene: &Scene<D>,
    ) -> GpuResult<()> {
        let uniforms = CommonUniforms::new(scene.camera(), ctx.frame.extent);
        let dst = self.buffers[ctx.frame.slot].raw();
        ctx.staging.copy(dst, &[uniforms])?;
        trace!(slot = ctx.frame.slot, "common uniforms staged");
        record_empty(ctx.device, cmd)
    }
}
