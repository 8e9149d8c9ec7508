// SPDX-License-Identifier: CEPL-1.0
//! Drawing systems record commands; the frame orchestrator owns every
//! submission and all synchronization.

use ash::vk;

use crate::device::{Device, ImageBarrier};
use crate::error::GpuResult;
use crate::render_target::{RenderTarget, RenderTargetFlags};
use crate::scene::Scene;
use crate::staging::StagingBuffer;

#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    pub slot: usize,
    pub image_index: u32,
    pub extent: vk::Extent2D,
    pub dt: f32,
}

pub struct UpdateContext<'a, D: Device> {
    pub device: &'a D,
    pub frame: FrameInfo,
    /// Staging arena of this frame's slot, committed after the last update.
    pub staging: &'a mut StagingBuffer<D>,
}

pub struct RenderContext<'a, D: Device> {
    pub device: &'a D,
    pub frame: FrameInfo,
    pub target: &'a RenderTarget<D>,
    pub swapchain_image: vk::Image,
}

/// One entry in the orchestrator's ordered system list.
///
/// Each phase gets exactly one freshly reset command buffer per system,
/// whether or not the system has work. The system begins and ends it.
pub trait DrawSystem<D: Device> {
    fn name(&self) -> &'static str;

    fn update(
        &mut self,
        ctx: &mut UpdateContext<'_, D>,
        cmd: vk::CommandBuffer,
        _scene: &Scene<D>,
    ) -> GpuResult<()> {
        record_empty(ctx.device, cmd)
    }

    fn render(
        &mut self,
        ctx: &RenderContext<'_, D>,
        cmd: vk::CommandBuffer,
        _scene: &Scene<D>,
    ) -> GpuResult<()> {
        record_empty(ctx.device, cmd)
    }
}

pub fn record_empty<D: Device>(device: &D, cmd: vk::CommandBuffer) -> GpuResult<()> {
    device.begin_command_buffer(cmd)?;
    device.end_command_buffer(cmd)
}

fn barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> ImageBarrier {
    ImageBarrier {
        image,
        aspect,
        old_layout,
        new_layout,
        src_access,
        dst_access,
    }
}

const DEPTH_STENCIL: vk::ImageAspectFlags = vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
);

/// Clears the render target to the scene's clear color and resets depth to 1.
#[derive(Default)]
pub struct ClearSystem;

impl<D: Device> DrawSystem<D> for ClearSystem {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn render(
        &mut self,
        ctx: &RenderContext<'_, D>,
        cmd: vk::CommandBuffer,
        scene: &Scene<D>,
    ) -> GpuResult<()> {
        let dev = ctx.device;
        let has_color = ctx.target.flags().contains(RenderTargetFlags::COLOR);
        let has_depth = ctx.target.flags().contains(RenderTargetFlags::DEPTH_STENCIL);

        let mut to_transfer = Vec::with_capacity(2);
        let mut to_attachment = Vec::with_capacity(2);
        if has_color {
            let image = ctx.target.color_image()?;
            to_transfer.push(barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ));
            to_attachment.push(barrier(
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ));
        }
        if has_depth {
            let image = ctx.target.depth_image()?;
            to_transfer.push(barrier(
                image,
                DEPTH_STENCIL,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ));
            to_attachment.push(barrier(
                image,
                DEPTH_STENCIL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ));
        }

        dev.begin_command_buffer(cmd)?;
        if !to_transfer.is_empty() {
            dev.cmd_image_barriers(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                &to_transfer,
            );
            if has_color {
                dev.cmd_clear_color_image(cmd, ctx.target.color_image()?, scene.clear_color());
            }
            if has_depth {
                dev.cmd_clear_depth_stencil_image(cmd, ctx.target.depth_image()?, 1.0, 0);
            }
            dev.cmd_image_barriers(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                &to_attachment,
            );
        }
        dev.end_command_buffer(cmd)
    }
}

/// Copies the render target's color image into the acquired swapchain image
/// and leaves the latter ready for presentation.
#[derive(Default)]
pub struct PresentSystem;

impl<D: Device> DrawSystem<D> for PresentSystem {
    fn name(&self) -> &'static str {
        "present"
    }

    fn render(
        &mut self,
        ctx: &RenderContext<'_, D>,
        cmd: vk::CommandBuffer,
        _scene: &Scene<D>,
    ) -> GpuResult<()> {
        let dev = ctx.device;
        let color = ctx.target.color_image()?;
        let swap = ctx.swapchain_image;
        let aspect = vk::ImageAspectFlags::COLOR;

        dev.begin_command_buffer(cmd)?;
        dev.cmd_image_barriers(
            cmd,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::TRANSFER,
            &[
                barrier(
                    color,
                    aspect,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                ),
                barrier(
                    swap,
                    aspect,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                ),
            ],
        );
        dev.cmd_copy_image(cmd, color, swap, ctx.target.extent());
        dev.cmd_image_barriers(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[
                barrier(
                    swap,
                    aspect,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::empty(),
                ),
                barrier(
                    color,
                    aspect,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::empty(),
                ),
            ],
        );
        dev.end_command_buffer(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Recorded, RecordingDevice};
    use ash::vk::Handle;
    use std::sync::Arc;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 64,
        height: 32,
    };
    const COLOR: vk::Format = vk::Format::B8G8R8A8_SRGB;

    fn frame() -> FrameInfo {
        FrameInfo {
            slot: 0,
            image_index: 0,
            extent: EXTENT,
            dt: 0.016,
        }
    }

    #[test]
    fn clear_records_both_attachments() {
        let dev = Arc::new(RecordingDevice::new());
        let target = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::all()).unwrap();
        let scene = Scene::new([0.2, 0.3, 0.4, 1.0]);
        let ctx = RenderContext {
            device: dev.as_ref(),
            frame: frame(),
            target: &target,
            swapchain_image: vk::Image::from_raw(0x5),
        };
        let cmd = vk::CommandBuffer::from_raw(0xc);
        ClearSystem.render(&ctx, cmd, &scene).unwrap();

        let rec = dev.commands(cmd);
        assert_eq!(rec.first(), Some(&Recorded::Begin));
        assert_eq!(rec.last(), Some(&Recorded::End));
        assert!(rec.contains(&Recorded::ClearColor {
            image: target.color_image().unwrap(),
            rgba: [0.2, 0.3, 0.4, 1.0],
        }));
        assert!(rec.contains(&Recorded::ClearDepthStencil {
            image: target.depth_image().unwrap(),
            depth: 1.0,
            stencil: 0,
        }));
    }

    #[test]
    fn present_copies_into_swapchain_image() {
        let dev = Arc::new(RecordingDevice::new());
        let target = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::COLOR).unwrap();
        let scene = Scene::new([0.0; 4]);
        let swap = vk::Image::from_raw(0x5);
        let ctx = RenderContext {
            device: dev.as_ref(),
            frame: frame(),
            target: &target,
            swapchain_image: swap,
        };
        let cmd = vk::CommandBuffer::from_raw(0xd);
        PresentSystem.render(&ctx, cmd, &scene).unwrap();

        let rec = dev.commands(cmd);
        assert!(rec.contains(&Recorded::CopyImage {
            src: target.color_image().unwrap(),
            dst: swap,
            extent: EXTENT,
        }));
        let last_barriers = rec
            .iter()
            .rev()
            .find_map(|r| match r {
                Recorded::Barriers { barriers, .. } => Some(barriers.clone()),
                _ => None,
            })
            .unwrap();
        assert!(last_barriers
            .iter()
            .any(|b| b.image == swap && b.new_layout == vk::ImageLayout::PRESENT_SRC_KHR));
    }

    #[test]
    fn default_update_is_an_empty_buffer() {
        let dev = Arc::new(RecordingDevice::new());
        let mut staging = StagingBuffer::new(&dev).unwrap();
        let scene = Scene::new([0.0; 4]);
        let mut ctx = UpdateContext {
            device: dev.as_ref(),
            frame: frame(),
            staging: &mut staging,
        };
        let cmd = vk::CommandBuffer::from_raw(0xe);
        DrawSystem::<RecordingDevice>::update(&mut ClearSystem, &mut ctx, cmd, &scene).unwrap();
        assert_eq!(dev.commands(cmd), vec![Recorded::Begin, Recorded::End]);
    }
}
