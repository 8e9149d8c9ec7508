// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use bitflags::bitflags;
use std::sync::Arc;
use tracing::debug;

use crate::device::{Device, ImageDesc};
use crate::error::{GpuError, GpuResult};

/// Depth/stencil formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
];

/// First candidate the device can use as an optimally tiled depth/stencil attachment.
pub fn pick_depth_format<D: Device>(device: &D) -> GpuResult<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|f| device.supports_depth_format(*f))
        .ok_or(GpuError::NoDepthFormat)
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RenderTargetFlags: u32 {
        const COLOR = 1;
        const DEPTH_STENCIL = 1 << 1;
    }
}

struct Attachment<D: Device> {
    format: vk::Format,
    image: vk::Image,
    view: vk::ImageView,
    memory: Option<D::Memory>,
}

/// Offscreen color and/or depth-stencil images sized to the swapchain extent.
pub struct RenderTarget<D: Device> {
    device: Arc<D>,
    extent: vk::Extent2D,
    color: Option<Attachment<D>>,
    depth: Option<Attachment<D>>,
}

fn attachment<D: Device>(
    device: &D,
    name: &'static str,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
) -> GpuResult<Attachment<D>> {
    let (image, memory) = device.create_image(&ImageDesc {
        name,
        extent,
        format,
        usage,
    })?;
    match device.create_image_view(image, format, aspect) {
        Ok(view) => Ok(Attachment {
            format,
            image,
            view,
            memory: Some(memory),
        }),
        Err(e) => {
            device.destroy_image(image, memory);
            Err(e)
        }
    }
}

impl<D: Device> RenderTarget<D> {
    /// The color attachment uses `color_format`, normally the swapchain's, so
    /// it can be copied straight into a swapchain image.
    pub fn new(
        device: &Arc<D>,
        extent: vk::Extent2D,
        color_format: vk::Format,
        flags: RenderTargetFlags,
    ) -> GpuResult<Self> {
        let mut rt = RenderTarget {
            device: device.clone(),
            extent,
            color: None,
            depth: None,
        };
        if flags.contains(RenderTargetFlags::COLOR) {
            rt.color = Some(attachment(
                device.as_ref(),
                "render-target color",
                extent,
                color_format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
                vk::ImageAspectFlags::COLOR,
            )?);
        }
        if flags.contains(RenderTargetFlags::DEPTH_STENCIL) {
            rt.depth = Some(attachment(
                device.as_ref(),
                "render-target depth",
                extent,
                pick_depth_format(device.as_ref())?,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            )?);
        }
        debug!(?flags, width = extent.width, height = extent.height, "render target created");
        Ok(rt)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn flags(&self) -> RenderTargetFlags {
        let mut flags = RenderTargetFlags::empty();
        flags.set(RenderTargetFlags::COLOR, self.color.is_some());
        flags.set(RenderTargetFlags::DEPTH_STENCIL, self.depth.is_some());
        flags
    }

    pub fn color_format(&self) -> GpuResult<vk::Format> {
        Ok(self.color()?.format)
    }

    pub fn depth_format(&self) -> GpuResult<vk::Format> {
        Ok(self.depth()?.format)
    }

    pub fn color_image(&self) -> GpuResult<vk::Image> {
        Ok(self.color()?.image)
    }

    pub fn color_view(&self) -> GpuResult<vk::ImageView> {
        Ok(self.color()?.view)
    }

    pub fn depth_image(&self) -> GpuResult<vk::Image> {
        Ok(self.depth()?.image)
    }

    pub fn depth_view(&self) -> GpuResult<vk::ImageView> {
        Ok(self.depth()?.view)
    }

    fn color(&self) -> GpuResult<&Attachment<D>> {
        self.color.as_ref().ok_or(GpuError::MissingAttachment("color"))
    }

    fn depth(&self) -> GpuResult<&Attachment<D>> {
        self.depth
            .as_ref()
            .ok_or(GpuError::MissingAttachment("depth-stencil"))
    }
}

impl<D: Device> Drop for RenderTarget<D> {
    fn drop(&mut self) {
        for mut att in [self.color.take(), self.depth.take()].into_iter().flatten() {
            self.device.destroy_image_view(att.view);
            if let Some(memory) = att.memory.take() {
                self.device.destroy_image(att.image, memory);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingDevice};

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 320,
        height: 200,
    };
    const COLOR: vk::Format = vk::Format::B8G8R8A8_SRGB;

    #[test]
    fn both_attachments() {
        let dev = Arc::new(RecordingDevice::new());
        let rt = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::all()).unwrap();
        assert_eq!(rt.flags(), RenderTargetFlags::all());
        assert_ne!(rt.color_image().unwrap(), rt.depth_image().unwrap());
        assert_eq!(dev.live_images(), 2);

        let formats: Vec<_> = dev
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateImage { format, extent, .. } => {
                    assert_eq!(extent, EXTENT);
                    Some(format)
                }
                _ => None,
            })
            .collect();
        assert_eq!(formats, vec![COLOR, vk::Format::D32_SFLOAT_S8_UINT]);
        assert_eq!(rt.color_format().unwrap(), COLOR);

        drop(rt);
        assert_eq!(dev.live_images(), 0);
        assert_eq!(dev.live_views(), 0);
    }

    #[test]
    fn color_follows_requested_format() {
        let dev = Arc::new(RecordingDevice::new());
        let rt = RenderTarget::new(
            &dev,
            EXTENT,
            vk::Format::R8G8B8A8_UNORM,
            RenderTargetFlags::COLOR,
        )
        .unwrap();
        assert_eq!(rt.color_format().unwrap(), vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn depth_falls_back_to_supported_format() {
        let dev = Arc::new(RecordingDevice::new());
        dev.set_depth_formats(vec![vk::Format::D16_UNORM_S8_UINT]);
        let rt = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::all()).unwrap();
        assert_eq!(rt.depth_format().unwrap(), vk::Format::D16_UNORM_S8_UINT);

        dev.set_depth_formats(Vec::new());
        let err = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::all())
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::NoDepthFormat));
        // only the first target's images remain; the failed one released its color
        assert_eq!(dev.live_images(), 2);
    }

    #[test]
    fn missing_attachment_is_an_error() {
        let dev = Arc::new(RecordingDevice::new());
        let rt = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::COLOR).unwrap();
        assert!(rt.color_view().is_ok());
        assert!(matches!(
            rt.depth_view(),
            Err(GpuError::MissingAttachment("depth-stencil"))
        ));
    }

    #[test]
    fn color_usage_allows_sampling_and_transfer() {
        let dev = Arc::new(RecordingDevice::new());
        let _rt = RenderTarget::new(&dev, EXTENT, COLOR, RenderTargetFlags::COLOR).unwrap();
        let usage = dev
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::CreateImage { usage, .. } => Some(usage),
                _ => None,
            })
            .unwrap();
        assert!(usage.contains(
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
        ));
    }
}
