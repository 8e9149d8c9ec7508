// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::SwapchainBoundCache;
use crate::device::{Device, SwapchainDesc};
use crate::error::{GpuError, GpuResult};

pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug)]
pub struct SwapchainSettings {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        SwapchainSettings {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

/// What [`Swapchain::advance_frame`] handed out for one frame.
#[derive(Clone, Copy, Debug)]
pub struct AcquiredFrame {
    pub slot: usize,
    pub image_index: u32,
    /// Signaled once the swapchain image may be written.
    pub image_acquired: vk::Semaphore,
    /// Reset and unsignaled. The frame's last submission must signal it, even
    /// when the frame is abandoned, or the slot can never be waited on again.
    pub in_flight: vk::Fence,
}

/// Presentable image chain, its views, per-slot sync objects and the
/// resources bound to the current chain.
pub struct Swapchain<D: Device> {
    device: Arc<D>,
    settings: SwapchainSettings,
    raw: vk::SwapchainKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    in_flight: [vk::Fence; FRAMES_IN_FLIGHT],
    image_acquired: [vk::Semaphore; FRAMES_IN_FLIGHT],
    frame_offset: usize,
    image_index: u32,
    cache: SwapchainBoundCache,
}

fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

fn image_count_from_caps(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count.max(2);
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

/// Opaque when the surface allows it, otherwise the first mode it does support.
fn composite_alpha_from_caps(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|mode| caps.supported_composite_alpha.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

impl<D: Device> Swapchain<D> {
    pub fn new(
        device: &Arc<D>,
        settings: SwapchainSettings,
        width: u32,
        height: u32,
    ) -> GpuResult<Self> {
        let mut sc = Swapchain {
            device: device.clone(),
            settings,
            raw: vk::SwapchainKHR::null(),
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            in_flight: [vk::Fence::null(); FRAMES_IN_FLIGHT],
            image_acquired: [vk::Semaphore::null(); FRAMES_IN_FLIGHT],
            frame_offset: 0,
            image_index: 0,
            cache: SwapchainBoundCache::new(),
        };
        for slot in 0..FRAMES_IN_FLIGHT {
            sc.in_flight[slot] = device.create_fence(true)?;
            sc.image_acquired[slot] = device.create_semaphore()?;
        }
        sc.recreate(width, height)?;
        Ok(sc)
    }

    /// Drains the device and rebuilds the chain for the new size.
    /// Every swapchain-bound resource is dropped first. Zero-area sizes are ignored.
    pub fn recreate(&mut self, width: u32, height: u32) -> GpuResult<()> {
        if width == 0 || height == 0 {
            debug!(width, height, "zero-area swapchain request ignored");
            return Ok(());
        }
        self.device.wait_idle()?;
        self.cache.clear();
        self.destroy_chain();

        let support = self.device.surface_support()?;
        let want = self.settings.surface_format;
        if !support
            .formats
            .iter()
            .any(|f| f.format == want.format && f.color_space == want.color_space)
        {
            return Err(GpuError::UnsupportedSurfaceFormat {
                format: want.format,
                color_space: want.color_space,
            });
        }
        if !support.present_modes.contains(&self.settings.present_mode) {
            return Err(GpuError::UnsupportedPresentMode(self.settings.present_mode));
        }

        let caps = &support.capabilities;
        let extent = extent_from_caps(caps, width, height);
        let families = self.device.queue_families();
        let (sharing_mode, queue_family_indices) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (
                vk::SharingMode::CONCURRENT,
                vec![families.graphics, families.present],
            )
        };

        self.raw = self.device.create_swapchain(&SwapchainDesc {
            min_image_count: image_count_from_caps(caps),
            format: want,
            extent,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            sharing_mode,
            queue_family_indices,
            pre_transform: caps.current_transform,
            composite_alpha: composite_alpha_from_caps(caps),
            present_mode: self.settings.present_mode,
        })?;
        self.extent = extent;
        self.images = self.device.swapchain_images(self.raw)?;
        for &image in &self.images {
            let view =
                self.device
                    .create_image_view(image, want.format, vk::ImageAspectFlags::COLOR)?;
            self.views.push(view);
        }

        info!(
            "swapchain ready ({}x{}, {} images, fmt 0x{:x})",
            extent.width,
            extent.height,
            self.images.len(),
            want.format.as_raw()
        );
        Ok(())
    }

    /// Waits for the current slot, acquires the next image with the slot's
    /// semaphore, resets the slot's fence and moves to the next slot.
    ///
    /// `timeout_ns` bounds both the fence wait and the acquisition;
    /// `u64::MAX` blocks indefinitely.
    pub fn advance_frame(&mut self, timeout_ns: u64) -> GpuResult<AcquiredFrame> {
        let slot = self.frame_offset;
        let fence = self.in_flight[slot];
        let semaphore = self.image_acquired[slot];

        self.device.wait_for_fence(fence, timeout_ns)?;
        let image_index = self.device.acquire_next_image(self.raw, timeout_ns, semaphore)?;
        self.device.reset_fence(fence)?;

        self.image_index = image_index;
        self.frame_offset = (slot + 1) % FRAMES_IN_FLIGHT;
        Ok(AcquiredFrame {
            slot,
            image_index,
            image_acquired: semaphore,
            in_flight: fence,
        })
    }

    /// Blocks until the GPU is done with everything last submitted for `slot`.
    pub fn wait_slot(&self, slot: usize, timeout_ns: u64) -> GpuResult<()> {
        self.device.wait_for_fence(self.in_flight[slot], timeout_ns)
    }

    /// Slot the next [`Swapchain::advance_frame`] will use.
    pub fn frame_offset(&self) -> usize {
        self.frame_offset
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.settings.surface_format.format
    }

    pub fn settings(&self) -> SwapchainSettings {
        self.settings
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn cache(&self) -> &SwapchainBoundCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut SwapchainBoundCache {
        &mut self.cache
    }

    fn destroy_chain(&mut self) {
        for view in self.views.drain(..) {
            self.device.destroy_image_view(view);
        }
        self.images.clear();
        if self.raw != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.raw);
            self.raw = vk::SwapchainKHR::null();
        }
    }
}

impl<D: Device> Drop for Swapchain<D> {
    fn drop(&mut self) {
        self.device.wait_idle().ok();
        self.cache.clear();
        self.destroy_chain();
        for slot in 0..FRAMES_IN_FLIGHT {
            self.device.destroy_fence(self.in_flight[slot]);
            self.device.destroy_semaphore(self.image_acquired[slot]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceId;
    use crate::device::{QueueFamilies, Submission};
    use crate::testing::{default_surface_support, Call, RecordingDevice};

    fn swapchain(dev: &Arc<RecordingDevice>) -> Swapchain<RecordingDevice> {
        Swapchain::new(dev, SwapchainSettings::default(), 800, 600).unwrap()
    }

    /// What a frame's render submission does to the slot's sync objects.
    fn complete(dev: &RecordingDevice, frame: &AcquiredFrame) {
        dev.queue_submit(
            dev.graphics_queue(),
            &Submission {
                waits: &[(frame.image_acquired, vk::PipelineStageFlags::ALL_COMMANDS)],
                command_buffers: &[],
                signals: &[],
            },
            frame.in_flight,
        )
        .unwrap();
    }

    fn last_desc(dev: &RecordingDevice) -> SwapchainDesc {
        dev.calls()
            .into_iter()
            .rev()
            .find_map(|c| match c {
                Call::CreateSwapchain { desc, .. } => Some(desc),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn views_match_images() {
        let dev = Arc::new(RecordingDevice::new());
        dev.set_image_count(3);
        let sc = swapchain(&dev);
        assert_eq!(sc.image_count(), 3);
        assert_eq!(sc.views().len(), 3);
        assert_eq!(sc.extent(), vk::Extent2D { width: 800, height: 600 });

        let desc = last_desc(&dev);
        assert_eq!(desc.min_image_count, 2);
        assert_eq!(desc.sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert!(desc.usage.contains(vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn image_count_respects_surface_minimum() {
        let dev = Arc::new(RecordingDevice::new());
        let mut support = default_surface_support();
        support.capabilities.min_image_count = 3;
        dev.set_surface_support(support);
        let _sc = swapchain(&dev);
        assert_eq!(last_desc(&dev).min_image_count, 3);
    }

    #[test]
    fn composite_alpha_follows_surface() {
        let dev = Arc::new(RecordingDevice::new());
        let _sc = swapchain(&dev);
        assert_eq!(last_desc(&dev).composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);

        let dev = Arc::new(RecordingDevice::new());
        let mut support = default_surface_support();
        support.capabilities.supported_composite_alpha =
            vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED;
        dev.set_surface_support(support);
        let _sc = swapchain(&dev);
        assert_eq!(
            last_desc(&dev).composite_alpha,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
        );
    }

    #[test]
    fn split_families_share_concurrently() {
        let dev = Arc::new(RecordingDevice::with_families(QueueFamilies {
            graphics: 0,
            present: 1,
        }));
        let _sc = swapchain(&dev);
        let desc = last_desc(&dev);
        assert_eq!(desc.sharing_mode, vk::SharingMode::CONCURRENT);
        assert_eq!(desc.queue_family_indices, vec![0, 1]);
    }

    #[test]
    fn extent_is_clamped() {
        let dev = Arc::new(RecordingDevice::new());
        let sc = Swapchain::new(&dev, SwapchainSettings::default(), 9000, 300).unwrap();
        assert_eq!(sc.extent(), vk::Extent2D { width: 4096, height: 300 });
    }

    #[test]
    fn unsupported_settings_are_fatal() {
        let dev = Arc::new(RecordingDevice::new());
        let mut settings = SwapchainSettings::default();
        settings.present_mode = vk::PresentModeKHR::IMMEDIATE;
        let err = Swapchain::new(&dev, settings, 800, 600).err().unwrap();
        assert!(matches!(err, GpuError::UnsupportedPresentMode(_)));

        let mut settings = SwapchainSettings::default();
        settings.surface_format.format = vk::Format::R8G8B8A8_UNORM;
        let err = Swapchain::new(&dev, settings, 800, 600).err().unwrap();
        assert!(matches!(err, GpuError::UnsupportedSurfaceFormat { .. }));
    }

    #[test]
    fn advance_cycles_slots() {
        let dev = Arc::new(RecordingDevice::new());
        let mut sc = swapchain(&dev);
        let slots: Vec<_> = (0..5)
            .map(|_| {
                let frame = sc.advance_frame(u64::MAX).unwrap();
                complete(&dev, &frame);
                frame.slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(sc.frame_offset(), 1);
    }

    #[test]
    fn slot_whose_fence_is_never_signaled_times_out() {
        let dev = Arc::new(RecordingDevice::new());
        let mut sc = swapchain(&dev);
        sc.advance_frame(1_000).unwrap();
        let frame = sc.advance_frame(1_000).unwrap();
        complete(&dev, &frame);
        // slot 0 was reset and nothing signaled it
        assert!(matches!(sc.advance_frame(1_000), Err(GpuError::Timeout(_))));
        assert_eq!(sc.frame_offset(), 0);
    }

    #[test]
    fn advance_waits_acquires_then_resets() {
        let dev = Arc::new(RecordingDevice::new());
        let mut sc = swapchain(&dev);
        dev.clear_calls();
        let frame = sc.advance_frame(5_000).unwrap();
        let calls = dev.calls();
        assert!(matches!(
            calls[0],
            Call::WaitForFence { fence, timeout_ns: 5_000 } if fence == frame.in_flight
        ));
        assert!(matches!(
            calls[1],
            Call::AcquireNextImage { semaphore, timeout_ns: 5_000, .. } if semaphore == frame.image_acquired
        ));
        assert!(matches!(calls[2], Call::ResetFence(f) if f == frame.in_flight));
        assert!(!dev.is_fence_signaled(frame.in_flight));
        assert_eq!(sc.image_index(), frame.image_index);
    }

    #[test]
    fn recreate_drains_and_empties_cache() {
        let dev = Arc::new(RecordingDevice::new());
        let mut sc = swapchain(&dev);
        let id = ResourceId::from_name("target");
        sc.cache_mut().insert(id, 0, 1u32);
        sc.cache_mut().insert(id, 1, 2u32);
        let old = sc.raw();
        dev.clear_calls();

        sc.recreate(1024, 768).unwrap();
        assert!(sc.cache().is_empty());
        assert!(sc.cache().get::<u32>(id, 0).unwrap().is_none());
        assert_eq!(sc.cache().generation(), 2);
        assert_ne!(sc.raw(), old);

        let calls = dev.calls();
        assert!(matches!(calls[0], Call::WaitIdle));
        assert_eq!(
            dev.count_calls(|c| matches!(c, Call::DestroySwapchain(s) if *s == old)),
            1
        );
        assert_eq!(dev.count_calls(|c| matches!(c, Call::DestroyImageView(_))), 2);
        assert_eq!(dev.live_views(), 2);
    }

    #[test]
    fn zero_area_recreate_is_a_no_op() {
        let dev = Arc::new(RecordingDevice::new());
        let mut sc = swapchain(&dev);
        dev.clear_calls();
        sc.recreate(0, 0).unwrap();
        assert!(dev.calls().is_empty());
        assert_eq!(sc.extent(), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn drop_releases_everything() {
        let dev = Arc::new(RecordingDevice::new());
        drop(swapchain(&dev));
        assert_eq!(dev.live_views(), 0);
        assert_eq!(dev.count_calls(|c| matches!(c, Call::DestroyFence(_))), 2);
        assert_eq!(dev.count_calls(|c| matches!(c, Call::DestroySemaphore(_))), 2);
    }
}
