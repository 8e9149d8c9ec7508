// SPDX-License-Identifier: CEPL-1.0
//! The seam between the frame core and the GPU.
//!
//! Everything the swapchain manager, staging buffer, command pools and frame
//! orchestrator do to the GPU goes through [`Device`]. The production
//! implementation is [`crate::AshDevice`]; tests use `testing::RecordingDevice`
//! behind the `testing` feature.

use ash::vk;

use crate::error::GpuResult;

/// Where an allocation should live. Mirrors the allocator's memory locations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub name: &'static str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub name: &'static str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }
}

#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// Layout transition for one image, single mip and layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// One queue submission: waits with their stage gates, buffers, signals.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub waits: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signals: &'a [vk::Semaphore],
}

#[derive(Clone, Copy, Debug)]
pub struct Presentation<'a> {
    pub waits: &'a [vk::Semaphore],
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
}

pub trait Device: 'static {
    /// Backing memory of a buffer or image, owned by whoever owns the handle.
    type Memory: 'static;

    fn queue_families(&self) -> QueueFamilies;
    fn graphics_queue(&self) -> vk::Queue;
    fn present_queue(&self) -> vk::Queue;
    /// Blocks until every queue on the device is idle.
    fn wait_idle(&self) -> GpuResult<()>;

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<(vk::Buffer, Self::Memory)>;
    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Self::Memory);
    /// Host view of a `CpuToGpu`/`GpuToCpu` allocation.
    fn mapped<'m>(&self, memory: &'m mut Self::Memory) -> GpuResult<&'m mut [u8]>;

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<(vk::Image, Self::Memory)>;
    fn destroy_image(&self, image: vk::Image, memory: Self::Memory);
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> GpuResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Whether `format` can back an optimally tiled depth/stencil attachment.
    fn supports_depth_format(&self, format: vk::Format) -> bool;

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;
    fn create_semaphore(&self) -> GpuResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(&self, queue_family: u32) -> GpuResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> GpuResult<Vec<vk::CommandBuffer>>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;
    /// Begins one-time-submit recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_image_barriers(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barriers: &[ImageBarrier],
    );
    /// Image must be in `TRANSFER_DST_OPTIMAL`.
    fn cmd_clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, rgba: [f32; 4]);
    /// Image must be in `TRANSFER_DST_OPTIMAL`.
    fn cmd_clear_depth_stencil_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        depth: f32,
        stencil: u32,
    );
    /// Color copy of the whole extent, `TRANSFER_SRC_OPTIMAL` to `TRANSFER_DST_OPTIMAL`.
    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
    );

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> GpuResult<()>;
    /// Returns `true` when the swapchain no longer matches the surface exactly.
    fn queue_present(&self, queue: vk::Queue, presentation: &Presentation<'_>) -> GpuResult<bool>;

    fn surface_support(&self) -> GpuResult<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GpuResult<Vec<vk::Image>>;
    /// Signals `semaphore` once the returned image may be written.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> GpuResult<u32>;
}
