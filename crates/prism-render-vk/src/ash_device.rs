// SPDX-License-Identifier: CEPL-1.0
//! [`Device`] over a real Vulkan device. Memory comes from `gpu-allocator`.
//!
//! Every `unsafe` block here forwards handles that were created by this
//! device (or by objects holding an `Arc` to it) and are destroyed only
//! through it, which is the contract ash asks for.

use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::device::{
    BufferDesc, Device, ImageBarrier, ImageDesc, MemoryLocation, Presentation, QueueFamilies,
    Submission, SurfaceSupport, SwapchainDesc,
};
use crate::error::{GpuError, GpuResult, VkResultExt};

pub struct AshDevice {
    pub(crate) _entry: Entry,
    pub(crate) instance: Instance,
    pub(crate) surface_loader: surface::Instance,
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) swapchain_loader: swapchain::Device,
    pub(crate) families: QueueFamilies,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    // dropped before the device is destroyed
    pub(crate) allocator: Option<Mutex<Allocator>>,
}

fn location(loc: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match loc {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

fn range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

impl AshDevice {
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.phys
    }

    fn allocator(&self) -> GpuResult<MutexGuard<'_, Allocator>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| GpuError::Allocation("allocator already released".into()))?
            .lock()
            .map_err(|_| GpuError::Allocation("allocator lock poisoned".into()))
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        loc: MemoryLocation,
        linear: bool,
    ) -> GpuResult<Allocation> {
        self.allocator()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: location(loc),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::Allocation(format!("{name}: {e}")))
    }

    fn free(&self, allocation: Allocation) {
        match self.allocator() {
            Ok(mut a) => {
                if let Err(e) = a.free(allocation) {
                    warn!("free allocation: {e}");
                }
            }
            Err(e) => warn!("free allocation: {e}"),
        }
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        debug!("destroying Vulkan device");
        unsafe {
            self.device.device_wait_idle().ok();
            self.allocator = None;
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Device for AshDevice {
    type Memory = Allocation;

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.op("device_wait_idle")
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<(vk::Buffer, Allocation)> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }.op("create_buffer")?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(desc.name, requirements, desc.location, true) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(result) = bound {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GpuError::vk("bind_buffer_memory", result));
        }
        Ok((buffer, allocation))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Allocation) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        self.free(memory);
    }

    fn mapped<'m>(&self, memory: &'m mut Allocation) -> GpuResult<&'m mut [u8]> {
        memory.mapped_slice_mut().ok_or(GpuError::NotMapped)
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<(vk::Image, Allocation)> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }.op("create_image")?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(desc.name, requirements, MemoryLocation::GpuOnly, false)
        {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(result) = bound {
            self.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(GpuError::vk("bind_image_memory", result));
        }
        Ok((image, allocation))
    }

    fn destroy_image(&self, image: vk::Image, memory: Allocation) {
        unsafe { self.device.destroy_image(image, None) };
        self.free(memory);
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> GpuResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(range(aspect));
        unsafe { self.device.create_image_view(&info, None) }.op("create_image_view")
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.phys, format)
        };
        props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&info, None) }.op("create_fence")
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }.op("wait_for_fences")
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.op("reset_fences")
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&info, None) }.op("create_semaphore")
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, queue_family: u32) -> GpuResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        unsafe { self.device.create_command_pool(&info, None) }.op("create_command_pool")
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> GpuResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }.op("allocate_command_buffers")
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .op("reset_command_pool")
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .op("reset_command_buffer")
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }.op("begin_command_buffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }.op("end_command_buffer")
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) }
    }

    fn cmd_image_barriers(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barriers: &[ImageBarrier],
    ) {
        let raw: Vec<_> = barriers
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(b.image)
                    .subresource_range(range(b.aspect))
            })
            .collect();
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &raw,
            )
        }
    }

    fn cmd_clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, rgba: [f32; 4]) {
        let value = vk::ClearColorValue { float32: rgba };
        unsafe {
            self.device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &value,
                &[range(vk::ImageAspectFlags::COLOR)],
            )
        }
    }

    fn cmd_clear_depth_stencil_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        depth: f32,
        stencil: u32,
    ) {
        let value = vk::ClearDepthStencilValue { depth, stencil };
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &value,
                &[range(
                    vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                )],
            )
        }
    }

    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
    ) {
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let region = vk::ImageCopy::default()
            .src_subresource(layers)
            .dst_subresource(layers)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            self.device.cmd_copy_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> GpuResult<()> {
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            submission.waits.iter().copied().unzip();
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signals);
        unsafe { self.device.queue_submit(queue, &[info], fence) }.op("queue_submit")
    }

    fn queue_present(&self, queue: vk::Queue, presentation: &Presentation<'_>) -> GpuResult<bool> {
        let swapchains = [presentation.swapchain];
        let indices = [presentation.image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(presentation.waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.swapchain_loader.queue_present(queue, &info) }.op("queue_present")
    }

    fn surface_support(&self) -> GpuResult<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.phys, self.surface)
                    .op("get_physical_device_surface_capabilities")?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.phys, self.surface)
                    .op("get_physical_device_surface_formats")?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.phys, self.surface)
                    .op("get_physical_device_surface_present_modes")?,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<vk::SwapchainKHR> {
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(desc.usage)
            .image_sharing_mode(desc.sharing_mode)
            .queue_family_indices(&desc.queue_family_indices)
            .pre_transform(desc.pre_transform)
            .composite_alpha(desc.composite_alpha)
            .present_mode(desc.present_mode)
            .clipped(true);
        unsafe { self.swapchain_loader.create_swapchain(&info, None) }.op("create_swapchain")
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GpuResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
            .op("get_swapchain_images")
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> GpuResult<u32> {
        // a suboptimal acquire still yields a usable image; present reports it
        let (index, _suboptimal) = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
        .op("acquire_next_image")?;
        Ok(index)
    }
}
