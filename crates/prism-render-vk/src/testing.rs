// SPDX-License-Identifier: CEPL-1.0
//! Host-only [`Device`] that records what the frame core asks of the GPU.
//!
//! Handles are fresh integers and allocations are byte vectors. Every command
//! buffer keeps the list of commands recorded into it since its last reset.
//! Submissions complete immediately: their fence and signal semaphores become
//! signaled as soon as they are queued. Waiting on an unsignaled fence that no
//! submission will signal fails with a timeout instead of hanging.

use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::device::{
    BufferDesc, Device, ImageBarrier, ImageDesc, MemoryLocation, Presentation, QueueFamilies,
    Submission, SurfaceSupport, SwapchainDesc,
};
use crate::error::{GpuError, GpuResult};

#[derive(Clone, Debug)]
pub enum Call {
    WaitIdle,
    CreateBuffer { buffer: vk::Buffer, size: vk::DeviceSize, location: MemoryLocation },
    DestroyBuffer(vk::Buffer),
    CreateImage { image: vk::Image, extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags },
    DestroyImage(vk::Image),
    CreateImageView { view: vk::ImageView, image: vk::Image },
    DestroyImageView(vk::ImageView),
    CreateFence { fence: vk::Fence, signaled: bool },
    DestroyFence(vk::Fence),
    WaitForFence { fence: vk::Fence, timeout_ns: u64 },
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool { pool: vk::CommandPool, queue_family: u32 },
    DestroyCommandPool(vk::CommandPool),
    AllocateCommandBuffers { pool: vk::CommandPool, count: u32 },
    ResetCommandPool(vk::CommandPool),
    ResetCommandBuffer(vk::CommandBuffer),
    Submit {
        queue: vk::Queue,
        waits: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
        command_buffers: Vec<vk::CommandBuffer>,
        signals: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present { queue: vk::Queue, waits: Vec<vk::Semaphore>, swapchain: vk::SwapchainKHR, image_index: u32 },
    CreateSwapchain { swapchain: vk::SwapchainKHR, desc: SwapchainDesc },
    DestroySwapchain(vk::SwapchainKHR),
    AcquireNextImage { swapchain: vk::SwapchainKHR, semaphore: vk::Semaphore, timeout_ns: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    Begin,
    End,
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, src_offset: u64, dst_offset: u64, size: u64 },
    Barriers { src_stage: vk::PipelineStageFlags, dst_stage: vk::PipelineStageFlags, barriers: Vec<ImageBarrier> },
    ClearColor { image: vk::Image, rgba: [f32; 4] },
    ClearDepthStencil { image: vk::Image, depth: f32, stencil: u32 },
    CopyImage { src: vk::Image, dst: vk::Image, extent: vk::Extent2D },
    Sentinel(u32),
}

#[derive(Clone, Copy, Debug)]
pub enum AcquireOutcome {
    Image(u32),
    OutOfDate,
}

#[derive(Clone, Copy, Debug)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

#[derive(Debug)]
pub struct MockMemory {
    bytes: Vec<u8>,
    host_visible: bool,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    calls: Vec<Call>,
    commands: HashMap<vk::CommandBuffer, Vec<Recorded>>,
    pool_buffers: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    live_buffers: HashSet<vk::Buffer>,
    live_images: HashSet<vk::Image>,
    live_views: HashSet<vk::ImageView>,
    swapchain_images: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    next_image: HashMap<vk::SwapchainKHR, u32>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    fail_allocations: bool,
    allocations_left: Option<usize>,
    image_count_override: Option<u32>,
    signaled_fences: HashSet<vk::Fence>,
    signaled_semaphores: HashSet<vk::Semaphore>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct RecordingDevice {
    families: QueueFamilies,
    support: RefCell<SurfaceSupport>,
    depth_formats: RefCell<Vec<vk::Format>>,
    state: RefCell<State>,
}

pub fn default_surface_support() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

const GRAPHICS_QUEUE: u64 = 0x100;
const PRESENT_QUEUE: u64 = 0x200;

impl RecordingDevice {
    /// Graphics and present share family 0.
    pub fn new() -> Self {
        Self::with_families(QueueFamilies { graphics: 0, present: 0 })
    }

    pub fn with_families(families: QueueFamilies) -> Self {
        RecordingDevice {
            families,
            support: RefCell::new(default_surface_support()),
            depth_formats: RefCell::new(vec![
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ]),
            state: RefCell::new(State::default()),
        }
    }

    pub fn set_surface_support(&self, support: SurfaceSupport) {
        *self.support.borrow_mut() = support;
    }

    /// Depth formats reported as usable for depth/stencil attachments.
    pub fn set_depth_formats(&self, formats: Vec<vk::Format>) {
        *self.depth_formats.borrow_mut() = formats;
    }

    /// Forces the image count the next swapchains report, regardless of the request.
    pub fn set_image_count(&self, count: u32) {
        self.state.borrow_mut().image_count_override = Some(count);
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.state.borrow_mut().fail_allocations = fail;
    }

    /// Lets `count` more buffer or image allocations succeed, then fails the rest.
    pub fn fail_allocations_after(&self, count: usize) {
        self.state.borrow_mut().allocations_left = Some(count);
    }

    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().present_script.push_back(outcome);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn submits(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Submit { .. }))
            .collect()
    }

    /// Commands recorded into `cmd` since it was last reset.
    pub fn commands(&self, cmd: vk::CommandBuffer) -> Vec<Recorded> {
        self.state
            .borrow()
            .commands
            .get(&cmd)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record_sentinel(&self, cmd: vk::CommandBuffer, tag: u32) {
        self.record(cmd, Recorded::Sentinel(tag));
    }

    pub fn pool_buffers(&self, pool: vk::CommandPool) -> Vec<vk::CommandBuffer> {
        self.state
            .borrow()
            .pool_buffers
            .get(&pool)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().live_buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.borrow().live_images.len()
    }

    pub fn live_views(&self) -> usize {
        self.state.borrow().live_views.len()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.borrow().signaled_fences.contains(&fence)
    }

    /// Semaphores signaled by an acquire or a submission that nothing has waited on yet.
    pub fn signaled_semaphores(&self) -> usize {
        self.state.borrow().signaled_semaphores.len()
    }

    fn log(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }

    fn record(&self, cmd: vk::CommandBuffer, rec: Recorded) {
        self.state.borrow_mut().commands.entry(cmd).or_default().push(rec);
    }

    fn allocation_guard(&self, what: &str) -> GpuResult<()> {
        let mut st = self.state.borrow_mut();
        let exhausted = match st.allocations_left.as_mut() {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if st.fail_allocations || exhausted {
            return Err(GpuError::Allocation(format!("{what}: scripted failure")));
        }
        Ok(())
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for RecordingDevice {
    type Memory = MockMemory;

    fn queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn graphics_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(GRAPHICS_QUEUE)
    }

    fn present_queue(&self) -> vk::Queue {
        if self.families.is_shared() {
            self.graphics_queue()
        } else {
            vk::Queue::from_raw(PRESENT_QUEUE)
        }
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.log(Call::WaitIdle);
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<(vk::Buffer, MockMemory)> {
        self.allocation_guard(desc.name)?;
        let mut st = self.state.borrow_mut();
        let buffer = vk::Buffer::from_raw(st.handle());
        st.live_buffers.insert(buffer);
        st.calls.push(Call::CreateBuffer { buffer, size: desc.size, location: desc.location });
        let memory = MockMemory {
            bytes: vec![0; desc.size as usize],
            host_visible: desc.location != MemoryLocation::GpuOnly,
        };
        Ok((buffer, memory))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, _memory: MockMemory) {
        let mut st = self.state.borrow_mut();
        st.live_buffers.remove(&buffer);
        st.calls.push(Call::DestroyBuffer(buffer));
    }

    fn mapped<'m>(&self, memory: &'m mut MockMemory) -> GpuResult<&'m mut [u8]> {
        if !memory.host_visible {
            return Err(GpuError::NotMapped);
        }
        Ok(&mut memory.bytes)
    }

    fn create_image(&self, desc: &ImageDesc) -> GpuResult<(vk::Image, MockMemory)> {
        self.allocation_guard(desc.name)?;
        let mut st = self.state.borrow_mut();
        let image = vk::Image::from_raw(st.handle());
        st.live_images.insert(image);
        st.calls.push(Call::CreateImage {
            image,
            extent: desc.extent,
            format: desc.format,
            usage: desc.usage,
        });
        Ok((image, MockMemory { bytes: Vec::new(), host_visible: false }))
    }

    fn destroy_image(&self, image: vk::Image, _memory: MockMemory) {
        let mut st = self.state.borrow_mut();
        st.live_images.remove(&image);
        st.calls.push(Call::DestroyImage(image));
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> GpuResult<vk::ImageView> {
        let mut st = self.state.borrow_mut();
        let view = vk::ImageView::from_raw(st.handle());
        st.live_views.insert(view);
        st.calls.push(Call::CreateImageView { view, image });
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut st = self.state.borrow_mut();
        st.live_views.remove(&view);
        st.calls.push(Call::DestroyImageView(view));
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let mut st = self.state.borrow_mut();
        let fence = vk::Fence::from_raw(st.handle());
        if signaled {
            st.signaled_fences.insert(fence);
        }
        st.calls.push(Call::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut st = self.state.borrow_mut();
        st.signaled_fences.remove(&fence);
        st.calls.push(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::WaitForFence { fence, timeout_ns });
        if st.signaled_fences.contains(&fence) {
            Ok(())
        } else {
            Err(GpuError::Timeout("wait_for_fences"))
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        let mut st = self.state.borrow_mut();
        st.signaled_fences.remove(&fence);
        st.calls.push(Call::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let mut st = self.state.borrow_mut();
        let semaphore = vk::Semaphore::from_raw(st.handle());
        st.calls.push(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut st = self.state.borrow_mut();
        st.signaled_semaphores.remove(&semaphore);
        st.calls.push(Call::DestroySemaphore(semaphore));
    }

    fn create_command_pool(&self, queue_family: u32) -> GpuResult<vk::CommandPool> {
        let mut st = self.state.borrow_mut();
        let pool = vk::CommandPool::from_raw(st.handle());
        st.pool_buffers.insert(pool, Vec::new());
        st.calls.push(Call::CreateCommandPool { pool, queue_family });
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut st = self.state.borrow_mut();
        if let Some(bufs) = st.pool_buffers.remove(&pool) {
            for cmd in bufs {
                st.commands.remove(&cmd);
            }
        }
        st.calls.push(Call::DestroyCommandPool(pool));
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> GpuResult<Vec<vk::CommandBuffer>> {
        let mut st = self.state.borrow_mut();
        let bufs: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(st.handle()))
            .collect();
        st.pool_buffers.entry(pool).or_default().extend(bufs.iter().copied());
        st.calls.push(Call::AllocateCommandBuffers { pool, count });
        Ok(bufs)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()> {
        let mut st = self.state.borrow_mut();
        let bufs = st.pool_buffers.get(&pool).cloned().unwrap_or_default();
        for cmd in bufs {
            st.commands.remove(&cmd);
        }
        st.calls.push(Call::ResetCommandPool(pool));
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        let mut st = self.state.borrow_mut();
        st.commands.remove(&cmd);
        st.calls.push(Call::ResetCommandBuffer(cmd));
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        self.record(cmd, Recorded::Begin);
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        self.record(cmd, Recorded::End);
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.record(
            cmd,
            Recorded::CopyBuffer {
                src,
                dst,
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            },
        );
    }

    fn cmd_image_barriers(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barriers: &[ImageBarrier],
    ) {
        self.record(
            cmd,
            Recorded::Barriers { src_stage, dst_stage, barriers: barriers.to_vec() },
        );
    }

    fn cmd_clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, rgba: [f32; 4]) {
        self.record(cmd, Recorded::ClearColor { image, rgba });
    }

    fn cmd_clear_depth_stencil_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        depth: f32,
        stencil: u32,
    ) {
        self.record(cmd, Recorded::ClearDepthStencil { image, depth, stencil });
    }

    fn cmd_copy_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        extent: vk::Extent2D,
    ) {
        self.record(cmd, Recorded::CopyImage { src, dst, extent });
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> GpuResult<()> {
        let mut st = self.state.borrow_mut();
        for (semaphore, _) in submission.waits {
            st.signaled_semaphores.remove(semaphore);
        }
        st.signaled_semaphores.extend(submission.signals.iter().copied());
        if fence != vk::Fence::null() {
            st.signaled_fences.insert(fence);
        }
        st.calls.push(Call::Submit {
            queue,
            waits: submission.waits.to_vec(),
            command_buffers: submission.command_buffers.to_vec(),
            signals: submission.signals.to_vec(),
            fence,
        });
        Ok(())
    }

    fn queue_present(&self, queue: vk::Queue, presentation: &Presentation<'_>) -> GpuResult<bool> {
        let outcome = {
            let mut st = self.state.borrow_mut();
            for semaphore in presentation.waits {
                st.signaled_semaphores.remove(semaphore);
            }
            st.calls.push(Call::Present {
                queue,
                waits: presentation.waits.to_vec(),
                swapchain: presentation.swapchain,
                image_index: presentation.image_index,
            });
            st.present_script.pop_front().unwrap_or(PresentOutcome::Optimal)
        };
        match outcome {
            PresentOutcome::Optimal => Ok(false),
            PresentOutcome::Suboptimal => Ok(true),
            PresentOutcome::OutOfDate => Err(GpuError::OutOfDate),
        }
    }

    fn surface_support(&self) -> GpuResult<SurfaceSupport> {
        Ok(self.support.borrow().clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> GpuResult<vk::SwapchainKHR> {
        let mut st = self.state.borrow_mut();
        let swapchain = vk::SwapchainKHR::from_raw(st.handle());
        let count = st.image_count_override.unwrap_or(desc.min_image_count);
        let images = (0..count).map(|_| vk::Image::from_raw(st.handle())).collect();
        st.swapchain_images.insert(swapchain, images);
        st.calls.push(Call::CreateSwapchain { swapchain, desc: desc.clone() });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut st = self.state.borrow_mut();
        st.swapchain_images.remove(&swapchain);
        st.next_image.remove(&swapchain);
        st.calls.push(Call::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> GpuResult<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchain_images
            .get(&swapchain)
            .cloned()
            .ok_or(GpuError::Vk {
                op: "get_swapchain_images",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            })
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> GpuResult<u32> {
        let mut st = self.state.borrow_mut();
        st.calls.push(Call::AcquireNextImage { swapchain, semaphore, timeout_ns });
        let count = st.swapchain_images.get(&swapchain).map_or(0, Vec::len) as u32;
        match st.acquire_script.pop_front() {
            Some(AcquireOutcome::OutOfDate) => Err(GpuError::OutOfDate),
            Some(AcquireOutcome::Image(index)) => {
                st.signaled_semaphores.insert(semaphore);
                Ok(index)
            }
            None => {
                let next = st.next_image.entry(swapchain).or_insert(0);
                let index = *next;
                *next = (index + 1) % count.max(1);
                st.signaled_semaphores.insert(semaphore);
                Ok(index)
            }
        }
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        self.depth_formats.borrow().contains(&format)
    }
}
