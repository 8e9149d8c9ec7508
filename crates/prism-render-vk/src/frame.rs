// SPDX-License-Identifier: CEPL-1.0
//! Per-frame sequence: advance the swapchain, resolve the render target,
//! record and submit the update phase, record and submit the render phase,
//! present.
//!
//! Queue ordering is carried entirely by semaphores. The render submission
//! waits on the update submission and on image acquisition, and signals the
//! slot's fence; presentation waits on the render submission.

use ash::vk;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::cache::ResourceId;
use crate::command::CommandPool;
use crate::device::{Device, Presentation, Submission};
use crate::error::GpuResult;
use crate::render_target::{RenderTarget, RenderTargetFlags};
use crate::scene::Scene;
use crate::staging::StagingBuffer;
use crate::swapchain::{AcquiredFrame, Swapchain, FRAMES_IN_FLIGHT};
use crate::system::{DrawSystem, FrameInfo, RenderContext, UpdateContext};

pub const RENDER_TARGET_NAME: &str = "FrameOrchestrator/RenderTarget";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Presented, but the swapchain no longer matches the surface.
    Suboptimal,
}

struct FrameSlot<D: Device> {
    pool: CommandPool<D>,
    staging: StagingBuffer<D>,
    update_done: vk::Semaphore,
    render_done: vk::Semaphore,
}

pub struct FrameOrchestrator<D: Device> {
    device: Arc<D>,
    slots: Vec<FrameSlot<D>>,
    systems: Vec<Box<dyn DrawSystem<D>>>,
    render_target_id: ResourceId,
    target_flags: RenderTargetFlags,
    timeout_ns: u64,
    frames: u64,
}

impl<D: Device> FrameOrchestrator<D> {
    /// `timeout_ns` bounds fence waits and image acquisition; `u64::MAX` never times out.
    pub fn new(device: &Arc<D>, staging_capacity: vk::DeviceSize, timeout_ns: u64) -> GpuResult<Self> {
        let mut orch = FrameOrchestrator {
            device: device.clone(),
            slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
            systems: Vec::new(),
            render_target_id: ResourceId::from_name(RENDER_TARGET_NAME),
            target_flags: RenderTargetFlags::all(),
            timeout_ns,
            frames: 0,
        };
        let family = device.queue_families().graphics;
        for _ in 0..FRAMES_IN_FLIGHT {
            let pool = CommandPool::new(device, family)?;
            let staging = StagingBuffer::with_capacity(device, staging_capacity)?;
            let update_done = device.create_semaphore()?;
            let render_done = match device.create_semaphore() {
                Ok(s) => s,
                Err(e) => {
                    device.destroy_semaphore(update_done);
                    return Err(e);
                }
            };
            orch.slots.push(FrameSlot {
                pool,
                staging,
                update_done,
                render_done,
            });
        }
        Ok(orch)
    }

    /// Appends a system; systems run in registration order in both phases.
    pub fn push_system(&mut self, system: Box<dyn DrawSystem<D>>) {
        debug!(system = system.name(), "draw system registered");
        self.systems.push(system);
    }

    pub fn insert_system(&mut self, index: usize, system: Box<dyn DrawSystem<D>>) {
        debug!(system = system.name(), index, "draw system registered");
        self.systems.insert(index.min(self.systems.len()), system);
    }

    pub fn system_names(&self) -> Vec<&'static str> {
        self.systems.iter().map(|s| s.name()).collect()
    }

    pub fn render_target_id(&self) -> ResourceId {
        self.render_target_id
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames
    }

    pub fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    /// Staging arena the next frame will commit. Waits for that slot's
    /// previous frame to finish on the GPU before handing it out.
    pub fn staging_for_next_frame(
        &mut self,
        swapchain: &Swapchain<D>,
    ) -> GpuResult<&mut StagingBuffer<D>> {
        let slot = swapchain.frame_offset();
        swapchain.wait_slot(slot, self.timeout_ns)?;
        Ok(&mut self.slots[slot].staging)
    }

    /// Drops uploads into `dst` still pending in any slot's staging arena.
    /// Call before destroying a buffer that may have copies staged.
    pub fn forget_uploads(&mut self, dst: vk::Buffer) {
        for slot in &mut self.slots {
            slot.staging.forget(dst);
        }
    }

    /// Draws and presents one frame.
    ///
    /// A failure after the image was acquired still leaves the slot usable:
    /// before the error is returned, the slot's fence is signaled again and
    /// the semaphores the frame left signaled are waited on.
    pub fn draw_frame(
        &mut self,
        swapchain: &mut Swapchain<D>,
        scene: &Scene<D>,
        dt: f32,
    ) -> GpuResult<FrameStatus> {
        let frame = swapchain.advance_frame(self.timeout_ns)?;
        let swapchain_raw = swapchain.raw();

        let mut update_submitted = false;
        if let Err(e) = self.submit_frame(swapchain, scene, dt, &frame, &mut update_submitted) {
            self.abandon_frame(&frame, update_submitted);
            return Err(e);
        }

        let suboptimal = self.device.queue_present(
            self.device.present_queue(),
            &Presentation {
                waits: &[self.slots[frame.slot].render_done],
                swapchain: swapchain_raw,
                image_index: frame.image_index,
            },
        )?;
        self.frames += 1;
        Ok(if suboptimal {
            FrameStatus::Suboptimal
        } else {
            FrameStatus::Presented
        })
    }

    fn submit_frame(
        &mut self,
        swapchain: &mut Swapchain<D>,
        scene: &Scene<D>,
        dt: f32,
        frame: &AcquiredFrame,
        update_submitted: &mut bool,
    ) -> GpuResult<()> {
        let image = frame.image_index as usize;
        let extent = swapchain.extent();
        let color_format = swapchain.format();
        let swapchain_image = swapchain.images()[image];
        let info = FrameInfo {
            slot: frame.slot,
            image_index: frame.image_index,
            extent,
            dt,
        };

        let device = self.device.clone();
        let flags = self.target_flags;
        let target: &RenderTarget<D> = swapchain.cache_mut().get_or_try_insert_with(
            self.render_target_id,
            image,
            || RenderTarget::new(&device, extent, color_format, flags),
        )?;

        let slot = &mut self.slots[frame.slot];
        slot.pool.reset()?;

        // update phase: one buffer per system, staging commit last
        let mut scope = slot.pool.begin_scope();
        let mut ctx = UpdateContext {
            device: device.as_ref(),
            frame: info,
            staging: &mut slot.staging,
        };
        for system in self.systems.iter_mut() {
            let cmd = scope.next_buffer()?;
            system.update(&mut ctx, cmd, scene)?;
        }
        let cmd = scope.next_buffer()?;
        ctx.staging.commit(cmd)?;
        device.queue_submit(
            device.graphics_queue(),
            &Submission {
                waits: &[],
                command_buffers: scope.buffers(),
                signals: &[slot.update_done],
            },
            vk::Fence::null(),
        )?;
        *update_submitted = true;
        trace!(slot = frame.slot, buffers = scope.size(), "update submitted");

        // render phase
        let mut scope = slot.pool.begin_scope();
        let ctx = RenderContext {
            device: device.as_ref(),
            frame: info,
            target,
            swapchain_image,
        };
        for system in self.systems.iter_mut() {
            let cmd = scope.next_buffer()?;
            system.render(&ctx, cmd, scene)?;
        }
        let waits = [
            (slot.update_done, vk::PipelineStageFlags::ALL_COMMANDS),
            (
                frame.image_acquired,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
        ];
        device.queue_submit(
            device.graphics_queue(),
            &Submission {
                waits: &waits,
                command_buffers: scope.buffers(),
                signals: &[slot.render_done],
            },
            frame.in_flight,
        )?;
        trace!(slot = frame.slot, buffers = scope.size(), "render submitted");
        Ok(())
    }

    /// Empty submission that waits on what the failed frame signaled and
    /// signals the slot's reset fence once the update work, if any, is done.
    fn abandon_frame(&self, frame: &AcquiredFrame, update_submitted: bool) {
        let mut waits = vec![(frame.image_acquired, vk::PipelineStageFlags::ALL_COMMANDS)];
        if update_submitted {
            waits.push((
                self.slots[frame.slot].update_done,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ));
        }
        let released = self.device.queue_submit(
            self.device.graphics_queue(),
            &Submission {
                waits: &waits,
                command_buffers: &[],
                signals: &[],
            },
            frame.in_flight,
        );
        match released {
            Ok(()) => warn!(slot = frame.slot, "frame abandoned"),
            Err(e) => error!(slot = frame.slot, "could not release abandoned frame: {e}"),
        }
    }
}

impl<D: Device> Drop for FrameOrchestrator<D> {
    fn drop(&mut self) {
        self.device.wait_idle().ok();
        for slot in &self.slots {
            self.device.destroy_semaphore(slot.update_done);
            self.device.destroy_semaphore(slot.render_done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpuError;
    use crate::swapchain::SwapchainSettings;
    use crate::system::{ClearSystem, PresentSystem};
    use crate::testing::{default_surface_support, AcquireOutcome, Call, Recorded, RecordingDevice};
    use ash::vk::Handle;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tracer {
        log: Rc<RefCell<Vec<String>>>,
        tag: &'static str,
        upload_to: Option<vk::Buffer>,
    }

    impl DrawSystem<RecordingDevice> for Tracer {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn update(
            &mut self,
            ctx: &mut UpdateContext<'_, RecordingDevice>,
            cmd: vk::CommandBuffer,
            _scene: &Scene<RecordingDevice>,
        ) -> GpuResult<()> {
            self.log.borrow_mut().push(format!("update {}", self.tag));
            if let Some(dst) = self.upload_to {
                ctx.staging.copy_bytes(dst, &[1, 2, 3, 4])?;
            }
            crate::system::record_empty(ctx.device, cmd)
        }

        fn render(
            &mut self,
            ctx: &RenderContext<'_, RecordingDevice>,
            cmd: vk::CommandBuffer,
            _scene: &Scene<RecordingDevice>,
        ) -> GpuResult<()> {
            self.log.borrow_mut().push(format!("render {}", self.tag));
            crate::system::record_empty(ctx.device, cmd)
        }
    }

    /// Fails its first update or render, then records empty buffers.
    struct Flaky {
        in_render: bool,
        failed: bool,
    }

    impl Flaky {
        fn fail_once(&mut self) -> GpuResult<()> {
            if self.failed {
                return Ok(());
            }
            self.failed = true;
            Err(GpuError::Allocation("flaky system".into()))
        }
    }

    impl DrawSystem<RecordingDevice> for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn update(
            &mut self,
            ctx: &mut UpdateContext<'_, RecordingDevice>,
            cmd: vk::CommandBuffer,
            _scene: &Scene<RecordingDevice>,
        ) -> GpuResult<()> {
            if !self.in_render {
                self.fail_once()?;
            }
            crate::system::record_empty(ctx.device, cmd)
        }

        fn render(
            &mut self,
            ctx: &RenderContext<'_, RecordingDevice>,
            cmd: vk::CommandBuffer,
            _scene: &Scene<RecordingDevice>,
        ) -> GpuResult<()> {
            if self.in_render {
                self.fail_once()?;
            }
            crate::system::record_empty(ctx.device, cmd)
        }
    }

    struct Rig {
        dev: Arc<RecordingDevice>,
        swapchain: Swapchain<RecordingDevice>,
        orch: FrameOrchestrator<RecordingDevice>,
        scene: Scene<RecordingDevice>,
    }

    fn rig() -> Rig {
        let dev = Arc::new(RecordingDevice::new());
        let swapchain = Swapchain::new(&dev, SwapchainSettings::default(), 640, 480).unwrap();
        let orch = FrameOrchestrator::new(&dev, 256, u64::MAX).unwrap();
        Rig {
            dev,
            swapchain,
            orch,
            scene: Scene::new([0.0, 0.0, 0.0, 1.0]),
        }
    }

    type Waits = Vec<(vk::Semaphore, vk::PipelineStageFlags)>;

    fn submits(
        dev: &RecordingDevice,
    ) -> Vec<(Waits, Vec<vk::CommandBuffer>, Vec<vk::Semaphore>, vk::Fence)> {
        dev.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit {
                    waits,
                    command_buffers,
                    signals,
                    fence,
                    ..
                } => Some((waits, command_buffers, signals, fence)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn submission_and_present_order() {
        let mut r = rig();
        r.orch.push_system(Box::new(ClearSystem));
        r.orch.push_system(Box::new(PresentSystem));
        r.dev.clear_calls();

        let status = r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.016).unwrap();
        assert_eq!(status, FrameStatus::Presented);

        let subs = submits(&r.dev);
        assert_eq!(subs.len(), 2);
        let (update_waits, update_cmds, update_signals, update_fence) = &subs[0];
        let (render_waits, render_cmds, render_signals, render_fence) = &subs[1];

        // two systems plus the staging commit
        assert_eq!(update_cmds.len(), 3);
        assert!(update_waits.is_empty());
        assert_eq!(*update_fence, vk::Fence::null());
        assert_eq!(render_cmds.len(), 2);
        assert_ne!(*render_fence, vk::Fence::null());

        assert_eq!(render_waits.len(), 2);
        assert_eq!(render_waits[0].0, update_signals[0]);
        assert_eq!(render_waits[0].1, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(
            render_waits[1].1,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );

        assert_eq!(render_waits[1].0, acquire_semaphore(&r.dev));

        let present = r
            .dev
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Present { waits, image_index, .. } => Some((waits, image_index)),
                _ => None,
            })
            .unwrap();
        assert_eq!(present.0, render_signals.clone());
        assert_eq!(present.1, r.swapchain.image_index());

        // everything submitted comes from one pool, no buffer reused within the frame
        let mut all: Vec<_> = update_cmds.iter().chain(render_cmds).collect();
        all.sort_by_key(|c| c.as_raw());
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn systems_run_in_order_each_phase() {
        let mut r = rig();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            r.orch.push_system(Box::new(Tracer {
                log: log.clone(),
                tag,
                upload_to: None,
            }));
        }
        r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["update a", "update b", "render a", "render b"]
        );
    }

    #[test]
    fn update_uploads_are_committed_last() {
        let mut r = rig();
        let dst = vk::Buffer::from_raw(0xbeef);
        r.orch.push_system(Box::new(Tracer {
            log: Rc::new(RefCell::new(Vec::new())),
            tag: "uploader",
            upload_to: Some(dst),
        }));
        r.dev.clear_calls();
        r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();

        let (_, update_cmds, _, _) = submits(&r.dev).remove(0);
        let commit = *update_cmds.last().unwrap();
        assert!(r.dev.commands(commit).iter().any(|rec| matches!(
            rec,
            Recorded::CopyBuffer { dst: d, size: 4, .. } if *d == dst
        )));
    }

    #[test]
    fn render_target_is_created_once_per_image() {
        let mut r = rig();
        r.orch.push_system(Box::new(ClearSystem));
        r.dev.clear_calls();
        for _ in 0..6 {
            r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        }
        // two swapchain images, two attachments each
        assert_eq!(
            r.dev.count_calls(|c| matches!(c, Call::CreateImage { .. })),
            4
        );
        assert_eq!(r.swapchain.cache().len(), 2);
        assert_eq!(r.orch.frames_drawn(), 6);

        r.swapchain.recreate(800, 600).unwrap();
        assert!(r.swapchain.cache().is_empty());
        r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        assert_eq!(r.swapchain.cache().len(), 1);
    }

    #[test]
    fn slots_alternate_pools_and_fences() {
        let mut r = rig();
        r.dev.clear_calls();
        for _ in 0..4 {
            r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        }
        let fences: Vec<_> = submits(&r.dev)
            .into_iter()
            .map(|(_, _, _, f)| f)
            .filter(|f| *f != vk::Fence::null())
            .collect();
        assert_eq!(fences.len(), 4);
        assert_eq!(fences[0], fences[2]);
        assert_eq!(fences[1], fences[3]);
        assert_ne!(fences[0], fences[1]);

        let resets: Vec<_> = r
            .dev
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ResetCommandPool(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(resets.len(), 4);
        assert_eq!(resets[0], resets[2]);
        assert_ne!(resets[0], resets[1]);
    }

    #[test]
    fn next_frame_staging_waits_on_its_slot() {
        let mut r = rig();
        r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        r.dev.clear_calls();
        let dst = vk::Buffer::from_raw(0xfeed);
        r.orch
            .staging_for_next_frame(&r.swapchain)
            .unwrap()
            .copy_bytes(dst, &[9; 8])
            .unwrap();
        assert!(matches!(r.dev.calls()[0], Call::WaitForFence { .. }));

        r.dev.clear_calls();
        r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        let (_, update_cmds, _, _) = submits(&r.dev).remove(0);
        let commit = *update_cmds.last().unwrap();
        assert!(r
            .dev
            .commands(commit)
            .iter()
            .any(|rec| matches!(rec, Recorded::CopyBuffer { dst: d, .. } if *d == dst)));
    }

    fn acquire_semaphore(dev: &RecordingDevice) -> vk::Semaphore {
        dev.calls()
            .into_iter()
            .find_map(|c| match c {
                Call::AcquireNextImage { semaphore, .. } => Some(semaphore),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn failed_update_releases_its_slot() {
        let mut r = rig();
        r.orch.push_system(Box::new(ClearSystem));
        r.orch.push_system(Box::new(Flaky {
            in_render: false,
            failed: false,
        }));
        r.dev.clear_calls();
        assert!(r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).is_err());

        // nothing reached the queue but the release submission
        let subs = submits(&r.dev);
        assert_eq!(subs.len(), 1);
        let (waits, cmds, signals, fence) = &subs[0];
        assert!(cmds.is_empty());
        assert!(signals.is_empty());
        assert_eq!(
            *waits,
            vec![(acquire_semaphore(&r.dev), vk::PipelineStageFlags::ALL_COMMANDS)]
        );
        assert!(r.dev.is_fence_signaled(*fence));
        assert_eq!(r.dev.signaled_semaphores(), 0);

        // the failed slot comes around again without a fence timeout
        for _ in 0..3 {
            r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        }
        assert_eq!(r.orch.frames_drawn(), 3);
        assert_eq!(r.dev.signaled_semaphores(), 0);
    }

    #[test]
    fn failed_render_also_waits_on_update() {
        let mut r = rig();
        r.orch.push_system(Box::new(Flaky {
            in_render: true,
            failed: false,
        }));
        r.dev.clear_calls();
        assert!(r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).is_err());

        let subs = submits(&r.dev);
        assert_eq!(subs.len(), 2);
        let update_done = subs[0].2[0];
        let (waits, cmds, _, fence) = &subs[1];
        assert!(cmds.is_empty());
        assert!(waits.iter().any(|(s, _)| *s == update_done));
        assert!(waits.iter().any(|(s, _)| *s == acquire_semaphore(&r.dev)));
        assert!(r.dev.is_fence_signaled(*fence));
        assert_eq!(r.dev.signaled_semaphores(), 0);

        for _ in 0..2 {
            r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        }
    }

    #[test]
    fn every_slot_fence_is_signaled_after_a_frame() {
        let mut r = rig();
        for _ in 0..2 {
            let before = submits(&r.dev).len();
            r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
            let (_, _, _, fence) = submits(&r.dev).remove(before + 1);
            assert!(r.dev.is_fence_signaled(fence));
        }
        assert_eq!(r.dev.signaled_semaphores(), 0);
    }

    #[test]
    fn render_target_follows_swapchain_format() {
        let dev = Arc::new(RecordingDevice::new());
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let mut support = default_surface_support();
        support.formats.push(unorm);
        dev.set_surface_support(support);
        let settings = SwapchainSettings {
            surface_format: unorm,
            ..SwapchainSettings::default()
        };
        let mut swapchain = Swapchain::new(&dev, settings, 640, 480).unwrap();
        let mut orch = FrameOrchestrator::new(&dev, 256, u64::MAX).unwrap();
        orch.push_system(Box::new(ClearSystem));
        orch.push_system(Box::new(PresentSystem));
        dev.clear_calls();

        orch.draw_frame(&mut swapchain, &Scene::new([0.0; 4]), 0.0).unwrap();
        let color_format = dev
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::CreateImage { format, .. } => Some(format),
                _ => None,
            })
            .unwrap();
        assert_eq!(color_format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn forgotten_uploads_are_not_committed() {
        let mut r = rig();
        let dst = vk::Buffer::from_raw(0xdead);
        r.orch
            .staging_for_next_frame(&r.swapchain)
            .unwrap()
            .copy_bytes(dst, &[1; 16])
            .unwrap();
        r.orch.forget_uploads(dst);
        r.dev.clear_calls();
        r.orch.draw_frame(&mut r.swapchain, &r.scene, 0.0).unwrap();
        let (_, update_cmds, _, _) = submits(&r.dev).remove(0);
        let commit = *update_cmds.last().unwrap();
        assert!(!r
            .dev
            .commands(commit)
            .iter()
            .any(|rec| matches!(rec, Recorded::CopyBuffer { .. })));
    }

    #[test]
    fn out_of_date_acquire_propagates_without_submitting() {
        let mut r = rig();
        r.dev.script_acquire(AcquireOutcome::OutOfDate);
        r.dev.clear_calls();
        let err = r
            .orch
            .draw_frame(&mut r.swapchain, &r.scene, 0.0)
            .unwrap_err();
        assert!(err.is_out_of_date());
        assert!(submits(&r.dev).is_empty());
        assert_eq!(r.swapchain.frame_offset(), 0);
    }
}
