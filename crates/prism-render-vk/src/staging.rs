// SPDX-License-Identifier: CEPL-1.0
//! Upload arena: CPU data is written into a host-visible buffer right away and
//! the GPU-side copies are recorded later, all at once, by [`StagingBuffer::commit`].
//!
//! The arena is not slot aware. Reusing its memory after a commit is only safe
//! once the commands recorded by that commit have finished executing; the
//! frame orchestrator guarantees this by keeping one arena per frame slot.

use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use tracing::debug;

use crate::buffer::Buffer;
use crate::device::{Device, MemoryLocation};
use crate::error::{GpuError, GpuResult};

pub const INITIAL_STAGING_SIZE: vk::DeviceSize = 10_000;

const STAGING_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::TRANSFER_SRC.as_raw() | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCopy {
    pub dst: vk::Buffer,
    pub src_offset: vk::DeviceSize,
    pub dst_offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

pub struct StagingBuffer<D: Device> {
    device: Arc<D>,
    buffer: Buffer<u8, D>,
    utilized: vk::DeviceSize,
    pending: Vec<PendingCopy>,
}

impl<D: Device> StagingBuffer<D> {
    pub fn new(device: &Arc<D>) -> GpuResult<Self> {
        Self::with_capacity(device, INITIAL_STAGING_SIZE)
    }

    pub fn with_capacity(device: &Arc<D>, capacity: vk::DeviceSize) -> GpuResult<Self> {
        let buffer = Buffer::create(
            device,
            "staging",
            capacity.max(1),
            STAGING_USAGE,
            MemoryLocation::CpuToGpu,
        )?;
        Ok(StagingBuffer {
            device: device.clone(),
            buffer,
            utilized: 0,
            pending: Vec::new(),
        })
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    /// Bytes written since the last commit.
    pub fn utilized(&self) -> vk::DeviceSize {
        self.utilized
    }

    pub fn pending(&self) -> &[PendingCopy] {
        &self.pending
    }

    pub fn raw(&self) -> vk::Buffer {
        self.buffer.raw()
    }

    /// Stages `data` for a copy to offset 0 of `dst`. Empty slices are ignored.
    pub fn copy_bytes(&mut self, dst: vk::Buffer, data: &[u8]) -> GpuResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as vk::DeviceSize;
        let needed = self.utilized + size;
        if needed > self.buffer.size() {
            self.grow(needed)?;
        }

        let start = self.utilized as usize;
        let mapped = self.buffer.mapped()?;
        let window = mapped
            .get_mut(start..start + data.len())
            .ok_or_else(|| GpuError::Allocation("staging mapping shorter than buffer".into()))?;
        window.copy_from_slice(data);

        self.pending.push(PendingCopy {
            dst,
            src_offset: self.utilized,
            dst_offset: 0,
            size,
        });
        self.utilized = needed;
        Ok(())
    }

    pub fn copy<T: Pod>(&mut self, dst: vk::Buffer, data: &[T]) -> GpuResult<()> {
        self.copy_bytes(dst, bytemuck::cast_slice(data))
    }

    /// Drops the pending copies aimed at `dst`, which is about to be destroyed
    /// before the next commit. Their bytes stay in the arena until then.
    /// Returns how many copies were dropped.
    pub fn forget(&mut self, dst: vk::Buffer) -> usize {
        let before = self.pending.len();
        self.pending.retain(|copy| copy.dst != dst);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(?dst, dropped, "pending staging copies dropped");
        }
        dropped
    }

    /// Records every pending copy into `cmd` (begin to end) and frees the arena.
    /// With nothing pending the buffer is still begun and ended.
    pub fn commit(&mut self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        self.device.begin_command_buffer(cmd)?;
        let src = self.buffer.raw();
        for copy in self.pending.drain(..) {
            self.device.cmd_copy_buffer(
                cmd,
                src,
                copy.dst,
                vk::BufferCopy {
                    src_offset: copy.src_offset,
                    dst_offset: copy.dst_offset,
                    size: copy.size,
                },
            );
        }
        self.utilized = 0;
        self.device.end_command_buffer(cmd)
    }

    fn grow(&mut self, needed: vk::DeviceSize) -> GpuResult<()> {
        let old_cap = self.buffer.size();
        let new_cap = needed.max(old_cap.saturating_mul(2));
        let mut next = Buffer::create(
            &self.device,
            "staging",
            new_cap,
            STAGING_USAGE,
            MemoryLocation::CpuToGpu,
        )?;
        if self.utilized > 0 {
            let n = self.utilized as usize;
            let old = self.buffer.mapped()?;
            let new = next.mapped()?;
            new[..n].copy_from_slice(&old[..n]);
        }
        debug!(old_cap, new_cap, kept = self.utilized, "staging buffer grown");
        self.buffer = next;
        Ok(())
    }
}
