// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::sync::Arc;
use tracing::debug;

use crate::device::Device;
use crate::error::{GpuError, GpuResult};

pub const INITIAL_BUFFER_COUNT: usize = 2;

/// Growable set of primary command buffers with a write cursor.
///
/// Buffers are handed out through a [`Scope`]. A scope mutably borrows its
/// pool, so two scopes can never be open on the same pool at once.
pub struct CommandPool<D: Device> {
    device: Arc<D>,
    raw: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    cursor: usize,
}

impl<D: Device> CommandPool<D> {
    pub fn new(device: &Arc<D>, queue_family: u32) -> GpuResult<Self> {
        let raw = device.create_command_pool(queue_family)?;
        let buffers = match device.allocate_command_buffers(raw, INITIAL_BUFFER_COUNT as u32) {
            Ok(b) => b,
            Err(e) => {
                device.destroy_command_pool(raw);
                return Err(e);
            }
        };
        Ok(CommandPool {
            device: device.clone(),
            raw,
            buffers,
            cursor: 0,
        })
    }

    /// Resets every buffer in the pool and rewinds the cursor.
    pub fn reset(&mut self) -> GpuResult<()> {
        self.device.reset_command_pool(self.raw)?;
        self.cursor = 0;
        Ok(())
    }

    pub fn begin_scope(&mut self) -> Scope<'_, D> {
        Scope {
            start: self.cursor,
            local: 0,
            pool: self,
        }
    }

    pub fn raw(&self) -> vk::CommandPool {
        self.raw
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn buffers(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    fn next_buffer(&mut self) -> GpuResult<vk::CommandBuffer> {
        if self.cursor == self.buffers.len() {
            let extra = self.buffers.len().max(1);
            let more = self.device.allocate_command_buffers(self.raw, extra as u32)?;
            self.buffers.extend(more);
            debug!(capacity = self.buffers.len(), "command pool grown");
        }
        let cmd = self.buffers[self.cursor];
        self.cursor += 1;
        Ok(cmd)
    }
}

impl<D: Device> Drop for CommandPool<D> {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.raw);
    }
}

/// Contiguous run of buffers issued from a pool during one submit cycle.
pub struct Scope<'p, D: Device> {
    pool: &'p mut CommandPool<D>,
    start: usize,
    local: usize,
}

impl<D: Device> Scope<'_, D> {
    /// Next buffer from the pool, growing it if exhausted.
    pub fn next_buffer(&mut self) -> GpuResult<vk::CommandBuffer> {
        let cmd = self.pool.next_buffer()?;
        self.local += 1;
        Ok(cmd)
    }

    /// Resets only the buffers this scope issued and rewinds it to empty.
    pub fn reset(&mut self) -> GpuResult<()> {
        for &cmd in &self.pool.buffers[self.start..self.start + self.local] {
            self.pool.device.reset_command_buffer(cmd)?;
        }
        self.pool.cursor = self.start;
        self.local = 0;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.local
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn buffers(&self) -> &[vk::CommandBuffer] {
        &self.pool.buffers[self.start..self.start + self.local]
    }

    pub fn get(&self, index: usize) -> GpuResult<vk::CommandBuffer> {
        self.buffers()
            .get(index)
            .copied()
            .ok_or(GpuError::ScopeIndexOutOfRange {
                index,
                issued: self.local,
            })
    }
}
