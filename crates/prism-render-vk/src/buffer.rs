// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

use crate::device::{BufferDesc, Device, MemoryLocation};
use crate::error::{GpuError, GpuResult};

/// An owned GPU buffer and its allocation, typed by element.
///
/// Either fully valid or empty: a failed [`Buffer::create`] leaves nothing
/// behind, and [`Buffer::destroy`] releases the allocation at most once.
pub struct Buffer<T, D: Device> {
    device: Arc<D>,
    raw: vk::Buffer,
    memory: Option<D::Memory>,
    size: vk::DeviceSize,
    _elem: PhantomData<T>,
}

impl<T, D: Device> Buffer<T, D> {
    pub fn create(
        device: &Arc<D>,
        name: &'static str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> GpuResult<Self> {
        let (raw, memory) = device.create_buffer(&BufferDesc {
            name,
            size,
            usage,
            location,
        })?;
        Ok(Buffer {
            device: device.clone(),
            raw,
            memory: Some(memory),
            size,
            _elem: PhantomData,
        })
    }

    pub fn destroy(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.device.destroy_buffer(self.raw, memory);
            self.raw = vk::Buffer::null();
            self.size = 0;
        }
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn element_count(&self) -> u64 {
        match size_of::<T>() as u64 {
            0 => 0,
            elem => self.size / elem,
        }
    }

    pub fn is_null(&self) -> bool {
        self.memory.is_none()
    }

    /// Host bytes of a mapped allocation.
    pub fn mapped(&mut self) -> GpuResult<&mut [u8]> {
        let memory = self.memory.as_mut().ok_or(GpuError::NotMapped)?;
        self.device.mapped(memory)
    }
}

impl<T, D: Device> Drop for Buffer<T, D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, RecordingDevice};

    #[test]
    fn typed_buffer_counts_elements() {
        let dev = Arc::new(RecordingDevice::new());
        let buf: Buffer<[f32; 4], _> = Buffer::create(
            &dev,
            "test",
            64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::GpuOnly,
        )
        .unwrap();
        assert_eq!(buf.size(), 64);
        assert_eq!(buf.element_count(), 4);
    }

    #[test]
    fn destroy_runs_once() {
        let dev = Arc::new(RecordingDevice::new());
        let mut buf: Buffer<u8, _> = Buffer::create(
            &dev,
            "test",
            16,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();
        buf.destroy();
        buf.destroy();
        assert!(buf.is_null());
        drop(buf);
        assert_eq!(dev.count_calls(|c| matches!(c, Call::DestroyBuffer(_))), 1);
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn failed_create_leaves_nothing() {
        let dev = Arc::new(RecordingDevice::new());
        dev.fail_allocations(true);
        let res: GpuResult<Buffer<u8, _>> = Buffer::create(
            &dev,
            "test",
            16,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        );
        assert!(matches!(res, Err(GpuError::Allocation(_))));
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn device_local_memory_is_not_mapped() {
        let dev = Arc::new(RecordingDevice::new());
        let mut buf: Buffer<u8, _> = Buffer::create(
            &dev,
            "test",
            16,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryLocation::GpuOnly,
        )
        .unwrap();
        assert!(matches!(buf.mapped(), Err(GpuError::NotMapped)));
    }
}
