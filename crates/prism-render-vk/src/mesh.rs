// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::size_of;
use std::sync::Arc;
use tracing::debug;

use crate::buffer::Buffer;
use crate::device::{Device, MemoryLocation};
use crate::error::{GpuError, GpuResult};
use crate::staging::StagingBuffer;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Vertex {
            position,
            normal,
            uv,
        }
    }
}

fn element_count(what: &'static str, count: usize) -> GpuResult<u32> {
    u32::try_from(count).map_err(|_| GpuError::TooManyElements { what, count })
}

/// Device-local vertex and index buffers of one imported mesh.
pub struct Mesh<D: Device> {
    vertices: Buffer<Vertex, D>,
    indices: Buffer<u32, D>,
    vertex_count: u32,
    index_count: u32,
}

impl<D: Device> Mesh<D> {
    /// Creates the buffers and stages their contents; the data reaches the
    /// GPU when `staging` is next committed.
    pub fn upload(
        device: &Arc<D>,
        staging: &mut StagingBuffer<D>,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> GpuResult<Self> {
        let vertex_count = element_count("vertex", vertices.len())?;
        let index_count = element_count("index", indices.len())?;
        let vbytes = (vertices.len() * size_of::<Vertex>()) as vk::DeviceSize;
        let ibytes = (indices.len() * size_of::<u32>()) as vk::DeviceSize;

        let vbuf = Buffer::create(
            device,
            "mesh vertices",
            vbytes.max(1),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        let ibuf = Buffer::create(
            device,
            "mesh indices",
            ibytes.max(1),
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )?;
        staging.copy(vbuf.raw(), vertices)?;
        if let Err(e) = staging.copy(ibuf.raw(), indices) {
            // vbuf is dropped on return; its staged copy must not outlive it
            staging.forget(vbuf.raw());
            return Err(e);
        }

        debug!(
            vertices = vertices.len(),
            indices = indices.len(),
            "mesh staged"
        );
        Ok(Mesh {
            vertices: vbuf,
            indices: ibuf,
            vertex_count,
            index_count,
        })
    }

    pub fn vertex_buffer(&self) -> &Buffer<Vertex, D> {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &Buffer<u32, D> {
        &self.indices
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}
