//! Device-local mesh storage
//!
//! Vertex and index buffers are usable both for rasterization and as
//! acceleration-structure build inputs.

use ash::vk;

use crate::render::mesh::{Mesh, MeshRef};
use crate::render::vulkan::buffer::GpuBuffer;
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Extra usage for buffers that feed acceleration-structure builds
pub const GEOMETRY_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw(),
);

/// Mesh uploaded to device-local memory
pub struct GpuMesh {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    vertex_count: u32,
    index_count: u32,
}

impl GpuMesh {
    /// Upload `mesh` through staging buffers
    ///
    /// Blocks until both copies have finished.
    pub fn new(ctx: &VulkanContext, pool: &CommandPool, mesh: &Mesh) -> VulkanResult<Self> {
        if mesh.vertices.is_empty() || mesh.indices.is_empty() {
            return Err(VulkanError::invalid("Cannot upload an empty mesh"));
        }
        if mesh.indices.len() % 3 != 0 {
            return Err(VulkanError::invalid(format!(
                "Index count {} is not a triangle list",
                mesh.indices.len()
            )));
        }

        let vertices = GpuBuffer::device_local_with_data(
            ctx,
            pool,
            bytemuck::cast_slice(&mesh.vertices),
            vk::BufferUsageFlags::VERTEX_BUFFER | GEOMETRY_USAGE,
        )?;
        let indices = GpuBuffer::device_local_with_data(
            ctx,
            pool,
            bytemuck::cast_slice(&mesh.indices),
            vk::BufferUsageFlags::INDEX_BUFFER | GEOMETRY_USAGE,
        )?;

        log::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            mesh.vertex_count(),
            mesh.index_count()
        );

        Ok(Self {
            vertices,
            indices,
            vertex_count: mesh.vertex_count(),
            index_count: mesh.index_count(),
        })
    }

    /// Handle view for render commands
    pub fn mesh_ref(&self) -> VulkanResult<MeshRef> {
        Ok(MeshRef {
            vertex_buffer: self.vertices.handle(),
            index_buffer: self.indices.handle(),
            vertex_address: self.vertices.device_address()?,
            index_address: self.indices.device_address()?,
            vertex_count: self.vertex_count,
            index_count: self.index_count,
        })
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of u16 indices
    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}
