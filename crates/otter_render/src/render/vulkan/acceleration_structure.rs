//! Acceleration structure builder
//!
//! One bottom-level structure per render command plus a single top-level
//! structure instancing all of them. Bottom-level builds are batched so one
//! scratch buffer can serve many builds at once.
//!
//! ## Index contract
//!
//! Bottom-level entry `i` belongs to the render command at index `i` of the
//! slice passed to [`AccelerationStructure::build`]. Indices are valid only
//! between a `build` and the next [`AccelerationStructure::clear`].

use ash::extensions::khr::AccelerationStructure as AccelerationStructureLoader;
use ash::{vk, Device};
use std::mem::size_of;
use std::ops::Range;

use crate::core::config::AccelerationStructureConfig;
use crate::render::mesh::MeshVertex;
use crate::render::render_queue::RenderCommand;
use crate::render::vulkan::buffer::GpuBuffer;
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::pipeline::shader_binding_table::align_up;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Sizes reported for one build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSize {
    /// Bytes of storage for the structure itself
    pub acceleration_structure_size: u64,
    /// Bytes of scratch memory needed while building
    pub build_scratch_size: u64,
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR> for BuildSize {
    fn from(info: vk::AccelerationStructureBuildSizesInfoKHR) -> Self {
        Self {
            acceleration_structure_size: info.acceleration_structure_size,
            build_scratch_size: info.build_scratch_size,
        }
    }
}

/// Split builds into contiguous batches
///
/// A batch grows while its total structure size stays within
/// `batch_size_limit` and its scratch usage (each item rounded up to
/// `scratch_alignment`) stays within `scratch_capacity`. An item that exceeds
/// either bound on its own gets a batch to itself.
pub fn plan_batches(
    sizes: &[BuildSize],
    batch_size_limit: u64,
    scratch_capacity: u64,
    scratch_alignment: u64,
) -> Vec<Range<usize>> {
    let alignment = scratch_alignment.max(1);
    let mut batches = Vec::new();
    let mut start = 0;
    let mut bytes = 0u64;
    let mut scratch = 0u64;

    for (index, size) in sizes.iter().enumerate() {
        let item_scratch = align_up(size.build_scratch_size, alignment);
        let fits = bytes + size.acceleration_structure_size <= batch_size_limit
            && scratch + item_scratch <= scratch_capacity;

        if !fits && index > start {
            batches.push(start..index);
            start = index;
            bytes = 0;
            scratch = 0;
        }
        bytes += size.acceleration_structure_size;
        scratch += item_scratch;
    }

    if start < sizes.len() {
        batches.push(start..sizes.len());
    }
    batches
}

/// Row-major 3x4 instance transform from a 4x4 model matrix
pub fn instance_transform(transform: &crate::foundation::math::Mat4) -> vk::TransformMatrixKHR {
    let mut matrix = [0.0; 12];
    for row in 0..3 {
        for col in 0..4 {
            matrix[row * 4 + col] = transform[(row, col)];
        }
    }
    vk::TransformMatrixKHR { matrix }
}

/// One acceleration structure and its backing storage
///
/// The handle is destroyed before the buffer is freed.
struct Entry {
    loader: AccelerationStructureLoader,
    handle: vk::AccelerationStructureKHR,
    _buffer: GpuBuffer,
    size: u64,
}

impl Entry {
    fn new(ctx: &VulkanContext, ty: vk::AccelerationStructureTypeKHR, size: u64) -> VulkanResult<Self> {
        let buffer = GpuBuffer::new(
            ctx,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .ty(ty)
            .size(size)
            .buffer(buffer.handle());

        let loader = ctx.acceleration_structure_loader().clone();
        let handle = unsafe {
            loader.create_acceleration_structure(&create_info, None).map_err(|e| {
                log::error!("Failed to create acceleration structure: {:?}", e);
                VulkanError::Api(e)
            })?
        };

        Ok(Self {
            loader,
            handle,
            _buffer: buffer,
            size,
        })
    }

    fn device_address(&self) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(self.handle);
        unsafe { self.loader.get_acceleration_structure_device_address(&info) }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_acceleration_structure(self.handle, None) };
    }
}

struct TopLevel {
    entry: Entry,
    _instances: GpuBuffer,
}

/// Compacted-size query pool; results are only logged
struct QueryPool {
    device: Device,
    pool: vk::QueryPool,
    count: u32,
}

impl QueryPool {
    fn new(device: &Device, count: u32) -> VulkanResult<Self> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);
        let pool = unsafe { device.create_query_pool(&create_info, None).map_err(VulkanError::Api)? };
        Ok(Self {
            device: device.clone(),
            pool,
            count,
        })
    }

    fn compacted_sizes(&self) -> VulkanResult<Vec<u64>> {
        let mut sizes = vec![0u64; self.count as usize];
        unsafe {
            self.device
                .get_query_pool_results(
                    self.pool,
                    0,
                    self.count,
                    &mut sizes,
                    vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                )
                .map_err(VulkanError::Api)?;
        }
        Ok(sizes)
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_query_pool(self.pool, None) };
    }
}

/// Scratch memory whose start address honours the scratch offset alignment
struct Scratch {
    _buffer: GpuBuffer,
    base_address: vk::DeviceAddress,
    capacity: u64,
}

impl Scratch {
    fn new(ctx: &VulkanContext, capacity: u64, alignment: u64) -> VulkanResult<Self> {
        let buffer = GpuBuffer::new(
            ctx,
            capacity + alignment,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let base_address = align_up(buffer.device_address()?, alignment);
        Ok(Self {
            _buffer: buffer,
            base_address,
            capacity,
        })
    }
}

/// Scene acceleration structures used by the shadow rays
pub struct AccelerationStructure {
    config: AccelerationStructureConfig,
    bottom_level: Vec<Entry>,
    top_level: Option<TopLevel>,
}

impl AccelerationStructure {
    /// Empty structure; nothing is allocated until [`Self::build`]
    pub fn new(config: AccelerationStructureConfig) -> Self {
        Self {
            config,
            bottom_level: Vec::new(),
            top_level: None,
        }
    }

    /// Build bottom-level structures for `commands` and the top level over them
    ///
    /// Blocks until every build has finished on the graphics queue. On error,
    /// structures built so far stay allocated until [`Self::clear`].
    pub fn build(&mut self, ctx: &VulkanContext, pool: &CommandPool, commands: &[RenderCommand]) -> VulkanResult<()> {
        if commands.is_empty() {
            return Err(VulkanError::invalid("Cannot build an acceleration structure without geometry"));
        }
        if self.is_built() || !self.bottom_level.is_empty() {
            return Err(VulkanError::invalid("Acceleration structure must be cleared before rebuilding"));
        }

        self.build_bottom_level(ctx, pool, commands)?;
        self.build_top_level(ctx, pool, commands)?;

        log::info!(
            "Built acceleration structure: {} bottom-level, {} bytes",
            self.bottom_level.len(),
            self.bottom_level.iter().map(|e| e.size).sum::<u64>()
        );
        Ok(())
    }

    fn build_bottom_level(
        &mut self,
        ctx: &VulkanContext,
        pool: &CommandPool,
        commands: &[RenderCommand],
    ) -> VulkanResult<()> {
        let loader = ctx.acceleration_structure_loader();

        let geometries: Vec<vk::AccelerationStructureGeometryKHR> = commands
            .iter()
            .map(|command| {
                let mesh = &command.mesh;
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: mesh.vertex_address,
                    })
                    .vertex_stride(size_of::<MeshVertex>() as u64)
                    .max_vertex(mesh.vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT16)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: mesh.index_address,
                    })
                    .build();
                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .build()
            })
            .collect();

        let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = commands
            .iter()
            .map(|command| vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: command.mesh.triangle_count(),
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            })
            .collect();

        let mut infos: Vec<vk::AccelerationStructureBuildGeometryInfoKHR> = geometries
            .iter()
            .map(|geometry| {
                vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(
                        vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                            | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION,
                    )
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .geometries(std::slice::from_ref(geometry))
                    .build()
            })
            .collect();

        let sizes: Vec<BuildSize> = infos
            .iter()
            .zip(&ranges)
            .map(|(info, range)| {
                let sizes = unsafe {
                    loader.get_acceleration_structure_build_sizes(
                        vk::AccelerationStructureBuildTypeKHR::DEVICE,
                        info,
                        &[range.primitive_count],
                    )
                };
                BuildSize::from(sizes)
            })
            .collect();

        let alignment = u64::from(ctx.physical_device().ray_tracing.min_scratch_offset_alignment).max(1);
        let max_scratch = sizes.iter().map(|s| align_up(s.build_scratch_size, alignment)).max().unwrap_or(0);
        let total_size: u64 = sizes.iter().map(|s| s.acceleration_structure_size).sum();
        let scratch = Scratch::new(ctx, max_scratch * self.config.scratch_multiplier, alignment)?;
        let query_pool = QueryPool::new(ctx.device(), commands.len() as u32)?;

        let batches = plan_batches(&sizes, self.config.batch_size_limit, scratch.capacity, alignment);
        log::debug!(
            "Building {} bottom-level structures ({} bytes) in {} batches, scratch {} bytes",
            commands.len(),
            total_size,
            batches.len(),
            scratch.capacity
        );

        for batch in batches {
            let mut scratch_offset = 0;
            for index in batch.clone() {
                let entry = Entry::new(
                    ctx,
                    vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    sizes[index].acceleration_structure_size,
                )?;
                infos[index].dst_acceleration_structure = entry.handle;
                infos[index].scratch_data = vk::DeviceOrHostAddressKHR {
                    device_address: scratch.base_address + scratch_offset,
                };
                scratch_offset += align_up(sizes[index].build_scratch_size, alignment);
                self.bottom_level.push(entry);
            }

            let handles: Vec<vk::AccelerationStructureKHR> =
                self.bottom_level[batch.clone()].iter().map(|e| e.handle).collect();
            let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
                ranges[batch.clone()].iter().map(std::slice::from_ref).collect();
            let first_query = batch.start as u32;

            pool.submit_once(ctx.graphics_queue(), |device, cmd| {
                unsafe {
                    device.cmd_reset_query_pool(cmd, query_pool.pool, first_query, handles.len() as u32);
                    loader.cmd_build_acceleration_structures(cmd, &infos[batch.clone()], &range_refs);
                }
                build_barrier(device, cmd);
                unsafe {
                    loader.cmd_write_acceleration_structures_properties(
                        cmd,
                        &handles,
                        vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                        query_pool.pool,
                        first_query,
                    );
                }
                Ok(())
            })?;
        }

        let compacted: u64 = query_pool.compacted_sizes()?.iter().sum();
        log::debug!("Bottom-level compacted size would be {} of {} bytes", compacted, total_size);
        Ok(())
    }

    fn build_top_level(&mut self, ctx: &VulkanContext, pool: &CommandPool, commands: &[RenderCommand]) -> VulkanResult<()> {
        let loader = ctx.acceleration_structure_loader();

        let instances: Vec<vk::AccelerationStructureInstanceKHR> = self
            .bottom_level
            .iter()
            .zip(commands)
            .map(|(entry, command)| vk::AccelerationStructureInstanceKHR {
                transform: instance_transform(&command.transform),
                instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xFF),
                instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                    0,
                    vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
                ),
                acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                    device_handle: entry.device_address(),
                },
            })
            .collect();

        // The instance struct is plain data without padding
        let instance_bytes = unsafe {
            std::slice::from_raw_parts(
                instances.as_ptr().cast::<u8>(),
                instances.len() * size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        let instance_buffer = GpuBuffer::device_local_with_data(
            ctx,
            pool,
            instance_bytes,
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address()?,
            })
            .build();
        let geometry = vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: instances_data,
            })
            .build();
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instances.len() as u32,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(std::slice::from_ref(&geometry))
            .build();

        let sizes = BuildSize::from(unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &[range.primitive_count],
            )
        });

        let alignment = u64::from(ctx.physical_device().ray_tracing.min_scratch_offset_alignment).max(1);
        let scratch = Scratch::new(ctx, sizes.build_scratch_size.max(1), alignment)?;
        let entry = Entry::new(
            ctx,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.acceleration_structure_size,
        )?;

        info.dst_acceleration_structure = entry.handle;
        info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: scratch.base_address,
        };

        pool.submit_once(ctx.graphics_queue(), |device, cmd| {
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                loader.cmd_build_acceleration_structures(cmd, &[info], &[std::slice::from_ref(&range)]);
            }
            build_barrier(device, cmd);
            Ok(())
        })?;

        self.top_level = Some(TopLevel {
            entry,
            _instances: instance_buffer,
        });
        Ok(())
    }

    /// Destroy every structure and its storage
    pub fn clear(&mut self) {
        self.top_level = None;
        self.bottom_level.clear();
    }

    /// Whether the top level exists
    pub fn is_built(&self) -> bool {
        self.top_level.is_some()
    }

    /// Number of bottom-level structures
    pub fn len(&self) -> usize {
        self.bottom_level.len()
    }

    /// Whether no bottom-level structures exist
    pub fn is_empty(&self) -> bool {
        self.bottom_level.is_empty()
    }

    /// Top-level handle for descriptor writes
    pub fn top_level_handle(&self) -> Option<vk::AccelerationStructureKHR> {
        self.top_level.as_ref().map(|top| top.entry.handle)
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Make finished builds visible to later reads
fn build_barrier(device: &Device, cmd: vk::CommandBuffer) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Transform, Vec3};

    fn size(bytes: u64, scratch: u64) -> BuildSize {
        BuildSize {
            acceleration_structure_size: bytes,
            build_scratch_size: scratch,
        }
    }

    #[test]
    fn test_everything_fits_in_one_batch() {
        let sizes = vec![size(100, 10); 5];
        assert_eq!(plan_batches(&sizes, 1000, 1000, 1), vec![0..5]);
    }

    #[test]
    fn test_byte_limit_splits_batches() {
        let sizes = vec![size(100, 1); 5];
        assert_eq!(plan_batches(&sizes, 250, 1000, 1), vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn test_scratch_capacity_bounds_each_batch() {
        // Scratch rounds up to 256 per item, capacity holds three
        let sizes = vec![size(1, 100); 7];
        let batches = plan_batches(&sizes, u64::MAX, 768, 256);
        assert_eq!(batches, vec![0..3, 3..6, 6..7]);
        for batch in batches {
            let used: u64 = sizes[batch].iter().map(|s| align_up(s.build_scratch_size, 256)).sum();
            assert!(used <= 768);
        }
    }

    #[test]
    fn test_oversized_item_gets_its_own_batch() {
        let sizes = [size(10, 1), size(5000, 1), size(10, 1)];
        assert_eq!(plan_batches(&sizes, 100, 100, 1), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn test_batches_cover_every_item_once() {
        let sizes: Vec<BuildSize> = (1..=20).map(|i| size(i * 37, i * 11)).collect();
        let batches = plan_batches(&sizes, 300, 400, 8);
        let mut next = 0;
        for batch in &batches {
            assert_eq!(batch.start, next);
            assert!(batch.end > batch.start);
            next = batch.end;
        }
        assert_eq!(next, sizes.len());
        assert!(plan_batches(&[], 10, 10, 1).is_empty());
    }

    #[test]
    fn test_instance_transform_is_row_major() {
        let transform = Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).to_matrix();
        let instance = instance_transform(&transform);
        assert_eq!(
            instance.matrix,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }
}
