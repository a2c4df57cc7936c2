//! Shader binding table
//!
//! One raygen, one miss and one hit record. Region sizes and strides follow
//! the device's handle and base alignments.

use ash::vk;

use crate::render::vulkan::buffer::GpuBuffer;
use crate::render::vulkan::pipeline::ray_tracing::GROUP_COUNT;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Round `value` up to a power-of-two `alignment`
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Offset, stride and size of one SBT region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegion {
    /// Byte offset from the table start
    pub offset: u64,
    /// Distance between records
    pub stride: u64,
    /// Region size
    pub size: u64,
}

/// Byte layout of the table, independent of any device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Raw handle size reported by the device
    pub handle_size: u64,
    /// Handle size rounded to the handle alignment
    pub aligned_handle_size: u64,
    /// Required alignment of each region start
    pub base_alignment: u64,
    /// Raygen region; stride equals size
    pub raygen: SbtRegion,
    /// Miss region
    pub miss: SbtRegion,
    /// Hit region
    pub hit: SbtRegion,
}

impl SbtLayout {
    /// Compute the layout for one record per region
    pub fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> Self {
        let handle_size = u64::from(handle_size);
        let base_alignment = u64::from(base_alignment.max(1));
        let aligned_handle_size = align_up(handle_size, u64::from(handle_alignment.max(1)));

        let raygen_size = align_up(aligned_handle_size, base_alignment);
        let raygen = SbtRegion {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
        };
        let miss = SbtRegion {
            offset: raygen.size,
            stride: aligned_handle_size,
            size: align_up(aligned_handle_size, base_alignment),
        };
        let hit = SbtRegion {
            offset: miss.offset + miss.size,
            stride: aligned_handle_size,
            size: align_up(aligned_handle_size, base_alignment),
        };

        Self {
            handle_size,
            aligned_handle_size,
            base_alignment,
            raygen,
            miss,
            hit,
        }
    }

    /// Total table size
    pub fn total_size(&self) -> u64 {
        self.hit.offset + self.hit.size
    }

    /// Lay out `handles` (one per group, tightly packed) into table bytes
    pub fn fill(&self, handles: &[u8]) -> Option<Vec<u8>> {
        let handle_size = usize::try_from(self.handle_size).ok()?;
        if handles.len() != handle_size * GROUP_COUNT as usize {
            return None;
        }

        let mut table = vec![0u8; usize::try_from(self.total_size()).ok()?];
        for (region, handle) in [self.raygen, self.miss, self.hit]
            .iter()
            .zip(handles.chunks_exact(handle_size))
        {
            let start = usize::try_from(region.offset).ok()?;
            table[start..start + handle_size].copy_from_slice(handle);
        }
        Some(table)
    }
}

/// Host-visible table plus the device-address regions for `vkCmdTraceRaysKHR`
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    raygen: vk::StridedDeviceAddressRegionKHR,
    miss: vk::StridedDeviceAddressRegionKHR,
    hit: vk::StridedDeviceAddressRegionKHR,
    callable: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Query the group handles of `pipeline` and write them into a new table
    pub fn new(ctx: &VulkanContext, pipeline: vk::Pipeline) -> VulkanResult<Self> {
        let limits = ctx.physical_device().ray_tracing;
        let layout = SbtLayout::new(
            limits.shader_group_handle_size,
            limits.shader_group_handle_alignment,
            limits.shader_group_base_alignment,
        );

        let handles = unsafe {
            ctx.ray_tracing_loader()
                .get_ray_tracing_shader_group_handles(
                    pipeline,
                    0,
                    GROUP_COUNT,
                    (limits.shader_group_handle_size * GROUP_COUNT) as usize,
                )
                .map_err(VulkanError::Api)?
        };
        let table = layout
            .fill(&handles)
            .ok_or_else(|| VulkanError::invalid("Shader group handle data has unexpected size"))?;

        // Over-allocate so the table start can be moved to the base alignment
        let mut buffer = GpuBuffer::new(
            ctx,
            layout.total_size() + layout.base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let buffer_address = buffer.device_address()?;
        let base_address = align_up(buffer_address, layout.base_alignment);
        buffer.write(&table, base_address - buffer_address)?;

        let region = |r: SbtRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + r.offset,
            stride: r.stride,
            size: r.size,
        };

        log::debug!(
            "Shader binding table: {} bytes, handle {} (aligned {})",
            layout.total_size(),
            layout.handle_size,
            layout.aligned_handle_size
        );

        Ok(Self {
            raygen: region(layout.raygen),
            miss: region(layout.miss),
            hit: region(layout.hit),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
            buffer,
        })
    }

    /// Raygen region
    pub fn raygen(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.raygen
    }

    /// Miss region
    pub fn miss(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.miss
    }

    /// Hit region
    pub fn hit(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.hit
    }

    /// Callable region (always empty)
    pub fn callable(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.callable
    }

    /// Backing buffer
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 32), 96);
    }

    #[test]
    fn test_typical_nvidia_layout() {
        // handle 32, handle alignment 32, base alignment 64
        let layout = SbtLayout::new(32, 32, 64);
        assert_eq!(layout.aligned_handle_size, 32);
        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64 });
        assert_eq!(layout.miss, SbtRegion { offset: 64, stride: 32, size: 64 });
        assert_eq!(layout.hit, SbtRegion { offset: 128, stride: 32, size: 64 });
        assert_eq!(layout.total_size(), 192);
    }

    #[test]
    fn test_regions_start_on_base_alignment() {
        let layout = SbtLayout::new(24, 16, 128);
        assert_eq!(layout.aligned_handle_size, 32);
        for region in [layout.raygen, layout.miss, layout.hit] {
            assert_eq!(region.offset % 128, 0);
            assert!(region.size >= layout.aligned_handle_size);
        }
        assert_eq!(layout.raygen.stride, layout.raygen.size);
    }

    #[test]
    fn test_fill_places_handles_at_region_offsets() {
        let layout = SbtLayout::new(4, 4, 16);
        let handles = [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];
        let table = layout.fill(&handles).unwrap();
        assert_eq!(table.len(), 48);
        assert_eq!(&table[0..4], &[1, 1, 1, 1]);
        assert_eq!(&table[16..20], &[2, 2, 2, 2]);
        assert_eq!(&table[32..36], &[3, 3, 3, 3]);
        assert!(table[4..16].iter().all(|&b| b == 0));
        assert!(layout.fill(&handles[..8]).is_none());
    }
}
