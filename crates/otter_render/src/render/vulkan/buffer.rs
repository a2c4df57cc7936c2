//! Buffer management for vertex data, uniforms and ray tracing inputs
//!
//! Memory management following RAII patterns: one `vk::DeviceMemory`
//! allocation per buffer, freed together with the buffer on drop.

use ash::{vk, Device};
use bytemuck::Pod;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Find the lowest memory type index allowed by `type_filter` that has all of `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    (0..memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32))
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(VulkanError::NoSuitableMemoryType)
}

/// Whole-buffer copy region, or `None` when the sizes differ
pub fn copy_region(src_size: vk::DeviceSize, dst_size: vk::DeviceSize) -> Option<vk::BufferCopy> {
    (src_size == dst_size).then_some(vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: src_size,
    })
}

/// Allocate and bind memory for `requirements`
pub(crate) fn allocate_memory(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    device_address: bool,
) -> VulkanResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(memory_properties, requirements.memory_type_bits, properties)
        .map_err(|e| {
            log::error!(
                "No memory type for filter {:#b} with {:?}",
                requirements.memory_type_bits,
                properties
            );
            e
        })?;

    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if device_address {
        alloc_info = alloc_info.push_next(&mut flags_info);
    }

    unsafe {
        device.allocate_memory(&alloc_info, None).map_err(|e| {
            log::error!("Failed to allocate {} bytes: {:?}", requirements.size, e);
            VulkanError::Api(e)
        })
    }
}

/// Buffer wrapper with memory management
///
/// The buffer handle and its memory stay valid for the lifetime of the value.
pub struct GpuBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
    mapped: Option<NonNull<c_void>>,
}

// The persistent mapping is only written through `&mut self`.
unsafe impl Send for GpuBuffer {}
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    /// Create a buffer and bind fresh memory to it
    ///
    /// Buffers used with `SHADER_DEVICE_ADDRESS` get memory allocated with
    /// `MemoryAllocateFlags::DEVICE_ADDRESS`.
    pub fn new(
        ctx: &VulkanContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        Self::with_device(
            ctx.device().clone(),
            &ctx.physical_device().memory_properties,
            size,
            usage,
            properties,
        )
    }

    /// Same as [`GpuBuffer::new`] without a full context
    pub fn with_device(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        if size == 0 {
            return Err(VulkanError::invalid("Cannot allocate a zero-sized buffer"));
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(VulkanError::Api)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let device_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let memory = match allocate_memory(&device, memory_properties, requirements, properties, device_address) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            log::error!("Failed to bind buffer memory: {:?}", e);
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        log::debug!("Allocated buffer: {} bytes, usage {:?}", size, usage);

        Ok(Self {
            device,
            buffer,
            memory,
            size,
            usage,
            properties,
            mapped: None,
        })
    }

    /// Create a device-local buffer filled with `data` through a staging copy
    ///
    /// Blocks until the copy has finished on the graphics queue.
    pub fn device_local_with_data(
        ctx: &VulkanContext,
        pool: &CommandPool,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let size = data.len() as vk::DeviceSize;
        let mut staging = Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write(data, 0)?;

        let buffer = Self::new(
            ctx,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        pool.submit_once(ctx.graphics_queue(), |device, cmd| {
            Self::transfer(device, &staging, &buffer, cmd);
            Ok(())
        })?;

        Ok(buffer)
    }

    /// Copy `bytes` into the buffer at `offset`
    ///
    /// Uses the persistent mapping when there is one, otherwise maps the
    /// written range for the duration of the copy.
    pub fn write(&mut self, bytes: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        if !self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::invalid("Buffer memory is not host visible"));
        }
        let len = bytes.len() as vk::DeviceSize;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(VulkanError::invalid(format!(
                "Write of {} bytes at offset {} overflows buffer of {} bytes",
                len, offset, self.size
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        unsafe {
            if let Some(mapped) = self.mapped {
                let dst = mapped.as_ptr().cast::<u8>().add(offset as usize);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            } else {
                let dst = self
                    .device
                    .map_memory(self.memory, offset, len, vk::MemoryMapFlags::empty())
                    .map_err(|e| {
                        log::error!("Failed to map buffer memory: {:?}", e);
                        VulkanError::Api(e)
                    })?;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.cast::<u8>(), bytes.len());
                self.device.unmap_memory(self.memory);
            }
        }
        Ok(())
    }

    /// Write a single plain-old-data value at offset 0
    pub fn write_pod<T: Pod>(&mut self, value: &T) -> VulkanResult<()> {
        self.write(bytemuck::bytes_of(value), 0)
    }

    /// Map the whole buffer until [`unmap`](Self::unmap) or drop
    pub fn map_all(&mut self) -> VulkanResult<()> {
        if self.mapped.is_some() {
            return Ok(());
        }
        let ptr = unsafe {
            self.device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?
        };
        self.mapped = NonNull::new(ptr);
        Ok(())
    }

    /// Release the persistent mapping
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.device.unmap_memory(self.memory) };
        }
    }

    /// Record a whole-buffer copy from `src` to `dst`
    ///
    /// Buffers of different sizes are skipped with a warning and `false` is
    /// returned; nothing is recorded in that case.
    pub fn transfer(device: &Device, src: &Self, dst: &Self, cmd: vk::CommandBuffer) -> bool {
        let Some(region) = copy_region(src.size, dst.size) else {
            log::warn!(
                "Skipping buffer transfer: source is {} bytes, destination is {} bytes",
                src.size,
                dst.size
            );
            return false;
        };

        unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
        true
    }

    /// GPU virtual address of the buffer
    pub fn device_address(&self) -> VulkanResult<vk::DeviceAddress> {
        if !self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            return Err(VulkanError::invalid(
                "Buffer was not created with SHADER_DEVICE_ADDRESS usage",
            ));
        }
        let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
        Ok(unsafe { self.device.get_buffer_device_address(&info) })
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Descriptor info covering the whole buffer
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset: 0,
            range: self.size,
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.unmap();
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, flag) in flags.iter().enumerate() {
            properties.memory_types[i] = vk::MemoryType {
                property_flags: *flag,
                heap_index: 0,
            };
        }
        properties
    }

    #[test]
    fn test_find_memory_type_picks_lowest_matching_index() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        assert_eq!(find_memory_type(&properties, 0b111, host).ok(), Some(1));
        assert_eq!(find_memory_type(&properties, 0b100, host).ok(), Some(2));
        assert_eq!(
            find_memory_type(&properties, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).ok(),
            Some(0)
        );
    }

    #[test]
    fn test_find_memory_type_fails_without_candidates() {
        let properties = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&properties, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, VulkanError::NoSuitableMemoryType));

        // Bits beyond memory_type_count are ignored
        let err = find_memory_type(&properties, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap_err();
        assert!(matches!(err, VulkanError::NoSuitableMemoryType));
    }

    #[test]
    fn test_copy_region_requires_equal_sizes() {
        let region = copy_region(256, 256).unwrap();
        assert_eq!((region.src_offset, region.dst_offset, region.size), (0, 0, 256));
        assert!(copy_region(256, 128).is_none());
    }
}
