//! Descriptor set layouts, pools and writes
//!
//! Layouts are built once per pipeline. Pools are owned per frame (and per
//! worker thread) and reset wholesale instead of freeing individual sets.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Descriptor set layout builder for creating reusable layouts
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-descriptor binding of any type
    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    /// Add a combined image sampler binding
    pub fn add_combined_image_sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags)
    }

    /// Add a subpass input attachment binding (fragment stage)
    pub fn add_input_attachment(self, binding: u32) -> Self {
        self.add_binding(binding, vk::DescriptorType::INPUT_ATTACHMENT, vk::ShaderStageFlags::FRAGMENT)
    }

    /// Add a storage image binding
    pub fn add_storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags)
    }

    /// Add a top-level acceleration structure binding
    pub fn add_acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, stage_flags)
    }

    /// Bindings added so far
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> VulkanResult<DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);

        let layout =
            unsafe { device.create_descriptor_set_layout(&layout_info, None) }.map_err(VulkanError::Api)?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

// The builder never sets `p_immutable_samplers`, so the stored bindings hold no live pointers.
unsafe impl Send for DescriptorSetLayout {}
unsafe impl Sync for DescriptorSetLayout {}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool for allocating descriptor sets
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create a pool holding at most `max_sets` sets drawn from `pool_sizes`
    pub fn new(device: Device, max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> VulkanResult<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(VulkanError::Api)?;

        Ok(Self { pool, device })
    }

    /// Allocate one set per layout
    pub fn allocate_descriptor_sets(&self, layouts: &[vk::DescriptorSetLayout]) -> VulkanResult<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(VulkanError::Api)
    }

    /// Allocate a single set
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> VulkanResult<vk::DescriptorSet> {
        self.allocate_descriptor_sets(&[layout])?
            .pop()
            .ok_or_else(|| VulkanError::invalid("Descriptor pool returned no sets"))
    }

    /// Reset the descriptor pool (frees all allocated sets)
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe { self.device.reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty()) }
            .map_err(VulkanError::Api)
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum Resource {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

struct Entry {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    resource: Resource,
}

/// Collects writes to one descriptor set and applies them in a single update
pub struct DescriptorWriter {
    set: vk::DescriptorSet,
    entries: Vec<Entry>,
}

impl DescriptorWriter {
    /// Start writing `set`
    pub fn new(set: vk::DescriptorSet) -> Self {
        Self {
            set,
            entries: Vec::new(),
        }
    }

    /// Bind a whole buffer as a uniform buffer
    pub fn uniform_buffer(mut self, binding: u32, info: vk::DescriptorBufferInfo) -> Self {
        self.entries.push(Entry {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            resource: Resource::Buffer(info),
        });
        self
    }

    /// Bind an image of the given descriptor type
    pub fn image(mut self, binding: u32, descriptor_type: vk::DescriptorType, info: vk::DescriptorImageInfo) -> Self {
        self.entries.push(Entry {
            binding,
            descriptor_type,
            resource: Resource::Image(info),
        });
        self
    }

    /// Bind a subpass input attachment
    pub fn input_attachment(self, binding: u32, view: vk::ImageView) -> Self {
        self.image(
            binding,
            vk::DescriptorType::INPUT_ATTACHMENT,
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        )
    }

    /// Bind a storage image in `GENERAL` layout
    pub fn storage_image(self, binding: u32, view: vk::ImageView) -> Self {
        self.image(
            binding,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::GENERAL,
            },
        )
    }

    /// Bind a top-level acceleration structure
    pub fn acceleration_structure(mut self, binding: u32, handle: vk::AccelerationStructureKHR) -> Self {
        self.entries.push(Entry {
            binding,
            descriptor_type: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            resource: Resource::AccelerationStructure(handle),
        });
        self
    }

    /// Number of pending writes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no writes are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every write with one `vkUpdateDescriptorSets`
    pub fn update(self, device: &Device) {
        // The info arrays must not move once writes point into them
        let handles: Vec<[vk::AccelerationStructureKHR; 1]> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.resource {
                Resource::AccelerationStructure(handle) => Some([handle]),
                _ => None,
            })
            .collect();
        let as_infos: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = handles
            .iter()
            .map(|handle| {
                vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                    .acceleration_structures(handle)
                    .build()
            })
            .collect();

        let mut as_index = 0;
        let writes: Vec<vk::WriteDescriptorSet> = self
            .entries
            .iter()
            .map(|entry| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.set)
                    .dst_binding(entry.binding)
                    .dst_array_element(0)
                    .descriptor_type(entry.descriptor_type);
                match &entry.resource {
                    Resource::Buffer(info) => write.buffer_info(std::slice::from_ref(info)).build(),
                    Resource::Image(info) => write.image_info(std::slice::from_ref(info)).build(),
                    Resource::AccelerationStructure(_) => {
                        let mut write = write.build();
                        write.descriptor_count = 1;
                        write.p_next = std::ptr::addr_of!(as_infos[as_index]).cast();
                        as_index += 1;
                        write
                    }
                }
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_builder_collects_bindings() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_input_attachment(0)
            .add_combined_image_sampler(4, vk::ShaderStageFlags::FRAGMENT)
            .add_uniform_buffer(5, vk::ShaderStageFlags::FRAGMENT)
            .add_acceleration_structure(6, vk::ShaderStageFlags::RAYGEN_KHR);

        let bindings = builder.bindings();
        assert_eq!(bindings.len(), 4);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::INPUT_ATTACHMENT);
        assert_eq!(bindings[0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(bindings[1].binding, 4);
        assert_eq!(bindings[3].descriptor_type, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        assert!(bindings.iter().all(|b| b.descriptor_count == 1));
    }

    #[test]
    fn test_writer_records_entries_in_order() {
        let writer = DescriptorWriter::new(vk::DescriptorSet::null())
            .input_attachment(0, vk::ImageView::null())
            .storage_image(1, vk::ImageView::null())
            .acceleration_structure(2, vk::AccelerationStructureKHR::null());
        assert_eq!(writer.len(), 3);
        assert_eq!(writer.entries[1].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert!(matches!(writer.entries[2].resource, Resource::AccelerationStructure(_)));
    }
}
