//! Shadow ray tracing pipeline
//!
//! Raygen reads G-buffer position and normal, traces toward the light
//! against the scene TLAS and writes visibility into the shadow image.

use ash::{vk, Device};

use super::Pipeline;
use crate::core::config::RendererConfig;
use crate::render::vulkan::descriptor::{DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
use crate::render::vulkan::shader::ShaderModule;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Number of shader groups: raygen, miss, closest hit
pub const GROUP_COUNT: u32 = 3;

/// Maximum ray recursion depth requested from the pipeline
pub const MAX_RECURSION_DEPTH: u32 = 1;

/// Descriptor bindings of set 0
pub mod binding {
    /// Top-level acceleration structure
    pub const TLAS: u32 = 0;
    /// Shadow output (storage image)
    pub const SHADOW: u32 = 1;
    /// G-buffer position (storage image)
    pub const POSITION: u32 = 2;
    /// G-buffer normal (storage image)
    pub const NORMAL: u32 = 3;
}

/// Shader groups in SBT order
pub fn shader_groups() -> [vk::RayTracingShaderGroupCreateInfoKHR; GROUP_COUNT as usize] {
    let general = |shader| {
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build()
    };
    [
        general(0),
        general(1),
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(2)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    ]
}

/// Ray tracing pipeline for the shadow pass
pub struct RayTracingPipeline {
    pipeline: Pipeline,
    set_layout: DescriptorSetLayout,
}

impl RayTracingPipeline {
    /// Create the pipeline
    pub fn new(ctx: &VulkanContext, config: &RendererConfig) -> VulkanResult<Self> {
        let device = ctx.device();
        let max_depth = ctx.physical_device().ray_tracing.max_ray_recursion_depth;
        if max_depth < MAX_RECURSION_DEPTH {
            return Err(VulkanError::InitializationFailed(format!(
                "Device supports ray recursion depth {max_depth}, need {MAX_RECURSION_DEPTH}"
            )));
        }

        let raygen = ShaderModule::from_file(device.clone(), config.shader_path("rt.rgen.spv"))?;
        let miss = ShaderModule::from_file(device.clone(), config.shader_path("rt.rmiss.spv"))?;
        let closest_hit = ShaderModule::from_file(device.clone(), config.shader_path("rt.rchit.spv"))?;

        let stage = vk::ShaderStageFlags::RAYGEN_KHR;
        let set_layout = DescriptorSetLayoutBuilder::new()
            .add_acceleration_structure(binding::TLAS, stage)
            .add_storage_image(binding::SHADOW, stage)
            .add_storage_image(binding::POSITION, stage)
            .add_storage_image(binding::NORMAL, stage)
            .build(device)?;

        let shader_stages = [
            raygen.stage_info(vk::ShaderStageFlags::RAYGEN_KHR),
            miss.stage_info(vk::ShaderStageFlags::MISS_KHR),
            closest_hit.stage_info(vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];
        let groups = shader_groups();

        let layout = Pipeline::create_layout(device, &[set_layout.handle()], &[])?;

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&shader_stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(MAX_RECURSION_DEPTH)
            .layout(layout)
            .build();

        let result = unsafe {
            ctx.ray_tracing_loader().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        };
        let pipelines = match result {
            Ok(pipelines) => pipelines,
            Err(e) => {
                log::error!("Failed to create ray tracing pipeline: {:?}", e);
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let pipeline = Pipeline::from_raw(device.clone(), pipelines[0], layout);
        log::debug!("Created ray tracing pipeline");

        Ok(Self { pipeline, set_layout })
    }

    /// Point a ray tracing set at the TLAS and one frame's images
    pub fn write_descriptor_set(
        &self,
        device: &Device,
        set: vk::DescriptorSet,
        tlas: vk::AccelerationStructureKHR,
        shadow: vk::ImageView,
        position: vk::ImageView,
        normal: vk::ImageView,
    ) {
        DescriptorWriter::new(set)
            .acceleration_structure(binding::TLAS, tlas)
            .storage_image(binding::SHADOW, shadow)
            .storage_image(binding::POSITION, position)
            .storage_image(binding::NORMAL, normal)
            .update(device);
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline.handle()
    }

    /// Pipeline layout
    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline.layout()
    }

    /// Layout of set 0
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_order_matches_stage_order() {
        let groups = shader_groups();
        assert_eq!(groups[0].ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(groups[0].general_shader, 0);
        assert_eq!(groups[1].general_shader, 1);
        assert_eq!(groups[2].ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(groups[2].closest_hit_shader, 2);
        assert_eq!(groups[2].general_shader, vk::SHADER_UNUSED_KHR);
    }
}
