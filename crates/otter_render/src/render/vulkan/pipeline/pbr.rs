//! PBR lighting pipeline
//!
//! Draws a full-screen quad in subpass 0 of the lighting pass, reading the
//! G-buffer as input attachments and the shadow image through a sampler.

use ash::{vk, Device};
use std::mem::size_of;

use super::{opaque_blend_attachment, Pipeline, DYNAMIC_STATES};
use crate::core::config::RendererConfig;
use crate::render::vulkan::buffer::GpuBuffer;
use crate::render::vulkan::descriptor::{DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
use crate::render::vulkan::image::{Image, ImageSampler};
use crate::render::vulkan::render_pass::gbuffer::{GBufferLayer, GBufferPass};
use crate::render::vulkan::shader::ShaderModule;
use crate::render::vulkan::VulkanResult;

/// Binding of the shadow sampler
pub const SHADOW_BINDING: u32 = 4;
/// Binding of the lighting uniform
pub const LIGHTING_BINDING: u32 = 5;

/// Two triangles covering clip space
pub const FULL_SCREEN_QUAD: [[f32; 3]; 6] = [
    [-1.0, -1.0, 0.0],
    [1.0, 1.0, 0.0],
    [1.0, -1.0, 0.0],
    [-1.0, -1.0, 0.0],
    [-1.0, 1.0, 0.0],
    [1.0, 1.0, 0.0],
];

/// Pipeline resolving the G-buffer to the swapchain image
pub struct PbrPipeline {
    pipeline: Pipeline,
    set_layout: DescriptorSetLayout,
}

impl PbrPipeline {
    /// Create the pipeline for subpass 0 of the lighting render pass
    pub fn new(device: &Device, config: &RendererConfig, render_pass: vk::RenderPass) -> VulkanResult<Self> {
        let vertex_shader = ShaderModule::from_file(device.clone(), config.shader_path("pbr.vert.spv"))?;
        let fragment_shader = ShaderModule::from_file(device.clone(), config.shader_path("pbr.frag.spv"))?;

        let set_layout = GBufferLayer::ALL
            .iter()
            .fold(DescriptorSetLayoutBuilder::new(), |builder, &layer| {
                builder.add_input_attachment(layer as u32)
            })
            .add_combined_image_sampler(SHADOW_BINDING, vk::ShaderStageFlags::FRAGMENT)
            .add_uniform_buffer(LIGHTING_BINDING, vk::ShaderStageFlags::FRAGMENT)
            .build(device)?;

        let shader_stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<[f32; 3]>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = [vk::VertexInputAttributeDescription {
            binding: 0,
            location: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        }];
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(false)
            .depth_write_enable(false);

        let blend_attachments = [opaque_blend_attachment()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&DYNAMIC_STATES);

        let layout = Pipeline::create_layout(device, &[set_layout.handle()], &[])?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipeline = Pipeline::graphics(device, &pipeline_info)?;
        log::debug!("Created PBR pipeline");

        Ok(Self { pipeline, set_layout })
    }

    /// Point a lighting set at one frame's G-buffer, shadow image and uniform
    pub fn write_descriptor_set(
        &self,
        device: &Device,
        set: vk::DescriptorSet,
        gbuffer: &GBufferPass,
        shadow: &Image,
        shadow_sampler: &ImageSampler,
        lighting: &GpuBuffer,
    ) {
        let [position, normal, albedo, material] = gbuffer.color_views();
        DescriptorWriter::new(set)
            .input_attachment(GBufferLayer::Position as u32, position)
            .input_attachment(GBufferLayer::Normal as u32, normal)
            .input_attachment(GBufferLayer::Albedo as u32, albedo)
            .input_attachment(GBufferLayer::Material as u32, material)
            .image(
                SHADOW_BINDING,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorImageInfo {
                    sampler: shadow_sampler.handle(),
                    image_view: shadow.view(),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            )
            .uniform_buffer(LIGHTING_BINDING, lighting.descriptor_info())
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
    fn test_full_screen_quad_covers_clip_space() {
        for corner in [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]] {
            assert!(FULL_SCREEN_QUAD.iter().any(|v| v[0] == corner[0] && v[1] == corner[1]));
        }
        assert_eq!(FULL_SCREEN_QUAD.len() % 3, 0);
    }

    #[test]
    fn test_bindings_follow_input_attachments() {
        assert_eq!(SHADOW_BINDING, GBufferLayer::ALL.len() as u32);
        assert_eq!(LIGHTING_BINDING, SHADOW_BINDING + 1);
    }
}
