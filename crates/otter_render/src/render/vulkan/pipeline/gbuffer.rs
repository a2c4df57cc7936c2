//! G-buffer pipeline
//!
//! Set 0 holds the view-projection uniform, set 1 the four material
//! textures. The model matrix and material factors travel as push constants.

use ash::{vk, Device};
use std::mem::{offset_of, size_of};

use super::{opaque_blend_attachment, Pipeline, DYNAMIC_STATES};
use crate::core::config::RendererConfig;
use crate::foundation::math::{column_major, Mat4};
use crate::render::material::{Material, MaterialConstant, TextureSlot};
use crate::render::mesh::MeshVertex;
use crate::render::vulkan::commands::CommandRecorder;
use crate::render::vulkan::descriptor::{DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter};
use crate::render::vulkan::image::Texture;
use crate::render::vulkan::render_pass::gbuffer::LAYER_COUNT;
use crate::render::vulkan::shader::ShaderModule;
use crate::render::vulkan::VulkanResult;

/// Byte offset of the material block in the push constant range
pub const MATERIAL_PUSH_OFFSET: u32 = size_of::<Mat4>() as u32;

/// Push constant ranges: model matrix (vertex) then material (fragment)
pub fn push_constant_ranges() -> [vk::PushConstantRange; 2] {
    [
        vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: size_of::<[[f32; 4]; 4]>() as u32,
        },
        vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: MATERIAL_PUSH_OFFSET,
            size: size_of::<MaterialConstant>() as u32,
        },
    ]
}

/// Vertex binding for interleaved [`MeshVertex`] data
pub fn vertex_binding() -> vk::VertexInputBindingDescription {
    vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<MeshVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }
}

/// Attributes: position, normal, tangent, uv at locations 0..3
pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 4] {
    let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        binding: 0,
        location,
        format,
        offset: offset as u32,
    };
    [
        attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(MeshVertex, position)),
        attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(MeshVertex, normal)),
        attribute(2, vk::Format::R32G32B32A32_SFLOAT, offset_of!(MeshVertex, tangent)),
        attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(MeshVertex, uv)),
    ]
}

/// Pipeline filling the G-buffer
pub struct GBufferPipeline {
    pipeline: Pipeline,
    view_projection_layout: DescriptorSetLayout,
    material_layout: DescriptorSetLayout,
}

impl GBufferPipeline {
    /// Create the pipeline for subpass 0 of the G-buffer render pass
    pub fn new(device: &Device, config: &RendererConfig, render_pass: vk::RenderPass) -> VulkanResult<Self> {
        let vertex_shader = ShaderModule::from_file(device.clone(), config.shader_path("gbuffer.vert.spv"))?;
        let fragment_shader = ShaderModule::from_file(device.clone(), config.shader_path("gbuffer.frag.spv"))?;

        let view_projection_layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(device)?;
        let material_layout = TextureSlot::ALL
            .iter()
            .fold(DescriptorSetLayoutBuilder::new(), |builder, slot| {
                builder.add_combined_image_sampler(slot.binding(), vk::ShaderStageFlags::FRAGMENT)
            })
            .build(device)?;

        let shader_stages = [
            vertex_shader.stage_info(vk::ShaderStageFlags::VERTEX),
            fragment_shader.stage_info(vk::ShaderStageFlags::FRAGMENT),
        ];

        let bindings = [vertex_binding()];
        let attributes = vertex_attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        // Meshes wind counter-clockwise; the flipped-Y projection makes that clockwise
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments = [opaque_blend_attachment(); LAYER_COUNT];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&DYNAMIC_STATES);

        let set_layouts = [view_projection_layout.handle(), material_layout.handle()];
        let layout = Pipeline::create_layout(device, &set_layouts, &push_constant_ranges())?;

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
        log::debug!("Created G-buffer pipeline");

        Ok(Self {
            pipeline,
            view_projection_layout,
            material_layout,
        })
    }

    /// Point set 0 at the frame's view-projection buffer
    pub fn write_view_projection(&self, device: &Device, set: vk::DescriptorSet, buffer: vk::DescriptorBufferInfo) {
        DescriptorWriter::new(set).uniform_buffer(0, buffer).update(device);
    }

    /// Point set 1 at the material's textures, using `fallback` for empty slots
    pub fn write_material(&self, device: &Device, set: vk::DescriptorSet, material: &Material, fallback: &Texture) {
        TextureSlot::ALL
            .iter()
            .fold(DescriptorWriter::new(set), |writer, &slot| {
                let texture = material.texture(slot).map_or(fallback, |texture| texture.as_ref());
                writer.image(
                    slot.binding(),
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    texture.descriptor_info(),
                )
            })
            .update(device);
    }

    /// Push the model matrix
    pub fn push_transform(&self, recorder: &mut CommandRecorder, transform: &Mat4) {
        let columns = column_major(transform);
        recorder.push_constants(
            self.pipeline.layout(),
            vk::ShaderStageFlags::VERTEX,
            0,
            bytemuck::bytes_of(&columns),
        );
    }

    /// Push the material factors
    pub fn push_material(&self, recorder: &mut CommandRecorder, constant: &MaterialConstant) {
        recorder.push_constants(
            self.pipeline.layout(),
            vk::ShaderStageFlags::FRAGMENT,
            MATERIAL_PUSH_OFFSET,
            bytemuck::bytes_of(constant),
        );
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
    pub fn view_projection_layout(&self) -> vk::DescriptorSetLayout {
        self.view_projection_layout.handle()
    }

    /// Layout of set 1
    pub fn material_layout(&self) -> vk::DescriptorSetLayout {
        self.material_layout.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constant_ranges_do_not_overlap() {
        let [transform, material] = push_constant_ranges();
        assert_eq!(transform.offset, 0);
        assert_eq!(transform.size, 64);
        assert_eq!(material.offset, transform.offset + transform.size);
        assert_eq!(material.size, 44);
        // Vulkan guarantees at least 128 bytes of push constants
        assert!(material.offset + material.size <= 128);
    }

    #[test]
    fn test_vertex_attributes_match_mesh_vertex() {
        let attributes = vertex_attributes();
        assert_eq!(attributes.map(|a| a.offset), [0, 12, 24, 40]);
        assert_eq!(attributes.map(|a| a.location), [0, 1, 2, 3]);
        assert_eq!(vertex_binding().stride, 48);
    }
}
