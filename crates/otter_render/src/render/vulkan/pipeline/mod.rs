//! Pipeline management
//!
//! Each pass owns a [`Pipeline`] (pipeline + layout) and the descriptor set
//! layouts its shaders expect. Shader binaries are loaded from the configured
//! shader directory at creation time.

use ash::{vk, Device};

use crate::render::vulkan::{VulkanError, VulkanResult};

pub mod gbuffer;
pub mod pbr;
pub mod ray_tracing;
pub mod shader_binding_table;

pub use gbuffer::GBufferPipeline;
pub use pbr::PbrPipeline;
pub use ray_tracing::RayTracingPipeline;
pub use shader_binding_table::{SbtLayout, ShaderBindingTable};

/// Pipeline and layout with RAII cleanup
pub struct Pipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl Pipeline {
    /// Create a pipeline layout
    pub fn create_layout(
        device: &Device,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        unsafe {
            device
                .create_pipeline_layout(&layout_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Create a graphics pipeline, taking ownership of `info.layout`
    ///
    /// The layout is destroyed if pipeline creation fails.
    pub fn graphics(device: &Device, info: &vk::GraphicsPipelineCreateInfo) -> VulkanResult<Self> {
        let result = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(info), None)
        };

        match result {
            Ok(pipelines) => Ok(Self::from_raw(device.clone(), pipelines[0], info.layout)),
            Err((_, e)) => {
                log::error!("Failed to create graphics pipeline: {:?}", e);
                unsafe { device.destroy_pipeline_layout(info.layout, None) };
                Err(VulkanError::Api(e))
            }
        }
    }

    /// Wrap handles created elsewhere
    pub fn from_raw(device: Device, pipeline: vk::Pipeline, layout: vk::PipelineLayout) -> Self {
        Self {
            device,
            pipeline,
            layout,
        }
    }

    /// Get pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Get layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Viewport and scissor are set per command buffer
pub const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Opaque color blend state for one attachment
pub fn opaque_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()
}
