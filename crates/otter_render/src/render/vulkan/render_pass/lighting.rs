//! Lighting pass: resolves the G-buffer into a swapchain image

use ash::{vk, Device};

use super::gbuffer::{GBufferLayer, GBufferPass, LAYER_COUNT};
use super::{Framebuffer, RenderPass};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Index of the swapchain color attachment
pub const OUTPUT_ATTACHMENT: u32 = LAYER_COUNT as u32;

/// Clear values in attachment order; only the output is cleared
pub fn clear_values() -> [vk::ClearValue; LAYER_COUNT + 1] {
    [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: [0.0, 0.0, 0.0, 1.0],
        },
    }; LAYER_COUNT + 1]
}

/// One framebuffer per swapchain image over a frame's G-buffer
pub struct LightingPass {
    framebuffers: Vec<Framebuffer>,
    extent: vk::Extent2D,
}

impl LightingPass {
    /// Render pass reading the G-buffer as input attachments
    pub fn create_render_pass(device: &Device, output_format: vk::Format) -> VulkanResult<RenderPass> {
        let input_attachment = |format| {
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build()
        };

        let output = vk::AttachmentDescription::builder()
            .format(output_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let attachments = [
            input_attachment(GBufferLayer::Position.format()),
            input_attachment(GBufferLayer::Normal.format()),
            input_attachment(GBufferLayer::Albedo.format()),
            input_attachment(GBufferLayer::Material.format()),
            output,
        ];

        let input_refs = GBufferLayer::ALL.map(|layer| vk::AttachmentReference {
            attachment: layer as u32,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
        let color_refs = [vk::AttachmentReference {
            attachment: OUTPUT_ATTACHMENT,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .input_attachments(&input_refs)
            .color_attachments(&color_refs)
            .build();
        let subpasses = [subpass];

        // The swapchain image is acquired with a wait at COLOR_ATTACHMENT_OUTPUT
        let dependencies = [vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::INPUT_ATTACHMENT_READ)
            .build()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        RenderPass::new(device.clone(), &create_info)
    }

    /// Build one framebuffer per swapchain view
    pub fn new(
        device: &Device,
        render_pass: vk::RenderPass,
        gbuffer: &GBufferPass,
        swapchain_views: &[vk::ImageView],
    ) -> VulkanResult<Self> {
        if swapchain_views.is_empty() {
            return Err(VulkanError::invalid("Lighting pass needs at least one swapchain image"));
        }

        let extent = gbuffer.extent();
        let [position, normal, albedo, material] = gbuffer.color_views();
        let framebuffers = swapchain_views
            .iter()
            .map(|&output| {
                Framebuffer::new(
                    device.clone(),
                    render_pass,
                    &[position, normal, albedo, material, output],
                    extent,
                )
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        Ok(Self { framebuffers, extent })
    }

    /// Framebuffer targeting swapchain image `image_index`
    pub fn framebuffer(&self, image_index: u32) -> VulkanResult<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .map(Framebuffer::handle)
            .ok_or_else(|| VulkanError::invalid(format!("No lighting framebuffer for image {image_index}")))
    }

    /// Number of framebuffers
    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    /// Output size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_follows_gbuffer_layers() {
        assert_eq!(OUTPUT_ATTACHMENT, 4);
        let values = clear_values();
        assert_eq!(values.len(), 5);
        unsafe {
            assert_eq!(values[OUTPUT_ATTACHMENT as usize].color.float32, [0.0, 0.0, 0.0, 1.0]);
        }
    }
}
