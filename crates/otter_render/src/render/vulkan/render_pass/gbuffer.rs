//! G-buffer pass: four color targets plus depth

use ash::{vk, Device};

use super::{Framebuffer, RenderPass};
use crate::render::vulkan::image::{Image, ImageDesc};
use crate::render::vulkan::{VulkanContext, VulkanResult};

/// G-buffer layers in attachment order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GBufferLayer {
    /// World-space position
    Position = 0,
    /// World-space normal
    Normal = 1,
    /// Base color
    Albedo = 2,
    /// Metallic, roughness and occlusion
    Material = 3,
}

impl GBufferLayer {
    /// Every layer in attachment order
    pub const ALL: [Self; 4] = [Self::Position, Self::Normal, Self::Albedo, Self::Material];

    /// Attachment format
    pub const fn format(self) -> vk::Format {
        match self {
            Self::Position => vk::Format::R32G32B32A32_SFLOAT,
            Self::Normal | Self::Material => vk::Format::R16G16B16A16_SFLOAT,
            Self::Albedo => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// Number of color layers
pub const LAYER_COUNT: usize = 4;

/// Depth attachment format
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Usage of every color layer: rasterized into, read as input attachment
/// by lighting and as storage image by the shadow rays
pub const COLOR_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::INPUT_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::STORAGE.as_raw()
        | vk::ImageUsageFlags::SAMPLED.as_raw(),
);

/// Clear values in attachment order: color layers then depth
pub fn clear_values() -> [vk::ClearValue; LAYER_COUNT + 1] {
    let color = |alpha: f32| vk::ClearValue {
        color: vk::ClearColorValue {
            float32: [0.0, 0.0, 0.0, alpha],
        },
    };
    [
        color(0.0),
        color(1.0),
        color(1.0),
        color(1.0),
        vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
        },
    ]
}

/// Per-frame G-buffer targets and their framebuffer
pub struct GBufferPass {
    layers: [Image; LAYER_COUNT],
    depth: Image,
    framebuffer: Framebuffer,
    extent: vk::Extent2D,
}

impl GBufferPass {
    /// Render pass writing the four layers and depth
    ///
    /// Color layers end in `SHADER_READ_ONLY_OPTIMAL`, ready for the
    /// lighting pass and the shadow transitions.
    pub fn create_render_pass(device: &Device) -> VulkanResult<RenderPass> {
        let color_attachment = |format| {
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .build()
        };

        let depth_attachment = vk::AttachmentDescription::builder()
            .format(DEPTH_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let attachments = [
            color_attachment(GBufferLayer::Position.format()),
            color_attachment(GBufferLayer::Normal.format()),
            color_attachment(GBufferLayer::Albedo.format()),
            color_attachment(GBufferLayer::Material.format()),
            depth_attachment,
        ];

        let color_refs = GBufferLayer::ALL.map(|layer| vk::AttachmentReference {
            attachment: layer as u32,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
        let depth_ref = vk::AttachmentReference {
            attachment: LAYER_COUNT as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
            .build();
        let subpasses = [subpass];

        let attachment_stages =
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(attachment_stages)
                .dst_stage_mask(attachment_stages)
                .dst_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )
                .build(),
            vk::SubpassDependency::builder()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(
                    vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::FRAGMENT_SHADER,
                )
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ)
                .build(),
        ];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        RenderPass::new(device.clone(), &create_info)
    }

    /// Allocate the targets at `extent` and build the framebuffer
    pub fn new(ctx: &VulkanContext, render_pass: vk::RenderPass, extent: vk::Extent2D) -> VulkanResult<Self> {
        let layers = [
            Self::create_layer(ctx, GBufferLayer::Position, extent)?,
            Self::create_layer(ctx, GBufferLayer::Normal, extent)?,
            Self::create_layer(ctx, GBufferLayer::Albedo, extent)?,
            Self::create_layer(ctx, GBufferLayer::Material, extent)?,
        ];
        let depth = Image::new(
            ctx,
            ImageDesc::depth(extent, DEPTH_FORMAT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        )?;

        let views = [
            layers[0].view(),
            layers[1].view(),
            layers[2].view(),
            layers[3].view(),
            depth.view(),
        ];
        let framebuffer = Framebuffer::new(ctx.device().clone(), render_pass, &views, extent)?;

        Ok(Self {
            layers,
            depth,
            framebuffer,
            extent,
        })
    }

    fn create_layer(ctx: &VulkanContext, layer: GBufferLayer, extent: vk::Extent2D) -> VulkanResult<Image> {
        Image::new(ctx, ImageDesc::color(extent, layer.format(), COLOR_USAGE))
    }

    /// Target for `layer`
    pub fn layer(&self, layer: GBufferLayer) -> &Image {
        &self.layers[layer as usize]
    }

    /// Mutable target for layout transitions
    pub fn layer_mut(&mut self, layer: GBufferLayer) -> &mut Image {
        &mut self.layers[layer as usize]
    }

    /// Views of the color layers in attachment order
    pub fn color_views(&self) -> [vk::ImageView; LAYER_COUNT] {
        [
            self.layers[0].view(),
            self.layers[1].view(),
            self.layers[2].view(),
            self.layers[3].view(),
        ]
    }

    /// Record the layouts the render pass leaves the targets in
    pub fn mark_rendered(&mut self) {
        for layer in &mut self.layers {
            layer.assume_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        self.depth
            .assume_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    /// Framebuffer handle
    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer.handle()
    }

    /// Target size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_formats() {
        assert_eq!(GBufferLayer::Position.format(), vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(GBufferLayer::Normal.format(), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(GBufferLayer::Albedo.format(), vk::Format::R8G8B8A8_UNORM);
        assert_eq!(GBufferLayer::Material.format(), vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(GBufferLayer::ALL.map(|l| l as usize), [0, 1, 2, 3]);
    }

    #[test]
    fn test_color_usage_allows_every_consumer() {
        for usage in [
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::ImageUsageFlags::INPUT_ATTACHMENT,
            vk::ImageUsageFlags::STORAGE,
            vk::ImageUsageFlags::SAMPLED,
        ] {
            assert!(COLOR_USAGE.contains(usage));
        }
    }

    #[test]
    fn test_clear_values() {
        let values = clear_values();
        unsafe {
            assert_eq!(values[0].color.float32, [0.0, 0.0, 0.0, 0.0]);
            assert_eq!(values[1].color.float32[3], 1.0);
            assert_eq!(values[3].color.float32[3], 1.0);
            assert_eq!(values[4].depth_stencil.depth, 1.0);
        }
    }
}
