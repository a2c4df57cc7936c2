//! Vulkan image and texture management
//!
//! `Image` owns an image, its memory and a full view, and remembers the
//! layout the last recorded barrier left it in. `Texture` pairs an image
//! with a sampler for material bindings.

use ash::{vk, Device};
use std::fmt;
use std::path::Path;

use crate::render::vulkan::buffer::{allocate_memory, GpuBuffer};
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};

/// Number of mip levels for a full chain down to 1x1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height);
    if largest == 0 {
        1
    } else {
        u32::BITS - largest.leading_zeros()
    }
}

/// Access masks and pipeline stages for a supported layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    /// Accesses that must complete before the transition
    pub src_access: vk::AccessFlags,
    /// Accesses that wait for the transition
    pub dst_access: vk::AccessFlags,
    /// Stage producing `src_access`
    pub src_stage: vk::PipelineStageFlags,
    /// Stage consuming `dst_access`
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for `old -> new`, or `None` for unsupported pairs
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<TransitionMasks> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let masks = |src_access, dst_access, src_stage, dst_stage| TransitionMasks {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    };

    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            Some(masks(A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER))
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Some(masks(
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        )),
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => {
            Some(masks(A::empty(), A::SHADER_READ, S::TOP_OF_PIPE, S::FRAGMENT_SHADER))
        }
        (L::UNDEFINED, L::GENERAL) => Some(masks(
            A::empty(),
            A::SHADER_READ | A::SHADER_WRITE,
            S::TOP_OF_PIPE,
            S::RAY_TRACING_SHADER_KHR,
        )),
        // Shadow targets are either traced into or cleared while GENERAL
        (L::SHADER_READ_ONLY_OPTIMAL, L::GENERAL) => Some(masks(
            A::COLOR_ATTACHMENT_WRITE | A::SHADER_READ,
            A::SHADER_READ | A::SHADER_WRITE | A::TRANSFER_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT | S::FRAGMENT_SHADER,
            S::RAY_TRACING_SHADER_KHR | S::TRANSFER,
        )),
        (L::GENERAL, L::SHADER_READ_ONLY_OPTIMAL) => Some(masks(
            A::SHADER_WRITE | A::TRANSFER_WRITE,
            A::SHADER_READ | A::INPUT_ATTACHMENT_READ,
            S::RAY_TRACING_SHADER_KHR | S::TRANSFER,
            S::FRAGMENT_SHADER,
        )),
        _ => None,
    }
}

/// Parameters for [`Image::new`]
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Size in pixels
    pub extent: vk::Extent2D,
    /// Pixel format
    pub format: vk::Format,
    /// Usage flags; `TRANSFER_SRC` is added when mips are generated
    pub usage: vk::ImageUsageFlags,
    /// Aspect of the view (color or depth)
    pub aspect: vk::ImageAspectFlags,
    /// Allocate a full mip chain
    pub generate_mips: bool,
}

impl ImageDesc {
    /// Single-level color image
    pub fn color(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent,
            format,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
            generate_mips: false,
        }
    }

    /// Single-level depth image
    pub fn depth(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            aspect: vk::ImageAspectFlags::DEPTH,
            ..Self::color(extent, format, usage)
        }
    }

    /// Request a full mip chain
    pub fn with_mips(mut self) -> Self {
        self.generate_mips = true;
        self
    }
}

/// Device-local 2D image with memory, view and tracked layout
pub struct Image {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    layout: vk::ImageLayout,
}

impl Image {
    /// Create an image in `UNDEFINED` layout
    pub fn new(ctx: &VulkanContext, desc: ImageDesc) -> VulkanResult<Self> {
        let device = ctx.device().clone();
        let mip_levels = if desc.generate_mips {
            mip_level_count(desc.extent.width, desc.extent.height)
        } else {
            1
        };
        let usage = if mip_levels > 1 {
            desc.usage | vk::ImageUsageFlags::TRANSFER_SRC
        } else {
            desc.usage
        };

        let image_create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe {
            device.create_image(&image_create_info, None).map_err(|e| {
                log::error!("Failed to create {:?} image: {:?}", desc.format, e);
                VulkanError::Api(e)
            })?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate_memory(
            &device,
            &ctx.physical_device().memory_properties,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .and_then(|()| device.create_image_view(&view_info, None))
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                log::error!("Failed to bind image memory or create view: {:?}", e);
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(VulkanError::Api(e));
            }
        };

        log::debug!(
            "Created image {}x{} {:?} ({} mips)",
            desc.extent.width,
            desc.extent.height,
            desc.format,
            mip_levels
        );

        Ok(Self {
            device,
            image,
            memory,
            view,
            format: desc.format,
            extent: desc.extent,
            aspect: desc.aspect,
            mip_levels,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Record a layout transition over every mip level
    ///
    /// Unsupported pairs are logged and skipped; returns whether a barrier
    /// was recorded. Transitioning to the current layout is a no-op.
    pub fn transition(&mut self, cmd: vk::CommandBuffer, new_layout: vk::ImageLayout) -> bool {
        if self.layout == new_layout {
            return true;
        }
        let Some(masks) = transition_masks(self.layout, new_layout) else {
            log::warn!(
                "Unsupported image layout transition {:?} -> {:?}",
                self.layout,
                new_layout
            );
            return false;
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(self.layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.full_range())
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        self.layout = new_layout;
        true
    }

    /// Record that a render pass left the image in `layout`
    pub fn assume_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Fill mip level 0 from `bytes` and leave the image shader-readable
    ///
    /// Blocks until the upload has finished. Images with more than one mip
    /// level get the rest of the chain generated by blitting.
    pub fn upload(&mut self, ctx: &VulkanContext, pool: &CommandPool, bytes: &[u8]) -> VulkanResult<()> {
        if self.mip_levels > 1 {
            let properties = unsafe {
                ctx.instance()
                    .get_physical_device_format_properties(ctx.physical_device().device, self.format)
            };
            if !properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
            {
                return Err(VulkanError::invalid(format!(
                    "{:?} does not support linear blits for mipmap generation",
                    self.format
                )));
            }
        }

        let mut staging = GpuBuffer::new(
            ctx,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write(bytes, 0)?;

        pool.submit_once(ctx.graphics_queue(), |device, cmd| {
            self.layout = vk::ImageLayout::UNDEFINED;
            self.transition(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

            let region = vk::BufferImageCopy::builder()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: self.aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                })
                .build();
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            if self.mip_levels > 1 {
                self.record_mipmaps(cmd);
            } else {
                self.transition(cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            }
            Ok(())
        })
    }

    // Every level starts in TRANSFER_DST; every level ends SHADER_READ_ONLY.
    fn record_mipmaps(&mut self, cmd: vk::CommandBuffer) {
        let level_barrier = |level: u32, old, new, src_access, dst_access| {
            vk::ImageMemoryBarrier::builder()
                .old_layout(old)
                .new_layout(new)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: self.aspect,
                    base_mip_level: level,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .build()
        };

        let mut width = self.extent.width as i32;
        let mut height = self.extent.height as i32;

        for level in 1..self.mip_levels {
            let to_src = level_barrier(
                level - 1,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
            );
            unsafe {
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_src],
                );
            }

            let next_width = (width / 2).max(1);
            let next_height = (height / 2).max(1);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: self.aspect,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [vk::Offset3D::default(), vk::Offset3D { x: width, y: height, z: 1 }],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: self.aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ],
            };
            unsafe {
                self.device.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            let to_read = level_barrier(
                level - 1,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ,
            );
            unsafe {
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_read],
                );
            }

            width = next_width;
            height = next_height;
        }

        let last = level_barrier(
            self.mip_levels - 1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
        );
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[last],
            );
        }
        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }

    fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// View over every mip level
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Pixel format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Size of mip level 0
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of mip levels
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Layout left by the last recorded transition
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Linear repeating sampler
pub struct ImageSampler {
    device: Device,
    sampler: vk::Sampler,
}

impl ImageSampler {
    /// Create a sampler covering `mip_levels` levels
    ///
    /// Anisotropic filtering (up to 16x) is enabled when the device supports it.
    pub fn new(ctx: &VulkanContext, mip_levels: u32) -> VulkanResult<Self> {
        let physical = ctx.physical_device();
        let anisotropy = physical.supports_anisotropy();
        let max_anisotropy = if anisotropy {
            physical.properties.limits.max_sampler_anisotropy.min(16.0)
        } else {
            1.0
        };

        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(max_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(mip_levels as f32);

        let device = ctx.device().clone();
        let sampler = unsafe { device.create_sampler(&create_info, None).map_err(VulkanError::Api)? };
        Ok(Self { device, sampler })
    }

    /// Sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for ImageSampler {
    fn drop(&mut self) {
        unsafe { self.device.destroy_sampler(self.sampler, None) };
    }
}

/// Sampled RGBA texture used by materials
pub struct Texture {
    image: Image,
    sampler: ImageSampler,
}

impl Texture {
    /// Texture format for every material texture
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    /// Upload tightly packed RGBA8 pixels with a generated mip chain
    pub fn from_rgba8(
        ctx: &VulkanContext,
        pool: &CommandPool,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> VulkanResult<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected || expected == 0 {
            return Err(VulkanError::invalid(format!(
                "Expected {} bytes of RGBA8 data for {}x{}, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }

        let extent = vk::Extent2D { width, height };
        let mut desc = ImageDesc::color(
            extent,
            Self::FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        );
        if mip_level_count(width, height) > 1 {
            desc = desc.with_mips();
        }

        let mut image = Image::new(ctx, desc)?;
        image.upload(ctx, pool, pixels)?;
        let sampler = ImageSampler::new(ctx, image.mip_levels())?;
        Ok(Self { image, sampler })
    }

    /// Decode a PNG (or any format the `image` crate was built with)
    pub fn from_file(ctx: &VulkanContext, pool: &CommandPool, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let decoded = ::image::open(path)
            .map_err(|e| {
                log::error!("Failed to load texture {}: {}", path.display(), e);
                VulkanError::InitializationFailed(format!("Texture {}: {e}", path.display()))
            })?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        Self::from_rgba8(ctx, pool, width, height, decoded.as_raw())
    }

    /// 1x1 texture of a single color
    pub fn solid_color(ctx: &VulkanContext, pool: &CommandPool, color: [u8; 4]) -> VulkanResult<Self> {
        Self::from_rgba8(ctx, pool, 1, 1, &color)
    }

    /// Image view
    pub fn view(&self) -> vk::ImageView {
        self.image.view()
    }

    /// Sampler handle
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler.handle()
    }

    /// Descriptor info for a combined image sampler binding
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.handle(),
            image_view: self.image.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Underlying image
    pub fn image(&self) -> &Image {
        &self.image
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture").field("image", &self.image).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(2, 1), 2);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(1000, 10), 10);
        assert_eq!(mip_level_count(0, 0), 1);
    }

    #[test]
    fn test_supported_transitions() {
        use vk::ImageLayout as L;
        let supported = [
            (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL),
            (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL),
            (L::UNDEFINED, L::GENERAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::GENERAL),
            (L::GENERAL, L::SHADER_READ_ONLY_OPTIMAL),
        ];
        for (old, new) in supported {
            assert!(transition_masks(old, new).is_some(), "{old:?} -> {new:?}");
        }

        assert!(transition_masks(L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL).is_none());
        assert!(transition_masks(L::GENERAL, L::PRESENT_SRC_KHR).is_none());
    }

    #[test]
    fn test_upload_transition_masks() {
        let to_dst = transition_masks(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_shadow_round_trip_targets_ray_tracing_stage() {
        let to_general = transition_masks(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::GENERAL).unwrap();
        let back = transition_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).unwrap();
        assert!(to_general.dst_stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
        assert!(to_general.dst_stage.contains(vk::PipelineStageFlags::TRANSFER));
        assert!(to_general.dst_access.contains(vk::AccessFlags::SHADER_WRITE));
        assert!(back.src_stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
        assert_eq!(back.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }
}
