//! Renderer entry point
//!
//! Owns the Vulkan context and everything created from it, hands draws to
//! the current frame in flight and paces frames on their fences.
//!
//! The scene acceleration structure is built once, on the first draw that
//! has geometry queued, and then reused. Call
//! [`RenderInstance::invalidate_acceleration_structure`] after changing the
//! static geometry.

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use crate::core::config::RendererConfig;
use crate::foundation::math::{Mat4, Transform};
use crate::render::material::Material;
use crate::render::mesh::Mesh;
use crate::render::render_queue::{RenderCommand, RenderQueue};
use crate::render::vulkan::acceleration_structure::AccelerationStructure;
use crate::render::vulkan::buffer::GpuBuffer;
use crate::render::vulkan::commands::CommandPool;
use crate::render::vulkan::frame_loop::{draw_frame, FrameSubmitter};
use crate::render::vulkan::image::{ImageSampler, Texture};
use crate::render::vulkan::mesh::GpuMesh;
use crate::render::vulkan::pipeline::pbr::FULL_SCREEN_QUAD;
use crate::render::vulkan::pipeline::{GBufferPipeline, PbrPipeline, RayTracingPipeline, ShaderBindingTable};
use crate::render::vulkan::render_frame::{FrameInput, RenderFrame, SharedResources};
use crate::render::vulkan::render_pass::{GBufferPass, LightingPass, RenderPass};
use crate::render::vulkan::swapchain::Swapchain;
use crate::render::vulkan::sync::{Fence, FramePacer};
use crate::render::vulkan::window::Window;
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};
use crate::scheduler::TaskScheduler;

/// Tracks whether the static scene's acceleration structure exists
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StaticSceneLatch {
    built: bool,
}

impl StaticSceneLatch {
    /// Whether a build should run with `queued` draws pending
    pub fn needs_build(&self, queued: usize) -> bool {
        !self.built && queued > 0
    }

    /// Record a successful build
    pub fn mark_built(&mut self) {
        self.built = true;
    }

    /// Request a rebuild on the next draw with geometry
    pub fn invalidate(&mut self) {
        self.built = false;
    }

    /// Whether a build has completed since the last invalidation
    pub fn is_built(&self) -> bool {
        self.built
    }
}

/// Number of frames in flight for a swapchain with `image_count` images
pub fn frames_in_flight(image_count: usize, requested: u32) -> usize {
    image_count.min(requested as usize).max(1)
}

/// Deferred renderer with ray-traced shadows
///
/// The pacer's fence handles drop before the device objects in `resources`.
pub struct RenderInstance {
    pacer: FramePacer<Arc<Fence>>,
    resources: Resources,
}

/// Everything a frame is drawn with; fields drop top to bottom, context last
struct Resources {
    config: RendererConfig,
    camera: Transform,
    pending: RenderQueue,
    frames: Vec<RenderFrame>,
    scene_latch: StaticSceneLatch,
    acceleration_structure: AccelerationStructure,
    shader_binding_table: ShaderBindingTable,
    ray_tracing_pipeline: RayTracingPipeline,
    pbr_pipeline: PbrPipeline,
    gbuffer_pipeline: Arc<GBufferPipeline>,
    lighting_render_pass: RenderPass,
    gbuffer_render_pass: RenderPass,
    full_screen_quad: GpuBuffer,
    shadow_sampler: ImageSampler,
    fallback_texture: Arc<Texture>,
    command_pool: CommandPool,
    swapchain: Swapchain,
    scheduler: TaskScheduler,
    context: VulkanContext,
}

impl RenderInstance {
    /// Create the renderer presenting to `window`
    ///
    /// Anything created before a failing step is released again.
    pub fn new(config: &RendererConfig, window: &mut Window) -> VulkanResult<Self> {
        config
            .validate()
            .and_then(|()| config.validate_shaders())
            .map_err(|e| VulkanError::InitializationFailed(e.to_string()))?;

        let context = VulkanContext::new(config, window)?;
        let scheduler = TaskScheduler::new(&config.scheduler)
            .map_err(|e| VulkanError::InitializationFailed(format!("Task scheduler: {e}")))?;
        let swapchain = Swapchain::new(&context, window.framebuffer_extent())?;
        let device = context.device();

        let command_pool = CommandPool::new(
            device.clone(),
            context.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let fallback_texture = Arc::new(Texture::solid_color(&context, &command_pool, [255, 255, 255, 255])?);
        let shadow_sampler = ImageSampler::new(&context, 1)?;
        let full_screen_quad = GpuBuffer::device_local_with_data(
            &context,
            &command_pool,
            bytemuck::cast_slice(&FULL_SCREEN_QUAD),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;

        let gbuffer_render_pass = GBufferPass::create_render_pass(device)?;
        let lighting_render_pass = LightingPass::create_render_pass(device, swapchain.format().format)?;

        let gbuffer_pipeline = Arc::new(GBufferPipeline::new(device, config, gbuffer_render_pass.handle())?);
        let pbr_pipeline = PbrPipeline::new(device, config, lighting_render_pass.handle())?;
        let ray_tracing_pipeline = RayTracingPipeline::new(&context, config)?;
        let shader_binding_table = ShaderBindingTable::new(&context, ray_tracing_pipeline.handle())?;

        let frame_count = frames_in_flight(swapchain.image_count(), config.requested_frames_in_flight);
        let mut frames = {
            let shared = SharedResources {
                ctx: &context,
                config,
                scheduler: &scheduler,
                gbuffer_render_pass: gbuffer_render_pass.handle(),
                lighting_render_pass: lighting_render_pass.handle(),
                gbuffer_pipeline: &gbuffer_pipeline,
                pbr_pipeline: &pbr_pipeline,
                ray_tracing_pipeline: &ray_tracing_pipeline,
                shader_binding_table: &shader_binding_table,
                fallback_texture: &fallback_texture,
                shadow_sampler: &shadow_sampler,
                full_screen_quad: &full_screen_quad,
            };
            (0..frame_count)
                .map(|_| RenderFrame::new(&shared, swapchain.image_views(), swapchain.extent()))
                .collect::<VulkanResult<Vec<_>>>()?
        };
        command_pool.submit_once(context.graphics_queue(), |_, cmd| {
            frames
                .iter_mut()
                .try_for_each(|frame| frame.record_initial_layouts(cmd))
        })?;
        let pacer = FramePacer::new(frames.iter().map(RenderFrame::in_flight_fence).collect())?;

        log::info!(
            "Renderer ready: {}x{}, {} frames in flight, {} workers",
            swapchain.extent().width,
            swapchain.extent().height,
            frame_count,
            scheduler.number_of_threads()
        );

        Ok(Self {
            pacer,
            resources: Resources {
                config: config.clone(),
                camera: Transform::identity(),
                pending: RenderQueue::new(),
                frames,
                scene_latch: StaticSceneLatch::default(),
                acceleration_structure: AccelerationStructure::new(config.acceleration_structure.clone()),
                shader_binding_table,
                ray_tracing_pipeline,
                pbr_pipeline,
                gbuffer_pipeline,
                lighting_render_pass,
                gbuffer_render_pass,
                full_screen_quad,
                shadow_sampler,
                fallback_texture,
                command_pool,
                swapchain,
                scheduler,
                context,
            },
        })
    }

    /// Upload a mesh so it can be drawn
    pub fn upload_mesh(&self, mesh: &Mesh) -> VulkanResult<GpuMesh> {
        GpuMesh::new(&self.resources.context, &self.resources.command_pool, mesh)
    }

    /// Load a material texture from an image file
    pub fn load_texture(&self, path: impl AsRef<Path>) -> VulkanResult<Arc<Texture>> {
        Texture::from_file(&self.resources.context, &self.resources.command_pool, path).map(Arc::new)
    }

    /// Queue `mesh` for the next [`Self::draw`]
    ///
    /// `mesh` must stay alive until every frame that drew it has finished.
    pub fn queue_mesh_draw(&mut self, mesh: &GpuMesh, material: Arc<Material>, transform: Mat4) -> VulkanResult<()> {
        self.queue_draw(RenderCommand::new(mesh.mesh_ref()?, material, transform));
        Ok(())
    }

    /// Queue a prepared draw command
    pub fn queue_draw(&mut self, command: RenderCommand) {
        self.resources.pending.push(command);
    }

    /// Set the camera used by the next draws
    pub fn set_camera(&mut self, camera: Transform) {
        self.resources.camera = camera;
    }

    /// Render and present one frame from the queued draws
    ///
    /// Returns `Ok(false)` when the frame was dropped: no image could be
    /// acquired, recording failed or the swapchain is out of date. The
    /// queued draws are discarded in every case. Errors mean the device is
    /// lost.
    pub fn draw(&mut self) -> VulkanResult<bool> {
        draw_frame(&mut self.pacer, &mut self.resources)
    }

    /// Drop the scene acceleration structure; the next draw with geometry rebuilds it
    pub fn invalidate_acceleration_structure(&mut self) -> VulkanResult<()> {
        self.resources.context.wait_idle()?;
        self.resources.acceleration_structure.clear();
        self.resources.scene_latch.invalidate();
        log::debug!("Acceleration structure invalidated");
        Ok(())
    }

    /// Number of frames in flight
    pub fn frames_in_flight(&self) -> usize {
        self.pacer.frames_in_flight()
    }

    /// Index of the frame slot the next draw uses
    pub fn current_frame(&self) -> usize {
        self.pacer.current()
    }

    /// Whether the scene acceleration structure has been built
    pub fn acceleration_structure_built(&self) -> bool {
        self.resources.scene_latch.is_built() && self.resources.acceleration_structure.is_built()
    }

    /// Log that the window changed size; swapchain recreation is not supported
    pub fn handle_resize(&self, window: &Window) {
        let extent = window.framebuffer_extent();
        let current = self.resources.swapchain.extent();
        log::warn!(
            "Window resized to {}x{}; rendering continues at {}x{}",
            extent.width,
            extent.height,
            current.width,
            current.height
        );
    }

    /// Vulkan context
    pub fn context(&self) -> &VulkanContext {
        &self.resources.context
    }
}

impl Resources {
    fn build_acceleration_structure(&mut self, commands: &[RenderCommand]) -> VulkanResult<()> {
        let result = self
            .acceleration_structure
            .build(&self.context, &self.command_pool, commands);
        match result {
            Ok(()) => {
                self.scene_latch.mark_built();
                Ok(())
            }
            Err(e) => {
                log::error!("Acceleration structure build failed: {}", e);
                self.acceleration_structure.clear();
                Err(e)
            }
        }
    }
}

impl FrameSubmitter for Resources {
    fn acquire(&mut self, slot: usize) -> VulkanResult<u32> {
        self.swapchain.acquire_next_image(self.frames[slot].image_available())
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
    }

    fn clear_buffers(&mut self, slot: usize) -> VulkanResult<usize> {
        self.frames[slot].clear_buffers()
    }

    fn record_and_submit(&mut self, slot: usize, image: u32) -> VulkanResult<()> {
        let pending = std::mem::take(&mut self.pending);
        if self.scene_latch.needs_build(pending.len()) {
            self.build_acceleration_structure(pending.commands())?;
        }

        let frame = &mut self.frames[slot];
        for command in pending.commands() {
            frame.queue_mesh_draw(command.clone());
        }

        let shared = SharedResources {
            ctx: &self.context,
            config: &self.config,
            scheduler: &self.scheduler,
            gbuffer_render_pass: self.gbuffer_render_pass.handle(),
            lighting_render_pass: self.lighting_render_pass.handle(),
            gbuffer_pipeline: &self.gbuffer_pipeline,
            pbr_pipeline: &self.pbr_pipeline,
            ray_tracing_pipeline: &self.ray_tracing_pipeline,
            shader_binding_table: &self.shader_binding_table,
            fallback_texture: &self.fallback_texture,
            shadow_sampler: &self.shadow_sampler,
            full_screen_quad: &self.full_screen_quad,
        };
        let input = FrameInput {
            image_index: image,
            camera: &self.camera,
            top_level: self.acceleration_structure.top_level_handle(),
        };
        frame.draw(&shared, &input)
    }

    fn submit_skipped(&mut self, slot: usize, image: u32) -> VulkanResult<()> {
        let swapchain_image = self.swapchain.image(image)?;
        self.frames[slot].submit_skipped(self.context.graphics_queue(), swapchain_image)
    }

    fn present(&mut self, slot: usize, image: u32) -> VulkanResult<bool> {
        let result = self.swapchain.present(
            self.context.present_queue(),
            self.frames[slot].render_finished(),
            image,
        );
        match result {
            Ok(()) => Ok(true),
            Err(VulkanError::SwapchainOutOfDate) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RenderInstance {
    fn drop(&mut self) {
        if let Err(e) = self.resources.context.wait_idle() {
            log::error!("Failed to wait for device idle during shutdown: {}", e);
        }
        // Workers must be gone before the frames holding their pools
        self.resources.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_builds_once_with_geometry() {
        let mut latch = StaticSceneLatch::default();
        assert!(!latch.needs_build(0));
        assert!(latch.needs_build(3));

        latch.mark_built();
        assert!(latch.is_built());
        assert!(!latch.needs_build(3));
        assert!(!latch.needs_build(100));
    }

    #[test]
    fn test_invalidated_latch_rebuilds() {
        let mut latch = StaticSceneLatch::default();
        latch.mark_built();
        latch.invalidate();
        assert!(!latch.is_built());
        assert!(latch.needs_build(1));
    }

    #[test]
    fn test_frames_in_flight_clamped_to_swapchain() {
        assert_eq!(frames_in_flight(3, 2), 2);
        assert_eq!(frames_in_flight(2, 3), 2);
        assert_eq!(frames_in_flight(4, 4), 4);
        assert_eq!(frames_in_flight(0, 3), 1);
    }
}
