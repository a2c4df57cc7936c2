//! One frame in flight
//!
//! A frame owns everything the GPU may still be reading while the CPU
//! prepares the next frame: G-buffer targets, shadow image, uniforms,
//! descriptor sets, command buffers and the sync objects chaining its three
//! submissions. G-buffer secondaries are recorded in parallel on the task
//! scheduler, one task per material run of the render queue.

use ash::{vk, Device};
use parking_lot::Mutex;
use std::mem::size_of;
use std::sync::Arc;

use crate::core::config::RendererConfig;
use crate::foundation::math::{LightingData, Transform, ViewProjection};
use crate::render::render_queue::{RenderCommand, RenderQueue};
use crate::render::vulkan::buffer::GpuBuffer;
use crate::render::vulkan::commands::{CommandPool, CommandRecorder};
use crate::render::material::TextureSlot;
use crate::render::vulkan::descriptor::DescriptorPool;
use crate::render::vulkan::image::{Image, ImageDesc, ImageSampler, Texture};
use crate::render::vulkan::pipeline::pbr::FULL_SCREEN_QUAD;
use crate::render::vulkan::pipeline::{GBufferPipeline, PbrPipeline, RayTracingPipeline, ShaderBindingTable};
use crate::render::vulkan::render_pass::gbuffer::{self, GBufferLayer};
use crate::render::vulkan::render_pass::{full_area, full_viewport, lighting, GBufferPass, LightingPass};
use crate::render::vulkan::sync::{Fence, FrameSync, InFlightFence};
use crate::render::vulkan::{VulkanContext, VulkanError, VulkanResult};
use crate::scheduler::{TaskHandle, TaskScheduler};

/// Shadow visibility format
pub const SHADOW_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Material runs one worker can record per frame before runs are skipped
pub const WORKER_MAX_RUNS: u32 = 4 * 1024;

/// Maximum sets in a worker's descriptor pool; each run takes two
pub const WORKER_MAX_SETS: u32 = 2 * WORKER_MAX_RUNS;

/// Descriptor pool sizes for recording `runs` material runs
///
/// Every run binds one view-projection buffer and one sampler per texture slot.
pub fn worker_pool_sizes(runs: u32) -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: runs,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: runs * TextureSlot::ALL.len() as u32,
        },
    ]
}

/// Recording progress of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Cleared and ready to record
    Idle,
    /// Worker tasks are recording G-buffer secondaries
    RecordingGBuffer,
    /// Recording the shadow ray dispatch
    RecordingShadow,
    /// Recording the lighting pass
    RecordingLighting,
    /// Submitted; reusable once the in-flight fence signals
    Submitted,
}

impl FrameState {
    /// Move to `next`, rejecting anything but the forward order or a reset
    pub fn transition(self, next: Self) -> VulkanResult<Self> {
        let legal = next == Self::Idle
            || matches!(
                (self, next),
                (Self::Idle, Self::RecordingGBuffer)
                    | (Self::RecordingGBuffer, Self::RecordingShadow)
                    | (Self::RecordingShadow, Self::RecordingLighting)
                    | (Self::RecordingLighting, Self::Submitted)
            );
        if legal {
            Ok(next)
        } else {
            Err(VulkanError::invalid(format!(
                "Illegal frame state transition {self:?} -> {next:?}"
            )))
        }
    }
}

/// Command storage that hands out secondaries and takes them all back at once
pub trait SecondaryPool {
    /// Secondaries recorded since the last release
    fn recorded(&self) -> usize;

    /// Free every recorded secondary and reset the pool
    fn release(&mut self) -> VulkanResult<()>;
}

/// Release the secondaries of every pool; returns how many were freed
pub fn release_secondaries<P: SecondaryPool>(pools: &[Mutex<P>]) -> VulkanResult<usize> {
    pools.iter().try_fold(0, |freed, pool| {
        let mut pool = pool.lock();
        let recorded = pool.recorded();
        pool.release()?;
        Ok(freed + recorded)
    })
}

/// Command and descriptor pools owned by one worker thread for one frame
pub struct WorkerPools {
    command_pool: CommandPool,
    descriptor_pool: DescriptorPool,
    secondaries: Vec<vk::CommandBuffer>,
}

impl WorkerPools {
    fn new(ctx: &VulkanContext) -> VulkanResult<Self> {
        let command_pool = CommandPool::new(
            ctx.device().clone(),
            ctx.graphics_queue_family(),
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;
        let pool_sizes = worker_pool_sizes(WORKER_MAX_RUNS);
        let descriptor_pool = DescriptorPool::new(ctx.device().clone(), WORKER_MAX_SETS, &pool_sizes)?;

        Ok(Self {
            command_pool,
            descriptor_pool,
            secondaries: Vec::new(),
        })
    }

    fn allocate_secondary(&mut self) -> VulkanResult<vk::CommandBuffer> {
        let cmd = self
            .command_pool
            .allocate_command_buffers(vk::CommandBufferLevel::SECONDARY, 1)?
            .pop()
            .ok_or_else(|| VulkanError::invalid("Command pool returned no buffers"))?;
        self.secondaries.push(cmd);
        Ok(cmd)
    }
}

impl SecondaryPool for WorkerPools {
    fn recorded(&self) -> usize {
        self.secondaries.len()
    }

    fn release(&mut self) -> VulkanResult<()> {
        if !self.secondaries.is_empty() {
            self.command_pool.free_command_buffers(&self.secondaries);
            self.secondaries.clear();
        }
        self.command_pool.reset()
    }
}

/// Renderer-wide objects every frame records against
pub struct SharedResources<'a> {
    /// Device context
    pub ctx: &'a VulkanContext,
    /// Renderer configuration
    pub config: &'a RendererConfig,
    /// Worker pool for G-buffer recording
    pub scheduler: &'a TaskScheduler,
    /// G-buffer render pass
    pub gbuffer_render_pass: vk::RenderPass,
    /// Lighting render pass
    pub lighting_render_pass: vk::RenderPass,
    /// G-buffer pipeline, shared with worker tasks
    pub gbuffer_pipeline: &'a Arc<GBufferPipeline>,
    /// Lighting pipeline
    pub pbr_pipeline: &'a PbrPipeline,
    /// Shadow ray pipeline
    pub ray_tracing_pipeline: &'a RayTracingPipeline,
    /// Shader binding table of the shadow ray pipeline
    pub shader_binding_table: &'a ShaderBindingTable,
    /// Texture bound to empty material slots
    pub fallback_texture: &'a Arc<Texture>,
    /// Sampler for the shadow image
    pub shadow_sampler: &'a ImageSampler,
    /// Full-screen quad vertices
    pub full_screen_quad: &'a GpuBuffer,
}

/// Per-draw inputs
pub struct FrameInput<'a> {
    /// Acquired swapchain image
    pub image_index: u32,
    /// Camera transform
    pub camera: &'a Transform,
    /// Scene TLAS; without one the shadow image is cleared to fully lit
    pub top_level: Option<vk::AccelerationStructureKHR>,
}

/// Everything a worker task needs to record one G-buffer secondary
#[derive(Clone)]
struct GBufferRecording {
    device: Device,
    pipeline: Arc<GBufferPipeline>,
    fallback_texture: Arc<Texture>,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    view_projection: vk::DescriptorBufferInfo,
    workers: Arc<[Mutex<WorkerPools>]>,
}

impl GBufferRecording {
    /// Record `commands`, which all share one material
    ///
    /// Returns `None` when the worker's descriptor pool is exhausted; the run
    /// is skipped and the rest of the frame still renders.
    fn record(&self, worker: usize, commands: &[RenderCommand]) -> VulkanResult<Option<vk::CommandBuffer>> {
        let Some(first) = commands.first() else {
            return Err(VulkanError::invalid("Empty G-buffer partition"));
        };
        let mut pools = self
            .workers
            .get(worker)
            .ok_or_else(|| VulkanError::invalid(format!("No pools for worker {worker}")))?
            .lock();

        let layouts = [self.pipeline.view_projection_layout(), self.pipeline.material_layout()];
        let (view_projection_set, material_set) = match pools.descriptor_pool.allocate_descriptor_sets(&layouts) {
            Ok(sets) if sets.len() == 2 => (sets[0], sets[1]),
            Ok(_) => return Err(VulkanError::invalid("Descriptor pool returned too few sets")),
            Err(e) => {
                log::warn!("Skipping {} draws: descriptor allocation failed: {}", commands.len(), e);
                return Ok(None);
            }
        };
        let cmd = pools.allocate_secondary()?;
        drop(pools);

        self.pipeline
            .write_view_projection(&self.device, view_projection_set, self.view_projection);
        self.pipeline
            .write_material(&self.device, material_set, &first.material, &self.fallback_texture);

        let mut recorder = CommandRecorder::new(cmd, self.device.clone());
        recorder.begin_secondary(self.render_pass, self.framebuffer)?;
        recorder.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
        recorder.bind_descriptor_sets(
            vk::PipelineBindPoint::GRAPHICS,
            self.pipeline.layout(),
            0,
            &[view_projection_set, material_set],
        );
        recorder.set_viewport(&full_viewport(self.extent));
        recorder.set_scissor(&full_area(self.extent));
        self.pipeline.push_material(&mut recorder, first.material.constant());

        for command in commands {
            self.pipeline.push_transform(&mut recorder, &command.transform);
            recorder.bind_vertex_buffers(0, &[command.mesh.vertex_buffer], &[0]);
            recorder.bind_index_buffer(command.mesh.index_buffer, 0, vk::IndexType::UINT16);
            recorder.draw_indexed(command.mesh.index_count, 1);
        }

        recorder.end().map(Some)
    }
}

/// Resources and recording state of one frame in flight
pub struct RenderFrame {
    device: Device,
    state: FrameState,
    queue: RenderQueue,
    sync: FrameSync,
    _command_pool: CommandPool,
    gbuffer_commands: vk::CommandBuffer,
    shadow_commands: vk::CommandBuffer,
    lighting_commands: vk::CommandBuffer,
    workers: Arc<[Mutex<WorkerPools>]>,
    view_projection: GpuBuffer,
    lighting: GpuBuffer,
    _descriptor_pool: DescriptorPool,
    lighting_set: vk::DescriptorSet,
    ray_tracing_set: vk::DescriptorSet,
    written_top_level: Option<vk::AccelerationStructureKHR>,
    lighting_pass: LightingPass,
    shadow: Image,
    gbuffer: GBufferPass,
}

impl RenderFrame {
    /// Create a frame rendering at `extent` into `swapchain_views`
    pub fn new(
        shared: &SharedResources<'_>,
        swapchain_views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VulkanResult<Self> {
        let ctx = shared.ctx;
        let device = ctx.device().clone();

        let command_pool = CommandPool::new(
            device.clone(),
            ctx.graphics_queue_family(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let primaries = command_pool.allocate_command_buffers(vk::CommandBufferLevel::PRIMARY, 3)?;
        let [gbuffer_commands, shadow_commands, lighting_commands] = primaries[..] else {
            return Err(VulkanError::invalid("Expected three primary command buffers"));
        };

        let workers: Arc<[Mutex<WorkerPools>]> = (0..shared.scheduler.number_of_threads())
            .map(|_| WorkerPools::new(ctx).map(Mutex::new))
            .collect::<VulkanResult<Vec<_>>>()?
            .into();

        let mut view_projection = Self::uniform_buffer(ctx, size_of::<ViewProjection>())?;
        view_projection.write_pod(&ViewProjection::new(
            &Transform::identity(),
            shared.config.field_of_view_degrees,
            1.0,
            shared.config.near_plane,
            shared.config.far_plane,
        ))?;
        let mut lighting = Self::uniform_buffer(ctx, size_of::<LightingData>())?;
        lighting.write_pod(&LightingData::from_camera(&Transform::identity()))?;

        let gbuffer = GBufferPass::new(ctx, shared.gbuffer_render_pass, extent)?;

        let shadow = Image::new(
            ctx,
            ImageDesc::color(
                extent,
                SHADOW_FORMAT,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            ),
        )?;

        let lighting_pass = LightingPass::new(&device, shared.lighting_render_pass, &gbuffer, swapchain_views)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INPUT_ATTACHMENT,
                descriptor_count: gbuffer::LAYER_COUNT as u32,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_IMAGE,
                descriptor_count: 3,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
        ];
        let descriptor_pool = DescriptorPool::new(device.clone(), 2, &pool_sizes)?;
        let lighting_set = descriptor_pool.allocate(shared.pbr_pipeline.set_layout())?;
        let ray_tracing_set = descriptor_pool.allocate(shared.ray_tracing_pipeline.set_layout())?;
        shared
            .pbr_pipeline
            .write_descriptor_set(&device, lighting_set, &gbuffer, &shadow, shared.shadow_sampler, &lighting);

        let sync = FrameSync::new(&device)?;

        Ok(Self {
            device,
            state: FrameState::Idle,
            queue: RenderQueue::new(),
            sync,
            _command_pool: command_pool,
            gbuffer_commands,
            shadow_commands,
            lighting_commands,
            workers,
            view_projection,
            lighting,
            _descriptor_pool: descriptor_pool,
            lighting_set,
            ray_tracing_set,
            written_top_level: None,
            lighting_pass,
            shadow,
            gbuffer,
        })
    }

    /// Record the transitions the frame needs before its first draw
    ///
    /// The shadow image is sampled by the lighting pass, so it starts out
    /// shader-readable. Must be submitted before [`Self::draw`].
    pub fn record_initial_layouts(&mut self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        require_transition(&mut self.shadow, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    fn uniform_buffer(ctx: &VulkanContext, size: usize) -> VulkanResult<GpuBuffer> {
        let mut buffer = GpuBuffer::new(
            ctx,
            size as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.map_all()?;
        Ok(buffer)
    }

    /// Queue a draw for this frame
    pub fn queue_mesh_draw(&mut self, command: RenderCommand) {
        self.queue.push(command);
    }

    /// Record and submit the frame
    ///
    /// The caller must have waited on and reset the in-flight fence and
    /// acquired `input.image_index` with [`Self::image_available`].
    pub fn draw(&mut self, shared: &SharedResources<'_>, input: &FrameInput<'_>) -> VulkanResult<()> {
        self.state = self.state.transition(FrameState::RecordingGBuffer)?;

        let extent = self.gbuffer.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        self.view_projection.write_pod(&ViewProjection::new(
            input.camera,
            shared.config.field_of_view_degrees,
            aspect,
            shared.config.near_plane,
            shared.config.far_plane,
        ))?;
        for worker in self.workers.iter() {
            worker.lock().descriptor_pool.reset()?;
        }

        let secondaries = self.record_gbuffer_secondaries(shared)?;
        self.record_gbuffer(shared, &secondaries)?;

        self.state = self.state.transition(FrameState::RecordingShadow)?;
        self.record_shadow(shared, input.top_level)?;

        self.state = self.state.transition(FrameState::RecordingLighting)?;
        self.lighting.write_pod(&LightingData::from_camera(input.camera))?;
        self.record_lighting(shared, input.image_index)?;

        self.submit(shared.ctx.graphics_queue())?;
        self.state = self.state.transition(FrameState::Submitted)?;

        log::trace!(
            "Submitted frame: {} draws in {} secondaries",
            self.queue.len(),
            secondaries.len()
        );
        Ok(())
    }

    fn record_gbuffer_secondaries(&mut self, shared: &SharedResources<'_>) -> VulkanResult<Vec<vk::CommandBuffer>> {
        self.queue.sort_by_material();
        let partitions = if self.queue.is_empty() {
            Vec::new()
        } else {
            self.queue.partition_by_material()
        };

        let recording = GBufferRecording {
            device: self.device.clone(),
            pipeline: Arc::clone(shared.gbuffer_pipeline),
            fallback_texture: Arc::clone(shared.fallback_texture),
            render_pass: shared.gbuffer_render_pass,
            framebuffer: self.gbuffer.framebuffer(),
            extent: self.gbuffer.extent(),
            view_projection: self.view_projection.descriptor_info(),
            workers: Arc::clone(&self.workers),
        };

        let handles: Vec<TaskHandle<VulkanResult<Option<vk::CommandBuffer>>>> = partitions
            .into_iter()
            .map(|range| {
                let commands = self.queue.commands()[range].to_vec();
                let recording = recording.clone();
                shared
                    .scheduler
                    .enqueue(move |worker| recording.record(worker, &commands))
            })
            .collect();

        // Join every task before reporting a failure so none still holds a pool
        let results: Vec<Option<VulkanResult<Option<vk::CommandBuffer>>>> =
            handles.into_iter().map(TaskHandle::wait).collect();
        let recorded = results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| Err(VulkanError::invalid("G-buffer recording task did not complete")))
            })
            .collect::<VulkanResult<Vec<_>>>()?;
        Ok(recorded.into_iter().flatten().collect())
    }

    fn record_gbuffer(&mut self, shared: &SharedResources<'_>, secondaries: &[vk::CommandBuffer]) -> VulkanResult<()> {
        let mut recorder = CommandRecorder::new(self.gbuffer_commands, self.device.clone());
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        {
            let mut pass = recorder.begin_render_pass(
                shared.gbuffer_render_pass,
                self.gbuffer.framebuffer(),
                full_area(self.gbuffer.extent()),
                &gbuffer::clear_values(),
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            )?;
            pass.execute_commands(secondaries);
        }
        recorder.end()?;
        self.gbuffer.mark_rendered();
        Ok(())
    }

    fn record_shadow(
        &mut self,
        shared: &SharedResources<'_>,
        top_level: Option<vk::AccelerationStructureKHR>,
    ) -> VulkanResult<()> {
        let cmd = self.shadow_commands;
        let extent = self.gbuffer.extent();
        let mut recorder = CommandRecorder::new(cmd, self.device.clone());
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        require_transition(&mut self.shadow, cmd, vk::ImageLayout::GENERAL)?;
        require_transition(self.gbuffer.layer_mut(GBufferLayer::Position), cmd, vk::ImageLayout::GENERAL)?;
        require_transition(self.gbuffer.layer_mut(GBufferLayer::Normal), cmd, vk::ImageLayout::GENERAL)?;

        match top_level {
            Some(tlas) => {
                let pipeline = shared.ray_tracing_pipeline;
                if self.written_top_level != Some(tlas) {
                    pipeline.write_descriptor_set(
                        &self.device,
                        self.ray_tracing_set,
                        tlas,
                        self.shadow.view(),
                        self.gbuffer.layer(GBufferLayer::Position).view(),
                        self.gbuffer.layer(GBufferLayer::Normal).view(),
                    );
                    self.written_top_level = Some(tlas);
                }

                recorder.bind_pipeline(vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.handle());
                recorder.bind_descriptor_sets(
                    vk::PipelineBindPoint::RAY_TRACING_KHR,
                    pipeline.layout(),
                    0,
                    &[self.ray_tracing_set],
                );
                let sbt = shared.shader_binding_table;
                unsafe {
                    shared.ctx.ray_tracing_loader().cmd_trace_rays(
                        cmd,
                        sbt.raygen(),
                        sbt.miss(),
                        sbt.hit(),
                        sbt.callable(),
                        extent.width,
                        extent.height,
                        1,
                    );
                }
            }
            None => self.clear_shadow(cmd),
        }

        require_transition(&mut self.shadow, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        require_transition(
            self.gbuffer.layer_mut(GBufferLayer::Position),
            cmd,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        require_transition(
            self.gbuffer.layer_mut(GBufferLayer::Normal),
            cmd,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        recorder.end()?;
        Ok(())
    }

    /// Fill the shadow image with "fully lit" when there is nothing to trace
    fn clear_shadow(&self, cmd: vk::CommandBuffer) {
        let color = vk::ClearColorValue {
            float32: [1.0, 1.0, 1.0, 1.0],
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device
                .cmd_clear_color_image(cmd, self.shadow.handle(), vk::ImageLayout::GENERAL, &color, &[range]);
        }
    }

    fn record_lighting(&mut self, shared: &SharedResources<'_>, image_index: u32) -> VulkanResult<()> {
        let framebuffer = self.lighting_pass.framebuffer(image_index)?;
        let extent = self.lighting_pass.extent();
        let pipeline = shared.pbr_pipeline;

        let mut recorder = CommandRecorder::new(self.lighting_commands, self.device.clone());
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        {
            let mut pass = recorder.begin_render_pass(
                shared.lighting_render_pass,
                framebuffer,
                full_area(extent),
                &lighting::clear_values(),
                vk::SubpassContents::INLINE,
            )?;
            pass.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline.handle());
            pass.set_viewport(&full_viewport(extent));
            pass.set_scissor(&full_area(extent));
            pass.bind_descriptor_sets(vk::PipelineBindPoint::GRAPHICS, pipeline.layout(), 0, &[self.lighting_set]);
            pass.bind_vertex_buffers(0, &[shared.full_screen_quad.handle()], &[0]);
            pass.draw(FULL_SCREEN_QUAD.len() as u32, 1);
        }
        recorder.end()?;
        Ok(())
    }

    /// One submission, three chained batches; the last signals the fence
    fn submit(&self, queue: vk::Queue) -> VulkanResult<()> {
        let gbuffer_wait = [self.sync.image_available.handle()];
        let gbuffer_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let gbuffer_commands = [self.gbuffer_commands];
        let gbuffer_signal = [self.sync.gbuffer_finished.handle()];

        let shadow_wait = gbuffer_signal;
        let shadow_stages = [vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR];
        let shadow_commands = [self.shadow_commands];
        let shadow_signal = [self.sync.shadow_finished.handle()];

        let lighting_wait = shadow_signal;
        let lighting_stages = [vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let lighting_commands = [self.lighting_commands];
        let lighting_signal = [self.sync.render_finished.handle()];

        let submits = [
            vk::SubmitInfo::builder()
                .wait_semaphores(&gbuffer_wait)
                .wait_dst_stage_mask(&gbuffer_stages)
                .command_buffers(&gbuffer_commands)
                .signal_semaphores(&gbuffer_signal)
                .build(),
            vk::SubmitInfo::builder()
                .wait_semaphores(&shadow_wait)
                .wait_dst_stage_mask(&shadow_stages)
                .command_buffers(&shadow_commands)
                .signal_semaphores(&shadow_signal)
                .build(),
            vk::SubmitInfo::builder()
                .wait_semaphores(&lighting_wait)
                .wait_dst_stage_mask(&lighting_stages)
                .command_buffers(&lighting_commands)
                .signal_semaphores(&lighting_signal)
                .build(),
        ];

        unsafe {
            self.device
                .queue_submit(queue, &submits, self.sync.in_flight.handle())
                .map_err(|e| {
                    log::error!("Frame submission failed: {:?}", e);
                    VulkanError::Api(e)
                })
        }
    }

    /// Submit a frame whose recording failed so its slot stays usable
    ///
    /// Consumes `image_available`, moves the acquired image to the present
    /// layout without drawing and signals `render_finished` and the in-flight
    /// fence, so the caller presents the image as usual. Its contents are
    /// undefined. The queued draws are dropped.
    pub fn submit_skipped(&mut self, queue: vk::Queue, swapchain_image: vk::Image) -> VulkanResult<()> {
        for cmd in [self.gbuffer_commands, self.shadow_commands, self.lighting_commands] {
            unsafe {
                self.device
                    .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                    .map_err(VulkanError::Api)?;
            }
        }
        // Barriers recorded into the discarded buffers never ran
        self.shadow.assume_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        self.gbuffer.mark_rendered();
        self.queue.clear();
        self.state = self.state.transition(FrameState::Idle)?;

        let mut recorder = CommandRecorder::new(self.lighting_commands, self.device.clone());
        recorder.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        recorder.image_barrier(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::ImageMemoryBarrier::builder()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(swapchain_image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .build(),
        );
        recorder.end()?;

        let wait = [self.sync.image_available.handle()];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let commands = [self.lighting_commands];
        let signal = [self.sync.render_finished.handle()];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&commands)
            .signal_semaphores(&signal)
            .build();

        unsafe {
            self.device
                .queue_submit(queue, &[submit], self.sync.in_flight.handle())
                .map_err(|e| {
                    log::error!("Skipped frame submission failed: {:?}", e);
                    VulkanError::Api(e)
                })
        }
    }

    /// Free recorded secondaries, reset worker command pools and empty the queue
    ///
    /// Returns how many secondaries were freed.
    pub fn clear_buffers(&mut self) -> VulkanResult<usize> {
        let freed = release_secondaries(&self.workers[..])?;
        log::trace!("Released {} secondary command buffers", freed);
        self.queue.clear();
        self.state = self.state.transition(FrameState::Idle)?;
        Ok(freed)
    }

    /// Current recording state
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of draws queued for the next [`Self::draw`]
    pub fn queued_draws(&self) -> usize {
        self.queue.len()
    }

    /// Semaphore to pass to swapchain acquire
    pub fn image_available(&self) -> vk::Semaphore {
        self.sync.image_available.handle()
    }

    /// Semaphore presentation waits on
    pub fn render_finished(&self) -> vk::Semaphore {
        self.sync.render_finished.handle()
    }

    /// Fence signaled when the frame's GPU work is done
    pub fn in_flight_fence(&self) -> Arc<Fence> {
        Arc::clone(&self.sync.in_flight)
    }

    /// Render target size
    pub fn extent(&self) -> vk::Extent2D {
        self.gbuffer.extent()
    }
}

impl Drop for RenderFrame {
    fn drop(&mut self) {
        if let Err(e) = self.sync.in_flight.wait_forever() {
            log::error!("Failed to wait for frame before destruction: {}", e);
        }
    }
}

fn require_transition(image: &mut Image, cmd: vk::CommandBuffer, layout: vk::ImageLayout) -> VulkanResult<()> {
    if image.transition(cmd, layout) {
        Ok(())
    } else {
        Err(VulkanError::invalid(format!(
            "Cannot transition image from {:?} to {:?}",
            image.layout(),
            layout
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Mat4;
    use crate::render::{Material, MeshRef};

    fn mesh() -> MeshRef {
        MeshRef {
            vertex_buffer: vk::Buffer::null(),
            index_buffer: vk::Buffer::null(),
            vertex_address: 0,
            index_address: 0,
            vertex_count: 3,
            index_count: 3,
        }
    }

    #[derive(Default)]
    struct CountingPool {
        outstanding: usize,
        freed: usize,
        resets: usize,
    }

    impl CountingPool {
        fn record(&mut self, count: usize) {
            self.outstanding += count;
        }
    }

    impl SecondaryPool for CountingPool {
        fn recorded(&self) -> usize {
            self.outstanding
        }

        fn release(&mut self) -> VulkanResult<()> {
            self.freed += self.outstanding;
            self.outstanding = 0;
            self.resets += 1;
            Ok(())
        }
    }

    #[test]
    fn test_forward_transitions_are_legal() {
        let mut state = FrameState::Idle;
        for next in [
            FrameState::RecordingGBuffer,
            FrameState::RecordingShadow,
            FrameState::RecordingLighting,
            FrameState::Submitted,
            FrameState::Idle,
        ] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, FrameState::Idle);
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        assert!(FrameState::Idle.transition(FrameState::RecordingShadow).is_err());
        assert!(FrameState::RecordingGBuffer.transition(FrameState::Submitted).is_err());
        assert!(FrameState::Submitted.transition(FrameState::RecordingGBuffer).is_err());
        assert!(matches!(
            FrameState::Idle.transition(FrameState::Idle),
            Ok(FrameState::Idle)
        ));
    }

    #[test]
    fn test_any_stage_can_reset_to_idle() {
        for state in [
            FrameState::RecordingGBuffer,
            FrameState::RecordingShadow,
            FrameState::RecordingLighting,
            FrameState::Submitted,
        ] {
            assert_eq!(state.transition(FrameState::Idle).unwrap(), FrameState::Idle);
        }
    }

    #[test]
    fn test_worker_pool_fits_many_distinct_materials() {
        let materials: Vec<Arc<Material>> = (0..100).map(|_| Arc::new(Material::new())).collect();
        let mut queue = RenderQueue::new();
        for material in &materials {
            queue.push(RenderCommand::new(mesh(), Arc::clone(material), Mat4::identity()));
            queue.push(RenderCommand::new(mesh(), Arc::clone(material), Mat4::identity()));
        }
        queue.sort_by_material();
        let runs = queue.partition_by_material().len() as u32;
        assert_eq!(runs, 100);

        // Worst case: one worker records every run
        assert!(runs <= WORKER_MAX_RUNS);
        assert!(2 * runs <= WORKER_MAX_SETS);
        let [uniforms, samplers] = worker_pool_sizes(WORKER_MAX_RUNS);
        assert_eq!(uniforms.ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(runs <= uniforms.descriptor_count);
        assert_eq!(samplers.ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert!(runs * TextureSlot::ALL.len() as u32 <= samplers.descriptor_count);
    }

    #[test]
    fn test_worker_pool_samplers_scale_with_texture_slots() {
        let [uniforms, samplers] = worker_pool_sizes(3);
        assert_eq!(uniforms.descriptor_count, 3);
        assert_eq!(samplers.descriptor_count, 12);
        assert_eq!(WORKER_MAX_SETS, 2 * WORKER_MAX_RUNS);
    }

    #[test]
    fn test_release_returns_every_secondary() {
        let pools: Vec<Mutex<CountingPool>> = (0..4).map(|_| Mutex::new(CountingPool::default())).collect();
        pools[0].lock().record(3);
        pools[2].lock().record(2);

        assert_eq!(release_secondaries(&pools).unwrap(), 5);
        for pool in &pools {
            let pool = pool.lock();
            assert_eq!(pool.recorded(), 0);
            assert_eq!(pool.resets, 1);
        }
        assert_eq!(pools[0].lock().freed, 3);

        // A second round trip starts from empty pools
        pools[1].lock().record(1);
        assert_eq!(release_secondaries(&pools).unwrap(), 1);
        assert_eq!(release_secondaries(&pools).unwrap(), 0);
    }
}
