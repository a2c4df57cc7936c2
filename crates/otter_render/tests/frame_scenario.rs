//! Two frames in flight driven without a GPU
//!
//! `draw_frame` runs against a simulated device. A background thread plays
//! the GPU and signals each submitted frame's fence after a short delay.
//! The simulation checks the contracts a real device enforces: a slot is
//! not reused before its fence signals, every acquire semaphore is waited
//! on exactly once and every acquired image is presented.

use ash::vk;
use otter_render::core::config::SchedulerConfig;
use otter_render::foundation::math::{Transform, Vec3};
use otter_render::render::mesh::MeshRef;
use otter_render::render::render_queue::{RenderCommand, RenderQueue};
use otter_render::render::vulkan::acceleration_structure::{plan_batches, BuildSize};
use otter_render::render::vulkan::frame_loop::{draw_frame, FrameSubmitter};
use otter_render::render::vulkan::render_frame::{release_secondaries, SecondaryPool};
use otter_render::render::vulkan::render_instance::StaticSceneLatch;
use otter_render::render::vulkan::sync::{FramePacer, InFlightFence};
use otter_render::render::vulkan::{VulkanError, VulkanResult};
use otter_render::render::Material;
use otter_render::scheduler::TaskScheduler;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const FRAMES: usize = 2;
const SWAPCHAIN_IMAGES: u32 = 3;

#[derive(Clone, Default)]
struct SimulatedFence {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl SimulatedFence {
    fn signaled() -> Self {
        let fence = Self::default();
        fence.signal();
        fence
    }

    fn signal(&self) {
        *self.state.0.lock() = true;
        self.state.1.notify_all();
    }

    fn is_signaled(&self) -> bool {
        *self.state.0.lock()
    }
}

impl InFlightFence for SimulatedFence {
    fn wait_forever(&self) -> VulkanResult<()> {
        let mut signaled = self.state.0.lock();
        while !*signaled {
            self.state.1.wait(&mut signaled);
        }
        Ok(())
    }

    fn reset(&self) -> VulkanResult<()> {
        *self.state.0.lock() = false;
        Ok(())
    }
}

#[derive(Default)]
struct SimulatedPool {
    recorded: usize,
}

impl SecondaryPool for SimulatedPool {
    fn recorded(&self) -> usize {
        self.recorded
    }

    fn release(&mut self) -> VulkanResult<()> {
        self.recorded = 0;
        Ok(())
    }
}

/// Device side of the renderer, with submissions handed to a GPU thread
struct SimulatedDevice {
    scheduler: TaskScheduler,
    fences: Vec<SimulatedFence>,
    pools: Vec<Arc<[Mutex<SimulatedPool>]>>,
    image_available: Vec<bool>,
    held_images: HashSet<u32>,
    next_image: u32,
    pending: RenderQueue,
    latch: StaticSceneLatch,
    builds: usize,
    submits: usize,
    skipped: usize,
    freed: Vec<usize>,
    fail_next_recording: bool,
    gpu: mpsc::Sender<SimulatedFence>,
}

impl SimulatedDevice {
    fn new(fences: &[SimulatedFence], gpu: mpsc::Sender<SimulatedFence>) -> Self {
        let scheduler = TaskScheduler::new(&SchedulerConfig {
            worker_threads: 4,
            shutdown_timeout_secs: 5,
        })
        .unwrap();
        let pools = (0..fences.len())
            .map(|_| {
                (0..scheduler.number_of_threads())
                    .map(|_| Mutex::new(SimulatedPool::default()))
                    .collect::<Vec<_>>()
                    .into()
            })
            .collect();
        Self {
            scheduler,
            fences: fences.to_vec(),
            pools,
            image_available: vec![false; fences.len()],
            held_images: HashSet::new(),
            next_image: 0,
            pending: RenderQueue::new(),
            latch: StaticSceneLatch::default(),
            builds: 0,
            submits: 0,
            skipped: 0,
            freed: Vec::new(),
            fail_next_recording: false,
            gpu,
        }
    }

    /// Hand the slot to the GPU, consuming its acquire semaphore
    fn queue_submit(&mut self, slot: usize) {
        assert!(self.image_available[slot], "slot {slot} submitted without waiting on an acquire");
        self.image_available[slot] = false;
        assert!(!self.fences[slot].is_signaled(), "slot {slot} submitted with a signaled fence");
        self.gpu.send(self.fences[slot].clone()).unwrap();
    }
}

impl FrameSubmitter for SimulatedDevice {
    fn acquire(&mut self, slot: usize) -> VulkanResult<u32> {
        assert!(self.fences[slot].is_signaled(), "slot {slot} handed out before its fence signaled");
        assert!(!self.image_available[slot], "acquire semaphore of slot {slot} is still signaled");
        self.image_available[slot] = true;

        let image = self.next_image;
        self.next_image = (self.next_image + 1) % SWAPCHAIN_IMAGES;
        assert!(self.held_images.insert(image), "image {image} acquired twice");
        Ok(image)
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
    }

    fn clear_buffers(&mut self, slot: usize) -> VulkanResult<usize> {
        let freed = release_secondaries(&self.pools[slot][..])?;
        self.freed.push(freed);
        Ok(freed)
    }

    fn record_and_submit(&mut self, slot: usize, _image: u32) -> VulkanResult<()> {
        let mut queue = std::mem::take(&mut self.pending);
        if self.latch.needs_build(queue.len()) {
            let sizes: Vec<BuildSize> = queue
                .commands()
                .iter()
                .map(|c| BuildSize {
                    acceleration_structure_size: u64::from(c.mesh.triangle_count()) * 64,
                    build_scratch_size: 128,
                })
                .collect();
            let batches = plan_batches(&sizes, 1 << 20, 128 * 16, 256);
            assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), queue.len());
            self.latch.mark_built();
            self.builds += 1;
        }

        queue.sort_by_material();
        let handles: Vec<_> = queue
            .partition_by_material()
            .into_iter()
            .map(|range| {
                let slot_pools = Arc::clone(&self.pools[slot]);
                let draws = range.len();
                self.scheduler.enqueue(move |worker| {
                    slot_pools[worker].lock().recorded += 1;
                    draws
                })
            })
            .collect();
        let recorded_draws: usize = handles.into_iter().map(|h| h.wait().unwrap()).sum();
        assert_eq!(recorded_draws, queue.len(), "recording lost commands");

        if std::mem::take(&mut self.fail_next_recording) {
            return Err(VulkanError::invalid("Shadow image in an unexpected layout"));
        }
        self.queue_submit(slot);
        self.submits += 1;
        Ok(())
    }

    fn submit_skipped(&mut self, slot: usize, _image: u32) -> VulkanResult<()> {
        self.queue_submit(slot);
        self.skipped += 1;
        Ok(())
    }

    fn present(&mut self, slot: usize, image: u32) -> VulkanResult<bool> {
        assert!(!self.image_available[slot]);
        assert!(self.held_images.remove(&image), "image {image} presented without an acquire");
        Ok(true)
    }
}

fn mesh(index_count: u32) -> MeshRef {
    MeshRef {
        vertex_buffer: vk::Buffer::null(),
        index_buffer: vk::Buffer::null(),
        vertex_address: 0,
        index_address: 0,
        vertex_count: 24,
        index_count,
    }
}

fn queue_scene(queue: &mut RenderQueue, cube: &Arc<Material>, ground: &Arc<Material>) {
    for x in 0..3 {
        let transform = Transform::from_position(Vec3::new(x as f32 * 2.0, 0.5, 0.0)).to_matrix();
        queue.push(RenderCommand::new(mesh(36), Arc::clone(cube), transform));
    }
    queue.push(RenderCommand::new(mesh(6), Arc::clone(ground), Transform::identity().to_matrix()));
}

fn spawn_gpu() -> (mpsc::Sender<SimulatedFence>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<SimulatedFence>();
    let gpu = thread::spawn(move || {
        for fence in rx {
            thread::sleep(Duration::from_millis(5));
            fence.signal();
        }
    });
    (tx, gpu)
}

#[test]
fn two_frames_in_flight_reuse_slots_only_after_signal() {
    const DRAWS: usize = 6;

    let fences: Vec<SimulatedFence> = (0..FRAMES).map(|_| SimulatedFence::signaled()).collect();
    let mut pacer = FramePacer::new(fences.clone()).unwrap();
    let (gpu_tx, gpu) = spawn_gpu();
    let mut device = SimulatedDevice::new(&fences, gpu_tx);

    let cube = Arc::new(Material::new().with_color(0.8, 0.2, 0.2, 1.0));
    let ground = Arc::new(Material::new().with_roughness(0.9));

    for draw in 0..DRAWS {
        queue_scene(&mut device.pending, &cube, &ground);
        assert!(draw_frame(&mut pacer, &mut device).unwrap(), "draw {draw} was dropped");
        assert_eq!(pacer.current(), (draw + 1) % FRAMES);
    }

    pacer.wait_all().unwrap();
    assert_eq!(device.builds, 1);
    assert!(device.latch.is_built());
    assert_eq!(device.submits, DRAWS);
    assert!(device.held_images.is_empty());
    // Two materials per draw; each slot frees its previous draw's secondaries
    assert_eq!(device.freed, vec![0, 0, 2, 2, 2, 2]);

    drop(device);
    gpu.join().unwrap();
}

#[test]
fn failed_recording_drops_one_frame_and_keeps_the_slot() {
    const DRAWS: usize = 6;
    const FAILING: usize = 2;

    let fences: Vec<SimulatedFence> = (0..FRAMES).map(|_| SimulatedFence::signaled()).collect();
    let mut pacer = FramePacer::new(fences.clone()).unwrap();
    let (gpu_tx, gpu) = spawn_gpu();
    let mut device = SimulatedDevice::new(&fences, gpu_tx);

    let cube = Arc::new(Material::new());
    let ground = Arc::new(Material::new().with_roughness(0.9));

    let mut presented = Vec::new();
    for draw in 0..DRAWS {
        queue_scene(&mut device.pending, &cube, &ground);
        device.fail_next_recording = draw == FAILING;
        presented.push(draw_frame(&mut pacer, &mut device).unwrap());
        assert!(device.pending.is_empty(), "draw {draw} left commands queued");
        assert_eq!(pacer.current(), (draw + 1) % FRAMES);
    }

    assert_eq!(presented, vec![true, true, false, true, true, true]);
    pacer.wait_all().unwrap();
    assert_eq!(device.submits, DRAWS - 1);
    assert_eq!(device.skipped, 1);
    assert!(device.held_images.is_empty(), "an acquired image was never presented");
    assert!(device.image_available.iter().all(|signaled| !signaled));
    // The dropped frame's secondaries are freed on the slot's next use
    assert_eq!(device.freed[FAILING + FRAMES], 2);

    for slot_pools in &device.pools {
        release_secondaries(&slot_pools[..]).unwrap();
        assert!(slot_pools.iter().all(|pool| pool.lock().recorded() == 0));
    }

    drop(device);
    gpu.join().unwrap();
}
