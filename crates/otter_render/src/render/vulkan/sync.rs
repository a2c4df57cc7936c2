//! Vulkan synchronization primitives for GPU/CPU coordination
//!
//! RAII wrappers for semaphores and fences, the per-frame set of sync
//! objects, and the pacer that decides which frame slot may be reused.
//!
//! ## Frame chain
//!
//! ```text
//! acquire ──image_available──▶ G-buffer ──gbuffer_finished──▶ shadow rays
//!         ──shadow_finished──▶ lighting ──render_finished──▶ present
//!                                       └─ in_flight fence (CPU waits here)
//! ```

use ash::{vk, Device};
use std::sync::Arc;

use crate::render::vulkan::{VulkanError, VulkanResult};

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new binary semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe { device.create_semaphore(&create_info, None).map_err(VulkanError::Api)? };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// CPU-visible completion signal for a frame slot
pub trait InFlightFence {
    /// Block until the fence is signaled
    fn wait_forever(&self) -> VulkanResult<()>;

    /// Return the fence to the unsignaled state
    fn reset(&self) -> VulkanResult<()>;
}

/// Fence wrapper with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe { device.create_fence(&create_info, None).map_err(VulkanError::Api)? };

        Ok(Self { device, fence })
    }

    /// Wait for fence
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, timeout)
                .map_err(VulkanError::Api)
        }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl InFlightFence for Fence {
    fn wait_forever(&self) -> VulkanResult<()> {
        self.wait(u64::MAX)
    }

    fn reset(&self) -> VulkanResult<()> {
        unsafe { self.device.reset_fences(&[self.fence]).map_err(VulkanError::Api) }
    }
}

impl<T: InFlightFence> InFlightFence for Arc<T> {
    fn wait_forever(&self) -> VulkanResult<()> {
        (**self).wait_forever()
    }

    fn reset(&self) -> VulkanResult<()> {
        (**self).reset()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Sync objects for one frame in flight
///
/// The semaphores chain the frame's three submissions; the fence is signaled
/// by the last one and shared with the [`FramePacer`].
pub struct FrameSync {
    /// Signaled by swapchain acquire
    pub image_available: Semaphore,
    /// Signaled when the G-buffer pass finishes
    pub gbuffer_finished: Semaphore,
    /// Signaled when shadow rays finish
    pub shadow_finished: Semaphore,
    /// Signaled when lighting finishes; presentation waits on it
    pub render_finished: Semaphore,
    /// Signaled when the whole frame has finished on the GPU (created signaled)
    pub in_flight: Arc<Fence>,
}

impl FrameSync {
    /// Create frame synchronization objects
    pub fn new(device: &Device) -> VulkanResult<Self> {
        Ok(Self {
            image_available: Semaphore::new(device.clone())?,
            gbuffer_finished: Semaphore::new(device.clone())?,
            shadow_finished: Semaphore::new(device.clone())?,
            render_finished: Semaphore::new(device.clone())?,
            in_flight: Arc::new(Fence::new(device.clone(), true)?),
        })
    }
}

/// Round-robin frame slot selection gated on per-slot fences
///
/// A slot is only handed out again after `wait_current` has observed its
/// fence signaled. Fences start signaled so the first pass over the slots
/// does not block.
pub struct FramePacer<F: InFlightFence> {
    fences: Vec<F>,
    current: usize,
}

impl<F: InFlightFence> FramePacer<F> {
    /// Pace over one fence per frame slot
    pub fn new(fences: Vec<F>) -> VulkanResult<Self> {
        if fences.is_empty() {
            return Err(VulkanError::invalid("At least one frame in flight is required"));
        }
        Ok(Self { fences, current: 0 })
    }

    /// Index of the slot being prepared
    pub fn current(&self) -> usize {
        self.current
    }

    /// Number of slots
    pub fn frames_in_flight(&self) -> usize {
        self.fences.len()
    }

    /// Block until the GPU is done with the current slot
    pub fn wait_current(&self) -> VulkanResult<()> {
        self.fences[self.current].wait_forever()
    }

    /// Unsignal the current slot's fence ahead of submitting new work
    pub fn reset_current(&self) -> VulkanResult<()> {
        self.fences[self.current].reset()
    }

    /// Move to the next slot
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.fences.len();
    }

    /// Wait for every slot's fence
    pub fn wait_all(&self) -> VulkanResult<()> {
        self.fences.iter().try_for_each(InFlightFence::wait_forever)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::{Condvar, Mutex};

    /// Fence signaled from test code instead of a GPU
    #[derive(Clone, Default)]
    pub struct MockFence {
        state: Arc<(Mutex<bool>, Condvar)>,
    }

    impl MockFence {
        pub fn signaled() -> Self {
            let fence = Self::default();
            fence.signal();
            fence
        }

        pub fn signal(&self) {
            let (lock, condvar) = &*self.state;
            *lock.lock() = true;
            condvar.notify_all();
        }

        pub fn is_signaled(&self) -> bool {
            *self.state.0.lock()
        }
    }

    impl InFlightFence for MockFence {
        fn wait_forever(&self) -> VulkanResult<()> {
            let (lock, condvar) = &*self.state;
            let mut signaled = lock.lock();
            while !*signaled {
                condvar.wait(&mut signaled);
            }
            Ok(())
        }

        fn reset(&self) -> VulkanResult<()> {
            *self.state.0.lock() = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockFence;
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_pacer_requires_a_slot() {
        assert!(FramePacer::<MockFence>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_pacer_round_robins() {
        let mut pacer = FramePacer::new(vec![MockFence::signaled(), MockFence::signaled()]).unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            pacer.wait_current().unwrap();
            seen.push(pacer.current());
            pacer.advance();
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_slot_is_not_reused_before_its_fence_signals() {
        let fences = vec![MockFence::signaled(), MockFence::signaled()];
        let gpu = fences.clone();
        let mut pacer = FramePacer::new(fences).unwrap();

        // Submit to both slots; neither completes yet
        for _ in 0..2 {
            pacer.wait_current().unwrap();
            pacer.reset_current().unwrap();
            pacer.advance();
        }
        assert_eq!(pacer.current(), 0);
        assert!(!gpu[0].is_signaled());

        let (tx, rx) = mpsc::channel();
        let waiter = std::thread::spawn(move || {
            pacer.wait_current().unwrap();
            tx.send(pacer.current()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "slot 0 handed out early");

        gpu[1].signal();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "wrong fence released slot 0");

        gpu[0].signal();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_all_returns_once_everything_signaled() {
        let fences = vec![MockFence::signaled(), MockFence::signaled(), MockFence::signaled()];
        let pacer = FramePacer::new(fences).unwrap();
        assert_eq!(pacer.frames_in_flight(), 3);
        pacer.wait_all().unwrap();
    }
}
