//! Per-frame submission order
//!
//! [`draw_frame`] owns the order of one frame: wait for the slot's fence,
//! acquire an image, reset the fence, release the slot's old recordings,
//! record and submit, present, advance. The GPU-facing steps sit behind
//! [`FrameSubmitter`] so the ordering runs the same against a device or a
//! test double.
//!
//! Failures inside a frame are logged and the frame is dropped. Only a lost
//! device is returned as an error.

use crate::render::vulkan::sync::{FramePacer, InFlightFence};
use crate::render::vulkan::VulkanResult;

/// The device-facing steps of drawing one frame
pub trait FrameSubmitter {
    /// Acquire a swapchain image, signaling `slot`'s acquire semaphore
    fn acquire(&mut self, slot: usize) -> VulkanResult<u32>;

    /// Drop the draws queued for this frame
    fn discard_pending(&mut self);

    /// Release what `slot` recorded last time; returns secondaries freed
    fn clear_buffers(&mut self, slot: usize) -> VulkanResult<usize>;

    /// Record the queued draws into `slot` and submit them, signaling its fence
    fn record_and_submit(&mut self, slot: usize, image: u32) -> VulkanResult<()>;

    /// Submit nothing but the semaphore wait and fence signal for `slot`
    ///
    /// Leaves `image` presentable so [`Self::present`] can hand it back.
    fn submit_skipped(&mut self, slot: usize, image: u32) -> VulkanResult<()>;

    /// Present `image`; `Ok(false)` when the swapchain is out of date
    fn present(&mut self, slot: usize, image: u32) -> VulkanResult<bool>;
}

/// Draw one frame on the pacer's current slot
///
/// Returns `Ok(true)` when the queued draws reached the screen and
/// `Ok(false)` when the frame was dropped. A dropped frame still leaves its
/// slot signaled and every acquired image presented.
pub fn draw_frame<F, S>(pacer: &mut FramePacer<F>, submitter: &mut S) -> VulkanResult<bool>
where
    F: InFlightFence,
    S: FrameSubmitter,
{
    pacer.wait_current()?;
    let slot = pacer.current();

    let image = match submitter.acquire(slot) {
        Ok(image) => image,
        Err(e) if e.is_device_lost() => return Err(e),
        Err(e) => {
            log::error!("Failed to acquire swapchain image: {}", e);
            submitter.discard_pending();
            return Ok(false);
        }
    };

    pacer.reset_current()?;
    let recorded = submitter.clear_buffers(slot).and_then(|freed| {
        log::trace!("Frame {} released {} secondaries", slot, freed);
        submitter.record_and_submit(slot, image)
    });
    let dropped = match recorded {
        Ok(()) => false,
        Err(e) if e.is_device_lost() => return Err(e),
        Err(e) => {
            log::error!("Dropping frame {}: {}", slot, e);
            submitter.discard_pending();
            submitter.submit_skipped(slot, image)?;
            true
        }
    };

    // The slot's fence is pending either way, so the pacer moves on first
    let presented = submitter.present(slot, image);
    pacer.advance();
    Ok(presented? && !dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::vulkan::sync::mock::MockFence;
    use crate::render::vulkan::VulkanError;
    use ash::vk;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Step {
        Acquire(usize),
        Discard,
        Clear(usize),
        Submit(usize, u32),
        Skip(usize, u32),
        Present(usize, u32),
    }

    /// Completes every submission immediately
    struct InstantGpu {
        fences: Vec<MockFence>,
        steps: Vec<Step>,
        pending: usize,
        next_image: u32,
        acquire_error: Option<VulkanError>,
        record_error: Option<VulkanError>,
    }

    impl InstantGpu {
        fn new(fences: &[MockFence]) -> Self {
            Self {
                fences: fences.to_vec(),
                steps: Vec::new(),
                pending: 0,
                next_image: 0,
                acquire_error: None,
                record_error: None,
            }
        }
    }

    impl FrameSubmitter for InstantGpu {
        fn acquire(&mut self, slot: usize) -> VulkanResult<u32> {
            self.steps.push(Step::Acquire(slot));
            if let Some(e) = self.acquire_error.take() {
                return Err(e);
            }
            let image = self.next_image;
            self.next_image = (self.next_image + 1) % 3;
            Ok(image)
        }

        fn discard_pending(&mut self) {
            self.steps.push(Step::Discard);
            self.pending = 0;
        }

        fn clear_buffers(&mut self, slot: usize) -> VulkanResult<usize> {
            self.steps.push(Step::Clear(slot));
            Ok(0)
        }

        fn record_and_submit(&mut self, slot: usize, image: u32) -> VulkanResult<()> {
            if let Some(e) = self.record_error.take() {
                return Err(e);
            }
            self.steps.push(Step::Submit(slot, image));
            self.pending = 0;
            self.fences[slot].signal();
            Ok(())
        }

        fn submit_skipped(&mut self, slot: usize, image: u32) -> VulkanResult<()> {
            self.steps.push(Step::Skip(slot, image));
            self.fences[slot].signal();
            Ok(())
        }

        fn present(&mut self, slot: usize, image: u32) -> VulkanResult<bool> {
            self.steps.push(Step::Present(slot, image));
            Ok(true)
        }
    }

    fn setup() -> (Vec<MockFence>, FramePacer<MockFence>, InstantGpu) {
        let fences = vec![MockFence::signaled(), MockFence::signaled()];
        let pacer = FramePacer::new(fences.clone()).unwrap();
        let gpu = InstantGpu::new(&fences);
        (fences, pacer, gpu)
    }

    #[test]
    fn test_frame_runs_in_order_and_advances() {
        let (fences, mut pacer, mut gpu) = setup();

        assert!(draw_frame(&mut pacer, &mut gpu).unwrap());
        assert_eq!(
            gpu.steps,
            vec![Step::Acquire(0), Step::Clear(0), Step::Submit(0, 0), Step::Present(0, 0)]
        );
        assert_eq!(pacer.current(), 1);
        assert!(fences[0].is_signaled());
    }

    #[test]
    fn test_failed_acquire_leaves_slot_untouched() {
        let (fences, mut pacer, mut gpu) = setup();
        gpu.pending = 4;
        gpu.acquire_error = Some(VulkanError::SwapchainOutOfDate);

        assert!(!draw_frame(&mut pacer, &mut gpu).unwrap());
        assert_eq!(gpu.steps, vec![Step::Acquire(0), Step::Discard]);
        assert_eq!(gpu.pending, 0);
        assert_eq!(pacer.current(), 0);
        assert!(fences[0].is_signaled(), "fence reset without a submit");

        assert!(draw_frame(&mut pacer, &mut gpu).unwrap());
        assert_eq!(pacer.current(), 1);
    }

    #[test]
    fn test_failed_recording_presents_a_skipped_frame() {
        let (fences, mut pacer, mut gpu) = setup();
        gpu.pending = 2;
        gpu.record_error = Some(VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY));

        assert!(!draw_frame(&mut pacer, &mut gpu).unwrap());
        assert_eq!(
            gpu.steps,
            vec![
                Step::Acquire(0),
                Step::Clear(0),
                Step::Discard,
                Step::Skip(0, 0),
                Step::Present(0, 0),
            ]
        );
        assert_eq!(gpu.pending, 0);
        assert!(fences[0].is_signaled());
        assert_eq!(pacer.current(), 1);

        // Both slots keep working, including the one that dropped a frame
        gpu.steps.clear();
        assert!(draw_frame(&mut pacer, &mut gpu).unwrap());
        assert!(draw_frame(&mut pacer, &mut gpu).unwrap());
        assert_eq!(gpu.steps[2], Step::Submit(1, 1));
        assert_eq!(gpu.steps[6], Step::Submit(0, 2));
    }

    #[test]
    fn test_device_loss_is_returned() {
        let (_, mut pacer, mut gpu) = setup();
        gpu.record_error = Some(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));

        let err = draw_frame(&mut pacer, &mut gpu).unwrap_err();
        assert!(err.is_device_lost());
        assert!(!gpu.steps.iter().any(|step| matches!(step, Step::Skip(..) | Step::Present(..))));

        gpu.acquire_error = Some(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST));
        let mut pacer = FramePacer::new(vec![MockFence::signaled()]).unwrap();
        assert!(draw_frame(&mut pacer, &mut gpu).unwrap_err().is_device_lost());
    }

    #[test]
    fn test_out_of_date_present_still_advances() {
        struct OutOfDate(InstantGpu);

        impl FrameSubmitter for OutOfDate {
            fn acquire(&mut self, slot: usize) -> VulkanResult<u32> {
                self.0.acquire(slot)
            }
            fn discard_pending(&mut self) {
                self.0.discard_pending()
            }
            fn clear_buffers(&mut self, slot: usize) -> VulkanResult<usize> {
                self.0.clear_buffers(slot)
            }
            fn record_and_submit(&mut self, slot: usize, image: u32) -> VulkanResult<()> {
                self.0.record_and_submit(slot, image)
            }
            fn submit_skipped(&mut self, slot: usize, image: u32) -> VulkanResult<()> {
                self.0.submit_skipped(slot, image)
            }
            fn present(&mut self, _slot: usize, _image: u32) -> VulkanResult<bool> {
                Ok(false)
            }
        }

        let (_, mut pacer, gpu) = setup();
        let mut gpu = OutOfDate(gpu);
        assert!(!draw_frame(&mut pacer, &mut gpu).unwrap());
        assert_eq!(pacer.current(), 1);
    }
}
