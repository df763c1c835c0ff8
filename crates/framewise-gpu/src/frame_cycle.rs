//! Swapchain frame cycle.
//!
//! [`FrameCycle`] is the per-frame state machine
//! `Idle -> Acquiring -> FramePrepared -> Submitted -> Idle` that sequences
//! slot fences, image acquisition, the per-image upload buffer, submission,
//! presentation and swapchain recreation. The GPU side sits behind
//! [`FramePlatform`]; [`crate::presenter::VulkanPresenter`] is the Vulkan
//! implementation.
//!
//! Swapchain staleness (out of date, suboptimal, or a target extent that no
//! longer matches) never surfaces as an error: the cycle tears down and
//! recreates the image-dependent resources and carries on.

use crate::error::{GpuError, Result};
use framewise_core::{Extent, FrameSlot};

/// Phase of the frame currently being built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FramePhase {
    /// No frame prepared; `prep_next_frame` is next.
    Idle,
    /// Waiting on the slot fence or acquiring an image.
    Acquiring,
    /// An image is selected and the upload buffer is open.
    FramePrepared,
    /// Work submitted; presentation pending.
    Submitted,
}

/// Result of asking the presentation engine for an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired. A suboptimal image is still usable.
    Image { index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface; nothing was acquired.
    OutOfDate,
}

/// Result of presenting an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented or dropped, but the swapchain must be recreated.
    Stale,
}

/// Image-dependent state reported by the platform after (re)creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainInfo {
    /// Actual extent of the swapchain images.
    pub extent: Extent,
    /// Number of presentable images.
    pub image_count: usize,
}

/// GPU-side operations the frame cycle sequences.
pub trait FramePlatform {
    /// Current swapchain state.
    fn swapchain_info(&self) -> SwapchainInfo;

    /// Block until the slot's in-flight fence is signaled.
    fn wait_slot(&mut self, slot: FrameSlot) -> Result<()>;

    /// Reset the slot's fence ahead of a submission.
    fn reset_slot(&mut self, slot: FrameSlot) -> Result<()>;

    /// Acquire the next image, signaling the slot's image-available semaphore.
    fn acquire(&mut self, slot: FrameSlot) -> Result<AcquireOutcome>;

    /// Open the per-image upload command buffer.
    fn begin_upload(&mut self, image: u32) -> Result<()>;

    /// Close the per-image upload command buffer.
    fn end_upload(&mut self, image: u32) -> Result<()>;

    /// Submit the image's upload and primary buffers as one batch guarded by
    /// the slot's semaphores and fence.
    fn submit(&mut self, slot: FrameSlot, image: u32) -> Result<()>;

    /// Present the image once the slot's render-finished semaphore signals.
    fn present(&mut self, slot: FrameSlot, image: u32) -> Result<PresentOutcome>;

    /// Wait for the device to go idle, then rebuild every image-dependent
    /// resource for `extent`.
    fn recreate(&mut self, extent: Extent) -> Result<SwapchainInfo>;

    /// Block until all submitted work has completed.
    fn wait_idle(&mut self) -> Result<()>;
}

/// A frame slot whose in-flight fence has been observed signaled.
///
/// Everything the GPU last read from this slot's resources has completed, so
/// they may be rewritten or destroyed. Obtained from
/// [`FrameCycle::prep_next_frame`] and valid until the matching
/// [`FrameCycle::swap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FencedSlot(FrameSlot);

impl FencedSlot {
    /// Wrap a slot whose fence the caller has waited on.
    ///
    /// # Safety
    /// The caller must have observed the slot's in-flight fence signaled with
    /// no submission for that slot since.
    pub const unsafe fn assume_signaled(slot: FrameSlot) -> Self {
        Self(slot)
    }

    /// The underlying slot.
    pub const fn slot(self) -> FrameSlot {
        self.0
    }

    /// Raw slot index.
    pub const fn index(self) -> usize {
        self.0.index()
    }
}

/// A frame ready for recording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreparedFrame {
    /// Fenced slot for resource updates.
    pub slot: FencedSlot,
    /// Acquired swapchain image.
    pub image_index: u32,
    /// Swapchain generation the image index belongs to.
    pub generation: u64,
    /// Extent of the swapchain images.
    pub extent: Extent,
    /// Monotonic frame counter.
    pub frame_number: u64,
}

/// Frame pipelining state machine over a [`FramePlatform`].
pub struct FrameCycle<P: FramePlatform> {
    platform: P,
    frames_in_flight: usize,
    slot: FrameSlot,
    phase: FramePhase,
    image: Option<u32>,
    upload_open: bool,
    /// Slot whose submission last used each image.
    images_in_flight: Vec<Option<FrameSlot>>,
    swapchain: SwapchainInfo,
    requested_extent: Extent,
    recreate_pending: bool,
    generation: u64,
    frame_number: u64,
}

impl<P: FramePlatform> FrameCycle<P> {
    /// Create a cycle over an already initialized platform.
    pub fn new(platform: P, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(framewise_core::Error::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            )
            .into());
        }

        let swapchain = platform.swapchain_info();
        Ok(Self {
            platform,
            frames_in_flight,
            slot: FrameSlot::ZERO,
            phase: FramePhase::Idle,
            image: None,
            upload_open: false,
            images_in_flight: vec![None; swapchain.image_count],
            swapchain,
            requested_extent: swapchain.extent,
            recreate_pending: false,
            generation: 0,
            frame_number: 0,
        })
    }

    /// Wait for the current slot, acquire an image and open its upload buffer.
    ///
    /// Returns `None` without touching the GPU while `target_extent` is
    /// empty; the swapchain is recreated once a non-empty extent arrives.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn prep_next_frame(&mut self, target_extent: Extent) -> Result<Option<PreparedFrame>> {
        match self.phase {
            FramePhase::FramePrepared => return Ok(Some(self.prepared()?)),
            FramePhase::Idle => {}
            phase => {
                return Err(GpuError::InvalidState(format!(
                    "prep_next_frame called in phase {phase:?}"
                )))
            }
        }

        if target_extent.is_empty() {
            return Ok(None);
        }

        self.phase = FramePhase::Acquiring;
        self.platform.wait_slot(self.slot)?;

        if self.recreate_pending || target_extent != self.requested_extent {
            self.recreate(target_extent)?;
        }

        let image = loop {
            match self.platform.acquire(self.slot)? {
                AcquireOutcome::Image { index, suboptimal } => {
                    if suboptimal {
                        self.recreate_pending = true;
                    }
                    break index;
                }
                AcquireOutcome::OutOfDate => {
                    tracing::debug!("Swapchain out of date on acquire; recreating");
                    self.recreate(target_extent)?;
                    if self.swapchain.extent.is_empty() {
                        self.phase = FramePhase::Idle;
                        return Ok(None);
                    }
                }
            }
        };

        self.wait_image_owner(image)?;
        self.image = Some(image);

        if !self.upload_open {
            self.platform.begin_upload(image)?;
            self.upload_open = true;
        }

        self.phase = FramePhase::FramePrepared;
        tracing::trace!(
            "Frame {} prepared on {} with image {}",
            self.frame_number,
            self.slot,
            image
        );
        Ok(Some(self.prepared()?))
    }

    /// Submit and present the prepared frame, then advance to the next slot.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn swap(&mut self, target_extent: Extent) -> Result<()> {
        let image = match (self.phase, self.image) {
            (FramePhase::FramePrepared, Some(image)) => image,
            (phase, _) => {
                return Err(GpuError::InvalidState(format!(
                    "swap called in phase {phase:?} without a prepared frame"
                )))
            }
        };

        if self.upload_open {
            self.platform.end_upload(image)?;
            self.upload_open = false;
        }

        self.wait_image_owner(image)?;

        self.platform.reset_slot(self.slot)?;
        self.platform.submit(self.slot, image)?;
        self.images_in_flight[image as usize] = Some(self.slot);
        self.phase = FramePhase::Submitted;

        let outcome = self.platform.present(self.slot, image)?;
        self.image = None;

        if outcome == PresentOutcome::Stale || target_extent != self.requested_extent {
            self.recreate_pending = true;
        }
        if self.recreate_pending && !target_extent.is_empty() {
            self.recreate(target_extent)?;
        }

        self.slot = self.slot.next(self.frames_in_flight);
        self.frame_number += 1;
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Wait on the fence of an older slot still using `image`.
    fn wait_image_owner(&mut self, image: u32) -> Result<()> {
        let owner = self
            .images_in_flight
            .get(image as usize)
            .copied()
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "Image {image} out of range for {} swapchain images",
                    self.images_in_flight.len()
                ))
            })?;

        if let Some(owner) = owner {
            if owner != self.slot {
                self.platform.wait_slot(owner)?;
            }
        }
        Ok(())
    }

    fn recreate(&mut self, extent: Extent) -> Result<()> {
        if self.upload_open {
            return Err(GpuError::InvalidState(
                "Swapchain recreation with an open upload buffer".to_string(),
            ));
        }

        let previous = self.swapchain.extent;
        self.swapchain = self.platform.recreate(extent)?;
        self.images_in_flight = vec![None; self.swapchain.image_count];
        self.requested_extent = extent;
        self.recreate_pending = self.swapchain.extent.is_empty();
        self.generation += 1;

        tracing::info!(
            "Swapchain recreated: {} -> {} ({} images, generation {})",
            previous,
            self.swapchain.extent,
            self.swapchain.image_count,
            self.generation
        );
        Ok(())
    }

    fn prepared(&self) -> Result<PreparedFrame> {
        let image_index = self
            .image
            .ok_or_else(|| GpuError::InvalidState("No image selected".to_string()))?;
        Ok(PreparedFrame {
            // The slot fence was waited on in prep_next_frame.
            slot: unsafe { FencedSlot::assume_signaled(self.slot) },
            image_index,
            generation: self.generation,
            extent: self.swapchain.extent,
            frame_number: self.frame_number,
        })
    }

    /// Current phase.
    pub const fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Slot the next or current frame uses.
    pub const fn current_slot(&self) -> FrameSlot {
        self.slot
    }

    /// Number of frames in flight.
    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Current swapchain generation; increments on every recreation.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Current swapchain state.
    pub const fn swapchain_info(&self) -> SwapchainInfo {
        self.swapchain
    }

    /// Number of frames submitted so far.
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Shared access to the platform.
    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Exclusive access to the platform.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Block until the device is idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.platform.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Reset(usize),
        Acquire(usize),
        BeginUpload(u32),
        EndUpload(u32),
        Submit(usize, u32),
        Present(usize, u32),
        Recreate(Extent),
    }

    struct MockPlatform {
        info: SwapchainInfo,
        /// Slot fences: true once the last submission is known complete.
        signaled: Vec<bool>,
        events: Vec<Event>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        next_image: u32,
        /// Image count handed out after each recreate.
        recreate_images: usize,
    }

    impl MockPlatform {
        fn new(extent: Extent, image_count: usize, frames: usize) -> Self {
            Self {
                info: SwapchainInfo {
                    extent,
                    image_count,
                },
                signaled: vec![true; frames],
                events: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                next_image: 0,
                recreate_images: image_count,
            }
        }
    }

    impl FramePlatform for MockPlatform {
        fn swapchain_info(&self) -> SwapchainInfo {
            self.info
        }

        fn wait_slot(&mut self, slot: FrameSlot) -> Result<()> {
            self.signaled[slot.index()] = true;
            self.events.push(Event::Wait(slot.index()));
            Ok(())
        }

        fn reset_slot(&mut self, slot: FrameSlot) -> Result<()> {
            assert!(
                self.signaled[slot.index()],
                "fence of {slot} reset before it was waited on"
            );
            self.events.push(Event::Reset(slot.index()));
            Ok(())
        }

        fn acquire(&mut self, slot: FrameSlot) -> Result<AcquireOutcome> {
            self.events.push(Event::Acquire(slot.index()));
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % self.info.image_count as u32;
                AcquireOutcome::Image {
                    index,
                    suboptimal: false,
                }
            }))
        }

        fn begin_upload(&mut self, image: u32) -> Result<()> {
            self.events.push(Event::BeginUpload(image));
            Ok(())
        }

        fn end_upload(&mut self, image: u32) -> Result<()> {
            self.events.push(Event::EndUpload(image));
            Ok(())
        }

        fn submit(&mut self, slot: FrameSlot, image: u32) -> Result<()> {
            self.signaled[slot.index()] = false;
            self.events.push(Event::Submit(slot.index(), image));
            Ok(())
        }

        fn present(&mut self, slot: FrameSlot, image: u32) -> Result<PresentOutcome> {
            self.events.push(Event::Present(slot.index(), image));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn recreate(&mut self, extent: Extent) -> Result<SwapchainInfo> {
            self.signaled.iter_mut().for_each(|s| *s = true);
            self.events.push(Event::Recreate(extent));
            self.info = SwapchainInfo {
                extent,
                image_count: self.recreate_images,
            };
            self.next_image = 0;
            Ok(self.info)
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.signaled.iter_mut().for_each(|s| *s = true);
            Ok(())
        }
    }

    const SIZE: Extent = Extent::new(800, 600);

    fn cycle(image_count: usize, frames: usize) -> FrameCycle<MockPlatform> {
        FrameCycle::new(MockPlatform::new(SIZE, image_count, frames), frames).unwrap()
    }

    fn run_frame(cycle: &mut FrameCycle<MockPlatform>) -> PreparedFrame {
        let frame = cycle.prep_next_frame(SIZE).unwrap().unwrap();
        cycle.swap(SIZE).unwrap();
        frame
    }

    #[test]
    fn frame_follows_fence_acquire_submit_present() {
        let mut cycle = cycle(3, 2);
        let frame = cycle.prep_next_frame(SIZE).unwrap().unwrap();
        assert_eq!(cycle.phase(), FramePhase::FramePrepared);
        assert_eq!(frame.slot.index(), 0);
        assert_eq!(frame.image_index, 0);

        cycle.swap(SIZE).unwrap();
        assert_eq!(cycle.phase(), FramePhase::Idle);
        assert_eq!(
            cycle.platform().events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::BeginUpload(0),
                Event::EndUpload(0),
                Event::Reset(0),
                Event::Submit(0, 0),
                Event::Present(0, 0),
            ]
        );
    }

    #[test]
    fn slots_advance_round_robin() {
        let mut cycle = cycle(3, 2);
        let slots: Vec<usize> = (0..5).map(|_| run_frame(&mut cycle).slot.index()).collect();
        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(cycle.frame_number(), 5);
    }

    #[test]
    fn prep_is_idempotent_until_swap() {
        let mut cycle = cycle(3, 2);
        let first = cycle.prep_next_frame(SIZE).unwrap().unwrap();
        let second = cycle.prep_next_frame(SIZE).unwrap().unwrap();
        assert_eq!(first, second);
        let acquires = cycle
            .platform()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Acquire(_)))
            .count();
        assert_eq!(acquires, 1);
    }

    #[test]
    fn swap_without_prep_is_rejected() {
        let mut cycle = cycle(3, 2);
        assert!(matches!(cycle.swap(SIZE), Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn waits_on_slot_still_owning_acquired_image() {
        let mut cycle = cycle(3, 2);
        cycle.platform_mut().acquires.extend([
            AcquireOutcome::Image {
                index: 0,
                suboptimal: false,
            },
            AcquireOutcome::Image {
                index: 1,
                suboptimal: false,
            },
            AcquireOutcome::Image {
                index: 1,
                suboptimal: false,
            },
        ]);
        run_frame(&mut cycle);
        run_frame(&mut cycle);
        cycle.platform_mut().events.clear();

        // Slot 0 receives image 1, last submitted by slot 1
        let frame = cycle.prep_next_frame(SIZE).unwrap().unwrap();
        assert_eq!(frame.slot.index(), 0);
        assert_eq!(
            cycle.platform().events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Wait(1),
                Event::BeginUpload(1),
            ]
        );
    }

    #[test]
    fn out_of_date_acquire_recreates_and_retries() {
        let mut cycle = cycle(3, 2);
        cycle
            .platform_mut()
            .acquires
            .push_back(AcquireOutcome::OutOfDate);

        let frame = cycle.prep_next_frame(SIZE).unwrap().unwrap();
        assert_eq!(frame.generation, 1);
        assert_eq!(
            cycle.platform().events[..4],
            [
                Event::Wait(0),
                Event::Acquire(0),
                Event::Recreate(SIZE),
                Event::Acquire(0),
            ]
        );
    }

    #[test]
    fn resize_recreates_with_new_extent() {
        let large = Extent::new(1920, 1080);
        let mut cycle = cycle(3, 2);
        cycle.platform_mut().recreate_images = 4;
        run_frame(&mut cycle);

        cycle.prep_next_frame(SIZE).unwrap().unwrap();
        cycle.swap(large).unwrap();
        assert_eq!(cycle.swapchain_info().extent, large);
        assert_eq!(cycle.swapchain_info().image_count, 4);
        assert_eq!(cycle.generation(), 1);

        let frame = cycle.prep_next_frame(large).unwrap().unwrap();
        assert_eq!(frame.extent, large);
        assert_eq!(frame.generation, 1);
        assert!((frame.image_index as usize) < 4);
        let recreates = cycle
            .platform()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Recreate(_)))
            .count();
        assert_eq!(recreates, 1);
    }

    #[test]
    fn stale_present_triggers_recreate() {
        let mut cycle = cycle(3, 2);
        cycle.platform_mut().presents.push_back(PresentOutcome::Stale);
        run_frame(&mut cycle);
        assert_eq!(cycle.generation(), 1);
        assert_eq!(cycle.platform().events.last(), Some(&Event::Recreate(SIZE)));
    }

    #[test]
    fn suboptimal_acquire_recreates_after_present() {
        let mut cycle = cycle(3, 2);
        cycle.platform_mut().acquires.push_back(AcquireOutcome::Image {
            index: 0,
            suboptimal: true,
        });
        run_frame(&mut cycle);
        assert_eq!(cycle.generation(), 1);
    }

    #[test]
    fn minimised_window_defers_frames() {
        let mut cycle = cycle(3, 2);
        assert!(cycle.prep_next_frame(Extent::new(0, 0)).unwrap().is_none());
        assert_eq!(cycle.phase(), FramePhase::Idle);
        assert!(cycle.platform().events.is_empty());

        let restored = Extent::new(1024, 768);
        let frame = cycle.prep_next_frame(restored).unwrap().unwrap();
        assert_eq!(frame.extent, restored);
        assert!(cycle.platform().events.contains(&Event::Recreate(restored)));
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let platform = MockPlatform::new(SIZE, 3, 1);
        assert!(FrameCycle::new(platform, 0).is_err());
    }
}
