//! Round-robin frame slots.
//!
//! Each slot owns an in-flight fence, an image-available semaphore, a
//! render-finished semaphore and a primary command buffer. A slot is only
//! reused after its fence has signalled, so at most `count` frames are ever
//! queued on the device and a command buffer is never re-recorded while it
//! is still executing.
//!
//! ```text
//! begin_frame: wait fence -> reset fence -> acquire (signals image-available)
//! submit:      wait image-available @ COLOR_ATTACHMENT_OUTPUT,
//!              signal render-finished + fence
//! present:     wait render-finished, advance slot
//! ```

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::command::{
    AllocateCommandBufferError, CommandBuffer, CommandBufferLevel, CommandBufferState, CommandPool,
    RecordError,
};
use crate::device::Device;
use crate::queue::{PresentError, Queue, SubmitError, SubmitInfo};
use crate::status::Status;
use crate::swapchain::{AcquireImageError, AcquiredImage, SwapchainHandle, SwapchainImages};
use crate::sync::{
    CreateFenceError, CreateSemaphoreError, Fence, ResetFenceError, Semaphore, WaitFenceError,
};

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Error)]
pub enum CreateFramesError {
    #[error("Failed to create frame fence: {0}")]
    Fence(#[from] CreateFenceError),
    #[error("Failed to create frame semaphore: {0}")]
    Semaphore(#[from] CreateSemaphoreError),
    #[error("Failed to allocate frame command buffer: {0}")]
    CommandBuffer(#[from] AllocateCommandBufferError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Failed waiting for the frame fence: {0}")]
    Wait(#[from] WaitFenceError),
    #[error("Failed to reset the frame fence: {0}")]
    ResetFence(#[from] ResetFenceError),
    #[error(transparent)]
    Acquire(#[from] AcquireImageError),
    #[error("Failed to reset the frame command buffer: {0}")]
    ResetCommandBuffer(#[from] RecordError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Acquired,
    Submitted,
}

struct FrameSlot {
    in_flight: Fence,
    image_available: Semaphore,
    render_finished: Semaphore,
    command_buffer: CommandBuffer,
}

pub struct FramesInFlight {
    parent: Arc<Device>,
    slots: Vec<FrameSlot>,
    current: usize,
    phase: Phase,
}

impl std::fmt::Debug for FramesInFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramesInFlight")
            .field("count", &self.slots.len())
            .field("current", &self.current)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl FramesInFlight {
    /// Create `count` slots with command buffers from `pool`.
    ///
    /// Fences start signalled so the first pass through every slot does not
    /// block.
    ///
    /// # Panics
    /// If `count` is zero or `pool` belongs to another device.
    pub fn new(
        device: &Arc<Device>,
        pool: &CommandPool,
        count: usize,
    ) -> Result<Self, CreateFramesError> {
        assert!(count > 0, "at least one frame in flight is required");
        assert!(
            Arc::ptr_eq(pool.parent(), device),
            "command pool belongs to a different device"
        );

        let slots = (0..count)
            .map(|i| {
                Ok(FrameSlot {
                    in_flight: Fence::new(device, true, Some(&format!("frame {i} in flight")))?,
                    image_available: Semaphore::new(
                        device,
                        Some(&format!("frame {i} image available")),
                    )?,
                    render_finished: Semaphore::new(
                        device,
                        Some(&format!("frame {i} render finished")),
                    )?,
                    command_buffer: pool.allocate(CommandBufferLevel::Primary)?,
                })
            })
            .collect::<Result<Vec<_>, CreateFramesError>>()?;
        tracing::debug!("Created {count} frames in flight");

        Ok(Self {
            parent: Arc::clone(device),
            slots,
            current: 0,
            phase: Phase::Idle,
        })
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Index of the slot the next frame uses.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Wait for the current slot, reset it and acquire the next image.
    ///
    /// Returns the acquire result. When it carries no image (`NotReady` or
    /// `OutOfDate`) the slot is left as it is and `begin_frame` may simply be
    /// called again, after recreating the swapchain if needed. A fence wait
    /// that times out is reported as `NotReady` without touching the slot.
    /// On success the slot's command buffer is back in the initial state,
    /// ready to be recorded.
    ///
    /// # Panics
    /// If the previous frame was submitted but not presented.
    pub fn begin_frame(
        &mut self,
        swapchain: &SwapchainImages,
        timeout_ns: u64,
    ) -> Result<AcquiredImage, FrameError> {
        assert!(
            self.phase != Phase::Submitted,
            "the previous frame must be presented before beginning a new one"
        );
        let slot = &mut self.slots[self.current];

        // A reset fence that was never resubmitted (the last acquire on this
        // slot produced no image) has no work to wait for.
        if !slot.in_flight.is_unsubmitted() {
            let _span = tracing::trace_span!("frame_wait", slot = self.current).entered();
            if slot.in_flight.wait(timeout_ns)? == Status::NotReady {
                return Ok(AcquiredImage {
                    status: Status::NotReady,
                    image_index: None,
                });
            }
            slot.in_flight.reset()?;
        }

        let acquired =
            swapchain.acquire_next_image(timeout_ns, Some(&slot.image_available), None)?;
        if acquired.image_index.is_none() {
            self.phase = Phase::Idle;
            return Ok(acquired);
        }

        if slot.command_buffer.state() != CommandBufferState::Initial {
            // SAFETY: The slot fence signalled after the buffer's last
            // submission, or that submission never happened.
            unsafe { slot.command_buffer.reset() }?;
        }
        self.phase = Phase::Acquired;
        Ok(acquired)
    }

    /// The current slot's primary command buffer.
    pub fn command_buffer(&mut self) -> &mut CommandBuffer {
        &mut self.slots[self.current].command_buffer
    }

    /// Submit the current slot's command buffer.
    ///
    /// Waits on the image-available semaphore at colour attachment output,
    /// signals render-finished and the slot fence.
    ///
    /// # Panics
    /// If no image was acquired by [`begin_frame`](Self::begin_frame), or the
    /// command buffer was not ended.
    pub fn submit(&mut self, queue: &Queue) -> Result<(), FrameError> {
        assert_eq!(
            self.phase,
            Phase::Acquired,
            "submit requires a frame begun with an acquired image"
        );
        let slot = &self.slots[self.current];
        queue.submit(
            &[SubmitInfo {
                wait_semaphores: &[&slot.image_available],
                wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                command_buffers: &[&slot.command_buffer],
                signal_semaphores: &[&slot.render_finished],
            }],
            Some(&slot.in_flight),
        )?;
        self.phase = Phase::Submitted;
        Ok(())
    }

    /// Present `image_index` once rendering finished, then move to the next
    /// slot.
    ///
    /// The slot advances even when presentation reports an error; the work
    /// is already queued and guarded by the slot fence.
    ///
    /// # Panics
    /// If the current frame has not been submitted.
    pub fn present(
        &mut self,
        queue: &Queue,
        swapchain: &dyn SwapchainHandle,
        image_index: u32,
    ) -> Result<Status, PresentError> {
        assert_eq!(
            self.phase,
            Phase::Submitted,
            "present requires a submitted frame"
        );
        let slot = &self.slots[self.current];
        let result = queue.present(&[swapchain], &[&slot.render_finished], &[image_index]);

        self.phase = Phase::Idle;
        self.current = (self.current + 1) % self.slots.len();
        result
    }
}
