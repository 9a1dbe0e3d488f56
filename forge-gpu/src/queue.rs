//! Queue handles, submission and presentation.
//!
//! Roles that resolve to the same native queue share one mutex, so
//! submissions through aliased roles are serialised.

use std::sync::{Arc, Mutex};

use ash::vk;
use bumpalo::Bump;
use thiserror::Error;

use crate::capabilities::QueueRole;
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::status::Status;
use crate::swapchain::SwapchainHandle;
use crate::sync::{Fence, Semaphore};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Vulkan error during queue submission: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("Vulkan error during presentation: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
#[error("Vulkan error waiting for queue idle: {0}")]
pub struct QueueWaitIdleError(pub vk::Result);

/// One batch of a queue submission.
///
/// `wait_stages[i]` is the stage at which `wait_semaphores[i]` is waited on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub wait_semaphores: &'a [&'a Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffers: &'a [&'a CommandBuffer],
    pub signal_semaphores: &'a [&'a Semaphore],
}

/// A queue retrieved from a [`Device`] for one role.
pub struct Queue {
    device: Arc<Device>,
    role: QueueRole,
    family_index: u32,
    handle: Arc<Mutex<vk::Queue>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("role", &self.role)
            .field("family_index", &self.family_index)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub(crate) fn new(
        device: Arc<Device>,
        role: QueueRole,
        family_index: u32,
        handle: Arc<Mutex<vk::Queue>>,
    ) -> Self {
        Self {
            device,
            role,
            family_index,
            handle,
        }
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.device
    }

    /// Whether `other` drives the same native queue.
    pub fn shares_native_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, vk::Queue> {
        self.handle.lock().expect("queue lock poisoned")
    }

    /// Submit batches of command buffers, optionally signalling `fence`.
    ///
    /// # Panics
    /// Before any native call, if a batch's wait semaphores and wait stages
    /// differ in length, a command buffer is not ready for submission, an
    /// object belongs to another device, or `fence` has not been reset.
    pub fn submit(
        &self,
        submits: &[SubmitInfo<'_>],
        fence: Option<&Fence>,
    ) -> Result<(), SubmitError> {
        for submit in submits {
            assert_eq!(
                submit.wait_semaphores.len(),
                submit.wait_stages.len(),
                "every wait semaphore needs a wait stage"
            );
            assert!(
                submit.command_buffers.iter().all(|cb| cb.is_submittable()),
                "submitted command buffers must be executable"
            );
            assert!(
                submit
                    .command_buffers
                    .iter()
                    .all(|cb| Arc::ptr_eq(cb.parent(), &self.device)),
                "command buffer belongs to a different device"
            );
            assert!(
                submit
                    .wait_semaphores
                    .iter()
                    .chain(submit.signal_semaphores)
                    .all(|s| Arc::ptr_eq(s.parent(), &self.device)),
                "semaphore belongs to a different device"
            );
        }
        if let Some(fence) = fence {
            assert!(
                Arc::ptr_eq(fence.parent(), &self.device),
                "fence belongs to a different device"
            );
            assert!(
                fence.is_unsubmitted(),
                "a fence must be reset before it is submitted"
            );
        }

        let arena = Bump::new();
        let infos = arena.alloc_slice_fill_iter(submits.iter().map(|submit| {
            let waits =
                arena.alloc_slice_fill_iter(submit.wait_semaphores.iter().map(|s| s.raw_handle()));
            let command_buffers = arena.alloc_slice_fill_iter(
                submit.command_buffers.iter().map(|cb| cb.raw_command_buffer()),
            );
            let signals = arena
                .alloc_slice_fill_iter(submit.signal_semaphores.iter().map(|s| s.raw_handle()));
            vk::SubmitInfo::default()
                .wait_semaphores(waits)
                .wait_dst_stage_mask(submit.wait_stages)
                .command_buffers(command_buffers)
                .signal_semaphores(signals)
        }));
        let raw_fence = fence.map_or(vk::Fence::null(), Fence::raw_handle);

        if let Some(fence) = fence {
            fence.mark_submitted();
        }
        let queue = self.lock();
        let _span = tracing::debug_span!("queue_submit", role = ?self.role, batches = submits.len())
            .entered();
        // SAFETY: Every handle is a live object of this device (asserted) and
        // the queue mutex serialises access to the native queue.
        let result = unsafe { self.device.dispatch().queue_submit(*queue, infos, raw_fence) };
        drop(queue);

        match result {
            Ok(()) => {
                for cb in submits.iter().flat_map(|s| s.command_buffers) {
                    cb.mark_pending();
                }
                Ok(())
            }
            Err(e) => {
                if let Some(fence) = fence {
                    fence.mark_unsubmitted();
                }
                tracing::error!("Queue submission failed: {e}");
                Err(SubmitError::Vulkan(e))
            }
        }
    }

    /// Present `image_indices[i]` of `swapchains[i]` once every semaphore in
    /// `wait_semaphores` has signalled.
    ///
    /// `Suboptimal` and `OutOfDate` are returned as statuses, not errors.
    ///
    /// # Panics
    /// If `swapchains` or `wait_semaphores` is empty, the index count differs
    /// from the swapchain count or an index is out of range for its
    /// swapchain.
    pub fn present(
        &self,
        swapchains: &[&dyn SwapchainHandle],
        wait_semaphores: &[&Semaphore],
        image_indices: &[u32],
    ) -> Result<Status, PresentError> {
        assert!(!swapchains.is_empty(), "present needs at least one swapchain");
        assert!(
            !wait_semaphores.is_empty(),
            "present needs at least one wait semaphore"
        );
        assert_eq!(
            swapchains.len(),
            image_indices.len(),
            "present needs one image index per swapchain"
        );
        assert!(
            swapchains
                .iter()
                .zip(image_indices)
                .all(|(sc, index)| *index < sc.image_count()),
            "present image index out of range"
        );

        let arena = Bump::new();
        let raw_swapchains =
            arena.alloc_slice_fill_iter(swapchains.iter().map(|sc| sc.raw_swapchain()));
        let raw_waits = arena.alloc_slice_fill_iter(wait_semaphores.iter().map(|s| s.raw_handle()));
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(raw_waits)
            .swapchains(raw_swapchains)
            .image_indices(image_indices);

        let queue = self.lock();
        // SAFETY: Swapchains and semaphores are live; the queue mutex
        // serialises access to the native queue.
        let result = unsafe { self.device.dispatch().queue_present(*queue, &present_info) };
        drop(queue);

        match result {
            Ok(false) => Ok(Status::Success),
            Ok(true) => Ok(Status::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Status::OutOfDate),
            Err(e) => Err(PresentError::Vulkan(e)),
        }
    }

    pub fn wait_idle(&self) -> Result<(), QueueWaitIdleError> {
        let queue = self.lock();
        let _span = tracing::debug_span!("queue_wait_idle", role = ?self.role).entered();
        // SAFETY: The queue mutex serialises access to the native queue.
        unsafe { self.device.dispatch().queue_wait_idle(*queue) }.map_err(QueueWaitIdleError)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::command::{CommandBufferLevel, CommandBufferState, CommandPool};
    use crate::sync::FenceState;
    use crate::testing::{FakeSwapchain, mock_device};

    fn recorded_buffer(pool: &CommandPool) -> CommandBuffer {
        let mut cb = pool.allocate(CommandBufferLevel::Primary).expect("allocate");
        cb.begin(true, None).expect("begin");
        cb.end().expect("end");
        cb
    }

    #[test]
    fn submit_marks_buffers_and_fence() {
        let (device, mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let pool = CommandPool::new(&device, queue.family_index(), None).expect("pool");
        let cb = recorded_buffer(&pool);
        let acquire = Semaphore::new(&device, None).expect("semaphore");
        let render = Semaphore::new(&device, None).expect("semaphore");
        let fence = Fence::new(&device, false, None).expect("fence");
        mock.set_manual_fences(true);

        queue
            .submit(
                &[SubmitInfo {
                    wait_semaphores: &[&acquire],
                    wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                    command_buffers: &[&cb],
                    signal_semaphores: &[&render],
                }],
                Some(&fence),
            )
            .expect("submit");

        assert_eq!(cb.state(), CommandBufferState::Pending);
        assert_eq!(fence.status().expect("status"), FenceState::Pending);
        let submits = mock.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].wait_semaphores, vec![acquire.raw_handle().as_raw()]);
        assert_eq!(
            submits[0].wait_stages,
            vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT]
        );
        assert_eq!(submits[0].command_buffers, vec![cb.raw_command_buffer().as_raw()]);
        assert_eq!(submits[0].signal_semaphores, vec![render.raw_handle().as_raw()]);
        assert_eq!(submits[0].fence, fence.raw_handle().as_raw());

        mock.signal_fence(fence.raw_handle());
        assert_eq!(fence.wait(u64::MAX).expect("wait"), Status::Success);
    }

    #[test]
    fn failed_submit_leaves_fence_unsubmitted() {
        let (device, mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let pool = CommandPool::new(&device, queue.family_index(), None).expect("pool");
        let cb = recorded_buffer(&pool);
        let fence = Fence::new(&device, false, None).expect("fence");
        mock.fail_next("queue_submit", vk::Result::ERROR_DEVICE_LOST);

        let result = queue.submit(
            &[SubmitInfo {
                command_buffers: &[&cb],
                ..Default::default()
            }],
            Some(&fence),
        );
        assert!(matches!(
            result,
            Err(SubmitError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        assert_eq!(cb.state(), CommandBufferState::Executable);
        assert_eq!(fence.status().expect("status"), FenceState::Unsignaled);
    }

    #[test]
    #[should_panic(expected = "every wait semaphore needs a wait stage")]
    fn mismatched_wait_stages_panic() {
        let (device, _mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let semaphore = Semaphore::new(&device, None).expect("semaphore");
        let _ = queue.submit(
            &[SubmitInfo {
                wait_semaphores: &[&semaphore],
                ..Default::default()
            }],
            None,
        );
    }

    #[test]
    fn unfinished_buffer_is_rejected_before_the_driver() {
        let (device, mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let pool = CommandPool::new(&device, queue.family_index(), None).expect("pool");
        let mut cb = pool.allocate(CommandBufferLevel::Primary).expect("allocate");
        cb.begin(true, None).expect("begin");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.submit(
                &[SubmitInfo {
                    command_buffers: &[&cb],
                    ..Default::default()
                }],
                None,
            )
        }));
        assert!(result.is_err());
        assert_eq!(mock.count_calls("queue_submit"), 0);
    }

    #[test]
    fn one_time_buffer_cannot_be_resubmitted_while_pending() {
        let (device, _mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let pool = CommandPool::new(&device, queue.family_index(), None).expect("pool");
        let cb = recorded_buffer(&pool);
        let batch = [SubmitInfo {
            command_buffers: &[&cb],
            ..Default::default()
        }];
        queue.submit(&batch, None).expect("first submit");
        let again = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.submit(&batch, None)
        }));
        assert!(again.is_err());
    }

    #[test]
    fn present_maps_statuses() {
        let (device, mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let swapchain = FakeSwapchain::new(3);
        let semaphore = Semaphore::new(&device, None).expect("semaphore");

        mock.push_present_result(Ok(false));
        mock.push_present_result(Ok(true));
        mock.push_present_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        mock.push_present_result(Err(vk::Result::ERROR_SURFACE_LOST_KHR));

        let present = || queue.present(&[&swapchain], &[&semaphore], &[1]);
        assert_eq!(present().expect("present"), Status::Success);
        assert_eq!(present().expect("present"), Status::Suboptimal);
        assert_eq!(present().expect("present"), Status::OutOfDate);
        assert!(matches!(
            present(),
            Err(PresentError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        ));

        let recorded = mock.presents();
        assert_eq!(recorded.len(), 4);
        assert_eq!(recorded[0].image_indices, vec![1]);
        assert_eq!(recorded[0].wait_semaphores, vec![semaphore.raw_handle().as_raw()]);
    }

    #[test]
    #[should_panic(expected = "present image index out of range")]
    fn present_checks_image_index() {
        let (device, _mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let swapchain = FakeSwapchain::new(2);
        let semaphore = Semaphore::new(&device, None).expect("semaphore");
        let _ = queue.present(&[&swapchain], &[&semaphore], &[2]);
    }

    #[test]
    fn present_without_semaphores_or_indices_is_rejected() {
        let (device, mock) = mock_device();
        let queue = device.queue(QueueRole::Graphics).expect("graphics queue");
        let swapchain = FakeSwapchain::new(2);
        let semaphore = Semaphore::new(&device, None).expect("semaphore");

        let no_waits = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.present(&[&swapchain], &[], &[0])
        }));
        let no_indices = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            queue.present(&[&swapchain], &[&semaphore], &[])
        }));
        assert!(no_waits.is_err());
        assert!(no_indices.is_err());
        assert_eq!(mock.count_calls("queue_present"), 0);
    }

    #[test]
    fn aliased_roles_lock_one_queue() {
        let (device, _mock) = mock_device();
        let graphics = device.queue(QueueRole::Graphics).expect("graphics");
        let transfer = device.queue(QueueRole::Transfer).expect("transfer");
        assert!(graphics.shares_native_queue(&transfer));
        graphics.wait_idle().expect("idle");
    }
}
