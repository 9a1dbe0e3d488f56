use std::cell::Cell;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::status::Status;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Waiting forever on a fence that was never submitted")]
    NeverSubmitted,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum ResetFenceError {
    #[error("Fence is still pending on the device")]
    StillPending,
    #[error("Vulkan error resetting fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Vulkan error creating semaphore: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

/// Host-side view of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Reset and not part of any submission.
    Unsignaled,
    /// Handed to a queue submission whose completion has not been observed.
    Pending,
    /// Observed signaled.
    Signaled,
}

/// An owned binary fence used for GPU to host synchronisation.
///
/// The fence tracks whether it was submitted, so a wait that could never
/// finish (unsignaled, never submitted, unbounded timeout) is reported
/// instead of hanging the thread, and a reset of a fence whose work is still
/// executing is refused.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    state: Cell<FenceState>,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence.
    ///
    /// Pass `signaled = true` so the first wait of a render loop returns
    /// immediately.
    ///
    /// `name` is an optional debug label, applied through
    /// `VK_EXT_debug_utils` when the device has it. A failed naming call is
    /// logged as a warning and never fails construction.
    pub fn new(
        device: &Arc<Device>,
        signaled: bool,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.dispatch().create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;
        device.apply_debug_name(handle, name, "fence");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            state: Cell::new(if signaled {
                FenceState::Signaled
            } else {
                FenceState::Unsignaled
            }),
        })
    }

    /// Current host-side state, refreshing a pending fence from the device.
    pub fn status(&self) -> Result<FenceState, vk::Result> {
        if self.state.get() == FenceState::Pending {
            // SAFETY: handle is a live fence of parent.
            if unsafe { self.parent.dispatch().get_raw_fence_status(self.handle) }? {
                self.state.set(FenceState::Signaled);
            }
        }
        Ok(self.state.get())
    }

    /// Block until the fence signals or `timeout_ns` elapses.
    ///
    /// A timeout is `Ok(Status::NotReady)`, not an error. Waiting with
    /// `u64::MAX` on an unsignaled fence that was never submitted returns
    /// [`WaitFenceError::NeverSubmitted`].
    pub fn wait(&self, timeout_ns: u64) -> Result<Status, WaitFenceError> {
        match self.state.get() {
            FenceState::Signaled => return Ok(Status::Success),
            FenceState::Unsignaled if timeout_ns == u64::MAX => {
                return Err(WaitFenceError::NeverSubmitted);
            }
            _ => {}
        }

        let _span = tracing::debug_span!("fence_wait", fence = ?self.handle).entered();
        // SAFETY: handle is a live fence of parent.
        match unsafe {
            self.parent
                .dispatch()
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        } {
            Ok(()) => {
                self.state.set(FenceState::Signaled);
                Ok(Status::Success)
            }
            Err(vk::Result::TIMEOUT) => Ok(Status::NotReady),
            Err(e) => Err(WaitFenceError::Vulkan(e)),
        }
    }

    /// Return the fence to the unsignaled state.
    ///
    /// Resetting an unsignaled fence is a no-op. A fence whose submission has
    /// not completed yet is left alone and [`ResetFenceError::StillPending`]
    /// is returned.
    pub fn reset(&mut self) -> Result<(), ResetFenceError> {
        match self.status().map_err(ResetFenceError::Vulkan)? {
            FenceState::Unsignaled => Ok(()),
            FenceState::Pending => Err(ResetFenceError::StillPending),
            FenceState::Signaled => {
                // SAFETY: The fence is signaled, so no submission still
                // references it, and &mut self excludes concurrent use.
                unsafe { self.parent.dispatch().reset_raw_fences(&[self.handle]) }
                    .map_err(ResetFenceError::Vulkan)?;
                self.state.set(FenceState::Unsignaled);
                Ok(())
            }
        }
    }

    /// Wait for the fence and reset it if it signaled.
    ///
    /// The canonical render-loop operation. Returns the wait status; on
    /// `NotReady` the fence is left untouched.
    pub fn wait_and_reset(&mut self, timeout_ns: u64) -> Result<Status, WaitFenceError> {
        let status = self.wait(timeout_ns)?;
        if status == Status::Success {
            self.reset().map_err(|e| match e {
                ResetFenceError::Vulkan(e) => WaitFenceError::Vulkan(e),
                ResetFenceError::StillPending => {
                    unreachable!("fence observed signaled cannot be pending")
                }
            })?;
        }
        Ok(status)
    }

    pub fn raw_handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub(crate) fn is_unsubmitted(&self) -> bool {
        self.state.get() == FenceState::Unsignaled
    }

    /// Record that the fence was handed to a queue submission.
    ///
    /// # Panics
    /// If the fence is not unsignaled.
    pub(crate) fn mark_submitted(&self) {
        assert_eq!(
            self.state.get(),
            FenceState::Unsignaled,
            "a fence must be reset before it is submitted"
        );
        self.state.set(FenceState::Pending);
    }

    /// Undo [`mark_submitted`](Self::mark_submitted) after a rejected submit.
    pub(crate) fn mark_unsubmitted(&self) {
        self.state.set(FenceState::Unsignaled);
    }

    pub(crate) fn mark_signaled(&self) {
        self.state.set(FenceState::Signaled);
    }

    pub(crate) fn refresh(&self) -> Result<(), WaitFenceError> {
        self.status().map(|_| ()).map_err(WaitFenceError::Vulkan)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        if self.state.get() == FenceState::Pending {
            tracing::warn!("Fence {:?} dropped while possibly pending", self.handle);
        }
        // SAFETY: handle was created from parent; the owner guarantees no
        // queue operation still references it.
        unsafe { self.parent.dispatch().destroy_raw_fence(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// An owned binary semaphore used for GPU to GPU ordering.
///
/// Signaled by one queue operation and waited on by another. The host never
/// observes its state.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    /// Create a binary semaphore.
    ///
    /// `name` is an optional debug label, applied through
    /// `VK_EXT_debug_utils` when the device has it. A failed naming call is
    /// logged as a warning and never fails construction.
    pub fn new(device: &Arc<Device>, name: Option<&str>) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.dispatch().create_raw_semaphore(&create_info) }
            .map_err(CreateSemaphoreError::Vulkan)?;
        device.apply_debug_name(handle, name, "semaphore");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: handle was created from parent. No GPU work may be waiting
        // on or about to signal it.
        unsafe { self.parent.dispatch().destroy_raw_semaphore(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::testing::mock_device;

    #[test]
    fn signaled_fence_round_trip() {
        let (device, mock) = mock_device();
        let mut fence = Fence::new(&device, true, Some("round trip")).expect("fence");
        assert_eq!(fence.status().expect("status"), FenceState::Signaled);

        fence.reset().expect("reset");
        assert_eq!(fence.status().expect("status"), FenceState::Unsignaled);
        assert_eq!(fence.wait(0).expect("wait"), Status::NotReady);

        fence.mark_submitted();
        mock.signal_fence(fence.raw_handle());
        assert_eq!(fence.wait(u64::MAX).expect("wait"), Status::Success);
        assert_eq!(fence.status().expect("status"), FenceState::Signaled);
    }

    #[test]
    fn unbounded_wait_on_unsubmitted_fence_is_refused() {
        let (device, mock) = mock_device();
        let fence = Fence::new(&device, false, None).expect("fence");
        assert!(matches!(
            fence.wait(u64::MAX),
            Err(WaitFenceError::NeverSubmitted)
        ));
        assert_eq!(mock.count_calls("wait_for_raw_fences"), 0);
    }

    #[test]
    fn resetting_unsignaled_fence_is_noop() {
        let (device, mock) = mock_device();
        let mut fence = Fence::new(&device, false, None).expect("fence");
        fence.reset().expect("reset");
        assert_eq!(mock.count_calls("reset_raw_fences"), 0);
    }

    #[test]
    fn resetting_pending_fence_is_refused() {
        let (device, mock) = mock_device();
        let mut fence = Fence::new(&device, false, None).expect("fence");
        fence.mark_submitted();
        assert!(matches!(fence.reset(), Err(ResetFenceError::StillPending)));

        mock.signal_fence(fence.raw_handle());
        fence.reset().expect("reset after signal");
        assert_eq!(fence.status().expect("status"), FenceState::Unsignaled);
    }

    #[test]
    fn wait_and_reset_leaves_timed_out_fence_alone() {
        let (device, mock) = mock_device();
        let mut fence = Fence::new(&device, false, None).expect("fence");
        fence.mark_submitted();
        assert_eq!(fence.wait_and_reset(1_000).expect("wait"), Status::NotReady);
        assert_eq!(mock.count_calls("reset_raw_fences"), 0);

        mock.signal_fence(fence.raw_handle());
        assert_eq!(fence.wait_and_reset(1_000).expect("wait"), Status::Success);
        assert_eq!(fence.status().expect("status"), FenceState::Unsignaled);
    }

    #[test]
    fn device_wait_for_any_fence() {
        let (device, mock) = mock_device();
        let a = Fence::new(&device, false, None).expect("fence");
        let b = Fence::new(&device, false, None).expect("fence");
        a.mark_submitted();
        b.mark_submitted();

        assert_eq!(
            device.wait_for_fences(&[&a, &b], false, 0).expect("wait"),
            Status::NotReady
        );

        mock.signal_fence(b.raw_handle());
        assert_eq!(
            device.wait_for_fences(&[&a, &b], false, 0).expect("wait"),
            Status::Success
        );
        assert_eq!(a.status().expect("status"), FenceState::Pending);
        assert_eq!(b.status().expect("status"), FenceState::Signaled);
        assert_eq!(
            device.wait_for_fences(&[&a, &b], true, 0).expect("wait"),
            Status::NotReady
        );
    }

    #[test]
    #[should_panic(expected = "at least one fence")]
    fn waiting_on_no_fences_panics() {
        let (device, _mock) = mock_device();
        let _ = device.wait_for_fences(&[], true, 0);
    }

    #[test]
    #[should_panic(expected = "must be reset before it is submitted")]
    fn submitting_signaled_fence_panics() {
        let (device, _mock) = mock_device();
        let fence = Fence::new(&device, true, None).expect("fence");
        fence.mark_submitted();
    }

    #[test]
    fn semaphore_lifecycle() {
        let (device, mock) = mock_device();
        let semaphore = Semaphore::new(&device, Some("image available")).expect("semaphore");
        assert_ne!(semaphore.raw_handle(), vk::Semaphore::null());
        drop(semaphore);
        assert_eq!(mock.count_calls("destroy_raw_semaphore"), 1);
    }

    #[test]
    fn failed_debug_names_do_not_fail_construction() {
        let (device, mock) = mock_device();
        mock.set_debug_utils(true);

        mock.fail_next("set_raw_object_name", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let fence = Fence::new(&device, false, Some("upload fence")).expect("fence");
        mock.fail_next("set_raw_object_name", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let semaphore = Semaphore::new(&device, Some("render finished")).expect("semaphore");
        assert_eq!(mock.count_calls("set_raw_object_name"), 2);

        let named: Vec<u64> = mock
            .calls()
            .into_iter()
            .filter(|c| c.name == "set_raw_object_name")
            .map(|c| c.handles[1])
            .collect();
        assert_eq!(
            named,
            vec![fence.raw_handle().as_raw(), semaphore.raw_handle().as_raw()]
        );
    }
}
