//! Non-error outcomes of waits, acquisition and presentation.
//!
//! Vulkan reports several conditions through `VkResult` that are not
//! failures: a wait that timed out, a swapchain that still works but no
//! longer matches the surface, or one that must be rebuilt. [`Status`]
//! keeps those on the `Ok` side so callers branch on them instead of
//! unwinding through an error path.

use ash::vk;

/// Outcome of an operation that can succeed in more than one way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The operation completed normally.
    Success,
    /// A wait elapsed its timeout without the awaited signal.
    NotReady,
    /// The swapchain image is usable but the swapchain should be rebuilt.
    Suboptimal,
    /// The swapchain no longer matches the surface and must be rebuilt
    /// before its images are used again.
    OutOfDate,
}

impl Status {
    /// `true` for [`Status::Suboptimal`] and [`Status::OutOfDate`].
    pub fn needs_recreate(self) -> bool {
        matches!(self, Status::Suboptimal | Status::OutOfDate)
    }

    /// `true` when an acquired image index may be rendered into.
    pub fn image_usable(self) -> bool {
        matches!(self, Status::Success | Status::Suboptimal)
    }

    /// Classify a raw result code. Returns `None` for genuine errors.
    pub fn from_vk(result: vk::Result) -> Option<Self> {
        match result {
            vk::Result::SUCCESS => Some(Status::Success),
            vk::Result::NOT_READY | vk::Result::TIMEOUT => {
                Some(Status::NotReady)
            }
            vk::Result::SUBOPTIMAL_KHR => Some(Status::Suboptimal),
            vk::Result::ERROR_OUT_OF_DATE_KHR => Some(Status::OutOfDate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Success => "success",
            Status::NotReady => "not ready",
            Status::Suboptimal => "suboptimal",
            Status::OutOfDate => "out of date",
        };
        f.write_str(text)
    }
}
