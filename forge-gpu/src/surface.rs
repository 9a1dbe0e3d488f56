//! Presentable surfaces and the window contract they are built from.

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::{Instance, PhysicalDevice};

/// What the GPU core needs from a window: native handles for surface
/// creation and the current drawable size in pixels.
///
/// Event handling stays with the windowing layer; nothing here polls.
pub trait Window: HasDisplayHandle + HasWindowHandle {
    fn extent(&self) -> vk::Extent2D;
}

impl<T: Window + ?Sized> Window for Arc<T> {
    fn extent(&self) -> vk::Extent2D {
        (**self).extent()
    }
}

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan surface creation failed: {0}")]
    VulkanError(vk::Result),
    #[error(
        "Parent instance did not have the surface extensions \
         for this platform loaded"
    )]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error checking surface support: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error querying surface: {0}")]
    Vulkan(vk::Result),
}

/// Everything a swapchain needs to know about a surface on one adapter.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// A `VkSurfaceKHR` bound to the window it was created from.
///
/// Holds the window source alive so the native handles stay valid for as
/// long as the surface does.
pub struct Surface<T: Window> {
    parent_instance: Arc<Instance>,
    handle: vk::SurfaceKHR,
    source: Arc<T>,
}

impl<T: Window> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("parent", &self.parent_instance)
            .finish_non_exhaustive()
    }
}

impl<T: Window> Surface<T> {
    /// Create a surface for `source`.
    ///
    /// # Safety
    /// The surface must be dropped when the platform invalidates it (for
    /// example on a winit suspend event). No in-flight GPU work may reference
    /// resources derived from it when it is dropped.
    pub unsafe fn new(
        instance: &Arc<Instance>,
        source: Arc<T>,
    ) -> Result<Self, CreateSurfaceError> {
        // SAFETY: We hold Arc references to the instance and source, so both
        // outlive the surface.
        let handle = unsafe { instance.create_raw_surface(&*source) }?;
        Ok(Self {
            parent_instance: Arc::clone(instance),
            handle,
            source,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent_instance
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn source(&self) -> &Arc<T> {
        &self.source
    }

    /// Current drawable size reported by the window.
    pub fn window_extent(&self) -> vk::Extent2D {
        self.source.extent()
    }

    /// Check if a queue family on `physical_device` can present here.
    ///
    /// # Safety
    /// `physical_device` must be derived from the same instance as this
    /// surface.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceSupportError> {
        // SAFETY: Caller guarantees provenance; self.handle is valid.
        unsafe {
            self.parent_instance.get_raw_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    /// Query capabilities, formats and present modes in one go.
    ///
    /// # Safety
    /// `physical_device` must be derived from the same instance as this
    /// surface.
    pub unsafe fn query_support(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<SurfaceSupport, SurfaceQueryError> {
        // SAFETY: Caller guarantees provenance.
        let capabilities = unsafe {
            self.parent_instance
                .get_surface_capabilities(physical_device, self.handle)
        }?;
        // SAFETY: as above.
        let formats = unsafe {
            self.parent_instance
                .get_surface_formats(physical_device, self.handle)
        }?;
        // SAFETY: as above.
        let present_modes = unsafe {
            self.parent_instance
                .get_surface_present_modes(physical_device, self.handle)
        }?;
        Ok(SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Whether any queue family of `physical_device` can present here.
    ///
    /// Meant as a filter for
    /// [`Instance::pick_physical_device`](crate::instance::Instance::pick_physical_device).
    pub fn is_presentable_from(&self, physical_device: &PhysicalDevice) -> bool {
        (0..physical_device.capabilities().queue_families.len() as u32).any(|family| {
            // SAFETY: physical_device was enumerated by our parent instance.
            unsafe { self.supports_queue_family(physical_device.raw_handle(), family) }
                .unwrap_or(false)
        })
    }
}

impl<T: Window> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        // SAFETY: All derived swapchains hold an Arc to us and are gone.
        let _ = unsafe { self.parent_instance.destroy_raw_surface(self.handle) }
            .inspect_err(|e| {
                tracing::error!("Error while dropping surface {:?}: {e}", self.handle)
            });
    }
}
