//! Swapchains: image acquisition and the surface binding.
//!
//! [`SwapchainImages`] owns the native swapchain, its images and one view
//! per image, and does the acquiring. [`Swapchain`] adds the surface it was
//! created for and knows how to rebuild itself on resize.

use std::ops::Deref;
use std::sync::{Arc, Mutex};

use ash::vk;
use thiserror::Error;

use crate::capabilities::QueueRole;
use crate::device::Device;
use crate::image::{CreateImageViewError, ImageView};
use crate::status::Status;
use crate::surface::{Surface, SurfaceQueryError, SurfaceSupport, SurfaceSupportError, Window};
use crate::sync::{Fence, Semaphore};

/// Anything [`Queue::present`](crate::queue::Queue::present) can present.
pub trait SwapchainHandle {
    fn raw_swapchain(&self) -> vk::SwapchainKHR;
    fn image_count(&self) -> u32;
}

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Mismatched parameters to Swapchain::new. \
         Device and surface must be derived from the same instance"
    )]
    MismatchedParams,
    #[error("Swapchain support was not enabled on this device")]
    SwapchainNotEnabled,
    #[error("The graphics queue family cannot present to this surface")]
    NoPresentQueue,
    #[error("Invalid swapchain extent ({width}x{height})")]
    InvalidExtent { width: u32, height: u32 },
    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,
    #[error("No supported present modes were reported")]
    NoPresentModes,
    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),
    #[error("Failed while checking present support: {0}")]
    SurfaceSupport(#[from] SurfaceSupportError),
    #[error("Vulkan error creating swapchain: {0}")]
    Vulkan(vk::Result),
    #[error("Vulkan error fetching swapchain images: {0}")]
    GetImages(vk::Result),
    #[error("Failed to create swapchain image view: {0}")]
    ImageView(#[from] CreateImageViewError),
}

#[derive(Debug, Error)]
pub enum AcquireImageError {
    #[error("Vulkan error acquiring swapchain image: {0}")]
    Vulkan(vk::Result),
}

/// Creation parameters for a [`Swapchain`].
///
/// Preferences fall back when the surface does not support them: the format
/// to `B8G8R8A8_UNORM`/sRGB-nonlinear (or the first reported), the present
/// mode to `MAILBOX` and then `FIFO`.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainInfo {
    pub desired_extent: vk::Extent2D,
    pub preferred_format: Option<vk::Format>,
    pub preferred_present_mode: Option<vk::PresentModeKHR>,
}

/// Result of [`SwapchainImages::acquire_next_image`].
///
/// `image_index` is `Some` exactly when the status says the image may be
/// rendered into (`Success` or `Suboptimal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub status: Status,
    pub image_index: Option<u32>,
}

// ---------------------------------------------------------------------------
// Selection helpers
// ---------------------------------------------------------------------------

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred_format: Option<vk::Format>,
) -> Option<vk::SurfaceFormatKHR> {
    if let Some(preferred) = preferred_format
        && let Some(found) = formats.iter().copied().find(|f| f.format == preferred)
    {
        return Some(found);
    }

    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preferred
        .into_iter()
        .chain([vk::PresentModeKHR::MAILBOX])
        .find(|mode| present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|mode| capabilities.supported_composite_alpha.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

// ---------------------------------------------------------------------------
// SwapchainImages
// ---------------------------------------------------------------------------

/// A native swapchain with its images and views.
///
/// Images are owned by the swapchain and are never destroyed on their own;
/// the views are destroyed before the swapchain on drop.
pub struct SwapchainImages {
    parent: Arc<Device>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    images: Vec<vk::Image>,
    views: Vec<ImageView>,
    /// Serializes `vkAcquireNextImageKHR`, which must be externally
    /// synchronized with respect to the swapchain handle.
    acquire_lock: Mutex<()>,
}

impl std::fmt::Debug for SwapchainImages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapchainImages")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl SwapchainImages {
    /// Create a swapchain for `surface` from already-queried support details.
    ///
    /// # Safety
    /// `surface` must be a live surface of the device's instance, `support`
    /// must describe it on the device's adapter, and `old_swapchain` must be
    /// null or a live swapchain of this device created for the same surface.
    pub unsafe fn create(
        device: &Arc<Device>,
        surface: vk::SurfaceKHR,
        support: &SurfaceSupport,
        info: &SwapchainInfo,
        old_swapchain: vk::SwapchainKHR,
        name: Option<&str>,
    ) -> Result<Self, CreateSwapchainError> {
        if !device.has_swapchain_support() {
            return Err(CreateSwapchainError::SwapchainNotEnabled);
        }
        let Some(surface_format) = choose_surface_format(&support.formats, info.preferred_format)
        else {
            return Err(CreateSwapchainError::NoSurfaceFormats);
        };
        if support.present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }
        let present_mode = choose_present_mode(&support.present_modes, info.preferred_present_mode);
        let capabilities = &support.capabilities;
        let extent = choose_extent(capabilities, info.desired_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: extent.width,
                height: extent.height,
            });
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(choose_image_count(capabilities))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(choose_composite_alpha(capabilities))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let dispatch = device.dispatch();
        // SAFETY: Values come from the queried support details; the caller
        // guarantees the surface and old swapchain.
        let handle = unsafe { dispatch.create_raw_swapchain(&create_info) }
            .map_err(CreateSwapchainError::Vulkan)?;
        device.apply_debug_name(handle, name, "swapchain");

        // SAFETY: handle was created above.
        let images = unsafe { dispatch.get_raw_swapchain_images(handle) }.map_err(|e| {
            // SAFETY: handle was created above and nothing else refers to it.
            unsafe { dispatch.destroy_raw_swapchain(handle) };
            CreateSwapchainError::GetImages(e)
        })?;

        let mut views = Vec::with_capacity(images.len());
        for (index, image) in images.iter().copied().enumerate() {
            let view_name = name.map(|n| format!("{n} view {index}"));
            // SAFETY: image belongs to the swapchain, which outlives the
            // view: views are destroyed first on drop.
            let view = unsafe {
                ImageView::for_raw_image(
                    device,
                    image,
                    surface_format.format,
                    vk::ImageAspectFlags::COLOR,
                    view_name.as_deref(),
                )
            };
            match view {
                Ok(view) => views.push(view),
                Err(e) => {
                    drop(views);
                    // SAFETY: Views created so far were dropped above.
                    unsafe { dispatch.destroy_raw_swapchain(handle) };
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            "Created swapchain {:?}: {}x{} {:?} {:?}, {} images",
            handle,
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len()
        );

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            format: surface_format.format,
            extent,
            present_mode,
            images,
            views,
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[ImageView] {
        &self.views
    }

    /// Acquire the next presentable image.
    ///
    /// The image may only be written once `semaphore` (or `fence`) has
    /// signalled; the submission rendering into it must wait on the
    /// semaphore. A timeout is `NotReady`, and `OutOfDate` means the
    /// swapchain must be recreated; neither is an error.
    ///
    /// # Panics
    /// If both `semaphore` and `fence` are `None`, either belongs to another
    /// device, or `fence` has not been reset.
    pub fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: Option<&Semaphore>,
        fence: Option<&Fence>,
    ) -> Result<AcquiredImage, AcquireImageError> {
        assert!(
            semaphore.is_some() || fence.is_some(),
            "acquire needs a semaphore or a fence to signal"
        );
        if let Some(semaphore) = semaphore {
            assert!(
                Arc::ptr_eq(semaphore.parent(), &self.parent),
                "semaphore belongs to a different device"
            );
        }
        if let Some(fence) = fence {
            assert!(
                Arc::ptr_eq(fence.parent(), &self.parent),
                "fence belongs to a different device"
            );
            fence.mark_submitted();
        }

        let result = {
            let _guard = self.acquire_lock.lock().expect("swapchain acquire lock poisoned");
            // SAFETY: Handles are live objects of this device (asserted); the
            // lock serialises access to the swapchain.
            unsafe {
                self.parent.dispatch().acquire_next_raw_image(
                    self.handle,
                    timeout_ns,
                    semaphore.map_or(vk::Semaphore::null(), Semaphore::raw_handle),
                    fence.map_or(vk::Fence::null(), Fence::raw_handle),
                )
            }
        };

        let acquired = match result {
            Ok((index, suboptimal)) => {
                let status = if suboptimal {
                    Status::Suboptimal
                } else {
                    Status::Success
                };
                return Ok(AcquiredImage {
                    status,
                    image_index: Some(index),
                });
            }
            Err(e) => match Status::from_vk(e) {
                Some(status @ (Status::NotReady | Status::OutOfDate)) => Ok(AcquiredImage {
                    status,
                    image_index: None,
                }),
                _ => Err(AcquireImageError::Vulkan(e)),
            },
        };
        // Nothing will signal the fence.
        if let Some(fence) = fence {
            fence.mark_unsubmitted();
        }
        acquired
    }
}

impl SwapchainHandle for SwapchainImages {
    fn raw_swapchain(&self) -> vk::SwapchainKHR {
        self.handle
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }
}

impl Drop for SwapchainImages {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        // Views first: they reference the swapchain's images.
        self.views.clear();
        // SAFETY: Owned handle; the owner synchronised with the GPU (for
        // example via device wait idle) before dropping.
        unsafe { self.parent.dispatch().destroy_raw_swapchain(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Swapchain
// ---------------------------------------------------------------------------

/// A [`SwapchainImages`] bound to the [`Surface`] it presents to.
///
/// Dereferences to [`SwapchainImages`] for acquisition and image access.
pub struct Swapchain<T: Window> {
    images: SwapchainImages,
    surface: Arc<Surface<T>>,
    info: SwapchainInfo,
    name: Option<String>,
}

impl<T: Window> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("images", &self.images)
            .field("surface", &self.surface)
            .finish_non_exhaustive()
    }
}

impl<T: Window> Swapchain<T> {
    pub fn new(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        info: SwapchainInfo,
        name: Option<&str>,
    ) -> Result<Self, CreateSwapchainError> {
        Self::create(device, surface, info, vk::SwapchainKHR::null(), name.map(str::to_owned))
    }

    /// Build a replacement for `extent`, handing this swapchain to the
    /// driver as the old one.
    ///
    /// Images of `self` that were acquired but not presented must not be
    /// used afterwards; drop `self` once the GPU is done with it.
    pub fn recreate(&self, extent: vk::Extent2D) -> Result<Self, CreateSwapchainError> {
        let info = SwapchainInfo {
            desired_extent: extent,
            ..self.info
        };
        tracing::debug!(
            "Recreating swapchain {:?} at {}x{}",
            self.images.handle,
            extent.width,
            extent.height
        );
        Self::create(
            &self.images.parent,
            &self.surface,
            info,
            self.images.handle,
            self.name.clone(),
        )
    }

    fn create(
        device: &Arc<Device>,
        surface: &Arc<Surface<T>>,
        info: SwapchainInfo,
        old_swapchain: vk::SwapchainKHR,
        name: Option<String>,
    ) -> Result<Self, CreateSwapchainError> {
        if !device
            .instance()
            .is_some_and(|instance| Arc::ptr_eq(instance, surface.parent()))
        {
            return Err(CreateSwapchainError::MismatchedParams);
        }
        if info.desired_extent.width == 0 || info.desired_extent.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: info.desired_extent.width,
                height: info.desired_extent.height,
            });
        }
        let Some(family) = device.queue_family(QueueRole::Graphics) else {
            return Err(CreateSwapchainError::NoPresentQueue);
        };
        let physical_device = device.raw_physical_device();
        // SAFETY: The device's adapter comes from the surface's instance
        // (checked above).
        if !unsafe { surface.supports_queue_family(physical_device, family) }? {
            return Err(CreateSwapchainError::NoPresentQueue);
        }
        // SAFETY: as above.
        let support = unsafe { surface.query_support(physical_device) }?;

        // SAFETY: surface and support belong to this device's instance and
        // adapter; old_swapchain is null or was created for this surface.
        let images = unsafe {
            SwapchainImages::create(
                device,
                surface.raw_handle(),
                &support,
                &info,
                old_swapchain,
                name.as_deref(),
            )
        }?;
        Ok(Self {
            images,
            surface: Arc::clone(surface),
            info,
            name,
        })
    }

    pub fn surface(&self) -> &Arc<Surface<T>> {
        &self.surface
    }

    pub fn info(&self) -> &SwapchainInfo {
        &self.info
    }
}

impl<T: Window> Deref for Swapchain<T> {
    type Target = SwapchainImages;

    fn deref(&self) -> &SwapchainImages {
        &self.images
    }
}

impl<T: Window> SwapchainHandle for Swapchain<T> {
    fn raw_swapchain(&self) -> vk::SwapchainKHR {
        self.images.handle
    }

    fn image_count(&self) -> u32 {
        self.images.image_count()
    }
}
