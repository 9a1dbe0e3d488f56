//! Images, image views and texture upload.
//!
//! [`DeviceLocalImage`] wraps a 2-D `VkImage` in `GpuOnly` memory.
//! [`Texture::upload`] fills one from an [`ImageSource`] by staging the
//! pixels in a [`HostVisibleBuffer`], recording the copy between two layout
//! transitions and waiting on a fence for completion.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::buffer::{CreateBufferError, HostVisibleBuffer, WriteBufferError};
use crate::command::{AllocateCommandBufferError, CommandBufferLevel, CommandPool, RecordError};
use crate::device::{Device, MemoryUsage};
use crate::queue::{Queue, SubmitError, SubmitInfo};
use crate::sync::{CreateFenceError, Fence, WaitFenceError};

/// Decoded pixels handed to the GPU core by an image codec.
///
/// Rows are tightly packed; `data().len()` must equal
/// `width * height * channel_count * bytes_per_channel`.
pub trait ImageSource {
    fn extent(&self) -> vk::Extent2D;
    fn data(&self) -> &[u8];
    fn format(&self) -> vk::Format;
    fn channel_count(&self) -> u32;
    fn bytes_per_channel(&self) -> u32;

    fn size(&self) -> usize {
        self.data().len()
    }
}

/// Byte length `source` must have for its extent and pixel layout.
pub fn expected_byte_len(source: &(impl ImageSource + ?Sized)) -> u64 {
    let extent = source.extent();
    u64::from(extent.width)
        * u64::from(extent.height)
        * u64::from(source.channel_count())
        * u64::from(source.bytes_per_channel())
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),
    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),
    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateImageViewError {
    #[error("Vulkan error creating image view: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum UploadImageError {
    #[error("Image data is {actual} bytes but its extent and format need {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Failed to create staging buffer: {0}")]
    Staging(#[from] CreateBufferError),
    #[error("Failed to fill staging buffer: {0}")]
    WriteStaging(#[from] WriteBufferError),
    #[error("Failed to create image: {0}")]
    CreateImage(#[from] CreateImageError),
    #[error("Failed to create image view: {0}")]
    CreateView(#[from] CreateImageViewError),
    #[error("Failed to allocate upload command buffer: {0}")]
    CommandBuffer(#[from] AllocateCommandBufferError),
    #[error("Failed to record upload: {0}")]
    Record(#[from] RecordError),
    #[error("Failed to create upload fence: {0}")]
    Fence(#[from] CreateFenceError),
    #[error("Upload submission failed: {0}")]
    Submit(#[from] SubmitError),
    #[error("Waiting for the upload failed: {0}")]
    Wait(#[from] WaitFenceError),
}

// ---------------------------------------------------------------------------
// DeviceLocalImage
// ---------------------------------------------------------------------------

/// A 2-D optimal-tiling image in `GpuOnly` memory.
pub struct DeviceLocalImage {
    parent: Arc<Device>,
    handle: vk::Image,
    allocation: Option<Allocation>,
    extent: vk::Extent3D,
    format: vk::Format,
}

impl std::fmt::Debug for DeviceLocalImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLocalImage")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl DeviceLocalImage {
    pub fn new(
        device: &Arc<Device>,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateImageError> {
        let extent = vk::Extent3D {
            width,
            height,
            depth: 1,
        };
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let dispatch = device.dispatch();
        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { dispatch.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;
        device.apply_debug_name(handle, name, "image");

        // SAFETY: handle is a valid image of this device.
        let reqs = unsafe { dispatch.get_raw_image_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("image"), reqs, MemoryUsage::GpuOnly, false)
            .map_err(|e| {
                // SAFETY: handle is unbound and owned by this scope.
                unsafe { dispatch.destroy_raw_image(handle) };
                CreateImageError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation belong to this device.
        let bind_result = unsafe {
            dispatch.bind_raw_image_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            let _ = device.free_memory(allocation);
            // SAFETY: handle is owned by this scope.
            unsafe { dispatch.destroy_raw_image(handle) };
            return Err(CreateImageError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            extent,
            format,
        })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for DeviceLocalImage {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: Owned handle; no pending GPU work may reference it.
        unsafe { self.parent.dispatch().destroy_raw_image(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU image allocation: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// ImageView
// ---------------------------------------------------------------------------

/// An owned 2-D `VkImageView`.
pub struct ImageView {
    parent: Arc<Device>,
    handle: vk::ImageView,
    format: vk::Format,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    pub fn new(
        device: &Arc<Device>,
        image: &DeviceLocalImage,
        aspect_mask: vk::ImageAspectFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        // SAFETY: image is a live image of this device.
        unsafe { Self::for_raw_image(device, image.raw_image(), image.format(), aspect_mask, name) }
    }

    /// Create a view of an image the caller owns elsewhere (for example a
    /// swapchain image).
    ///
    /// # Safety
    /// `image` must be a live image of `device` with `format`, and must
    /// outlive the view.
    pub unsafe fn for_raw_image(
        device: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        // SAFETY: Caller guarantees the image is live and of this device.
        let handle = unsafe { device.dispatch().create_raw_image_view(&create_info) }
            .map_err(CreateImageViewError::Vulkan)?;
        device.apply_debug_name(handle, name, "image view");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            format,
        })
    }

    pub fn raw_handle(&self) -> vk::ImageView {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.handle);
        // SAFETY: Owned handle; no pending GPU work may reference it.
        unsafe { self.parent.dispatch().destroy_raw_image_view(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Texture
// ---------------------------------------------------------------------------

/// A sampled image and its view, ready for `SHADER_READ_ONLY_OPTIMAL` use.
#[derive(Debug)]
pub struct Texture {
    view: ImageView,
    image: DeviceLocalImage,
}

impl Texture {
    /// Upload `source` into a new device-local image.
    ///
    /// Blocks until the copy has finished on `queue`. The size check runs
    /// before anything is created.
    pub fn upload(
        device: &Arc<Device>,
        pool: &CommandPool,
        queue: &Queue,
        source: &(impl ImageSource + ?Sized),
        name: Option<&str>,
    ) -> Result<Self, UploadImageError> {
        let expected = expected_byte_len(source);
        let actual = source.size() as u64;
        if expected != actual {
            return Err(UploadImageError::SizeMismatch { expected, actual });
        }
        let extent = source.extent();
        let _span = tracing::debug_span!("texture_upload", width = extent.width, height = extent.height)
            .entered();

        let mut staging = HostVisibleBuffer::new(
            device,
            actual.max(1),
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some("texture staging"),
        )?;
        staging.write_pod(source.data())?;

        let image = DeviceLocalImage::new(
            device,
            extent.width,
            extent.height,
            source.format(),
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            name,
        )?;

        let mut command_buffer = pool.allocate(CommandBufferLevel::Primary)?;
        command_buffer.begin(true, None)?;
        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(image.extent());
        // SAFETY: image is a fresh image of this device; the staging buffer
        // holds exactly the bytes the region covers.
        unsafe {
            command_buffer.transition_image_layout(
                image.raw_image(),
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            command_buffer.copy_buffer_to_image(
                &staging,
                image.raw_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            command_buffer.transition_image_layout(
                image.raw_image(),
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        }
        command_buffer.end()?;

        let fence = Fence::new(device, false, Some("texture upload"))?;
        queue.submit(
            &[SubmitInfo {
                command_buffers: &[&command_buffer],
                ..Default::default()
            }],
            Some(&fence),
        )?;
        fence.wait(u64::MAX)?;

        let view = ImageView::new(device, &image, vk::ImageAspectFlags::COLOR, name)?;
        Ok(Self { view, image })
    }

    pub fn image(&self) -> &DeviceLocalImage {
        &self.image
    }

    pub fn view(&self) -> &ImageView {
        &self.view
    }
}
