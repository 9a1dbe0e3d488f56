//! GPU buffer types and the [`BufferHandle`] trait.
//!
//! - [`HostVisibleBuffer`]: CPU-writable (`CpuToGpu`) memory for staging and
//!   small per-frame data. Write with
//!   [`write_pod`](HostVisibleBuffer::write_pod).
//! - [`DeviceLocalBuffer`]: GPU-only memory, filled by a recorded copy.
//!
//! Both own their allocation from the device allocator and release it on
//! drop.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::command::CommandBuffer;
use crate::device::{Device, MemoryUsage};

/// Types that expose a raw `VkBuffer` and its size.
///
/// Command recording takes `&dyn BufferHandle`, so both wrappers (and
/// borrows of them) can be bound or copied.
pub trait BufferHandle {
    fn raw_buffer(&self) -> vk::Buffer;
    fn buffer_size(&self) -> vk::DeviceSize;
}

impl<T> BufferHandle for &T
where
    T: BufferHandle + ?Sized,
{
    fn raw_buffer(&self) -> vk::Buffer {
        (*self).raw_buffer()
    }

    fn buffer_size(&self) -> vk::DeviceSize {
        (*self).buffer_size()
    }
}

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),
    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),
    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum WriteBufferError {
    #[error("Data size ({data_bytes} bytes) exceeds buffer size ({buffer_bytes} bytes)")]
    DataTooLarge {
        data_bytes: usize,
        buffer_bytes: vk::DeviceSize,
    },
    #[error("Vulkan error flushing mapped memory: {0}")]
    FlushMemory(vk::Result),
    #[error("Allocation is not host-mapped")]
    NotMapped,
}

#[derive(Debug, Error)]
pub enum UploadBufferError {
    #[error(
        "Copy region out of bounds: src(size={src_size}, offset={src_offset}), \
         dst(size={dst_size}, offset={dst_offset}), copy={copy_size}"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    },
}

struct AllocatedBuffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl std::fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl AllocatedBuffer {
    fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
        memory_usage: MemoryUsage,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let dispatch = device.dispatch();
        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { dispatch.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;
        device.apply_debug_name(handle, name, "buffer");

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { dispatch.get_raw_buffer_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("buffer"), reqs, memory_usage, true)
            .map_err(|e| {
                // SAFETY: handle is unbound and owned by this scope.
                unsafe { dispatch.destroy_raw_buffer(handle) };
                CreateBufferError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation belong to this device.
        let bind_result = unsafe {
            dispatch.bind_raw_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            let _ = device.free_memory(allocation);
            // SAFETY: handle is owned by this scope.
            unsafe { dispatch.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            size,
        })
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: Owned handle; no pending GPU work may reference it.
        unsafe { self.parent.dispatch().destroy_raw_buffer(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

/// A CPU-writable buffer backed by `CpuToGpu` memory.
#[derive(Debug)]
pub struct HostVisibleBuffer {
    inner: AllocatedBuffer,
}

impl HostVisibleBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(device, size, usage, name, MemoryUsage::CpuToGpu)?,
        })
    }

    /// Copy `data` to the start of the buffer, flushing non-coherent memory.
    pub fn write_pod<T: Pod>(&mut self, data: &[T]) -> Result<(), WriteBufferError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.inner.size {
            return Err(WriteBufferError::DataTooLarge {
                data_bytes: bytes.len(),
                buffer_bytes: self.inner.size,
            });
        }

        let allocation = self
            .inner
            .allocation
            .as_ref()
            .ok_or(WriteBufferError::NotMapped)?;
        let mapped_ptr = allocation.mapped_ptr().ok_or(WriteBufferError::NotMapped)?;

        // SAFETY: mapped_ptr points at host-visible memory at least
        // self.inner.size bytes long; bytes.len() was bounds-checked.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped_ptr.as_ptr().cast::<u8>(),
                bytes.len(),
            );
        }

        let is_coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if !is_coherent && !bytes.is_empty() {
            let atom = self.inner.parent.non_coherent_atom_size().max(1);
            // Device::allocate_memory rounds non-coherent allocations to the
            // atom, so this stays within the allocation.
            let flush_size = (bytes.len() as vk::DeviceSize).div_ceil(atom) * atom;
            let flush_range = vk::MappedMemoryRange::default()
                // SAFETY: The allocation is live while self is.
                .memory(unsafe { allocation.memory() })
                .offset(allocation.offset())
                .size(flush_size);
            // SAFETY: flush_range covers mapped memory of this device.
            unsafe {
                self.inner
                    .parent
                    .dispatch()
                    .flush_raw_mapped_memory_ranges(std::slice::from_ref(&flush_range))
            }
            .map_err(WriteBufferError::FlushMemory)?;
        }
        Ok(())
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }
}

impl BufferHandle for HostVisibleBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }

    fn buffer_size(&self) -> vk::DeviceSize {
        self.inner.size
    }
}

/// A GPU-only buffer backed by `GpuOnly` memory.
#[derive(Debug)]
pub struct DeviceLocalBuffer {
    inner: AllocatedBuffer,
}

impl DeviceLocalBuffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        Ok(Self {
            inner: AllocatedBuffer::new(device, size, usage, name, MemoryUsage::GpuOnly)?,
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.inner.parent
    }

    /// Record a copy of `copy_size` bytes from `src` into this buffer.
    ///
    /// Bounds are checked here; the caller owns begin/end/submit and keeps
    /// both buffers alive until the copy has executed.
    pub fn record_upload_region_from(
        &self,
        command_buffer: &mut CommandBuffer,
        src: &HostVisibleBuffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        copy_size: vk::DeviceSize,
    ) -> Result<(), UploadBufferError> {
        if src_offset.saturating_add(copy_size) > src.size()
            || dst_offset.saturating_add(copy_size) > self.size()
        {
            return Err(UploadBufferError::RegionOutOfBounds {
                src_size: src.size(),
                src_offset,
                dst_size: self.size(),
                dst_offset,
                copy_size,
            });
        }
        command_buffer.copy_buffer(
            src,
            self,
            &[vk::BufferCopy {
                src_offset,
                dst_offset,
                size: copy_size,
            }],
        );
        Ok(())
    }
}

impl BufferHandle for DeviceLocalBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.inner.handle
    }

    fn buffer_size(&self) -> vk::DeviceSize {
        self.inner.size
    }
}
