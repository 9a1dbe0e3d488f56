//! Descriptor set layout, pool, and set wrappers.
//!
//! [`DescriptorSetLayout`] describes the binding slots within a
//! descriptor set. [`DescriptorPool`] allocates descriptor sets from a
//! fixed-size pool. [`DescriptorSet`] is a handle to an allocated set; its
//! memory belongs to the pool.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::device::Device;
use crate::image::ImageView;
use crate::sampler::Sampler;

#[derive(Debug, Error)]
pub enum CreateDescriptorSetLayoutError {
    #[error("Duplicate descriptor binding {0}")]
    DuplicateBinding(u32),
    #[error("Vulkan error creating descriptor set layout: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateDescriptorPoolError {
    #[error("Descriptor pool must allow at least one set")]
    ZeroSets,
    #[error("Vulkan error creating descriptor pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateDescriptorSetError {
    #[error("Descriptor pool exhausted: {0}")]
    OutOfPoolMemory(vk::Result),
    #[error("Vulkan error allocating descriptor sets: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
#[error("Vulkan error resetting descriptor pool: {0}")]
pub struct ResetDescriptorPoolError(pub vk::Result);

// ---------------------------------------------------------------------------
// DescriptorBindingDesc
// ---------------------------------------------------------------------------

/// Describes a single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    /// Binding slot index used by the shader.
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length of the binding.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl From<DescriptorBindingDesc> for vk::DescriptorSetLayoutBinding<'static> {
    fn from(b: DescriptorBindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.descriptor_type)
            .descriptor_count(b.count)
            .stage_flags(b.stage_flags)
    }
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

/// An owned `VkDescriptorSetLayout` plus the bindings it was built from.
pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBindingDesc>,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("bindings", &self.bindings.len())
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBindingDesc],
        name: Option<&str>,
    ) -> Result<Self, CreateDescriptorSetLayoutError> {
        for (i, b) in bindings.iter().enumerate() {
            if bindings[..i].iter().any(|prev| prev.binding == b.binding) {
                return Err(CreateDescriptorSetLayoutError::DuplicateBinding(b.binding));
            }
        }

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: create_info borrows vk_bindings for the duration of the call.
        let handle = unsafe {
            device
                .dispatch()
                .create_raw_descriptor_set_layout(&create_info)
        }
        .map_err(CreateDescriptorSetLayoutError::Vulkan)?;
        device.apply_debug_name(handle, name, "descriptor set layout");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bindings: bindings.to_vec(),
        })
    }

    pub fn raw_handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[DescriptorBindingDesc] {
        &self.bindings
    }

    fn binding(&self, binding: u32) -> Option<&DescriptorBindingDesc> {
        self.bindings.iter().find(|b| b.binding == binding)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: Owned handle. Sets allocated with it keep an Arc to it, so
        // none of them are alive any more.
        unsafe {
            self.parent
                .dispatch()
                .destroy_raw_descriptor_set_layout(self.handle)
        };
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

/// An owned `VkDescriptorPool`.
///
/// Sets allocated from the pool borrow it, so the pool cannot be dropped or
/// [`reset`](Self::reset) while any of them is still alive.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
    max_sets: u32,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("max_sets", &self.max_sets)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    /// `max_sets` is the total number of descriptor sets that may be
    /// allocated from this pool. `pool_sizes` gives the capacity per
    /// descriptor type.
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        name: Option<&str>,
    ) -> Result<Self, CreateDescriptorPoolError> {
        if max_sets == 0 {
            return Err(CreateDescriptorPoolError::ZeroSets);
        }
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        // SAFETY: create_info borrows pool_sizes for the duration of the call.
        let handle = unsafe { device.dispatch().create_raw_descriptor_pool(&create_info) }
            .map_err(CreateDescriptorPoolError::Vulkan)?;
        device.apply_debug_name(handle, name, "descriptor pool");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            max_sets,
        })
    }

    /// Allocate one descriptor set per layout, in order.
    pub fn allocate_sets(
        &self,
        layouts: &[&Arc<DescriptorSetLayout>],
    ) -> Result<Vec<DescriptorSet<'_>>, AllocateDescriptorSetError> {
        if layouts.is_empty() {
            return Ok(Vec::new());
        }
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            layouts.iter().map(|l| l.raw_handle()).collect();
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&raw_layouts);
        // SAFETY: alloc_info references this pool and layouts created from
        // the same device.
        let raw_sets = unsafe { self.parent.dispatch().allocate_raw_descriptor_sets(&alloc_info) }
            .map_err(|e| match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    AllocateDescriptorSetError::OutOfPoolMemory(e)
                }
                other => AllocateDescriptorSetError::Vulkan(other),
            })?;

        Ok(raw_sets
            .into_iter()
            .zip(layouts)
            .map(|(handle, layout)| DescriptorSet {
                pool: self,
                layout: Arc::clone(layout),
                handle,
            })
            .collect())
    }

    /// Return every set to the pool at once.
    ///
    /// Takes `&mut self`, so no [`DescriptorSet`] borrowed from the pool can
    /// still exist. Sets must not be in use by pending GPU work.
    pub fn reset(&mut self) -> Result<(), ResetDescriptorPoolError> {
        // SAFETY: No set handles from this pool remain on the host side.
        unsafe { self.parent.dispatch().reset_raw_descriptor_pool(self.handle) }
            .map_err(ResetDescriptorPoolError)
    }

    pub fn raw_handle(&self) -> vk::DescriptorPool {
        self.handle
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: Owned handle. In-flight GPU work referencing sets from
        // this pool must be complete before drop.
        unsafe { self.parent.dispatch().destroy_raw_descriptor_pool(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorSet
// ---------------------------------------------------------------------------

/// A descriptor set allocated from a [`DescriptorPool`].
///
/// Returned to the pool on drop. Writes check the binding exists in the
/// layout and has the matching descriptor type.
pub struct DescriptorSet<'pool> {
    pool: &'pool DescriptorPool,
    layout: Arc<DescriptorSetLayout>,
    handle: vk::DescriptorSet,
}

impl std::fmt::Debug for DescriptorSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSet<'_> {
    pub fn raw_handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    fn check_binding(&self, binding: u32, allowed: &[vk::DescriptorType]) -> vk::DescriptorType {
        let Some(desc) = self.layout.binding(binding) else {
            panic!("descriptor set layout has no binding {binding}");
        };
        assert!(
            allowed.contains(&desc.descriptor_type),
            "binding {binding} is {:?}, not one of {allowed:?}",
            desc.descriptor_type
        );
        desc.descriptor_type
    }

    /// Point `binding` at `range` bytes of `buffer` starting at `offset`.
    ///
    /// The binding must be a uniform or storage buffer (dynamic or not).
    ///
    /// # Safety
    /// The set must not be bound in pending GPU work. `buffer` must stay
    /// alive for as long as the set is used by submitted command buffers.
    pub unsafe fn write_buffer(
        &self,
        binding: u32,
        buffer: &dyn BufferHandle,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let ty = self.check_binding(
            binding,
            &[
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            ],
        );
        assert!(
            offset.saturating_add(range) <= buffer.buffer_size(),
            "descriptor range {offset}+{range} exceeds buffer size {}",
            buffer.buffer_size()
        );
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.raw_buffer())
            .offset(offset)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: Guaranteed by the caller; the write borrows buffer_info.
        unsafe {
            self.pool
                .parent
                .dispatch()
                .update_raw_descriptor_sets(std::slice::from_ref(&write))
        }
    }

    /// Point a combined image sampler binding at `view` and `sampler`.
    ///
    /// # Safety
    /// The set must not be bound in pending GPU work. The image must be in
    /// `layout` whenever shaders read it, and `view` and `sampler` must stay
    /// alive for as long as the set is used by submitted command buffers.
    pub unsafe fn write_combined_image_sampler(
        &self,
        binding: u32,
        view: &ImageView,
        sampler: &Sampler,
        layout: vk::ImageLayout,
    ) {
        self.check_binding(binding, &[vk::DescriptorType::COMBINED_IMAGE_SAMPLER]);
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view.raw_handle())
            .sampler(sampler.raw_handle())
            .image_layout(layout);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(&image_info));
        // SAFETY: Guaranteed by the caller; the write borrows image_info.
        unsafe {
            self.pool
                .parent
                .dispatch()
                .update_raw_descriptor_sets(std::slice::from_ref(&write))
        }
    }
}

impl Drop for DescriptorSet<'_> {
    fn drop(&mut self) {
        // SAFETY: The pool was created with FREE_DESCRIPTOR_SET and outlives
        // this borrow; the set must not be in use by pending GPU work.
        let result = unsafe {
            self.pool
                .parent
                .dispatch()
                .free_raw_descriptor_sets(self.pool.handle, std::slice::from_ref(&self.handle))
        };
        if let Err(e) = result {
            tracing::error!("Failed to free descriptor set {:?}: {e}", self.handle);
        }
    }
}
