//! Device-level function table.
//!
//! Vulkan loads device entry points per logical device. Rather than calling
//! `ash::Device` from every wrapper, all device-level calls go through the
//! [`DeviceDispatch`] trait object owned by [`Device`](crate::device::Device).
//! [`AshDispatch`] is the real table; tests substitute a recording mock so
//! command recording, submission and the frame protocol can be exercised
//! without a GPU.
//!
//! Every method is a one-to-one forward of the matching Vulkan command and
//! carries that command's valid-usage rules as its safety contract. The
//! `# Safety` sections below only spell out the handle provenance rules that
//! apply to all of them.

use std::ffi::CStr;

use ash::vk;

/// One `unsafe fn` per device-level Vulkan command used by this crate.
///
/// # Safety (applies to every method)
/// - Every handle argument must have been created from the device this table
///   was loaded for and must not have been destroyed.
/// - Create-info structures must be valid per the Vulkan specification and
///   any pointers they hold must stay valid for the duration of the call.
/// - Objects requiring external synchronisation (queues, command pools,
///   command buffers, swapchains, descriptor pools) must not be used
///   concurrently from another thread.
#[allow(clippy::missing_safety_doc, clippy::too_many_arguments)]
pub trait DeviceDispatch: Send + Sync + std::fmt::Debug {
    fn raw_device(&self) -> vk::Device;

    /// Whether `VK_KHR_swapchain` entry points were loaded.
    fn has_swapchain(&self) -> bool;

    /// Whether `VK_EXT_debug_utils` object naming is available.
    fn has_debug_utils(&self) -> bool;

    unsafe fn destroy_device(&self);

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result>;

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    unsafe fn get_device_queue(&self, family: u32, index: u32) -> vk::Queue;

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result>;

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result>;

    /// Returns `Ok(true)` when the presentation was suboptimal.
    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result>;

    // -----------------------------------------------------------------------
    // Fences and semaphores
    // -----------------------------------------------------------------------

    unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result>;

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence);

    unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result>;

    unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result>;

    /// `Ok(true)` if signaled.
    unsafe fn get_raw_fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result>;

    unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result>;

    unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore);

    // -----------------------------------------------------------------------
    // Command pools and buffers
    // -----------------------------------------------------------------------

    unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result>;

    unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool);

    unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result>;

    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    );

    unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result>;

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result>;

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result>;

    // -----------------------------------------------------------------------
    // Command recording
    // -----------------------------------------------------------------------

    unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    );

    unsafe fn cmd_next_subpass(
        &self,
        command_buffer: vk::CommandBuffer,
        contents: vk::SubpassContents,
    );

    unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );

    unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );

    unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    );

    unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        first_viewport: u32,
        viewports: &[vk::Viewport],
    );

    unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        first_scissor: u32,
        scissors: &[vk::Rect2D],
    );

    unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    );

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    unsafe fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    );

    // -----------------------------------------------------------------------
    // Render passes, framebuffers, shaders and pipelines
    // -----------------------------------------------------------------------

    unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result>;

    unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass);

    unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result>;

    unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer);

    unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result>;

    unsafe fn destroy_raw_shader_module(&self, module: vk::ShaderModule);

    unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result>;

    unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// On failure, any pipelines that were created are destroyed before the
    /// error is returned.
    unsafe fn create_raw_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> Result<Vec<vk::Pipeline>, vk::Result>;

    /// Same failure contract as
    /// [`create_raw_graphics_pipelines`](Self::create_raw_graphics_pipelines).
    unsafe fn create_raw_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::ComputePipelineCreateInfo<'_>],
    ) -> Result<Vec<vk::Pipeline>, vk::Result>;

    unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline);

    unsafe fn create_raw_pipeline_cache(
        &self,
        create_info: &vk::PipelineCacheCreateInfo<'_>,
    ) -> Result<vk::PipelineCache, vk::Result>;

    unsafe fn get_raw_pipeline_cache_data(
        &self,
        cache: vk::PipelineCache,
    ) -> Result<Vec<u8>, vk::Result>;

    unsafe fn destroy_raw_pipeline_cache(&self, cache: vk::PipelineCache);

    // -----------------------------------------------------------------------
    // Descriptors
    // -----------------------------------------------------------------------

    unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result>;

    unsafe fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result>;

    unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool);

    unsafe fn reset_raw_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result>;

    unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result>;

    unsafe fn free_raw_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<(), vk::Result>;

    unsafe fn update_raw_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);

    // -----------------------------------------------------------------------
    // Buffers, images, views, samplers
    // -----------------------------------------------------------------------

    unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result>;

    unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer);

    unsafe fn get_raw_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result>;

    unsafe fn destroy_raw_image(&self, image: vk::Image);

    unsafe fn get_raw_image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result>;

    unsafe fn destroy_raw_image_view(&self, view: vk::ImageView);

    unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result>;

    unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler);

    unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result>;

    // -----------------------------------------------------------------------
    // Swapchain (VK_KHR_swapchain)
    // -----------------------------------------------------------------------

    unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result>;

    unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result>;

    unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Returns `(image_index, suboptimal)`. `TIMEOUT` and `NOT_READY` come
    /// back as `Err` alongside real errors.
    unsafe fn acquire_next_raw_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result>;

    // -----------------------------------------------------------------------
    // Debug utils
    // -----------------------------------------------------------------------

    /// No-op returning `Ok(())` when debug utils are unavailable.
    unsafe fn set_raw_object_name(
        &self,
        object_type: vk::ObjectType,
        object_handle: u64,
        name: &CStr,
    ) -> Result<(), vk::Result>;
}

// ---------------------------------------------------------------------------
// AshDispatch
// ---------------------------------------------------------------------------

/// [`DeviceDispatch`] backed by `ash`.
///
/// The swapchain and debug-utils loaders are created from the same
/// `ash::Instance` / `ash::Device` pair as the core table, and the same pair
/// is handed to the memory allocator, so every function pointer the device
/// uses comes from one load.
pub struct AshDispatch {
    device: ash::Device,
    swapchain: Option<ash::khr::swapchain::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

impl std::fmt::Debug for AshDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AshDispatch")
            .field("device", &self.device.handle())
            .field("swapchain", &self.swapchain.is_some())
            .field("debug_utils", &self.debug_utils.is_some())
            .finish()
    }
}

impl AshDispatch {
    /// Load extension tables for `device`.
    ///
    /// `swapchain` and `debug_utils` should only be set when the matching
    /// extensions were enabled on the device and instance respectively.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        swapchain: bool,
        debug_utils: bool,
    ) -> Self {
        let swapchain_loader = swapchain
            .then(|| ash::khr::swapchain::Device::new(instance, &device));
        let debug_utils_loader = debug_utils
            .then(|| ash::ext::debug_utils::Device::new(instance, &device));
        Self {
            device,
            swapchain: swapchain_loader,
            debug_utils: debug_utils_loader,
        }
    }

    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    fn swapchain_loader(
        &self,
    ) -> Result<&ash::khr::swapchain::Device, vk::Result> {
        self.swapchain
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }
}

impl DeviceDispatch for AshDispatch {
    fn raw_device(&self) -> vk::Device {
        self.device.handle()
    }

    fn has_swapchain(&self) -> bool {
        self.swapchain.is_some()
    }

    fn has_debug_utils(&self) -> bool {
        self.debug_utils.is_some()
    }

    unsafe fn destroy_device(&self) {
        // SAFETY: Caller guarantees every child object is gone.
        unsafe { self.device.destroy_device(None) }
    }

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result> {
        // SAFETY: No pointer arguments; the device is live.
        unsafe { self.device.device_wait_idle() }
    }

    unsafe fn get_device_queue(&self, family: u32, index: u32) -> vk::Queue {
        // SAFETY: Caller guarantees the family/index pair was requested at
        // device creation.
        unsafe { self.device.get_device_queue(family, index) }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and queue exclusivity.
        unsafe { self.device.queue_submit(queue, submits, fence) }
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees queue exclusivity.
        unsafe { self.device.queue_wait_idle(queue) }
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        let loader = self.swapchain_loader()?;
        // SAFETY: Caller guarantees handle validity and queue exclusivity.
        unsafe { loader.queue_present(queue, present_info) }
    }

    unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_fence(create_info, None) }
    }

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees the fence is not in use.
        unsafe { self.device.destroy_fence(fence, None) }
    }

    unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence validity.
        unsafe { self.device.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees no fence is pending.
        unsafe { self.device.reset_fences(fences) }
    }

    unsafe fn get_raw_fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        // SAFETY: Caller guarantees fence validity.
        unsafe { self.device.get_fence_status(fence) }
    }

    unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_semaphore(create_info, None) }
    }

    unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: Caller guarantees the semaphore is not in use.
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_command_pool(create_info, None) }
    }

    unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees no buffer from the pool is pending.
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool
        // exclusivity.
        unsafe { self.device.allocate_command_buffers(allocate_info) }
    }

    unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: Caller guarantees buffers are idle and came from pool.
        unsafe { self.device.free_command_buffers(pool, command_buffers) }
    }

    unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is not pending.
        unsafe { self.device.reset_command_buffer(command_buffer, flags) }
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is in the initial state.
        unsafe { self.device.begin_command_buffer(command_buffer, begin_info) }
    }

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the buffer is recording.
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    ) {
        // SAFETY: Caller guarantees recording state and begin_info validity.
        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, begin_info, contents)
        }
    }

    unsafe fn cmd_next_subpass(
        &self,
        command_buffer: vk::CommandBuffer,
        contents: vk::SubpassContents,
    ) {
        // SAFETY: Caller guarantees an active render pass with a next subpass.
        unsafe { self.device.cmd_next_subpass(command_buffer, contents) }
    }

    unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        // SAFETY: Caller guarantees the last subpass is active.
        unsafe { self.device.cmd_end_render_pass(command_buffer) }
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: Caller guarantees recording state and pipeline validity.
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        }
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        // SAFETY: Caller guarantees set/layout compatibility.
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                first_set,
                descriptor_sets,
                dynamic_offsets,
            )
        }
    }

    unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: Caller guarantees buffer validity and matching lengths.
        unsafe {
            self.device.cmd_bind_vertex_buffers(
                command_buffer,
                first_binding,
                buffers,
                offsets,
            )
        }
    }

    unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: Caller guarantees buffer validity.
        unsafe {
            self.device.cmd_bind_index_buffer(
                command_buffer,
                buffer,
                offset,
                index_type,
            )
        }
    }

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        // SAFETY: Caller guarantees the range lies within the layout's
        // push constant ranges.
        unsafe {
            self.device.cmd_push_constants(
                command_buffer,
                layout,
                stages,
                offset,
                constants,
            )
        }
    }

    unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        first_viewport: u32,
        viewports: &[vk::Viewport],
    ) {
        // SAFETY: Caller guarantees recording state.
        unsafe {
            self.device
                .cmd_set_viewport(command_buffer, first_viewport, viewports)
        }
    }

    unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        first_scissor: u32,
        scissors: &[vk::Rect2D],
    ) {
        // SAFETY: Caller guarantees recording state.
        unsafe {
            self.device
                .cmd_set_scissor(command_buffer, first_scissor, scissors)
        }
    }

    unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: Caller guarantees a bound graphics pipeline inside a
        // render pass.
        unsafe {
            self.device.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: Caller guarantees a bound pipeline and index buffer.
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) {
        // SAFETY: Caller guarantees a bound compute pipeline.
        unsafe {
            self.device.cmd_dispatch(
                command_buffer,
                group_count_x,
                group_count_y,
                group_count_z,
            )
        }
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees regions are in bounds.
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees regions are in bounds and the image is
        // in dst_layout.
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                src,
                dst,
                dst_layout,
                regions,
            )
        }
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        // SAFETY: Caller guarantees barrier handle validity.
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                src_stage,
                dst_stage,
                dependency_flags,
                memory_barriers,
                buffer_barriers,
                image_barriers,
            )
        }
    }

    unsafe fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        // SAFETY: Caller guarantees every entry is an executable secondary.
        unsafe { self.device.cmd_execute_commands(command_buffer, secondaries) }
    }

    unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_render_pass(create_info, None) }
    }

    unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        // SAFETY: Caller guarantees no dependent object is in use.
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }

    unsafe fn create_raw_framebuffer(
        &self,
        create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_framebuffer(create_info, None) }
    }

    unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        // SAFETY: Caller guarantees the framebuffer is not in use.
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }

    unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: Caller guarantees valid SPIR-V.
        unsafe { self.device.create_shader_module(create_info, None) }
    }

    unsafe fn destroy_raw_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_pipeline_layout(create_info, None) }
    }

    unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    unsafe fn create_raw_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> Result<Vec<vk::Pipeline>, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe {
            self.device
                .create_graphics_pipelines(cache, create_infos, None)
        }
        .map_err(|(partial, err)| {
            for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                // SAFETY: pipeline was just created and never handed out.
                unsafe { self.device.destroy_pipeline(pipeline, None) };
            }
            err
        })
    }

    unsafe fn create_raw_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::ComputePipelineCreateInfo<'_>],
    ) -> Result<Vec<vk::Pipeline>, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe {
            self.device
                .create_compute_pipelines(cache, create_infos, None)
        }
        .map_err(|(partial, err)| {
            for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                // SAFETY: pipeline was just created and never handed out.
                unsafe { self.device.destroy_pipeline(pipeline, None) };
            }
            err
        })
    }

    unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: Caller guarantees the pipeline is not in use.
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    unsafe fn create_raw_pipeline_cache(
        &self,
        create_info: &vk::PipelineCacheCreateInfo<'_>,
    ) -> Result<vk::PipelineCache, vk::Result> {
        // SAFETY: Caller guarantees initial data pointer validity.
        unsafe { self.device.create_pipeline_cache(create_info, None) }
    }

    unsafe fn get_raw_pipeline_cache_data(
        &self,
        cache: vk::PipelineCache,
    ) -> Result<Vec<u8>, vk::Result> {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.get_pipeline_cache_data(cache) }
    }

    unsafe fn destroy_raw_pipeline_cache(&self, cache: vk::PipelineCache) {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.destroy_pipeline_cache(cache, None) }
    }

    unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_descriptor_set_layout(create_info, None) }
    }

    unsafe fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_descriptor_pool(create_info, None) }
    }

    unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: Caller guarantees no set from the pool is in use.
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    unsafe fn reset_raw_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees no set from the pool is in use.
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity and pool
        // exclusivity.
        unsafe { self.device.allocate_descriptor_sets(allocate_info) }
    }

    unsafe fn free_raw_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the pool allows freeing and the sets are
        // idle.
        unsafe { self.device.free_descriptor_sets(pool, sets) }
    }

    unsafe fn update_raw_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        // SAFETY: Caller guarantees the written sets are not in use.
        unsafe { self.device.update_descriptor_sets(writes, &[]) }
    }

    unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_buffer(create_info, None) }
    }

    unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees the buffer is not in use.
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    unsafe fn get_raw_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the allocation satisfies the buffer's
        // requirements.
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
    }

    unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_image(create_info, None) }
    }

    unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: Caller guarantees the image is not in use.
        unsafe { self.device.destroy_image(image, None) }
    }

    unsafe fn get_raw_image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the allocation satisfies the image's
        // requirements.
        unsafe { self.device.bind_image_memory(image, memory, offset) }
    }

    unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_image_view(create_info, None) }
    }

    unsafe fn destroy_raw_image_view(&self, view: vk::ImageView) {
        // SAFETY: Caller guarantees the view is not in use.
        unsafe { self.device.destroy_image_view(view, None) }
    }

    unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.device.create_sampler(create_info, None) }
    }

    unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: Caller guarantees the sampler is not in use.
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the ranges are mapped and atom aligned.
        unsafe { self.device.flush_mapped_memory_ranges(ranges) }
    }

    unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        let loader = self.swapchain_loader()?;
        // SAFETY: Caller guarantees create_info validity.
        unsafe { loader.create_swapchain(create_info, None) }
    }

    unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        let loader = self.swapchain_loader()?;
        // SAFETY: Caller guarantees provenance.
        unsafe { loader.get_swapchain_images(swapchain) }
    }

    unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(loader) = self.swapchain.as_ref() {
            // SAFETY: Caller guarantees no image of the swapchain is in use.
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    unsafe fn acquire_next_raw_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        let loader = self.swapchain_loader()?;
        // SAFETY: Caller guarantees handle validity and swapchain
        // exclusivity.
        unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, fence) }
    }

    unsafe fn set_raw_object_name(
        &self,
        object_type: vk::ObjectType,
        object_handle: u64,
        name: &CStr,
    ) -> Result<(), vk::Result> {
        let Some(debug_utils) = self.debug_utils.as_ref() else {
            return Ok(());
        };
        let mut info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(name);
        info.object_type = object_type;
        info.object_handle = object_handle;
        // SAFETY: Caller guarantees the handle belongs to this device.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }
    }
}
