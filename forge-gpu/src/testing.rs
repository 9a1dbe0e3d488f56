//! Recording stand-in for the device dispatch table.
//!
//! [`MockDispatch`] hands out fresh fake handles, logs every call with the
//! raw handles it touched and keeps just enough state to behave like a
//! device: fences signal when their submission is recorded (unless auto
//! signalling is switched off), swapchains report a fixed image count and
//! acquire/present results can be scripted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use ash::vk::Handle;

use crate::buffer::BufferHandle;
use crate::capabilities::{PhysicalDeviceCapabilities, QueueFamilyInfo};
use crate::device::Device;
use crate::dispatch::DeviceDispatch;
use crate::image::ImageView;
use crate::instance::VkVersion;
use crate::pipeline::{GraphicsPipelineState, Pipeline, PipelineLayout};
use crate::render_pass::{Framebuffer, RenderPass, RenderPassDescription};
use crate::shader::{SPIRV_MAGIC, ShaderModule, ShaderStage};
use crate::surface::SurfaceSupport;
use crate::swapchain::{SwapchainHandle, SwapchainImages, SwapchainInfo};

pub(crate) const MOCK_VENDOR_ID: u32 = 0x10de;
pub(crate) const MOCK_DEVICE_ID: u32 = 0x2684;
pub(crate) const MOCK_UUID: [u8; vk::UUID_SIZE] = [
    0x0f, 0x12, 0x7a, 0x33, 0x90, 0x01, 0xbe, 0x42, 0x5c, 0x66, 0x70, 0x08, 0xd1, 0xe2, 0x03,
    0x44,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MockCall {
    pub name: &'static str,
    pub handles: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordedSubmit {
    pub wait_semaphores: Vec<u64>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<u64>,
    pub signal_semaphores: Vec<u64>,
    pub fence: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RecordedPresent {
    pub wait_semaphores: Vec<u64>,
    pub swapchains: Vec<u64>,
    pub image_indices: Vec<u32>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    calls: Vec<MockCall>,
    signaled_fences: HashSet<u64>,
    manual_fences: bool,
    debug_utils: bool,
    failures: HashMap<&'static str, vk::Result>,
    acquire_results: VecDeque<Result<(u32, bool), vk::Result>>,
    present_results: VecDeque<Result<bool, vk::Result>>,
    acquire_counter: u32,
    swapchain_image_count: u32,
    pipeline_cache_data: Vec<u8>,
    cache_initial_data: Vec<Vec<u8>>,
    buffer_sizes: HashMap<u64, vk::DeviceSize>,
    submits: Vec<RecordedSubmit>,
    presents: Vec<RecordedPresent>,
    render_pass_infos: Vec<(usize, usize, usize)>,
}

pub(crate) struct MockDispatch {
    swapchain: bool,
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDispatch").finish_non_exhaustive()
    }
}

impl Default for MockDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDispatch {
    pub fn new() -> Self {
        Self {
            swapchain: true,
            state: Mutex::new(MockState {
                next_handle: 0x1000,
                swapchain_image_count: 3,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    fn record(&self, name: &'static str, handles: Vec<u64>) {
        self.lock().calls.push(MockCall { name, handles });
    }

    fn fail(&self, name: &'static str) -> Result<(), vk::Result> {
        match self.lock().failures.remove(name) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fresh<H: Handle>(&self) -> H {
        let mut state = self.lock();
        state.next_handle += 1;
        H::from_raw(state.next_handle)
    }

    fn create<H: Handle + Copy>(&self, name: &'static str) -> Result<H, vk::Result> {
        self.fail(name)?;
        let handle: H = self.fresh();
        self.record(name, vec![handle.as_raw()]);
        Ok(handle)
    }

    // -- scripting ----------------------------------------------------------

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.lock().calls.iter().map(|c| c.name).collect()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.name == name).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the next call named `name` fail with `err`.
    pub fn fail_next(&self, name: &'static str, err: vk::Result) {
        self.lock().failures.insert(name, err);
    }

    /// Signal `fence` as if the device finished the work guarding it.
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.lock().signaled_fences.insert(fence.as_raw());
    }

    /// When set, submissions no longer signal their fence.
    pub fn set_debug_utils(&self, enabled: bool) {
        self.lock().debug_utils = enabled;
    }

    pub fn set_manual_fences(&self, manual: bool) {
        self.lock().manual_fences = manual;
    }

    pub fn push_acquire_result(&self, result: Result<(u32, bool), vk::Result>) {
        self.lock().acquire_results.push_back(result);
    }

    pub fn push_present_result(&self, result: Result<bool, vk::Result>) {
        self.lock().present_results.push_back(result);
    }

    pub fn set_swapchain_image_count(&self, count: u32) {
        self.lock().swapchain_image_count = count;
    }

    pub fn set_pipeline_cache_data(&self, data: Vec<u8>) {
        self.lock().pipeline_cache_data = data;
    }

    /// Initial data handed to each `vkCreatePipelineCache`, in call order.
    pub fn cache_initial_data(&self) -> Vec<Vec<u8>> {
        self.lock().cache_initial_data.clone()
    }

    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.lock().submits.clone()
    }

    pub fn presents(&self) -> Vec<RecordedPresent> {
        self.lock().presents.clone()
    }

    /// `(attachments, subpasses, dependencies)` of each render pass created.
    pub fn render_pass_infos(&self) -> Vec<(usize, usize, usize)> {
        self.lock().render_pass_infos.clone()
    }
}

/// Copy `count` elements from a Vulkan array pointer.
///
/// # Safety
/// `ptr` must be valid for `count` reads, or `count` must be zero.
unsafe fn read_array<T: Copy>(ptr: *const T, count: u32) -> Vec<T> {
    if count == 0 || ptr.is_null() {
        return Vec::new();
    }
    // SAFETY: Guaranteed by the caller.
    unsafe { std::slice::from_raw_parts(ptr, count as usize) }.to_vec()
}

fn raws<H: Handle + Copy>(handles: &[H]) -> Vec<u64> {
    handles.iter().map(|h| h.as_raw()).collect()
}

impl DeviceDispatch for MockDispatch {
    fn raw_device(&self) -> vk::Device {
        vk::Device::from_raw(0xd00d)
    }

    fn has_swapchain(&self) -> bool {
        self.swapchain
    }

    fn has_debug_utils(&self) -> bool {
        self.lock().debug_utils
    }

    unsafe fn destroy_device(&self) {
        self.record("destroy_device", vec![]);
    }

    unsafe fn device_wait_idle(&self) -> Result<(), vk::Result> {
        self.record("device_wait_idle", vec![]);
        self.fail("device_wait_idle")
    }

    unsafe fn get_device_queue(&self, family: u32, index: u32) -> vk::Queue {
        self.record("get_device_queue", vec![family as u64, index as u64]);
        vk::Queue::from_raw(0x9000 + family as u64)
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        self.record("queue_submit", vec![queue.as_raw(), fence.as_raw()]);
        self.fail("queue_submit")?;
        let recorded: Vec<RecordedSubmit> = submits
            .iter()
            .map(|s| {
                // SAFETY: The submit infos were built by the caller from live
                // slices whose lengths match the counts.
                unsafe {
                    RecordedSubmit {
                        wait_semaphores: raws(&read_array(
                            s.p_wait_semaphores,
                            s.wait_semaphore_count,
                        )),
                        wait_stages: read_array(s.p_wait_dst_stage_mask, s.wait_semaphore_count),
                        command_buffers: raws(&read_array(
                            s.p_command_buffers,
                            s.command_buffer_count,
                        )),
                        signal_semaphores: raws(&read_array(
                            s.p_signal_semaphores,
                            s.signal_semaphore_count,
                        )),
                        fence: fence.as_raw(),
                    }
                }
            })
            .collect();
        let mut state = self.lock();
        state.submits.extend(recorded);
        if fence != vk::Fence::null() && !state.manual_fences {
            state.signaled_fences.insert(fence.as_raw());
        }
        Ok(())
    }

    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> Result<(), vk::Result> {
        self.record("queue_wait_idle", vec![queue.as_raw()]);
        self.fail("queue_wait_idle")
    }

    unsafe fn queue_present(
        &self,
        queue: vk::Queue,
        present_info: &vk::PresentInfoKHR<'_>,
    ) -> Result<bool, vk::Result> {
        self.record("queue_present", vec![queue.as_raw()]);
        // SAFETY: present_info was built from live slices.
        let recorded = unsafe {
            RecordedPresent {
                wait_semaphores: raws(&read_array(
                    present_info.p_wait_semaphores,
                    present_info.wait_semaphore_count,
                )),
                swapchains: raws(&read_array(
                    present_info.p_swapchains,
                    present_info.swapchain_count,
                )),
                image_indices: read_array(
                    present_info.p_image_indices,
                    present_info.swapchain_count,
                ),
            }
        };
        let mut state = self.lock();
        state.presents.push(recorded);
        state.present_results.pop_front().unwrap_or(Ok(false))
    }

    unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        let fence: vk::Fence = self.create("create_raw_fence")?;
        if create_info.flags.contains(vk::FenceCreateFlags::SIGNALED) {
            self.signal_fence(fence);
        }
        Ok(fence)
    }

    unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        self.record("destroy_raw_fence", vec![fence.as_raw()]);
    }

    unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        _timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        self.record("wait_for_raw_fences", raws(fences));
        let state = self.lock();
        let signaled = |f: &vk::Fence| state.signaled_fences.contains(&f.as_raw());
        let done = if wait_all {
            fences.iter().all(signaled)
        } else {
            fences.iter().any(signaled)
        };
        if done { Ok(()) } else { Err(vk::Result::TIMEOUT) }
    }

    unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        self.record("reset_raw_fences", raws(fences));
        let mut state = self.lock();
        for fence in fences {
            state.signaled_fences.remove(&fence.as_raw());
        }
        Ok(())
    }

    unsafe fn get_raw_fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        self.record("get_raw_fence_status", vec![fence.as_raw()]);
        Ok(self.lock().signaled_fences.contains(&fence.as_raw()))
    }

    unsafe fn create_raw_semaphore(
        &self,
        _create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        self.create("create_raw_semaphore")
    }

    unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        self.record("destroy_raw_semaphore", vec![semaphore.as_raw()]);
    }

    unsafe fn create_raw_command_pool(
        &self,
        _create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        self.create("create_raw_command_pool")
    }

    unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        self.record("destroy_raw_command_pool", vec![pool.as_raw()]);
    }

    unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        self.fail("allocate_raw_command_buffers")?;
        let buffers: Vec<vk::CommandBuffer> = (0..allocate_info.command_buffer_count)
            .map(|_| self.fresh())
            .collect();
        self.record("allocate_raw_command_buffers", raws(&buffers));
        Ok(buffers)
    }

    unsafe fn free_raw_command_buffers(
        &self,
        _pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        self.record("free_raw_command_buffers", raws(command_buffers));
    }

    unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        self.record("reset_raw_command_buffer", vec![command_buffer.as_raw()]);
        self.fail("reset_raw_command_buffer")
    }

    unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        self.record(
            "begin_raw_command_buffer",
            vec![command_buffer.as_raw(), begin_info.flags.as_raw() as u64],
        );
        self.fail("begin_raw_command_buffer")
    }

    unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        self.record("end_raw_command_buffer", vec![command_buffer.as_raw()]);
        self.fail("end_raw_command_buffer")
    }

    unsafe fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
        contents: vk::SubpassContents,
    ) {
        self.record(
            "cmd_begin_render_pass",
            vec![
                command_buffer.as_raw(),
                begin_info.render_pass.as_raw(),
                begin_info.clear_value_count as u64,
                contents.as_raw() as u64,
            ],
        );
    }

    unsafe fn cmd_next_subpass(
        &self,
        command_buffer: vk::CommandBuffer,
        contents: vk::SubpassContents,
    ) {
        self.record(
            "cmd_next_subpass",
            vec![command_buffer.as_raw(), contents.as_raw() as u64],
        );
    }

    unsafe fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.record("cmd_end_render_pass", vec![command_buffer.as_raw()]);
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(
            "cmd_bind_pipeline",
            vec![command_buffer.as_raw(), pipeline.as_raw()],
        );
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        let mut handles = vec![command_buffer.as_raw()];
        handles.extend(raws(descriptor_sets));
        self.record("cmd_bind_descriptor_sets", handles);
    }

    unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        _first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        let mut handles = vec![command_buffer.as_raw()];
        handles.extend(raws(buffers));
        self.record("cmd_bind_vertex_buffers", handles);
    }

    unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        _index_type: vk::IndexType,
    ) {
        self.record(
            "cmd_bind_index_buffer",
            vec![command_buffer.as_raw(), buffer.as_raw()],
        );
    }

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        self.record(
            "cmd_push_constants",
            vec![command_buffer.as_raw(), offset as u64, constants.len() as u64],
        );
    }

    unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        _first_viewport: u32,
        _viewports: &[vk::Viewport],
    ) {
        self.record("cmd_set_viewport", vec![command_buffer.as_raw()]);
    }

    unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        _first_scissor: u32,
        _scissors: &[vk::Rect2D],
    ) {
        self.record("cmd_set_scissor", vec![command_buffer.as_raw()]);
    }

    unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(
            "cmd_draw",
            vec![
                command_buffer.as_raw(),
                vertex_count as u64,
                instance_count as u64,
            ],
        );
    }

    unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(
            "cmd_draw_indexed",
            vec![
                command_buffer.as_raw(),
                index_count as u64,
                instance_count as u64,
            ],
        );
    }

    unsafe fn cmd_dispatch(
        &self,
        command_buffer: vk::CommandBuffer,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) {
        self.record(
            "cmd_dispatch",
            vec![
                command_buffer.as_raw(),
                group_count_x as u64,
                group_count_y as u64,
                group_count_z as u64,
            ],
        );
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        _regions: &[vk::BufferCopy],
    ) {
        self.record(
            "cmd_copy_buffer",
            vec![command_buffer.as_raw(), src.as_raw(), dst.as_raw()],
        );
    }

    unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.record(
            "cmd_copy_buffer_to_image",
            vec![
                command_buffer.as_raw(),
                src.as_raw(),
                dst.as_raw(),
                dst_layout.as_raw() as u64,
            ],
        );
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let mut handles = vec![
            command_buffer.as_raw(),
            src_stage.as_raw() as u64,
            dst_stage.as_raw() as u64,
            memory_barriers.len() as u64,
            buffer_barriers.len() as u64,
        ];
        for barrier in image_barriers {
            handles.push(barrier.src_access_mask.as_raw() as u64);
            handles.push(barrier.dst_access_mask.as_raw() as u64);
        }
        self.record("cmd_pipeline_barrier", handles);
    }

    unsafe fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        let mut handles = vec![command_buffer.as_raw()];
        handles.extend(raws(secondaries));
        self.record("cmd_execute_commands", handles);
    }

    unsafe fn create_raw_render_pass(
        &self,
        create_info: &vk::RenderPassCreateInfo<'_>,
    ) -> Result<vk::RenderPass, vk::Result> {
        let render_pass = self.create("create_raw_render_pass")?;
        self.lock().render_pass_infos.push((
            create_info.attachment_count as usize,
            create_info.subpass_count as usize,
            create_info.dependency_count as usize,
        ));
        Ok(render_pass)
    }

    unsafe fn destroy_raw_render_pass(&self, render_pass: vk::RenderPass) {
        self.record("destroy_raw_render_pass", vec![render_pass.as_raw()]);
    }

    unsafe fn create_raw_framebuffer(
        &self,
        _create_info: &vk::FramebufferCreateInfo<'_>,
    ) -> Result<vk::Framebuffer, vk::Result> {
        self.create("create_raw_framebuffer")
    }

    unsafe fn destroy_raw_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.record("destroy_raw_framebuffer", vec![framebuffer.as_raw()]);
    }

    unsafe fn create_raw_shader_module(
        &self,
        _create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        self.create("create_raw_shader_module")
    }

    unsafe fn destroy_raw_shader_module(&self, module: vk::ShaderModule) {
        self.record("destroy_raw_shader_module", vec![module.as_raw()]);
    }

    unsafe fn create_raw_pipeline_layout(
        &self,
        _create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        self.create("create_raw_pipeline_layout")
    }

    unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.record("destroy_raw_pipeline_layout", vec![layout.as_raw()]);
    }

    unsafe fn create_raw_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::GraphicsPipelineCreateInfo<'_>],
    ) -> Result<Vec<vk::Pipeline>, vk::Result> {
        self.fail("create_raw_graphics_pipelines")?;
        let pipelines: Vec<vk::Pipeline> = create_infos.iter().map(|_| self.fresh()).collect();
        let mut handles = vec![cache.as_raw()];
        handles.extend(raws(&pipelines));
        self.record("create_raw_graphics_pipelines", handles);
        Ok(pipelines)
    }

    unsafe fn create_raw_compute_pipelines(
        &self,
        cache: vk::PipelineCache,
        create_infos: &[vk::ComputePipelineCreateInfo<'_>],
    ) -> Result<Vec<vk::Pipeline>, vk::Result> {
        self.fail("create_raw_compute_pipelines")?;
        let pipelines: Vec<vk::Pipeline> = create_infos.iter().map(|_| self.fresh()).collect();
        let mut handles = vec![cache.as_raw()];
        handles.extend(raws(&pipelines));
        self.record("create_raw_compute_pipelines", handles);
        Ok(pipelines)
    }

    unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        self.record("destroy_raw_pipeline", vec![pipeline.as_raw()]);
    }

    unsafe fn create_raw_pipeline_cache(
        &self,
        create_info: &vk::PipelineCacheCreateInfo<'_>,
    ) -> Result<vk::PipelineCache, vk::Result> {
        let cache = self.create("create_raw_pipeline_cache")?;
        let initial = if create_info.initial_data_size == 0 || create_info.p_initial_data.is_null()
        {
            Vec::new()
        } else {
            // SAFETY: The caller's slice backs p_initial_data for
            // initial_data_size bytes.
            unsafe {
                std::slice::from_raw_parts(
                    create_info.p_initial_data.cast::<u8>(),
                    create_info.initial_data_size,
                )
            }
            .to_vec()
        };
        self.lock().cache_initial_data.push(initial);
        Ok(cache)
    }

    unsafe fn get_raw_pipeline_cache_data(
        &self,
        cache: vk::PipelineCache,
    ) -> Result<Vec<u8>, vk::Result> {
        self.record("get_raw_pipeline_cache_data", vec![cache.as_raw()]);
        self.fail("get_raw_pipeline_cache_data")?;
        Ok(self.lock().pipeline_cache_data.clone())
    }

    unsafe fn destroy_raw_pipeline_cache(&self, cache: vk::PipelineCache) {
        self.record("destroy_raw_pipeline_cache", vec![cache.as_raw()]);
    }

    unsafe fn create_raw_descriptor_set_layout(
        &self,
        _create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        self.create("create_raw_descriptor_set_layout")
    }

    unsafe fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.record("destroy_raw_descriptor_set_layout", vec![layout.as_raw()]);
    }

    unsafe fn create_raw_descriptor_pool(
        &self,
        _create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        self.create("create_raw_descriptor_pool")
    }

    unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.record("destroy_raw_descriptor_pool", vec![pool.as_raw()]);
    }

    unsafe fn reset_raw_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), vk::Result> {
        self.record("reset_raw_descriptor_pool", vec![pool.as_raw()]);
        self.fail("reset_raw_descriptor_pool")
    }

    unsafe fn allocate_raw_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        self.fail("allocate_raw_descriptor_sets")?;
        let sets: Vec<vk::DescriptorSet> = (0..allocate_info.descriptor_set_count)
            .map(|_| self.fresh())
            .collect();
        self.record("allocate_raw_descriptor_sets", raws(&sets));
        Ok(sets)
    }

    unsafe fn free_raw_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<(), vk::Result> {
        self.record("free_raw_descriptor_sets", raws(sets));
        Ok(())
    }

    unsafe fn update_raw_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let handles = writes
            .iter()
            .flat_map(|w| [w.dst_set.as_raw(), w.dst_binding as u64])
            .collect();
        self.record("update_raw_descriptor_sets", handles);
    }

    unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        let buffer: vk::Buffer = self.create("create_raw_buffer")?;
        self.lock()
            .buffer_sizes
            .insert(buffer.as_raw(), create_info.size);
        Ok(buffer)
    }

    unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        self.record("destroy_raw_buffer", vec![buffer.as_raw()]);
    }

    unsafe fn get_raw_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .lock()
            .buffer_sizes
            .get(&buffer.as_raw())
            .copied()
            .unwrap_or(0);
        vk::MemoryRequirements {
            size,
            alignment: 16,
            memory_type_bits: u32::MAX,
        }
    }

    unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.record("bind_raw_buffer_memory", vec![buffer.as_raw(), memory.as_raw()]);
        Ok(())
    }

    unsafe fn create_raw_image(
        &self,
        _create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        self.create("create_raw_image")
    }

    unsafe fn destroy_raw_image(&self, image: vk::Image) {
        self.record("destroy_raw_image", vec![image.as_raw()]);
    }

    unsafe fn get_raw_image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: u32::MAX,
        }
    }

    unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.record("bind_raw_image_memory", vec![image.as_raw(), memory.as_raw()]);
        Ok(())
    }

    unsafe fn create_raw_image_view(
        &self,
        _create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        self.create("create_raw_image_view")
    }

    unsafe fn destroy_raw_image_view(&self, view: vk::ImageView) {
        self.record("destroy_raw_image_view", vec![view.as_raw()]);
    }

    unsafe fn create_raw_sampler(
        &self,
        _create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        self.create("create_raw_sampler")
    }

    unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        self.record("destroy_raw_sampler", vec![sampler.as_raw()]);
    }

    unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        self.record(
            "flush_raw_mapped_memory_ranges",
            ranges.iter().map(|r| r.memory.as_raw()).collect(),
        );
        Ok(())
    }

    unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, vk::Result> {
        self.fail("create_raw_swapchain")?;
        let swapchain: vk::SwapchainKHR = self.fresh();
        self.record(
            "create_raw_swapchain",
            vec![swapchain.as_raw(), create_info.old_swapchain.as_raw()],
        );
        Ok(swapchain)
    }

    unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, vk::Result> {
        let count = self.lock().swapchain_image_count;
        let images: Vec<vk::Image> = (0..count).map(|_| self.fresh()).collect();
        let mut handles = vec![swapchain.as_raw()];
        handles.extend(raws(&images));
        self.record("get_raw_swapchain_images", handles);
        Ok(images)
    }

    unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.record("destroy_raw_swapchain", vec![swapchain.as_raw()]);
    }

    unsafe fn acquire_next_raw_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<(u32, bool), vk::Result> {
        self.record(
            "acquire_next_raw_image",
            vec![swapchain.as_raw(), semaphore.as_raw(), fence.as_raw()],
        );
        let mut state = self.lock();
        if let Some(result) = state.acquire_results.pop_front() {
            return result;
        }
        let index = state.acquire_counter % state.swapchain_image_count.max(1);
        state.acquire_counter += 1;
        Ok((index, false))
    }

    unsafe fn set_raw_object_name(
        &self,
        object_type: vk::ObjectType,
        object_handle: u64,
        _name: &CStr,
    ) -> Result<(), vk::Result> {
        self.record(
            "set_raw_object_name",
            vec![object_type.as_raw() as u64, object_handle],
        );
        self.fail("set_raw_object_name")
    }
}

/// Capabilities of the fake adapter behind [`mock_device`].
pub(crate) fn mock_capabilities(families: &[QueueFamilyInfo]) -> PhysicalDeviceCapabilities {
    use vk::MemoryPropertyFlags as F;
    PhysicalDeviceCapabilities {
        name: "Mock Adapter".to_owned(),
        vendor_id: MOCK_VENDOR_ID,
        device_id: MOCK_DEVICE_ID,
        device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
        api_version: VkVersion::new(0, 1, 3, 0),
        pipeline_cache_uuid: MOCK_UUID,
        extensions: vec![ash::khr::swapchain::NAME.to_string_lossy().into_owned()],
        queue_families: families.to_vec(),
        memory_types: vec![
            vk::MemoryType {
                property_flags: F::DEVICE_LOCAL,
                heap_index: 0,
            },
            vk::MemoryType {
                property_flags: F::HOST_VISIBLE | F::HOST_COHERENT,
                heap_index: 1,
            },
        ],
        ..Default::default()
    }
}

pub(crate) fn mock_device_with_families(
    families: &[QueueFamilyInfo],
) -> (Arc<Device>, Arc<MockDispatch>) {
    let mock = Arc::new(MockDispatch::new());
    let dispatch: Arc<dyn DeviceDispatch> = mock.clone();
    // SAFETY: The mock accepts any call sequence and owns no native device.
    let device = unsafe {
        Device::from_dispatch(dispatch, Arc::new(mock_capabilities(families)))
    };
    (Arc::new(device), mock)
}

/// A device with one family that can do everything.
pub(crate) fn mock_device() -> (Arc<Device>, Arc<MockDispatch>) {
    mock_device_with_families(&[QueueFamilyInfo {
        flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        queue_count: 1,
    }])
}

// -- fixtures -----------------------------------------------------------------

static NEXT_FAKE_HANDLE: AtomicU64 = AtomicU64::new(0xfa_0000);

fn fake_handle<H: Handle>() -> H {
    H::from_raw(NEXT_FAKE_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// A buffer handle that no device knows about.
#[derive(Debug)]
pub(crate) struct FakeBuffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
}

impl FakeBuffer {
    pub fn new(size: vk::DeviceSize) -> Self {
        Self {
            handle: fake_handle(),
            size,
        }
    }
}

impl BufferHandle for FakeBuffer {
    fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    fn buffer_size(&self) -> vk::DeviceSize {
        self.size
    }
}

#[derive(Debug)]
pub(crate) struct FakeSwapchain {
    handle: vk::SwapchainKHR,
    image_count: u32,
}

impl FakeSwapchain {
    pub fn new(image_count: u32) -> Self {
        Self {
            handle: fake_handle(),
            image_count,
        }
    }
}

impl SwapchainHandle for FakeSwapchain {
    fn raw_swapchain(&self) -> vk::SwapchainKHR {
        self.handle
    }

    fn image_count(&self) -> u32 {
        self.image_count
    }
}

/// Just a SPIR-V header: magic, version 1.0, generator, bound, schema.
pub(crate) fn minimal_spirv() -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

pub(crate) fn single_colour_pass(device: &Arc<Device>) -> RenderPass {
    RenderPass::new(
        device,
        RenderPassDescription::single_color(
            vk::Format::B8G8R8A8_UNORM,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ),
        None,
    )
    .expect("render pass")
}

pub(crate) fn mock_framebuffer(device: &Arc<Device>, render_pass: &RenderPass) -> Framebuffer {
    // SAFETY: The mock never dereferences images or views, so the view may
    // go away before the framebuffer.
    unsafe {
        let view = ImageView::for_raw_image(
            device,
            fake_handle(),
            vk::Format::B8G8R8A8_UNORM,
            vk::ImageAspectFlags::COLOR,
            None,
        )
        .expect("view");
        Framebuffer::new(
            device,
            render_pass,
            &[&view],
            vk::Extent2D {
                width: 640,
                height: 480,
            },
            None,
        )
        .expect("framebuffer")
    }
}

/// A layout with 64 bytes of vertex-stage push constants.
pub(crate) fn mock_layout(device: &Arc<Device>) -> Arc<PipelineLayout> {
    let range = vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: 64,
    };
    Arc::new(PipelineLayout::new(device, &[], &[range], None).expect("layout"))
}

pub(crate) fn mock_graphics_pipeline(
    device: &Arc<Device>,
    layout: &Arc<PipelineLayout>,
    render_pass: &RenderPass,
) -> Pipeline {
    let module = ShaderModule::new(device, &minimal_spirv(), None).expect("module");
    let stages = [
        module
            .entry_point("main", ShaderStage::Vertex)
            .expect("entry point"),
        module
            .entry_point("main", ShaderStage::Fragment)
            .expect("entry point"),
    ];
    let state = GraphicsPipelineState {
        stages: &stages,
        ..Default::default()
    };
    Pipeline::graphics(device, &state, layout, render_pass, 0, None, None).expect("pipeline")
}

/// A 640x480 surface offering BGRA8 sRGB-nonlinear with FIFO and MAILBOX.
pub(crate) fn mock_surface_support() -> SurfaceSupport {
    let extent = vk::Extent2D {
        width: 640,
        height: 480,
    };
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: extent,
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        },
        formats: vec![vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

/// A swapchain over a made-up surface, sized to [`mock_surface_support`].
pub(crate) fn mock_swapchain(device: &Arc<Device>) -> SwapchainImages {
    let info = SwapchainInfo {
        desired_extent: vk::Extent2D {
            width: 640,
            height: 480,
        },
        preferred_format: None,
        preferred_present_mode: None,
    };
    // SAFETY: The mock accepts any surface handle.
    unsafe {
        SwapchainImages::create(
            device,
            vk::SurfaceKHR::from_raw(0x5eed),
            &mock_surface_support(),
            &info,
            vk::SwapchainKHR::null(),
            None,
        )
    }
    .expect("swapchain")
}
