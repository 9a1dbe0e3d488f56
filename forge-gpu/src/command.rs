//! Command pools and the command buffer state machine.
//!
//! A [`CommandBuffer`] tracks its lifecycle on the host:
//!
//! ```text
//! Initial --begin--> Recording --end--> Executable --submit--> Pending
//!    ^                                                             |
//!    +------------------------- reset -----------------------------+
//! ```
//!
//! Every recording method asserts the buffer is `Recording` before touching
//! the native command stream, so misuse fails fast instead of reaching the
//! driver. Render-pass scoping (inside/outside, current subpass, subpass
//! contents) is tracked the same way.

use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferHandle;
use crate::descriptor::DescriptorSet;
use crate::device::Device;
use crate::pipeline::{Pipeline, PipelineLayout};
use crate::render_pass::{Framebuffer, RenderPass, RenderPassDescription};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
    #[error("Vulkan error resetting recycled command buffer: {0}")]
    Recycle(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Vulkan error beginning command buffer: {0}")]
    Begin(vk::Result),
    #[error("Vulkan error ending command buffer: {0}")]
    End(vk::Result),
    #[error("Vulkan error resetting command buffer: {0}")]
    Reset(vk::Result),
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

impl CommandBufferLevel {
    fn to_vk(self) -> vk::CommandBufferLevel {
        match self {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}

/// Render pass a secondary buffer continues.
#[derive(Debug, Clone, Copy)]
pub struct Inheritance<'a> {
    pub render_pass: &'a RenderPass,
    pub subpass: u32,
    pub framebuffer: Option<&'a Framebuffer>,
}

#[derive(Debug, Clone)]
struct ActivePass {
    description: Arc<RenderPassDescription>,
    subpass: u32,
    contents: vk::SubpassContents,
}

// ---------------------------------------------------------------------------
// Layout transition tables
// ---------------------------------------------------------------------------

/// Access and stage that last touched an image in `layout`.
pub fn transition_source(layout: vk::ImageLayout) -> Option<(vk::AccessFlags, vk::PipelineStageFlags)> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    Some(match layout {
        L::UNDEFINED => (A::empty(), S::TOP_OF_PIPE),
        L::PREINITIALIZED => (A::HOST_WRITE, S::HOST),
        L::GENERAL => (A::SHADER_WRITE, S::COMPUTE_SHADER),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::TRANSFER_SRC_OPTIMAL => (A::TRANSFER_READ, S::TRANSFER),
        L::COLOR_ATTACHMENT_OPTIMAL => (A::COLOR_ATTACHMENT_WRITE, S::COLOR_ATTACHMENT_OUTPUT),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            (A::DEPTH_STENCIL_ATTACHMENT_WRITE, S::LATE_FRAGMENT_TESTS)
        }
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        // Acquire semaphores are waited on at colour output.
        L::PRESENT_SRC_KHR => (A::empty(), S::COLOR_ATTACHMENT_OUTPUT),
        _ => return None,
    })
}

/// Access and stage that will next use an image in `layout`.
pub fn transition_destination(
    layout: vk::ImageLayout,
) -> Option<(vk::AccessFlags, vk::PipelineStageFlags)> {
    use vk::{AccessFlags as A, ImageLayout as L, PipelineStageFlags as S};
    Some(match layout {
        L::GENERAL => (A::SHADER_READ | A::SHADER_WRITE, S::COMPUTE_SHADER),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::TRANSFER_SRC_OPTIMAL => (A::TRANSFER_READ, S::TRANSFER),
        L::COLOR_ATTACHMENT_OPTIMAL => (
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        L::PRESENT_SRC_KHR => (A::empty(), S::BOTTOM_OF_PIPE),
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// CommandPoolShared: private inner state co-owned by pool and its buffers
// ---------------------------------------------------------------------------

/// Shared ownership of the raw pool handle.
///
/// Held by the [`CommandPool`] and every [`CommandBuffer`] allocated from
/// it, so the native pool outlives all of its buffers.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
    queue_family: u32,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: Runs only once the pool wrapper and every buffer from it
        // are gone. vkDestroyCommandPool frees the remaining buffers.
        unsafe { self.parent.dispatch().destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// CommandPool
// ---------------------------------------------------------------------------

/// An owned command pool whose buffers can be reset individually.
///
/// `CommandPool` is `!Sync`: pool-level operations need external
/// synchronisation, and the `Receiver` inside makes that structural.
///
/// Dropped [`CommandBuffer`]s send their handle back through a channel.
/// The next [`allocate`](Self::allocate) of the same level resets one of
/// them for reuse and frees the surplus.
pub struct CommandPool {
    shared: Arc<CommandPoolShared>,
    sender: mpsc::Sender<(CommandBufferLevel, vk::CommandBuffer)>,
    receiver: mpsc::Receiver<(CommandBufferLevel, vk::CommandBuffer)>,
    _not_sync: PhantomData<Cell<()>>,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.shared.pool)
            .field("queue_family", &self.shared.queue_family)
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    /// Create a pool for `queue_family` whose buffers can be reset one at a
    /// time.
    ///
    /// `name` is an optional debug label, applied through
    /// `VK_EXT_debug_utils` when the device has it. A failed naming call is
    /// logged as a warning and never fails construction.
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: create_info has no borrowed pointers.
        let pool = unsafe { device.dispatch().create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;
        device.apply_debug_name(pool, name, "command pool");

        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
                queue_family,
            }),
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Allocate a command buffer in the `Initial` state.
    pub fn allocate(
        &self,
        level: CommandBufferLevel,
    ) -> Result<CommandBuffer, AllocateCommandBufferError> {
        let dispatch = self.shared.parent.dispatch();

        let mut returned: Vec<(CommandBufferLevel, vk::CommandBuffer)> =
            std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();
        let reuse = returned
            .iter()
            .position(|(l, _)| *l == level)
            .map(|i| returned.swap_remove(i).1);

        if !returned.is_empty() {
            let surplus: Vec<vk::CommandBuffer> = returned.into_iter().map(|(_, h)| h).collect();
            // SAFETY: Every handle came from this pool and was returned by a
            // dropped CommandBuffer, which must not be dropped while pending.
            // The pool is !Sync, so nobody else is touching it.
            unsafe { dispatch.free_raw_command_buffers(self.shared.pool, &surplus) };
        }

        let handle = match reuse {
            Some(handle) => {
                // SAFETY: As above; the pool was created with
                // RESET_COMMAND_BUFFER.
                if let Err(e) = unsafe {
                    dispatch.reset_raw_command_buffer(handle, vk::CommandBufferResetFlags::empty())
                } {
                    // SAFETY: The handle is idle and owned by this pool.
                    unsafe { dispatch.free_raw_command_buffers(self.shared.pool, &[handle]) };
                    return Err(AllocateCommandBufferError::Recycle(e));
                }
                handle
            }
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.shared.pool)
                    .level(level.to_vk())
                    .command_buffer_count(1);
                // SAFETY: allocate_info references our live pool; !Sync
                // rules out concurrent pool access.
                unsafe { dispatch.allocate_raw_command_buffers(&allocate_info) }
                    .map_err(AllocateCommandBufferError::Vulkan)?
                    .pop()
                    .ok_or(AllocateCommandBufferError::Vulkan(
                        vk::Result::ERROR_UNKNOWN,
                    ))?
            }
        };

        Ok(CommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            level,
            state: Cell::new(CommandBufferState::Initial),
            simultaneous_use: Cell::new(false),
            active_pass: None,
            return_sender: self.sender.clone(),
        })
    }

    pub fn raw_command_pool(&self) -> vk::CommandPool {
        self.shared.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.shared.queue_family
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// A command buffer allocated from a [`CommandPool`].
///
/// Must not be dropped while its submission is still executing: the handle
/// goes back to the pool for reuse.
pub struct CommandBuffer {
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    level: CommandBufferLevel,
    state: Cell<CommandBufferState>,
    simultaneous_use: Cell<bool>,
    active_pass: Option<ActivePass>,
    return_sender: mpsc::Sender<(CommandBufferLevel, vk::CommandBuffer)>,
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        // If the pool is gone the send fails and vkDestroyCommandPool frees
        // the handle through CommandPoolShared.
        let _ = self.return_sender.send((self.level, self.handle));
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("level", &self.level)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> CommandBufferState {
        self.state.get()
    }

    pub fn is_simultaneous_use(&self) -> bool {
        self.simultaneous_use.get()
    }

    pub fn in_render_pass(&self) -> bool {
        self.active_pass.is_some()
    }

    fn assert_recording(&self, op: &str) {
        assert_eq!(
            self.state.get(),
            CommandBufferState::Recording,
            "{op} requires a command buffer in the recording state"
        );
    }

    fn assert_outside_render_pass(&self, op: &str) {
        assert!(
            self.active_pass.is_none(),
            "{op} must be recorded outside a render pass"
        );
    }

    fn assert_same_device(&self, other: &Arc<Device>, what: &str) {
        assert!(
            Arc::ptr_eq(&self.parent, other),
            "{what} belongs to a different device"
        );
    }

    fn active_pass(&self, op: &str) -> &ActivePass {
        self.active_pass
            .as_ref()
            .unwrap_or_else(|| panic!("{op} must be recorded inside a render pass"))
    }

    /// Begin recording.
    ///
    /// With `one_time_submit = false` the buffer is marked
    /// `SIMULTANEOUS_USE` and may be resubmitted while pending; it must not
    /// be re-recorded until that work completes. Secondary buffers require
    /// `inheritance` and continue its render pass.
    ///
    /// # Panics
    /// If the buffer is not `Initial`, or if `inheritance` is missing for a
    /// secondary buffer or given for a primary one.
    pub fn begin(
        &mut self,
        one_time_submit: bool,
        inheritance: Option<Inheritance<'_>>,
    ) -> Result<(), RecordError> {
        assert_eq!(
            self.state.get(),
            CommandBufferState::Initial,
            "begin requires a command buffer in the initial state"
        );
        match self.level {
            CommandBufferLevel::Primary => assert!(
                inheritance.is_none(),
                "primary command buffers take no inheritance info"
            ),
            CommandBufferLevel::Secondary => assert!(
                inheritance.is_some(),
                "secondary command buffers require inheritance info"
            ),
        }

        let mut flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
        };

        let mut inheritance_info = vk::CommandBufferInheritanceInfo::default();
        let mut pass = None;
        if let Some(inherit) = inheritance {
            self.assert_same_device(inherit.render_pass.parent(), "inherited render pass");
            assert!(
                inherit.subpass < inherit.render_pass.subpass_count(),
                "inherited subpass {} out of range",
                inherit.subpass
            );
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
            inheritance_info = inheritance_info
                .render_pass(inherit.render_pass.raw_handle())
                .subpass(inherit.subpass)
                .framebuffer(
                    inherit
                        .framebuffer
                        .map_or(vk::Framebuffer::null(), |fb| fb.raw_handle()),
                );
            pass = Some(ActivePass {
                description: Arc::clone(inherit.render_pass.description()),
                subpass: inherit.subpass,
                contents: vk::SubpassContents::INLINE,
            });
        }

        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        if self.level == CommandBufferLevel::Secondary {
            begin_info = begin_info.inheritance_info(&inheritance_info);
        }

        // SAFETY: The buffer is in the initial state (asserted) and the
        // inheritance handles belong to this device.
        unsafe { self.parent.dispatch().begin_raw_command_buffer(self.handle, &begin_info) }
            .map_err(RecordError::Begin)?;

        self.simultaneous_use.set(!one_time_submit);
        self.active_pass = pass;
        self.state.set(CommandBufferState::Recording);
        Ok(())
    }

    /// Finish recording.
    ///
    /// # Panics
    /// If the buffer is not recording, or a primary buffer still has a render
    /// pass open.
    pub fn end(&mut self) -> Result<(), RecordError> {
        self.assert_recording("end");
        if self.level == CommandBufferLevel::Primary {
            self.assert_outside_render_pass("end");
        }
        // SAFETY: The buffer is recording (asserted).
        match unsafe { self.parent.dispatch().end_raw_command_buffer(self.handle) } {
            Ok(()) => {
                self.active_pass = None;
                self.state.set(CommandBufferState::Executable);
                Ok(())
            }
            Err(e) => {
                self.state.set(CommandBufferState::Invalid);
                Err(RecordError::End(e))
            }
        }
    }

    /// Return the buffer to `Initial`.
    ///
    /// # Safety
    /// The buffer must not be pending on the device: wait for the fence of
    /// its last submission first.
    pub unsafe fn reset(&mut self) -> Result<(), RecordError> {
        // SAFETY: Caller guarantees the buffer is not pending.
        unsafe {
            self.parent
                .dispatch()
                .reset_raw_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        }
        .map_err(RecordError::Reset)?;
        self.active_pass = None;
        self.state.set(CommandBufferState::Initial);
        Ok(())
    }

    /// Record that the buffer was handed to a queue.
    pub(crate) fn mark_pending(&self) {
        self.state.set(CommandBufferState::Pending);
    }

    /// Whether a submission may include this buffer right now.
    pub(crate) fn is_submittable(&self) -> bool {
        match self.state.get() {
            CommandBufferState::Executable => true,
            CommandBufferState::Pending => self.simultaneous_use.get(),
            _ => false,
        }
    }

    // -- render pass scope --------------------------------------------------

    /// Begin `render_pass` on `framebuffer`.
    ///
    /// `clear_values` holds one entry per attachment in attachment order.
    ///
    /// # Panics
    /// If the buffer is not a recording primary buffer outside a render pass,
    /// if the clear value count differs from the attachment count, or if the
    /// framebuffer was made for an incompatible render pass.
    pub fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        self.assert_recording("begin_render_pass");
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "begin_render_pass requires a primary command buffer"
        );
        self.assert_outside_render_pass("begin_render_pass");
        self.assert_same_device(render_pass.parent(), "render pass");
        assert_eq!(
            clear_values.len(),
            render_pass.attachment_count(),
            "begin_render_pass needs one clear value per attachment"
        );
        assert!(
            render_pass
                .description()
                .is_compatible(framebuffer.render_pass_description()),
            "framebuffer is incompatible with the render pass"
        );

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.raw_handle())
            .framebuffer(framebuffer.raw_handle())
            .render_area(render_area)
            .clear_values(clear_values);
        // SAFETY: Recording primary buffer outside a render pass (asserted);
        // render pass and framebuffer are live objects of this device.
        unsafe {
            self.parent
                .dispatch()
                .cmd_begin_render_pass(self.handle, &begin_info, contents)
        };
        self.active_pass = Some(ActivePass {
            description: Arc::clone(render_pass.description()),
            subpass: 0,
            contents,
        });
    }

    /// Advance to the next subpass.
    pub fn next_subpass(&mut self, contents: vk::SubpassContents) {
        self.assert_recording("next_subpass");
        let Some(pass) = self.active_pass.as_mut() else {
            panic!("next_subpass must be recorded inside a render pass");
        };
        let subpass_count = pass.description.subpasses.len() as u32;
        assert!(
            pass.subpass + 1 < subpass_count,
            "next_subpass called on the last subpass"
        );
        // SAFETY: A render pass with a further subpass is active (asserted).
        unsafe { self.parent.dispatch().cmd_next_subpass(self.handle, contents) };
        pass.subpass += 1;
        pass.contents = contents;
    }

    pub fn end_render_pass(&mut self) {
        self.assert_recording("end_render_pass");
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "end_render_pass requires a primary command buffer"
        );
        let pass = self.active_pass("end_render_pass");
        assert_eq!(
            pass.subpass as usize + 1,
            pass.description.subpasses.len(),
            "end_render_pass requires the last subpass to be active"
        );
        // SAFETY: The last subpass of a render pass is active (asserted).
        unsafe { self.parent.dispatch().cmd_end_render_pass(self.handle) };
        self.active_pass = None;
    }

    // -- binding ------------------------------------------------------------

    /// Bind `pipeline` at its bind point.
    ///
    /// # Panics
    /// A graphics pipeline bound inside a render pass must have been built
    /// for a compatible render pass and for the current subpass.
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        self.assert_recording("bind_pipeline");
        self.assert_same_device(pipeline.parent(), "pipeline");
        if pipeline.bind_point() == vk::PipelineBindPoint::GRAPHICS
            && let Some(pass) = self.active_pass.as_ref()
        {
            let Some(built_for) = pipeline.render_pass_description() else {
                panic!("graphics pipeline has no render pass to check against");
            };
            assert!(
                pass.description.is_compatible(built_for),
                "pipeline render pass is incompatible with the active render pass"
            );
            assert_eq!(
                pipeline.subpass(),
                pass.subpass,
                "pipeline was built for a different subpass"
            );
        }
        // SAFETY: Recording (asserted); pipeline is live and from this device.
        unsafe {
            self.parent.dispatch().cmd_bind_pipeline(
                self.handle,
                pipeline.bind_point(),
                pipeline.raw_handle(),
            )
        };
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: &PipelineLayout,
        first_set: u32,
        sets: &[&DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.assert_recording("bind_descriptor_sets");
        assert!(
            first_set as usize + sets.len() <= layout.set_layout_count(),
            "descriptor sets exceed the pipeline layout"
        );
        let raw: Vec<vk::DescriptorSet> = sets.iter().map(|s| s.raw_handle()).collect();
        // SAFETY: Recording (asserted); the sets fit the layout.
        unsafe {
            self.parent.dispatch().cmd_bind_descriptor_sets(
                self.handle,
                bind_point,
                layout.raw_handle(),
                first_set,
                &raw,
                dynamic_offsets,
            )
        };
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[&dyn BufferHandle],
        offsets: &[vk::DeviceSize],
    ) {
        self.assert_recording("bind_vertex_buffers");
        assert_eq!(
            buffers.len(),
            offsets.len(),
            "bind_vertex_buffers needs one offset per buffer"
        );
        assert!(
            buffers
                .iter()
                .zip(offsets)
                .all(|(b, o)| *o < b.buffer_size().max(1)),
            "vertex buffer offset out of range"
        );
        let raw: Vec<vk::Buffer> = buffers.iter().map(|b| b.raw_buffer()).collect();
        // SAFETY: Recording (asserted); lengths match and offsets are in
        // range.
        unsafe {
            self.parent
                .dispatch()
                .cmd_bind_vertex_buffers(self.handle, first_binding, &raw, offsets)
        };
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &dyn BufferHandle,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.assert_recording("bind_index_buffer");
        assert!(offset < buffer.buffer_size().max(1), "index buffer offset out of range");
        // SAFETY: Recording (asserted); offset is in range.
        unsafe {
            self.parent.dispatch().cmd_bind_index_buffer(
                self.handle,
                buffer.raw_buffer(),
                offset,
                index_type,
            )
        };
    }

    /// Update push constants. `offset` and `data.len()` must be multiples of
    /// four and lie within a range of `layout` covering `stages`.
    pub fn push_constants(
        &mut self,
        layout: &PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.assert_recording("push_constants");
        assert!(
            offset % 4 == 0 && data.len() % 4 == 0 && !data.is_empty(),
            "push constant offset and size must be non-zero multiples of 4"
        );
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len));
        assert!(
            end.is_some_and(|end| {
                layout.push_constant_ranges().iter().any(|r| {
                    r.stage_flags.contains(stages)
                        && r.offset <= offset
                        && r.offset.checked_add(r.size).is_some_and(|range_end| end <= range_end)
                })
            }),
            "push constants outside the layout's ranges"
        );
        // SAFETY: Recording (asserted); the range is declared by the layout.
        unsafe {
            self.parent.dispatch().cmd_push_constants(
                self.handle,
                layout.raw_handle(),
                stages,
                offset,
                data,
            )
        };
    }

    pub fn set_viewport(&mut self, viewports: &[vk::Viewport]) {
        self.assert_recording("set_viewport");
        assert!(!viewports.is_empty(), "set_viewport needs at least one viewport");
        // SAFETY: Recording (asserted).
        unsafe { self.parent.dispatch().cmd_set_viewport(self.handle, 0, viewports) };
    }

    pub fn set_scissor(&mut self, scissors: &[vk::Rect2D]) {
        self.assert_recording("set_scissor");
        assert!(!scissors.is_empty(), "set_scissor needs at least one rectangle");
        // SAFETY: Recording (asserted).
        unsafe { self.parent.dispatch().cmd_set_scissor(self.handle, 0, scissors) };
    }

    // -- work ---------------------------------------------------------------

    fn assert_inline_draw(&self, op: &str) {
        self.assert_recording(op);
        let pass = self.active_pass(op);
        assert_eq!(
            pass.contents,
            vk::SubpassContents::INLINE,
            "{op} is not allowed in a subpass recorded for secondary command buffers"
        );
    }

    /// Record a non-indexed draw.
    ///
    /// # Safety
    /// A compatible graphics pipeline must be bound and all of its dynamic
    /// state set. Vertex buffers must cover the drawn range.
    pub unsafe fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.assert_inline_draw("draw");
        // SAFETY: Inside an inline subpass (asserted); caller guarantees
        // pipeline and buffer state.
        unsafe {
            self.parent.dispatch().cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    /// Record an indexed draw.
    ///
    /// # Safety
    /// As [`draw`](Self::draw), plus a bound index buffer covering the range.
    pub unsafe fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.assert_inline_draw("draw_indexed");
        // SAFETY: Inside an inline subpass (asserted); caller guarantees
        // pipeline and buffer state.
        unsafe {
            self.parent.dispatch().cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    /// Record a compute dispatch.
    ///
    /// # Safety
    /// A compute pipeline and every descriptor it statically uses must be
    /// bound.
    pub unsafe fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.assert_recording("dispatch");
        self.assert_outside_render_pass("dispatch");
        // SAFETY: Outside a render pass (asserted); caller guarantees bound
        // state.
        unsafe { self.parent.dispatch().cmd_dispatch(self.handle, x, y, z) };
    }

    /// Copy between two buffers. Regions are bounds-checked.
    pub fn copy_buffer(
        &mut self,
        src: &dyn BufferHandle,
        dst: &dyn BufferHandle,
        regions: &[vk::BufferCopy],
    ) {
        self.assert_recording("copy_buffer");
        self.assert_outside_render_pass("copy_buffer");
        assert!(!regions.is_empty(), "copy_buffer needs at least one region");
        assert!(
            regions.iter().all(|r| {
                r.src_offset
                    .checked_add(r.size)
                    .is_some_and(|end| end <= src.buffer_size())
                    && r.dst_offset
                        .checked_add(r.size)
                        .is_some_and(|end| end <= dst.buffer_size())
            }),
            "copy_buffer region out of bounds"
        );
        // SAFETY: Outside a render pass and every region in bounds
        // (asserted).
        unsafe {
            self.parent.dispatch().cmd_copy_buffer(
                self.handle,
                src.raw_buffer(),
                dst.raw_buffer(),
                regions,
            )
        };
    }

    /// Copy buffer contents into an image.
    ///
    /// # Safety
    /// `image` must be a live image of this device in `layout`, and every
    /// region must lie within both resources.
    pub unsafe fn copy_buffer_to_image(
        &mut self,
        src: &dyn BufferHandle,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.assert_recording("copy_buffer_to_image");
        self.assert_outside_render_pass("copy_buffer_to_image");
        assert!(!regions.is_empty(), "copy_buffer_to_image needs at least one region");
        // SAFETY: Outside a render pass (asserted); caller guarantees image
        // validity and bounds.
        unsafe {
            self.parent.dispatch().cmd_copy_buffer_to_image(
                self.handle,
                src.raw_buffer(),
                image,
                layout,
                regions,
            )
        };
    }

    /// Record a pipeline barrier.
    ///
    /// # Safety
    /// Every handle referenced by the barriers must be live and belong to
    /// this device.
    pub unsafe fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        dependency_flags: vk::DependencyFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        self.assert_recording("pipeline_barrier");
        // SAFETY: Recording (asserted); caller guarantees handle validity.
        unsafe {
            self.parent.dispatch().cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                dependency_flags,
                memory_barriers,
                buffer_barriers,
                image_barriers,
            )
        };
    }

    /// Move every subresource of `image` from `old_layout` to `new_layout`.
    ///
    /// Access masks and stages come from fixed per-layout tables.
    ///
    /// # Panics
    /// If either layout has no table entry.
    ///
    /// # Safety
    /// `image` must be a live image of this device currently in
    /// `old_layout` (or `old_layout` is `UNDEFINED`).
    pub unsafe fn transition_image_layout(
        &mut self,
        image: vk::Image,
        aspect_mask: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.assert_recording("transition_image_layout");
        self.assert_outside_render_pass("transition_image_layout");
        let (src_access, src_stage) = transition_source(old_layout)
            .unwrap_or_else(|| panic!("unsupported source layout {old_layout:?}"));
        let (dst_access, dst_stage) = transition_destination(new_layout)
            .unwrap_or_else(|| panic!("unsupported destination layout {new_layout:?}"));

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            });
        // SAFETY: Caller guarantees image validity and current layout.
        unsafe {
            self.pipeline_barrier(
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            )
        };
    }

    /// Execute secondary command buffers from this primary buffer.
    ///
    /// # Panics
    /// If this buffer is not primary, any entry is not a secondary buffer
    /// ready for submission, or the active subpass was not begun with
    /// `SECONDARY_COMMAND_BUFFERS` contents.
    pub fn execute_sub_command_buffers(&mut self, secondaries: &[&CommandBuffer]) {
        self.assert_recording("execute_sub_command_buffers");
        assert_eq!(
            self.level,
            CommandBufferLevel::Primary,
            "execute_sub_command_buffers requires a primary command buffer"
        );
        assert!(
            secondaries
                .iter()
                .all(|cb| cb.level == CommandBufferLevel::Secondary),
            "execute_sub_command_buffers accepts only secondary command buffers"
        );
        assert!(
            secondaries.iter().all(|cb| cb.is_submittable()),
            "secondary command buffers must be executable"
        );
        if let Some(pass) = self.active_pass.as_ref() {
            assert_eq!(
                pass.contents,
                vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                "subpass was not begun for secondary command buffers"
            );
        }
        let raw: Vec<vk::CommandBuffer> = secondaries.iter().map(|cb| cb.handle).collect();
        // SAFETY: Primary recording buffer; every entry is an executable
        // secondary (asserted).
        unsafe { self.parent.dispatch().cmd_execute_commands(self.handle, &raw) };
        for cb in secondaries {
            cb.mark_pending();
        }
    }
}

// Verified at compile time: both types are Send.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for CommandPool {}
impl AssertSend for CommandBuffer {}
