//! Render pass descriptions and their compiled native objects.
//!
//! A [`RenderPassDescription`] is a plain value. [`RenderPass::new`] compiles
//! it once into a `VkRenderPass` and keeps the description around so
//! framebuffers, pipelines and command buffers can check compatibility on the
//! host.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::image::ImageView;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateRenderPassError {
    #[error("A render pass needs at least one subpass")]
    NoSubpasses,
    #[error("Subpass {subpass} references attachment {attachment}, which does not exist")]
    InvalidAttachmentReference { subpass: usize, attachment: u32 },
    #[error("Subpass {subpass} has {resolve} resolve attachments for {color} colour attachments")]
    ResolveCountMismatch {
        subpass: usize,
        color: usize,
        resolve: usize,
    },
    #[error("Vulkan error creating render pass: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateFramebufferError {
    #[error("Render pass has {expected} attachments but {actual} views were given")]
    AttachmentCountMismatch { expected: usize, actual: usize },
    #[error("Vulkan error creating framebuffer: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDescription {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDescription {
    /// A single-sampled colour target cleared on load and stored.
    pub fn color(format: vk::Format, final_layout: vk::ImageLayout) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout,
        }
    }

    /// A single-sampled depth target cleared on load and discarded.
    pub fn depth(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    fn to_vk(self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: vk::ImageLayout,
}

impl AttachmentReference {
    pub const fn new(attachment: u32, layout: vk::ImageLayout) -> Self {
        Self { attachment, layout }
    }

    pub const fn unused() -> Self {
        Self {
            attachment: vk::ATTACHMENT_UNUSED,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }

    fn is_unused(self) -> bool {
        self.attachment == vk::ATTACHMENT_UNUSED
    }

    fn to_vk(self) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment: self.attachment,
            layout: self.layout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpassDescription {
    pub bind_point: vk::PipelineBindPoint,
    pub color: Vec<AttachmentReference>,
    pub input: Vec<AttachmentReference>,
    /// Empty, or one entry per colour attachment.
    pub resolve: Vec<AttachmentReference>,
    pub depth_stencil: Option<AttachmentReference>,
}

impl Default for SubpassDescription {
    fn default() -> Self {
        Self {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            color: Vec::new(),
            input: Vec::new(),
            resolve: Vec::new(),
            depth_stencil: None,
        }
    }
}

impl SubpassDescription {
    fn references(&self) -> impl Iterator<Item = AttachmentReference> + '_ {
        self.color
            .iter()
            .chain(&self.input)
            .chain(&self.resolve)
            .chain(self.depth_stencil.as_ref())
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderPassDescription {
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
}

/// Native arrays produced by [`RenderPassDescription::compile`].
#[derive(Debug, Clone)]
pub struct CompiledRenderPass {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub dependencies: Vec<vk::SubpassDependency>,
    bind_points: Vec<vk::PipelineBindPoint>,
    color: Vec<Vec<vk::AttachmentReference>>,
    input: Vec<Vec<vk::AttachmentReference>>,
    resolve: Vec<Vec<vk::AttachmentReference>>,
    depth_stencil: Vec<Option<vk::AttachmentReference>>,
}

impl CompiledRenderPass {
    /// Subpass descriptions borrowing the reference arrays in `self`.
    pub fn subpasses(&self) -> Vec<vk::SubpassDescription<'_>> {
        (0..self.bind_points.len())
            .map(|i| {
                let mut subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(self.bind_points[i])
                    .color_attachments(&self.color[i])
                    .input_attachments(&self.input[i]);
                if !self.resolve[i].is_empty() {
                    subpass = subpass.resolve_attachments(&self.resolve[i]);
                }
                if let Some(depth) = self.depth_stencil[i].as_ref() {
                    subpass = subpass.depth_stencil_attachment(depth);
                }
                subpass
            })
            .collect()
    }
}

impl RenderPassDescription {
    pub fn new(attachments: Vec<AttachmentDescription>, subpasses: Vec<SubpassDescription>) -> Self {
        Self {
            attachments,
            subpasses,
        }
    }

    /// One colour attachment written by one graphics subpass.
    pub fn single_color(format: vk::Format, final_layout: vk::ImageLayout) -> Self {
        Self::new(
            vec![AttachmentDescription::color(format, final_layout)],
            vec![SubpassDescription {
                color: vec![AttachmentReference::new(
                    0,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                )],
                ..Default::default()
            }],
        )
    }

    pub fn validate(&self) -> Result<(), CreateRenderPassError> {
        if self.subpasses.is_empty() {
            return Err(CreateRenderPassError::NoSubpasses);
        }
        for (index, subpass) in self.subpasses.iter().enumerate() {
            if !subpass.resolve.is_empty() && subpass.resolve.len() != subpass.color.len() {
                return Err(CreateRenderPassError::ResolveCountMismatch {
                    subpass: index,
                    color: subpass.color.len(),
                    resolve: subpass.resolve.len(),
                });
            }
            if let Some(bad) = subpass
                .references()
                .find(|r| !r.is_unused() && r.attachment as usize >= self.attachments.len())
            {
                return Err(CreateRenderPassError::InvalidAttachmentReference {
                    subpass: index,
                    attachment: bad.attachment,
                });
            }
        }
        Ok(())
    }

    fn has_depth(&self) -> bool {
        self.subpasses
            .iter()
            .any(|s| s.depth_stencil.is_some_and(|d| !d.is_unused()))
    }

    /// Translate into native arrays.
    ///
    /// Subpass 0 depends on everything before the pass at colour output (and
    /// the fragment tests when a depth attachment is used), so the layout
    /// transition after acquire completes before the first write. Each later
    /// subpass depends on its predecessor.
    pub fn compile(&self) -> CompiledRenderPass {
        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if self.has_depth() {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        let mut dependencies = vec![
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(stages)
                .dst_stage_mask(stages)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(access),
        ];
        dependencies.extend((1..self.subpasses.len() as u32).map(|i| {
            vk::SubpassDependency::default()
                .src_subpass(i - 1)
                .dst_subpass(i)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(
                    vk::PipelineStageFlags::FRAGMENT_SHADER
                        | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::INPUT_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                .dependency_flags(vk::DependencyFlags::BY_REGION)
        }));

        let refs = |list: &[AttachmentReference]| -> Vec<vk::AttachmentReference> {
            list.iter().map(|r| r.to_vk()).collect()
        };
        CompiledRenderPass {
            attachments: self.attachments.iter().map(|a| a.to_vk()).collect(),
            dependencies,
            bind_points: self.subpasses.iter().map(|s| s.bind_point).collect(),
            color: self.subpasses.iter().map(|s| refs(&s.color)).collect(),
            input: self.subpasses.iter().map(|s| refs(&s.input)).collect(),
            resolve: self.subpasses.iter().map(|s| refs(&s.resolve)).collect(),
            depth_stencil: self
                .subpasses
                .iter()
                .map(|s| s.depth_stencil.map(AttachmentReference::to_vk))
                .collect(),
        }
    }

    /// Format and sample count behind a reference, or `None` when unused.
    fn referenced(&self, reference: AttachmentReference) -> Option<(vk::Format, vk::SampleCountFlags)> {
        if reference.is_unused() {
            return None;
        }
        self.attachments
            .get(reference.attachment as usize)
            .map(|a| (a.format, a.samples))
    }

    fn references_match(
        &self,
        ours: &[AttachmentReference],
        other: &RenderPassDescription,
        theirs: &[AttachmentReference],
    ) -> bool {
        // A shorter array behaves as if padded with unused references.
        let len = ours.len().max(theirs.len());
        (0..len).all(|i| {
            let a = ours.get(i).copied().unwrap_or(AttachmentReference::unused());
            let b = theirs.get(i).copied().unwrap_or(AttachmentReference::unused());
            self.referenced(a) == other.referenced(b)
        })
    }

    /// Whether framebuffers and pipelines built for `other` can be used with
    /// this pass.
    ///
    /// Load/store operations and layouts do not matter. Attachment formats
    /// and sample counts must match pairwise, and every subpass must reference
    /// attachments of the same format and sample count in the same slots.
    pub fn is_compatible(&self, other: &RenderPassDescription) -> bool {
        if self.attachments.len() != other.attachments.len()
            || self.subpasses.len() != other.subpasses.len()
        {
            return false;
        }
        let attachments_match = self
            .attachments
            .iter()
            .zip(&other.attachments)
            .all(|(a, b)| a.format == b.format && a.samples == b.samples);
        attachments_match
            && self.subpasses.iter().zip(&other.subpasses).all(|(a, b)| {
                a.bind_point == b.bind_point
                    && self.references_match(&a.color, other, &b.color)
                    && self.references_match(&a.input, other, &b.input)
                    && self.references_match(&a.resolve, other, &b.resolve)
                    && self.references_match(
                        a.depth_stencil.as_slice(),
                        other,
                        b.depth_stencil.as_slice(),
                    )
            })
    }
}

// ---------------------------------------------------------------------------
// RenderPass
// ---------------------------------------------------------------------------

/// An owned `VkRenderPass` together with the description it was built from.
pub struct RenderPass {
    parent: Arc<Device>,
    handle: vk::RenderPass,
    description: Arc<RenderPassDescription>,
}

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("handle", &self.handle)
            .field("attachments", &self.description.attachments.len())
            .field("subpasses", &self.description.subpasses.len())
            .finish_non_exhaustive()
    }
}

impl RenderPass {
    pub fn new(
        device: &Arc<Device>,
        description: RenderPassDescription,
        name: Option<&str>,
    ) -> Result<Self, CreateRenderPassError> {
        description.validate()?;
        let compiled = description.compile();
        let subpasses = compiled.subpasses();
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&compiled.attachments)
            .subpasses(&subpasses)
            .dependencies(&compiled.dependencies);

        // SAFETY: create_info borrows `compiled` and `subpasses`, which live
        // until the end of this function. References were validated.
        let handle = unsafe { device.dispatch().create_raw_render_pass(&create_info) }
            .map_err(CreateRenderPassError::Vulkan)?;
        device.apply_debug_name(handle, name, "render pass");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            description: Arc::new(description),
        })
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn raw_handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn description(&self) -> &Arc<RenderPassDescription> {
        &self.description
    }

    pub fn attachment_count(&self) -> usize {
        self.description.attachments.len()
    }

    pub fn subpass_count(&self) -> u32 {
        self.description.subpasses.len() as u32
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        tracing::debug!("Dropping render pass {:?}", self.handle);
        // SAFETY: Owned handle; pipelines and framebuffers keep their own
        // copy of the description, not the native pass.
        unsafe { self.parent.dispatch().destroy_raw_render_pass(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Framebuffer
// ---------------------------------------------------------------------------

pub struct Framebuffer {
    parent: Arc<Device>,
    handle: vk::Framebuffer,
    description: Arc<RenderPassDescription>,
    extent: vk::Extent2D,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// Create a framebuffer for `render_pass` from one view per attachment.
    ///
    /// # Safety
    /// Every view must outlive all use of the framebuffer in recorded
    /// command buffers.
    pub unsafe fn new(
        device: &Arc<Device>,
        render_pass: &RenderPass,
        views: &[&ImageView],
        extent: vk::Extent2D,
        name: Option<&str>,
    ) -> Result<Self, CreateFramebufferError> {
        if views.len() != render_pass.attachment_count() {
            return Err(CreateFramebufferError::AttachmentCountMismatch {
                expected: render_pass.attachment_count(),
                actual: views.len(),
            });
        }
        let raw_views: Vec<vk::ImageView> = views.iter().map(|v| v.raw_handle()).collect();
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.raw_handle())
            .attachments(&raw_views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        // SAFETY: The render pass and views are live; the attachment count
        // matches the pass.
        let handle = unsafe { device.dispatch().create_raw_framebuffer(&create_info) }
            .map_err(CreateFramebufferError::Vulkan)?;
        device.apply_debug_name(handle, name, "framebuffer");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            description: Arc::clone(render_pass.description()),
            extent,
        })
    }

    pub fn raw_handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn render_pass_description(&self) -> &RenderPassDescription {
        &self.description
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// The full framebuffer area.
    pub fn full_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent,
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping framebuffer {:?}", self.handle);
        // SAFETY: Owned handle; no pending command buffer may reference it.
        unsafe { self.parent.dispatch().destroy_raw_framebuffer(self.handle) };
    }
}
