//! Pipeline layouts and graphics/compute pipelines.
//!
//! A [`Pipeline`] is compiled once from a flat state struct and never
//! changes afterwards; different state means building a new pipeline.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::Device;
use crate::pipeline_cache::PipelineCache;
use crate::render_pass::{RenderPass, RenderPassDescription};
use crate::shader::{EntryPoint, ShaderStage};

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreatePipelineLayoutError {
    #[error("Push constant range {index} (offset {offset}, size {size}) is not 4-byte aligned or is empty")]
    InvalidPushConstantRange { index: usize, offset: u32, size: u32 },
    #[error("Vulkan error creating pipeline layout: {0}")]
    Vulkan(vk::Result),
}

/// An owned `VkPipelineLayout`.
///
/// Pipelines sharing a descriptor set and push-constant signature hold the
/// layout behind an `Arc<PipelineLayout>`. The layout keeps its set layouts
/// alive.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
    set_layouts: Vec<Arc<DescriptorSetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .field("set_layouts", &self.set_layouts.len())
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[Arc<DescriptorSetLayout>],
        push_constant_ranges: &[vk::PushConstantRange],
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineLayoutError> {
        for (index, range) in push_constant_ranges.iter().enumerate() {
            if range.size == 0 || range.offset % 4 != 0 || range.size % 4 != 0 {
                return Err(CreatePipelineLayoutError::InvalidPushConstantRange {
                    index,
                    offset: range.offset,
                    size: range.size,
                });
            }
        }

        let raw_set_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| l.raw_handle()).collect();
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&raw_set_layouts)
            .push_constant_ranges(push_constant_ranges);
        // SAFETY: create_info borrows local arrays; the set layouts are live.
        let handle = unsafe { device.dispatch().create_raw_pipeline_layout(&create_info) }
            .map_err(CreatePipelineLayoutError::Vulkan)?;
        device.apply_debug_name(handle, name, "pipeline layout");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            set_layouts: set_layouts.to_vec(),
            push_constant_ranges: push_constant_ranges.to_vec(),
        })
    }

    /// A layout with no descriptor sets and no push constants.
    pub fn new_empty(device: &Arc<Device>) -> Result<Self, CreatePipelineLayoutError> {
        Self::new(device, &[], &[], None)
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn set_layout_count(&self) -> usize {
        self.set_layouts.len()
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: Owned handle. Pipelines hold an Arc to their layout, so
        // none that use it are left.
        unsafe { self.parent.dispatch().destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("No shader stages provided")]
    NoStages,
    #[error("Graphics pipelines need a vertex stage")]
    MissingVertexStage,
    #[error("Compute pipelines take exactly one compute stage, got {0:?}")]
    NotComputeStage(ShaderStage),
    #[error("Subpass {subpass} out of range for a render pass with {count} subpasses")]
    SubpassOutOfRange { subpass: u32, count: u32 },
    #[error("Subpass {0} is not a graphics subpass")]
    NotGraphicsSubpass(u32),
    #[error("Expected {expected} colour blend attachment states, got {actual}")]
    BlendAttachmentMismatch { expected: usize, actual: usize },
    #[error("Static viewport/scissor state requires at least one viewport and scissor")]
    MissingViewport,
    #[error("Vulkan error creating pipeline: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Pipeline state
// ---------------------------------------------------------------------------

/// Depth test configuration. `None` in [`GraphicsPipelineState`] disables
/// depth testing and writes.
#[derive(Debug, Clone, Copy)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare_op: vk::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare_op: vk::CompareOp::LESS,
        }
    }
}

/// Full fixed-function and shader state of a graphics pipeline.
///
/// # Defaults (via [`Default`])
/// | field | default |
/// |---|---|
/// | `stages` | `&[]` (must be overridden) |
/// | `vertex_bindings` / `vertex_attributes` | `&[]` |
/// | `topology` | `TRIANGLE_LIST` |
/// | `viewports` / `scissors` | `&[]` (dynamic) |
/// | `polygon_mode` | `FILL` |
/// | `cull_mode` | `NONE` |
/// | `front_face` | `COUNTER_CLOCKWISE` |
/// | `samples` | `TYPE_1` |
/// | `color_blend` | `&[]`: opaque RGBA write per colour attachment |
/// | `depth` | `None` |
/// | `dynamic_states` | `VIEWPORT`, `SCISSOR` |
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineState<'a> {
    pub stages: &'a [EntryPoint<'a>],
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    /// Static viewports. When `VIEWPORT` is dynamic only the count matters
    /// and an empty slice means one.
    pub viewports: &'a [vk::Viewport],
    pub scissors: &'a [vk::Rect2D],
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub samples: vk::SampleCountFlags,
    pub color_blend: &'a [vk::PipelineColorBlendAttachmentState],
    pub depth: Option<DepthState>,
    pub dynamic_states: &'a [vk::DynamicState],
}

impl Default for GraphicsPipelineState<'_> {
    fn default() -> Self {
        Self {
            stages: &[],
            vertex_bindings: &[],
            vertex_attributes: &[],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            viewports: &[],
            scissors: &[],
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            samples: vk::SampleCountFlags::TYPE_1,
            color_blend: &[],
            depth: None,
            dynamic_states: &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
        }
    }
}

impl GraphicsPipelineState<'_> {
    fn has_dynamic(&self, state: vk::DynamicState) -> bool {
        self.dynamic_states.contains(&state)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ComputePipelineState<'a> {
    pub stage: &'a EntryPoint<'a>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A compiled graphics or compute pipeline.
///
/// Graphics pipelines remember the render pass description and subpass they
/// were built for, so binding can check compatibility with the active pass.
pub struct Pipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
    layout: Arc<PipelineLayout>,
    render_pass: Option<Arc<RenderPassDescription>>,
    subpass: u32,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("bind_point", &self.bind_point)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// The native cache handle to pass through, or null when the cache belongs
/// to another device.
fn cache_handle(device: &Arc<Device>, cache: Option<&PipelineCache>) -> vk::PipelineCache {
    match cache {
        Some(cache) if Arc::ptr_eq(cache.parent(), device) => cache.raw_handle(),
        Some(_) => {
            tracing::warn!("Ignoring pipeline cache created for a different device");
            vk::PipelineCache::null()
        }
        None => vk::PipelineCache::null(),
    }
}

impl Pipeline {
    /// Compile a graphics pipeline for `subpass` of `render_pass`.
    ///
    /// A supplied `cache` only speeds up compilation; a miss is not an
    /// error.
    pub fn graphics(
        device: &Arc<Device>,
        state: &GraphicsPipelineState<'_>,
        layout: &Arc<PipelineLayout>,
        render_pass: &RenderPass,
        subpass: u32,
        cache: Option<&PipelineCache>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if state.stages.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }
        if !state.stages.iter().any(|s| s.stage() == ShaderStage::Vertex) {
            return Err(CreatePipelineError::MissingVertexStage);
        }
        let description = render_pass.description();
        let Some(subpass_desc) = description.subpasses.get(subpass as usize) else {
            return Err(CreatePipelineError::SubpassOutOfRange {
                subpass,
                count: render_pass.subpass_count(),
            });
        };
        if subpass_desc.bind_point != vk::PipelineBindPoint::GRAPHICS {
            return Err(CreatePipelineError::NotGraphicsSubpass(subpass));
        }

        let color_count = subpass_desc.color.len();
        let default_blend;
        let blend_attachments = if state.color_blend.is_empty() {
            default_blend = vec![
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA);
                color_count
            ];
            default_blend.as_slice()
        } else if state.color_blend.len() == color_count {
            state.color_blend
        } else {
            return Err(CreatePipelineError::BlendAttachmentMismatch {
                expected: color_count,
                actual: state.color_blend.len(),
            });
        };

        let dynamic_viewport = state.has_dynamic(vk::DynamicState::VIEWPORT);
        let dynamic_scissor = state.has_dynamic(vk::DynamicState::SCISSOR);
        if (!dynamic_viewport && state.viewports.is_empty())
            || (!dynamic_scissor && state.scissors.is_empty())
        {
            return Err(CreatePipelineError::MissingViewport);
        }

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> = state
            .stages
            .iter()
            .map(|ep| ep.as_pipeline_stage_create_info())
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(state.vertex_bindings)
            .vertex_attribute_descriptions(state.vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.topology)
            .primitive_restart_enable(state.primitive_restart);

        // Counts must be declared even when the values are dynamic.
        let mut viewport_state = vk::PipelineViewportStateCreateInfo::default();
        viewport_state = if dynamic_viewport {
            viewport_state.viewport_count(state.viewports.len().max(1) as u32)
        } else {
            viewport_state.viewports(state.viewports)
        };
        viewport_state = if dynamic_scissor {
            viewport_state.scissor_count(state.scissors.len().max(1) as u32)
        } else {
            viewport_state.scissors(state.scissors)
        };

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .line_width(state.line_width);

        let multisample_state =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(state.samples);

        let depth = state.depth.unwrap_or(DepthState {
            test: false,
            write: false,
            compare_op: vk::CompareOp::ALWAYS,
        });
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth.test)
            .depth_write_enable(depth.write)
            .depth_compare_op(depth.compare_op);

        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(state.dynamic_states);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout.raw_handle())
            .render_pass(render_pass.raw_handle())
            .subpass(subpass);

        // SAFETY: create_info borrows only locals and `state`, all alive for
        // the call. Layout, render pass and shader modules are live objects
        // of this device.
        let pipelines = unsafe {
            device.dispatch().create_raw_graphics_pipelines(
                cache_handle(device, cache),
                std::slice::from_ref(&create_info),
            )
        }
        .map_err(CreatePipelineError::Vulkan)?;
        let Some(handle) = pipelines.into_iter().next() else {
            return Err(CreatePipelineError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        device.apply_debug_name(handle, name, "graphics pipeline");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout: Arc::clone(layout),
            render_pass: Some(Arc::clone(description)),
            subpass,
        })
    }

    pub fn compute(
        device: &Arc<Device>,
        state: &ComputePipelineState<'_>,
        layout: &Arc<PipelineLayout>,
        cache: Option<&PipelineCache>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if state.stage.stage() != ShaderStage::Compute {
            return Err(CreatePipelineError::NotComputeStage(state.stage.stage()));
        }
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(state.stage.as_pipeline_stage_create_info())
            .layout(layout.raw_handle());

        // SAFETY: create_info borrows the entry point name, alive for the
        // call. Layout and module are live objects of this device.
        let pipelines = unsafe {
            device.dispatch().create_raw_compute_pipelines(
                cache_handle(device, cache),
                std::slice::from_ref(&create_info),
            )
        }
        .map_err(CreatePipelineError::Vulkan)?;
        let Some(handle) = pipelines.into_iter().next() else {
            return Err(CreatePipelineError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        device.apply_debug_name(handle, name, "compute pipeline");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout: Arc::clone(layout),
            render_pass: None,
            subpass: 0,
        })
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    /// The render pass a graphics pipeline was built for.
    pub fn render_pass_description(&self) -> Option<&RenderPassDescription> {
        self.render_pass.as_deref()
    }

    pub fn subpass(&self) -> u32 {
        self.subpass
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: Owned handle; in-flight GPU work referencing this pipeline
        // must be complete before drop. The layout Arc is released after.
        unsafe { self.parent.dispatch().destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::shader::ShaderModule;
    use crate::testing::{minimal_spirv, mock_device, mock_layout, single_colour_pass};

    #[test]
    fn misaligned_push_constants_are_rejected() {
        let (device, mock) = mock_device();
        let range = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 2,
            size: 16,
        };
        let err = PipelineLayout::new(&device, &[], &[range], None).expect_err("misaligned");
        assert!(matches!(
            err,
            CreatePipelineLayoutError::InvalidPushConstantRange { index: 0, .. }
        ));
        assert_eq!(mock.count_calls("create_raw_pipeline_layout"), 0);
    }

    #[test]
    fn graphics_pipeline_validation() {
        let (device, mock) = mock_device();
        let layout = mock_layout(&device);
        let render_pass = single_colour_pass(&device);
        let module = ShaderModule::new(&device, &minimal_spirv(), None).expect("module");
        let fragment_only = [module.entry_point("main", ShaderStage::Fragment).expect("entry")];
        let both = [
            module.entry_point("main", ShaderStage::Vertex).expect("entry"),
            module.entry_point("main", ShaderStage::Fragment).expect("entry"),
        ];

        let build = |state: &GraphicsPipelineState<'_>, subpass| {
            Pipeline::graphics(&device, state, &layout, &render_pass, subpass, None, None)
        };

        assert!(matches!(
            build(&GraphicsPipelineState::default(), 0),
            Err(CreatePipelineError::NoStages)
        ));
        let state = GraphicsPipelineState {
            stages: &fragment_only,
            ..Default::default()
        };
        assert!(matches!(build(&state, 0), Err(CreatePipelineError::MissingVertexStage)));

        let state = GraphicsPipelineState {
            stages: &both,
            ..Default::default()
        };
        assert!(matches!(
            build(&state, 1),
            Err(CreatePipelineError::SubpassOutOfRange { subpass: 1, count: 1 })
        ));

        let blend = [vk::PipelineColorBlendAttachmentState::default(); 2];
        let state = GraphicsPipelineState {
            stages: &both,
            color_blend: &blend,
            ..Default::default()
        };
        assert!(matches!(
            build(&state, 0),
            Err(CreatePipelineError::BlendAttachmentMismatch { expected: 1, actual: 2 })
        ));

        let state = GraphicsPipelineState {
            stages: &both,
            dynamic_states: &[],
            ..Default::default()
        };
        assert!(matches!(build(&state, 0), Err(CreatePipelineError::MissingViewport)));
        assert_eq!(mock.count_calls("create_raw_graphics_pipelines"), 0);

        let state = GraphicsPipelineState {
            stages: &both,
            ..Default::default()
        };
        let pipeline = build(&state, 0).expect("pipeline");
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::GRAPHICS);
        assert_eq!(pipeline.subpass(), 0);
        assert_eq!(
            pipeline.render_pass_description(),
            Some(render_pass.description().as_ref())
        );
    }

    #[test]
    fn cache_handle_is_passed_through() {
        let (device, mock) = mock_device();
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = PipelineCache::create_new_pipeline_cache(&device, dir.path().join("p.cache"))
            .expect("cache");
        let layout = mock_layout(&device);
        let module = ShaderModule::new(&device, &minimal_spirv(), None).expect("module");
        let entry = module.entry_point("main", ShaderStage::Compute).expect("entry");
        let pipeline = Pipeline::compute(
            &device,
            &ComputePipelineState { stage: &entry },
            &layout,
            Some(&cache),
            Some("blur"),
        )
        .expect("pipeline");
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert!(pipeline.render_pass_description().is_none());

        let call = mock
            .calls()
            .into_iter()
            .find(|c| c.name == "create_raw_compute_pipelines")
            .expect("created");
        assert_eq!(call.handles[0], cache.raw_handle().as_raw());
    }

    #[test]
    fn foreign_cache_is_ignored() {
        let (device, mock) = mock_device();
        let (other, _other_mock) = mock_device();
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = PipelineCache::create_new_pipeline_cache(&other, dir.path().join("p.cache"))
            .expect("cache");
        let layout = mock_layout(&device);
        let module = ShaderModule::new(&device, &minimal_spirv(), None).expect("module");
        let entry = module.entry_point("main", ShaderStage::Compute).expect("entry");
        Pipeline::compute(&device, &ComputePipelineState { stage: &entry }, &layout, Some(&cache), None)
            .expect("pipeline");
        let call = mock
            .calls()
            .into_iter()
            .find(|c| c.name == "create_raw_compute_pipelines")
            .expect("created");
        assert_eq!(call.handles[0], 0);
    }

    #[test]
    fn compute_requires_a_compute_stage() {
        let (device, _mock) = mock_device();
        let layout = mock_layout(&device);
        let module = ShaderModule::new(&device, &minimal_spirv(), None).expect("module");
        let entry = module.entry_point("main", ShaderStage::Vertex).expect("entry");
        let err = Pipeline::compute(&device, &ComputePipelineState { stage: &entry }, &layout, None, None)
            .expect_err("vertex stage");
        assert!(matches!(err, CreatePipelineError::NotComputeStage(ShaderStage::Vertex)));
    }

    #[test]
    fn layout_outlives_its_pipelines() {
        let (device, mock) = mock_device();
        let layout = mock_layout(&device);
        let render_pass = single_colour_pass(&device);
        let pipeline = crate::testing::mock_graphics_pipeline(&device, &layout, &render_pass);
        drop(layout);
        assert_eq!(mock.count_calls("destroy_raw_pipeline_layout"), 0);
        drop(pipeline);
        let names = mock.call_names();
        let pipeline_pos = names.iter().position(|n| *n == "destroy_raw_pipeline").expect("pipeline");
        let layout_pos = names
            .iter()
            .position(|n| *n == "destroy_raw_pipeline_layout")
            .expect("layout");
        assert!(pipeline_pos < layout_pos);
    }
}
