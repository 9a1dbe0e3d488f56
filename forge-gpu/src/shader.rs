//! SPIR-V shader modules and entry points.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum LoadShaderError {
    #[error("Failed to read shader {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("SPIR-V byte slice length ({0}) is not a non-zero multiple of 4")]
    InvalidLength(usize),
    #[error("SPIR-V magic number mismatch: found {0:#010x}")]
    InvalidMagic(u32),
    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// A single pipeline stage an entry point can be compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
        }
    }
}

/// Check length and magic, returning the code as little-endian words.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>, LoadShaderError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(LoadShaderError::InvalidLength(bytes.len()));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(&other) => Err(LoadShaderError::InvalidMagic(other)),
        None => Err(LoadShaderError::InvalidLength(0)),
    }
}

pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// `name` is an optional debug label, applied through
    /// `VK_EXT_debug_utils` when the device has it. A failed naming call is
    /// logged as a warning and never fails construction.
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, LoadShaderError> {
        let code = parse_spirv(spirv_bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: code is length-checked SPIR-V starting with the magic word.
        let handle = unsafe { device.dispatch().create_raw_shader_module(&create_info) }
            .map_err(LoadShaderError::Vulkan)?;
        device.apply_debug_name(handle, name, "shader module");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Read a `.spv` file and create a module named after it.
    pub fn from_file(device: &Arc<Device>, path: impl AsRef<Path>) -> Result<Self, LoadShaderError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| LoadShaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        Self::new(device, &bytes, name.as_deref())
    }

    /// A view of this module for one entry point and stage.
    ///
    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: Owned handle. Pipelines do not need their modules after
        // creation.
        unsafe { self.parent.dispatch().destroy_raw_shader_module(self.handle) };
    }
}

/// A [`ShaderModule`] paired with an entry point name and stage.
///
/// Borrows the module, so it stays alive for as long as any stage create
/// info derived from the view is in use.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    /// The stage create info for this entry point; borrows `self`.
    pub fn as_pipeline_stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn module(&self) -> &ShaderModule {
        self.module
    }
}
