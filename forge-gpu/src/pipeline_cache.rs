//! On-disk persistence of the driver's pipeline cache.
//!
//! The file is a fixed 48-byte header followed by the opaque blob returned
//! by `vkGetPipelineCacheData`. All integers are in host byte order; the
//! file is not meant to move between machines, and a different adapter or
//! driver is rejected through the vendor, device and UUID fields anyway.
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic (`FCPC`) |
//! | 4 | 8 | blob size |
//! | 12 | 8 | blob hash |
//! | 20 | 4 | format version |
//! | 24 | 4 | vendor id |
//! | 28 | 4 | device id |
//! | 32 | 16 | pipeline cache UUID |
//!
//! Loading never fails because of the file: a missing, short or mismatched
//! cache is logged and replaced by an empty one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::capabilities::PhysicalDeviceCapabilities;
use crate::device::Device;

pub const MAGIC: u32 = 0x4643_5043;
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 48;

const HASH_SEED: u64 = 17;

#[derive(Debug, Error)]
pub enum PipelineCacheError {
    #[error("Vulkan error creating pipeline cache: {0}")]
    Create(vk::Result),
    #[error("Vulkan error reading pipeline cache data: {0}")]
    GetData(vk::Result),
    #[error("Failed to write pipeline cache {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a stored cache was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheRejection {
    #[error("file is shorter than the header ({0} bytes)")]
    TooShort(usize),
    #[error("bad magic {0:#010x}")]
    Magic(u32),
    #[error("format version {0} is not {FORMAT_VERSION}")]
    Version(u32),
    #[error("written by vendor {0:#06x}")]
    VendorId(u32),
    #[error("written by device {0:#06x}")]
    DeviceId(u32),
    #[error("pipeline cache UUID differs")]
    Uuid,
    #[error("blob size {stored} does not match the {actual} bytes present")]
    Size { stored: u64, actual: u64 },
    #[error("blob hash mismatch")]
    Hash,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
struct CacheHeader {
    magic: u32,
    data_size: u64,
    data_hash: u64,
    version: u32,
    vendor_id: u32,
    device_id: u32,
    uuid: [u8; vk::UUID_SIZE],
}

const _: () = assert!(std::mem::size_of::<CacheHeader>() == HEADER_SIZE);

/// Order-dependent checksum of the blob. Detects truncation and gross
/// corruption only.
pub fn cache_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(HASH_SEED, |hash, &byte| {
        hash.wrapping_mul(31).wrapping_add(u64::from(byte))
    })
}

/// Header plus blob, ready to be written to disk.
pub fn encode_cache(capabilities: &PhysicalDeviceCapabilities, blob: &[u8]) -> Vec<u8> {
    let header = CacheHeader {
        magic: MAGIC,
        data_size: blob.len() as u64,
        data_hash: cache_hash(blob),
        version: FORMAT_VERSION,
        vendor_id: capabilities.vendor_id,
        device_id: capabilities.device_id,
        uuid: capabilities.pipeline_cache_uuid,
    };
    let mut bytes = Vec::with_capacity(HEADER_SIZE + blob.len());
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    bytes.extend_from_slice(blob);
    bytes
}

/// Check a stored cache against the current adapter and return its blob.
pub fn validate_cache<'a>(
    bytes: &'a [u8],
    capabilities: &PhysicalDeviceCapabilities,
) -> Result<&'a [u8], CacheRejection> {
    let Some(header_bytes) = bytes.get(..HEADER_SIZE) else {
        return Err(CacheRejection::TooShort(bytes.len()));
    };
    let header: CacheHeader = bytemuck::pod_read_unaligned(header_bytes);
    let blob = &bytes[HEADER_SIZE..];

    let magic = header.magic;
    let version = header.version;
    let vendor_id = header.vendor_id;
    let device_id = header.device_id;
    let data_size = header.data_size;
    let data_hash = header.data_hash;

    if magic != MAGIC {
        return Err(CacheRejection::Magic(magic));
    }
    if version != FORMAT_VERSION {
        return Err(CacheRejection::Version(version));
    }
    if vendor_id != capabilities.vendor_id {
        return Err(CacheRejection::VendorId(vendor_id));
    }
    if device_id != capabilities.device_id {
        return Err(CacheRejection::DeviceId(device_id));
    }
    if header.uuid != capabilities.pipeline_cache_uuid {
        return Err(CacheRejection::Uuid);
    }
    if data_size != blob.len() as u64 {
        return Err(CacheRejection::Size {
            stored: data_size,
            actual: blob.len() as u64,
        });
    }
    if data_hash != cache_hash(blob) {
        return Err(CacheRejection::Hash);
    }
    Ok(blob)
}

/// A `VkPipelineCache` tied to the file it is loaded from and saved to.
pub struct PipelineCache {
    parent: Arc<Device>,
    handle: vk::PipelineCache,
    path: PathBuf,
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("handle", &self.handle)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PipelineCache {
    /// Load the cache stored at `path`, or start an empty one.
    ///
    /// Only a failure to create the native cache object is an error.
    pub fn read_pipeline_cache(
        device: &Arc<Device>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, PipelineCacheError> {
        let path = path.into();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No pipeline cache at {}, starting empty", path.display());
                return Self::create_new_pipeline_cache(device, path);
            }
            Err(e) => {
                tracing::warn!("Failed to read pipeline cache {}: {e}", path.display());
                return Self::create_new_pipeline_cache(device, path);
            }
        };

        let blob = match validate_cache(&bytes, device.capabilities()) {
            Ok(blob) => blob,
            Err(reason) => {
                tracing::warn!("Discarding pipeline cache {}: {reason}", path.display());
                return Self::create_new_pipeline_cache(device, path);
            }
        };

        match Self::create(device, blob) {
            Ok(handle) => {
                tracing::info!(
                    "Loaded pipeline cache {} ({} bytes)",
                    path.display(),
                    blob.len()
                );
                Ok(Self {
                    parent: Arc::clone(device),
                    handle,
                    path,
                })
            }
            Err(e) => {
                tracing::warn!("Driver rejected pipeline cache {}: {e}", path.display());
                Self::create_new_pipeline_cache(device, path)
            }
        }
    }

    /// An empty cache that will be saved to `path`.
    pub fn create_new_pipeline_cache(
        device: &Arc<Device>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, PipelineCacheError> {
        let handle = Self::create(device, &[]).map_err(PipelineCacheError::Create)?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
            path: path.into(),
        })
    }

    fn create(device: &Arc<Device>, initial_data: &[u8]) -> Result<vk::PipelineCache, vk::Result> {
        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        // SAFETY: create_info borrows initial_data for the call; the driver
        // validates its own header inside the blob.
        let handle = unsafe { device.dispatch().create_raw_pipeline_cache(&create_info) }?;
        device.apply_debug_name(handle, Some("pipeline cache"), "pipeline cache");
        Ok(handle)
    }

    /// Write header and current blob to the cache path, replacing any
    /// previous file atomically.
    pub fn save_cache(&self) -> Result<(), PipelineCacheError> {
        // SAFETY: handle is a live cache of parent.
        let blob = unsafe { self.parent.dispatch().get_raw_pipeline_cache_data(self.handle) }
            .map_err(PipelineCacheError::GetData)?;
        let bytes = encode_cache(self.parent.capabilities(), &blob);

        let io_error = |source| PipelineCacheError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_error)?;
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_error)?;
        file.write_all(&bytes).map_err(io_error)?;
        file.persist(&self.path).map_err(|e| io_error(e.error))?;

        tracing::info!(
            "Saved pipeline cache {} ({} bytes)",
            self.path.display(),
            blob.len()
        );
        Ok(())
    }

    pub fn raw_handle(&self) -> vk::PipelineCache {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline cache {:?}", self.handle);
        // SAFETY: Owned handle; pipeline creation calls using it have
        // returned.
        unsafe { self.parent.dispatch().destroy_raw_pipeline_cache(self.handle) };
    }
}
