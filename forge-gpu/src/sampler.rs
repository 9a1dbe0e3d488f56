//! Sampler wrapper ([`Sampler`]).
//!
//! A sampler encodes texture filtering and addressing state independently
//! of any particular image. One sampler can be reused with many image views.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateSamplerError {
    #[error("Vulkan error creating sampler: {0}")]
    Vulkan(vk::Result),
}

/// Filtering and addressing for a [`Sampler`].
///
/// `address_mode` applies to U, V and W. `max_anisotropy` is honoured only
/// when the device was created with `sampler_anisotropy`, and is clamped to
/// the adapter limit.
#[derive(Debug, Clone, Copy)]
pub struct SamplerInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

impl Default for SamplerInfo {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
        }
    }
}

/// Anisotropy level actually applied on `device`, if any.
pub fn effective_anisotropy(device: &Device, requested: Option<f32>) -> Option<f32> {
    let requested = requested?;
    if device.enabled_features().sampler_anisotropy == vk::FALSE {
        tracing::debug!("Sampler anisotropy requested but not enabled on the device");
        return None;
    }
    let limit = device.capabilities().limits.max_sampler_anisotropy;
    Some(requested.clamp(1.0, limit.max(1.0)))
}

/// An owned `VkSampler`.
pub struct Sampler {
    parent: Arc<Device>,
    handle: vk::Sampler,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    pub fn new(
        device: &Arc<Device>,
        info: &SamplerInfo,
        name: Option<&str>,
    ) -> Result<Self, CreateSamplerError> {
        let anisotropy = effective_anisotropy(device, info.max_anisotropy);
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(info.mag_filter)
            .min_filter(info.min_filter)
            .address_mode_u(info.address_mode)
            .address_mode_v(info.address_mode)
            .address_mode_w(info.address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);

        // SAFETY: create_info has no borrowed data.
        let handle = unsafe { device.dispatch().create_raw_sampler(&create_info) }
            .map_err(CreateSamplerError::Vulkan)?;
        device.apply_debug_name(handle, name, "sampler");

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        tracing::debug!("Dropping sampler {:?}", self.handle);
        // SAFETY: Owned handle; no pending GPU work may reference it.
        unsafe { self.parent.dispatch().destroy_raw_sampler(self.handle) };
    }
}
