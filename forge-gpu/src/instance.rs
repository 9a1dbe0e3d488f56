//! Vulkan instance creation and physical device enumeration.
//!
//! [`Instance`] wraps an `ash::Instance` and owns the entry-point loader, an
//! optional debug messenger and an optional surface extension loader. At
//! creation it enumerates every adapter once and snapshots its
//! [`PhysicalDeviceCapabilities`]; those snapshots are never refreshed.
//!
//! [`VkVersion`] is a thin newtype over the packed Vulkan version word.

use std::{
    ffi::{CStr, CString},
    fmt::Debug,
    sync::Arc,
};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::capabilities::{
    PhysicalDeviceCapabilities, select_best_physical_device,
};
use crate::surface::{CreateSurfaceError, SurfaceQueryError, SurfaceSupportError};

/// Minimum severity level for Vulkan validation layer messages.
///
/// Messages at or above the chosen level are forwarded to the [`tracing`]
/// subscriber; lower-severity messages are suppressed. Variants are ordered
/// least-to-most severe: `Verbose < Info < Warning < Error`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// A packed Vulkan API version number.
///
/// Wraps the 32-bit encoding used by `VkApplicationInfo` and
/// `vkEnumerateInstanceVersion`. Construct from components with
/// [`new`](Self::new), or wrap an already-encoded word with
/// [`from_raw`](Self::from_raw).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub fn to_tuple(&self) -> (u32, u32, u32, u32) {
        (self.variant(), self.major(), self.minor(), self.patch())
    }

    pub fn from_tuple(tuple: (u32, u32, u32, u32)) -> Self {
        Self::new(tuple.0, tuple.1, tuple.2, tuple.3)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

/// Settings for [`Instance::new`].
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub app_name: String,
    /// Request the Khronos validation layer with this minimum severity.
    /// Silently downgraded to no validation when the layer or
    /// `VK_EXT_debug_utils` is missing.
    pub validation: Option<VulkanLogLevel>,
    /// Enable the surface extensions required by the display handle passed
    /// to [`Instance::new`].
    pub surface: bool,
}

impl Default for InstanceInfo {
    fn default() -> Self {
        Self {
            app_name: String::from("forge"),
            validation: None,
            surface: true,
        }
    }
}

/// An adapter enumerated by an [`Instance`], with its capability snapshot.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    capabilities: Arc<PhysicalDeviceCapabilities>,
}

impl PhysicalDevice {
    pub fn raw_handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn capabilities(&self) -> &Arc<PhysicalDeviceCapabilities> {
        &self.capabilities
    }
}

/// The root Vulkan object.
///
/// Owns the `ash::Entry` loader, the `ash::Instance` handle, an optional
/// debug messenger, optional surface extension state and the list of
/// enumerated adapters. All objects derived from an instance hold an
/// `Arc<Instance>` to keep it alive.
pub struct Instance {
    entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    ver: VkVersion,
    physical_devices: Vec<PhysicalDevice>,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("physical_devices", &self.physical_devices.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Couldn't get display handle from passed value: {0}")]
    InvalidDisplayHandle(crate::RwhHandleError),
    #[error("Missing mandatory instance extensions: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Failed to enumerate physical devices: {0}")]
    PhysicalDevices(#[from] FetchPhysicalDeviceError),
    #[error("Unknown Vulkan Error {0}")]
    UnknownVulkan(vk::Result),
    #[error("Invalid app name was passed to Instance::new")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::UnknownVulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum DestroyRawSurfaceError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((debug_messenger, debug_utils_instance)) =
            self.debug_messenger.take()
        {
            // SAFETY: last use of this debug messenger. It was made from
            // this instance and debug_utils_instance is derived from it.
            unsafe {
                debug_utils_instance
                    .destroy_debug_utils_messenger(debug_messenger, None)
            };
        }
        // SAFETY: We are in drop so this is the last use of instance. Every
        // derived object holds an Arc to us and is already gone.
        unsafe { self.handle.destroy_instance(None) };
    }
}

/// Forwards validation messages to `tracing`. Must never unwind or block.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: Vulkan guarantees p_callback_data points at a valid struct for
    // the duration of the callback; checked non-null above.
    let p_message = unsafe { (*p_callback_data).p_message };
    if p_message.is_null() {
        return vk::FALSE;
    }
    // SAFETY: p_message is a NUL terminated string owned by the loader.
    let message = unsafe { CStr::from_ptr(p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "forge-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "forge-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "forge-debug-messenger", "[{}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "forge-debug-messenger", "[{}] {}", type_str, message);
        }
        _ => {
            tracing::debug!(target: "forge-debug-messenger", "[{}] {}", type_str, message);
        }
    }

    vk::FALSE
}

fn severity_mask(level: VulkanLogLevel) -> vk::DebugUtilsMessageSeverityFlagsEXT {
    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match level {
        VulkanLogLevel::Verbose => S::VERBOSE | S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
        VulkanLogLevel::Warning => S::WARNING | S::ERROR,
        VulkanLogLevel::Error => S::ERROR,
    }
}

// ---------------------------------------------------------------------------
// Extension negotiation
// ---------------------------------------------------------------------------

/// Always requested when the loader offers them.
const BASE_EXTENSIONS: &[&CStr] = &[ash::khr::get_physical_device_properties2::NAME];

/// Window-system extensions added when the loader reports them, on top of
/// whatever the display handle strictly requires.
#[cfg(target_os = "windows")]
const PLATFORM_WSI_EXTENSIONS: &[&CStr] = &[ash::khr::win32_surface::NAME];
#[cfg(all(unix, not(any(target_os = "macos", target_os = "ios", target_os = "android"))))]
const PLATFORM_WSI_EXTENSIONS: &[&CStr] = &[
    ash::khr::xlib_surface::NAME,
    ash::khr::xcb_surface::NAME,
    ash::khr::wayland_surface::NAME,
];
#[cfg(any(target_os = "macos", target_os = "ios"))]
const PLATFORM_WSI_EXTENSIONS: &[&CStr] = &[ash::ext::metal_surface::NAME];
#[cfg(target_os = "android")]
const PLATFORM_WSI_EXTENSIONS: &[&CStr] = &[ash::khr::android_surface::NAME];
#[cfg(not(any(unix, target_os = "windows")))]
const PLATFORM_WSI_EXTENSIONS: &[&CStr] = &[];

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Decide whether the requested validation level can be honoured.
///
/// Validation needs both the Khronos layer and `VK_EXT_debug_utils`; when
/// either is missing the request is dropped and instance creation carries
/// on without it.
fn negotiate_validation(
    requested: Option<VulkanLogLevel>,
    available_layers: &[&CStr],
    available_extensions: &[&CStr],
) -> Option<VulkanLogLevel> {
    let level = requested?;
    let layer_available = available_layers.contains(&VALIDATION_LAYER_NAME);
    let debug_utils_available = available_extensions.contains(&ash::ext::debug_utils::NAME);
    if layer_available && debug_utils_available {
        Some(level)
    } else {
        tracing::debug!(
            "Validation requested but unavailable \
             (layer: {layer_available}, debug utils: {debug_utils_available}); \
             continuing without"
        );
        None
    }
}

/// Pick the instance extensions to enable.
///
/// `required` must all be present; the base list, platform list and debug
/// utils are only added when `available` contains them. Returns the names of
/// missing required extensions on failure.
fn negotiate_instance_extensions<'a>(
    available: &[&CStr],
    required: &[&'a CStr],
    platform: &[&'a CStr],
    want_debug_utils: bool,
) -> Result<Vec<&'a CStr>, Vec<String>> {
    let missing: Vec<String> = required
        .iter()
        .filter(|ext| !available.contains(ext))
        .map(|ext| ext.to_string_lossy().into_owned())
        .collect();
    if !missing.is_empty() {
        return Err(missing);
    }

    let mut enabled: Vec<&'a CStr> = Vec::with_capacity(8);
    let mut push = |ext: &'a CStr| {
        if !enabled.contains(&ext) {
            enabled.push(ext);
        }
    };
    for ext in BASE_EXTENSIONS.iter().copied() {
        if available.contains(&ext) {
            push(ext);
        }
    }
    for ext in required.iter().copied() {
        push(ext);
    }
    if !required.is_empty() {
        for ext in platform.iter().copied() {
            if available.contains(&ext) {
                push(ext);
            }
        }
    }
    if want_debug_utils && available.contains(&ash::ext::debug_utils::NAME) {
        push(ash::ext::debug_utils::NAME);
    }
    Ok(enabled)
}

impl Instance {
    /// Load Vulkan, create an instance and enumerate its adapters.
    ///
    /// When `info.surface` is set and `display_handle_source` is given, the
    /// surface extensions it requires become mandatory. A requested
    /// validation layer that is not installed is dropped with a debug log
    /// rather than failing.
    ///
    /// # Safety
    /// This loads Vulkan using libloading, meaning arbitrary code from the
    /// system loader runs in-process.
    pub unsafe fn new(
        info: &InstanceInfo,
        display_handle_source: Option<&impl HasDisplayHandle>,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name_cstring =
            CString::new(info.app_name.as_str()).map_err(|_| Error::InvalidAppName)?;

        // SAFETY: We pass on the burden of the safety from loading dlls to the
        // caller. Entry outlives every object made from it because Instance
        // owns it and destroys the instance first.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is live; vkEnumerateInstanceVersion has no other
        // preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        let mut required_exts: Vec<&'static CStr> = Vec::new();
        let surface_requested = info.surface && display_handle_source.is_some();
        if let Some(display_handle_source) = display_handle_source
            && info.surface
        {
            let ash_window_exts = ash_window::enumerate_required_extensions(
                display_handle_source
                    .display_handle()
                    .map_err(Error::InvalidDisplayHandle)?
                    .as_raw(),
            )?;
            required_exts.extend(
                ash_window_exts
                    .iter()
                    // SAFETY: ash_window hands out pointers to 'static NUL
                    // terminated extension name constants.
                    .map(|ext_cstr_ptr| unsafe { CStr::from_ptr(*ext_cstr_ptr) }),
            );
        }

        // SAFETY: entry is live; None queries global extensions.
        let instance_exts_avail =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is live.
        let instance_layers_avail =
            unsafe { entry.enumerate_instance_layer_properties() };

        let available_names: Vec<&CStr> = instance_exts_avail
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();

        let layer_names: Vec<&CStr> = instance_layers_avail
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|layer| layer.layer_name_as_c_str().ok())
            .collect();
        let validation_level =
            negotiate_validation(info.validation, &layer_names, &available_names);

        let enabled_exts = negotiate_instance_extensions(
            &available_names,
            &required_exts,
            PLATFORM_WSI_EXTENSIONS,
            validation_level.is_some(),
        )
        .map_err(Error::MissingExtensions)?;
        tracing::debug!("Enabled instance extensions: {enabled_exts:?}");

        let enabled_ext_ptrs: Vec<_> =
            enabled_exts.iter().map(|ext| ext.as_ptr()).collect();
        let mut enabled_layers: Vec<*const std::ffi::c_char> = Vec::new();

        let mut debug_messenger_create_info = validation_level.map(|level| {
            enabled_layers.push(VALIDATION_LAYER_NAME.as_ptr());
            vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(severity_mask(level))
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback))
        });

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"forge")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_ext_ptrs)
            .enabled_layer_names(&enabled_layers);

        if let Some(ref mut debug_info) = debug_messenger_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        // SAFETY: instance_create_info and everything it points to is alive
        // for this call.
        let handle = unsafe { entry.create_instance(&instance_create_info, None) }?;

        let debug_messenger =
            if let Some(mut debug_messenger_create_info) = debug_messenger_create_info {
                debug_messenger_create_info.p_next = std::ptr::null();
                let debug_utils_instance =
                    ash::ext::debug_utils::Instance::new(&entry, &handle);
                // SAFETY: valid create info for an instance with debug utils.
                match unsafe {
                    debug_utils_instance
                        .create_debug_utils_messenger(&debug_messenger_create_info, None)
                } {
                    Ok(messenger) => Some((messenger, debug_utils_instance)),
                    Err(e) => {
                        tracing::error!(
                            "Failed to create debug messenger, continuing \
                             without one: {e}"
                        );
                        None
                    }
                }
            } else {
                None
            };

        let surface_instance = surface_requested
            .then(|| ash::khr::surface::Instance::new(&entry, &handle));

        let mut instance = Instance {
            entry,
            handle,
            debug_messenger,
            surface_instance,
            ver: VkVersion::from_raw(api_version),
            physical_devices: Vec::new(),
        };
        instance.physical_devices = instance.enumerate_physical_devices()?;
        Ok(instance)
    }

    fn enumerate_physical_devices(
        &self,
    ) -> Result<Vec<PhysicalDevice>, FetchPhysicalDeviceError> {
        let raw_devices = self.fetch_raw_physical_devices()?;
        let mut devices = Vec::with_capacity(raw_devices.len());
        for handle in raw_devices {
            // SAFETY: handle was just enumerated from this instance.
            match unsafe { PhysicalDeviceCapabilities::query(&self.handle, handle) } {
                Ok(capabilities) => {
                    tracing::debug!(
                        "Found physical device {:?} ({:?})",
                        capabilities.name,
                        capabilities.device_type
                    );
                    devices.push(PhysicalDevice {
                        handle,
                        capabilities: Arc::new(capabilities),
                    });
                }
                Err(e) => {
                    tracing::warn!("Skipping physical device {handle:?}: {e}");
                }
            }
        }
        Ok(devices)
    }

    /// Get a vector of handles to available physical devices. These handles are
    /// ONLY valid in the context of this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: The instance is live.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// Adapters in enumeration order, snapshotted at creation.
    pub fn physical_devices(&self) -> &[PhysicalDevice] {
        &self.physical_devices
    }

    /// Highest scoring adapter that passes `filter`. Ties resolve to the
    /// earliest enumerated adapter.
    pub fn pick_physical_device(
        &self,
        filter: impl Fn(&PhysicalDevice) -> bool,
    ) -> Option<&PhysicalDevice> {
        let candidates: Vec<&PhysicalDevice> =
            self.physical_devices.iter().filter(|d| filter(d)).collect();
        let best = select_best_physical_device(
            candidates.iter().map(|d| d.capabilities.as_ref()),
        )?;
        let chosen = candidates[best];
        tracing::info!(
            "Selected physical device: {:?} (type: {:?})",
            chosen.capabilities.name,
            chosen.capabilities.device_type
        );
        Some(chosen)
    }

    /// Create a logical device from a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    /// `create_info` must be a valid DeviceCreateInfo.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: Caller guarantees provenance and create_info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }

    /// The Vulkan API version reported by `vkEnumerateInstanceVersion`.
    pub fn supported_ver(&self) -> VkVersion {
        self.ver
    }

    pub fn has_debug_utils(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

// Surface functionality
impl Instance {
    /// Check if a queue family on a physical device supports presenting to
    /// a surface.
    ///
    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceSupportError::ExtensionNotLoaded)?;
        // SAFETY: Caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_support(
                physical_device,
                queue_family_index,
                surface,
            )
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: Caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_formats(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: Caller guarantees provenance.
        unsafe {
            surface_instance.get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// # Safety
    /// `physical_device` and `surface` must be derived from this instance.
    pub unsafe fn get_surface_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(SurfaceQueryError::ExtensionNotLoaded)?;
        // SAFETY: Caller guarantees provenance.
        unsafe {
            surface_instance
                .get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(SurfaceQueryError::Vulkan)
    }

    /// Create a raw VkSurfaceKHR.
    ///
    /// # Safety
    /// The returned surface must be destroyed before `source` is dropped, or
    /// when the surface is invalidated (for example by a suspend event). It
    /// must only be used with this instance.
    pub unsafe fn create_raw_surface<T: HasDisplayHandle + HasWindowHandle>(
        &self,
        source: &T,
    ) -> Result<vk::SurfaceKHR, CreateSurfaceError> {
        use CreateSurfaceError as Error;
        if self.surface_instance.is_none() {
            return Err(Error::MissingExtension);
        }
        let display = source
            .display_handle()
            .map_err(Error::InvalidDisplayHandle)?
            .as_raw();
        let window = source
            .window_handle()
            .map_err(Error::InvalidWindowHandle)?
            .as_raw();
        // SAFETY: Handles come from a live window source; the surface
        // extensions it needs were enabled at instance creation.
        unsafe { ash_window::create_surface(&self.entry, &self.handle, display, window, None) }
            .map_err(Error::VulkanError)
    }

    /// Destroy the raw VkSurfaceKHR.
    ///
    /// # Safety
    /// All objects derived from `surf` must be destroyed first and `surf`
    /// must be derived from this instance.
    pub unsafe fn destroy_raw_surface(
        &self,
        surf: vk::SurfaceKHR,
    ) -> Result<(), DestroyRawSurfaceError> {
        let surface_instance = self
            .surface_instance
            .as_ref()
            .ok_or(DestroyRawSurfaceError::ExtensionNotLoaded)?;
        // SAFETY: Caller guarantees provenance and drop ordering.
        unsafe { surface_instance.destroy_surface(surf, None) };
        Ok(())
    }
}
