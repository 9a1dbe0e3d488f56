//! Logical device wrapper ([`Device`]).
//!
//! `Device` owns the device-level dispatch table, the `gpu-allocator`
//! allocator (behind a `Mutex`), the capability snapshot of the adapter it
//! was created from and one native queue per distinct queue family chosen by
//! [`discover_queues`].
//!
//! Every wrapper in this crate holds an `Arc<Device>` and issues native calls
//! through [`Device::dispatch`]. Because the table is a trait object, a
//! device can also be built around a recording mock with
//! [`Device::from_dispatch`].

use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::capabilities::{
    DiscoveredQueues, PhysicalDeviceCapabilities, QueueRole,
    RAYTRACING_EXTENSIONS, discover_queues,
};
use crate::dispatch::{AshDispatch, DeviceDispatch};
use crate::instance::{Instance, PhysicalDevice};
use crate::queue::Queue;
use crate::status::Status;
use crate::sync::{Fence, WaitFenceError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Optional core features. A toggle is only enabled when the adapter reports
/// support for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
    pub wide_lines: bool,
    pub geometry_shader: bool,
    pub independent_blend: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub enable_swapchain: bool,
    pub enable_raytracing: bool,
    pub features: DeviceFeatures,
    pub name: Option<String>,
}

/// Describes how an allocation will be accessed by CPU and GPU.
///
/// Passed to [`Device::allocate_memory`] to select the best-matching memory
/// type and decide whether atom-size padding is needed for flushes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. Staging buffers and per-frame uploads.
    CpuToGpu,
    /// GPU-writable, CPU-readable. Readback.
    GpuToCpu,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("Physical device exposes no graphics queue family")]
    NoGraphicsQueue,

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Debug utils extension is not enabled on this device")]
    DebugUtilsNotEnabled,

    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Negotiation helpers
// ---------------------------------------------------------------------------

/// Device extensions requested for `caps` under `info`.
///
/// `VK_KHR_shader_non_semantic_info` is requested whenever the adapter has
/// it and the API version predates its promotion. Swapchain and ray tracing
/// extensions are only requested when both enabled in `info` and supported.
pub fn negotiate_device_extensions(
    caps: &PhysicalDeviceCapabilities,
    info: &DeviceInfo,
) -> Vec<&'static CStr> {
    let mut extensions: Vec<&'static CStr> = Vec::with_capacity(8);

    let pre_1_3 = caps.api_version.major() < 1
        || (caps.api_version.major() == 1 && caps.api_version.minor() < 3);
    if pre_1_3 && caps.supports_extension(ash::khr::shader_non_semantic_info::NAME) {
        extensions.push(ash::khr::shader_non_semantic_info::NAME);
    }

    if info.enable_swapchain {
        if caps.supports_extension(ash::khr::swapchain::NAME) {
            extensions.push(ash::khr::swapchain::NAME);
        } else {
            tracing::warn!(
                "Swapchain requested but {:?} does not support it",
                caps.name
            );
        }
    }

    if info.enable_raytracing {
        if caps.supports_raytracing() {
            extensions.extend_from_slice(RAYTRACING_EXTENSIONS);
        } else {
            tracing::warn!(
                "Ray tracing requested but {:?} does not support it",
                caps.name
            );
        }
    }

    extensions
}

/// Intersect the requested feature toggles with what the adapter supports.
pub fn resolve_features(
    supported: &vk::PhysicalDeviceFeatures,
    requested: DeviceFeatures,
) -> vk::PhysicalDeviceFeatures {
    let pick = |wanted: bool, available: vk::Bool32, label: &str| -> bool {
        if wanted && available == vk::FALSE {
            tracing::warn!("Device feature {label} requested but unsupported");
        }
        wanted && available != vk::FALSE
    };
    vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(pick(
            requested.sampler_anisotropy,
            supported.sampler_anisotropy,
            "samplerAnisotropy",
        ))
        .fill_mode_non_solid(pick(
            requested.fill_mode_non_solid,
            supported.fill_mode_non_solid,
            "fillModeNonSolid",
        ))
        .wide_lines(pick(requested.wide_lines, supported.wide_lines, "wideLines"))
        .geometry_shader(pick(
            requested.geometry_shader,
            supported.geometry_shader,
            "geometryShader",
        ))
        .independent_blend(pick(
            requested.independent_blend,
            supported.independent_blend,
            "independentBlend",
        ))
}

/// Score a memory type for a given usage; `None` if incompatible.
/// Higher scores are preferred.
fn score_memory_type(flags: vk::MemoryPropertyFlags, usage: MemoryUsage) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;
    let device_local = flags.contains(F::DEVICE_LOCAL);
    let host_visible = flags.contains(F::HOST_VISIBLE);
    let host_cached = flags.contains(F::HOST_CACHED);
    match usage {
        // Prefer pure VRAM; penalise unified memory.
        MemoryUsage::GpuOnly => device_local.then_some(if host_visible { 1 } else { 2 }),
        // Prefer DEVICE_LOCAL (ReBAR / unified memory).
        MemoryUsage::CpuToGpu => host_visible.then_some(if device_local { 2 } else { 1 }),
        // Prefer HOST_CACHED for CPU reads.
        MemoryUsage::GpuToCpu => host_visible.then_some(if host_cached { 2 } else { 1 }),
    }
}

/// Best memory type index for `type_bits` and `usage`. Among equal scores the
/// lowest index wins.
pub fn select_memory_type(
    memory_types: &[vk::MemoryType],
    type_bits: u32,
    usage: MemoryUsage,
) -> Option<u32> {
    memory_types
        .iter()
        .enumerate()
        .filter(|(i, _)| *i < 32 && type_bits & (1u32 << *i) != 0)
        .filter_map(|(i, ty)| score_memory_type(ty.property_flags, usage).map(|s| (i as u32, s)))
        .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
        .map(|(i, _)| i)
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// One native queue per distinct family. Roles that resolve to the same
/// family share the mutex.
#[derive(Debug)]
struct QueueSlot {
    family_index: u32,
    queue: Arc<Mutex<vk::Queue>>,
}

/// A logical device and its per-device state.
pub struct Device {
    instance: Option<Arc<Instance>>,
    physical_device: vk::PhysicalDevice,
    capabilities: Arc<PhysicalDeviceCapabilities>,
    allocator: Option<Mutex<Allocator>>,
    dispatch: Arc<dyn DeviceDispatch>,
    queues: DiscoveredQueues,
    queue_slots: Vec<QueueSlot>,
    enabled_extensions: Vec<&'static CStr>,
    enabled_features: vk::PhysicalDeviceFeatures,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.dispatch.raw_device())
            .field("adapter", &self.capabilities.name)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.dispatch.raw_device());
        // Allocator must release its memory blocks before vkDestroyDevice.
        self.allocator = None;
        // SAFETY: Every object derived from this device holds an Arc to it,
        // so they are all gone by now.
        unsafe { self.dispatch.destroy_device() };
    }
}

impl Device {
    /// Create a logical device on `physical_device`.
    ///
    /// One queue is requested from every family that [`discover_queues`]
    /// assigns a role. The allocator and every extension loader are built
    /// from the same `ash::Device`.
    pub fn new(
        instance: &Arc<Instance>,
        physical_device: &PhysicalDevice,
        info: &DeviceInfo,
    ) -> Result<Self, CreateDeviceError> {
        let caps = Arc::clone(physical_device.capabilities());
        let queues = discover_queues(&caps.queue_families);
        if queues.graphics.is_none() {
            return Err(CreateDeviceError::NoGraphicsQueue);
        }

        let families = queues.unique_families();
        tracing::info!(
            "Queue families for {:?}: graphics {:?}, compute {:?}, transfer {:?}",
            caps.name,
            queues.graphics.map(|q| q.family_index),
            queues.compute.map(|q| q.family_index),
            queues.transfer.map(|q| q.family_index),
        );

        let priorities = [1.0f32];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = families
            .iter()
            .map(|entry| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(entry.family_index)
                    .queue_priorities(&priorities)
            })
            .collect();

        let extensions = negotiate_device_extensions(&caps, info);
        tracing::info!("Enabling device extensions: {:?}", extensions);
        let ext_ptrs: Vec<*const std::ffi::c_char> =
            extensions.iter().map(|e| e.as_ptr()).collect();

        let features = resolve_features(&caps.features, info.features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .enabled_features(&features);

        // SAFETY: physical_device was enumerated by instance; create_info and
        // everything it points at live until the call returns.
        let ash_device = unsafe {
            instance.create_ash_device(physical_device.raw_handle(), &create_info)
        }
        .map_err(CreateDeviceError::DeviceCreationFailed)?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: ash_device.clone(),
            physical_device: physical_device.raw_handle(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: Nothing has been created from the device yet.
                unsafe { ash_device.destroy_device(None) };
                return Err(CreateDeviceError::AllocatorCreation(e));
            }
        };

        let dispatch: Arc<dyn DeviceDispatch> = Arc::new(AshDispatch::new(
            instance.ash_instance(),
            ash_device,
            extensions.contains(&ash::khr::swapchain::NAME),
            instance.has_debug_utils(),
        ));

        // SAFETY: dispatch was loaded for a device created with one queue
        // from each family in `queues`.
        let mut device = unsafe { Self::assemble(dispatch, caps, queues) };
        device.instance = Some(Arc::clone(instance));
        device.physical_device = physical_device.raw_handle();
        device.allocator = Some(Mutex::new(allocator));
        device.enabled_extensions = extensions;
        device.enabled_features = features;

        if let Some(name) = info.name.as_deref() {
            device.apply_debug_name(device.raw_handle(), Some(name), "device");
        }

        Ok(device)
    }

    /// Build a device around an existing dispatch table.
    ///
    /// No allocator is attached, so [`allocate_memory`](Self::allocate_memory)
    /// fails on such a device.
    ///
    /// # Safety
    /// `dispatch` must describe a live logical device created with exactly one
    /// queue from every family [`discover_queues`] selects for
    /// `capabilities.queue_families`. Ownership of that device moves to the
    /// returned value, which destroys it on drop.
    pub unsafe fn from_dispatch(
        dispatch: Arc<dyn DeviceDispatch>,
        capabilities: Arc<PhysicalDeviceCapabilities>,
    ) -> Self {
        let queues = discover_queues(&capabilities.queue_families);
        let swapchain = dispatch.has_swapchain();
        // SAFETY: Forwarded from the caller.
        let mut device = unsafe { Self::assemble(dispatch, capabilities, queues) };
        if swapchain {
            device.enabled_extensions.push(ash::khr::swapchain::NAME);
        }
        device
    }

    /// # Safety
    /// See [`from_dispatch`](Self::from_dispatch).
    unsafe fn assemble(
        dispatch: Arc<dyn DeviceDispatch>,
        capabilities: Arc<PhysicalDeviceCapabilities>,
        queues: DiscoveredQueues,
    ) -> Self {
        let queue_slots = queues
            .unique_families()
            .into_iter()
            .map(|entry| QueueSlot {
                family_index: entry.family_index,
                // SAFETY: Caller guarantees queue 0 of each family exists.
                queue: Arc::new(Mutex::new(unsafe {
                    dispatch.get_device_queue(entry.family_index, 0)
                })),
            })
            .collect();
        Self {
            instance: None,
            physical_device: vk::PhysicalDevice::null(),
            capabilities,
            allocator: None,
            dispatch,
            queues,
            queue_slots,
            enabled_extensions: Vec::new(),
            enabled_features: vk::PhysicalDeviceFeatures::default(),
        }
    }

    pub fn instance(&self) -> Option<&Arc<Instance>> {
        self.instance.as_ref()
    }

    pub fn raw_physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn raw_handle(&self) -> vk::Device {
        self.dispatch.raw_device()
    }

    pub fn capabilities(&self) -> &Arc<PhysicalDeviceCapabilities> {
        &self.capabilities
    }

    pub fn dispatch(&self) -> &dyn DeviceDispatch {
        &*self.dispatch
    }

    pub fn discovered_queues(&self) -> &DiscoveredQueues {
        &self.queues
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        self.enabled_extensions.contains(&name)
    }

    /// Core features the device was created with.
    pub fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    pub fn has_swapchain_support(&self) -> bool {
        self.dispatch.has_swapchain()
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.capabilities.limits.non_coherent_atom_size
    }

    /// Family index serving `role`, after the graphics fallback.
    pub fn queue_family(&self, role: QueueRole) -> Option<u32> {
        self.queues
            .get(role)
            .or(self.queues.graphics)
            .map(|entry| entry.family_index)
    }

    /// The queue serving `role`.
    ///
    /// A device without a dedicated compute or transfer family hands out its
    /// graphics queue for that role. Returns `None` only when the device has
    /// no graphics family either.
    pub fn queue(self: &Arc<Self>, role: QueueRole) -> Option<Queue> {
        let family_index = self.queue_family(role)?;
        let slot = self
            .queue_slots
            .iter()
            .find(|slot| slot.family_index == family_index)?;
        Some(Queue::new(
            Arc::clone(self),
            role,
            family_index,
            Arc::clone(&slot.queue),
        ))
    }

    /// Wait until all submitted work on this device has completed.
    ///
    /// Meant for coarse transitions (shutdown, suspend, swapchain teardown)
    /// rather than per-frame paths.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // SAFETY: The device is live; no pointer arguments.
        unsafe { self.dispatch.device_wait_idle() }
    }

    /// Block until all (`wait_all`) or any of `fences` signal, or
    /// `timeout_ns` elapses.
    ///
    /// A timeout is `Ok(Status::NotReady)`. Fences observed signaled have
    /// their host-side state updated.
    ///
    /// # Panics
    /// If `fences` is empty or contains a fence from another device.
    pub fn wait_for_fences(
        &self,
        fences: &[&Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<Status, WaitFenceError> {
        assert!(!fences.is_empty(), "wait_for_fences requires at least one fence");
        assert!(
            fences
                .iter()
                .all(|f| std::ptr::eq(Arc::as_ptr(f.parent()), self)),
            "wait_for_fences called with a fence from another device"
        );

        let never_submitted = |f: &&Fence| f.is_unsubmitted();
        let hopeless = if wait_all {
            fences.iter().any(never_submitted)
        } else {
            fences.iter().all(never_submitted)
        };
        if timeout_ns == u64::MAX && hopeless {
            return Err(WaitFenceError::NeverSubmitted);
        }

        let _span = tracing::debug_span!("wait_for_fences", count = fences.len(), wait_all)
            .entered();
        let raw: Vec<vk::Fence> = fences.iter().map(|f| f.raw_handle()).collect();
        // SAFETY: Every fence belongs to this device (asserted above).
        match unsafe { self.dispatch.wait_for_raw_fences(&raw, wait_all, timeout_ns) } {
            Ok(()) => {
                for fence in fences {
                    if wait_all {
                        fence.mark_signaled();
                    } else {
                        fence.refresh()?;
                    }
                }
                Ok(Status::Success)
            }
            Err(vk::Result::TIMEOUT) => Ok(Status::NotReady),
            Err(e) => Err(WaitFenceError::Vulkan(e)),
        }
    }
}

// Memory
impl Device {
    /// Allocate device memory for `requirements`.
    ///
    /// Narrows `memory_type_bits` to the best type for `usage` and, when that
    /// type is host-visible but not coherent, rounds size and alignment up to
    /// `nonCoherentAtomSize` so flushes stay in bounds.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let Some(allocator) = self.allocator.as_ref() else {
            return Err(AllocationError::Internal(
                "device was created without an allocator".to_owned(),
            ));
        };

        let atom = self.non_coherent_atom_size().max(1);
        let requirements = match select_memory_type(
            &self.capabilities.memory_types,
            requirements.memory_type_bits,
            usage,
        ) {
            Some(idx) => {
                use vk::MemoryPropertyFlags as F;
                let flags = self.capabilities.memory_types[idx as usize].property_flags;
                let non_coherent_visible =
                    flags.contains(F::HOST_VISIBLE) && !flags.contains(F::HOST_COHERENT);
                let (size, alignment) = if non_coherent_visible {
                    (
                        requirements.size.div_ceil(atom) * atom,
                        requirements.alignment.max(atom),
                    )
                } else {
                    (requirements.size, requirements.alignment)
                };
                vk::MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits: 1 << idx,
                }
            }
            None => requirements,
        };

        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        allocator
            .lock()
            .expect("allocator lock poisoned")
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
    }

    pub fn free_memory(&self, allocation: Allocation) -> Result<(), AllocationError> {
        let Some(allocator) = self.allocator.as_ref() else {
            return Err(AllocationError::Internal(
                "device was created without an allocator".to_owned(),
            ));
        };
        allocator
            .lock()
            .expect("allocator lock poisoned")
            .free(allocation)
    }
}

// Debug naming
impl Device {
    /// Set a debug name on an object owned by this device.
    ///
    /// Passing `None` is a no-op.
    ///
    /// # Safety
    /// `object` must be a live handle created from this device.
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        if !self.dispatch.has_debug_utils() {
            return Err(NameObjectError::DebugUtilsNotEnabled);
        }
        let Some(name) = name else {
            return Ok(());
        };
        let name = CString::new(name).map_err(NameObjectError::InvalidName)?;
        // SAFETY: Caller guarantees object provenance.
        unsafe {
            self.dispatch
                .set_raw_object_name(H::TYPE, object.as_raw(), &name)
        }
        .map_err(NameObjectError::Vulkan)
    }

    /// Name `object` and log instead of failing. Used by constructors.
    pub(crate) fn apply_debug_name<H: vk::Handle + Copy>(
        &self,
        object: H,
        name: Option<&str>,
        kind: &str,
    ) {
        let raw = object.as_raw();
        // SAFETY: Constructors call this with the handle they just created.
        match unsafe { self.set_object_name_str(object, name) } {
            Ok(()) | Err(NameObjectError::DebugUtilsNotEnabled) => {}
            Err(e) => tracing::warn!("Failed to name {kind} {raw:#x}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::QueueFamilyInfo;
    use crate::instance::VkVersion;
    use crate::testing::mock_device_with_families;
    use ash::vk::Handle;

    fn caps_with_extensions(names: &[&CStr]) -> PhysicalDeviceCapabilities {
        PhysicalDeviceCapabilities {
            api_version: VkVersion::new(0, 1, 2, 0),
            extensions: names
                .iter()
                .map(|n| n.to_string_lossy().into_owned())
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn swapchain_requires_support_and_request() {
        let supported = caps_with_extensions(&[ash::khr::swapchain::NAME]);
        let unsupported = caps_with_extensions(&[]);
        let wants = DeviceInfo {
            enable_swapchain: true,
            ..Default::default()
        };
        let does_not_want = DeviceInfo::default();

        assert!(negotiate_device_extensions(&supported, &wants).contains(&ash::khr::swapchain::NAME));
        assert!(!negotiate_device_extensions(&supported, &does_not_want)
            .contains(&ash::khr::swapchain::NAME));
        assert!(!negotiate_device_extensions(&unsupported, &wants)
            .contains(&ash::khr::swapchain::NAME));
    }

    #[test]
    fn raytracing_is_all_or_nothing() {
        let mut caps = caps_with_extensions(RAYTRACING_EXTENSIONS);
        let info = DeviceInfo {
            enable_raytracing: true,
            ..Default::default()
        };
        let exts = negotiate_device_extensions(&caps, &info);
        for ext in RAYTRACING_EXTENSIONS {
            assert!(exts.contains(ext));
        }

        caps.extensions.pop();
        let exts = negotiate_device_extensions(&caps, &info);
        assert!(RAYTRACING_EXTENSIONS.iter().all(|ext| !exts.contains(ext)));
    }

    #[test]
    fn non_semantic_info_only_before_1_3() {
        let mut caps = caps_with_extensions(&[ash::khr::shader_non_semantic_info::NAME]);
        let info = DeviceInfo::default();
        assert_eq!(
            negotiate_device_extensions(&caps, &info),
            vec![ash::khr::shader_non_semantic_info::NAME]
        );
        caps.api_version = VkVersion::new(0, 1, 3, 0);
        assert!(negotiate_device_extensions(&caps, &info).is_empty());
    }

    #[test]
    fn unsupported_features_are_dropped() {
        let supported = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let requested = DeviceFeatures {
            sampler_anisotropy: true,
            geometry_shader: true,
            ..Default::default()
        };
        let enabled = resolve_features(&supported, requested);
        assert_eq!(enabled.sampler_anisotropy, vk::TRUE);
        assert_eq!(enabled.geometry_shader, vk::FALSE);
        assert_eq!(enabled.wide_lines, vk::FALSE);
    }

    #[test]
    fn memory_type_selection_prefers_by_usage() {
        use vk::MemoryPropertyFlags as F;
        let types = [
            vk::MemoryType {
                property_flags: F::HOST_VISIBLE | F::HOST_COHERENT,
                heap_index: 1,
            },
            vk::MemoryType {
                property_flags: F::DEVICE_LOCAL,
                heap_index: 0,
            },
            vk::MemoryType {
                property_flags: F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED,
                heap_index: 1,
            },
        ];
        assert_eq!(select_memory_type(&types, 0b111, MemoryUsage::GpuOnly), Some(1));
        assert_eq!(select_memory_type(&types, 0b111, MemoryUsage::CpuToGpu), Some(0));
        assert_eq!(select_memory_type(&types, 0b111, MemoryUsage::GpuToCpu), Some(2));
        assert_eq!(select_memory_type(&types, 0b001, MemoryUsage::GpuOnly), None);
    }

    #[test]
    fn absent_roles_fall_back_to_graphics() {
        let (device, _mock) = mock_device_with_families(&[QueueFamilyInfo {
            flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
            queue_count: 1,
        }]);
        let graphics = device.queue(QueueRole::Graphics).expect("graphics queue");
        let compute = device.queue(QueueRole::Compute).expect("compute fallback");
        let transfer = device.queue(QueueRole::Transfer).expect("transfer fallback");
        assert_eq!(compute.family_index(), 0);
        assert_eq!(transfer.family_index(), 0);
        assert!(graphics.shares_native_queue(&compute));
        assert!(graphics.shares_native_queue(&transfer));
    }

    #[test]
    fn dedicated_roles_get_their_own_queue() {
        let (device, mock) = mock_device_with_families(&[
            QueueFamilyInfo {
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 4,
            },
            QueueFamilyInfo {
                flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 2,
            },
            QueueFamilyInfo {
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
            },
        ]);
        let compute = device.queue(QueueRole::Compute).expect("compute");
        let transfer = device.queue(QueueRole::Transfer).expect("transfer");
        assert_eq!(compute.family_index(), 1);
        assert_eq!(transfer.family_index(), 2);
        assert!(!compute.shares_native_queue(&transfer));
        assert_eq!(mock.count_calls("get_device_queue"), 3);
    }

    #[test]
    fn allocation_without_allocator_is_an_error() {
        let (device, _mock) = crate::testing::mock_device();
        let result = device.allocate_memory(
            "test",
            vk::MemoryRequirements {
                size: 64,
                alignment: 16,
                memory_type_bits: 1,
            },
            MemoryUsage::CpuToGpu,
            true,
        );
        assert!(matches!(result, Err(AllocationError::Internal(_))));
    }

    #[test]
    fn naming_without_debug_utils_reports_disabled() {
        let (device, mock) = crate::testing::mock_device();
        // SAFETY: The mock accepts any handle.
        let result = unsafe { device.set_object_name_str(vk::Fence::from_raw(7), Some("x")) };
        assert!(matches!(result, Err(NameObjectError::DebugUtilsNotEnabled)));
        assert_eq!(mock.count_calls("set_raw_object_name"), 0);
    }

    #[test]
    fn constructor_naming_uses_the_handle_and_tolerates_failure() {
        let (device, mock) = crate::testing::mock_device();
        mock.set_debug_utils(true);
        let fence = vk::Fence::from_raw(0x42);

        device.apply_debug_name(fence, Some("frame fence"), "fence");
        let calls = mock.calls();
        let named = calls
            .iter()
            .find(|c| c.name == "set_raw_object_name")
            .expect("object named");
        assert_eq!(
            named.handles,
            vec![vk::ObjectType::FENCE.as_raw() as u64, 0x42]
        );

        mock.clear_calls();
        mock.fail_next("set_raw_object_name", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        device.apply_debug_name(fence, Some("frame fence"), "fence");
        assert_eq!(mock.count_calls("set_raw_object_name"), 1);

        mock.clear_calls();
        device.apply_debug_name(fence, None, "fence");
        assert_eq!(mock.count_calls("set_raw_object_name"), 0);
    }

    #[test]
    fn dropping_device_destroys_it_once() {
        let (device, mock) = crate::testing::mock_device();
        drop(device);
        assert_eq!(mock.count_calls("destroy_device"), 1);
    }
}
