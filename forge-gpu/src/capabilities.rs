//! Immutable per-adapter capability snapshots, device scoring and queue
//! discovery.
//!
//! A [`PhysicalDeviceCapabilities`] is captured once when the instance
//! enumerates adapters and never refreshed. Everything in this module except
//! [`PhysicalDeviceCapabilities::query`] is pure, so device selection and
//! queue-role assignment can be tested against synthetic adapters.

use std::ffi::CStr;

use ash::vk;

use crate::instance::VkVersion;

/// Formats whose feature support is captured in every snapshot.
pub const TRACKED_FORMATS: &[vk::Format] = &[
    vk::Format::R8_UNORM,
    vk::Format::R8G8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R32_SFLOAT,
    vk::Format::R32G32_SFLOAT,
    vk::Format::R32G32B32_SFLOAT,
    vk::Format::R32G32B32A32_SFLOAT,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::D16_UNORM,
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D32_SFLOAT_S8_UINT,
];

/// Device extensions that together make up ray tracing support.
pub const RAYTRACING_EXTENSIONS: &[&CStr] = &[
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// One queue family as reported by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
}

/// Snapshot of one physical adapter.
#[derive(Clone)]
pub struct PhysicalDeviceCapabilities {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: VkVersion,
    pub driver_version: u32,
    /// Key used to decide whether a persisted pipeline cache can be reused.
    pub pipeline_cache_uuid: [u8; vk::UUID_SIZE],
    pub limits: vk::PhysicalDeviceLimits,
    pub features: vk::PhysicalDeviceFeatures,
    pub extensions: Vec<String>,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub memory_types: Vec<vk::MemoryType>,
    pub memory_heaps: Vec<vk::MemoryHeap>,
    pub format_properties: Vec<(vk::Format, vk::FormatProperties)>,
}

impl std::fmt::Debug for PhysicalDeviceCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceCapabilities")
            .field("name", &self.name)
            .field("vendor_id", &self.vendor_id)
            .field("device_id", &self.device_id)
            .field("device_type", &self.device_type)
            .field("api_version", &self.api_version.to_tuple())
            .field("queue_families", &self.queue_families)
            .finish_non_exhaustive()
    }
}

impl Default for PhysicalDeviceCapabilities {
    fn default() -> Self {
        Self {
            name: String::new(),
            vendor_id: 0,
            device_id: 0,
            device_type: vk::PhysicalDeviceType::OTHER,
            api_version: VkVersion::from_raw(vk::API_VERSION_1_0),
            driver_version: 0,
            pipeline_cache_uuid: [0; vk::UUID_SIZE],
            limits: vk::PhysicalDeviceLimits::default(),
            features: vk::PhysicalDeviceFeatures::default(),
            extensions: Vec::new(),
            queue_families: Vec::new(),
            memory_types: Vec::new(),
            memory_heaps: Vec::new(),
            format_properties: Vec::new(),
        }
    }
}

impl PhysicalDeviceCapabilities {
    /// Query everything about `physical_device` in one pass.
    ///
    /// # Safety
    /// `physical_device` must have been enumerated from `instance`.
    pub unsafe fn query(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self, vk::Result> {
        // SAFETY: physical_device was enumerated from instance.
        let properties =
            unsafe { instance.get_physical_device_properties(physical_device) };
        // SAFETY: as above.
        let features =
            unsafe { instance.get_physical_device_features(physical_device) };
        // SAFETY: as above.
        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        };
        // SAFETY: as above.
        let memory = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };
        // SAFETY: as above.
        let extensions = unsafe {
            instance.enumerate_device_extension_properties(physical_device)
        }?;

        let format_properties = TRACKED_FORMATS
            .iter()
            .map(|&format| {
                // SAFETY: as above; format is a core format enum.
                let props = unsafe {
                    instance.get_physical_device_format_properties(
                        physical_device,
                        format,
                    )
                };
                (format, props)
            })
            .collect();

        Ok(Self {
            name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| String::from("unknown")),
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            device_type: properties.device_type,
            api_version: VkVersion::from_raw(properties.api_version),
            driver_version: properties.driver_version,
            pipeline_cache_uuid: properties.pipeline_cache_uuid,
            limits: properties.limits,
            features,
            extensions: extensions
                .iter()
                .filter_map(|ext| {
                    ext.extension_name_as_c_str()
                        .ok()
                        .map(|name| name.to_string_lossy().into_owned())
                })
                .collect(),
            queue_families: queue_families
                .iter()
                .map(|family| QueueFamilyInfo {
                    flags: family.queue_flags,
                    queue_count: family.queue_count,
                })
                .collect(),
            memory_types: memory.memory_types
                [..memory.memory_type_count as usize]
                .to_vec(),
            memory_heaps: memory.memory_heaps
                [..memory.memory_heap_count as usize]
                .to_vec(),
            format_properties,
        })
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|ext| *ext == name)
    }

    pub fn supports_raytracing(&self) -> bool {
        RAYTRACING_EXTENSIONS
            .iter()
            .all(|ext| self.supports_extension(ext))
    }

    /// Feature flags of `format` for the given tiling, if the format is one of
    /// [`TRACKED_FORMATS`].
    pub fn format_features(
        &self,
        format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> Option<vk::FormatFeatureFlags> {
        self.format_properties
            .iter()
            .find(|(f, _)| *f == format)
            .map(|(_, props)| match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features,
                _ => props.optimal_tiling_features,
            })
    }

    pub fn format_supports(
        &self,
        format: vk::Format,
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> bool {
        self.format_features(format, tiling)
            .is_some_and(|supported| supported.contains(features))
    }

    /// First candidate supporting `features`, in candidate order.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Option<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| self.format_supports(format, tiling, features))
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

const TYPE_WEIGHT_DISCRETE: u64 = 40_000_000;
const TYPE_WEIGHT_VIRTUAL: u64 = 30_000_000;
const TYPE_WEIGHT_INTEGRATED: u64 = 20_000_000;
const TYPE_WEIGHT_OTHER: u64 = 10_000_000;
const RAYTRACING_BONUS: u64 = 5_000_000;

/// Ceiling for the summed limit and version terms. Kept below half the gap
/// between two type weights so the ray tracing bonus plus every limit term
/// still cannot lift a device over the next device type.
const LIMIT_TERMS_CAP: u64 = 4_000_000;

/// Rank an adapter. Higher is better.
///
/// Device type dominates (discrete > virtual > integrated > everything
/// else), then a ray tracing bonus, then small additive terms for image and
/// buffer limits and the supported API minor version. Pure and total.
pub fn score_physical_device(caps: &PhysicalDeviceCapabilities) -> u64 {
    let type_weight = match caps.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => TYPE_WEIGHT_DISCRETE,
        vk::PhysicalDeviceType::VIRTUAL_GPU => TYPE_WEIGHT_VIRTUAL,
        vk::PhysicalDeviceType::INTEGRATED_GPU => TYPE_WEIGHT_INTEGRATED,
        _ => TYPE_WEIGHT_OTHER,
    };

    let limits = &caps.limits;
    let limit_terms = u64::from(limits.max_image_dimension2_d.min(65_536)) * 16
        + u64::from(limits.max_image_dimension3_d.min(16_384)) * 8
        + u64::from(limits.max_uniform_buffer_range >> 10).min(65_536)
        + u64::from(limits.max_storage_buffer_range >> 20).min(4_096) * 64
        + u64::from(limits.max_bound_descriptor_sets.min(64)) * 1_000
        + u64::from(caps.api_version.minor().min(100)) * 1_000;

    let raytracing = if caps.supports_raytracing() {
        RAYTRACING_BONUS
    } else {
        0
    };

    type_weight + raytracing + limit_terms.min(LIMIT_TERMS_CAP)
}

/// Index of the best scoring adapter. Ties go to the earliest entry.
pub fn select_best_physical_device<'a>(
    candidates: impl IntoIterator<Item = &'a PhysicalDeviceCapabilities>,
) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, caps) in candidates.into_iter().enumerate() {
        let score = score_physical_device(caps);
        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

// ---------------------------------------------------------------------------
// Queue discovery
// ---------------------------------------------------------------------------

/// The three queue roles a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
}

/// A queue family chosen for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub family_index: u32,
    pub queue_count: u32,
    pub flags: vk::QueueFlags,
}

/// Result of [`discover_queues`]. Any role may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveredQueues {
    pub graphics: Option<QueueEntry>,
    pub compute: Option<QueueEntry>,
    pub transfer: Option<QueueEntry>,
}

impl DiscoveredQueues {
    pub fn get(&self, role: QueueRole) -> Option<QueueEntry> {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Compute => self.compute,
            QueueRole::Transfer => self.transfer,
        }
    }

    /// Distinct family indices in role order.
    pub fn unique_families(&self) -> Vec<QueueEntry> {
        let mut unique: Vec<QueueEntry> = Vec::with_capacity(3);
        for entry in [self.graphics, self.compute, self.transfer]
            .into_iter()
            .flatten()
        {
            if !unique.iter().any(|e| e.family_index == entry.family_index) {
                unique.push(entry);
            }
        }
        unique
    }
}

/// Assign queue families to roles.
///
/// - graphics: first family with `GRAPHICS`
/// - compute: first family with `COMPUTE` and without `GRAPHICS`
/// - transfer: first family with `TRANSFER` and without `COMPUTE` or
///   `GRAPHICS`
///
/// On top of the flag predicates, a family reporting a zero queue count is
/// skipped even when its flags match, since no queue can be retrieved from
/// it; the role then falls to the next matching family or stays empty.
pub fn discover_queues(families: &[QueueFamilyInfo]) -> DiscoveredQueues {
    let find = |predicate: &dyn Fn(vk::QueueFlags) -> bool| {
        families.iter().enumerate().find_map(|(index, family)| {
            (family.queue_count > 0 && predicate(family.flags)).then_some(
                QueueEntry {
                    family_index: index as u32,
                    queue_count: family.queue_count,
                    flags: family.flags,
                },
            )
        })
    };

    use vk::QueueFlags as Q;
    DiscoveredQueues {
        graphics: find(&|flags| flags.contains(Q::GRAPHICS)),
        compute: find(&|flags| {
            flags.contains(Q::COMPUTE) && !flags.contains(Q::GRAPHICS)
        }),
        transfer: find(&|flags| {
            flags.contains(Q::TRANSFER)
                && !flags.intersects(Q::COMPUTE | Q::GRAPHICS)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            queue_count: 1,
        }
    }

    fn device(device_type: vk::PhysicalDeviceType) -> PhysicalDeviceCapabilities {
        PhysicalDeviceCapabilities {
            device_type,
            limits: vk::PhysicalDeviceLimits {
                max_image_dimension2_d: 16_384,
                max_image_dimension3_d: 2_048,
                max_uniform_buffer_range: 65_536,
                max_storage_buffer_range: u32::MAX,
                max_bound_descriptor_sets: 8,
                ..Default::default()
            },
            api_version: VkVersion::new(0, 1, 3, 0),
            ..Default::default()
        }
    }

    fn with_raytracing(mut caps: PhysicalDeviceCapabilities) -> PhysicalDeviceCapabilities {
        caps.extensions = RAYTRACING_EXTENSIONS
            .iter()
            .map(|ext| ext.to_string_lossy().into_owned())
            .collect();
        caps
    }

    #[test]
    fn discovery_picks_disjoint_roles() {
        use vk::QueueFlags as Q;
        let families = [
            family(Q::TRANSFER),
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER),
            family(Q::COMPUTE | Q::TRANSFER),
            family(Q::TRANSFER | Q::SPARSE_BINDING),
        ];
        let queues = discover_queues(&families);
        assert_eq!(queues.graphics.map(|q| q.family_index), Some(1));
        assert_eq!(queues.compute.map(|q| q.family_index), Some(2));
        assert_eq!(queues.transfer.map(|q| q.family_index), Some(0));
    }

    #[test]
    fn discovery_with_single_combined_family() {
        use vk::QueueFlags as Q;
        let queues =
            discover_queues(&[family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER)]);
        assert_eq!(queues.graphics.map(|q| q.family_index), Some(0));
        assert_eq!(queues.compute, None);
        assert_eq!(queues.transfer, None);
        assert_eq!(queues.unique_families().len(), 1);
    }

    #[test]
    fn discovery_never_violates_role_exclusions() {
        use vk::QueueFlags as Q;
        let bits = [Q::GRAPHICS, Q::COMPUTE, Q::TRANSFER];
        // Every ordered list of three families drawn from the 8 subsets.
        for a in 0u32..8 {
            for b in 0u32..8 {
                for c in 0u32..8 {
                    let families: Vec<_> = [a, b, c]
                        .iter()
                        .map(|mask| {
                            let flags = bits
                                .iter()
                                .enumerate()
                                .filter(|(i, _)| mask & (1u32 << *i) != 0)
                                .fold(Q::empty(), |acc, (_, f)| acc | *f);
                            family(flags)
                        })
                        .collect();
                    let queues = discover_queues(&families);
                    if let Some(compute) = queues.compute {
                        assert!(!compute.flags.contains(Q::GRAPHICS));
                        assert!(compute.flags.contains(Q::COMPUTE));
                    }
                    if let Some(transfer) = queues.transfer {
                        assert!(!transfer.flags.intersects(Q::GRAPHICS | Q::COMPUTE));
                    }
                    if let Some(graphics) = queues.graphics {
                        let first = families
                            .iter()
                            .position(|f| f.flags.contains(Q::GRAPHICS));
                        assert_eq!(Some(graphics.family_index as usize), first);
                    }
                }
            }
        }
    }

    #[test]
    fn discovery_skips_empty_families() {
        use vk::QueueFlags as Q;
        let families = [
            QueueFamilyInfo {
                flags: Q::GRAPHICS,
                queue_count: 0,
            },
            family(Q::GRAPHICS),
        ];
        let queues = discover_queues(&families);
        assert_eq!(queues.graphics.map(|q| q.family_index), Some(1));
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = device(vk::PhysicalDeviceType::DISCRETE_GPU);
        let integrated = device(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert!(score_physical_device(&discrete) > score_physical_device(&integrated));
    }

    #[test]
    fn type_order_is_total() {
        let scores: Vec<u64> = [
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::PhysicalDeviceType::VIRTUAL_GPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::CPU,
        ]
        .into_iter()
        .map(|ty| score_physical_device(&with_raytracing(device(ty))))
        .collect();
        assert!(scores.windows(2).all(|w| w[0] > w[1]), "{scores:?}");
    }

    #[test]
    fn type_dominates_limits_and_raytracing() {
        let mut strong_integrated =
            with_raytracing(device(vk::PhysicalDeviceType::INTEGRATED_GPU));
        strong_integrated.limits.max_image_dimension2_d = u32::MAX;
        strong_integrated.limits.max_bound_descriptor_sets = u32::MAX;
        let mut weak_discrete = device(vk::PhysicalDeviceType::DISCRETE_GPU);
        weak_discrete.limits = vk::PhysicalDeviceLimits::default();
        assert!(
            score_physical_device(&weak_discrete)
                > score_physical_device(&strong_integrated)
        );
    }

    #[test]
    fn raytracing_adds_bonus() {
        let plain = device(vk::PhysicalDeviceType::DISCRETE_GPU);
        let rt = with_raytracing(plain.clone());
        assert!(score_physical_device(&rt) > score_physical_device(&plain));
    }

    #[test]
    fn partial_raytracing_earns_nothing() {
        let plain = device(vk::PhysicalDeviceType::DISCRETE_GPU);
        let mut partial = plain.clone();
        partial.extensions =
            vec![ash::khr::acceleration_structure::NAME.to_string_lossy().into_owned()];
        assert_eq!(score_physical_device(&partial), score_physical_device(&plain));
    }

    #[test]
    fn selection_prefers_first_on_tie() {
        let a = device(vk::PhysicalDeviceType::DISCRETE_GPU);
        let b = a.clone();
        let c = device(vk::PhysicalDeviceType::INTEGRATED_GPU);
        assert_eq!(select_best_physical_device([&c, &a, &b]), Some(1));
        assert_eq!(select_best_physical_device(std::iter::empty()), None);
    }

    #[test]
    fn format_lookup_respects_tiling() {
        let mut caps = device(vk::PhysicalDeviceType::DISCRETE_GPU);
        caps.format_properties = vec![
            (
                vk::Format::D32_SFLOAT,
                vk::FormatProperties {
                    optimal_tiling_features:
                        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                    ..Default::default()
                },
            ),
            (vk::Format::D24_UNORM_S8_UINT, vk::FormatProperties::default()),
        ];
        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert_eq!(
            caps.find_supported_format(
                &[vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT],
                vk::ImageTiling::OPTIMAL,
                depth,
            ),
            Some(vk::Format::D32_SFLOAT)
        );
        assert!(!caps.format_supports(
            vk::Format::D32_SFLOAT,
            vk::ImageTiling::LINEAR,
            depth
        ));
    }
}
