//! Vulkan instance, adapter selection and logical device creation.

use std::ffi::{c_char, CStr, CString};

use ash::khr::surface;
use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::backend::traits::{BackendError, BackendResult};
use crate::backend::types::{select_adapter, AdapterInfo, DeviceCapabilities};

use super::debug;

const REQUIRED_API_VERSION: u32 = vk::API_VERSION_1_2;

/// Device extensions every ray tracing adapter must expose
const RAY_TRACING_EXTENSIONS: [&CStr; 4] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::push_descriptor::NAME,
];

/// A surface the queue family must be able to present to
pub struct PresentTarget<'a> {
    pub loader: &'a surface::Instance,
    pub surface: vk::SurfaceKHR,
}

/// Create a Vulkan instance with optional validation layers.
///
/// Surface extensions are only requested when a display is given. Returns
/// whether the validation layer was actually enabled.
pub fn create_instance(
    entry: &ash::Entry,
    display: Option<RawDisplayHandle>,
    validation_enabled: bool,
) -> BackendResult<(ash::Instance, bool)> {
    let validation_available = validation_enabled && debug::validation_layer_available(entry);
    if validation_enabled && !validation_available {
        log::warn!("Validation layers requested but not available");
    }

    let app_name = CString::new("Ray Tracing Engine")
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions: Vec<*const c_char> = match display {
        Some(display) => ash_window::enumerate_required_extensions(display)
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
            .to_vec(),
        None => Vec::new(),
    };
    if validation_available {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layers = if validation_available {
        vec![debug::VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create instance: {:?}", e))
    })?;

    Ok((instance, validation_available))
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    // SAFETY: device_name is a null-terminated array filled by the driver
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn supports_ray_tracing(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let extensions =
        match unsafe { instance.enumerate_device_extension_properties(physical_device) } {
            Ok(extensions) => extensions,
            Err(_) => return false,
        };
    let has_extension = |needle: &CStr| {
        extensions.iter().any(|e| {
            // SAFETY: extension_name is a null-terminated array filled by the driver
            let name = unsafe { CStr::from_ptr(e.extension_name.as_ptr()) };
            name == needle
        })
    };
    if !RAY_TRACING_EXTENSIONS.iter().all(|name| has_extension(name)) {
        return false;
    }

    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut acceleration = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut pipeline = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_12)
        .push_next(&mut acceleration)
        .push_next(&mut pipeline);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };

    vulkan_12.buffer_device_address == vk::TRUE
        && vulkan_12.timeline_semaphore == vk::TRUE
        && acceleration.acceleration_structure == vk::TRUE
        && pipeline.ray_tracing_pipeline == vk::TRUE
}

/// Find a queue family with graphics and compute, able to present if a target is given.
pub fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    present: Option<&PresentTarget<'_>>,
) -> Option<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    queue_families
        .iter()
        .enumerate()
        .find(|(index, family)| {
            let capable = family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
            let presents = present.map_or(true, |target| unsafe {
                target
                    .loader
                    .get_physical_device_surface_support(physical_device, *index as u32, target.surface)
                    .unwrap_or(false)
            });
            capable && presents
        })
        .map(|(index, _)| index as u32)
}

/// Pick the ray tracing adapter with the most dedicated memory.
///
/// Returns the device, its queue family and its name.
pub fn select_physical_device(
    instance: &ash::Instance,
    present: Option<&PresentTarget<'_>>,
) -> BackendResult<(vk::PhysicalDevice, u32, String)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;
    if devices.is_empty() {
        return Err(BackendError::NoSuitableAdapter(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut candidates = Vec::with_capacity(devices.len());
    for &device in &devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(device) };
        let device_local_memory = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();
        let queue_family = find_queue_family(instance, device, present);
        let info = AdapterInfo {
            name: device_name(&properties),
            device_local_memory,
            is_software: properties.device_type == vk::PhysicalDeviceType::CPU,
            supports_ray_tracing: queue_family.is_some() && supports_ray_tracing(instance, device),
        };
        log::info!(
            "Found GPU: {} (type: {:?}, {} MiB, ray tracing: {})",
            info.name,
            properties.device_type,
            info.device_local_memory >> 20,
            info.supports_ray_tracing
        );
        candidates.push((device, queue_family, info));
    }

    let adapters: Vec<AdapterInfo> = candidates.iter().map(|(_, _, info)| info.clone()).collect();
    let index = select_adapter(&adapters).ok_or_else(|| {
        BackendError::RayTracingUnsupported(
            "no hardware adapter exposes VK_KHR_ray_tracing_pipeline".to_string(),
        )
    })?;
    let (device, queue_family, info) = candidates.swap_remove(index);
    let queue_family = queue_family
        .ok_or_else(|| BackendError::NoSuitableAdapter("No suitable queue family".to_string()))?;
    log::info!("Using GPU: {}", info.name);
    Ok((device, queue_family, info.name))
}

/// Create a logical device with ray tracing features and extensions.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    with_swapchain: bool,
) -> BackendResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&queue_priorities)];

    let mut device_extensions: Vec<*const c_char> =
        RAY_TRACING_EXTENSIONS.iter().map(|name| name.as_ptr()).collect();
    if with_swapchain {
        device_extensions.push(ash::khr::swapchain::NAME.as_ptr());
    }

    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .timeline_semaphore(true);
    let mut acceleration =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut pipeline =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&device_extensions)
        .push_next(&mut vulkan_12)
        .push_next(&mut acceleration)
        .push_next(&mut pipeline);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

/// Read shader table and scratch limits from the device properties
pub fn query_capabilities(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    adapter_name: String,
) -> DeviceCapabilities {
    let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut acceleration = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut properties = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut pipeline)
        .push_next(&mut acceleration);
    unsafe { instance.get_physical_device_properties2(physical_device, &mut properties) };

    DeviceCapabilities {
        adapter_name,
        shader_identifier_size: pipeline.shader_group_handle_size,
        // Records are placed at base alignment, which also satisfies the
        // per-record handle alignment
        shader_table_alignment: pipeline
            .shader_group_base_alignment
            .max(pipeline.shader_group_handle_alignment),
        scratch_alignment: acceleration
            .min_acceleration_structure_scratch_offset_alignment
            .max(1),
        max_recursion_depth: pipeline.max_ray_recursion_depth,
        local_descriptor_tables: false,
    }
}
