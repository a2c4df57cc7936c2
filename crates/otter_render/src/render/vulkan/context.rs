//! Vulkan context management
//!
//! Owns the instance, surface, physical device selection and logical device.
//! Everything else in the renderer borrows the context or clones its
//! `ash::Device`.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{
    AccelerationStructure, DeferredHostOperations, RayTracingPipeline, Surface,
    Swapchain as SwapchainLoader,
};
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use thiserror::Error;

use crate::core::config::RendererConfig;
use crate::render::vulkan::shader::ShaderError;
use crate::render::vulkan::window::Window;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// No physical device satisfies the renderer's requirements
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A required device extension is not available
    #[error("Missing required extension: {0}")]
    MissingExtension(String),

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Shader binary could not be loaded
    #[error(transparent)]
    Shader(#[from] ShaderError),

    /// The swapchain no longer matches the surface
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,
}

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Whether the device is gone and no later frame can succeed
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::Api(vk::Result::ERROR_DEVICE_LOST))
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

/// Device extensions the renderer cannot run without
pub fn required_device_extensions() -> [&'static CStr; 4] {
    [
        SwapchainLoader::name(),
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
    ]
}

/// Names in `required` that are absent from `available`
pub fn missing_extensions(available: &[&CStr], required: &[&CStr]) -> Vec<String> {
    required
        .iter()
        .filter(|required| !available.contains(required))
        .map(|name| name.to_string_lossy().into_owned())
        .collect()
}

/// Index of the preferred device: the first discrete GPU, else the first one
pub fn preferred_device_index(device_types: &[vk::PhysicalDeviceType]) -> Option<usize> {
    device_types
        .iter()
        .position(|ty| *ty == vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| (!device_types.is_empty()).then_some(0))
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.2 instance, with validation when requested
    pub fn new(window: &Window, config: &RendererConfig) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid application name: {e}")))?;
        let engine_name = c"Otter";
        let (major, minor, patch) = config.application_version;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let required_extensions = window
            .required_instance_extensions()
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to get required extensions: {e}")))?;
        let extension_names = required_extensions
            .iter()
            .map(|ext| CString::new(ext.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid extension name: {e}")))?;

        let validation = config.validation_enabled();
        let mut extensions: Vec<*const std::os::raw::c_char> =
            extension_names.iter().map(|ext| ext.as_ptr()).collect();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names: Vec<*const std::os::raw::c_char> = if validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe {
            entry.create_instance(&create_info, None).map_err(|e| {
                log::error!("Instance creation failed: {:?}", e);
                VulkanError::Api(e)
            })?
        };

        let debug_utils = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        log::debug!("Created Vulkan instance (validation: {})", validation);

        Ok(Self {
            entry,
            instance,
            debug_utils,
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Ray tracing limits copied out of the device property chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RayTracingLimits {
    /// Size of one shader group handle in bytes
    pub shader_group_handle_size: u32,
    /// Required alignment of handles within a region
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each region's start address
    pub shader_group_base_alignment: u32,
    /// Maximum ray recursion depth
    pub max_ray_recursion_depth: u32,
    /// Alignment of scratch buffer offsets for acceleration-structure builds
    pub min_scratch_offset_alignment: u32,
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Ray tracing limits
    pub ray_tracing: RayTracingLimits,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select a device that can present to `surface` and trace rays
    ///
    /// Discrete GPUs are preferred; otherwise the first suitable device wins.
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        let mut candidates = Vec::new();
        let mut last_error = VulkanError::NoSuitableDevice;
        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => candidates.push(info),
                Err(e) => {
                    log::debug!("Skipping GPU {}: {}", device_name(instance, device), e);
                    last_error = e;
                }
            }
        }

        let types: Vec<_> = candidates.iter().map(|c| c.properties.device_type).collect();
        let Some(index) = preferred_device_index(&types) else {
            log::error!("No GPU supports presentation and ray tracing: {}", last_error);
            return Err(last_error);
        };

        let selected = candidates.swap_remove(index);
        log::info!(
            "Selected GPU: {} ({:?})",
            device_name(instance, selected.device),
            selected.properties.device_type
        );
        Ok(selected)
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;

        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }

            let present_support = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };

            if present_support && present_family.is_none() {
                present_family = Some(index);
            }

            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let (Some(graphics_family), Some(present_family)) = (graphics_family, present_family) else {
            return Err(VulkanError::NoSuitableDevice);
        };

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let available: Vec<&CStr> = extensions
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
            .collect();
        let missing = missing_extensions(&available, &required_device_extensions());
        if !missing.is_empty() {
            return Err(VulkanError::MissingExtension(missing.join(", ")));
        }

        let rt_properties = unsafe { RayTracingPipeline::get_properties(instance, device) };
        let as_properties = unsafe { AccelerationStructure::get_properties(instance, device) };

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            ray_tracing: RayTracingLimits {
                shader_group_handle_size: rt_properties.shader_group_handle_size,
                shader_group_handle_alignment: rt_properties.shader_group_handle_alignment,
                shader_group_base_alignment: rt_properties.shader_group_base_alignment,
                max_ray_recursion_depth: rt_properties.max_ray_recursion_depth,
                min_scratch_offset_alignment: as_properties
                    .min_acceleration_structure_scratch_offset_alignment,
            },
            graphics_family,
            present_family,
        })
    }

    /// Whether anisotropic filtering can be enabled
    pub fn supports_anisotropy(&self) -> bool {
        self.features.sampler_anisotropy == vk::TRUE
    }
}

fn device_name(instance: &Instance, device: vk::PhysicalDevice) -> String {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue
    pub present_queue: vk::Queue,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Acceleration structure extension loader
    pub acceleration_structure: AccelerationStructure,
    /// Ray tracing pipeline extension loader
    pub ray_tracing_pipeline: RayTracingPipeline,
}

impl LogicalDevice {
    /// Create the logical device with buffer device address and ray tracing enabled
    pub fn new(instance: &Instance, physical_device_info: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let mut unique_families = vec![physical_device_info.graphics_family];
        if physical_device_info.present_family != physical_device_info.graphics_family {
            unique_families.push(physical_device_info.present_family);
        }

        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let required_extensions: Vec<*const std::os::raw::c_char> =
            required_device_extensions().iter().map(|name| name.as_ptr()).collect();

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical_device_info.supports_anisotropy())
            .build();
        let mut buffer_device_address =
            vk::PhysicalDeviceBufferDeviceAddressFeatures::builder().buffer_device_address(true);
        let mut acceleration_structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut ray_tracing_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features)
            .push_next(&mut buffer_device_address)
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_features);

        let device = unsafe {
            instance
                .create_device(physical_device_info.device, &create_info, None)
                .map_err(|e| {
                    log::error!("Logical device creation failed: {:?}", e);
                    VulkanError::Api(e)
                })?
        };

        let graphics_queue = unsafe { device.get_device_queue(physical_device_info.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical_device_info.present_family, 0) };

        Ok(Self {
            swapchain_loader: SwapchainLoader::new(instance, &device),
            acceleration_structure: AccelerationStructure::new(instance, &device),
            ray_tracing_pipeline: RayTracingPipeline::new(instance, &device),
            device,
            graphics_queue,
            present_queue,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Main Vulkan context that owns all core Vulkan resources
///
/// Fields drop in declaration order: surface first (in `Drop`), then the
/// device, then the instance.
pub struct VulkanContext {
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical_device: PhysicalDeviceInfo,
    device: LogicalDevice,
    instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a context presenting to `window`
    pub fn new(config: &RendererConfig, window: &mut Window) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, config)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_vulkan_surface(instance.instance.handle()).map_err(|e| {
            log::error!("Surface creation failed: {}", e);
            VulkanError::InitializationFailed(format!("Surface creation: {e}"))
        })?;

        let created = PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)
            .and_then(|physical_device| {
                LogicalDevice::new(&instance.instance, &physical_device).map(|device| (physical_device, device))
            });

        match created {
            Ok((physical_device, device)) => Ok(Self {
                surface,
                surface_loader,
                physical_device,
                device,
                instance,
            }),
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    /// Get a reference to the Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Get the surface handle
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Get the surface loader
    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    /// Get the physical device info
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.physical_device
    }

    /// Get the raw Device handle
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    /// Get the swapchain loader
    pub fn swapchain_loader(&self) -> &SwapchainLoader {
        &self.device.swapchain_loader
    }

    /// Get the acceleration structure loader
    pub fn acceleration_structure_loader(&self) -> &AccelerationStructure {
        &self.device.acceleration_structure
    }

    /// Get the ray tracing pipeline loader
    pub fn ray_tracing_loader(&self) -> &RayTracingPipeline {
        &self.device.ray_tracing_pipeline
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    /// Get the present queue
    pub fn present_queue(&self) -> vk::Queue {
        self.device.present_queue
    }

    /// Get the graphics queue family index
    pub fn graphics_queue_family(&self) -> u32 {
        self.physical_device.graphics_family
    }

    /// Block until the device has finished all work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device.device_wait_idle().map_err(VulkanError::Api) }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discrete_gpu_is_preferred() {
        let types = [
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        assert_eq!(preferred_device_index(&types), Some(2));
    }

    #[test]
    fn test_first_device_without_discrete() {
        let types = [vk::PhysicalDeviceType::INTEGRATED_GPU, vk::PhysicalDeviceType::VIRTUAL_GPU];
        assert_eq!(preferred_device_index(&types), Some(0));
        assert_eq!(preferred_device_index(&[]), None);
    }

    #[test]
    fn test_missing_ray_tracing_extensions_are_reported() {
        let available = [SwapchainLoader::name(), DeferredHostOperations::name()];
        let missing = missing_extensions(&available, &required_device_extensions());
        assert_eq!(
            missing,
            vec![
                "VK_KHR_acceleration_structure".to_string(),
                "VK_KHR_ray_tracing_pipeline".to_string()
            ]
        );

        let all = required_device_extensions();
        assert!(missing_extensions(&all, &all).is_empty());
    }

    #[test]
    fn test_shader_errors_convert() {
        let err: VulkanError = ShaderError::Malformed {
            path: "rt.rgen.spv".into(),
            len: 3,
        }
        .into();
        assert!(matches!(err, VulkanError::Shader(_)));
        assert!(err.to_string().contains("rt.rgen.spv"));
    }

    #[test]
    fn test_only_device_loss_is_fatal_for_a_frame() {
        assert!(VulkanError::Api(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(!VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY).is_device_lost());
        assert!(!VulkanError::SwapchainOutOfDate.is_device_lost());
        assert!(!VulkanError::invalid("Empty G-buffer partition").is_device_lost());
    }
}
