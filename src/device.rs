use anyhow::{anyhow, Result};
use std::collections::HashSet;
use vulkanalia::prelude::v1_3::*;
use vulkanalia::vk::KhrSurfaceExtension;
use vulkanalia::{
    loader::{LibloadingLoader, LIBRARY},
    window as vk_window,
};
use winit::window::Window;

use crate::config::{
    APPLICATION_NAME, DEVICE_EXTENSIONS, PHYSICAL_DEVICE_INDEX_OVERRIDE, VALIDATION_ENABLED,
    VALIDATION_LAYER,
};

#[derive(Copy, Clone, Debug)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = instance.get_physical_device_queue_family_properties(physical_device);

        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        let mut present = None;
        for (index, _) in properties.iter().enumerate() {
            if instance.get_physical_device_surface_support_khr(
                physical_device,
                index as u32,
                surface,
            )? {
                present = Some(index as u32);
                break;
            }
        }

        if let (Some(graphics), Some(present)) = (graphics, present) {
            Ok(Self { graphics, present })
        } else {
            Err(anyhow!("Missing required queue families."))
        }
    }
}

#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub unsafe fn get(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        Ok(Self {
            capabilities: instance
                .get_physical_device_surface_capabilities_khr(physical_device, surface)?,
            formats: instance.get_physical_device_surface_formats_khr(physical_device, surface)?,
            present_modes: instance
                .get_physical_device_surface_present_modes_khr(physical_device, surface)?,
        })
    }
}

/// Instance, surface and logical device, plus the queues and the command pool
/// used for one-off uploads.
///
/// Destroyed on drop; everything created from the device must be gone by then.
pub struct Gpu {
    #[allow(dead_code)]
    entry: Entry,
    pub instance: Instance,
    pub device: Device,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub upload_pool: vk::CommandPool,
}

impl Gpu {
    pub unsafe fn create(window: &Window) -> Result<Self> {
        let loader = LibloadingLoader::new(LIBRARY)?;
        let entry = Entry::new(loader).map_err(|b| anyhow!("{}", b))?;
        let instance = create_instance(window, &entry)?;
        let surface = vk_window::create_surface(&instance, window, window)?;
        let physical_device = pick_physical_device(&instance, surface)?;
        let queue_families = QueueFamilyIndices::get(&instance, surface, physical_device)?;
        let device = create_logical_device(&instance, physical_device, queue_families)?;

        let graphics_queue = device.get_device_queue(queue_families.graphics, 0);
        let present_queue = device.get_device_queue(queue_families.present, 0);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let upload_pool = create_command_pool(&device, queue_families.graphics)?;

        Ok(Self {
            entry,
            instance,
            device,
            surface,
            physical_device,
            queue_families,
            graphics_queue,
            present_queue,
            memory_properties,
            upload_pool,
        })
    }

    pub unsafe fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        self.instance
            .get_physical_device_format_properties(self.physical_device, format)
            .optimal_tiling_features
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.upload_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_surface_khr(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn create_instance(window: &Window, entry: &Entry) -> Result<Instance> {
    let loader_version = entry
        .enumerate_instance_version()
        .unwrap_or(vk::make_version(1, 0, 0));
    log::info!(
        "Vulkan loader version: {}.{}.{}",
        vk::version_major(loader_version),
        vk::version_minor(loader_version),
        vk::version_patch(loader_version)
    );

    if vk::version_major(loader_version) == 1 && vk::version_minor(loader_version) < 3 {
        return Err(anyhow!("Vulkan 1.3 loader required."));
    }

    let application_info = vk::ApplicationInfo::builder()
        .application_name(APPLICATION_NAME)
        .application_version(vk::make_version(0, 1, 0))
        .engine_name(b"No Engine\0")
        .engine_version(vk::make_version(1, 0, 0))
        .api_version(vk::make_version(1, 3, 0));

    // Instance extensions only depend on the OS, not the GPU.
    let extensions = vk_window::get_required_instance_extensions(window)
        .iter()
        .map(|e| e.as_ptr())
        .collect::<Vec<_>>();

    let mut layers = Vec::new();
    if VALIDATION_ENABLED {
        if has_validation_layer(entry)? {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            log::warn!("Validation layer requested but not installed, continuing without it");
        }
    }

    let info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    Ok(entry.create_instance(&info, None)?)
}

unsafe fn has_validation_layer(entry: &Entry) -> Result<bool> {
    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| l.layer_name)
        .collect::<HashSet<_>>();

    Ok(available_layers.contains(&VALIDATION_LAYER))
}

unsafe fn pick_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
) -> Result<vk::PhysicalDevice> {
    let physical_devices = instance.enumerate_physical_devices()?;

    if let Some(index) = PHYSICAL_DEVICE_INDEX_OVERRIDE {
        let physical_device = *physical_devices
            .get(index)
            .ok_or_else(|| anyhow!("Physical device override {index} is out of range."))?;
        check_physical_device(instance, surface, physical_device)?;
        let properties = instance.get_physical_device_properties(physical_device);
        log::info!("Using overridden physical device (`{}`).", properties.device_name);
        return Ok(physical_device);
    }

    for physical_device in physical_devices {
        let properties = instance.get_physical_device_properties(physical_device);

        if let Err(error) = check_physical_device(instance, surface, physical_device) {
            log::warn!(
                "Skipping physical device (`{}`): {}",
                properties.device_name,
                error
            );
        } else {
            log::info!("Selected physical device (`{}`).", properties.device_name);
            return Ok(physical_device);
        }
    }

    Err(anyhow!("Failed to find suitable physical device."))
}

unsafe fn check_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let properties = instance.get_physical_device_properties(physical_device);
    let version = properties.api_version;
    if vk::version_major(version) == 1 && vk::version_minor(version) < 3 {
        return Err(anyhow!("Vulkan 1.3 not supported."));
    }

    QueueFamilyIndices::get(instance, surface, physical_device)?;
    check_physical_device_extensions(instance, physical_device)?;

    let support = SwapchainSupport::get(instance, surface, physical_device)?;
    if support.formats.is_empty() || support.present_modes.is_empty() {
        return Err(anyhow!("Insufficient swapchain support."));
    }

    Ok(())
}

unsafe fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    let extensions = instance
        .enumerate_device_extension_properties(physical_device, None)?
        .iter()
        .map(|e| e.extension_name)
        .collect::<HashSet<_>>();
    if DEVICE_EXTENSIONS.iter().all(|e| extensions.contains(e)) {
        Ok(())
    } else {
        Err(anyhow!("Missing required device extensions."))
    }
}

unsafe fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
) -> Result<Device> {
    let mut unique_indices = HashSet::new();
    unique_indices.insert(indices.graphics);
    unique_indices.insert(indices.present);

    let queue_priorities = &[1.0];
    let queue_infos = unique_indices
        .iter()
        .map(|i| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(*i)
                .queue_priorities(queue_priorities)
        })
        .collect::<Vec<_>>();

    let layers = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let extensions = DEVICE_EXTENSIONS
        .iter()
        .map(|n| n.as_ptr())
        .collect::<Vec<_>>();

    let mut sync2_features =
        vk::PhysicalDeviceSynchronization2Features::builder().synchronization2(true);

    let mut dynamic_rendering_features =
        vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);

    let features = vk::PhysicalDeviceFeatures::builder();

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut sync2_features)
        .push_next(&mut dynamic_rendering_features);

    Ok(instance.create_device(physical_device, &info, None)?)
}

pub unsafe fn create_command_pool(device: &Device, queue_family: u32) -> Result<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);

    Ok(device.create_command_pool(&info, None)?)
}

pub fn get_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..memory.memory_type_count)
        .find(|i| {
            let suitable = (requirements.memory_type_bits & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            suitable && memory_type.property_flags.contains(properties)
        })
        .ok_or_else(|| anyhow!("Failed to find suitable memory type."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties::default();
        memory.memory_type_count = flags.len() as u32;
        for (i, property_flags) in flags.iter().enumerate() {
            memory.memory_types[i].property_flags = *property_flags;
        }
        memory
    }

    #[test]
    fn memory_type_respects_requirement_bits() {
        let memory = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let requirements = vk::MemoryRequirements {
            size: 64,
            alignment: 4,
            memory_type_bits: 0b100,
        };

        let index = get_memory_type(
            &memory,
            requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )
        .unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn memory_type_missing_properties_is_an_error() {
        let memory = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let requirements = vk::MemoryRequirements {
            size: 64,
            alignment: 4,
            memory_type_bits: 0b1,
        };

        assert!(
            get_memory_type(&memory, requirements, vk::MemoryPropertyFlags::HOST_VISIBLE)
                .is_err()
        );
    }
}
