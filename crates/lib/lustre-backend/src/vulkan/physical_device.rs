use super::instance::Instance;
use anyhow::Result;
use ash::vk;
use std::{ffi::CStr, sync::Arc};

#[derive(Copy, Clone)]
pub struct QueueFamily {
    pub index: u32,
    pub properties: vk::QueueFamilyProperties,
}

pub struct PhysicalDevice {
    pub instance: Arc<Instance>,
    pub raw: vk::PhysicalDevice,
    pub(crate) queue_families: Vec<QueueFamily>,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl PhysicalDevice {
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    /// The family every dispatch, transfer, and acceleration structure
    /// build is submitted to. A single compute-capable queue carries the
    /// whole frame.
    pub(crate) fn compute_queue_family(&self) -> Option<QueueFamily> {
        self.queue_families
            .iter()
            .find(|family| {
                family
                    .properties
                    .queue_flags
                    .contains(vk::QueueFlags::COMPUTE)
            })
            .copied()
    }
}

impl std::fmt::Debug for PhysicalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDevice")
            .field("name", &self.name())
            .field("device_type", &self.properties.device_type)
            .finish()
    }
}

pub fn enumerate_physical_devices(instance: &Arc<Instance>) -> Result<Vec<PhysicalDevice>> {
    let raw_devices = unsafe { instance.raw.enumerate_physical_devices()? };

    Ok(raw_devices
        .into_iter()
        .map(|raw| {
            let queue_families = unsafe {
                instance
                    .raw
                    .get_physical_device_queue_family_properties(raw)
            }
            .into_iter()
            .enumerate()
            .map(|(index, properties)| QueueFamily {
                index: index as _,
                properties,
            })
            .collect();

            PhysicalDevice {
                instance: instance.clone(),
                properties: unsafe { instance.raw.get_physical_device_properties(raw) },
                memory_properties: unsafe {
                    instance.raw.get_physical_device_memory_properties(raw)
                },
                raw,
                queue_families,
            }
        })
        .collect())
}
