pub mod barrier;
pub mod buffer;
pub mod device;
pub mod image;
pub mod instance;
pub mod physical_device;
pub mod profiler;
pub mod ray_tracing;
pub mod shader;

use ash::vk;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::sync::Arc;

/// Headless GPU backend: instance, device pick, and the compute/ray-tracing
/// device. Presentation is the host application's business; this renderer
/// only ever composites into images the caller imports.
pub struct RenderBackend {
    pub device: Arc<device::Device>,
}

#[derive(Clone, Copy, Default)]
pub struct RenderBackendConfig {
    pub graphics_debugging: bool,
    pub device_index: Option<usize>,
}

impl RenderBackend {
    pub fn new(config: RenderBackendConfig) -> anyhow::Result<Self> {
        let instance = instance::Instance::builder()
            .graphics_debugging(config.graphics_debugging)
            .build()?;

        use physical_device::*;
        let physical_devices = enumerate_physical_devices(&instance)?;

        info!(
            "Available physical devices: {:?}",
            physical_devices
                .iter()
                .map(|dev| dev.name())
                .collect::<Vec<_>>()
        );

        let physical_device = Arc::new(if let Some(device_index) = config.device_index {
            physical_devices.into_iter().nth(device_index).unwrap()
        } else {
            physical_devices
                .into_iter()
                // If there are multiple devices with the same score, `max_by_key` would choose
                // the last, and we want to preserve the enumeration order.
                .rev()
                .max_by_key(|device| match device.properties.device_type {
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 200,
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
                    _ => 0,
                })
                .unwrap()
        });

        info!("Selected physical device: {:#?}", *physical_device);

        let device = device::Device::create(&physical_device)?;

        Ok(Self { device })
    }
}
