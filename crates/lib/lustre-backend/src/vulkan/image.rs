use crate::BackendError;

use super::device::Device;
use ash::vk;
use derive_builder::Builder;
use gpu_allocator::{AllocationCreateDesc, MemoryLocation};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Description of a single-layer 2D texture. Every image in the reflection
/// frame is a screen-aligned plane (g-buffer inputs, ray targets, denoiser
/// history), so the desc carries only what those need.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: [u32; 2],
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u16,
}

impl ImageDesc {
    pub fn new_2d(format: vk::Format, extent: [u32; 2]) -> Self {
        Self {
            format,
            extent,
            usage: vk::ImageUsageFlags::default(),
            mip_levels: 1,
        }
    }

    pub fn format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    /// Rounds up, so odd-sized targets still cover every full-res pixel.
    pub fn half_res(mut self) -> Self {
        self.extent = [
            ((self.extent[0] + 1) / 2).max(1),
            ((self.extent[1] + 1) / 2).max(1),
        ];
        self
    }

    pub fn extent_2d(&self) -> [u32; 2] {
        self.extent
    }

    /// The extent shaped for a one-thread-per-pixel dispatch.
    pub fn dispatch_extent(&self) -> [u32; 3] {
        [self.extent[0], self.extent[1], 1]
    }
}

pub struct Image {
    pub raw: vk::Image,
    pub desc: ImageDesc,
    pub views: Mutex<HashMap<ImageViewDesc, vk::ImageView>>,
    #[allow(dead_code)]
    allocation: gpu_allocator::SubAllocation,
}
unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl Image {
    /// Returns a cached view, creating it on first use. Views differ only in
    /// their aspect; passes sampling a depth plane ask for the DEPTH aspect,
    /// everything else uses the COLOR default.
    pub fn view(
        &self,
        device: &Device,
        desc: &ImageViewDesc,
    ) -> Result<vk::ImageView, BackendError> {
        let mut views = self.views.lock();

        if let Some(entry) = views.get(desc) {
            Ok(*entry)
        } else {
            let view = device.create_image_view(*desc, &self.desc, self.raw)?;
            Ok(*views.entry(*desc).or_insert(view))
        }
    }
}

#[derive(Clone, Copy, Builder, Eq, PartialEq, Hash)]
#[builder(pattern = "owned", derive(Clone))]
pub struct ImageViewDesc {
    #[builder(default = "vk::ImageAspectFlags::COLOR")]
    pub aspect_mask: vk::ImageAspectFlags,
}

impl ImageViewDesc {
    pub fn builder() -> ImageViewDescBuilder {
        Default::default()
    }
}

impl Default for ImageViewDesc {
    fn default() -> Self {
        Self::builder().build().unwrap()
    }
}

impl Device {
    pub fn create_image(&self, desc: ImageDesc) -> Result<Image, BackendError> {
        log::info!("Creating an image: {:?}", desc);

        let create_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.extent[0],
                height: desc.extent[1],
                depth: 1,
            },
            mip_levels: desc.mip_levels as u32,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };

        let image = unsafe { self.raw.create_image(&create_info, None)? };
        let requirements = unsafe { self.raw.get_image_memory_requirements(image) };

        let allocation = self
            .global_allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
            })
            .map_err(|err| BackendError::Allocation {
                inner: err,
                name: "GpuOnly image".into(),
            })?;

        unsafe {
            self.raw
                .bind_image_memory(image, allocation.memory(), allocation.offset())?
        };

        Ok(Image {
            raw: image,
            allocation,
            desc,
            views: Default::default(),
        })
    }

    fn create_image_view(
        &self,
        desc: ImageViewDesc,
        image_desc: &ImageDesc,
        image_raw: vk::Image,
    ) -> Result<vk::ImageView, BackendError> {
        if image_desc.format == vk::Format::D32_SFLOAT
            && !desc.aspect_mask.contains(vk::ImageAspectFlags::DEPTH)
        {
            return Err(BackendError::ResourceAccess {
                info: "Depth-only resource used without the vk::ImageAspectFlags::DEPTH flag"
                    .to_owned(),
            });
        }

        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image_raw)
            .format(image_desc.format)
            .view_type(vk::ImageViewType::TYPE_2D)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect_mask,
                base_mip_level: 0,
                level_count: image_desc.mip_levels as u32,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        Ok(unsafe { self.raw.create_image_view(&create_info, None)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_res_rounds_up_and_never_hits_zero() {
        let desc = ImageDesc::new_2d(vk::Format::R16G16B16A16_SFLOAT, [1919, 1081]);
        assert_eq!(desc.half_res().extent, [960, 541]);

        let tiny = ImageDesc::new_2d(vk::Format::R8_UNORM, [1, 1]);
        assert_eq!(tiny.half_res().extent, [1, 1]);
    }

    #[test]
    fn dispatch_extent_is_one_thread_per_pixel() {
        let desc = ImageDesc::new_2d(vk::Format::R16_SFLOAT, [640, 360]);
        assert_eq!(desc.dispatch_extent(), [640, 360, 1]);
    }
}
