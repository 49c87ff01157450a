//! The global descriptor set (set 1): a small number of well-known buffer
//! slots plus an open-ended sampled-image array. Slots are addressed by
//! semantic role and validated at bind time.

use std::collections::HashMap;

use lustre_backend::{ash::vk, rspirv_reflect, vulkan::buffer::Buffer, Device};

pub const BINDLESS_TEXTURES_BINDING_INDEX: u32 = 4;

/// Semantic roles of the fixed buffer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// Interleaved vertex/index pool shared by all surfaces.
    Geometry,
    /// Surface id -> offsets/counts table.
    Surfaces,
    /// Instance id -> surface range table.
    Instances,
    /// Material id -> factors/texture slots table.
    Materials,
}

impl BufferSlot {
    pub const ALL: [Self; 4] = [
        Self::Geometry,
        Self::Surfaces,
        Self::Instances,
        Self::Materials,
    ];

    pub fn binding(self) -> u32 {
        match self {
            Self::Geometry => 0,
            Self::Surfaces => 1,
            Self::Instances => 2,
            Self::Materials => 3,
        }
    }
}

lazy_static::lazy_static! {
    pub static ref BINDLESS_DESCRIPTOR_SET_LAYOUT: HashMap<u32, rspirv_reflect::DescriptorInfo> = {
        let mut layout: HashMap<u32, rspirv_reflect::DescriptorInfo> = BufferSlot::ALL
            .iter()
            .map(|slot| {
                (slot.binding(), rspirv_reflect::DescriptorInfo {
                    ty: rspirv_reflect::DescriptorType::STORAGE_BUFFER,
                    dimensionality: rspirv_reflect::DescriptorDimensionality::Single,
                    name: Default::default(),
                })
            })
            .collect();

        layout.insert(BINDLESS_TEXTURES_BINDING_INDEX, rspirv_reflect::DescriptorInfo {
            ty: rspirv_reflect::DescriptorType::SAMPLED_IMAGE,
            dimensionality: rspirv_reflect::DescriptorDimensionality::RuntimeArray,
            name: Default::default(),
        });

        layout
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindlessImageHandle(pub u32);

pub struct BindlessRegistry {
    pub set: vk::DescriptorSet,
    bound_buffer_slots: HashMap<u32, BufferSlot>,
    next_image_slot: u32,
    image_capacity: u32,
}

impl BindlessRegistry {
    pub fn new(device: &Device) -> Self {
        Self {
            set: create_bindless_descriptor_set(device),
            bound_buffer_slots: HashMap::new(),
            next_image_slot: 0,
            image_capacity: device.max_bindless_descriptor_count(),
        }
    }

    /// Points a fixed slot at a buffer. Rebinding an already-bound slot is
    /// allowed (the tables are recreated when they grow).
    pub fn bind_buffer(&mut self, device: &Device, slot: BufferSlot, buffer: &Buffer) {
        assert!(
            buffer
                .desc
                .usage
                .contains(vk::BufferUsageFlags::STORAGE_BUFFER),
            "{:?} bound to a non-storage buffer",
            slot
        );

        let buffer_info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer.raw)
            .range(vk::WHOLE_SIZE)
            .build();

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(slot.binding())
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info))
            .build();

        unsafe { device.raw.update_descriptor_sets(std::slice::from_ref(&write), &[]) };

        self.bound_buffer_slots.insert(slot.binding(), slot);
    }

    pub fn is_bound(&self, slot: BufferSlot) -> bool {
        self.bound_buffer_slots.contains_key(&slot.binding())
    }

    /// Appends an image view to the sampled-image array.
    pub fn push_image_view(
        &mut self,
        device: &Device,
        view: vk::ImageView,
    ) -> BindlessImageHandle {
        assert!(
            self.next_image_slot < self.image_capacity,
            "bindless image array exhausted"
        );

        let handle = BindlessImageHandle(self.next_image_slot);
        self.next_image_slot += 1;

        let image_info = vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(view)
            .build();

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(BINDLESS_TEXTURES_BINDING_INDEX)
            .dst_array_element(handle.0)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(std::slice::from_ref(&image_info))
            .build();

        unsafe { device.raw.update_descriptor_sets(std::slice::from_ref(&write), &[]) };

        handle
    }
}

fn create_bindless_descriptor_set(device: &Device) -> vk::DescriptorSet {
    let raw_device = &device.raw;

    let set_binding_flags = [
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT,
    ];

    let mut binding_flags_create_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
        .binding_flags(&set_binding_flags)
        .build();

    let mut bindings: Vec<vk::DescriptorSetLayoutBinding> = BufferSlot::ALL
        .iter()
        .map(|slot| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(slot.binding())
                .descriptor_count(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build()
        })
        .collect();

    bindings.push(
        vk::DescriptorSetLayoutBinding::builder()
            .binding(BINDLESS_TEXTURES_BINDING_INDEX)
            .descriptor_count(device.max_bindless_descriptor_count())
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .stage_flags(vk::ShaderStageFlags::ALL)
            .build(),
    );

    let descriptor_set_layout = unsafe {
        raw_device
            .create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .bindings(&bindings)
                    .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                    .push_next(&mut binding_flags_create_info)
                    .build(),
                None,
            )
            .unwrap()
    };

    let descriptor_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: BufferSlot::ALL.len() as u32,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: device.max_bindless_descriptor_count(),
        },
    ];

    let descriptor_pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&descriptor_sizes)
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
        .max_sets(1);

    let descriptor_pool = unsafe {
        raw_device
            .create_descriptor_pool(&descriptor_pool_info, None)
            .unwrap()
    };

    let variable_descriptor_count = device.max_bindless_descriptor_count();
    let mut variable_descriptor_count_allocate_info =
        vk::DescriptorSetVariableDescriptorCountAllocateInfo::builder()
            .descriptor_counts(std::slice::from_ref(&variable_descriptor_count))
            .build();

    unsafe {
        raw_device
            .allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(descriptor_pool)
                    .set_layouts(std::slice::from_ref(&descriptor_set_layout))
                    .push_next(&mut variable_descriptor_count_allocate_info)
                    .build(),
            )
            .unwrap()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_slots_precede_texture_array() {
        for slot in BufferSlot::ALL {
            assert!(slot.binding() < BINDLESS_TEXTURES_BINDING_INDEX);
        }
    }

    #[test]
    fn layout_covers_every_slot() {
        for slot in BufferSlot::ALL {
            assert!(BINDLESS_DESCRIPTOR_SET_LAYOUT.contains_key(&slot.binding()));
        }
        assert!(BINDLESS_DESCRIPTOR_SET_LAYOUT.contains_key(&BINDLESS_TEXTURES_BINDING_INDEX));
    }
}
