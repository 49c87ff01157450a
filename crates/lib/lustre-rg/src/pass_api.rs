use std::{cell::UnsafeCell, sync::Arc};

use super::{
    Buffer, GpuSrv, GpuUav, Image, RawGraphHandle, Ref, ResourceRegistry, RgComputePipelineHandle,
};

use lustre_backend::{
    ash::vk,
    chunky_list::TempList,
    dynamic_constants::{
        DynamicConstants, MAX_DYNAMIC_CONSTANTS_BYTES_PER_DISPATCH,
        MAX_DYNAMIC_CONSTANTS_STORAGE_BUFFER_BYTES,
    },
    vulkan::{
        device::{CommandBuffer, Device},
        image::*,
        ray_tracing::RayTracingAcceleration,
        shader::{ComputePipeline, ShaderPipelineCommon},
    },
    BackendError,
};

pub struct RenderPassApi<'a, 'exec_params, 'constants> {
    pub cb: &'a CommandBuffer,
    pub resources: &'a mut ResourceRegistry<'exec_params, 'constants>,
}

/// A declared binding, not yet resolved against physical resources.
pub enum RenderPassBinding {
    Image(RenderPassImageBinding),
    Buffer(RenderPassBufferBinding),
    RayTracingAcceleration(RenderPassRayTracingAccelerationBinding),
    DynamicConstants(u32),
    DynamicConstantsStorageBuffer(u32),
}

pub struct RenderPassImageBinding {
    handle: RawGraphHandle,
    view_desc: ImageViewDesc,
    image_layout: vk::ImageLayout,
}

pub struct RenderPassBufferBinding {
    handle: RawGraphHandle,
}

pub struct RenderPassRayTracingAccelerationBinding {
    handle: RawGraphHandle,
}

/// The same binding with descriptor infos filled in.
enum DescriptorSetBinding {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
    RayTracingAcceleration(vk::AccelerationStructureKHR),
    DynamicBuffer {
        buffer: vk::DescriptorBufferInfo,
        offset: u32,
    },
    DynamicStorageBuffer {
        buffer: vk::DescriptorBufferInfo,
        offset: u32,
    },
}

impl RenderPassBinding {
    fn resolve(
        &self,
        resources: &ResourceRegistry,
    ) -> Result<DescriptorSetBinding, BackendError> {
        Ok(match self {
            RenderPassBinding::Image(image) => DescriptorSetBinding::Image(
                vk::DescriptorImageInfo::builder()
                    .image_layout(image.image_layout)
                    .image_view(resources.image_view(image.handle, &image.view_desc)?)
                    .build(),
            ),
            RenderPassBinding::Buffer(buffer) => DescriptorSetBinding::Buffer(
                vk::DescriptorBufferInfo::builder()
                    .buffer(resources.resource::<Buffer>(buffer.handle).raw)
                    .range(vk::WHOLE_SIZE)
                    .build(),
            ),
            RenderPassBinding::RayTracingAcceleration(acc) => {
                DescriptorSetBinding::RayTracingAcceleration(
                    resources
                        .resource::<RayTracingAcceleration>(acc.handle)
                        .raw,
                )
            }
            RenderPassBinding::DynamicConstants(offset) => DescriptorSetBinding::DynamicBuffer {
                buffer: vk::DescriptorBufferInfo::builder()
                    .buffer(resources.dynamic_constants.buffer.raw)
                    .range(MAX_DYNAMIC_CONSTANTS_BYTES_PER_DISPATCH as u64)
                    .build(),
                offset: *offset,
            },
            RenderPassBinding::DynamicConstantsStorageBuffer(offset) => {
                DescriptorSetBinding::DynamicStorageBuffer {
                    buffer: vk::DescriptorBufferInfo::builder()
                        .buffer(resources.dynamic_constants.buffer.raw)
                        .range(MAX_DYNAMIC_CONSTANTS_STORAGE_BUFFER_BYTES as u64)
                        .build(),
                    offset: *offset,
                }
            }
        })
    }
}

#[derive(Default)]
pub struct RenderPassCommonShaderPipelineBinding<'a> {
    bindings: Vec<(u32, &'a [RenderPassBinding])>,
    raw_bindings: Vec<(u32, vk::DescriptorSet)>,
}

pub struct RenderPassPipelineBinding<'a, HandleType> {
    pipeline: HandleType,
    binding: RenderPassCommonShaderPipelineBinding<'a>,
}

impl<'a, HandleType> RenderPassPipelineBinding<'a, HandleType> {
    pub fn new(pipeline: HandleType) -> Self {
        Self {
            pipeline,
            binding: Default::default(),
        }
    }

    pub fn descriptor_set(mut self, set_idx: u32, bindings: &'a [RenderPassBinding]) -> Self {
        self.binding.bindings.push((set_idx, bindings));
        self
    }

    pub fn raw_descriptor_set(mut self, set_idx: u32, binding: vk::DescriptorSet) -> Self {
        self.binding.raw_bindings.push((set_idx, binding));
        self
    }
}

pub trait IntoRenderPassPipelineBinding: Sized {
    fn into_binding<'a>(self) -> RenderPassPipelineBinding<'a, Self>;
}

impl IntoRenderPassPipelineBinding for RgComputePipelineHandle {
    fn into_binding<'a>(self) -> RenderPassPipelineBinding<'a, Self> {
        RenderPassPipelineBinding::new(self)
    }
}

impl<'a, 'exec_params, 'constants> RenderPassApi<'a, 'exec_params, 'constants> {
    pub fn device(&self) -> &Device {
        self.resources.execution_params.device
    }

    pub fn dynamic_constants(&mut self) -> &mut DynamicConstants {
        self.resources.dynamic_constants
    }

    pub fn bind_compute_pipeline<'s>(
        &'s mut self,
        binding: RenderPassPipelineBinding<'_, RgComputePipelineHandle>,
    ) -> Result<BoundComputePipeline<'s, 'a, 'exec_params, 'constants>, BackendError> {
        let device = self.resources.execution_params.device;
        let pipeline_arc = self.resources.compute_pipeline(binding.pipeline);

        self.bind_pipeline_common(device, pipeline_arc.as_ref(), &binding.binding)?;

        Ok(BoundComputePipeline {
            api: self,
            pipeline: pipeline_arc,
        })
    }

    fn bind_pipeline_common(
        &self,
        device: &Device,
        pipeline: &ShaderPipelineCommon,
        binding: &RenderPassCommonShaderPipelineBinding,
    ) -> Result<(), BackendError> {
        unsafe {
            device.raw.cmd_bind_pipeline(
                self.cb.raw,
                pipeline.pipeline_bind_point,
                pipeline.pipeline,
            );
        }

        self.bind_frame_constants(device, pipeline);

        for (set_idx, bindings) in &binding.bindings {
            let set_idx = *set_idx;
            if pipeline.set_layout_info.get(set_idx as usize).is_none() {
                continue;
            }

            let bindings = bindings
                .iter()
                .map(|binding| binding.resolve(self.resources))
                .collect::<Result<Vec<_>, BackendError>>()?;

            bind_descriptor_set(device, self.cb, &pipeline, set_idx, &bindings);
        }

        for (set_idx, binding) in &binding.raw_bindings {
            let set_idx = *set_idx;
            if pipeline.set_layout_info.get(set_idx as usize).is_none() {
                continue;
            }

            unsafe {
                device.raw.cmd_bind_descriptor_sets(
                    self.cb.raw,
                    pipeline.pipeline_bind_point,
                    pipeline.pipeline_layout,
                    set_idx,
                    std::slice::from_ref(binding),
                    &[],
                );
            }
        }

        Ok(())
    }

    /// Set 2 holds the per-frame globals and instance parameter arrays,
    /// bound with the dynamic offsets where this frame's data was pushed.
    fn bind_frame_constants(&self, device: &Device, pipeline: &ShaderPipelineCommon) {
        let uses_frame_constants = pipeline
            .set_layout_info
            .get(2)
            .map(|set| !set.is_empty())
            .unwrap_or_default();

        if !uses_frame_constants {
            return;
        }

        let layout = &self.resources.execution_params.frame_constants_layout;

        unsafe {
            device.raw.cmd_bind_descriptor_sets(
                self.cb.raw,
                pipeline.pipeline_bind_point,
                pipeline.pipeline_layout,
                2,
                &[self.resources.execution_params.frame_descriptor_set],
                &[layout.globals_offset, layout.instance_params_offset],
            );
        }
    }
}

pub struct BoundComputePipeline<'api, 'a, 'exec_params, 'constants> {
    api: &'api mut RenderPassApi<'a, 'exec_params, 'constants>,
    pipeline: Arc<ComputePipeline>,
}

impl<'api, 'a, 'exec_params, 'constants> BoundComputePipeline<'api, 'a, 'exec_params, 'constants> {
    /// Dispatches one thread per element of `threads`, rounded up to whole
    /// groups.
    pub fn dispatch(&self, threads: [u32; 3]) {
        let group_size = self.pipeline.group_size;

        unsafe {
            self.api.device().raw.cmd_dispatch(
                self.api.cb.raw,
                (threads[0] + group_size[0] - 1) / group_size[0],
                (threads[1] + group_size[1] - 1) / group_size[1],
                (threads[2] + group_size[2] - 1) / group_size[2],
            );
        }
    }

    /// Group counts come from `args_buffer` at the given offset, written by
    /// an earlier pass from the ray counters.
    pub fn dispatch_indirect(&self, args_buffer: Ref<Buffer, GpuSrv>, args_buffer_offset: u64) {
        unsafe {
            self.api.device().raw.cmd_dispatch_indirect(
                self.api.cb.raw,
                self.api.resources.buffer(args_buffer).raw,
                args_buffer_offset,
            );
        }
    }
}

pub trait BindRgRef {
    fn bind(&self) -> RenderPassBinding;
}

impl BindRgRef for Ref<Image, GpuSrv> {
    fn bind(&self) -> RenderPassBinding {
        self.bind_view(ImageViewDescBuilder::default())
    }
}

impl Ref<Image, GpuSrv> {
    pub fn bind_view(&self, view_desc: ImageViewDescBuilder) -> RenderPassBinding {
        RenderPassBinding::Image(RenderPassImageBinding {
            handle: self.handle,
            view_desc: view_desc.build().unwrap(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        })
    }
}

impl BindRgRef for Ref<Image, GpuUav> {
    fn bind(&self) -> RenderPassBinding {
        RenderPassBinding::Image(RenderPassImageBinding {
            handle: self.handle,
            view_desc: ImageViewDesc::default(),
            image_layout: vk::ImageLayout::GENERAL,
        })
    }
}

impl BindRgRef for Ref<Buffer, GpuSrv> {
    fn bind(&self) -> RenderPassBinding {
        RenderPassBinding::Buffer(RenderPassBufferBinding {
            handle: self.handle,
        })
    }
}

impl BindRgRef for Ref<Buffer, GpuUav> {
    fn bind(&self) -> RenderPassBinding {
        RenderPassBinding::Buffer(RenderPassBufferBinding {
            handle: self.handle,
        })
    }
}

impl BindRgRef for Ref<RayTracingAcceleration, GpuSrv> {
    fn bind(&self) -> RenderPassBinding {
        RenderPassBinding::RayTracingAcceleration(RenderPassRayTracingAccelerationBinding {
            handle: self.handle,
        })
    }
}

fn bind_descriptor_set(
    device: &Device,
    cb: &CommandBuffer,
    pipeline: &impl std::ops::Deref<Target = ShaderPipelineCommon>,
    set_index: u32,
    bindings: &[DescriptorSetBinding],
) {
    let shader_set_info = if let Some(info) = pipeline.set_layout_info.get(set_index as usize) {
        info
    } else {
        log::warn!(
            "bind_descriptor_set: set index {} does not exist",
            set_index
        );
        return;
    };

    let image_info = TempList::new();
    let buffer_info = TempList::new();
    let accel_info: TempList<UnsafeCell<vk::WriteDescriptorSetAccelerationStructureKHR>> =
        TempList::new();

    let raw_device = &device.raw;

    // One throwaway pool per dispatch; released when the frame retires.
    let descriptor_pool = {
        let descriptor_pool_create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pipeline.descriptor_pool_sizes);

        unsafe { raw_device.create_descriptor_pool(&descriptor_pool_create_info, None) }.unwrap()
    };
    device.defer_release(descriptor_pool);

    let descriptor_set = {
        let descriptor_set_allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(std::slice::from_ref(
                &pipeline.descriptor_set_layouts[set_index as usize],
            ));

        unsafe { raw_device.allocate_descriptor_sets(&descriptor_set_allocate_info) }.unwrap()[0]
    };

    unsafe {
        let mut dynamic_offsets: Vec<u32> = Vec::new();
        let descriptor_writes: Vec<vk::WriteDescriptorSet> = bindings
            .iter()
            .enumerate()
            .filter(|(binding_idx, _)| shader_set_info.contains_key(&(*binding_idx as u32)))
            .map(|(binding_idx, binding)| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(descriptor_set)
                    .dst_binding(binding_idx as _)
                    .dst_array_element(0);

                match binding {
                    DescriptorSetBinding::Image(image) => write
                        .descriptor_type(match image.image_layout {
                            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
                                vk::DescriptorType::SAMPLED_IMAGE
                            }
                            vk::ImageLayout::GENERAL => vk::DescriptorType::STORAGE_IMAGE,
                            _ => unimplemented!("{:?}", image.image_layout),
                        })
                        .image_info(std::slice::from_ref(image_info.add(*image)))
                        .build(),
                    DescriptorSetBinding::Buffer(buffer) => write
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(std::slice::from_ref(buffer_info.add(*buffer)))
                        .build(),
                    DescriptorSetBinding::DynamicBuffer { buffer, offset } => {
                        dynamic_offsets.push(*offset);
                        write
                            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                            .buffer_info(std::slice::from_ref(buffer_info.add(*buffer)))
                            .build()
                    }
                    DescriptorSetBinding::DynamicStorageBuffer { buffer, offset } => {
                        dynamic_offsets.push(*offset);
                        write
                            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC)
                            .buffer_info(std::slice::from_ref(buffer_info.add(*buffer)))
                            .build()
                    }
                    DescriptorSetBinding::RayTracingAcceleration(acc) => {
                        let mut write = write
                            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                            .push_next(
                                accel_info
                                    .add(UnsafeCell::new(
                                        vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                                            .acceleration_structures(std::slice::from_ref(acc))
                                            .build(),
                                    ))
                                    .get()
                                    .as_mut()
                                    .unwrap(),
                            )
                            .build();

                        // The builder only fills this in for images, buffers, and views
                        write.descriptor_count = 1;
                        write
                    }
                }
            })
            .collect();

        device.raw.update_descriptor_sets(&descriptor_writes, &[]);

        device.raw.cmd_bind_descriptor_sets(
            cb.raw,
            pipeline.pipeline_bind_point,
            pipeline.pipeline_layout,
            set_index,
            &[descriptor_set],
            dynamic_offsets.as_slice(),
        );
    }
}
