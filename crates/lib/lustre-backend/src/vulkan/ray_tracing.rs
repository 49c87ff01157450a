use std::sync::Arc;

use crate::dynamic_constants::DynamicConstants;

use super::{buffer::BufferDesc, device::Device};
use anyhow::{Context, Result};
use ash::vk;
use glam::Affine3A;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum RayTracingGeometryType {
    Triangle = 0,
    BoundingBox = 1,
}

#[derive(Clone, Copy, Debug)]
pub struct RayTracingGeometryPart {
    pub index_count: usize,
    pub index_offset: usize, // offset into the index buffer in bytes
    pub max_vertex: u32, // the highest index of a vertex that will be addressed by a build command using this structure
}

#[derive(Clone, Debug)]
pub struct RayTracingGeometryDesc {
    pub geometry_type: RayTracingGeometryType,
    pub vertex_buffer: vk::DeviceAddress,
    pub index_buffer: vk::DeviceAddress,
    pub vertex_format: vk::Format,
    pub vertex_stride: usize,
    pub parts: Vec<RayTracingGeometryPart>,
}

#[derive(Clone)]
pub struct RayTracingInstanceDesc {
    pub blas: Arc<RayTracingAcceleration>,
    pub transformation: Affine3A,
    pub instance_id: u32,
    /// Transparent geometry must not be force-opaque, or any-hit filtering
    /// in the traversal loop never runs.
    pub transparent: bool,
}

#[derive(Clone)]
pub struct RayTracingTopAccelerationDesc {
    pub instances: Vec<RayTracingInstanceDesc>,
    pub preallocate_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct RayTracingBottomAccelerationDesc {
    pub geometries: Vec<RayTracingGeometryDesc>,
    /// Built with `ALLOW_UPDATE` so the structure can later be refit in place.
    pub allow_update: bool,
}

pub struct RayTracingAcceleration {
    pub raw: vk::AccelerationStructureKHR,
    backing_buffer: super::buffer::Buffer,
}

#[derive(Clone)]
pub struct RayTracingAccelerationScratchBuffer {
    buffer: Arc<Mutex<super::buffer::Buffer>>,
}

fn build_flags(allow_update: bool) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    if allow_update {
        flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    flags
}

fn blas_geometries(
    desc: &RayTracingBottomAccelerationDesc,
) -> Vec<vk::AccelerationStructureGeometryKHR> {
    desc.geometries
        .iter()
        .map(|desc| {
            let part: RayTracingGeometryPart = desc.parts[0];

            ash::vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(ash::vk::GeometryTypeKHR::TRIANGLES)
                .geometry(ash::vk::AccelerationStructureGeometryDataKHR {
                    triangles: ash::vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                        .vertex_data(ash::vk::DeviceOrHostAddressConstKHR {
                            device_address: desc.vertex_buffer,
                        })
                        .vertex_stride(desc.vertex_stride as _)
                        .max_vertex(part.max_vertex)
                        .vertex_format(desc.vertex_format)
                        .index_data(ash::vk::DeviceOrHostAddressConstKHR {
                            device_address: desc.index_buffer,
                        })
                        .index_type(ash::vk::IndexType::UINT32)
                        .build(),
                })
                .flags(ash::vk::GeometryFlagsKHR::OPAQUE)
                .build()
        })
        .collect()
}

impl Device {
    pub fn create_ray_tracing_acceleration_scratch_buffer(
        &self,
    ) -> Result<RayTracingAccelerationScratchBuffer> {
        const INITIAL_SIZE: usize = 1024 * 1024 * 144;

        let buffer = self
            .create_buffer(
                BufferDesc::new_gpu_only(
                    INITIAL_SIZE,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                ),
                "Acceleration structure scratch buffer",
                None,
            )
            .context("Acceleration structure scratch buffer")?;

        Ok(RayTracingAccelerationScratchBuffer {
            buffer: Arc::new(Mutex::new(buffer)),
        })
    }

    pub fn create_ray_tracing_bottom_acceleration(
        &self,
        desc: &RayTracingBottomAccelerationDesc,
        scratch_buffer: &RayTracingAccelerationScratchBuffer,
    ) -> Result<RayTracingAcceleration> {
        let geometries = blas_geometries(desc);

        let build_range_infos: Vec<ash::vk::AccelerationStructureBuildRangeInfoKHR> = desc
            .geometries
            .iter()
            .map(|desc| {
                ash::vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(desc.parts[0].index_count as u32 / 3)
                    .build()
            })
            .collect();

        let geometry_info = ash::vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ash::vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags(desc.allow_update))
            .geometries(geometries.as_slice())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .build();

        let max_primitive_counts: Vec<_> = desc
            .geometries
            .iter()
            .map(|desc| desc.parts[0].index_count as u32 / 3)
            .collect();

        // Create bottom-level acceleration structure

        let preallocate_bytes = 0;
        self.create_ray_tracing_acceleration(
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            geometry_info,
            &build_range_infos,
            &max_primitive_counts,
            preallocate_bytes,
            scratch_buffer,
        )
    }

    /// Refits an updatable bottom-level structure in place. Vertex positions
    /// may change between builds, topology may not.
    pub fn refit_ray_tracing_bottom_acceleration(
        &self,
        cb: vk::CommandBuffer,
        desc: &RayTracingBottomAccelerationDesc,
        blas: &RayTracingAcceleration,
        scratch_buffer: &RayTracingAccelerationScratchBuffer,
    ) {
        assert!(desc.allow_update);

        let geometries = blas_geometries(desc);

        let build_range_infos: Vec<ash::vk::AccelerationStructureBuildRangeInfoKHR> = desc
            .geometries
            .iter()
            .map(|desc| {
                ash::vk::AccelerationStructureBuildRangeInfoKHR::builder()
                    .primitive_count(desc.parts[0].index_count as u32 / 3)
                    .build()
            })
            .collect();

        let mut geometry_info = ash::vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ash::vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags(true))
            .geometries(geometries.as_slice())
            .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
            .build();

        geometry_info.src_acceleration_structure = blas.raw;

        let max_primitive_counts: Vec<_> = desc
            .geometries
            .iter()
            .map(|desc| desc.parts[0].index_count as u32 / 3)
            .collect();

        self.rebuild_ray_tracing_acceleration(
            cb,
            geometry_info,
            &build_range_infos,
            &max_primitive_counts,
            blas,
            scratch_buffer,
        )
    }

    pub fn create_ray_tracing_top_acceleration(
        &self,
        desc: &RayTracingTopAccelerationDesc,
        scratch_buffer: &RayTracingAccelerationScratchBuffer,
    ) -> Result<RayTracingAcceleration> {
        // Create instance buffer

        let instances: Vec<GeometryInstance> = desc
            .instances
            .iter()
            .map(|desc| self.geometry_instance(desc))
            .collect();

        let instance_buffer_size = std::mem::size_of::<GeometryInstance>() * instances.len().max(1);
        let instance_buffer = self
            .create_buffer(
                BufferDesc::new_gpu_only(
                    instance_buffer_size,
                    ash::vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                        | ash::vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                ),
                "TLAS instance buffer",
                unsafe {
                    (!instances.is_empty()).then(|| {
                        std::slice::from_raw_parts(
                            instances.as_ptr() as *const u8,
                            instance_buffer_size,
                        )
                    })
                },
            )
            .context("TLAS instance buffer")?;

        let instance_buffer_address = instance_buffer.device_address(self);

        let geometry = ash::vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(ash::vk::GeometryTypeKHR::INSTANCES)
            .geometry(ash::vk::AccelerationStructureGeometryDataKHR {
                instances: ash::vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .data(ash::vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer_address,
                    })
                    .build(),
            })
            .build();

        let build_range_infos = vec![ash::vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(instances.len() as _)
            .build()];

        let geometry_info = ash::vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ash::vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(build_flags(true))
            .geometries(std::slice::from_ref(&geometry))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .build();

        let max_primitive_counts = [instances.len() as u32];

        let tlas = self.create_ray_tracing_acceleration(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            geometry_info,
            &build_range_infos,
            &max_primitive_counts,
            desc.preallocate_bytes,
            scratch_buffer,
        )?;

        self.immediate_destroy_buffer(instance_buffer);

        Ok(tlas)
    }

    fn create_ray_tracing_acceleration(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        mut geometry_info: vk::AccelerationStructureBuildGeometryInfoKHR,
        build_range_infos: &[vk::AccelerationStructureBuildRangeInfoKHR],
        max_primitive_counts: &[u32],
        preallocate_bytes: usize,
        scratch_buffer: &RayTracingAccelerationScratchBuffer,
    ) -> Result<RayTracingAcceleration> {
        let memory_requirements = unsafe {
            self.acceleration_structure_ext
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &geometry_info,
                    max_primitive_counts,
                )
        };

        log::info!(
            "Acceleration structure size: {}, scratch size: {}",
            memory_requirements.acceleration_structure_size,
            memory_requirements.build_scratch_size
        );

        let backing_buffer_size: usize =
            preallocate_bytes.max(memory_requirements.acceleration_structure_size as usize);

        let accel_buffer = self
            .create_buffer(
                BufferDesc::new_gpu_only(
                    backing_buffer_size,
                    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                ),
                "Acceleration structure buffer",
                None,
            )
            .context("Acceleration structure buffer")?;

        let accel_info = ash::vk::AccelerationStructureCreateInfoKHR::builder()
            .ty(ty)
            .buffer(accel_buffer.raw)
            .size(backing_buffer_size as u64)
            .build();

        unsafe {
            let accel_raw = self
                .acceleration_structure_ext
                .create_acceleration_structure(&accel_info, None)
                .context("create_acceleration_structure")?;

            let scratch_buffer = scratch_buffer.buffer.lock();
            assert!(
                memory_requirements.build_scratch_size as usize <= scratch_buffer.desc.size,
                "todo: resize scratch"
            );

            geometry_info.dst_acceleration_structure = accel_raw;
            geometry_info.scratch_data = ash::vk::DeviceOrHostAddressKHR {
                device_address: self.raw.get_buffer_device_address(
                    &ash::vk::BufferDeviceAddressInfo::builder().buffer(scratch_buffer.raw),
                ),
            };

            self.with_setup_cb(|cb| {
                self.acceleration_structure_ext
                    .cmd_build_acceleration_structures(
                        cb,
                        std::slice::from_ref(&geometry_info),
                        std::slice::from_ref(&build_range_infos),
                    );

                self.raw.cmd_pipeline_barrier(
                    cb,
                    ash::vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    ash::vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    ash::vk::DependencyFlags::empty(),
                    &[ash::vk::MemoryBarrier::builder()
                        .src_access_mask(
                            ash::vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                                | ash::vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                        )
                        .dst_access_mask(
                            ash::vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                                | ash::vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                        )
                        .build()],
                    &[],
                    &[],
                );
            })?;

            Ok(RayTracingAcceleration {
                raw: accel_raw,
                backing_buffer: accel_buffer,
            })
        }
    }

    pub fn fill_ray_tracing_instance_buffer(
        &self,
        dynamic_constants: &mut DynamicConstants,
        instances: &[RayTracingInstanceDesc],
    ) -> vk::DeviceAddress {
        let instance_buffer_address = dynamic_constants.current_device_address(self);

        dynamic_constants
            .push_from_iter(instances.iter().map(|desc| self.geometry_instance(desc)));

        instance_buffer_address
    }

    /// Rebuilds or refits a top-level structure from an already-filled
    /// instance buffer. A refit reuses the previous frame's structure and is
    /// much cheaper, but degrades trace quality as instances drift.
    pub fn rebuild_ray_tracing_top_acceleration(
        &self,
        cb: vk::CommandBuffer,
        instance_buffer_address: vk::DeviceAddress,
        instance_count: usize,
        tlas: &RayTracingAcceleration,
        scratch_buffer: &RayTracingAccelerationScratchBuffer,
        refit: bool,
    ) {
        let geometry = ash::vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(ash::vk::GeometryTypeKHR::INSTANCES)
            .geometry(ash::vk::AccelerationStructureGeometryDataKHR {
                instances: ash::vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .data(ash::vk::DeviceOrHostAddressConstKHR {
                        device_address: instance_buffer_address,
                    })
                    .build(),
            })
            .build();

        let build_range_infos = vec![ash::vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(instance_count as _)
            .build()];

        let mut geometry_info = ash::vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(ash::vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(build_flags(true))
            .geometries(std::slice::from_ref(&geometry))
            .mode(if refit {
                vk::BuildAccelerationStructureModeKHR::UPDATE
            } else {
                vk::BuildAccelerationStructureModeKHR::BUILD
            })
            .build();

        if refit {
            geometry_info.src_acceleration_structure = tlas.raw;
        }

        let max_primitive_counts = [instance_count as u32];

        self.rebuild_ray_tracing_acceleration(
            cb,
            geometry_info,
            &build_range_infos,
            &max_primitive_counts,
            tlas,
            scratch_buffer,
        )
    }

    fn rebuild_ray_tracing_acceleration(
        &self,
        cb: vk::CommandBuffer,
        mut geometry_info: vk::AccelerationStructureBuildGeometryInfoKHR,
        build_range_infos: &[vk::AccelerationStructureBuildRangeInfoKHR],
        max_primitive_counts: &[u32],
        accel: &RayTracingAcceleration,
        scratch_buffer: &RayTracingAccelerationScratchBuffer,
    ) {
        let memory_requirements = unsafe {
            self.acceleration_structure_ext
                .get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &geometry_info,
                    max_primitive_counts,
                )
        };

        assert!(
            memory_requirements.acceleration_structure_size as usize
                <= accel.backing_buffer.desc.size,
            "todo: backing"
        );

        let scratch_buffer = scratch_buffer.buffer.lock();

        assert!(
            memory_requirements.build_scratch_size as usize <= scratch_buffer.desc.size,
            "todo: scratch"
        );

        unsafe {
            geometry_info.dst_acceleration_structure = accel.raw;
            geometry_info.scratch_data = ash::vk::DeviceOrHostAddressKHR {
                device_address: self.raw.get_buffer_device_address(
                    &ash::vk::BufferDeviceAddressInfo::builder().buffer(scratch_buffer.raw),
                ),
            };

            self.acceleration_structure_ext
                .cmd_build_acceleration_structures(
                    cb,
                    std::slice::from_ref(&geometry_info),
                    std::slice::from_ref(&build_range_infos),
                );

            self.raw.cmd_pipeline_barrier(
                cb,
                ash::vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                ash::vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                ash::vk::DependencyFlags::empty(),
                &[ash::vk::MemoryBarrier::builder()
                    .src_access_mask(
                        ash::vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                            | ash::vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    )
                    .dst_access_mask(
                        ash::vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                            | ash::vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                    )
                    .build()],
                &[],
                &[],
            );
        }
    }

    fn geometry_instance(&self, desc: &RayTracingInstanceDesc) -> GeometryInstance {
        let blas_address = unsafe {
            self.acceleration_structure_ext
                .get_acceleration_structure_device_address(
                    &ash::vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                        .acceleration_structure(desc.blas.raw)
                        .build(),
                )
        };

        let transform = [
            desc.transformation.x_axis.x,
            desc.transformation.y_axis.x,
            desc.transformation.z_axis.x,
            desc.transformation.translation.x,
            desc.transformation.x_axis.y,
            desc.transformation.y_axis.y,
            desc.transformation.z_axis.y,
            desc.transformation.translation.y,
            desc.transformation.x_axis.z,
            desc.transformation.y_axis.z,
            desc.transformation.z_axis.z,
            desc.transformation.translation.z,
        ];

        GeometryInstance::new(
            transform,
            desc.instance_id,
            0xff,
            0,
            if desc.transparent {
                ash::vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE
            } else {
                ash::vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE
            },
            blas_address,
        )
    }
}

#[repr(C)]
#[derive(Clone, Debug, Copy)]
struct GeometryInstance {
    transform: [f32; 12],
    instance_id_and_mask: u32,
    instance_sbt_offset_and_flags: u32,
    blas_address: vk::DeviceAddress,
}

impl GeometryInstance {
    fn new(
        transform: [f32; 12],
        id: u32,
        mask: u8,
        sbt_offset: u32,
        flags: ash::vk::GeometryInstanceFlagsKHR,
        blas_address: vk::DeviceAddress,
    ) -> Self {
        let mut instance = GeometryInstance {
            transform,
            instance_id_and_mask: 0,
            instance_sbt_offset_and_flags: 0,
            blas_address,
        };
        instance.set_id(id);
        instance.set_mask(mask);
        instance.set_sbt_offset(sbt_offset);
        instance.set_flags(flags);
        instance
    }

    fn set_id(&mut self, id: u32) {
        let id = id & 0x00ffffff;
        self.instance_id_and_mask |= id;
    }

    fn set_mask(&mut self, mask: u8) {
        let mask = mask as u32;
        self.instance_id_and_mask |= mask << 24;
    }

    fn set_sbt_offset(&mut self, offset: u32) {
        let offset = offset & 0x00ffffff;
        self.instance_sbt_offset_and_flags |= offset;
    }

    fn set_flags(&mut self, flags: ash::vk::GeometryInstanceFlagsKHR) {
        let flags = flags.as_raw() as u32;
        self.instance_sbt_offset_and_flags |= flags << 24;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_and_mask_packing() {
        let inst = GeometryInstance::new(
            [0.0; 12],
            0x00ab_cdef,
            0xff,
            0,
            vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE,
            0,
        );

        assert_eq!(inst.instance_id_and_mask, 0xff00_0000 | 0x00ab_cdef);
        // FORCE_OPAQUE is bit 2 of the flags byte
        assert_eq!(inst.instance_sbt_offset_and_flags >> 24, 0x04);
    }

    #[test]
    fn transparent_instances_are_not_force_opaque() {
        let inst = GeometryInstance::new(
            [0.0; 12],
            0,
            0xff,
            0,
            vk::GeometryInstanceFlagsKHR::FORCE_NO_OPAQUE,
            0,
        );

        assert_eq!(inst.instance_sbt_offset_and_flags >> 24, 0x08);
    }
}
