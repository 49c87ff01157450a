//! The frame orchestrator: owns the scene tables, acceleration structures,
//! bindless registry, and temporal renderer state, and records the whole
//! per-frame reflection pass sequence.

use std::{collections::HashMap, collections::VecDeque, sync::Arc};

use anyhow::Context;
use glam::{Affine3A, Mat4};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use lustre_backend::{
    ash::vk,
    dynamic_constants::DynamicConstants,
    vk_sync,
    vulkan::{
        buffer::{Buffer, BufferDesc},
        image::Image,
        ray_tracing::{
            RayTracingBottomAccelerationDesc, RayTracingGeometryDesc, RayTracingGeometryPart,
            RayTracingGeometryType, RayTracingInstanceDesc,
        },
    },
    Device,
};
use lustre_rg::{self as rg, renderer::FrameConstantsLayout};

use crate::{
    accel::{
        rebuild_decision, transform_delta_sq, AccelerationStructureManager, SurfaceSetKey,
        VisibilityClass,
    },
    bindless::{BindlessRegistry, BufferSlot},
    blue_noise::BlueNoiseSampler,
    config::ReflectionsConfig,
    frame_constants::{CameraMatrices, FrameConstants},
    geometry::{GpuMaterial, GpuSurface, Instance, Material, RangeAllocator, Surface},
    renderers::{
        reflection_denoise::ReflectionDenoiser, reflections::ReflectionsRenderer,
        skinning::{self, SkinnedSurfaceBake},
        upscale, GbufferDepth,
    },
    stats::RayStatsReadback,
};

const GEOMETRY_BUFFER_CAPACITY: usize = 512 * 1024 * 1024;
const SKINNED_RANGE_ALIGNMENT: u64 = 256;

/// Frames a replaced buffer stays alive for; covers both in-flight
/// submissions.
const BUFFER_RETIREMENT_FRAMES: u32 = 2;

/// Buffers waiting to be freed. Frame-tagged entries become due once enough
/// frames have retired; pinned entries (the live lookup tables) are only
/// reclaimed by `drain_all` or after `retire_pinned` re-tags them.
struct RetirementQueue<T> {
    entries: VecDeque<(Option<u32>, T)>,
}

impl<T> Default for RetirementQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> RetirementQueue<T> {
    fn push(&mut self, frame: u32, value: T) {
        self.entries.push_back((Some(frame), value));
    }

    fn push_pinned(&mut self, value: T) {
        self.entries.push_back((None, value));
    }

    fn retire_pinned(&mut self, frame: u32) {
        for (tag, _) in &mut self.entries {
            if tag.is_none() {
                *tag = Some(frame);
            }
        }
    }

    fn drain_due(&mut self, frame: u32) -> Vec<T> {
        let mut due = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());

        for (tag, value) in self.entries.drain(..) {
            match tag {
                Some(retired_at)
                    if frame.wrapping_sub(retired_at) > BUFFER_RETIREMENT_FRAMES =>
                {
                    due.push(value)
                }
                _ => kept.push_back((tag, value)),
            }
        }

        self.entries = kept;
        due
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, value)| value).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub usize);

impl InstanceHandle {
    pub const INVALID: Self = Self(usize::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Everything the caller provides about the loaded scene: a flat geometry
/// pool plus the surface/material tables and the surface-id array that
/// instances index into.
pub struct SceneGeometry {
    pub geometry_data: Vec<u8>,
    pub surfaces: Vec<Surface>,
    pub materials: Vec<Material>,
    pub surface_ids: Vec<u32>,
}

/// Per-visibility-class acceleration state cached on an instance so static
/// instances skip BLAS resolution and transform refresh.
#[derive(Default)]
struct InstanceAccelCache {
    classes: [Option<ClassAccel>; 3],
    cached_transform: Option<Affine3A>,
}

struct ClassAccel {
    key: SurfaceSetKey,
    blas: Arc<lustre_backend::vulkan::ray_tracing::RayTracingAcceleration>,
    skinned: bool,
}

struct SceneInstance {
    instance: Instance,
    transformation: Affine3A,
    prev_transformation: Affine3A,
    joints: Option<Vec<Mat4>>,
    accel: InstanceAccelCache,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct GpuInstanceParams {
    transform: [f32; 12],
    prev_transform: [f32; 12],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct GpuInstance {
    surfaces_offset: u32,
    num_opaque: u32,
    num_transparent: u32,
    node_id: u32,
}

fn as_byte_slice_unchecked<T: Copy>(v: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(v.as_ptr() as *const u8, v.len() * std::mem::size_of::<T>())
    }
}

fn affine_rows(transform: &Affine3A) -> [f32; 12] {
    let m = Mat4::from(*transform).transpose();
    let mut rows = [0.0; 12];
    rows[0..4].copy_from_slice(&m.x_axis.to_array());
    rows[4..8].copy_from_slice(&m.y_axis.to_array());
    rows[8..12].copy_from_slice(&m.z_axis.to_array());
    rows
}

pub struct SceneRenderer {
    pub config: ReflectionsConfig,

    device: Arc<Device>,
    bindless: BindlessRegistry,
    accel: AccelerationStructureManager,
    blue_noise: BlueNoiseSampler,
    stats: RayStatsReadback,

    reflections: ReflectionsRenderer,
    denoiser: ReflectionDenoiser,

    geometry_buffer: Option<Arc<Buffer>>,
    surfaces: Vec<Surface>,
    materials: Vec<Material>,
    surface_ids: Vec<u32>,
    /// Skinned source surface id -> its destination twin.
    skinned_dest: HashMap<u32, u32>,
    skinned_pairs: Vec<(u32, u32, u32)>,

    instances: Vec<SceneInstance>,
    instance_handles: Vec<InstanceHandle>,
    instance_handle_to_index: HashMap<InstanceHandle, usize>,
    next_instance_handle: usize,
    instance_table_dirty: bool,

    retired_buffers: RetirementQueue<Buffer>,
    frame_idx: u32,
    simulation_time: f32,
}

impl SceneRenderer {
    pub fn new(device: &Arc<Device>, mut config: ReflectionsConfig) -> anyhow::Result<Self> {
        if config.enable_hardware_tracing && !device.ray_tracing_enabled() {
            warn!("Ray tracing unsupported by the device; degrading to screen-space only");
            config.enable_hardware_tracing = false;
        }

        Ok(Self {
            config,
            bindless: BindlessRegistry::new(device),
            accel: AccelerationStructureManager::new(device)?,
            blue_noise: BlueNoiseSampler::new(device)?,
            stats: RayStatsReadback::new(device)?,
            reflections: ReflectionsRenderer::new(),
            denoiser: ReflectionDenoiser::new(),
            device: device.clone(),
            geometry_buffer: None,
            surfaces: Vec::new(),
            materials: Vec::new(),
            surface_ids: Vec::new(),
            skinned_dest: HashMap::new(),
            skinned_pairs: Vec::new(),
            instances: Vec::new(),
            instance_handles: Vec::new(),
            instance_handle_to_index: HashMap::new(),
            next_instance_handle: 0,
            instance_table_dirty: false,
            retired_buffers: Default::default(),
            frame_idx: 0,
            simulation_time: 0.0,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn bindless_descriptor_set(&self) -> vk::DescriptorSet {
        self.bindless.set
    }

    pub fn smoothed_ray_counts(&self) -> crate::stats::SmoothedRayCounts {
        self.stats.smoothed()
    }

    /// Uploads the scene's geometry pool and lookup tables, reserving an
    /// exclusive destination range for every skinned surface.
    pub fn upload_scene(&mut self, mut scene: SceneGeometry) -> anyhow::Result<()> {
        let static_bytes = scene.geometry_data.len();
        anyhow::ensure!(
            static_bytes <= GEOMETRY_BUFFER_CAPACITY,
            "Scene geometry ({} bytes) exceeds the geometry pool",
            static_bytes
        );

        // Tables from a previous scene stay alive until in-flight frames
        // retire, then free like any replaced buffer.
        self.retired_buffers.retire_pinned(self.frame_idx);

        for (id, surface) in scene.surfaces.iter_mut().enumerate() {
            surface.attributes = surface
                .attributes
                .sanitize(GEOMETRY_BUFFER_CAPACITY as u64, id as u32);
        }

        // Positions, normals, and tangents each need a full float3 stream
        // in the destination range.
        let mut skinned_allocator = RangeAllocator::new(
            static_bytes as u64..GEOMETRY_BUFFER_CAPACITY as u64,
            SKINNED_RANGE_ALIGNMENT,
        );

        let mut dest_surfaces = Vec::new();
        for (id, surface) in scene.surfaces.iter().enumerate() {
            if !surface.is_skinned() {
                continue;
            }

            let stream_bytes = surface.num_vertices as u64 * 12;
            let range = skinned_allocator
                .allocate(stream_bytes * 3)
                .context("Geometry pool exhausted while reserving skinned ranges")?;

            let mut dest = *surface;
            dest.attributes.position = Some(range.start as u32);
            dest.attributes.normal = Some((range.start + stream_bytes) as u32);
            dest.attributes.tangent = Some((range.start + stream_bytes * 2) as u32);
            dest.attributes.joint_indices = None;
            dest.attributes.joint_weights = None;

            let dest_id = (scene.surfaces.len() + dest_surfaces.len()) as u32;
            self.skinned_dest.insert(id as u32, dest_id);
            self.skinned_pairs
                .push((id as u32, dest_id, surface.num_vertices));
            dest_surfaces.push(dest);
        }
        scene.surfaces.append(&mut dest_surfaces);

        let geometry_buffer = Arc::new(self.device.create_buffer(
            BufferDesc::new_gpu_only(
                GEOMETRY_BUFFER_CAPACITY,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_DST
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
            ),
            "geometry pool",
            Some(&scene.geometry_data),
        )?);
        self.bindless
            .bind_buffer(&self.device, BufferSlot::Geometry, &geometry_buffer);
        self.geometry_buffer = Some(geometry_buffer);

        let gpu_surfaces: Vec<GpuSurface> = scene.surfaces.iter().map(GpuSurface::from).collect();
        let surface_table = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                gpu_surfaces.len() * std::mem::size_of::<GpuSurface>(),
                vk::BufferUsageFlags::STORAGE_BUFFER,
            ),
            "surface table",
            Some(as_byte_slice_unchecked(&gpu_surfaces)),
        )?;
        self.bindless
            .bind_buffer(&self.device, BufferSlot::Surfaces, &surface_table);
        self.retired_buffers.push_pinned(surface_table);

        let gpu_materials: Vec<GpuMaterial> =
            scene.materials.iter().map(GpuMaterial::from).collect();
        let material_table = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                gpu_materials.len() * std::mem::size_of::<GpuMaterial>(),
                vk::BufferUsageFlags::STORAGE_BUFFER,
            ),
            "material table",
            Some(as_byte_slice_unchecked(&gpu_materials)),
        )?;
        self.bindless
            .bind_buffer(&self.device, BufferSlot::Materials, &material_table);
        self.retired_buffers.push_pinned(material_table);

        self.surfaces = scene.surfaces;
        self.materials = scene.materials;
        self.surface_ids = scene.surface_ids;

        info!(
            "Uploaded scene: {} surfaces ({} skinned), {} materials",
            self.surfaces.len(),
            self.skinned_pairs.len(),
            self.materials.len()
        );

        Ok(())
    }

    /// Tears down everything derived from the scene. Acceleration
    /// structures do not survive an unload or a resolution change.
    pub fn unload_scene(&mut self) {
        // Full stop: nothing may be in flight while the tables are freed.
        unsafe {
            let _ = self.device.raw.device_wait_idle();
        }

        for buffer in self.retired_buffers.drain_all() {
            self.device.immediate_destroy_buffer(buffer);
        }

        self.accel.evict_all();
        self.denoiser.reset_history();
        self.skinned_dest.clear();
        self.skinned_pairs.clear();
        self.surfaces.clear();
        self.materials.clear();
        self.surface_ids.clear();
        self.instances.clear();
        self.instance_handles.clear();
        self.instance_handle_to_index.clear();
        if let Some(buffer) = self.geometry_buffer.take() {
            if let Ok(buffer) = Arc::try_unwrap(buffer) {
                self.device.immediate_destroy_buffer(buffer);
            }
        }
        self.instance_table_dirty = true;
    }

    pub fn add_instance(
        &mut self,
        instance: Instance,
        transformation: Affine3A,
    ) -> anyhow::Result<InstanceHandle> {
        if !instance.validate_partition(&self.surface_ids, &self.surfaces, &self.materials) {
            warn!(
                "Instance for node {} has a malformed opaque/transparent partition; skipping",
                instance.node_id
            );
            anyhow::bail!("malformed instance partition");
        }

        let handle = InstanceHandle(self.next_instance_handle);
        self.next_instance_handle += 1;

        let index = self.instances.len();
        self.instances.push(SceneInstance {
            instance,
            transformation,
            prev_transformation: transformation,
            joints: None,
            accel: Default::default(),
        });
        self.instance_handles.push(handle);
        self.instance_handle_to_index.insert(handle, index);
        self.instance_table_dirty = true;

        Ok(handle)
    }

    pub fn remove_instance(&mut self, handle: InstanceHandle) {
        let Some(index) = self.instance_handle_to_index.remove(&handle) else {
            warn!("Removing unknown instance {:?}", handle);
            return;
        };

        self.instances.swap_remove(index);
        self.instance_handles.swap_remove(index);

        if index < self.instances.len() {
            let moved = self.instance_handles[index];
            self.instance_handle_to_index.insert(moved, index);
        }
        self.instance_table_dirty = true;
    }

    pub fn set_instance_transform(&mut self, handle: InstanceHandle, transformation: Affine3A) {
        if let Some(&index) = self.instance_handle_to_index.get(&handle) {
            self.instances[index].transformation = transformation;
        }
    }

    pub fn set_instance_joints(&mut self, handle: InstanceHandle, joints: Vec<Mat4>) {
        if let Some(&index) = self.instance_handle_to_index.get(&handle) {
            self.instances[index].joints = Some(joints);
        }
    }

    /// Pushes this frame's globals and per-instance transforms into the
    /// dynamic constants ring.
    pub fn prepare_frame_constants(
        &mut self,
        dynamic_constants: &mut DynamicConstants,
        camera: &CameraMatrices,
        base_extent: [u32; 2],
    ) -> FrameConstantsLayout {
        let reflection_extent = self.config.reflection_extent(base_extent);

        let globals_offset = dynamic_constants.push(&FrameConstants::new(
            &self.config,
            camera,
            base_extent,
            reflection_extent,
            self.frame_idx,
            self.simulation_time,
        ));

        let instance_params_offset = dynamic_constants.push_from_iter(
            self.instances.iter().map(|inst| GpuInstanceParams {
                transform: affine_rows(&inst.transformation),
                prev_transform: affine_rows(&inst.prev_transformation),
            }),
        );

        FrameConstantsLayout {
            globals_offset,
            instance_params_offset,
        }
    }

    fn refresh_instance_table(&mut self) -> anyhow::Result<()> {
        if !self.instance_table_dirty || self.instances.is_empty() {
            return Ok(());
        }

        let gpu_instances: Vec<GpuInstance> = self
            .instances
            .iter()
            .map(|inst| GpuInstance {
                surfaces_offset: inst.instance.surfaces_offset,
                num_opaque: inst.instance.num_opaque,
                num_transparent: inst.instance.num_transparent,
                node_id: inst.instance.node_id,
            })
            .collect();

        let instance_table = self.device.create_buffer(
            BufferDesc::new_gpu_only(
                gpu_instances.len() * std::mem::size_of::<GpuInstance>(),
                vk::BufferUsageFlags::STORAGE_BUFFER,
            ),
            "instance table",
            Some(as_byte_slice_unchecked(&gpu_instances)),
        )?;
        self.bindless
            .bind_buffer(&self.device, BufferSlot::Instances, &instance_table);
        self.retired_buffers.push(self.frame_idx, instance_table);
        self.instance_table_dirty = false;

        Ok(())
    }

    /// Maps skinned source surfaces to their destination twins so BLAS
    /// geometry reads the animated vertex streams.
    fn resolve_surface_ids(&self, ids: &[u32]) -> Vec<u32> {
        ids.iter()
            .map(|id| *self.skinned_dest.get(id).unwrap_or(id))
            .collect()
    }

    fn blas_desc_for_ids(&self, ids: &[u32], allow_update: bool) -> RayTracingBottomAccelerationDesc {
        let base_address = self
            .geometry_buffer
            .as_ref()
            .map(|buf| buf.device_address(&self.device))
            .unwrap_or(0);

        let geometries = ids
            .iter()
            .filter_map(|&id| {
                let surface = self.surfaces.get(id as usize)?;
                let position_offset = surface.attributes.position?;

                Some(RayTracingGeometryDesc {
                    geometry_type: RayTracingGeometryType::Triangle,
                    vertex_buffer: base_address + u64::from(position_offset),
                    index_buffer: base_address + u64::from(surface.index_offset),
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_stride: 12,
                    parts: vec![RayTracingGeometryPart {
                        index_count: surface.num_indices as usize,
                        index_offset: 0,
                        max_vertex: surface.num_vertices.saturating_sub(1),
                    }],
                })
            })
            .collect();

        RayTracingBottomAccelerationDesc {
            geometries,
            allow_update,
        }
    }

    fn class_surface_ids(&self, instance: &Instance, class: VisibilityClass) -> Vec<u32> {
        let ids = match class {
            VisibilityClass::Opaque => instance.opaque_surface_ids(&self.surface_ids),
            VisibilityClass::Transparent => instance.transparent_surface_ids(&self.surface_ids),
            VisibilityClass::Global => instance.all_surface_ids(&self.surface_ids),
        };
        self.resolve_surface_ids(ids)
    }

    fn update_instance_accel(&mut self) -> anyhow::Result<()> {
        for index in 0..self.instances.len() {
            let transformation = self.instances[index].transformation;

            let delta = self.instances[index]
                .accel
                .cached_transform
                .map(|cached| transform_delta_sq(&transformation, &cached))
                .unwrap_or(f32::MAX);

            for class in VisibilityClass::ALL {
                let ids = self.class_surface_ids(&self.instances[index].instance, class);
                if ids.is_empty() {
                    // This instance contributes nothing to the class; its
                    // slot stays unpopulated this frame.
                    self.instances[index].accel.classes[class.index()] = None;
                    continue;
                }

                let key = SurfaceSetKey::from_surface_ids(&ids);
                let skinned = self
                    .instances[index]
                    .instance
                    .all_surface_ids(&self.surface_ids)
                    .iter()
                    .any(|id| self.skinned_dest.contains_key(id));

                let cached = matches!(
                    &self.instances[index].accel.classes[class.index()],
                    Some(entry) if entry.key == key
                ) && self.accel.blas_cache.contains(key);

                if !rebuild_decision(skinned, cached, delta) {
                    continue;
                }

                let desc = self.blas_desc_for_ids(&ids, skinned);
                let blas = self.accel.resolve_blas(&self.device, key, skinned, || desc)?;

                self.instances[index].accel.classes[class.index()] =
                    Some(ClassAccel { key, blas, skinned });
            }

            self.instances[index].accel.cached_transform = Some(transformation);
        }

        Ok(())
    }

    fn class_instance_descs(&self, class: VisibilityClass) -> Vec<RayTracingInstanceDesc> {
        self.instances
            .iter()
            .enumerate()
            .filter_map(|(index, inst)| {
                let entry = inst.accel.classes[class.index()].as_ref()?;
                Some(RayTracingInstanceDesc {
                    blas: entry.blas.clone(),
                    transformation: inst.transformation,
                    instance_id: index as u32,
                    transparent: matches!(class, VisibilityClass::Transparent),
                })
            })
            .collect()
    }

    fn skinned_bakes(&self) -> Vec<SkinnedSurfaceBake> {
        let mut bakes = Vec::new();

        for inst in &self.instances {
            let Some(joints) = &inst.joints else { continue };

            for id in inst.instance.all_surface_ids(&self.surface_ids) {
                if let Some(&dest_id) = self.skinned_dest.get(id) {
                    let num_vertices = self.surfaces[*id as usize].num_vertices;
                    bakes.push(SkinnedSurfaceBake {
                        source_surface: *id,
                        dest_surface: dest_id,
                        num_vertices,
                        joint_transforms: joints.clone(),
                    });
                }
            }
        }

        bakes
    }

    /// Records the whole reflection pipeline for one frame, compositing
    /// additively into `output_tex`.
    pub fn prepare_render_graph(
        &mut self,
        rg: &mut rg::TemporalRenderGraph,
        gbuffer_depth: &GbufferDepth,
        screen_color: &rg::Handle<Image>,
        output_tex: &mut rg::Handle<Image>,
        base_extent: [u32; 2],
    ) -> anyhow::Result<()> {
        self.refresh_instance_table()?;

        let reflection_extent = self.config.reflection_extent(base_extent);

        let blue_noise_tex = self.blue_noise.prepare_frame(rg);

        // Skinning must land before any BLAS refit that reads the
        // destination ranges; both go through the imported geometry
        // buffer so the graph orders them.
        let mut tlas_handles: [Option<rg::Handle<_>>; 3] = Default::default();

        if self.config.enable_hardware_tracing {
            if let Some(geometry_buffer) = self.geometry_buffer.clone() {
                let bakes = self.skinned_bakes();
                let mut geometry = rg.import(
                    geometry_buffer,
                    vk_sync::AccessType::AnyShaderReadOther,
                );

                if !bakes.is_empty() {
                    skinning::bake_skinned_surfaces(
                        rg,
                        &mut geometry,
                        self.bindless.set,
                        bakes,
                    );
                }

                self.update_instance_accel()?;

                let refit_updates = self.collect_skinned_refits();
                self.accel
                    .refit_skinned_blases(rg, &geometry, refit_updates);

                for class in VisibilityClass::ALL {
                    let descs = self.class_instance_descs(class);
                    tlas_handles[class.index()] =
                        self.accel.prepare_tlas(rg, class, descs)?;
                }
            }
        }

        let [opaque_tlas, transparent_tlas, _global_tlas] = &tlas_handles;

        let traced = self.reflections.trace(
            rg,
            &self.config,
            gbuffer_depth,
            screen_color,
            &blue_noise_tex,
            self.bindless.set,
            opaque_tlas.as_ref(),
            transparent_tlas.as_ref(),
            reflection_extent,
        );

        self.stats.record_copy(rg, &traced.ray_counters);

        let denoised_tex = self
            .denoiser
            .denoise(rg, gbuffer_depth, &traced, reflection_extent);

        let composite_source = traced.debug_tex.as_ref().unwrap_or(&denoised_tex);

        upscale::upscale_and_composite(
            rg,
            &self.config,
            gbuffer_depth,
            composite_source,
            &traced.indirect_args,
            output_tex,
            reflection_extent,
        );

        Ok(())
    }

    fn collect_skinned_refits(&self) -> Vec<(SurfaceSetKey, RayTracingBottomAccelerationDesc)> {
        let mut seen = std::collections::HashSet::new();
        let mut refits = Vec::new();

        for inst in &self.instances {
            if inst.joints.is_none() {
                continue;
            }

            for class in VisibilityClass::ALL {
                if let Some(entry) = &inst.accel.classes[class.index()] {
                    if entry.skinned && seen.insert(entry.key) {
                        let ids = self.class_surface_ids(&inst.instance, class);
                        refits.push((entry.key, self.blas_desc_for_ids(&ids, true)));
                    }
                }
            }
        }

        refits
    }

    /// Rolls per-frame state over: previous transforms, frame counter,
    /// statistics ring, and buffers old enough to free.
    pub fn retire_frame(&mut self, delta_seconds: f32) {
        for inst in &mut self.instances {
            inst.prev_transformation = inst.transformation;
        }

        self.stats.advance_frame();

        for buffer in self.retired_buffers.drain_due(self.frame_idx) {
            self.device.immediate_destroy_buffer(buffer);
        }

        self.frame_idx = self.frame_idx.overflowing_add(1).0;
        self.simulation_time += delta_seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn instance_params_are_row_major_3x4_pairs() {
        assert_eq!(std::mem::size_of::<GpuInstanceParams>(), 96);

        let rows = affine_rows(&Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(rows[3], 1.0);
        assert_eq!(rows[7], 2.0);
        assert_eq!(rows[11], 3.0);
        assert_eq!(rows[0], 1.0);
        assert_eq!(rows[1], 0.0);
    }

    #[test]
    fn instance_table_rows_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<GpuInstance>(), 16);
    }

    #[test]
    fn pinned_buffers_survive_frame_retirement_but_not_unload() {
        let mut queue: RetirementQueue<u32> = Default::default();
        queue.push_pinned(1);
        queue.push(0, 2);

        // A pinned entry at the front must not block later frame-tagged
        // entries from freeing.
        assert!(queue.drain_due(1).is_empty());
        assert_eq!(queue.drain_due(3), vec![2]);
        assert!(queue.drain_due(100).is_empty());

        assert_eq!(queue.drain_all(), vec![1]);
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn replaced_tables_free_after_being_retired() {
        let mut queue: RetirementQueue<u32> = Default::default();
        queue.push_pinned(1);
        queue.retire_pinned(5);
        queue.push_pinned(2);

        assert_eq!(queue.drain_due(8), vec![1]);
        assert_eq!(queue.drain_all(), vec![2]);
    }
}
