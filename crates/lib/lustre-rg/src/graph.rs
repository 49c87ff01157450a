use crate::renderer::FrameConstantsLayout;

use super::{
    pass_builder::PassBuilder,
    resource::*,
    resource_registry::{
        AnyRenderResource, AnyRenderResourceRef, RegistryResource, ResourceRegistry,
    },
    RenderPassApi,
};

use lustre_backend::{
    ash::vk::{self, DebugUtilsLabelEXT},
    dynamic_constants::DynamicConstants,
    pipeline_cache::{ComputePipelineHandle, PipelineCache},
    rspirv_reflect,
    transient_resource_cache::TransientResourceCache,
    vk_sync,
    vulkan::{
        barrier::{
            get_access_info, image_aspect_mask_from_access_type_and_format, plan_transition,
            record_global_barrier, record_image_barrier, BarrierKind, ImageBarrier,
        },
        device::{CommandBuffer, Device, VkProfilerData},
        ray_tracing::RayTracingAcceleration,
        shader::ComputePipelineDesc,
    },
    BackendError,
};
use std::{
    collections::{HashMap, VecDeque},
    ffi::CString,
    marker::PhantomData,
    sync::Arc,
};

#[derive(Clone)]
pub(crate) struct GraphResourceCreateInfo {
    pub desc: GraphResourceDesc,
}

#[derive(Clone)]
pub(crate) enum GraphResourceImportInfo {
    Image {
        resource: Arc<Image>,
        access_type: vk_sync::AccessType,
    },
    Buffer {
        resource: Arc<Buffer>,
        access_type: vk_sync::AccessType,
    },
    RayTracingAcceleration {
        resource: Arc<RayTracingAcceleration>,
        access_type: vk_sync::AccessType,
    },
}

#[derive(Clone)]
pub(crate) enum GraphResourceInfo {
    Created(GraphResourceCreateInfo),
    Imported(GraphResourceImportInfo),
}

pub(crate) enum ExportableGraphResource {
    Image(Handle<Image>),
    Buffer(Handle<Buffer>),
}

impl ExportableGraphResource {
    fn raw(&self) -> RawGraphHandle {
        match self {
            ExportableGraphResource::Image(h) => h.raw,
            ExportableGraphResource::Buffer(h) => h.raw,
        }
    }
}

#[derive(Clone, Copy)]
pub struct RgComputePipelineHandle {
    pub(crate) id: usize,
}

pub(crate) struct RgComputePipeline {
    pub(crate) desc: ComputePipelineDesc,
}

pub struct PredefinedDescriptorSet {
    pub bindings: HashMap<u32, rspirv_reflect::DescriptorInfo>,
}

pub struct RenderGraph {
    passes: Vec<RecordedPass>,
    resources: Vec<GraphResourceInfo>,
    exported_resources: Vec<(ExportableGraphResource, vk_sync::AccessType)>,
    pub(crate) compute_pipelines: Vec<RgComputePipeline>,
    pub predefined_descriptor_set_layouts: HashMap<u32, PredefinedDescriptorSet>,
}

/// Brings an externally owned resource into a graph, remembering the access
/// it was last left in.
pub trait ImportToRenderGraph
where
    Self: Resource + Sized,
{
    fn import(
        self: Arc<Self>,
        rg: &mut RenderGraph,
        access_type_at_import_time: vk_sync::AccessType,
    ) -> Handle<Self>;
}

/// Keeps a resource alive past graph execution, transitioned to the
/// requested access. Acceleration structures never leave the graph this way;
/// they are owned and rebuilt outside it.
pub trait ExportToRenderGraph
where
    Self: Resource + Sized,
{
    fn export(
        resource: Handle<Self>,
        rg: &mut RenderGraph,
        access_type: vk_sync::AccessType,
    ) -> ExportedHandle<Self>;
}

impl ImportToRenderGraph for Image {
    fn import(
        self: Arc<Self>,
        rg: &mut RenderGraph,
        access_type_at_import_time: vk_sync::AccessType,
    ) -> Handle<Self> {
        let desc = self.desc;
        let raw = rg.import_resource(GraphResourceImportInfo::Image {
            resource: self,
            access_type: access_type_at_import_time,
        });

        Handle {
            raw,
            desc,
            marker: PhantomData,
        }
    }
}

impl ImportToRenderGraph for Buffer {
    fn import(
        self: Arc<Self>,
        rg: &mut RenderGraph,
        access_type_at_import_time: vk_sync::AccessType,
    ) -> Handle<Self> {
        let desc = self.desc;
        let raw = rg.import_resource(GraphResourceImportInfo::Buffer {
            resource: self,
            access_type: access_type_at_import_time,
        });

        Handle {
            raw,
            desc,
            marker: PhantomData,
        }
    }
}

impl ImportToRenderGraph for RayTracingAcceleration {
    fn import(
        self: Arc<Self>,
        rg: &mut RenderGraph,
        access_type_at_import_time: vk_sync::AccessType,
    ) -> Handle<Self> {
        let raw = rg.import_resource(GraphResourceImportInfo::RayTracingAcceleration {
            resource: self,
            access_type: access_type_at_import_time,
        });

        Handle {
            raw,
            desc: RayTracingAccelerationDesc,
            marker: PhantomData,
        }
    }
}

impl ExportToRenderGraph for Image {
    fn export(
        resource: Handle<Self>,
        rg: &mut RenderGraph,
        access_type: vk_sync::AccessType,
    ) -> ExportedHandle<Self> {
        let res = ExportedHandle {
            raw: resource.raw,
            marker: PhantomData,
        };
        rg.exported_resources
            .push((ExportableGraphResource::Image(resource), access_type));
        res
    }
}

impl ExportToRenderGraph for Buffer {
    fn export(
        resource: Handle<Self>,
        rg: &mut RenderGraph,
        access_type: vk_sync::AccessType,
    ) -> ExportedHandle<Self> {
        let res = ExportedHandle {
            raw: resource.raw,
            marker: PhantomData,
        };
        rg.exported_resources
            .push((ExportableGraphResource::Buffer(resource), access_type));
        res
    }
}

pub trait TypeEquals {
    type Other;
    fn same(value: Self) -> Self::Other;
}

impl<T: Sized> TypeEquals for T {
    type Other = Self;
    fn same(value: Self) -> Self::Other {
        value
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            resources: Vec::new(),
            exported_resources: Vec::new(),
            compute_pipelines: Vec::new(),
            predefined_descriptor_set_layouts: HashMap::new(),
        }
    }

    pub fn create<Desc: ResourceDesc>(
        &mut self,
        desc: Desc,
    ) -> Handle<<Desc as ResourceDesc>::Resource>
    where
        Desc: TypeEquals<Other = <<Desc as ResourceDesc>::Resource as Resource>::Desc>,
    {
        let handle: Handle<<Desc as ResourceDesc>::Resource> = Handle {
            raw: self.create_raw_resource(GraphResourceCreateInfo {
                desc: desc.clone().into(),
            }),
            desc: TypeEquals::same(desc),
            marker: PhantomData,
        };

        handle
    }

    pub(crate) fn create_raw_resource(&mut self, info: GraphResourceCreateInfo) -> RawGraphHandle {
        let res = RawGraphHandle {
            id: self.resources.len() as u32,
            version: 0,
        };

        self.resources.push(GraphResourceInfo::Created(info));
        res
    }

    fn import_resource(&mut self, info: GraphResourceImportInfo) -> RawGraphHandle {
        let res = RawGraphHandle {
            id: self.resources.len() as u32,
            version: 0,
        };

        self.resources.push(GraphResourceInfo::Imported(info));
        res
    }

    pub fn import<Res: ImportToRenderGraph>(
        &mut self,
        resource: Arc<Res>,
        access_type_at_import_time: vk_sync::AccessType,
    ) -> Handle<Res> {
        ImportToRenderGraph::import(resource, self, access_type_at_import_time)
    }

    pub fn export<Res: ExportToRenderGraph>(
        &mut self,
        resource: Handle<Res>,
        access_type: vk_sync::AccessType,
    ) -> ExportedHandle<Res> {
        ExportToRenderGraph::export(resource, self, access_type)
    }
}

#[derive(Debug)]
struct ResourceLifetime {
    last_access: Option<usize>,
}

struct ResourceInfo {
    _lifetimes: Vec<ResourceLifetime>,
    image_usage_flags: Vec<vk::ImageUsageFlags>,
    buffer_usage_flags: Vec<vk::BufferUsageFlags>,
}

pub struct RenderGraphExecutionParams<'a> {
    pub device: &'a Device,
    pub pipeline_cache: &'a mut PipelineCache,
    pub frame_descriptor_set: vk::DescriptorSet,
    pub frame_constants_layout: FrameConstantsLayout,
    pub profiler_data: &'a VkProfilerData,
}

pub struct RenderGraphPipelines {
    pub(crate) compute: Vec<ComputePipelineHandle>,
}

pub struct CompiledRenderGraph {
    rg: RenderGraph,
    resource_info: ResourceInfo,
    pipelines: RenderGraphPipelines,
}

impl RenderGraph {
    pub fn add_pass<'s>(&'s mut self, name: &str) -> PassBuilder<'s> {
        let pass_idx = self.passes.len();

        PassBuilder {
            rg: self,
            pass_idx,
            pass: Some(RecordedPass::new(name)),
        }
    }

    fn calculate_resource_info(&self) -> ResourceInfo {
        let mut lifetimes: Vec<ResourceLifetime> = self
            .resources
            .iter()
            .map(|res| match res {
                GraphResourceInfo::Created(_) => ResourceLifetime { last_access: None },
                GraphResourceInfo::Imported(_) => ResourceLifetime {
                    last_access: Some(0),
                },
            })
            .collect();

        let mut image_usage_flags: Vec<vk::ImageUsageFlags> =
            vec![Default::default(); self.resources.len()];

        let mut buffer_usage_flags: Vec<vk::BufferUsageFlags> =
            vec![Default::default(); self.resources.len()];

        for (res_idx, resource) in self.resources.iter().enumerate() {
            match resource {
                GraphResourceInfo::Created(GraphResourceCreateInfo {
                    desc: GraphResourceDesc::Image(desc),
                    ..
                }) => {
                    image_usage_flags[res_idx] = desc.usage;
                }
                GraphResourceInfo::Created(GraphResourceCreateInfo {
                    desc: GraphResourceDesc::Buffer(desc),
                    ..
                }) => {
                    buffer_usage_flags[res_idx] = desc.usage;
                }
                _ => {}
            }
        }

        for (pass_idx, pass) in self.passes.iter().enumerate() {
            for res_access in pass.read.iter().chain(pass.write.iter()) {
                let resource_index = res_access.handle.id as usize;
                let res = &mut lifetimes[resource_index];
                res.last_access = Some(
                    res.last_access
                        .map(|last_access| last_access.max(pass_idx))
                        .unwrap_or(pass_idx),
                );

                let access_mask = get_access_info(res_access.access.access_type).access_mask;

                match &self.resources[resource_index] {
                    // Images
                    GraphResourceInfo::Created(GraphResourceCreateInfo {
                        desc: GraphResourceDesc::Image(_),
                        ..
                    })
                    | GraphResourceInfo::Imported(GraphResourceImportInfo::Image { .. }) => {
                        let image_usage: vk::ImageUsageFlags =
                            image_access_mask_to_usage_flags(access_mask);

                        image_usage_flags[res_access.handle.id as usize] |= image_usage;
                    }

                    // Buffers
                    GraphResourceInfo::Created(GraphResourceCreateInfo {
                        desc: GraphResourceDesc::Buffer(_),
                        ..
                    })
                    | GraphResourceInfo::Imported(GraphResourceImportInfo::Buffer { .. }) => {
                        let buffer_usage: vk::BufferUsageFlags =
                            buffer_access_mask_to_usage_flags(access_mask);

                        buffer_usage_flags[res_access.handle.id as usize] |= buffer_usage;
                    }

                    // Acceleration structures
                    GraphResourceInfo::Created(GraphResourceCreateInfo {
                        desc: GraphResourceDesc::RayTracingAcceleration(_),
                        ..
                    }) => {
                        unimplemented!(
                            "Acceleration structures are always built outside the render graph"
                        );
                    }
                    GraphResourceInfo::Imported(
                        GraphResourceImportInfo::RayTracingAcceleration { .. },
                    ) => {
                        // Usage flags are not tracked for acceleration structures
                    }
                };
            }
        }

        for (res, access_type) in &self.exported_resources {
            let raw_id = res.raw().id as usize;
            lifetimes[raw_id].last_access = Some(self.passes.len().saturating_sub(1));

            if *access_type != vk_sync::AccessType::Nothing {
                let access_mask = get_access_info(*access_type).access_mask;

                match res {
                    ExportableGraphResource::Image(_) => {
                        image_usage_flags[raw_id] |= image_access_mask_to_usage_flags(access_mask);
                    }
                    ExportableGraphResource::Buffer(_) => {
                        buffer_usage_flags[raw_id] |=
                            buffer_access_mask_to_usage_flags(access_mask);
                    }
                }
            }
        }

        ResourceInfo {
            _lifetimes: lifetimes,
            image_usage_flags,
            buffer_usage_flags,
        }
    }

    pub fn compile(self, pipeline_cache: &mut PipelineCache) -> CompiledRenderGraph {
        let resource_info = self.calculate_resource_info();
        // TODO: alias transient resources with disjoint lifetimes

        let compute_pipelines = self
            .compute_pipelines
            .iter()
            .map(|pipeline| pipeline_cache.register_compute(&pipeline.desc))
            .collect::<Vec<_>>();

        CompiledRenderGraph {
            rg: self,
            resource_info,
            pipelines: RenderGraphPipelines {
                compute: compute_pipelines,
            },
        }
    }

    pub(crate) fn record_pass(&mut self, pass: RecordedPass) {
        self.passes.push(pass);
    }
}

/// Usage flags a transient image needs for the declared accesses. The access
/// masks come from [`get_access_info`], which only emits the compute and
/// transfer accesses this frame performs.
fn image_access_mask_to_usage_flags(access_mask: vk::AccessFlags) -> vk::ImageUsageFlags {
    match access_mask {
        vk::AccessFlags::SHADER_READ => vk::ImageUsageFlags::SAMPLED,
        vk::AccessFlags::SHADER_WRITE => vk::ImageUsageFlags::STORAGE,
        vk::AccessFlags::TRANSFER_READ => vk::ImageUsageFlags::TRANSFER_SRC,
        vk::AccessFlags::TRANSFER_WRITE => vk::ImageUsageFlags::TRANSFER_DST,
        _ => panic!("Invalid image access mask: {:?}", access_mask),
    }
}

/// Shader-visible buffers here are all storage buffers: ray lists, counters,
/// sort keys. None are bound as texel or uniform buffers.
fn buffer_access_mask_to_usage_flags(access_mask: vk::AccessFlags) -> vk::BufferUsageFlags {
    match access_mask {
        vk::AccessFlags::INDIRECT_COMMAND_READ => vk::BufferUsageFlags::INDIRECT_BUFFER,
        vk::AccessFlags::SHADER_READ => vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::AccessFlags::SHADER_WRITE => vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::AccessFlags::TRANSFER_READ => vk::BufferUsageFlags::TRANSFER_SRC,
        vk::AccessFlags::TRANSFER_WRITE => vk::BufferUsageFlags::TRANSFER_DST,
        _ => panic!("Invalid buffer access mask: {:?}", access_mask),
    }
}

impl CompiledRenderGraph {
    #[must_use]
    pub fn begin_execute<'exec_params, 'constants>(
        self,
        params: RenderGraphExecutionParams<'exec_params>,
        transient_resource_cache: &mut TransientResourceCache,
        dynamic_constants: &'constants mut DynamicConstants,
    ) -> ExecutingRenderGraph<'exec_params, 'constants> {
        let device = params.device;
        let resources: Vec<RegistryResource> = self
            .rg
            .resources
            .iter()
            .enumerate()
            .map(|(resource_idx, resource)| match resource {
                GraphResourceInfo::Created(create_info) => match create_info.desc {
                    GraphResourceDesc::Image(mut desc) => {
                        desc.usage = self.resource_info.image_usage_flags[resource_idx];

                        let image = transient_resource_cache
                            .get_image(&desc)
                            .unwrap_or_else(|| device.create_image(desc).unwrap());

                        RegistryResource {
                            access_type: vk_sync::AccessType::Nothing,
                            resource: AnyRenderResource::OwnedImage(image),
                        }
                    }
                    GraphResourceDesc::Buffer(mut desc) => {
                        desc.usage = self.resource_info.buffer_usage_flags[resource_idx];

                        let buffer =
                            transient_resource_cache
                                .get_buffer(&desc)
                                .unwrap_or_else(|| {
                                    device.create_buffer(desc, "rg buffer", None).unwrap()
                                });

                        RegistryResource {
                            resource: AnyRenderResource::OwnedBuffer(buffer),
                            access_type: vk_sync::AccessType::Nothing,
                        }
                    }
                    GraphResourceDesc::RayTracingAcceleration(_) => {
                        unimplemented!();
                    }
                },
                GraphResourceInfo::Imported(import_info) => match import_info {
                    GraphResourceImportInfo::Image {
                        resource,
                        access_type,
                    } => RegistryResource {
                        resource: AnyRenderResource::ImportedImage(resource.clone()),
                        access_type: *access_type,
                    },
                    GraphResourceImportInfo::Buffer {
                        resource,
                        access_type,
                    } => RegistryResource {
                        resource: AnyRenderResource::ImportedBuffer(resource.clone()),
                        access_type: *access_type,
                    },
                    GraphResourceImportInfo::RayTracingAcceleration {
                        resource,
                        access_type,
                    } => RegistryResource {
                        resource: AnyRenderResource::ImportedRayTracingAcceleration(
                            resource.clone(),
                        ),
                        access_type: *access_type,
                    },
                },
            })
            .collect();

        let resource_registry = ResourceRegistry {
            execution_params: params,
            resources,
            dynamic_constants,
            pipelines: self.pipelines,
        };

        ExecutingRenderGraph {
            resource_registry,
            passes: self.rg.passes.into(),
            exported_resources: self.rg.exported_resources,
        }
    }
}

pub struct ExecutingRenderGraph<'exec_params, 'constants> {
    passes: VecDeque<RecordedPass>,
    exported_resources: Vec<(ExportableGraphResource, vk_sync::AccessType)>,
    resource_registry: ResourceRegistry<'exec_params, 'constants>,
}

impl<'exec_params, 'constants> ExecutingRenderGraph<'exec_params, 'constants> {
    #[must_use]
    pub fn record_main_cb(mut self, cb: &CommandBuffer) -> RetiredRenderGraph {
        let mut passes: Vec<_> = std::mem::take(&mut self.passes).into();

        // At the start, transition all resources to the access type they're first used with.
        // While we don't have split barriers yet, this removes some bubbles
        // which would otherwise occur with temporal resources.
        {
            let mut resource_first_access_states: HashMap<u32, &mut PassResourceAccessType> =
                HashMap::with_capacity(self.resource_registry.resources.len());

            for pass in &mut passes {
                for resource_ref in pass.read.iter_mut().chain(pass.write.iter_mut()) {
                    resource_first_access_states
                        .entry(resource_ref.handle.id)
                        .or_insert(&mut resource_ref.access);
                }
            }

            let params = &self.resource_registry.execution_params;
            for (resource_idx, access) in resource_first_access_states {
                let resource = &mut self.resource_registry.resources[resource_idx as usize];
                Self::transition_resource(
                    params.device,
                    cb,
                    resource,
                    PassResourceAccessType {
                        access_type: access.access_type,
                        sync_type: PassResourceAccessSyncType::SkipSyncIfSameAccessType,
                    },
                );

                // Skip the sync when this pass is encountered later.
                access.sync_type = PassResourceAccessSyncType::SkipSyncIfSameAccessType;
            }
        }

        for pass in passes {
            Self::record_pass_cb(pass, &mut self.resource_registry, cb);
        }

        // Transition exported resources to the access types they were requested with
        {
            let params = &self.resource_registry.execution_params;

            for (resource_idx, access_type) in self.exported_resources {
                if access_type != vk_sync::AccessType::Nothing {
                    let resource =
                        &mut self.resource_registry.resources[resource_idx.raw().id as usize];
                    Self::transition_resource(
                        params.device,
                        cb,
                        resource,
                        PassResourceAccessType {
                            access_type,
                            sync_type: PassResourceAccessSyncType::AlwaysSync,
                        },
                    );
                }
            }
        }

        RetiredRenderGraph {
            resources: self.resource_registry.resources,
        }
    }

    fn record_pass_cb(
        pass: RecordedPass,
        resource_registry: &mut ResourceRegistry,
        cb: &CommandBuffer,
    ) {
        let params = &resource_registry.execution_params;

        if let Some(debug_utils) = params.device.debug_utils() {
            unsafe {
                let label: CString = CString::new(pass.name.as_str()).unwrap();
                let label = DebugUtilsLabelEXT::builder().label_name(&label).build();
                debug_utils.cmd_begin_debug_utils_label(cb.raw, &label);
            }
        }

        let vk_scope = params
            .profiler_data
            .begin_scope(&params.device.raw, cb.raw, &pass.name);

        {
            let params = &resource_registry.execution_params;

            let mut transitions: Vec<(usize, PassResourceAccessType)> = Vec::new();
            for resource_ref in pass.read.iter().chain(pass.write.iter()) {
                transitions.push((resource_ref.handle.id as usize, resource_ref.access));
            }

            for (resource_idx, access) in transitions {
                let resource = &mut resource_registry.resources[resource_idx];

                Self::transition_resource(params.device, cb, resource, access);
            }
        }

        let mut api = RenderPassApi {
            cb,
            resources: resource_registry,
        };

        if let Some(render_fn) = pass.render_fn {
            if let Err(err) = render_fn(&mut api) {
                panic!("Pass {:?} failed to render: {:#}", pass.name, err);
            }
        }

        let params = &resource_registry.execution_params;

        params
            .profiler_data
            .end_scope(&params.device.raw, cb.raw, vk_scope);

        if let Some(debug_utils) = params.device.debug_utils() {
            unsafe {
                debug_utils.cmd_end_debug_utils_label(cb.raw);
            }
        }
    }

    fn transition_resource(
        device: &Device,
        cb: &CommandBuffer,
        resource: &mut RegistryResource,
        access: PassResourceAccessType,
    ) {
        match plan_transition(resource.access_type, access.access_type) {
            BarrierKind::None => return,
            BarrierKind::WriteOverlap => {
                // The state word stays the same, but unless the pass opted
                // out of syncing, the previous writer must drain first.
                if matches!(
                    access.sync_type,
                    PassResourceAccessSyncType::SkipSyncIfSameAccessType
                ) {
                    return;
                }

                record_global_barrier(
                    device,
                    cb.raw,
                    &[resource.access_type],
                    &[access.access_type],
                );
            }
            BarrierKind::Transition => match resource.resource.borrow() {
                AnyRenderResourceRef::Image(image) => {
                    record_image_barrier(
                        device,
                        cb.raw,
                        ImageBarrier::new(
                            image.raw,
                            resource.access_type,
                            access.access_type,
                            image_aspect_mask_from_access_type_and_format(
                                access.access_type,
                                image.desc.format,
                            )
                            .unwrap_or_else(|| {
                                panic!(
                                    "Invalid image access {:?} :: {:?}",
                                    access.access_type, image.desc
                                )
                            }),
                        ),
                    );
                }
                AnyRenderResourceRef::Buffer(buffer) => {
                    vk_sync::cmd::pipeline_barrier(
                        device.raw.fp_v1_0(),
                        cb.raw,
                        None,
                        &[vk_sync::BufferBarrier {
                            previous_accesses: &[resource.access_type],
                            next_accesses: &[access.access_type],
                            src_queue_family_index: device.universal_queue.family.index,
                            dst_queue_family_index: device.universal_queue.family.index,
                            buffer: buffer.raw,
                            offset: 0,
                            size: buffer.desc.size,
                        }],
                        &[],
                    );
                }
                AnyRenderResourceRef::RayTracingAcceleration(_) => {
                    // Built and synchronized outside the graph
                }
            },
        }

        resource.access_type = access.access_type;
    }
}

pub struct RetiredRenderGraph {
    resources: Vec<RegistryResource>,
}

impl RetiredRenderGraph {
    pub fn exported_resource<Res: Resource>(
        &self,
        handle: ExportedHandle<Res>,
    ) -> (&Res, vk_sync::AccessType) {
        let reg_resource = &self.resources[handle.raw.id as usize];
        (
            <Res as Resource>::borrow_resource(&reg_resource.resource),
            reg_resource.access_type,
        )
    }

    pub fn release_resources(self, transient_resource_cache: &mut TransientResourceCache) {
        for resource in self.resources {
            match resource.resource {
                AnyRenderResource::OwnedImage(image) => {
                    transient_resource_cache.insert_image(image)
                }
                AnyRenderResource::OwnedBuffer(buffer) => {
                    transient_resource_cache.insert_buffer(buffer)
                }
                AnyRenderResource::ImportedImage(_)
                | AnyRenderResource::ImportedBuffer(_)
                | AnyRenderResource::ImportedRayTracingAcceleration(_) => {}
            }
        }
    }
}

type DynRenderFn = dyn FnOnce(&mut RenderPassApi) -> Result<(), BackendError>;

#[derive(Copy, Clone)]
pub enum PassResourceAccessSyncType {
    AlwaysSync,
    SkipSyncIfSameAccessType,
}

#[derive(Copy, Clone)]
pub struct PassResourceAccessType {
    access_type: vk_sync::AccessType,
    sync_type: PassResourceAccessSyncType,
}

impl PassResourceAccessType {
    pub fn new(access_type: vk_sync::AccessType, sync_type: PassResourceAccessSyncType) -> Self {
        Self {
            access_type,
            sync_type,
        }
    }
}

pub(crate) struct PassResourceRef {
    pub handle: RawGraphHandle,
    pub access: PassResourceAccessType,
}

pub(crate) struct RecordedPass {
    pub read: Vec<PassResourceRef>,
    pub write: Vec<PassResourceRef>,
    pub render_fn: Option<Box<DynRenderFn>>,
    pub name: String,
}

impl RecordedPass {
    fn new(name: &str) -> Self {
        Self {
            read: Default::default(),
            write: Default::default(),
            render_fn: Default::default(),
            name: name.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lustre_backend::vk_sync::AccessType;

    #[test]
    fn shader_visible_buffers_are_storage_buffers() {
        let read = get_access_info(AccessType::AnyShaderReadSampledImageOrUniformTexelBuffer);
        assert_eq!(
            buffer_access_mask_to_usage_flags(read.access_mask),
            vk::BufferUsageFlags::STORAGE_BUFFER
        );

        let write = get_access_info(AccessType::AnyShaderWrite);
        assert_eq!(
            buffer_access_mask_to_usage_flags(write.access_mask),
            vk::BufferUsageFlags::STORAGE_BUFFER
        );
    }

    #[test]
    fn sampled_reads_and_storage_writes_accumulate_image_usage() {
        let read = get_access_info(AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer);
        let write = get_access_info(AccessType::ComputeShaderWrite);

        let usage = image_access_mask_to_usage_flags(read.access_mask)
            | image_access_mask_to_usage_flags(write.access_mask);

        assert_eq!(
            usage,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE
        );
    }

    #[test]
    fn pass_writes_advance_resource_versions() {
        let mut rg = RenderGraph::new();
        let mut img = rg.create(ImageDesc::new_2d(vk::Format::R16G16B16A16_SFLOAT, [64, 64]));

        {
            let mut pass = rg.add_pass("first write");
            let written = pass.write(&mut img, AccessType::ComputeShaderWrite);
            assert_eq!(written.handle.version, 1);
        }
    }
}
