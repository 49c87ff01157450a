use crate::RenderGraphPipelines;

use super::{graph::RenderGraphExecutionParams, resource::*, RgComputePipelineHandle};
use lustre_backend::{
    ash::vk,
    dynamic_constants::DynamicConstants,
    vk_sync,
    vulkan::{ray_tracing::RayTracingAcceleration, shader::ComputePipeline},
    BackendError,
};
use std::sync::Arc;

pub enum AnyRenderResource {
    OwnedImage(Image),
    ImportedImage(Arc<Image>),
    OwnedBuffer(Buffer),
    ImportedBuffer(Arc<Buffer>),
    ImportedRayTracingAcceleration(Arc<RayTracingAcceleration>),
}

pub enum AnyRenderResourceRef<'a> {
    Image(&'a Image),
    Buffer(&'a Buffer),
    RayTracingAcceleration(&'a RayTracingAcceleration),
}

impl AnyRenderResource {
    pub fn borrow(&self) -> AnyRenderResourceRef {
        match self {
            AnyRenderResource::OwnedImage(inner) => AnyRenderResourceRef::Image(inner),
            AnyRenderResource::ImportedImage(inner) => AnyRenderResourceRef::Image(inner.as_ref()),
            AnyRenderResource::OwnedBuffer(inner) => AnyRenderResourceRef::Buffer(inner),
            AnyRenderResource::ImportedBuffer(inner) => {
                AnyRenderResourceRef::Buffer(inner.as_ref())
            }
            AnyRenderResource::ImportedRayTracingAcceleration(inner) => {
                AnyRenderResourceRef::RayTracingAcceleration(inner.as_ref())
            }
        }
    }
}

pub(crate) struct RegistryResource {
    pub resource: AnyRenderResource,
    pub access_type: vk_sync::AccessType,
}

/// Resolves pass-scoped `Ref`s to the physical resources picked when graph
/// execution began.
pub struct ResourceRegistry<'exec_params, 'constants> {
    pub execution_params: RenderGraphExecutionParams<'exec_params>,
    pub(crate) resources: Vec<RegistryResource>,
    pub dynamic_constants: &'constants mut DynamicConstants,
    pub pipelines: RenderGraphPipelines,
}

impl<'exec_params, 'constants> ResourceRegistry<'exec_params, 'constants> {
    pub(crate) fn resource<Res: Resource>(&self, handle: RawGraphHandle) -> &Res {
        Res::borrow_resource(&self.resources[handle.id as usize].resource)
    }

    pub fn image<ViewType: GpuViewType>(&self, resource: Ref<Image, ViewType>) -> &Image {
        self.resource(resource.handle)
    }

    pub fn buffer<ViewType: GpuViewType>(&self, resource: Ref<Buffer, ViewType>) -> &Buffer {
        self.resource(resource.handle)
    }

    pub fn rt_acceleration<ViewType: GpuViewType>(
        &self,
        resource: Ref<RayTracingAcceleration, ViewType>,
    ) -> &RayTracingAcceleration {
        self.resource(resource.handle)
    }

    pub(crate) fn image_view(
        &self,
        resource: RawGraphHandle,
        view_desc: &ImageViewDesc,
    ) -> Result<vk::ImageView, BackendError> {
        let image: &Image = self.resource(resource);
        image.view(self.execution_params.device, view_desc)
    }

    pub fn compute_pipeline(&self, pipeline: RgComputePipelineHandle) -> Arc<ComputePipeline> {
        let handle = self.pipelines.compute[pipeline.id];
        self.execution_params.pipeline_cache.get_compute(handle)
    }
}
