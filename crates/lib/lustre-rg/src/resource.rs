use lustre_backend::vulkan::ray_tracing::RayTracingAcceleration;
pub use lustre_backend::vulkan::{
    buffer::{Buffer, BufferDesc},
    image::*,
};
use std::marker::PhantomData;

use super::resource_registry::{AnyRenderResource, AnyRenderResourceRef};

pub trait Resource {
    type Desc: ResourceDesc;

    fn borrow_resource(res: &AnyRenderResource) -> &Self;
}

pub trait ResourceDesc: Clone + std::fmt::Debug + Into<GraphResourceDesc> {
    type Resource: Resource;
}

/// Acceleration structures carry no creation parameters through the graph;
/// they are built and sized outside it and only ever imported.
#[derive(Clone, Copy, Debug)]
pub struct RayTracingAccelerationDesc;

#[derive(Clone, Copy, Debug)]
pub enum GraphResourceDesc {
    Image(ImageDesc),
    Buffer(BufferDesc),
    RayTracingAcceleration(RayTracingAccelerationDesc),
}

macro_rules! graph_resource {
    ($res:ty, $desc:ty, $variant:ident) => {
        impl Resource for $res {
            type Desc = $desc;

            fn borrow_resource(res: &AnyRenderResource) -> &Self {
                match res.borrow() {
                    AnyRenderResourceRef::$variant(inner) => inner,
                    _ => panic!(
                        "{} expected, but the handle points at another resource kind",
                        stringify!($variant)
                    ),
                }
            }
        }

        impl ResourceDesc for $desc {
            type Resource = $res;
        }

        impl From<$desc> for GraphResourceDesc {
            fn from(desc: $desc) -> Self {
                Self::$variant(desc)
            }
        }
    };
}

graph_resource!(Image, ImageDesc, Image);
graph_resource!(Buffer, BufferDesc, Buffer);
graph_resource!(
    RayTracingAcceleration,
    RayTracingAccelerationDesc,
    RayTracingAcceleration
);

/// Slot of a graph resource plus a write counter. Every pass write bumps
/// the version, so pass ordering falls out of the data flow.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub(crate) struct RawGraphHandle {
    pub(crate) id: u32,
    pub(crate) version: u32,
}

impl RawGraphHandle {
    pub(crate) fn next_version(self) -> Self {
        Self {
            version: self.version + 1,
            ..self
        }
    }
}

/// Owning handle to a graph resource. Deliberately not `Clone`: a handle
/// names the latest version of the resource, and aliasing it would let two
/// passes write the same version.
#[derive(Debug)]
pub struct Handle<ResType: Resource> {
    pub(crate) raw: RawGraphHandle,
    pub(crate) desc: <ResType as Resource>::Desc,
    pub(crate) marker: PhantomData<ResType>,
}

impl<ResType: Resource> Handle<ResType> {
    pub fn desc(&self) -> &<ResType as Resource>::Desc {
        &self.desc
    }

    pub(crate) fn clone_unchecked(&self) -> Self {
        Self {
            raw: self.raw,
            desc: self.desc.clone(),
            marker: PhantomData,
        }
    }
}

impl<ResType: Resource> PartialEq for Handle<ResType> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<ResType: Resource> Eq for Handle<ResType> {}

/// Names a resource surviving past graph execution, resolvable against the
/// retired graph.
#[derive(Debug)]
pub struct ExportedHandle<ResType: Resource> {
    pub(crate) raw: RawGraphHandle,
    pub(crate) marker: PhantomData<ResType>,
}

impl<ResType: Resource> Clone for ExportedHandle<ResType> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw,
            marker: PhantomData,
        }
    }
}

impl<ResType: Resource> Copy for ExportedHandle<ResType> {}

/// A pass-scoped view of a resource, produced by declaring the access.
/// Only valid inside the pass that declared it.
#[derive(Debug)]
pub struct Ref<ResType: Resource, ViewType: GpuViewType> {
    pub(crate) handle: RawGraphHandle,
    pub(crate) desc: <ResType as Resource>::Desc,
    pub(crate) marker: PhantomData<(ResType, ViewType)>,
}

impl<ResType: Resource, ViewType: GpuViewType> Ref<ResType, ViewType> {
    pub fn desc(&self) -> &<ResType as Resource>::Desc {
        &self.desc
    }
}

impl<ResType: Resource, ViewType: GpuViewType> Clone for Ref<ResType, ViewType>
where
    <ResType as Resource>::Desc: Clone,
    ViewType: Clone,
{
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            desc: self.desc.clone(),
            marker: PhantomData,
        }
    }
}

impl<ResType: Resource, ViewType: GpuViewType> Copy for Ref<ResType, ViewType>
where
    <ResType as Resource>::Desc: Copy,
    ViewType: Copy,
{
}

#[derive(Clone, Copy)]
pub struct GpuSrv;
#[derive(Clone, Copy)]
pub struct GpuUav;

pub trait GpuViewType {}
impl GpuViewType for GpuSrv {}
impl GpuViewType for GpuUav {}
