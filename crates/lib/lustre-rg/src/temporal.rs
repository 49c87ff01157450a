use crate::{
    Buffer, BufferDesc, ExportableGraphResource, ExportedHandle, Handle, Image, ImageDesc,
    RenderGraph, Resource, RetiredRenderGraph,
};
use anyhow::Context;
use lustre_backend::{vk_sync, vulkan::device::Device};
use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::Arc,
};

pub struct ReadOnlyHandle<ResType: Resource>(Handle<ResType>);

impl<ResType: Resource> From<Handle<ResType>> for ReadOnlyHandle<ResType> {
    fn from(h: Handle<ResType>) -> Self {
        Self(h)
    }
}

impl<ResType: Resource> std::ops::Deref for ReadOnlyHandle<ResType> {
    type Target = Handle<ResType>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Clone, Hash, Eq, PartialEq, Debug)]
pub struct TemporalResourceKey(String);

impl<'a> From<&'a str> for TemporalResourceKey {
    fn from(s: &'a str) -> Self {
        TemporalResourceKey(String::from(s))
    }
}

impl From<String> for TemporalResourceKey {
    fn from(s: String) -> Self {
        TemporalResourceKey(s)
    }
}

#[derive(Clone)]
pub(crate) enum TemporalResource {
    Image(Arc<Image>),
    Buffer(Arc<Buffer>),
}

pub(crate) enum ExportedResourceHandle {
    Image(ExportedHandle<Image>),
    Buffer(ExportedHandle<Buffer>),
}

pub(crate) enum TemporalResourceState {
    Inert {
        resource: TemporalResource,
        access_type: vk_sync::AccessType,
    },
    Imported {
        resource: TemporalResource,
        handle: ExportableGraphResource,
    },
    Exported {
        resource: TemporalResource,
        handle: ExportedResourceHandle,
    },
}

#[derive(Default)]
pub struct TemporalRenderGraphState {
    pub(crate) resources: HashMap<TemporalResourceKey, TemporalResourceState>,
}

impl TemporalRenderGraphState {
    pub(crate) fn clone_assuming_inert(&self) -> Self {
        Self {
            resources: self
                .resources
                .iter()
                .map(|(k, v)| match v {
                    TemporalResourceState::Inert {
                        resource,
                        access_type,
                    } => (
                        k.clone(),
                        TemporalResourceState::Inert {
                            resource: resource.clone(),
                            access_type: *access_type,
                        },
                    ),
                    TemporalResourceState::Imported { .. }
                    | TemporalResourceState::Exported { .. } => {
                        panic!("Not in inert state!")
                    }
                })
                .collect(),
        }
    }
}

pub struct ExportedTemporalRenderGraphState(pub(crate) TemporalRenderGraphState);

pub struct TemporalRenderGraph {
    rg: RenderGraph,
    device: Arc<Device>,
    temporal_state: TemporalRenderGraphState,
}

impl Deref for TemporalRenderGraph {
    type Target = RenderGraph;

    fn deref(&self) -> &Self::Target {
        &self.rg
    }
}

impl DerefMut for TemporalRenderGraph {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.rg
    }
}

impl TemporalRenderGraph {
    pub fn new(state: TemporalRenderGraphState, device: Arc<Device>) -> Self {
        Self {
            rg: RenderGraph::new(),
            device,
            temporal_state: state,
        }
    }

    pub fn device(&self) -> &Device {
        self.device.as_ref()
    }
}

pub trait GetOrCreateTemporal<Desc: ResourceDescTraits> {
    fn get_or_create_temporal(
        &mut self,
        key: impl Into<TemporalResourceKey>,
        desc: Desc,
    ) -> anyhow::Result<Handle<<Desc as crate::resource::ResourceDesc>::Resource>>
    where
        Desc: crate::resource::ResourceDesc,
        <Desc as crate::resource::ResourceDesc>::Resource: Sized;
}

pub trait ResourceDescTraits {}
impl ResourceDescTraits for ImageDesc {}
impl ResourceDescTraits for BufferDesc {}

impl GetOrCreateTemporal<ImageDesc> for TemporalRenderGraph {
    fn get_or_create_temporal(
        &mut self,
        key: impl Into<TemporalResourceKey>,
        desc: ImageDesc,
    ) -> anyhow::Result<Handle<Image>> {
        let key = key.into();

        match self.temporal_state.resources.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let state = entry.get_mut();

                match state {
                    TemporalResourceState::Inert {
                        resource,
                        access_type,
                    } => {
                        let resource = resource.clone();

                        match &resource {
                            TemporalResource::Image(image) => {
                                let handle = self.rg.import(image.clone(), *access_type);

                                *state = TemporalResourceState::Imported {
                                    resource,
                                    handle: ExportableGraphResource::Image(
                                        handle.clone_unchecked(),
                                    ),
                                };

                                Ok(handle)
                            }
                            TemporalResource::Buffer(_) => {
                                anyhow::bail!(
                                    "Resource {:?} is a buffer, but an image was requested",
                                    key
                                );
                            }
                        }
                    }
                    TemporalResourceState::Imported { .. } => Err(anyhow::anyhow!(
                        "Temporal resource already taken: {:?}",
                        key
                    )),
                    TemporalResourceState::Exported { .. } => {
                        unreachable!()
                    }
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let resource = Arc::new(
                    self.device
                        .create_image(desc)
                        .with_context(|| format!("Creating image {:?}", desc))?,
                );
                let handle = self.rg.import(resource.clone(), vk_sync::AccessType::Nothing);

                entry.insert(TemporalResourceState::Imported {
                    resource: TemporalResource::Image(resource),
                    handle: ExportableGraphResource::Image(handle.clone_unchecked()),
                });

                Ok(handle)
            }
        }
    }
}

impl GetOrCreateTemporal<BufferDesc> for TemporalRenderGraph {
    fn get_or_create_temporal(
        &mut self,
        key: impl Into<TemporalResourceKey>,
        desc: BufferDesc,
    ) -> anyhow::Result<Handle<Buffer>> {
        let key = key.into();

        match self.temporal_state.resources.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let state = entry.get_mut();

                match state {
                    TemporalResourceState::Inert {
                        resource,
                        access_type,
                    } => {
                        let resource = resource.clone();

                        match &resource {
                            TemporalResource::Buffer(buffer) => {
                                let handle = self.rg.import(buffer.clone(), *access_type);

                                *state = TemporalResourceState::Imported {
                                    resource,
                                    handle: ExportableGraphResource::Buffer(
                                        handle.clone_unchecked(),
                                    ),
                                };

                                Ok(handle)
                            }
                            TemporalResource::Image(_) => {
                                anyhow::bail!(
                                    "Resource {:?} is an image, but a buffer was requested",
                                    key
                                );
                            }
                        }
                    }
                    TemporalResourceState::Imported { .. } => Err(anyhow::anyhow!(
                        "Temporal resource already taken: {:?}",
                        key
                    )),
                    TemporalResourceState::Exported { .. } => {
                        unreachable!()
                    }
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let resource = Arc::new(self.device.create_buffer(
                    desc,
                    &key.0,
                    Some(&vec![0u8; desc.size]),
                )?);
                let handle = self.rg.import(resource.clone(), vk_sync::AccessType::Nothing);

                entry.insert(TemporalResourceState::Imported {
                    resource: TemporalResource::Buffer(resource),
                    handle: ExportableGraphResource::Buffer(handle.clone_unchecked()),
                });

                Ok(handle)
            }
        }
    }
}

impl TemporalRenderGraph {
    pub fn export_temporal(mut self) -> (RenderGraph, ExportedTemporalRenderGraphState) {
        for state in self.temporal_state.resources.values_mut() {
            match state {
                TemporalResourceState::Inert { .. } => {
                    // Not used this frame. Nothing to do here.
                }
                TemporalResourceState::Imported { resource, handle } => match handle {
                    ExportableGraphResource::Image(handle) => {
                        let handle = self
                            .rg
                            .export(handle.clone_unchecked(), vk_sync::AccessType::Nothing);
                        *state = TemporalResourceState::Exported {
                            resource: resource.clone(),
                            handle: ExportedResourceHandle::Image(handle),
                        };
                    }
                    ExportableGraphResource::Buffer(handle) => {
                        let handle = self
                            .rg
                            .export(handle.clone_unchecked(), vk_sync::AccessType::Nothing);
                        *state = TemporalResourceState::Exported {
                            resource: resource.clone(),
                            handle: ExportedResourceHandle::Buffer(handle),
                        };
                    }
                },
                TemporalResourceState::Exported { .. } => {
                    unreachable!()
                }
            }
        }

        (self.rg, ExportedTemporalRenderGraphState(self.temporal_state))
    }
}

impl ExportedTemporalRenderGraphState {
    pub fn retire_temporal(self, rg: &RetiredRenderGraph) -> TemporalRenderGraphState {
        let mut state = self.0;

        for res_state in state.resources.values_mut() {
            match res_state {
                TemporalResourceState::Inert { .. } => {
                    // Not used this frame
                }
                TemporalResourceState::Imported { .. } => {
                    unreachable!()
                }
                TemporalResourceState::Exported { resource, handle } => match handle {
                    ExportedResourceHandle::Image(handle) => {
                        *res_state = TemporalResourceState::Inert {
                            resource: resource.clone(),
                            access_type: rg.exported_resource(*handle).1,
                        }
                    }
                    ExportedResourceHandle::Buffer(handle) => {
                        *res_state = TemporalResourceState::Inert {
                            resource: resource.clone(),
                            access_type: rg.exported_resource(*handle).1,
                        }
                    }
                },
            }
        }

        state
    }
}
