use crate::{PassResourceAccessSyncType, RenderPassApi};

use super::{
    graph::{
        PassResourceAccessType, PassResourceRef, RecordedPass, RenderGraph, RgComputePipeline,
        RgComputePipelineHandle, TypeEquals,
    },
    resource::*,
};

use lustre_backend::{vk_sync::AccessType, vulkan::shader::*, BackendError};
use std::{marker::PhantomData, path::Path};

/// Accesses a pass may declare for its inputs. The frame is compute and
/// transfer work only, so attachment and vertex-input accesses are rejected
/// outright rather than silently scheduled.
fn is_declarable_read(access_type: AccessType) -> bool {
    matches!(
        access_type,
        AccessType::IndirectBuffer
            | AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer
            | AccessType::AnyShaderReadSampledImageOrUniformTexelBuffer
            | AccessType::AnyShaderReadOther
            | AccessType::TransferRead
    )
}

fn is_declarable_write(access_type: AccessType) -> bool {
    matches!(
        access_type,
        AccessType::ComputeShaderWrite | AccessType::AnyShaderWrite | AccessType::TransferWrite
    )
}

pub struct PassBuilder<'rg> {
    pub(crate) rg: &'rg mut RenderGraph,
    #[allow(dead_code)]
    pub(crate) pass_idx: usize,
    pub(crate) pass: Option<RecordedPass>,
}

impl<'s> Drop for PassBuilder<'s> {
    fn drop(&mut self) {
        self.rg.record_pass(self.pass.take().unwrap())
    }
}

impl<'rg> PassBuilder<'rg> {
    pub fn create<Desc: ResourceDesc>(
        &mut self,
        desc: Desc,
    ) -> Handle<<Desc as ResourceDesc>::Resource>
    where
        Desc: TypeEquals<Other = <<Desc as ResourceDesc>::Resource as Resource>::Desc>,
    {
        self.rg.create(desc)
    }

    fn write_impl<Res: Resource>(
        &mut self,
        handle: &mut Handle<Res>,
        access_type: AccessType,
        sync_type: PassResourceAccessSyncType,
    ) -> Ref<Res, GpuUav> {
        assert!(
            is_declarable_write(access_type),
            "{:?} is not a write access this pipeline performs",
            access_type
        );

        // Multiple writes or mixing of reads and writes within a pass is
        // valid with non-overlapping views, so there is no runtime aliasing
        // check here.
        let pass = self.pass.as_mut().unwrap();
        pass.write.push(PassResourceRef {
            handle: handle.raw,
            access: PassResourceAccessType::new(access_type, sync_type),
        });

        Ref {
            desc: handle.desc.clone(),
            handle: handle.raw.next_version(),
            marker: PhantomData,
        }
    }

    pub fn write<Res: Resource>(
        &mut self,
        handle: &mut Handle<Res>,
        access_type: AccessType,
    ) -> Ref<Res, GpuUav> {
        self.write_impl(handle, access_type, PassResourceAccessSyncType::AlwaysSync)
    }

    /// Like [`PassBuilder::write`], but skips the execution barrier against
    /// the previous pass when that pass wrote with the same access. Used by
    /// the ray passes that append to disjoint regions of shared counters.
    pub fn write_no_sync<Res: Resource>(
        &mut self,
        handle: &mut Handle<Res>,
        access_type: AccessType,
    ) -> Ref<Res, GpuUav> {
        self.write_impl(
            handle,
            access_type,
            PassResourceAccessSyncType::SkipSyncIfSameAccessType,
        )
    }

    pub fn read<Res: Resource>(
        &mut self,
        handle: &Handle<Res>,
        access_type: AccessType,
    ) -> Ref<Res, GpuSrv> {
        assert!(
            is_declarable_read(access_type),
            "{:?} is not a read access this pipeline performs",
            access_type
        );

        let pass = self.pass.as_mut().unwrap();
        pass.read.push(PassResourceRef {
            handle: handle.raw,
            access: PassResourceAccessType::new(
                access_type,
                PassResourceAccessSyncType::SkipSyncIfSameAccessType,
            ),
        });

        Ref {
            desc: handle.desc.clone(),
            handle: handle.raw,
            marker: PhantomData,
        }
    }

    pub fn register_compute_pipeline(&mut self, path: impl AsRef<Path>) -> RgComputePipelineHandle {
        let desc = ComputePipelineDesc::builder()
            .compute_spv(path.as_ref().to_owned())
            .build()
            .unwrap();
        self.register_compute_pipeline_with_desc(desc)
    }

    pub fn register_compute_pipeline_with_desc(
        &mut self,
        mut desc: ComputePipelineDesc,
    ) -> RgComputePipelineHandle {
        let id = self.rg.compute_pipelines.len();

        for (set_idx, layout) in &self.rg.predefined_descriptor_set_layouts {
            desc.descriptor_set_opts[*set_idx as usize] = Some((
                *set_idx,
                DescriptorSetLayoutOpts::builder()
                    .replace(layout.bindings.clone())
                    .build()
                    .unwrap(),
            ));
        }

        self.rg.compute_pipelines.push(RgComputePipeline { desc });

        RgComputePipelineHandle { id }
    }

    pub fn render(
        mut self,
        render: impl (FnOnce(&mut RenderPassApi) -> Result<(), BackendError>) + 'static,
    ) {
        let prev = self
            .pass
            .as_mut()
            .unwrap()
            .render_fn
            .replace(Box::new(render));

        assert!(prev.is_none());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lustre_backend::ash::vk;

    #[test]
    #[should_panic(expected = "not a read access")]
    fn vertex_buffer_reads_are_rejected() {
        let mut rg = RenderGraph::new();
        let buf = rg.create(BufferDesc::new_gpu_only(
            256,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ));

        let mut pass = rg.add_pass("bogus read");
        pass.read(&buf, AccessType::VertexBuffer);
    }

    #[test]
    #[should_panic(expected = "not a write access")]
    fn attachment_writes_are_rejected() {
        let mut rg = RenderGraph::new();
        let mut img = rg.create(ImageDesc::new_2d(vk::Format::R8G8B8A8_UNORM, [16, 16]));

        let mut pass = rg.add_pass("bogus write");
        pass.write(&mut img, AccessType::ColorAttachmentWrite);
    }
}
