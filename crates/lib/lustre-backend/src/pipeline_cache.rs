use crate::vulkan::shader::{create_compute_pipeline, ComputePipeline, ComputePipelineDesc, ShaderSource};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub struct ComputePipelineHandle(usize);

struct ComputePipelineCacheEntry {
    desc: ComputePipelineDesc,
    pipeline: Option<Arc<ComputePipeline>>,
}

/// Creates pipelines from prebuilt SPIR-V modules under a shader root
/// directory, deduplicating by source path. `refresh` re-reads every module
/// from disk; a pipeline whose module fails to load keeps serving the old
/// code.
pub struct PipelineCache {
    shader_root: PathBuf,

    compute_entries: HashMap<ComputePipelineHandle, ComputePipelineCacheEntry>,
    compute_shader_to_handle: HashMap<ShaderSource, ComputePipelineHandle>,
}

impl PipelineCache {
    pub fn new(shader_root: impl Into<PathBuf>) -> Self {
        Self {
            shader_root: shader_root.into(),

            compute_entries: Default::default(),
            compute_shader_to_handle: Default::default(),
        }
    }

    pub fn register_compute(&mut self, desc: &ComputePipelineDesc) -> ComputePipelineHandle {
        match self.compute_shader_to_handle.entry(desc.source.clone()) {
            std::collections::hash_map::Entry::Occupied(occupied) => *occupied.get(),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                let handle = ComputePipelineHandle(self.compute_entries.len());

                self.compute_entries.insert(
                    handle,
                    ComputePipelineCacheEntry {
                        desc: desc.clone(),
                        pipeline: None,
                    },
                );
                vacant.insert(handle);
                handle
            }
        }
    }

    pub fn get_compute(&self, handle: ComputePipelineHandle) -> Arc<ComputePipeline> {
        self.compute_entries
            .get(&handle)
            .unwrap()
            .pipeline
            .clone()
            .unwrap()
    }

    fn load_spirv(shader_root: &Path, source: &ShaderSource) -> anyhow::Result<Vec<u8>> {
        let path = shader_root.join(&source.path);
        std::fs::read(&path)
            .map_err(|err| anyhow::anyhow!("Failed to read shader {:?}: {}", path, err))
    }

    /// Creates any pipelines registered since the last call. Errors here are
    /// fatal: a pass that was just registered has no previous pipeline to
    /// fall back to.
    pub fn prepare_frame(
        &mut self,
        device: &Arc<crate::vulkan::device::Device>,
    ) -> anyhow::Result<()> {
        for entry in self.compute_entries.values_mut() {
            if entry.pipeline.is_none() {
                let spirv = Self::load_spirv(&self.shader_root, &entry.desc.source)?;

                log::trace!("Creating compute pipeline {:?}", entry.desc.source.path);

                entry.pipeline = Some(Arc::new(create_compute_pipeline(
                    device.as_ref(),
                    &spirv,
                    &entry.desc,
                )?));
            }
        }

        Ok(())
    }

    /// Re-reads every shader module from disk and swaps in the new pipelines.
    /// The caller must ensure the GPU is idle. A module that fails to load or
    /// build leaves the previous pipeline in place.
    pub fn refresh(&mut self, device: &Arc<crate::vulkan::device::Device>) {
        for entry in self.compute_entries.values_mut() {
            let reloaded = Self::load_spirv(&self.shader_root, &entry.desc.source)
                .and_then(|spirv| create_compute_pipeline(device.as_ref(), &spirv, &entry.desc));

            match reloaded {
                Ok(pipeline) => {
                    entry.pipeline = Some(Arc::new(pipeline));
                }
                Err(err) => {
                    log::warn!(
                        "Keeping the previous pipeline for {:?}: {}",
                        entry.desc.source.path,
                        err
                    );
                }
            }
        }
    }
}
