//! Low-discrepancy sampling tables for the stochastic ray directions:
//! sobol + ranking/scrambling tiles uploaded once, and a small random
//! texture regenerated each frame from the frame index.

use std::sync::Arc;

use lustre_backend::{
    ash::vk,
    vk_sync,
    vulkan::{buffer::*, image::*},
    BackendError, Device,
};
use lustre_rg::{self as rg, SimpleRenderPass};

use blue_noise_sampler::spp64::*;

pub const RANDOM_IMAGE_EXTENT: [u32; 2] = [128, 128];

fn as_byte_slice_unchecked<T: Copy>(v: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(v.as_ptr() as *const u8, v.len() * std::mem::size_of::<T>())
    }
}

fn make_lut_buffer<T: Copy>(device: &Device, v: &[T]) -> Result<Arc<Buffer>, BackendError> {
    Ok(Arc::new(device.create_buffer(
        BufferDesc::new_gpu_only(
            v.len() * std::mem::size_of::<T>(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ),
        "lut buffer",
        Some(as_byte_slice_unchecked(v)),
    )?))
}

pub struct BlueNoiseSampler {
    sobol_buf: Arc<Buffer>,
    ranking_tile_buf: Arc<Buffer>,
    scrambling_tile_buf: Arc<Buffer>,
}

impl BlueNoiseSampler {
    pub fn new(device: &Device) -> Result<Self, BackendError> {
        Ok(Self {
            sobol_buf: make_lut_buffer(device, SOBOL)?,
            ranking_tile_buf: make_lut_buffer(device, RANKING_TILE)?,
            scrambling_tile_buf: make_lut_buffer(device, SCRAMBLING_TILE)?,
        })
    }

    /// Writes this frame's window of the blue-noise sequence into a small
    /// R8G8 texture sampled toroidally by the intersection kernels.
    pub fn prepare_frame(&self, rg: &mut rg::TemporalRenderGraph) -> rg::Handle<Image> {
        let sobol_buf = rg.import(
            self.sobol_buf.clone(),
            vk_sync::AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer,
        );
        let ranking_tile_buf = rg.import(
            self.ranking_tile_buf.clone(),
            vk_sync::AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer,
        );
        let scrambling_tile_buf = rg.import(
            self.scrambling_tile_buf.clone(),
            vk_sync::AccessType::ComputeShaderReadSampledImageOrUniformTexelBuffer,
        );

        let mut random_tex = rg.create(ImageDesc::new_2d(
            vk::Format::R8G8_UNORM,
            RANDOM_IMAGE_EXTENT,
        ));

        SimpleRenderPass::new_compute(
            rg.add_pass("prepare blue noise"),
            "sampling/prepare_blue_noise.spv",
        )
        .read(&sobol_buf)
        .read(&ranking_tile_buf)
        .read(&scrambling_tile_buf)
        .write(&mut random_tex)
        .dispatch([RANDOM_IMAGE_EXTENT[0], RANDOM_IMAGE_EXTENT[1], 1]);

        random_tex
    }
}
