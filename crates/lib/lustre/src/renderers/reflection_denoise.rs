//! Three-pass spatiotemporal denoiser: reproject, prefilter, temporal
//! resolve. Every pass is an indirect dispatch sized by the denoise tile
//! count from classification.

use lustre_backend::{ash::vk, vulkan::image::*};
use lustre_rg::{self as rg, imageops, GetOrCreateTemporal, SimpleRenderPass};

use super::{
    reflections::{TracedReflections, INDIRECT_ARGS_DENOISE_OFFSET, TILE_SIZE},
    GbufferDepth, PingPongTemporalResource,
};

pub struct ReflectionDenoiser {
    radiance_tex: PingPongTemporalResource,
    variance_tex: PingPongTemporalResource,
    sample_count_tex: PingPongTemporalResource,
    avg_radiance_tex: PingPongTemporalResource,
    history_valid: bool,
}

impl ReflectionDenoiser {
    pub fn new() -> Self {
        Self {
            radiance_tex: PingPongTemporalResource::new("denoise.radiance"),
            variance_tex: PingPongTemporalResource::new("denoise.variance"),
            sample_count_tex: PingPongTemporalResource::new("denoise.sample_count"),
            avg_radiance_tex: PingPongTemporalResource::new("denoise.avg_radiance"),
            history_valid: false,
        }
    }

    /// History is garbage on the first frame after creation or a reset;
    /// clearing keeps the reprojection from hallucinating.
    pub fn reset_history(&mut self) {
        self.history_valid = false;
    }

    pub fn denoise(
        &mut self,
        rg: &mut rg::TemporalRenderGraph,
        gbuffer_depth: &GbufferDepth,
        traced: &TracedReflections,
        extent: [u32; 2],
    ) -> rg::Handle<Image> {
        let color_desc = ImageDesc::new_2d(vk::Format::R16G16B16A16_SFLOAT, extent)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE);
        let scalar_desc = ImageDesc::new_2d(vk::Format::R16_SFLOAT, extent)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE);

        let avg_extent = [
            (extent[0] + TILE_SIZE - 1) / TILE_SIZE,
            (extent[1] + TILE_SIZE - 1) / TILE_SIZE,
        ];
        let avg_desc = ImageDesc::new_2d(vk::Format::B10G11R11_UFLOAT_PACK32, avg_extent)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE);

        let (mut radiance_output_tex, mut radiance_history_tex) =
            self.radiance_tex.get_output_and_history(rg, color_desc);
        let (mut variance_output_tex, mut variance_history_tex) =
            self.variance_tex.get_output_and_history(rg, scalar_desc);
        let (mut sample_count_output_tex, mut sample_count_history_tex) = self
            .sample_count_tex
            .get_output_and_history(rg, scalar_desc);
        let (mut avg_radiance_output_tex, mut avg_radiance_history_tex) =
            self.avg_radiance_tex.get_output_and_history(rg, avg_desc);

        let mut reprojected_radiance_tex = rg
            .get_or_create_temporal("denoise.reprojected", color_desc)
            .unwrap();

        if !self.history_valid {
            imageops::clear_color(rg, &mut radiance_history_tex, [0.0; 4]);
            imageops::clear_color(rg, &mut variance_history_tex, [0.0; 4]);
            imageops::clear_color(rg, &mut sample_count_history_tex, [0.0; 4]);
            imageops::clear_color(rg, &mut avg_radiance_history_tex, [0.0; 4]);
            imageops::clear_color(rg, &mut reprojected_radiance_tex, [0.0; 4]);
            self.history_valid = true;
        }

        let half_roughness_tex = gbuffer_depth.half_roughness(rg);

        // The history inputs are last frame's "current" slots; the ping
        // pong index arithmetic alone guarantees that.
        SimpleRenderPass::new_compute(
            rg.add_pass("reproject reflections"),
            "denoise/reproject.spv",
        )
        .read(&traced.denoise_tile_list)
        .read(&traced.radiance_tex)
        .read(&radiance_history_tex)
        .read(&traced.ray_len_tex)
        .read(&gbuffer_depth.motion_vectors)
        .read_aspect(&gbuffer_depth.depth, vk::ImageAspectFlags::DEPTH)
        .read(&gbuffer_depth.normal)
        .read(&*half_roughness_tex)
        .read(&sample_count_history_tex)
        .read(&avg_radiance_history_tex)
        .write(&mut reprojected_radiance_tex)
        .write(&mut avg_radiance_output_tex)
        .write(&mut variance_output_tex)
        .write(&mut sample_count_output_tex)
        .dispatch_indirect(&traced.indirect_args, INDIRECT_ARGS_DENOISE_OFFSET);

        let mut prefiltered_radiance_tex = rg.create(
            ImageDesc::new_2d(vk::Format::R16G16B16A16_SFLOAT, extent)
                .usage(vk::ImageUsageFlags::empty()),
        );

        // Reads the just-written variance/sample targets, writes the
        // opposite ping-pong slot; never filters in place.
        SimpleRenderPass::new_compute(
            rg.add_pass("prefilter reflections"),
            "denoise/prefilter.spv",
        )
        .read(&traced.denoise_tile_list)
        .read(&traced.radiance_tex)
        .read(&avg_radiance_output_tex)
        .read(&variance_output_tex)
        .read(&sample_count_output_tex)
        .read_aspect(&gbuffer_depth.depth, vk::ImageAspectFlags::DEPTH)
        .read(&gbuffer_depth.normal)
        .read(&*half_roughness_tex)
        .write(&mut prefiltered_radiance_tex)
        .write(&mut variance_history_tex)
        .write(&mut sample_count_history_tex)
        .dispatch_indirect(&traced.indirect_args, INDIRECT_ARGS_DENOISE_OFFSET);

        // Blend weight follows per-pixel variance when variance-guided
        // tracing is enabled, a fixed constant otherwise.
        SimpleRenderPass::new_compute(
            rg.add_pass("resolve temporal reflections"),
            "denoise/resolve_temporal.spv",
        )
        .read(&traced.denoise_tile_list)
        .read(&prefiltered_radiance_tex)
        .read(&reprojected_radiance_tex)
        .read(&avg_radiance_output_tex)
        .read(&variance_history_tex)
        .read(&sample_count_history_tex)
        .write(&mut radiance_output_tex)
        .dispatch_indirect(&traced.indirect_args, INDIRECT_ARGS_DENOISE_OFFSET);

        radiance_output_tex
    }
}

impl Default for ReflectionDenoiser {
    fn default() -> Self {
        Self::new()
    }
}
