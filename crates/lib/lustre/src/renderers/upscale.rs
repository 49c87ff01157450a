//! Edge-aware upscale of the denoised reflection radiance and the additive
//! composite into the caller's color target. This is the one point where
//! the reflection pipeline rejoins the main color buffer; every internal
//! ping-pong is retired by the time it runs.

use lustre_backend::{
    ash::vk,
    vulkan::{buffer::Buffer, image::*},
};
use lustre_rg::{self as rg, SimpleRenderPass};

use crate::config::{ReflectionsConfig, UpscaleMode};

use super::{reflections::INDIRECT_ARGS_APPLY_OFFSET, GbufferDepth};

/// Filter constants for the edge-adaptive spatial upsample, derived once
/// per frame from the viewport/input/output dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct EasuConstants {
    pub con0: [u32; 4],
    pub con1: [u32; 4],
    pub con2: [u32; 4],
    pub con3: [u32; 4],
}

pub fn easu_constants(
    input_viewport: [u32; 2],
    input_size: [u32; 2],
    output_size: [u32; 2],
) -> EasuConstants {
    let [vw, vh] = input_viewport.map(|v| v as f32);
    let [iw, ih] = input_size.map(|v| v as f32);
    let [ow, oh] = output_size.map(|v| v as f32);

    EasuConstants {
        // Output pixel to input pixel scale and offset.
        con0: [
            (vw / ow).to_bits(),
            (vh / oh).to_bits(),
            (0.5 * vw / ow - 0.5).to_bits(),
            (0.5 * vh / oh - 0.5).to_bits(),
        ],
        // Texel size and the first ring of gather offsets.
        con1: [
            (1.0 / iw).to_bits(),
            (1.0 / ih).to_bits(),
            (1.0 / iw).to_bits(),
            (-1.0 / ih).to_bits(),
        ],
        con2: [
            (-1.0 / iw).to_bits(),
            (2.0 / ih).to_bits(),
            (1.0 / iw).to_bits(),
            (2.0 / ih).to_bits(),
        ],
        con3: [0f32.to_bits(), (4.0 / ih).to_bits(), 0, 0],
    }
}

/// Additively composites the reflection contribution into `output_tex`.
#[allow(clippy::too_many_arguments)]
pub fn upscale_and_composite(
    rg: &mut rg::RenderGraph,
    config: &ReflectionsConfig,
    gbuffer_depth: &GbufferDepth,
    radiance_tex: &rg::Handle<Image>,
    indirect_args: &rg::Handle<Buffer>,
    output_tex: &mut rg::Handle<Image>,
    reflection_extent: [u32; 2],
) {
    let output_extent = output_tex.desc().extent_2d();
    let needs_upscale = reflection_extent != output_extent;

    let use_easu = needs_upscale
        && matches!(
            config.upscale_mode,
            UpscaleMode::Fsr | UpscaleMode::FsrWithEdgeCorrection
        );

    if use_easu {
        let constants = easu_constants(reflection_extent, reflection_extent, output_extent);

        // Edge correction consults roughness so rough (already blurry)
        // reflections are not over-sharpened.
        SimpleRenderPass::new_compute(
            rg.add_pass("upscale apply reflections"),
            "upscale/easu_apply.spv",
        )
        .read(radiance_tex)
        .read(&gbuffer_depth.specular_roughness)
        .write(output_tex)
        .constants((
            constants,
            config.upscale_mode as u32,
            config.fsr_roughness_threshold,
        ))
        .dispatch([output_extent[0], output_extent[1], 1]);
    } else {
        // Same-resolution (or point/bilinear) path touches only the
        // classified tiles.
        SimpleRenderPass::new_compute(rg.add_pass("apply reflections"), "upscale/apply.spv")
            .read(radiance_tex)
            .read(&gbuffer_depth.specular_roughness)
            .write(output_tex)
            .constants((config.upscale_mode as u32, config.kernel_flags()))
            .dispatch_indirect(indirect_args, INDIRECT_ARGS_APPLY_OFFSET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn easu_scale_matches_resolution_ratio() {
        let constants = easu_constants([960, 540], [960, 540], [1920, 1080]);

        assert_eq!(f32::from_bits(constants.con0[0]), 0.5);
        assert_eq!(f32::from_bits(constants.con0[1]), 0.5);
        // Half-texel centering offset.
        assert_eq!(f32::from_bits(constants.con0[2]), -0.25);

        assert_eq!(f32::from_bits(constants.con1[0]), 1.0 / 960.0);
        assert_eq!(f32::from_bits(constants.con1[3]), -1.0 / 540.0);
        assert_eq!(f32::from_bits(constants.con2[1]), 2.0 / 540.0);
        assert_eq!(constants.con3[2], 0);
        assert_eq!(constants.con3[3], 0);
    }

    #[test]
    fn identity_upscale_has_unit_scale() {
        let constants = easu_constants([640, 480], [640, 480], [640, 480]);
        assert_eq!(f32::from_bits(constants.con0[0]), 1.0);
        assert_eq!(f32::from_bits(constants.con0[2]), 0.0);
    }
}
