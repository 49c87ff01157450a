//! Tile classification, ray-list compaction, indirect-argument preparation,
//! and the hybrid intersection passes.

use lustre_backend::{
    ash::vk,
    vulkan::{buffer::*, image::*, ray_tracing::RayTracingAcceleration},
};
use lustre_rg::{self as rg, imageops, SimpleRenderPass};

use crate::config::{DebugView, PipelineVariant, ReflectionsConfig};

use super::{GbufferDepth, PingPongTemporalResource};

pub const TILE_SIZE: u32 = 8;
pub const RAY_GROUP_WIDTH: u32 = 64;

/// Ray counter buffer layout: six contiguous u32 counters.
pub const RAY_COUNTER_SW_OFFSET: usize = 0;
pub const RAY_COUNTER_SW_HISTORY_OFFSET: usize = 4;
pub const RAY_COUNTER_DENOISE_OFFSET: usize = 8;
pub const RAY_COUNTER_DENOISE_HISTORY_OFFSET: usize = 12;
pub const RAY_COUNTER_HW_OFFSET: usize = 16;
pub const RAY_COUNTER_HW_HISTORY_OFFSET: usize = 20;
pub const RAY_COUNTER_BYTES: usize = 24;

/// Dispatch-argument triples, by byte offset.
pub const INDIRECT_ARGS_SW_OFFSET: u64 = 0;
pub const INDIRECT_ARGS_DENOISE_OFFSET: u64 = 12;
pub const INDIRECT_ARGS_APPLY_OFFSET: u64 = 24;
pub const INDIRECT_ARGS_HW_OFFSET: u64 = 36;
pub const INDIRECT_ARGS_BYTES: usize = 48;

/// Host mirror of the per-pixel routing decision in the classify kernel.
/// Pure: list membership depends only on these inputs, never on the lists
/// themselves, so the membership sets are deterministic even though the
/// compaction order is not.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationInput {
    pub roughness: f32,
    pub roughness_threshold: f32,
    pub rt_roughness_threshold: f32,
    pub screen_space_enabled: bool,
    pub hardware_enabled: bool,
    pub hit_counter_feedback: bool,
    /// Hit-counter history: this pixel's tile saw screen-space hits
    /// recently, so retrying in screen space is likely to pay off.
    pub recent_screen_space_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PixelLists {
    pub software: bool,
    pub hardware: bool,
    pub denoise: bool,
}

pub fn classify_pixel(input: &ClassificationInput) -> PixelLists {
    if input.roughness > input.roughness_threshold {
        return PixelLists::default();
    }

    let allow_hardware =
        input.hardware_enabled && input.roughness <= input.rt_roughness_threshold;

    let take_software = input.screen_space_enabled
        && (!allow_hardware || !input.hit_counter_feedback || input.recent_screen_space_hit);

    let software = take_software;
    let hardware = allow_hardware && !take_software;

    PixelLists {
        software,
        hardware,
        denoise: software || hardware,
    }
}

/// Host mirror of the prepare-indirect-args kernels: counters in, four
/// dispatch triples out, in [sw, denoise, apply, hw] order.
pub fn indirect_args_from_counters(counters: &[u32; 6]) -> [[u32; 3]; 4] {
    let ray_groups = |count: u32| (count + RAY_GROUP_WIDTH - 1) / RAY_GROUP_WIDTH;

    let sw_count = counters[RAY_COUNTER_SW_OFFSET / 4];
    let denoise_count = counters[RAY_COUNTER_DENOISE_OFFSET / 4];
    let hw_count = counters[RAY_COUNTER_HW_OFFSET / 4];

    [
        [ray_groups(sw_count), 1, 1],
        // One 8x8 group per denoise tile.
        [denoise_count, 1, 1],
        [denoise_count, 1, 1],
        [ray_groups(hw_count), 1, 1],
    ]
}

pub struct TracedReflections {
    pub radiance_tex: rg::Handle<Image>,
    pub ray_len_tex: rg::Handle<Image>,
    pub sample_count_tex: rg::Handle<Image>,
    pub ray_counters: rg::Handle<Buffer>,
    pub indirect_args: rg::Handle<Buffer>,
    pub denoise_tile_list: rg::Handle<Buffer>,
    pub debug_tex: Option<rg::Handle<Image>>,
}

pub struct ReflectionsRenderer {
    hit_counter_tex: PingPongTemporalResource,
}

impl ReflectionsRenderer {
    pub fn new() -> Self {
        Self {
            hit_counter_tex: PingPongTemporalResource::new("reflections.hit_counter"),
        }
    }

    fn tile_extent(extent: [u32; 2]) -> [u32; 2] {
        [
            (extent[0] + TILE_SIZE - 1) / TILE_SIZE,
            (extent[1] + TILE_SIZE - 1) / TILE_SIZE,
        ]
    }

    #[allow(clippy::too_many_arguments)]
    pub fn trace(
        &mut self,
        rg: &mut rg::TemporalRenderGraph,
        config: &ReflectionsConfig,
        gbuffer_depth: &GbufferDepth,
        screen_color: &rg::Handle<Image>,
        blue_noise_tex: &rg::Handle<Image>,
        bindless_descriptor_set: vk::DescriptorSet,
        tlas: Option<&rg::Handle<RayTracingAcceleration>>,
        transparent_tlas: Option<&rg::Handle<RayTracingAcceleration>>,
        extent: [u32; 2],
    ) -> TracedReflections {
        let tile_extent = Self::tile_extent(extent);
        let num_pixels = (extent[0] * extent[1]) as usize;
        let num_tiles = (tile_extent[0] * tile_extent[1]) as usize;

        let mut ray_counters = rg.create(BufferDesc::new_gpu_only(
            RAY_COUNTER_BYTES,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        ));
        imageops::fill_buffer(rg, &mut ray_counters, 0);

        let mut indirect_args = rg.create(BufferDesc::new_gpu_only(
            INDIRECT_ARGS_BYTES,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER,
        ));

        let mut sw_ray_list = rg.create(BufferDesc::new_gpu_only(
            num_pixels * 4,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ));
        let mut hw_ray_list = rg.create(BufferDesc::new_gpu_only(
            num_pixels * 4,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ));
        let mut denoise_tile_list = rg.create(BufferDesc::new_gpu_only(
            num_tiles * 4,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ));

        // Hardware hits are shaded deferred from this list.
        let mut ray_gbuffer_list = rg.create(BufferDesc::new_gpu_only(
            num_pixels * 32,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ));

        let mut radiance_tex = rg.create(
            ImageDesc::new_2d(vk::Format::R16G16B16A16_SFLOAT, extent)
                .usage(vk::ImageUsageFlags::empty()),
        );
        // Scalar fp16 on purpose: the denoiser is bandwidth bound and the
        // precision loss is part of the behavior contract.
        let mut ray_len_tex = rg.create(
            ImageDesc::new_2d(vk::Format::R16_SFLOAT, extent).usage(vk::ImageUsageFlags::empty()),
        );
        let mut sample_count_tex = rg.create(
            ImageDesc::new_2d(vk::Format::R16_SFLOAT, extent).usage(vk::ImageUsageFlags::empty()),
        );

        let (mut hit_counter_tex, hit_counter_history_tex) =
            self.hit_counter_tex.get_output_and_history(
                rg,
                ImageDesc::new_2d(vk::Format::R32_UINT, tile_extent)
                    .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE),
            );

        let half_roughness_tex = gbuffer_depth.half_roughness(rg);

        // The specialization axes pick prebuilt kernel binaries; the flag
        // word only covers the switches that stay runtime branches.
        let variant = PipelineVariant::from_config(config);

        SimpleRenderPass::new_compute(
            rg.add_pass("classify tiles"),
            &variant.kernel_path("classify_tiles"),
        )
        .read(&gbuffer_depth.specular_roughness)
        .read(&hit_counter_history_tex)
        .write(&mut sw_ray_list)
        .write(&mut hw_ray_list)
        .write(&mut denoise_tile_list)
        .write(&mut ray_counters)
        .write(&mut hit_counter_tex)
        .constants((extent[0], extent[1], config.kernel_flags()))
        .dispatch([extent[0], extent[1], 1]);

        SimpleRenderPass::new_compute(
            rg.add_pass("prepare indirect args (sw)"),
            "reflections/prepare_indirect_args.spv",
        )
        .read(&ray_counters)
        .write(&mut indirect_args)
        .dispatch([1, 1, 1]);

        // The downsampled path marches against the extracted half-res depth;
        // at full reflection resolution the raw depth plane is sampled.
        let half_depth_tex = config
            .optimized_downsample
            .then(|| gbuffer_depth.half_depth(rg));

        if config.enable_screen_space_tracing {
            // Misses respawn into the hw ray list when hybrid mode is on.
            let march = SimpleRenderPass::new_compute(
                rg.add_pass("screen space march"),
                &variant.kernel_path("intersect_screen_space"),
            )
            .read(&sw_ray_list);

            let march = match &half_depth_tex {
                Some(half_depth) => march.read(&**half_depth),
                None => march.read_aspect(&gbuffer_depth.depth, vk::ImageAspectFlags::DEPTH),
            };

            march
                .read(&gbuffer_depth.normal)
                .read(&*half_roughness_tex)
                .read(screen_color)
                .read(blue_noise_tex)
                .write(&mut radiance_tex)
                .write(&mut ray_len_tex)
                .write(&mut sample_count_tex)
                .write(&mut hw_ray_list)
                .write_no_sync(&mut ray_counters)
                .write_no_sync(&mut hit_counter_tex)
                .raw_descriptor_set(1, bindless_descriptor_set)
                .dispatch_indirect(&indirect_args, INDIRECT_ARGS_SW_OFFSET);
        }

        let hardware_enabled = config.enable_hardware_tracing && tlas.is_some();

        if hardware_enabled {
            // The hw counter may have grown during the march; its dispatch
            // args are only valid if rebuilt afterwards. The graph inserts
            // the unordered-access to indirect-argument transition when the
            // indirect dispatch consumes the buffer again.
            SimpleRenderPass::new_compute(
                rg.add_pass("prepare indirect args (hw)"),
                "reflections/prepare_indirect_args_hw.spv",
            )
            .read(&ray_counters)
            .write(&mut indirect_args)
            .dispatch([1, 1, 1]);

            let tlas = tlas.unwrap();

            let trace = SimpleRenderPass::new_compute(
                rg.add_pass("hardware trace"),
                &variant.kernel_path("intersect_hardware"),
            )
            .read(&hw_ray_list);

            let trace = match &half_depth_tex {
                Some(half_depth) => trace.read(&**half_depth),
                None => trace.read_aspect(&gbuffer_depth.depth, vk::ImageAspectFlags::DEPTH),
            };

            let mut trace = trace
                .read(&gbuffer_depth.normal)
            .read(&*half_roughness_tex)
            .read(blue_noise_tex)
            .tlas(tlas)
            .write(&mut ray_gbuffer_list)
            .write(&mut ray_len_tex)
            .raw_descriptor_set(1, bindless_descriptor_set);

            if let Some(transparent_tlas) = transparent_tlas.filter(|_| config.resolve_transparent)
            {
                trace = trace.tlas(transparent_tlas);
            }

            trace.dispatch_indirect(&indirect_args, INDIRECT_ARGS_HW_OFFSET);

            SimpleRenderPass::new_compute(
                rg.add_pass("shade hardware hits"),
                &variant.kernel_path("shade_hits"),
            )
            .read(&hw_ray_list)
            .read(&ray_gbuffer_list)
            .read(screen_color)
            .write(&mut radiance_tex)
            .write_no_sync(&mut sample_count_tex)
            .raw_descriptor_set(1, bindless_descriptor_set)
            .dispatch_indirect(&indirect_args, INDIRECT_ARGS_HW_OFFSET);
        }

        let debug_tex = (config.debug_view != DebugView::None).then(|| {
            let mut debug_tex = rg
                .get_or_create_temporal(
                    "reflections.debug",
                    ImageDesc::new_2d(vk::Format::R32G32B32A32_SFLOAT, extent)
                        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::STORAGE),
                )
                .unwrap();

            SimpleRenderPass::new_compute(
                rg.add_pass("debug accumulate"),
                "reflections/debug_accumulate.spv",
            )
            .read(&radiance_tex)
            .read(&ray_len_tex)
            .read(&sample_count_tex)
            .read(&hit_counter_tex)
            .read(&ray_counters)
            .write(&mut debug_tex)
            .constants(config.kernel_flags())
            .dispatch([extent[0], extent[1], 1]);

            debug_tex
        });

        TracedReflections {
            radiance_tex,
            ray_len_tex,
            sample_count_tex,
            ray_counters,
            indirect_args,
            denoise_tile_list,
            debug_tex,
        }
    }
}

impl Default for ReflectionsRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> ClassificationInput {
        ClassificationInput {
            roughness: 0.1,
            roughness_threshold: 0.22,
            rt_roughness_threshold: 0.22,
            screen_space_enabled: true,
            hardware_enabled: true,
            hit_counter_feedback: true,
            recent_screen_space_hit: false,
        }
    }

    #[test]
    fn counter_offsets_are_contiguous() {
        assert_eq!(RAY_COUNTER_SW_OFFSET, 0);
        assert_eq!(RAY_COUNTER_SW_HISTORY_OFFSET, 4);
        assert_eq!(RAY_COUNTER_DENOISE_OFFSET, 8);
        assert_eq!(RAY_COUNTER_DENOISE_HISTORY_OFFSET, 12);
        assert_eq!(RAY_COUNTER_HW_OFFSET, 16);
        assert_eq!(RAY_COUNTER_HW_HISTORY_OFFSET, 20);
        assert_eq!(RAY_COUNTER_BYTES, 24);

        assert_eq!(INDIRECT_ARGS_SW_OFFSET, 0);
        assert_eq!(INDIRECT_ARGS_DENOISE_OFFSET, 12);
        assert_eq!(INDIRECT_ARGS_APPLY_OFFSET, 24);
        assert_eq!(INDIRECT_ARGS_HW_OFFSET, 36);
    }

    #[test]
    fn rough_pixels_are_excluded_entirely() {
        let input = ClassificationInput {
            roughness: 0.5,
            ..base_input()
        };
        assert_eq!(classify_pixel(&input), PixelLists::default());
    }

    #[test]
    fn classification_is_deterministic() {
        let input = base_input();
        let first = classify_pixel(&input);
        for _ in 0..16 {
            assert_eq!(classify_pixel(&input), first);
        }
    }

    #[test]
    fn hardware_only_routing() {
        // Smooth pixel, hardware lane on, screen space off: every pixel
        // lands on the hardware list and none on the software list.
        let input = ClassificationInput {
            screen_space_enabled: false,
            ..base_input()
        };

        for _pixel in 0..64 {
            let lists = classify_pixel(&input);
            assert!(lists.hardware);
            assert!(!lists.software);
            assert!(lists.denoise);
        }
    }

    #[test]
    fn hit_history_prefers_screen_space() {
        let miss_history = classify_pixel(&base_input());
        assert!(miss_history.hardware);
        assert!(!miss_history.software);

        let hit_history = classify_pixel(&ClassificationInput {
            recent_screen_space_hit: true,
            ..base_input()
        });
        assert!(hit_history.software);
        assert!(!hit_history.hardware);

        // Without feedback, screen space always goes first.
        let no_feedback = classify_pixel(&ClassificationInput {
            hit_counter_feedback: false,
            ..base_input()
        });
        assert!(no_feedback.software);
    }

    #[test]
    fn both_lanes_disabled_yields_empty_lists() {
        let lists = classify_pixel(&ClassificationInput {
            screen_space_enabled: false,
            hardware_enabled: false,
            ..base_input()
        });
        assert_eq!(lists, PixelLists::default());
    }

    #[test]
    fn indirect_args_round_up_ray_groups() {
        let args = indirect_args_from_counters(&[65, 0, 10, 0, 64, 0]);
        assert_eq!(args[0], [2, 1, 1]);
        assert_eq!(args[1], [10, 1, 1]);
        assert_eq!(args[2], [10, 1, 1]);
        assert_eq!(args[3], [1, 1, 1]);

        let empty = indirect_args_from_counters(&[0; 6]);
        assert_eq!(empty, [[0, 1, 1], [0, 1, 1], [0, 1, 1], [0, 1, 1]]);
    }
}
