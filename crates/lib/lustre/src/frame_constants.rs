use glam::{Mat4, Vec4};

use crate::config::ReflectionsConfig;

/// Per-frame GPU constants. Lives at the start of the dynamic constants
/// buffer; layout is shared with the kernels.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct FrameConstants {
    pub inv_view_proj: Mat4,
    pub proj: Mat4,
    pub inv_proj: Mat4,
    pub view: Mat4,
    pub inv_view: Mat4,
    pub prev_view_proj: Mat4,
    pub prev_view: Mat4,

    pub frame_index: u32,
    pub max_traversal_intersections: u32,
    pub min_traversal_occupancy: u32,
    pub most_detailed_mip: u32,

    pub temporal_stability_factor: f32,
    pub ssr_confidence_threshold: f32,
    pub depth_buffer_thickness: f32,
    pub roughness_threshold: f32,

    pub samples_per_quad: u32,
    pub temporal_variance_guided_tracing_enabled: u32,
    pub flags: u32,
    pub simulation_time: f32,

    // Screen-space xy to reflection-resolution uv, accounting for the
    // cut-off pixels when the reflection target is not an exact fraction.
    pub x_to_u_factor: f32,
    pub max_history_samples: u32,
    pub y_to_v_factor: f32,
    pub history_clip_weight: f32,

    pub base_width: u32,
    pub base_height: u32,
    pub reflection_width: u32,
    pub reflection_height: u32,

    pub hybrid_miss_weight: f32,
    pub max_raytraced_distance: f32,
    pub hybrid_spawn_rate: f32,
    pub reflections_backfacing_threshold: f32,

    pub depth_similarity_sigma: f32,
    pub reflections_upscale_mode: u32,
    pub random_samples_per_pixel: u32,
    pub vrt_variance_threshold: f32,

    pub ssr_thickness_length_factor: f32,
    pub fsr_roughness_threshold: f32,
    pub ray_length_exp_factor: f32,
    pub reflection_factor: f32,

    pub rt_roughness_threshold: f32,
    pub camera_position: [f32; 3],

    pub ibl_factor: f32,
    pub emissive_factor: f32,
    pub inv_screen_resolution: [f32; 2],
}

// The classifier pads the reflection target out to whole 8x8 tiles; uv
// factors must map against the padded extent or the last tile row smears.
fn round_up_to_tile(x: u32) -> u32 {
    ((x + 7) / 8) * 8
}

/// Camera state sampled by the caller each frame.
#[derive(Clone, Copy)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub proj: Mat4,
    pub prev_view: Mat4,
    pub prev_proj: Mat4,
}

impl CameraMatrices {
    pub fn position(&self) -> Vec4 {
        self.view.inverse().col(3)
    }
}

impl FrameConstants {
    pub fn new(
        config: &ReflectionsConfig,
        camera: &CameraMatrices,
        base_extent: [u32; 2],
        reflection_extent: [u32; 2],
        frame_index: u32,
        simulation_time: f32,
    ) -> Self {
        let view_proj = camera.proj * camera.view;
        let prev_view_proj = camera.prev_proj * camera.prev_view;

        Self {
            inv_view_proj: view_proj.inverse(),
            proj: camera.proj,
            inv_proj: camera.proj.inverse(),
            view: camera.view,
            inv_view: camera.view.inverse(),
            prev_view_proj,
            prev_view: camera.prev_view,

            frame_index,
            max_traversal_intersections: config.max_traversal_iterations,
            min_traversal_occupancy: config.min_traversal_occupancy,
            most_detailed_mip: config.most_detailed_mip,

            temporal_stability_factor: config.temporal_stability_factor,
            ssr_confidence_threshold: config.ssr_confidence_threshold,
            depth_buffer_thickness: config.depth_buffer_thickness,
            roughness_threshold: config.roughness_threshold,

            samples_per_quad: config.samples_per_quad,
            temporal_variance_guided_tracing_enabled: config.temporal_variance_guided_tracing
                as u32,
            flags: config.kernel_flags(),
            simulation_time,

            x_to_u_factor: 1.0 / (round_up_to_tile(reflection_extent[0]) as f32),
            max_history_samples: config.max_history_samples,
            y_to_v_factor: 1.0 / (round_up_to_tile(reflection_extent[1]) as f32),
            history_clip_weight: config.history_clip_weight,

            base_width: base_extent[0],
            base_height: base_extent[1],
            reflection_width: reflection_extent[0],
            reflection_height: reflection_extent[1],

            hybrid_miss_weight: config.hybrid.miss_weight,
            max_raytraced_distance: config.max_raytraced_distance,
            hybrid_spawn_rate: config.hybrid.spawn_rate,
            reflections_backfacing_threshold: config.reflections_backfacing_threshold,

            depth_similarity_sigma: config.depth_similarity_sigma,
            reflections_upscale_mode: config.upscale_mode as u32,
            random_samples_per_pixel: config.random_samples_per_pixel,
            vrt_variance_threshold: config.variance_threshold,

            ssr_thickness_length_factor: config.ssr_thickness_length_factor,
            fsr_roughness_threshold: config.fsr_roughness_threshold,
            ray_length_exp_factor: config.ray_length_exp_factor,
            reflection_factor: config.reflection_factor,

            rt_roughness_threshold: config.rt_roughness_threshold,
            camera_position: camera.position().truncate().to_array(),

            ibl_factor: 1.0,
            emissive_factor: 1.0,
            inv_screen_resolution: [
                1.0 / base_extent[0] as f32,
                1.0 / base_extent[1] as f32,
            ],
        }
    }
}
