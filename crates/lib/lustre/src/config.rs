//! Runtime configuration for the reflections pipeline, and the kernel
//! flag word derived from it.

pub const KERNEL_FLAG_USE_HIT_COUNTER: u32 = 1 << 0;
pub const KERNEL_FLAG_USE_SCREEN_SPACE: u32 = 1 << 1;
pub const KERNEL_FLAG_USE_RAY_TRACING: u32 = 1 << 2;
pub const KERNEL_FLAG_RESOLVE_TRANSPARENT: u32 = 1 << 3;
pub const KERNEL_FLAG_SHADING_USE_SCREEN: u32 = 1 << 5;
pub const KERNEL_FLAG_SHOW_DEBUG_TARGET: u32 = 1 << 13;
pub const KERNEL_FLAG_SHOW_INTERSECTION: u32 = 1 << 14;
pub const KERNEL_FLAG_SHOW_REFLECTION_TARGET: u32 = 1 << 15;
pub const KERNEL_FLAG_APPLY_REFLECTIONS: u32 = 1 << 16;
pub const KERNEL_FLAG_INTERSECTION_ACCUMULATE: u32 = 1 << 17;
pub const KERNEL_FLAG_VISUALIZE_WAVES: u32 = 1 << 18;
pub const KERNEL_FLAG_VISUALIZE_AVG_RADIANCE: u32 = 1 << 19;
pub const KERNEL_FLAG_VISUALIZE_VARIANCE: u32 = 1 << 20;
pub const KERNEL_FLAG_VISUALIZE_NUM_SAMPLES: u32 = 1 << 21;
pub const KERNEL_FLAG_VISUALIZE_RAY_LENGTH: u32 = 1 << 23;
pub const KERNEL_FLAG_VISUALIZE_REPROJECTION: u32 = 1 << 25;
pub const KERNEL_FLAG_VISUALIZE_TRANSPARENT_QUERY: u32 = 1 << 26;
pub const KERNEL_FLAG_VISUALIZE_HIT_COUNTER: u32 = 1 << 27;
pub const KERNEL_FLAG_VISUALIZE_PRIMARY_RAYS: u32 = 1 << 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum UpscaleMode {
    Point = 0,
    Bilinear = 1,
    Fsr = 2,
    FsrWithEdgeCorrection = 3,
}

/// Debug visualization selector. `None` renders normally; everything else
/// replaces the composited output with the named view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugView {
    None,
    Intersection,
    ReflectionTarget,
    Waves,
    AverageRadiance,
    Variance,
    NumSamples,
    RayLength,
    Reprojection,
    TransparentQuery,
    HitCounter,
    PrimaryRays,
}

impl Default for DebugView {
    fn default() -> Self {
        Self::None
    }
}

impl DebugView {
    fn flag_bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Intersection => KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_SHOW_INTERSECTION,
            Self::ReflectionTarget => {
                KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_SHOW_REFLECTION_TARGET
            }
            Self::Waves => KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_WAVES,
            Self::AverageRadiance => {
                KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_AVG_RADIANCE
            }
            Self::Variance => KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_VARIANCE,
            Self::NumSamples => KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_NUM_SAMPLES,
            Self::RayLength => KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_RAY_LENGTH,
            Self::Reprojection => {
                KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_REPROJECTION
            }
            Self::TransparentQuery => {
                KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_TRANSPARENT_QUERY
            }
            Self::HitCounter => KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_HIT_COUNTER,
            Self::PrimaryRays => {
                KERNEL_FLAG_SHOW_DEBUG_TARGET | KERNEL_FLAG_VISUALIZE_PRIMARY_RAYS
            }
        }
    }
}

/// Policy for promoting screen-space misses to hardware rays. Carried in
/// frame constants so the kernels stay policy-free.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridPromotion {
    /// Weight given to the partial screen-space march when its ray respawns
    /// as a hardware ray. Zero discards the screen-space contribution.
    pub miss_weight: f32,
    /// Fraction of screen-space misses promoted to hardware rays.
    pub spawn_rate: f32,
}

impl Default for HybridPromotion {
    fn default() -> Self {
        Self {
            miss_weight: 0.5,
            spawn_rate: 0.02,
        }
    }
}

/// Full configuration surface of the reflections pipeline.
///
/// Disabling both tracing lanes is valid; the classifier then produces
/// empty ray lists and the composite contributes zero radiance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReflectionsConfig {
    pub enable_screen_space_tracing: bool,
    pub enable_hardware_tracing: bool,
    pub enable_hit_counter_feedback: bool,
    pub resolve_transparent: bool,
    pub shade_hits_from_screen: bool,
    pub apply_reflections: bool,
    pub accumulate_intersection_output: bool,

    /// Pixels rougher than this are excluded from reflections entirely.
    pub roughness_threshold: f32,
    /// Pixels rougher than this never take the hardware lane.
    pub rt_roughness_threshold: f32,
    /// Above this roughness the edge-aware upscale falls back to bilinear.
    pub fsr_roughness_threshold: f32,

    pub max_traversal_iterations: u32,
    pub min_traversal_occupancy: u32,
    pub most_detailed_mip: u32,
    pub samples_per_quad: u32,
    pub random_samples_per_pixel: u32,
    pub depth_buffer_thickness: f32,
    pub ssr_confidence_threshold: f32,
    pub ssr_thickness_length_factor: f32,
    pub reflections_backfacing_threshold: f32,
    pub depth_similarity_sigma: f32,

    pub temporal_stability_factor: f32,
    pub history_clip_weight: f32,
    pub max_history_samples: u32,
    pub temporal_variance_guided_tracing: bool,
    pub variance_threshold: f32,

    pub hybrid: HybridPromotion,
    pub max_raytraced_distance: f32,
    pub ray_length_exp_factor: f32,
    pub reflection_factor: f32,

    /// Reflection targets are `base * scale`, rounded down. Ignored when
    /// `optimized_downsample` selects the fixed half-resolution path.
    pub reflection_resolution_scale: f32,
    pub optimized_downsample: bool,
    pub upscale_mode: UpscaleMode,

    pub debug_view: DebugView,
}

impl Default for ReflectionsConfig {
    fn default() -> Self {
        Self {
            enable_screen_space_tracing: true,
            enable_hardware_tracing: true,
            enable_hit_counter_feedback: true,
            resolve_transparent: false,
            shade_hits_from_screen: true,
            apply_reflections: true,
            accumulate_intersection_output: false,

            roughness_threshold: 0.22,
            rt_roughness_threshold: 0.22,
            fsr_roughness_threshold: 0.03,

            max_traversal_iterations: 128,
            min_traversal_occupancy: 4,
            most_detailed_mip: 0,
            samples_per_quad: 1,
            random_samples_per_pixel: 32,
            depth_buffer_thickness: 0.015,
            ssr_confidence_threshold: 0.9,
            ssr_thickness_length_factor: 0.01,
            reflections_backfacing_threshold: 0.0,
            depth_similarity_sigma: 1.0,

            temporal_stability_factor: 0.7,
            history_clip_weight: 0.1,
            max_history_samples: 32,
            temporal_variance_guided_tracing: true,
            variance_threshold: 0.02,

            hybrid: HybridPromotion::default(),
            max_raytraced_distance: 100.0,
            ray_length_exp_factor: 5.0,
            reflection_factor: 1.3,

            reflection_resolution_scale: 1.0,
            optimized_downsample: false,
            upscale_mode: UpscaleMode::FsrWithEdgeCorrection,

            debug_view: DebugView::None,
        }
    }
}

impl ReflectionsConfig {
    /// Packs the enable switches and the debug selector into the mask the
    /// kernels branch on.
    pub fn kernel_flags(&self) -> u32 {
        let mut flags = 0;

        if self.enable_hit_counter_feedback {
            flags |= KERNEL_FLAG_USE_HIT_COUNTER;
        }
        if self.enable_screen_space_tracing {
            flags |= KERNEL_FLAG_USE_SCREEN_SPACE;
        }
        if self.enable_hardware_tracing {
            flags |= KERNEL_FLAG_USE_RAY_TRACING;
        }
        if self.resolve_transparent {
            flags |= KERNEL_FLAG_RESOLVE_TRANSPARENT;
        }
        if self.shade_hits_from_screen {
            flags |= KERNEL_FLAG_SHADING_USE_SCREEN;
        }
        if self.apply_reflections {
            flags |= KERNEL_FLAG_APPLY_REFLECTIONS;
        }
        if self.accumulate_intersection_output {
            flags |= KERNEL_FLAG_INTERSECTION_ACCUMULATE;
        }

        flags | self.debug_view.flag_bits()
    }

    pub fn reflection_extent(&self, base: [u32; 2]) -> [u32; 2] {
        if self.optimized_downsample {
            [(base[0] / 2).max(1), (base[1] / 2).max(1)]
        } else {
            let w = (base[0] as f32 * self.reflection_resolution_scale) as u32;
            let h = (base[1] as f32 * self.reflection_resolution_scale) as u32;
            [w.max(1), h.max(1)]
        }
    }
}

/// Specialization axes of the intersection pipelines. Each combination is a
/// separate pipeline so the kernels carry no runtime branches on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipelineVariant {
    pub debug_output: bool,
    pub resolve_transparent: bool,
    pub shade_from_screen: bool,
    pub upscaled: bool,
}

impl PipelineVariant {
    pub const COUNT: usize = 16;

    pub fn from_config(config: &ReflectionsConfig) -> Self {
        Self {
            debug_output: config.debug_view != DebugView::None,
            resolve_transparent: config.resolve_transparent,
            shade_from_screen: config.shade_hits_from_screen,
            upscaled: config.reflection_resolution_scale < 1.0 || config.optimized_downsample,
        }
    }

    pub fn index(self) -> usize {
        (self.debug_output as usize)
            | (self.resolve_transparent as usize) << 1
            | (self.shade_from_screen as usize) << 2
            | (self.upscaled as usize) << 3
    }

    pub fn from_index(index: usize) -> Self {
        assert!(index < Self::COUNT);
        Self {
            debug_output: index & 1 != 0,
            resolve_transparent: index & 2 != 0,
            shade_from_screen: index & 4 != 0,
            upscaled: index & 8 != 0,
        }
    }

    /// All sixteen combinations, in index order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..Self::COUNT).map(Self::from_index)
    }

    /// Path of the kernel binary compiled for this variant. The shader build
    /// emits one `.spv` per variant index, `<stem>.v<index>.spv`.
    pub fn kernel_path(self, stem: &str) -> String {
        format!("reflections/{}.v{}.spv", stem, self.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_table_is_exhaustive() {
        let variants: Vec<_> = PipelineVariant::all().collect();
        assert_eq!(variants.len(), PipelineVariant::COUNT);

        for (idx, variant) in variants.iter().enumerate() {
            assert_eq!(variant.index(), idx);
            assert_eq!(PipelineVariant::from_index(idx), *variant);
        }

        // No two variants collapse to the same index.
        for a in PipelineVariant::all() {
            for b in PipelineVariant::all() {
                if a != b {
                    assert_ne!(a.index(), b.index());
                }
            }
        }
    }

    #[test]
    fn variant_selects_kernel_binary() {
        let config = ReflectionsConfig::default();
        let variant = PipelineVariant::from_config(&config);
        assert_eq!(
            variant.kernel_path("intersect_hardware"),
            format!("reflections/intersect_hardware.v{}.spv", variant.index())
        );

        let mut transparent = config;
        transparent.resolve_transparent = true;
        assert_ne!(
            PipelineVariant::from_config(&transparent).kernel_path("shade_hits"),
            variant.kernel_path("shade_hits")
        );

        let mut downsampled = config;
        downsampled.optimized_downsample = true;
        assert!(PipelineVariant::from_config(&downsampled).upscaled);
    }

    #[test]
    fn kernel_flags_reflect_enables() {
        let mut config = ReflectionsConfig::default();
        config.enable_screen_space_tracing = true;
        config.enable_hardware_tracing = false;
        config.enable_hit_counter_feedback = false;
        config.debug_view = DebugView::None;

        let flags = config.kernel_flags();
        assert_ne!(flags & KERNEL_FLAG_USE_SCREEN_SPACE, 0);
        assert_eq!(flags & KERNEL_FLAG_USE_RAY_TRACING, 0);
        assert_eq!(flags & KERNEL_FLAG_USE_HIT_COUNTER, 0);

        config.debug_view = DebugView::Variance;
        let flags = config.kernel_flags();
        assert_ne!(flags & KERNEL_FLAG_SHOW_DEBUG_TARGET, 0);
        assert_ne!(flags & KERNEL_FLAG_VISUALIZE_VARIANCE, 0);
    }

    #[test]
    fn upscale_modes_have_stable_values() {
        assert_eq!(UpscaleMode::Point as u32, 0);
        assert_eq!(UpscaleMode::Bilinear as u32, 1);
        assert_eq!(UpscaleMode::Fsr as u32, 2);
        assert_eq!(UpscaleMode::FsrWithEdgeCorrection as u32, 3);
    }

    #[test]
    fn reflection_extent_never_zero() {
        let mut config = ReflectionsConfig::default();
        config.reflection_resolution_scale = 0.25;
        assert_eq!(config.reflection_extent([1920, 1080]), [480, 270]);

        config.optimized_downsample = true;
        assert_eq!(config.reflection_extent([1920, 1080]), [960, 540]);
        assert_eq!(config.reflection_extent([1, 1]), [1, 1]);
    }
}
