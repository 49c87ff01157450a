//! Acceleration-structure bookkeeping: a content-addressed BLAS cache, the
//! skinned-set registry, per-visibility-class TLASes, and the pure rebuild
//! decision the per-instance update is driven by.

use std::{
    collections::{HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::Arc,
};

use anyhow::Context;
use glam::Affine3A;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use lustre_backend::{
    vk_sync,
    vulkan::ray_tracing::{
        RayTracingAcceleration, RayTracingAccelerationScratchBuffer,
        RayTracingBottomAccelerationDesc, RayTracingInstanceDesc, RayTracingTopAccelerationDesc,
    },
    Device,
};
use lustre_rg::{self as rg};

const TLAS_PREALLOCATE_BYTES: usize = 32 * 1024 * 1024;

/// Transforms whose squared Frobenius delta stays at or below this are
/// considered static for the frame. Tight enough that any real motion
/// triggers an update; only truly static instances get skipped.
/// TODO: recalibrate against profiling data; jittered animation may never
/// pass the test, making the skip path dead weight on such scenes.
pub const TRANSFORM_DELTA_EPSILON: f32 = 1e-12;

/// Squared Frobenius norm of the difference of two affine transforms,
/// taken over the 3x4 coefficient matrix.
pub fn transform_delta_sq(current: &Affine3A, previous: &Affine3A) -> f32 {
    let a = current.to_cols_array();
    let b = previous.to_cols_array();

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

/// Whether an instance's TLAS slot (and backing BLAS) needs updating this
/// frame. Pure so the skip behavior is testable without a device.
pub fn rebuild_decision(is_skinned_set: bool, blas_cached: bool, transform_delta_sq: f32) -> bool {
    is_skinned_set || !blas_cached || transform_delta_sq > TRANSFORM_DELTA_EPSILON
}

/// Content hash of an ordered surface-id list. The hash folds in each id's
/// position, so a permuted list is a different key; treating reordered sets
/// as distinct geometry is the deliberate, simple policy here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceSetKey(u64);

impl SurfaceSetKey {
    pub fn from_surface_ids(ids: &[u32]) -> Self {
        let mut key = 0u64;

        for (position, id) in ids.iter().enumerate() {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            (position as u64, *id).hash(&mut hasher);
            key ^= hasher.finish();
        }

        Self(key)
    }
}

/// Lazily populated BLAS cache. Entries persist across frames until
/// [`BlasCache::evict_all`]; generic over the stored handle so the policy
/// is testable host-side.
pub struct BlasCache<T = Arc<RayTracingAcceleration>> {
    entries: HashMap<SurfaceSetKey, T>,
}

impl<T> Default for BlasCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> BlasCache<T> {
    pub fn contains(&self, key: SurfaceSetKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: SurfaceSetKey) -> Option<&T> {
        self.entries.get(&key)
    }

    pub fn get_or_insert_with<E>(
        &mut self,
        key: SurfaceSetKey,
        create: impl FnOnce() -> Result<T, E>,
    ) -> Result<&T, E> {
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => Ok(entry.insert(create()?)),
        }
    }

    pub fn evict_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Surface sets whose BLAS must be refit every frame because a bake pass
/// rewrites their vertex payload.
#[derive(Default)]
pub struct SkinnedSetRegistry {
    keys: HashSet<SurfaceSetKey>,
}

impl SkinnedSetRegistry {
    pub fn mark(&mut self, key: SurfaceSetKey) {
        self.keys.insert(key);
    }

    pub fn contains(&self, key: SurfaceSetKey) -> bool {
        self.keys.contains(&key)
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityClass {
    Opaque,
    Transparent,
    /// Force-opaque view of everything; shadow-style queries use this.
    Global,
}

impl VisibilityClass {
    pub const ALL: [Self; 3] = [Self::Opaque, Self::Transparent, Self::Global];

    fn index(self) -> usize {
        match self {
            Self::Opaque => 0,
            Self::Transparent => 1,
            Self::Global => 2,
        }
    }

    fn pass_name(self) -> &'static str {
        match self {
            Self::Opaque => "rebuild tlas (opaque)",
            Self::Transparent => "rebuild tlas (transparent)",
            Self::Global => "rebuild tlas (global)",
        }
    }
}

#[derive(Default)]
struct TlasSlot {
    tlas: Option<Arc<RayTracingAcceleration>>,
    built_instance_count: Option<usize>,
}

pub struct AccelerationStructureManager {
    pub blas_cache: BlasCache,
    pub skinned_sets: SkinnedSetRegistry,
    scratch: RayTracingAccelerationScratchBuffer,
    classes: [TlasSlot; 3],
}

impl AccelerationStructureManager {
    pub fn new(device: &Device) -> anyhow::Result<Self> {
        let scratch = device
            .create_ray_tracing_acceleration_scratch_buffer()
            .context("Creating acceleration structure scratch buffer")?;

        Ok(Self {
            blas_cache: Default::default(),
            skinned_sets: Default::default(),
            scratch,
            classes: Default::default(),
        })
    }

    /// Looks up or builds the BLAS for a surface set. Skinned sets are
    /// recorded in the registry so the per-frame refit can find them.
    pub fn resolve_blas(
        &mut self,
        device: &Device,
        key: SurfaceSetKey,
        skinned: bool,
        desc_fn: impl FnOnce() -> RayTracingBottomAccelerationDesc,
    ) -> anyhow::Result<Arc<RayTracingAcceleration>> {
        if skinned {
            self.skinned_sets.mark(key);
        }

        let scratch = &self.scratch;
        let blas = self.blas_cache.get_or_insert_with(key, || {
            let desc = desc_fn();
            assert!(!skinned || desc.allow_update);
            trace!("Building blas for surface set {:?}", key);
            device
                .create_ray_tracing_bottom_acceleration(&desc, scratch)
                .map(Arc::new)
        })?;

        Ok(blas.clone())
    }

    /// Records in-place refits for skinned BLASes. The pass reads the
    /// geometry buffer so it is ordered after the bake pass that wrote it.
    pub fn refit_skinned_blases(
        &self,
        rg: &mut rg::TemporalRenderGraph,
        geometry_buffer: &rg::Handle<lustre_backend::vulkan::buffer::Buffer>,
        updates: Vec<(SurfaceSetKey, RayTracingBottomAccelerationDesc)>,
    ) {
        if updates.is_empty() {
            return;
        }

        let resolved: Vec<(Arc<RayTracingAcceleration>, RayTracingBottomAccelerationDesc)> =
            updates
                .into_iter()
                .filter_map(|(key, desc)| {
                    if !self.skinned_sets.contains(key) {
                        warn!("Refit requested for non-skinned surface set {:?}", key);
                        return None;
                    }
                    match self.blas_cache.get(key) {
                        Some(blas) => Some((blas.clone(), desc)),
                        None => {
                            warn!("Refit requested for uncached surface set {:?}", key);
                            None
                        }
                    }
                })
                .collect();

        let mut pass = rg.add_pass("refit skinned blas");
        let _geometry_ref = pass.read(geometry_buffer, vk_sync::AccessType::AnyShaderReadOther);

        let scratch = self.scratch.clone();

        pass.render(move |api| {
            let cb = api.cb.raw;
            for (blas, desc) in &resolved {
                api.device()
                    .refit_ray_tracing_bottom_acceleration(cb, desc, blas, &scratch);
            }

            Ok(())
        });
    }

    /// Uploads this frame's instance records for one visibility class and
    /// records the TLAS build. Refits in place when the instance count is
    /// unchanged; an empty class skips the build entirely and hands back
    /// last frame's structure if one exists.
    pub fn prepare_tlas(
        &mut self,
        rg: &mut rg::TemporalRenderGraph,
        class: VisibilityClass,
        instances: Vec<RayTracingInstanceDesc>,
    ) -> anyhow::Result<Option<rg::Handle<RayTracingAcceleration>>> {
        let slot = &mut self.classes[class.index()];

        if instances.is_empty() {
            return Ok(slot
                .tlas
                .clone()
                .map(|tlas| rg.import(tlas, vk_sync::AccessType::AnyShaderReadOther)));
        }

        if slot.tlas.is_none() {
            let tlas = rg
                .device()
                .create_ray_tracing_top_acceleration(
                    &RayTracingTopAccelerationDesc {
                        instances: Vec::new(),
                        preallocate_bytes: TLAS_PREALLOCATE_BYTES,
                    },
                    &self.scratch,
                )
                .with_context(|| format!("Creating {:?} tlas", class))?;
            slot.tlas = Some(Arc::new(tlas));
        }

        let refit = slot.built_instance_count == Some(instances.len());
        slot.built_instance_count = Some(instances.len());

        let mut tlas = rg.import(
            slot.tlas.as_ref().unwrap().clone(),
            vk_sync::AccessType::AnyShaderReadOther,
        );

        let mut pass = rg.add_pass(class.pass_name());
        let tlas_ref = pass.write(&mut tlas, vk_sync::AccessType::TransferWrite);

        let scratch = self.scratch.clone();

        pass.render(move |api| {
            let resources = &mut api.resources;
            let instance_buffer_address = resources
                .execution_params
                .device
                .fill_ray_tracing_instance_buffer(resources.dynamic_constants, &instances);
            let tlas = api.resources.rt_acceleration(tlas_ref);

            let cb = api.cb;
            api.device().rebuild_ray_tracing_top_acceleration(
                cb.raw,
                instance_buffer_address,
                instances.len(),
                tlas,
                &scratch,
                refit,
            );

            Ok(())
        });

        Ok(Some(tlas))
    }

    /// Drops every cached structure. Scene unload and resolution changes
    /// tear acceleration structures down wholesale.
    pub fn evict_all(&mut self) {
        info!("Evicting {} cached blas entries", self.blas_cache.len());
        self.blas_cache.evict_all();
        self.skinned_sets.clear();
        self.classes = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn surface_set_key_is_order_sensitive() {
        let a = SurfaceSetKey::from_surface_ids(&[1, 2, 3]);
        let b = SurfaceSetKey::from_surface_ids(&[1, 2, 3]);
        let permuted = SurfaceSetKey::from_surface_ids(&[3, 2, 1]);

        assert_eq!(a, b);
        assert_ne!(a, permuted);
        assert_ne!(a, SurfaceSetKey::from_surface_ids(&[1, 2]));
    }

    #[test]
    fn blas_cache_builds_once_per_key() {
        let mut cache: BlasCache<u32> = Default::default();
        let key = SurfaceSetKey::from_surface_ids(&[7, 8]);

        let mut builds = 0;
        for _ in 0..3 {
            cache
                .get_or_insert_with::<()>(key, || {
                    builds += 1;
                    Ok(builds)
                })
                .unwrap();
        }
        assert_eq!(builds, 1);
        assert_eq!(cache.get(key), Some(&1));

        // A permuted id list misses.
        let permuted = SurfaceSetKey::from_surface_ids(&[8, 7]);
        cache
            .get_or_insert_with::<()>(permuted, || {
                builds += 1;
                Ok(builds)
            })
            .unwrap();
        assert_eq!(builds, 2);

        cache.evict_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_build_leaves_cache_empty() {
        let mut cache: BlasCache<u32> = Default::default();
        let key = SurfaceSetKey::from_surface_ids(&[1]);

        assert!(cache.get_or_insert_with(key, || Err("boom")).is_err());
        assert!(!cache.contains(key));
    }

    #[test]
    fn static_instances_skip_rebuild() {
        let transform = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));

        let mut updates = 0;
        for _frame in 0..4 {
            let delta = transform_delta_sq(&transform, &transform);
            if rebuild_decision(false, true, delta) {
                updates += 1;
            }
        }
        assert_eq!(updates, 0);

        // Any of the three conditions forces an update.
        assert!(rebuild_decision(true, true, 0.0));
        assert!(rebuild_decision(false, false, 0.0));

        let moved = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.001));
        assert!(rebuild_decision(
            false,
            true,
            transform_delta_sq(&moved, &transform)
        ));
    }

    #[test]
    fn transform_delta_is_squared_frobenius() {
        let a = Affine3A::IDENTITY;
        let b = Affine3A::from_translation(Vec3::new(3.0, 4.0, 0.0));
        assert!((transform_delta_sq(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn skinned_registry_roundtrip() {
        let mut registry = SkinnedSetRegistry::default();
        let key = SurfaceSetKey::from_surface_ids(&[4, 5, 6]);

        assert!(!registry.contains(key));
        registry.mark(key);
        assert!(registry.contains(key));
        registry.clear();
        assert!(!registry.contains(key));
    }
}
