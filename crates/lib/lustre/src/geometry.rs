//! Host-side geometry, instance, and material tables, plus their GPU
//! mirrors and the allocator for skinned destination ranges.

use std::ops::Range;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexWidth {
    U16,
    U32,
}

impl IndexWidth {
    pub fn size_bytes(self) -> u32 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Byte offsets of vertex attributes within the shared geometry buffer.
/// Absent attributes are `None` here; the GPU mirror uses a -1 sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeOffsets {
    pub position: Option<u32>,
    pub normal: Option<u32>,
    pub tangent: Option<u32>,
    pub texcoord0: Option<u32>,
    pub texcoord1: Option<u32>,
    pub joint_indices: Option<u32>,
    pub joint_weights: Option<u32>,
}

impl AttributeOffsets {
    /// Drops attributes whose offsets point outside the geometry buffer.
    pub fn sanitize(mut self, buffer_size: u64, surface_id: u32) -> Self {
        for (name, offset) in [
            ("position", &mut self.position),
            ("normal", &mut self.normal),
            ("tangent", &mut self.tangent),
            ("texcoord0", &mut self.texcoord0),
            ("texcoord1", &mut self.texcoord1),
            ("joint_indices", &mut self.joint_indices),
            ("joint_weights", &mut self.joint_weights),
        ] {
            if let Some(value) = *offset {
                if u64::from(value) >= buffer_size {
                    warn!(
                        "Surface {}: {} offset {} out of bounds; skipping attribute",
                        surface_id, name, value
                    );
                    *offset = None;
                }
            }
        }

        self
    }
}

/// One drawable primitive: a mesh subset sharing a material. Immutable
/// after load, except that a skinned surface's destination twin has its
/// vertex payload rewritten every frame by the bake pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub material_id: u32,
    pub index_offset: u32,
    pub vertex_offset: u32,
    pub num_indices: u32,
    pub num_vertices: u32,
    pub index_width: IndexWidth,
    pub attributes: AttributeOffsets,
}

impl Surface {
    pub fn is_skinned(&self) -> bool {
        self.attributes.joint_indices.is_some() && self.attributes.joint_weights.is_some()
    }
}

/// One scene-graph node referencing a mesh: a range into the flat
/// surface-id array, split into an opaque prefix and a transparent suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    pub node_id: u32,
    pub surfaces_offset: u32,
    pub num_opaque: u32,
    pub num_transparent: u32,
}

impl Instance {
    pub fn num_surfaces(&self) -> u32 {
        self.num_opaque + self.num_transparent
    }

    pub fn opaque_surface_ids<'a>(&self, surface_ids: &'a [u32]) -> &'a [u32] {
        let start = self.surfaces_offset as usize;
        &surface_ids[start..start + self.num_opaque as usize]
    }

    pub fn transparent_surface_ids<'a>(&self, surface_ids: &'a [u32]) -> &'a [u32] {
        let start = (self.surfaces_offset + self.num_opaque) as usize;
        &surface_ids[start..start + self.num_transparent as usize]
    }

    pub fn all_surface_ids<'a>(&self, surface_ids: &'a [u32]) -> &'a [u32] {
        let start = self.surfaces_offset as usize;
        &surface_ids[start..start + self.num_surfaces() as usize]
    }

    /// Checks that the surface range is in bounds and that material opacity
    /// actually partitions into opaque-prefix / transparent-suffix order.
    pub fn validate_partition(
        &self,
        surface_ids: &[u32],
        surfaces: &[Surface],
        materials: &[Material],
    ) -> bool {
        let end = self.surfaces_offset as usize + self.num_surfaces() as usize;
        if end > surface_ids.len() {
            return false;
        }

        let surface_opaque = |id: u32| -> Option<bool> {
            let surface = surfaces.get(id as usize)?;
            let material = materials.get(surface.material_id as usize)?;
            Some(material.is_opaque)
        };

        self.opaque_surface_ids(surface_ids)
            .iter()
            .all(|&id| surface_opaque(id) == Some(true))
            && self
                .transparent_surface_ids(surface_ids)
                .iter()
                .all(|&id| surface_opaque(id) == Some(false))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub base_color_factor: [f32; 4],
    pub emissive_factor: [f32; 3],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub base_color_texture: Option<u32>,
    pub normal_texture: Option<u32>,
    pub metallic_roughness_texture: Option<u32>,
    pub emissive_texture: Option<u32>,
    pub is_opaque: bool,
}

fn gpu_slot(slot: Option<u32>) -> i32 {
    slot.map_or(-1, |s| s as i32)
}

/// GPU mirror of [`Surface`]; absent offsets become -1.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct GpuSurface {
    pub material_id: u32,
    pub index_offset: u32,
    pub vertex_offset: u32,
    pub num_indices: u32,
    pub num_vertices: u32,
    pub index_size_bytes: u32,
    pub position_offset: i32,
    pub normal_offset: i32,
    pub tangent_offset: i32,
    pub texcoord0_offset: i32,
    pub texcoord1_offset: i32,
    pub joint_indices_offset: i32,
    pub joint_weights_offset: i32,
    pub pad0: u32,
    pub pad1: u32,
    pub pad2: u32,
}

impl From<&Surface> for GpuSurface {
    fn from(surface: &Surface) -> Self {
        Self {
            material_id: surface.material_id,
            index_offset: surface.index_offset,
            vertex_offset: surface.vertex_offset,
            num_indices: surface.num_indices,
            num_vertices: surface.num_vertices,
            index_size_bytes: surface.index_width.size_bytes(),
            position_offset: gpu_slot(surface.attributes.position),
            normal_offset: gpu_slot(surface.attributes.normal),
            tangent_offset: gpu_slot(surface.attributes.tangent),
            texcoord0_offset: gpu_slot(surface.attributes.texcoord0),
            texcoord1_offset: gpu_slot(surface.attributes.texcoord1),
            joint_indices_offset: gpu_slot(surface.attributes.joint_indices),
            joint_weights_offset: gpu_slot(surface.attributes.joint_weights),
            pad0: 0,
            pad1: 0,
            pad2: 0,
        }
    }
}

/// GPU mirror of [`Material`]; absent texture slots become -1.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct GpuMaterial {
    pub base_color_factor: [f32; 4],
    pub emissive_factor: [f32; 3],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub base_color_texture: i32,
    pub normal_texture: i32,
    pub metallic_roughness_texture: i32,
    pub emissive_texture: i32,
    pub is_opaque: u32,
    pub pad0: u32,
    pub pad1: u32,
}

impl From<&Material> for GpuMaterial {
    fn from(material: &Material) -> Self {
        Self {
            base_color_factor: material.base_color_factor,
            emissive_factor: material.emissive_factor,
            metallic_factor: material.metallic_factor,
            roughness_factor: material.roughness_factor,
            base_color_texture: gpu_slot(material.base_color_texture),
            normal_texture: gpu_slot(material.normal_texture),
            metallic_roughness_texture: gpu_slot(material.metallic_roughness_texture),
            emissive_texture: gpu_slot(material.emissive_texture),
            is_opaque: material.is_opaque as u32,
            pad0: 0,
            pad1: 0,
        }
    }
}

/// Carves exclusively-owned, aligned byte ranges out of the tail of the
/// shared geometry buffer for skinned destination surfaces. Ranges never
/// alias: the bake pass writes them without cross-surface synchronization.
pub struct RangeAllocator {
    cursor: u64,
    end: u64,
    alignment: u64,
    allocated: Vec<Range<u64>>,
}

impl RangeAllocator {
    pub fn new(range: Range<u64>, alignment: u64) -> Self {
        assert!(alignment.count_ones() == 1);
        Self {
            cursor: range.start,
            end: range.end,
            alignment,
            allocated: Vec::new(),
        }
    }

    /// Reserves `size_bytes`, padded out to the allocator alignment.
    /// Returns `None` when the region is exhausted.
    pub fn allocate(&mut self, size_bytes: u64) -> Option<Range<u64>> {
        let start = (self.cursor + self.alignment - 1) & !(self.alignment - 1);
        let padded_size =
            (size_bytes + self.alignment - 1) & !(self.alignment - 1);
        let end = start.checked_add(padded_size)?;

        if end > self.end {
            return None;
        }

        self.cursor = end;
        self.allocated.push(start..end);
        Some(start..end)
    }

    pub fn allocated_ranges(&self) -> &[Range<u64>] {
        &self.allocated
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.end.saturating_sub(self.cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_material(is_opaque: bool) -> Material {
        Material {
            base_color_factor: [1.0; 4],
            emissive_factor: [0.0; 3],
            metallic_factor: 0.0,
            roughness_factor: 1.0,
            base_color_texture: None,
            normal_texture: None,
            metallic_roughness_texture: None,
            emissive_texture: None,
            is_opaque,
        }
    }

    fn test_surface(material_id: u32) -> Surface {
        Surface {
            material_id,
            index_offset: 0,
            vertex_offset: 0,
            num_indices: 3,
            num_vertices: 3,
            index_width: IndexWidth::U16,
            attributes: AttributeOffsets {
                position: Some(0),
                ..Default::default()
            },
        }
    }

    #[test]
    fn skinned_requires_both_joint_attributes() {
        let mut surface = test_surface(0);
        assert!(!surface.is_skinned());

        surface.attributes.joint_indices = Some(64);
        assert!(!surface.is_skinned());

        surface.attributes.joint_weights = Some(128);
        assert!(surface.is_skinned());
    }

    #[test]
    fn partition_validation() {
        let materials = vec![test_material(true), test_material(false)];
        let surfaces = vec![test_surface(0), test_surface(0), test_surface(1)];
        let surface_ids = vec![0, 1, 2];

        let instance = Instance {
            node_id: 0,
            surfaces_offset: 0,
            num_opaque: 2,
            num_transparent: 1,
        };
        assert_eq!(instance.num_surfaces(), 3);
        assert!(instance.validate_partition(&surface_ids, &surfaces, &materials));

        // Transparent surface in the opaque prefix.
        let bad = Instance {
            num_opaque: 3,
            num_transparent: 0,
            ..instance
        };
        assert!(!bad.validate_partition(&surface_ids, &surfaces, &materials));

        // Range past the end of the id array.
        let oob = Instance {
            surfaces_offset: 2,
            num_opaque: 1,
            num_transparent: 1,
            ..instance
        };
        assert!(!oob.validate_partition(&surface_ids, &surfaces, &materials));
    }

    #[test]
    fn skinned_ranges_are_aligned_and_exclusive() {
        let mut allocator = RangeAllocator::new(1000..4096, 256);

        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(300).unwrap();
        let c = allocator.allocate(1).unwrap();

        for range in [&a, &b, &c] {
            assert_eq!(range.start % 256, 0);
            assert_eq!(range.end % 256, 0);
        }

        let ranges = allocator.allocated_ranges();
        for (i, lhs) in ranges.iter().enumerate() {
            for rhs in &ranges[i + 1..] {
                assert!(lhs.end <= rhs.start || rhs.end <= lhs.start);
            }
        }
    }

    #[test]
    fn allocator_respects_capacity() {
        let mut allocator = RangeAllocator::new(0..512, 256);
        assert!(allocator.allocate(256).is_some());
        assert!(allocator.allocate(256).is_some());
        assert!(allocator.allocate(1).is_none());
        assert_eq!(allocator.bytes_remaining(), 0);
    }

    #[test]
    fn out_of_bounds_attributes_are_dropped() {
        let attributes = AttributeOffsets {
            position: Some(0),
            normal: Some(10_000),
            ..Default::default()
        }
        .sanitize(1024, 7);

        assert_eq!(attributes.position, Some(0));
        assert_eq!(attributes.normal, None);
    }

    #[test]
    fn gpu_mirrors_use_sentinels() {
        let surface = test_surface(3);
        let gpu = GpuSurface::from(&surface);
        assert_eq!(gpu.position_offset, 0);
        assert_eq!(gpu.joint_indices_offset, -1);
        assert_eq!(gpu.index_size_bytes, 2);

        let material = test_material(true);
        let gpu = GpuMaterial::from(&material);
        assert_eq!(gpu.base_color_texture, -1);
        assert_eq!(gpu.is_opaque, 1);
    }
}
