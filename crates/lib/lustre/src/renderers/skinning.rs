use glam::Mat4;
use lustre_backend::{ash::vk, vulkan::buffer::Buffer};
use lustre_rg::{self as rg, SimpleRenderPass};

/// One skinned surface to animate this frame: the static source surface,
/// the destination surface owning an exclusive range of the geometry
/// buffer, and the palette of joint transforms resolved for this frame.
pub struct SkinnedSurfaceBake {
    pub source_surface: u32,
    pub dest_surface: u32,
    pub num_vertices: u32,
    pub joint_transforms: Vec<Mat4>,
}

/// Writes animated positions, normals, and tangents into each destination
/// surface's reserved range. Downstream BLAS refits read the geometry
/// buffer through the graph, which orders them after these writes.
pub fn bake_skinned_surfaces(
    rg: &mut rg::TemporalRenderGraph,
    geometry_buffer: &mut rg::Handle<Buffer>,
    bindless_descriptor_set: vk::DescriptorSet,
    bakes: Vec<SkinnedSurfaceBake>,
) {
    for bake in bakes {
        let num_vertices = bake.num_vertices;

        SimpleRenderPass::new_compute(
            rg.add_pass("bake skinned surface"),
            "skinning/bake_vertices.spv",
        )
        .write(geometry_buffer)
        .constants((bake.source_surface, bake.dest_surface, num_vertices))
        .dynamic_storage_buffer_vec(bake.joint_transforms)
        .raw_descriptor_set(1, bindless_descriptor_set)
        .dispatch([num_vertices, 1, 1]);
    }
}
