use lustre_backend::{ash::vk, vulkan::image::*};
use lustre_rg::{self as rg, SimpleRenderPass};

pub fn extract_half_res_roughness(
    rg: &mut rg::RenderGraph,
    specular_roughness: &rg::Handle<Image>,
) -> rg::Handle<Image> {
    let mut output_tex = rg.create(
        specular_roughness
            .desc()
            .half_res()
            .usage(vk::ImageUsageFlags::empty())
            .format(vk::Format::R8_UNORM),
    );
    SimpleRenderPass::new_compute(
        rg.add_pass("extract roughness/2"),
        "half_res/extract_roughness.spv",
    )
    .read(specular_roughness)
    .write(&mut output_tex)
    .dispatch(output_tex.desc().dispatch_extent());
    output_tex
}

pub fn extract_half_res_depth(
    rg: &mut rg::RenderGraph,
    depth: &rg::Handle<Image>,
) -> rg::Handle<Image> {
    let mut output_tex = rg.create(
        depth
            .desc()
            .half_res()
            .usage(vk::ImageUsageFlags::empty())
            .format(vk::Format::R32_SFLOAT),
    );
    SimpleRenderPass::new_compute(
        rg.add_pass("extract half depth"),
        "half_res/extract_depth.spv",
    )
    .read_aspect(depth, vk::ImageAspectFlags::DEPTH)
    .write(&mut output_tex)
    .dispatch(output_tex.desc().dispatch_extent());
    output_tex
}
