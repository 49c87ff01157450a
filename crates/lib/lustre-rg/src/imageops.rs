use crate::{self as rg, Buffer, RenderGraph};
use lustre_backend::{ash::vk, vk_sync::AccessType, vulkan::image::*};

pub fn clear_color(rg: &mut RenderGraph, img: &mut rg::Handle<Image>, clear_color: [f32; 4]) {
    let mut pass = rg.add_pass("clear color");
    let output_ref = pass.write(img, AccessType::TransferWrite);

    pass.render(move |api| {
        let raw_device = &api.device().raw;
        let cb = api.cb;

        let image = api.resources.image(output_ref);

        unsafe {
            raw_device.cmd_clear_color_image(
                cb.raw,
                image.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue {
                    float32: clear_color,
                },
                std::slice::from_ref(&vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    level_count: image.desc.mip_levels as u32,
                    layer_count: 1,
                    ..Default::default()
                }),
            );
        }

        Ok(())
    });
}

pub fn fill_buffer(rg: &mut RenderGraph, buf: &mut rg::Handle<Buffer>, value: u32) {
    let mut pass = rg.add_pass("fill buffer");
    let output_ref = pass.write(buf, AccessType::TransferWrite);

    pass.render(move |api| {
        let raw_device = &api.device().raw;
        let cb = api.cb;

        let buffer = api.resources.buffer(output_ref);

        unsafe {
            raw_device.cmd_fill_buffer(cb.raw, buffer.raw, 0, vk::WHOLE_SIZE, value);
        }

        Ok(())
    });
}
