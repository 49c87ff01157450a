//! Pools for resources that only live within a single frame's render graph.
//!
//! Retired graphs return their owned images and buffers here instead of
//! destroying them, and the next frame's graph picks up a matching resource
//! before asking the device for a fresh allocation.

use crate::vulkan::{
    buffer::{Buffer, BufferDesc},
    image::{Image, ImageDesc},
};
use std::collections::HashMap;

#[derive(Default)]
pub struct TransientResourceCache {
    images: HashMap<ImageDesc, Vec<Image>>,
    buffers: HashMap<BufferDesc, Vec<Buffer>>,
}

impl TransientResourceCache {
    pub fn get_image(&mut self, desc: &ImageDesc) -> Option<Image> {
        self.images.get_mut(desc).and_then(Vec::pop)
    }

    pub fn insert_image(&mut self, image: Image) {
        self.images.entry(image.desc).or_default().push(image);
    }

    pub fn get_buffer(&mut self, desc: &BufferDesc) -> Option<Buffer> {
        self.buffers.get_mut(desc).and_then(Vec::pop)
    }

    pub fn insert_buffer(&mut self, buffer: Buffer) {
        self.buffers.entry(buffer.desc).or_default().push(buffer);
    }
}
