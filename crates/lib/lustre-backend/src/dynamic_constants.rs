use crate::{vulkan::buffer::Buffer, vulkan::device::Device};
use ash::vk;

pub const DYNAMIC_CONSTANTS_SIZE_BYTES: usize = 1024 * 1024 * 8;
pub const DYNAMIC_CONSTANTS_BUFFER_COUNT: usize = 2;

// Minimum alignment for uniform buffer offsets on the hardware we target.
pub const DYNAMIC_CONSTANTS_ALIGNMENT: usize = 256;

pub const MAX_DYNAMIC_CONSTANTS_BYTES_PER_DISPATCH: usize = 16 * 1024;
pub const MAX_DYNAMIC_CONSTANTS_STORAGE_BUFFER_BYTES: usize = 1024 * 1024;

/// A persistently-mapped ring of constant data, double-buffered so the frame
/// in flight on the GPU never aliases the frame being recorded.
pub struct DynamicConstants {
    pub buffer: Buffer,
    frame_offset_bytes: usize,
    frame_parity: usize,
}

impl DynamicConstants {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            buffer,
            frame_offset_bytes: 0,
            frame_parity: 0,
        }
    }

    pub fn advance_frame(&mut self) {
        self.frame_parity = (self.frame_parity + 1) % DYNAMIC_CONSTANTS_BUFFER_COUNT;
        self.frame_offset_bytes = 0;
    }

    pub fn current_offset(&self) -> u32 {
        (self.frame_parity * DYNAMIC_CONSTANTS_SIZE_BYTES + self.frame_offset_bytes) as u32
    }

    pub fn current_device_address(&self, device: &Device) -> vk::DeviceAddress {
        self.buffer.device_address(device) + self.current_offset() as vk::DeviceAddress
    }

    pub fn push<T: Copy>(&mut self, t: &T) -> u32 {
        let t_size = std::mem::size_of::<T>();
        assert!(self.frame_offset_bytes + t_size < DYNAMIC_CONSTANTS_SIZE_BYTES);

        let buffer_offset = self.current_offset() as usize;
        let dst = &mut self.buffer.allocation.mapped_slice_mut().unwrap()
            [buffer_offset..buffer_offset + t_size];

        dst.copy_from_slice(unsafe {
            std::slice::from_raw_parts(t as *const T as *const u8, t_size)
        });

        self.frame_offset_bytes += dynamic_constants_offset_align(t_size);

        buffer_offset as u32
    }

    pub fn push_from_iter<T: Copy, I: Iterator<Item = T>>(&mut self, iter: I) -> u32 {
        let t_size = std::mem::size_of::<T>();
        let buffer_offset = self.current_offset() as usize;

        let mut dst_offset = buffer_offset;
        for t in iter {
            let dst =
                &mut self.buffer.allocation.mapped_slice_mut().unwrap()[dst_offset..][..t_size];
            dst.copy_from_slice(unsafe {
                std::slice::from_raw_parts(&t as *const T as *const u8, t_size)
            });
            dst_offset += t_size;
        }

        let written = dst_offset - buffer_offset;
        assert!(self.frame_offset_bytes + written < DYNAMIC_CONSTANTS_SIZE_BYTES);
        self.frame_offset_bytes += dynamic_constants_offset_align(written);

        buffer_offset as u32
    }
}

fn dynamic_constants_offset_align(size: usize) -> usize {
    (size + DYNAMIC_CONSTANTS_ALIGNMENT - 1) & !(DYNAMIC_CONSTANTS_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_stay_uniform_aligned() {
        assert_eq!(dynamic_constants_offset_align(1), 256);
        assert_eq!(dynamic_constants_offset_align(256), 256);
        assert_eq!(dynamic_constants_offset_align(257), 512);
    }
}
