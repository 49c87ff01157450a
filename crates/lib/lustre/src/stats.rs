//! CPU-side ray statistics: the six ray counters are copied into a small
//! staging ring every frame and read back one frame later, never blocking.

use std::sync::Arc;

use lustre_backend::{
    ash::vk,
    vk_sync,
    vulkan::buffer::{Buffer, BufferDesc},
    BackendError, Device,
};
use lustre_rg::{self as rg};

pub const RAY_COUNTER_COUNT: usize = 6;
pub const RAY_COUNTER_BYTES: usize = RAY_COUNTER_COUNT * 4;

/// Exponential smoothing factor applied to each per-class count.
pub const RAY_COUNT_SMOOTHING: f32 = 0.1;

pub fn smooth_count(previous: f32, sample: u32) -> f32 {
    previous + (sample as f32 - previous) * RAY_COUNT_SMOOTHING
}

/// Smoothed per-class ray counts, in rays (or tiles) per frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SmoothedRayCounts {
    pub software: f32,
    pub hardware: f32,
    pub denoise_tiles: f32,
}

impl SmoothedRayCounts {
    fn fold(&mut self, counters: &[u32; RAY_COUNTER_COUNT]) {
        self.software = smooth_count(self.software, counters[0]);
        self.denoise_tiles = smooth_count(self.denoise_tiles, counters[2]);
        self.hardware = smooth_count(self.hardware, counters[4]);
    }
}

pub struct RayStatsReadback {
    staging: [Arc<Buffer>; 2],
    cursor: usize,
    valid_frames: usize,
    smoothed: SmoothedRayCounts,
}

impl RayStatsReadback {
    pub fn new(device: &Device) -> Result<Self, BackendError> {
        let mut staging = Vec::with_capacity(2);
        for i in 0..2 {
            staging.push(Arc::new(device.create_buffer(
                BufferDesc::new_gpu_to_cpu(RAY_COUNTER_BYTES, vk::BufferUsageFlags::TRANSFER_DST),
                format!("ray counter readback {}", i),
                None,
            )?));
        }

        let staging: [Arc<Buffer>; 2] = [staging.remove(0), staging.remove(0)];

        Ok(Self {
            staging,
            cursor: 0,
            valid_frames: 0,
            smoothed: Default::default(),
        })
    }

    /// Copies the counter buffer into this frame's staging slot.
    pub fn record_copy(
        &self,
        rg: &mut rg::TemporalRenderGraph,
        ray_counters: &rg::Handle<Buffer>,
    ) {
        let mut staging = rg.import(
            self.staging[self.cursor].clone(),
            vk_sync::AccessType::HostRead,
        );

        let mut pass = rg.add_pass("readback ray counters");
        let src_ref = pass.read(ray_counters, vk_sync::AccessType::TransferRead);
        let dst_ref = pass.write(&mut staging, vk_sync::AccessType::TransferWrite);

        pass.render(move |api| {
            let raw_device = &api.device().raw;
            let cb = api.cb;

            let src = api.resources.buffer(src_ref);
            let dst = api.resources.buffer(dst_ref);

            unsafe {
                raw_device.cmd_copy_buffer(
                    cb.raw,
                    src.raw,
                    dst.raw,
                    &[vk::BufferCopy::builder()
                        .size(RAY_COUNTER_BYTES as u64)
                        .build()],
                );
            }

            Ok(())
        });
    }

    /// Folds the counters recorded two submissions ago into the smoothed
    /// totals and advances the ring. Reads mapped memory only; the frame
    /// fence already guarantees the copy has landed.
    pub fn advance_frame(&mut self) {
        let read_slot = (self.cursor + 1) % 2;

        if self.valid_frames >= 2 {
            if let Some(bytes) = self.staging[read_slot].allocation.mapped_slice() {
                let mut counters = [0u32; RAY_COUNTER_COUNT];
                for (i, counter) in counters.iter_mut().enumerate() {
                    *counter = u32::from_le_bytes(
                        bytes[i * 4..i * 4 + 4].try_into().unwrap_or_default(),
                    );
                }
                self.smoothed.fold(&counters);
            }
        }

        self.valid_frames += 1;
        self.cursor = read_slot;
    }

    pub fn smoothed(&self) -> SmoothedRayCounts {
        self.smoothed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoothing_moves_a_tenth_toward_the_sample() {
        assert_eq!(smooth_count(0.0, 100), 10.0);
        assert_eq!(smooth_count(10.0, 100), 19.0);

        // Repeated application converges on the sample.
        let mut value = 0.0;
        for _ in 0..200 {
            value = smooth_count(value, 100);
        }
        assert!((value - 100.0).abs() < 0.1);

        // A steady value is a fixed point.
        assert_eq!(smooth_count(42.0, 42), 42.0);
    }

    #[test]
    fn fold_reads_the_current_counter_slots() {
        let mut smoothed = SmoothedRayCounts::default();
        smoothed.fold(&[1000, 777, 50, 777, 200, 777]);

        assert_eq!(smoothed.software, 100.0);
        assert_eq!(smoothed.denoise_tiles, 5.0);
        assert_eq!(smoothed.hardware, 20.0);
    }
}
