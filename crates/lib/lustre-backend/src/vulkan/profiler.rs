//! GPU timing via timestamp queries.
//!
//! Each in-flight frame owns a query pool and a host-visible readback buffer.
//! Scopes are opened and closed while recording the frame's command buffer,
//! and results for a frame become readable once its fence has signalled,
//! i.e. one frame swap later.

use crate::BackendError;

use super::{buffer::Buffer, buffer::BufferDesc, device::Device};
use ash::vk;
use byte_slice_cast::AsSliceOf;
use gpu_allocator::VulkanAllocator;
use parking_lot::Mutex;

pub const MAX_PROFILER_SCOPES: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfilerScopeId(usize);

#[derive(Clone, Debug)]
pub struct ProfilerScopeResult {
    pub name: String,
    pub duration_ms: f64,
}

pub struct VkProfilerData {
    query_pool: vk::QueryPool,
    readback_buffer: Buffer,
    timestamp_period: f32,
    scope_names: Mutex<Vec<String>>,
}

impl VkProfilerData {
    pub fn new(
        device: &ash::Device,
        global_allocator: &mut VulkanAllocator,
        timestamp_period: f32,
    ) -> Result<Self, BackendError> {
        let pool_info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(MAX_PROFILER_SCOPES as u32 * 2);

        let query_pool = unsafe { device.create_query_pool(&pool_info, None)? };

        let readback_buffer = Device::create_buffer_impl(
            device,
            global_allocator,
            BufferDesc::new_gpu_to_cpu(
                MAX_PROFILER_SCOPES * 2 * std::mem::size_of::<u64>(),
                vk::BufferUsageFlags::TRANSFER_DST,
            ),
            "timestamp query readback",
        )?;

        Ok(Self {
            query_pool,
            readback_buffer,
            timestamp_period,
            scope_names: Mutex::new(Vec::new()),
        })
    }

    pub fn begin_frame(&self, device: &ash::Device, cb: vk::CommandBuffer) {
        self.scope_names.lock().clear();

        unsafe {
            device.cmd_reset_query_pool(cb, self.query_pool, 0, MAX_PROFILER_SCOPES as u32 * 2);
        }
    }

    pub fn begin_scope(
        &self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
        name: &str,
    ) -> ProfilerScopeId {
        let mut names = self.scope_names.lock();
        let idx = names.len();

        if idx >= MAX_PROFILER_SCOPES {
            log::warn!("Out of GPU profiler scopes; {} not timed", name);
            return ProfilerScopeId(usize::MAX);
        }

        names.push(name.to_owned());

        unsafe {
            device.cmd_write_timestamp(
                cb,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                idx as u32 * 2,
            );
        }

        ProfilerScopeId(idx)
    }

    pub fn end_scope(&self, device: &ash::Device, cb: vk::CommandBuffer, scope: ProfilerScopeId) {
        if scope.0 == usize::MAX {
            return;
        }

        unsafe {
            device.cmd_write_timestamp(
                cb,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                self.query_pool,
                scope.0 as u32 * 2 + 1,
            );
        }
    }

    /// Copies the frame's queries into the readback buffer. Must be the last
    /// thing recorded on the command buffer.
    pub fn finish_frame(&self, device: &ash::Device, cb: vk::CommandBuffer) {
        let query_count = self.scope_names.lock().len() as u32 * 2;
        if query_count == 0 {
            return;
        }

        unsafe {
            device.cmd_copy_query_pool_results(
                cb,
                self.query_pool,
                0,
                query_count,
                self.readback_buffer.raw,
                0,
                std::mem::size_of::<u64>() as u64,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );
        }
    }

    /// Valid after the fence of the frame that recorded the queries has
    /// been waited upon.
    pub fn retrieve_results(&self) -> Vec<ProfilerScopeResult> {
        let names = self.scope_names.lock();

        let timestamps: &[u64] = match self.readback_buffer.allocation.mapped_slice() {
            Some(slice) => match slice.as_slice_of::<u64>() {
                Ok(timestamps) => timestamps,
                Err(_) => return Vec::new(),
            },
            None => return Vec::new(),
        };

        let ns_per_tick = self.timestamp_period as f64;

        names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let begin = timestamps[idx * 2];
                let end = timestamps[idx * 2 + 1];
                ProfilerScopeResult {
                    name: name.clone(),
                    duration_ms: end.saturating_sub(begin) as f64 * ns_per_tick / 1_000_000.0,
                }
            })
            .collect()
    }
}
