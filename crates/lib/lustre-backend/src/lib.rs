pub mod bytes;
pub mod chunky_list;
pub mod dynamic_constants;
pub mod pipeline_cache;
pub mod transient_resource_cache;
pub mod vulkan;

pub use ash;
pub use gpu_allocator;
pub use rspirv_reflect;
pub use vk_sync;
pub use vulkan::{
    device::Device,
    image::*,
    shader::MAX_DESCRIPTOR_SETS,
};

use backtrace::Backtrace as Bt;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Allocation failed for {name:?}: {inner:?}")]
    Allocation {
        inner: gpu_allocator::AllocationError,
        name: String,
    },

    #[error("Vulkan error: {err:?}; {trace:?}")]
    Vulkan { err: ash::vk::Result, trace: Bt },

    #[error("Invalid resource access: {info:?}")]
    ResourceAccess { info: String },
}

impl From<ash::vk::Result> for BackendError {
    fn from(err: ash::vk::Result) -> Self {
        Self::Vulkan {
            err,
            trace: Bt::new(),
        }
    }
}
