pub mod accel;
pub mod bindless;
pub mod blue_noise;
pub mod buffer_builder;
pub mod config;
pub mod frame_constants;
pub mod geometry;
pub mod renderers;
pub mod scene_renderer;
pub mod stats;

pub use lustre_backend as backend;
pub use lustre_rg as rg;
