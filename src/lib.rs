pub mod error;
pub mod gpu;
pub mod producer;
pub mod scene;
pub mod shader_types;
pub mod sync;
pub(crate) mod util;
pub mod vulkan;

/// The number of buffer slots, and so the number of frames the CPU may have
/// submitted to the GPU before it has to wait for the GPU to finish one.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
