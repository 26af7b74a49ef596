//! Error types for the frame synchronization core.
//!
//! Which of these are fatal:
//!
//! - [`AllocationError`] aborts startup.
//! - [`GateError::ProtocolViolation`] is a logic bug. One seen on the
//!   completion path is latched, and every later frame fails with it.
//! - [`SubmitError::Failed`] only costs the current frame.
//! - [`SubmitError::DeviceLost`] ends the render loop until the pool and
//!   gate are rebuilt on a fresh device.

use thiserror::Error;

use crate::shader_types::LayoutError;

/// The slot pool could not get the memory it asked for.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("a buffer slot pool needs at least one slot")]
    NoSlots,
    #[error("failed to allocate {size} bytes for buffer slot {slot}: {reason}")]
    OutOfMemory {
        slot: usize,
        size: usize,
        reason: String,
    },
}

/// Misuse of the availability gate or of a buffer slot's state machine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("an availability gate needs a capacity of at least one")]
    ZeroCapacity,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Handing a frame to the GPU went wrong.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("GPU submission failed: {0}")]
    Failed(String),
    #[error("GPU device lost")]
    DeviceLost,
}

/// Everything [`crate::producer::FrameProducer`] can fail with.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("GPU device lost on frame {frame}; the slot pool must be reinitialized")]
    DeviceLost { frame: u64 },
}
