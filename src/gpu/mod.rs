//! What the frame producer needs from a graphics API: somewhere to put slot
//! memory, a way to submit work, and a notification when that work is done.

pub mod simulated;

use crate::{
    error::{AllocationError, SubmitError},
    shader_types::SlotLayout,
};

pub use crate::sync::completion::{CompletionHandler, CompletionStatus};

/// CPU-writable memory backing one buffer slot.
///
/// Implementations are cheap handles (cloning one does not copy the memory).
pub trait SlotBuffer: Clone + Send + Sync + 'static {
    /// Size of the mapped region in bytes.
    fn byte_len(&self) -> usize;

    /// The mapped region, for reading.
    ///
    /// # Safety
    ///
    /// Nothing may be writing to this buffer for as long as the slice lives.
    unsafe fn bytes(&self) -> &[u8];

    /// The mapped region, for writing.
    ///
    /// # Safety
    ///
    /// The caller must be the only one touching this buffer for as long as
    /// the slice lives. The GPU counts.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self) -> &mut [u8];
}

/// One frame of work, reading exclusively from one slot.
#[derive(Clone, Debug)]
pub struct FrameSubmission<B> {
    pub frame: u64,
    pub slot: usize,
    pub buffer: B,
    pub layout: SlotLayout,
}

/// The graphics API layer the producer drives.
pub trait GpuDevice {
    type Buffer: SlotBuffer;

    /// Allocate the memory for slot number `slot`, at least `byte_size` bytes.
    fn allocate_slot(
        &self,
        slot: usize,
        byte_size: usize,
    ) -> Result<Self::Buffer, AllocationError>;

    /// Queue `submission` for execution.
    ///
    /// On success, `on_complete` must be fired exactly once, after the GPU has
    /// stopped reading `submission.buffer`. It may fire on any thread,
    /// including synchronously from inside this call.
    ///
    /// On failure the work must not run. Dropping `on_complete` releases the
    /// slot.
    fn submit(
        &self,
        submission: FrameSubmission<Self::Buffer>,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError>;
}
