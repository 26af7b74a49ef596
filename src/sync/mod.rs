//! The CPU/GPU slot protocol: a gate, a pool, and the handler that closes the
//! loop when the GPU is done.

pub mod completion;
pub mod gate;
pub mod pool;

pub use completion::{CompletionHandler, CompletionStatus};
pub use gate::AvailabilityGate;
pub use pool::{BufferSlotPool, SlotState, SlotWrite};
