//! The release half of the slot protocol, handed to the GPU with each frame.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use tracing::{error, trace, warn};

use super::{
    gate::AvailabilityGate,
    pool::{SlotState, SlotStates},
};
use crate::error::GateError;

/// How a submission ended, as reported by the GPU collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The GPU finished reading the slot.
    Completed,
    /// The GPU stopped executing the work, with an error. It won't touch the
    /// slot again.
    Failed(String),
}

/// Counters updated from the completion side.
#[derive(Debug, Default)]
pub(crate) struct CompletionCounters {
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) abandoned: AtomicU64,
    /// The first protocol violation seen on the completion side. Once set,
    /// the producer refuses to draw.
    violation: Mutex<Option<String>>,
}

impl CompletionCounters {
    pub(crate) fn violation(&self) -> Option<GateError> {
        self.violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(GateError::ProtocolViolation)
    }

    fn record_violation(&self, err: GateError) {
        error!(%err, "Slot protocol violated");
        let message = match err {
            GateError::ProtocolViolation(message) => message,
            other => other.to_string(),
        };
        self.violation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(message);
    }
}

/// Fires exactly once per submission, on whatever thread the GPU collaborator
/// delivers notifications on, and gives the submission's slot back.
///
/// A handler that is dropped without [`CompletionHandler::complete()`] being
/// called (say, because the submission was rejected) still releases its slot,
/// with a warning, so a slot can't leak quietly.
#[derive(Debug)]
pub struct CompletionHandler {
    frame: u64,
    slot: usize,
    release: Option<SlotRelease>,
}

#[derive(Debug)]
struct SlotRelease {
    gate: Arc<AvailabilityGate>,
    states: Arc<SlotStates>,
    counters: Arc<CompletionCounters>,
}

impl CompletionHandler {
    pub(crate) fn new(
        frame: u64,
        slot: usize,
        gate: Arc<AvailabilityGate>,
        states: Arc<SlotStates>,
        counters: Arc<CompletionCounters>,
    ) -> Self {
        Self {
            frame,
            slot,
            release: Some(SlotRelease {
                gate,
                states,
                counters,
            }),
        }
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Tell the producer the GPU is done with this submission's slot.
    pub fn complete(mut self, status: CompletionStatus) {
        match &status {
            CompletionStatus::Completed => {
                trace!(frame = self.frame, slot = self.slot, "GPU completed frame")
            }
            CompletionStatus::Failed(reason) => {
                warn!(frame = self.frame, slot = self.slot, %reason, "GPU failed to execute frame")
            }
        }

        if let Some(release) = self.release.take() {
            let counter = match status {
                CompletionStatus::Completed => &release.counters.completed,
                CompletionStatus::Failed(_) => &release.counters.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            release.run(self.slot);
        }
    }
}

impl Drop for CompletionHandler {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            warn!(
                frame = self.frame,
                slot = self.slot,
                "Completion handler dropped without firing, releasing its slot"
            );
            release.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            release.run(self.slot);
        }
    }
}

impl SlotRelease {
    /// Free the slot, then return the permit. The permit goes back even if
    /// the slot was in the wrong state; the producer reports the violation
    /// on its next frame.
    fn run(self, slot: usize) {
        let freed = self
            .states
            .transition(slot, SlotState::Submitted, SlotState::Free);
        let released = self.gate.release();

        for err in [freed.err(), released.err()].into_iter().flatten() {
            self.counters.record_violation(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::simulated::{HostSlotBuffer, SimulatedGpu},
        sync::BufferSlotPool,
    };

    type HostPool = BufferSlotPool<HostSlotBuffer>;

    fn claimed_slot() -> (Arc<AvailabilityGate>, HostPool, Arc<CompletionCounters>) {
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 2, 16).unwrap();
        let gate = Arc::new(AvailabilityGate::new(2).unwrap());
        let counters = Arc::new(CompletionCounters::default());

        gate.acquire();
        pool.begin_write(0).unwrap().mark_submitted().unwrap();

        (gate, pool, counters)
    }

    #[test]
    fn completing_frees_the_slot_and_the_gate() {
        let (gate, pool, counters) = claimed_slot();
        let handler = CompletionHandler::new(
            0,
            0,
            Arc::clone(&gate),
            Arc::clone(pool.states()),
            Arc::clone(&counters),
        );
        assert_eq!(gate.available(), 1);

        handler.complete(CompletionStatus::Completed);
        assert_eq!(gate.available(), 2);
        assert_eq!(pool.state(0), SlotState::Free);
        assert_eq!(counters.completed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn gpu_failures_still_release() {
        let (gate, pool, counters) = claimed_slot();
        let handler = CompletionHandler::new(
            0,
            0,
            Arc::clone(&gate),
            Arc::clone(pool.states()),
            Arc::clone(&counters),
        );

        handler.complete(CompletionStatus::Failed("page fault".into()));
        assert_eq!(gate.available(), 2);
        assert_eq!(counters.failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropped_handlers_release_exactly_once() {
        let (gate, pool, counters) = claimed_slot();
        drop(CompletionHandler::new(
            0,
            0,
            Arc::clone(&gate),
            Arc::clone(pool.states()),
            Arc::clone(&counters),
        ));

        assert_eq!(gate.available(), 2);
        assert_eq!(pool.state(0), SlotState::Free);
        assert_eq!(counters.abandoned.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn completing_a_slot_that_was_never_submitted_is_recorded() {
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 1, 16).unwrap();
        let gate = Arc::new(AvailabilityGate::new(1).unwrap());
        let counters = Arc::new(CompletionCounters::default());
        gate.acquire();

        CompletionHandler::new(
            0,
            0,
            Arc::clone(&gate),
            Arc::clone(pool.states()),
            Arc::clone(&counters),
        )
        .complete(CompletionStatus::Completed);

        assert!(matches!(
            counters.violation(),
            Some(GateError::ProtocolViolation(_))
        ));
        // The permit still came back.
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn only_the_first_violation_is_kept() {
        let (gate, pool, counters) = claimed_slot();
        let handler = |frame| {
            CompletionHandler::new(
                frame,
                0,
                Arc::clone(&gate),
                Arc::clone(pool.states()),
                Arc::clone(&counters),
            )
        };

        handler(0).complete(CompletionStatus::Completed);
        assert!(counters.violation().is_none());

        handler(1).complete(CompletionStatus::Completed);
        let first = counters.violation();
        handler(2).complete(CompletionStatus::Completed);
        assert_eq!(counters.violation(), first);
        assert_eq!(gate.available(), 2);
    }
}
