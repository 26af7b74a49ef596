//! The counting primitive bounding how many slots may be claimed at once.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::GateError;

/// A counting semaphore over the free buffer slots.
///
/// The count starts at the capacity. [`AvailabilityGate::acquire()`] takes one
/// (blocking while there are none) and [`AvailabilityGate::release()`] gives
/// one back. Giving back more than was taken is a [`GateError::ProtocolViolation`],
/// never a silent clamp.
///
/// Safe to share between the producer thread and whatever thread delivers GPU
/// completion notifications.
#[derive(Debug)]
pub struct AvailabilityGate {
    capacity: usize,
    state: Mutex<GateState>,
    released: Condvar,
}

#[derive(Debug)]
struct GateState {
    available: usize,
    /// How many calls to `acquire()` found the gate empty and had to wait.
    stalls: u64,
}

impl AvailabilityGate {
    /// Create a gate with `capacity` free slots.
    pub fn new(capacity: usize) -> Result<Self, GateError> {
        if capacity == 0 {
            return Err(GateError::ZeroCapacity);
        }

        Ok(Self {
            capacity,
            state: Mutex::new(GateState {
                available: capacity,
                stalls: 0,
            }),
            released: Condvar::new(),
        })
    }

    /// Claim a slot, waiting for as long as it takes for one to be released.
    ///
    /// There is deliberately no timeout. Cancellation belongs between frames,
    /// not in the middle of a wait.
    pub fn acquire(&self) {
        let mut state = self.lock();

        if state.available == 0 {
            state.stalls += 1;
            trace!("No free slots, waiting for a GPU completion");
            state = self
                .released
                .wait_while(state, |s| s.available == 0)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state.available -= 1;
    }

    /// Claim a slot only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.available == 0 {
            false
        } else {
            state.available -= 1;
            true
        }
    }

    /// Give a slot back.
    ///
    /// Fails if every slot is already free, since that means something was
    /// released without having been acquired.
    pub fn release(&self) -> Result<(), GateError> {
        let mut state = self.lock();
        if state.available == self.capacity {
            return Err(GateError::ProtocolViolation(format!(
                "released a slot while all {} were already free",
                self.capacity
            )));
        }

        state.available += 1;
        drop(state);

        // Blocked acquire() and wait_until_idle() callers share this condvar.
        self.released.notify_all();
        Ok(())
    }

    /// Block until every slot is free, i.e. nothing is in flight.
    pub fn wait_until_idle(&self) {
        let state = self.lock();
        let _state = self
            .released
            .wait_while(state, |s| s.available < self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots free right now.
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Number of slots currently claimed (being written or on the GPU).
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// How many acquires have had to wait so far.
    pub fn stalls(&self) -> u64 {
        self.lock().stalls
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // The state is a pair of integers that are never left half-updated,
        // so a panic elsewhere while holding the lock doesn't invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(AvailabilityGate::new(0).unwrap_err(), GateError::ZeroCapacity);
    }

    #[test]
    fn acquire_and_release_move_the_count() {
        let gate = AvailabilityGate::new(3).unwrap();
        assert_eq!(gate.available(), 3);

        gate.acquire();
        gate.acquire();
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.in_flight(), 2);

        gate.release().unwrap();
        assert_eq!(gate.available(), 2);
        assert_eq!(gate.stalls(), 0);
    }

    #[test]
    fn releasing_a_full_gate_is_a_protocol_violation() {
        let gate = AvailabilityGate::new(3).unwrap();
        assert!(matches!(
            gate.release(),
            Err(GateError::ProtocolViolation(_))
        ));
        // The failed release must not have moved the count.
        assert_eq!(gate.available(), 3);

        gate.acquire();
        gate.release().unwrap();
        assert!(matches!(
            gate.release(),
            Err(GateError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn try_acquire_never_goes_below_zero() {
        let gate = AvailabilityGate::new(2).unwrap();
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert_eq!(gate.available(), 0);
    }

    #[test]
    fn acquire_blocks_until_another_thread_releases() {
        let gate = Arc::new(AvailabilityGate::new(1).unwrap());
        gate.acquire();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                gate.acquire();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        gate.release().unwrap();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(gate.available(), 0);
        assert_eq!(gate.stalls(), 1);
    }

    #[test]
    fn wait_until_idle_returns_once_everything_is_released() {
        let gate = Arc::new(AvailabilityGate::new(3).unwrap());
        gate.acquire();
        gate.acquire();

        let releaser = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate.release().unwrap();
                thread::sleep(Duration::from_millis(20));
                gate.release().unwrap();
            })
        };

        gate.wait_until_idle();
        assert_eq!(gate.available(), 3);
        releaser.join().unwrap();
    }
}
