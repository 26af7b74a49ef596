use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use frame_pacer::{error::GateError, sync::AvailabilityGate};
use proptest::prelude::*;

#[derive(Copy, Clone, Debug)]
enum Op {
    TryAcquire,
    Release,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::TryAcquire), Just(Op::Release)]
}

proptest! {
    #[test]
    fn available_stays_between_zero_and_capacity(
        capacity in 1usize..8,
        ops in prop::collection::vec(op(), 0..64),
    ) {
        let gate = AvailabilityGate::new(capacity).unwrap();
        let mut expected = capacity;

        for op in ops {
            match op {
                Op::TryAcquire => {
                    let acquired = gate.try_acquire();
                    prop_assert_eq!(acquired, expected > 0);
                    if acquired {
                        expected -= 1;
                    }
                }
                Op::Release => {
                    let released = gate.release();
                    if expected == capacity {
                        prop_assert!(matches!(released, Err(GateError::ProtocolViolation(_))));
                    } else {
                        prop_assert!(released.is_ok());
                        expected += 1;
                    }
                }
            }

            prop_assert_eq!(gate.available(), expected);
            prop_assert_eq!(gate.in_flight(), capacity - expected);
        }
    }
}

#[test]
fn concurrent_holders_never_exceed_capacity() {
    const CAPACITY: usize = 3;

    let gate = Arc::new(AvailabilityGate::new(CAPACITY).unwrap());
    let holders = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers = (0..8)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let holders = Arc::clone(&holders);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..200 {
                    gate.acquire();
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    holders.fetch_sub(1, Ordering::SeqCst);
                    gate.release().unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
    assert_eq!(gate.available(), CAPACITY);
}
