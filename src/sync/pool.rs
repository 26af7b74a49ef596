//! A fixed ring of buffer slots, allocated once and reused every frame.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use tracing::debug;

use crate::{
    error::{AllocationError, GateError},
    gpu::{GpuDevice, SlotBuffer},
};

/// What a buffer slot is being used for right now.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Nobody is touching it.
    Free = 0,
    /// The producer holds it and is writing this frame's data.
    Writing = 1,
    /// Handed to the GPU, which may still be reading it.
    Submitted = 2,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::Writing,
            _ => Self::Submitted,
        }
    }
}

/// Per-slot [`SlotState`]s, shared with completion handlers.
#[derive(Debug)]
pub(crate) struct SlotStates {
    cells: Box<[AtomicU8]>,
}

impl SlotStates {
    fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU8::new(SlotState::Free as u8)).collect(),
        }
    }

    pub(crate) fn get(&self, slot: usize) -> SlotState {
        SlotState::from_u8(self.cells[slot].load(Ordering::Acquire))
    }

    /// Move `slot` from `from` to `to`, or report what it actually was.
    ///
    /// Acquire/release ordering here is what makes the GPU's read of a slot
    /// happen-before the producer's next write to it.
    pub(crate) fn transition(
        &self,
        slot: usize,
        from: SlotState,
        to: SlotState,
    ) -> Result<(), GateError> {
        self.cells[slot]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                GateError::ProtocolViolation(format!(
                    "slot {slot} expected to be {from:?} on the way to {to:?}, but was {:?}",
                    SlotState::from_u8(actual)
                ))
            })
    }
}

/// `N` equally sized, independently owned GPU-visible buffers.
///
/// The pool doesn't lock anything. Exclusive access to a slot comes from the
/// [`crate::sync::AvailabilityGate`] protocol, and the per-slot [`SlotState`]
/// turns any breach of that protocol into a [`GateError::ProtocolViolation`]
/// instead of a silent overwrite.
#[derive(Debug)]
pub struct BufferSlotPool<B> {
    slots: Box<[B]>,
    slot_byte_size: usize,
    states: Arc<SlotStates>,
}

impl<B: SlotBuffer> BufferSlotPool<B> {
    /// Allocate `n` slots of at least `slot_byte_size` bytes each from `device`.
    #[tracing::instrument(level = "DEBUG", skip(device))]
    pub fn initialize<D>(
        device: &D,
        n: usize,
        slot_byte_size: usize,
    ) -> Result<Self, AllocationError>
    where
        D: GpuDevice<Buffer = B>,
    {
        if n == 0 {
            return Err(AllocationError::NoSlots);
        }

        let slots = (0..n)
            .map(|slot| device.allocate_slot(slot, slot_byte_size))
            .collect::<Result<Box<[_]>, _>>()?;

        if let Some((slot, buffer)) = slots
            .iter()
            .enumerate()
            .find(|(_, b)| b.byte_len() < slot_byte_size)
        {
            return Err(AllocationError::OutOfMemory {
                slot,
                size: slot_byte_size,
                reason: format!("device handed back only {} bytes", buffer.byte_len()),
            });
        }

        debug!(n, slot_byte_size, "Allocated buffer slot pool");

        Ok(Self {
            slots,
            slot_byte_size,
            states: Arc::new(SlotStates::new(n)),
        })
    }

    /// The slot at `index mod n`.
    ///
    /// Nothing stops you from reading through this while the slot is being
    /// written; that's what the gate is for.
    #[inline]
    pub fn slot(&self, index: usize) -> &B {
        &self.slots[index % self.slots.len()]
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false: a pool has at least one slot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn slot_byte_size(&self) -> usize {
        self.slot_byte_size
    }

    pub fn state(&self, index: usize) -> SlotState {
        self.states.get(index % self.slots.len())
    }

    pub(crate) fn states(&self) -> &Arc<SlotStates> {
        &self.states
    }

    /// Claim the slot at `index mod n` for writing.
    ///
    /// The caller must already hold a permit from the gate. Fails if the slot
    /// is still being written or still on the GPU.
    pub fn begin_write(&self, index: usize) -> Result<SlotWrite<'_, B>, GateError> {
        let slot = index % self.slots.len();
        self.states
            .transition(slot, SlotState::Free, SlotState::Writing)?;

        Ok(SlotWrite {
            pool: self,
            slot,
            submitted: false,
        })
    }

    /// Copy out the contents of a free slot.
    pub fn snapshot(&self, index: usize) -> Result<Vec<u8>, GateError> {
        let write = self.begin_write(index)?;
        Ok(write.bytes().to_vec())
    }
}

/// Exclusive write access to one slot.
///
/// Dropping this without calling [`SlotWrite::mark_submitted()`] hands the slot
/// straight back to the pool.
#[derive(Debug)]
pub struct SlotWrite<'a, B: SlotBuffer> {
    pool: &'a BufferSlotPool<B>,
    slot: usize,
    submitted: bool,
}

impl<'a, B: SlotBuffer> SlotWrite<'a, B> {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn buffer(&self) -> &'a B {
        &self.pool.slots[self.slot]
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the slot is in the Writing state and this guard is the only
        // thing that moved it there.
        unsafe { self.buffer().bytes() }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` keeps us from handing out two of
        // these at once.
        unsafe { self.buffer().bytes_mut() }
    }

    /// Finish writing. From here on the slot belongs to the GPU until its
    /// completion handler fires.
    pub fn mark_submitted(mut self) -> Result<B, GateError> {
        self.pool
            .states
            .transition(self.slot, SlotState::Writing, SlotState::Submitted)?;
        self.submitted = true;
        Ok(self.buffer().clone())
    }
}

impl<B: SlotBuffer> Drop for SlotWrite<'_, B> {
    fn drop(&mut self) {
        if !self.submitted {
            // Can only fail if someone else changed a slot we own, which the
            // transition above rules out.
            let _ = self
                .pool
                .states
                .transition(self.slot, SlotState::Writing, SlotState::Free);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::simulated::SimulatedGpu,
        shader_types::{SlotLayout, Vertex, ViewportUniforms},
    };

    #[test]
    fn zero_slots_is_an_allocation_error() {
        let gpu = SimulatedGpu::immediate();
        assert!(matches!(
            BufferSlotPool::initialize(&gpu, 0, 64),
            Err(AllocationError::NoSlots)
        ));
    }

    #[test]
    fn impossible_allocations_fail_instead_of_aborting() {
        let gpu = SimulatedGpu::immediate();
        assert!(matches!(
            BufferSlotPool::initialize(&gpu, 3, usize::MAX),
            Err(AllocationError::OutOfMemory { slot: 0, .. })
        ));
    }

    #[test]
    fn slots_are_indexed_modulo_their_count() {
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 3, 64).unwrap();
        assert_eq!(pool.len(), 3);
        assert!(pool.slot(1).same_memory(pool.slot(4)));
        assert!(!pool.slot(0).same_memory(pool.slot(1)));
        assert!(pool.slot(2).byte_len() >= 64);
    }

    #[test]
    fn a_slot_cannot_be_written_twice_or_while_submitted() {
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 2, 16).unwrap();

        let write = pool.begin_write(0).unwrap();
        assert_eq!(pool.state(0), SlotState::Writing);
        assert!(matches!(
            pool.begin_write(2),
            Err(GateError::ProtocolViolation(_))
        ));

        write.mark_submitted().unwrap();
        assert_eq!(pool.state(0), SlotState::Submitted);
        assert!(pool.begin_write(0).is_err());

        pool.states()
            .transition(0, SlotState::Submitted, SlotState::Free)
            .unwrap();
        assert!(pool.begin_write(0).is_ok());
    }

    #[test]
    fn dropping_an_unsubmitted_write_frees_the_slot() {
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 1, 16).unwrap();
        {
            let mut write = pool.begin_write(0).unwrap();
            write.bytes_mut().fill(7);
        }
        assert_eq!(pool.state(0), SlotState::Free);
        assert_eq!(pool.snapshot(0).unwrap(), vec![7; 16]);
    }

    #[test]
    fn geometry_survives_a_trip_through_slot_memory() {
        let layout = SlotLayout::for_vertices(3);
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 3, layout.byte_size()).unwrap();

        let vertices = [
            Vertex::new([-1.0, -1.0], [1.0, 0.0, 0.0, 1.0]),
            Vertex::new([1.0, -1.0], [0.0, 1.0, 0.0, 1.0]),
            Vertex::new([0.0, 1.0], [0.0, 0.0, 1.0, 1.0]),
        ];
        let uniforms = ViewportUniforms::new(640, 480);

        {
            let mut write = pool.begin_write(1).unwrap();
            layout
                .write(write.bytes_mut(), &vertices, &uniforms)
                .unwrap();
        }

        let bytes = pool.snapshot(1).unwrap();
        let (read_vertices, read_uniforms) = layout.read(&bytes).unwrap();
        assert_eq!(read_vertices, vertices);
        assert_eq!(read_uniforms, uniforms);
    }
}
