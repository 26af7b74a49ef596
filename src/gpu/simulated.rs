//! A GPU timeline played by a CPU thread.
//!
//! Work is executed in submission order, like a single hardware queue. Each
//! job "reads" its slot by decoding the vertices and uniforms out of it, then
//! fires the completion handler from the worker thread. Hooks let tests hold
//! back completions, fail submissions and lose the device.

use std::{
    cell::UnsafeCell,
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, error, trace, warn};

use super::{CompletionHandler, CompletionStatus, FrameSubmission, GpuDevice, SlotBuffer};
use crate::{
    error::{AllocationError, SubmitError},
    shader_types::{Vertex, ViewportUniforms},
};

/// Plain heap memory standing in for a host-visible GPU buffer.
#[derive(Clone)]
pub struct HostSlotBuffer(Arc<HostMemory>);

struct HostMemory {
    bytes: UnsafeCell<Box<[u8]>>,
    len: usize,
}

// SAFETY: access is only ever handed out through the unsafe `SlotBuffer`
// methods, whose callers promise exclusivity.
unsafe impl Sync for HostMemory {}

impl HostSlotBuffer {
    fn allocate(slot: usize, size: usize) -> Result<Self, AllocationError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|e| AllocationError::OutOfMemory {
                slot,
                size,
                reason: e.to_string(),
            })?;
        bytes.resize(size, 0);

        Ok(Self(Arc::new(HostMemory {
            bytes: UnsafeCell::new(bytes.into_boxed_slice()),
            len: size,
        })))
    }

    /// True if both handles point at the same memory.
    pub fn same_memory(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl SlotBuffer for HostSlotBuffer {
    fn byte_len(&self) -> usize {
        self.0.len
    }

    unsafe fn bytes(&self) -> &[u8] {
        &*self.0.bytes.get()
    }

    unsafe fn bytes_mut(&self) -> &mut [u8] {
        &mut *self.0.bytes.get()
    }
}

impl fmt::Debug for HostSlotBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSlotBuffer")
            .field("byte_len", &self.byte_len())
            .finish()
    }
}

/// When the simulated GPU fires completion handlers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Execute and complete inside `submit()`, on the producer's thread.
    Immediate,
    /// Queue work for a worker thread that spends `latency` on each job.
    Queued { latency: Duration },
}

/// What the simulated GPU read out of a slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumedFrame {
    pub frame: u64,
    pub slot: usize,
    pub vertices: Vec<Vertex>,
    pub uniforms: ViewportUniforms,
}

struct Job {
    submission: FrameSubmission<HostSlotBuffer>,
    on_complete: CompletionHandler,
}

#[derive(Default)]
struct Timeline {
    /// Frames whose completion is being held back.
    held: Mutex<HashSet<u64>>,
    held_changed: Condvar,
    /// Submissions that should be rejected, by frame number.
    faults: Mutex<HashMap<u64, SubmitError>>,
    lost: AtomicBool,
    consumed: Mutex<Vec<ConsumedFrame>>,
    submitted: AtomicU64,
}

/// A [`GpuDevice`] that runs on the CPU.
pub struct SimulatedGpu {
    mode: CompletionMode,
    timeline: Arc<Timeline>,
    queue: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedGpu {
    pub fn new(mode: CompletionMode) -> Self {
        let timeline = Arc::new(Timeline::default());

        let (queue, worker) = match mode {
            CompletionMode::Immediate => (None, None),
            CompletionMode::Queued { latency } => {
                let (sender, receiver) = mpsc::channel::<Job>();
                let timeline = Arc::clone(&timeline);
                let worker = thread::Builder::new()
                    .name("simulated-gpu".into())
                    .spawn(move || {
                        for job in receiver {
                            if !latency.is_zero() {
                                thread::sleep(latency);
                            }
                            timeline.wait_while_held(job.submission.frame);
                            timeline.execute(job);
                        }
                        trace!("Simulated GPU queue closed");
                    });
                match worker {
                    Ok(worker) => (Some(sender), Some(worker)),
                    Err(e) => {
                        // With no queue, every submission is rejected as failed.
                        error!(error = %e, "Couldn't start the simulated GPU worker");
                        (None, None)
                    }
                }
            }
        };

        Self {
            mode,
            timeline,
            queue,
            worker,
        }
    }

    /// Completions fire synchronously from `submit()`.
    pub fn immediate() -> Self {
        Self::new(CompletionMode::Immediate)
    }

    /// Completions fire from a worker thread, `latency` after the previous one.
    pub fn with_latency(latency: Duration) -> Self {
        Self::new(CompletionMode::Queued { latency })
    }

    #[inline]
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// A handle for steering this GPU from another thread.
    pub fn control(&self) -> GpuControl {
        GpuControl(Arc::clone(&self.timeline))
    }

    pub fn is_lost(&self) -> bool {
        self.timeline.lost.load(Ordering::SeqCst)
    }

    /// Everything the GPU has read so far, in execution order.
    pub fn consumed(&self) -> Vec<ConsumedFrame> {
        lock(&self.timeline.consumed).clone()
    }

    /// Number of submissions accepted so far.
    pub fn submitted(&self) -> u64 {
        self.timeline.submitted.load(Ordering::SeqCst)
    }
}

/// Fault injection and inspection for a [`SimulatedGpu`], usable while the
/// GPU itself is owned by a producer on another thread.
#[derive(Clone)]
pub struct GpuControl(Arc<Timeline>);

impl GpuControl {
    /// Hold back the completion of `frame` (and, since the queue is in-order,
    /// of everything submitted after it) until [`GpuControl::release_completion()`].
    ///
    /// Only meaningful in [`CompletionMode::Queued`].
    pub fn withhold_completion(&self, frame: u64) {
        lock(&self.0.held).insert(frame);
    }

    pub fn release_completion(&self, frame: u64) {
        lock(&self.0.held).remove(&frame);
        self.0.held_changed.notify_all();
    }

    /// Make the submission of `frame` fail with `error`.
    pub fn fail_submission(&self, frame: u64, error: SubmitError) {
        lock(&self.0.faults).insert(frame, error);
    }

    /// Lose the device now. Work still queued completes with an error and
    /// every later submission fails with [`SubmitError::DeviceLost`].
    pub fn lose_device(&self) {
        self.0.lost.store(true, Ordering::SeqCst);
    }

    pub fn consumed(&self) -> Vec<ConsumedFrame> {
        lock(&self.0.consumed).clone()
    }

    pub fn submitted(&self) -> u64 {
        self.0.submitted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for GpuControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuControl")
            .field("lost", &self.0.lost.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedGpu {
    fn default() -> Self {
        Self::immediate()
    }
}

impl fmt::Debug for SimulatedGpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedGpu")
            .field("mode", &self.mode)
            .field("lost", &self.is_lost())
            .field("submitted", &self.submitted())
            .finish()
    }
}

impl GpuDevice for SimulatedGpu {
    type Buffer = HostSlotBuffer;

    fn allocate_slot(
        &self,
        slot: usize,
        byte_size: usize,
    ) -> Result<HostSlotBuffer, AllocationError> {
        HostSlotBuffer::allocate(slot, byte_size)
    }

    fn submit(
        &self,
        submission: FrameSubmission<HostSlotBuffer>,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError> {
        if self.is_lost() {
            return Err(SubmitError::DeviceLost);
        }

        if matches!(self.mode, CompletionMode::Queued { .. }) && self.queue.is_none() {
            return Err(SubmitError::Failed("simulated GPU worker isn't running".into()));
        }

        if let Some(error) = lock(&self.timeline.faults).remove(&submission.frame) {
            debug!(frame = submission.frame, %error, "Rejecting submission");
            if error == SubmitError::DeviceLost {
                self.timeline.lost.store(true, Ordering::SeqCst);
            }
            return Err(error);
        }

        self.timeline.submitted.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            submission,
            on_complete,
        };

        match &self.queue {
            None => self.timeline.execute(job),
            Some(queue) => {
                if let Err(mpsc::SendError(job)) = queue.send(job) {
                    // The worker is gone; the handler is dropped with the job,
                    // which gives the slot back.
                    drop(job);
                    return Err(SubmitError::DeviceLost);
                }
            }
        }

        Ok(())
    }
}

impl Drop for SimulatedGpu {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit. Anything still
        // held would keep it waiting forever.
        self.queue.take();
        lock(&self.timeline.held).clear();
        self.timeline.held_changed.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Simulated GPU worker panicked");
            }
        }
    }
}

impl Timeline {
    fn wait_while_held(&self, frame: u64) {
        let held = lock(&self.held);
        let _held = self
            .held_changed
            .wait_while(held, |held| held.contains(&frame))
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn execute(&self, job: Job) {
        let Job {
            submission,
            on_complete,
        } = job;

        if self.lost.load(Ordering::SeqCst) {
            on_complete.complete(CompletionStatus::Failed("device lost".into()));
            return;
        }

        // SAFETY: the slot is in the Submitted state until `on_complete` fires,
        // so the producer won't write it while we read.
        let bytes = unsafe { submission.buffer.bytes() };
        let status = match submission.layout.read(bytes) {
            Ok((vertices, uniforms)) => {
                lock(&self.consumed).push(ConsumedFrame {
                    frame: submission.frame,
                    slot: submission.slot,
                    vertices,
                    uniforms,
                });
                CompletionStatus::Completed
            }
            Err(e) => CompletionStatus::Failed(e.to_string()),
        };

        on_complete.complete(status);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        shader_types::SlotLayout,
        sync::{completion::CompletionCounters, AvailabilityGate, BufferSlotPool, SlotState},
    };

    #[test]
    fn buffer_length_is_readable_while_the_slot_is_being_written() {
        let gpu = SimulatedGpu::immediate();
        let pool = BufferSlotPool::initialize(&gpu, 1, 48).unwrap();

        let mut write = pool.begin_write(0).unwrap();
        write.bytes_mut()[0] = 7;
        let buffer = pool.slot(0);
        assert_eq!(buffer.byte_len(), 48);
        assert_eq!(format!("{buffer:?}"), "HostSlotBuffer { byte_len: 48 }");
    }

    #[test]
    fn queued_gpu_without_a_worker_rejects_submissions() {
        let gpu = SimulatedGpu {
            mode: CompletionMode::Queued {
                latency: Duration::ZERO,
            },
            timeline: Arc::default(),
            queue: None,
            worker: None,
        };
        let layout = SlotLayout::for_vertices(0);
        let pool = BufferSlotPool::initialize(&gpu, 1, layout.byte_size()).unwrap();
        let gate = Arc::new(AvailabilityGate::new(1).unwrap());
        let counters = Arc::new(CompletionCounters::default());

        gate.acquire();
        let buffer = pool.begin_write(0).unwrap().mark_submitted().unwrap();
        let handler = CompletionHandler::new(
            0,
            0,
            Arc::clone(&gate),
            Arc::clone(pool.states()),
            Arc::clone(&counters),
        );
        let submission = FrameSubmission {
            frame: 0,
            slot: 0,
            buffer,
            layout,
        };

        assert!(matches!(
            gpu.submit(submission, handler),
            Err(SubmitError::Failed(_))
        ));
        assert_eq!(gpu.submitted(), 0);
        assert_eq!(gate.available(), 1);
        assert_eq!(pool.state(0), SlotState::Free);
    }
}
