//! The per-frame driver: claim a slot, fill it, submit it, move on.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{FrameError, SubmitError},
    gpu::{CompletionHandler, FrameSubmission, GpuDevice},
    scene::Scene,
    shader_types::{SlotLayout, Vertex, ViewportUniforms},
    sync::{completion::CompletionCounters, AvailabilityGate, BufferSlotPool},
    MAX_FRAMES_IN_FLIGHT,
};

/// Knobs for a [`FrameProducer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    /// How many buffer slots to allocate, and so how many frames the CPU may
    /// get ahead of the GPU.
    pub frames_in_flight: usize,
    /// Drawable size in pixels, passed to the vertex stage.
    pub viewport_size: [u32; 2],
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            viewport_size: [800, 600],
        }
    }
}

/// What happened to a single frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Handed to the GPU.
    Submitted { frame: u64, slot: usize },
    /// Submission failed; the slot went straight back to the pool.
    Skipped {
        frame: u64,
        slot: usize,
        error: SubmitError,
    },
}

/// Running totals for a [`FrameProducer`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub frames_skipped: u64,
    /// Completions the GPU reported as successful.
    pub frames_completed: u64,
    /// Completions the GPU reported as failed.
    pub frames_failed: u64,
    /// Completion handlers that were dropped instead of fired.
    pub frames_abandoned: u64,
    /// How many frames had to wait for the GPU before they could start.
    pub stalls: u64,
}

/// Drives one frame after another into a ring of buffer slots, never writing
/// a slot the GPU might still be reading.
pub struct FrameProducer<D: GpuDevice> {
    // Declared before `device` so slot memory goes away first.
    pool: BufferSlotPool<D::Buffer>,
    device: D,
    gate: Arc<AvailabilityGate>,
    counters: Arc<CompletionCounters>,
    scene: Box<dyn Scene>,
    layout: SlotLayout,
    uniforms: ViewportUniforms,
    /// Scratch space the scene writes into before it's copied to a slot.
    vertices: Vec<Vertex>,
    frame: u64,
    submitted: u64,
    skipped: u64,
    /// Stalls counted by gates from before the last reinitialization.
    retired_stalls: u64,
    device_lost: bool,
}

impl<D: GpuDevice> FrameProducer<D> {
    /// Allocate the slot pool and gate, sized for `scene`.
    #[tracing::instrument(level = "DEBUG", name = "FrameProducer::new", skip_all)]
    pub fn new(
        device: D,
        scene: Box<dyn Scene>,
        config: ProducerConfig,
    ) -> Result<Self, FrameError> {
        let layout = SlotLayout::for_vertices(scene.vertex_count());
        let (pool, gate) = Self::create_slots(&device, config.frames_in_flight, layout)?;

        info!(
            frames_in_flight = config.frames_in_flight,
            vertex_count = layout.vertex_count(),
            slot_bytes = layout.byte_size(),
            "Frame producer ready"
        );

        Ok(Self {
            pool,
            device,
            gate,
            counters: Arc::default(),
            vertices: vec![Vertex::default(); layout.vertex_count()],
            scene,
            layout,
            uniforms: ViewportUniforms::new(config.viewport_size[0], config.viewport_size[1]),
            frame: 0,
            submitted: 0,
            skipped: 0,
            retired_stalls: 0,
            device_lost: false,
        })
    }

    fn create_slots(
        device: &D,
        frames_in_flight: usize,
        layout: SlotLayout,
    ) -> Result<(BufferSlotPool<D::Buffer>, Arc<AvailabilityGate>), FrameError> {
        let pool = BufferSlotPool::initialize(device, frames_in_flight, layout.byte_size())?;
        let gate = Arc::new(AvailabilityGate::new(pool.len())?);
        Ok((pool, gate))
    }

    /// Produce and submit one frame.
    ///
    /// Blocks if every slot is still in flight. A failed submission is not an
    /// error here; it comes back as [`FrameOutcome::Skipped`] with the slot
    /// already released. Losing the device is an error, and every call after
    /// it fails until [`FrameProducer::reinitialize()`]. A broken slot
    /// protocol on the completion side fails this and every later call with
    /// [`GateError::ProtocolViolation`](crate::error::GateError::ProtocolViolation).
    pub fn draw_frame(&mut self) -> Result<FrameOutcome, FrameError> {
        let frame = self.frame;
        if let Some(violation) = self.counters.violation() {
            return Err(violation.into());
        }
        if self.device_lost {
            return Err(FrameError::DeviceLost { frame });
        }

        let slot = (frame % self.pool.len() as u64) as usize;

        // The one place the producer waits for the GPU.
        self.gate.acquire();
        trace!(frame, slot, "Acquired slot");

        let submission = match self.fill_slot(frame, slot) {
            Ok(submission) => submission,
            Err(err) => {
                // Nothing reached the GPU, so the permit goes straight back.
                self.gate.release()?;
                return Err(err);
            }
        };

        let on_complete = CompletionHandler::new(
            frame,
            slot,
            Arc::clone(&self.gate),
            Arc::clone(self.pool.states()),
            Arc::clone(&self.counters),
        );

        self.frame += 1;

        match self.device.submit(submission, on_complete) {
            Ok(()) => {
                self.submitted += 1;
                Ok(FrameOutcome::Submitted { frame, slot })
            }
            Err(SubmitError::DeviceLost) => {
                error!(frame, slot, "GPU device lost");
                self.device_lost = true;
                Err(FrameError::DeviceLost { frame })
            }
            Err(error) => {
                warn!(frame, slot, %error, "Skipping frame");
                self.skipped += 1;
                Ok(FrameOutcome::Skipped { frame, slot, error })
            }
        }
    }

    fn fill_slot(
        &mut self,
        frame: u64,
        slot: usize,
    ) -> Result<FrameSubmission<D::Buffer>, FrameError> {
        self.scene.update(frame, &mut self.vertices);

        let mut write = self.pool.begin_write(slot)?;
        self.layout
            .write(write.bytes_mut(), &self.vertices, &self.uniforms)?;
        let buffer = write.mark_submitted()?;

        Ok(FrameSubmission {
            frame,
            slot,
            buffer,
            layout: self.layout,
        })
    }

    /// Draw frames until `cancel` is set. The flag is checked between frames
    /// only, never while waiting for a slot.
    #[tracing::instrument(level = "DEBUG", name = "FrameProducer::run", skip_all)]
    pub fn run(&mut self, cancel: &AtomicBool) -> Result<FrameStats, FrameError> {
        while !cancel.load(Ordering::Relaxed) {
            self.draw_frame()?;
        }
        debug!(frame = self.frame, "Render loop cancelled");
        Ok(self.stats())
    }

    /// Draw exactly `count` frames (skipped ones included).
    pub fn run_frames(&mut self, count: u64) -> Result<FrameStats, FrameError> {
        for _ in 0..count {
            self.draw_frame()?;
        }
        Ok(self.stats())
    }

    /// Change the viewport size passed to the vertex stage, starting with the
    /// next frame.
    pub fn set_viewport_size(&mut self, width: u32, height: u32) {
        debug!(width, height, "Viewport resized");
        self.uniforms = ViewportUniforms::new(width, height);
    }

    /// Block until the GPU has finished with every submitted frame.
    pub fn wait_idle(&self) {
        self.gate.wait_until_idle();
    }

    /// Rebuild the slot pool and gate on a fresh device after the old one was
    /// lost. Waits for the old device to give back every slot first.
    #[tracing::instrument(level = "DEBUG", name = "FrameProducer::reinitialize", skip_all)]
    pub fn reinitialize(&mut self, device: D) -> Result<(), FrameError> {
        self.gate.wait_until_idle();

        let (pool, gate) = Self::create_slots(&device, self.pool.len(), self.layout)?;
        self.retired_stalls += self.gate.stalls();

        self.pool = pool;
        self.gate = gate;
        // The old device is only dropped after the pool that lived on it.
        drop(std::mem::replace(&mut self.device, device));
        self.device_lost = false;

        info!(frame = self.frame, "Frame producer reinitialized");
        Ok(())
    }

    /// Drain everything in flight and tear down.
    #[tracing::instrument(level = "DEBUG", name = "FrameProducer::shutdown", skip_all)]
    pub fn shutdown(self) -> FrameStats {
        self.wait_idle();
        let stats = self.stats();
        info!(?stats, "Frame producer shut down");
        stats
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_submitted: self.submitted,
            frames_skipped: self.skipped,
            frames_completed: self.counters.completed.load(Ordering::Relaxed),
            frames_failed: self.counters.failed.load(Ordering::Relaxed),
            frames_abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            stalls: self.retired_stalls + self.gate.stalls(),
        }
    }

    /// Number of the next frame to be drawn.
    #[inline]
    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn gate(&self) -> &AvailabilityGate {
        &self.gate
    }

    #[inline]
    pub fn pool(&self) -> &BufferSlotPool<D::Buffer> {
        &self.pool
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }
}

impl<D: GpuDevice> Drop for FrameProducer<D> {
    fn drop(&mut self) {
        // A completion handler firing after the pool is gone would be a
        // use-after-free on a real device.
        self.gate.wait_until_idle();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::{
        error::GateError,
        gpu::simulated::SimulatedGpu,
        scene::AnimatedTriangle,
        sync::SlotState,
    };

    #[test]
    fn queued_completion_on_a_free_slot_stops_the_producer_without_hanging() {
        let gpu = SimulatedGpu::with_latency(Duration::ZERO);
        let control = gpu.control();
        control.withhold_completion(0);

        let mut producer = FrameProducer::new(
            gpu,
            Box::new(AnimatedTriangle::default()),
            ProducerConfig::default(),
        )
        .unwrap();
        producer.draw_frame().unwrap();

        // Free slot 0 behind the GPU's back while frame 0 is still in flight.
        producer
            .pool
            .states()
            .transition(0, SlotState::Submitted, SlotState::Free)
            .unwrap();
        control.release_completion(0);
        producer.wait_idle();

        assert_eq!(producer.gate().available(), producer.gate().capacity());
        assert!(matches!(
            producer.draw_frame(),
            Err(FrameError::Gate(GateError::ProtocolViolation(_)))
        ));
        assert!(matches!(
            producer.run_frames(1),
            Err(FrameError::Gate(GateError::ProtocolViolation(_)))
        ));

        let (done, finished) = mpsc::channel();
        thread::spawn(move || {
            let stats = producer.shutdown();
            let _ = done.send(stats);
        });
        let stats = finished
            .recv_timeout(Duration::from_secs(5))
            .expect("shutdown hung after a protocol violation");
        assert_eq!(stats.frames_submitted, 1);
    }

    #[test]
    fn violations_are_not_cleared_by_reinitializing() {
        let gpu = SimulatedGpu::immediate();
        let mut producer = FrameProducer::new(
            gpu,
            Box::new(AnimatedTriangle::default()),
            ProducerConfig::default(),
        )
        .unwrap();
        producer.draw_frame().unwrap();

        // Frame 0 already completed, so slot 0 is free: completing it again
        // is a double release.
        CompletionHandler::new(
            0,
            0,
            Arc::clone(&producer.gate),
            Arc::clone(producer.pool.states()),
            Arc::clone(&producer.counters),
        )
        .complete(crate::gpu::CompletionStatus::Completed);

        producer.reinitialize(SimulatedGpu::immediate()).unwrap();
        assert!(matches!(
            producer.draw_frame(),
            Err(FrameError::Gate(GateError::ProtocolViolation(_)))
        ));
    }
}
