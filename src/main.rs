use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use color_eyre::{eyre::Context, Result};
use frame_pacer::{
    gpu::{simulated::SimulatedGpu, GpuDevice},
    producer::{FrameProducer, FrameStats, ProducerConfig},
    scene::{AnimatedTriangle, Scene, SpriteGrid},
    vulkan::VulkanGpu,
    MAX_FRAMES_IN_FLIGHT,
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(
    name = "frame-pacer",
    about = "Feed animated geometry to a GPU through a ring of reusable buffer slots"
)]
struct Args {
    /// Where frames are executed
    #[arg(long, value_enum, default_value_t = Backend::Simulated)]
    backend: Backend,

    /// What gets drawn
    #[arg(long, value_enum, default_value_t = SceneKind::Sprites)]
    scene: SceneKind,

    /// Stop after this many frames
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Stop after this many seconds, whichever comes first
    #[arg(long, value_name = "SECONDS")]
    duration: Option<f64>,

    /// Number of buffer slots
    #[arg(long, default_value_t = MAX_FRAMES_IN_FLIGHT)]
    frames_in_flight: usize,

    /// Time the simulated GPU spends on each frame
    #[arg(long, value_name = "MS", default_value_t = 4)]
    gpu_latency_ms: u64,

    /// Viewport width in pixels
    #[arg(long, default_value_t = 800)]
    width: u32,

    /// Viewport height in pixels
    #[arg(long, default_value_t = 600)]
    height: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// A CPU thread playing the part of the GPU
    Simulated,
    /// A headless Vulkan device
    Vulkan,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SceneKind {
    Triangle,
    Sprites,
}

fn main() -> Result<()> {
    setup_logging()?;

    let args = Args::parse();
    debug!(?args, "Parsed arguments");

    let scene: Box<dyn Scene> = match args.scene {
        SceneKind::Triangle => Box::new(AnimatedTriangle::default()),
        SceneKind::Sprites => Box::new(SpriteGrid::default()),
    };
    let config = ProducerConfig {
        frames_in_flight: args.frames_in_flight,
        viewport_size: [args.width, args.height],
    };

    let stats = match args.backend {
        Backend::Simulated => {
            let gpu = SimulatedGpu::with_latency(Duration::from_millis(args.gpu_latency_ms));
            run(gpu, scene, config, &args)?
        }
        Backend::Vulkan => {
            info!("Initializing Vulkan");
            let gpu = unsafe { VulkanGpu::create()? };
            run(gpu, scene, config, &args)?
        }
    };

    info!(
        submitted = stats.frames_submitted,
        completed = stats.frames_completed,
        skipped = stats.frames_skipped,
        stalls = stats.stalls,
        "Goodbye."
    );

    Ok(())
}

/// Drive frames until the frame budget or the time budget runs out.
#[tracing::instrument(level = "DEBUG", skip_all)]
fn run<D: GpuDevice>(
    device: D,
    scene: Box<dyn Scene>,
    config: ProducerConfig,
    args: &Args,
) -> Result<FrameStats> {
    let mut producer =
        FrameProducer::new(device, scene, config).wrap_err("Error creating the frame producer")?;

    // Cancellation is only ever checked between frames, so a timer thread
    // setting this flag can't interrupt a wait on the GPU.
    let cancel = Arc::new(AtomicBool::new(false));
    if let Some(seconds) = args.duration {
        let cancel = Arc::clone(&cancel);
        let budget = Duration::try_from_secs_f64(seconds).wrap_err("Invalid --duration")?;
        thread::spawn(move || {
            thread::sleep(budget);
            cancel.store(true, Ordering::Relaxed);
        });
    }

    info!(frames = args.frames, "Running frame loop");
    let started = Instant::now();
    while producer.frame_index() < args.frames && !cancel.load(Ordering::Relaxed) {
        producer.draw_frame()?;
    }

    let stats = producer.shutdown();
    let elapsed = started.elapsed().as_secs_f64();
    info!(
        fps = stats.frames_submitted as f64 / elapsed.max(f64::EPSILON),
        elapsed_secs = elapsed,
        "Frame loop finished"
    );

    Ok(stats)
}

fn setup_logging() -> Result<()> {
    use tracing_subscriber::{prelude::*, EnvFilter};
    use tracing_tree::HierarchicalLayer;

    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(HierarchicalLayer::new(4).with_bracketed_fields(true))
        .with(EnvFilter::from_default_env())
        .try_init()?;

    Ok(())
}
