//! camstream CLI
//!
//! Command-line interface for inspecting devices and running the pipeline.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use camstream::{Camera, Config, PixelFormat, V4l2Backend, VideoBackend, VirtualBackend};

#[derive(Parser)]
#[command(name = "camstream")]
#[command(about = "V4L2 camera streaming pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device identification and capabilities
    Info {
        /// Video node to query
        #[arg(short, long, default_value = "/dev/video0")]
        device: PathBuf,
    },

    /// Run the capture pipeline
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Camera node (overrides the config file)
        #[arg(short, long)]
        device: Option<PathBuf>,

        /// Capture width
        #[arg(long)]
        width: Option<u32>,

        /// Capture height
        #[arg(long)]
        height: Option<u32>,

        /// Pixel format (YUYV, MJPEG, NV12, ...)
        #[arg(short, long)]
        format: Option<String>,

        /// Target framerate
        #[arg(long)]
        fps: Option<u32>,

        /// Buffers per queue
        #[arg(long)]
        nbufs: Option<u32>,

        /// Scale of the full-resolution ISP tap relative to the sensor
        #[arg(long)]
        high_res_factor: Option<f32>,

        /// Scale of the reduced ISP tap; non-zero feeds the encoders from it
        #[arg(long)]
        low_res_factor: Option<f32>,

        /// Disable descriptor sharing, copy frames between stages
        #[arg(long)]
        no_dma: bool,

        /// Run against the virtual backend instead of real hardware
        #[arg(long = "virtual")]
        virtual_backend: bool,
    },
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = handle_shutdown_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camstream=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { device } => cmd_info(device),
        Commands::Run {
            config,
            device,
            width,
            height,
            format,
            fps,
            nbufs,
            high_res_factor,
            low_res_factor,
            no_dma,
            virtual_backend,
        } => {
            let mut cfg = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            if let Some(device) = device {
                cfg.camera.path = device;
            }
            if let Some(width) = width {
                cfg.camera.width = width;
            }
            if let Some(height) = height {
                cfg.camera.height = height;
            }
            if let Some(fps) = fps {
                cfg.camera.fps = fps;
            }
            if let Some(nbufs) = nbufs {
                cfg.camera.nbufs = nbufs;
            }
            if let Some(high_res_factor) = high_res_factor {
                cfg.camera.high_res_factor = high_res_factor;
            }
            if let Some(low_res_factor) = low_res_factor {
                cfg.camera.low_res_factor = low_res_factor;
            }
            if let Some(format) = format {
                cfg.camera.format = Some(
                    PixelFormat::parse(&format)
                        .ok_or_else(|| anyhow::anyhow!("unknown pixel format: {format}"))?,
                );
            }
            if no_dma {
                cfg.camera.allow_dma = false;
            }
            cmd_run(cfg, virtual_backend)
        }
    }
}

fn cmd_info(device: PathBuf) -> anyhow::Result<()> {
    let backend = V4l2Backend::new();
    let fd = backend.open(&device)?;
    let caps = backend.query_capabilities(std::os::fd::AsRawFd::as_raw_fd(&fd))?;

    println!("Device: {}", device.display());
    println!("  Card: {}", caps.card);
    println!("  Driver: {}", caps.driver);
    println!("  Bus: {}", caps.bus_info);
    println!("  Capabilities: {:?}", caps.capabilities);
    println!("  Device caps: {:?}", caps.device_caps);
    println!(
        "  Multi-planar: {}",
        if caps.device_caps.is_mplane() { "yes" } else { "no" }
    );

    Ok(())
}

fn cmd_run(config: Config, virtual_backend: bool) -> anyhow::Result<()> {
    install_signal_handlers();

    let camera = if virtual_backend {
        let backend = Arc::new(VirtualBackend::new());
        let camera = Camera::open(&config, backend.clone())?;
        // Synthesize frames at the configured rate and let the virtual
        // encoders finish work as soon as it is queued.
        let interval_us = camstream::Framerate::new(config.camera.fps.max(1), 1).interval_us();
        backend.start_frame_source(
            camera.camera_device().fd(),
            interval_us,
            config.camera.width * 2,
        );
        for link in camera.graph().links() {
            for sink in &link.sinks {
                backend.set_auto_complete(sink.device().fd(), true);
            }
        }
        camera
    } else {
        Camera::open(&config, Arc::new(V4l2Backend::new()))?
    };

    tracing::info!(
        "streaming {} {}x{} @ {} fps (ctrl-c to stop)",
        config.camera.path.display(),
        config.camera.width,
        config.camera.height,
        config.camera.fps
    );

    camera.run(&RUNNING).map_err(|e| {
        tracing::error!("pipeline failed: {}", e);
        anyhow::Error::from(e)
    })?;

    println!("Shut down cleanly.");
    Ok(())
}
