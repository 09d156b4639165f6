mod buffer;
mod config;
mod core;
mod error;
mod screencast;
mod wayland;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::RecordingOptions;
use crate::core::control::{self, Bus, ControlHandle};
use crate::core::shutdown;
use crate::error::RecorderError;
use crate::screencast::{OutputFactory, Session, StatusPublisher};
use crate::wayland::EventLoop;

/// Record the screen of a lipstick compositor into an MJPEG AVI file
#[derive(Parser, Debug)]
#[command(name = "screenrecorder", version, about)]
struct Cli {
    /// Output file, or a directory for a timestamped file
    destination: Option<PathBuf>,

    /// Frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Number of capture buffers (default: twice the frame rate)
    #[arg(long)]
    buffers: Option<u32>,

    /// Output scale factor
    #[arg(long)]
    scale: Option<f64>,

    /// Smooth (bilinear) scaling
    #[arg(short, long)]
    smooth: bool,

    /// JPEG quality, 1-100
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: Option<u8>,

    /// Wait for D-Bus commands instead of recording right away
    #[arg(short, long)]
    daemon: bool,

    /// Keep a constant frame rate while the screen is static
    #[arg(short, long)]
    full: bool,

    /// Register the D-Bus service on the session bus instead of the system bus
    #[arg(long)]
    session_bus: bool,
}

impl Cli {
    /// Override persisted options with the ones given on the command line
    fn apply(&self, options: &mut RecordingOptions) {
        if let Some(destination) = &self.destination {
            options.destination = destination.clone();
        }
        if let Some(fps) = self.fps {
            options.set_fps(fps);
        }
        if let Some(buffers) = self.buffers {
            options.buffers = Some(buffers);
        }
        if let Some(scale) = self.scale {
            options.scale = scale;
        }
        if let Some(quality) = self.quality {
            options.quality = quality;
        }
        if self.daemon {
            // Values saved over D-Bus stay unless a flag turns them on.
            options.smooth |= self.smooth;
            options.full_mode |= self.full;
        } else {
            options.smooth = self.smooth;
            options.full_mode = self.full;
        }
        options.daemonize = self.daemon;
    }

    fn bus(&self) -> Bus {
        if self.session_bus {
            Bus::Session
        } else {
            Bus::System
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(exit_status(&e))
        }
    }
}

/// 2 when the compositor cannot record at all, 1 for every other failure
fn exit_status(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<RecorderError>() {
        Some(RecorderError::CaptureUnsupported) => 2,
        _ => 1,
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut options = RecordingOptions::load().unwrap_or_else(|e| {
        log::warn!("Ignoring saved options: {:#}", e);
        RecordingOptions::default()
    });
    cli.apply(&mut options);
    options.validate()?;

    let daemon = options.daemonize;
    let options = options.into_shared();
    let status = StatusPublisher::new();

    let (waker, wake) = shutdown::wake_pair().context("Failed to create event loop waker")?;
    shutdown::install_signal_handlers(&waker);

    let session = Session::new(options.clone(), status.clone(), OutputFactory::avi_mjpeg());
    let event_loop = EventLoop::connect(session)?;

    let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
    let _control = if daemon {
        let handle = ControlHandle::new(
            commands_tx,
            waker.clone(),
            options,
            status,
            RecordingOptions::config_path(),
        );
        Some(control::spawn_service(cli.bus(), handle)?)
    } else {
        drop(commands_tx);
        None
    };

    if let Some(path) = event_loop.run(commands_rx, wake, &waker, !daemon)? {
        log::info!("Saved recording to {}", path.display());
    }
    Ok(())
}
