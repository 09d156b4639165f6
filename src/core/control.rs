//! D-Bus control interface
//!
//! Exposes start/stop/quit and the recording options to other processes.
//! The service runs on its own thread with a current-thread tokio runtime;
//! every request that touches the capture session is forwarded to the
//! protocol thread as a [`ControlCommand`] and answered over a oneshot.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use zbus::object_server::SignalEmitter;

use crate::config::{RecordingOptions, SharedOptions};
use crate::core::shutdown::Waker;
use crate::screencast::StatusPublisher;

/// Well-known bus name, also used as the interface name
pub const SERVICE_NAME: &str = "org.coderus.screenrecorder";

/// D-Bus object path for the control interface
pub const OBJECT_PATH: &str = "/org/coderus/screenrecorder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    System,
    Session,
}

/// Requests handled on the protocol thread
#[derive(Debug)]
pub enum ControlCommand {
    Start {
        reply: oneshot::Sender<Result<(), String>>,
    },
    Stop {
        reply: oneshot::Sender<Result<Option<PathBuf>, String>>,
    },
    Quit,
}

/// Everything the control surface shares with the rest of the process
#[derive(Clone)]
pub struct ControlHandle {
    commands: crossbeam_channel::Sender<ControlCommand>,
    waker: Waker,
    options: SharedOptions,
    status: Arc<StatusPublisher>,
    /// Where option changes are saved; `None` disables persistence
    options_file: Option<PathBuf>,
}

impl ControlHandle {
    pub fn new(
        commands: crossbeam_channel::Sender<ControlCommand>,
        waker: Waker,
        options: SharedOptions,
        status: Arc<StatusPublisher>,
        options_file: Option<PathBuf>,
    ) -> Self {
        Self {
            commands,
            waker,
            options,
            status,
            options_file,
        }
    }

    fn send(&self, command: ControlCommand) -> bool {
        let sent = self.commands.send(command).is_ok();
        self.waker.wake();
        sent
    }

    pub async fn start(&self) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        if !self.send(ControlCommand::Start { reply }) {
            return Err("recorder is shutting down".into());
        }
        rx.await.unwrap_or_else(|_| Err("recorder is shutting down".into()))
    }

    /// Path of the finished file, or an empty string if nothing was written
    pub async fn stop(&self) -> String {
        let (reply, rx) = oneshot::channel();
        if !self.send(ControlCommand::Stop { reply }) {
            return String::new();
        }
        match rx.await {
            Ok(Ok(Some(path))) => path.to_string_lossy().into_owned(),
            Ok(Ok(None)) => String::new(),
            Ok(Err(e)) => {
                log::error!("Stop failed: {}", e);
                String::new()
            }
            Err(_) => String::new(),
        }
    }

    pub fn quit(&self) {
        self.send(ControlCommand::Quit);
    }

    pub fn options(&self) -> RecordingOptions {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the options used by the next recording and persist them
    pub fn update_options(&self, update: impl FnOnce(&mut RecordingOptions)) {
        let snapshot = {
            let mut options = self.options.lock().unwrap_or_else(PoisonError::into_inner);
            update(&mut options);
            options.clone()
        };
        if let Some(path) = &self.options_file {
            if let Err(e) = snapshot.save_to(path) {
                log::warn!("Failed to save options: {:#}", e);
            }
        }
    }
}

pub struct ControlInterface {
    handle: ControlHandle,
}

#[zbus::interface(name = "org.coderus.screenrecorder")]
impl ControlInterface {
    async fn start(&self) -> zbus::fdo::Result<()> {
        log::info!("D-Bus: Start command received");
        self.handle.start().await.map_err(zbus::fdo::Error::Failed)
    }

    async fn stop(&self, #[zbus(signal_emitter)] emitter: SignalEmitter<'_>) -> String {
        log::info!("D-Bus: Stop command received");
        let path = self.handle.stop().await;
        if let Err(e) = Self::recording_finished(&emitter, &path).await {
            log::warn!("Failed to emit RecordingFinished: {}", e);
        }
        path
    }

    async fn quit(&self) {
        log::info!("D-Bus: Quit command received");
        self.handle.quit();
    }

    #[zbus(property)]
    async fn state(&self) -> i32 {
        self.handle.status.current().code()
    }

    #[zbus(property)]
    async fn destination(&self) -> String {
        self.handle.options().destination.to_string_lossy().into_owned()
    }

    #[zbus(property)]
    async fn set_destination(&self, value: String) {
        self.handle
            .update_options(|o| o.destination = PathBuf::from(value));
    }

    #[zbus(property)]
    async fn fps(&self) -> i32 {
        self.handle.options().fps as i32
    }

    #[zbus(property)]
    async fn set_fps(&self, value: i32) -> zbus::fdo::Result<()> {
        let fps = u32::try_from(value)
            .ok()
            .filter(|&fps| fps > 0)
            .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("invalid fps {value}")))?;
        self.handle.update_options(|o| o.set_fps(fps));
        Ok(())
    }

    #[zbus(property)]
    async fn buffers(&self) -> i32 {
        self.handle.options().buffer_count() as i32
    }

    /// Zero or negative resets to twice the frame rate
    #[zbus(property)]
    async fn set_buffers(&self, value: i32) {
        self.handle
            .update_options(|o| o.buffers = u32::try_from(value).ok().filter(|&n| n > 0));
    }

    #[zbus(property)]
    async fn full_mode(&self) -> bool {
        self.handle.options().full_mode
    }

    #[zbus(property)]
    async fn set_full_mode(&self, value: bool) {
        self.handle.update_options(|o| o.full_mode = value);
    }

    #[zbus(property)]
    async fn scale(&self) -> f64 {
        self.handle.options().scale
    }

    #[zbus(property)]
    async fn set_scale(&self, value: f64) -> zbus::fdo::Result<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(zbus::fdo::Error::InvalidArgs(format!("invalid scale {value}")));
        }
        self.handle.update_options(|o| o.scale = value);
        Ok(())
    }

    #[zbus(property)]
    async fn quality(&self) -> i32 {
        i32::from(self.handle.options().quality)
    }

    /// Negative selects the default quality
    #[zbus(property)]
    async fn set_quality(&self, value: i32) {
        self.handle.update_options(|o| o.set_quality_from_control(value));
    }

    #[zbus(property)]
    async fn smooth(&self) -> bool {
        self.handle.options().smooth
    }

    #[zbus(property)]
    async fn set_smooth(&self, value: bool) {
        self.handle.update_options(|o| o.smooth = value);
    }

    #[zbus(signal, name = "StateChanged")]
    async fn notify_state(emitter: &SignalEmitter<'_>, state: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn recording_finished(emitter: &SignalEmitter<'_>, path: &str) -> zbus::Result<()>;
}

/// Register the service and run it on a dedicated thread
///
/// Returns once the bus name is owned, so a name clash fails startup.
pub fn spawn_service(bus: Bus, handle: ControlHandle) -> Result<JoinHandle<()>> {
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);

    let worker = thread::Builder::new()
        .name("dbus-control".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("failed to start runtime: {e}")));
                    return;
                }
            };
            runtime.block_on(async move {
                if let Err(e) = serve(bus, handle, &ready_tx).await {
                    let _ = ready_tx.send(Err(format!("{e:#}")));
                }
            });
        })
        .context("Failed to spawn D-Bus thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(worker),
        Ok(Err(e)) => Err(anyhow::anyhow!(e)).context("Failed to register D-Bus service"),
        Err(_) => Err(anyhow::anyhow!("D-Bus thread exited during startup")),
    }
}

async fn serve(
    bus: Bus,
    handle: ControlHandle,
    ready: &std::sync::mpsc::SyncSender<Result<(), String>>,
) -> Result<()> {
    let mut states = handle.status.subscribe();

    let builder = match bus {
        Bus::System => zbus::connection::Builder::system()?,
        Bus::Session => zbus::connection::Builder::session()?,
    };
    let connection = builder
        .name(SERVICE_NAME)?
        .serve_at(OBJECT_PATH, ControlInterface { handle })?
        .build()
        .await
        .with_context(|| format!("Failed to own {SERVICE_NAME} on the {bus:?} bus"))?;

    log::info!("D-Bus service {} registered at {}", SERVICE_NAME, OBJECT_PATH);
    let _ = ready.send(Ok(()));

    let iface = connection
        .object_server()
        .interface::<_, ControlInterface>(OBJECT_PATH)
        .await?;

    while let Some(state) = states.recv().await {
        let emitter = iface.signal_emitter();
        if let Err(e) = ControlInterface::notify_state(emitter, state.code()).await {
            log::warn!("Failed to emit StateChanged: {}", e);
        }
        if let Err(e) = iface.get().await.state_changed(emitter).await {
            log::debug!("Failed to emit State property change: {}", e);
        }
        if state.is_terminal() {
            break;
        }
    }
    Ok(())
}
