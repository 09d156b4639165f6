//! Display connection and the recorder protocol
//!
//! Binds the globals a recording needs, implements [`CaptureBackend`] on top
//! of `lipstick_recorder`, and runs the protocol thread's event loop: compositor
//! events, pacing deadlines, control commands and shutdown all meet here.

mod protocol;
pub mod registry;

use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use wayland_client::{
    Connection, Dispatch, EventQueue, Proxy, QueueHandle,
    backend::WaylandError,
    globals::{GlobalListContents, registry_queue_init},
    protocol::{wl_buffer, wl_output, wl_registry, wl_shm, wl_shm_pool},
};

use crate::buffer::ShmRegion;
use crate::core::control::ControlCommand;
use crate::core::shutdown::{self, WakeReceiver, Waker};
use crate::error::{RecorderError, Result};
use crate::screencast::backend::FrameGeometry;
use crate::screencast::{CaptureBackend, RecorderEvent, Session, Transform};

use protocol::lipstick_recorder::{self, LipstickRecorder};
use protocol::lipstick_recorder_manager::LipstickRecorderManager;

/// Longest the loop sleeps without checking the shutdown flag
const MAX_WAIT: Duration = Duration::from_millis(250);

/// Protocol requests for one recorded output
pub struct WaylandBackend {
    conn: Connection,
    qh: QueueHandle<AppData>,
    shm: wl_shm::WlShm,
    manager: LipstickRecorderManager,
    output: wl_output::WlOutput,
    recorder: Option<LipstickRecorder>,
}

impl CaptureBackend for WaylandBackend {
    type Buffer = wl_buffer::WlBuffer;

    fn create_recorder(&mut self) -> Result<()> {
        if self.recorder.is_none() {
            self.recorder = Some(self.manager.create_recorder(&self.output, &self.qh, ()));
        }
        Ok(())
    }

    fn register_buffer(
        &mut self,
        slot: usize,
        region: &ShmRegion,
        geometry: &FrameGeometry,
    ) -> Result<wl_buffer::WlBuffer> {
        let invalid = || RecorderError::InvalidGeometry {
            width: geometry.width as i32,
            height: geometry.height as i32,
            stride: geometry.stride as i32,
        };
        let size = i32::try_from(region.len()).map_err(|_| invalid())?;
        let format = wl_shm::Format::try_from(geometry.format.shm_code())
            .unwrap_or(wl_shm::Format::Argb8888);

        let pool = self.shm.create_pool(region.as_fd(), size, &self.qh, ());
        let buffer = pool.create_buffer(
            0,
            geometry.width as i32,
            geometry.height as i32,
            geometry.stride as i32,
            format,
            &self.qh,
            slot,
        );

        pool.destroy();

        Ok(buffer)
    }

    fn record_frame(&mut self, buffer: &wl_buffer::WlBuffer) {
        match &self.recorder {
            Some(recorder) => {
                recorder.record_frame(buffer);
                // The compositor must see the request before this frame is converted.
                flush_requests(self.conn.flush());
            }
            None => log::warn!("record_frame without a recorder"),
        }
    }

    fn release_buffer(&mut self, buffer: wl_buffer::WlBuffer) {
        buffer.destroy();
    }

    fn destroy_recorder(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.destroy();
        }
    }
}

struct AppData {
    session: Session<wl_buffer::WlBuffer>,
    backend: WaylandBackend,
    /// First fatal error raised while dispatching
    fatal: Option<RecorderError>,
}

impl AppData {
    fn forward(&mut self, event: RecorderEvent) {
        if self.fatal.is_some() {
            return;
        }
        if let Err(e) = self
            .session
            .handle_event(event, &mut self.backend, Instant::now())
        {
            self.fatal = Some(e);
        }
    }
}

/// Report the outcome of pushing queued requests to the socket
///
/// A full socket is not an error: the request stays queued and the event
/// loop flushes it again before it sleeps. Returns whether it was sent.
fn flush_requests(result: std::result::Result<(), WaylandError>) -> bool {
    match result {
        Ok(()) => true,
        Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
            log::debug!("Display socket full, capture request stays queued");
            false
        }
        Err(e) => {
            log::warn!("Failed to flush capture request: {}", e);
            false
        }
    }
}

fn connection_error(e: impl std::fmt::Display) -> RecorderError {
    RecorderError::Connection(e.to_string())
}

fn bind<I>(
    registry: &wl_registry::WlRegistry,
    global: registry::GlobalRef,
    qh: &QueueHandle<AppData>,
) -> I
where
    I: Proxy + 'static,
    AppData: Dispatch<I, ()>,
{
    registry.bind::<I, _, _>(global.name, global.version.min(I::interface().version), qh, ())
}

/// The protocol thread: owns the display connection and the session
pub struct EventLoop {
    event_queue: EventQueue<AppData>,
    data: AppData,
}

impl EventLoop {
    /// Connect to the compositor and bind the recording globals
    pub fn connect(mut session: Session<wl_buffer::WlBuffer>) -> Result<Self> {
        session.begin_init();

        log::info!("Connecting to Wayland compositor...");
        let conn = Connection::connect_to_env().map_err(connection_error)?;
        let (globals, event_queue) = registry_queue_init::<AppData>(&conn).map_err(connection_error)?;
        let qh = event_queue.handle();

        let required = match registry::select_globals(&globals.contents().clone_list()) {
            Ok(required) => required,
            Err(e) => {
                session.globals_missing();
                return Err(e);
            }
        };

        let registry = globals.registry();
        let backend = WaylandBackend {
            conn,
            shm: bind(registry, required.shm, &qh),
            manager: bind(registry, required.manager, &qh),
            output: bind(registry, required.output, &qh),
            qh,
            recorder: None,
        };
        log::info!(
            "Bound {} v{}, {} v{} and output {}",
            registry::MANAGER_INTERFACE,
            required.manager.version,
            registry::SHM_INTERFACE,
            required.shm.version,
            required.output.name
        );
        session.globals_bound();

        Ok(Self {
            event_queue,
            data: AppData {
                session,
                backend,
                fatal: None,
            },
        })
    }

    /// Run until shutdown and return the file written by the last recording
    ///
    /// With `auto_start` a recording begins right away; otherwise the session
    /// waits in `Ready` for a control command.
    pub fn run(
        mut self,
        commands: crossbeam_channel::Receiver<ControlCommand>,
        wake: WakeReceiver,
        waker: &Waker,
        auto_start: bool,
    ) -> Result<Option<PathBuf>> {
        if auto_start {
            self.data.session.start(&mut self.data.backend)?;
        }

        while !shutdown::shutdown_requested() && self.data.fatal.is_none() {
            self.data.session.on_timer(Instant::now(), &mut self.data.backend);

            for command in commands.try_iter() {
                self.handle_command(command, waker);
            }
            if shutdown::shutdown_requested() {
                break;
            }

            if let Err(e) = self.wait(&wake) {
                self.data.fatal = Some(e);
            }
        }

        self.finish()
    }

    fn handle_command(&mut self, command: ControlCommand, waker: &Waker) {
        match command {
            ControlCommand::Start { reply } => {
                let result = self
                    .data
                    .session
                    .start(&mut self.data.backend)
                    .map_err(|e| e.to_string());
                if let Err(e) = &result {
                    log::error!("Failed to start recording: {}", e);
                }
                let _ = reply.send(result);
            }
            ControlCommand::Stop { reply } => {
                let result = self.stop().map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            ControlCommand::Quit => shutdown::request_shutdown(waker),
        }
    }

    fn stop(&mut self) -> Result<Option<PathBuf>> {
        if !self.data.session.begin_stop() {
            return Ok(None);
        }
        self.sync();
        self.data.session.finish_stop(&mut self.data.backend)
    }

    /// Roundtrip so fills the compositor already started are forwarded
    fn sync(&mut self) {
        if let Err(e) = self.event_queue.roundtrip(&mut self.data) {
            log::warn!("Roundtrip before teardown failed: {}", e);
        }
    }

    /// Dispatch queued events, then sleep until the display, a wakeup or a deadline
    fn wait(&mut self, wake: &WakeReceiver) -> Result<()> {
        self.event_queue
            .dispatch_pending(&mut self.data)
            .map_err(connection_error)?;
        self.event_queue.flush().map_err(connection_error)?;

        let Some(guard) = self.event_queue.prepare_read() else {
            return Ok(());
        };

        let timeout = self
            .data
            .session
            .next_deadline()
            .map_or(MAX_WAIT, |deadline| deadline.saturating_duration_since(Instant::now()))
            .min(MAX_WAIT);
        let timeout_ms = timeout.as_micros().div_ceil(1000) as u16;

        let display_ready = {
            let mut fds = [
                PollFd::new(guard.connection_fd(), PollFlags::POLLIN),
                PollFd::new(wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => return Err(RecorderError::Connection(format!("poll failed: {e}"))),
            }
            fds[0].revents().is_some_and(|r| !r.is_empty())
        };

        if display_ready {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(connection_error(e)),
            }
        }
        wake.drain();

        self.event_queue
            .dispatch_pending(&mut self.data)
            .map_err(connection_error)?;
        Ok(())
    }

    /// Drain the current recording and release the recorder
    fn finish(mut self) -> Result<Option<PathBuf>> {
        if let Some(e) = &self.data.fatal {
            log::error!("Stopping after fatal error: {}", e);
        }
        log::debug!("Shutting down from {}", self.data.session.state());

        self.data.session.begin_shutdown();
        if self.data.fatal.is_none() {
            self.sync();
        }
        let result = self.data.session.finish_shutdown(&mut self.data.backend);
        if let Err(e) = self.event_queue.flush() {
            log::debug!("Final flush failed: {}", e);
        }

        match self.data.fatal.take() {
            Some(fatal) => {
                if let Err(e) = result {
                    log::error!("Failed to finalize recording: {}", e);
                }
                Err(fatal)
            }
            None => result,
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for AppData {
    fn event(
        _app_data: &mut Self,
        _registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::GlobalRemove { name } = event {
            log::debug!("Global {} removed", name);
        }
    }
}

impl Dispatch<wl_shm::WlShm, ()> for AppData {
    fn event(
        _app_data: &mut Self,
        _shm: &wl_shm::WlShm,
        _event: wl_shm::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for AppData {
    fn event(
        _app_data: &mut Self,
        _pool: &wl_shm_pool::WlShmPool,
        _event: wl_shm_pool::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

/// Buffers carry their pool slot; busy tracking follows the recorder events
impl Dispatch<wl_buffer::WlBuffer, usize> for AppData {
    fn event(
        _app_data: &mut Self,
        _buffer: &wl_buffer::WlBuffer,
        _event: wl_buffer::Event,
        _: &usize,
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<wl_output::WlOutput, ()> for AppData {
    fn event(
        _app_data: &mut Self,
        _output: &wl_output::WlOutput,
        _event: wl_output::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<LipstickRecorderManager, ()> for AppData {
    fn event(
        _app_data: &mut Self,
        _manager: &LipstickRecorderManager,
        _event: protocol::lipstick_recorder_manager::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
    }
}

fn slot_of(buffer: &wl_buffer::WlBuffer) -> Option<usize> {
    buffer.data::<usize>().copied()
}

impl Dispatch<LipstickRecorder, ()> for AppData {
    fn event(
        app_data: &mut Self,
        _recorder: &LipstickRecorder,
        event: lipstick_recorder::Event,
        _: &(),
        _: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            lipstick_recorder::Event::Setup {
                width,
                height,
                stride,
                format,
            } => {
                log::info!(
                    "Recorder setup: {}x{}, stride {}, format {:#x}",
                    width,
                    height,
                    stride,
                    format
                );
                RecorderEvent::Setup {
                    width,
                    height,
                    stride,
                    format,
                }
            }
            lipstick_recorder::Event::Frame {
                buffer,
                time,
                transform,
            } => {
                let Some(slot) = slot_of(&buffer) else {
                    log::warn!("Frame for a buffer outside the pool");
                    return;
                };
                RecorderEvent::Frame {
                    slot,
                    timestamp: time,
                    transform: Transform::from_code(transform),
                }
            }
            lipstick_recorder::Event::Failed { result, buffer } => RecorderEvent::Failed {
                result,
                slot: slot_of(&buffer),
            },
            lipstick_recorder::Event::Cancelled { buffer } => {
                let Some(slot) = slot_of(&buffer) else {
                    log::warn!("Cancel for a buffer outside the pool");
                    return;
                };
                RecorderEvent::Cancel { slot }
            }
            _ => return,
        };
        app_data.forward(event);
    }
}
