//! Capture session state machine
//!
//! Owns one recording at a time: it turns control calls (`start`, `stop`,
//! `shutdown`) and compositor events into capture requests, buffer pool
//! bookkeeping and pipeline submissions. Everything here runs on the
//! protocol thread; the only work handed elsewhere is encoding, which the
//! [`Pipeline`] does on its own worker.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use crate::config::{RecordingOptions, SharedOptions};
use crate::error::{RecorderError, Result};

use super::backend::{CaptureBackend, FrameGeometry, RecorderEvent};
use super::encoder::{FrameConverter, FrameEncoder, JpegFrameEncoder};
use super::pacing::{Pacer, PacingMode};
use super::pipeline::Pipeline;
use super::pool::BufferPool;
use super::sink::{GstAviSink, MJPEG_CODEC, OutputSink};
use super::state::{SessionState, StatusPublisher};

/// Builds the sink and encoder for each new recording
pub struct OutputFactory {
    sink: Box<dyn Fn() -> Box<dyn OutputSink>>,
    encoder: Box<dyn Fn() -> Box<dyn FrameEncoder>>,
}

impl OutputFactory {
    pub fn new(
        sink: impl Fn() -> Box<dyn OutputSink> + 'static,
        encoder: impl Fn() -> Box<dyn FrameEncoder> + 'static,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            encoder: Box::new(encoder),
        }
    }

    /// JPEG frames muxed into AVI
    pub fn avi_mjpeg() -> Self {
        Self::new(
            || Box::new(GstAviSink::new()),
            || Box::new(JpegFrameEncoder::default()),
        )
    }
}

/// State that only exists once the compositor announced the frame geometry
struct ActiveCapture<H> {
    pool: BufferPool<H>,
    converter: FrameConverter,
    pipeline: Pipeline,
}

struct Recording<H> {
    options: RecordingOptions,
    output_path: PathBuf,
    pacer: Pacer,
    starving: bool,
    active: Option<ActiveCapture<H>>,
    frames: u64,
    cancels: u64,
    started: Instant,
}

pub struct Session<H> {
    state: SessionState,
    options: SharedOptions,
    status: Arc<StatusPublisher>,
    outputs: OutputFactory,
    shutdown_requested: bool,
    recording: Option<Recording<H>>,
}

impl<H> Session<H> {
    pub fn new(options: SharedOptions, status: Arc<StatusPublisher>, outputs: OutputFactory) -> Self {
        Self {
            state: SessionState::Idle,
            options,
            status,
            outputs,
            shutdown_requested: false,
            recording: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Buffers currently handed to the compositor
    #[cfg(test)]
    pub fn busy_buffers(&self) -> usize {
        self.recording
            .as_ref()
            .and_then(|r| r.active.as_ref())
            .map_or(0, |a| a.pool.busy_count())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("Session state: {} -> {}", self.state, state);
            self.state = state;
            self.status.publish(state);
        }
    }

    /// The registry is about to be walked
    pub fn begin_init(&mut self) {
        if self.state == SessionState::Idle {
            self.set_state(SessionState::AwaitingGlobals);
        }
    }

    pub fn globals_bound(&mut self) {
        if self.state == SessionState::AwaitingGlobals {
            self.set_state(SessionState::Ready);
        }
    }

    /// The capture manager was not advertised; nothing can be recorded
    pub fn globals_missing(&mut self) {
        self.set_state(SessionState::Failed);
    }

    /// Begin a recording with a snapshot of the current options
    ///
    /// Only valid in `Ready`; any other state logs a warning and does nothing.
    pub fn start<B>(&mut self, backend: &mut B) -> Result<()>
    where
        B: CaptureBackend<Buffer = H>,
    {
        if self.state != SessionState::Ready || self.shutdown_requested {
            log::warn!("Ignoring start request while {}", self.state);
            return Ok(());
        }

        let options = self
            .options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        options.validate()?;
        let output_path = options
            .resolve_output_path()
            .map_err(|e| RecorderError::Config(format!("{e:#}")))?;

        backend.create_recorder()?;

        log::info!(
            "Recording to {} ({} fps, {} buffers, scale {}, quality {}, {})",
            output_path.display(),
            options.fps,
            options.buffer_count(),
            options.scale,
            options.quality,
            if options.full_mode { "full-frame" } else { "change-only" }
        );

        self.recording = Some(Recording {
            pacer: Pacer::new(PacingMode::from_full_mode(options.full_mode), options.frame_interval()),
            options,
            output_path,
            starving: false,
            active: None,
            frames: 0,
            cancels: 0,
            started: Instant::now(),
        });
        self.set_state(SessionState::Recording);
        Ok(())
    }

    /// Apply one compositor event
    ///
    /// An `Err` is fatal for the whole process.
    pub fn handle_event<B>(&mut self, event: RecorderEvent, backend: &mut B, now: Instant) -> Result<()>
    where
        B: CaptureBackend<Buffer = H>,
    {
        let capturing = self.state == SessionState::Recording;
        let Some(recording) = self.recording.as_mut() else {
            log::debug!("Ignoring {:?} outside a recording", event);
            return Ok(());
        };

        match event {
            RecorderEvent::Setup {
                width,
                height,
                stride,
                format,
            } => {
                if recording.active.is_some() {
                    log::warn!("Ignoring repeated setup {}x{}", width, height);
                    return Ok(());
                }
                let geometry = FrameGeometry::from_setup(width, height, stride, format)?;
                let mut active = activate(recording, geometry, &self.outputs, backend)?;
                if capturing {
                    request_capture(&mut active.pool, &mut recording.starving, backend);
                }
                recording.active = Some(active);
            }
            RecorderEvent::Frame {
                slot,
                timestamp,
                transform,
            } => {
                let Recording {
                    pacer,
                    starving,
                    active,
                    frames,
                    ..
                } = recording;
                let Some(active) = active.as_mut() else {
                    log::warn!("Frame for buffer {} before setup", slot);
                    return Ok(());
                };
                if !active.pool.is_busy(slot) {
                    log::warn!("Frame for buffer {} that was not requested", slot);
                    return Ok(());
                }
                log::debug!("Frame in buffer {} at {} ({:?})", slot, timestamp, transform);

                active.pool.record_fill(slot, timestamp, transform);
                // Keep the compositor fed before doing any work on this frame.
                if capturing {
                    request_capture(&mut active.pool, starving, backend);
                }

                let snapshot = match active.pool.get(slot) {
                    Some(buffer) => {
                        log::trace!("Converting buffer {} filled at {}", slot, buffer.timestamp());
                        Arc::new(active.converter.convert(buffer.pixels(), buffer.transform()))
                    }
                    None => return Ok(()),
                };
                active.pipeline.submit(snapshot.clone());
                *frames += 1;

                active.pool.mark_free(slot);
                if capturing && *starving {
                    request_capture(&mut active.pool, starving, backend);
                }
                pacer.on_frame(snapshot, now);
            }
            RecorderEvent::Cancel { slot } => {
                let Some(active) = recording.active.as_mut() else {
                    return Ok(());
                };
                if !active.pool.is_busy(slot) {
                    log::warn!("Cancel for buffer {} that was not requested", slot);
                    return Ok(());
                }
                log::debug!("Buffer {} cancelled", slot);
                recording.cancels += 1;

                active.pool.mark_free(slot);
                if active.pool.busy_count() == 0 {
                    recording.starving = true;
                }
                if capturing && recording.starving {
                    request_capture(&mut active.pool, &mut recording.starving, backend);
                }
            }
            RecorderEvent::Failed { result, slot } => {
                log::error!("Capture failed with result {} (buffer {:?})", result, slot);
                return Err(RecorderError::CaptureFailed(result));
            }
        }
        Ok(())
    }

    /// Run pacing work that is due at `now`
    pub fn on_timer<B>(&mut self, now: Instant, backend: &mut B)
    where
        B: CaptureBackend<Buffer = H>,
    {
        if self.shutdown_requested || self.state != SessionState::Recording {
            return;
        }
        let Some(recording) = self.recording.as_mut() else {
            return;
        };
        let Some(snapshot) = recording.pacer.poll(now) else {
            return;
        };
        if let Some(active) = recording.active.as_mut() {
            active.pipeline.submit(snapshot);
            if recording.starving {
                request_capture(&mut active.pool, &mut recording.starving, backend);
            }
        }
    }

    /// When `on_timer` next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != SessionState::Recording {
            return None;
        }
        self.recording.as_ref().and_then(|r| r.pacer.deadline())
    }

    /// Stop issuing captures; in-flight fills are still forwarded
    ///
    /// Returns `false` (after a warning) unless a recording is running.
    pub fn begin_stop(&mut self) -> bool {
        if self.state != SessionState::Recording {
            log::warn!("Ignoring stop request while {}", self.state);
            return false;
        }
        self.set_state(SessionState::Draining);
        true
    }

    /// Tear the recording down and return the written file
    ///
    /// `Ok(None)` when there was nothing to stop or no frame geometry was
    /// ever announced.
    pub fn finish_stop<B>(&mut self, backend: &mut B) -> Result<Option<PathBuf>>
    where
        B: CaptureBackend<Buffer = H>,
    {
        if self.state != SessionState::Draining || self.shutdown_requested {
            return Ok(None);
        }
        let result = self.drain(backend);
        self.set_state(SessionState::Ready);
        result
    }

    pub fn stop<B>(&mut self, backend: &mut B) -> Result<Option<PathBuf>>
    where
        B: CaptureBackend<Buffer = H>,
    {
        if self.begin_stop() {
            self.finish_stop(backend)
        } else {
            Ok(None)
        }
    }

    /// Latch the shutdown flag; returns `true` the first time only
    pub fn begin_shutdown(&mut self) -> bool {
        if self.shutdown_requested {
            return false;
        }
        self.shutdown_requested = true;
        log::info!("Shutdown requested");
        if !self.state.is_terminal() {
            self.set_state(SessionState::Draining);
        }
        true
    }

    pub fn finish_shutdown<B>(&mut self, backend: &mut B) -> Result<Option<PathBuf>>
    where
        B: CaptureBackend<Buffer = H>,
    {
        let result = if self.recording.is_some() {
            self.drain(backend)
        } else {
            Ok(None)
        };
        self.set_state(SessionState::Terminated);
        result
    }

    pub fn shutdown<B>(&mut self, backend: &mut B) -> Result<Option<PathBuf>>
    where
        B: CaptureBackend<Buffer = H>,
    {
        self.begin_shutdown();
        self.finish_shutdown(backend)
    }

    fn drain<B>(&mut self, backend: &mut B) -> Result<Option<PathBuf>>
    where
        B: CaptureBackend<Buffer = H>,
    {
        let Some(mut recording) = self.recording.take() else {
            return Ok(None);
        };

        backend.destroy_recorder();
        recording.pacer.cancel();

        let Some(active) = recording.active else {
            log::warn!(
                "Recording stopped before the compositor announced a frame size, nothing written to {}",
                recording.output_path.display()
            );
            return Ok(None);
        };

        let busy = active.pool.busy_count();
        if busy > 0 {
            log::debug!("{} buffers still busy at teardown", busy);
        }
        active.pool.teardown(backend);

        let stats = active.pipeline.stats();
        log::debug!(
            "Draining encoder: {} frames queued, {} written, {} dropped so far",
            active.pipeline.submitted(),
            stats.written(),
            stats.dropped()
        );
        let path = active.pipeline.finish()?;
        log::info!(
            "Recording finished after {:.1}s: {} frames captured, {} cancelled, saved to {}",
            recording.started.elapsed().as_secs_f64(),
            recording.frames,
            recording.cancels,
            path.display()
        );
        Ok(Some(path))
    }
}

/// Allocate the pool, open the sink and start the worker for a new geometry
fn activate<H, B>(
    recording: &Recording<H>,
    geometry: FrameGeometry,
    outputs: &OutputFactory,
    backend: &mut B,
) -> Result<ActiveCapture<H>>
where
    B: CaptureBackend<Buffer = H>,
{
    let options = &recording.options;
    let pool = BufferPool::allocate(options.buffer_count(), geometry, backend)?;
    let converter = FrameConverter::new(geometry, options.scale, options.smooth);
    let (width, height) = converter.output_size();

    let mut sink = (outputs.sink)();
    let opened = sink
        .open(&recording.output_path, width, height, options.fps, MJPEG_CODEC)
        .and_then(|()| {
            Pipeline::spawn(sink, (outputs.encoder)(), options.quality, pool.len() * 2)
        });

    match opened {
        Ok(pipeline) => Ok(ActiveCapture {
            pool,
            converter,
            pipeline,
        }),
        Err(e) => {
            pool.teardown(backend);
            Err(e)
        }
    }
}

/// Hand the first free buffer to the compositor, or note that none is free
fn request_capture<H, B>(pool: &mut BufferPool<H>, starving: &mut bool, backend: &mut B)
where
    B: CaptureBackend<Buffer = H>,
{
    let Some(slot) = pool.acquire_free() else {
        if !*starving {
            log::warn!("No free buffers, waiting for the compositor to return one");
        }
        *starving = true;
        return;
    };
    if let Some(handle) = pool.handle(slot) {
        backend.record_frame(handle);
        pool.mark_busy(slot);
        *starving = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screencast::backend::Transform;
    use crate::screencast::backend::testing::FakeBackend;
    use crate::screencast::pipeline::testing::{MemorySink, SinkLog, TagEncoder};
    use rand::Rng;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        session: Session<usize>,
        backend: FakeBackend,
        sink: Arc<Mutex<SinkLog>>,
        status: Arc<StatusPublisher>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(configure: impl FnOnce(&mut RecordingOptions), delay: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut options = RecordingOptions {
            destination: dir.path().join("out.avi"),
            buffers: Some(4),
            ..Default::default()
        };
        configure(&mut options);

        let sink = MemorySink::default();
        let log = sink.log.clone();
        let outputs = OutputFactory::new(
            move || Box::new(sink.clone()),
            move || {
                Box::new(TagEncoder {
                    delays: vec![delay; 64],
                    calls: 0,
                })
            },
        );

        let status = StatusPublisher::new();
        let mut session = Session::new(options.into_shared(), status.clone(), outputs);
        session.begin_init();
        session.globals_bound();

        Harness {
            session,
            backend: FakeBackend::default(),
            sink: log,
            status,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {}, Duration::ZERO)
    }

    impl Harness {
        fn event(&mut self, event: RecorderEvent) -> Result<()> {
            self.session.handle_event(event, &mut self.backend, Instant::now())
        }

        fn setup(&mut self) {
            self.session.start(&mut self.backend).unwrap();
            self.event(RecorderEvent::Setup {
                width: 100,
                height: 100,
                stride: 400,
                format: 0,
            })
            .unwrap();
        }

        fn frame(&mut self, slot: usize) {
            self.backend.complete(slot);
            self.event(RecorderEvent::Frame {
                slot,
                timestamp: 0,
                transform: Transform::Normal,
            })
            .unwrap();
        }

        fn cancel(&mut self, slot: usize) {
            self.backend.complete(slot);
            self.event(RecorderEvent::Cancel { slot }).unwrap();
        }

        fn pixels_mut(&mut self, slot: usize) -> &mut [u8] {
            self.session
                .recording
                .as_mut()
                .and_then(|r| r.active.as_mut())
                .and_then(|a| a.pool.pixels_mut(slot))
                .unwrap()
        }

        /// Some slot the compositor currently holds
        fn outstanding(&self) -> usize {
            *self.backend.outstanding.iter().next().unwrap()
        }

        fn frames_written(&self) -> usize {
            self.sink.lock().unwrap().frames.len()
        }
    }

    #[test]
    fn lifecycle_states_are_published() {
        let mut h = harness();
        let mut rx = h.status.subscribe();
        h.setup();
        h.session.stop(&mut h.backend).unwrap();
        h.session.shutdown(&mut h.backend).unwrap();

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                SessionState::Recording,
                SessionState::Draining,
                SessionState::Ready,
                SessionState::Draining,
                SessionState::Terminated
            ]
        );
    }

    #[test]
    fn shutdown_from_ready_passes_through_draining() {
        let mut h = harness();
        let mut rx = h.status.subscribe();
        assert_eq!(h.session.shutdown(&mut h.backend).unwrap(), None);

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen, vec![SessionState::Draining, SessionState::Terminated]);
        assert_eq!(h.backend.recorders_created, 0);
    }

    #[test]
    fn shutdown_before_globals_passes_through_draining() {
        let status = StatusPublisher::new();
        let mut rx = status.subscribe();
        let mut session: Session<usize> = Session::new(
            RecordingOptions::default().into_shared(),
            status.clone(),
            OutputFactory::avi_mjpeg(),
        );
        session.begin_init();
        session.shutdown(&mut FakeBackend::default()).unwrap();

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                SessionState::AwaitingGlobals,
                SessionState::Draining,
                SessionState::Terminated
            ]
        );
    }

    #[test]
    fn setup_allocates_pool_and_requests_first_capture() {
        let mut h = harness();
        h.setup();
        assert_eq!(h.backend.registered, vec![0, 1, 2, 3]);
        assert_eq!(h.backend.requests, vec![0]);
        assert_eq!(h.session.busy_buffers(), 1);

        let opened = h.sink.lock().unwrap().opened.clone().unwrap();
        assert_eq!((opened.1, opened.2, opened.3), (100, 100, 24));
    }

    #[test]
    fn frame_frame_cancel_frame_emits_three_tasks() {
        let mut h = harness();
        h.setup();

        h.frame(0);
        assert!(h.session.busy_buffers() <= 4);
        h.frame(1);
        assert!(h.session.busy_buffers() <= 4);
        h.cancel(0);
        assert!(h.session.busy_buffers() <= 4);
        h.frame(0);
        assert!(h.session.busy_buffers() <= 4);

        let path = h.session.stop(&mut h.backend).unwrap();
        assert!(path.is_some());
        assert_eq!(h.frames_written(), 3);
        assert_eq!(h.session.state(), SessionState::Ready);
        assert!(!h.backend.recorder_alive);
        assert_eq!(h.backend.released, vec![0, 1, 2, 3]);
    }

    #[test]
    fn single_buffer_pool_recovers_from_starvation() {
        let mut h = harness_with(|o| o.buffers = Some(1), Duration::ZERO);
        h.setup();
        assert_eq!(h.backend.requests, vec![0]);

        // The only buffer is busy when the next request is due; it is
        // re-issued as soon as the frame releases it.
        h.frame(0);
        assert_eq!(h.backend.requests, vec![0, 0]);

        h.cancel(0);
        assert_eq!(h.backend.requests, vec![0, 0, 0]);
        assert_eq!(h.session.busy_buffers(), 1);

        h.session.stop(&mut h.backend).unwrap();
        assert_eq!(h.frames_written(), 1);
    }

    #[test]
    fn random_traffic_never_exceeds_pool_and_keeps_compositor_fed() {
        let mut rng = rand::thread_rng();
        for pool_size in 1..=6u32 {
            let mut h = harness_with(|o| o.buffers = Some(pool_size), Duration::ZERO);
            h.setup();
            let mut emitted = 0;

            for _ in 0..200 {
                let slot = h.outstanding();
                if rng.gen_bool(0.7) {
                    h.frame(slot);
                    emitted += 1;
                } else {
                    h.cancel(slot);
                }
                let busy = h.session.busy_buffers();
                assert!(busy <= pool_size as usize);
                assert_eq!(busy, h.backend.outstanding.len());
                assert!(busy >= 1);
            }

            h.session.stop(&mut h.backend).unwrap();
            // A full encoder queue may drop frames, never invent them
            let written = h.frames_written();
            assert!(written > 0 && written <= emitted);
        }
    }

    #[test]
    fn stop_while_ready_is_a_no_op() {
        let mut h = harness();
        assert_eq!(h.session.stop(&mut h.backend).unwrap(), None);
        assert_eq!(h.session.state(), SessionState::Ready);
        assert!(!h.backend.recorder_alive);
    }

    #[test]
    fn start_outside_ready_is_a_no_op() {
        let mut h = harness();
        h.setup();
        h.session.start(&mut h.backend).unwrap();
        assert_eq!(h.backend.recorders_created, 1);

        let mut idle: Session<usize> = Session::new(
            RecordingOptions::default().into_shared(),
            StatusPublisher::new(),
            OutputFactory::avi_mjpeg(),
        );
        let mut backend = FakeBackend::default();
        idle.start(&mut backend).unwrap();
        assert_eq!(idle.state(), SessionState::Idle);
        assert_eq!(backend.recorders_created, 0);
    }

    #[test]
    fn invalid_options_reject_start() {
        let mut h = harness_with(|o| o.fps = 0, Duration::ZERO);
        let err = h.session.start(&mut h.backend).err().unwrap();
        assert!(matches!(err, RecorderError::Config(_)));
        assert_eq!(h.session.state(), SessionState::Ready);
        assert_eq!(h.backend.recorders_created, 0);
    }

    #[test]
    fn options_changed_mid_recording_apply_to_the_next_one() {
        let mut h = harness();
        h.setup();
        h.session.options.lock().unwrap().buffers = Some(2);
        h.frame(0);
        h.session.stop(&mut h.backend).unwrap();
        assert_eq!(h.backend.registered.len(), 4);

        h.backend.registered.clear();
        h.setup();
        assert_eq!(h.backend.registered, vec![0, 1]);
    }

    #[test]
    fn shutdown_drains_submitted_frames_before_close() {
        let mut h = harness_with(|_| {}, Duration::from_millis(5));
        h.setup();
        for _ in 0..6 {
            let slot = h.outstanding();
            h.frame(slot);
        }

        let path = h.session.shutdown(&mut h.backend).unwrap();
        assert!(path.is_some());
        assert_eq!(h.session.state(), SessionState::Terminated);

        let log = h.sink.lock().unwrap();
        assert_eq!(log.frames.len(), 6);
        assert!(log.closed);
        assert_eq!(log.late_appends, 0);
    }

    #[test]
    fn in_flight_frames_are_forwarded_while_draining() {
        let mut h = harness();
        h.setup();
        assert!(h.session.begin_shutdown());
        assert!(!h.session.begin_shutdown());
        assert_eq!(h.session.state(), SessionState::Draining);

        let requests = h.backend.requests.len();
        h.frame(0);
        assert_eq!(h.backend.requests.len(), requests);

        h.session.finish_shutdown(&mut h.backend).unwrap();
        assert_eq!(h.frames_written(), 1);
    }

    #[test]
    fn failed_event_is_fatal() {
        let mut h = harness();
        h.setup();
        let err = h
            .event(RecorderEvent::Failed {
                result: 2,
                slot: Some(0),
            })
            .err()
            .unwrap();
        assert!(matches!(err, RecorderError::CaptureFailed(2)));
    }

    #[test]
    fn stray_events_are_ignored() {
        let mut h = harness();
        // Before any recording exists
        h.event(RecorderEvent::Cancel { slot: 0 }).unwrap();

        h.setup();
        h.event(RecorderEvent::Frame {
            slot: 3,
            timestamp: 0,
            transform: Transform::Normal,
        })
        .unwrap();
        h.event(RecorderEvent::Setup {
            width: 10,
            height: 10,
            stride: 40,
            format: 0,
        })
        .unwrap();

        assert_eq!(h.backend.registered.len(), 4);
        h.session.stop(&mut h.backend).unwrap();
        assert_eq!(h.frames_written(), 0);
    }

    #[test]
    fn full_mode_reemits_last_frame_on_timer() {
        let mut h = harness_with(
            |o| {
                o.full_mode = true;
                o.set_fps(10);
            },
            Duration::ZERO,
        );
        h.setup();

        let t0 = Instant::now();
        h.backend.complete(0);
        h.session
            .handle_event(
                RecorderEvent::Frame {
                    slot: 0,
                    timestamp: 0,
                    transform: Transform::Normal,
                },
                &mut h.backend,
                t0,
            )
            .unwrap();
        assert_eq!(h.session.next_deadline(), Some(t0 + Duration::from_millis(100)));

        h.session.on_timer(t0 + Duration::from_millis(100), &mut h.backend);
        h.session.on_timer(t0 + Duration::from_millis(150), &mut h.backend);
        h.session.on_timer(t0 + Duration::from_millis(200), &mut h.backend);

        h.session.begin_shutdown();
        h.session.on_timer(t0 + Duration::from_millis(300), &mut h.backend);
        h.session.finish_shutdown(&mut h.backend).unwrap();

        assert_eq!(h.frames_written(), 3);
    }

    #[test]
    fn full_mode_tick_retries_a_starved_request() {
        let mut h = harness_with(
            |o| {
                o.full_mode = true;
                o.set_fps(10);
                o.buffers = Some(2);
            },
            Duration::ZERO,
        );
        h.setup();

        let t0 = Instant::now();
        h.backend.complete(0);
        h.session
            .handle_event(
                RecorderEvent::Frame {
                    slot: 0,
                    timestamp: 0,
                    transform: Transform::Normal,
                },
                &mut h.backend,
                t0,
            )
            .unwrap();
        assert_eq!(h.backend.requests, vec![0, 1]);

        // A request that could not be issued earlier; only slot 1 is out and
        // no completion is coming, so the pacing tick has to retry.
        h.session.recording.as_mut().unwrap().starving = true;
        h.session.on_timer(t0 + Duration::from_millis(50), &mut h.backend);
        assert_eq!(h.backend.requests, vec![0, 1]);

        h.session.on_timer(t0 + Duration::from_millis(100), &mut h.backend);
        assert_eq!(h.backend.requests, vec![0, 1, 0]);
        assert_eq!(h.session.busy_buffers(), 2);
        assert!(!h.session.recording.as_ref().unwrap().starving);

        h.session.stop(&mut h.backend).unwrap();
        assert_eq!(h.frames_written(), 2);
    }

    #[test]
    fn y_inverted_fill_reaches_the_sink_flipped() {
        let mut h = harness_with(
            |o| {
                o.scale = 1.0;
                o.smooth = false;
            },
            Duration::ZERO,
        );
        h.setup();

        // ARGB8888 is stored B, G, R, A; red holds the row index.
        let pixels = h.pixels_mut(0);
        for (row, line) in pixels.chunks_mut(400).enumerate() {
            for px in line.chunks_exact_mut(4) {
                px[2] = row as u8;
            }
        }

        h.backend.complete(0);
        h.event(RecorderEvent::Frame {
            slot: 0,
            timestamp: 7,
            transform: Transform::YInverted,
        })
        .unwrap();
        assert_eq!(h.session.busy_buffers(), 1);

        h.session.stop(&mut h.backend).unwrap();
        let log = h.sink.lock().unwrap();
        assert_eq!(log.frames, vec![vec![99u8]]);
    }

    #[test]
    fn change_only_mode_has_no_timer() {
        let mut h = harness();
        h.setup();
        h.frame(0);
        assert_eq!(h.session.next_deadline(), None);
        h.session.on_timer(Instant::now() + Duration::from_secs(5), &mut h.backend);
        h.session.stop(&mut h.backend).unwrap();
        assert_eq!(h.frames_written(), 1);
    }

    #[test]
    fn stop_before_setup_writes_nothing() {
        let mut h = harness();
        h.session.start(&mut h.backend).unwrap();
        assert_eq!(h.session.stop(&mut h.backend).unwrap(), None);
        assert_eq!(h.session.state(), SessionState::Ready);
        assert!(h.sink.lock().unwrap().opened.is_none());
    }
}
