//! Video container output
//!
//! The pipeline hands every encoded frame to an [`OutputSink`]. The
//! production sink muxes JPEG frames into an AVI file with GStreamer.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::{Path, PathBuf};

use crate::error::{RecorderError, Result};

/// FourCC of the frames produced by the JPEG encoder
pub const MJPEG_CODEC: &str = "MJPG";

/// How long `close` waits for the muxer to finalize the file
const EOS_TIMEOUT_SECS: u64 = 30;

/// Sequential, append-only container writer
pub trait OutputSink: Send {
    fn open(&mut self, path: &Path, width: u32, height: u32, fps: u32, codec: &str) -> Result<()>;

    /// Append one encoded frame; frames are written in call order
    fn append(&mut self, frame: &[u8]) -> Result<()>;

    /// Finalize the file and return its path
    fn close(&mut self) -> Result<PathBuf>;
}

struct OpenPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    output_path: PathBuf,
    fps: u32,
    frame_count: u64,
}

/// `appsrc ! avimux ! filesink` fed with pre-encoded JPEG frames
#[derive(Default)]
pub struct GstAviSink {
    open: Option<OpenPipeline>,
}

impl GstAviSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn build(path: &Path, width: u32, height: u32, fps: u32) -> std::result::Result<OpenPipeline, String> {
        gst::init().map_err(|e| format!("Failed to initialize GStreamer: {e}"))?;

        let location = path
            .to_str()
            .ok_or_else(|| format!("Output path is not valid UTF-8: {}", path.display()))?;

        let pipeline = gst::Pipeline::new();

        let appsrc = gst_app::AppSrc::builder()
            .name("frame-source")
            .format(gst::Format::Time)
            .caps(
                &gst::Caps::builder("image/jpeg")
                    .field("width", width as i32)
                    .field("height", height as i32)
                    .field("framerate", gst::Fraction::new(fps as i32, 1))
                    .build(),
            )
            .build();

        let muxer = gst::ElementFactory::make("avimux")
            .build()
            .map_err(|e| format!("Failed to create avimux element: {e}"))?;

        let filesink = gst::ElementFactory::make("filesink")
            .property("location", location)
            .build()
            .map_err(|e| format!("Failed to create filesink element: {e}"))?;

        pipeline
            .add_many([appsrc.upcast_ref(), &muxer, &filesink])
            .map_err(|e| format!("Failed to assemble pipeline: {e}"))?;
        gst::Element::link_many([appsrc.upcast_ref(), &muxer, &filesink])
            .map_err(|e| format!("Failed to link pipeline: {e}"))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| format!("Failed to start pipeline: {e}"))?;

        Ok(OpenPipeline {
            pipeline,
            appsrc,
            output_path: path.to_path_buf(),
            fps: fps.max(1),
            frame_count: 0,
        })
    }
}

impl OutputSink for GstAviSink {
    fn open(&mut self, path: &Path, width: u32, height: u32, fps: u32, codec: &str) -> Result<()> {
        if codec != MJPEG_CODEC {
            return Err(RecorderError::SinkOpen {
                path: path.to_path_buf(),
                reason: format!("unsupported codec {codec}"),
            });
        }

        log::info!(
            "Opening {} ({}x{} @ {} fps, {})",
            path.display(),
            width,
            height,
            fps,
            codec
        );

        let open = Self::build(path, width, height, fps).map_err(|reason| RecorderError::SinkOpen {
            path: path.to_path_buf(),
            reason,
        })?;
        self.open = Some(open);
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| RecorderError::SinkAppend("output is not open".into()))?;

        let frame_duration = 1_000_000_000 / u64::from(open.fps);
        let mut buffer = gst::Buffer::from_mut_slice(frame.to_vec());
        if let Some(buffer_mut) = buffer.get_mut() {
            buffer_mut.set_pts(gst::ClockTime::from_nseconds(open.frame_count * frame_duration));
            buffer_mut.set_duration(gst::ClockTime::from_nseconds(frame_duration));
        }

        open.appsrc
            .push_buffer(buffer)
            .map_err(|e| RecorderError::SinkAppend(format!("push_buffer: {e:?}")))?;
        open.frame_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<PathBuf> {
        let open = self
            .open
            .take()
            .ok_or_else(|| RecorderError::SinkClose("output is not open".into()))?;

        log::info!("Finalizing {} ({} frames)...", open.output_path.display(), open.frame_count);
        open.appsrc
            .end_of_stream()
            .map_err(|e| RecorderError::SinkClose(format!("Failed to send EOS: {e:?}")))?;

        let bus = open
            .pipeline
            .bus()
            .ok_or_else(|| RecorderError::SinkClose("pipeline has no bus".into()))?;

        let mut eos_received = false;
        let mut pipeline_error = None;
        for msg in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
            use gst::MessageView;
            match msg.view() {
                MessageView::Eos(..) => {
                    eos_received = true;
                    break;
                }
                MessageView::Error(err) => {
                    pipeline_error = Some(format!(
                        "Pipeline error: {} ({})",
                        err.error(),
                        err.debug().unwrap_or_default()
                    ));
                    break;
                }
                _ => {}
            }
        }

        if !eos_received && pipeline_error.is_none() {
            log::warn!("EOS timeout reached, forcing pipeline shutdown");
        }

        open.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| RecorderError::SinkClose(format!("Failed to stop pipeline: {e}")))?;

        if let Some(err) = pipeline_error {
            return Err(RecorderError::SinkClose(err));
        }

        verify_output(&open.output_path)?;
        Ok(open.output_path)
    }
}

/// Check that the output file exists and has data
fn verify_output(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        RecorderError::SinkClose(format!("Output file was not created: {} ({e})", path.display()))
    })?;

    if metadata.len() == 0 {
        return Err(RecorderError::SinkClose(format!(
            "Output file is empty: {}",
            path.display()
        )));
    }

    log::info!("Output file verified: {} ({} bytes)", path.display(), metadata.len());
    Ok(())
}
