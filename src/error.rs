//! Error types for the capture core

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// The compositor never advertised `lipstick_recorder_manager`
    #[error("compositor does not support screen capture (lipstick_recorder_manager not advertised)")]
    CaptureUnsupported,

    #[error("wl_shm global not advertised by the compositor")]
    ShmUnavailable,

    #[error("no wl_output available to record")]
    NoOutput,

    #[error("failed to allocate shared-memory buffer {slot}")]
    BufferAllocation {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("compositor reported capture failure (result {0})")]
    CaptureFailed(i32),

    #[error("invalid frame geometry {width}x{height} (stride {stride})")]
    InvalidGeometry { width: i32, height: i32, stride: i32 },

    #[error("failed to open output {path}: {reason}")]
    SinkOpen { path: PathBuf, reason: String },

    #[error("failed to append frame to output: {0}")]
    SinkAppend(String),

    #[error("failed to finalize output: {0}")]
    SinkClose(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("invalid recording options: {0}")]
    Config(String),

    #[error("display connection error: {0}")]
    Connection(String),
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;
