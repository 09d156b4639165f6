//! Screen recording core
//!
//! The capture session drives a fixed pool of shared-memory buffers through
//! the compositor's recorder extension and streams the filled frames, in
//! capture order, through a single-worker encode pipeline into an AVI file.

pub mod backend;
pub mod encoder;
mod pacing;
mod pipeline;
mod pool;
mod session;
pub mod sink;
mod state;

pub use backend::{CaptureBackend, RecorderEvent, Transform};
pub use session::{OutputFactory, Session};
pub use state::{SessionState, StatusPublisher};
