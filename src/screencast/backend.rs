//! Seam between the capture session and the compositor protocol
//!
//! The session never talks to the display connection directly: requests go
//! through [`CaptureBackend`] and events arrive as [`RecorderEvent`] values
//! whose buffers have already been resolved to pool slots.

use crate::buffer::ShmRegion;
use crate::error::{RecorderError, Result};

const WL_SHM_FORMAT_ARGB8888: u32 = 0;
const WL_SHM_FORMAT_XRGB8888: u32 = 1;
const WL_SHM_FORMAT_ABGR8888: u32 = 0x3432_4241;
const WL_SHM_FORMAT_XBGR8888: u32 = 0x3432_4258;

/// Byte layout of captured pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// B, G, R, A in memory
    Argb8888,
    /// B, G, R, X in memory
    Xrgb8888,
    /// R, G, B, A in memory
    Abgr8888,
    /// R, G, B, X in memory
    Xbgr8888,
    /// A code we don't know; read as R, G, B, A bytes
    Unknown(u32),
}

impl PixelFormat {
    pub fn from_code(code: u32) -> Self {
        match code {
            WL_SHM_FORMAT_ARGB8888 => Self::Argb8888,
            WL_SHM_FORMAT_XRGB8888 => Self::Xrgb8888,
            WL_SHM_FORMAT_ABGR8888 => Self::Abgr8888,
            WL_SHM_FORMAT_XBGR8888 => Self::Xbgr8888,
            other => Self::Unknown(other),
        }
    }

    /// wl_shm format code used when registering buffers
    pub fn shm_code(self) -> u32 {
        match self {
            Self::Argb8888 | Self::Unknown(_) => WL_SHM_FORMAT_ARGB8888,
            Self::Xrgb8888 => WL_SHM_FORMAT_XRGB8888,
            Self::Abgr8888 => WL_SHM_FORMAT_ABGR8888,
            Self::Xbgr8888 => WL_SHM_FORMAT_XBGR8888,
        }
    }

    /// Whether the red channel comes first in memory
    pub fn is_rgb_order(self) -> bool {
        matches!(self, Self::Abgr8888 | Self::Xbgr8888 | Self::Unknown(_))
    }
}

/// Frame geometry announced by the compositor's `setup` event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub const BYTES_PER_PIXEL: u32 = 4;

    pub fn from_setup(width: i32, height: i32, stride: i32, format: i32) -> Result<Self> {
        let invalid = || RecorderError::InvalidGeometry {
            width,
            height,
            stride,
        };
        let w = u32::try_from(width).ok().filter(|&w| w > 0).ok_or_else(invalid)?;
        let h = u32::try_from(height).ok().filter(|&h| h > 0).ok_or_else(invalid)?;
        let s = u32::try_from(stride).map_err(|_| invalid())?;
        if s < w.saturating_mul(Self::BYTES_PER_PIXEL) {
            return Err(invalid());
        }
        Ok(Self {
            width: w,
            height: h,
            stride: s,
            format: PixelFormat::from_code(format as u32),
        })
    }

    /// Size in bytes of one buffer, `stride * height`
    pub fn buffer_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Orientation of a filled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Normal,
    /// Rows are stored bottom-up and must be mirrored vertically
    YInverted,
}

impl Transform {
    /// Map the protocol's transform code, treating unknown values as upright
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::YInverted,
            _ => Self::Normal,
        }
    }
}

/// Events delivered by the capture-manager extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    Setup {
        width: i32,
        height: i32,
        stride: i32,
        format: i32,
    },
    Frame {
        slot: usize,
        timestamp: u32,
        transform: Transform,
    },
    Failed {
        result: i32,
        slot: Option<usize>,
    },
    Cancel {
        slot: usize,
    },
}

/// Requests the session issues against the compositor
pub trait CaptureBackend {
    /// Protocol-level handle for one registered buffer
    type Buffer;

    /// Instantiate the capture object bound to the recorded output
    fn create_recorder(&mut self) -> Result<()>;

    /// Register a shared-memory region with the allocator
    fn register_buffer(
        &mut self,
        slot: usize,
        region: &ShmRegion,
        geometry: &FrameGeometry,
    ) -> Result<Self::Buffer>;

    /// Ask the compositor to fill `buffer` on its next repaint
    fn record_frame(&mut self, buffer: &Self::Buffer);

    fn release_buffer(&mut self, buffer: Self::Buffer);

    fn destroy_recorder(&mut self);
}
