//! Frame conversion and still-image encoding
//!
//! Conversion runs on the protocol thread and turns a filled buffer into an
//! owned RGB snapshot (pixel format, orientation and scale applied).
//! Encoding runs on the pipeline worker and compresses a snapshot to JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};

use crate::error::Result;

use super::backend::{FrameGeometry, Transform};

/// Turns raw buffer contents into the frame that gets emitted
#[derive(Debug, Clone)]
pub struct FrameConverter {
    geometry: FrameGeometry,
    output_width: u32,
    output_height: u32,
    filter: FilterType,
}

impl FrameConverter {
    pub fn new(geometry: FrameGeometry, scale: f64, smooth: bool) -> Self {
        let scaled = |len: u32| ((f64::from(len) * scale).round() as u32).max(1);
        Self {
            geometry,
            output_width: scaled(geometry.width),
            output_height: scaled(geometry.height),
            filter: if smooth {
                FilterType::Triangle
            } else {
                FilterType::Nearest
            },
        }
    }

    /// Dimensions of emitted frames
    pub fn output_size(&self) -> (u32, u32) {
        (self.output_width, self.output_height)
    }

    pub fn convert(&self, pixels: &[u8], transform: Transform) -> RgbImage {
        let mut image = self.snapshot(pixels);
        if transform == Transform::YInverted {
            imageops::flip_vertical_in_place(&mut image);
        }
        if (image.width(), image.height()) != self.output_size() {
            image = imageops::resize(&image, self.output_width, self.output_height, self.filter);
        }
        image
    }

    /// Copy the visible part of every row, dropping stride padding and alpha
    fn snapshot(&self, pixels: &[u8]) -> RgbImage {
        let FrameGeometry {
            width,
            height,
            stride,
            format,
        } = self.geometry;
        let row_bytes = (width * FrameGeometry::BYTES_PER_PIXEL) as usize;
        let rgb_order = format.is_rgb_order();

        let mut out = Vec::with_capacity(width as usize * height as usize * 3);
        for row in pixels.chunks(stride as usize).take(height as usize) {
            for px in row[..row_bytes.min(row.len())].chunks_exact(4) {
                if rgb_order {
                    out.extend_from_slice(&[px[0], px[1], px[2]]);
                } else {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
        // A short region would leave the image incomplete; pad with black.
        out.resize(width as usize * height as usize * 3, 0);

        RgbImage::from_raw(width, height, out).unwrap_or_else(|| RgbImage::new(width, height))
    }
}

/// Still-image encoder used by the pipeline worker
pub trait FrameEncoder: Send {
    fn encode(&mut self, image: &RgbImage, quality: u8) -> Result<Vec<u8>>;
}

/// Baseline JPEG, the payload format of MJPG streams
#[derive(Debug, Default)]
pub struct JpegFrameEncoder {
    scratch_capacity: usize,
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.scratch_capacity);
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
        encoder.encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )?;
        self.scratch_capacity = self.scratch_capacity.max(bytes.len());
        Ok(bytes)
    }
}
