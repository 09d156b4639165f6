//! Fixed pool of shared-memory frame buffers

use crate::buffer::ShmRegion;
use crate::error::{RecorderError, Result};

use super::backend::{CaptureBackend, FrameGeometry, Transform};

/// One shared-memory frame surface
pub struct Buffer<H> {
    region: ShmRegion,
    handle: H,
    busy: bool,
    transform: Transform,
    timestamp: u32,
}

impl<H> Buffer<H> {
    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn pixels(&self) -> &[u8] {
        self.region.as_slice()
    }
}

/// Buffers allocated once per recording, addressed by slot index
pub struct BufferPool<H> {
    buffers: Vec<Buffer<H>>,
}

impl<H> BufferPool<H> {
    /// Allocate `count` buffers sized for `geometry` and register each one
    ///
    /// Either every buffer is allocated or none is: on failure the buffers
    /// registered so far are released again.
    pub fn allocate<B>(count: usize, geometry: FrameGeometry, backend: &mut B) -> Result<Self>
    where
        B: CaptureBackend<Buffer = H>,
    {
        let size = geometry.buffer_size();
        let mut buffers: Vec<Buffer<H>> = Vec::with_capacity(count);

        for slot in 0..count {
            let allocated = ShmRegion::new(size)
                .map_err(|source| RecorderError::BufferAllocation { slot, source })
                .and_then(|region| {
                    let handle = backend.register_buffer(slot, &region, &geometry)?;
                    Ok((region, handle))
                });

            match allocated {
                Ok((region, handle)) => buffers.push(Buffer {
                    region,
                    handle,
                    busy: false,
                    transform: Transform::Normal,
                    timestamp: 0,
                }),
                Err(err) => {
                    log::error!("Failed to create buffer {} of {} ({} bytes)", slot, count, size);
                    for buffer in buffers {
                        backend.release_buffer(buffer.handle);
                    }
                    return Err(err);
                }
            }
        }

        log::info!(
            "Allocated {} buffers: {}x{}, stride {}, {:?}",
            count,
            geometry.width,
            geometry.height,
            geometry.stride,
            geometry.format
        );

        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn get(&self, slot: usize) -> Option<&Buffer<H>> {
        self.buffers.get(slot)
    }

    pub fn handle(&self, slot: usize) -> Option<&H> {
        self.buffers.get(slot).map(|b| &b.handle)
    }

    /// First buffer not marked busy, in pool order
    pub fn acquire_free(&self) -> Option<usize> {
        self.buffers.iter().position(|b| !b.busy)
    }

    pub fn is_busy(&self, slot: usize) -> bool {
        self.buffers.get(slot).is_some_and(|b| b.busy)
    }

    pub fn busy_count(&self) -> usize {
        self.buffers.iter().filter(|b| b.busy).count()
    }

    pub fn mark_busy(&mut self, slot: usize) {
        if let Some(buffer) = self.buffers.get_mut(slot) {
            buffer.busy = true;
        }
    }

    pub fn mark_free(&mut self, slot: usize) {
        if let Some(buffer) = self.buffers.get_mut(slot) {
            buffer.busy = false;
        }
    }

    /// Remember what the compositor reported about the latest fill
    pub fn record_fill(&mut self, slot: usize, timestamp: u32, transform: Transform) {
        if let Some(buffer) = self.buffers.get_mut(slot) {
            buffer.timestamp = timestamp;
            buffer.transform = transform;
        }
    }

    #[cfg(test)]
    pub fn pixels_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        self.buffers.get_mut(slot).map(|b| b.region.as_mut_slice())
    }

    /// Release every protocol handle and unmap the regions
    pub fn teardown<B>(self, backend: &mut B)
    where
        B: CaptureBackend<Buffer = H>,
    {
        let count = self.buffers.len();
        for buffer in self.buffers {
            backend.release_buffer(buffer.handle);
        }
        log::debug!("Released {} buffers", count);
    }
}
