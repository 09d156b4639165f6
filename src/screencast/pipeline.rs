//! Encode/output pipeline
//!
//! A bounded FIFO of owned frame snapshots drained by exactly one worker
//! thread. Tasks are encoded and appended to the sink strictly in
//! submission order; the submitting thread never waits on encoding.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::{RecorderError, Result};

use super::encoder::FrameEncoder;
use super::sink::OutputSink;

const PROGRESS_LOG_INTERVAL: u64 = 60;

/// One frame travelling to the sink
pub struct Task {
    /// Position in the output stream
    pub sequence: u64,
    pub image: Arc<RgbImage>,
    pub quality: u8,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    written: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct Pipeline {
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<Result<PathBuf>>>,
    next_sequence: u64,
    quality: u8,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Start the worker thread; `depth` bounds the number of queued frames
    pub fn spawn(
        sink: Box<dyn OutputSink>,
        encoder: Box<dyn FrameEncoder>,
        quality: u8,
        depth: usize,
    ) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(depth.max(1));
        let stats = Arc::new(PipelineStats::default());

        let worker_stats = stats.clone();
        let worker = thread::Builder::new()
            .name("frame-encoder".into())
            .spawn(move || run_worker(receiver, sink, encoder, worker_stats))
            .map_err(|e| RecorderError::SinkOpen {
                path: PathBuf::new(),
                reason: format!("failed to spawn encoder thread: {e}"),
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            next_sequence: 0,
            quality,
            stats,
        })
    }

    /// Queue a snapshot without blocking
    ///
    /// Returns `false` if the frame was dropped because the queue is full.
    pub fn submit(&mut self, image: Arc<RgbImage>) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };

        let task = Task {
            sequence: self.next_sequence,
            image,
            quality: self.quality,
        };
        match sender.try_send(task) {
            Ok(()) => {
                self.next_sequence += 1;
                true
            }
            Err(TrySendError::Full(task)) => {
                log::warn!("Encoder queue full, dropping frame {}", task.sequence);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(task)) => {
                log::error!("Encoder thread is gone, dropping frame {}", task.sequence);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn submitted(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Wait for every queued task, then close the sink
    pub fn finish(mut self) -> Result<PathBuf> {
        let started = Instant::now();
        drop(self.sender.take());

        let worker = self
            .worker
            .take()
            .ok_or_else(|| RecorderError::SinkClose("encoder thread already joined".into()))?;
        let result = worker
            .join()
            .map_err(|_| RecorderError::SinkClose("encoder thread panicked".into()))?;

        log::info!(
            "Pipeline drained in {:?}: {} frames written, {} dropped",
            started.elapsed(),
            self.stats.written(),
            self.stats.dropped()
        );
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if let Ok(Err(e)) = worker.join() {
                log::error!("Discarded pipeline failed to close: {}", e);
            }
        }
    }
}

fn run_worker(
    receiver: Receiver<Task>,
    mut sink: Box<dyn OutputSink>,
    mut encoder: Box<dyn FrameEncoder>,
    stats: Arc<PipelineStats>,
) -> Result<PathBuf> {
    let started = Instant::now();
    let mut expected = 0u64;

    for task in receiver.iter() {
        debug_assert!(task.sequence >= expected, "frames out of order");
        expected = task.sequence + 1;

        let appended = encoder
            .encode(&task.image, task.quality)
            .and_then(|bytes| sink.append(&bytes));

        match appended {
            Ok(()) => {
                let written = stats.written.fetch_add(1, Ordering::Relaxed) + 1;
                if written % PROGRESS_LOG_INTERVAL == 0 {
                    let fps = written as f64 / started.elapsed().as_secs_f64();
                    log::info!("Recording: {} frames written ({:.1} fps)", written, fps);
                }
            }
            Err(e) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping frame {}: {}", task.sequence, e);
            }
        }
    }

    sink.close()
}
