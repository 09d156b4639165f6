//! Output pacing: emit on change only, or sustain a fixed frame rate

use image::RgbImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingMode {
    /// One emitted frame per compositor `frame` event
    ChangeOnly,
    /// Re-emit the last frame whenever a frame interval passes without a new one
    FullFrame,
}

impl PacingMode {
    pub fn from_full_mode(full_mode: bool) -> Self {
        if full_mode {
            Self::FullFrame
        } else {
            Self::ChangeOnly
        }
    }
}

/// Single-shot re-emission timer plus the snapshot it would re-emit
pub struct Pacer {
    mode: PacingMode,
    interval: Duration,
    last: Option<Arc<RgbImage>>,
    deadline: Option<Instant>,
}

impl Pacer {
    pub fn new(mode: PacingMode, interval: Duration) -> Self {
        Self {
            mode,
            interval,
            last: None,
            deadline: None,
        }
    }

    /// A frame was emitted at `now`
    pub fn on_frame(&mut self, snapshot: Arc<RgbImage>, now: Instant) {
        if self.mode == PacingMode::FullFrame {
            self.last = Some(snapshot);
            self.deadline = Some(now + self.interval);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return the snapshot to re-emit if the timer expired, re-arming it
    pub fn poll(&mut self, now: Instant) -> Option<Arc<RgbImage>> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }

        let mut next = deadline + self.interval;
        if next <= now {
            // We fell behind by more than an interval; skip the backlog.
            next = now + self.interval;
        }
        self.deadline = Some(next);
        self.last.clone()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Arc<RgbImage> {
        Arc::new(RgbImage::new(2, 2))
    }

    /// Poll in 1 ms steps over `duration` and count re-emissions
    fn count_reemissions(pacer: &mut Pacer, start: Instant, duration: Duration) -> usize {
        let mut count = 0;
        let mut t = Duration::ZERO;
        while t <= duration {
            if pacer.poll(start + t).is_some() {
                count += 1;
            }
            t += Duration::from_millis(1);
        }
        count
    }

    #[test]
    fn full_mode_reemits_at_frame_rate() {
        for fps in [10u32, 24, 30, 60] {
            let interval = Duration::from_nanos(1_000_000_000 / u64::from(fps));
            let mut pacer = Pacer::new(PacingMode::FullFrame, interval);
            let start = Instant::now();
            pacer.on_frame(snapshot(), start);

            let duration = Duration::from_secs(2);
            let count = count_reemissions(&mut pacer, start, duration) as i64;
            let expected = (duration.as_secs_f64() * f64::from(fps)).floor() as i64;
            assert!(
                (count - expected).abs() <= 1,
                "fps {fps}: {count} re-emissions, expected {expected}"
            );
        }
    }

    #[test]
    fn change_only_mode_never_reemits() {
        let mut pacer = Pacer::new(PacingMode::ChangeOnly, Duration::from_millis(41));
        let start = Instant::now();
        pacer.on_frame(snapshot(), start);
        assert_eq!(pacer.deadline(), None);
        assert_eq!(count_reemissions(&mut pacer, start, Duration::from_secs(10)), 0);
    }

    #[test]
    fn new_frame_replaces_pending_reemission() {
        let interval = Duration::from_millis(100);
        let mut pacer = Pacer::new(PacingMode::FullFrame, interval);
        let start = Instant::now();

        let first = snapshot();
        pacer.on_frame(first.clone(), start);

        let second = Arc::new(RgbImage::new(3, 3));
        pacer.on_frame(second.clone(), start + Duration::from_millis(90));

        assert!(pacer.poll(start + Duration::from_millis(100)).is_none());
        let emitted = pacer.poll(start + Duration::from_millis(190)).unwrap();
        assert!(Arc::ptr_eq(&emitted, &second));
    }

    #[test]
    fn falling_behind_does_not_burst() {
        let interval = Duration::from_millis(10);
        let mut pacer = Pacer::new(PacingMode::FullFrame, interval);
        let start = Instant::now();
        pacer.on_frame(snapshot(), start);

        let late = start + Duration::from_millis(500);
        assert!(pacer.poll(late).is_some());
        assert!(pacer.poll(late).is_none());
        assert_eq!(pacer.deadline(), Some(late + interval));
    }

    #[test]
    fn cancel_disarms_the_timer() {
        let mut pacer = Pacer::new(PacingMode::FullFrame, Duration::from_millis(10));
        let start = Instant::now();
        pacer.on_frame(snapshot(), start);
        pacer.cancel();
        assert!(pacer.poll(start + Duration::from_secs(1)).is_none());
    }
}
