//! Recording options and their persistence
//!
//! Options are read once at startup from a JSON file in the user's config
//! directory, overridden by command-line arguments, and may be changed over
//! the control surface between recordings. A recording works on its own
//! copy taken at `start()`, so changes never affect a recording in progress.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RecorderError;

pub const DEFAULT_FPS: u32 = 24;
pub const DEFAULT_QUALITY: u8 = 75;
pub const DEFAULT_SCALE: f64 = 1.0;

const FILE_PREFIX: &str = "screencast";
const FILE_EXTENSION: &str = "avi";

/// Options handle shared between the protocol thread and the control surface
pub type SharedOptions = Arc<Mutex<RecordingOptions>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingOptions {
    /// Output file, or a directory to create a timestamped file in
    pub destination: PathBuf,
    /// Target frames per second
    pub fps: u32,
    /// Explicit buffer pool size; `None` means twice the frame rate
    pub buffers: Option<u32>,
    /// Output scale factor applied to every captured frame
    pub scale: f64,
    /// JPEG quality, 1-100
    pub quality: u8,
    /// Bilinear instead of nearest-neighbour scaling
    pub smooth: bool,
    /// Re-emit the last frame at a fixed cadence when the screen is idle
    pub full_mode: bool,
    #[serde(skip)]
    pub daemonize: bool,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            destination: default_destination(),
            fps: DEFAULT_FPS,
            buffers: None,
            scale: DEFAULT_SCALE,
            quality: DEFAULT_QUALITY,
            smooth: false,
            full_mode: false,
            daemonize: false,
        }
    }
}

impl RecordingOptions {
    pub fn into_shared(self) -> SharedOptions {
        Arc::new(Mutex::new(self))
    }

    /// Number of shared-memory buffers to allocate for one recording
    pub fn buffer_count(&self) -> usize {
        self.buffers.unwrap_or(self.fps.saturating_mul(2)).max(1) as usize
    }

    /// Full-frame re-emission interval, `1000 / fps` milliseconds
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.fps.max(1)))
    }

    pub fn validate(&self) -> Result<(), RecorderError> {
        if self.fps == 0 {
            return Err(RecorderError::Config("fps must be at least 1".into()));
        }
        if self.buffers == Some(0) {
            return Err(RecorderError::Config("buffers must be at least 1".into()));
        }
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(RecorderError::Config(format!(
                "scale must be a positive number, got {}",
                self.scale
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(RecorderError::Config(format!(
                "quality must be within 1-100, got {}",
                self.quality
            )));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(RecorderError::Config("no destination set".into()));
        }
        Ok(())
    }

    /// Set the frame rate and drop any explicit pool size so it follows the new rate
    pub fn set_fps(&mut self, fps: u32) {
        self.fps = fps;
        self.buffers = None;
    }

    /// Quality as received over the control surface, where negative means default
    pub fn set_quality_from_control(&mut self, quality: i32) {
        self.quality = if quality < 0 {
            DEFAULT_QUALITY
        } else {
            quality.clamp(1, 100) as u8
        };
    }

    /// Resolve the destination into the file this recording writes to
    pub fn resolve_output_path(&self) -> Result<PathBuf> {
        self.resolve_output_path_at(Local::now())
    }

    pub fn resolve_output_path_at(&self, now: DateTime<Local>) -> Result<PathBuf> {
        let destination = &self.destination;
        let is_dir = destination.is_dir() || ends_with_separator(destination);

        let path = if is_dir {
            std::fs::create_dir_all(destination).with_context(|| {
                format!("Failed to create destination directory: {}", destination.display())
            })?;
            destination.join(format!(
                "{}-{}.{}",
                FILE_PREFIX,
                now.format("%Y%m%d-%H%M%S"),
                FILE_EXTENSION
            ))
        } else {
            if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create destination directory: {}", parent.display())
                })?;
            }
            destination.clone()
        };

        Ok(path)
    }

    /// Path of the persisted options file
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("screenrecorder").join("options.json"))
    }

    /// Load persisted options, falling back to defaults when none are saved
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read options file: {}", path.display()))?;
        let options = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse options file: {}", path.display()))?;
        Ok(options)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write options file: {}", path.display()))?;
        Ok(())
    }
}

fn default_destination() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn ends_with_separator(path: &Path) -> bool {
    path.as_os_str()
        .to_string_lossy()
        .ends_with(std::path::MAIN_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn buffers_default_to_twice_fps() {
        let mut options = RecordingOptions::default();
        assert_eq!(options.buffer_count(), 48);

        options.set_fps(10);
        assert_eq!(options.buffer_count(), 20);

        options.buffers = Some(3);
        assert_eq!(options.buffer_count(), 3);

        options.set_fps(5);
        assert_eq!(options.buffer_count(), 10);
    }

    #[test]
    fn frame_interval_follows_fps() {
        let options = RecordingOptions {
            fps: 24,
            ..Default::default()
        };
        assert_eq!(options.frame_interval(), Duration::from_nanos(41_666_666));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let valid = RecordingOptions {
            destination: PathBuf::from("/tmp/out.avi"),
            ..Default::default()
        };
        assert!(valid.validate().is_ok());

        let zero_fps = RecordingOptions { fps: 0, ..valid.clone() };
        assert!(zero_fps.validate().is_err());

        let zero_buffers = RecordingOptions { buffers: Some(0), ..valid.clone() };
        assert!(zero_buffers.validate().is_err());

        let bad_scale = RecordingOptions { scale: f64::NAN, ..valid.clone() };
        assert!(bad_scale.validate().is_err());

        let negative_scale = RecordingOptions { scale: -0.5, ..valid.clone() };
        assert!(negative_scale.validate().is_err());

        let bad_quality = RecordingOptions { quality: 0, ..valid };
        assert!(bad_quality.validate().is_err());
    }

    #[test]
    fn control_quality_maps_negative_to_default() {
        let mut options = RecordingOptions::default();
        options.set_quality_from_control(-1);
        assert_eq!(options.quality, DEFAULT_QUALITY);
        options.set_quality_from_control(250);
        assert_eq!(options.quality, 100);
        options.set_quality_from_control(40);
        assert_eq!(options.quality, 40);
    }

    #[test]
    fn directory_destination_gets_timestamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let options = RecordingOptions {
            destination: dir.path().to_path_buf(),
            ..Default::default()
        };
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = options.resolve_output_path_at(now).unwrap();
        assert_eq!(path, dir.path().join("screencast-20240309-140507.avi"));
    }

    #[test]
    fn file_destination_is_used_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("clip.avi");
        let options = RecordingOptions {
            destination: target.clone(),
            ..Default::default()
        };
        let path = options.resolve_output_path().unwrap();
        assert_eq!(path, target);
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn options_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");

        let options = RecordingOptions {
            destination: PathBuf::from("/tmp/videos"),
            fps: 30,
            buffers: Some(8),
            scale: 0.5,
            quality: 90,
            smooth: true,
            full_mode: true,
            daemonize: true,
        };
        options.save_to(&path).unwrap();

        let loaded = RecordingOptions::load_from(&path).unwrap();
        assert_eq!(loaded.fps, 30);
        assert_eq!(loaded.buffers, Some(8));
        assert!(loaded.full_mode);
        // daemonize is a per-process flag and never persisted
        assert!(!loaded.daemonize);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = RecordingOptions::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.fps, DEFAULT_FPS);
        assert_eq!(loaded.buffers, None);
    }
}
