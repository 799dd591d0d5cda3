//! Buffer and source configuration
//!
//! Values come from `ROLLCAM_*` environment variables with defaults that
//! match a 10-minute buffer of 1-second segments.

use anyhow::{bail, Result};
use chrono::TimeDelta;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::{EvictionPolicy, SegmentIndex};

/// Configuration of the rolling buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Directory holding the segment files
    pub buffer_dir: PathBuf,
    /// Retention horizon in seconds
    pub buffer_secs: u64,
    /// Duration of each segment in whole seconds
    pub segment_secs: u64,
    /// Horizon of the in-memory frame ring at the nominal frame rate
    pub ring_secs: u64,
    /// Container extension of segment and clip files
    pub container_ext: String,
    /// Transcode tool binary
    pub ffmpeg: PathBuf,
    /// Process-level timeout for one extraction
    pub extract_timeout_secs: u64,
    /// Upper bound on waiting for a window that ends in the future
    pub wait_timeout_secs: u64,
    /// Clips smaller than this are treated as failed extractions
    pub min_clip_bytes: u64,
    /// Which retention rule the evictor applies
    pub eviction: EvictionPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_dir: PathBuf::from("./rolling_buffer"),
            buffer_secs: 600,
            segment_secs: 1,
            ring_secs: 30,
            container_ext: "mp4".to_string(),
            ffmpeg: PathBuf::from("ffmpeg"),
            extract_timeout_secs: 60,
            wait_timeout_secs: 12,
            min_clip_bytes: 1024,
            eviction: EvictionPolicy::Age,
        }
    }
}

impl BufferConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let buffer_dir = std::env::var("ROLLCAM_BUFFER_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.buffer_dir);

        let ffmpeg = std::env::var("ROLLCAM_FFMPEG")
            .map(PathBuf::from)
            .unwrap_or(defaults.ffmpeg);

        let eviction = std::env::var("ROLLCAM_EVICTION")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.eviction);

        Self {
            buffer_dir,
            buffer_secs: env_u64("ROLLCAM_BUFFER_SECS").unwrap_or(defaults.buffer_secs),
            segment_secs: env_u64("ROLLCAM_SEGMENT_SECS").unwrap_or(defaults.segment_secs),
            ring_secs: env_u64("ROLLCAM_RING_SECS").unwrap_or(defaults.ring_secs),
            container_ext: defaults.container_ext,
            ffmpeg,
            extract_timeout_secs: env_u64("ROLLCAM_EXTRACT_TIMEOUT_SECS")
                .unwrap_or(defaults.extract_timeout_secs),
            wait_timeout_secs: env_u64("ROLLCAM_WAIT_TIMEOUT_SECS")
                .unwrap_or(defaults.wait_timeout_secs),
            min_clip_bytes: env_u64("ROLLCAM_MIN_CLIP_BYTES").unwrap_or(defaults.min_clip_bytes),
            eviction,
        }
    }

    /// Reject settings the buffer cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.segment_secs == 0 {
            bail!("Segment duration must be at least 1 second");
        }
        if self.buffer_secs < self.segment_secs {
            bail!(
                "Buffer duration ({}s) must be at least one segment ({}s)",
                self.buffer_secs,
                self.segment_secs
            );
        }
        if self.container_ext.is_empty() {
            bail!("Container extension must not be empty");
        }
        Ok(())
    }

    /// Retention horizon.
    pub fn buffer_duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.buffer_secs as i64)
    }

    /// Nominal duration of one segment.
    pub fn segment_duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.segment_secs as i64)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Ring capacity in frames for the given nominal frame rate.
    pub fn ring_capacity(&self, fps: u32) -> usize {
        (self.ring_secs as usize * fps.max(1) as usize).max(1)
    }

    /// Index over the configured segment directory.
    pub fn index(&self) -> SegmentIndex {
        SegmentIndex::new(
            self.buffer_dir.clone(),
            self.segment_duration(),
            self.container_ext.clone(),
        )
    }
}

/// Configuration of the frame source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Input URL handed to ffmpeg (`test://` selects the synthetic source)
    pub uri: String,
    /// Output width (0 = probe the source)
    pub width: u32,
    /// Output height (0 = probe the source)
    pub height: u32,
    /// Output frame rate (0 = probe the source)
    pub fps: u32,
    /// Decoder binary
    pub ffmpeg: PathBuf,
    /// Probe binary used when size or rate is not configured
    pub ffprobe: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: "test://".to_string(),
            width: 0,
            height: 0,
            fps: 0,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl SourceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            uri: std::env::var("ROLLCAM_SOURCE").unwrap_or(defaults.uri),
            width: env_u32("ROLLCAM_WIDTH").unwrap_or(defaults.width),
            height: env_u32("ROLLCAM_HEIGHT").unwrap_or(defaults.height),
            fps: env_u32("ROLLCAM_FPS").unwrap_or(defaults.fps),
            ffmpeg: std::env::var("ROLLCAM_FFMPEG")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg),
            ffprobe: std::env::var("ROLLCAM_FFPROBE")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe),
        }
    }

    /// Whether the synthetic source was requested.
    pub fn is_test_source(&self) -> bool {
        self.uri.starts_with("test://")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BufferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_duration(), TimeDelta::seconds(600));
        assert_eq!(config.segment_duration(), TimeDelta::seconds(1));
    }

    #[test]
    fn zero_segment_duration_rejected() {
        let config = BufferConfig {
            segment_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn buffer_shorter_than_segment_rejected() {
        let config = BufferConfig {
            buffer_secs: 1,
            segment_secs: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn ring_capacity_scales_with_fps() {
        let config = BufferConfig {
            ring_secs: 10,
            ..Default::default()
        };
        assert_eq!(config.ring_capacity(30), 300);
        assert_eq!(config.ring_capacity(0), 10);
    }

    #[test]
    fn test_source_uri_detected() {
        assert!(SourceConfig::default().is_test_source());
        let rtsp = SourceConfig {
            uri: "rtsp://camera/stream".to_string(),
            ..Default::default()
        };
        assert!(!rtsp.is_test_source());
    }
}
