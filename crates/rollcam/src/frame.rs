//! Frame types for the live stream

use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wall-clock timestamp (local time, as written into segment filenames).
pub type Timestamp = NaiveDateTime;

/// Raw pixel layout of decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit blue/green/red
    Bgr24,
}

impl PixelFormat {
    /// Bytes used by a single pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgr24 => 3,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
        }
    }
}

/// Stream properties, determined once when a source is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProperties {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Nominal frames per second (0 = unknown)
    pub fps: u32,
    /// Pixel layout of each frame
    pub format: PixelFormat,
}

impl StreamProperties {
    /// Frame rate assumed when the source does not report one.
    pub const FALLBACK_FPS: u32 = 15;

    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            format: PixelFormat::Bgr24,
        }
    }

    /// Replace an unknown frame rate with [`Self::FALLBACK_FPS`].
    pub fn with_fallback_fps(mut self) -> Self {
        if self.fps == 0 {
            self.fps = Self::FALLBACK_FPS;
        }
        self
    }

    /// Size of one raw frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Number of frames spanning `duration` at the nominal rate.
    pub fn frames_in(&self, duration: Duration) -> u64 {
        (self.fps as f64 * duration.as_secs_f64()).round() as u64
    }

    /// Nominal interval between two frames.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// A timestamped decoded image held in memory.
///
/// The image buffer is immutable and reference counted: cloning a frame
/// never shares mutable state with the producer, which allocates a fresh
/// buffer for every frame it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame {
    /// Capture time
    pub timestamp: Timestamp,
    /// Raw image bytes in the stream's pixel format
    pub image: Bytes,
}

impl LiveFrame {
    pub fn new(timestamp: Timestamp, image: Bytes) -> Self {
        Self { timestamp, image }
    }
}

/// Outcome of a single read from a frame source.
#[derive(Debug, Clone)]
pub enum FrameRead {
    /// A frame was delivered
    Frame(LiveFrame),
    /// Transient failure: nothing delivered this time, the stream is still alive
    Missed,
    /// The source is exhausted or closed
    Ended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_for_bgr24() {
        let props = StreamProperties::new(640, 480, 30);
        assert_eq!(props.frame_bytes(), 640 * 480 * 3);
    }

    #[test]
    fn fallback_fps_only_replaces_unknown_rate() {
        assert_eq!(StreamProperties::new(2, 2, 0).with_fallback_fps().fps, 15);
        assert_eq!(StreamProperties::new(2, 2, 25).with_fallback_fps().fps, 25);
    }

    #[test]
    fn frames_in_segment() {
        let props = StreamProperties::new(2, 2, 15);
        assert_eq!(props.frames_in(Duration::from_secs(1)), 15);
        assert_eq!(props.frames_in(Duration::from_secs(2)), 30);
    }

    #[test]
    fn frame_interval_never_divides_by_zero() {
        let props = StreamProperties::new(2, 2, 0);
        assert_eq!(props.frame_interval(), Duration::from_secs(1));
    }
}
