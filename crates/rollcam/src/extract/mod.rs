//! Clip extraction
//!
//! A clip is the video between `start` and `start + duration`, written to a
//! single output file. Two backends can serve it:
//!
//! - [`SegmentBackend`]: concatenates and trims the covering segment files
//!   losslessly with an external transcoder
//! - [`RingBackend`]: encodes the matching frames straight out of the
//!   in-memory ring
//!
//! [`ClipService`] validates the request and picks the backend by how
//! recent the window is.

pub mod ring;
pub mod segments;
pub mod transcode;

pub use ring::RingBackend;
pub use segments::SegmentBackend;
pub use transcode::{FfmpegTranscoder, Transcoder};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::segment::TIMESTAMP_FORMAT;
use crate::{Clock, TimeWindow, Timestamp};

/// Extraction failures, split by what the caller can do about them.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Requested duration {requested}s exceeds buffer maximum of {max}s")]
    ExceedsRetention { requested: i64, max: i64 },

    #[error("Requested time is not in buffer window (available: {})", describe(.available))]
    NotInBuffer { available: Option<TimeWindow> },

    #[error(
        "Requested window is only partially covered, missing {gap} (available: {})",
        describe(.available)
    )]
    PartialCoverage {
        available: Option<TimeWindow>,
        gap: TimeWindow,
    },

    #[error(
        "Timed out waiting for segments up to {} (latest: {})",
        describe_ts(.needed_end),
        describe_end(.latest_end)
    )]
    WaitTimeout {
        needed_end: Timestamp,
        latest_end: Option<Timestamp>,
    },

    #[error("Failed to run {tool}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcoder exited with {status}: {stderr}")]
    Tool { status: String, stderr: String },

    #[error("Transcoder did not finish within {after:?}")]
    ToolTimeout { after: Duration },

    #[error("Extracted clip is too small ({size} bytes, minimum {min})")]
    ClipTooSmall { size: u64, min: u64 },

    #[error("Encoder failed: {0:#}")]
    Encoder(anyhow::Error),

    #[error("Failed to read segment index: {0:#}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// Process exit code for this failure.
    ///
    /// 1 invalid input, 2 exceeds retention, 3 window not covered,
    /// 4 output failed the size check, 5 tool or I/O failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExtractError::InvalidRequest(_) => 1,
            ExtractError::ExceedsRetention { .. } => 2,
            ExtractError::NotInBuffer { .. }
            | ExtractError::PartialCoverage { .. }
            | ExtractError::WaitTimeout { .. } => 3,
            ExtractError::ClipTooSmall { .. } => 4,
            ExtractError::ToolUnavailable { .. }
            | ExtractError::Tool { .. }
            | ExtractError::ToolTimeout { .. }
            | ExtractError::Encoder(_)
            | ExtractError::Storage(_)
            | ExtractError::Io(_) => 5,
        }
    }

    /// Whether the window was missing from the buffer, as opposed to the
    /// extraction itself failing.
    pub fn is_coverage(&self) -> bool {
        self.exit_code() == 3
    }
}

fn describe(window: &Option<TimeWindow>) -> String {
    match window {
        Some(w) => w.to_string(),
        None => "empty".to_string(),
    }
}

fn describe_ts(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn describe_end(end: &Option<Timestamp>) -> String {
    end.as_ref().map_or_else(|| "none".to_string(), describe_ts)
}

/// A request for the video in `[start, start + duration)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub start: Timestamp,
    pub duration: TimeDelta,
}

impl ExtractionRequest {
    pub fn new(start: Timestamp, duration: TimeDelta) -> Self {
        Self { start, duration }
    }

    /// Request `duration` of video with `center` at its midpoint.
    pub fn centered(center: Timestamp, duration: TimeDelta) -> Self {
        let window = TimeWindow::centered(center, duration);
        Self::new(window.start, duration)
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start, self.duration)
    }

    /// Check the request against the retention horizon. Touches no storage.
    pub fn validate(&self, max: TimeDelta) -> Result<(), ExtractError> {
        if self.duration <= TimeDelta::zero() {
            return Err(ExtractError::InvalidRequest(format!(
                "duration must be positive, got {}s",
                self.duration.num_seconds()
            )));
        }
        if self.duration > max {
            return Err(ExtractError::ExceedsRetention {
                requested: self.duration.num_seconds(),
                max: max.num_seconds(),
            });
        }
        Ok(())
    }
}

/// Output file name used when the caller gives none.
pub fn default_output_name(request: &ExtractionRequest, ext: &str) -> PathBuf {
    PathBuf::from(format!(
        "clip_{}_{}s.{}",
        request.start.format(TIMESTAMP_FORMAT),
        request.duration.num_seconds(),
        ext
    ))
}

/// Which store a clip came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipSource {
    Segments,
    Ring,
}

/// A successfully written clip.
#[derive(Debug, Clone, Serialize)]
pub struct ClipResult {
    pub path: PathBuf,
    /// Output size in bytes
    pub size: u64,
    /// Window actually covered (the ring may clamp the end)
    pub window: TimeWindow,
    pub source: ClipSource,
}

/// A store that can produce clips for time windows.
#[async_trait]
pub trait ClipBackend: Send + Sync {
    /// Earliest to latest instant the backend currently holds.
    async fn available_window(&self) -> Result<Option<TimeWindow>, ExtractError>;

    /// Write the video for `window` to `output`.
    async fn extract(&self, window: TimeWindow, output: &Path) -> Result<ClipResult, ExtractError>;
}

/// Fail unless `path` exists and holds at least `min` bytes.
pub(crate) async fn check_clip_size(path: &Path, min: u64) -> Result<u64, ExtractError> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    if size == 0 || size < min {
        return Err(ExtractError::ClipTooSmall { size, min });
    }
    Ok(size)
}

/// Create the output's parent directory if it has one.
pub(crate) async fn prepare_output(output: &Path) -> Result<(), ExtractError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Validates requests and routes them to the ring or the segment store.
pub struct ClipService {
    segments: Option<SegmentBackend>,
    ring: Option<RingBackend>,
    clock: Arc<dyn Clock>,
    buffer_duration: TimeDelta,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl ClipService {
    pub fn new(buffer_duration: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            segments: None,
            ring: None,
            clock,
            buffer_duration,
            wait_timeout: Duration::from_secs(12),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_segments(mut self, backend: SegmentBackend) -> Self {
        self.segments = Some(backend);
        self
    }

    pub fn with_ring(mut self, backend: RingBackend) -> Self {
        self.ring = Some(backend);
        self
    }

    /// Bound on waiting for a window that ends in the future.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn segments(&self) -> Option<&SegmentBackend> {
        self.segments.as_ref()
    }

    pub fn ring(&self) -> Option<&RingBackend> {
        self.ring.as_ref()
    }

    /// Window held by the segment store, or by the ring without one.
    pub async fn available_window(&self) -> Result<Option<TimeWindow>, ExtractError> {
        match (&self.segments, &self.ring) {
            (Some(segments), _) => segments.available_window().await,
            (None, Some(ring)) => ring.available_window().await,
            (None, None) => Ok(None),
        }
    }

    /// Extract `request` into `output`.
    ///
    /// The retention check runs before any storage access. A window already
    /// in the ring is served from memory; anything else goes to the segment
    /// store, waiting first if the window ends in the future.
    pub async fn extract(
        &self,
        request: &ExtractionRequest,
        output: &Path,
    ) -> Result<ClipResult, ExtractError> {
        request.validate(self.buffer_duration)?;
        let window = request.window();
        let now = self.clock.now();

        if let Some(ring) = &self.ring {
            if ring.can_serve(&window, now) || self.segments.is_none() {
                debug!("Serving {} from the frame ring", window);
                return ring.extract(window, output).await;
            }
        }

        let Some(segments) = &self.segments else {
            return Err(ExtractError::InvalidRequest(
                "no clip backend configured".to_string(),
            ));
        };

        if window.end > now {
            info!(
                "Window ends {}s in the future, waiting for segments",
                (window.end - now).num_seconds()
            );
            segments
                .wait_for(window.end, self.wait_timeout, self.poll_interval)
                .await?;
        }

        segments.extract(window, output).await
    }
}
