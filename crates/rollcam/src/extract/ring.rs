//! Ring-backed clip extraction
//!
//! Frames already in memory are encoded straight into the output file.
//! Frame timestamps give frame-level precision, so there is no trim step.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{check_clip_size, prepare_output, ClipBackend, ClipResult, ClipSource, ExtractError};
use crate::encode::Encoder;
use crate::storage::segment::{SEGMENT_PREFIX, TIMESTAMP_FORMAT};
use crate::{BufferHandle, Clock, LiveFrame, TimeWindow, Timestamp};

/// Serves clips from the live frame ring of a [`BufferHandle`].
#[derive(Clone)]
pub struct RingBackend {
    handle: Arc<BufferHandle>,
    encoder: Arc<dyn Encoder>,
    clock: Arc<dyn Clock>,
    min_clip_bytes: u64,
    container_ext: String,
}

impl RingBackend {
    pub fn new(
        handle: Arc<BufferHandle>,
        encoder: Arc<dyn Encoder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            handle,
            encoder,
            clock,
            min_clip_bytes: 1024,
            container_ext: "mp4".to_string(),
        }
    }

    pub fn with_min_clip_bytes(mut self, bytes: u64) -> Self {
        self.min_clip_bytes = bytes;
        self
    }

    pub fn with_container_ext(mut self, ext: impl Into<String>) -> Self {
        self.container_ext = ext.into();
        self
    }

    /// Whether `window` is complete in memory as of `now`.
    pub fn can_serve(&self, window: &TimeWindow, now: Timestamp) -> bool {
        let Some(props) = self.handle.properties() else {
            return false;
        };
        window.end <= now && self.handle.ring().covers(window, props.frame_interval())
    }

    /// Record several windows into `dir`, one file per window named
    /// `segment_<start>_<end time>.<ext>`.
    ///
    /// Each window succeeds or fails on its own.
    pub async fn extract_many(
        &self,
        windows: &[TimeWindow],
        dir: &Path,
    ) -> Vec<Result<ClipResult, ExtractError>> {
        let mut results = Vec::with_capacity(windows.len());
        for window in windows {
            let output = dir.join(self.batch_file_name(window));
            results.push(self.extract(*window, &output).await);
        }
        results
    }

    fn batch_file_name(&self, window: &TimeWindow) -> PathBuf {
        PathBuf::from(format!(
            "{}{}_{}.{}",
            SEGMENT_PREFIX,
            window.start.format(TIMESTAMP_FORMAT),
            window.end.format("%H%M%S"),
            self.container_ext
        ))
    }

    async fn encode(&self, frames: Vec<LiveFrame>, output: &Path) -> Result<u64, ExtractError> {
        let Some(props) = self.handle.properties() else {
            return Err(ExtractError::NotInBuffer { available: None });
        };
        let encoder = self.encoder.clone();
        let output = output.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let mut sink = encoder.open(&output, &props)?;
            for frame in &frames {
                sink.write(frame)?;
            }
            sink.finish()
        })
        .await
        .map_err(|e| ExtractError::Encoder(e.into()))?
        .map_err(ExtractError::Encoder)
    }
}

#[async_trait]
impl ClipBackend for RingBackend {
    async fn available_window(&self) -> Result<Option<TimeWindow>, ExtractError> {
        Ok(self.handle.ring().window())
    }

    /// Frames with `start <= timestamp <= end` are written in order. An end
    /// in the future is clamped to now.
    async fn extract(&self, window: TimeWindow, output: &Path) -> Result<ClipResult, ExtractError> {
        let now = self.clock.now();
        let mut end = window.end;
        if end > now {
            warn!(
                "Requested end {} is in the future, clamping to now ({})",
                end.format("%H:%M:%S%.3f"),
                now.format("%H:%M:%S%.3f")
            );
            end = now;
        }

        let ring = self.handle.ring();
        let available = ring.window();
        let Some(held) = available.filter(|held| window.start >= held.start) else {
            return Err(ExtractError::NotInBuffer { available });
        };
        let Some(props) = self.handle.properties() else {
            return Err(ExtractError::NotInBuffer { available });
        };
        if !ring.covers(&TimeWindow::between(window.start, end), props.frame_interval()) {
            return Err(ExtractError::PartialCoverage {
                available,
                gap: TimeWindow::between(held.end, end),
            });
        }

        let frames = ring.frames_between(window.start, end);
        if frames.is_empty() {
            return Err(ExtractError::NotInBuffer { available });
        }

        prepare_output(output).await?;
        let written = self.encode(frames, output).await?;
        let size = check_clip_size(output, self.min_clip_bytes).await?;
        let covered = TimeWindow::between(window.start, end);
        info!(
            "Recorded {} from memory to {:?} ({} frames, {} bytes)",
            covered, output, written, size
        );

        Ok(ClipResult {
            path: output.to_path_buf(),
            size,
            window: covered,
            source: ClipSource::Ring,
        })
    }
}
