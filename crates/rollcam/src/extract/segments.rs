//! Disk-backed clip extraction
//!
//! Locates the segments covering a window, proves there is no gap, and
//! hands an ordered manifest to the [`Transcoder`] to join and trim in one
//! pass. The trim offset is measured from the first covering segment's
//! nominal start, so frame-rate drift inside a segment can shift the cut
//! by up to one segment duration.

use async_trait::async_trait;
use chrono::TimeDelta;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    check_clip_size, prepare_output, ClipBackend, ClipResult, ClipSource, ExtractError,
    Transcoder,
};
use crate::storage::{Coverage, ReadLeases, Segment, SegmentIndex};
use crate::{Clock, TimeWindow, Timestamp};

/// Manifest file prefix inside the buffer directory.
const MANIFEST_PREFIX: &str = "segments_to_concat";

/// Called with the covering segments before they are leased.
#[cfg(test)]
type SelectHook = Arc<dyn Fn(&[Segment]) + Send + Sync>;

/// Serves clips from closed segment files.
#[derive(Clone)]
pub struct SegmentBackend {
    index: SegmentIndex,
    transcoder: Arc<dyn Transcoder>,
    clock: Arc<dyn Clock>,
    leases: ReadLeases,
    min_clip_bytes: u64,
    #[cfg(test)]
    on_select: Option<SelectHook>,
}

impl SegmentBackend {
    pub fn new(
        index: SegmentIndex,
        transcoder: Arc<dyn Transcoder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            index,
            transcoder,
            clock,
            leases: ReadLeases::new(),
            min_clip_bytes: 1024,
            #[cfg(test)]
            on_select: None,
        }
    }

    /// Share a lease registry with the evictor.
    pub fn with_leases(mut self, leases: ReadLeases) -> Self {
        self.leases = leases;
        self
    }

    /// Clips smaller than `bytes` are reported as failed.
    pub fn with_min_clip_bytes(mut self, bytes: u64) -> Self {
        self.min_clip_bytes = bytes;
        self
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Current segments, scanned off the async runtime.
    pub async fn list(&self) -> Result<Vec<Segment>, ExtractError> {
        let index = self.index.clone();
        tokio::task::spawn_blocking(move || index.list())
            .await
            .map_err(|e| ExtractError::Storage(e.into()))?
            .map_err(ExtractError::Storage)
    }

    /// Wait until a segment ending at or after `end` is on disk.
    pub async fn wait_for(
        &self,
        end: Timestamp,
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), ExtractError> {
        let reached = self
            .index
            .wait_for_end(self.clock.as_ref(), end, timeout, poll)
            .await
            .map_err(ExtractError::Storage)?;
        if reached {
            return Ok(());
        }

        let latest_end = self
            .list()
            .await?
            .last()
            .map(|s| s.end(self.index.segment_duration()));
        Err(ExtractError::WaitTimeout {
            needed_end: end,
            latest_end,
        })
    }

    /// Covering segments for `window`, or the coverage failure.
    fn select(
        &self,
        segments: &[Segment],
        window: &TimeWindow,
    ) -> Result<Vec<Segment>, ExtractError> {
        let available = self.index.available_window(segments);
        let covering = self.index.covering_segments(segments, window);

        match self.index.coverage(window, &covering) {
            Coverage::Full => Ok(covering),
            Coverage::Empty => Err(ExtractError::NotInBuffer { available }),
            Coverage::Partial { gap } => Err(ExtractError::PartialCoverage { available, gap }),
        }
    }

    async fn assemble(
        &self,
        window: &TimeWindow,
        covering: &[Segment],
        output: &Path,
    ) -> Result<ClipResult, ExtractError> {
        let Some(first) = covering.first() else {
            return Err(ExtractError::NotInBuffer { available: None });
        };

        // Removed on drop, whatever the transcoder does
        let mut manifest = tempfile::Builder::new()
            .prefix(MANIFEST_PREFIX)
            .suffix(".txt")
            .tempfile_in(self.index.dir())?;
        manifest.write_all(manifest_text(covering).as_bytes())?;
        manifest.flush()?;

        let offset = (window.start - first.start).max(TimeDelta::zero());
        let duration = window.duration();

        prepare_output(output).await?;
        self.transcoder
            .concat_trim(manifest.path(), to_std(offset), to_std(duration), output)
            .await?;
        drop(manifest);

        let size = check_clip_size(output, self.min_clip_bytes).await?;
        info!(
            "Extracted {} from {} segments to {:?} ({} bytes)",
            window,
            covering.len(),
            output,
            size
        );

        Ok(ClipResult {
            path: output.to_path_buf(),
            size,
            window: *window,
            source: ClipSource::Segments,
        })
    }
}

#[async_trait]
impl ClipBackend for SegmentBackend {
    async fn available_window(&self) -> Result<Option<TimeWindow>, ExtractError> {
        let segments = self.list().await?;
        Ok(self.index.available_window(&segments))
    }

    /// A segment evicted between listing and reading triggers one re-list
    /// and coverage re-check before the extraction fails.
    async fn extract(&self, window: TimeWindow, output: &Path) -> Result<ClipResult, ExtractError> {
        let mut retried = false;

        loop {
            let segments = self.list().await?;
            let covering = self.select(&segments, &window)?;
            #[cfg(test)]
            if let Some(hook) = &self.on_select {
                hook(&covering);
            }

            let lease = self
                .leases
                .acquire(covering.iter().map(|s| s.path.clone()));

            match covering.iter().find(|s| !s.path.exists()) {
                None => {
                    let result = self.assemble(&window, &covering, output).await;
                    drop(lease);
                    return result;
                }
                Some(missing) if !retried => {
                    debug!("Segment {:?} vanished, re-listing", missing.path);
                    retried = true;
                }
                Some(missing) => {
                    return Err(ExtractError::PartialCoverage {
                        available: self.index.available_window(&segments),
                        gap: TimeWindow::new(missing.start, self.index.segment_duration()),
                    });
                }
            }
        }
    }
}

/// Concat manifest listing `segments` in order, by file name.
fn manifest_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|s| s.path.file_name())
        .map(|name| {
            let name = name.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", name)
        })
        .collect()
}

fn to_std(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or_default()
}
