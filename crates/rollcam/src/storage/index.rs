//! Directory-scan segment index
//!
//! There is no persistent catalog: every query rescans the flat segment
//! directory, so a restart loses nothing and a segment becomes visible the
//! moment its file is renamed into place.

use anyhow::{Context, Result};
use chrono::TimeDelta;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::segment::{self, Segment};
use crate::{Clock, TimeWindow, Timestamp};

/// Result of checking a window against its covering segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// Every instant of the window is inside some segment
    Full,
    /// No segment overlaps the window
    Empty,
    /// Segments overlap the window but leave the given hole uncovered
    Partial { gap: TimeWindow },
}

impl Coverage {
    pub fn is_full(&self) -> bool {
        matches!(self, Coverage::Full)
    }
}

/// Ordered catalog of the segments in one directory.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    dir: PathBuf,
    segment_duration: TimeDelta,
    extension: String,
}

impl SegmentIndex {
    pub fn new(dir: PathBuf, segment_duration: TimeDelta, extension: String) -> Self {
        Self {
            dir,
            segment_duration,
            extension,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_duration(&self) -> TimeDelta {
        self.segment_duration
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// All segments, ordered by start time ascending.
    ///
    /// Files whose names do not parse are skipped. A missing directory is an
    /// empty buffer.
    pub fn list(&self) -> Result<Vec<Segment>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to scan buffer directory {:?}", self.dir))
            }
        };

        let mut segments: Vec<Segment> = entries
            .flatten()
            .filter_map(|entry| segment::from_path(&entry.path(), &self.extension))
            .collect();

        segments.sort();
        Ok(segments)
    }

    /// Earliest start to latest end over `segments` (assumed sorted).
    pub fn available_window(&self, segments: &[Segment]) -> Option<TimeWindow> {
        let first = segments.first()?;
        let last = segments.last()?;
        Some(TimeWindow::between(
            first.start,
            last.end(self.segment_duration),
        ))
    }

    /// The ordered subset of `segments` overlapping `window`.
    pub fn covering_segments(&self, segments: &[Segment], window: &TimeWindow) -> Vec<Segment> {
        let mut covering: Vec<Segment> = segments
            .iter()
            .filter(|s| window.overlaps(s.start, s.end(self.segment_duration)))
            .cloned()
            .collect();
        covering.sort();
        covering
    }

    /// Check `covering` (as returned by [`Self::covering_segments`]) for
    /// gaps anywhere inside `window`.
    pub fn coverage(&self, window: &TimeWindow, covering: &[Segment]) -> Coverage {
        let (Some(first), Some(last)) = (covering.first(), covering.last()) else {
            return Coverage::Empty;
        };

        if first.start > window.start {
            return Coverage::Partial {
                gap: TimeWindow::between(window.start, first.start.min(window.end)),
            };
        }

        let mut covered_until = first.end(self.segment_duration);
        for seg in &covering[1..] {
            if seg.start > covered_until {
                return Coverage::Partial {
                    gap: TimeWindow::between(covered_until, seg.start),
                };
            }
            covered_until = covered_until.max(seg.end(self.segment_duration));
        }

        let last_end = last.end(self.segment_duration).max(covered_until);
        if last_end < window.end {
            return Coverage::Partial {
                gap: TimeWindow::between(last_end, window.end),
            };
        }

        Coverage::Full
    }

    /// Whether `covering` spans all of `window` without gaps.
    pub fn is_fully_covered(&self, window: &TimeWindow, covering: &[Segment]) -> bool {
        self.coverage(window, covering).is_full()
    }

    /// End of the newest segment on disk, if any.
    pub fn latest_end(&self) -> Result<Option<Timestamp>> {
        Ok(self
            .list()?
            .last()
            .map(|s| s.end(self.segment_duration)))
    }

    /// Poll until a closed segment reaches `end`, or `timeout` elapses.
    ///
    /// Returns `Ok(true)` once the newest segment ends at or after `end`,
    /// `Ok(false)` on timeout.
    pub async fn wait_for_end(
        &self,
        clock: &dyn Clock,
        end: Timestamp,
        timeout: Duration,
        poll: Duration,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let index = self.clone();
            let latest = tokio::task::spawn_blocking(move || index.latest_end())
                .await
                .context("Index scan task failed")??;

            if latest.is_some_and(|latest| latest >= end) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(
                    "Timed out waiting for segments up to {} (now {})",
                    end,
                    clock.now()
                );
                return Ok(false);
            }

            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs::File;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn touch(dir: &Path, start: Timestamp) {
        File::create(dir.join(segment::file_name(start, "mp4"))).unwrap();
    }

    fn index_for(dir: &Path) -> SegmentIndex {
        SegmentIndex::new(dir.to_path_buf(), TimeDelta::seconds(1), "mp4".to_string())
    }

    fn fill(dir: &Path, from: Timestamp, secs: i64) {
        for i in 0..secs {
            touch(dir, from + TimeDelta::seconds(i));
        }
    }

    // ========== Listing ==========

    #[test]
    fn list_is_sorted_and_skips_foreign_files() {
        let dir = tempdir().unwrap();
        touch(dir.path(), at(10, 0, 2));
        touch(dir.path(), at(10, 0, 0));
        touch(dir.path(), at(10, 0, 1));
        File::create(dir.path().join("segments_to_concat.txt")).unwrap();
        File::create(dir.path().join("segment_garbage.mp4")).unwrap();
        File::create(dir.path().join(segment::partial_file_name(at(10, 0, 3), "mp4"))).unwrap();

        let segments = index_for(dir.path()).list().unwrap();
        let starts: Vec<_> = segments.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(10, 0, 0), at(10, 0, 1), at(10, 0, 2)]);
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let index = index_for(&dir.path().join("nope"));
        assert!(index.list().unwrap().is_empty());
        assert_eq!(index.latest_end().unwrap(), None);
    }

    #[test]
    fn available_window_spans_first_to_last_end() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 300);
        let index = index_for(dir.path());
        let segments = index.list().unwrap();
        let window = index.available_window(&segments).unwrap();
        assert_eq!(window.start, at(10, 0, 0));
        assert_eq!(window.end, at(10, 5, 0));
    }

    // ========== Coverage ==========

    #[test]
    fn covering_segments_overlap_window() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 300);
        let index = index_for(dir.path());
        let segments = index.list().unwrap();

        let window = TimeWindow::new(at(10, 2, 0), TimeDelta::seconds(10));
        let covering = index.covering_segments(&segments, &window);
        assert_eq!(covering.len(), 10);
        assert_eq!(covering[0].start, at(10, 2, 0));
        assert_eq!(covering[9].start, at(10, 2, 9));
        assert!(index.is_fully_covered(&window, &covering));
    }

    #[test]
    fn subsecond_window_start_pulls_in_containing_segment() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 20);
        let index = index_for(dir.path());
        let segments = index.list().unwrap();

        let window = TimeWindow::new(
            at(10, 0, 5) + TimeDelta::milliseconds(500),
            TimeDelta::seconds(2),
        );
        let covering = index.covering_segments(&segments, &window);
        let starts: Vec<_> = covering.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(10, 0, 5), at(10, 0, 6), at(10, 0, 7)]);
        assert!(index.is_fully_covered(&window, &covering));
    }

    #[test]
    fn internal_gap_detected() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 150);
        fill(dir.path(), at(10, 2, 35), 145);
        let index = index_for(dir.path());
        let segments = index.list().unwrap();

        // Entirely before the gap
        let window = TimeWindow::new(at(10, 2, 0), TimeDelta::seconds(10));
        let covering = index.covering_segments(&segments, &window);
        assert!(index.is_fully_covered(&window, &covering));

        // Crosses it
        let window = TimeWindow::new(at(10, 2, 28), TimeDelta::seconds(10));
        let covering = index.covering_segments(&segments, &window);
        assert!(!index.is_fully_covered(&window, &covering));

        let window = TimeWindow::new(at(10, 2, 25), TimeDelta::seconds(20));
        let covering = index.covering_segments(&segments, &window);
        assert_eq!(
            index.coverage(&window, &covering),
            Coverage::Partial {
                gap: TimeWindow::between(at(10, 2, 30), at(10, 2, 35))
            }
        );
    }

    #[test]
    fn single_missing_segment_detected() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 20);
        let index = index_for(dir.path());
        let window = TimeWindow::new(at(10, 0, 5), TimeDelta::seconds(10));

        let covering = index.covering_segments(&index.list().unwrap(), &window);
        assert!(index.is_fully_covered(&window, &covering));

        std::fs::remove_file(dir.path().join(segment::file_name(at(10, 0, 9), "mp4"))).unwrap();
        let covering = index.covering_segments(&index.list().unwrap(), &window);
        assert!(!index.is_fully_covered(&window, &covering));
    }

    #[test]
    fn window_before_data_is_partial_at_start() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 10);
        let index = index_for(dir.path());
        let window = TimeWindow::new(at(9, 59, 55), TimeDelta::seconds(10));
        let covering = index.covering_segments(&index.list().unwrap(), &window);
        assert_eq!(
            index.coverage(&window, &covering),
            Coverage::Partial {
                gap: TimeWindow::between(at(9, 59, 55), at(10, 0, 0))
            }
        );
    }

    #[test]
    fn window_past_data_is_partial_at_end() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 10);
        let index = index_for(dir.path());
        let window = TimeWindow::new(at(10, 0, 5), TimeDelta::seconds(10));
        let covering = index.covering_segments(&index.list().unwrap(), &window);
        assert_eq!(
            index.coverage(&window, &covering),
            Coverage::Partial {
                gap: TimeWindow::between(at(10, 0, 10), at(10, 0, 15))
            }
        );
    }

    #[test]
    fn no_overlap_is_empty() {
        let dir = tempdir().unwrap();
        fill(dir.path(), at(10, 0, 0), 10);
        let index = index_for(dir.path());
        let window = TimeWindow::new(at(11, 0, 0), TimeDelta::seconds(10));
        let covering = index.covering_segments(&index.list().unwrap(), &window);
        assert!(covering.is_empty());
        assert_eq!(index.coverage(&window, &covering), Coverage::Empty);
    }

    // ========== Waiting for future segments ==========

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_returns_once_segment_appears() {
        let dir = tempdir().unwrap();
        let clock = crate::SystemClock;
        let now = segment::truncate_to_second(clock.now());
        fill(dir.path(), now - TimeDelta::seconds(5), 5);
        let index = index_for(dir.path());

        let end = now + TimeDelta::seconds(2);
        let writer_dir = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            fill(&writer_dir, now, 2);
        });

        let ok = index
            .wait_for_end(&clock, end, Duration::from_secs(5), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wait_times_out() {
        let dir = tempdir().unwrap();
        let clock = crate::SystemClock;
        let now = segment::truncate_to_second(clock.now());
        fill(dir.path(), now - TimeDelta::seconds(5), 5);
        let index = index_for(dir.path());

        let ok = index
            .wait_for_end(
                &clock,
                now + TimeDelta::seconds(30),
                Duration::from_millis(200),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert!(!ok);
    }
}
