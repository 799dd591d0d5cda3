//! Segment writer: cut the live stream into fixed-duration files
//!
//! Slots are laid on a fixed grid anchored at the first whole second after
//! the stream opens, so segment N always starts `N * segment_duration`
//! after that anchor and cadence never drifts. A frame belongs to the slot
//! its timestamp falls in.
//!
//! Each segment is encoded under a hidden name and renamed into place on
//! close, so the index never sees a file that is still being written.

use anyhow::{Context, Result};
use chrono::TimeDelta;
use serde::Serialize;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::segment::{self, truncate_to_second};
use super::{RetentionEvictor, SegmentIndex};
use crate::encode::{Encoder, FrameSink};
use crate::source::FrameSource;
use crate::{BufferHandle, Clock, FrameRead, LiveFrame, StreamProperties, Timestamp};

/// Consecutive failed reads tolerated before the source is considered dead.
const DEFAULT_MISS_LIMIT: u32 = 300;

/// Pause after a failed read.
const DEFAULT_MISS_BACKOFF: Duration = Duration::from_millis(100);

/// Counters for one recording run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Segments committed to the directory, including empty ones
    pub segments: u64,
    /// Committed segments that received no frames
    pub empty_segments: u64,
    /// Segments abandoned because the encoder failed
    pub failed_segments: u64,
    /// Grid slots with no segment because the source stalled past them
    pub skipped_slots: u64,
    /// Frames read from the source
    pub frames_read: u64,
    /// Frames written into segments
    pub frames_written: u64,
    /// Failed reads
    pub missed_reads: u64,
    /// Frames dropped because their timestamp went back behind a closed slot
    pub regressed_frames: u64,
    /// Segments removed by the co-located evictor
    pub evicted: u64,
}

/// A segment being written.
struct OpenSegment {
    start: Timestamp,
    partial: PathBuf,
    sink: Option<Box<dyn FrameSink>>,
    frames: u64,
}

/// Writes the stream into the segment directory at a fixed cadence.
pub struct SegmentWriter {
    index: SegmentIndex,
    encoder: Arc<dyn Encoder>,
    clock: Arc<dyn Clock>,
    evictor: Option<RetentionEvictor>,
    miss_limit: u32,
    miss_backoff: Duration,
}

impl SegmentWriter {
    pub fn new(index: SegmentIndex, encoder: Arc<dyn Encoder>, clock: Arc<dyn Clock>) -> Self {
        Self {
            index,
            encoder,
            clock,
            evictor: None,
            miss_limit: DEFAULT_MISS_LIMIT,
            miss_backoff: DEFAULT_MISS_BACKOFF,
        }
    }

    /// Run `evictor` after every committed segment.
    pub fn with_evictor(mut self, evictor: RetentionEvictor) -> Self {
        self.evictor = Some(evictor);
        self
    }

    /// Stop after `limit` consecutive failed reads, pausing `backoff` after each.
    pub fn with_miss_policy(mut self, limit: u32, backoff: Duration) -> Self {
        self.miss_limit = limit.max(1);
        self.miss_backoff = backoff;
        self
    }

    pub fn index(&self) -> &SegmentIndex {
        &self.index
    }

    /// Record `source` into segments until it ends, stalls for good, or
    /// `handle` is stopped. Every frame read is also published to `handle`.
    ///
    /// Blocks the calling thread. Read failures and encoder failures are
    /// logged and counted; only failing to open the source or create the
    /// directory is an error.
    pub fn record(
        &self,
        source: &mut dyn FrameSource,
        handle: &BufferHandle,
    ) -> Result<WriterStats> {
        fs::create_dir_all(self.index.dir())
            .with_context(|| format!("Failed to create buffer directory {:?}", self.index.dir()))?;

        let props = source
            .open()
            .context("Failed to open frame source")?
            .with_fallback_fps();
        handle.set_properties(props);

        let seg_duration = self.index.segment_duration();
        let per_segment = props.frames_in(Duration::from_millis(
            seg_duration.num_milliseconds().max(0) as u64,
        ));
        let anchor = next_whole_second(self.clock.now());

        info!(
            "Recording {}x{} @ {}fps into {:?}: {}s segments, {} frames each, first at {}",
            props.width,
            props.height,
            props.fps,
            self.index.dir(),
            seg_duration.num_seconds(),
            per_segment,
            anchor.format("%H:%M:%S")
        );

        let mut stats = WriterStats::default();
        let mut current: Option<OpenSegment> = None;
        let mut last_slot: Option<Timestamp> = None;
        let mut misses = 0u32;
        let mut regressed = false;

        while handle.is_running() {
            match source.read_frame() {
                FrameRead::Frame(frame) => {
                    misses = 0;
                    stats.frames_read += 1;
                    handle.publish(frame.clone());

                    let slot = if frame.timestamp < anchor {
                        None
                    } else {
                        Some(self.slot_of(anchor, frame.timestamp))
                    };
                    if let Some(last) = last_slot.filter(|last| slot.map_or(true, |s| s < *last)) {
                        stats.regressed_frames += 1;
                        if !regressed {
                            warn!(
                                "Frame time {} went back behind segment {}, dropping frames until it catches up",
                                frame.timestamp.format("%H:%M:%S%.3f"),
                                last.format("%H:%M:%S")
                            );
                            regressed = true;
                        }
                        continue;
                    }
                    let Some(slot) = slot else {
                        continue;
                    };

                    if current.as_ref().is_some_and(|seg| seg.start != slot) {
                        if let Some(seg) = current.take() {
                            self.commit(seg, &mut stats);
                        }
                    }
                    // Slot already closed at its frame budget: the source is
                    // running ahead of its nominal rate
                    if current.is_none() {
                        if last_slot.is_some_and(|last| slot <= last) {
                            continue;
                        }
                        current = Some(self.begin(slot, last_slot, &props, &mut stats));
                        last_slot = Some(slot);
                        regressed = false;
                    }

                    if let Some(seg) = current.as_mut() {
                        self.write(seg, &frame, &mut stats);
                        if seg.frames >= per_segment {
                            if let Some(seg) = current.take() {
                                self.commit(seg, &mut stats);
                            }
                        }
                    }
                }
                FrameRead::Missed => {
                    misses += 1;
                    stats.missed_reads += 1;
                    if misses >= self.miss_limit {
                        warn!("Source failed {} reads in a row, stopping", misses);
                        break;
                    }

                    let now = self.clock.now();
                    if now >= anchor {
                        let slot = self.slot_of(anchor, now);
                        // A slot whose reads all fail still gets a (short or
                        // empty) segment
                        if current.as_ref().is_some_and(|seg| seg.start != slot) {
                            if let Some(seg) = current.take() {
                                self.commit(seg, &mut stats);
                            }
                        }
                        if current.is_none() && last_slot.map_or(true, |last| slot > last) {
                            current = Some(self.begin(slot, last_slot, &props, &mut stats));
                            last_slot = Some(slot);
                        }
                    }

                    if !self.miss_backoff.is_zero() {
                        std::thread::sleep(self.miss_backoff);
                    }
                }
                FrameRead::Ended => {
                    info!("Source ended");
                    break;
                }
            }
        }

        if let Some(seg) = current.take() {
            self.commit(seg, &mut stats);
        }
        source.close();

        info!(
            "Recording stopped: {} segments ({} empty, {} failed), {} frames written",
            stats.segments, stats.empty_segments, stats.failed_segments, stats.frames_written
        );
        Ok(stats)
    }

    /// Start of the grid slot containing `ts`.
    fn slot_of(&self, anchor: Timestamp, ts: Timestamp) -> Timestamp {
        let step = self.index.segment_duration().num_milliseconds().max(1);
        let elapsed = (ts - anchor).num_milliseconds();
        anchor + TimeDelta::milliseconds(elapsed.div_euclid(step) * step)
    }

    fn begin(
        &self,
        slot: Timestamp,
        last_slot: Option<Timestamp>,
        props: &StreamProperties,
        stats: &mut WriterStats,
    ) -> OpenSegment {
        if let Some(last) = last_slot {
            let step = self.index.segment_duration().num_milliseconds().max(1);
            let skipped = ((slot - last).num_milliseconds() / step - 1).max(0) as u64;
            if skipped > 0 {
                warn!(
                    "Source stalled, {} segment slot(s) skipped before {}",
                    skipped,
                    slot.format("%H:%M:%S")
                );
                stats.skipped_slots += skipped;
            }
        }

        let partial = self
            .index
            .dir()
            .join(segment::partial_file_name(slot, self.index.extension()));

        let sink = match self.encoder.open(&partial, props) {
            Ok(sink) => Some(sink),
            Err(e) => {
                warn!("Failed to open segment {:?}: {:#}", partial, e);
                None
            }
        };

        OpenSegment {
            start: slot,
            partial,
            sink,
            frames: 0,
        }
    }

    fn write(&self, seg: &mut OpenSegment, frame: &LiveFrame, stats: &mut WriterStats) {
        let Some(sink) = seg.sink.as_mut() else {
            return;
        };
        match sink.write(frame) {
            Ok(()) => {
                seg.frames += 1;
                stats.frames_written += 1;
            }
            Err(e) => {
                warn!("Dropping segment {:?}: {:#}", seg.partial, e);
                seg.sink = None;
            }
        }
    }

    /// Close `seg` and make it visible under its final name.
    fn commit(&self, seg: OpenSegment, stats: &mut WriterStats) {
        let final_path = self
            .index
            .dir()
            .join(segment::file_name(seg.start, self.index.extension()));

        let Some(sink) = seg.sink else {
            let _ = fs::remove_file(&seg.partial);
            stats.failed_segments += 1;
            return;
        };

        if seg.frames == 0 {
            drop(sink);
            let _ = fs::remove_file(&seg.partial);
            match File::create(&final_path) {
                Ok(_) => {
                    debug!("Committed empty segment {:?}", final_path);
                    stats.segments += 1;
                    stats.empty_segments += 1;
                }
                Err(e) => {
                    warn!("Failed to commit empty segment {:?}: {}", final_path, e);
                    stats.failed_segments += 1;
                }
            }
            self.run_evictor(stats);
            return;
        }

        if let Err(e) = sink.finish() {
            warn!("Segment {:?} failed to encode: {:#}", final_path, e);
            let _ = fs::remove_file(&seg.partial);
            stats.failed_segments += 1;
            return;
        }

        let committed = if seg.partial.exists() {
            fs::rename(&seg.partial, &final_path)
        } else {
            File::create(&final_path).map(|_| ())
        };
        match committed {
            Ok(()) => {
                debug!("Committed {:?} ({} frames)", final_path, seg.frames);
                stats.segments += 1;
            }
            Err(e) => {
                warn!("Failed to commit segment {:?}: {}", final_path, e);
                stats.failed_segments += 1;
            }
        }

        self.run_evictor(stats);
    }

    fn run_evictor(&self, stats: &mut WriterStats) {
        let Some(evictor) = &self.evictor else {
            return;
        };
        match evictor.evict() {
            Ok(report) => stats.evicted += report.removed as u64,
            Err(e) => warn!("Eviction pass failed: {:#}", e),
        }
    }
}

/// First whole second at or after `ts`.
fn next_whole_second(ts: Timestamp) -> Timestamp {
    let truncated = truncate_to_second(ts);
    if truncated == ts {
        ts
    } else {
        truncated + TimeDelta::seconds(1)
    }
}
