//! Segment identity and filename encoding

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::Timestamp;

/// Filename prefix of every segment.
pub const SEGMENT_PREFIX: &str = "segment_";

/// Timestamp layout inside segment filenames.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One closed, immutable segment file covering `[start, start + duration)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Segment {
    /// Nominal start, whole seconds
    pub start: Timestamp,
    /// Location on disk
    pub path: PathBuf,
}

impl Segment {
    pub fn new(start: Timestamp, path: PathBuf) -> Self {
        Self { start, path }
    }

    /// Nominal end of the segment.
    pub fn end(&self, duration: TimeDelta) -> Timestamp {
        self.start + duration
    }
}

/// Drop sub-second precision; segment identity is whole seconds.
pub fn truncate_to_second(ts: Timestamp) -> Timestamp {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Filename for a segment starting at `start`.
pub fn file_name(start: Timestamp, ext: &str) -> String {
    format!("{}{}.{}", SEGMENT_PREFIX, start.format(TIMESTAMP_FORMAT), ext)
}

/// Hidden in-progress name for a segment, invisible to directory scans.
pub fn partial_file_name(start: Timestamp, ext: &str) -> String {
    format!(".{}", file_name(start, ext))
}

/// Recover the start timestamp from a segment filename.
///
/// Returns `None` for anything that is not exactly
/// `segment_<YYYYmmdd_HHMMSS>.<ext>`.
pub fn parse_file_name(name: &str, ext: &str) -> Option<Timestamp> {
    let stem = name.strip_prefix(SEGMENT_PREFIX)?;
    let stamp = stem.strip_suffix(ext)?.strip_suffix('.')?;
    // %Y would also accept extra digits; the layout is fixed width
    if stamp.len() != 15 {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Parse a path's filename as a segment.
pub fn from_path(path: &Path, ext: &str) -> Option<Segment> {
    let name = path.file_name()?.to_str()?;
    let start = parse_file_name(name, ext)?;
    Some(Segment::new(start, path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn file_name_round_trips() {
        let start = at(10, 2, 30);
        let name = file_name(start, "mp4");
        assert_eq!(name, "segment_20240501_100230.mp4");
        assert_eq!(parse_file_name(&name, "mp4"), Some(start));
    }

    #[test]
    fn partial_name_is_not_a_segment() {
        let name = partial_file_name(at(10, 0, 0), "mp4");
        assert!(name.starts_with('.'));
        assert_eq!(parse_file_name(&name, "mp4"), None);
    }

    #[test]
    fn malformed_names_rejected() {
        assert_eq!(parse_file_name("segment_20240501_100230.mkv", "mp4"), None);
        assert_eq!(parse_file_name("segment_2024050_100230.mp4", "mp4"), None);
        assert_eq!(parse_file_name("segment_20241301_100230.mp4", "mp4"), None);
        assert_eq!(parse_file_name("clip_20240501_100230.mp4", "mp4"), None);
        assert_eq!(parse_file_name("segment_20240501_100230mp4", "mp4"), None);
        assert_eq!(parse_file_name("segments_to_concat.txt", "mp4"), None);
    }

    #[test]
    fn truncation_drops_subseconds() {
        let ts = at(10, 0, 0) + TimeDelta::milliseconds(750);
        assert_eq!(truncate_to_second(ts), at(10, 0, 0));
    }

    #[test]
    fn segment_end_uses_duration() {
        let seg = Segment::new(at(10, 0, 0), PathBuf::from("x"));
        assert_eq!(seg.end(TimeDelta::seconds(2)), at(10, 0, 2));
    }
}
