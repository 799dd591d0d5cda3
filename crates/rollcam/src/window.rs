//! Closed-open time windows

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A closed-open interval `[start, end)` of wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeWindow {
    /// Window beginning at `start` and lasting `duration`.
    pub fn new(start: Timestamp, duration: TimeDelta) -> Self {
        Self {
            start,
            end: start + duration,
        }
    }

    /// Window from explicit bounds.
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Window of `duration` with `center` at its midpoint.
    pub fn centered(center: Timestamp, duration: TimeDelta) -> Self {
        let start = center - duration / 2;
        Self::new(start, duration)
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Whether `ts` lies in `[start, end)`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Whether `other` lies entirely inside this window.
    pub fn contains_window(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether `[start, end)` intersects this window.
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        end > self.start && start < self.end
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%Y-%m-%dT%H:%M:%S"),
            self.end.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}
