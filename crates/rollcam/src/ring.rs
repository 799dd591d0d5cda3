//! In-memory ring of the most recent frames
//!
//! Capacity is a frame count, not a duration. The time span the ring holds
//! is `capacity / delivered frame rate`, so it shrinks when the source
//! degrades below its nominal rate. Callers asking "is this window still in
//! memory" must check [`LiveFrameRing::window`] rather than assume a fixed
//! horizon.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::{LiveFrame, TimeWindow, Timestamp};

/// Fixed-capacity ring of timestamped frames. Oldest frames are dropped on
/// overflow.
#[derive(Debug)]
pub struct LiveFrameRing {
    capacity: usize,
    frames: Mutex<VecDeque<LiveFrame>>,
}

impl LiveFrameRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a frame, evicting the oldest when full.
    pub fn push(&self, frame: LiveFrame) {
        let mut frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Newest frame, if any.
    pub fn latest(&self) -> Option<LiveFrame> {
        let frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames.back().cloned()
    }

    /// Timestamps of the oldest and newest held frames.
    pub fn window(&self) -> Option<TimeWindow> {
        let frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        let first = frames.front()?;
        let last = frames.back()?;
        Some(TimeWindow::between(first.timestamp, last.timestamp))
    }

    /// Whether `window` lies inside the ring, allowing the newest frame to
    /// stand for one `frame_interval` past its timestamp.
    pub fn covers(&self, window: &TimeWindow, frame_interval: Duration) -> bool {
        let Some(held) = self.window() else {
            return false;
        };
        let slack = chrono::TimeDelta::from_std(frame_interval).unwrap_or_default();
        held.start <= window.start && window.end <= held.end + slack
    }

    /// Copies of every frame with `start <= timestamp <= end`, oldest first.
    ///
    /// The lock is held only while cloning; image buffers are shared
    /// immutable bytes, so the copy is cheap and never aliases a buffer the
    /// producer will write to.
    pub fn frames_between(&self, start: Timestamp, end: Timestamp) -> Vec<LiveFrame> {
        let frames = self.frames.lock().unwrap_or_else(|e| e.into_inner());
        frames
            .iter()
            .filter(|f| f.timestamp >= start && f.timestamp <= end)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{NaiveDate, TimeDelta};

    fn at_ms(ms: i64) -> Timestamp {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + TimeDelta::milliseconds(ms)
    }

    fn frame(ms: i64) -> LiveFrame {
        LiveFrame::new(at_ms(ms), Bytes::from(vec![(ms / 100) as u8; 4]))
    }

    #[test]
    fn overflow_drops_oldest() {
        let ring = LiveFrameRing::new(3);
        for i in 0..5 {
            ring.push(frame(i * 100));
        }
        assert_eq!(ring.len(), 3);
        let window = ring.window().unwrap();
        assert_eq!(window.start, at_ms(200));
        assert_eq!(window.end, at_ms(400));
        assert_eq!(ring.latest().unwrap().timestamp, at_ms(400));
    }

    #[test]
    fn zero_capacity_holds_one_frame() {
        let ring = LiveFrameRing::new(0);
        ring.push(frame(0));
        ring.push(frame(100));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn frames_between_is_inclusive() {
        let ring = LiveFrameRing::new(100);
        for i in 0..20 {
            ring.push(frame(i * 100));
        }
        let frames = ring.frames_between(at_ms(500), at_ms(1000));
        assert_eq!(frames.len(), 6);
        assert_eq!(frames.first().unwrap().timestamp, at_ms(500));
        assert_eq!(frames.last().unwrap().timestamp, at_ms(1000));
    }

    #[test]
    fn copies_survive_eviction() {
        let ring = LiveFrameRing::new(2);
        ring.push(frame(0));
        let copy = ring.frames_between(at_ms(0), at_ms(0));
        ring.push(frame(100));
        ring.push(frame(200));
        assert_eq!(copy.len(), 1);
        assert_eq!(copy[0], frame(0));
    }

    #[test]
    fn covers_allows_one_frame_of_slack() {
        let ring = LiveFrameRing::new(100);
        for i in 0..10 {
            ring.push(frame(i * 100));
        }
        let interval = Duration::from_millis(100);
        assert!(ring.covers(&TimeWindow::between(at_ms(0), at_ms(1000)), interval));
        assert!(!ring.covers(&TimeWindow::between(at_ms(0), at_ms(1200)), interval));
        assert!(!ring.covers(&TimeWindow::between(at_ms(-100), at_ms(500)), interval));
    }

    #[test]
    fn empty_ring_covers_nothing() {
        let ring = LiveFrameRing::new(10);
        assert!(ring.window().is_none());
        assert!(!ring.covers(
            &TimeWindow::between(at_ms(0), at_ms(0)),
            Duration::from_millis(100)
        ));
    }
}
