//! Retention: bound the segment directory to the configured horizon
//!
//! Two rules are available. Both keep one extra segment of slack so a
//! segment at the very edge of the horizon is never pulled out from under
//! an extraction that validated coverage a moment earlier.

use anyhow::{bail, Result};
use chrono::TimeDelta;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ReadLeases, Segment, SegmentIndex};
use crate::{Clock, Timestamp};

/// Rule deciding which segments fall outside retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Delete segments whose start is older than the horizon
    #[default]
    Age,
    /// Keep the newest segments up to the horizon's worth of duration
    Budget,
}

impl FromStr for EvictionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "age" => Ok(EvictionPolicy::Age),
            "budget" => Ok(EvictionPolicy::Budget),
            other => bail!("Unknown eviction policy '{}' (expected age or budget)", other),
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicy::Age => f.write_str("age"),
            EvictionPolicy::Budget => f.write_str("budget"),
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Segments deleted
    pub removed: usize,
    /// Bytes freed by the deletions
    pub bytes_freed: u64,
    /// Deletions that failed and were skipped
    pub failed: usize,
    /// Expired segments kept because an extraction holds a lease
    pub deferred: usize,
}

/// Deletes segments that have aged out of the buffer.
#[derive(Clone)]
pub struct RetentionEvictor {
    index: SegmentIndex,
    buffer_duration: TimeDelta,
    policy: EvictionPolicy,
    leases: ReadLeases,
    clock: Arc<dyn Clock>,
}

impl RetentionEvictor {
    pub fn new(
        index: SegmentIndex,
        buffer_duration: TimeDelta,
        policy: EvictionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            index,
            buffer_duration,
            policy,
            leases: ReadLeases::new(),
            clock,
        }
    }

    /// Share a lease registry with extraction.
    pub fn with_leases(mut self, leases: ReadLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn leases(&self) -> &ReadLeases {
        &self.leases
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Oldest start a segment may have and still be guaranteed to survive.
    pub fn horizon(&self) -> Timestamp {
        self.clock.now() - self.buffer_duration - self.index.segment_duration()
    }

    /// Segments the current policy would delete, oldest first.
    pub fn expired(&self, segments: &[Segment]) -> Vec<Segment> {
        let horizon = self.horizon();

        let mut expired: Vec<Segment> = match self.policy {
            EvictionPolicy::Age => segments
                .iter()
                .filter(|s| s.start < horizon)
                .cloned()
                .collect(),
            EvictionPolicy::Budget => {
                let budget = self.buffer_duration + self.index.segment_duration();
                let mut newest_first: Vec<&Segment> = segments.iter().collect();
                newest_first.sort_by(|a, b| b.start.cmp(&a.start));

                let mut accumulated = TimeDelta::zero();
                newest_first
                    .into_iter()
                    .filter(|s| {
                        accumulated += self.index.segment_duration();
                        // Never evict inside the slack-bounded horizon
                        accumulated > budget && s.start < horizon
                    })
                    .cloned()
                    .collect()
            }
        };

        expired.sort();
        expired
    }

    /// Run one eviction pass.
    ///
    /// Individual deletion failures are logged and counted, never returned;
    /// only a failure to scan the directory is an error.
    pub fn evict(&self) -> Result<EvictionReport> {
        let segments = self.index.list()?;
        let mut report = EvictionReport::default();

        for segment in self.expired(&segments) {
            let size = fs::metadata(&segment.path).map(|m| m.len()).unwrap_or(0);
            match self.leases.remove_unless_leased(&segment.path) {
                Ok(true) => {
                    report.removed += 1;
                    report.bytes_freed += size;
                }
                Ok(false) => {
                    debug!("Segment {:?} is being read, deferring eviction", segment.path);
                    report.deferred += 1;
                }
                // Already gone counts as done
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete segment {:?}: {}", segment.path, e);
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 {
            debug!(
                "Evicted {} segments ({} bytes)",
                report.removed, report.bytes_freed
            );
        }

        Ok(report)
    }
}
