//! Segment storage for the rolling buffer
//!
//! The stream is cut into fixed-duration segment files in one flat
//! directory. The directory itself is the catalog: a file belongs to the
//! buffer iff its name parses as `segment_<YYYYmmdd_HHMMSS>.<ext>`.
//!
//! - [`SegmentWriter`]: cuts the live stream into segments at a fixed cadence
//! - [`SegmentIndex`]: scans the directory and answers coverage queries
//! - [`RetentionEvictor`]: deletes segments past the retention horizon
//! - [`ReadLeases`]: keeps segments in use by an extraction from being evicted

pub mod index;
pub mod leases;
pub mod retention;
pub mod segment;
pub mod writer;

pub use index::{Coverage, SegmentIndex};
pub use leases::{LeaseGuard, ReadLeases};
pub use retention::{EvictionPolicy, EvictionReport, RetentionEvictor};
pub use segment::Segment;
pub use writer::{SegmentWriter, WriterStats};
