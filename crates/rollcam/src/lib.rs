//! Rollcam - rolling, time-indexed video buffer
//!
//! Keeps the recent past of a live video stream retrievable as standalone
//! clips without storing the full history:
//!
//! - **Core types** (always available): LiveFrame, TimeWindow, Clock, configuration
//! - **`source`**: Frame sources (ffmpeg-decoded URLs, synthetic test source)
//! - **`storage`**: Fixed-duration segment files: writer, index, retention
//! - **`ring`** / **`buffer`**: In-memory ring of recent frames and the ingest handle
//! - **`extract`**: Clip extraction from disk segments or the in-memory ring
//!
//! Feature flags:
//!
//! - **`test-source`**: Synthetic video without hardware

// Core modules (always compiled)
mod clock;
mod config;
mod duration;
mod frame;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BufferConfig, SourceConfig};
pub use duration::{parse_duration, parse_timestamp};
pub use frame::{FrameRead, LiveFrame, PixelFormat, StreamProperties, Timestamp};
pub use window::TimeWindow;

pub mod buffer;
pub mod encode;
pub mod extract;
pub mod ring;
pub mod source;
pub mod storage;

pub use buffer::BufferHandle;
pub use encode::{Encoder, FfmpegEncoder, FrameSink};
pub use extract::{
    default_output_name, ClipBackend, ClipResult, ClipService, ClipSource, ExtractError,
    ExtractionRequest, FfmpegTranscoder, RingBackend, SegmentBackend, Transcoder,
};
pub use ring::LiveFrameRing;
pub use source::FrameSource;
pub use storage::{
    Coverage, EvictionPolicy, EvictionReport, ReadLeases, RetentionEvictor, Segment,
    SegmentIndex, SegmentWriter, WriterStats,
};
