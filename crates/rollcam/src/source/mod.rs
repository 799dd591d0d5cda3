//! Frame sources
//!
//! A frame source delivers decoded, timestamped frames on demand. The
//! buffer never interprets transport or authentication details; it only
//! opens the source, pulls frames and closes it.
//!
//! - [`FfmpegSource`]: any URL ffmpeg can open (RTSP cameras, files, devices)
//! - [`TestSource`]: synthetic frames without hardware (`test-source` feature)

pub mod ffmpeg;
#[cfg(feature = "test-source")]
pub mod test_source;

use anyhow::Result;
use std::sync::Arc;

use crate::{Clock, FrameRead, SourceConfig, StreamProperties};

pub use ffmpeg::FfmpegSource;
#[cfg(feature = "test-source")]
pub use test_source::{TestSource, TestSourceConfig};

/// Capability that produces frames for the ingest loop.
///
/// Reads may block; the ingest loop runs on a dedicated blocking thread.
pub trait FrameSource: Send {
    /// Open the stream and report its properties.
    fn open(&mut self) -> Result<StreamProperties>;

    /// Read the next frame.
    fn read_frame(&mut self) -> FrameRead;

    /// Release the stream. Safe to call more than once.
    fn close(&mut self);
}

/// Build the source selected by `config`.
pub fn from_config(config: &SourceConfig, clock: Arc<dyn Clock>) -> Result<Box<dyn FrameSource>> {
    #[cfg(feature = "test-source")]
    if config.is_test_source() {
        let test_config = TestSourceConfig {
            width: if config.width > 0 { config.width } else { 320 },
            height: if config.height > 0 { config.height } else { 240 },
            fps: if config.fps > 0 { config.fps } else { 15 },
            ..Default::default()
        };
        return Ok(Box::new(TestSource::new(test_config, clock)));
    }

    #[cfg(not(feature = "test-source"))]
    if config.is_test_source() {
        anyhow::bail!("test:// source requires the `test-source` feature");
    }

    Ok(Box::new(FfmpegSource::new(config.clone(), clock)))
}
