//! Synthetic frame source
//!
//! Generates paced BGR24 frames without a camera, for development and
//! tests. Can inject transient read failures and end after a fixed number
//! of frames.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::FrameSource;
use crate::{Clock, FrameRead, LiveFrame, StreamProperties};

/// Configuration for the synthetic source
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Report every Nth read as a transient failure (0 = never)
    pub fail_every: u32,
    /// End the stream after this many reads (None = endless)
    pub max_frames: Option<u64>,
    /// Sleep between frames to keep the nominal rate
    pub paced: bool,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 15,
            fail_every: 0,
            max_frames: None,
            paced: true,
        }
    }
}

/// Frame source producing a moving gradient at a fixed rate.
pub struct TestSource {
    config: TestSourceConfig,
    clock: Arc<dyn Clock>,
    started: Option<Instant>,
    reads: u64,
    frames: u64,
}

impl TestSource {
    pub fn new(config: TestSourceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            started: None,
            reads: 0,
            frames: 0,
        }
    }

    fn properties(&self) -> StreamProperties {
        StreamProperties::new(self.config.width, self.config.height, self.config.fps)
    }

    fn render(&self, props: &StreamProperties) -> Bytes {
        let shade = (self.frames & 0xFF) as u8;
        let mut data = Vec::with_capacity(props.frame_bytes());
        for y in 0..props.height {
            for x in 0..props.width {
                data.push(shade);
                data.push((x & 0xFF) as u8);
                data.push((y & 0xFF) as u8);
            }
        }
        Bytes::from(data)
    }

    fn pace(&self) {
        let Some(started) = self.started else {
            return;
        };
        if !self.config.paced {
            return;
        }
        let deadline = started + pace_offset(self.config.fps, self.reads);
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

impl FrameSource for TestSource {
    fn open(&mut self) -> Result<StreamProperties> {
        self.started = Some(Instant::now());
        self.reads = 0;
        self.frames = 0;
        let props = self.properties();
        info!(
            "Test source started: {}x{} @ {}fps",
            props.width, props.height, props.fps
        );
        Ok(props)
    }

    fn read_frame(&mut self) -> FrameRead {
        if self.started.is_none() {
            return FrameRead::Ended;
        }
        if let Some(max) = self.config.max_frames {
            if self.reads >= max {
                return FrameRead::Ended;
            }
        }

        self.pace();
        self.reads += 1;

        if self.config.fail_every > 0 && self.reads % self.config.fail_every as u64 == 0 {
            debug!("Test source: injected failure at read {}", self.reads);
            return FrameRead::Missed;
        }

        let props = self.properties();
        let image = self.render(&props);
        self.frames += 1;
        FrameRead::Frame(LiveFrame::new(self.clock.now(), image))
    }

    fn close(&mut self) {
        if self.started.take().is_some() {
            info!("Test source stopped after {} frames", self.frames);
        }
    }
}

/// Time since open at which read number `reads` is due.
fn pace_offset(fps: u32, reads: u64) -> Duration {
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    Duration::from_secs_f64(interval.as_secs_f64() * reads as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemClock;

    fn unpaced(config: TestSourceConfig) -> TestSource {
        TestSource::new(
            TestSourceConfig {
                paced: false,
                ..config
            },
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn produces_full_size_frames() {
        let mut source = unpaced(TestSourceConfig {
            width: 8,
            height: 4,
            ..Default::default()
        });
        let props = source.open().unwrap();
        match source.read_frame() {
            FrameRead::Frame(frame) => assert_eq!(frame.image.len(), props.frame_bytes()),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn injects_failures_and_ends() {
        let mut source = unpaced(TestSourceConfig {
            width: 2,
            height: 2,
            fail_every: 3,
            max_frames: Some(6),
            ..Default::default()
        });
        source.open().unwrap();

        let mut frames = 0;
        let mut missed = 0;
        loop {
            match source.read_frame() {
                FrameRead::Frame(_) => frames += 1,
                FrameRead::Missed => missed += 1,
                FrameRead::Ended => break,
            }
        }
        assert_eq!(frames, 4);
        assert_eq!(missed, 2);
    }

    #[test]
    fn pace_offset_scales_past_u32_reads() {
        assert_eq!(pace_offset(10, 25).as_millis(), 2500);
        // Zero fps paces as one frame a second
        assert_eq!(pace_offset(0, 3), Duration::from_secs(3));
        let long_run = pace_offset(10, u32::MAX as u64 + 10);
        assert!(long_run.as_secs() >= (u32::MAX as u64) / 10);
    }

    #[test]
    fn read_before_open_ends() {
        let mut source = unpaced(TestSourceConfig::default());
        assert!(matches!(source.read_frame(), FrameRead::Ended));
    }

    #[test]
    fn timestamps_never_decrease() {
        let mut source = unpaced(TestSourceConfig {
            width: 2,
            height: 2,
            max_frames: Some(20),
            ..Default::default()
        });
        source.open().unwrap();
        let mut last = None;
        while let FrameRead::Frame(frame) = source.read_frame() {
            if let Some(prev) = last {
                assert!(frame.timestamp >= prev);
            }
            last = Some(frame.timestamp);
        }
    }
}
