//! Shared handle to the live side of the buffer
//!
//! One [`BufferHandle`] is created per stream and passed by reference to
//! the ingest loop and to whoever reads recent frames. It owns the frame
//! ring, the latest-frame slot and the running flag.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::source::FrameSource;
use crate::{FrameRead, LiveFrame, LiveFrameRing, StreamProperties};

/// Pause after a failed read before trying again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Live state shared between the ingest loop and readers.
#[derive(Debug)]
pub struct BufferHandle {
    ring: LiveFrameRing,
    latest: Mutex<Option<LiveFrame>>,
    properties: Mutex<Option<StreamProperties>>,
    running: AtomicBool,
}

impl BufferHandle {
    /// Create a running handle with a ring of `ring_capacity` frames.
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring: LiveFrameRing::new(ring_capacity),
            latest: Mutex::new(None),
            properties: Mutex::new(None),
            running: AtomicBool::new(true),
        }
    }

    /// Record a freshly read frame.
    pub fn publish(&self, frame: LiveFrame) {
        self.ring.push(frame.clone());
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
    }

    /// Copy of the most recent frame.
    pub fn latest_frame(&self) -> Option<LiveFrame> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn ring(&self) -> &LiveFrameRing {
        &self.ring
    }

    /// Properties of the open stream, once known.
    pub fn properties(&self) -> Option<StreamProperties> {
        *self.properties.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_properties(&self, props: StreamProperties) {
        *self.properties.lock().unwrap_or_else(|e| e.into_inner()) = Some(props);
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Ask the ingest loop to finish after the current read.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Feed the ring from `source` without writing segments.
    ///
    /// Blocks until the source ends or [`Self::stop`] is called. Returns the
    /// number of frames published.
    pub fn ingest(&self, source: &mut dyn FrameSource) -> Result<u64> {
        let props = source
            .open()
            .context("Failed to open frame source")?
            .with_fallback_fps();
        self.set_properties(props);
        info!(
            "Ingest started: {}x{} @ {}fps, ring of {} frames",
            props.width,
            props.height,
            props.fps,
            self.ring.capacity()
        );

        let mut frames = 0u64;
        while self.is_running() {
            match source.read_frame() {
                FrameRead::Frame(frame) => {
                    self.publish(frame);
                    frames += 1;
                }
                FrameRead::Missed => {
                    debug!("Frame read failed, retrying");
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                FrameRead::Ended => {
                    info!("Source ended");
                    break;
                }
            }
        }

        source.close();
        Ok(frames)
    }
}
