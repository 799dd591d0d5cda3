//! Frame encoding into container files
//!
//! Segments and ring-backed clips are produced by streaming raw frames into
//! an encoder. [`FfmpegEncoder`] pipes them into an ffmpeg subprocess that
//! writes the container file.

use anyhow::{bail, Context, Result};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use tracing::debug;

use crate::{LiveFrame, StreamProperties};

/// An open output file accepting frames in timestamp order.
pub trait FrameSink: Send {
    /// Append one frame.
    fn write(&mut self, frame: &LiveFrame) -> Result<()>;

    /// Close the output and return the number of frames written.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Factory for [`FrameSink`]s.
pub trait Encoder: Send + Sync {
    /// Open a new output at `path` for frames with the given properties.
    fn open(&self, path: &Path, props: &StreamProperties) -> Result<Box<dyn FrameSink>>;
}

/// Encoder that pipes raw frames into ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
    codec: String,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            codec: "libx264".to_string(),
        }
    }

    /// Use a different video codec (default `libx264`).
    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    fn command(&self, path: &Path, props: &StreamProperties) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", props.format.ffmpeg_name()])
            .arg("-s")
            .arg(format!("{}x{}", props.width, props.height))
            .arg("-r")
            .arg(props.fps.max(1).to_string())
            .args(["-i", "pipe:0"])
            .args(["-c:v", &self.codec]);

        if self.codec == "libx264" {
            // Every segment must decode on its own
            cmd.args(["-preset", "veryfast", "-g"])
                .arg(props.fps.max(1).to_string())
                .args(["-pix_fmt", "yuv420p"]);
        }

        cmd.arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Encoder for FfmpegEncoder {
    fn open(&self, path: &Path, props: &StreamProperties) -> Result<Box<dyn FrameSink>> {
        let mut child = self
            .command(path, props)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}. Is it installed?", self.binary))?;

        let stdin = child.stdin.take().context("Failed to get ffmpeg stdin")?;

        // Drain stderr so a chatty encoder never blocks on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        debug!("Encoder opened {:?}", path);

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(BufWriter::new(stdin)),
            stderr_reader,
            frame_bytes: props.frame_bytes(),
            frames: 0,
            path: path.to_path_buf(),
        }))
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr_reader: Option<JoinHandle<String>>,
    frame_bytes: usize,
    frames: u64,
    path: PathBuf,
}

impl FrameSink for FfmpegSink {
    fn write(&mut self, frame: &LiveFrame) -> Result<()> {
        if frame.image.len() != self.frame_bytes {
            bail!(
                "Frame size mismatch: got {} bytes, expected {}",
                frame.image.len(),
                self.frame_bytes
            );
        }
        let stdin = self.stdin.as_mut().context("Encoder input already closed")?;
        stdin
            .write_all(&frame.image)
            .context("Failed to write frame to encoder")?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64> {
        if let Some(mut stdin) = self.stdin.take() {
            // A broken pipe here surfaces again as a failed exit status
            let _ = stdin.flush();
        }

        let status = self.child.wait().context("Failed to wait for encoder")?;
        let stderr = self
            .stderr_reader
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            bail!(
                "Encoder failed for {:?} ({}): {}",
                self.path,
                status,
                stderr.trim()
            );
        }

        Ok(self.frames)
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.stdin.take();
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
