//! ffmpeg-backed frame source
//!
//! Spawns ffmpeg to decode any input it understands (RTSP cameras, files,
//! V4L2 devices) into raw BGR24 frames on stdout, one fixed-size frame at
//! a time.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::FrameSource;
use crate::{Clock, FrameRead, LiveFrame, SourceConfig, StreamProperties};

/// Frame source reading raw frames from an ffmpeg subprocess.
pub struct FfmpegSource {
    config: SourceConfig,
    clock: Arc<dyn Clock>,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    properties: Option<StreamProperties>,
}

impl FfmpegSource {
    pub fn new(config: SourceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            config,
            clock,
            child: None,
            stdout: None,
            properties: None,
        }
    }

    /// Ask ffprobe for the stream's native size and frame rate.
    fn probe(&self) -> Result<StreamProperties> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,r_frame_rate",
                "-of",
                "csv=p=0",
            ])
            .arg(&self.config.uri)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to spawn {:?}. Is it installed?", self.ffprobe))?;

        if !output.status.success() {
            bail!(
                "ffprobe failed for {}: {}",
                self.config.uri,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Resolve the output properties, probing only what was not configured.
    fn resolve_properties(&self) -> Result<StreamProperties> {
        let configured =
            StreamProperties::new(self.config.width, self.config.height, self.config.fps);
        if configured.width > 0 && configured.height > 0 && configured.fps > 0 {
            return Ok(configured);
        }

        let probed = match self.probe() {
            Ok(p) => p,
            Err(e) if configured.width > 0 && configured.height > 0 => {
                warn!("Probe failed ({:#}), using configured size", e);
                StreamProperties::new(configured.width, configured.height, 0)
            }
            Err(e) => return Err(e),
        };

        Ok(StreamProperties::new(
            if configured.width > 0 { configured.width } else { probed.width },
            if configured.height > 0 { configured.height } else { probed.height },
            if configured.fps > 0 { configured.fps } else { probed.fps },
        )
        .with_fallback_fps())
    }

    fn build_command(&self, props: &StreamProperties) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if self.config.uri.starts_with("rtsp://") || self.config.uri.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }

        cmd.arg("-i")
            .arg(&self.config.uri)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", props.width, props.height))
            .arg("-r")
            .arg(props.fps.to_string())
            .arg("-pix_fmt")
            .arg(props.format.ffmpeg_name())
            .arg("-f")
            .arg("rawvideo")
            .arg("-");

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl FrameSource for FfmpegSource {
    fn open(&mut self) -> Result<StreamProperties> {
        self.close();

        let props = self.resolve_properties()?;
        if props.width == 0 || props.height == 0 {
            bail!("Source {} reported an empty frame size", self.config.uri);
        }

        info!(
            "Opening source {}: {}x{} @ {}fps",
            self.config.uri, props.width, props.height, props.fps
        );

        let mut child = self
            .build_command(&props)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}. Is it installed?", self.ffmpeg))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture ffmpeg stdout"))?;

        self.child = Some(child);
        self.stdout = Some(stdout);
        self.properties = Some(props);
        Ok(props)
    }

    fn read_frame(&mut self) -> FrameRead {
        let (Some(stdout), Some(props)) = (self.stdout.as_mut(), self.properties) else {
            return FrameRead::Ended;
        };

        let mut buf = vec![0u8; props.frame_bytes()];
        match stdout.read_exact(&mut buf) {
            Ok(()) => FrameRead::Frame(LiveFrame::new(self.clock.now(), Bytes::from(buf))),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("Source {} ended (EOF)", self.config.uri);
                FrameRead::Ended
            }
            Err(e) => {
                debug!("Frame read failed: {}", e);
                FrameRead::Missed
            }
        }
    }

    fn close(&mut self) {
        self.stdout.take();
        if let Some(mut child) = self.child.take() {
            info!("Stopping source {}", self.config.uri);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse `width,height,num/den` as printed by ffprobe's csv writer.
fn parse_probe_output(output: &str) -> Result<StreamProperties> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("ffprobe reported no video stream")?;

    let mut fields = line.split(',');
    let width: u32 = fields
        .next()
        .and_then(|s| s.trim().parse().ok())
        .context("Invalid width in probe output")?;
    let height: u32 = fields
        .next()
        .and_then(|s| s.trim().parse().ok())
        .context("Invalid height in probe output")?;

    let fps = fields.next().map(parse_frame_rate).unwrap_or(0);

    Ok(StreamProperties::new(width, height, fps))
}

/// Parse a rational frame rate (`30000/1001`) rounded to whole frames.
fn parse_frame_rate(s: &str) -> u32 {
    let s = s.trim();
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => s.parse().unwrap_or(0.0),
    };
    rate.round().max(0.0) as u32
}
