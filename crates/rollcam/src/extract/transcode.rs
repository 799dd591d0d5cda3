//! Lossless concatenate-and-trim through an external transcoder

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::ExtractError;

/// Joins segment files and cuts the result to a window in a single pass.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Concatenate the files listed in `manifest` (ffmpeg concat format,
    /// paths relative to the manifest) without re-encoding, keep
    /// `[offset, offset + duration)` of the joined stream, and write it to
    /// `output`.
    async fn concat_trim(
        &self,
        manifest: &Path,
        offset: Duration,
        duration: Duration,
        output: &Path,
    ) -> Result<(), ExtractError>;
}

/// [`Transcoder`] backed by the ffmpeg concat demuxer and stream copy.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(
        &self,
        manifest: &Path,
        offset: Duration,
        duration: Duration,
        output: &Path,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0"])
            .arg("-i")
            .arg(manifest)
            .arg("-ss")
            .arg(format!("{:.3}", offset.as_secs_f64()))
            .arg("-t")
            .arg(format!("{:.3}", duration.as_secs_f64()))
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn concat_trim(
        &self,
        manifest: &Path,
        offset: Duration,
        duration: Duration,
        output: &Path,
    ) -> Result<(), ExtractError> {
        let child = self
            .command(manifest, offset, duration, output)
            .spawn()
            .map_err(|source| ExtractError::ToolUnavailable {
                tool: self.binary.display().to_string(),
                source,
            })?;

        debug!(
            "Transcoding {:?} -> {:?} (offset {:.3}s, {:.3}s)",
            manifest,
            output,
            offset.as_secs_f64(),
            duration.as_secs_f64()
        );

        // Dropping the future on timeout kills the child
        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExtractError::ToolTimeout {
                after: self.timeout,
            })?;
        let out = result?;

        if !out.status.success() {
            return Err(ExtractError::Tool {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_concats_then_trims_with_stream_copy() {
        let transcoder = FfmpegTranscoder::new("ffmpeg", Duration::from_secs(60));
        let cmd = transcoder.command(
            Path::new("/buf/segments_to_concat.txt"),
            Duration::from_millis(500),
            Duration::from_secs(10),
            Path::new("clip.mp4"),
        );
        let args = args(&cmd);

        assert!(args.windows(2).any(|w| w == ["-f", "concat"]));
        assert!(args.windows(2).any(|w| w == ["-safe", "0"]));
        assert!(args.windows(2).any(|w| w == ["-ss", "0.500"]));
        assert!(args.windows(2).any(|w| w == ["-t", "10.000"]));
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        // Trim options follow the input so seeking is on the joined stream
        let input = args.iter().position(|a| a == "-i").unwrap();
        let seek = args.iter().position(|a| a == "-ss").unwrap();
        assert!(seek > input);
        assert_eq!(args.last().map(String::as_str), Some("clip.mp4"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_binary_is_tool_unavailable() {
        let transcoder =
            FfmpegTranscoder::new("/nonexistent/ffmpeg-binary", Duration::from_secs(1));
        let err = transcoder
            .concat_trim(
                Path::new("m.txt"),
                Duration::ZERO,
                Duration::from_secs(1),
                Path::new("out.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::ToolUnavailable { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn failing_tool_reports_status() {
        let transcoder = FfmpegTranscoder::new("false", Duration::from_secs(5));
        let err = transcoder
            .concat_trim(
                Path::new("m.txt"),
                Duration::ZERO,
                Duration::from_secs(1),
                Path::new("out.mp4"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Tool { .. }));
    }
}
