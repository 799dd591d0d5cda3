//! Rollcam CLI
//!
//! Records a live stream into a rolling segment buffer and extracts clips
//! from it.
//!
//! ## Usage
//!
//! ```bash
//! # Record the synthetic test source into ./rolling_buffer
//! rollcam record
//!
//! # Record an RTSP camera, keeping 10 minutes
//! ROLLCAM_SOURCE=rtsp://camera/stream rollcam record --buffer 10m
//!
//! # Extract 10 seconds starting at a wall-clock time
//! rollcam extract 2024-05-01T10:02:00 10s clip.mp4
//!
//! # Extract 10 seconds centered on a time
//! rollcam extract 2024-05-01T10:02:05 10s --center
//!
//! # Show what the buffer holds
//! rollcam status --json
//!
//! # With verbose logging
//! RUST_LOG=rollcam=debug rollcam record
//! ```
//!
//! While recording, `clip <start> [duration] [output]` lines on stdin
//! extract clips without interrupting capture.
//!
//! Exit codes: 0 success, 1 invalid input, 2 duration exceeds retention,
//! 3 window not in the buffer, 4 extracted clip failed the size check,
//! 5 tool or I/O failure.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use rollcam::{
    default_output_name, parse_duration, parse_timestamp, BufferConfig, BufferHandle, Clock,
    ClipService, Encoder, EvictionPolicy, ExtractionRequest, FfmpegEncoder, FfmpegTranscoder,
    ReadLeases, RetentionEvictor, RingBackend, SegmentBackend, SegmentIndex, SegmentWriter,
    SourceConfig, StreamProperties, SystemClock, TimeWindow,
};

/// Clip length when none is given.
const DEFAULT_CLIP_SECS: u64 = 10;

#[derive(Parser)]
#[command(name = "rollcam")]
#[command(version)]
#[command(about = "Rolling, time-indexed video buffer")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    buffer: BufferArgs,
}

/// Overrides for the buffer configuration
#[derive(Args)]
struct BufferArgs {
    /// Segment directory
    #[arg(long, global = true, env = "ROLLCAM_BUFFER_DIR")]
    buffer_dir: Option<PathBuf>,

    /// Retention horizon (e.g. 600, 10m)
    #[arg(long, global = true, value_parser = parse_duration)]
    buffer: Option<u64>,

    /// Segment duration in whole seconds
    #[arg(long, global = true, env = "ROLLCAM_SEGMENT_SECS")]
    segment_secs: Option<u64>,

    /// Transcoder binary
    #[arg(long, global = true, env = "ROLLCAM_FFMPEG")]
    ffmpeg: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Capture a stream into the rolling buffer
    Record {
        /// Input URL (test:// for the synthetic source)
        #[arg(long, env = "ROLLCAM_SOURCE")]
        source: Option<String>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        #[arg(long)]
        fps: Option<u32>,

        /// Retention rule: age or budget
        #[arg(long, env = "ROLLCAM_EVICTION")]
        eviction: Option<String>,
    },

    /// Extract a clip from the buffer
    Extract {
        /// Start time (2024-05-01T10:02:00, "2024-05-01 10:02:00" or 20240501_100200)
        start: String,

        /// Clip length (e.g. 10, 10s, 1m)
        duration: Option<String>,

        /// Output file (default clip_<start>_<duration>s.mp4)
        output: Option<PathBuf>,

        /// Treat START as the middle of the clip
        #[arg(long)]
        center: bool,
    },

    /// Show the buffered window and segment count
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rollcam=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match buffer_config(&cli.buffer) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Command::Record {
            source,
            width,
            height,
            fps,
            eviction,
        } => {
            let mut source_config = SourceConfig::from_env();
            source_config.ffmpeg = config.ffmpeg.clone();
            if let Some(uri) = source {
                source_config.uri = uri;
            }
            source_config.width = width.unwrap_or(source_config.width);
            source_config.height = height.unwrap_or(source_config.height);
            source_config.fps = fps.unwrap_or(source_config.fps);

            let mut config = config;
            if let Some(policy) = eviction {
                match policy.parse::<EvictionPolicy>() {
                    Ok(policy) => config.eviction = policy,
                    Err(e) => {
                        eprintln!("Error: {:#}", e);
                        return ExitCode::from(1);
                    }
                }
            }
            run_record(config, source_config)
                .await
                .map(|()| ExitCode::SUCCESS)
        }
        Command::Extract {
            start,
            duration,
            output,
            center,
        } => run_extract(&config, &start, duration.as_deref(), output, center).await,
        Command::Status { json } => run_status(&config, json).map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(5)
        }
    }
}

/// Environment configuration with command-line overrides applied.
fn buffer_config(args: &BufferArgs) -> Result<BufferConfig> {
    let mut config = BufferConfig::from_env();
    if let Some(dir) = &args.buffer_dir {
        config.buffer_dir = dir.clone();
    }
    if let Some(secs) = args.buffer {
        config.buffer_secs = secs;
    }
    if let Some(secs) = args.segment_secs {
        config.segment_secs = secs;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.ffmpeg = ffmpeg.clone();
    }
    config.validate()?;
    Ok(config)
}

fn segment_backend(
    config: &BufferConfig,
    clock: Arc<dyn Clock>,
    leases: ReadLeases,
) -> SegmentBackend {
    let transcoder = FfmpegTranscoder::new(config.ffmpeg.clone(), config.extract_timeout());
    SegmentBackend::new(config.index(), Arc::new(transcoder), clock)
        .with_leases(leases)
        .with_min_clip_bytes(config.min_clip_bytes)
}

// ========== extract ==========

async fn run_extract(
    config: &BufferConfig,
    start: &str,
    duration: Option<&str>,
    output: Option<PathBuf>,
    center: bool,
) -> Result<ExitCode> {
    let request = match parse_request(start, duration, center) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(ExitCode::from(1));
        }
    };
    let output = output.unwrap_or_else(|| default_output_name(&request, &config.container_ext));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = ClipService::new(config.buffer_duration(), clock.clone())
        .with_segments(segment_backend(config, clock, ReadLeases::new()))
        .with_wait_timeout(config.wait_timeout());

    match service.extract(&request, &output).await {
        Ok(clip) => {
            println!("Clip extracted to {}", clip.path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_coverage() {
                print_buffer_contents(&config.index());
            }
            Ok(ExitCode::from(e.exit_code() as u8))
        }
    }
}

fn parse_request(start: &str, duration: Option<&str>, center: bool) -> Result<ExtractionRequest> {
    let start = parse_timestamp(start)?;
    let secs = match duration {
        Some(d) => parse_duration(d)?,
        None => DEFAULT_CLIP_SECS,
    };
    if secs == 0 {
        bail!("Duration must be at least 1 second");
    }
    let duration = TimeDelta::seconds(secs as i64);
    Ok(if center {
        ExtractionRequest::centered(start, duration)
    } else {
        ExtractionRequest::new(start, duration)
    })
}

/// Print the available window and every segment start, to help pick a
/// window that is actually buffered.
fn print_buffer_contents(index: &SegmentIndex) {
    let segments = match index.list() {
        Ok(segments) => segments,
        Err(e) => {
            eprintln!("Could not list buffer: {:#}", e);
            return;
        }
    };

    match index.available_window(&segments) {
        Some(window) => eprintln!("Available buffer window: {}", window),
        None => {
            eprintln!("Buffer is empty ({})", index.dir().display());
            return;
        }
    }
    eprintln!("Available segments:");
    for segment in &segments {
        eprintln!("  {}", segment.start.format("%Y-%m-%d %H:%M:%S"));
    }
}

// ========== status ==========

#[derive(Serialize)]
struct StatusReport {
    buffer_dir: PathBuf,
    buffer_secs: u64,
    segment_secs: u64,
    segments: usize,
    bytes: u64,
    window: Option<TimeWindow>,
}

fn run_status(config: &BufferConfig, json: bool) -> Result<()> {
    let index = config.index();
    let segments = index.list()?;
    let bytes = segments
        .iter()
        .filter_map(|s| std::fs::metadata(&s.path).ok())
        .map(|m| m.len())
        .sum();

    let report = StatusReport {
        buffer_dir: config.buffer_dir.clone(),
        buffer_secs: config.buffer_secs,
        segment_secs: config.segment_secs,
        segments: segments.len(),
        bytes,
        window: index.available_window(&segments),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Buffer:   {}", report.buffer_dir.display());
    println!(
        "Holds:    {} segments, {} MB",
        report.segments,
        report.bytes / (1024 * 1024)
    );
    match report.window {
        Some(window) => println!("Window:   {}", window),
        None => println!("Window:   empty"),
    }
    Ok(())
}

// ========== record ==========

async fn run_record(config: BufferConfig, source_config: SourceConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let source = rollcam::source::from_config(&source_config, clock.clone())?;

    info!("Rollcam recording");
    info!("  Source: {}", source_config.uri);
    info!("  Buffer dir: {:?}", config.buffer_dir);
    info!("  Retention: {}s ({})", config.buffer_secs, config.eviction);
    info!("  Segment duration: {}s", config.segment_secs);

    let nominal_fps = if source_config.fps > 0 {
        source_config.fps
    } else {
        StreamProperties::FALLBACK_FPS
    };
    let handle = Arc::new(BufferHandle::new(config.ring_capacity(nominal_fps)));
    let leases = ReadLeases::new();
    let encoder: Arc<dyn Encoder> = Arc::new(FfmpegEncoder::new(config.ffmpeg.clone()));

    let evictor = RetentionEvictor::new(
        config.index(),
        config.buffer_duration(),
        config.eviction,
        clock.clone(),
    )
    .with_leases(leases.clone());
    let writer =
        SegmentWriter::new(config.index(), encoder.clone(), clock.clone()).with_evictor(evictor);

    let service = Arc::new(
        ClipService::new(config.buffer_duration(), clock.clone())
            .with_segments(segment_backend(&config, clock.clone(), leases))
            .with_ring(
                RingBackend::new(handle.clone(), encoder, clock)
                    .with_min_clip_bytes(config.min_clip_bytes)
                    .with_container_ext(config.container_ext.clone()),
            )
            .with_wait_timeout(config.wait_timeout()),
    );

    // Graceful shutdown infrastructure
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Ingest runs on its own blocking thread; reads may block
    let ingest_handle = handle.clone();
    let mut ingest = tokio::task::spawn_blocking(move || {
        let mut source = source;
        writer.record(source.as_mut(), &ingest_handle)
    });
    let mut ingest_done = false;

    {
        let service = service.clone();
        let cancel = cancel.clone();
        let requests = tracker.clone();
        let ext = config.container_ext.clone();
        tracker.spawn(serve_clip_requests(service, ext, cancel, requests));
    }

    let index = config.index();
    let mut stats_interval = interval(Duration::from_secs(30));
    stats_interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, draining tasks...");
                break;
            }
            finished = &mut ingest, if !ingest_done => {
                ingest_done = true;
                match finished {
                    Ok(Ok(stats)) => info!(
                        "Ingest finished: {} segments, {} frames read",
                        stats.segments, stats.frames_read
                    ),
                    Ok(Err(e)) => error!("Ingest failed: {:#}", e),
                    Err(e) => error!("Ingest task panicked: {}", e),
                }
                break;
            }
            _ = stats_interval.tick() => {
                let segments = index.list().map(|s| s.len()).unwrap_or(0);
                let latest = handle
                    .latest_frame()
                    .map(|f| f.timestamp.format("%H:%M:%S%.3f").to_string())
                    .unwrap_or_else(|| "none".to_string());
                info!(
                    "Stats: {} segments on disk, {} frames in memory, latest frame {}",
                    segments,
                    handle.ring().len(),
                    latest
                );
            }
        }
    }

    cancel.cancel();
    handle.stop();

    if !ingest_done {
        match tokio::time::timeout(Duration::from_secs(5), ingest).await {
            Ok(Ok(Ok(stats))) => info!(
                "Ingest stopped: {} segments ({} empty, {} failed)",
                stats.segments, stats.empty_segments, stats.failed_segments
            ),
            Ok(Ok(Err(e))) => error!("Ingest failed: {:#}", e),
            Ok(Err(e)) => error!("Ingest task panicked: {}", e),
            Err(_) => warn!("Ingest did not stop within 5s (source read blocked)"),
        }
    }

    // Wait for all tracked tasks to finish (with timeout)
    tracker.close();
    if tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .is_err()
    {
        warn!("Shutdown timed out after 5s, some extractions may not have finished");
    } else {
        info!("All tasks shut down cleanly");
    }
    Ok(())
}

/// Serve `clip <start> [duration] [output]` lines from stdin, each as an
/// independent extraction task.
async fn serve_clip_requests(
    service: Arc<ClipService>,
    ext: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    // Blocking stdin reads cannot be cancelled, so they run on a detached thread
    let (tx, mut rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read clip request: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = rx.recv() => line,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let (request, output) = match parse_clip_line(&line, &ext) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Ignoring clip request {:?}: {:#}", line.trim(), e);
                continue;
            }
        };

        let service = service.clone();
        tracker.spawn(async move {
            match service.extract(&request, &output).await {
                Ok(clip) => info!(
                    "Clip extracted to {} ({} bytes, from {:?})",
                    clip.path.display(),
                    clip.size,
                    clip.source
                ),
                Err(e) => warn!("Clip {} failed: {}", request.window(), e),
            }
        });
    }
}

fn parse_clip_line(line: &str, ext: &str) -> Result<(ExtractionRequest, PathBuf)> {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("clip") => {}
        Some(other) => bail!("unknown command '{}'", other),
        None => bail!("empty request"),
    }
    let start = parts.next().context("missing start time")?;
    let request = parse_request(start, parts.next(), false)?;
    let output = parts
        .next()
        .map(Path::new)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_name(&request, ext));
    if parts.next().is_some() {
        bail!("too many arguments");
    }
    Ok((request, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> rollcam::Timestamp {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn request_defaults_to_ten_seconds() {
        let request = parse_request("2024-05-01T10:02:00", None, false).unwrap();
        assert_eq!(request.start, at(10, 2, 0));
        assert_eq!(request.duration, TimeDelta::seconds(10));
    }

    #[test]
    fn centered_request_starts_half_before() {
        let request = parse_request("20240501_100205", Some("10s"), true).unwrap();
        assert_eq!(request.start, at(10, 2, 0));
    }

    #[test]
    fn bad_input_rejected() {
        assert!(parse_request("yesterday", None, false).is_err());
        assert!(parse_request("2024-05-01T10:02:00", Some("ten"), false).is_err());
        assert!(parse_request("2024-05-01T10:02:00", Some("0"), false).is_err());
    }

    #[test]
    fn clip_line_parses_optional_fields() {
        let (request, output) = parse_clip_line("clip 2024-05-01T10:02:00", "mp4").unwrap();
        assert_eq!(request.duration, TimeDelta::seconds(10));
        assert_eq!(output, PathBuf::from("clip_20240501_100200_10s.mp4"));

        let (request, output) =
            parse_clip_line("clip 2024-05-01T10:02:00 1m out/x.mp4", "mp4").unwrap();
        assert_eq!(request.duration, TimeDelta::seconds(60));
        assert_eq!(output, PathBuf::from("out/x.mp4"));
    }

    #[test]
    fn clip_line_rejects_other_commands() {
        assert!(parse_clip_line("record now", "mp4").is_err());
        assert!(parse_clip_line("clip", "mp4").is_err());
        assert!(parse_clip_line("clip 2024-05-01T10:02:00 5 a.mp4 extra", "mp4").is_err());
    }

    #[test]
    fn cli_accepts_global_buffer_flags() {
        let cli = Cli::try_parse_from([
            "rollcam",
            "extract",
            "2024-05-01T10:02:00",
            "--buffer",
            "5m",
            "--buffer-dir",
            "/tmp/buf",
        ])
        .unwrap();
        assert_eq!(cli.buffer.buffer, Some(300));
        assert_eq!(cli.buffer.buffer_dir, Some(PathBuf::from("/tmp/buf")));
    }
}
