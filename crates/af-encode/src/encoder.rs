//! The [`Encoder`] trait and its ffmpeg implementation.
//!
//! Encoding is the only long-running operation in the system, so the
//! interface is built around interruption: progress flows out through a
//! callback and a `CancellationToken` kills the child process. A failed or
//! cancelled run never leaves a partial output file behind.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use af_core::{Error, Result};

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// Default encode timeout: 1 hour, generous for any single audio track.
const DEFAULT_ENCODE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Minimum interval between progress callbacks.
const PROGRESS_THROTTLE: Duration = Duration::from_secs(1);

/// One encode run: where to read, where to write, and how hard to squeeze.
#[derive(Debug, Clone)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// AAC bitrate, e.g. "192k".
    pub bitrate: String,
    /// Source duration; without it no percentage can be computed and the
    /// run simply reports no progress.
    pub duration_secs: Option<f64>,
}

/// An audio encoder.
///
/// `progress` receives percentages in `[0, 99.9]`; the caller owns the
/// completion transition. Implementations must remove any partially written
/// output on a non-success return.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// ffmpeg progress parsing
// ---------------------------------------------------------------------------

/// Incremental parser for ffmpeg `-progress` key=value output.
///
/// ffmpeg emits blocks of `key=value` lines terminated by a `progress=`
/// line. The parser accumulates `out_time_us` and yields a percentage at
/// each block boundary, throttled to [`PROGRESS_THROTTLE`].
struct ProgressParser {
    duration_secs: Option<f64>,
    out_time_us: Option<i64>,
    last_emit: Option<Instant>,
}

impl ProgressParser {
    fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs,
            out_time_us: None,
            last_emit: None,
        }
    }

    /// Feed one line; returns a percentage when a progress block completes
    /// and the throttle allows it.
    fn push(&mut self, line: &str) -> Option<f64> {
        if let Some(val) = line.strip_prefix("out_time_us=") {
            self.out_time_us = val.trim().parse::<i64>().ok();
            return None;
        }

        let Some(state) = line.strip_prefix("progress=") else {
            return None;
        };

        let duration = self.duration_secs.filter(|d| *d > 0.0)?;
        let out_us = self.out_time_us?;

        let at_end = state.trim() == "end";
        if !at_end {
            if let Some(last) = self.last_emit {
                if last.elapsed() < PROGRESS_THROTTLE {
                    return None;
                }
            }
        }
        self.last_emit = Some(Instant::now());

        let elapsed_secs = out_us as f64 / 1_000_000.0;
        Some((elapsed_secs / duration * 100.0).clamp(0.0, 99.9))
    }
}

// ---------------------------------------------------------------------------
// FfmpegEncoder
// ---------------------------------------------------------------------------

/// Encoder backed by the ffmpeg CLI, producing stereo AAC in an M4A
/// container with `+faststart` for progressive streaming.
pub struct FfmpegEncoder {
    tools: ToolRegistry,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(tools: ToolRegistry) -> Self {
        Self {
            tools,
            timeout: DEFAULT_ENCODE_TIMEOUT,
        }
    }

    /// Override the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_args(request: &EncodeRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-progress".into(),
            "pipe:2".into(),
            "-nostats".into(),
            "-i".into(),
            request.input.to_string_lossy().into_owned(),
            // Drop embedded cover art streams.
            "-vn".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            request.bitrate.clone(),
            "-ac".into(),
            "2".into(),
            "-movflags".into(),
            "+faststart".into(),
        ];
        args.push(request.output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ffmpeg = self.tools.require("ffmpeg")?;

        tracing::info!(
            "Encode: {:?} -> {:?} (bitrate={})",
            request.input,
            request.output,
            request.bitrate,
        );

        let mut cmd = ToolCommand::new(ffmpeg.path.clone());
        cmd.timeout(self.timeout);
        cmd.args(Self::build_args(request));

        let mut parser = ProgressParser::new(request.duration_secs);
        let result = cmd
            .execute_streaming(
                |line| {
                    if let Some(pct) = parser.push(line) {
                        progress(pct);
                    }
                },
                cancel,
            )
            .await
            .map_err(|e| match e {
                // Spawn/exit problems are encode failures from the job's
                // point of view; keep the tool detail in the message.
                Error::Tool { tool, message } => Error::Encode(format!("{tool}: {message}")),
                other => other,
            });

        if result.is_err() {
            remove_partial_output(&request.output);
        }

        result
    }
}

/// Best-effort removal of a partially written output file.
fn remove_partial_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed partial output {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove partial output {:?}: {e}", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EncodeRequest {
        EncodeRequest {
            input: PathBuf::from("/uploads/song.flac"),
            output: PathBuf::from("/out/song-high.m4a"),
            bitrate: "320k".into(),
            duration_secs: Some(200.0),
        }
    }

    #[test]
    fn args_shape() {
        let args = FfmpegEncoder::build_args(&request());
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -progress pipe:2 -nostats -i /uploads/song.flac"));
        assert!(joined.contains("-vn"));
        assert!(joined.contains("-c:a aac -b:a 320k -ac 2"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.ends_with("/out/song-high.m4a"));
    }

    #[test]
    fn parser_emits_on_block_boundary() {
        let mut parser = ProgressParser::new(Some(100.0));
        assert!(parser.push("out_time_us=25000000").is_none());
        let pct = parser.push("progress=continue").unwrap();
        assert!((pct - 25.0).abs() < 0.001);
    }

    #[test]
    fn parser_throttles_intermediate_blocks() {
        let mut parser = ProgressParser::new(Some(100.0));
        parser.push("out_time_us=10000000");
        assert!(parser.push("progress=continue").is_some());
        // Immediately following block is inside the throttle window.
        parser.push("out_time_us=11000000");
        assert!(parser.push("progress=continue").is_none());
        // The final block always emits.
        parser.push("out_time_us=100000000");
        assert!(parser.push("progress=end").is_some());
    }

    #[test]
    fn parser_caps_below_hundred() {
        let mut parser = ProgressParser::new(Some(100.0));
        // Reported time can overshoot the probed duration slightly.
        parser.push("out_time_us=105000000");
        let pct = parser.push("progress=end").unwrap();
        assert!(pct <= 99.9);
    }

    #[test]
    fn parser_silent_without_duration() {
        let mut parser = ProgressParser::new(None);
        parser.push("out_time_us=10000000");
        assert!(parser.push("progress=continue").is_none());
        assert!(parser.push("progress=end").is_none());
    }

    #[test]
    fn parser_ignores_unrelated_lines() {
        let mut parser = ProgressParser::new(Some(100.0));
        assert!(parser.push("bitrate= 192.0kbits/s").is_none());
        assert!(parser.push("speed=12.3x").is_none());
        // No out_time seen yet, so a boundary yields nothing.
        assert!(parser.push("progress=continue").is_none());
    }

    #[test]
    fn partial_output_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.m4a");
        std::fs::write(&path, b"half an encode").unwrap();

        remove_partial_output(&path);
        assert!(!path.exists());

        // Removing a missing file is quietly fine.
        remove_partial_output(&path);
    }
}
