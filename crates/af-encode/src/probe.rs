//! Source duration probing via ffprobe.
//!
//! The worker needs the source duration to turn ffmpeg's `out_time_us`
//! reports into a percentage. Tracks usually carry a probed duration from
//! upload time; this is the fallback for the ones that do not.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use af_core::Result;

use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Probe the duration of an audio file in seconds.
///
/// Returns `Ok(None)` when ffprobe ran but reported no duration (e.g. a raw
/// stream); fails only when ffprobe itself cannot be run.
pub async fn probe_duration(tools: &ToolRegistry, path: &Path) -> Result<Option<f64>> {
    let ffprobe = tools.require("ffprobe")?;

    let output = ToolCommand::new(ffprobe.path.clone())
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(path.to_string_lossy().as_ref())
        .timeout(Duration::from_secs(30))
        .execute()
        .await?;

    Ok(parse_duration(&output.stdout))
}

/// Parse the `format.duration` field out of ffprobe's JSON output.
fn parse_duration(json: &str) -> Option<f64> {
    let parsed: FfprobeOutput = serde_json::from_str(json).ok()?;
    parsed
        .format?
        .duration?
        .parse::<f64>()
        .ok()
        .filter(|d| *d > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration() {
        let json = r#"{"format": {"filename": "a.flac", "duration": "183.4900"}}"#;
        let duration = parse_duration(json).unwrap();
        assert!((duration - 183.49).abs() < 0.001);
    }

    #[test]
    fn missing_duration_is_none() {
        assert!(parse_duration(r#"{"format": {"filename": "a.flac"}}"#).is_none());
        assert!(parse_duration(r#"{}"#).is_none());
    }

    #[test]
    fn unparseable_duration_is_none() {
        assert!(parse_duration(r#"{"format": {"duration": "N/A"}}"#).is_none());
    }

    #[test]
    fn zero_duration_is_none() {
        assert!(parse_duration(r#"{"format": {"duration": "0.000000"}}"#).is_none());
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_duration("not json at all").is_none());
    }
}
