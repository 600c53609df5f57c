//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for storage, transcoding, and external tools. Every section
//! defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::job::Quality;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub transcode: TranscodeConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit (async, embedded, etc.).
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.transcode.workers == 0 {
            warnings.push("transcode.workers is 0; no jobs will ever run".into());
        }

        if self.transcode.poll_interval_secs == 0 {
            warnings.push("transcode.poll_interval_secs is 0; workers will busy-poll".into());
        }

        for (name, bitrate) in [
            ("low", &self.transcode.low_bitrate),
            ("medium", &self.transcode.medium_bitrate),
            ("high", &self.transcode.high_bitrate),
        ] {
            if bitrate.is_empty() {
                warnings.push(format!("transcode.{name}_bitrate is empty"));
            }
        }

        for (name, path) in [
            ("ffmpeg_path", &self.tools.ffmpeg_path),
            ("ffprobe_path", &self.tools.ffprobe_path),
        ] {
            if let Some(p) = path {
                if !p.exists() {
                    warnings.push(format!(
                        "tools.{name} '{}' does not exist; falling back to PATH lookup",
                        p.display()
                    ));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Database and output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Directory transcoded files are written to.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/data/audioforge.db"),
            output_dir: PathBuf::from("/data/transcoded"),
        }
    }
}

/// Worker pool and retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Attempts before a job is dead-lettered.
    pub max_retries: u32,
    /// Base delay between retries; doubles per attempt.
    pub retry_backoff_secs: u64,
    /// Upper bound on the retry delay.
    pub retry_backoff_cap_secs: u64,
    /// How long an idle worker sleeps before re-polling the queue.
    pub poll_interval_secs: u64,
    /// Maximum pending jobs; 0 means unbounded.
    pub max_pending: u32,
    #[serde(default = "default_low_bitrate")]
    pub low_bitrate: String,
    #[serde(default = "default_medium_bitrate")]
    pub medium_bitrate: String,
    #[serde(default = "default_high_bitrate")]
    pub high_bitrate: String,
}

fn default_low_bitrate() -> String {
    Quality::Low.default_bitrate().into()
}
fn default_medium_bitrate() -> String {
    Quality::Medium.default_bitrate().into()
}
fn default_high_bitrate() -> String {
    Quality::High.default_bitrate().into()
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 3,
            retry_backoff_secs: 2,
            retry_backoff_cap_secs: 300,
            poll_interval_secs: 2,
            max_pending: 0,
            low_bitrate: default_low_bitrate(),
            medium_bitrate: default_medium_bitrate(),
            high_bitrate: default_high_bitrate(),
        }
    }
}

impl TranscodeConfig {
    /// The AAC bitrate configured for a quality profile.
    pub fn bitrate_for(&self, quality: Quality) -> &str {
        match quality {
            Quality::Low => &self.low_bitrate,
            Quality::Medium => &self.medium_bitrate,
            Quality::High => &self.high_bitrate,
        }
    }

    /// Exponential backoff delay before retry attempt `retry_count + 1`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let secs = self
            .retry_backoff_secs
            .saturating_mul(2u64.saturating_pow(retry_count))
            .min(self.retry_backoff_cap_secs);
        Duration::from_secs(secs)
    }
}

/// External tool path overrides; `None` means look up in PATH.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_valid() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.transcode.workers, 2);
        assert_eq!(config.transcode.max_retries, 3);
        assert_eq!(config.transcode.max_pending, 0);
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let config = Config::from_json(r#"{"transcode": {"workers": 8}}"#).unwrap();
        assert_eq!(config.transcode.workers, 8);
        assert_eq!(config.transcode.poll_interval_secs, 2);
        assert_eq!(config.transcode.high_bitrate, "320k");
    }

    #[test]
    fn invalid_json_is_error() {
        assert!(Config::from_json("{nope").is_err());
    }

    #[test]
    fn load_or_default_missing_file() {
        let config = Config::load_or_default(Some(Path::new("/nonexistent/af.json")));
        assert_eq!(config.transcode.workers, 2);
    }

    #[test]
    fn load_or_default_none() {
        let config = Config::load_or_default(None);
        assert_eq!(config.storage.output_dir, PathBuf::from("/data/transcoded"));
    }

    #[test]
    fn bitrate_for_quality() {
        let config = Config::default();
        assert_eq!(config.transcode.bitrate_for(Quality::Low), "96k");
        assert_eq!(config.transcode.bitrate_for(Quality::Medium), "192k");
        assert_eq!(config.transcode.bitrate_for(Quality::High), "320k");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = TranscodeConfig::default();
        assert_eq!(config.backoff_for(0), Duration::from_secs(2));
        assert_eq!(config.backoff_for(1), Duration::from_secs(4));
        assert_eq!(config.backoff_for(2), Duration::from_secs(8));
        // Far past the cap.
        assert_eq!(config.backoff_for(20), Duration::from_secs(300));
        // Absurd retry counts must not overflow.
        assert_eq!(config.backoff_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn validate_flags_zero_workers() {
        let mut config = Config::default();
        config.transcode.workers = 0;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("workers")));
    }

    #[test]
    fn validate_flags_missing_tool_path() {
        let mut config = Config::default();
        config.tools.ffmpeg_path = Some(PathBuf::from("/nonexistent/ffmpeg"));
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("ffmpeg_path")));
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }
}
