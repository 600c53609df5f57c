//! Transcode job domain model.
//!
//! Job rows are never mutated field-by-field: every change is expressed as a
//! [`JobEvent`] and validated by [`apply`], the single state-transition
//! function. The SQL layer mirrors the same guards in its WHERE clauses so an
//! illegal move is refused at both levels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Error message recorded on a job that was cancelled by the user.
pub const CANCELLED_ERROR: &str = "cancelled";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a transcode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Claimed by a worker, encode in flight.
    Processing,
    /// Encode finished, output registered.
    Completed,
    /// Encode failed or was cancelled.
    Failed,
}

impl JobStatus {
    /// The TEXT value stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed and failed jobs accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Validation(format!("unknown job status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

/// Target encoding profile controlling the bitrate of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    /// The TEXT value stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }

    /// Default AAC bitrate for this profile.
    pub fn default_bitrate(&self) -> &'static str {
        match self {
            Quality::Low => "96k",
            Quality::Medium => "192k",
            Quality::High => "320k",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(Error::Validation(format!(
                "quality must be low, medium or high (got '{other}')"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobEvent + transition function
// ---------------------------------------------------------------------------

/// A transition event in a job's lifecycle.
///
/// Events carry the data the transition writes; nothing else on the row may
/// change as a side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// Job created and queued.
    Submitted,
    /// A worker claimed the job.
    Started,
    /// Encode progress report, percent in `[0, 100)`.
    Progressed { pct: f64 },
    /// Encode finished; `output_path` is the final artifact.
    Completed { output_path: String },
    /// Encode failed for good; `error` is recorded on the row.
    Failed { error: String },
    /// The user cancelled the job.
    Cancelled,
    /// A retryable failure or crash recovery put the job back in the queue.
    Requeued,
}

/// Validate and apply a transition event.
///
/// `current` is `None` only for [`JobEvent::Submitted`]. Returns the status
/// the job holds after the event, or [`Error::Conflict`] for an illegal move.
///
/// Progress may only be reported while processing, and never reaches 100
/// through this path: 100 is reserved for the completion transition.
pub fn apply(current: Option<JobStatus>, event: &JobEvent) -> Result<JobStatus> {
    match (current, event) {
        (None, JobEvent::Submitted) => Ok(JobStatus::Pending),
        (Some(JobStatus::Pending), JobEvent::Started) => Ok(JobStatus::Processing),
        (Some(JobStatus::Pending), JobEvent::Cancelled) => Ok(JobStatus::Failed),
        (Some(JobStatus::Processing), JobEvent::Progressed { pct }) => {
            if !(0.0..100.0).contains(pct) {
                return Err(Error::Validation(format!(
                    "progress must be in [0, 100) (got {pct})"
                )));
            }
            Ok(JobStatus::Processing)
        }
        (Some(JobStatus::Processing), JobEvent::Completed { .. }) => Ok(JobStatus::Completed),
        (Some(JobStatus::Processing), JobEvent::Failed { .. }) => Ok(JobStatus::Failed),
        (Some(JobStatus::Processing), JobEvent::Cancelled) => Ok(JobStatus::Failed),
        (Some(JobStatus::Processing), JobEvent::Requeued) => Ok(JobStatus::Pending),
        (Some(status), event) => Err(Error::Conflict(format!(
            "illegal transition: {event:?} on a {status} job"
        ))),
        (None, event) => Err(Error::Conflict(format!(
            "illegal transition: {event:?} on a job that does not exist"
        ))),
    }
}
