//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row`.

use std::str::FromStr;

use af_core::{JobId, JobStatus, Quality, TrackId, UserId};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(T::from(uuid))
}

/// Parse a text column through `FromStr` (status, quality enums).
fn parse_text<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub created_at: String,
}

impl User {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            username: row.get(1)?,
            created_at: row.get(2)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Track
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub user_id: UserId,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<f64>,
    pub file_path: String,
    /// Source quality label as reported at upload time (e.g. "lossless").
    pub quality: Option<String>,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Track {
    /// Build from a row selected as:
    /// id, user_id, title, artist, album, duration_secs, file_path, quality,
    /// size_bytes, mime_type, created_at, updated_at
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            user_id: parse_id(row, 1)?,
            title: row.get(2)?,
            artist: row.get(3)?,
            album: row.get(4)?,
            duration_secs: row.get(5)?,
            file_path: row.get(6)?,
            quality: row.get(7)?,
            size_bytes: row.get(8)?,
            mime_type: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

// ---------------------------------------------------------------------------
// TranscodeJob
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub id: JobId,
    pub track_id: TrackId,
    pub status: JobStatus,
    /// Percent complete, 0-100. Reaches 100 only on completion.
    pub progress: f64,
    pub quality: Quality,
    pub input_path: String,
    /// Set only when status is completed.
    pub output_path: Option<String>,
    /// Set only when status is failed.
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// Earliest dequeue time; set by retry backoff.
    pub scheduled_for: Option<String>,
    pub cancel_requested: bool,
}

impl TranscodeJob {
    /// Build from a row selected as:
    /// id, track_id, status, progress, quality, input_path, output_path,
    /// error, retry_count, max_retries, locked_by, locked_at, created_at,
    /// updated_at, started_at, completed_at, scheduled_for, cancel_requested
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            track_id: parse_id(row, 1)?,
            status: parse_text(row, 2)?,
            progress: row.get(3)?,
            quality: parse_text(row, 4)?,
            input_path: row.get(5)?,
            output_path: row.get(6)?,
            error: row.get(7)?,
            retry_count: row.get(8)?,
            max_retries: row.get(9)?,
            locked_by: row.get(10)?,
            locked_at: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
            scheduled_for: row.get(16)?,
            cancel_requested: row.get(17)?,
        })
    }
}
