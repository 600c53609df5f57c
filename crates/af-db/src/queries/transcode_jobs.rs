//! Transcode job store.
//!
//! Every mutation here is one of the legal transition events from
//! `af_core::job`; the WHERE clauses enforce the same moves the pure
//! transition function allows, so a terminal row can never change and
//! progress can never regress, no matter how calls interleave.

use chrono::Utc;
use rusqlite::Connection;
use std::time::Duration;

use af_core::job::CANCELLED_ERROR;
use af_core::{Error, JobId, JobStatus, Quality, Result, TrackId};

use crate::models::TranscodeJob;

const COLS: &str = "id, track_id, status, progress, quality, input_path, output_path,
    error, retry_count, max_retries, locked_by, locked_at, created_at,
    updated_at, started_at, completed_at, scheduled_for, cancel_requested";

/// Outcome of [`reset_orphaned`] at process start.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OrphanReset {
    /// In-flight jobs put back in the queue.
    pub requeued: usize,
    /// In-flight jobs that had a pending cancel request and were cancelled.
    pub cancelled: usize,
    /// In-flight jobs that had already exhausted their retries.
    pub dead_lettered: usize,
}

/// Create a new job (the `Submitted` event): status=pending, progress=0.
pub fn create_job(
    conn: &Connection,
    track_id: TrackId,
    quality: Quality,
    input_path: &str,
    max_retries: u32,
) -> Result<TranscodeJob> {
    let id = JobId::new();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO transcode_jobs (id, track_id, status, quality, input_path,
            max_retries, created_at, updated_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![
            id.to_string(),
            track_id.to_string(),
            quality.as_str(),
            input_path,
            max_retries,
            &now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(TranscodeJob {
        id,
        track_id,
        status: JobStatus::Pending,
        progress: 0.0,
        quality,
        input_path: input_path.to_string(),
        output_path: None,
        error: None,
        retry_count: 0,
        max_retries,
        locked_by: None,
        locked_at: None,
        created_at: now.clone(),
        updated_at: now,
        started_at: None,
        completed_at: None,
        scheduled_for: None,
        cancel_requested: false,
    })
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<TranscodeJob>> {
    let q = format!("SELECT {COLS} FROM transcode_jobs WHERE id = ?1");
    let result = conn.query_row(&q, [id.to_string()], TranscodeJob::from_row);
    match result {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// List jobs with optional status filter and pagination, oldest first.
pub fn list_jobs(
    conn: &Connection,
    status: Option<JobStatus>,
    offset: i64,
    limit: i64,
) -> Result<Vec<TranscodeJob>> {
    let (q, params_vec): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = if let Some(s) = status {
        (
            format!(
                "SELECT {COLS} FROM transcode_jobs WHERE status = ?1
                 ORDER BY created_at ASC LIMIT ?2 OFFSET ?3"
            ),
            vec![
                Box::new(s.as_str().to_string()),
                Box::new(limit),
                Box::new(offset),
            ],
        )
    } else {
        (
            format!(
                "SELECT {COLS} FROM transcode_jobs
                 ORDER BY created_at ASC LIMIT ?1 OFFSET ?2"
            ),
            vec![Box::new(limit), Box::new(offset)],
        )
    };

    let mut stmt = conn
        .prepare(&q)
        .map_err(|e| Error::database(e.to_string()))?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), TranscodeJob::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Number of jobs waiting in the queue (for the capacity bound).
pub fn count_pending(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM transcode_jobs WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Check if a (track, quality) pair already has a pending or processing job.
pub fn has_active_job(conn: &Connection, track_id: TrackId, quality: Quality) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM transcode_jobs
             WHERE track_id = ?1 AND quality = ?2 AND status IN ('pending', 'processing')",
            rusqlite::params![track_id.to_string(), quality.as_str()],
            |row| row.get(0),
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(count > 0)
}

/// Atomically dequeue the next pending job (the `Started` event).
///
/// Sets `status='processing'`, `locked_by`, `locked_at`, `started_at`.
/// FIFO by `created_at`; jobs whose retry backoff (`scheduled_for`) has not
/// elapsed yet are skipped.
pub fn dequeue_next(conn: &Connection, worker: &str) -> Result<Option<TranscodeJob>> {
    let now = Utc::now().to_rfc3339();

    // SQLite RETURNING is supported since 3.35.
    let q = format!(
        "UPDATE transcode_jobs
         SET status='processing', locked_by=?1, locked_at=?2, started_at=?2, updated_at=?2
         WHERE id = (
             SELECT id FROM transcode_jobs
             WHERE status='pending' AND (scheduled_for IS NULL OR scheduled_for <= ?2)
             ORDER BY created_at ASC LIMIT 1
         )
         RETURNING {COLS}"
    );

    let result = conn.query_row(&q, rusqlite::params![worker, &now], TranscodeJob::from_row);
    match result {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Record encode progress (the `Progressed` event).
///
/// Monotonic: the stored value only moves forward, and is clamped below 100
/// (100 is written exclusively by [`complete_job`]). Returns `false` when
/// the row is not processing or a cancel was requested -- the worker treats
/// that as its cancellation checkpoint.
pub fn update_progress(conn: &Connection, id: JobId, pct: f64) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE transcode_jobs
             SET progress = max(progress, min(?1, 99.9)), updated_at = ?2
             WHERE id = ?3 AND status = 'processing' AND cancel_requested = 0",
            rusqlite::params![pct, &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a job as completed (the `Completed` event): progress=100, output
/// recorded. Only legal from processing.
pub fn complete_job(conn: &Connection, id: JobId, output_path: &str) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='completed', progress=100.0, output_path=?1, error=NULL,
                 completed_at=?2, updated_at=?2
             WHERE id=?3 AND status='processing'",
            rusqlite::params![output_path, &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a job as failed (the `Failed` event). Progress stays at the last
/// observed value. Only legal from processing.
pub fn fail_job(conn: &Connection, id: JobId, error: &str) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='failed', error=?1, output_path=NULL, completed_at=?2, updated_at=?2
             WHERE id=?3 AND status='processing'",
            rusqlite::params![error, &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Cancel a job that is still waiting in the queue (the `Cancelled` event
/// from pending). It never enters processing.
pub fn cancel_pending(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='failed', error=?1, completed_at=?2, updated_at=?2
             WHERE id=?3 AND status='pending'",
            rusqlite::params![CANCELLED_ERROR, &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Ask the worker processing this job to stop at its next checkpoint.
pub fn request_cancel(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE transcode_jobs SET cancel_requested=1, updated_at=?1
             WHERE id=?2 AND status='processing'",
            rusqlite::params![&now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Finalize a cancelled job from the worker (the `Cancelled` event from
/// processing).
pub fn finish_cancelled(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='failed', error=?1, completed_at=?2, updated_at=?2
             WHERE id=?3 AND status='processing'",
            rusqlite::params![CANCELLED_ERROR, &now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Put a job back in the queue after a retryable failure (the `Requeued`
/// event). Moves processing -> pending directly so the job never passes
/// through a terminal state, increments `retry_count`, and delays the next
/// attempt by `delay`.
pub fn requeue_for_retry(conn: &Connection, id: JobId, delay: Duration) -> Result<bool> {
    let now = Utc::now();
    let eligible_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
    let n = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='pending', retry_count=retry_count+1, scheduled_for=?1,
                 locked_by=NULL, locked_at=NULL, started_at=NULL, updated_at=?2
             WHERE id=?3 AND status='processing' AND retry_count < max_retries",
            rusqlite::params![
                eligible_at.to_rfc3339(),
                now.to_rfc3339(),
                id.to_string()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Recover jobs left in processing by a crashed worker.
///
/// Called once at process start, before any worker runs:
/// - jobs with a pending cancel request are finished as cancelled,
/// - jobs that exhausted their retries are dead-lettered,
/// - everything else goes back to pending with `retry_count` incremented so
///   a crash-looping job cannot occupy workers forever.
pub fn reset_orphaned(conn: &Connection) -> Result<OrphanReset> {
    let now = Utc::now().to_rfc3339();

    let cancelled = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='failed', error=?1, completed_at=?2, updated_at=?2
             WHERE status='processing' AND cancel_requested=1",
            rusqlite::params![CANCELLED_ERROR, &now],
        )
        .map_err(|e| Error::database(e.to_string()))?;

    let dead_lettered = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='failed', error='worker lost', completed_at=?1, updated_at=?1
             WHERE status='processing' AND retry_count >= max_retries",
            rusqlite::params![&now],
        )
        .map_err(|e| Error::database(e.to_string()))?;

    let requeued = conn
        .execute(
            "UPDATE transcode_jobs
             SET status='pending', retry_count=retry_count+1, scheduled_for=NULL,
                 locked_by=NULL, locked_at=NULL, started_at=NULL, updated_at=?1
             WHERE status='processing'",
            rusqlite::params![&now],
        )
        .map_err(|e| Error::database(e.to_string()))?;

    Ok(OrphanReset {
        requeued,
        cancelled,
        dead_lettered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use crate::queries::{tracks, users};

    fn setup() -> (
        r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>,
        TrackId,
    ) {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let track = tracks::create_track(
            &conn,
            &tracks::NewTrack {
                user_id: users::system_user_id(),
                title: "Test",
                artist: "Artist",
                album: None,
                file_path: "/uploads/test.flac",
                size_bytes: 4096,
                mime_type: Some("audio/flac"),
            },
        )
        .unwrap();
        (conn, track.id)
    }

    #[test]
    fn create_and_get() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::High, "/uploads/test.flac", 3).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);

        let found = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(found.track_id, track_id);
        assert_eq!(found.quality, Quality::High);
        assert!(found.output_path.is_none());
        assert!(found.error.is_none());
    }

    #[test]
    fn list_with_filter() {
        let (conn, track_id) = setup();
        create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        create_job(&conn, track_id, Quality::High, "/a", 3).unwrap();

        let all = list_jobs(&conn, None, 0, 100).unwrap();
        assert_eq!(all.len(), 2);

        let pending = list_jobs(&conn, Some(JobStatus::Pending), 0, 100).unwrap();
        assert_eq!(pending.len(), 2);

        let processing = list_jobs(&conn, Some(JobStatus::Processing), 0, 100).unwrap();
        assert!(processing.is_empty());
    }

    #[test]
    fn dequeue_is_fifo() {
        let (conn, track_id) = setup();
        let first = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        let second = create_job(&conn, track_id, Quality::Medium, "/a", 3).unwrap();

        let dequeued = dequeue_next(&conn, "w1").unwrap().unwrap();
        assert_eq!(dequeued.id, first.id);
        assert_eq!(dequeued.status, JobStatus::Processing);
        assert_eq!(dequeued.locked_by.as_deref(), Some("w1"));
        assert!(dequeued.started_at.is_some());

        let next = dequeue_next(&conn, "w2").unwrap().unwrap();
        assert_eq!(next.id, second.id);

        assert!(dequeue_next(&conn, "w3").unwrap().is_none());
    }

    #[test]
    fn dequeue_respects_backoff() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        dequeue_next(&conn, "w1").unwrap();

        // Requeue with an hour of backoff; the job must not be dequeued yet.
        assert!(requeue_for_retry(&conn, job.id, Duration::from_secs(3600)).unwrap());
        assert!(dequeue_next(&conn, "w1").unwrap().is_none());

        let waiting = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert_eq!(waiting.retry_count, 1);
        assert!(waiting.scheduled_for.is_some());
    }

    #[test]
    fn complete_sets_output_and_full_progress() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::High, "/a", 3).unwrap();
        dequeue_next(&conn, "w1").unwrap();

        assert!(update_progress(&conn, job.id, 40.0).unwrap());
        assert!(complete_job(&conn, job.id, "/out/test-high.m4a").unwrap());

        let done = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.output_path.as_deref(), Some("/out/test-high.m4a"));
        assert!(done.error.is_none());
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn fail_keeps_last_progress() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        dequeue_next(&conn, "w1").unwrap();
        update_progress(&conn, job.id, 62.5).unwrap();

        assert!(fail_job(&conn, job.id, "encoder exploded").unwrap());
        let failed = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("encoder exploded"));
        assert!(failed.output_path.is_none());
        assert!((failed.progress - 62.5).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        dequeue_next(&conn, "w1").unwrap();

        update_progress(&conn, job.id, 50.0).unwrap();
        // A late, out-of-order report must not move progress backwards.
        update_progress(&conn, job.id, 30.0).unwrap();
        let j = get_job(&conn, job.id).unwrap().unwrap();
        assert!((j.progress - 50.0).abs() < f64::EPSILON);

        // 100 is reserved for completion.
        update_progress(&conn, job.id, 100.0).unwrap();
        let j = get_job(&conn, job.id).unwrap().unwrap();
        assert!(j.progress < 100.0);
    }

    #[test]
    fn progress_refused_outside_processing() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        // Still pending.
        assert!(!update_progress(&conn, job.id, 10.0).unwrap());

        dequeue_next(&conn, "w1").unwrap();
        complete_job(&conn, job.id, "/out.m4a").unwrap();
        // Terminal.
        assert!(!update_progress(&conn, job.id, 99.0).unwrap());
    }

    #[test]
    fn terminal_states_never_change() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        dequeue_next(&conn, "w1").unwrap();
        complete_job(&conn, job.id, "/out.m4a").unwrap();

        assert!(!fail_job(&conn, job.id, "too late").unwrap());
        assert!(!complete_job(&conn, job.id, "/other.m4a").unwrap());
        assert!(!cancel_pending(&conn, job.id).unwrap());
        assert!(!requeue_for_retry(&conn, job.id, Duration::ZERO).unwrap());

        let j = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.output_path.as_deref(), Some("/out.m4a"));
    }

    #[test]
    fn cancel_pending_never_processes() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Medium, "/a", 3).unwrap();

        assert!(cancel_pending(&conn, job.id).unwrap());
        let j = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error.as_deref(), Some(CANCELLED_ERROR));
        assert!(j.started_at.is_none());

        // Gone from the queue.
        assert!(dequeue_next(&conn, "w1").unwrap().is_none());
    }

    #[test]
    fn cancel_processing_checkpoint() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Medium, "/a", 3).unwrap();
        dequeue_next(&conn, "w1").unwrap();

        assert!(request_cancel(&conn, job.id).unwrap());
        // The next progress write is refused -- the worker's checkpoint.
        assert!(!update_progress(&conn, job.id, 70.0).unwrap());

        assert!(finish_cancelled(&conn, job.id).unwrap());
        let j = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error.as_deref(), Some(CANCELLED_ERROR));
    }

    #[test]
    fn retry_exhaustion_refused() {
        let (conn, track_id) = setup();
        let job = create_job(&conn, track_id, Quality::Low, "/a", 2).unwrap();

        // retry_count goes 0 -> 1 -> 2; the third requeue hits max_retries.
        for _ in 0..2 {
            dequeue_next(&conn, "w1").unwrap();
            assert!(requeue_for_retry(&conn, job.id, Duration::ZERO).unwrap());
        }
        dequeue_next(&conn, "w1").unwrap();
        assert!(!requeue_for_retry(&conn, job.id, Duration::ZERO).unwrap());

        // Still processing; the worker now records the terminal failure.
        assert!(fail_job(&conn, job.id, "error #3").unwrap());
        let dead = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(dead.status, JobStatus::Failed);
        assert_eq!(dead.retry_count, 2);
    }

    #[test]
    fn has_active_job_per_quality() {
        let (conn, track_id) = setup();
        assert!(!has_active_job(&conn, track_id, Quality::High).unwrap());

        let job = create_job(&conn, track_id, Quality::High, "/a", 3).unwrap();
        assert!(has_active_job(&conn, track_id, Quality::High).unwrap());
        // A different quality is still free.
        assert!(!has_active_job(&conn, track_id, Quality::Low).unwrap());

        dequeue_next(&conn, "w1").unwrap();
        assert!(has_active_job(&conn, track_id, Quality::High).unwrap());

        complete_job(&conn, job.id, "/out.m4a").unwrap();
        assert!(!has_active_job(&conn, track_id, Quality::High).unwrap());
    }

    #[test]
    fn count_pending_tracks_queue_depth() {
        let (conn, track_id) = setup();
        assert_eq!(count_pending(&conn).unwrap(), 0);
        create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        create_job(&conn, track_id, Quality::High, "/a", 3).unwrap();
        assert_eq!(count_pending(&conn).unwrap(), 2);

        dequeue_next(&conn, "w1").unwrap();
        assert_eq!(count_pending(&conn).unwrap(), 1);
    }

    #[test]
    fn orphan_recovery() {
        let (conn, track_id) = setup();

        // One healthy in-flight job.
        let healthy = create_job(&conn, track_id, Quality::Low, "/a", 3).unwrap();
        // One in-flight job with retries exhausted.
        let doomed = create_job(&conn, track_id, Quality::Medium, "/a", 0).unwrap();
        // One in-flight job with a pending cancel request.
        let cancelled = create_job(&conn, track_id, Quality::High, "/a", 3).unwrap();

        for _ in 0..3 {
            dequeue_next(&conn, "w1").unwrap();
        }
        request_cancel(&conn, cancelled.id).unwrap();

        let outcome = reset_orphaned(&conn).unwrap();
        assert_eq!(
            outcome,
            OrphanReset {
                requeued: 1,
                cancelled: 1,
                dead_lettered: 1,
            }
        );

        let j = get_job(&conn, healthy.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        assert_eq!(j.retry_count, 1);
        assert!(j.locked_by.is_none());

        let j = get_job(&conn, doomed.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error.as_deref(), Some("worker lost"));

        let j = get_job(&conn, cancelled.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.error.as_deref(), Some(CANCELLED_ERROR));
    }
}
