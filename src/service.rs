//! The transcode service facade.
//!
//! This is the surface the web layer calls: submit a job for a track,
//! read a job snapshot, cancel a job, and register uploaded tracks. All
//! reads go straight to the store and never wait on a worker.

use std::path::{Path, PathBuf};

use af_core::events::EventPayload;
use af_core::job::{self, JobEvent};
use af_core::{Error, JobId, JobStatus, Quality, Result, TrackId, UserId};
use af_db::models::{Track, TranscodeJob};
use af_db::pool;
use af_db::queries::{tracks, transcode_jobs, users};
use af_encode::probe;

use crate::context::AppContext;

/// Metadata for a freshly uploaded file.
#[derive(Debug, Clone)]
pub struct TrackUpload {
    /// Owner; `None` means the system user (ad-hoc CLI imports).
    pub user_id: Option<UserId>,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub file_path: PathBuf,
}

/// Service facade over the job store, queue, and track catalogue.
#[derive(Clone)]
pub struct TranscodeService {
    ctx: AppContext,
}

impl TranscodeService {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Register an uploaded file as a track.
    ///
    /// The duration is probed via ffprobe on a best-effort basis; a missing
    /// ffprobe or an unreadable container only costs progress granularity
    /// later, so it is logged and ignored.
    pub async fn register_track(&self, upload: &TrackUpload) -> Result<Track> {
        let meta = std::fs::metadata(&upload.file_path).map_err(|e| {
            Error::Validation(format!(
                "cannot read upload {}: {e}",
                upload.file_path.display()
            ))
        })?;
        if !meta.is_file() {
            return Err(Error::Validation(format!(
                "upload {} is not a file",
                upload.file_path.display()
            )));
        }

        let mime = guess_mime(&upload.file_path);
        let conn = pool::get_conn(&self.ctx.db)?;
        let track = tracks::create_track(
            &conn,
            &tracks::NewTrack {
                user_id: upload.user_id.unwrap_or_else(users::system_user_id),
                title: &upload.title,
                artist: &upload.artist,
                album: upload.album.as_deref(),
                file_path: &upload.file_path.to_string_lossy(),
                size_bytes: meta.len() as i64,
                mime_type: mime,
            },
        )?;
        drop(conn);

        match probe::probe_duration(&self.ctx.tools, &upload.file_path).await {
            Ok(Some(duration)) => {
                let conn = pool::get_conn(&self.ctx.db)?;
                tracks::set_duration(&conn, track.id, duration)?;
            }
            Ok(None) => {
                tracing::debug!(track_id = %track.id, "No duration reported for upload");
            }
            Err(e) => {
                tracing::debug!(track_id = %track.id, "Duration probe failed: {e}");
            }
        }

        self.ctx
            .event_bus
            .broadcast(EventPayload::TrackRegistered { track_id: track.id });

        Ok(track)
    }

    /// Create a pending transcode job for a track.
    pub fn submit(&self, track_id: TrackId, quality: Quality) -> Result<JobId> {
        let conn = pool::get_conn(&self.ctx.db)?;

        let track = tracks::get_track(&conn, track_id)?
            .ok_or_else(|| Error::Validation(format!("unknown track {track_id}")))?;

        let max_pending = self.ctx.config.transcode.max_pending;
        if max_pending > 0 && transcode_jobs::count_pending(&conn)? >= i64::from(max_pending) {
            return Err(Error::Capacity(format!(
                "pending queue is full ({max_pending} jobs)"
            )));
        }

        if transcode_jobs::has_active_job(&conn, track_id, quality)? {
            return Err(Error::Conflict(format!(
                "track {track_id} already has an active {quality} job"
            )));
        }

        let job = transcode_jobs::create_job(
            &conn,
            track_id,
            quality,
            &track.file_path,
            self.ctx.config.transcode.max_retries,
        )?;

        tracing::info!(job_id = %job.id, track_id = %track_id, quality = %quality, "Job queued");
        self.ctx.event_bus.broadcast(EventPayload::JobQueued {
            job_id: job.id,
            track_id,
        });

        Ok(job.id)
    }

    /// Read-only snapshot of a job.
    pub fn status(&self, job_id: JobId) -> Result<TranscodeJob> {
        let conn = pool::get_conn(&self.ctx.db)?;
        transcode_jobs::get_job(&conn, job_id)?.ok_or_else(|| Error::not_found("job", job_id))
    }

    /// Cancel a job.
    ///
    /// Pending jobs leave the queue immediately and never run. Processing
    /// jobs are signalled: the in-process cancellation token fires right
    /// away and the row's `cancel_requested` flag covers workers in other
    /// processes; the owning worker finalizes the job at its next
    /// checkpoint. Terminal jobs are a conflict.
    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        let conn = pool::get_conn(&self.ctx.db)?;

        if transcode_jobs::cancel_pending(&conn, job_id)? {
            tracing::info!(job_id = %job_id, "Cancelled pending job");
            self.ctx
                .event_bus
                .broadcast(EventPayload::JobCancelled { job_id });
            return Ok(());
        }

        let job =
            transcode_jobs::get_job(&conn, job_id)?.ok_or_else(|| Error::not_found("job", job_id))?;

        match job.status {
            JobStatus::Processing => {
                transcode_jobs::request_cancel(&conn, job_id)?;
                if let Some(token) = self.ctx.cancellations.get(&job_id) {
                    token.cancel();
                }
                tracing::info!(job_id = %job_id, "Requested cancel of processing job");
                Ok(())
            }
            // Lost the race against a dequeue-then-requeue; one more try.
            JobStatus::Pending => {
                if transcode_jobs::cancel_pending(&conn, job_id)? {
                    self.ctx
                        .event_bus
                        .broadcast(EventPayload::JobCancelled { job_id });
                    Ok(())
                } else {
                    Err(Error::Conflict(format!(
                        "job {job_id} changed state during cancel"
                    )))
                }
            }
            status => {
                // Terminal states refuse the event; surface the canonical
                // transition error.
                job::apply(Some(status), &JobEvent::Cancelled)?;
                Err(Error::Internal(format!(
                    "job {job_id} in unexpected state {status}"
                )))
            }
        }
    }

    /// List job snapshots, optionally filtered by status.
    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TranscodeJob>> {
        let conn = pool::get_conn(&self.ctx.db)?;
        transcode_jobs::list_jobs(&conn, status, offset, limit)
    }

    /// List registered tracks.
    pub fn list_tracks(&self, offset: i64, limit: i64) -> Result<Vec<Track>> {
        let conn = pool::get_conn(&self.ctx.db)?;
        tracks::list_tracks(&conn, offset, limit)
    }

    /// The most recent lifecycle events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<af_core::events::Event> {
        self.ctx.event_bus.recent_events(n)
    }
}

/// MIME type by file extension; `None` for anything unrecognized.
fn guess_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase()
        .as_str()
    {
        "flac" => Some("audio/flac"),
        "mp3" => Some("audio/mpeg"),
        "wav" => Some("audio/wav"),
        "m4a" | "mp4" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" | "oga" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        _ => None,
    }
}
