//! Background transcode workers.
//!
//! Each worker polls the database for pending jobs, claims one atomically,
//! runs the encoder, and records the outcome. Retryable failures go back to
//! the queue with exponential backoff; cancellation is observed both through
//! the in-process token and the row's `cancel_requested` flag.

use std::path::Path;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use af_core::events::EventPayload;
use af_core::{Quality, Result, TrackId};
use af_db::models::TranscodeJob;
use af_db::pool;
use af_db::queries::{tracks, transcode_jobs};
use af_encode::{probe, EncodeRequest};

use crate::context::AppContext;

/// Spawn the configured number of workers.
///
/// Workers run until `shutdown` fires; an in-flight encode is finished
/// before the worker exits (a killed process is handled by orphan recovery
/// at the next start).
pub fn spawn_workers(ctx: &AppContext, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    (0..ctx.config.transcode.workers)
        .map(|i| {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("worker-{i}");
            tokio::spawn(run_worker(ctx, worker_id, shutdown))
        })
        .collect()
}

/// Run a single worker loop until the shutdown token is triggered.
pub async fn run_worker(ctx: AppContext, worker_id: String, shutdown: CancellationToken) {
    tracing::info!(worker = %worker_id, "Worker started");

    let poll_interval = Duration::from_secs(ctx.config.transcode.poll_interval_secs.max(1));

    loop {
        if shutdown.is_cancelled() {
            tracing::info!(worker = %worker_id, "Worker shutting down");
            break;
        }

        match process_next_job(&ctx, &worker_id).await {
            Ok(true) => {
                // Processed a job; immediately check for the next one.
                continue;
            }
            Ok(false) => {
                // No jobs available; wait before polling again.
            }
            Err(e) => {
                tracing::error!(worker = %worker_id, "Worker error: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.cancelled() => { break; }
        }
    }

    tracing::info!(worker = %worker_id, "Worker stopped");
}

/// Try to dequeue and process the next job.
///
/// Returns `Ok(true)` if a job was processed, `Ok(false)` if none were
/// available.
async fn process_next_job(ctx: &AppContext, worker_id: &str) -> Result<bool> {
    let conn = pool::get_conn(&ctx.db)?;
    let job = transcode_jobs::dequeue_next(&conn, worker_id)?;
    drop(conn);

    let Some(job) = job else {
        return Ok(false);
    };

    let job_id = job.id;
    tracing::info!(
        job_id = %job_id,
        track_id = %job.track_id,
        quality = %job.quality,
        attempt = job.retry_count + 1,
        "Processing job"
    );

    ctx.event_bus
        .broadcast(EventPayload::JobStarted { job_id });

    // Register the cancel token before any work so a service cancel always
    // has something to fire.
    let token = CancellationToken::new();
    ctx.cancellations.insert(job_id, token.clone());

    let outcome = run_job(ctx, &job, &token).await;
    ctx.cancellations.remove(&job_id);
    finish_job(ctx, &job, &token, outcome).await?;

    Ok(true)
}

/// Execute the encode for a claimed job. Returns the output path.
async fn run_job(ctx: &AppContext, job: &TranscodeJob, token: &CancellationToken) -> Result<String> {
    let input = Path::new(&job.input_path);

    // Source duration: the track record first, ffprobe as fallback.
    let conn = pool::get_conn(&ctx.db)?;
    let duration_secs = tracks::get_track(&conn, job.track_id)?.and_then(|t| t.duration_secs);
    drop(conn);

    let duration_secs = match duration_secs {
        Some(d) => Some(d),
        None => probe::probe_duration(&ctx.tools, input)
            .await
            .ok()
            .flatten(),
    };

    let output_dir = &ctx.config.storage.output_dir;
    std::fs::create_dir_all(output_dir)?;
    let output = output_dir.join(output_file_name(input, job.track_id, job.quality));

    let request = EncodeRequest {
        input: input.to_path_buf(),
        output: output.clone(),
        bitrate: ctx.config.transcode.bitrate_for(job.quality).to_string(),
        duration_secs,
    };

    let progress_db = ctx.db.clone();
    let progress_bus = ctx.event_bus.clone();
    let progress_token = token.clone();
    let job_id = job.id;
    let on_progress = move |pct: f64| {
        match pool::get_conn(&progress_db).and_then(|conn| {
            transcode_jobs::update_progress(&conn, job_id, pct)
        }) {
            Ok(true) => {
                progress_bus.broadcast(EventPayload::JobProgress {
                    job_id,
                    progress: pct,
                });
            }
            // Refused write: a cancel was requested (possibly from another
            // process). This is the worker's checkpoint.
            Ok(false) => progress_token.cancel(),
            Err(e) => tracing::warn!(job_id = %job_id, "Progress write failed: {e}"),
        }
    };

    ctx.encoder.encode(&request, &on_progress, token).await?;

    Ok(output.to_string_lossy().into_owned())
}

/// Record a finished encode: completion, cancellation, retry, or failure.
async fn finish_job(
    ctx: &AppContext,
    job: &TranscodeJob,
    token: &CancellationToken,
    outcome: Result<String>,
) -> Result<()> {
    let job_id = job.id;
    let conn = pool::get_conn(&ctx.db)?;

    match outcome {
        Ok(output_path) => {
            transcode_jobs::complete_job(&conn, job_id, &output_path)?;
            tracing::info!(job_id = %job_id, output = %output_path, "Job completed");
            ctx.event_bus.broadcast(EventPayload::JobCompleted {
                job_id,
                output_path,
            });
        }
        Err(e) => {
            let cancel_requested = transcode_jobs::get_job(&conn, job_id)?
                .map(|j| j.cancel_requested)
                .unwrap_or(false);

            if token.is_cancelled() || cancel_requested {
                transcode_jobs::finish_cancelled(&conn, job_id)?;
                tracing::info!(job_id = %job_id, "Job cancelled");
                ctx.event_bus
                    .broadcast(EventPayload::JobCancelled { job_id });
            } else if job.retry_count < job.max_retries {
                let backoff = ctx.config.transcode.backoff_for(job.retry_count);
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    retry = job.retry_count + 1,
                    backoff_secs = backoff.as_secs(),
                    "Job failed, scheduling retry"
                );
                if transcode_jobs::requeue_for_retry(&conn, job_id, backoff)? {
                    ctx.event_bus.broadcast(EventPayload::JobRequeued {
                        job_id,
                        retry_count: job.retry_count + 1,
                    });
                } else {
                    // Requeue refused (e.g. a cancel raced in); record the
                    // failure so the job cannot stay processing forever.
                    transcode_jobs::fail_job(&conn, job_id, &e.to_string())?;
                    ctx.event_bus.broadcast(EventPayload::JobFailed {
                        job_id,
                        error: e.to_string(),
                    });
                }
            } else {
                let error_msg = e.to_string();
                tracing::error!(job_id = %job_id, error = %error_msg, "Job failed");
                transcode_jobs::fail_job(&conn, job_id, &error_msg)?;
                ctx.event_bus.broadcast(EventPayload::JobFailed {
                    job_id,
                    error: error_msg,
                });
            }
        }
    }

    Ok(())
}

/// Output file name: `<source stem>_<track id>-<quality>.m4a`.
fn output_file_name(input: &Path, track_id: TrackId, quality: Quality) -> String {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    format!("{stem}_{track_id}-{quality}.m4a")
}

/// Reset jobs orphaned by a previous process, logging the outcome.
///
/// Must run once at startup before any worker is spawned.
pub fn recover_orphaned_jobs(ctx: &AppContext) -> Result<()> {
    let conn = pool::get_conn(&ctx.db)?;
    let outcome = transcode_jobs::reset_orphaned(&conn)?;
    if outcome.requeued > 0 || outcome.cancelled > 0 || outcome.dead_lettered > 0 {
        tracing::info!(
            requeued = outcome.requeued,
            cancelled = outcome.cancelled,
            dead_lettered = outcome.dead_lettered,
            "Recovered orphaned jobs from previous session"
        );
    }
    Ok(())
}
