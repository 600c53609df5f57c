//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires an in-memory database, a default
//! config pointed at a temp output directory, an [`EventBus`], and a
//! [`StubEncoder`] into a full [`AppContext`] so the worker pool can be
//! exercised without ffmpeg.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use af_core::config::Config;
use af_core::events::EventBus;
use af_core::{Error, Result, TrackId};
use af_db::models::TranscodeJob;
use af_db::pool::{self, init_memory_pool};
use af_db::queries::{tracks, users};
use af_encode::{EncodeRequest, Encoder, ToolRegistry};

use audioforge::context::AppContext;
use audioforge::service::TranscodeService;
use audioforge::worker;

/// What the stub encoder should do with each run.
pub enum StubBehavior {
    /// Report progress, write the output file, succeed.
    Succeed,
    /// Always fail (after writing and cleaning up a partial file).
    AlwaysFail,
    /// Fail the first `n` runs, then succeed.
    FailTimes(u32),
    /// Write a partial file and wait for cancellation.
    BlockUntilCancel,
}

/// Encoder double that mimics the real encoder's contract: progress only
/// moves forward, and no partial output survives a non-success return.
pub struct StubEncoder {
    behavior: StubBehavior,
    pub calls: AtomicU32,
}

impl StubEncoder {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for StubEncoder {
    async fn encode(
        &self,
        request: &EncodeRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let succeed = |request: &EncodeRequest| -> Result<()> {
            progress(25.0);
            progress(75.0);
            std::fs::write(&request.output, b"encoded audio")?;
            Ok(())
        };

        match self.behavior {
            StubBehavior::Succeed => succeed(request),
            StubBehavior::AlwaysFail => {
                std::fs::write(&request.output, b"partial")?;
                std::fs::remove_file(&request.output)?;
                Err(Error::Encode(format!("stub failure #{call}")))
            }
            StubBehavior::FailTimes(n) => {
                if call <= n {
                    Err(Error::Encode(format!("stub failure #{call}")))
                } else {
                    succeed(request)
                }
            }
            StubBehavior::BlockUntilCancel => {
                std::fs::write(&request.output, b"partial")?;
                progress(10.0);
                cancel.cancelled().await;
                std::fs::remove_file(&request.output)?;
                Err(Error::Encode("killed".into()))
            }
        }
    }
}

/// Test harness wrapping a fully-constructed [`AppContext`] backed by an
/// in-memory database and a stub encoder.
pub struct TestHarness {
    pub ctx: AppContext,
    pub svc: TranscodeService,
    pub encoder: Arc<StubEncoder>,
    _output_dir: tempfile::TempDir,
}

impl TestHarness {
    /// Create a harness with default configuration (retry backoff zeroed so
    /// tests run fast).
    pub fn new(behavior: StubBehavior) -> Self {
        Self::with_config(behavior, Config::default())
    }

    /// Create a harness with a custom configuration.
    pub fn with_config(behavior: StubBehavior, mut config: Config) -> Self {
        let output_dir = tempfile::tempdir().expect("failed to create temp output dir");
        config.storage.output_dir = output_dir.path().to_path_buf();
        config.transcode.retry_backoff_secs = 0;

        let encoder = Arc::new(StubEncoder::new(behavior));
        let ctx = AppContext {
            db: init_memory_pool().expect("failed to create in-memory pool"),
            config: Arc::new(config),
            event_bus: Arc::new(EventBus::default()),
            tools: Arc::new(ToolRegistry::from_tools(vec![])),
            encoder: encoder.clone(),
            cancellations: Arc::new(DashMap::new()),
        };

        Self {
            svc: TranscodeService::new(ctx.clone()),
            ctx,
            encoder,
            _output_dir: output_dir,
        }
    }

    /// Insert a track row owned by the system user.
    pub fn make_track(&self, file_path: &str) -> TrackId {
        let conn = pool::get_conn(&self.ctx.db).unwrap();
        let track = tracks::create_track(
            &conn,
            &tracks::NewTrack {
                user_id: users::system_user_id(),
                title: "Fixture",
                artist: "Fixture Artist",
                album: None,
                file_path,
                size_bytes: 2048,
                mime_type: Some("audio/flac"),
            },
        )
        .unwrap();
        // A known duration keeps progress reporting deterministic.
        tracks::set_duration(&conn, track.id, 120.0).unwrap();
        track.id
    }

    /// Start the worker pool; returns the shutdown token and join handles.
    pub fn spawn_workers(&self) -> (CancellationToken, Vec<tokio::task::JoinHandle<()>>) {
        let shutdown = CancellationToken::new();
        let handles = worker::spawn_workers(&self.ctx, &shutdown);
        (shutdown, handles)
    }

    /// Poll a job until `pred` holds, panicking after 10 seconds.
    pub async fn wait_for(
        &self,
        job_id: af_core::JobId,
        pred: impl Fn(&TranscodeJob) -> bool,
    ) -> TranscodeJob {
        for _ in 0..400 {
            let job = self.svc.status(job_id).unwrap();
            if pred(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for job {job_id}");
    }

    /// Poll a job until it reaches a terminal state.
    pub async fn wait_for_terminal(&self, job_id: af_core::JobId) -> TranscodeJob {
        self.wait_for(job_id, |job| job.status.is_terminal()).await
    }
}
