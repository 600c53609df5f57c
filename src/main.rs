mod cli;

use audioforge::context::AppContext;
use audioforge::service::{TranscodeService, TrackUpload};
use audioforge::worker;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use af_core::config::Config;
use af_core::{JobId, JobStatus, Quality, TrackId};
use af_encode::ToolRegistry;

async fn serve(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);

    tracing::info!("Starting audioforge");
    tracing::info!(
        workers = config.transcode.workers,
        db = %config.storage.db_path.display(),
        "Configuration loaded"
    );

    let ctx = AppContext::init(config)?;

    // Clean up jobs orphaned by a previous session before workers start.
    worker::recover_orphaned_jobs(&ctx)?;

    let shutdown = CancellationToken::new();
    let workers = worker::spawn_workers(&ctx, &shutdown);

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }

    tracing::info!("Shutting down...");
    shutdown.cancel();
    futures::future::join_all(workers).await;
    tracing::info!("All workers stopped");

    Ok(())
}

async fn add_track(
    config_path: Option<&Path>,
    file: PathBuf,
    title: String,
    artist: String,
    album: Option<String>,
) -> Result<()> {
    let ctx = AppContext::init(load_config(config_path))?;
    let svc = TranscodeService::new(ctx);

    let track = svc
        .register_track(&TrackUpload {
            user_id: None,
            title,
            artist,
            album,
            file_path: file,
        })
        .await?;

    println!("Registered track {}", track.id);
    println!("  title:    {}", track.title);
    println!("  artist:   {}", track.artist);
    if let Some(duration) = track.duration_secs {
        println!("  duration: {duration:.1}s");
    }
    Ok(())
}

fn submit(config_path: Option<&Path>, track: TrackId, quality: Quality) -> Result<()> {
    let ctx = AppContext::init(load_config(config_path))?;
    let svc = TranscodeService::new(ctx);

    let job_id = svc.submit(track, quality)?;
    println!("Queued job {job_id} ({quality})");
    Ok(())
}

fn status(config_path: Option<&Path>, job: JobId) -> Result<()> {
    let ctx = AppContext::init(load_config(config_path))?;
    let svc = TranscodeService::new(ctx);

    print_job(&svc.status(job)?);
    Ok(())
}

fn cancel(config_path: Option<&Path>, job: JobId) -> Result<()> {
    let ctx = AppContext::init(load_config(config_path))?;
    let svc = TranscodeService::new(ctx);

    svc.cancel(job)?;
    let snapshot = svc.status(job)?;
    if snapshot.status == JobStatus::Processing {
        println!("Cancel requested; the worker will stop at its next checkpoint");
    } else {
        println!("Job {job} cancelled");
    }
    Ok(())
}

fn jobs(config_path: Option<&Path>, status: Option<JobStatus>, limit: i64) -> Result<()> {
    let ctx = AppContext::init(load_config(config_path))?;
    let svc = TranscodeService::new(ctx);

    let jobs = svc.list_jobs(status, 0, limit)?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:>5.1}%  {}  {}",
            job.id, job.status, job.progress, job.quality, job.input_path
        );
    }
    Ok(())
}

fn tracks(config_path: Option<&Path>) -> Result<()> {
    let ctx = AppContext::init(load_config(config_path))?;
    let svc = TranscodeService::new(ctx);

    let tracks = svc.list_tracks(0, 100)?;
    if tracks.is_empty() {
        println!("No tracks");
        return Ok(());
    }
    for track in tracks {
        let duration = track
            .duration_secs
            .map(|d| format!("{d:.0}s"))
            .unwrap_or_else(|| "?".into());
        println!(
            "{}  {} - {} ({duration})",
            track.id, track.artist, track.title
        );
    }
    Ok(())
}

async fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let registry = ToolRegistry::discover(&config.tools);

    for info in registry.check_all().await {
        if info.available {
            println!(
                "{:<10} OK  {}  ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version"),
                info.path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            );
        } else {
            println!("{:<10} MISSING", info.name);
        }
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path);
    let warnings = config.validate();
    if warnings.is_empty() {
        println!("Configuration OK");
    } else {
        for warning in warnings {
            println!("warning: {warning}");
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Config {
    let config = Config::load_or_default(path);
    for warning in config.validate() {
        tracing::warn!("config: {warning}");
    }
    config
}

fn print_job(job: &af_db::models::TranscodeJob) {
    println!("Job {}", job.id);
    println!("  track:    {}", job.track_id);
    println!("  status:   {}", job.status);
    println!("  progress: {:.1}%", job.progress);
    println!("  quality:  {}", job.quality);
    println!("  input:    {}", job.input_path);
    if let Some(ref output) = job.output_path {
        println!("  output:   {output}");
    }
    if let Some(ref error) = job.error {
        println!("  error:    {error}");
    }
    if job.retry_count > 0 {
        println!("  retries:  {}/{}", job.retry_count, job.max_retries);
    }
    println!("  created:  {}", job.created_at);
    if let Some(ref completed) = job.completed_at {
        println!("  finished: {completed}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults based on the verbose
    // flag.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "audioforge=trace,af_core=trace,af_db=debug,af_encode=trace".to_string()
        } else {
            "audioforge=debug,af_core=info,af_db=info,af_encode=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(config_path))
        }
        Commands::AddTrack {
            file,
            title,
            artist,
            album,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(add_track(config_path, file, title, artist, album))
        }
        Commands::Submit { track, quality } => submit(config_path, track, quality),
        Commands::Status { job } => status(config_path, job),
        Commands::Cancel { job } => cancel(config_path, job),
        Commands::Jobs { status, limit } => jobs(config_path, status, limit),
        Commands::Tracks => tracks(config_path),
        Commands::CheckTools => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(config_path))
        }
        Commands::Validate { config } => {
            let path = config.or_else(|| cli.config.clone());
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("audioforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
