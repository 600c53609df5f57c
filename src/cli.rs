use clap::{Parser, Subcommand};
use std::path::PathBuf;

use af_core::{JobId, JobStatus, Quality, TrackId};

#[derive(Parser)]
#[command(name = "audioforge")]
#[command(author, version, about = "Audio transcoding service for a streaming platform")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the transcode worker pool until interrupted
    Serve,

    /// Register an uploaded audio file as a track
    AddTrack {
        /// Audio file to register
        #[arg(required = true)]
        file: PathBuf,

        /// Track title
        #[arg(long)]
        title: String,

        /// Track artist
        #[arg(long)]
        artist: String,

        /// Album name
        #[arg(long)]
        album: Option<String>,
    },

    /// Queue a transcode job for a track
    Submit {
        /// Track to transcode
        #[arg(long)]
        track: TrackId,

        /// Target quality (low, medium, high)
        #[arg(long, default_value = "medium")]
        quality: Quality,
    },

    /// Show a job snapshot
    Status {
        /// Job to inspect
        #[arg(required = true)]
        job: JobId,
    },

    /// Cancel a job
    Cancel {
        /// Job to cancel
        #[arg(required = true)]
        job: JobId,
    },

    /// List jobs
    Jobs {
        /// Filter by status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<JobStatus>,

        /// Maximum number of jobs to show
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// List registered tracks
    Tracks,

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
