//! Shared application context handed to the service facade and the workers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use af_core::config::Config;
use af_core::events::EventBus;
use af_core::{JobId, Result};
use af_db::pool::{self, DbPool};
use af_encode::{Encoder, FfmpegEncoder, ToolRegistry};

/// Everything a worker or service call needs: database pool, configuration,
/// event bus, encoder, and the registry of live per-job cancellation tokens.
#[derive(Clone)]
pub struct AppContext {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub event_bus: Arc<EventBus>,
    pub tools: Arc<ToolRegistry>,
    pub encoder: Arc<dyn Encoder>,
    /// Cancellation tokens for jobs currently being processed *by this
    /// process*. Cancels from other processes travel through the job row's
    /// `cancel_requested` flag instead.
    pub cancellations: Arc<DashMap<JobId, CancellationToken>>,
}

impl AppContext {
    /// Build a production context: file-backed pool, discovered tools, and
    /// the ffmpeg encoder.
    pub fn init(config: Config) -> Result<Self> {
        let db = pool::init_pool(&config.storage.db_path.to_string_lossy())?;
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        let encoder = Arc::new(FfmpegEncoder::new((*tools).clone()));

        Ok(Self {
            db,
            config: Arc::new(config),
            event_bus: Arc::new(EventBus::default()),
            tools,
            encoder,
            cancellations: Arc::new(DashMap::new()),
        })
    }
}
