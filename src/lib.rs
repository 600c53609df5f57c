//! audioforge: transcoding core for an audio streaming platform.
//!
//! The library surface is the [`service::TranscodeService`] facade
//! (submit/status/cancel) and the [`worker`] pool that drains the job
//! queue. Persistence lives in `af-db`, encoding in `af-encode`, and the
//! shared domain model in `af-core`.

pub mod context;
pub mod service;
pub mod worker;
