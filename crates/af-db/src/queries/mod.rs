//! Query modules, one per entity.

pub mod tracks;
pub mod transcode_jobs;
pub mod users;
