//! af-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for the other af-* crates,
//! providing type-safe identifiers, a unified error type, the transcode job
//! domain model, application configuration, and a broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use job::{JobEvent, JobStatus, Quality};
