//! af-encode: external tool execution for audio transcoding.
//!
//! Provides discovery of ffmpeg/ffprobe, a command builder with timeout and
//! cancellation support, duration probing, and the [`Encoder`] trait with
//! its ffmpeg-backed implementation.

pub mod command;
pub mod encoder;
pub mod probe;
pub mod tools;

pub use command::{ToolCommand, ToolOutput};
pub use encoder::{EncodeRequest, Encoder, FfmpegEncoder};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
