//! RetroHD: AI upscaling and colorization for archival video
//!
//! Runs every decoded frame through a learned super-resolution model (and
//! optionally a colorization model), re-encodes the result and reattaches
//! the original audio. Live network or device streams can be upscaled and
//! shown on a display device in real time.
//!
//! # Features
//!
//! - **Models**: FSRCNN, EDSR, LapSRN and ESPCN at x2-x4, fetched on demand
//!   into a shared on-disk cache
//! - **Inference**: tract (ONNX and TensorFlow graphs), CPU only
//! - **Media**: FFmpeg decode/encode, stream-copy audio remux, output devices
//!
//! # Example
//!
//! ```rust,no_run
//! use retrohd::{Config, FfmpegBackend, FramePipeline, ModelRegistry, TranscodeController};
//! use std::path::Path;
//!
//! fn main() -> retrohd::Result<()> {
//!     let config = Config::default();
//!     let registry = ModelRegistry::from_config(&config.models)?;
//!     let pipeline = FramePipeline::load(config.file_pipeline()?, &registry)?;
//!
//!     let backend = FfmpegBackend::new(config.encoder, config.display);
//!     let mut job = TranscodeController::new(backend, pipeline);
//!     job.run(Path::new("old_film.avi"), Path::new("old_film_hd.mp4"))?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod models;
pub mod pipeline;
pub mod processing;
pub mod types;

#[cfg(test)]
mod testutil;

// Re-exports for convenience
pub use config::{Config, PipelineConfig};
pub use controller::{CancelToken, LiveStreamController, LiveSummary, TranscodeController};
pub use error::{Error, Result};
pub use media::{FfmpegBackend, MediaBackend};
pub use models::{ModelName, ModelRegistry};
pub use pipeline::FramePipeline;
pub use types::{Frame, Progress, Resolution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
