//! Error types for RetroHD

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for RetroHD operations
pub type Result<T> = std::result::Result<T, Error>;

/// RetroHD error type
#[derive(Error, Debug)]
pub enum Error {
    // Model errors
    #[error("Unknown model: {name} x{scale}")]
    UnknownModel { name: String, scale: u32 },

    #[error("Model acquisition failed: {0}")]
    ModelAcquisition(String),

    #[error("Inference error: {0}")]
    Inference(String),

    // Source errors
    #[error("Failed to open source {locator}: {reason}")]
    SourceOpen { locator: String, reason: String },

    #[error("Decoding failed: {0}")]
    Decode(String),

    // Output errors
    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Audio merge failed (silent video kept at {}): {reason}", silent_path.display())]
    AudioMerge { silent_path: PathBuf, reason: String },

    #[error("Presentation error: {0}")]
    Presentation(String),

    // FFmpeg errors
    #[error("FFmpeg error: {0}")]
    FFmpeg(String),

    // Job errors
    #[error("Job cancelled")]
    Cancelled,

    // General errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable
    ///
    /// Only a failed audio merge is: the silent upscaled video is complete.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::AudioMerge { .. })
    }

    /// Usable artifact left on disk despite the error
    pub fn usable_artifact(&self) -> Option<&Path> {
        match self {
            Error::AudioMerge { silent_path, .. } => Some(silent_path),
            _ => None,
        }
    }

    /// Check if this error happened before any frame was processed
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Error::UnknownModel { .. }
                | Error::ModelAcquisition(_)
                | Error::SourceOpen { .. }
                | Error::Config(_)
        )
    }
}
