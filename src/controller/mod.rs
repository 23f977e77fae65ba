//! Job controllers
//!
//! Drive a [`FramePipeline`](crate::pipeline::FramePipeline) between a media
//! source and a sink (file jobs) or a presenter (live jobs). Both are
//! single-threaded: each frame is read, processed and written before the
//! next is read.

mod live;
mod transcode;

pub use live::{LiveState, LiveStreamController, LiveSummary};
pub use transcode::{silent_path_for, TranscodeController, TranscodeState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag, checked by controllers at every frame boundary
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The shared flag, for code that polls it outside Rust
    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}
