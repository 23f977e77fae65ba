//! Live stream controller
//!
//! Pulls frames from a network or device source, upscales them and hands
//! them to a presenter until the stream ends or the job is cancelled.

use super::CancelToken;
use crate::error::{Error, Result};
use crate::media::{MediaBackend, Presenter, VideoSource};
use crate::pipeline::FramePipeline;

/// Live job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Idle,
    Opened,
    Streaming,
    /// Source and display released
    Closed,
    /// Never got to streaming
    Failed,
}

/// How a live job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSummary {
    /// Frames shown
    pub frames: u64,
    /// Stopped by cancellation rather than end of stream
    pub cancelled: bool,
}

pub struct LiveStreamController<B: MediaBackend> {
    backend: B,
    pipeline: FramePipeline,
    cancel: CancelToken,
    state: LiveState,
}

impl<B: MediaBackend> LiveStreamController<B> {
    pub fn new(backend: B, pipeline: FramePipeline, cancel: CancelToken) -> Self {
        Self {
            backend,
            pipeline,
            cancel,
            state: LiveState::Idle,
        }
    }

    pub fn state(&self) -> LiveState {
        self.state
    }

    fn transition(&mut self, state: LiveState) {
        tracing::debug!("Live {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Stream `locator` to the presenter until end of stream or cancellation
    ///
    /// A frame that fails to process ends the stream; the source and the
    /// display are released either way.
    pub fn run(&mut self, locator: &str) -> Result<LiveSummary> {
        let mut source = match self.backend.open_source(locator, &self.cancel) {
            Ok(s) => s,
            Err(Error::Cancelled) => {
                self.transition(LiveState::Closed);
                tracing::info!("Live source {} cancelled while connecting", locator);
                return Ok(LiveSummary {
                    frames: 0,
                    cancelled: true,
                });
            }
            Err(e) => {
                self.transition(LiveState::Failed);
                tracing::error!("Cannot open live source {}: {}", locator, e);
                return Err(e);
            }
        };
        self.transition(LiveState::Opened);

        let info = source.info();
        let target = self.pipeline.output_resolution(info.resolution);
        let mut presenter = match self.backend.open_presenter(target, info.framerate) {
            Ok(p) => p,
            Err(e) => {
                self.transition(LiveState::Failed);
                return Err(e);
            }
        };

        tracing::info!(
            "Live upscaling {} {} -> {} (x{})",
            locator,
            info.resolution,
            target,
            self.pipeline.scale()
        );
        self.transition(LiveState::Streaming);

        let streamed = self.stream(&mut source, &mut presenter);

        drop(source);
        let closed = presenter.close();
        drop(presenter);
        self.transition(LiveState::Closed);

        let summary = streamed?;
        closed?;

        tracing::info!(
            "Live stream {} after {} frames",
            if summary.cancelled { "cancelled" } else { "ended" },
            summary.frames
        );
        Ok(summary)
    }

    fn stream(&mut self, source: &mut B::Source, presenter: &mut B::Presenter) -> Result<LiveSummary> {
        let mut frames = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(LiveSummary {
                    frames,
                    cancelled: true,
                });
            }

            // A source blocked on I/O returns Cancelled once the token fires
            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Ok(LiveSummary {
                        frames,
                        cancelled: false,
                    })
                }
                Err(Error::Cancelled) => {
                    return Ok(LiveSummary {
                        frames,
                        cancelled: true,
                    })
                }
                Err(e) => return Err(e),
            };

            let upscaled = self.pipeline.process(frame)?;
            presenter.present(&upscaled)?;
            frames += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelName;
    use crate::testutil::{fake_pipeline, rejecting_pipeline, FakeBackend};
    use crate::types::Resolution;

    #[test]
    fn test_unreachable_source_allocates_no_display() {
        let backend = FakeBackend::new(Resolution::new(32, 24), 10).unreachable();
        let log = backend.log();

        let mut controller =
            LiveStreamController::new(backend, fake_pipeline(ModelName::Espcn, 2, false), CancelToken::new());
        assert!(matches!(
            controller.run("rtsp://10.0.0.1/stream"),
            Err(Error::SourceOpen { .. })
        ));
        assert_eq!(controller.state(), LiveState::Failed);
        assert_eq!(log.lock().presenters_opened, 0);
    }

    #[test]
    fn test_runs_to_end_of_stream() {
        let backend = FakeBackend::new(Resolution::new(32, 24), 6);
        let log = backend.log();

        let mut controller =
            LiveStreamController::new(backend, fake_pipeline(ModelName::Espcn, 3, false), CancelToken::new());
        let summary = controller.run("udp://239.0.0.1:1234").unwrap();

        assert_eq!(summary, LiveSummary { frames: 6, cancelled: false });
        assert_eq!(controller.state(), LiveState::Closed);

        let log = log.lock();
        assert_eq!(log.presented, (0..6).collect::<Vec<_>>());
        assert_eq!(log.presenter_resolution, Some(Resolution::new(96, 72)));
        assert_eq!(log.presenters_closed, 1);
        assert_eq!(log.sources_closed, 1);
    }

    #[test]
    fn test_cancellation_within_one_frame() {
        let token = CancelToken::new();
        let backend = FakeBackend::endless(Resolution::new(16, 16)).cancel_at(3, token.clone());
        let log = backend.log();

        let mut controller =
            LiveStreamController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false), token);
        let summary = controller.run("/dev/video0").unwrap();

        // Frame 3 was already read when the signal arrived
        assert_eq!(summary, LiveSummary { frames: 4, cancelled: true });
        assert_eq!(controller.state(), LiveState::Closed);
        let log = log.lock();
        assert_eq!(log.presenters_closed, 1);
        assert_eq!(log.sources_closed, 1);
    }

    #[test]
    fn test_cancelled_before_first_frame() {
        let token = CancelToken::new();
        token.cancel();
        let backend = FakeBackend::endless(Resolution::new(16, 16));
        let log = backend.log();

        let mut controller =
            LiveStreamController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false), token);
        let summary = controller.run("/dev/video0").unwrap();

        assert_eq!(summary.frames, 0);
        assert!(log.lock().presented.is_empty());
        assert_eq!(controller.state(), LiveState::Closed);
    }

    #[test]
    fn test_bad_frame_closes_stream() {
        let backend = FakeBackend::endless(Resolution::new(16, 16));
        let log = backend.log();

        let mut controller = LiveStreamController::new(backend, rejecting_pipeline(), CancelToken::new());
        assert!(matches!(controller.run("/dev/video0"), Err(Error::Inference(_))));
        assert_eq!(controller.state(), LiveState::Closed);

        let log = log.lock();
        assert_eq!(log.presenters_closed, 1);
        assert_eq!(log.sources_closed, 1);
    }

    #[test]
    fn test_cancel_unblocks_stalled_read() {
        let token = CancelToken::new();
        let backend = FakeBackend::endless(Resolution::new(16, 16)).stall_after(2);
        let log = backend.log();

        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                token.cancel();
            })
        };

        let mut controller =
            LiveStreamController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false), token);
        let summary = controller.run("rtsp://camera.local/stream").unwrap();
        canceller.join().unwrap();

        assert_eq!(summary, LiveSummary { frames: 2, cancelled: true });
        assert_eq!(controller.state(), LiveState::Closed);
        let log = log.lock();
        assert_eq!(log.presenters_closed, 1);
        assert_eq!(log.sources_closed, 1);
    }

    #[test]
    fn test_cancel_during_connect() {
        let token = CancelToken::new();
        token.cancel();
        let backend = FakeBackend::new(Resolution::new(16, 16), 10).unreachable();
        let log = backend.log();

        let mut controller =
            LiveStreamController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false), token);
        let summary = controller.run("rtsp://10.0.0.1/stream").unwrap();

        assert_eq!(summary, LiveSummary { frames: 0, cancelled: true });
        assert_eq!(controller.state(), LiveState::Closed);
        assert_eq!(log.lock().presenters_opened, 0);
    }
}
