//! File transcoding controller
//!
//! Decodes a file, runs every frame through the pipeline, encodes a silent
//! upscaled video next to the requested output, then reattaches the
//! original audio track.

use super::CancelToken;
use crate::error::{Error, Result};
use crate::media::{MediaBackend, RemuxOutcome, VideoSink, VideoSource};
use crate::pipeline::FramePipeline;
use crate::types::Progress;

use crossbeam_channel::Sender;
use std::path::{Path, PathBuf};

/// File job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeState {
    Idle,
    /// Source and sink are open
    Opened,
    /// Frames are flowing
    Streaming,
    /// Silent video is complete on disk
    SilentDone,
    /// Original audio attached to the output
    AudioMerged,
    /// Source had no audio; the silent video became the output
    AudioFallback,
    Done,
    Failed,
}

/// Where the silent video for `output` is written: `<stem>.silent.<ext>`
/// in the output's directory
pub fn silent_path_for(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mp4".into());
    output.with_file_name(format!("{}.silent.{}", stem, ext))
}

/// Runs one file job
pub struct TranscodeController<B: MediaBackend> {
    backend: B,
    pipeline: FramePipeline,
    progress: Option<Sender<Progress>>,
    cancel: CancelToken,
    state: TranscodeState,
    frames_written: u64,
}

impl<B: MediaBackend> TranscodeController<B> {
    pub fn new(backend: B, pipeline: FramePipeline) -> Self {
        Self {
            backend,
            pipeline,
            progress: None,
            cancel: CancelToken::new(),
            state: TranscodeState::Idle,
            frames_written: 0,
        }
    }

    /// Push progress to `sender` after every written frame
    pub fn with_progress(mut self, sender: Sender<Progress>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> TranscodeState {
        self.state
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn transition(&mut self, state: TranscodeState) {
        tracing::debug!("Transcode {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Transcode `source` into `output`, returning the final output path
    ///
    /// An [`Error::AudioMerge`] leaves the complete silent video on disk;
    /// its path is available through [`Error::usable_artifact`].
    pub fn run(&mut self, source: &Path, output: &Path) -> Result<PathBuf> {
        if self.state != TranscodeState::Idle {
            return Err(Error::Config("Controller already ran a job".into()));
        }
        if source == output {
            return Err(Error::Config(format!(
                "Output {} would overwrite the source",
                output.display()
            )));
        }

        let result = self.execute(source, output);
        match &result {
            Ok(path) => {
                self.transition(TranscodeState::Done);
                tracing::info!("Finished {} ({} frames)", path.display(), self.frames_written);
            }
            Err(e) if e.is_recoverable() => {
                self.transition(TranscodeState::Failed);
                tracing::warn!("{}", e);
            }
            Err(e) => {
                self.transition(TranscodeState::Failed);
                tracing::error!("Transcode of {} failed: {}", source.display(), e);
            }
        }
        result
    }

    fn execute(&mut self, source: &Path, output: &Path) -> Result<PathBuf> {
        let silent = silent_path_for(output);

        let mut src = self.backend.open_source(&source.to_string_lossy(), &self.cancel)?;
        let info = src.info();
        let target = self.pipeline.output_resolution(info.resolution);
        let mut sink = match self.backend.open_sink(&silent, target, info.framerate) {
            Ok(sink) => sink,
            Err(e) => {
                // The container may already exist when the encoder refuses to open
                discard(&silent);
                return Err(e);
            }
        };
        self.transition(TranscodeState::Opened);

        tracing::info!(
            "Upscaling {} {} -> {} (x{})",
            source.display(),
            info.resolution,
            target,
            self.pipeline.scale()
        );

        self.transition(TranscodeState::Streaming);
        let streamed = self.stream(&mut src, &mut sink, info.total_frames);

        // Source and sink are closed before the remux on every path
        drop(src);
        let finished = streamed.and_then(|_| sink.finish());
        drop(sink);

        if let Err(e) = finished {
            discard(&silent);
            return Err(e);
        }
        self.transition(TranscodeState::SilentDone);

        let outcome = self
            .backend
            .remux_audio(&silent, source, output)
            .map_err(|e| Error::AudioMerge {
                silent_path: silent.clone(),
                reason: e.to_string(),
            })?;

        match outcome {
            RemuxOutcome::Merged => {
                discard(&silent);
                self.transition(TranscodeState::AudioMerged);
            }
            RemuxOutcome::VideoOnly => {
                std::fs::rename(&silent, output).map_err(|e| Error::AudioMerge {
                    silent_path: silent.clone(),
                    reason: format!("Failed to move into place: {}", e),
                })?;
                self.transition(TranscodeState::AudioFallback);
            }
        }

        Ok(output.to_path_buf())
    }

    fn stream(&mut self, src: &mut B::Source, sink: &mut B::Sink, total: Option<u64>) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Transcode cancelled after {} frames", self.frames_written);
                return Err(Error::Cancelled);
            }

            let Some(frame) = src.read_frame()? else {
                return Ok(());
            };
            let upscaled = self.pipeline.process(frame)?;
            sink.write_frame(&upscaled)?;
            self.frames_written += 1;

            if self.frames_written % 100 == 0 {
                tracing::debug!("{} frames written", self.frames_written);
            }
            if let Some(tx) = &self.progress {
                // A caller that stopped listening does not stop the job
                let _ = tx.send(Progress {
                    completed: self.frames_written,
                    total,
                });
            }
        }
    }
}

/// Remove an intermediate file, logging rather than failing
fn discard(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelName;
    use crate::testutil::{fake_pipeline, rejecting_pipeline, FakeBackend};
    use crate::types::Resolution;

    fn paths(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        (dir.path().join("input.avi"), dir.path().join("out.mp4"))
    }

    #[test]
    fn test_silent_path_next_to_output() {
        assert_eq!(
            silent_path_for(Path::new("/tmp/job/film.mkv")),
            PathBuf::from("/tmp/job/film.silent.mkv")
        );
        assert_eq!(
            silent_path_for(Path::new("film")),
            PathBuf::from("film.silent.mp4")
        );
    }

    #[test]
    fn test_silent_source_becomes_output() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(64, 48), 10);
        let log = backend.log();

        let mut controller = TranscodeController::new(backend, fake_pipeline(ModelName::Fsrcnn, 4, false));
        let result = controller.run(&src, &out).unwrap();

        assert_eq!(result, out);
        assert_eq!(controller.state(), TranscodeState::Done);
        assert_eq!(controller.frames_written(), 10);
        assert!(out.exists());
        assert!(!silent_path_for(&out).exists());

        let log = log.lock();
        assert_eq!(log.written.len(), 10);
        assert!(log.written.iter().all(|f| f.resolution() == Resolution::new(256, 192)));
        assert_eq!(log.sink_resolution, Some(Resolution::new(256, 192)));
        assert_eq!(log.remux_outcomes, vec![RemuxOutcome::VideoOnly]);
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_finished, 1);
    }

    #[test]
    fn test_audio_reattached() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(64, 48), 10).with_audio();
        let log = backend.log();

        let mut controller = TranscodeController::new(backend, fake_pipeline(ModelName::Fsrcnn, 4, false));
        controller.run(&src, &out).unwrap();

        assert_eq!(controller.state(), TranscodeState::Done);
        assert_eq!(std::fs::read(&out).unwrap(), b"merged");
        assert!(!silent_path_for(&out).exists());
        assert_eq!(log.lock().remux_outcomes, vec![RemuxOutcome::Merged]);
    }

    #[test]
    fn test_frame_order_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(8, 8), 25);
        let log = backend.log();

        TranscodeController::new(backend, fake_pipeline(ModelName::Espcn, 2, false))
            .run(&src, &out)
            .unwrap();

        let indices: Vec<u64> = log.lock().written.iter().map(|f| f.index).collect();
        assert_eq!(indices, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_progress_reported_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let (tx, rx) = crossbeam_channel::unbounded();

        TranscodeController::new(
            FakeBackend::new(Resolution::new(16, 16), 4),
            fake_pipeline(ModelName::Fsrcnn, 2, false),
        )
        .with_progress(tx)
        .run(&src, &out)
        .unwrap();

        let updates: Vec<Progress> = rx.try_iter().collect();
        assert_eq!(updates.len(), 4);
        assert_eq!(updates[3].completed, 4);
        assert_eq!(updates[3].total, Some(4));
        assert!(updates.windows(2).all(|w| w[0].completed < w[1].completed));
    }

    #[test]
    fn test_failed_remux_keeps_silent_video() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(16, 16), 3)
            .with_audio()
            .with_failing_remux();

        let mut controller = TranscodeController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false));
        let err = controller.run(&src, &out).unwrap_err();

        assert!(err.is_recoverable());
        let silent = silent_path_for(&out);
        assert_eq!(err.usable_artifact(), Some(silent.as_path()));
        assert!(silent.exists());
        assert!(!out.exists());
        assert_eq!(controller.state(), TranscodeState::Failed);
    }

    #[test]
    fn test_unopenable_source() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(16, 16), 3).unreachable();
        let log = backend.log();

        let mut controller = TranscodeController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false));
        assert!(matches!(controller.run(&src, &out), Err(Error::SourceOpen { .. })));
        assert_eq!(controller.state(), TranscodeState::Failed);
        assert_eq!(log.lock().sink_resolution, None);
        assert!(!silent_path_for(&out).exists());
    }

    #[test]
    fn test_inference_failure_aborts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(16, 16), 5);
        let log = backend.log();

        let mut controller = TranscodeController::new(backend, rejecting_pipeline());
        assert!(matches!(controller.run(&src, &out), Err(Error::Inference(_))));

        let log = log.lock();
        assert!(log.written.is_empty());
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
        assert!(log.remux_outcomes.is_empty());
        assert!(!silent_path_for(&out).exists());
    }

    #[test]
    fn test_cancel_mid_job() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let token = CancelToken::new();
        let backend = FakeBackend::new(Resolution::new(16, 16), 50).cancel_at(3, token.clone());
        let log = backend.log();

        let mut controller = TranscodeController::new(backend, fake_pipeline(ModelName::Fsrcnn, 2, false))
            .with_cancel(token);
        assert!(matches!(controller.run(&src, &out), Err(Error::Cancelled)));

        assert_eq!(controller.frames_written(), 4);
        assert!(!silent_path_for(&out).exists());
        assert!(!out.exists());
        let log = log.lock();
        assert_eq!(log.sources_closed, 1);
        assert_eq!(log.sinks_closed, 1);
    }

    #[test]
    fn test_output_must_differ_from_source() {
        let dir = tempfile::tempdir().unwrap();
        let (src, _) = paths(&dir);
        let mut controller = TranscodeController::new(
            FakeBackend::new(Resolution::new(16, 16), 1),
            fake_pipeline(ModelName::Fsrcnn, 2, false),
        );
        assert!(matches!(controller.run(&src, &src), Err(Error::Config(_))));
    }

    #[test]
    fn test_sink_failure_leaves_no_silent_file() {
        let dir = tempfile::tempdir().unwrap();
        let (src, out) = paths(&dir);
        let backend = FakeBackend::new(Resolution::new(25, 15), 3).with_failing_sink();
        let log = backend.log();

        let mut controller = TranscodeController::new(backend, fake_pipeline(ModelName::Espcn, 3, false));
        assert!(matches!(controller.run(&src, &out), Err(Error::Encode(_))));
        assert_eq!(controller.state(), TranscodeState::Failed);

        assert!(!silent_path_for(&out).exists());
        assert!(!out.exists());
        assert_eq!(log.lock().sources_closed, 1);
    }
}
