//! In-memory capabilities and media used by unit tests

use crate::config::PipelineConfig;
use crate::controller::CancelToken;
use crate::error::{Error, Result};
use crate::media::{MediaBackend, Presenter, RemuxOutcome, VideoSink, VideoSource};
use crate::models::{Capability, FeatureMap, ModelName};
use crate::pipeline::{ColorizationStage, FramePipeline, SuperResolutionStage};
use crate::types::{ColorSpace, Frame, Framerate, Resolution, SourceInfo};

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Nearest-neighbour enlargement by a fixed factor, any channel count
pub struct NearestUpscale {
    scale: usize,
}

impl NearestUpscale {
    pub fn new(scale: u32) -> Self {
        Self {
            scale: scale as usize,
        }
    }
}

impl Capability for NearestUpscale {
    fn infer(&self, input: &FeatureMap) -> Result<FeatureMap> {
        let (h, w, c) = input.shape();
        let (oh, ow) = (h * self.scale, w * self.scale);
        let mut data = Vec::with_capacity(oh * ow * c);
        for y in 0..oh {
            for x in 0..ow {
                let src = ((y / self.scale) * w + x / self.scale) * c;
                data.extend_from_slice(&input.data[src..src + c]);
            }
        }
        FeatureMap::new(oh, ow, c, data)
    }

    fn label(&self) -> &str {
        "nearest"
    }
}

/// Fails every inference
pub struct RejectingCapability;

impl Capability for RejectingCapability {
    fn infer(&self, input: &FeatureMap) -> Result<FeatureMap> {
        Err(Error::Inference(format!("rejected input {:?}", input.shape())))
    }

    fn label(&self) -> &str {
        "rejecting"
    }
}

/// Predicts the same a/b everywhere and remembers what it was given
pub struct ConstantChroma {
    a: f32,
    b: f32,
    channels: usize,
    last: Mutex<Option<FeatureMap>>,
}

impl ConstantChroma {
    pub fn new(a: f32, b: f32) -> Self {
        Self {
            a,
            b,
            channels: 2,
            last: Mutex::new(None),
        }
    }

    /// Emit a different channel count (to provoke shape errors)
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn last_input(&self) -> Option<FeatureMap> {
        self.last.lock().clone()
    }
}

impl Capability for ConstantChroma {
    fn infer(&self, input: &FeatureMap) -> Result<FeatureMap> {
        *self.last.lock() = Some(input.clone());
        let pattern = [self.a, self.b, 0.0];
        let data = (0..input.height * input.width * self.channels)
            .map(|i| pattern[(i % self.channels).min(2)])
            .collect();
        FeatureMap::new(input.height, input.width, self.channels, data)
    }

    fn label(&self) -> &str {
        "constant-chroma"
    }
}

/// Pipeline over fake capabilities
pub fn fake_pipeline(model: ModelName, scale: u32, colorize: bool) -> FramePipeline {
    let config = PipelineConfig::new(model, scale, colorize).unwrap();
    let colorizer = colorize.then(|| ColorizationStage::new(Box::new(ConstantChroma::new(20.0, 20.0))));
    let upscaler = SuperResolutionStage::new(Box::new(NearestUpscale::new(scale)), model, scale);
    FramePipeline::from_stages(config, colorizer, upscaler).unwrap()
}

/// Pipeline whose upscaler rejects every frame
pub fn rejecting_pipeline() -> FramePipeline {
    let config = PipelineConfig::new(ModelName::Fsrcnn, 2, false).unwrap();
    let upscaler = SuperResolutionStage::new(Box::new(RejectingCapability), ModelName::Fsrcnn, 2);
    FramePipeline::from_stages(config, None, upscaler).unwrap()
}

/// Everything the fake media saw
#[derive(Debug, Default)]
pub struct MediaLog {
    pub sources_opened: Vec<String>,
    pub sources_closed: usize,
    pub sink_resolution: Option<Resolution>,
    pub written: Vec<Frame>,
    pub sinks_finished: usize,
    pub sinks_closed: usize,
    pub remux_outcomes: Vec<RemuxOutcome>,
    pub presenter_resolution: Option<Resolution>,
    pub presenters_opened: usize,
    pub presented: Vec<u64>,
    pub presenters_closed: usize,
}

/// Media backend producing synthetic frames and recording all activity
pub struct FakeBackend {
    resolution: Resolution,
    frames: Option<u64>,
    has_audio: bool,
    remux_fails: bool,
    unreachable: bool,
    stall_after: Option<u64>,
    sink_fails: bool,
    cancel_at: Option<(u64, CancelToken)>,
    log: Arc<Mutex<MediaLog>>,
}

impl FakeBackend {
    /// Finite source of `frames` frames
    pub fn new(resolution: Resolution, frames: u64) -> Self {
        Self {
            resolution,
            frames: Some(frames),
            has_audio: false,
            remux_fails: false,
            unreachable: false,
            stall_after: None,
            sink_fails: false,
            cancel_at: None,
            log: Arc::new(Mutex::new(MediaLog::default())),
        }
    }

    /// Source that never ends
    pub fn endless(resolution: Resolution) -> Self {
        Self {
            frames: None,
            ..Self::new(resolution, 0)
        }
    }

    pub fn with_audio(mut self) -> Self {
        self.has_audio = true;
        self
    }

    pub fn with_failing_remux(mut self) -> Self {
        self.remux_fails = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// After `frames` frames, block in `read_frame` until the job's token is
    /// cancelled, like a network read that never returns
    pub fn stall_after(mut self, frames: u64) -> Self {
        self.stall_after = Some(frames);
        self
    }

    /// Sink creates its file, then fails to open the encoder
    pub fn with_failing_sink(mut self) -> Self {
        self.sink_fails = true;
        self
    }

    /// Trigger `token` while frame `index` is being read
    pub fn cancel_at(mut self, index: u64, token: CancelToken) -> Self {
        self.cancel_at = Some((index, token));
        self
    }

    pub fn log(&self) -> Arc<Mutex<MediaLog>> {
        self.log.clone()
    }
}

pub struct FakeSource {
    info: SourceInfo,
    next: u64,
    stall_after: Option<u64>,
    job_cancel: CancelToken,
    cancel_at: Option<(u64, CancelToken)>,
    log: Arc<Mutex<MediaLog>>,
}

impl VideoSource for FakeSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if self.info.total_frames.is_some_and(|total| self.next >= total) {
            return Ok(None);
        }
        if self.stall_after.is_some_and(|n| self.next >= n) {
            while !self.job_cancel.is_cancelled() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            return Err(Error::Cancelled);
        }
        if let Some((at, token)) = &self.cancel_at {
            if *at == self.next {
                token.cancel();
            }
        }

        let res = self.info.resolution;
        let value = (self.next % 256) as u8;
        let data = vec![value; res.pixels() as usize * 3];
        let frame = Frame::from_data(data, res.width, res.height, ColorSpace::Bgr).with_index(self.next);
        self.next += 1;
        Ok(Some(frame))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.log.lock().sources_closed += 1;
    }
}

pub struct FakeSink {
    path: PathBuf,
    log: Arc<Mutex<MediaLog>>,
}

impl VideoSink for FakeSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&frame.index.to_le_bytes())?;
        self.log.lock().written.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.log.lock().sinks_finished += 1;
        Ok(())
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.log.lock().sinks_closed += 1;
    }
}

pub struct FakePresenter {
    log: Arc<Mutex<MediaLog>>,
}

impl Presenter for FakePresenter {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.log.lock().presented.push(frame.index);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().presenters_closed += 1;
        Ok(())
    }
}

impl MediaBackend for FakeBackend {
    type Source = FakeSource;
    type Sink = FakeSink;
    type Presenter = FakePresenter;

    fn open_source(&self, locator: &str, cancel: &CancelToken) -> Result<FakeSource> {
        if self.unreachable {
            // An interrupted connect attempt
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            return Err(Error::SourceOpen {
                locator: locator.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.log.lock().sources_opened.push(locator.to_string());
        Ok(FakeSource {
            info: SourceInfo {
                resolution: self.resolution,
                framerate: Framerate::FPS_25,
                total_frames: self.frames,
            },
            next: 0,
            stall_after: self.stall_after,
            job_cancel: cancel.clone(),
            cancel_at: self.cancel_at.clone(),
            log: self.log.clone(),
        })
    }

    fn open_sink(&self, path: &Path, resolution: Resolution, _framerate: Framerate) -> Result<FakeSink> {
        std::fs::write(path, b"")?;
        if self.sink_fails {
            return Err(Error::Encode("width not divisible by 2".into()));
        }
        self.log.lock().sink_resolution = Some(resolution);
        Ok(FakeSink {
            path: path.to_path_buf(),
            log: self.log.clone(),
        })
    }

    fn remux_audio(&self, silent: &Path, _original: &Path, output: &Path) -> Result<RemuxOutcome> {
        if self.remux_fails {
            return Err(Error::FFmpeg("audio codec not supported by container".into()));
        }
        assert!(silent.exists(), "remux called before the silent video exists");
        let outcome = if self.has_audio {
            std::fs::write(output, b"merged")?;
            RemuxOutcome::Merged
        } else {
            RemuxOutcome::VideoOnly
        };
        self.log.lock().remux_outcomes.push(outcome);
        Ok(outcome)
    }

    fn open_presenter(&self, resolution: Resolution, _framerate: Framerate) -> Result<FakePresenter> {
        let mut log = self.log.lock();
        log.presenters_opened += 1;
        log.presenter_resolution = Some(resolution);
        Ok(FakePresenter {
            log: self.log.clone(),
        })
    }
}
