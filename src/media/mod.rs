//! Media I/O
//!
//! Controllers only see the traits in this module. [`FfmpegBackend`] is the
//! production implementation on top of ffmpeg-next.

#[cfg(test)]
mod fixtures;
mod present;
mod remux;
mod sink;
mod source;

pub use present::DevicePresenter;
pub use remux::remux_audio;
pub use sink::FfmpegSink;
pub use source::FfmpegSource;

use crate::config::{DisplayConfig, EncoderConfig};
use crate::controller::CancelToken;
use crate::error::{Error, Result};
use crate::types::{Frame, Framerate, Resolution, SourceInfo};

use ffmpeg_next as ffmpeg;
use std::path::Path;
use std::sync::Once;

/// Sequential frame reader
pub trait VideoSource {
    /// Properties read when the source was opened
    fn info(&self) -> SourceInfo;

    /// Next frame in stream order, `None` at end of stream
    fn read_frame(&mut self) -> Result<Option<Frame>>;
}

/// Encoder for the silent upscaled video
pub trait VideoSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the container; the file is complete afterwards
    fn finish(&mut self) -> Result<()>;
}

/// Live display target
pub trait Presenter {
    fn present(&mut self, frame: &Frame) -> Result<()>;

    /// Release the display
    fn close(&mut self) -> Result<()>;
}

/// What the audio remux step produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxOutcome {
    /// Output written with the original audio track attached
    Merged,
    /// Original has no audio; nothing was written
    VideoOnly,
}

/// Factory for every media resource a job needs
pub trait MediaBackend {
    type Source: VideoSource;
    type Sink: VideoSink;
    type Presenter: Presenter;

    /// Open a file path or network/device locator
    ///
    /// Blocking I/O inside the source gives up once `cancel` is triggered and
    /// reports [`Error::Cancelled`].
    fn open_source(&self, locator: &str, cancel: &CancelToken) -> Result<Self::Source>;

    /// Create the silent video at `path`
    fn open_sink(&self, path: &Path, resolution: Resolution, framerate: Framerate) -> Result<Self::Sink>;

    /// Attach the audio of `original` to `silent`, writing `output`
    fn remux_audio(&self, silent: &Path, original: &Path, output: &Path) -> Result<RemuxOutcome>;

    /// Allocate a display for frames of the given size
    fn open_presenter(&self, resolution: Resolution, framerate: Framerate) -> Result<Self::Presenter>;
}

/// Initialize FFmpeg, including network protocols and output devices
pub fn init() -> Result<()> {
    static REGISTER: Once = Once::new();

    ffmpeg::init().map_err(|e| Error::FFmpeg(e.to_string()))?;
    REGISTER.call_once(|| {
        ffmpeg::format::network::init();
        ffmpeg::device::register_all();
        ffmpeg::log::set_level(ffmpeg::log::Level::Error);
    });
    Ok(())
}

/// Is an encoder with this name compiled into the linked FFmpeg?
pub fn encoder_available(name: &str) -> bool {
    init().is_ok() && ffmpeg::encoder::find_by_name(name).is_some()
}

/// Is an output device with this name available?
pub fn output_device_available(name: &str) -> bool {
    init().is_ok() && ffmpeg::device::output::video().any(|f| f.name() == name)
}

/// ffmpeg-next backed media
#[derive(Debug, Clone, Default)]
pub struct FfmpegBackend {
    encoder: EncoderConfig,
    display: DisplayConfig,
}

impl FfmpegBackend {
    pub fn new(encoder: EncoderConfig, display: DisplayConfig) -> Self {
        Self { encoder, display }
    }
}

impl MediaBackend for FfmpegBackend {
    type Source = FfmpegSource;
    type Sink = FfmpegSink;
    type Presenter = DevicePresenter;

    fn open_source(&self, locator: &str, cancel: &CancelToken) -> Result<FfmpegSource> {
        FfmpegSource::open(locator, cancel)
    }

    fn open_sink(&self, path: &Path, resolution: Resolution, framerate: Framerate) -> Result<FfmpegSink> {
        FfmpegSink::create(path, resolution, framerate, &self.encoder)
    }

    fn remux_audio(&self, silent: &Path, original: &Path, output: &Path) -> Result<RemuxOutcome> {
        remux_audio(silent, original, output)
    }

    fn open_presenter(&self, resolution: Resolution, framerate: Framerate) -> Result<DevicePresenter> {
        DevicePresenter::open(&self.display, resolution, framerate)
    }
}

/// Copy tightly packed rows into a (possibly padded) FFmpeg plane
pub(crate) fn copy_rows_in(src: &[u8], row_bytes: usize, plane: &mut [u8], stride: usize) {
    for (y, row) in src.chunks_exact(row_bytes).enumerate() {
        let start = y * stride;
        if start + row_bytes <= plane.len() {
            plane[start..start + row_bytes].copy_from_slice(row);
        }
    }
}

/// Copy a (possibly padded) FFmpeg plane into tightly packed rows
pub(crate) fn copy_rows_out(plane: &[u8], stride: usize, row_bytes: usize, rows: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row_bytes * rows);
    for y in 0..rows {
        let start = y * stride;
        out.extend_from_slice(&plane[start..start + row_bytes]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_copy_with_padding() {
        let packed = vec![1, 2, 3, 4, 5, 6];
        let mut plane = vec![0u8; 8];
        copy_rows_in(&packed, 3, &mut plane, 4);
        assert_eq!(plane, vec![1, 2, 3, 0, 4, 5, 6, 0]);
        assert_eq!(copy_rows_out(&plane, 4, 3, 2), packed);
    }
}
