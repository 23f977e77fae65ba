//! Live presentation through an FFmpeg output device
//!
//! Frames are written as rawvideo BGR24 packets to a device such as `sdl`
//! (a window titled after the configured target) or `fbdev`/`v4l2`.

use super::{init, Presenter};
use crate::config::DisplayConfig;
use crate::error::{Error, Result};
use crate::types::{Frame, Framerate, Resolution};

use ffmpeg_next as ffmpeg;
use std::ffi::CString;

/// Presenter backed by a libavdevice output
pub struct DevicePresenter {
    output: ffmpeg::format::context::Output,
    resolution: Resolution,
    time_base: ffmpeg::Rational,
    stream_index: usize,
    next_pts: i64,
    closed: bool,
}

fn presentation_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Presentation(format!("{}: {}", context, e))
}

/// Allocate an output context for a device that does its own I/O
fn open_device(device: &str, target: &str) -> Result<ffmpeg::format::context::Output> {
    let format = CString::new(device).map_err(|e| presentation_error("Invalid device name", e))?;
    let target = CString::new(target).map_err(|e| presentation_error("Invalid device target", e))?;

    let output = unsafe {
        let mut ctx = std::ptr::null_mut();
        let ret = ffmpeg::ffi::avformat_alloc_output_context2(
            &mut ctx,
            std::ptr::null(),
            format.as_ptr(),
            target.as_ptr(),
        );
        if ret < 0 || ctx.is_null() {
            return Err(presentation_error(
                &format!("Failed to open {} device", device),
                ffmpeg::Error::from(ret),
            ));
        }
        ffmpeg::format::context::Output::wrap(ctx)
    };

    if !output
        .format()
        .flags()
        .contains(ffmpeg::format::flag::Flags::NO_FILE)
    {
        return Err(Error::Presentation(format!(
            "{} is a file format, not a display device",
            device
        )));
    }

    Ok(output)
}

impl DevicePresenter {
    pub fn open(display: &DisplayConfig, resolution: Resolution, framerate: Framerate) -> Result<Self> {
        init()?;

        let mut output = open_device(&display.device, &display.target)?;

        let time_base = if framerate.is_valid() {
            ffmpeg::Rational::new(framerate.den as i32, framerate.num as i32)
        } else {
            ffmpeg::Rational::new(1, 25)
        };

        let stream_index = {
            let mut stream = output
                .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::RAWVIDEO))
                .map_err(|e| presentation_error("Failed to add stream", e))?;

            unsafe {
                let params = stream.parameters().as_mut_ptr();
                (*params).codec_type = ffmpeg::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                (*params).codec_id = ffmpeg::ffi::AVCodecID::AV_CODEC_ID_RAWVIDEO;
                (*params).width = resolution.width as i32;
                (*params).height = resolution.height as i32;
                (*params).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_BGR24 as i32;
            }
            stream.set_time_base(time_base);
            stream.index()
        };

        output
            .write_header()
            .map_err(|e| presentation_error("Failed to start display", e))?;

        let (device, target) = (&display.device, &display.target);
        tracing::info!("Presenting {} on {} ({})", resolution, device, target);

        Ok(Self {
            output,
            resolution,
            time_base,
            stream_index,
            next_pts: 0,
            closed: false,
        })
    }
}

impl Presenter for DevicePresenter {
    fn present(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(Error::Presentation("Display already closed".into()));
        }
        if frame.resolution() != self.resolution {
            return Err(Error::Presentation(format!(
                "Frame {} does not match display {}",
                frame.resolution(),
                self.resolution
            )));
        }

        let frame = frame.clone().into_bgr();
        let stream_time_base = self
            .output
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| Error::Presentation("Display stream not found".into()))?;

        let mut packet = ffmpeg::Packet::copy(&frame.data);
        packet.set_stream(self.stream_index);
        packet.set_pts(Some(self.next_pts));
        packet.set_dts(Some(self.next_pts));
        packet.set_duration(1);
        packet.rescale_ts(self.time_base, stream_time_base);
        self.next_pts += 1;

        packet
            .write(&mut self.output)
            .map(|_| ())
            .map_err(|e| presentation_error("Display rejected frame", e))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.output
            .write_trailer()
            .map_err(|e| presentation_error("Failed to close display", e))?;
        tracing::debug!("Display closed after {} frames", self.next_pts);
        Ok(())
    }
}

impl Drop for DevicePresenter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("{}", e);
        }
    }
}
