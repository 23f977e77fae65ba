//! Decoding source
//!
//! Opens a file, URL or device with libavformat and yields packed BGR24
//! frames in decode order. Blocking network I/O is bounded by a timeout and
//! aborted as soon as the job's [`CancelToken`] fires.

use super::{copy_rows_out, init, VideoSource};
use crate::controller::CancelToken;
use crate::error::{Error, Result};
use crate::types::{ColorSpace, Frame, Framerate, Resolution, SourceInfo};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags as ScalerFlags};
use std::ffi::{c_int, c_void, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A network read or connect that stalls this long fails
const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Swscale context for one decoded size and pixel format
struct Converter {
    scaler: Scaler,
    format: Pixel,
    width: u32,
    height: u32,
}

impl Converter {
    fn accepts(&self, format: Pixel, width: u32, height: u32) -> bool {
        self.format == format && self.width == width && self.height == height
    }
}

/// Video source backed by libavformat/libavcodec
pub struct FfmpegSource {
    input: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    converter: Option<Converter>,
    stream_index: usize,
    info: SourceInfo,
    next_index: u64,
    eof_sent: bool,
    drained: bool,
    // Polled by the interrupt callback; must outlive `input`
    interrupt: Arc<AtomicBool>,
}

fn open_error(locator: &str, reason: impl std::fmt::Display) -> Error {
    Error::SourceOpen {
        locator: locator.to_string(),
        reason: reason.to_string(),
    }
}

unsafe extern "C" fn interrupt_requested(opaque: *mut c_void) -> c_int {
    let flag = &*(opaque as *const AtomicBool);
    c_int::from(flag.load(Ordering::SeqCst))
}

fn is_network(locator: &str) -> bool {
    locator
        .split_once("://")
        .is_some_and(|(scheme, _)| scheme != "file")
}

/// `avformat_open_input` with an I/O timeout and an interrupt callback
/// polling `flag`
fn open_input(
    locator: &str,
    flag: &Arc<AtomicBool>,
) -> std::result::Result<ffmpeg::format::context::Input, ffmpeg::Error> {
    let path = CString::new(locator).map_err(|_| ffmpeg::Error::InvalidData)?;

    let mut options = ffmpeg::Dictionary::new();
    if is_network(locator) {
        options.set("rw_timeout", &NETWORK_TIMEOUT.as_micros().to_string());
    }

    unsafe {
        let mut ctx = ffmpeg::ffi::avformat_alloc_context();
        if ctx.is_null() {
            return Err(ffmpeg::Error::Unknown);
        }
        (*ctx).interrupt_callback = ffmpeg::ffi::AVIOInterruptCB {
            callback: Some(interrupt_requested),
            opaque: Arc::as_ptr(flag) as *mut c_void,
        };

        // On failure avformat_open_input frees the context itself
        let mut opts = options.disown();
        let ret = ffmpeg::ffi::avformat_open_input(&mut ctx, path.as_ptr(), std::ptr::null_mut(), &mut opts);
        drop(ffmpeg::Dictionary::own(opts));
        if ret < 0 {
            return Err(ffmpeg::Error::from(ret));
        }

        let ret = ffmpeg::ffi::avformat_find_stream_info(ctx, std::ptr::null_mut());
        if ret < 0 {
            ffmpeg::ffi::avformat_close_input(&mut ctx);
            return Err(ffmpeg::Error::from(ret));
        }

        Ok(ffmpeg::format::context::Input::wrap(ctx))
    }
}

impl FfmpegSource {
    /// Open a locator and prepare its best video stream for decoding
    pub fn open(locator: &str, cancel: &CancelToken) -> Result<Self> {
        init()?;

        let interrupt = cancel.flag();
        let input = open_input(locator, &interrupt).map_err(|e| {
            if cancel.is_cancelled() {
                Error::Cancelled
            } else {
                open_error(locator, e)
            }
        })?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| open_error(locator, "no video stream"))?;
        let stream_index = stream.index();

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| open_error(locator, e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| open_error(locator, e))?;

        if decoder.width() == 0 || decoder.height() == 0 {
            return Err(open_error(locator, "video stream has no dimensions"));
        }

        let rate = [stream.avg_frame_rate(), stream.rate()]
            .into_iter()
            .map(|r| Framerate::new(r.numerator().max(0) as u32, r.denominator().max(0) as u32))
            .find(Framerate::is_valid)
            .unwrap_or_default();

        let total_frames = match stream.frames() {
            n if n > 0 => Some(n as u64),
            _ => None,
        };

        let info = SourceInfo {
            resolution: Resolution::new(decoder.width(), decoder.height()),
            framerate: rate,
            total_frames,
        };

        tracing::info!(
            "Opened source {}: {} @ {}, {} frames",
            locator,
            info.resolution,
            info.framerate,
            info.total_frames
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".into())
        );

        Ok(Self {
            input,
            decoder,
            converter: None,
            stream_index,
            info,
            next_index: 0,
            eof_sent: false,
            drained: false,
            interrupt,
        })
    }

    fn cancelled(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Converter for `decoded`, rebuilt whenever the stream changes size or
    /// pixel format mid-way
    fn converter_for(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Converter> {
        let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());

        if let Some(converter) = self.converter.take() {
            if converter.accepts(format, width, height) {
                return Ok(converter);
            }
            tracing::warn!(
                "Stream changed from {}x{} {:?} to {}x{} {:?} at frame {}",
                converter.width,
                converter.height,
                converter.format,
                width,
                height,
                format,
                self.next_index
            );
        }

        let target = self.info.resolution;
        if (width, height) != (target.width, target.height) {
            tracing::warn!(
                "Decoded {}x{} differs from the opened {}; rescaling to keep the output size",
                width,
                height,
                target
            );
        }

        let scaler = Scaler::get(
            format,
            width,
            height,
            Pixel::BGR24,
            target.width,
            target.height,
            ScalerFlags::BILINEAR,
        )
        .map_err(|e| {
            Error::Decode(format!(
                "No conversion from {:?} {}x{} to BGR24 {}: {}",
                format, width, height, target, e
            ))
        })?;

        Ok(Converter {
            scaler,
            format,
            width,
            height,
        })
    }

    fn to_frame(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut converter = self.converter_for(decoded)?;

        let mut bgr = ffmpeg::frame::Video::empty();
        let converted = converter.scaler.run(decoded, &mut bgr);
        self.converter = Some(converter);
        converted.map_err(|e| Error::Decode(format!("Colour conversion of frame {} failed: {}", self.next_index, e)))?;

        let Resolution { width, height } = self.info.resolution;
        let row_bytes = width as usize * 3;
        let data = copy_rows_out(bgr.data(0), bgr.stride(0), row_bytes, height as usize);

        let frame = Frame::from_data(data, width, height, ColorSpace::Bgr).with_index(self.next_index);
        self.next_index += 1;
        Ok(frame)
    }

    fn receive(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => self.to_frame(&decoded).map(Some),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(None),
            Err(ffmpeg::Error::Eof) => {
                self.drained = true;
                Ok(None)
            }
            Err(e) => Err(Error::Decode(format!("Failed to receive frame: {}", e))),
        }
    }
}

impl VideoSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.drained {
                return Ok(None);
            }
            if let Some(frame) = self.receive()? {
                return Ok(Some(frame));
            }
            if self.drained {
                return Ok(None);
            }
            if self.eof_sent {
                // Decoder wants input after EOF: nothing left to give
                self.drained = true;
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        self.decoder
                            .send_packet(&packet)
                            .map_err(|e| Error::Decode(format!("Failed to send packet: {}", e)))?;
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| Error::Decode(format!("Failed to send EOF: {}", e)))?;
                    self.eof_sent = true;
                }
                Err(_) if self.cancelled() => return Err(Error::Cancelled),
                Err(e) => return Err(Error::Decode(format!("Failed to read packet: {}", e))),
            }
        }
    }
}
