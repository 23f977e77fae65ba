//! Silent video encoder
//!
//! BGR frames are converted to planar YUV (4:2:0, or 4:4:4 for odd sizes)
//! and encoded into a container chosen from the output file extension.

use super::{copy_rows_in, init, VideoSink};
use crate::config::EncoderConfig;
use crate::error::{Error, Result};
use crate::types::{Frame, Framerate, Resolution};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as Scaler, Flags as ScalerFlags};
use ffmpeg_next::Dictionary;
use std::path::{Path, PathBuf};

/// Encoder plus muxer for one output file
pub struct FfmpegSink {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: Scaler,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    resolution: Resolution,
    path: PathBuf,
    next_pts: i64,
    packets: u64,
    finished: bool,
}

fn encode_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Encode(format!("{}: {}", context, e))
}

/// Encoder pixel format for a frame size
///
/// 4:2:0 needs even dimensions; odd sizes use 4:4:4 when the encoder has it.
pub(crate) fn pixel_format_for(resolution: Resolution, supported: &[Pixel]) -> Pixel {
    let even = resolution.width % 2 == 0 && resolution.height % 2 == 0;
    if !even && supported.contains(&Pixel::YUV444P) {
        Pixel::YUV444P
    } else {
        Pixel::YUV420P
    }
}

fn open_encoder(
    codec: ffmpeg::Codec,
    resolution: Resolution,
    framerate: Framerate,
    global_header: bool,
    config: &EncoderConfig,
) -> Result<(ffmpeg::encoder::Video, Pixel)> {
    let supported: Vec<Pixel> = codec
        .video()
        .ok()
        .and_then(|v| v.formats().map(|f| f.collect()))
        .unwrap_or_default();
    let pixel = pixel_format_for(resolution, &supported);

    let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| encode_error("Failed to create encoder", e))?;

    encoder.set_width(resolution.width);
    encoder.set_height(resolution.height);
    encoder.set_format(pixel);
    encoder.set_time_base(ffmpeg::Rational::new(framerate.den as i32, framerate.num as i32));
    encoder.set_frame_rate(Some(ffmpeg::Rational::new(
        framerate.num as i32,
        framerate.den as i32,
    )));
    if global_header {
        encoder.set_flags(ffmpeg::codec::flag::Flags::GLOBAL_HEADER);
    }

    let mut opts = Dictionary::new();
    if codec.name() == "libx264" || codec.name() == "libx265" {
        opts.set("preset", &config.preset);
        opts.set("crf", &config.crf.to_string());
    }

    let encoder = encoder
        .open_with(opts)
        .map_err(|e| encode_error(&format!("Failed to open {}", codec.name()), e))?;
    Ok((encoder, pixel))
}

impl FfmpegSink {
    /// Create the output file and open the encoder
    ///
    /// The fallback codec is used when the preferred one is missing or
    /// refuses the frame size.
    pub fn create(
        path: &Path,
        resolution: Resolution,
        framerate: Framerate,
        config: &EncoderConfig,
    ) -> Result<Self> {
        init()?;

        if !framerate.is_valid() {
            return Err(Error::Encode(format!("Invalid frame rate {}/{}", framerate.num, framerate.den)));
        }

        let mut output = ffmpeg::format::output(&path)
            .map_err(|e| encode_error(&format!("Failed to create {}", path.display()), e))?;

        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

        let mut opened = None;
        let mut last_error = None;
        for name in [&config.codec, &config.fallback_codec] {
            let Some(codec) = ffmpeg::encoder::find_by_name(name) else {
                tracing::warn!("Encoder {} not available", name);
                continue;
            };
            match open_encoder(codec, resolution, framerate, global_header, config) {
                Ok((encoder, pixel)) => {
                    opened = Some((codec, encoder, pixel));
                    break;
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    last_error = Some(e);
                }
            }
        }

        let (codec, encoder, pixel) = opened.ok_or_else(|| {
            last_error.unwrap_or_else(|| {
                Error::Encode(format!(
                    "Neither {} nor {} is available",
                    config.codec, config.fallback_codec
                ))
            })
        })?;
        let time_base = ffmpeg::Rational::new(framerate.den as i32, framerate.num as i32);

        let stream_index = {
            let mut stream = output
                .add_stream(codec)
                .map_err(|e| encode_error("Failed to add video stream", e))?;
            stream.set_parameters(&encoder);
            stream.set_time_base(time_base);
            stream.index()
        };

        output
            .write_header()
            .map_err(|e| encode_error("Failed to write header", e))?;

        let scaler = Scaler::get(
            Pixel::BGR24,
            resolution.width,
            resolution.height,
            pixel,
            resolution.width,
            resolution.height,
            ScalerFlags::BILINEAR,
        )
        .map_err(|e| encode_error("Failed to create scaler", e))?;

        tracing::info!(
            "Encoding {} {:?} {} @ {} to {}",
            codec.name(),
            pixel,
            resolution,
            framerate,
            path.display()
        );

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            time_base,
            resolution,
            path: path.to_path_buf(),
            next_pts: 0,
            packets: 0,
            finished: false,
        })
    }

    fn write_packets(&mut self) -> Result<()> {
        let stream_time_base = self
            .output
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| Error::Encode("Video stream not found".into()))?;

        loop {
            let mut packet = ffmpeg::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    packet.set_stream(self.stream_index);
                    packet.rescale_ts(self.time_base, stream_time_base);
                    packet
                        .write_interleaved(&mut self.output)
                        .map_err(|e| encode_error("Failed to write packet", e))?;
                    self.packets += 1;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => return Ok(()),
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => return Err(encode_error("Failed to receive packet", e)),
            }
        }
    }
}

impl VideoSink for FfmpegSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.finished {
            return Err(Error::Encode("Sink already finished".into()));
        }
        if frame.resolution() != self.resolution {
            return Err(Error::Encode(format!(
                "Frame {} does not match sink {}",
                frame.resolution(),
                self.resolution
            )));
        }

        let frame = frame.clone().into_bgr();
        let mut bgr = ffmpeg::frame::Video::new(Pixel::BGR24, frame.width, frame.height);
        let stride = bgr.stride(0);
        copy_rows_in(&frame.data, frame.width as usize * 3, bgr.data_mut(0), stride);

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&bgr, &mut yuv)
            .map_err(|e| encode_error("Colour conversion failed", e))?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&yuv)
            .map_err(|e| encode_error("Failed to send frame", e))?;
        self.write_packets()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.encoder
            .send_eof()
            .map_err(|e| encode_error("Failed to send EOF", e))?;
        self.write_packets()?;
        self.output
            .write_trailer()
            .map_err(|e| encode_error("Failed to write trailer", e))?;

        tracing::info!(
            "Finished {}: {} frames, {} packets",
            self.path.display(),
            self.next_pts,
            self.packets
        );
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                tracing::warn!("Failed to close {}: {}", self.path.display(), e);
            }
        }
    }
}
