//! Audio reattachment
//!
//! Stream-copies the silent video and the original audio track into a new
//! container. Audio the output container cannot hold (PCM from an AVI going
//! into MP4, for instance) is decoded and re-encoded as AAC instead.

use super::{init, RemuxOutcome};
use crate::error::{Error, Result};

use ffmpeg_next as ffmpeg;
use std::collections::VecDeque;
use std::ffi::{c_char, c_int, CStr};
use std::path::Path;

/// Sample rates the AAC encoder accepts
const AAC_RATES: [i32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];
const AAC_BITRATE: i64 = 192_000;

struct CopiedStream {
    input_index: usize,
    output_index: usize,
    /// Time base of the packets handed to the muxer
    input_time_base: ffmpeg::Rational,
    output_time_base: ffmpeg::Rational,
    done: bool,
}

fn remux_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::FFmpeg(format!("{}: {}", context, e))
}

/// Next packet of the given stream, `None` at end of input
fn next_packet(
    input: &mut ffmpeg::format::context::Input,
    stream: &mut CopiedStream,
) -> Result<Option<ffmpeg::Packet>> {
    if stream.done {
        return Ok(None);
    }
    loop {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(input) {
            Ok(()) if packet.stream() == stream.input_index => return Ok(Some(packet)),
            Ok(()) => continue,
            Err(ffmpeg::Error::Eof) => {
                stream.done = true;
                return Ok(None);
            }
            Err(e) => return Err(remux_error("Failed to read packet", e)),
        }
    }
}

fn timestamp_secs(packet: &ffmpeg::Packet, time_base: ffmpeg::Rational) -> f64 {
    packet.dts().or(packet.pts()).unwrap_or(0) as f64 * f64::from(time_base)
}

fn write_copied(
    output: &mut ffmpeg::format::context::Output,
    stream: &CopiedStream,
    mut packet: ffmpeg::Packet,
) -> Result<()> {
    packet.set_stream(stream.output_index);
    packet.rescale_ts(stream.input_time_base, stream.output_time_base);
    packet.set_position(-1);
    packet
        .write_interleaved(output)
        .map_err(|e| remux_error("Failed to write packet", e))
}

/// Can `output` store `codec` without re-encoding?
///
/// Containers that do not report their codec support are trusted.
fn container_accepts(output: &ffmpeg::format::context::Output, codec: ffmpeg::codec::Id) -> bool {
    let ret = unsafe {
        ffmpeg::ffi::avformat_query_codec(
            output.format().as_ptr(),
            codec.into(),
            ffmpeg::ffi::FF_COMPLIANCE_NORMAL as c_int,
        )
    };
    ret != 0
}

/// `channel_layout=...` or `channels=N` for an abuffer source
unsafe fn layout_arg(layout: &ffmpeg::ffi::AVChannelLayout) -> String {
    if layout.order != ffmpeg::ffi::AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC {
        let mut buf = [0 as c_char; 64];
        if ffmpeg::ffi::av_channel_layout_describe(layout, buf.as_mut_ptr(), buf.len()) > 0 {
            if let Ok(name) = CStr::from_ptr(buf.as_ptr()).to_str() {
                return format!("channel_layout={}", name);
            }
        }
    }
    format!("channels={}", layout.nb_channels)
}

/// Decodes one audio stream and re-encodes it as AAC
struct AacTranscoder {
    decoder: ffmpeg::decoder::Audio,
    graph: ffmpeg::filter::Graph,
    encoder: ffmpeg::encoder::Audio,
    input_time_base: ffmpeg::Rational,
    rate: i32,
    next_pts: Option<i64>,
    ready: VecDeque<ffmpeg::Packet>,
    finished: bool,
}

impl AacTranscoder {
    /// Set up decoding of `stream` and add an AAC stream to `output`
    ///
    /// Returns the transcoder and the index of the new output stream.
    fn new(
        stream: &ffmpeg::format::stream::Stream,
        output: &mut ffmpeg::format::context::Output,
    ) -> Result<(Self, usize)> {
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|c| c.decoder().audio())
            .map_err(|e| remux_error("Failed to open audio decoder", e))?;

        let (in_rate, in_format, in_layout, in_channels) = unsafe {
            let ctx = decoder.as_ptr();
            (
                (*ctx).sample_rate,
                (*ctx).sample_fmt as i32,
                layout_arg(&(*ctx).ch_layout),
                (*ctx).ch_layout.nb_channels,
            )
        };
        if in_rate <= 0 {
            return Err(Error::FFmpeg("Audio stream has no sample rate".into()));
        }

        let rate = if AAC_RATES.contains(&in_rate) { in_rate } else { 48000 };
        let channels = if in_channels >= 2 { 2 } else { 1 };
        let out_layout = if channels == 2 { "stereo" } else { "mono" };

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::AAC)
            .ok_or_else(|| Error::FFmpeg("AAC encoder not available".into()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .map_err(|e| remux_error("Not an audio encoder", e))?;
        unsafe {
            let ctx = encoder.as_mut_ptr();
            (*ctx).sample_rate = rate;
            (*ctx).sample_fmt = ffmpeg::ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP;
            (*ctx).bit_rate = AAC_BITRATE;
            (*ctx).time_base = ffmpeg::ffi::AVRational { num: 1, den: rate };
            ffmpeg::ffi::av_channel_layout_default(&mut (*ctx).ch_layout, channels);
        }
        if global_header {
            encoder.set_flags(ffmpeg::codec::flag::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder
            .open()
            .map_err(|e| remux_error("Failed to open AAC encoder", e))?;
        let frame_size = match unsafe { (*encoder.as_ptr()).frame_size } {
            n if n > 0 => n as u32,
            _ => 1024,
        };

        let time_base = stream.time_base();
        let graph = Self::graph(
            &format!(
                "time_base={}/{}:sample_rate={}:sample_fmt={}:{}",
                time_base.numerator(),
                time_base.denominator(),
                in_rate,
                in_format,
                in_layout
            ),
            &format!(
                "aformat=sample_fmts=fltp:sample_rates={}:channel_layouts={}",
                rate, out_layout
            ),
            frame_size,
        )
        .map_err(|e| remux_error("Failed to build audio filter", e))?;

        let output_index = {
            let mut ost = output
                .add_stream(codec)
                .map_err(|e| remux_error("Failed to add audio stream", e))?;
            ost.set_parameters(&encoder);
            ost.set_time_base(ffmpeg::Rational::new(1, rate));
            ost.index()
        };

        tracing::info!(
            "Re-encoding audio to AAC ({} Hz, {}, was {} Hz {} channels)",
            rate,
            out_layout,
            in_rate,
            in_channels
        );

        Ok((
            Self {
                decoder,
                graph,
                encoder,
                input_time_base: time_base,
                rate,
                next_pts: None,
                ready: VecDeque::new(),
                finished: false,
            },
            output_index,
        ))
    }

    fn graph(source_args: &str, spec: &str, frame_size: u32) -> std::result::Result<ffmpeg::filter::Graph, ffmpeg::Error> {
        let abuffer = ffmpeg::filter::find("abuffer").ok_or(ffmpeg::Error::FilterNotFound)?;
        let abuffersink = ffmpeg::filter::find("abuffersink").ok_or(ffmpeg::Error::FilterNotFound)?;

        let mut graph = ffmpeg::filter::Graph::new();
        graph.add(&abuffer, "in", source_args)?;
        graph.add(&abuffersink, "out", "")?;
        graph.output("in", 0)?.input("out", 0)?.parse(spec)?;
        graph.validate()?;

        // AAC takes fixed-size frames
        if let Some(mut out) = graph.get("out") {
            out.sink().set_frame_size(frame_size);
        }
        Ok(graph)
    }

    fn time_base(&self) -> ffmpeg::Rational {
        ffmpeg::Rational::new(1, self.rate)
    }

    /// Next encoded packet, in [`Self::time_base`], `None` when drained
    fn next_packet(
        &mut self,
        input: &mut ffmpeg::format::context::Input,
        stream: &CopiedStream,
    ) -> Result<Option<ffmpeg::Packet>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }
            if self.finished {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(input) {
                Ok(()) if packet.stream() == stream.input_index => {
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| remux_error("Failed to decode audio", e))?;
                    self.drain_decoder()?;
                }
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| remux_error("Failed to flush audio decoder", e))?;
                    self.drain_decoder()?;
                    if let Some(mut src) = self.graph.get("in") {
                        src.source()
                            .flush()
                            .map_err(|e| remux_error("Failed to flush audio filter", e))?;
                    }
                    self.drain_filter()?;
                    self.encode(None)?;
                    self.finished = true;
                }
                Err(e) => return Err(remux_error("Failed to read packet", e)),
            }
        }
    }

    fn drain_decoder(&mut self) -> Result<()> {
        loop {
            let mut decoded = ffmpeg::frame::Audio::empty();
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    if self.next_pts.is_none() {
                        // Keep the original audio offset relative to the video
                        let start = decoded.pts().unwrap_or(0) as f64 * f64::from(self.input_time_base);
                        self.next_pts = Some((start * f64::from(self.rate)).round() as i64);
                    }
                    let mut src = self
                        .graph
                        .get("in")
                        .ok_or_else(|| Error::FFmpeg("Audio filter has no input".into()))?;
                    src.source()
                        .add(&decoded)
                        .map_err(|e| remux_error("Failed to filter audio", e))?;
                    self.drain_filter()?;
                }
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => return Ok(()),
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => return Err(remux_error("Failed to decode audio", e)),
            }
        }
    }

    fn drain_filter(&mut self) -> Result<()> {
        loop {
            let mut filtered = ffmpeg::frame::Audio::empty();
            let pulled = match self.graph.get("out") {
                Some(mut out) => out.sink().frame(&mut filtered).is_ok(),
                None => false,
            };
            if !pulled {
                return Ok(());
            }

            let pts = self.next_pts.unwrap_or(0);
            filtered.set_pts(Some(pts));
            self.next_pts = Some(pts + filtered.samples() as i64);
            self.encode(Some(&filtered))?;
        }
    }

    /// Send a frame (or end of stream) and queue every packet produced
    fn encode(&mut self, frame: Option<&ffmpeg::frame::Audio>) -> Result<()> {
        match frame {
            Some(frame) => self.encoder.send_frame(frame),
            None => self.encoder.send_eof(),
        }
        .map_err(|e| remux_error("Failed to encode audio", e))?;

        loop {
            let mut packet = ffmpeg::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => self.ready.push_back(packet),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => return Ok(()),
                Err(ffmpeg::Error::Eof) => return Ok(()),
                Err(e) => return Err(remux_error("Failed to receive audio packet", e)),
            }
        }
    }
}

/// Where the output's audio packets come from
enum AudioTrack {
    Copy(CopiedStream),
    Aac(CopiedStream, Box<AacTranscoder>),
}

impl AudioTrack {
    fn stream(&self) -> &CopiedStream {
        match self {
            AudioTrack::Copy(stream) | AudioTrack::Aac(stream, _) => stream,
        }
    }

    fn stream_mut(&mut self) -> &mut CopiedStream {
        match self {
            AudioTrack::Copy(stream) | AudioTrack::Aac(stream, _) => stream,
        }
    }

    fn next_packet(&mut self, input: &mut ffmpeg::format::context::Input) -> Result<Option<ffmpeg::Packet>> {
        match self {
            AudioTrack::Copy(stream) => next_packet(input, stream),
            AudioTrack::Aac(stream, transcoder) => transcoder.next_packet(input, stream),
        }
    }
}

/// Attach the audio track of `original` to `silent`, writing `output`
///
/// Returns [`RemuxOutcome::VideoOnly`] without touching the filesystem when
/// the original has no audio. A partially written output is removed on
/// failure.
pub fn remux_audio(silent: &Path, original: &Path, output: &Path) -> Result<RemuxOutcome> {
    init()?;

    let audio_input = ffmpeg::format::input(&original)
        .map_err(|e| remux_error(&format!("Failed to reopen {}", original.display()), e))?;
    if audio_input.streams().best(ffmpeg::media::Type::Audio).is_none() {
        tracing::info!("{} has no audio track", original.display());
        return Ok(RemuxOutcome::VideoOnly);
    }

    match merge(silent, audio_input, output) {
        Ok(()) => Ok(RemuxOutcome::Merged),
        Err(e) => {
            if output.exists() {
                if let Err(rm) = std::fs::remove_file(output) {
                    tracing::warn!("Failed to remove partial {}: {}", output.display(), rm);
                }
            }
            Err(e)
        }
    }
}

/// Output stream copying `stream` unchanged
fn add_copied_stream(
    output: &mut ffmpeg::format::context::Output,
    stream: &ffmpeg::format::stream::Stream,
) -> Result<CopiedStream> {
    let mut ost = output
        .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
        .map_err(|e| remux_error("Failed to add stream", e))?;
    ost.set_parameters(stream.parameters());
    // Source codec tags may be invalid in the output container
    unsafe {
        (*ost.parameters().as_mut_ptr()).codec_tag = 0;
    }

    Ok(CopiedStream {
        input_index: stream.index(),
        output_index: ost.index(),
        input_time_base: stream.time_base(),
        output_time_base: stream.time_base(),
        done: false,
    })
}

fn merge(silent: &Path, mut audio_input: ffmpeg::format::context::Input, output: &Path) -> Result<()> {
    let mut video_input = ffmpeg::format::input(&silent)
        .map_err(|e| remux_error(&format!("Failed to open {}", silent.display()), e))?;

    let mut out = ffmpeg::format::output(&output)
        .map_err(|e| remux_error(&format!("Failed to create {}", output.display()), e))?;

    let mut video = {
        let stream = video_input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| Error::FFmpeg(format!("No video stream in {}", silent.display())))?;
        add_copied_stream(&mut out, &stream)?
    };

    let mut audio = {
        let stream = audio_input
            .streams()
            .best(ffmpeg::media::Type::Audio)
            .ok_or_else(|| Error::FFmpeg(format!("No audio stream in {}", output.display())))?;
        let codec = stream.parameters().id();

        if container_accepts(&out, codec) {
            AudioTrack::Copy(add_copied_stream(&mut out, &stream)?)
        } else {
            tracing::info!("{:?} audio cannot be stored in {}", codec, output.display());
            let (transcoder, output_index) = AacTranscoder::new(&stream, &mut out)?;
            let time_base = transcoder.time_base();
            AudioTrack::Aac(
                CopiedStream {
                    input_index: stream.index(),
                    output_index,
                    input_time_base: time_base,
                    output_time_base: time_base,
                    done: false,
                },
                Box::new(transcoder),
            )
        }
    };

    out.write_header()
        .map_err(|e| remux_error("Failed to write header", e))?;

    for stream in [&mut video, audio.stream_mut()] {
        if let Some(s) = out.stream(stream.output_index) {
            stream.output_time_base = s.time_base();
        }
    }

    let mut pending_video = next_packet(&mut video_input, &mut video)?;
    let mut pending_audio = audio.next_packet(&mut audio_input)?;
    let (mut video_packets, mut audio_packets) = (0u64, 0u64);

    loop {
        let take_video = match (&pending_video, &pending_audio) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(v), Some(a)) => {
                timestamp_secs(v, video.input_time_base)
                    <= timestamp_secs(a, audio.stream().input_time_base)
            }
        };

        if take_video {
            if let Some(packet) = pending_video.take() {
                write_copied(&mut out, &video, packet)?;
                video_packets += 1;
            }
            pending_video = next_packet(&mut video_input, &mut video)?;
        } else {
            if let Some(packet) = pending_audio.take() {
                write_copied(&mut out, audio.stream(), packet)?;
                audio_packets += 1;
            }
            pending_audio = audio.next_packet(&mut audio_input)?;
        }
    }

    out.write_trailer()
        .map_err(|e| remux_error("Failed to write trailer", e))?;

    tracing::info!(
        "Merged audio into {} ({} video / {} audio packets)",
        output.display(),
        video_packets,
        audio_packets
    );
    Ok(())
}
