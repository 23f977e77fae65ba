//! Small media files generated on the fly for FFmpeg-backed tests

use super::{encoder_available, FfmpegSink, VideoSink};
use crate::config::EncoderConfig;
use crate::types::{ColorSpace, Frame, Framerate, Resolution};

use ffmpeg_next as ffmpeg;
use std::path::Path;

/// WAVE format tags
pub const WAV_PCM: u16 = 1;
pub const WAV_MULAW: u16 = 7;

/// Is either configured video encoder linked in?
pub fn video_encoding_available() -> bool {
    let config = EncoderConfig::default();
    encoder_available(&config.codec) || encoder_available(&config.fallback_codec)
}

/// Encode one flat grey frame per entry of `levels`
pub fn write_clip(path: &Path, resolution: Resolution, levels: &[u8]) {
    let mut sink = FfmpegSink::create(path, resolution, Framerate::FPS_25, &EncoderConfig::default()).unwrap();
    for (i, &level) in levels.iter().enumerate() {
        let data = vec![level; resolution.pixels() as usize * 3];
        let frame = Frame::from_data(data, resolution.width, resolution.height, ColorSpace::Bgr)
            .with_index(i as u64);
        sink.write_frame(&frame).unwrap();
    }
    sink.finish().unwrap();
}

/// Minimal RIFF/WAVE file around `data`
pub fn write_wav(path: &Path, format_tag: u16, bits: u16, channels: u16, rate: u32, data: &[u8]) {
    let block_align = channels * bits / 8;
    let mut bytes = Vec::with_capacity(44 + data.len());
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&format_tag.to_le_bytes());
    bytes.extend_from_slice(&channels.to_le_bytes());
    bytes.extend_from_slice(&rate.to_le_bytes());
    bytes.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
    bytes.extend_from_slice(&block_align.to_le_bytes());
    bytes.extend_from_slice(&bits.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(data);
    std::fs::write(path, bytes).unwrap();
}

/// One second of a 440 Hz tone as interleaved s16le stereo
pub fn tone_s16_stereo(rate: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(rate as usize * 4);
    for i in 0..rate {
        let t = i as f32 / rate as f32;
        let sample = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
        data.extend_from_slice(&sample.to_le_bytes());
        data.extend_from_slice(&sample.to_le_bytes());
    }
    data
}

/// Codec and packet payloads of the best stream of `kind`
pub fn stream_packets(path: &Path, kind: ffmpeg::media::Type) -> Option<(ffmpeg::codec::Id, Vec<Vec<u8>>)> {
    let mut input = ffmpeg::format::input(&path).unwrap();
    let (index, codec) = {
        let stream = input.streams().best(kind)?;
        (stream.index(), stream.parameters().id())
    };

    let mut payloads = Vec::new();
    loop {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut input) {
            Ok(()) if packet.stream() == index => payloads.push(packet.data().unwrap_or_default().to_vec()),
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => break,
            Err(e) => panic!("reading {}: {}", path.display(), e),
        }
    }
    Some((codec, payloads))
}

/// Mean of all bytes in a frame
pub fn mean_level(frame: &Frame) -> f64 {
    frame.data.iter().map(|&b| b as f64).sum::<f64>() / frame.data.len() as f64
}
