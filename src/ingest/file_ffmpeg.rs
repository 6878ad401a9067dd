//! Local file reader using FFmpeg.
//!
//! Each reader owns its own demuxer and decoder. `seek_and_decode` seeks to
//! the keyframe at or before the target and decodes forward until the first
//! frame whose presentation time reaches it.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{Decoded, FrameSource, VideoMetadata};
use crate::frame::Frame;

pub(crate) struct FfmpegFileSource {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    meta: VideoMetadata,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open video '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", path))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());
        let fps = f64::from(input_stream.avg_frame_rate());
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        let duration = input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
        if !(duration.is_finite() && duration > 0.0) {
            return Err(anyhow!("'{}' reports no usable duration", path));
        }
        let meta = VideoMetadata {
            duration,
            fps: if fps.is_finite() { fps } else { 0.0 },
            width: decoder.width(),
            height: decoder.height(),
        };
        log::info!(
            "FileVideo: opened {} ({:.2}s, {:.2} fps, {}x{})",
            path,
            meta.duration,
            meta.fps,
            meta.width,
            meta.height
        );

        Ok(Self {
            path: path.to_string(),
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            meta,
        })
    }

    fn to_frame(&mut self, decoded: &ffmpeg::frame::Video, timestamp: f64) -> Result<Frame> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        Frame::from_rgb(width, height, pixels, timestamp)
    }

    fn half_frame(&self) -> f64 {
        self.meta.frame_period().map(|p| p / 2.0).unwrap_or(0.0)
    }
}

impl FrameSource for FfmpegFileSource {
    fn metadata(&self) -> VideoMetadata {
        self.meta
    }

    fn seek_and_decode(&mut self, timestamp: f64) -> Result<Decoded> {
        if timestamp < 0.0 || timestamp > self.meta.duration {
            return Ok(Decoded::EndOfStream);
        }
        let target = (timestamp * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        self.input
            .seek(target, ..target)
            .with_context(|| format!("seek to {:.3}s in '{}'", timestamp, self.path))?;
        self.decoder.flush();

        let threshold = timestamp - self.half_frame();
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut packets_done = false;
        loop {
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let pts = decoded
                    .timestamp()
                    .map(|ts| ts as f64 * self.time_base)
                    .unwrap_or(timestamp);
                if pts >= threshold {
                    let frame = self.to_frame(&decoded, pts)?;
                    return Ok(Decoded::Frame(frame));
                }
            }
            if packets_done {
                return Ok(Decoded::EndOfStream);
            }
            let mut sent = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                sent = true;
                break;
            }
            if !sent {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                packets_done = true;
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame buffer is too short")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
