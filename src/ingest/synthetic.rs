//! Synthetic `stub://` videos.
//!
//! Frames are rendered on demand from a base pattern plus timed overrides, so
//! any timestamp can be "decoded" without a codec. URIs take the form
//! `stub://name?duration=30&fps=10&width=320&height=240&pattern=checker`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Decoded, FrameSource, VideoMetadata, VideoOpener};
use crate::frame::Frame;

const DEFAULT_DURATION: f64 = 30.0;
const DEFAULT_FPS: f64 = 10.0;
const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pattern {
    Black,
    /// Uniform grey level. Brightness only, no edges.
    Flat(u8),
    /// Alternating dark/bright squares, `cell` pixels wide.
    Checker { cell: u32 },
    /// Seeded per-pixel noise in the mid-grey range.
    Noise { seed: u64 },
}

impl Pattern {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "black" => Ok(Pattern::Black),
            "checker" => Ok(Pattern::Checker { cell: 4 }),
            "noise" => Ok(Pattern::Noise { seed: 7 }),
            other => {
                if let Some(level) = other.strip_prefix("flat:") {
                    let level = level
                        .parse()
                        .map_err(|_| anyhow!("invalid flat level '{}'", level))?;
                    return Ok(Pattern::Flat(level));
                }
                Err(anyhow!("unknown synthetic pattern '{}'", other))
            }
        }
    }

    fn render(&self, width: u32, height: u32, timestamp: f64) -> RgbImage {
        match *self {
            Pattern::Black => RgbImage::new(width, height),
            Pattern::Flat(level) => RgbImage::from_pixel(width, height, Rgb([level; 3])),
            Pattern::Checker { cell } => {
                let cell = cell.max(1);
                RgbImage::from_fn(width, height, |x, y| {
                    if ((x / cell) + (y / cell)) % 2 == 0 {
                        Rgb([230, 230, 230])
                    } else {
                        Rgb([20, 20, 20])
                    }
                })
            }
            Pattern::Noise { seed } => {
                let mut rng = StdRng::seed_from_u64(seed ^ (timestamp * 1000.0).round() as u64);
                RgbImage::from_fn(width, height, |_, _| {
                    let v: u8 = rng.gen_range(40..=220);
                    Rgb([v, v, v])
                })
            }
        }
    }
}

#[derive(Clone, Debug)]
struct Segment {
    from: f64,
    to: f64,
    pattern: Pattern,
}

/// A generated video. Cloning shares the failure-injection counter.
#[derive(Clone, Debug)]
pub struct SyntheticVideo {
    name: String,
    meta: VideoMetadata,
    base: Pattern,
    segments: Vec<Segment>,
    fail_open: bool,
    decode_failures: Arc<AtomicUsize>,
    decode_delay: Duration,
}

impl SyntheticVideo {
    pub fn new(name: &str, duration: f64, fps: f64, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            meta: VideoMetadata {
                duration,
                fps,
                width,
                height,
            },
            base: Pattern::Checker { cell: 4 },
            segments: Vec::new(),
            fail_open: false,
            decode_failures: Arc::new(AtomicUsize::new(0)),
            decode_delay: Duration::ZERO,
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub:// uri: {}", uri))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut video = Self::new(
            if name.is_empty() { "stub" } else { name },
            DEFAULT_DURATION,
            DEFAULT_FPS,
            DEFAULT_WIDTH,
            DEFAULT_HEIGHT,
        );
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
            let bad = || anyhow!("invalid value for stub parameter {}: '{}'", key, value);
            match key {
                "duration" => video.meta.duration = value.parse().map_err(|_| bad())?,
                "fps" => video.meta.fps = value.parse().map_err(|_| bad())?,
                "width" => video.meta.width = value.parse().map_err(|_| bad())?,
                "height" => video.meta.height = value.parse().map_err(|_| bad())?,
                "pattern" => video.base = Pattern::parse(value)?,
                _ => return Err(anyhow!("unknown stub parameter '{}'", key)),
            }
        }
        if !(video.meta.duration.is_finite() && video.meta.duration > 0.0) {
            return Err(anyhow!("stub duration must be positive"));
        }
        if video.meta.width == 0 || video.meta.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        Ok(video)
    }

    pub fn with_base(mut self, pattern: Pattern) -> Self {
        self.base = pattern;
        self
    }

    /// Render `pattern` for timestamps in `[from, to]`. Later segments win.
    pub fn with_segment(mut self, from: f64, to: f64, pattern: Pattern) -> Self {
        self.segments.push(Segment { from, to, pattern });
        self
    }

    /// Make every `open` fail.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fail the next `n` decodes across all readers.
    pub fn failing_decodes(self, n: usize) -> Self {
        self.decode_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    pub fn metadata(&self) -> VideoMetadata {
        self.meta
    }

    fn pattern_at(&self, timestamp: f64) -> Pattern {
        self.segments
            .iter()
            .rev()
            .find(|s| timestamp >= s.from && timestamp <= s.to)
            .map(|s| s.pattern)
            .unwrap_or(self.base)
    }
}

impl VideoOpener for SyntheticVideo {
    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }

    fn open(&self) -> Result<Box<dyn FrameSource>> {
        if self.fail_open {
            return Err(anyhow!("synthetic video '{}' refused to open", self.name));
        }
        log::debug!("SyntheticVideo: opened reader for {}", self.name);
        Ok(Box::new(SyntheticReader {
            video: self.clone(),
        }))
    }
}

struct SyntheticReader {
    video: SyntheticVideo,
}

impl FrameSource for SyntheticReader {
    fn metadata(&self) -> VideoMetadata {
        self.video.meta
    }

    fn seek_and_decode(&mut self, timestamp: f64) -> Result<Decoded> {
        if !self.video.decode_delay.is_zero() {
            std::thread::sleep(self.video.decode_delay);
        }
        let failing = self
            .video
            .decode_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("synthetic decode failure at {:.3}s", timestamp));
        }
        if !timestamp.is_finite() || timestamp < 0.0 || timestamp > self.video.meta.duration {
            return Ok(Decoded::EndOfStream);
        }
        let meta = self.video.meta;
        let image = self
            .video
            .pattern_at(timestamp)
            .render(meta.width, meta.height, timestamp);
        Ok(Decoded::Frame(Frame::new(image, timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parameters_are_applied() {
        let v = SyntheticVideo::from_uri("stub://cam?duration=12.5&width=64&height=32&pattern=black")
            .unwrap();
        assert_eq!(v.metadata().duration, 12.5);
        assert_eq!((v.metadata().width, v.metadata().height), (64, 32));
        assert!(SyntheticVideo::from_uri("stub://cam?bogus=1").is_err());
        assert!(SyntheticVideo::from_uri("stub://cam?pattern=flat:x").is_err());
    }

    #[test]
    fn segments_override_base_and_eos_past_duration() {
        let v = SyntheticVideo::new("t", 10.0, 10.0, 8, 8)
            .with_base(Pattern::Black)
            .with_segment(2.0, 3.0, Pattern::Flat(200));
        let mut r = v.open().unwrap();
        match r.seek_and_decode(2.5).unwrap() {
            Decoded::Frame(f) => assert_eq!(f.image.get_pixel(0, 0)[0], 200),
            Decoded::EndOfStream => panic!("expected frame"),
        }
        match r.seek_and_decode(1.0).unwrap() {
            Decoded::Frame(f) => assert_eq!(f.image.get_pixel(0, 0)[0], 0),
            Decoded::EndOfStream => panic!("expected frame"),
        }
        assert!(matches!(r.seek_and_decode(10.5).unwrap(), Decoded::EndOfStream));
    }

    #[test]
    fn noise_is_deterministic_per_timestamp() {
        let p = Pattern::Noise { seed: 3 };
        assert_eq!(p.render(8, 8, 1.0), p.render(8, 8, 1.0));
    }

    #[test]
    fn decode_failures_are_shared_across_readers() {
        let v = SyntheticVideo::new("t", 10.0, 10.0, 4, 4).failing_decodes(1);
        let mut a = v.open().unwrap();
        let mut b = v.open().unwrap();
        assert!(a.seek_and_decode(1.0).is_err());
        assert!(b.seek_and_decode(1.0).is_ok());
    }
}
