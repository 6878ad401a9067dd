//! Video sources.
//!
//! The pipeline sees video through two capabilities:
//! - `VideoOpener`: shared, cheap handle that can open independent readers
//! - `FrameSource`: one reader with its own decoder state (seeking is stateful,
//!   so every worker opens its own)
//!
//! Implementations:
//! - `stub://` synthetic videos (tests, demos)
//! - Local video files (feature: ingest-file-ffmpeg)

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod synthetic;

use anyhow::Result;
use serde::Serialize;

use crate::frame::Frame;

pub use file::FileVideo;
pub use synthetic::{Pattern, SyntheticVideo};

/// Stream properties reported by a source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct VideoMetadata {
    /// Seconds.
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl VideoMetadata {
    /// One frame period in seconds, or `None` when the rate is unknown.
    pub fn frame_period(&self) -> Option<f64> {
        (self.fps.is_finite() && self.fps > 0.0).then(|| 1.0 / self.fps)
    }
}

/// Result of a seek.
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    EndOfStream,
}

/// One independent reader over a video.
pub trait FrameSource {
    fn metadata(&self) -> VideoMetadata;

    /// Decode the frame at (or first after) `timestamp` seconds.
    fn seek_and_decode(&mut self, timestamp: f64) -> Result<Decoded>;
}

/// Opens readers over one video. Shared by every worker.
pub trait VideoOpener: Send + Sync {
    /// Human-readable source name for logs and reports.
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn FrameSource>>;
}
