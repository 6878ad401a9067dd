//! Local file video source.
//!
//! `FileVideo` opens local video files (no URL schemes) through FFmpeg, and
//! `stub://` URIs through the synthetic generator. Frames are decoded in
//! memory only.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::SyntheticVideo;
use super::{FrameSource, VideoOpener};

/// Video opener for a local path or `stub://` URI.
pub struct FileVideo {
    path: String,
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticVideo),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg,
}

impl FileVideo {
    pub fn new(path: &str) -> Result<Self> {
        if !is_local_file_path(path) {
            return Err(anyhow!(
                "video input only supports local paths or stub:// (got '{}')",
                path
            ));
        }
        if path.starts_with("stub://") {
            return Ok(Self {
                path: path.to_string(),
                backend: FileBackend::Synthetic(SyntheticVideo::from_uri(path)?),
            });
        }
        if !std::path::Path::new(path).is_file() {
            return Err(anyhow!("video file '{}' does not exist", path));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            Ok(Self {
                path: path.to_string(),
                backend: FileBackend::Ffmpeg,
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(anyhow!(
                "decoding '{}' requires the ingest-file-ffmpeg feature",
                path
            ))
        }
    }
}

impl VideoOpener for FileVideo {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn open(&self) -> Result<Box<dyn FrameSource>> {
        match &self.backend {
            FileBackend::Synthetic(video) => video.open(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg => Ok(Box::new(FfmpegFileSource::open(&self.path)?)),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_remote_urls() {
        assert!(FileVideo::new("rtsp://camera/stream").is_err());
        assert!(FileVideo::new("  ").is_err());
    }

    #[test]
    fn stub_uri_opens_synthetic_reader() {
        let video = FileVideo::new("stub://demo?duration=4&fps=5").unwrap();
        let source = video.open().unwrap();
        assert_eq!(source.metadata().duration, 4.0);
        assert_eq!(source.metadata().fps, 5.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(FileVideo::new("/definitely/not/here.mp4").is_err());
    }
}
