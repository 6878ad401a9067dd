use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Object detector capability.
///
/// Given an image, return boxes in that image's pixel coordinates with a
/// label and confidence. Implementations are shared across worker threads,
/// so `infer` takes `&self`.
pub trait ObjectDetector: Send + Sync {
    /// Detector identifier, used in logs.
    fn name(&self) -> &str;

    /// Run detection. When `class_filter` is set, only those labels are
    /// returned.
    fn infer(&self, frame: &Frame, class_filter: Option<&[&str]>) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, called once before the first interval.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    /// Optional teardown hook, called once after the last interval.
    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
