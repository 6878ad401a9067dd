//! Object detection capabilities and the region-scoped item detector.
//!
//! Detectors are black boxes behind [`ObjectDetector`]. The pipeline runs one
//! person detector over the whole frame and one item detector per catalog
//! category over the padded person crop.

mod backend;
pub mod backends;
mod nms;
mod region;
mod registry;
mod result;

pub use backend::ObjectDetector;
pub use backends::{StubDetector, StubRule};
pub use nms::nms_by_label;
pub use region::{place_in_frame, RegionDetector};
pub use registry::DetectorRegistry;
pub use result::{ItemDetection, RawDetection};

#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
