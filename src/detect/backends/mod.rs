pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::detect::backend::ObjectDetector;

pub use stub::{StubDetector, StubRule};

#[cfg(feature = "backend-tract")]
pub use tract::TractDetector;

/// Input size used for ONNX detectors loaded from the command line.
pub const MODEL_INPUT_SIZE: u32 = 640;

/// Load a detector by file type: `.json` is a stub rule script, `.onnx` a
/// YOLO-style model (needs `backend-tract`). `labels` are the model's class
/// names in output order and are ignored for stubs.
pub fn open_detector(path: &Path, labels: &[String]) -> Result<Arc<dyn ObjectDetector>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("json") => Ok(Arc::new(StubDetector::from_rules_file(path)?)),
        Some("onnx") => open_onnx(path, labels),
        _ => bail!(
            "unsupported detector {} (expected .json stub rules or .onnx model)",
            path.display()
        ),
    }
}

#[cfg(feature = "backend-tract")]
fn open_onnx(path: &Path, labels: &[String]) -> Result<Arc<dyn ObjectDetector>> {
    let detector = TractDetector::new(path, MODEL_INPUT_SIZE, MODEL_INPUT_SIZE, labels.to_vec())?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "backend-tract"))]
fn open_onnx(path: &Path, _labels: &[String]) -> Result<Arc<dyn ObjectDetector>> {
    bail!(
        "{}: ONNX detectors need the backend-tract feature",
        path.display()
    )
}
