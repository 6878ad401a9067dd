use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// Detector output in the coordinates of the image it was run on.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: BBox,
    pub label: String,
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(label: impl Into<String>, bbox: BBox, confidence: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
        }
    }
}

/// An item found inside the person crop, in original-frame coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemDetection {
    pub label: String,
    /// Catalog category the item is matched against.
    pub category: String,
    #[serde(rename = "box")]
    pub bbox: BBox,
    pub confidence: f32,
}
