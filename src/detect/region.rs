use std::sync::Arc;

use anyhow::Result;

use crate::config::DetectionSettings;
use crate::detect::backend::ObjectDetector;
use crate::detect::nms::nms_by_label;
use crate::detect::result::{ItemDetection, RawDetection};
use crate::frame::Frame;
use crate::geometry::{remap, Offset};

/// Item detector for one catalog category, run on person crops only.
///
/// With more than one scale factor the crop is resized per scale, each pass
/// is mapped back to crop resolution and the union is merged by label-keyed
/// NMS.
#[derive(Clone)]
pub struct RegionDetector {
    category: String,
    detector: Arc<dyn ObjectDetector>,
    scales: Vec<f32>,
    confidence_threshold: f32,
    nms_iou_threshold: f32,
}

impl RegionDetector {
    pub fn new(
        category: impl Into<String>,
        detector: Arc<dyn ObjectDetector>,
        settings: &DetectionSettings,
    ) -> Self {
        Self {
            category: category.into(),
            detector,
            scales: settings.multi_scale_factors.clone(),
            confidence_threshold: settings.item_confidence_threshold,
            nms_iou_threshold: settings.nms_iou_threshold,
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// One detection pass at `scale`. Boxes come back in crop-native
    /// coordinates with low-confidence hits already dropped.
    pub fn detect_at_scale(&self, crop: &Frame, scale: f32) -> Result<Vec<RawDetection>> {
        let input = crop.scaled(scale);
        let raw = self.detector.infer(&input, None)?;
        Ok(raw
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold && d.bbox.is_finite())
            .map(|d| RawDetection {
                bbox: remap(d.bbox, scale, Offset::ZERO),
                ..d
            })
            .collect())
    }

    /// Merge per-scale passes. A single pass is returned unchanged.
    pub fn merge(&self, passes: Vec<Vec<RawDetection>>) -> Vec<RawDetection> {
        if passes.len() <= 1 {
            return passes.into_iter().flatten().collect();
        }
        nms_by_label(passes.into_iter().flatten().collect(), self.nms_iou_threshold)
    }

    /// Run every scale and merge. Crop-local output.
    pub fn detect(&self, crop: &Frame) -> Result<Vec<RawDetection>> {
        let passes = self
            .scales
            .iter()
            .map(|scale| self.detect_at_scale(crop, *scale))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.merge(passes))
    }
}

/// Move crop-local detections into the original frame: offset by the crop
/// origin, clamp to the frame, drop anything that degenerates.
pub fn place_in_frame(
    detections: Vec<RawDetection>,
    category: &str,
    crop_origin: Offset,
    frame_width: u32,
    frame_height: u32,
) -> Vec<ItemDetection> {
    detections
        .into_iter()
        .filter_map(|d| {
            let bbox = remap(d.bbox, 1.0, crop_origin).clamp_to(frame_width, frame_height);
            if bbox.is_empty() {
                return None;
            }
            Some(ItemDetection {
                label: d.label,
                category: category.to_string(),
                bbox,
                confidence: d.confidence,
            })
        })
        .collect()
}
