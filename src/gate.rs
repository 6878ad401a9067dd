//! Person gate: is somebody actually in the frame, and where.
//!
//! Item detection only runs inside the primary person box, so an interval
//! without a confident, large-enough person is skipped outright.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::PersonSettings;
use crate::detect::{ObjectDetector, RawDetection};
use crate::frame::Frame;
use crate::geometry::{BBox, Offset};

pub const PERSON_LABEL: &str = "person";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonDetection {
    #[serde(rename = "box")]
    pub bbox: BBox,
    pub confidence: f32,
    /// Box area over frame area, in `[0, 1]`.
    pub area_ratio: f32,
}

#[derive(Clone)]
pub struct PersonGate {
    detector: Arc<dyn ObjectDetector>,
    settings: PersonSettings,
}

impl PersonGate {
    pub fn new(detector: Arc<dyn ObjectDetector>, settings: PersonSettings) -> Self {
        Self { detector, settings }
    }

    pub fn settings(&self) -> &PersonSettings {
        &self.settings
    }

    /// Raw person hits for a frame.
    pub fn detect_raw(&self, frame: &Frame) -> Result<Vec<RawDetection>> {
        self.detector.infer(frame, Some(&[PERSON_LABEL]))
    }

    /// Apply the label, confidence and area filters and pick the primary
    /// person: highest confidence, then larger area, then first seen.
    pub fn select(&self, frame: &Frame, raw: Vec<RawDetection>) -> Option<PersonDetection> {
        let frame_area = frame.area();
        if frame_area <= 0.0 {
            return None;
        }
        let mut best: Option<PersonDetection> = None;
        for det in raw {
            if det.label != PERSON_LABEL
                || det.confidence < self.settings.confidence_threshold
                || !det.bbox.is_finite()
            {
                continue;
            }
            let bbox = det.bbox.clamp_to(frame.width(), frame.height());
            let area_ratio = (bbox.area() / frame_area).clamp(0.0, 1.0);
            if area_ratio < self.settings.min_area {
                continue;
            }
            let candidate = PersonDetection {
                bbox,
                confidence: det.confidence,
                area_ratio,
            };
            let better = match &best {
                None => true,
                Some(b) => {
                    candidate.confidence > b.confidence
                        || (candidate.confidence == b.confidence && candidate.area_ratio > b.area_ratio)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best
    }

    pub fn locate(&self, frame: &Frame) -> Result<Option<PersonDetection>> {
        let raw = self.detect_raw(frame)?;
        Ok(self.select(frame, raw))
    }
}

/// Cut the padded person box out of the frame.
///
/// The box grows by `padding_ratio` of its width/height on every side and is
/// clamped to the frame. Returns the crop and its origin in the frame, or
/// `None` when nothing is left after clamping.
pub fn crop_with_padding(frame: &Frame, bbox: &BBox, padding_ratio: f32) -> Option<(Frame, Offset)> {
    let region = bbox
        .pad(padding_ratio)
        .pixel_region(frame.width(), frame.height())?;
    Some((frame.crop(region), region.offset()))
}
