#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::ObjectDetector;
use crate::detect::nms::nms_by_label;
use crate::detect::result::RawDetection;
use crate::frame::Frame;
use crate::geometry::BBox;

type Plan = TypedRunnableModel<TypedModel>;

const DEFAULT_SCORE_FLOOR: f32 = 0.05;
const DEFAULT_NMS_IOU: f32 = 0.45;

/// Tract-based detector for YOLO-style ONNX exports.
///
/// Expects a single `[1, 4 + C, N]` (or `[1, N, 4 + C]`) output of
/// `cx, cy, w, h` in model-input pixels followed by `C` class scores.
/// Frames are resized to the model input; boxes are scaled back.
pub struct TractDetector {
    name: String,
    model: Plan,
    width: u32,
    height: u32,
    labels: Vec<String>,
    score_floor: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        labels: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        if labels.is_empty() {
            return Err(anyhow!("detector {} needs at least one label", model_path.display()));
        }

        Ok(Self {
            name: model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tract".to_string()),
            model,
            width,
            height,
            labels,
            score_floor: DEFAULT_SCORE_FLOOR,
        })
    }

    /// Drop raw candidates below this score before NMS.
    pub fn with_score_floor(mut self, floor: f32) -> Self {
        self.score_floor = floor;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(&frame.image, self.width, self.height, FilterType::Triangle);
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let attrs = 4 + self.labels.len();
        let (n, transposed) = if shape[1] == attrs {
            (shape[2], false)
        } else if shape[2] == attrs {
            (shape[1], true)
        } else {
            return Err(anyhow!(
                "output shape {:?} does not fit {} labels",
                shape,
                self.labels.len()
            ));
        };
        let at = |i: usize, a: usize| -> f32 {
            if transposed {
                view[[0, i, a]]
            } else {
                view[[0, a, i]]
            }
        };

        let sx = frame.width() as f32 / self.width as f32;
        let sy = frame.height() as f32 / self.height as f32;
        let mut found = Vec::new();
        for i in 0..n {
            let (class, score) = (0..self.labels.len())
                .map(|c| (c, at(i, 4 + c)))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if !(score.is_finite() && score >= self.score_floor) {
                continue;
            }
            let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
            let bbox = BBox::new(
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            )
            .clamp_to(frame.width(), frame.height());
            if bbox.is_empty() {
                continue;
            }
            found.push(RawDetection::new(self.labels[class].clone(), bbox, score));
        }
        Ok(nms_by_label(found, DEFAULT_NMS_IOU))
    }
}

impl ObjectDetector for TractDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(&self, frame: &Frame, class_filter: Option<&[&str]>) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let mut found = self.decode(outputs, frame)?;
        if let Some(allowed) = class_filter {
            found.retain(|d| allowed.contains(&d.label.as_str()));
        }
        Ok(found)
    }

    fn warm_up(&self) -> Result<()> {
        let blank = Frame::new(image::RgbImage::new(self.width, self.height), 0.0);
        self.infer(&blank, None).map(|_| ())
    }
}
