#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use super::{Embedder, Embedding};
use crate::frame::Frame;

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based image embedder (CLIP-style vision tower exported to ONNX).
///
/// Input is `[1, 3, H, W]` RGB scaled to `0..1`; the first output is
/// flattened into the embedding.
pub struct TractEmbedder {
    model: Plan,
    width: u32,
    height: u32,
    dimension: usize,
    model_id: String,
}

impl TractEmbedder {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32, dimension: usize) -> Result<Self> {
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
        let model_id = model_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tract-embedder".to_string());

        Ok(Self {
            model,
            width,
            height,
            dimension,
            model_id,
        })
    }
}

impl Embedder for TractEmbedder {
    fn embed(&self, frame: &Frame) -> Result<Embedding> {
        let resized = imageops::resize(&frame.image, self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor();
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values: Vec<f32> = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .iter()
            .copied()
            .collect();
        if values.len() != self.dimension {
            return Err(anyhow!(
                "model produced {} values, expected {}",
                values.len(),
                self.dimension
            ));
        }
        Ok(Embedding::new(values))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn warm_up(&self) -> Result<()> {
        let blank = Frame::new(image::RgbImage::new(self.width, self.height), 0.0);
        self.embed(&blank).map(|_| ())
    }
}
