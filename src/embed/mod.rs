//! Embedding capabilities: image in, fixed-length vector out.

mod histogram;
#[cfg(feature = "backend-tract")]
mod tract;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

pub use histogram::HistogramEmbedder;
#[cfg(feature = "backend-tract")]
pub use tract::TractEmbedder;

/// An immutable embedding vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Unit-length copy. Zero, empty or non-finite vectors are rejected.
    pub fn l2_normalized(&self) -> Result<Embedding> {
        if self.0.is_empty() {
            return Err(anyhow!("embedding is empty"));
        }
        if self.0.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("embedding contains non-finite values"));
        }
        let norm = self.0.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !(norm > f32::EPSILON) {
            return Err(anyhow!("embedding has zero norm"));
        }
        Ok(Embedding(self.0.iter().map(|v| v / norm).collect()))
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// Embedding model capability. Shared across worker threads.
pub trait Embedder: Send + Sync {
    fn embed(&self, frame: &Frame) -> Result<Embedding>;

    /// Length of every vector `embed` returns.
    fn dimension(&self) -> usize;

    /// Identifier stored alongside catalogs built with this model.
    fn model_id(&self) -> &str;

    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Input size for ONNX embedders loaded from the command line.
pub const EMBEDDER_INPUT_SIZE: u32 = 224;

/// The colour-histogram embedder when `model` is `None`, otherwise an ONNX
/// embedder producing `dimension` values (needs `backend-tract`).
pub fn open_embedder(model: Option<&Path>, dimension: Option<usize>) -> Result<Arc<dyn Embedder>> {
    let Some(path) = model else {
        return Ok(Arc::new(HistogramEmbedder::default()));
    };
    let dimension =
        dimension.ok_or_else(|| anyhow!("{}: embedding dimension is required", path.display()))?;
    open_onnx(path, dimension)
}

#[cfg(feature = "backend-tract")]
fn open_onnx(path: &Path, dimension: usize) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(TractEmbedder::new(
        path,
        EMBEDDER_INPUT_SIZE,
        EMBEDDER_INPUT_SIZE,
        dimension,
    )?))
}

#[cfg(not(feature = "backend-tract"))]
fn open_onnx(path: &Path, _dimension: usize) -> Result<Arc<dyn Embedder>> {
    Err(anyhow!(
        "{}: ONNX embedders need the backend-tract feature",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_yields_unit_vectors() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized().unwrap();
        assert_eq!(e.as_slice(), &[0.6, 0.8]);
    }

    #[test]
    fn degenerate_vectors_are_rejected() {
        assert!(Embedding::new(vec![0.0, 0.0]).l2_normalized().is_err());
        assert!(Embedding::new(vec![f32::NAN, 1.0]).l2_normalized().is_err());
        assert!(Embedding::new(vec![]).l2_normalized().is_err());
    }

    #[test]
    fn default_embedder_is_the_histogram() {
        let embedder = open_embedder(None, None).unwrap();
        assert_eq!(embedder.model_id(), "rgb-hist-2x2x8");
        assert_eq!(embedder.dimension(), 96);
    }
}
