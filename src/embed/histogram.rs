use anyhow::{anyhow, Result};

use super::{Embedder, Embedding};
use crate::frame::Frame;

const DEFAULT_GRID: u32 = 2;
const DEFAULT_BINS: usize = 8;

/// CPU colour-histogram embedder.
///
/// The image is split into a `grid x grid` layout; each cell contributes a
/// per-channel histogram of `bins` buckets normalised by the cell's pixel
/// count. Fully deterministic, no model file.
pub struct HistogramEmbedder {
    grid: u32,
    bins: usize,
    model_id: String,
}

impl HistogramEmbedder {
    pub fn new(grid: u32, bins: usize) -> Result<Self> {
        if grid == 0 || bins == 0 || bins > 256 {
            return Err(anyhow!("histogram embedder needs grid >= 1 and 1..=256 bins"));
        }
        Ok(Self {
            grid,
            bins,
            model_id: format!("rgb-hist-{}x{}x{}", grid, grid, bins),
        })
    }
}

impl Default for HistogramEmbedder {
    fn default() -> Self {
        Self {
            grid: DEFAULT_GRID,
            bins: DEFAULT_BINS,
            model_id: format!("rgb-hist-{}x{}x{}", DEFAULT_GRID, DEFAULT_GRID, DEFAULT_BINS),
        }
    }
}

impl Embedder for HistogramEmbedder {
    fn embed(&self, frame: &Frame) -> Result<Embedding> {
        let (w, h) = (frame.width(), frame.height());
        if w == 0 || h == 0 {
            return Err(anyhow!("cannot embed an empty image"));
        }
        let cell_len = 3 * self.bins;
        let mut out = vec![0.0f32; self.dimension()];
        let mut counts = vec![0u32; (self.grid * self.grid) as usize];
        for (x, y, px) in frame.image.enumerate_pixels() {
            let gx = (x * self.grid / w).min(self.grid - 1);
            let gy = (y * self.grid / h).min(self.grid - 1);
            let cell = (gy * self.grid + gx) as usize;
            counts[cell] += 1;
            let base = cell * cell_len;
            for channel in 0..3 {
                let bin = px[channel] as usize * self.bins / 256;
                out[base + channel * self.bins + bin] += 1.0;
            }
        }
        for (cell, count) in counts.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let scale = 1.0 / *count as f32;
            for v in &mut out[cell * cell_len..(cell + 1) * cell_len] {
                *v *= scale;
            }
        }
        Ok(Embedding::new(out))
    }

    fn dimension(&self) -> usize {
        (self.grid * self.grid) as usize * 3 * self.bins
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn dimension_matches_output() {
        let e = HistogramEmbedder::default();
        let v = e.embed(&Frame::new(RgbImage::new(10, 7), 0.0)).unwrap();
        assert_eq!(v.dimension(), e.dimension());
        assert_eq!(e.dimension(), 96);
    }

    #[test]
    fn different_colours_embed_differently() {
        let e = HistogramEmbedder::new(1, 4).unwrap();
        let red = e
            .embed(&Frame::new(RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])), 0.0))
            .unwrap();
        let blue = e
            .embed(&Frame::new(RgbImage::from_pixel(4, 4, Rgb([0, 0, 255])), 0.0))
            .unwrap();
        assert_ne!(red, blue);
        assert_eq!(red.as_slice()[3], 1.0);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(HistogramEmbedder::new(0, 8).is_err());
        assert!(HistogramEmbedder::new(2, 0).is_err());
    }
}
