//! Decoded video frames and the pixel helpers the pipeline stages share.
//!
//! - `Frame`: an RGB image plus the presentation timestamp it was decoded at.
//! - `GrayPlane`: ITU-R 601 luma used by quality scoring and scene-change checks.
//!
//! Crops always go through `geometry::PixelRegion` so callers get the crop
//! origin back for coordinate remapping.

use anyhow::{anyhow, Result};
use image::{imageops, imageops::FilterType, RgbImage};

use crate::geometry::{BBox, PixelRegion};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded frame. Owns its pixels; cheap to move, explicit to clone.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Presentation timestamp in seconds from the start of the video.
    pub timestamp: f64,
}

impl Frame {
    pub fn new(image: RgbImage, timestamp: f64) -> Self {
        Self { image, timestamp }
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>, timestamp: f64) -> Result<Self> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(anyhow!(
                "rgb buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                expected,
                width,
                height
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("invalid rgb buffer for {}x{}", width, height))?;
        Ok(Self { image, timestamp })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn area(&self) -> f32 {
        self.width() as f32 * self.height() as f32
    }

    pub fn bounds(&self) -> BBox {
        BBox::new(0.0, 0.0, self.width() as f32, self.height() as f32)
    }

    pub fn gray(&self) -> GrayPlane {
        GrayPlane::from_rgb(&self.image)
    }

    /// Copy out a sub-region. The timestamp is carried over.
    pub fn crop(&self, region: PixelRegion) -> Frame {
        let sub = imageops::crop_imm(&self.image, region.x, region.y, region.width, region.height)
            .to_image();
        Frame::new(sub, self.timestamp)
    }

    /// Resize by `scale` (triangle filter). Dimensions never drop below 1px.
    pub fn scaled(&self, scale: f32) -> Frame {
        if (scale - 1.0).abs() < f32::EPSILON {
            return self.clone();
        }
        let w = ((self.width() as f32) * scale).round().max(1.0) as u32;
        let h = ((self.height() as f32) * scale).round().max(1.0) as u32;
        Frame::new(
            imageops::resize(&self.image, w, h, FilterType::Triangle),
            self.timestamp,
        )
    }
}

// ----------------------------------------------------------------------------
// GrayPlane
// ----------------------------------------------------------------------------

/// Single-channel `f32` luma plane, row-major.
#[derive(Clone, Debug)]
pub struct GrayPlane {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl GrayPlane {
    pub fn from_rgb(image: &RgbImage) -> Self {
        let data = image
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .collect();
        Self {
            width: image.width(),
            height: image.height(),
            data,
        }
    }

    #[inline]
    pub fn at(&self, x: u32, y: u32) -> f32 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Mean and population standard deviation of the plane.
    pub fn mean_std(&self) -> (f64, f64) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.data.len() as f64;
        let mean = self.data.iter().map(|v| *v as f64).sum::<f64>() / n;
        let var = self
            .data
            .iter()
            .map(|v| {
                let d = *v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (mean, var.sqrt())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn from_rgb_rejects_short_buffers() {
        assert!(Frame::from_rgb(4, 4, vec![0; 10], 0.0).is_err());
        let frame = Frame::from_rgb(2, 2, vec![255; 12], 1.5).unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 2));
        assert_eq!(frame.timestamp, 1.5);
    }

    #[test]
    fn gray_uses_601_weights() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        let gray = GrayPlane::from_rgb(&img);
        assert!((gray.at(0, 0) - 76.245).abs() < 1e-3);
    }

    #[test]
    fn crop_keeps_timestamp_and_region_size() {
        let frame = Frame::new(RgbImage::new(64, 48), 3.0);
        let crop = frame.crop(PixelRegion {
            x: 10,
            y: 8,
            width: 20,
            height: 16,
        });
        assert_eq!((crop.width(), crop.height()), (20, 16));
        assert_eq!(crop.timestamp, 3.0);
    }

    #[test]
    fn scaled_never_collapses_to_zero() {
        let frame = Frame::new(RgbImage::new(3, 3), 0.0);
        let tiny = frame.scaled(0.01);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }

    #[test]
    fn mean_std_of_flat_plane() {
        let frame = Frame::new(RgbImage::from_pixel(8, 8, Rgb([100, 100, 100])), 0.0);
        let (mean, std) = frame.gray().mean_std();
        assert!((mean - 100.0).abs() < 1e-3);
        assert!(std < 1e-3);
    }
}
