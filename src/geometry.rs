//! Pixel-space geometry shared by the gate, the item detector and the matcher.
//!
//! Boxes are `(x1, y1, x2, y2)` corners in pixels. Every translation between
//! coordinate systems (scaled detector input → crop, crop → original frame)
//! goes through [`remap`], so there is exactly one place that does the
//! arithmetic.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
///
/// Serialises as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Clamp the box to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let w = width as f32;
        let h = height as f32;
        let x1 = self.x1.clamp(0.0, w);
        let y1 = self.y1.clamp(0.0, h);
        BBox {
            x1,
            y1,
            x2: self.x2.clamp(x1, w),
            y2: self.y2.clamp(y1, h),
        }
    }

    /// Grow the box by `ratio` of its own width/height on every side.
    pub fn pad(&self, ratio: f32) -> BBox {
        let pad_x = (self.width() * ratio).floor();
        let pad_y = (self.height() * ratio).floor();
        BBox {
            x1: self.x1 - pad_x,
            y1: self.y1 - pad_y,
            x2: self.x2 + pad_x,
            y2: self.y2 + pad_y,
        }
    }

    /// Integer pixel region `(x, y, w, h)` covering the box inside a
    /// `width x height` image. `None` when nothing remains after clamping.
    pub fn pixel_region(&self, width: u32, height: u32) -> Option<PixelRegion> {
        let clamped = self.clamp_to(width, height);
        let x = clamped.x1.floor() as u32;
        let y = clamped.y1.floor() as u32;
        let x_end = (clamped.x2.ceil() as u32).min(width);
        let y_end = (clamped.y2.ceil() as u32).min(height);
        if x_end <= x || y_end <= y {
            return None;
        }
        Some(PixelRegion {
            x,
            y,
            width: x_end - x,
            height: y_end - y,
        })
    }

    /// True when the box lies fully inside `[0, width] x [0, height]`.
    pub fn within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0.0
            && self.y1 >= 0.0
            && self.x2 <= width as f32
            && self.y2 <= height as f32
            && self.x1 <= self.x2
            && self.y1 <= self.y2
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Origin of a sub-region inside its parent image.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Offset {
    pub x: f32,
    pub y: f32,
}

impl Offset {
    pub const ZERO: Offset = Offset { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Integer crop rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRegion {
    pub fn offset(&self) -> Offset {
        Offset::new(self.x as f32, self.y as f32)
    }

    pub fn as_bbox(&self) -> BBox {
        BBox::new(
            self.x as f32,
            self.y as f32,
            (self.x + self.width) as f32,
            (self.y + self.height) as f32,
        )
    }
}

/// Map a box found in a scaled sub-image back into its parent.
///
/// `scale` is the factor the sub-image was resized by before detection
/// (1.0 when unscaled) and `offset` is the sub-image origin in the parent.
pub fn remap(b: BBox, scale: f32, offset: Offset) -> BBox {
    let inv = if scale > 0.0 { 1.0 / scale } else { 1.0 };
    BBox {
        x1: b.x1 * inv + offset.x,
        y1: b.y1 * inv + offset.y,
        x2: b.x2 * inv + offset.x,
        y2: b.y2 * inv + offset.y,
    }
}
