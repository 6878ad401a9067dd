//! Frame quality scoring and the per-interval best-frame search.
//!
//! A frame is scored on three signals computed over its ITU-R 601 luma plane:
//!
//! - sharpness: variance of the 4-neighbour Laplacian (reflect-101 borders)
//! - brightness: mean intensity (0..255)
//! - contrast: standard deviation of intensity
//!
//! The weighted score is `0.5 * sharpness + 0.3 * brightness + 0.2 * contrast`
//! after each is normalised into `[0, 1]`. Pass/fail is decided on the raw
//! sharpness and brightness values.

use anyhow::Result;
use image::imageops::{self, FilterType};
use serde::Serialize;
use std::cmp::Ordering;

use crate::config::QualitySettings;
use crate::frame::{Frame, GrayPlane};

const WEIGHT_SHARPNESS: f64 = 0.5;
const WEIGHT_BRIGHTNESS: f64 = 0.3;
const WEIGHT_CONTRAST: f64 = 0.2;

/// Default mean-absolute-difference threshold for [`scene_changed`].
pub const DEFAULT_SCENE_THRESHOLD: f64 = 30.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct QualityMetrics {
    pub sharpness: f64,
    pub brightness: f64,
    pub contrast: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityAssessment {
    pub passes: bool,
    /// Weighted score in `[0, 1]`.
    pub score: f64,
    pub metrics: QualityMetrics,
}

pub struct QualityAssessor {
    settings: QualitySettings,
}

impl QualityAssessor {
    pub fn new(settings: QualitySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    pub fn assess(&self, frame: &Frame) -> QualityAssessment {
        if !self.settings.enabled {
            return QualityAssessment {
                passes: true,
                score: 1.0,
                metrics: QualityMetrics::default(),
            };
        }
        let metrics = measure(&frame.gray());
        self.assess_metrics(metrics)
    }

    pub fn assess_metrics(&self, metrics: QualityMetrics) -> QualityAssessment {
        let s = &self.settings;
        let sharpness_norm = (metrics.sharpness / s.sharpness_ceiling).min(1.0);
        let mid = (s.min_brightness + s.max_brightness) / 2.0;
        let half_range = (s.max_brightness - s.min_brightness) / 2.0;
        let brightness_norm = if half_range > 0.0 {
            (1.0 - (metrics.brightness - mid).abs() / half_range).max(0.0)
        } else {
            0.0
        };
        let contrast_norm = (metrics.contrast / s.contrast_ceiling).min(1.0);

        let score = (WEIGHT_SHARPNESS * sharpness_norm
            + WEIGHT_BRIGHTNESS * brightness_norm
            + WEIGHT_CONTRAST * contrast_norm)
            .clamp(0.0, 1.0);
        let passes = metrics.sharpness >= s.blur_threshold
            && metrics.brightness >= s.min_brightness
            && metrics.brightness <= s.max_brightness;

        QualityAssessment {
            passes,
            score,
            metrics,
        }
    }
}

/// Raw sharpness/brightness/contrast of a luma plane.
pub fn measure(gray: &GrayPlane) -> QualityMetrics {
    let (brightness, contrast) = gray.mean_std();
    QualityMetrics {
        sharpness: laplacian_variance(gray),
        brightness,
        contrast,
    }
}

/// Variance of the discrete Laplacian `[0,1,0; 1,-4,1; 0,1,0]`.
pub fn laplacian_variance(gray: &GrayPlane) -> f64 {
    if gray.is_empty() {
        return 0.0;
    }
    let w = gray.width as i64;
    let h = gray.height as i64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        let up = reflect101(y - 1, h);
        let down = reflect101(y + 1, h);
        for x in 0..w {
            let left = reflect101(x - 1, w);
            let right = reflect101(x + 1, w);
            let c = gray.at(x as u32, y as u32) as f64;
            let lap = gray.at(x as u32, up) as f64
                + gray.at(x as u32, down) as f64
                + gray.at(left, y as u32) as f64
                + gray.at(right, y as u32) as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let n = (w * h) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn reflect101(i: i64, n: i64) -> u32 {
    if n == 1 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r as u32
}

/// True when the mean absolute luma difference between two frames exceeds
/// `threshold`. Frames of different sizes are compared at `a`'s resolution.
pub fn scene_changed(a: &Frame, b: &Frame, threshold: f64) -> bool {
    let ga = a.gray();
    let gb = if a.width() == b.width() && a.height() == b.height() {
        b.gray()
    } else {
        let resized = imageops::resize(&b.image, a.width(), a.height(), FilterType::Triangle);
        GrayPlane::from_rgb(&resized)
    };
    if ga.is_empty() {
        return false;
    }
    let diff: f64 = ga
        .data
        .iter()
        .zip(gb.data.iter())
        .map(|(x, y)| (*x as f64 - *y as f64).abs())
        .sum();
    diff / ga.data.len() as f64 > threshold
}

// ----------------------------------------------------------------------------
// Best-frame search
// ----------------------------------------------------------------------------

/// A frame evaluated during the search.
#[derive(Clone, Debug)]
pub struct FrameCandidate {
    pub timestamp: f64,
    pub frame: Frame,
    pub assessment: QualityAssessment,
}

/// Orders candidates best-first: higher score, then closer to `nominal`,
/// then earlier.
pub fn rank_candidates(a: &FrameCandidate, b: &FrameCandidate, nominal: f64) -> Ordering {
    b.assessment
        .score
        .total_cmp(&a.assessment.score)
        .then_with(|| {
            (a.timestamp - nominal)
                .abs()
                .total_cmp(&(b.timestamp - nominal).abs())
        })
        .then_with(|| a.timestamp.total_cmp(&b.timestamp))
}

/// Timestamps the search may evaluate for one interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SearchWindow {
    pub nominal: f64,
    /// `max(start - radius, 0)`.
    pub lower: f64,
    /// `min(end + radius, duration)`.
    pub upper: f64,
    pub range: f64,
    pub step: f64,
}

impl SearchWindow {
    pub fn new(start: f64, end: f64, radius: f64, duration: f64, step: f64) -> Self {
        Self {
            nominal: start,
            lower: (start - radius).max(0.0),
            upper: (end + radius).min(duration),
            range: radius,
            step,
        }
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.lower && t <= self.upper
    }

    /// Ring `k` of the outward search: the nominal time for `k = 0`, else
    /// `nominal + k*step` then `nominal - k*step`, dropping anything outside
    /// the window.
    pub fn ring(&self, k: u32) -> Vec<f64> {
        if k == 0 {
            return if self.contains(self.nominal) {
                vec![self.nominal]
            } else {
                Vec::new()
            };
        }
        let delta = k as f64 * self.step;
        [self.nominal + delta, self.nominal - delta]
            .into_iter()
            .filter(|t| self.contains(*t))
            .collect()
    }

    pub fn max_ring(&self) -> u32 {
        if self.step <= 0.0 || self.range <= 0.0 {
            return 0;
        }
        (self.range / self.step + 1e-9).floor() as u32
    }
}

#[derive(Debug)]
pub struct SearchOutcome {
    /// Winning candidate; `None` when nothing in the window decoded.
    pub selected: Option<FrameCandidate>,
    /// Whether the winner passed the quality thresholds.
    pub passed: bool,
    /// Every timestamp handed to `fetch`, in evaluation order.
    pub evaluated: Vec<f64>,
}

/// Search outward from the window's nominal time for the best frame.
///
/// `fetch` decodes the frame nearest a timestamp, returning `Ok(None)` at end
/// of stream. Errors from `fetch` abort the search.
pub fn search_best_frame<F>(
    window: &SearchWindow,
    assessor: &QualityAssessor,
    mut fetch: F,
) -> Result<SearchOutcome>
where
    F: FnMut(f64) -> Result<Option<Frame>>,
{
    let mut evaluated = Vec::new();
    let mut candidates: Vec<FrameCandidate> = Vec::new();

    let max_ring = if assessor.settings().enabled {
        window.max_ring()
    } else {
        0
    };

    for k in 0..=max_ring {
        let mut ring_passed = false;
        for t in window.ring(k) {
            evaluated.push(t);
            let Some(frame) = fetch(t)? else {
                continue;
            };
            let assessment = assessor.assess(&frame);
            ring_passed |= assessment.passes;
            candidates.push(FrameCandidate {
                timestamp: t,
                frame,
                assessment,
            });
        }
        if ring_passed {
            break;
        }
    }

    let nominal = window.nominal;
    let best_passing = candidates
        .iter()
        .filter(|c| c.assessment.passes)
        .min_by(|a, b| rank_candidates(a, b, nominal))
        .cloned();
    let (selected, passed) = match best_passing {
        Some(c) => (Some(c), true),
        None => (
            candidates
                .iter()
                .min_by(|a, b| rank_candidates(a, b, nominal))
                .cloned(),
            false,
        ),
    };
    if let Some(c) = &selected {
        log::debug!(
            "interval @{:.3}s: selected {:.3}s score={:.3} passed={} ({} evaluated)",
            nominal,
            c.timestamp,
            c.assessment.score,
            passed,
            evaluated.len()
        );
    }
    Ok(SearchOutcome {
        selected,
        passed,
        evaluated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use image::{Rgb, RgbImage};

    fn assessor() -> QualityAssessor {
        QualityAssessor::new(PipelineConfig::default().quality)
    }

    fn checkerboard(size: u32, cell: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Rgb([230, 230, 230])
            } else {
                Rgb([20, 20, 20])
            }
        })
    }

    #[test]
    fn flat_frame_has_zero_sharpness() {
        let frame = Frame::new(RgbImage::from_pixel(32, 32, Rgb([128, 128, 128])), 0.0);
        let m = measure(&frame.gray());
        assert!(m.sharpness.abs() < 1e-6);
        assert!((m.brightness - 128.0).abs() < 1e-3);
    }

    #[test]
    fn sharpness_decreases_under_blur() {
        let base = checkerboard(64, 4);
        let mut last = laplacian_variance(&GrayPlane::from_rgb(&base));
        assert!(last > 0.0);
        for sigma in [1.0f32, 1.5, 2.5] {
            let blurred = imageops::blur(&base, sigma);
            let s = laplacian_variance(&GrayPlane::from_rgb(&blurred));
            assert!(s >= 0.0);
            assert!(s < last, "sigma {} gave {} >= {}", sigma, s, last);
            last = s;
        }
    }

    #[test]
    fn dark_frame_fails_and_sharp_bright_frame_passes() {
        let a = assessor();
        let dark = Frame::new(RgbImage::new(32, 32), 0.0);
        let r = a.assess(&dark);
        assert!(!r.passes);

        let sharp = Frame::new(checkerboard(64, 2), 0.0);
        let r = a.assess(&sharp);
        assert!(r.passes);
        assert!(r.score > 0.5 && r.score <= 1.0);
    }

    #[test]
    fn disabled_check_passes_everything() {
        let mut settings = PipelineConfig::default().quality;
        settings.enabled = false;
        let a = QualityAssessor::new(settings);
        let r = a.assess(&Frame::new(RgbImage::new(8, 8), 0.0));
        assert!(r.passes);
        assert_eq!(r.score, 1.0);
    }

    #[test]
    fn ring_stays_inside_clipped_window() {
        let w = SearchWindow::new(0.0, 5.0, 1.0, 20.0, 0.25);
        assert_eq!(w.lower, 0.0);
        assert_eq!(w.ring(1), vec![0.25]);
        assert_eq!(w.max_ring(), 4);
    }

    #[test]
    fn search_prefers_passing_frame_over_nominal() {
        let window = SearchWindow::new(10.0, 15.0, 1.0, 30.0, 0.5);
        let outcome = search_best_frame(&window, &assessor(), |t| {
            let img = if (t - 10.5).abs() < 1e-6 {
                checkerboard(64, 2)
            } else {
                RgbImage::new(64, 64)
            };
            Ok(Some(Frame::new(img, t)))
        })
        .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.selected.unwrap().timestamp, 10.5);
        assert_eq!(outcome.evaluated, vec![10.0, 10.5, 9.5]);
    }

    #[test]
    fn search_without_decodable_frames_selects_nothing() {
        let window = SearchWindow::new(0.0, 5.0, 1.0, 5.0, 0.5);
        let outcome = search_best_frame(&window, &assessor(), |_| Ok(None)).unwrap();
        assert!(outcome.selected.is_none());
        assert!(!outcome.passed);
        assert!(outcome.evaluated.iter().all(|t| window.contains(*t)));
    }

    #[test]
    fn ties_prefer_closest_then_earliest() {
        let a = assessor();
        let frame = Frame::new(RgbImage::new(4, 4), 0.0);
        let assessment = a.assess(&frame);
        let mk = |t: f64| FrameCandidate {
            timestamp: t,
            frame: frame.clone(),
            assessment,
        };
        assert_eq!(rank_candidates(&mk(9.5), &mk(10.5), 10.0), Ordering::Less);
        assert_eq!(rank_candidates(&mk(10.0), &mk(9.5), 10.0), Ordering::Less);
    }

    #[test]
    fn scene_change_detects_cut() {
        let black = Frame::new(RgbImage::new(16, 16), 0.0);
        let white = Frame::new(RgbImage::from_pixel(8, 8, Rgb([255, 255, 255])), 1.0);
        assert!(scene_changed(&black, &white, DEFAULT_SCENE_THRESHOLD));
        assert!(!scene_changed(&black, &black, DEFAULT_SCENE_THRESHOLD));
    }
}
