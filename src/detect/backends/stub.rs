use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::detect::backend::ObjectDetector;
use crate::detect::result::RawDetection;
use crate::frame::Frame;
use crate::geometry::BBox;

/// One scripted detection.
///
/// The box is given relative to the input image (`0..1` on each axis) so the
/// same rule scales with crops and multi-scale passes.
#[derive(Clone, Debug, Deserialize)]
pub struct StubRule {
    pub label: String,
    pub rel_box: [f32; 4],
    pub confidence: f32,
    /// Only fire for frames whose timestamp is in `[from, to]`.
    #[serde(default)]
    pub during: Option<(f64, f64)>,
    /// Only fire when the input width is in `[min, max]` pixels.
    #[serde(default)]
    pub input_width: Option<(u32, u32)>,
}

impl StubRule {
    pub fn new(label: &str, rel_box: [f32; 4], confidence: f32) -> Self {
        Self {
            label: label.to_string(),
            rel_box,
            confidence,
            during: None,
            input_width: None,
        }
    }

    pub fn during(mut self, from: f64, to: f64) -> Self {
        self.during = Some((from, to));
        self
    }

    pub fn for_input_width(mut self, min: u32, max: u32) -> Self {
        self.input_width = Some((min, max));
        self
    }

    fn fires(&self, frame: &Frame) -> bool {
        let time_ok = self
            .during
            .map_or(true, |(from, to)| frame.timestamp >= from && frame.timestamp <= to);
        let width_ok = self
            .input_width
            .map_or(true, |(min, max)| frame.width() >= min && frame.width() <= max);
        time_ok && width_ok
    }
}

/// Scripted detector for tests and demos.
///
/// Emits its rules verbatim, can be told to fail the first N calls or to
/// sleep per call, and counts calls and lifecycle hooks.
pub struct StubDetector {
    name: String,
    rules: Vec<StubRule>,
    fail_remaining: AtomicUsize,
    delay: Duration,
    calls: AtomicUsize,
    warmed: AtomicBool,
    shut_down: AtomicBool,
}

impl StubDetector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            fail_remaining: AtomicUsize::new(0),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            warmed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Load a JSON array of rules. The detector is named after the file stem.
    pub fn from_rules_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stub rules {}", path.display()))?;
        let rules: Vec<StubRule> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid stub rules {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stub".to_string());
        Ok(Self::new(&name).with_rules(rules))
    }

    pub fn with_rule(mut self, rule: StubRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = StubRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// Fail the next `n` calls with an error.
    pub fn failing_first(self, n: usize) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn was_warmed(&self) -> bool {
        self.warmed.load(Ordering::SeqCst)
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl ObjectDetector for StubDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(&self, frame: &Frame, class_filter: Option<&[&str]>) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("stub detector '{}' injected failure", self.name));
        }

        let w = frame.width() as f32;
        let h = frame.height() as f32;
        Ok(self
            .rules
            .iter()
            .filter(|rule| rule.fires(frame))
            .filter(|rule| class_filter.map_or(true, |allowed| allowed.contains(&rule.label.as_str())))
            .map(|rule| {
                let [x1, y1, x2, y2] = rule.rel_box;
                RawDetection::new(
                    rule.label.clone(),
                    BBox::new(x1 * w, y1 * h, x2 * w, y2 * h),
                    rule.confidence,
                )
            })
            .collect())
    }

    fn warm_up(&self) -> Result<()> {
        self.warmed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn rules_scale_with_input_and_respect_filter() {
        let stub = StubDetector::new("person")
            .with_rule(StubRule::new("person", [0.25, 0.0, 0.75, 1.0], 0.9))
            .with_rule(StubRule::new("dog", [0.0, 0.0, 0.1, 0.1], 0.9));
        let frame = Frame::new(RgbImage::new(200, 100), 0.0);
        let found = stub.infer(&frame, Some(&["person"])).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bbox, BBox::new(50.0, 0.0, 150.0, 100.0));
        assert_eq!(stub.infer(&frame, None).unwrap().len(), 2);
    }

    #[test]
    fn injected_failures_run_out() {
        let stub = StubDetector::new("flaky").failing_first(1);
        let frame = Frame::new(RgbImage::new(4, 4), 0.0);
        assert!(stub.infer(&frame, None).is_err());
        assert!(stub.infer(&frame, None).is_ok());
        assert_eq!(stub.calls(), 2);
    }

    #[test]
    fn time_window_gates_rules() {
        let stub = StubDetector::new("person")
            .with_rule(StubRule::new("person", [0.0, 0.0, 1.0, 1.0], 0.9).during(5.0, 6.0));
        assert!(stub
            .infer(&Frame::new(RgbImage::new(4, 4), 1.0), None)
            .unwrap()
            .is_empty());
        assert_eq!(
            stub.infer(&Frame::new(RgbImage::new(4, 4), 5.5), None)
                .unwrap()
                .len(),
            1
        );
    }
}
