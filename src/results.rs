//! Per-interval result records, the video report and its persistence.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

use crate::detect::ItemDetection;
use crate::frame::Frame;
use crate::gate::PersonDetection;
use crate::index::ProductMatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    None,
    LowQuality,
    NoPerson,
    InferenceError,
    Timeout,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::None => "none",
            SkipReason::LowQuality => "low_quality",
            SkipReason::NoPerson => "no_person",
            SkipReason::InferenceError => "inference_error",
            SkipReason::Timeout => "timeout",
        }
    }
}

/// One detected item and its ranked catalog matches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    #[serde(flatten)]
    pub item: ItemDetection,
    /// Descending by score, at most `top_k` long.
    pub matches: Vec<ProductMatch>,
}

/// The outcome of one sampling interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntervalResult {
    /// Nominal interval time in seconds.
    pub timestamp: f64,
    pub skip_reason: SkipReason,
    /// Timestamp of the frame that was actually analysed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<PersonDetection>,
    #[serde(default)]
    pub items: Vec<MatchResult>,
}

impl IntervalResult {
    pub fn skipped(timestamp: f64, reason: SkipReason) -> Self {
        Self {
            timestamp,
            skip_reason: reason,
            frame_timestamp: None,
            quality_score: None,
            person: None,
            items: Vec::new(),
        }
    }

    pub fn is_processed(&self) -> bool {
        self.skip_reason == SkipReason::None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub intervals: usize,
    pub processed: usize,
    pub skipped_quality: usize,
    pub skipped_no_person: usize,
    pub skipped_error: usize,
    pub skipped_timeout: usize,
}

impl Totals {
    pub fn from_results(results: &[IntervalResult]) -> Self {
        let mut t = Totals {
            intervals: results.len(),
            ..Totals::default()
        };
        for r in results {
            match r.skip_reason {
                SkipReason::None => t.processed += 1,
                SkipReason::LowQuality => t.skipped_quality += 1,
                SkipReason::NoPerson => t.skipped_no_person += 1,
                SkipReason::InferenceError => t.skipped_error += 1,
                SkipReason::Timeout => t.skipped_timeout += 1,
            }
        }
        t
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoReport {
    pub video: String,
    pub duration: f64,
    pub interval_seconds: f64,
    pub results: Vec<IntervalResult>,
    pub totals: Totals,
}

impl VideoReport {
    pub fn new(video: String, duration: f64, interval_seconds: f64, mut results: Vec<IntervalResult>) -> Self {
        results.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        let totals = Totals::from_results(&results);
        Self {
            video,
            duration,
            interval_seconds,
            results,
            totals,
        }
    }
}

pub fn write_report(path: &Path, report: &VideoReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report)?;
    fs::write(path, json).with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(())
}

pub fn load_report(path: &Path) -> Result<VideoReport> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read report {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("invalid report {}: {}", path.display(), e))
}

/// The processed interval nearest to `time`.
///
/// `time` is snapped to the interval grid first; intervals further than two
/// interval lengths from the snapped time are not considered.
pub fn lookup(report: &VideoReport, time: f64) -> Option<&IntervalResult> {
    let interval = report.interval_seconds;
    if !(interval > 0.0) || !time.is_finite() {
        return None;
    }
    let snapped = (time / interval).round() * interval;
    report
        .results
        .iter()
        .filter(|r| r.is_processed())
        .map(|r| ((r.timestamp - snapped).abs(), r))
        .filter(|(d, _)| *d <= 2.0 * interval)
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, r)| r)
}

/// A product seen anywhere in the video, represented by its most confident
/// detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UniqueProduct {
    pub product_id: String,
    pub category: String,
    pub label: String,
    pub score: f32,
    pub confidence: f32,
    pub timestamp: f64,
}

/// Collapse all matches by top-1 product id, keeping the most confident
/// detection. Products are listed in first-seen order.
pub fn unique_products(report: &VideoReport) -> Vec<UniqueProduct> {
    let mut out: Vec<UniqueProduct> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    for result in report.results.iter().filter(|r| r.is_processed()) {
        for item in &result.items {
            let Some(top) = item.matches.first() else {
                continue;
            };
            let candidate = UniqueProduct {
                product_id: top.product_id.clone(),
                category: item.item.category.clone(),
                label: item.item.label.clone(),
                score: top.score,
                confidence: item.item.confidence,
                timestamp: result.timestamp,
            };
            match by_id.get(&top.product_id) {
                Some(&slot) => {
                    if candidate.confidence > out[slot].confidence {
                        out[slot] = candidate;
                    }
                }
                None => {
                    by_id.insert(top.product_id.clone(), out.len());
                    out.push(candidate);
                }
            }
        }
    }
    out
}

/// Writes winning frames and item crops as JPEG files.
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create artifacts dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn save_frame(&self, interval: usize, frame: &Frame) -> Result<PathBuf> {
        let path = self
            .dir
            .join(format!("interval_{:05}_{:.2}s.jpg", interval, frame.timestamp));
        self.write(&path, frame)?;
        Ok(path)
    }

    pub fn save_crop(&self, interval: usize, item: usize, label: &str, crop: &Frame) -> Result<PathBuf> {
        let path = self.dir.join(format!(
            "interval_{:05}_item{:02}_{}.jpg",
            interval,
            item,
            sanitize(label)
        ));
        self.write(&path, crop)?;
        Ok(path)
    }

    fn write(&self, path: &Path, frame: &Frame) -> Result<()> {
        frame
            .image
            .save_with_format(path, ImageFormat::Jpeg)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;

    fn processed(ts: f64, items: Vec<MatchResult>) -> IntervalResult {
        IntervalResult {
            timestamp: ts,
            skip_reason: SkipReason::None,
            frame_timestamp: Some(ts),
            quality_score: Some(0.9),
            person: None,
            items,
        }
    }

    fn item(label: &str, confidence: f32, top: &str) -> MatchResult {
        MatchResult {
            item: ItemDetection {
                label: label.to_string(),
                category: "clothing".to_string(),
                bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
                confidence,
            },
            matches: vec![ProductMatch {
                product_id: top.to_string(),
                score: 0.9,
            }],
        }
    }

    fn report(results: Vec<IntervalResult>) -> VideoReport {
        VideoReport::new("stub://t".to_string(), 30.0, 5.0, results)
    }

    #[test]
    fn serialised_shape_matches_wire_format() {
        let r = processed(5.0, vec![item("shirt", 0.8, "sku-1")]);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["skip_reason"], "none");
        assert_eq!(v["items"][0]["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(v["items"][0]["matches"][0]["product_id"], "sku-1");
        let skipped = serde_json::to_value(IntervalResult::skipped(0.0, SkipReason::NoPerson)).unwrap();
        assert_eq!(skipped["skip_reason"], "no_person");
        assert!(skipped.get("person").is_none());
    }

    #[test]
    fn totals_count_every_reason() {
        let rep = report(vec![
            processed(0.0, vec![]),
            IntervalResult::skipped(5.0, SkipReason::LowQuality),
            IntervalResult::skipped(10.0, SkipReason::Timeout),
        ]);
        assert_eq!(rep.totals.intervals, 3);
        assert_eq!(rep.totals.processed, 1);
        assert_eq!(rep.totals.skipped_quality, 1);
        assert_eq!(rep.totals.skipped_timeout, 1);
    }

    #[test]
    fn lookup_snaps_to_grid_and_skips_unprocessed() {
        let rep = report(vec![
            processed(0.0, vec![]),
            IntervalResult::skipped(5.0, SkipReason::NoPerson),
            processed(10.0, vec![]),
        ]);
        assert_eq!(lookup(&rep, 9.0).unwrap().timestamp, 10.0);
        assert_eq!(lookup(&rep, 1.0).unwrap().timestamp, 0.0);
        assert!(lookup(&rep, 40.0).is_none());
    }

    #[test]
    fn unique_products_keep_most_confident() {
        let rep = report(vec![
            processed(0.0, vec![item("shirt", 0.5, "sku-1")]),
            processed(5.0, vec![item("shirt", 0.9, "sku-1"), item("hat", 0.7, "sku-2")]),
        ]);
        let unique = unique_products(&rep);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].product_id, "sku-1");
        assert_eq!(unique[0].timestamp, 5.0);
        assert_eq!(unique[1].product_id, "sku-2");
    }

    #[test]
    fn report_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");
        let rep = report(vec![processed(0.0, vec![item("shirt", 0.5, "sku-1")])]);
        write_report(&path, &rep).unwrap();
        assert_eq!(load_report(&path).unwrap(), rep);
    }

    #[test]
    fn artifacts_are_written_as_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::create(&dir.path().join("art")).unwrap();
        let frame = Frame::new(image::RgbImage::new(8, 8), 1.0);
        let p = writer.save_crop(3, 0, "gold ring", &frame).unwrap();
        assert!(p.ends_with("interval_00003_item00_gold_ring.jpg"));
        assert!(p.is_file());
    }
}
