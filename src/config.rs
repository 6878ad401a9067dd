use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_ENV: &str = "REELMATCH_CONFIG";

const DEFAULT_INTERVAL_SECONDS: f64 = 5.0;
const DEFAULT_BLUR_THRESHOLD: f64 = 100.0;
const DEFAULT_MIN_BRIGHTNESS: f64 = 40.0;
const DEFAULT_MAX_BRIGHTNESS: f64 = 220.0;
const DEFAULT_FALLBACK_SEARCH_RANGE: f64 = 1.0;
const DEFAULT_SHARPNESS_CEILING: f64 = 1000.0;
const DEFAULT_CONTRAST_CEILING: f64 = 80.0;
const DEFAULT_PERSON_CONFIDENCE: f32 = 0.7;
const DEFAULT_MIN_PERSON_AREA: f32 = 0.05;
const DEFAULT_CROP_PADDING_RATIO: f32 = 0.05;
const DEFAULT_ITEM_CONFIDENCE: f32 = 0.4;
const DEFAULT_NMS_IOU: f32 = 0.5;
const DEFAULT_TOP_K: usize = 5;
const MAX_DEFAULT_WORKERS: usize = 8;
const DEFAULT_INTERVAL_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;

/// On-disk shape. Every key is optional; missing keys take the defaults above.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    interval_seconds: Option<f64>,
    blur_threshold: Option<f64>,
    min_brightness: Option<f64>,
    max_brightness: Option<f64>,
    fallback_search_range: Option<f64>,
    enable_quality_check: Option<bool>,
    strict_quality: Option<bool>,
    search_step_seconds: Option<f64>,
    sharpness_ceiling: Option<f64>,
    contrast_ceiling: Option<f64>,
    person_confidence_threshold: Option<f32>,
    min_person_area: Option<f32>,
    crop_padding_ratio: Option<f32>,
    item_confidence_threshold: Option<f32>,
    nms_iou_threshold: Option<f32>,
    multi_scale_factors: Option<Vec<f32>>,
    top_k: Option<usize>,
    catalog_db: Option<PathBuf>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    interval_timeout_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    serialize_inference: Option<bool>,
    artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub interval_seconds: f64,
    pub quality: QualitySettings,
    pub person: PersonSettings,
    pub detection: DetectionSettings,
    pub matching: MatchSettings,
    pub runtime: RuntimeSettings,
    pub artifacts_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct QualitySettings {
    pub enabled: bool,
    pub blur_threshold: f64,
    pub min_brightness: f64,
    pub max_brightness: f64,
    pub fallback_search_range: f64,
    pub search_step_seconds: Option<f64>,
    pub sharpness_ceiling: f64,
    pub contrast_ceiling: f64,
    /// Skip the interval as `low_quality` when no candidate passes.
    pub strict: bool,
}

#[derive(Debug, Clone)]
pub struct PersonSettings {
    pub confidence_threshold: f32,
    pub min_area: f32,
    pub crop_padding_ratio: f32,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub item_confidence_threshold: f32,
    pub nms_iou_threshold: f32,
    pub multi_scale_factors: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub top_k: usize,
    pub catalog_db: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub interval_timeout: Duration,
    pub retry_backoff: Duration,
    pub serialize_inference: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

impl PipelineConfig {
    /// Load from `REELMATCH_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        Self::finish(file_cfg.unwrap_or_default())
    }

    /// Load a specific file, then environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::finish(read_config_file(path)?)
    }

    fn finish(file: PipelineConfigFile) -> Result<Self> {
        let mut cfg = Self::from_file(file);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let quality = QualitySettings {
            enabled: file.enable_quality_check.unwrap_or(true),
            blur_threshold: file.blur_threshold.unwrap_or(DEFAULT_BLUR_THRESHOLD),
            min_brightness: file.min_brightness.unwrap_or(DEFAULT_MIN_BRIGHTNESS),
            max_brightness: file.max_brightness.unwrap_or(DEFAULT_MAX_BRIGHTNESS),
            fallback_search_range: file
                .fallback_search_range
                .unwrap_or(DEFAULT_FALLBACK_SEARCH_RANGE),
            search_step_seconds: file.search_step_seconds,
            sharpness_ceiling: file.sharpness_ceiling.unwrap_or(DEFAULT_SHARPNESS_CEILING),
            contrast_ceiling: file.contrast_ceiling.unwrap_or(DEFAULT_CONTRAST_CEILING),
            strict: file.strict_quality.unwrap_or(false),
        };
        let person = PersonSettings {
            confidence_threshold: file
                .person_confidence_threshold
                .unwrap_or(DEFAULT_PERSON_CONFIDENCE),
            min_area: file.min_person_area.unwrap_or(DEFAULT_MIN_PERSON_AREA),
            crop_padding_ratio: file
                .crop_padding_ratio
                .unwrap_or(DEFAULT_CROP_PADDING_RATIO),
        };
        let detection = DetectionSettings {
            item_confidence_threshold: file
                .item_confidence_threshold
                .unwrap_or(DEFAULT_ITEM_CONFIDENCE),
            nms_iou_threshold: file.nms_iou_threshold.unwrap_or(DEFAULT_NMS_IOU),
            multi_scale_factors: file.multi_scale_factors.unwrap_or_else(|| vec![1.0]),
        };
        let matching = MatchSettings {
            top_k: file.top_k.unwrap_or(DEFAULT_TOP_K),
            catalog_db: file.catalog_db,
        };
        let workers = file.workers.unwrap_or_else(default_workers);
        let runtime = RuntimeSettings {
            workers,
            queue_capacity: file.queue_capacity.unwrap_or(workers * 2),
            interval_timeout: Duration::from_millis(
                file.interval_timeout_ms
                    .unwrap_or(DEFAULT_INTERVAL_TIMEOUT_MS),
            ),
            retry_backoff: Duration::from_millis(
                file.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            ),
            serialize_inference: file.serialize_inference.unwrap_or(false),
        };
        Self {
            interval_seconds: file.interval_seconds.unwrap_or(DEFAULT_INTERVAL_SECONDS),
            quality,
            person,
            detection,
            matching,
            runtime,
            artifacts_dir: file.artifacts_dir,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("REELMATCH_INTERVAL_SECONDS")? {
            self.interval_seconds = v;
        }
        if let Some(v) = env_parse("REELMATCH_BLUR_THRESHOLD")? {
            self.quality.blur_threshold = v;
        }
        if let Some(v) = env_parse("REELMATCH_MIN_BRIGHTNESS")? {
            self.quality.min_brightness = v;
        }
        if let Some(v) = env_parse("REELMATCH_MAX_BRIGHTNESS")? {
            self.quality.max_brightness = v;
        }
        if let Some(v) = env_parse("REELMATCH_FALLBACK_SEARCH_RANGE")? {
            self.quality.fallback_search_range = v;
        }
        if let Some(v) = env_parse("REELMATCH_ENABLE_QUALITY_CHECK")? {
            self.quality.enabled = v;
        }
        if let Some(v) = env_parse("REELMATCH_STRICT_QUALITY")? {
            self.quality.strict = v;
        }
        if let Some(v) = env_parse("REELMATCH_PERSON_CONFIDENCE")? {
            self.person.confidence_threshold = v;
        }
        if let Some(v) = env_parse("REELMATCH_MIN_PERSON_AREA")? {
            self.person.min_area = v;
        }
        if let Some(v) = env_parse("REELMATCH_TOP_K")? {
            self.matching.top_k = v;
        }
        if let Ok(scales) = std::env::var("REELMATCH_SCALES") {
            let parsed = split_csv(&scales)
                .iter()
                .map(|s| {
                    s.parse::<f32>()
                        .map_err(|_| anyhow!("REELMATCH_SCALES entry {:?} is not a number", s))
                })
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.detection.multi_scale_factors = parsed;
            }
        }
        if let Ok(path) = std::env::var("REELMATCH_CATALOG_DB") {
            if !path.trim().is_empty() {
                self.matching.catalog_db = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("REELMATCH_ARTIFACTS_DIR") {
            if !path.trim().is_empty() {
                self.artifacts_dir = Some(PathBuf::from(path));
            }
        }
        if let Some(workers) = env_parse::<usize>("REELMATCH_WORKERS")? {
            self.runtime.workers = workers;
            self.runtime.queue_capacity = workers * 2;
        }
        if let Some(v) = env_parse("REELMATCH_QUEUE_CAPACITY")? {
            self.runtime.queue_capacity = v;
        }
        if let Some(ms) = env_parse("REELMATCH_INTERVAL_TIMEOUT_MS")? {
            self.runtime.interval_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("REELMATCH_SERIALIZE_INFERENCE")? {
            self.runtime.serialize_inference = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.interval_seconds.is_finite() && self.interval_seconds > 0.0) {
            return Err(anyhow!("interval_seconds must be greater than zero"));
        }

        let q = &self.quality;
        if !(q.blur_threshold.is_finite() && q.blur_threshold >= 0.0) {
            return Err(anyhow!("blur_threshold must be non-negative"));
        }
        if !(0.0..=255.0).contains(&q.min_brightness)
            || !(0.0..=255.0).contains(&q.max_brightness)
            || q.min_brightness >= q.max_brightness
        {
            return Err(anyhow!(
                "brightness range must satisfy 0 <= min_brightness < max_brightness <= 255 (got {}..{})",
                q.min_brightness,
                q.max_brightness
            ));
        }
        if !(q.fallback_search_range.is_finite() && q.fallback_search_range >= 0.0) {
            return Err(anyhow!("fallback_search_range must be non-negative"));
        }
        if let Some(step) = q.search_step_seconds {
            if !(step.is_finite() && step > 0.0) {
                return Err(anyhow!("search_step_seconds must be greater than zero"));
            }
        }
        if q.sharpness_ceiling <= 0.0 || q.contrast_ceiling <= 0.0 {
            return Err(anyhow!("sharpness_ceiling and contrast_ceiling must be positive"));
        }

        check_unit("person_confidence_threshold", self.person.confidence_threshold)?;
        check_unit("min_person_area", self.person.min_area)?;
        if !(0.0..1.0).contains(&self.person.crop_padding_ratio) {
            return Err(anyhow!("crop_padding_ratio must be in [0, 1)"));
        }
        check_unit(
            "item_confidence_threshold",
            self.detection.item_confidence_threshold,
        )?;
        check_unit("nms_iou_threshold", self.detection.nms_iou_threshold)?;
        if self.detection.multi_scale_factors.is_empty() {
            return Err(anyhow!("multi_scale_factors must not be empty"));
        }
        if let Some(bad) = self
            .detection
            .multi_scale_factors
            .iter()
            .find(|s| !(s.is_finite() && **s > 0.0))
        {
            return Err(anyhow!("multi_scale_factors must be positive (got {})", bad));
        }

        if self.matching.top_k == 0 {
            return Err(anyhow!("top_k must be at least 1"));
        }
        if self.runtime.workers == 0 {
            return Err(anyhow!("workers must be at least 1"));
        }
        if self.runtime.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be at least 1"));
        }
        if self.runtime.interval_timeout.is_zero() {
            return Err(anyhow!("interval_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be in [0, 1] (got {})", name, value));
    }
    Ok(())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {:?}", name, raw)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.interval_seconds, 5.0);
        assert_eq!(cfg.matching.top_k, 5);
        assert_eq!(cfg.detection.multi_scale_factors, vec![1.0]);
        assert!(!cfg.quality.strict);
        assert!(cfg.runtime.workers >= 1 && cfg.runtime.workers <= 8);
        assert_eq!(cfg.runtime.queue_capacity, cfg.runtime.workers * 2);
    }

    #[test]
    fn inverted_brightness_range_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.quality.min_brightness = 200.0;
        cfg.quality.max_brightness = 100.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_scale_factor_is_rejected() {
        let mut cfg = PipelineConfig::default();
        cfg.detection.multi_scale_factors = vec![1.0, 0.0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_csv_drops_blanks() {
        assert_eq!(split_csv(" 0.5, ,1.5,"), vec!["0.5", "1.5"]);
    }
}
