use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use reel_match::config::{PipelineConfig, CONFIG_ENV};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        CONFIG_ENV,
        "REELMATCH_INTERVAL_SECONDS",
        "REELMATCH_BLUR_THRESHOLD",
        "REELMATCH_MIN_PERSON_AREA",
        "REELMATCH_TOP_K",
        "REELMATCH_SCALES",
        "REELMATCH_WORKERS",
        "REELMATCH_CATALOG_DB",
        "REELMATCH_STRICT_QUALITY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "interval_seconds": 2.5,
        "blur_threshold": 80.0,
        "min_brightness": 30.0,
        "max_brightness": 230.0,
        "fallback_search_range": 0.5,
        "enable_quality_check": true,
        "person_confidence_threshold": 0.6,
        "min_person_area": 0.1,
        "crop_padding_ratio": 0.1,
        "top_k": 3,
        "multi_scale_factors": [1.0, 0.75],
        "interval_timeout_ms": 5000,
        "workers": 2
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var(CONFIG_ENV, file.path());
    std::env::set_var("REELMATCH_TOP_K", "7");
    std::env::set_var("REELMATCH_SCALES", "1.0, 0.5");
    std::env::set_var("REELMATCH_STRICT_QUALITY", "true");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.interval_seconds, 2.5);
    assert_eq!(cfg.quality.blur_threshold, 80.0);
    assert_eq!(cfg.quality.min_brightness, 30.0);
    assert_eq!(cfg.quality.max_brightness, 230.0);
    assert_eq!(cfg.quality.fallback_search_range, 0.5);
    assert!(cfg.quality.strict);
    assert_eq!(cfg.person.confidence_threshold, 0.6);
    assert_eq!(cfg.person.min_area, 0.1);
    assert_eq!(cfg.matching.top_k, 7);
    assert_eq!(cfg.detection.multi_scale_factors, vec![1.0, 0.5]);
    assert_eq!(cfg.runtime.workers, 2);
    assert_eq!(cfg.runtime.queue_capacity, 4);
    assert_eq!(cfg.runtime.interval_timeout, Duration::from_secs(5));

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
        interval_seconds = 10.0
        min_person_area = 0.02
        strict_quality = true
        catalog_db = "catalog.db"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = PipelineConfig::from_path(file.path()).expect("load toml");
    assert_eq!(cfg.interval_seconds, 10.0);
    assert_eq!(cfg.person.min_area, 0.02);
    assert!(cfg.quality.strict);
    assert_eq!(
        cfg.matching.catalog_db.as_deref(),
        Some(std::path::Path::new("catalog.db"))
    );
    assert_eq!(cfg.quality.blur_threshold, 100.0);

    clear_env();
}

#[test]
fn defaults_without_any_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("defaults");
    assert_eq!(cfg.interval_seconds, 5.0);
    assert_eq!(cfg.quality.blur_threshold, 100.0);
    assert_eq!(cfg.quality.min_brightness, 40.0);
    assert_eq!(cfg.quality.max_brightness, 220.0);
    assert_eq!(cfg.quality.fallback_search_range, 1.0);
    assert!(cfg.quality.enabled);
    assert!(!cfg.quality.strict);
    assert_eq!(cfg.person.confidence_threshold, 0.7);
    assert_eq!(cfg.person.min_area, 0.05);
    assert_eq!(cfg.matching.top_k, 5);
    assert_eq!(cfg.detection.multi_scale_factors, vec![1.0]);
    assert!(cfg.runtime.workers >= 1 && cfg.runtime.workers <= 8);
}

#[test]
fn rejects_unknown_keys_and_bad_ranges() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut unknown = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut unknown, br#"{"blur_treshold": 10.0}"#).expect("write");
    assert!(PipelineConfig::from_path(unknown.path()).is_err());

    let mut bad = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut bad, br#"{"min_brightness": 200.0, "max_brightness": 100.0}"#)
        .expect("write");
    assert!(PipelineConfig::from_path(bad.path()).is_err());

    std::env::set_var("REELMATCH_TOP_K", "0");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("REELMATCH_TOP_K", "many");
    assert!(PipelineConfig::load().is_err());

    clear_env();
}
