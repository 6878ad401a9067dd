//! process_video - Run the interval pipeline over one video.
//!
//! Samples the video every `interval_seconds`, keeps the best frame around
//! each sample, gates on a person, detects items inside the person crop and
//! ranks catalog products for every item. Writes a JSON report.
//!
//! Ctrl-C cancels the run; no partial report is written.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use reel_match::detect::backends::open_detector;
use reel_match::embed::open_embedder;
use reel_match::orchestrator::{classify, FailureKind};
use reel_match::results::write_report;
use reel_match::{
    load_index_set, CancelToken, Capabilities, DetectorRegistry, FileVideo, IndexSet, Orchestrator,
    PipelineConfig, SqliteCatalogStore,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "process_video",
    about = "Match catalog products against people in a video"
)]
struct Args {
    /// Video file, or stub://NAME?duration=..&pattern=.. for a synthetic source
    video: String,

    /// Pipeline config (JSON, or TOML with a .toml extension). Defaults to $REELMATCH_CONFIG
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Catalog SQLite DB (overrides catalog_db from the config)
    #[arg(long, value_name = "PATH")]
    catalog_db: Option<PathBuf>,

    /// Person detector: .json stub rules or .onnx model
    #[arg(long, value_name = "PATH")]
    person_model: PathBuf,

    /// Item detector for a catalog category (repeatable)
    #[arg(long = "item", value_name = "CATEGORY=PATH")]
    items: Vec<String>,

    /// Class names for ONNX detectors, one per line
    #[arg(long, value_name = "PATH")]
    labels: Option<PathBuf>,

    /// ONNX embedding model. The colour-histogram embedder is used when omitted
    #[arg(long, value_name = "PATH", requires = "embed_dim")]
    embed_model: Option<PathBuf>,

    /// Output length of --embed-model
    #[arg(long, value_name = "N")]
    embed_dim: Option<usize>,

    /// Where to write the JSON report
    #[arg(long, default_value = "results.json", value_name = "PATH")]
    output: PathBuf,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut cfg = {
        let _stage = ui.stage("Load config");
        match &args.config {
            Some(path) => PipelineConfig::from_path(path)?,
            None => PipelineConfig::load()?,
        }
    };
    if let Some(db) = &args.catalog_db {
        cfg.matching.catalog_db = Some(db.clone());
    }

    let capabilities = {
        let _stage = ui.stage("Load models");
        let labels = read_labels(args.labels.as_deref())?;
        let person_labels = labels.clone().unwrap_or_else(|| vec!["person".to_string()]);
        let person_detector = open_detector(&args.person_model, &person_labels)?;
        let mut item_detectors = DetectorRegistry::new();
        for item in &args.items {
            let (category, path) = parse_item(item)?;
            let item_labels = labels.clone().unwrap_or_else(|| vec![category.to_string()]);
            item_detectors.register(category, open_detector(Path::new(path), &item_labels)?);
        }
        if item_detectors.is_empty() {
            log::warn!("no --item detectors given; only person presence will be reported");
        }
        let embedder = open_embedder(args.embed_model.as_deref(), args.embed_dim)?;
        Capabilities {
            person_detector,
            item_detectors,
            embedder,
        }
    };

    let indexes = {
        let _stage = ui.stage("Load catalog");
        match &cfg.matching.catalog_db {
            Some(path) => {
                let mut store = SqliteCatalogStore::open(path)?;
                load_index_set(&mut store, capabilities.embedder.as_ref())
                    .with_context(|| format!("failed to load catalog {}", path.display()))?
            }
            None => {
                log::warn!("no catalog_db configured; items will have no matches");
                IndexSet::new()
            }
        }
    };
    log::info!(
        "catalog: {} products in {:?}",
        indexes.total_products(),
        indexes.categories()
    );

    let video = FileVideo::new(&args.video)?;
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::warn!("interrupt received, cancelling");
            cancel.cancel();
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let mut orchestrator = Orchestrator::new(cfg, capabilities, indexes)?;
    {
        let _stage = ui.stage("Warm up");
        orchestrator.start()?;
    }

    let outcome = {
        let _stage = ui.stage("Process intervals");
        let mut progress: Option<ui::IntervalProgress> = None;
        let outcome = orchestrator.run_with_progress(&video, &cancel, |done, total| {
            progress
                .get_or_insert_with(|| ui.intervals(total))
                .update(done);
        });
        if let Some(progress) = progress {
            progress.finish();
        }
        outcome
    };
    orchestrator.teardown()?;

    let report = match outcome {
        Ok(report) => report,
        Err(e) if classify(&e) == FailureKind::Cancelled => {
            eprintln!("process_video: cancelled, no report written");
            std::process::exit(130);
        }
        Err(e) => return Err(e),
    };

    {
        let _stage = ui.stage("Write report");
        write_report(&args.output, &report)?;
    }

    let t = &report.totals;
    println!("process_video: {}", report.video);
    println!(
        "  intervals={} processed={} low_quality={} no_person={} errors={} timeouts={}",
        t.intervals,
        t.processed,
        t.skipped_quality,
        t.skipped_no_person,
        t.skipped_error,
        t.skipped_timeout
    );
    println!("  report written to {}", args.output.display());
    Ok(())
}

fn parse_item(arg: &str) -> Result<(&str, &str)> {
    let Some((category, path)) = arg.split_once('=') else {
        bail!("--item expects CATEGORY=PATH (got '{}')", arg);
    };
    let category = category.trim();
    if category.is_empty() || path.trim().is_empty() {
        bail!("--item expects CATEGORY=PATH (got '{}')", arg);
    }
    Ok((category, path.trim()))
}

fn read_labels(path: Option<&Path>) -> Result<Option<Vec<String>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels {}", path.display()))?;
    let labels: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        bail!("labels file {} is empty", path.display());
    }
    Ok(Some(labels))
}
