//! Interval orchestration.
//!
//! The video is cut into `interval_seconds` intervals. A producer feeds them
//! through a bounded queue to a scoped worker pool; every worker opens its own
//! frame source and drives one `IntervalMachine` per interval. Results are
//! collected on the calling thread and sorted by timestamp.
//!
//! Fatal (run returns `Err`, no partial report):
//! - the video cannot be opened
//! - an index does not match the embedder
//! - cancellation (`JobCancelled`)
//!
//! Everything else ends up as a skip reason on the interval.

pub mod budget;
pub mod machine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::PipelineConfig;
use crate::detect::{DetectorRegistry, ObjectDetector, RegionDetector};
use crate::embed::Embedder;
use crate::gate::PersonGate;
use crate::index::IndexSet;
use crate::ingest::{VideoMetadata, VideoOpener};
use crate::quality::QualityAssessor;
use crate::results::{ArtifactWriter, IntervalResult, VideoReport};

pub use budget::{
    classify, CallGuard, CancelToken, Deadline, FailureKind, InferenceGate, IntervalTimedOut,
    JobCancelled,
};
pub use machine::{IntervalMachine, IntervalState, Selected};

/// Search step used when neither the config nor the source gives one.
pub const FALLBACK_SEARCH_STEP: f64 = 1.0 / 30.0;

/// One sampling slot. The nominal timestamp is `start_time`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingInterval {
    pub index: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub search_radius: f64,
}

/// `start = k * interval` for every `k` with `start < duration`.
pub fn sampling_intervals(duration: f64, interval: f64, search_radius: f64) -> Vec<SamplingInterval> {
    if !(duration.is_finite() && duration > 0.0 && interval > 0.0) {
        return Vec::new();
    }
    let count = (duration / interval - 1e-9).ceil().max(0.0) as usize;
    (0..count)
        .map(|k| {
            let start_time = k as f64 * interval;
            SamplingInterval {
                index: k,
                start_time,
                end_time: (start_time + interval).min(duration),
                search_radius,
            }
        })
        .collect()
}

/// Detectors and embedder injected into the orchestrator.
#[derive(Clone)]
pub struct Capabilities {
    pub person_detector: Arc<dyn ObjectDetector>,
    pub item_detectors: DetectorRegistry,
    pub embedder: Arc<dyn Embedder>,
}

/// Per-run, read-only pipeline stages shared by every worker.
pub struct Stages {
    pub metadata: VideoMetadata,
    pub search_step: f64,
    pub assessor: QualityAssessor,
    pub strict_quality: bool,
    pub gate: PersonGate,
    pub crop_padding_ratio: f32,
    pub item_detectors: Vec<RegionDetector>,
    pub embedder: Arc<dyn Embedder>,
    pub indexes: IndexSet,
    pub top_k: usize,
    pub artifacts: Option<ArtifactWriter>,
}

pub struct Orchestrator {
    config: PipelineConfig,
    capabilities: Capabilities,
    indexes: IndexSet,
    started: bool,
    torn_down: bool,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, capabilities: Capabilities, indexes: IndexSet) -> Result<Self> {
        config.validate()?;
        let dimension = capabilities.embedder.dimension();
        for category in indexes.categories() {
            let Some(index) = indexes.get(&category) else {
                continue;
            };
            if index.dimension() == dimension {
                continue;
            }
            if index.is_empty() {
                log::warn!(
                    "empty index '{}' has dimension {}, embedder produces {}; its items will have no matches",
                    category,
                    index.dimension(),
                    dimension
                );
            } else {
                bail!(
                    "index '{}' has dimension {}, embedder '{}' produces {}",
                    category,
                    index.dimension(),
                    capabilities.embedder.model_id(),
                    dimension
                );
            }
        }
        for category in capabilities.item_detectors.categories() {
            if indexes.get(&category).is_none() {
                log::warn!("no catalog index for category '{}'; its items will have no matches", category);
            }
        }
        Ok(Self {
            config,
            capabilities,
            indexes,
            started: false,
            torn_down: false,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn indexes(&self) -> &IndexSet {
        &self.indexes
    }

    /// Warm up every detector and the embedder.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let caps = &self.capabilities;
        caps.person_detector
            .warm_up()
            .with_context(|| format!("warm-up failed for {}", caps.person_detector.name()))?;
        for (category, detector) in caps.item_detectors.iter() {
            detector
                .warm_up()
                .with_context(|| format!("warm-up failed for {} ({})", detector.name(), category))?;
        }
        caps.embedder
            .warm_up()
            .with_context(|| format!("warm-up failed for {}", caps.embedder.model_id()))?;
        self.started = true;
        log::info!(
            "orchestrator started: person={} items={:?} embedder={} workers={}",
            caps.person_detector.name(),
            caps.item_detectors.categories(),
            caps.embedder.model_id(),
            self.config.runtime.workers
        );
        Ok(())
    }

    /// Shut every capability down once. Later calls are no-ops.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let caps = &self.capabilities;
        let mut first_err = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                log::warn!("shutdown: {:#}", e);
                first_err.get_or_insert(e);
            }
        };
        note(caps.person_detector.shutdown());
        for (_, detector) in caps.item_detectors.iter() {
            note(detector.shutdown());
        }
        note(caps.embedder.shutdown());
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn run(&self, video: &dyn VideoOpener, cancel: &CancelToken) -> Result<VideoReport> {
        self.run_with_progress(video, cancel, |_, _| {})
    }

    /// Run every interval of `video`. `progress(done, total)` is called on
    /// the calling thread after each interval finishes.
    pub fn run_with_progress(
        &self,
        video: &dyn VideoOpener,
        cancel: &CancelToken,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<VideoReport> {
        if !self.started {
            bail!("orchestrator not started");
        }
        if self.torn_down {
            bail!("orchestrator already torn down");
        }
        cancel.check()?;

        let name = video.describe();
        let metadata = video
            .open()
            .with_context(|| format!("failed to open video {}", name))?
            .metadata();
        if !(metadata.duration.is_finite() && metadata.duration > 0.0) {
            bail!("video {} reports no usable duration", name);
        }

        let cfg = &self.config;
        let intervals = sampling_intervals(
            metadata.duration,
            cfg.interval_seconds,
            cfg.quality.fallback_search_range,
        );
        let total = intervals.len();
        let stages = self.stages(metadata)?;
        let gate = InferenceGate::new(cfg.runtime.serialize_inference);
        let workers = cfg.runtime.workers.min(total).max(1);
        log::info!(
            "processing {}: {:.1}s @ {:.2}fps, {} intervals, {} workers",
            name,
            metadata.duration,
            metadata.fps,
            total,
            workers
        );

        let abort = AtomicBool::new(false);
        let fatal: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let mut results = Vec::with_capacity(total);

        let (job_tx, job_rx) = mpsc::sync_channel::<SamplingInterval>(cfg.runtime.queue_capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<IntervalResult>();

        {
            let stages = &stages;
            let gate = &gate;
            let abort = &abort;
            let fatal = &fatal;
            let timeout = cfg.runtime.interval_timeout;
            let backoff = cfg.runtime.retry_backoff;

            thread::scope(|scope| {
                scope.spawn(move || {
                    for interval in intervals {
                        if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                            break;
                        }
                        // Fails once every worker is gone.
                        if job_tx.send(interval).is_err() {
                            break;
                        }
                    }
                });

                for worker in 0..workers {
                    let job_rx = Arc::clone(&job_rx);
                    let result_tx = result_tx.clone();
                    scope.spawn(move || {
                        let mut source = match video.open() {
                            Ok(source) => source,
                            Err(e) => {
                                abort.store(true, Ordering::SeqCst);
                                if let Ok(mut slot) = fatal.lock() {
                                    slot.get_or_insert(e.context(format!(
                                        "worker {} failed to open video {}",
                                        worker,
                                        video.describe()
                                    )));
                                }
                                return;
                            }
                        };
                        loop {
                            if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                                break;
                            }
                            let next = match job_rx.lock() {
                                Ok(rx) => rx.recv(),
                                Err(_) => break,
                            };
                            let Ok(interval) = next else {
                                break;
                            };
                            let guard = CallGuard {
                                deadline: Deadline::after(timeout),
                                cancel,
                                gate,
                                backoff,
                            };
                            match IntervalMachine::new(stages, interval).run(source.as_mut(), &guard) {
                                Ok(result) => {
                                    if result_tx.send(result).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    log::debug!("worker {}: interval {} abandoned: {:#}", worker, interval.index, e);
                                    break;
                                }
                            }
                        }
                    });
                }
                drop(job_rx);
                drop(result_tx);

                for result in result_rx {
                    results.push(result);
                    progress(results.len(), total);
                }
            });
        }

        let fatal = fatal
            .into_inner()
            .map_err(|_| anyhow!("worker error slot poisoned"))?;
        if let Some(e) = fatal {
            return Err(e);
        }
        if cancel.is_cancelled() {
            log::warn!("run cancelled after {}/{} intervals", results.len(), total);
            return Err(JobCancelled.into());
        }
        if results.len() != total {
            bail!("{} of {} intervals produced no result", total - results.len(), total);
        }

        let report = VideoReport::new(name, metadata.duration, cfg.interval_seconds, results);
        let t = &report.totals;
        log::info!(
            "done: {} intervals, {} processed, {} low quality, {} no person, {} errors, {} timeouts",
            t.intervals,
            t.processed,
            t.skipped_quality,
            t.skipped_no_person,
            t.skipped_error,
            t.skipped_timeout
        );
        Ok(report)
    }

    fn stages(&self, metadata: VideoMetadata) -> Result<Stages> {
        let cfg = &self.config;
        let caps = &self.capabilities;
        let search_step = cfg
            .quality
            .search_step_seconds
            .or_else(|| metadata.frame_period())
            .unwrap_or(FALLBACK_SEARCH_STEP);
        let item_detectors = caps
            .item_detectors
            .iter()
            .map(|(category, detector)| RegionDetector::new(category.as_str(), Arc::clone(detector), &cfg.detection))
            .collect();
        let artifacts = match &cfg.artifacts_dir {
            Some(dir) => Some(ArtifactWriter::create(dir)?),
            None => None,
        };
        Ok(Stages {
            metadata,
            search_step,
            assessor: QualityAssessor::new(cfg.quality.clone()),
            strict_quality: cfg.quality.strict,
            gate: PersonGate::new(Arc::clone(&caps.person_detector), cfg.person.clone()),
            crop_padding_ratio: cfg.person.crop_padding_ratio,
            item_detectors,
            embedder: Arc::clone(&caps.embedder),
            indexes: self.indexes.clone(),
            top_k: cfg.matching.top_k,
            artifacts,
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::warn!("teardown on drop: {:#}", e);
        }
    }
}
