//! Reel Match
//!
//! Finds catalog products worn by people in a video, one sample per interval.
//!
//! # Pipeline
//!
//! For every `interval_seconds` slot of the video:
//!
//! 1. **Quality search**: frames within ±`fallback_search_range` of the slot
//!    start are scored (sharpness, brightness, contrast) and the best one is
//!    kept.
//! 2. **Person gate**: the primary person box must clear the confidence and
//!    minimum-area thresholds, otherwise the slot is skipped.
//! 3. **Region detection**: item detectors run only on the padded person crop,
//!    optionally at several scales merged by NMS; boxes are mapped back into
//!    frame coordinates.
//! 4. **Matching**: each item crop is embedded and ranked by cosine
//!    similarity against the catalog index for its category.
//!
//! Every slot yields exactly one `IntervalResult`, either processed or with a
//! skip reason.
//!
//! # Module Structure
//!
//! - `quality`, `gate`, `detect`, `embed`, `index`: pipeline stages
//! - `orchestrator`: per-interval state machine and worker pool
//! - `ingest`, `frame`, `geometry`: video sources and pixel helpers
//! - `catalog`: persisted product embeddings (SQLite)
//! - `results`: interval records, reports and lookups
//! - `config`: pipeline settings

pub mod catalog;
pub mod config;
pub mod detect;
pub mod embed;
pub mod frame;
pub mod gate;
pub mod geometry;
pub mod index;
pub mod ingest;
pub mod orchestrator;
pub mod quality;
pub mod results;

pub use catalog::{
    build_catalog, load_index_set, CatalogEntry, CatalogMeta, CatalogStore, InMemoryCatalogStore,
    SqliteCatalogStore,
};
pub use config::PipelineConfig;
pub use detect::{
    DetectorRegistry, ItemDetection, ObjectDetector, RawDetection, StubDetector, StubRule,
};
pub use embed::{Embedder, Embedding, HistogramEmbedder};
pub use frame::Frame;
pub use gate::{PersonDetection, PersonGate};
pub use geometry::BBox;
pub use index::{IndexSet, ProductMatch, SimilarityIndex};
pub use ingest::{FileVideo, FrameSource, SyntheticVideo, VideoMetadata, VideoOpener};
pub use orchestrator::{Capabilities, CancelToken, JobCancelled, Orchestrator};
pub use quality::{QualityAssessment, QualityAssessor};
pub use results::{IntervalResult, MatchResult, SkipReason, VideoReport};
