//! Exact cosine-similarity index over catalog embeddings.
//!
//! Vectors are L2-normalised on insert, so cosine similarity is a plain inner
//! product scan. The index is a list of immutable segments behind an
//! `Arc<Snapshot>`:
//!
//! - readers clone the `Arc` under a brief read lock and scan lock-free
//! - `add` builds a new snapshot with one more segment and swaps it in
//! - `compact` folds all segments into one
//!
//! Results are ordered by score (descending), then by insertion order.

mod set;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::embed::Embedding;

pub use set::IndexSet;

/// One ranked catalog hit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductMatch {
    pub product_id: String,
    pub score: f32,
}

struct Segment {
    ids: Vec<String>,
    /// Row-major, `ids.len() * dimension` unit-length rows.
    vectors: Vec<f32>,
}

#[derive(Clone)]
struct Snapshot {
    segments: Vec<Arc<Segment>>,
    ids: Arc<HashSet<String>>,
    len: usize,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            segments: Vec::new(),
            ids: Arc::new(HashSet::new()),
            len: 0,
        }
    }
}

pub struct SimilarityIndex {
    category: String,
    dimension: usize,
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl SimilarityIndex {
    pub fn new(category: &str, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(anyhow!("index dimension must be non-zero"));
        }
        Ok(Self {
            category: category.to_string(),
            dimension,
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            writer: Mutex::new(()),
        })
    }

    /// Build an index from `(product_id, embedding)` pairs in catalog order.
    pub fn build<I>(category: &str, dimension: usize, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Embedding)>,
    {
        let index = Self::new(category, dimension)?;
        index.add_batch(entries)?;
        Ok(index)
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.current().map(|s| s.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_count(&self) -> usize {
        self.current().map(|s| s.segments.len()).unwrap_or(0)
    }

    pub fn contains(&self, product_id: &str) -> bool {
        self.current()
            .map(|s| s.ids.contains(product_id))
            .unwrap_or(false)
    }

    fn current(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| anyhow!("index snapshot lock poisoned"))
    }

    fn swap(&self, next: Snapshot) -> Result<()> {
        let mut guard = self
            .snapshot
            .write()
            .map_err(|_| anyhow!("index snapshot lock poisoned"))?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Insert one product without a rebuild.
    pub fn add(&self, product_id: &str, embedding: &Embedding) -> Result<()> {
        self.add_batch([(product_id.to_string(), embedding.clone())])
    }

    /// Insert many products as one new segment. All-or-nothing.
    pub fn add_batch<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Embedding)>,
    {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("index writer lock poisoned"))?;
        let base = self.current()?;

        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for (product_id, embedding) in entries {
            if embedding.dimension() != self.dimension {
                return Err(anyhow!(
                    "embedding for '{}' has dimension {}, index '{}' expects {}",
                    product_id,
                    embedding.dimension(),
                    self.category,
                    self.dimension
                ));
            }
            if base.ids.contains(&product_id) || !seen.insert(product_id.clone()) {
                return Err(anyhow!(
                    "duplicate product id '{}' in category '{}'",
                    product_id,
                    self.category
                ));
            }
            let unit = embedding
                .l2_normalized()
                .map_err(|e| anyhow!("product '{}': {}", product_id, e))?;
            vectors.extend_from_slice(unit.as_slice());
            ids.push(product_id);
        }
        if ids.is_empty() {
            return Ok(());
        }

        let mut next = (*base).clone();
        let mut all_ids = (*base.ids).clone();
        all_ids.extend(ids.iter().cloned());
        next.ids = Arc::new(all_ids);
        next.len += ids.len();
        next.segments.push(Arc::new(Segment { ids, vectors }));
        self.swap(next)
    }

    /// Fold every segment into one. Query results are unchanged.
    pub fn compact(&self) -> Result<()> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("index writer lock poisoned"))?;
        let base = self.current()?;
        if base.segments.len() <= 1 {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(base.len);
        let mut vectors = Vec::with_capacity(base.len * self.dimension);
        for segment in &base.segments {
            ids.extend(segment.ids.iter().cloned());
            vectors.extend_from_slice(&segment.vectors);
        }
        let next = Snapshot {
            segments: vec![Arc::new(Segment { ids, vectors })],
            ids: Arc::clone(&base.ids),
            len: base.len,
        };
        log::debug!(
            "index '{}': compacted {} segments ({} products)",
            self.category,
            base.segments.len(),
            base.len
        );
        self.swap(next)
    }

    /// Top-`top_k` products by cosine similarity.
    ///
    /// An empty index answers every query with an empty list, whatever the
    /// query's shape.
    pub fn query(&self, embedding: &Embedding, top_k: usize) -> Result<Vec<ProductMatch>> {
        let snapshot = self.current()?;
        if snapshot.len == 0 || top_k == 0 {
            return Ok(Vec::new());
        }
        if embedding.dimension() != self.dimension {
            return Err(anyhow!(
                "query has dimension {}, index '{}' expects {}",
                embedding.dimension(),
                self.category,
                self.dimension
            ));
        }
        let unit = embedding.l2_normalized()?;

        let q = unit.as_slice();
        let mut scored: Vec<(f32, usize, &str)> = Vec::with_capacity(snapshot.len);
        let mut position = 0usize;
        for segment in &snapshot.segments {
            for (row, id) in segment.vectors.chunks_exact(self.dimension).zip(&segment.ids) {
                let score: f32 = row.iter().zip(q).map(|(a, b)| a * b).sum();
                scored.push((score, position, id.as_str()));
                position += 1;
            }
        }

        let rank = |a: &(f32, usize, &str), b: &(f32, usize, &str)| -> Ordering {
            b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1))
        };
        if scored.len() > top_k {
            scored.select_nth_unstable_by(top_k - 1, rank);
            scored.truncate(top_k);
        }
        scored.sort_by(rank);
        Ok(scored
            .into_iter()
            .map(|(score, _, id)| ProductMatch {
                product_id: id.to_string(),
                score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn sample() -> SimilarityIndex {
        SimilarityIndex::build(
            "clothing",
            3,
            vec![
                ("red".to_string(), e(&[1.0, 0.0, 0.0])),
                ("green".to_string(), e(&[0.0, 1.0, 0.0])),
                ("blue".to_string(), e(&[0.0, 0.0, 2.0])),
                ("teal".to_string(), e(&[0.0, 1.0, 1.0])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn self_query_returns_self_first() {
        let index = sample();
        let hits = index.query(&e(&[0.0, 0.0, 5.0]), 2).unwrap();
        assert_eq!(hits[0].product_id, "blue");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].product_id, "teal");
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn queries_are_idempotent_and_bounded_by_top_k() {
        let index = sample();
        let q = e(&[0.3, 0.5, 0.2]);
        let a = index.query(&q, 3).unwrap();
        let b = index.query(&q, 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_eq!(index.query(&q, 10).unwrap().len(), 4);
    }

    #[test]
    fn ties_prefer_earlier_insertion() {
        let index = SimilarityIndex::build(
            "jewelry",
            2,
            vec![
                ("b".to_string(), e(&[1.0, 0.0])),
                ("a".to_string(), e(&[2.0, 0.0])),
            ],
        )
        .unwrap();
        let hits = index.query(&e(&[1.0, 0.0]), 2).unwrap();
        assert_eq!(hits[0].product_id, "b");
        assert_eq!(hits[1].product_id, "a");
    }

    #[test]
    fn empty_index_returns_empty_list() {
        let index = SimilarityIndex::new("clothing", 3).unwrap();
        assert!(index.query(&e(&[1.0, 0.0, 0.0]), 5).unwrap().is_empty());
        // Shape is never checked against an empty catalog.
        assert!(index.query(&e(&[1.0, 0.0, 0.0, 0.0, 0.5]), 5).unwrap().is_empty());
    }

    #[test]
    fn bad_vectors_are_errors() {
        let index = sample();
        assert!(index.query(&e(&[1.0, 0.0]), 5).is_err());
        assert!(index.query(&e(&[0.0, 0.0, 0.0]), 5).is_err());
        assert!(index.add("zero", &e(&[0.0, 0.0, 0.0])).is_err());
        assert!(index.add("short", &e(&[1.0])).is_err());
    }

    #[test]
    fn duplicates_are_rejected_atomically() {
        let index = sample();
        assert!(index.add("red", &e(&[1.0, 1.0, 0.0])).is_err());
        let batch = vec![
            ("new".to_string(), e(&[1.0, 1.0, 1.0])),
            ("new".to_string(), e(&[1.0, 1.0, 0.0])),
        ];
        assert!(index.add_batch(batch).is_err());
        assert!(!index.contains("new"));
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn add_then_compact_keeps_results() {
        let index = sample();
        index.add("white", &e(&[1.0, 1.0, 1.0])).unwrap();
        assert_eq!(index.segment_count(), 2);
        let q = e(&[0.9, 1.0, 1.1]);
        let before = index.query(&q, 5).unwrap();
        assert_eq!(before[0].product_id, "white");
        index.compact().unwrap();
        assert_eq!(index.segment_count(), 1);
        assert_eq!(index.query(&q, 5).unwrap(), before);
    }

    #[test]
    fn readers_see_consistent_snapshots_during_writes() {
        let index = Arc::new(sample());
        std::thread::scope(|scope| {
            let writer = Arc::clone(&index);
            scope.spawn(move || {
                for i in 0..50 {
                    writer
                        .add(&format!("p{}", i), &e(&[1.0, i as f32, 0.5]))
                        .unwrap();
                }
            });
            for _ in 0..50 {
                let hits = index.query(&e(&[0.0, 0.0, 1.0]), 3).unwrap();
                assert_eq!(hits[0].product_id, "blue");
            }
        });
        assert_eq!(index.len(), 54);
    }
}
