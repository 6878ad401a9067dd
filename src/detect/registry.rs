use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::detect::backend::ObjectDetector;

/// Item detectors keyed by catalog category.
///
/// Iteration order is the category name order, so multi-category runs are
/// reproducible.
#[derive(Default, Clone)]
pub struct DetectorRegistry {
    detectors: BTreeMap<String, Arc<dyn ObjectDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the item detector for a category. Replaces any previous one.
    pub fn register(&mut self, category: &str, detector: Arc<dyn ObjectDetector>) {
        self.detectors.insert(category.to_string(), detector);
    }

    pub fn with(mut self, category: &str, detector: Arc<dyn ObjectDetector>) -> Self {
        self.register(category, detector);
        self
    }

    pub fn get(&self, category: &str) -> Option<Arc<dyn ObjectDetector>> {
        self.detectors.get(category).cloned()
    }

    pub fn require(&self, category: &str) -> Result<Arc<dyn ObjectDetector>> {
        self.get(category)
            .ok_or_else(|| anyhow!("no item detector registered for category '{}'", category))
    }

    pub fn categories(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ObjectDetector>)> {
        self.detectors.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }
}
