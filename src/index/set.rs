use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::{ProductMatch, SimilarityIndex};
use crate::embed::Embedding;

/// One similarity index per catalog category.
#[derive(Default, Clone)]
pub struct IndexSet {
    indexes: BTreeMap<String, Arc<SimilarityIndex>>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: SimilarityIndex) -> Result<()> {
        let category = index.category().to_string();
        if self.indexes.contains_key(&category) {
            return Err(anyhow!("index for category '{}' already loaded", category));
        }
        self.indexes.insert(category, Arc::new(index));
        Ok(())
    }

    pub fn get(&self, category: &str) -> Option<Arc<SimilarityIndex>> {
        self.indexes.get(category).cloned()
    }

    pub fn categories(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    pub fn total_products(&self) -> usize {
        self.indexes.values().map(|i| i.len()).sum()
    }

    /// Route a query by category. Unknown categories have no matches.
    pub fn query(&self, category: &str, embedding: &Embedding, top_k: usize) -> Result<Vec<ProductMatch>> {
        match self.indexes.get(category) {
            Some(index) => index.query(embedding, top_k),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_category_and_tolerates_missing() {
        let mut set = IndexSet::new();
        set.insert(
            SimilarityIndex::build(
                "jewelry",
                2,
                vec![("ring-1".to_string(), Embedding::new(vec![1.0, 0.0]))],
            )
            .unwrap(),
        )
        .unwrap();
        let q = Embedding::new(vec![1.0, 0.1]);
        assert_eq!(set.query("jewelry", &q, 5).unwrap()[0].product_id, "ring-1");
        assert!(set.query("clothing", &q, 5).unwrap().is_empty());
        assert!(set.insert(SimilarityIndex::new("jewelry", 2).unwrap()).is_err());
    }
}
