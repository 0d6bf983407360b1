//! HNSW vector index (USearch), one instance per named index.
//!
//! Grounded on the teacher's `search/vector.rs`: same reserve/add/search
//! discipline, generalized so the engine can hold three of these (memory,
//! entity, mental_model) side by side instead of one global index.

use crate::error::VectorSearchError;
use std::collections::HashMap;

#[cfg(feature = "vector-search")]
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

/// HNSW connectivity parameter (higher = better recall, more memory).
pub const DEFAULT_CONNECTIVITY: usize = 16;
/// Expansion factor for index building.
pub const DEFAULT_EXPANSION_ADD: usize = 128;
/// Expansion factor for search.
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VectorIndexStats {
    pub total_vectors: usize,
    pub dimensions: usize,
}

/// A single named HNSW index mapping string ids to vectors.
#[cfg(feature = "vector-search")]
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

#[cfg(feature = "vector-search")]
impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
        }
    }

    fn ensure_capacity(&self) -> Result<(), VectorSearchError> {
        let current_capacity = self.index.capacity();
        let current_size = self.index.size();
        if current_size >= current_capacity {
            let new_capacity = std::cmp::max(current_capacity * 2, 16);
            self.index
                .reserve(new_capacity)
                .map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;
        }
        Ok(())
    }

    /// Insert or replace the vector for `key`.
    pub fn upsert(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }

        if let Some(&existing_id) = self.key_to_id.get(key) {
            self.index
                .remove(existing_id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.ensure_capacity()?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            return Ok(());
        }

        self.ensure_capacity()?;
        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<bool, VectorSearchError> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Top-k by cosine distance (smaller = closer); `spec.md` §4.2.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                query.len(),
            ));
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, k)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        let mut out = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(string_key) = self.id_to_key.get(key) {
                out.push((string_key.clone(), *distance));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
#[cfg(feature = "vector-search")]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_search_round_trips() {
        let mut index = VectorIndex::new(VectorIndexConfig::new(4)).unwrap();
        index.upsert("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.upsert("b", &[0.0, 1.0, 0.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 < results[1].1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = VectorIndex::new(VectorIndexConfig::new(4)).unwrap();
        let err = index.upsert("a", &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, VectorSearchError::InvalidDimensions(4, 2)));
    }

    #[test]
    fn upsert_replaces_existing_vector() {
        let mut index = VectorIndex::new(VectorIndexConfig::new(4)).unwrap();
        index.upsert("a", &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.upsert("a", &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.len(), 1);

        let results = index.search(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 < 0.01);
    }
}
