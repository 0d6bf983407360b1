//! Named-index embedding store: one `VectorIndex` per concept.
//!
//! The router, entity resolver, and mental-model refresh each search a
//! different population of vectors; keeping them in separate indices avoids
//! cross-population leakage (`spec.md` §4.2).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};

use lru::LruCache;

use crate::embeddings::vector::{VectorIndex, VectorIndexConfig};
use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, VectorSearchError};

/// Query embeddings repeat heavily: the reflect agent issues the same tool
/// query across iterations, mental model refresh re-embeds its standing
/// question every run. Cache by (index, text) to skip the embedder call.
const QUERY_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexName {
    Memory,
    Entity,
    MentalModel,
}

impl IndexName {
    fn as_str(self) -> &'static str {
        match self {
            IndexName::Memory => "memory",
            IndexName::Entity => "entity",
            IndexName::MentalModel => "mental_model",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingHit {
    pub id: String,
    /// cosine distance, smaller is closer
    pub distance: f32,
}

/// Holds one `VectorIndex` per `IndexName`, created lazily on first use.
pub struct EmbeddingStore {
    embedder: std::sync::Arc<dyn Embedder>,
    indices: RwLock<HashMap<&'static str, VectorIndex>>,
    query_cache: Mutex<LruCache<(&'static str, String), Vec<f32>>>,
}

impl EmbeddingStore {
    pub fn new(embedder: std::sync::Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            indices: RwLock::new(HashMap::new()),
            query_cache: Mutex::new(LruCache::new(NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("nonzero"))),
        }
    }

    async fn embed_cached(&self, name: IndexName, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let key = (name.as_str(), text.to_string());
        if let Some(cached) = self.query_cache.lock().expect("query cache lock poisoned").get(&key) {
            return Ok(cached.clone());
        }
        let vector = self.embedder.embed(text).await?;
        self.query_cache.lock().expect("query cache lock poisoned").put(key, vector.clone());
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    fn with_index<T>(
        &self,
        name: IndexName,
        f: impl FnOnce(&mut VectorIndex) -> Result<T, VectorSearchError>,
    ) -> Result<T, VectorSearchError> {
        let mut guard = self.indices.write().expect("embedding index lock poisoned");
        if !guard.contains_key(name.as_str()) {
            let index = VectorIndex::new(VectorIndexConfig::new(self.dimensions()))?;
            guard.insert(name.as_str(), index);
        }
        let index = guard
            .get_mut(name.as_str())
            .ok_or_else(|| VectorSearchError::UnknownIndex(name.as_str().to_string()))?;
        f(index)
    }

    /// Embed `text` and upsert it under `id` in the named index.
    pub async fn upsert(
        &self,
        name: IndexName,
        id: &str,
        text: &str,
    ) -> Result<(), EmbeddingError> {
        let vector = self.embedder.embed(text).await?;
        self.with_index(name, |index| index.upsert(id, &vector))
            .map_err(|e| EmbeddingError::Provider(e.to_string()))
    }

    /// Upsert pre-computed vectors, e.g. from a batched embed call upstream.
    pub fn upsert_vectors(
        &self,
        name: IndexName,
        items: &[(String, Vec<f32>)],
    ) -> Result<(), VectorSearchError> {
        self.with_index(name, |index| {
            for (id, vector) in items {
                index.upsert(id, vector)?;
            }
            Ok(())
        })
    }

    /// Embed a batch of texts without storing them, for callers that want to
    /// compute vectors once and reuse them across indices.
    pub async fn create_vectors(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.embedder.embed_batch(texts).await
    }

    pub fn remove(&self, name: IndexName, id: &str) -> Result<bool, VectorSearchError> {
        self.with_index(name, |index| index.remove(id))
    }

    /// Embed `text` and return the top-`k` nearest neighbors in the index.
    pub async fn search(
        &self,
        name: IndexName,
        text: &str,
        k: usize,
    ) -> Result<Vec<EmbeddingHit>, EmbeddingError> {
        let vector = self.embed_cached(name, text).await?;
        self.search_by_vector(name, &vector, k)
            .map_err(|e| EmbeddingError::Provider(e.to_string()))
    }

    pub fn search_by_vector(
        &self,
        name: IndexName,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<EmbeddingHit>, VectorSearchError> {
        self.with_index(name, |index| index.search(vector, k)).map(|hits| {
            hits.into_iter()
                .map(|(id, distance)| EmbeddingHit { id, distance })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let mut v = vec![0.0_f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    #[tokio::test]
    async fn upsert_and_search_round_trips_through_embedder() {
        let store = EmbeddingStore::new(std::sync::Arc::new(FakeEmbedder));
        store.upsert(IndexName::Memory, "m1", "hello world").await.unwrap();
        store.upsert(IndexName::Memory, "m2", "goodbye moon").await.unwrap();

        let hits = store.search(IndexName::Memory, "hello world", 2).await.unwrap();
        assert_eq!(hits[0].id, "m1");
    }

    #[tokio::test]
    async fn indices_do_not_leak_across_names() {
        let store = EmbeddingStore::new(std::sync::Arc::new(FakeEmbedder));
        store.upsert(IndexName::Memory, "m1", "hello").await.unwrap();
        let hits = store.search(IndexName::Entity, "hello", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    struct CountingEmbedder {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut v = vec![0.0_f32; 4];
            for (i, b) in text.bytes().enumerate() {
                v[i % 4] += b as f32;
            }
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            4
        }
    }

    #[tokio::test]
    async fn repeated_query_text_hits_the_embedding_cache() {
        let embedder = std::sync::Arc::new(CountingEmbedder { calls: std::sync::atomic::AtomicUsize::new(0) });
        let store = EmbeddingStore::new(embedder.clone());
        store.upsert(IndexName::Memory, "m1", "hello world").await.unwrap();
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        store.search(IndexName::Memory, "same query", 2).await.unwrap();
        store.search(IndexName::Memory, "same query", 2).await.unwrap();
        // one embed call for the upsert, one for the first search; the
        // second search's identical text should be served from cache.
        assert_eq!(embedder.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
