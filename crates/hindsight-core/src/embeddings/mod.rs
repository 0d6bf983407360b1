//! Embedding store (C2)
//!
//! Maps id -> dense vector with a named index per concept (memory, entity,
//! mental_model); cosine nearest-neighbor search within a named index.
//! The embedding model itself is injected by the host as a pure function
//! (`spec.md` §1 "Out of scope", §6 "Injected effectful collaborators").

mod store;
mod vector;

pub use store::{EmbeddingHit, EmbeddingStore, IndexName};
pub use vector::{VectorIndex, VectorIndexConfig, VectorIndexStats};

use crate::error::EmbeddingError;
use async_trait::async_trait;

/// Injected embedding collaborator. The host supplies an implementation that
/// wraps whatever model/provider it likes; the engine only ever calls
/// through this trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single piece of text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a batch of texts. The default implementation calls `embed` in
    /// sequence; implementations backed by a batching API should override
    /// this for throughput (`spec.md` §5 "Batched embed requests are
    /// preferred").
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Fixed vector dimensionality for this embedder.
    fn dimensions(&self) -> usize;
}

/// Cosine distance in `[0, 2]`; `similarity = 1 - distance`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    crate::util::cosine_distance(a, b)
}
