//! Engine-level configuration (`spec.md` §6).

use std::path::PathBuf;
use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::llm::LlmAdapter;
use crate::search::Reranker;

/// Top-level configuration for an embedded engine instance.
///
/// `embed` is the only required injected collaborator; everything else
/// (batched embedding, reranking, tracing hooks, custom extension payloads)
/// is optional and the engine degrades gracefully without it.
pub struct HindsightConfig {
    pub db_path: Option<PathBuf>,
    pub embed: Arc<dyn Embedder>,
    pub llm: Option<Arc<dyn LlmAdapter>>,
    pub rerank: Option<Arc<dyn Reranker>>,
    pub embedding_dimensions: usize,
    pub enable_consolidation: bool,
    pub defaults: EngineDefaults,
    /// Invoked with a `Trace` after any traced call (recall/reflect), when set.
    pub on_trace: Option<Arc<dyn Fn(&crate::recall::Trace) + Send + Sync>>,
}

impl std::fmt::Debug for HindsightConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HindsightConfig")
            .field("db_path", &self.db_path)
            .field("embedding_dimensions", &self.embedding_dimensions)
            .field("enable_consolidation", &self.enable_consolidation)
            .field("defaults", &self.defaults)
            .field("has_llm", &self.llm.is_some())
            .field("has_rerank", &self.rerank.is_some())
            .finish()
    }
}

/// Engine-wide numeric defaults, overridable per call via the various
/// `*Options` structs and per-bank via `BankConfig`.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub reinforce_threshold: f32,
    pub reconsolidate_threshold: f32,
    pub temporal_window_ms: i64,
    pub episode_time_gap_ms: i64,
    pub temporal_link_min_weight: f32,
    pub temporal_link_top_n: usize,
    pub semantic_link_k: usize,
    pub semantic_link_min_similarity: f32,
    pub rrf_k: f32,
    pub recall_weight_rrf: f32,
    pub recall_weight_rerank: f32,
    pub recall_weight_temporal: f32,
    pub recall_weight_recency: f32,
    pub recall_temporal_tau_ms: i64,
    pub chars_per_token: usize,
    pub gist_max_chars: usize,
    pub gist_upgrade_concurrency: usize,
    pub consolidation_batch_size: usize,
    pub consolidation_max_recall_tokens: usize,
    pub extraction_char_budget: usize,
    pub entity_match_threshold: f32,
    pub entity_match_margin: f32,
    /// Age past which an observation is no longer "recent" for freshness
    /// classification (`spec.md` §4.10).
    pub observation_staleness_ms: i64,
    /// Minimum `proofCount` to count as "well-supported" for freshness.
    pub observation_staleness_proof_floor: i64,
    /// Age past which a mental model's cached content is stale if not refreshed.
    pub mental_model_staleness_ms: i64,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            reinforce_threshold: 0.92,
            reconsolidate_threshold: 0.75,
            temporal_window_ms: 24 * 60 * 60 * 1000,
            episode_time_gap_ms: 45 * 60 * 1000,
            temporal_link_min_weight: 0.3,
            temporal_link_top_n: 10,
            semantic_link_k: 5,
            semantic_link_min_similarity: 0.7,
            rrf_k: 60.0,
            recall_weight_rrf: 0.4,
            recall_weight_rerank: 0.3,
            recall_weight_temporal: 0.2,
            recall_weight_recency: 0.1,
            recall_temporal_tau_ms: 30 * 24 * 60 * 60 * 1000,
            chars_per_token: 4,
            gist_max_chars: 200,
            gist_upgrade_concurrency: 3,
            consolidation_batch_size: 50,
            consolidation_max_recall_tokens: 2000,
            extraction_char_budget: 600_000,
            entity_match_threshold: 0.82,
            entity_match_margin: 0.05,
            observation_staleness_ms: 14 * 24 * 60 * 60 * 1000,
            observation_staleness_proof_floor: 3,
            mental_model_staleness_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}
