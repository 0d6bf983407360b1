//! Recall engine (C9): fan out to parallel candidate sources, fuse with RRF,
//! optionally rerank, score, and truncate to a token budget (`spec.md` §4.9).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineDefaults;
use crate::embeddings::{EmbeddingStore, IndexName};
use crate::error::HindsightError;
use crate::model::MemoryUnit;
use crate::search::{reciprocal_rank_fusion, Reranker};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub limit: usize,
    pub token_budget: Option<usize>,
    pub use_rerank: bool,
    pub graph_hops: u32,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self { limit: 10, token_budget: None, use_rerank: true, graph_hops: 2 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecallHit {
    pub memory: MemoryUnit,
    pub score: f32,
}

/// Diagnostic record of one recall call, handed to `HindsightConfig::on_trace`.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub query: String,
    pub bank_id: String,
    pub candidate_counts: CandidateCounts,
    pub reranked: bool,
    pub result_count: usize,
    pub truncated_by_budget: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CandidateCounts {
    pub lexical: usize,
    pub semantic: usize,
    pub graph: usize,
    pub temporal: usize,
}

/// Run the full recall pipeline for `query` within `bank_id`.
pub async fn recall(
    storage: &Storage,
    embeddings: &EmbeddingStore,
    reranker: Option<&Arc<dyn Reranker>>,
    defaults: &EngineDefaults,
    bank_id: &str,
    query: &str,
    options: &RecallOptions,
) -> Result<(Vec<RecallHit>, Trace), HindsightError> {
    let now = Utc::now();

    let lexical = storage
        .fts_search(bank_id, &crate::search::sanitize_fts5_query(query), options.limit * 4)
        .map_err(HindsightError::from)?;

    let semantic_hits = embeddings
        .search(IndexName::Memory, query, options.limit * 4)
        .await
        .map_err(HindsightError::from)?;
    let semantic: Vec<(String, f32)> = semantic_hits.into_iter().map(|h| (h.id, 1.0 - h.distance)).collect();

    let seed_ids: Vec<String> = lexical.iter().chain(semantic.iter()).take(10).map(|(id, _)| id.clone()).collect();
    let graph = storage.graph_neighbors(&seed_ids, options.graph_hops).map_err(HindsightError::from)?;

    let event_date_ms = now.timestamp_millis();
    let temporal_memories = storage
        .memories_in_temporal_window(bank_id, event_date_ms, defaults.temporal_window_ms, options.limit * 2)
        .map_err(HindsightError::from)?;
    let temporal: Vec<(String, f32)> = temporal_memories
        .iter()
        .map(|m| {
            let age_ms = (event_date_ms - m.event_date_ms).unsigned_abs() as f32;
            let score = (-(age_ms) / defaults.recall_temporal_tau_ms.max(1) as f32).exp();
            (m.id.clone(), score)
        })
        .collect();

    let counts = CandidateCounts {
        lexical: lexical.len(),
        semantic: semantic.len(),
        graph: graph.len(),
        temporal: temporal.len(),
    };

    let rrf_scores = reciprocal_rank_fusion(
        &[lexical.clone(), semantic.clone(), graph.clone()],
        defaults.rrf_k,
    );

    let mut candidate_ids: Vec<String> = rrf_scores.keys().cloned().collect();
    for (id, _) in &temporal {
        if !rrf_scores.contains_key(id) {
            candidate_ids.push(id.clone());
        }
    }

    let memories = storage.get_memories(bank_id, &candidate_ids).map_err(HindsightError::from)?;
    let memory_by_id: HashMap<String, &MemoryUnit> = memories.iter().map(|m| (m.id.clone(), m)).collect();
    let temporal_by_id: HashMap<String, f32> = temporal.into_iter().collect();

    let max_rrf = rrf_scores.values().cloned().fold(0.0_f32, f32::max).max(0.001);

    let mut rerank_by_id: HashMap<String, f32> = HashMap::new();
    let mut reranked = false;
    if options.use_rerank {
        if let Some(reranker) = reranker {
            let pool: Vec<(String, String)> = candidate_ids
                .iter()
                .filter_map(|id| memory_by_id.get(id).map(|m| (id.clone(), m.content.clone())))
                .collect();
            if !pool.is_empty() {
                if let Ok(results) = reranker.rerank(query, &pool).await {
                    let max_rerank = results.iter().map(|r| r.score).fold(0.0_f32, f32::max).max(0.001);
                    for r in results {
                        rerank_by_id.insert(r.id, r.score / max_rerank);
                    }
                    reranked = true;
                }
            }
        }
    }

    let mut hits: Vec<RecallHit> = candidate_ids
        .into_iter()
        .filter_map(|id| memory_by_id.get(&id).map(|m| (*m).clone()).map(|m| (id, m)))
        .map(|(id, memory)| {
            let rrf_norm = rrf_scores.get(&id).copied().unwrap_or(0.0) / max_rrf;
            let rerank_norm = rerank_by_id.get(&id).copied().unwrap_or(0.0);
            let temporal_norm = temporal_by_id.get(&id).copied().unwrap_or(0.0);
            let recency_norm = recency_score(memory.last_accessed, now);

            let score = defaults.recall_weight_rrf * rrf_norm
                + defaults.recall_weight_rerank * rerank_norm
                + defaults.recall_weight_temporal * temporal_norm
                + defaults.recall_weight_recency * recency_norm;

            RecallHit { memory, score }
        })
        .collect();

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(options.limit);

    let mut truncated_by_budget = false;
    if let Some(budget) = options.token_budget {
        let mut used = 0usize;
        let mut kept = Vec::with_capacity(hits.len());
        for hit in hits {
            let tokens = hit.memory.content.len() / defaults.chars_per_token.max(1);
            if used + tokens > budget && !kept.is_empty() {
                truncated_by_budget = true;
                break;
            }
            used += tokens;
            kept.push(hit);
        }
        hits = kept;
    }

    let trace = Trace {
        query: query.to_string(),
        bank_id: bank_id.to_string(),
        candidate_counts: counts,
        reranked,
        result_count: hits.len(),
        truncated_by_budget,
    };

    Ok((hits, trace))
}

fn recency_score(last_accessed: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let age_ms = (now - last_accessed).num_milliseconds().max(0) as f32;
    let tau_ms = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;
    (-(age_ms) / tau_ms).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_score_decays_with_age() {
        let now = Utc::now();
        let recent = recency_score(now, now);
        let old = recency_score(now - chrono::Duration::days(30), now);
        assert!(recent > old);
    }
}
