//! Injected cross-encoder reranker (`spec.md` §6, §4.2 C9 recall pipeline).
//!
//! Two-stage retrieval: the candidate union from RRF fusion is the recall
//! stage (fast, high recall), and the reranker — when configured — reorders
//! that pool for precision. The model itself lives outside the engine; we
//! only drive it through this trait.

use async_trait::async_trait;

use crate::error::ExtractionError;

/// Default number of candidates handed to the reranker.
pub const DEFAULT_RETRIEVAL_COUNT: usize = 50;
/// Default number of results kept after reranking.
pub const DEFAULT_RERANK_COUNT: usize = 10;

#[derive(Debug, Clone)]
pub struct RerankerConfig {
    pub candidate_count: usize,
    pub result_count: usize,
    pub min_score: Option<f32>,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            candidate_count: DEFAULT_RETRIEVAL_COUNT,
            result_count: DEFAULT_RERANK_COUNT,
            min_score: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RerankedResult {
    pub id: String,
    pub score: f32,
    pub original_rank: usize,
}

/// Injected cross-encoder collaborator. Given a query and a pool of
/// `(id, text)` candidates, returns relevance scores; higher is more
/// relevant. The engine sorts by score and keeps the pool order as a
/// tie-break, it does not assume any particular score range.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<RerankedResult>, ExtractionError>;
}

/// Apply `config` to a reranker's raw output: keep the top `result_count`,
/// dropping anything under `min_score`.
pub fn apply_config(mut results: Vec<RerankedResult>, config: &RerankerConfig) -> Vec<RerankedResult> {
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    if let Some(min_score) = config.min_score {
        results.retain(|r| r.score >= min_score);
    }
    results.truncate(config.result_count);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TermOverlapReranker;

    #[async_trait]
    impl Reranker for TermOverlapReranker {
        async fn rerank(
            &self,
            query: &str,
            candidates: &[(String, String)],
        ) -> Result<Vec<RerankedResult>, ExtractionError> {
            let query_tokens: std::collections::HashSet<&str> = query.split_whitespace().collect();
            let mut out = Vec::with_capacity(candidates.len());
            for (rank, (id, text)) in candidates.iter().enumerate() {
                let tokens: std::collections::HashSet<&str> = text.split_whitespace().collect();
                let overlap = query_tokens.intersection(&tokens).count() as f32;
                out.push(RerankedResult { id: id.clone(), score: overlap, original_rank: rank });
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn reranker_orders_by_term_overlap() {
        let reranker = TermOverlapReranker;
        let candidates = vec![
            ("a".to_string(), "cats and dogs".to_string()),
            ("b".to_string(), "cats dogs birds fish".to_string()),
        ];
        let results = reranker.rerank("cats dogs birds", &candidates).await.unwrap();
        let applied = apply_config(results, &RerankerConfig::default());
        assert_eq!(applied[0].id, "b");
    }

    #[test]
    fn apply_config_respects_min_score_and_result_count() {
        let results = vec![
            RerankedResult { id: "a".into(), score: 0.9, original_rank: 0 },
            RerankedResult { id: "b".into(), score: 0.1, original_rank: 1 },
        ];
        let config = RerankerConfig { candidate_count: 50, result_count: 10, min_score: Some(0.5) };
        let applied = apply_config(results, &config);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, "a");
    }
}
