//! Rank fusion for the recall engine's candidate sources (`spec.md` §4.2 C9).

use std::collections::HashMap;

/// Reciprocal Rank Fusion: `score(d) = sum(1 / (k + rank(d)))` across every
/// source list the id appears in. Normalizes across incomparable scoring
/// scales (BM25 vs cosine vs graph hop count) and rewards multi-source hits.
pub fn reciprocal_rank_fusion(sources: &[Vec<(String, f32)>], k: f32) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for source in sources {
        for (rank, (id, _)) in source.iter().enumerate() {
            *scores.entry(id.clone()).or_default() += 1.0 / (k + rank as f32 + 1.0);
        }
    }
    scores
}

/// Weighted linear combination of per-source normalized scores, keyed by id.
/// `weighted[id] = sum(weight_i * normalized_score_i(id))`.
pub fn linear_combination(sources: &[(Vec<(String, f32)>, f32)]) -> HashMap<String, f32> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for (source, weight) in sources {
        let max_score = source.iter().map(|(_, s)| *s).fold(0.0_f32, f32::max).max(0.001);
        for (id, score) in source {
            *scores.entry(id.clone()).or_default() += (score / max_score) * weight;
        }
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_rewards_multi_source_hits() {
        let lexical = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8)];
        let semantic = vec![("b".to_string(), 0.95), ("c".to_string(), 0.85)];
        let scores = reciprocal_rank_fusion(&[lexical, semantic], 60.0);
        assert!(scores["b"] > scores["a"]);
        assert!(scores["b"] > scores["c"]);
    }

    #[test]
    fn rrf_handles_empty_sources() {
        let scores = reciprocal_rank_fusion(&[vec![], vec![("a".to_string(), 1.0)]], 60.0);
        assert_eq!(scores.len(), 1);
    }

    #[test]
    fn linear_combination_weights_sources() {
        let keyword = vec![("a".to_string(), 1.0)];
        let semantic = vec![("b".to_string(), 1.0)];
        let scores = linear_combination(&[(keyword, 0.9), (semantic, 0.1)]);
        assert!(scores["a"] > scores["b"]);
    }
}
