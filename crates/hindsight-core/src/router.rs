//! Write-time router (C5): decide whether an incoming fact reinforces an
//! existing memory, reconsolidates (revises) one, or starts a new trace.

use chrono::{DateTime, Utc};

use crate::model::MemoryUnit;

#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// Near-duplicate of an existing memory: bump access stats, leave content untouched.
    Reinforce { target: MemoryUnit, score: f32 },
    /// Close enough to revise: append a `MemoryRevision` and update content/confidence.
    Reconsolidate { target: MemoryUnit, reason: String, score: f32 },
    /// Not close enough to anything: persist as a new memory. Carries the best
    /// candidate similarity seen, if any, for routing-decision logging.
    NewTrace { best_similarity: Option<f32> },
}

#[derive(Debug, Clone, Copy)]
pub struct RouterThresholds {
    pub reinforce_threshold: f32,
    pub reconsolidate_threshold: f32,
}

/// A memory paired with its cosine similarity to the incoming fact, as
/// fetched for the candidate set (kNN over the temporal window, per
/// `spec.md` §4.4). The embedding store computes similarity directly from
/// its index search, so the router never needs raw vectors.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub memory: MemoryUnit,
    pub similarity: f32,
}

/// Route a new fact against `candidates`, the memories within the bank's
/// temporal window of `event_date_ms`. Candidates are assumed pre-filtered
/// to the temporal window by the caller (storage layer); this function only
/// applies the similarity thresholds.
pub fn route(candidates: &[RouteCandidate], thresholds: RouterThresholds) -> RouteDecision {
    let best = candidates
        .iter()
        .map(|c| (c.similarity, c))
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    match best {
        Some((similarity, candidate)) if similarity >= thresholds.reinforce_threshold => {
            RouteDecision::Reinforce { target: candidate.memory.clone(), score: similarity }
        }
        Some((similarity, candidate)) if similarity >= thresholds.reconsolidate_threshold => {
            RouteDecision::Reconsolidate {
                target: candidate.memory.clone(),
                reason: format!("similarity {similarity:.3} within reconsolidate band"),
                score: similarity,
            }
        }
        _ => RouteDecision::NewTrace { best_similarity: best.map(|(similarity, _)| similarity) },
    }
}

/// Apply a `Reinforce` decision: bump access stats and encoding strength,
/// leave `content`/`confidence`/`history` untouched (`spec.md` §4.4 invariant:
/// reinforce never rewrites content).
pub fn apply_reinforce(target: &mut MemoryUnit, at: DateTime<Utc>) {
    target.access_count += 1;
    target.last_accessed = at;
    target.encoding_strength = (target.encoding_strength + 0.1).min(2.0);
    target.updated_at = at;
}

/// Apply a `Reconsolidate` decision: append the prior text as a revision and
/// replace content/confidence with the new fact.
pub fn apply_reconsolidate(
    target: &mut MemoryUnit,
    new_content: &str,
    new_confidence: f32,
    reason: &str,
    at: DateTime<Utc>,
) {
    target.history.push(crate::model::MemoryRevision {
        previous_text: target.content.clone(),
        reason: reason.to_string(),
        revised_at: at,
    });
    target.content = new_content.to_string();
    target.confidence = new_confidence;
    target.access_count += 1;
    target.last_accessed = at;
    target.updated_at = at;
    // reconsolidate never mutates proof_count; observations keep their
    // accumulated evidence count across revisions (`spec.md` §9 OQ2).
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FactType, Scope};

    fn sample_memory() -> MemoryUnit {
        let now = Utc::now();
        MemoryUnit {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            bank_id: "bank-1".into(),
            content: "likes coffee".into(),
            fact_type: FactType::Opinion,
            confidence: 0.8,
            document_id: None,
            chunk_id: None,
            event_date_ms: now.timestamp_millis(),
            occurred_start_ms: None,
            occurred_end_ms: None,
            mentioned_at_ms: None,
            metadata: serde_json::json!({}),
            tags: vec![],
            source_text: None,
            access_count: 0,
            last_accessed: now,
            encoding_strength: 1.0,
            gist: "likes coffee".into(),
            scope: Scope::Profile,
            consolidated_at: None,
            proof_count: None,
            source_memory_ids: vec![],
            history: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn near_identical_embedding_reinforces() {
        let candidates = vec![RouteCandidate { memory: sample_memory(), similarity: 0.99 }];
        let thresholds = RouterThresholds { reinforce_threshold: 0.92, reconsolidate_threshold: 0.75 };
        let decision = route(&candidates, thresholds);
        assert!(matches!(decision, RouteDecision::Reinforce { .. }));
    }

    #[test]
    fn moderately_similar_embedding_reconsolidates() {
        let candidates = vec![RouteCandidate { memory: sample_memory(), similarity: 0.8 }];
        let thresholds = RouterThresholds { reinforce_threshold: 0.92, reconsolidate_threshold: 0.75 };
        let decision = route(&candidates, thresholds);
        assert!(matches!(decision, RouteDecision::Reconsolidate { .. }));
    }

    #[test]
    fn dissimilar_embedding_starts_new_trace() {
        let candidates = vec![RouteCandidate { memory: sample_memory(), similarity: 0.1 }];
        let thresholds = RouterThresholds { reinforce_threshold: 0.92, reconsolidate_threshold: 0.75 };
        let decision = route(&candidates, thresholds);
        assert!(matches!(decision, RouteDecision::NewTrace { .. }));
    }

    #[test]
    fn reinforce_does_not_touch_content_or_history() {
        let mut m = sample_memory();
        let original_content = m.content.clone();
        apply_reinforce(&mut m, Utc::now());
        assert_eq!(m.content, original_content);
        assert!(m.history.is_empty());
        assert_eq!(m.access_count, 1);
    }

    #[test]
    fn reconsolidate_preserves_proof_count_across_revision() {
        let mut m = sample_memory();
        m.fact_type = FactType::Observation;
        m.proof_count = Some(4);
        apply_reconsolidate(&mut m, "prefers tea now", 0.9, "updated preference", Utc::now());
        assert_eq!(m.proof_count, Some(4));
        assert_eq!(m.history.len(), 1);
        assert_eq!(m.history[0].previous_text, "likes coffee");
    }
}
