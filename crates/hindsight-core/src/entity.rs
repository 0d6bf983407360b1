//! Entity resolution (C4): multi-factor scoring to decide whether a name
//! mentioned in new text refers to an existing entity or a new one.

use chrono::{DateTime, Utc};

use crate::model::{Entity, EntityType};
use crate::util::name_similarity;

#[derive(Debug, Clone)]
pub struct EntityCandidate {
    pub entity: Entity,
    /// Number of memories this entity co-occurs with, among the memories
    /// already selected for the current write (context boost input).
    pub cooccurrence_with_selected: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct EntityScoreWeights {
    pub name_weight: f32,
    pub context_weight: f32,
    pub recency_weight: f32,
    /// Exponential recency decay half-life, in milliseconds.
    pub recency_half_life_ms: i64,
}

impl Default for EntityScoreWeights {
    fn default() -> Self {
        Self {
            name_weight: 0.75,
            context_weight: 0.15,
            recency_weight: 0.1,
            recency_half_life_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntityMatch {
    pub entity: Entity,
    pub score: f32,
}

/// The resolver's decision for one mentioned name.
#[derive(Debug, Clone)]
pub enum EntityResolution {
    /// Match an existing entity with high enough confidence and margin.
    Matched(EntityMatch),
    /// No existing entity cleared the bar; the caller should create a new one.
    New { name: String, entity_type: EntityType },
}

fn recency_boost(last_updated: DateTime<Utc>, now: DateTime<Utc>, half_life_ms: i64) -> f32 {
    let age_ms = (now - last_updated).num_milliseconds().max(0) as f32;
    0.5_f32.powf(age_ms / half_life_ms.max(1) as f32)
}

fn context_boost(cooccurrence: i64) -> f32 {
    // Saturating boost: 0 co-occurrences -> 0.0, growing toward 1.0.
    let c = cooccurrence as f32;
    c / (c + 3.0)
}

fn score_candidate(
    mentioned_name: &str,
    candidate: &EntityCandidate,
    now: DateTime<Utc>,
    weights: EntityScoreWeights,
) -> f32 {
    let name_score = name_similarity(mentioned_name, &candidate.entity.name);
    let context_score = context_boost(candidate.cooccurrence_with_selected);
    let recency_score = recency_boost(candidate.entity.last_updated, now, weights.recency_half_life_ms);

    weights.name_weight * name_score + weights.context_weight * context_score + weights.recency_weight * recency_score
}

/// Resolve a mentioned name against `candidates`, the existing entities in
/// this bank with same or compatible `entity_type`. Matches only when the
/// top score clears `threshold` AND beats the runner-up by at least `margin`
/// (`spec.md` §4.3 "threshold + margin gating" — avoids flip-flopping between
/// two near-identical candidates on marginal evidence).
pub fn resolve_entity(
    mentioned_name: &str,
    entity_type: EntityType,
    candidates: &[EntityCandidate],
    now: DateTime<Utc>,
    threshold: f32,
    margin: f32,
    weights: EntityScoreWeights,
) -> EntityResolution {
    let mut scored: Vec<(f32, &EntityCandidate)> = candidates
        .iter()
        .filter(|c| c.entity.entity_type == entity_type)
        .map(|c| (score_candidate(mentioned_name, c, now, weights), c))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    match scored.as_slice() {
        [] => EntityResolution::New { name: mentioned_name.to_string(), entity_type },
        [(top_score, top), rest @ ..] => {
            let runner_up = rest.first().map(|(s, _)| *s).unwrap_or(0.0);
            if *top_score >= threshold && (*top_score - runner_up) >= margin {
                EntityResolution::Matched(EntityMatch { entity: top.entity.clone(), score: *top_score })
            } else {
                EntityResolution::New { name: mentioned_name.to_string(), entity_type }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, entity_type: EntityType, cooccurrence: i64, last_updated: DateTime<Utc>) -> EntityCandidate {
        EntityCandidate {
            entity: Entity {
                id: format!("entity-{name}"),
                bank_id: "bank-1".into(),
                name: name.to_string(),
                entity_type,
                mention_count: 1,
                first_seen: last_updated,
                last_updated,
                description: None,
                metadata: serde_json::json!({}),
            },
            cooccurrence_with_selected: cooccurrence,
        }
    }

    #[test]
    fn exact_name_match_resolves_to_existing_entity() {
        let now = Utc::now();
        let candidates = vec![candidate("Alice Smith", EntityType::Person, 0, now)];
        let resolution = resolve_entity("Alice Smith", EntityType::Person, &candidates, now, 0.82, 0.05, EntityScoreWeights::default());
        assert!(matches!(resolution, EntityResolution::Matched(_)));
    }

    #[test]
    fn unrelated_name_creates_new_entity() {
        let now = Utc::now();
        let candidates = vec![candidate("Alice Smith", EntityType::Person, 0, now)];
        let resolution = resolve_entity("Bob Jones", EntityType::Person, &candidates, now, 0.82, 0.05, EntityScoreWeights::default());
        assert!(matches!(resolution, EntityResolution::New { .. }));
    }

    #[test]
    fn ambiguous_candidates_within_margin_create_new_entity() {
        let now = Utc::now();
        let candidates = vec![
            candidate("Alex Smith", EntityType::Person, 2, now),
            candidate("Alex Smyth", EntityType::Person, 2, now),
        ];
        let resolution = resolve_entity("Alex Smit", EntityType::Person, &candidates, now, 0.5, 0.2, EntityScoreWeights::default());
        assert!(matches!(resolution, EntityResolution::New { .. }));
    }

    #[test]
    fn context_boost_breaks_ties_toward_cooccurring_entity() {
        let now = Utc::now();
        let boosted = score_candidate(
            "Sam",
            &candidate("Sam", EntityType::Person, 10, now),
            now,
            EntityScoreWeights::default(),
        );
        let unboosted = score_candidate(
            "Sam",
            &candidate("Sam", EntityType::Person, 0, now),
            now,
            EntityScoreWeights::default(),
        );
        assert!(boosted > unboosted);
    }
}
