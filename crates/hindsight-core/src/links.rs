//! Link builder (C6): typed edges between memories, created as a
//! fire-and-forget step after persist (`spec.md` §4.5, §5 retain pipeline).

use chrono::{DateTime, Utc};

use crate::model::{LinkType, MemoryLink};
use crate::util::new_monotonic_id;

/// Build an `entity` link between two memories that share resolved entities,
/// weighted by `shared_entities / max(|entities_i|, |entities_j|, 1)`
/// (`spec.md` §4.5: shared mention count over the larger of the two entity sets).
pub fn entity_link(
    bank_id: &str,
    source_id: &str,
    target_id: &str,
    shared_entities: usize,
    source_entity_count: usize,
    target_entity_count: usize,
    at: DateTime<Utc>,
) -> MemoryLink {
    let denom = source_entity_count.max(target_entity_count).max(1) as f32;
    let weight = shared_entities as f32 / denom;
    MemoryLink {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        source_id: source_id.to_string(),
        target_id: target_id.to_string(),
        link_type: LinkType::Entity,
        weight,
        created_at: at,
    }
}

/// Build a `caused_by` link when extraction reports a causal relationship
/// between two memories in the same write batch. `strength` is the
/// extractor-provided confidence in [0, 1] (`spec.md` §4.5).
pub fn causal_link(bank_id: &str, cause_id: &str, effect_id: &str, strength: f32, at: DateTime<Utc>) -> MemoryLink {
    MemoryLink {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        source_id: cause_id.to_string(),
        target_id: effect_id.to_string(),
        link_type: LinkType::CausedBy,
        weight: strength.clamp(0.0, 1.0),
        created_at: at,
    }
}

/// Build a `temporal` link to the chronologically preceding memory, weighted
/// by a linear decay floored at `min_weight` (`spec.md` §4.5: "weight =
/// max(minWeight, 1 - distanceMs / windowMs)" — temporal links never drop,
/// distant pairs just keep a floor weight).
pub fn temporal_link(
    bank_id: &str,
    earlier_id: &str,
    later_id: &str,
    gap_ms: i64,
    window_ms: i64,
    min_weight: f32,
    at: DateTime<Utc>,
) -> MemoryLink {
    let decayed = 1.0 - (gap_ms.max(0) as f32 / window_ms.max(1) as f32);
    let weight = decayed.max(min_weight);
    MemoryLink {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        source_id: earlier_id.to_string(),
        target_id: later_id.to_string(),
        link_type: LinkType::Temporal,
        weight,
        created_at: at,
    }
}

/// Build `semantic` links from `new_id` to its top-`k` nearest neighbors,
/// skipping anything under `min_similarity`. `candidates` is the
/// (id, similarity) pool the embedding store's index search already
/// produced for the new memory's vector (`spec.md` §4.5 "semantic links to
/// the k nearest memories by embedding").
pub fn semantic_links(
    bank_id: &str,
    new_id: &str,
    candidates: &[(String, f32)],
    k: usize,
    min_similarity: f32,
    at: DateTime<Utc>,
) -> Vec<MemoryLink> {
    let mut scored: Vec<(String, f32)> = candidates
        .iter()
        .filter(|(id, similarity)| id != new_id && *similarity >= min_similarity)
        .cloned()
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);

    scored
        .into_iter()
        .map(|(target_id, similarity)| MemoryLink {
            id: new_monotonic_id(),
            bank_id: bank_id.to_string(),
            source_id: new_id.to_string(),
            target_id,
            link_type: LinkType::Semantic,
            weight: similarity,
            created_at: at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporal_link_floors_at_min_weight_for_distant_pairs() {
        let at = Utc::now();
        let far = temporal_link("bank-1", "a", "b", 1_000_000_000, 1000, 0.3, at);
        assert_eq!(far.weight, 0.3);
        let near = temporal_link("bank-1", "a", "b", 0, 1000, 0.3, at);
        assert_eq!(near.weight, 1.0);
    }

    #[test]
    fn entity_link_weight_is_shared_over_max_set_size() {
        let at = Utc::now();
        let link = entity_link("bank-1", "a", "b", 2, 4, 3, at);
        assert!((link.weight - 0.5).abs() < 1e-6);
    }

    #[test]
    fn causal_link_carries_extractor_strength() {
        let at = Utc::now();
        let link = causal_link("bank-1", "a", "b", 0.65, at);
        assert!((link.weight - 0.65).abs() < 1e-6);
    }

    #[test]
    fn semantic_links_respect_k_and_min_similarity() {
        let at = Utc::now();
        let candidates = vec![
            ("a".to_string(), 0.95),
            ("b".to_string(), 0.1),
            ("c".to_string(), 0.8),
        ];
        let links = semantic_links("bank-1", "new", &candidates, 1, 0.5, at);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_id, "a");
    }

    #[test]
    fn semantic_links_exclude_self() {
        let at = Utc::now();
        let candidates = vec![("new".to_string(), 1.0)];
        let links = semantic_links("bank-1", "new", &candidates, 5, 0.0, at);
        assert!(links.is_empty());
    }
}
