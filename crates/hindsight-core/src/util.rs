//! Small shared helpers: text sanitization, stable JSON hashing, id generation.

use serde_json::Value;
use std::collections::BTreeMap;
use ulid::Ulid;

/// Strip null bytes and unpaired surrogate code units from text before it is
/// persisted. `spec.md` §6 "Boundary formats" requires this for all text
/// written to storage.
pub fn sanitize_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c != '\u{0000}')
        .collect::<String>()
        // `char` in Rust is always a valid scalar value, so unpaired surrogates
        // cannot survive UTF-8 decoding; replacement characters left behind by
        // lossy decoding upstream are the only residue worth stripping here.
        .replace('\u{FFFD}', "")
}

/// A new ULID-style id, lexicographically monotonic with creation order.
/// Used for every table whose id ordering is assumed to track time ordering
/// (memories, links, episodes, async operations, routing decisions).
pub fn new_monotonic_id() -> String {
    Ulid::new().to_string()
}

/// A new random id for entities that carry no ordering requirement
/// (banks, entities, mental models, directives, documents, chunks).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Canonicalize a JSON value by recursively sorting object keys, so that
/// `{"a":1,"b":2}` and `{"b":2,"a":1}` hash identically. Used by the router's
/// decision log and the async-op dedup key (`spec.md` §9).
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonical_json(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

/// Stable hash of a JSON value's canonical form, used as a dedup key.
pub fn stable_hash(value: &Value) -> String {
    use std::hash::{Hash, Hasher};
    let canonical = canonical_json(value);
    let serialized = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serialized.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Cosine distance between two equal-length vectors, in `[0, 2]`.
/// `similarity = 1 - distance` per `spec.md` §4.2.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let similarity = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    1.0 - similarity
}

/// Lowercased token-set similarity between two names, in `[0, 1]`.
/// Combines Jaccard overlap on whitespace tokens with a normalized edit
/// distance on the full lowercased string, used by the entity resolver.
pub fn name_similarity(a: &str, b: &str) -> f32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }

    let tokens_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    let token_sim = if tokens_a.is_empty() && tokens_b.is_empty() {
        1.0
    } else {
        let intersection = tokens_a.intersection(&tokens_b).count();
        let union = tokens_a.union(&tokens_b).count().max(1);
        intersection as f32 / union as f32
    };

    let edit_sim = normalized_edit_similarity(&a, &b);
    0.5 * token_sim + 0.5 * edit_sim
}

/// 1 - (levenshtein distance / max length), in `[0, 1]`.
fn normalized_edit_similarity(a: &str, b: &str) -> f32 {
    let max_len = a.chars().count().max(b.chars().count()).max(1);
    let dist = levenshtein(a, b);
    1.0 - (dist as f32 / max_len as f32)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (la, lb) = (a.len(), b.len());
    let mut row: Vec<usize> = (0..=lb).collect();

    for i in 1..=la {
        let mut prev = row[0];
        row[0] = i;
        for j in 1..=lb {
            let cur = row[j];
            row[j] = if a[i - 1] == b[j - 1] {
                prev
            } else {
                1 + prev.min(row[j]).min(row[j - 1])
            };
            prev = cur;
        }
    }
    row[lb]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_null_bytes() {
        let dirty = "hello\u{0000}world";
        assert_eq!(sanitize_text(dirty), "helloworld");
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a: Value = serde_json::json!({"b": 2, "a": 1});
        let b: Value = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(stable_hash(&a), stable_hash(&b));
    }

    #[test]
    fn name_similarity_exact_match_is_one() {
        assert_eq!(name_similarity("Alice", "alice"), 1.0);
    }

    #[test]
    fn name_similarity_distinguishes_distinct_names() {
        let close = name_similarity("Alice Smith", "Alice Smyth");
        let far = name_similarity("Alice Smith", "Bob Jones");
        assert!(close > far);
    }

    #[test]
    fn cosine_distance_identical_vectors_is_zero() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!(cosine_distance(&v, &v) < 1e-5);
    }

    #[test]
    fn monotonic_ids_increase_with_creation_order() {
        let a = new_monotonic_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_monotonic_id();
        assert!(b > a);
    }
}
