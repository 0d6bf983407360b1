//! Episode tracker (C7): groups writes into episodes and chains them with
//! temporal links for narrative traversal (`spec.md` §4.6, §4.7).

use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::{BoundaryReason, Episode, Scope};
use crate::storage::Storage;
use crate::util::new_monotonic_id;

/// Direction to walk the episode chain for a narrative query (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrativeDirection {
    Before,
    After,
    Both,
}

pub const NARRATIVE_DEFAULT_STEPS: usize = 8;
pub const NARRATIVE_MAX_STEPS: usize = 32;
const NARRATIVE_SNIPPET_CHARS: usize = 200;

/// One event surfaced by a narrative walk: a content snippet and the route
/// that produced it, identified by its episode so callers can keep paging.
#[derive(Debug, Clone)]
pub struct NarrativeEvent {
    pub episode_id: String,
    pub memory_id: String,
    pub route: String,
    pub event_time: DateTime<Utc>,
    pub snippet: String,
}

/// Walk the episode chain from `anchor_memory_id`'s episode up to `steps`
/// episodes in `direction`, collecting events ordered by `(eventTime, id)`
/// (`spec.md` §4.6). `steps` is clamped to `[1, NARRATIVE_MAX_STEPS]`,
/// defaulting to `NARRATIVE_DEFAULT_STEPS` when `None`.
pub fn narrative(
    storage: &Storage,
    bank_id: &str,
    anchor_memory_id: &str,
    direction: NarrativeDirection,
    steps: Option<usize>,
) -> Result<Vec<NarrativeEvent>, StorageError> {
    let steps = steps.unwrap_or(NARRATIVE_DEFAULT_STEPS).clamp(1, NARRATIVE_MAX_STEPS);

    let Some(anchor_episode_id) = storage.episode_for_memory(anchor_memory_id)? else {
        return Ok(vec![]);
    };

    let mut episode_ids: Vec<String> = Vec::new();

    if direction == NarrativeDirection::Before || direction == NarrativeDirection::Both {
        let mut cursor = anchor_episode_id.clone();
        for _ in 0..steps {
            match storage.prior_episode(&cursor)? {
                Some(ep) => {
                    episode_ids.push(ep.id.clone());
                    cursor = ep.id;
                }
                None => break,
            }
        }
    }

    episode_ids.push(anchor_episode_id.clone());

    if direction == NarrativeDirection::After || direction == NarrativeDirection::Both {
        let mut cursor = anchor_episode_id;
        for _ in 0..steps {
            match storage.next_episode(bank_id, &cursor)? {
                Some(ep) => {
                    episode_ids.push(ep.id.clone());
                    cursor = ep.id;
                }
                None => break,
            }
        }
    }

    let mut events: Vec<NarrativeEvent> = Vec::new();
    for episode_id in &episode_ids {
        for event in storage.episode_events(episode_id)? {
            let memory = storage.get_memory(bank_id, &event.memory_id)?;
            let snippet = memory
                .map(|m| m.content.chars().take(NARRATIVE_SNIPPET_CHARS).collect())
                .unwrap_or_default();
            events.push(NarrativeEvent {
                episode_id: episode_id.clone(),
                memory_id: event.memory_id,
                route: event.route,
                event_time: event.event_time,
                snippet,
            });
        }
    }
    events.sort_by(|a, b| a.event_time.cmp(&b.event_time).then_with(|| a.memory_id.cmp(&b.memory_id)));
    Ok(events)
}

#[derive(Debug, Clone, Copy)]
pub struct EpisodeThresholds {
    pub time_gap_ms: i64,
}

/// Decide whether `event_at` starts a new episode or continues `current`.
/// Order of checks follows `spec.md` §4.6: no prior episode, then a
/// boundary phrase, then a scope change, then a plain time gap.
pub fn detect_boundary(
    current: Option<&Episode>,
    event_at: DateTime<Utc>,
    scope: Scope,
    text: &str,
    boundary_phrases: &[String],
    thresholds: EpisodeThresholds,
) -> Option<BoundaryReason> {
    let current = match current {
        None => return Some(BoundaryReason::Initial),
        Some(e) => e,
    };

    let lower = text.to_lowercase();
    if boundary_phrases.iter().any(|phrase| lower.contains(&phrase.to_lowercase())) {
        return Some(BoundaryReason::PhraseBoundary);
    }

    if current.scope != scope {
        return Some(BoundaryReason::ScopeChange);
    }

    let gap_ms = (event_at - current.last_event_at).num_milliseconds();
    if gap_ms >= thresholds.time_gap_ms {
        return Some(BoundaryReason::TimeGap);
    }

    None
}

/// Build a fresh episode starting at `event_at`.
pub fn new_episode(bank_id: &str, scope: Scope, event_at: DateTime<Utc>, reason: BoundaryReason) -> Episode {
    Episode {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        scope,
        start_at: event_at,
        end_at: None,
        last_event_at: event_at,
        event_count: 0,
        boundary_reason: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_episode(last_event_at: DateTime<Utc>, scope: Scope) -> Episode {
        Episode {
            id: "ep-1".into(),
            bank_id: "bank-1".into(),
            scope,
            start_at: last_event_at,
            end_at: None,
            last_event_at,
            event_count: 1,
            boundary_reason: BoundaryReason::Initial,
        }
    }

    #[test]
    fn no_prior_episode_is_initial_boundary() {
        let thresholds = EpisodeThresholds { time_gap_ms: 1000 };
        let reason = detect_boundary(None, Utc::now(), Scope::Profile, "hello", &[], thresholds);
        assert_eq!(reason, Some(BoundaryReason::Initial));
    }

    #[test]
    fn scope_change_takes_priority_over_time_gap() {
        let now = Utc::now();
        let episode = sample_episode(now, Scope::Profile);
        let thresholds = EpisodeThresholds { time_gap_ms: 1_000_000 };
        let reason = detect_boundary(Some(&episode), now, Scope::Project, "hello", &[], thresholds);
        assert_eq!(reason, Some(BoundaryReason::ScopeChange));
    }

    #[test]
    fn boundary_phrase_triggers_new_episode_within_window() {
        let now = Utc::now();
        let episode = sample_episode(now, Scope::Profile);
        let thresholds = EpisodeThresholds { time_gap_ms: 1_000_000 };
        let phrases = vec!["new task".to_string()];
        let reason = detect_boundary(Some(&episode), now, Scope::Profile, "Starting a new task today", &phrases, thresholds);
        assert_eq!(reason, Some(BoundaryReason::PhraseBoundary));
    }

    #[test]
    fn large_time_gap_without_phrase_triggers_time_gap_boundary() {
        let now = Utc::now();
        let episode = sample_episode(now, Scope::Profile);
        let thresholds = EpisodeThresholds { time_gap_ms: 1000 };
        let later = now + Duration::milliseconds(5000);
        let reason = detect_boundary(Some(&episode), later, Scope::Profile, "still talking", &[], thresholds);
        assert_eq!(reason, Some(BoundaryReason::TimeGap));
    }

    #[test]
    fn close_in_time_same_scope_continues_episode() {
        let now = Utc::now();
        let episode = sample_episode(now, Scope::Profile);
        let thresholds = EpisodeThresholds { time_gap_ms: 10_000 };
        let later = now + Duration::milliseconds(100);
        let reason = detect_boundary(Some(&episode), later, Scope::Profile, "still talking", &[], thresholds);
        assert_eq!(reason, None);
    }
}
