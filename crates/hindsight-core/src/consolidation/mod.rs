//! Consolidation engine (C10): periodically reviews unconsolidated memories
//! and lets the injected LLM propose create/update/merge/skip actions that
//! produce or refine observation-type memories (`spec.md` §4.8).

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingStore;
use crate::error::{ExtractionError, HindsightError};
use crate::llm::{ChatMessage, ChatRole, LlmAdapter, LlmRequest};
use crate::model::{AsyncOperation, FactType, MemoryRevision, MemoryUnit, OpStatus, Scope, TaskType};
use crate::storage::Storage;
use crate::util::{new_monotonic_id, stable_hash};

#[derive(Debug, Clone, Copy)]
pub struct ConsolidationOptions {
    pub batch_size: usize,
}

/// Summary counters matching `spec.md` §4.9's `consolidate` return shape.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationReport {
    pub memories_processed: usize,
    pub observations_created: usize,
    pub observations_updated: usize,
    pub observations_merged: usize,
    pub skipped: usize,
    pub mental_models_refresh_queued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConsolidationAction {
    /// Create a new observation summarizing the reviewed memories.
    Create {
        content: String,
        #[serde(rename = "sourceMemoryIds", default)]
        source_memory_ids: Vec<String>,
    },
    /// Update an existing observation's content, citing new source memories.
    Update {
        #[serde(rename = "observationId")]
        observation_id: String,
        content: String,
        #[serde(rename = "additionalSourceMemoryIds", default)]
        additional_source_memory_ids: Vec<String>,
    },
    /// Merge two observations into one, keeping `primary_id`.
    Merge {
        #[serde(rename = "primaryId")]
        primary_id: String,
        #[serde(rename = "secondaryId")]
        secondary_id: String,
        content: String,
    },
    /// No consolidation action warranted for this batch.
    Skip,
}

#[derive(Debug, Deserialize)]
struct ConsolidationResponse {
    actions: Vec<ConsolidationAction>,
}

const RESPONSE_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "actions": {
      "type": "array",
      "items": {
        "type": "object",
        "properties": {
          "action": {"type": "string", "enum": ["create", "update", "merge", "skip"]},
          "content": {"type": "string"},
          "sourceMemoryIds": {"type": "array", "items": {"type": "string"}},
          "observationId": {"type": "string"},
          "additionalSourceMemoryIds": {"type": "array", "items": {"type": "string"}},
          "primaryId": {"type": "string"},
          "secondaryId": {"type": "string"}
        },
        "required": ["action"]
      }
    }
  },
  "required": ["actions"]
}"#;

const SYSTEM_PROMPT: &str = "You review a batch of raw memories and existing observations for one user. \
Propose create/update/merge/skip actions that distill durable patterns (preferences, traits, recurring \
behavior) into observation-type memories. Do not invent facts not supported by the memories shown. \
Return strict JSON matching the given schema.";

/// One pass of the consolidation engine over `bank_id`'s unconsolidated
/// memories: review, propose actions via the LLM, apply them, mark the
/// reviewed memories consolidated, re-embed touched observations, and queue
/// mental model refreshes for any model whose tags were touched
/// (`spec.md` §4.9 step 6).
pub async fn consolidate(
    storage: &Storage,
    embeddings: &EmbeddingStore,
    llm: &dyn LlmAdapter,
    bank_id: &str,
    options: ConsolidationOptions,
) -> Result<ConsolidationReport, HindsightError> {
    let batch = storage.unconsolidated_memories(bank_id, options.batch_size).map_err(HindsightError::from)?;
    if batch.is_empty() {
        return Ok(ConsolidationReport::default());
    }

    let observations = storage.observations(bank_id).map_err(HindsightError::from)?;
    let by_id: HashMap<String, MemoryUnit> = observations.iter().map(|o| (o.id.clone(), o.clone())).collect();
    let actions = propose_actions(llm, &batch, &observations).await.map_err(HindsightError::from)?;

    let mut report = ConsolidationReport { memories_processed: batch.len(), ..Default::default() };
    let mut touched_ids: Vec<String> = vec![];
    for action in &actions {
        match action {
            ConsolidationAction::Create { .. } => report.observations_created += 1,
            ConsolidationAction::Update { observation_id, .. } => {
                report.observations_updated += 1;
                touched_ids.push(observation_id.clone());
            }
            ConsolidationAction::Merge { primary_id, .. } => {
                report.observations_merged += 1;
                touched_ids.push(primary_id.clone());
            }
            ConsolidationAction::Skip => report.skipped += 1,
        }
    }

    let created_ids = storage.transaction(|tx| {
        let now = Utc::now();
        let mut created_ids = vec![];
        for action in &actions {
            if let Some(id) = apply_action(tx, bank_id, action, &by_id, now)? {
                created_ids.push(id);
            }
        }
        for memory in &batch {
            let mut updated = memory.clone();
            updated.consolidated_at = Some(now);
            Storage::update_memory_tx(tx, &updated)?;
        }
        Ok(created_ids)
    })?;
    touched_ids.extend(created_ids);

    // Re-embed every observation an action touched; content changed underneath
    // the vector index entry (or a new one needs one).
    for id in &touched_ids {
        if let Some(observation) = storage.get_memory(bank_id, id).map_err(HindsightError::from)? {
            embeddings
                .upsert(crate::embeddings::IndexName::Memory, &observation.id, &observation.content)
                .await
                .map_err(HindsightError::from)?;
        }
    }

    report.mental_models_refresh_queued = queue_mental_model_refreshes(storage, bank_id, &touched_ids)?;

    Ok(report)
}

/// Enqueue a `refresh_mental_model` op for every active mental model whose
/// tags intersect `touched_observation_ids`' tags, or every active model (if
/// it carries no tags of its own) whenever at least one observation changed.
fn queue_mental_model_refreshes(
    storage: &Storage,
    bank_id: &str,
    touched_observation_ids: &[String],
) -> Result<usize, HindsightError> {
    if touched_observation_ids.is_empty() {
        return Ok(0);
    }
    let touched_tags: HashSet<String> = storage
        .get_memories(bank_id, touched_observation_ids)
        .map_err(HindsightError::from)?
        .into_iter()
        .flat_map(|m| m.tags)
        .collect();

    let models = storage.mental_models_by_bank(bank_id).map_err(HindsightError::from)?;
    let mut queued = 0;
    for model in models {
        let matches = model.tags.is_empty() || model.tags.iter().any(|t| touched_tags.contains(t));
        if !matches {
            continue;
        }
        let now = Utc::now();
        let payload = serde_json::json!({"mentalModelId": model.id});
        let dedup_key = stable_hash(&serde_json::json!({
            "bankId": bank_id, "taskType": "refresh_mental_model", "mentalModelId": model.id,
        }));
        let op = AsyncOperation {
            id: new_monotonic_id(),
            bank_id: bank_id.to_string(),
            task_type: TaskType::RefreshMentalModel,
            status: OpStatus::Pending,
            payload,
            items_count: 1,
            document_id: None,
            error_message: None,
            dedup_key,
            created_at: now,
            updated_at: now,
        };
        storage.enqueue_op(&op).map_err(HindsightError::from)?;
        queued += 1;
    }
    Ok(queued)
}

async fn propose_actions(
    llm: &dyn LlmAdapter,
    batch: &[MemoryUnit],
    observations: &[MemoryUnit],
) -> Result<Vec<ConsolidationAction>, ExtractionError> {
    let batch_text = batch
        .iter()
        .map(|m| format!("- [{}] {}", m.id, m.content))
        .collect::<Vec<_>>()
        .join("\n");
    let observations_text = observations
        .iter()
        .map(|m| format!("- [{}] {}", m.id, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let user_message = format!(
        "Existing observations:\n{}\n\nUnconsolidated memories:\n{}",
        if observations_text.is_empty() { "(none)".to_string() } else { observations_text },
        batch_text,
    );

    let request = LlmRequest {
        messages: vec![
            ChatMessage { role: ChatRole::System, content: SYSTEM_PROMPT.to_string() },
            ChatMessage { role: ChatRole::User, content: user_message },
        ],
        tools: vec![],
        response_schema: Some(serde_json::from_str(RESPONSE_SCHEMA).expect("valid schema literal")),
        temperature: Some(0.0),
        max_tokens: None,
    };

    let raw = llm.complete(request).await?;
    let parsed: ConsolidationResponse = serde_json::from_str(raw.trim())
        .map_err(|e| ExtractionError::MalformedOutput(e.to_string()))?;
    Ok(parsed.actions)
}

/// Apply one proposed action within the consolidation transaction. Returns
/// the new observation's id for `Create` so the caller can fold it into the
/// set of ids needing re-embedding alongside the `Update`/`Merge` targets.
fn apply_action(
    tx: &rusqlite::Transaction,
    bank_id: &str,
    action: &ConsolidationAction,
    existing: &HashMap<String, MemoryUnit>,
    now: chrono::DateTime<Utc>,
) -> Result<Option<String>, crate::error::StorageError> {
    match action {
        ConsolidationAction::Skip => Ok(None),
        ConsolidationAction::Create { content, source_memory_ids } => {
            let observation = MemoryUnit {
                id: new_monotonic_id(),
                bank_id: bank_id.to_string(),
                content: content.clone(),
                fact_type: FactType::Observation,
                confidence: 0.7,
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
                gist: content.chars().take(200).collect(),
                scope: Scope::Profile,
                consolidated_at: Some(now),
                proof_count: Some(source_memory_ids.len() as i64),
                source_memory_ids: source_memory_ids.clone(),
                history: vec![],
                created_at: now,
                updated_at: now,
            };
            Storage::insert_memory_tx(tx, &observation)?;
            Ok(Some(observation.id))
        }
        ConsolidationAction::Update { observation_id, content, additional_source_memory_ids } => {
            let Some(prior) = existing.get(observation_id) else {
                // LLM referenced an id that doesn't exist in the observations
                // it was shown; skip rather than fail the whole batch.
                return Ok(None);
            };
            let mut source_memory_ids = prior.source_memory_ids.clone();
            for id in additional_source_memory_ids {
                if !source_memory_ids.contains(id) {
                    source_memory_ids.push(id.clone());
                }
            }
            let mut updated = prior.clone();
            updated.history.push(MemoryRevision {
                previous_text: prior.content.clone(),
                reason: "consolidation update".to_string(),
                revised_at: now,
            });
            updated.content = content.clone();
            updated.gist = content.chars().take(200).collect();
            updated.proof_count = Some(prior.proof_count.unwrap_or(0) + 1);
            updated.source_memory_ids = source_memory_ids;
            updated.consolidated_at = Some(now);
            updated.updated_at = now;
            Storage::update_memory_tx(tx, &updated)?;
            Ok(Some(observation_id.clone()))
        }
        ConsolidationAction::Merge { primary_id, secondary_id, content } => {
            let (Some(primary), Some(secondary)) = (existing.get(primary_id), existing.get(secondary_id)) else {
                return Ok(None);
            };
            let mut source_memory_ids = primary.source_memory_ids.clone();
            for id in &secondary.source_memory_ids {
                if !source_memory_ids.contains(id) {
                    source_memory_ids.push(id.clone());
                }
            }
            let mut updated = primary.clone();
            updated.history.push(MemoryRevision {
                previous_text: secondary.content.clone(),
                reason: format!("merged observation {}", secondary.id),
                revised_at: now,
            });
            updated.content = content.clone();
            updated.gist = content.chars().take(200).collect();
            updated.proof_count = Some(primary.proof_count.unwrap_or(0) + secondary.proof_count.unwrap_or(0));
            updated.source_memory_ids = source_memory_ids;
            updated.consolidated_at = Some(now);
            updated.updated_at = now;
            Storage::update_memory_tx(tx, &updated)?;
            tx.execute("DELETE FROM memory_units WHERE id = ?1 AND bank_id = ?2", rusqlite::params![secondary_id, bank_id])?;
            Ok(Some(primary_id.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_action_round_trips_through_json() {
        let action = ConsolidationAction::Skip;
        let json = serde_json::to_string(&action).unwrap();
        let parsed: ConsolidationAction = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, ConsolidationAction::Skip));
    }

    #[test]
    fn create_action_parses_from_llm_shaped_json() {
        let json = r#"{"action": "create", "content": "likes concise answers", "sourceMemoryIds": ["a", "b"]}"#;
        let action: ConsolidationAction = serde_json::from_str(json).unwrap();
        match action {
            ConsolidationAction::Create { content, source_memory_ids } => {
                assert_eq!(content, "likes concise answers");
                assert_eq!(source_memory_ids, vec!["a".to_string(), "b".to_string()]);
            }
            _ => panic!("expected Create"),
        }
    }
}
