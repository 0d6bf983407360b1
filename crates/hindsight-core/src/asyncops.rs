//! Async operation queue (C12): a durable record of long-running retains,
//! consolidations, and mental model refreshes, with dedup, cancel, and
//! status (`spec.md` §4.11). Thin domain logic over the storage-layer
//! primitives (`enqueue_op`/`get_op`/`transition_op`/`cancel_op`/`list_ops`),
//! plus the dispatcher that actually drains pending ops.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::EngineDefaults;
use crate::consolidation::{self, ConsolidationOptions};
use crate::embeddings::EmbeddingStore;
use crate::error::HindsightError;
use crate::llm::{ChatMessage, ChatRole, LlmAdapter, LlmRequest};
use crate::model::{AsyncOperation, BankConfig, MentalModel, OpStatus, TaskType};
use crate::recall::{self, RecallOptions};
use crate::retain::{self, RetainOptions};
use crate::storage::Storage;
use crate::util::{new_monotonic_id, stable_hash};

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResult {
    pub operation_id: String,
    pub deduplicated: bool,
}

fn enqueue(storage: &Storage, op: AsyncOperation) -> Result<EnqueueResult, HindsightError> {
    let id = op.id.clone();
    match storage.enqueue_op(&op).map_err(HindsightError::from)? {
        Some(existing_id) => Ok(EnqueueResult { operation_id: existing_id, deduplicated: true }),
        None => Ok(EnqueueResult { operation_id: id, deduplicated: false }),
    }
}

/// Enqueue a background retain: a host that doesn't want to block on a large
/// document's extraction call submits content here and polls the op instead.
pub fn enqueue_retain(
    storage: &Storage,
    bank_id: &str,
    content: &str,
    options: &RetainOptions,
) -> Result<EnqueueResult, HindsightError> {
    let now = Utc::now();
    let payload = serde_json::json!({
        "content": content,
        "documentId": options.document_id,
        "chunkId": options.chunk_id,
        "eventDateMs": options.event_date_ms,
        "tags": options.tags,
        "metadata": options.metadata,
    });
    let dedup_key = stable_hash(&serde_json::json!({
        "bankId": bank_id, "taskType": "retain", "content": content, "documentId": options.document_id,
    }));
    let op = AsyncOperation {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        task_type: TaskType::Retain,
        status: OpStatus::Pending,
        payload,
        items_count: 1,
        document_id: options.document_id.clone(),
        error_message: None,
        dedup_key,
        created_at: now,
        updated_at: now,
    };
    enqueue(storage, op)
}

/// Enqueue a consolidation pass. Dedup key intentionally ignores content so
/// repeated triggers within the same pending/processing window collapse to
/// one op, matching the fire-and-forget trigger in the retain pipeline.
pub fn enqueue_consolidation(storage: &Storage, bank_id: &str) -> Result<EnqueueResult, HindsightError> {
    let now = Utc::now();
    let dedup_key = stable_hash(&serde_json::json!({"bankId": bank_id, "taskType": "consolidation"}));
    let op = AsyncOperation {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        task_type: TaskType::Consolidation,
        status: OpStatus::Pending,
        payload: serde_json::json!({}),
        items_count: 0,
        document_id: None,
        error_message: None,
        dedup_key,
        created_at: now,
        updated_at: now,
    };
    enqueue(storage, op)
}

pub fn enqueue_refresh_mental_model(
    storage: &Storage,
    bank_id: &str,
    mental_model_id: &str,
) -> Result<EnqueueResult, HindsightError> {
    let now = Utc::now();
    let dedup_key = stable_hash(&serde_json::json!({
        "bankId": bank_id, "taskType": "refresh_mental_model", "mentalModelId": mental_model_id,
    }));
    let op = AsyncOperation {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        task_type: TaskType::RefreshMentalModel,
        status: OpStatus::Pending,
        payload: serde_json::json!({"mentalModelId": mental_model_id}),
        items_count: 1,
        document_id: None,
        error_message: None,
        dedup_key,
        created_at: now,
        updated_at: now,
    };
    enqueue(storage, op)
}

pub fn get(storage: &Storage, operation_id: &str) -> Result<Option<AsyncOperation>, HindsightError> {
    storage.get_op(operation_id).map_err(HindsightError::from)
}

/// Cancel a pending op. `spec.md` §4.11: processing ops cannot be cancelled.
pub fn cancel(storage: &Storage, operation_id: &str) -> Result<(), HindsightError> {
    storage.cancel_op(operation_id).map_err(HindsightError::from)
}

/// List ops for a bank, optionally filtered by status, newest first, with
/// simple offset/limit pagination over the already-ordered result set.
pub fn list(
    storage: &Storage,
    bank_id: &str,
    status: Option<OpStatus>,
    offset: usize,
    limit: usize,
) -> Result<Vec<AsyncOperation>, HindsightError> {
    let all = storage.list_ops(bank_id, status).map_err(HindsightError::from)?;
    Ok(all.into_iter().skip(offset).take(limit).collect())
}

/// Drain up to `max_ops` pending operations for `bank_id`, running each to
/// completion in-process. A host with its own worker pool can instead poll
/// `list` for pending ops and dispatch them independently; this is the
/// in-process convenience path for hosts that don't.
#[allow(clippy::too_many_arguments)]
pub async fn run_pending(
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingStore>,
    llm: Option<Arc<dyn LlmAdapter>>,
    defaults: &EngineDefaults,
    bank_config: &BankConfig,
    bank_id: &str,
    max_ops: usize,
) -> Result<usize, HindsightError> {
    let pending = storage.list_ops(bank_id, Some(OpStatus::Pending)).map_err(HindsightError::from)?;
    let mut ran = 0;
    for op in pending.into_iter().take(max_ops) {
        storage.transition_op(&op.id, OpStatus::Processing, None).map_err(HindsightError::from)?;
        let outcome = run_one(storage.clone(), embeddings.clone(), llm.clone(), defaults, bank_config, &op).await;
        match outcome {
            Ok(()) => {
                storage.transition_op(&op.id, OpStatus::Completed, None).map_err(HindsightError::from)?;
            }
            Err(e) => {
                tracing::warn!(error = %e, op_id = %op.id, task_type = ?op.task_type, "async op failed");
                storage
                    .transition_op(&op.id, OpStatus::Failed, Some(&e.to_string()))
                    .map_err(HindsightError::from)?;
            }
        }
        ran += 1;
    }
    Ok(ran)
}

async fn run_one(
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingStore>,
    llm: Option<Arc<dyn LlmAdapter>>,
    defaults: &EngineDefaults,
    bank_config: &BankConfig,
    op: &AsyncOperation,
) -> Result<(), HindsightError> {
    match op.task_type {
        TaskType::Retain => {
            let Some(llm) = llm else {
                return Err(HindsightError::Input("retain op requires an llm adapter".to_string()));
            };
            let content = op
                .payload
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HindsightError::Input("retain op payload missing content".to_string()))?
                .to_string();
            let options = RetainOptions {
                event_date_ms: op.payload.get("eventDateMs").and_then(|v| v.as_i64()),
                document_id: op.document_id.clone(),
                chunk_id: op.payload.get("chunkId").and_then(|v| v.as_str()).map(str::to_string),
                scope: None,
                mode: None,
                tags: op
                    .payload
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
                    .unwrap_or_default(),
                metadata: op.payload.get("metadata").cloned(),
            };
            retain::retain(storage, embeddings, Some(llm), defaults, bank_config, &op.bank_id, &content, options).await?;
            Ok(())
        }
        TaskType::Consolidation => {
            let Some(llm) = llm else {
                return Err(HindsightError::Input("consolidation op requires an llm adapter".to_string()));
            };
            consolidation::consolidate(
                &storage,
                &embeddings,
                llm.as_ref(),
                &op.bank_id,
                ConsolidationOptions { batch_size: defaults.consolidation_batch_size },
            )
            .await?;
            Ok(())
        }
        TaskType::RefreshMentalModel => {
            let Some(llm) = llm else {
                return Err(HindsightError::Input("refresh op requires an llm adapter".to_string()));
            };
            let mental_model_id = op
                .payload
                .get("mentalModelId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| HindsightError::Input("refresh op payload missing mentalModelId".to_string()))?;
            refresh_mental_model(&storage, &embeddings, llm.as_ref(), defaults, &op.bank_id, mental_model_id).await
        }
    }
}

/// Recall the bank's most relevant memories for a mental model's standing
/// question and ask the LLM to synthesize fresh `content`, replacing the
/// cached answer (`spec.md` §4.10 tier-1 tool reads this; nothing else
/// writes it).
async fn refresh_mental_model(
    storage: &Storage,
    embeddings: &EmbeddingStore,
    llm: &dyn LlmAdapter,
    defaults: &EngineDefaults,
    bank_id: &str,
    mental_model_id: &str,
) -> Result<(), HindsightError> {
    let models = storage.mental_models_by_bank(bank_id).map_err(HindsightError::from)?;
    let Some(mut model) = models.into_iter().find(|m| m.id == mental_model_id) else {
        return Err(HindsightError::Input(format!("unknown mental model {mental_model_id}")));
    };

    let (hits, _trace) = recall::recall(
        storage,
        embeddings,
        None,
        defaults,
        bank_id,
        &model.source_query,
        &RecallOptions { limit: 20, token_budget: Some(defaults.consolidation_max_recall_tokens), use_rerank: false, graph_hops: 1 },
    )
    .await?;

    if hits.is_empty() {
        return Ok(());
    }

    let context = hits.iter().map(|h| format!("- [{}] {}", h.memory.id, h.memory.content)).collect::<Vec<_>>().join("\n");
    let request = LlmRequest {
        messages: vec![
            ChatMessage {
                role: ChatRole::System,
                content: "Synthesize a concise standing answer to the user's question from the memories shown. \
                          State only what the memories support."
                    .to_string(),
            },
            ChatMessage { role: ChatRole::User, content: format!("Question: {}\n\nMemories:\n{}", model.source_query, context) },
        ],
        tools: vec![],
        response_schema: None,
        temperature: Some(0.2),
        max_tokens: None,
    };
    let content = llm.complete(request).await.map_err(HindsightError::from)?;

    model.content = Some(content);
    model.source_memory_ids = hits.into_iter().map(|h| h.memory.id).collect();
    model.last_refreshed_at = Some(Utc::now());
    model.updated_at = Utc::now();
    storage.upsert_mental_model(&model).map_err(HindsightError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model(bank_id: &str) -> MentalModel {
        let now = Utc::now();
        MentalModel {
            id: "m1".into(),
            bank_id: bank_id.into(),
            name: "communication style".into(),
            source_query: "how does the user like to communicate?".into(),
            content: None,
            source_memory_ids: vec![],
            tags: vec![],
            auto_refresh: true,
            last_refreshed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn sample_model_round_trips_through_json() {
        let model = sample_model("bank-1");
        let json = serde_json::to_string(&model).unwrap();
        let parsed: MentalModel = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, model.id);
    }
}
