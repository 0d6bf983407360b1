//! Reflect agent (C11): a bounded tool-use loop over the bank's three-tier
//! memory hierarchy (mental models, observations, raw memories) plus an
//! entity lookup tool, optionally extracting structured output and saving a
//! new observation (`spec.md` §4.10).

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::EngineDefaults;
use crate::embeddings::EmbeddingStore;
use crate::error::HindsightError;
use crate::llm::{ChatMessage, ChatRole, LlmAdapter, LlmRequest, RunEvent, ToolSpec};
use crate::model::{Directive, Entity, FactType, MemoryUnit, ReflectBudget, Scope};
use crate::storage::Storage;
use crate::util::{name_similarity, new_monotonic_id};

#[derive(Debug, Clone)]
pub struct ReflectOptions {
    pub budget: ReflectBudget,
    pub response_schema: Option<serde_json::Value>,
    pub save_observation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectResult {
    pub answer: String,
    pub structured_output: Option<serde_json::Value>,
    pub iterations_used: u32,
    pub saved_observation_id: Option<String>,
}

/// Per-observation freshness classification (`spec.md` §4.10), crossing age
/// since `consolidatedAt` against `proofCount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Aging,
    Stale,
}

fn observation_freshness(
    now: DateTime<Utc>,
    consolidated_at: Option<DateTime<Utc>>,
    proof_count: Option<i64>,
    defaults: &EngineDefaults,
) -> (Freshness, bool, Option<String>) {
    let proof = proof_count.unwrap_or(0);
    let well_supported = proof >= defaults.observation_staleness_proof_floor;
    let Some(consolidated_at) = consolidated_at else {
        return (Freshness::Stale, true, Some("never consolidated".to_string()));
    };
    let age_ms = (now - consolidated_at).num_milliseconds().max(0);
    let recent = age_ms <= defaults.observation_staleness_ms;

    let freshness = match (recent, well_supported) {
        (true, true) => Freshness::Fresh,
        (false, false) => Freshness::Stale,
        _ => Freshness::Aging,
    };
    let is_stale = freshness == Freshness::Stale;
    let reason = (freshness != Freshness::Fresh).then(|| {
        format!(
            "{} day(s) since consolidation with {} supporting source(s)",
            age_ms / 86_400_000,
            proof
        )
    });
    (freshness, is_stale, reason)
}

fn mental_model_is_stale(now: DateTime<Utc>, last_refreshed_at: Option<DateTime<Utc>>, created_at: DateTime<Utc>, defaults: &EngineDefaults) -> bool {
    let anchor = last_refreshed_at.unwrap_or(created_at);
    (now - anchor).num_milliseconds().max(0) > defaults.mental_model_staleness_ms
}

#[derive(Debug, Deserialize)]
struct TagsFilterArgs {
    query: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SearchMemoriesArgs {
    query: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    fact_types: Option<Vec<String>>,
    #[serde(default)]
    time_range: Option<TimeRangeArgs>,
}

#[derive(Debug, Deserialize)]
struct TimeRangeArgs {
    start_ms: Option<i64>,
    end_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GetEntityArgs {
    name: String,
}

fn matches_tags(memory_tags: &[String], wanted: &Option<Vec<String>>) -> bool {
    match wanted {
        None => true,
        Some(wanted) if wanted.is_empty() => true,
        Some(wanted) => wanted.iter().any(|t| memory_tags.contains(t)),
    }
}

fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "search_mental_models".to_string(),
            description: "Tier 1: search curated mental models (user-maintained Q&A summaries).".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "search_observations".to_string(),
            description: "Tier 2: search consolidated observations distilled from raw memories.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "search_memories".to_string(),
            description: "Tier 3: search raw memories directly, with optional tag/factType/time filters.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "fact_types": {"type": "array", "items": {"type": "string", "enum": ["world", "experience", "opinion", "observation"]}},
                    "time_range": {
                        "type": "object",
                        "properties": {"start_ms": {"type": "integer"}, "end_ms": {"type": "integer"}}
                    }
                },
                "required": ["query"]
            }),
        },
        ToolSpec {
            name: "get_entity".to_string(),
            description: "Look up a named entity and the memories that mention it.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        },
    ]
}

/// Run one tool call. Returns the JSON result pushed back into the
/// conversation plus the ids of any raw memories it surfaced, so the caller
/// can accumulate `sourceMemoryIds` for a saved observation.
async fn run_tool(
    storage: &Storage,
    embeddings: &EmbeddingStore,
    defaults: &EngineDefaults,
    bank_id: &str,
    tool_name: &str,
    args_json: &str,
) -> Result<(String, Vec<String>), HindsightError> {
    let now = Utc::now();
    match tool_name {
        "search_mental_models" => {
            let args: TagsFilterArgs = serde_json::from_str(args_json)
                .map_err(|e| HindsightError::Input(format!("bad search_mental_models args: {e}")))?;
            let models = storage.mental_models_by_bank(bank_id).map_err(HindsightError::from)?;
            let mut hits: Vec<serde_json::Value> = models
                .into_iter()
                .filter(|m| matches_tags(&m.tags, &args.tags))
                .map(|m| {
                    let haystack = format!("{} {}", m.name, m.content.clone().unwrap_or_default());
                    let relevance_score = name_similarity(&args.query, &haystack);
                    let is_stale = mental_model_is_stale(now, m.last_refreshed_at, m.created_at, defaults);
                    json!({
                        "id": m.id,
                        "name": m.name,
                        "content": m.content,
                        "tags": m.tags,
                        "relevanceScore": relevance_score,
                        "updatedAt": m.updated_at,
                        "isStale": is_stale,
                    })
                })
                .collect();
            hits.sort_by(|a, b| {
                b["relevanceScore"].as_f64().unwrap_or(0.0).partial_cmp(&a["relevanceScore"].as_f64().unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal)
            });
            hits.truncate(10);
            Ok((serde_json::to_string(&hits).unwrap_or_default(), vec![]))
        }
        "search_observations" => {
            let args: TagsFilterArgs = serde_json::from_str(args_json)
                .map_err(|e| HindsightError::Input(format!("bad search_observations args: {e}")))?;
            let semantic_hits = embeddings
                .search(crate::embeddings::IndexName::Memory, &args.query, 30)
                .await
                .map_err(HindsightError::from)?;
            let scores: std::collections::HashMap<String, f32> =
                semantic_hits.iter().map(|h| (h.id.clone(), 1.0 - h.distance)).collect();
            let ids: Vec<String> = semantic_hits.into_iter().map(|h| h.id).collect();
            let candidates = storage.get_memories(bank_id, &ids).map_err(HindsightError::from)?;
            let mut memory_ids = Vec::new();
            let mut hits: Vec<serde_json::Value> = candidates
                .into_iter()
                .filter(|m| m.fact_type == FactType::Observation && matches_tags(&m.tags, &args.tags))
                .map(|m| {
                    let (freshness, is_stale, staleness_reason) =
                        observation_freshness(now, m.consolidated_at, m.proof_count, defaults);
                    memory_ids.push(m.id.clone());
                    json!({
                        "id": m.id,
                        "content": m.content,
                        "proofCount": m.proof_count,
                        "sourceMemoryIds": m.source_memory_ids,
                        "tags": m.tags,
                        "score": scores.get(&m.id).copied().unwrap_or(0.0),
                        "freshness": freshness,
                        "isStale": is_stale,
                        "stalenessReason": staleness_reason,
                    })
                })
                .collect();
            hits.sort_by(|a, b| {
                b["score"].as_f64().unwrap_or(0.0).partial_cmp(&a["score"].as_f64().unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal)
            });
            hits.truncate(10);
            Ok((serde_json::to_string(&hits).unwrap_or_default(), memory_ids))
        }
        "search_memories" => {
            let args: SearchMemoriesArgs = serde_json::from_str(args_json)
                .map_err(|e| HindsightError::Input(format!("bad search_memories args: {e}")))?;
            let semantic_hits = embeddings
                .search(crate::embeddings::IndexName::Memory, &args.query, 30)
                .await
                .map_err(HindsightError::from)?;
            let scores: std::collections::HashMap<String, f32> =
                semantic_hits.iter().map(|h| (h.id.clone(), 1.0 - h.distance)).collect();
            let ids: Vec<String> = semantic_hits.into_iter().map(|h| h.id).collect();
            let wanted_types: Option<Vec<FactType>> =
                args.fact_types.as_ref().map(|types| types.iter().map(|t| FactType::parse(t)).collect());
            let candidates = storage.get_memories(bank_id, &ids).map_err(HindsightError::from)?;
            let mut memory_ids = Vec::new();
            let mut hits: Vec<serde_json::Value> = candidates
                .into_iter()
                .filter(|m| matches_tags(&m.tags, &args.tags))
                .filter(|m| wanted_types.as_ref().is_none_or(|types| types.contains(&m.fact_type)))
                .filter(|m| match &args.time_range {
                    None => true,
                    Some(range) => {
                        range.start_ms.is_none_or(|start| m.event_date_ms >= start)
                            && range.end_ms.is_none_or(|end| m.event_date_ms <= end)
                    }
                })
                .map(|m| {
                    memory_ids.push(m.id.clone());
                    let entities = storage.entities_for_memory(&m.id).unwrap_or_default();
                    json!({
                        "id": m.id,
                        "content": m.content,
                        "factType": m.fact_type,
                        "entities": entities.into_iter().map(|e| e.name).collect::<Vec<_>>(),
                        "score": scores.get(&m.id).copied().unwrap_or(0.0),
                        "occurredAt": m.event_date_ms,
                    })
                })
                .collect();
            hits.sort_by(|a, b| {
                b["score"].as_f64().unwrap_or(0.0).partial_cmp(&a["score"].as_f64().unwrap_or(0.0)).unwrap_or(std::cmp::Ordering::Equal)
            });
            hits.truncate(10);
            Ok((serde_json::to_string(&hits).unwrap_or_default(), memory_ids))
        }
        "get_entity" => {
            let args: GetEntityArgs = serde_json::from_str(args_json)
                .map_err(|e| HindsightError::Input(format!("bad get_entity args: {e}")))?;
            let entities = storage.entities_by_bank(bank_id).map_err(HindsightError::from)?;
            let matched: Option<Entity> = entities.into_iter().find(|e| e.name.eq_ignore_ascii_case(&args.name));
            match matched {
                Some(entity) => {
                    let related = storage.memories_for_entity(&entity.id, 20).map_err(HindsightError::from)?;
                    let memory_ids: Vec<String> = related.iter().map(|m| m.id.clone()).collect();
                    let related_memories: Vec<serde_json::Value> = related
                        .into_iter()
                        .map(|m| json!({"id": m.id, "content": m.content, "factType": m.fact_type, "occurredAt": m.event_date_ms}))
                        .collect();
                    Ok((json!({"entity": entity, "relatedMemories": related_memories}).to_string(), memory_ids))
                }
                None => Ok((json!({"entity": null, "relatedMemories": []}).to_string(), vec![])),
            }
        }
        other => Err(HindsightError::Input(format!("unknown tool: {other}"))),
    }
}

fn assemble_directives(directives: &[Directive]) -> String {
    if directives.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = directives.iter().map(|d| format!("- {}", d.content)).collect();
    format!("\n\nActive directives:\n{}", lines.join("\n"))
}

/// Run the reflect agent's bounded tool loop for `question`.
pub async fn reflect(
    storage: &Storage,
    embeddings: &EmbeddingStore,
    llm: &dyn LlmAdapter,
    defaults: &EngineDefaults,
    bank_id: &str,
    question: &str,
    options: &ReflectOptions,
) -> Result<ReflectResult, HindsightError> {
    let directives = storage.active_directives(bank_id).map_err(HindsightError::from)?;
    let system_prompt = format!(
        "You answer questions about one user by consulting their memory hierarchy. Use \
         search_mental_models first, then search_observations, then search_memories only if \
         needed. Use get_entity for named people, places, or things.{}",
        assemble_directives(&directives)
    );

    let mut messages = vec![
        ChatMessage { role: ChatRole::System, content: system_prompt },
        ChatMessage { role: ChatRole::User, content: question.to_string() },
    ];

    let max_iterations = options.budget.max_iterations();
    let mut iterations_used = 0;
    let mut final_text = String::new();
    let mut used_memory_ids: Vec<String> = Vec::new();

    loop {
        iterations_used += 1;
        let request = LlmRequest {
            messages: messages.clone(),
            tools: tool_specs(),
            response_schema: None,
            temperature: Some(0.2),
            max_tokens: None,
        };

        let mut stream = llm.run(request).await?;
        let mut text = String::new();
        let mut tool_calls: Vec<(String, String, String)> = vec![];
        let mut current_tool: Option<(String, String, String)> = None;

        while let Some(event) = stream.next().await {
            match event {
                RunEvent::TextMessageContent { delta, .. } => text.push_str(&delta),
                RunEvent::ToolCallStart { tool_call_id, tool_name } => {
                    current_tool = Some((tool_call_id, tool_name, String::new()));
                }
                RunEvent::ToolCallArgs { delta, .. } => {
                    if let Some((_, _, args)) = current_tool.as_mut() {
                        args.push_str(&delta);
                    }
                }
                RunEvent::ToolCallEnd { .. } => {
                    if let Some(call) = current_tool.take() {
                        tool_calls.push(call);
                    }
                }
                RunEvent::RunError { message } => {
                    return Err(HindsightError::Background(message));
                }
                _ => {}
            }
        }

        final_text = text.clone();

        if tool_calls.is_empty() || iterations_used >= max_iterations {
            break;
        }

        messages.push(ChatMessage { role: ChatRole::Assistant, content: text });
        for (_, tool_name, args) in &tool_calls {
            match run_tool(storage, embeddings, defaults, bank_id, tool_name, args).await {
                Ok((result, memory_ids)) => {
                    used_memory_ids.extend(memory_ids);
                    messages.push(ChatMessage { role: ChatRole::Tool, content: result });
                }
                Err(e) => {
                    messages.push(ChatMessage { role: ChatRole::Tool, content: json!({"error": e.to_string()}).to_string() });
                }
            }
        }
    }

    // Structured extraction is a second, constrained pass over the free-form
    // answer rather than a direct parse of it, since the answer is prose and
    // not guaranteed to already be the schema's JSON shape.
    let structured_output = match &options.response_schema {
        Some(schema) if !final_text.trim().is_empty() => {
            let extraction_request = LlmRequest {
                messages: vec![
                    ChatMessage {
                        role: ChatRole::System,
                        content: "Extract a JSON object matching the given schema from the assistant's answer below. \
                                  Respond with only the JSON object, no commentary."
                            .to_string(),
                    },
                    ChatMessage { role: ChatRole::User, content: final_text.clone() },
                ],
                tools: vec![],
                response_schema: Some(schema.clone()),
                temperature: Some(0.0),
                max_tokens: None,
            };
            match llm.complete(extraction_request).await {
                Ok(raw) => {
                    let trimmed = raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```").trim();
                    serde_json::from_str(trimmed).ok()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "structured output extraction pass failed");
                    None
                }
            }
        }
        _ => None,
    };

    used_memory_ids.sort();
    used_memory_ids.dedup();

    let mut saved_observation_id = None;
    if options.save_observation && !final_text.trim().is_empty() {
        let now = chrono::Utc::now();
        let proof_count = used_memory_ids.len().max(1) as i64;
        let observation = MemoryUnit {
            id: new_monotonic_id(),
            bank_id: bank_id.to_string(),
            content: final_text.clone(),
            fact_type: FactType::Observation,
            confidence: 0.6,
            document_id: None,
            chunk_id: None,
            event_date_ms: now.timestamp_millis(),
            occurred_start_ms: None,
            occurred_end_ms: None,
            mentioned_at_ms: None,
            metadata: json!({"reflectQuestion": question}),
            tags: vec![],
            source_text: None,
            access_count: 0,
            last_accessed: now,
            encoding_strength: 1.0,
            gist: final_text.chars().take(200).collect(),
            scope: Scope::Profile,
            consolidated_at: Some(now),
            proof_count: Some(proof_count),
            source_memory_ids: used_memory_ids,
            history: vec![],
            created_at: now,
            updated_at: now,
        };
        storage.transaction(|tx| Storage::insert_memory_tx(tx, &observation)).map_err(HindsightError::from)?;
        saved_observation_id = Some(observation.id);
    }

    Ok(ReflectResult { answer: final_text, structured_output, iterations_used, saved_observation_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_directives_is_empty_for_no_directives() {
        assert_eq!(assemble_directives(&[]), "");
    }

    #[test]
    fn assemble_directives_lists_each_directive() {
        let now = chrono::Utc::now();
        let directive = Directive {
            id: "d1".into(),
            bank_id: "bank-1".into(),
            name: "tone".into(),
            content: "Be concise".into(),
            priority: 1,
            is_active: true,
            tags: vec![],
            created_at: now,
            updated_at: now,
        };
        let assembled = assemble_directives(&[directive]);
        assert!(assembled.contains("Be concise"));
    }

    #[test]
    fn fresh_observation_is_recent_and_well_supported() {
        let defaults = EngineDefaults::default();
        let now = Utc::now();
        let (freshness, is_stale, reason) = observation_freshness(now, Some(now), Some(5), &defaults);
        assert_eq!(freshness, Freshness::Fresh);
        assert!(!is_stale);
        assert!(reason.is_none());
    }

    #[test]
    fn old_and_unsupported_observation_is_stale() {
        let defaults = EngineDefaults::default();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);
        let (freshness, is_stale, reason) = observation_freshness(now, Some(old), Some(1), &defaults);
        assert_eq!(freshness, Freshness::Stale);
        assert!(is_stale);
        assert!(reason.is_some());
    }

    #[test]
    fn old_but_well_supported_observation_is_aging_not_stale() {
        let defaults = EngineDefaults::default();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);
        let (freshness, is_stale, _) = observation_freshness(now, Some(old), Some(10), &defaults);
        assert_eq!(freshness, Freshness::Aging);
        assert!(!is_stale);
    }

    #[test]
    fn never_consolidated_observation_is_stale() {
        let defaults = EngineDefaults::default();
        let (freshness, is_stale, reason) = observation_freshness(Utc::now(), None, Some(10), &defaults);
        assert_eq!(freshness, Freshness::Stale);
        assert!(is_stale);
        assert!(reason.is_some());
    }

    #[test]
    fn mental_model_recently_refreshed_is_not_stale() {
        let defaults = EngineDefaults::default();
        let now = Utc::now();
        assert!(!mental_model_is_stale(now, Some(now), now, &defaults));
    }

    #[test]
    fn mental_model_never_refreshed_falls_back_to_created_at() {
        let defaults = EngineDefaults::default();
        let now = Utc::now();
        let old = now - chrono::Duration::days(30);
        assert!(mental_model_is_stale(now, None, old, &defaults));
    }
}
