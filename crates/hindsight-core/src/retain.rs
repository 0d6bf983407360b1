//! Retain pipeline (C8): the write path. Sanitizes and chunks input, extracts
//! facts via the injected LLM, routes each fact (reinforce / reconsolidate /
//! new trace), resolves entities, persists everything for one logical write
//! in a single transaction, builds links, tracks episodes, and schedules the
//! fire-and-forget gist upgrade and consolidation passes (`spec.md` §4.7).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::EngineDefaults;
use crate::embeddings::{EmbeddingStore, IndexName};
use crate::entity::{resolve_entity, EntityCandidate, EntityResolution, EntityScoreWeights};
use crate::episodes::{detect_boundary, new_episode, EpisodeThresholds};
use crate::error::HindsightError;
use crate::extract::{chunk_text, extract_facts, ExtractedFact};
use crate::links::{causal_link, entity_link, semantic_links, temporal_link};
use crate::llm::LlmAdapter;
use crate::model::{
    BankConfig, Entity, EntityType, EpisodeEvent, ExtractionMode, FactType, MemoryLink, MemoryUnit,
    RoutingDecisionRecord, Scope,
};
use crate::router::{apply_reconsolidate, apply_reinforce, route, RouteCandidate, RouterThresholds};
use crate::storage::Storage;
use crate::util::{new_id, new_monotonic_id, sanitize_text};

#[derive(Debug, Clone, Default)]
pub struct RetainOptions {
    pub event_date_ms: Option<i64>,
    pub document_id: Option<String>,
    pub chunk_id: Option<String>,
    pub scope: Option<Scope>,
    pub mode: Option<ExtractionMode>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetainResult {
    pub memories: Vec<MemoryUnit>,
    pub entities: Vec<Entity>,
    pub links: Vec<MemoryLink>,
}

impl RetainResult {
    fn empty() -> Self {
        Self { memories: vec![], entities: vec![], links: vec![] }
    }
}

/// One item of a batch retain call. Per-item fields fall back to the
/// batch-level [`RetainOptions`] when absent (`spec.md` §4.7 batch form).
#[derive(Debug, Clone, Default)]
pub struct RetainBatchItem {
    pub content: String,
    pub event_date_ms: Option<i64>,
    pub document_id: Option<String>,
    pub chunk_id: Option<String>,
    pub scope: Option<Scope>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Run the retain pipeline for one piece of content against `bank_id`.
///
/// `llm` is `None` only when the host never configured one; extraction
/// degrades to an empty result rather than failing the call, matching the
/// same graceful-degradation rule as an adapter or JSON-parse failure.
pub async fn retain(
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingStore>,
    llm: Option<Arc<dyn LlmAdapter>>,
    defaults: &EngineDefaults,
    bank_config: &BankConfig,
    bank_id: &str,
    content: &str,
    options: RetainOptions,
) -> Result<RetainResult, HindsightError> {
    let Some(llm) = llm else {
        return Ok(RetainResult::empty());
    };

    let now = Utc::now();
    let event_date_ms = options.event_date_ms.unwrap_or_else(|| now.timestamp_millis());
    let sanitized = sanitize_text(content);
    let mode = options.mode.clone().unwrap_or_else(|| bank_config.extraction_mode.clone());

    let chunks = chunk_text(&sanitized, defaults.extraction_char_budget);
    let mut facts: Vec<ExtractedFact> = Vec::new();
    for chunk in &chunks {
        match extract_facts(llm.as_ref(), chunk, &mode).await {
            Ok(mut chunk_facts) => {
                let offset = facts.len();
                for fact in &mut chunk_facts {
                    fact.caused_by_index = fact.caused_by_index.map(|i| i + offset);
                }
                facts.extend(chunk_facts);
            }
            Err(e) => {
                tracing::warn!(error = %e, "fact extraction failed for one chunk, skipping it");
            }
        }
    }

    if facts.is_empty() {
        return Ok(RetainResult::empty());
    }

    let fact_vectors = embeddings
        .create_vectors(&facts.iter().map(|f| f.content.clone()).collect::<Vec<_>>())
        .await
        .map_err(HindsightError::from)?;

    let thresholds = RouterThresholds {
        reinforce_threshold: bank_config.reinforce_threshold,
        reconsolidate_threshold: bank_config.reconsolidate_threshold,
    };

    let temporal_candidates = storage
        .memories_in_temporal_window(bank_id, event_date_ms, bank_config.temporal_window_ms, 200)
        .map_err(HindsightError::from)?;
    let temporal_by_id: HashMap<String, MemoryUnit> =
        temporal_candidates.into_iter().map(|m| (m.id.clone(), m)).collect();

    let mut result_memories: Vec<MemoryUnit> = Vec::new();
    let mut new_trace: Vec<(usize, ExtractedFact, Vec<f32>)> = Vec::new();
    let mut routing_records: Vec<RoutingDecisionRecord> = Vec::new();

    for (i, (fact, vector)) in facts.iter().cloned().zip(fact_vectors.iter().cloned()).enumerate() {
        let hits = embeddings
            .search_by_vector(IndexName::Memory, &vector, 20)
            .map_err(HindsightError::from)?;
        let candidates: Vec<RouteCandidate> = hits
            .into_iter()
            .filter_map(|hit| {
                temporal_by_id.get(&hit.id).map(|m| RouteCandidate {
                    memory: m.clone(),
                    similarity: 1.0 - hit.distance,
                })
            })
            .collect();

        let (conflict_detected, conflict_keys) = detect_conflict(&storage, &candidates).map_err(HindsightError::from)?;

        let decision = route(&candidates, thresholds);
        match decision {
            crate::router::RouteDecision::Reinforce { mut target, score } => {
                apply_reinforce(&mut target, now);
                storage.transaction(|tx| Storage::update_memory_tx(tx, &target)).map_err(HindsightError::from)?;
                routing_records.push(routing_record(
                    bank_id, "reinforce", Some(&target.id), Some(score), conflict_detected, conflict_keys, now,
                ));
                result_memories.push(target);
            }
            crate::router::RouteDecision::Reconsolidate { mut target, reason, score } => {
                apply_reconsolidate(&mut target, &fact.content, fact.confidence, &reason, now);
                storage.transaction(|tx| Storage::update_memory_tx(tx, &target)).map_err(HindsightError::from)?;
                embeddings
                    .upsert(IndexName::Memory, &target.id, &target.content)
                    .await
                    .map_err(HindsightError::from)?;
                routing_records.push(routing_record(
                    bank_id, "reconsolidate", Some(&target.id), Some(score), conflict_detected, conflict_keys, now,
                ));
                result_memories.push(target);
            }
            crate::router::RouteDecision::NewTrace { best_similarity } => {
                routing_records.push(routing_record(
                    bank_id, "new_trace", None, best_similarity, conflict_detected, conflict_keys, now,
                ));
                new_trace.push((i, fact, vector));
            }
        }
    }

    if new_trace.is_empty() {
        persist_routing_decisions(&storage, &routing_records)?;
        return Ok(RetainResult { memories: result_memories, entities: vec![], links: vec![] });
    }

    // Map original fact index -> position within `new_trace`, so causal
    // references into dropped (reinforced/reconsolidated) facts are pruned.
    let index_map: HashMap<usize, usize> =
        new_trace.iter().enumerate().map(|(pos, (orig, _, _))| (*orig, pos)).collect();

    let existing_entities = storage.entities_by_bank(bank_id).map_err(HindsightError::from)?;
    let mut new_entities: Vec<Entity> = Vec::new();
    let mut entity_by_name: HashMap<String, Entity> = HashMap::new();
    // (fact position within new_trace) -> resolved entity ids mentioned by that fact
    let mut fact_entity_ids: Vec<Vec<String>> = vec![vec![]; new_trace.len()];

    for (pos, (_, fact, _)) in new_trace.iter().enumerate() {
        for name in &fact.mentioned_entities {
            if let Some(existing) = entity_by_name.get(name) {
                fact_entity_ids[pos].push(existing.id.clone());
                continue;
            }
            let mut candidates: Vec<EntityCandidate> = Vec::with_capacity(existing_entities.len());
            for entity in existing_entities.iter().cloned() {
                let mut cooccurrence_with_selected = 0i64;
                for already_selected_id in &fact_entity_ids[pos] {
                    cooccurrence_with_selected +=
                        storage.cooccurrence_count(&entity.id, already_selected_id).map_err(HindsightError::from)?;
                }
                candidates.push(EntityCandidate { entity, cooccurrence_with_selected });
            }
            let resolution = resolve_entity(
                name,
                EntityType::Other,
                &candidates,
                now,
                defaults.entity_match_threshold,
                defaults.entity_match_margin,
                EntityScoreWeights::default(),
            );
            let entity = match resolution {
                EntityResolution::Matched(m) => m.entity,
                EntityResolution::New { name, entity_type } => {
                    let entity = Entity {
                        id: new_id(),
                        bank_id: bank_id.to_string(),
                        name,
                        entity_type,
                        // creation itself is the first mention; touch_entity_tx
                        // increments on every subsequent one.
                        mention_count: 1,
                        first_seen: now,
                        last_updated: now,
                        description: None,
                        metadata: serde_json::json!({}),
                    };
                    new_entities.push(entity.clone());
                    entity
                }
            };
            fact_entity_ids[pos].push(entity.id.clone());
            entity_by_name.insert(name.clone(), entity);
        }
    }

    let mut memories: Vec<MemoryUnit> = Vec::with_capacity(new_trace.len());
    for (_, fact, _) in &new_trace {
        memories.push(build_memory(bank_id, fact, event_date_ms, &options, defaults, now));
    }

    let mut links: Vec<MemoryLink> = Vec::new();
    let mut episode_events: Vec<(EpisodeEvent, String)> = Vec::new();

    let entity_link_pairs: std::collections::HashSet<(String, String)> = storage.transaction(|tx| {
        for entity in &new_entities {
            Storage::insert_entity_tx(tx, entity)?;
        }
        let touched: std::collections::HashSet<&String> =
            fact_entity_ids.iter().flatten().collect();
        for entity_id in touched {
            if existing_entities.iter().any(|e| &e.id == entity_id) {
                Storage::touch_entity_tx(tx, entity_id, now)?;
            }
        }

        for memory in &memories {
            Storage::insert_memory_tx(tx, memory)?;
        }

        // Seed from the entity's last-linked memory across prior retain
        // calls, not just this batch, so entity links chain across writes.
        let mut entity_last_memory: HashMap<String, String> = HashMap::new();
        for entity_id in fact_entity_ids.iter().flatten() {
            if entity_last_memory.contains_key(entity_id) {
                continue;
            }
            if let Some(prior) = Storage::latest_memory_for_entity_tx(tx, entity_id)? {
                entity_last_memory.insert(entity_id.clone(), prior);
            }
        }
        let mut entity_link_pairs: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
        for (pos, memory) in memories.iter().enumerate() {
            let entities = &fact_entity_ids[pos];
            for entity_id in entities {
                Storage::link_entity_mention_tx(tx, entity_id, &memory.id)?;
            }
            for a in 0..entities.len() {
                for b in (a + 1)..entities.len() {
                    Storage::bump_cooccurrence_tx(tx, bank_id, &entities[a], &entities[b])?;
                }
                if let Some(prev_memory_id) = entity_last_memory.get(&entities[a]) {
                    if prev_memory_id != &memory.id {
                        entity_link_pairs.insert((prev_memory_id.clone(), memory.id.clone()));
                    }
                }
            }
            for entity_id in entities {
                entity_last_memory.insert(entity_id.clone(), memory.id.clone());
            }
        }

        // Causal links are directed and backward-only within the batch: a
        // fact can only cite an earlier fact as its cause, never a later one.
        for (pos, (_, fact, _)) in new_trace.iter().enumerate() {
            if let Some(target_orig) = fact.caused_by_index {
                if let Some(&target_pos) = index_map.get(&target_orig) {
                    if target_pos < pos {
                        let link = causal_link(
                            bank_id,
                            &memories[target_pos].id,
                            &memories[pos].id,
                            fact.caused_by_strength,
                            now,
                        );
                        Storage::insert_link_tx(tx, &link)?;
                        links.push(link);
                    }
                }
            }
        }

        Ok(entity_link_pairs)
    }).map_err(HindsightError::from)?;

    // Entity link weight needs each memory's full resolved-entity set, which
    // only exists once `entity_mentions` rows are committed, so these are
    // built in their own transaction right after the main one.
    for (source_id, target_id) in entity_link_pairs {
        let source_entities = storage.entities_for_memory(&source_id).map_err(HindsightError::from)?;
        let target_entities = storage.entities_for_memory(&target_id).map_err(HindsightError::from)?;
        let target_ids: std::collections::HashSet<&String> = target_entities.iter().map(|e| &e.id).collect();
        let shared = source_entities.iter().filter(|e| target_ids.contains(&e.id)).count();
        let link = entity_link(bank_id, &source_id, &target_id, shared, source_entities.len(), target_entities.len(), now);
        storage.transaction(|tx| Storage::insert_link_tx(tx, &link)).map_err(HindsightError::from)?;
        links.push(link);
    }

    // Semantic + temporal links and episode tracking run after the core
    // persist transaction: each uses the just-upserted embedding index /
    // latest episode row, which only exist once the memory rows are committed.
    for memory in &memories {
        embeddings.upsert(IndexName::Memory, &memory.id, &memory.content).await.map_err(HindsightError::from)?;
    }

    let mut prior_in_chain = temporal_by_id
        .values()
        .max_by_key(|m| m.event_date_ms)
        .map(|m| (m.id.clone(), m.event_date_ms));

    for memory in &memories {
        let semantic_hits = embeddings
            .search_by_vector(
                IndexName::Memory,
                &embeddings.create_vectors(&[memory.content.clone()]).await.map_err(HindsightError::from)?[0],
                defaults.semantic_link_k + 1,
            )
            .map_err(HindsightError::from)?;
        let pool: Vec<(String, f32)> = semantic_hits.into_iter().map(|h| (h.id, 1.0 - h.distance)).collect();
        let new_links = semantic_links(
            bank_id,
            &memory.id,
            &pool,
            defaults.semantic_link_k,
            defaults.semantic_link_min_similarity,
            now,
        );
        if !new_links.is_empty() {
            storage
                .transaction(|tx| {
                    for link in &new_links {
                        Storage::insert_link_tx(tx, link)?;
                    }
                    Ok(())
                })
                .map_err(HindsightError::from)?;
            links.extend(new_links);
        }

        // Chain each new memory off whichever memory (prior batch candidate,
        // or an earlier memory in this same batch) is chronologically closest.
        // Temporal links are symmetric: both directions are inserted so a
        // traversal from either memory finds its neighbor.
        if let Some((prior_id, prior_event_ms)) = prior_in_chain.clone() {
            let gap_ms = (memory.event_date_ms - prior_event_ms).abs();
            let forward = temporal_link(
                bank_id,
                &prior_id,
                &memory.id,
                gap_ms,
                defaults.temporal_window_ms,
                defaults.temporal_link_min_weight,
                now,
            );
            let backward = temporal_link(
                bank_id,
                &memory.id,
                &prior_id,
                gap_ms,
                defaults.temporal_window_ms,
                defaults.temporal_link_min_weight,
                now,
            );
            storage
                .transaction(|tx| {
                    Storage::insert_link_tx(tx, &forward)?;
                    Storage::insert_link_tx(tx, &backward)?;
                    Ok(())
                })
                .map_err(HindsightError::from)?;
            links.push(forward);
            links.push(backward);
        }
        prior_in_chain = Some((memory.id.clone(), memory.event_date_ms));
    }

    for memory in &memories {
        let scope = memory.scope;
        let current_episode = storage.latest_episode(bank_id, scope).map_err(HindsightError::from)?;
        let boundary = detect_boundary(
            current_episode.as_ref(),
            now,
            scope,
            &memory.content,
            &bank_config.episode_boundary_phrases,
            EpisodeThresholds { time_gap_ms: defaults.episode_time_gap_ms },
        );

        let episode_id = match boundary {
            None => current_episode.as_ref().expect("boundary None implies an existing episode").id.clone(),
            Some(reason) => {
                let episode = new_episode(bank_id, scope, now, reason);
                let prior = current_episode.clone();
                storage
                    .transaction(|tx| {
                        Storage::insert_episode_tx(tx, &episode)?;
                        if let Some(prior) = &prior {
                            Storage::close_episode_tx(tx, &prior.id, now)?;
                            let gap_ms = (now - prior.last_event_at).num_milliseconds();
                            let temporal_link = crate::model::EpisodeTemporalLink {
                                id: new_monotonic_id(),
                                bank_id: bank_id.to_string(),
                                prior_episode_id: prior.id.clone(),
                                next_episode_id: episode.id.clone(),
                                gap_ms,
                            };
                            Storage::insert_episode_temporal_link_tx(tx, &temporal_link)?;
                        }
                        Ok(())
                    })
                    .map_err(HindsightError::from)?;
                episode.id
            }
        };
        storage.transaction(|tx| Storage::touch_episode_tx(tx, &episode_id, now)).map_err(HindsightError::from)?;

        let event = EpisodeEvent {
            id: new_monotonic_id(),
            episode_id: episode_id.clone(),
            memory_id: memory.id.clone(),
            route: "new_trace".to_string(),
            event_time: now,
        };
        storage.transaction(|tx| Storage::insert_episode_event_tx(tx, &event)).map_err(HindsightError::from)?;
        episode_events.push((event, episode_id));
    }

    persist_routing_decisions(&storage, &routing_records)?;

    schedule_gist_upgrade(storage.clone(), llm.clone(), defaults, memories.clone());

    if bank_config.enable_consolidation {
        schedule_consolidation_trigger(storage.clone(), bank_id);
    }

    result_memories.extend(memories);
    let entities: Vec<Entity> = entity_by_name.into_values().collect();
    Ok(RetainResult { memories: result_memories, entities, links })
}

/// Batch form of [`retain`]: normalize each item's fields against the
/// shared `options`, then run the single-item pipeline per item and return
/// one result per input (`spec.md` §4.7 batch form). Each item's own
/// `chunk_text`/extraction/routing/persist/link pass stays within its own
/// transactions exactly as the single-item call does, so an oversize item
/// doesn't block or interleave with its neighbors.
pub async fn retain_batch(
    storage: Arc<Storage>,
    embeddings: Arc<EmbeddingStore>,
    llm: Option<Arc<dyn LlmAdapter>>,
    defaults: &EngineDefaults,
    bank_config: &BankConfig,
    bank_id: &str,
    items: Vec<RetainBatchItem>,
    options: RetainOptions,
) -> Result<Vec<RetainResult>, HindsightError> {
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let mut tags = options.tags.clone();
        tags.extend(item.tags);
        let merged = RetainOptions {
            event_date_ms: item.event_date_ms.or(options.event_date_ms),
            document_id: item.document_id.or_else(|| options.document_id.clone()),
            chunk_id: item.chunk_id.or_else(|| options.chunk_id.clone()),
            scope: item.scope.or(options.scope),
            mode: options.mode.clone(),
            tags,
            metadata: item.metadata.or_else(|| options.metadata.clone()),
        };
        let result = retain(
            storage.clone(),
            embeddings.clone(),
            llm.clone(),
            defaults,
            bank_config,
            bank_id,
            &item.content,
            merged,
        )
        .await?;
        results.push(result);
    }
    Ok(results)
}

fn build_memory(
    bank_id: &str,
    fact: &ExtractedFact,
    event_date_ms: i64,
    options: &RetainOptions,
    defaults: &EngineDefaults,
    now: chrono::DateTime<Utc>,
) -> MemoryUnit {
    let mut tags = fact.tags.clone();
    for tag in &options.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    let content = fact.content.clone();
    MemoryUnit {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        content: content.clone(),
        fact_type: fact.fact_type,
        confidence: fact.confidence,
        document_id: options.document_id.clone(),
        chunk_id: options.chunk_id.clone(),
        event_date_ms,
        occurred_start_ms: None,
        occurred_end_ms: None,
        mentioned_at_ms: None,
        metadata: options.metadata.clone().unwrap_or_else(|| serde_json::json!({})),
        tags,
        source_text: Some(content.clone()),
        access_count: 0,
        last_accessed: now,
        encoding_strength: 1.0,
        gist: content.chars().take(defaults.gist_max_chars).collect(),
        scope: options.scope.unwrap_or_default(),
        consolidated_at: None,
        proof_count: None,
        source_memory_ids: vec![],
        history: vec![],
        created_at: now,
        updated_at: now,
    }
}

fn routing_record(
    bank_id: &str,
    route: &str,
    candidate_memory_id: Option<&str>,
    candidate_score: Option<f32>,
    conflict_detected: bool,
    conflict_keys: Vec<String>,
    at: chrono::DateTime<Utc>,
) -> RoutingDecisionRecord {
    RoutingDecisionRecord {
        id: new_monotonic_id(),
        bank_id: bank_id.to_string(),
        route: route.to_string(),
        candidate_memory_id: candidate_memory_id.map(|s| s.to_string()),
        candidate_score,
        conflict_detected,
        conflict_keys,
        created_at: at,
    }
}

/// A negation/reversal marker used as a coarse polarity heuristic: if only
/// one of a pair of same-window candidates carries one of these, they likely
/// disagree about the same fact rather than merely being similar text.
const NEGATION_MARKERS: &[&str] = &["not ", "no longer", "stopped", "isn't", "doesn't", "never", "without"];

fn has_negation(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEGATION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Conflict detection (`spec.md` §4.4): set when the two closest same-window
/// candidates either share no resolved entity despite both being viable
/// matches, or disagree on a coarse negation/polarity heuristic.
fn detect_conflict(
    storage: &Storage,
    candidates: &[RouteCandidate],
) -> Result<(bool, Vec<String>), crate::error::StorageError> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
    let (Some(a), Some(b)) = (ranked.first(), ranked.get(1)) else {
        return Ok((false, vec![]));
    };

    let entities_a = storage.entities_for_memory(&a.memory.id)?;
    let entities_b = storage.entities_for_memory(&b.memory.id)?;
    let ids_b: std::collections::HashSet<&String> = entities_b.iter().map(|e| &e.id).collect();
    let shares_entity = entities_a.iter().any(|e| ids_b.contains(&e.id));
    let entity_conflict = !entities_a.is_empty() && !entities_b.is_empty() && !shares_entity;
    let polarity_conflict = has_negation(&a.memory.content) != has_negation(&b.memory.content);

    if !entity_conflict && !polarity_conflict {
        return Ok((false, vec![]));
    }

    let mut keys: Vec<String> = Vec::new();
    if entity_conflict {
        keys.extend(entities_a.iter().map(|e| e.name.clone()));
        keys.extend(entities_b.iter().map(|e| e.name.clone()));
    }
    if polarity_conflict {
        keys.push(a.memory.id.clone());
        keys.push(b.memory.id.clone());
    }
    Ok((true, keys))
}

fn persist_routing_decisions(
    storage: &Storage,
    records: &[RoutingDecisionRecord],
) -> Result<(), HindsightError> {
    if records.is_empty() {
        return Ok(());
    }
    storage
        .transaction(|tx| {
            for record in records {
                Storage::insert_routing_decision_tx(tx, record)?;
            }
            Ok(())
        })
        .map_err(HindsightError::from)
}

/// Write the deterministic fallback gist immediately (already done in
/// `build_memory`), then kick off a bounded-concurrency fire-and-forget pass
/// that asks the LLM for a sharper one-line gist per new memory
/// (`spec.md` §4.7 step 8). Errors are swallowed; this never blocks retain.
fn schedule_gist_upgrade(
    storage: Arc<Storage>,
    llm: Arc<dyn LlmAdapter>,
    defaults: &EngineDefaults,
    memories: Vec<MemoryUnit>,
) {
    let semaphore = Arc::new(Semaphore::new(defaults.gist_upgrade_concurrency.max(1)));
    for memory in memories {
        let storage = storage.clone();
        let llm = llm.clone();
        let semaphore = semaphore.clone();
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else { return };
            match upgrade_gist(&llm, &memory.content).await {
                Ok(gist) => {
                    let mut updated = memory.clone();
                    updated.gist = gist;
                    updated.updated_at = Utc::now();
                    if let Err(e) = storage.transaction(|tx| Storage::update_memory_tx(tx, &updated)) {
                        tracing::warn!(error = %e, memory_id = %memory.id, "gist upgrade persist failed");
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, memory_id = %memory.id, "gist upgrade skipped");
                }
            }
        });
    }
}

async fn upgrade_gist(llm: &Arc<dyn LlmAdapter>, content: &str) -> Result<String, crate::error::ExtractionError> {
    let request = crate::llm::LlmRequest {
        messages: vec![
            crate::llm::ChatMessage {
                role: crate::llm::ChatRole::System,
                content: "Summarize the following memory in one short clause, under 15 words. \
                          Reply with only the summary."
                    .to_string(),
            },
            crate::llm::ChatMessage { role: crate::llm::ChatRole::User, content: content.to_string() },
        ],
        tools: vec![],
        response_schema: None,
        temperature: Some(0.0),
        max_tokens: Some(40),
    };
    let gist = llm.complete(request).await?;
    Ok(gist.trim().to_string())
}

/// Enqueue (deduplicated) a consolidation pass for `bank_id`; the async
/// operation queue (C12) picks it up and actually runs `consolidation::consolidate`.
fn schedule_consolidation_trigger(storage: Arc<Storage>, bank_id: &str) {
    let bank_id = bank_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = crate::asyncops::enqueue_consolidation(&storage, &bank_id) {
            tracing::warn!(error = %e, bank_id = %bank_id, "failed to enqueue consolidation trigger");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_memory_merges_option_tags_with_fact_tags() {
        let fact = ExtractedFact {
            content: "likes tea".to_string(),
            fact_type: FactType::Opinion,
            confidence: 0.9,
            tags: vec!["drink".to_string()],
            mentioned_entities: vec![],
            caused_by_index: None,
            caused_by_strength: 1.0,
        };
        let options = RetainOptions { tags: vec!["drink".to_string(), "preference".to_string()], ..Default::default() };
        let defaults = EngineDefaults::default();
        let memory = build_memory("bank-1", &fact, 0, &options, &defaults, Utc::now());
        assert_eq!(memory.tags, vec!["drink".to_string(), "preference".to_string()]);
    }

    #[test]
    fn build_memory_truncates_gist_to_configured_length() {
        let fact = ExtractedFact {
            content: "a".repeat(500),
            fact_type: FactType::World,
            confidence: 1.0,
            tags: vec![],
            mentioned_entities: vec![],
            caused_by_index: None,
            caused_by_strength: 1.0,
        };
        let options = RetainOptions::default();
        let defaults = EngineDefaults { gist_max_chars: 50, ..EngineDefaults::default() };
        let memory = build_memory("bank-1", &fact, 0, &options, &defaults, Utc::now());
        assert_eq!(memory.gist.len(), 50);
    }
}
