//! The six seed scenarios: reinforce, reconsolidate, entity resolution,
//! temporal window, consolidation, and the reflect agent's three-tier
//! search. Each scenario drives a fresh in-memory engine with a scripted
//! LLM so the outcome only depends on the engine's own logic.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use hindsight_core::consolidation::ConsolidationOptions;
use hindsight_core::model::LinkType;
use hindsight_core::reflect::ReflectOptions;
use hindsight_core::retain::RetainOptions;
use hindsight_core::{Engine, MentalModel, ReflectBudget, Scope};

use common::{consolidation_json, facts_json, new_bank, FakeEmbedder, ScriptedLlm, Turn};

const BASE_MS: i64 = 1_700_000_000_000;

fn at(offset_ms: i64) -> i64 {
    BASE_MS + offset_ms
}

#[tokio::test]
async fn reinforce_bumps_access_count_without_touching_content() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Turn::Text(facts_json(&[("Alice lives in Paris.", "world")])),
        Turn::Text(facts_json(&[("Alice lives in Paris.", "world")])),
    ]));
    let engine = Engine::open_in_memory(Arc::new(FakeEmbedder::new(8)), Some(llm)).unwrap();
    let mut bank = new_bank("reinforce-bank");
    bank.config.reinforce_threshold = 0.92;
    engine.create_bank(&bank).unwrap();

    engine
        .retain("reinforce-bank", "Alice lives in Paris.", RetainOptions { event_date_ms: Some(at(0)), ..Default::default() })
        .await
        .unwrap();
    engine
        .retain(
            "reinforce-bank",
            "Alice lives in Paris.",
            RetainOptions { event_date_ms: Some(at(10 * 60 * 1000)), ..Default::default() },
        )
        .await
        .unwrap();

    let all = engine.storage().unconsolidated_memories("reinforce-bank", 100).unwrap();
    assert_eq!(all.len(), 1, "reinforce must not create a second row");
    assert_eq!(all[0].access_count, 2);
    assert_eq!(all[0].content, "Alice lives in Paris.");
}

#[tokio::test]
async fn reconsolidate_revises_content_and_preserves_history() {
    // Orthogonal unit vectors so the cosine similarity between the two facts
    // lands exactly on 0.8 - within the reconsolidate band (0.75..0.92) and
    // nowhere near the reinforce threshold.
    let embedder = common::VectorOverrideEmbedder::new(
        2,
        vec![
            ("Alice lives in Paris.", vec![1.0, 0.0]),
            ("Alice recently moved to Lyon.", vec![0.8, 0.6]),
        ],
    );
    let llm = Arc::new(ScriptedLlm::new(vec![
        Turn::Text(facts_json(&[("Alice lives in Paris.", "world")])),
        Turn::Text(facts_json(&[("Alice recently moved to Lyon.", "world")])),
    ]));
    let engine = Engine::open_in_memory(Arc::new(embedder), Some(llm)).unwrap();
    let mut bank = new_bank("reconsolidate-bank");
    bank.config.reinforce_threshold = 0.92;
    bank.config.reconsolidate_threshold = 0.75;
    engine.create_bank(&bank).unwrap();

    engine
        .retain(
            "reconsolidate-bank",
            "Alice lives in Paris.",
            RetainOptions { event_date_ms: Some(at(0)), ..Default::default() },
        )
        .await
        .unwrap();
    engine
        .retain(
            "reconsolidate-bank",
            "Alice recently moved to Lyon.",
            RetainOptions { event_date_ms: Some(at(60 * 60 * 1000)), ..Default::default() },
        )
        .await
        .unwrap();

    let all = engine.storage().unconsolidated_memories("reconsolidate-bank", 100).unwrap();
    assert_eq!(all.len(), 1, "reconsolidate revises in place, it never adds a row");
    assert!(all[0].content.contains("Lyon"));
    assert_eq!(all[0].history.len(), 1);
    assert!(all[0].history[0].previous_text.contains("Paris"));
}

#[tokio::test]
async fn entities_resolve_and_link_across_retain_calls() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Turn::Text(facts_json_with_entities(&[(
            "Bob from Acme met Alice.",
            "world",
            &["Bob", "Acme", "Alice"],
        )])),
        Turn::Text(facts_json_with_entities(&[(
            "Alice and Bob worked on Project X.",
            "world",
            &["Alice", "Bob", "Project X"],
        )])),
    ]));
    let embedder = common::VectorOverrideEmbedder::new(
        4,
        vec![
            ("Bob from Acme met Alice.", vec![1.0, 0.0, 0.0, 0.0]),
            ("Alice and Bob worked on Project X.", vec![0.0, 1.0, 0.0, 0.0]),
        ],
    );
    let engine = Engine::open_in_memory(Arc::new(embedder), Some(llm)).unwrap();
    let bank = new_bank("entity-bank");
    engine.create_bank(&bank).unwrap();

    let first = engine
        .retain("entity-bank", "Bob from Acme met Alice.", RetainOptions { event_date_ms: Some(at(0)), ..Default::default() })
        .await
        .unwrap();
    let second = engine
        .retain(
            "entity-bank",
            "Alice and Bob worked on Project X.",
            RetainOptions { event_date_ms: Some(at(60_000)), ..Default::default() },
        )
        .await
        .unwrap();

    let entities = engine.storage().entities_by_bank("entity-bank").unwrap();
    let names: std::collections::HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["Alice", "Bob", "Acme", "Project X"].into_iter().collect());

    let alice = entities.iter().find(|e| e.name == "Alice").unwrap();
    let bob = entities.iter().find(|e| e.name == "Bob").unwrap();
    assert_eq!(alice.mention_count, 2);
    assert_eq!(bob.mention_count, 2);

    let first_memory_id = &first.memories[0].id;
    let second_memory_id = &second.memories[0].id;
    let outgoing = engine.storage().links_from(first_memory_id).unwrap();
    assert!(
        outgoing.iter().any(|l| l.link_type == LinkType::Entity && &l.target_id == second_memory_id),
        "expected an entity link from the first memory to the second"
    );
}

#[tokio::test]
async fn temporal_links_connect_pairs_symmetrically_and_floor_distant_weights() {
    let embedder = common::VectorOverrideEmbedder::new(
        5,
        vec![
            ("Had a coffee meeting at nine.", vec![1.0, 0.0, 0.0, 0.0, 0.0]),
            ("Reviewed the quarterly budget.", vec![0.0, 1.0, 0.0, 0.0, 0.0]),
            ("Started planning next year's roadmap.", vec![0.0, 0.0, 1.0, 0.0, 0.0]),
        ],
    );
    let llm = Arc::new(ScriptedLlm::new(vec![
        Turn::Text(facts_json(&[("Had a coffee meeting at nine.", "world")])),
        Turn::Text(facts_json(&[("Reviewed the quarterly budget.", "world")])),
        Turn::Text(facts_json(&[("Started planning next year's roadmap.", "world")])),
    ]));
    let engine = Engine::open_in_memory(Arc::new(embedder), Some(llm)).unwrap();
    let bank = new_bank("temporal-bank");
    engine.create_bank(&bank).unwrap();

    let r1 = engine
        .retain(
            "temporal-bank",
            "Had a coffee meeting at nine.",
            RetainOptions { event_date_ms: Some(at(0)), ..Default::default() },
        )
        .await
        .unwrap();
    let r2 = engine
        .retain(
            "temporal-bank",
            "Reviewed the quarterly budget.",
            RetainOptions { event_date_ms: Some(at(10 * 60 * 1000)), ..Default::default() },
        )
        .await
        .unwrap();
    let r3 = engine
        .retain(
            "temporal-bank",
            "Started planning next year's roadmap.",
            RetainOptions { event_date_ms: Some(at(30 * 60 * 60 * 1000)), ..Default::default() },
        )
        .await
        .unwrap();

    let m1 = &r1.memories[0].id;
    let m2 = &r2.memories[0].id;
    let m3 = &r3.memories[0].id;

    // m1 -> m2 is close in time: a strong, near-1.0 weight, and the reverse
    // direction m2 -> m1 is inserted too (temporal links are symmetric).
    let from_m1 = engine.storage().links_from(m1).unwrap();
    let m1_to_m2 = from_m1.iter().find(|l| l.link_type == LinkType::Temporal && &l.target_id == m2);
    assert!(m1_to_m2.is_some_and(|l| l.weight > 0.9));

    let from_m2 = engine.storage().links_from(m2).unwrap();
    let m2_to_m1 = from_m2.iter().find(|l| l.link_type == LinkType::Temporal && &l.target_id == m1);
    assert!(m2_to_m1.is_some_and(|l| l.weight > 0.9));

    // m2 -> m3 is far outside the temporal window; the link still exists
    // (temporal links never drop) but its weight is floored at the
    // configured minimum rather than decaying toward zero.
    let m2_to_m3 = from_m2.iter().find(|l| l.link_type == LinkType::Temporal && &l.target_id == m3);
    assert!(m2_to_m3.is_some_and(|l| (l.weight - 0.3).abs() < 1e-6));

    let from_m3 = engine.storage().links_from(m3).unwrap();
    let m3_to_m2 = from_m3.iter().find(|l| l.link_type == LinkType::Temporal && &l.target_id == m2);
    assert!(m3_to_m2.is_some_and(|l| (l.weight - 0.3).abs() < 1e-6));
    assert!(!from_m3.iter().any(|l| l.link_type == LinkType::Temporal && &l.target_id == m1));
}

#[tokio::test]
async fn consolidation_distills_repeated_memories_into_an_observation() {
    let facts = [
        "Prefers oat milk in coffee.",
        "Orders a flat white most mornings.",
        "Avoids sugar in coffee.",
        "Likes coffee from the corner roastery.",
        "Drinks an extra shot when working late.",
    ];
    let embedder = common::VectorOverrideEmbedder::new(
        5,
        facts.iter().enumerate().map(|(i, f)| (*f, unit_vector(5, i))).collect(),
    );
    let llm = Arc::new(ScriptedLlm::new(vec![Turn::Text(facts_json(
        &facts.iter().map(|f| (*f, "opinion")).collect::<Vec<_>>(),
    ))]));
    let engine = Engine::open_in_memory(Arc::new(embedder), Some(llm)).unwrap();
    let bank = new_bank("consolidation-bank");
    engine.create_bank(&bank).unwrap();

    let content = facts.join(" ");
    let retained = engine
        .retain("consolidation-bank", &content, RetainOptions { event_date_ms: Some(at(0)), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(retained.memories.len(), 5);
    let source_ids: Vec<String> = retained.memories.iter().map(|m| m.id.clone()).collect();

    let llm_for_consolidation = engine_llm_for_consolidation(&source_ids);
    let engine = replace_llm(engine, llm_for_consolidation);

    let report = engine.consolidate("consolidation-bank", ConsolidationOptions { batch_size: 50 }).await.unwrap();
    assert_eq!(report.observations_created, 1);
    assert_eq!(report.memories_processed, 5);

    let observations = engine.storage().observations("consolidation-bank").unwrap();
    assert_eq!(observations.len(), 1);
    assert!(observations[0].content.to_lowercase().contains("coffee"));
    assert!(observations[0].proof_count.unwrap_or(0) >= 2);

    for id in &source_ids {
        let memory = engine.storage().get_memory("consolidation-bank", id).unwrap().unwrap();
        assert!(memory.consolidated_at.is_some());
    }
}

#[tokio::test]
async fn reflect_answers_from_a_seeded_mental_model_and_saves_an_observation() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Turn::Tool("search_mental_models", serde_json::json!({"query": "communication"})),
        Turn::Text(
            "Based on your mental model, you prefer concise, direct communication.".to_string(),
        ),
    ]));
    let engine = Engine::open_in_memory(Arc::new(FakeEmbedder::new(8)), Some(llm)).unwrap();
    let bank = new_bank("reflect-bank");
    engine.create_bank(&bank).unwrap();

    let now = Utc.timestamp_millis_opt(at(0)).unwrap();
    let model = MentalModel {
        id: "mm-1".into(),
        bank_id: "reflect-bank".into(),
        name: "communication style".into(),
        source_query: "how does the user like to communicate?".into(),
        content: Some("The user prefers concise, direct communication.".into()),
        source_memory_ids: vec![],
        tags: vec![],
        auto_refresh: true,
        last_refreshed_at: Some(now),
        created_at: now,
        updated_at: now,
    };
    engine.storage().upsert_mental_model(&model).unwrap();

    let options = ReflectOptions { budget: ReflectBudget::Low, response_schema: None, save_observation: true };
    let result = engine.reflect("reflect-bank", "How should I phrase this update?", &options).await.unwrap();

    assert!(result.answer.to_lowercase().contains("concise"));
    assert!(result.saved_observation_id.is_some());
    let saved = engine
        .storage()
        .get_memory("reflect-bank", result.saved_observation_id.as_ref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(saved.scope, Scope::Profile);
}

fn unit_vector(dims: usize, index: usize) -> Vec<f32> {
    let mut v = vec![0.0_f32; dims];
    v[index % dims] = 1.0;
    v
}

fn facts_json_with_entities(facts: &[(&str, &str, &[&str])]) -> String {
    let items: Vec<serde_json::Value> = facts
        .iter()
        .map(|(content, fact_type, entities)| {
            serde_json::json!({
                "content": content,
                "factType": fact_type,
                "confidence": 0.9,
                "mentionedEntities": entities,
            })
        })
        .collect();
    serde_json::json!({"facts": items}).to_string()
}

fn engine_llm_for_consolidation(source_ids: &[String]) -> Arc<ScriptedLlm> {
    Arc::new(ScriptedLlm::new(vec![Turn::Text(consolidation_json(vec![serde_json::json!({
        "action": "create",
        "content": "Prefers oat milk coffee without sugar, usually a flat white with an extra shot when working late.",
        "sourceMemoryIds": source_ids,
    })]))]))
}

/// `Engine` has no LLM setter; consolidation needs a different scripted
/// response than the retain call that seeded it, so rebuild an engine over
/// the same in-memory storage handle with a fresh adapter.
fn replace_llm(engine: Engine, llm: Arc<ScriptedLlm>) -> Engine {
    engine.with_llm(llm as Arc<dyn hindsight_core::LlmAdapter>)
}
