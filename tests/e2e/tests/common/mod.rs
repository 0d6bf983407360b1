//! Shared fixtures for the seed scenarios: a deterministic embedder and a
//! scripted LLM adapter that replays a fixed queue of responses regardless
//! of the prompt, so each scenario controls exactly what the engine "thinks"
//! without depending on a real model provider.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use hindsight_core::{Bank, BankConfig};
use hindsight_core::embeddings::Embedder;
use hindsight_core::error::{EmbeddingError, ExtractionError};
use hindsight_core::llm::{FinishReason, LlmAdapter, LlmRequest, RunEvent, RunEventStream, TokenUsage};

/// Bag-of-bytes embedder: deterministic, cheap, good enough for the hybrid
/// search paths that don't depend on real semantic structure (lexical FTS
/// and graph candidates carry the scenarios that do).
pub struct FakeEmbedder {
    dims: usize,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut v = vec![0.0_f32; self.dims];
        for (i, b) in text.to_lowercase().bytes().enumerate() {
            v[i % self.dims] += b as f32;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Maps specific literal strings to hand-picked vectors, falling back to the
/// bag-of-bytes hash for anything not listed. Lets a scenario pin the exact
/// cosine similarity between two facts instead of hoping the hash lands in
/// the right band.
pub struct VectorOverrideEmbedder {
    dims: usize,
    overrides: Vec<(String, Vec<f32>)>,
}

impl VectorOverrideEmbedder {
    pub fn new(dims: usize, overrides: Vec<(&str, Vec<f32>)>) -> Self {
        Self { dims, overrides: overrides.into_iter().map(|(k, v)| (k.to_string(), v)).collect() }
    }
}

#[async_trait]
impl Embedder for VectorOverrideEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some((_, v)) = self.overrides.iter().find(|(k, _)| k == text) {
            return Ok(v.clone());
        }
        let mut v = vec![0.0_f32; self.dims];
        for (i, b) in text.to_lowercase().bytes().enumerate() {
            v[i % self.dims] += b as f32;
        }
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// One scripted model turn. `Text` ends the reflect loop (or satisfies a
/// single-shot `complete()` call); `Tool` emits one tool call and lets the
/// loop continue with the tool's result fed back as the next message.
pub enum Turn {
    Text(String),
    Tool(&'static str, serde_json::Value),
}

/// Replays a fixed FIFO queue of turns, one per `run()` call, regardless of
/// prompt content. Each seed scenario pushes turns in the exact order the
/// engine is expected to call the LLM (extraction, then consolidation, then
/// reflect iterations, ...).
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Turn>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self { turns: Mutex::new(turns.into_iter().collect()) }
    }
}

#[async_trait]
impl LlmAdapter for ScriptedLlm {
    async fn run(&self, _request: LlmRequest) -> Result<RunEventStream, ExtractionError> {
        let turn = self
            .turns
            .lock()
            .expect("scripted llm lock poisoned")
            .pop_front()
            .expect("scripted llm exhausted: scenario issued more llm calls than scripted turns");

        let events = match turn {
            Turn::Text(text) => vec![
                RunEvent::RunStarted,
                RunEvent::TextMessageStart { message_id: "1".into() },
                RunEvent::TextMessageContent { message_id: "1".into(), delta: text },
                RunEvent::TextMessageEnd { message_id: "1".into() },
                RunEvent::RunFinished { finish_reason: FinishReason::Stop, usage: TokenUsage::default() },
            ],
            Turn::Tool(name, args) => vec![
                RunEvent::RunStarted,
                RunEvent::ToolCallStart { tool_call_id: "t1".into(), tool_name: name.to_string() },
                RunEvent::ToolCallArgs { tool_call_id: "t1".into(), delta: args.to_string() },
                RunEvent::ToolCallEnd { tool_call_id: "t1".into() },
                RunEvent::RunFinished { finish_reason: FinishReason::ToolCalls, usage: TokenUsage::default() },
            ],
        };
        Ok(stream::iter(events).boxed())
    }
}

/// Builds an `ExtractedFact`-shaped JSON blob for scripting an extraction
/// call, one fact per `(content, fact_type)` pair.
pub fn facts_json(facts: &[(&str, &str)]) -> String {
    let items: Vec<serde_json::Value> = facts
        .iter()
        .map(|(content, fact_type)| {
            serde_json::json!({"content": content, "factType": fact_type, "confidence": 0.9})
        })
        .collect();
    serde_json::json!({"facts": items}).to_string()
}

/// Builds a consolidation-actions-shaped JSON blob.
pub fn consolidation_json(actions: Vec<serde_json::Value>) -> String {
    serde_json::json!({"actions": actions}).to_string()
}

pub fn new_bank(id: &str) -> Bank {
    let now = Utc::now();
    Bank {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        config: BankConfig::default(),
        disposition: [3, 3, 3],
        mission: None,
        created_at: now,
        updated_at: now,
    }
}
