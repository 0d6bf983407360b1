//! Fact extraction (`spec.md` §4.1, §5): turns raw input text into
//! normalized `ExtractedFact`s via the injected LLM, after chunking any
//! input over the extraction char budget.

use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;
use crate::llm::{ChatMessage, ChatRole, LlmAdapter, LlmRequest};
use crate::model::{ExtractionMode, FactType, Scope};
use crate::util::sanitize_text;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFact {
    pub content: String,
    pub fact_type: FactType,
    pub confidence: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mentioned_entities: Vec<String>,
    /// Index of another fact in the same batch this one is causally linked to.
    #[serde(default)]
    pub caused_by_index: Option<usize>,
    /// Extractor-reported confidence in the causal relation, in [0, 1].
    /// Defaults to 1.0 when the extractor reports a relation without a strength.
    #[serde(default = "default_causal_strength")]
    pub caused_by_strength: f32,
}

fn default_causal_strength() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    facts: Vec<ExtractedFact>,
}

const RESPONSE_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "facts": {
      "type": "array",
      "items": {
        "type": "object",
        "properties": {
          "content": {"type": "string"},
          "factType": {"type": "string", "enum": ["world", "experience", "opinion", "observation"]},
          "confidence": {"type": "number"},
          "tags": {"type": "array", "items": {"type": "string"}},
          "mentionedEntities": {"type": "array", "items": {"type": "string"}},
          "causedByIndex": {"type": ["integer", "null"]},
          "causedByStrength": {"type": "number"}
        },
        "required": ["content", "factType", "confidence"]
      }
    }
  },
  "required": ["facts"]
}"#;

fn system_prompt(mode: &ExtractionMode) -> String {
    match mode {
        ExtractionMode::Concise => {
            "Extract discrete, atomic facts from the user's text. Prefer short, \
             self-contained statements. Classify each as world, experience, opinion, \
             or observation. Return strict JSON matching the given schema."
                .to_string()
        }
        ExtractionMode::Verbose => {
            "Extract every fact, preference, and experience from the user's text, \
             preserving nuance and context in each statement. Classify each as world, \
             experience, opinion, or observation. Return strict JSON matching the given schema."
                .to_string()
        }
        ExtractionMode::Custom(prompt) => prompt.clone(),
    }
}

/// Split `text` into chunks no larger than `char_budget`, breaking on
/// paragraph boundaries where possible and falling back to a hard cut
/// (`spec.md` §4.1 "chunker bounded by char budget").
pub fn chunk_text(text: &str, char_budget: usize) -> Vec<String> {
    if text.len() <= char_budget {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        if current.len() + paragraph.len() + 2 > char_budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() > char_budget {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            for hard_chunk in paragraph.as_bytes().chunks(char_budget) {
                chunks.push(String::from_utf8_lossy(hard_chunk).into_owned());
            }
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Extract facts from one chunk of text via the injected LLM.
pub async fn extract_facts(
    llm: &dyn LlmAdapter,
    text: &str,
    mode: &ExtractionMode,
) -> Result<Vec<ExtractedFact>, ExtractionError> {
    let sanitized = sanitize_text(text);
    let request = LlmRequest {
        messages: vec![
            ChatMessage { role: ChatRole::System, content: system_prompt(mode) },
            ChatMessage { role: ChatRole::User, content: sanitized },
        ],
        tools: vec![],
        response_schema: Some(serde_json::from_str(RESPONSE_SCHEMA).expect("valid schema literal")),
        temperature: Some(0.0),
        max_tokens: None,
    };

    let raw = llm.complete(request).await?;
    let parsed: ExtractionResponse = serde_json::from_str(raw.trim())
        .map_err(|e| ExtractionError::MalformedOutput(e.to_string()))?;
    Ok(parsed.facts)
}

/// Scope inferred for a retain call: callers may pin a scope explicitly, or
/// let it default to `profile` (`spec.md` §4.1).
pub fn resolve_scope(requested: Option<Scope>) -> Scope {
    requested.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_text("hello world", 100);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn long_text_splits_on_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = chunk_text(&text, 60);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with('a'));
        assert!(chunks[1].starts_with('b'));
    }

    #[test]
    fn oversized_paragraph_is_hard_cut() {
        let text = "a".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
    }

    #[test]
    fn resolve_scope_defaults_to_profile() {
        assert_eq!(resolve_scope(None), Scope::Profile);
        assert_eq!(resolve_scope(Some(Scope::Session)), Scope::Session);
    }
}
