//! Injected LLM collaborator and its streaming event schema (`spec.md` §6).
//!
//! The engine never talks to a model provider directly; it drives an
//! `LlmAdapter` and consumes a stream of `RunEvent`s shaped after the
//! run-started/text-message/tool-call/run-finished lifecycle used by the
//! extraction, consolidation, and reflect components.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// When set, the adapter should steer the model toward emitting JSON
    /// matching this schema instead of (or alongside) tool calls.
    pub response_schema: Option<serde_json::Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Streaming event schema emitted by an `LlmAdapter::run` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEvent {
    RunStarted,
    TextMessageStart { message_id: String },
    TextMessageContent { message_id: String, delta: String },
    TextMessageEnd { message_id: String },
    StepStarted { step_name: String },
    StepFinished { step_name: String },
    ToolCallStart { tool_call_id: String, tool_name: String },
    ToolCallArgs { tool_call_id: String, delta: String },
    ToolCallEnd { tool_call_id: String },
    RunFinished { finish_reason: FinishReason, usage: TokenUsage },
    RunError { message: String },
}

pub type RunEventStream = BoxStream<'static, RunEvent>;

/// Injected LLM collaborator. The host supplies an implementation wrapping
/// whatever provider/runtime it likes; the engine only ever calls through
/// this trait and only ever reads `RunEvent`s off the returned stream.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn run(&self, request: LlmRequest) -> Result<RunEventStream, ExtractionError>;

    /// Convenience wrapper for single-shot, non-tool calls: drains the
    /// stream and concatenates `TextMessageContent` deltas.
    async fn complete(&self, request: LlmRequest) -> Result<String, ExtractionError> {
        use futures::StreamExt;
        let mut stream = self.run(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                RunEvent::TextMessageContent { delta, .. } => text.push_str(&delta),
                RunEvent::RunError { message } => return Err(ExtractionError::Adapter(message)),
                _ => {}
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use futures::StreamExt;

    struct EchoAdapter;

    #[async_trait]
    impl LlmAdapter for EchoAdapter {
        async fn run(&self, request: LlmRequest) -> Result<RunEventStream, ExtractionError> {
            let echoed = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let events = vec![
                RunEvent::RunStarted,
                RunEvent::TextMessageStart { message_id: "1".into() },
                RunEvent::TextMessageContent { message_id: "1".into(), delta: echoed },
                RunEvent::TextMessageEnd { message_id: "1".into() },
                RunEvent::RunFinished {
                    finish_reason: FinishReason::Stop,
                    usage: TokenUsage::default(),
                },
            ];
            Ok(stream::iter(events).boxed())
        }
    }

    #[tokio::test]
    async fn complete_concatenates_text_deltas() {
        let adapter = EchoAdapter;
        let request = LlmRequest {
            messages: vec![ChatMessage { role: ChatRole::User, content: "hi there".into() }],
            tools: vec![],
            response_schema: None,
            temperature: None,
            max_tokens: None,
        };
        let text = adapter.complete(request).await.unwrap();
        assert_eq!(text, "hi there");
    }

    #[tokio::test]
    async fn run_error_surfaces_as_extraction_error() {
        struct FailingAdapter;

        #[async_trait]
        impl LlmAdapter for FailingAdapter {
            async fn run(&self, _request: LlmRequest) -> Result<RunEventStream, ExtractionError> {
                Ok(stream::iter(vec![RunEvent::RunError { message: "boom".into() }]).boxed())
            }
        }

        let request = LlmRequest {
            messages: vec![],
            tools: vec![],
            response_schema: None,
            temperature: None,
            max_tokens: None,
        };
        let err = FailingAdapter.complete(request).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Adapter(ref m) if m == "boom"));
    }
}
