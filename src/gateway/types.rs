//! Core types for the provider gateway.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::ResponseSchema;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every request through the gateway carries attribution so usage records
/// can be traced back to the analysis session and the code path that made
/// the call.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Analysis session this request belongs to (if known).
    pub session_id: Option<Uuid>,
    /// Which code path made this call, e.g. "pipeline::candidates".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Chat model specification. The variant selects the provider and with it
/// the schema dialect attached to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatModel {
    /// Google Gemini model, e.g. "gemini-2.5-flash".
    Gemini(String),
    /// OpenAI chat model, e.g. "gpt-4o-mini".
    OpenAi(String),
}

impl ChatModel {
    pub fn gemini(model_id: impl Into<String>) -> Self {
        ChatModel::Gemini(model_id.into())
    }

    pub fn openai(model_id: impl Into<String>) -> Self {
        ChatModel::OpenAi(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::Gemini(id) | ChatModel::OpenAi(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::Gemini(_) => "gemini",
            ChatModel::OpenAi(_) => "openai",
        }
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Output constraint. Each adapter attaches the dialect its provider
    /// accepts; without a schema the request still asks for JSON output.
    pub response_schema: Option<Arc<ResponseSchema>>,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            response_schema: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn schema(mut self, schema: Arc<ResponseSchema>) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Concatenated system + user text, mostly useful for assertions in tests.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") | Some("STOP") => FinishReason::Stop,
            Some("length") | Some("MAX_TOKENS") => FinishReason::Length,
            Some("content_filter") | Some("SAFETY") | Some("RECITATION") => {
                FinishReason::ContentFilter
            }
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated content (raw text, not yet recovered).
    pub content: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Response carrying only text; used by in-process gateways.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::ZERO,
            finish_reason: FinishReason::Stop,
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            finish_reason: FinishReason::Unknown("error".to_string()),
            ..Self::text("")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_maps_both_provider_vocabularies() {
        assert_eq!(FinishReason::from(Some("stop".into())), FinishReason::Stop);
        assert_eq!(FinishReason::from(Some("STOP".into())), FinishReason::Stop);
        assert_eq!(
            FinishReason::from(Some("MAX_TOKENS".into())),
            FinishReason::Length
        );
        assert_eq!(
            FinishReason::from(Some("SAFETY".into())),
            FinishReason::ContentFilter
        );
        assert_eq!(
            FinishReason::from(None),
            FinishReason::Unknown("none".into())
        );
    }

    #[test]
    fn chat_model_reports_provider() {
        assert_eq!(ChatModel::gemini("gemini-2.5-flash").provider(), "gemini");
        assert_eq!(ChatModel::openai("gpt-4o-mini").provider(), "openai");
        assert_eq!(ChatModel::openai("gpt-4o-mini").model_id(), "gpt-4o-mini");
    }

    #[test]
    fn request_builder_defaults() {
        let req = ChatRequest::new(
            ChatModel::gemini("gemini-2.5-flash"),
            vec![Message::system("sys"), Message::user("hi")],
            Attribution::new("test"),
        )
        .temperature(0.2)
        .max_tokens(512);

        assert!(req.response_schema.is_none());
        assert_eq!(req.max_tokens, Some(512));
        assert_eq!(req.prompt_text(), "sys\nhi");
    }
}
