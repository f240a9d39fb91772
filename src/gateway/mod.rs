//! Provider gateway for Gemini and OpenAI chat requests.
//!
//! The gateway only moves bytes: it routes a [`ChatRequest`] to the adapter
//! for its model, attaches the matching schema dialect, and records usage.
//! Retrying is the caller's business (see [`crate::retry::RetryPolicy`]).

pub mod error;
pub mod gemini;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Settings;
use gemini::GeminiAdapter;
use openai::OpenAiAdapter;
use usage::{CallStatus, ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// Maximum allowed response body length (1MB).
pub(crate) const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
pub(crate) const MAX_INPUT_CHARS: usize = 500_000;

/// One provider's wire protocol.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// What pipelines talk to. Implemented by [`ProviderGateway`] and by
/// in-process fakes in tests.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    gemini: Option<GeminiAdapter>,
    openai: Option<OpenAiAdapter>,
    usage_sink: Arc<U>,
}

#[async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// Build adapters for every provider that has an API key configured.
    pub fn from_settings(settings: &Settings, usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let gemini = settings
            .gemini
            .api_key
            .as_deref()
            .map(|key| GeminiAdapter::with_config(key, &settings.gemini.base_url, settings.timeout()))
            .transpose()?;
        let openai = settings
            .openai
            .api_key
            .as_deref()
            .map(|key| {
                OpenAiAdapter::with_config(
                    key,
                    &settings.openai.base_url,
                    settings.timeout(),
                    settings.openai.organization.clone(),
                )
            })
            .transpose()?;

        if gemini.is_none() && openai.is_none() {
            return Err(ProviderError::config(
                "no provider configured: set GEMINI_API_KEY or OPENAI_API_KEY",
            ));
        }

        Ok(Self {
            gemini,
            openai,
            usage_sink,
        })
    }

    pub fn with_adapters(
        gemini: Option<GeminiAdapter>,
        openai: Option<OpenAiAdapter>,
        usage_sink: Arc<U>,
    ) -> Self {
        Self {
            gemini,
            openai,
            usage_sink,
        }
    }

    fn adapter_for(&self, model: &ChatModel) -> Result<&dyn ChatProvider, ProviderError> {
        let adapter: Option<&dyn ChatProvider> = match model {
            ChatModel::Gemini(_) => self.gemini.as_ref().map(|a| a as &dyn ChatProvider),
            ChatModel::OpenAi(_) => self.openai.as_ref().map(|a| a as &dyn ChatProvider),
        };
        adapter.ok_or_else(|| {
            ProviderError::config(format!("no {} adapter configured", model.provider()))
        })
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let result = match self.adapter_for(&req.model) {
            Ok(adapter) => adapter.chat(&req).await,
            Err(err) => Err(err),
        };

        // A 200 with nothing in it is treated like a transient provider fault.
        let result = result.and_then(|resp| {
            if resp.content.trim().is_empty() {
                Err(ProviderError::EmptyResponse {
                    provider: req.model.provider(),
                })
            } else {
                Ok(resp)
            }
        });

        match &result {
            Ok(resp) => {
                self.record_usage(&req, resp, CallStatus::Success, None)
                    .await
            }
            Err(err) => {
                self.record_usage(&req, &ChatResponse::empty(), CallStatus::Error, Some(err.code()))
                    .await
            }
        }

        result
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        status: CallStatus,
        error_code: Option<&'static str>,
    ) {
        let record = ProviderCallRecord::new(
            req.model.provider(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .session(req.attribution.session_id)
        .schema(req.response_schema.as_ref().map(|s| s.name))
        .latency(resp.latency.as_millis() as u64);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or("provider_error"))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

/// Extract request ID from response headers.
pub(crate) fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Check if message indicates a refusal.
pub(crate) fn is_refusal(msg: &str) -> bool {
    let l = msg.trim_start().to_lowercase();
    let first_line = l.lines().next().unwrap_or("");

    const PREFIXES: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
        "unable to help",
        "unable to provide",
    ];

    PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
}

/// Stream a response body, enforcing [`MAX_RESPONSE_LEN`].
pub(crate) async fn read_capped_body(
    mut response: reqwest::Response,
    provider: &'static str,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::provider(
                provider,
                format!("Response too large: {new_len} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}
