//! Generate → verify-by-execution → re-prompt loop for generated transforms.
//!
//! The model writes the body of a `(data, _util) => rows` function. Before
//! the host applies it, the body is run through a [`CodeHarness`] against a
//! bounded sample; anything that throws or returns a non-array is fed back
//! into the next prompt. Data preparation gets three attempts, filter
//! generation two.

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::plan::ColumnProfile;
use crate::prompts;
use crate::recovery::recover_object;
use crate::retry::{is_cancelled, RetryPolicy};
use crate::schema::{DialectError, ResponseSchema, SchemaName};
use crate::Row;

/// Rows handed to the harness during verification.
pub const DEFAULT_VERIFY_SAMPLE_ROWS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    /// Cleaning/reshaping the whole dataset before analysis.
    DataPreparation,
    /// Selecting rows for a user's filter request.
    Filter,
}

impl TransformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransformKind::DataPreparation => "data_preparation",
            TransformKind::Filter => "filter",
        }
    }

    pub fn max_attempts(self) -> u32 {
        match self {
            TransformKind::DataPreparation => 3,
            TransformKind::Filter => 2,
        }
    }

    pub fn schema(self) -> SchemaName {
        match self {
            TransformKind::DataPreparation => SchemaName::DataTransform,
            TransformKind::Filter => SchemaName::FilterFunction,
        }
    }

    /// A null body means "nothing to do" rather than a failure.
    pub fn allows_empty_body(self) -> bool {
        self == TransformKind::DataPreparation
    }

    fn caller(self) -> &'static str {
        match self {
            TransformKind::DataPreparation => "correction::data_preparation",
            TransformKind::Filter => "correction::filter",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes generated function bodies with the same helper surface the
/// host runtime provides.
#[async_trait]
pub trait CodeHarness: Send + Sync {
    /// Run `function_body` against `sample` and return whatever it returned.
    /// Thrown errors come back as their message.
    async fn run(&self, function_body: &str, sample: &[Row]) -> Result<Value, String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedTransform {
    pub kind: TransformKind,
    pub explanation: String,
    /// `None` only for data preparation that needs no transformation.
    pub function_body: Option<String>,
    /// Attempt that produced this transform, 1-based.
    pub attempts: u32,
    /// Rows the verification run returned; `None` when nothing was run.
    pub verified_rows: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    explanation: String,
    function_body: Option<String>,
}

/// Where the loop is.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionState {
    Attempting {
        attempt: u32,
        previous_error: Option<String>,
    },
    Verifying {
        attempt: u32,
        explanation: String,
        function_body: Option<String>,
    },
    Retrying {
        attempt: u32,
        error: String,
    },
    Succeeded(GeneratedTransform),
    Exhausted {
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("transform generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Schema(#[from] DialectError),
    #[error("{kind} generation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        kind: TransformKind,
        attempts: u32,
        last_error: String,
    },
}

/// Outcome of one attempt's request step.
enum RequestOutcome {
    Candidate(Candidate),
    Failed(String),
    Cancelled,
}

pub struct SelfCorrectingGenerator {
    gateway: Arc<dyn ChatGateway>,
    harness: Arc<dyn CodeHarness>,
    model: ChatModel,
    retry: RetryPolicy,
    sample_rows: usize,
}

impl SelfCorrectingGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, harness: Arc<dyn CodeHarness>, model: ChatModel) -> Self {
        Self {
            gateway,
            harness,
            model,
            retry: RetryPolicy::default(),
            sample_rows: DEFAULT_VERIFY_SAMPLE_ROWS,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows.max(1);
        self
    }

    pub async fn prepare_data(
        &self,
        request: &str,
        columns: &[ColumnProfile],
        rows: &[Row],
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<GeneratedTransform, CorrectionError> {
        self.generate(TransformKind::DataPreparation, request, columns, rows, cancel_flag)
            .await
    }

    pub async fn generate_filter(
        &self,
        request: &str,
        columns: &[ColumnProfile],
        rows: &[Row],
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<GeneratedTransform, CorrectionError> {
        self.generate(TransformKind::Filter, request, columns, rows, cancel_flag)
            .await
    }

    /// Run the loop for `kind` until a transform verifies or attempts run out.
    pub async fn generate(
        &self,
        kind: TransformKind,
        request: &str,
        columns: &[ColumnProfile],
        rows: &[Row],
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<GeneratedTransform, CorrectionError> {
        let schema = kind.schema().compiled()?;
        let sample = &rows[..rows.len().min(self.sample_rows)];
        let max_attempts = kind.max_attempts();

        let mut state = CorrectionState::Attempting {
            attempt: 1,
            previous_error: None,
        };

        loop {
            state = match state {
                CorrectionState::Attempting {
                    attempt,
                    previous_error,
                } => {
                    if is_cancelled(cancel_flag) {
                        return Err(CorrectionError::Cancelled);
                    }
                    debug!(kind = %kind, attempt, "requesting transform");
                    let outcome = self
                        .request(
                            kind,
                            &schema,
                            request,
                            columns,
                            sample,
                            previous_error.as_deref(),
                            cancel_flag,
                        )
                        .await;
                    match outcome {
                        RequestOutcome::Cancelled => return Err(CorrectionError::Cancelled),
                        RequestOutcome::Failed(error) => CorrectionState::Retrying { attempt, error },
                        RequestOutcome::Candidate(candidate) => CorrectionState::Verifying {
                            attempt,
                            explanation: candidate.explanation,
                            function_body: candidate.function_body,
                        },
                    }
                }
                CorrectionState::Verifying {
                    attempt,
                    explanation,
                    function_body,
                } => match self.verify(kind, function_body.as_deref(), sample).await {
                    Ok(verified_rows) => CorrectionState::Succeeded(GeneratedTransform {
                        kind,
                        explanation,
                        function_body,
                        attempts: attempt,
                        verified_rows,
                    }),
                    Err(error) => CorrectionState::Retrying { attempt, error },
                },
                CorrectionState::Retrying { attempt, error } => {
                    if attempt >= max_attempts {
                        CorrectionState::Exhausted {
                            attempts: attempt,
                            last_error: error,
                        }
                    } else {
                        warn!(kind = %kind, attempt, max_attempts, error = %error, "transform rejected; re-prompting");
                        CorrectionState::Attempting {
                            attempt: attempt + 1,
                            previous_error: Some(error),
                        }
                    }
                }
                CorrectionState::Succeeded(transform) => {
                    if transform.attempts > 1 {
                        info!(kind = %kind, attempts = transform.attempts, "transform corrected after feedback");
                    }
                    return Ok(transform);
                }
                CorrectionState::Exhausted {
                    attempts,
                    last_error,
                } => {
                    return Err(CorrectionError::Exhausted {
                        kind,
                        attempts,
                        last_error,
                    });
                }
            };
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn request(
        &self,
        kind: TransformKind,
        schema: &Arc<ResponseSchema>,
        request: &str,
        columns: &[ColumnProfile],
        sample: &[Row],
        previous_error: Option<&str>,
        cancel_flag: Option<&AtomicBool>,
    ) -> RequestOutcome {
        let prompt = prompts::transform_prompt(kind, request, columns, sample, previous_error);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new(kind.caller()),
        )
        .schema(schema.clone());

        let resp = match self.retry.chat(self.gateway.as_ref(), &req, cancel_flag).await {
            Ok(resp) => resp,
            Err(ProviderError::Cancelled) => return RequestOutcome::Cancelled,
            Err(err) => return RequestOutcome::Failed(format!("provider error: {err}")),
        };

        let object = match recover_object(&resp.content) {
            Ok(object) => object,
            Err(err) => return RequestOutcome::Failed(err.to_string()),
        };

        let explanation = object
            .get("explanation")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let function_body = match object.get("jsFunctionBody") {
            None | Some(Value::Null) => None,
            Some(Value::String(body)) if body.trim().is_empty() => None,
            Some(Value::String(body)) => Some(body.trim().to_string()),
            Some(_) => {
                return RequestOutcome::Failed("jsFunctionBody must be a string".to_string())
            }
        };

        if function_body.is_none() && !kind.allows_empty_body() {
            return RequestOutcome::Failed("response did not include jsFunctionBody".to_string());
        }

        RequestOutcome::Candidate(Candidate {
            explanation,
            function_body,
        })
    }

    /// `Ok(None)` when there was nothing to run.
    async fn verify(
        &self,
        kind: TransformKind,
        function_body: Option<&str>,
        sample: &[Row],
    ) -> Result<Option<usize>, String> {
        let Some(body) = function_body else {
            debug!(kind = %kind, "no transformation needed");
            return Ok(None);
        };
        match self.harness.run(body, sample).await? {
            Value::Array(rows) => Ok(Some(rows.len())),
            other => Err(format!(
                "the function must return an array of rows, but returned {}",
                json_type(&other)
            )),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
