#![forbid(unsafe_code)]

//! # insight-harness
//!
//! Structured-output plumbing between a data-analysis application and the LLM
//! providers that drive it.
//!
//! Providers are asked for JSON, and they mostly comply: the rest of the time
//! the JSON is wrapped in prose, fenced, truncated, missing fields, or
//! contractually wrong (a tool that the intent does not allow, a bar chart
//! with nothing to group by). This crate:
//!
//! - compiles one canonical schema tree into the two strictness dialects the
//!   providers accept ([`schema`]),
//! - recovers JSON objects and arrays from noisy text ([`recovery`]),
//! - validates and defaults the recovered values ([`contract`], [`plan`],
//!   [`actions`]),
//! - and runs the multi-stage pipelines that retry against validation and
//!   execution feedback ([`pipeline`], [`correction`]).

pub mod actions;
pub mod config;
pub mod contract;
pub mod correction;
pub mod gateway;
pub mod pipeline;
pub mod plan;
pub mod prompts;
pub mod recovery;
pub mod retry;
pub mod schema;

pub use actions::{decode_action_response, ActionBatch, ActionEnvelope, ActionError};
pub use config::{ConfigError, PlanGenerationConfig, Settings};
pub use contract::{validate_intent, ContractViolations, IntentContract};
pub use correction::{CodeHarness, CorrectionError, SelfCorrectingGenerator, TransformKind};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use pipeline::{
    PlanExecutor, PlanGenerationError, PlanGenerationOutcome, PlanGenerationWarning, PlanGenerator,
};
pub use plan::{AnalysisPlan, ColumnProfile};
pub use recovery::{recover_array, recover_object, RecoveryError};
pub use retry::RetryPolicy;
pub use schema::{PathPolicies, ResponseSchema, SchemaName, SchemaNode};

/// A single data row as handed over by the host application.
pub type Row = serde_json::Map<String, serde_json::Value>;
