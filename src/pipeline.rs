//! Three-stage chart plan generation.
//!
//! 1. **Candidates**: ask for `candidate_count` plans, recover the list,
//!    infer missing grouping columns and drop structurally invalid plans.
//!    If nothing survives, warn and try once more with half the count.
//! 2. **Sample execution**: run every survivor against a bounded sample and
//!    keep the ones that produce rows. If none do, the first `floor`
//!    candidates are returned as they are.
//! 3. **Refinement**: send each (plan, rows) pair back for curation and
//!    default-view configuration. The result is validated like stage 1,
//!    backfilled from unused candidates up to `floor` and capped at
//!    `ceiling`. If refinement fails the executed plans stand in for it.
//!
//! Every fallback leaves a [`PlanGenerationWarning`]; a fatal error carries
//! all of them. Cancellation is never a warning.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PlanGenerationConfig;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::plan::{unwrap_plan, validate_plan, AnalysisPlan, ColumnProfile};
use crate::prompts;
use crate::recovery::recover_array;
use crate::retry::{is_cancelled, RetryPolicy};
use crate::schema::{DialectError, SchemaName};
use crate::Row;

/// Plans executed against the sample at the same time.
const EXECUTION_CONCURRENCY: usize = 4;

/// Runs a plan's aggregation against sample rows.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    /// Aggregated result rows, or an error message.
    async fn execute(&self, plan: &AnalysisPlan, sample: &[Row]) -> Result<Vec<Value>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    PlanParseError,
    PlanGenerationError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CandidateGeneration,
    SampleExecution,
    QualityGateRefinement,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanGenerationWarning {
    pub kind: WarningKind,
    pub stage: Stage,
    pub message: String,
}

impl PlanGenerationWarning {
    fn new(kind: WarningKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanGenerationOutcome {
    pub plans: Vec<AnalysisPlan>,
    pub warnings: Vec<PlanGenerationWarning>,
    /// Whether the plans went through the refinement stage.
    pub refined: bool,
}

#[derive(Debug, Error)]
pub enum PlanGenerationError {
    #[error("plan generation cancelled")]
    Cancelled,
    #[error(transparent)]
    Schema(#[from] DialectError),
    #[error("plan generation failed: {cause}")]
    Fatal {
        cause: String,
        warnings: Vec<PlanGenerationWarning>,
    },
}

impl PlanGenerationError {
    pub fn warnings(&self) -> &[PlanGenerationWarning] {
        match self {
            PlanGenerationError::Fatal { warnings, .. } => warnings,
            _ => &[],
        }
    }
}

/// Why one provider round produced no plans.
enum RoundFailure {
    Cancelled,
    Provider(String),
    Parse(String),
}

impl From<ProviderError> for RoundFailure {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => RoundFailure::Cancelled,
            other => RoundFailure::Provider(other.to_string()),
        }
    }
}

pub struct PlanGenerator {
    gateway: Arc<dyn ChatGateway>,
    executor: Arc<dyn PlanExecutor>,
    model: ChatModel,
    retry: RetryPolicy,
    config: PlanGenerationConfig,
    session_id: Option<Uuid>,
}

impl PlanGenerator {
    pub fn new(gateway: Arc<dyn ChatGateway>, executor: Arc<dyn PlanExecutor>, model: ChatModel) -> Self {
        Self {
            gateway,
            executor,
            model,
            retry: RetryPolicy::default(),
            config: PlanGenerationConfig::default(),
            session_id: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: PlanGenerationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    fn attribution(&self, caller: &'static str) -> Attribution {
        let attribution = Attribution::new(caller);
        match self.session_id {
            Some(id) => attribution.with_session(id),
            None => attribution,
        }
    }

    /// Run all three stages over `rows` described by `columns`.
    pub async fn generate(
        &self,
        columns: &[ColumnProfile],
        rows: &[Row],
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<PlanGenerationOutcome, PlanGenerationError> {
        let mut warnings = Vec::new();
        let sample = &rows[..rows.len().min(self.config.sample_rows)];

        let candidates = self
            .generate_candidates(columns, sample, &mut warnings, cancel_flag)
            .await?;
        info!(candidates = candidates.len(), "candidate plans validated");

        if is_cancelled(cancel_flag) {
            return Err(PlanGenerationError::Cancelled);
        }
        let executed = self.execute_candidates(&candidates, sample).await;
        debug!(
            executed = executed.len(),
            dropped = candidates.len() - executed.len(),
            "sample execution finished"
        );

        if executed.is_empty() {
            let message = "no candidate produced rows on the sample; returning unrefined candidates";
            warn!("{message}");
            warnings.push(PlanGenerationWarning::new(
                WarningKind::PlanGenerationError,
                Stage::SampleExecution,
                message,
            ));
            let plans = candidates.into_iter().take(self.config.floor).collect();
            return Ok(PlanGenerationOutcome {
                plans,
                warnings,
                refined: false,
            });
        }

        if is_cancelled(cancel_flag) {
            return Err(PlanGenerationError::Cancelled);
        }
        let refinement = self.refine(&executed, columns, cancel_flag).await;
        let (refined, went_through_refinement) = match refinement {
            Ok(plans) => (plans, true),
            Err(RoundFailure::Cancelled) => return Err(PlanGenerationError::Cancelled),
            Err(RoundFailure::Provider(message)) | Err(RoundFailure::Parse(message)) => {
                warn!(error = %message, "refinement failed; using executed plans");
                warnings.push(PlanGenerationWarning::new(
                    WarningKind::PlanGenerationError,
                    Stage::QualityGateRefinement,
                    format!("refinement failed, using executed plans: {message}"),
                ));
                (executed.iter().map(|(plan, _)| plan.clone()).collect(), false)
            }
        };

        let plans = backfill(refined, &candidates, self.config.floor, self.config.ceiling);
        Ok(PlanGenerationOutcome {
            plans,
            warnings,
            refined: went_through_refinement,
        })
    }

    async fn generate_candidates(
        &self,
        columns: &[ColumnProfile],
        sample: &[Row],
        warnings: &mut Vec<PlanGenerationWarning>,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<Vec<AnalysisPlan>, PlanGenerationError> {
        let mut count = self.config.candidate_count.max(1);

        for round in 1..=2 {
            if is_cancelled(cancel_flag) {
                return Err(PlanGenerationError::Cancelled);
            }

            let (kind, message) = match self.candidate_round(columns, sample, count, cancel_flag).await {
                Ok(plans) if !plans.is_empty() => return Ok(plans),
                Ok(_) => (
                    WarningKind::PlanParseError,
                    format!("no valid plans among {count} requested"),
                ),
                Err(RoundFailure::Cancelled) => return Err(PlanGenerationError::Cancelled),
                Err(RoundFailure::Parse(message)) => (WarningKind::PlanParseError, message),
                Err(RoundFailure::Provider(message)) => (WarningKind::PlanGenerationError, message),
            };

            warn!(round, count, error = %message, "candidate round produced no plans");
            warnings.push(PlanGenerationWarning::new(
                kind,
                Stage::CandidateGeneration,
                message,
            ));
            count = (count / 2).max(1);
        }

        let cause = warnings
            .last()
            .map(|w| w.message.clone())
            .unwrap_or_else(|| "no candidate plans".to_string());
        Err(PlanGenerationError::Fatal {
            cause,
            warnings: std::mem::take(warnings),
        })
    }

    async fn candidate_round(
        &self,
        columns: &[ColumnProfile],
        sample: &[Row],
        count: usize,
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<Vec<AnalysisPlan>, RoundFailure> {
        let schema = SchemaName::PlanList
            .compiled()
            .map_err(|e| RoundFailure::Provider(e.to_string()))?;
        let prompt = prompts::plan_generation_prompt(columns, sample, count);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            self.attribution("pipeline::candidates"),
        )
        .temperature(0.7)
        .schema(schema);

        let resp = self.retry.chat(self.gateway.as_ref(), &req, cancel_flag).await?;
        let items = recover_array(&resp.content).map_err(|e| RoundFailure::Parse(e.to_string()))?;
        Ok(self.validate_all(items, columns, unwrap_identity))
    }

    fn validate_all(
        &self,
        items: Vec<Value>,
        columns: &[ColumnProfile],
        prepare: fn(Value) -> Value,
    ) -> Vec<AnalysisPlan> {
        items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| {
                match validate_plan(&prepare(item), columns, self.config.min_description_len) {
                    Ok(plan) => Some(plan),
                    Err(issue) => {
                        warn!(index, issue = %issue, "discarding invalid plan");
                        None
                    }
                }
            })
            .collect()
    }

    async fn execute_candidates(
        &self,
        candidates: &[AnalysisPlan],
        sample: &[Row],
    ) -> Vec<(AnalysisPlan, Vec<Value>)> {
        let results: Vec<_> = stream::iter(candidates)
            .map(|plan| async move { (plan, self.executor.execute(plan, sample).await) })
            .buffered(EXECUTION_CONCURRENCY)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(plan, result)| match result {
                Ok(rows) if !rows.is_empty() => Some((plan.clone(), rows)),
                Ok(_) => {
                    debug!(title = %plan.title, "plan produced no rows");
                    None
                }
                Err(error) => {
                    warn!(title = %plan.title, error = %error, "plan failed on sample");
                    None
                }
            })
            .collect()
    }

    async fn refine(
        &self,
        executed: &[(AnalysisPlan, Vec<Value>)],
        columns: &[ColumnProfile],
        cancel_flag: Option<&AtomicBool>,
    ) -> Result<Vec<AnalysisPlan>, RoundFailure> {
        let schema = SchemaName::RefinedPlans
            .compiled()
            .map_err(|e| RoundFailure::Provider(e.to_string()))?;
        let prompt =
            prompts::refinement_prompt(executed, columns, self.config.floor, self.config.ceiling);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            self.attribution("pipeline::refinement"),
        )
        .schema(schema);

        let resp = self.retry.chat(self.gateway.as_ref(), &req, cancel_flag).await?;
        let items = recover_array(&resp.content).map_err(|e| RoundFailure::Parse(e.to_string()))?;
        let plans = self.validate_all(items, columns, unwrap_plan);
        if plans.is_empty() {
            return Err(RoundFailure::Parse(
                "refinement returned no valid plans".to_string(),
            ));
        }
        Ok(plans)
    }
}

fn unwrap_identity(value: Value) -> Value {
    value
}

/// Top up `refined` to `floor` with candidates whose title is not yet used,
/// then cap at `ceiling`.
pub fn backfill(
    mut refined: Vec<AnalysisPlan>,
    candidates: &[AnalysisPlan],
    floor: usize,
    ceiling: usize,
) -> Vec<AnalysisPlan> {
    if refined.len() < floor {
        let mut titles: HashSet<String> = refined.iter().map(|p| p.title.clone()).collect();
        for candidate in candidates {
            if refined.len() >= floor {
                break;
            }
            if titles.insert(candidate.title.clone()) {
                refined.push(candidate.clone());
            }
        }
    }
    refined.truncate(ceiling);
    refined
}
