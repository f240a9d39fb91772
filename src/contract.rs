//! Intent/tool contract: validation, defaulting and the routing loop.
//!
//! A routed request names an intent and the tool that serves it. Which tools
//! an intent may use is fixed by [`Intent::allowed_tools`]; an intent with no
//! tools (`ask_clarify`) must leave `tool` null and wait for the user.
//!
//! Validation collects every violated rule instead of stopping at the first,
//! so a re-prompt can tell the model everything that was wrong at once.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::plan::{Aggregation, ColumnProfile};
use crate::prompts;
use crate::recovery::recover_object;
use crate::retry::{is_cancelled, RetryPolicy};
use crate::schema::{DialectError, SchemaName};

/// Attempts made by [`route_intent`] before giving up.
pub const ROUTING_ATTEMPTS: u32 = 2;

// =============================================================================
// Vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Profile,
    Aggregate,
    Filter,
    Visualize,
    Explain,
    AskClarify,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Profile,
        Intent::Aggregate,
        Intent::Filter,
        Intent::Visualize,
        Intent::Explain,
        Intent::AskClarify,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Profile => "profile",
            Intent::Aggregate => "aggregate",
            Intent::Filter => "filter",
            Intent::Visualize => "visualize",
            Intent::Explain => "explain",
            Intent::AskClarify => "ask_clarify",
        }
    }

    /// The intent→tools matrix.
    pub fn allowed_tools(self) -> &'static [Tool] {
        match self {
            Intent::Profile | Intent::Explain => &[Tool::CsvProfile],
            Intent::Aggregate => &[Tool::CsvAggregate],
            Intent::Filter => &[Tool::CsvFilter],
            Intent::Visualize => &[Tool::ChartRender, Tool::CsvAggregate],
            Intent::AskClarify => &[],
        }
    }
}

impl FromStr for Intent {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Intent::ALL.into_iter().find(|i| i.as_str() == s).ok_or(())
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tool {
    #[serde(rename = "csv.profile")]
    CsvProfile,
    #[serde(rename = "csv.aggregate")]
    CsvAggregate,
    #[serde(rename = "csv.filter")]
    CsvFilter,
    #[serde(rename = "chart.render")]
    ChartRender,
}

impl Tool {
    pub const ALL: [Tool; 4] = [
        Tool::CsvProfile,
        Tool::CsvAggregate,
        Tool::CsvFilter,
        Tool::ChartRender,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tool::CsvProfile => "csv.profile",
            Tool::CsvAggregate => "csv.aggregate",
            Tool::CsvFilter => "csv.filter",
            Tool::ChartRender => "chart.render",
        }
    }
}

impl FromStr for Tool {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tool::ALL.into_iter().find(|t| t.as_str() == s).ok_or(())
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOp {
    pub const ALL: [FilterOp; 7] = [
        FilterOp::Eq,
        FilterOp::Neq,
        FilterOp::Gt,
        FilterOp::Gte,
        FilterOp::Lt,
        FilterOp::Lte,
        FilterOp::Contains,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Contains => "contains",
        }
    }
}

impl FromStr for FilterOp {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterOp::ALL.into_iter().find(|o| o.as_str() == s).ok_or(())
    }
}

// =============================================================================
// Contract
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentArgs {
    pub aggregation: Aggregation,
    pub group_by: Vec<String>,
    pub filters: Vec<FilterClause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl Default for IntentArgs {
    fn default() -> Self {
        Self {
            aggregation: Aggregation::Sum,
            group_by: Vec::new(),
            filters: Vec::new(),
            column: None,
            limit: None,
        }
    }
}

/// A validated, defaulted routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentContract {
    pub intent: Intent,
    pub tool: Option<Tool>,
    pub args: IntentArgs,
    pub await_user: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
}

impl Violation {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "(root): {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Every rule a candidate broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("intent contract violated: {}", render(.0))]
pub struct ContractViolations(pub Vec<Violation>);

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ContractViolations {
    pub fn violations(&self) -> &[Violation] {
        &self.0
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.0.iter().any(|v| v.path == path)
    }

    /// One line per violation, for embedding in a re-prompt.
    pub fn feedback(&self) -> String {
        self.0
            .iter()
            .map(|v| format!("- {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn one_of<T: Copy>(values: &[T], as_str: fn(T) -> &'static str) -> String {
    values.iter().map(|v| as_str(*v)).collect::<Vec<_>>().join(", ")
}

/// Present and not null.
fn field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|v| !v.is_null())
}

/// Validate and default a recovered candidate.
pub fn validate_intent(candidate: &Value) -> Result<IntentContract, ContractViolations> {
    let Some(object) = candidate.as_object() else {
        return Err(ContractViolations(vec![Violation::new(
            "",
            "expected a JSON object",
        )]));
    };
    let mut violations = Vec::new();

    let intent = match field(object, "intent") {
        None => {
            violations.push(Violation::new("intent", "is required"));
            None
        }
        Some(value) => {
            let parsed = value.as_str().and_then(|s| s.trim().parse::<Intent>().ok());
            if parsed.is_none() {
                violations.push(Violation::new(
                    "intent",
                    format!("must be one of {}", one_of(&Intent::ALL, Intent::as_str)),
                ));
            }
            parsed
        }
    };

    // `Err(())` marks a tool value that was present but unusable.
    let tool: Result<Option<Tool>, ()> = match field(object, "tool") {
        None => Ok(None),
        Some(value) => match value.as_str().and_then(|s| s.trim().parse::<Tool>().ok()) {
            Some(tool) => Ok(Some(tool)),
            None => {
                violations.push(Violation::new(
                    "tool",
                    format!("must be null or one of {}", one_of(&Tool::ALL, Tool::as_str)),
                ));
                Err(())
            }
        },
    };

    let await_user = match field(object, "awaitUser") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            violations.push(Violation::new("awaitUser", "must be a boolean"));
            false
        }
    };

    let message = match field(object, "message") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            violations.push(Violation::new("message", "must be a string or null"));
            None
        }
    };

    let args = match field(object, "args") {
        None => IntentArgs::default(),
        Some(Value::Object(args)) => validate_args(args, &mut violations),
        Some(_) => {
            violations.push(Violation::new("args", "must be an object"));
            IntentArgs::default()
        }
    };

    // Cross-field rules run on defaulted values.
    if let (Some(intent), Ok(tool)) = (intent, tool) {
        let allowed = intent.allowed_tools();
        match tool {
            Some(tool) if allowed.is_empty() => violations.push(Violation::new(
                "tool",
                format!("must be null for intent {intent}, got {tool}"),
            )),
            Some(tool) if !allowed.contains(&tool) => violations.push(Violation::new(
                "tool",
                format!(
                    "{tool} is not allowed for intent {intent}; allowed: {}",
                    one_of(allowed, Tool::as_str)
                ),
            )),
            None if !allowed.is_empty() => violations.push(Violation::new(
                "tool",
                format!(
                    "is required for intent {intent}; allowed: {}",
                    one_of(allowed, Tool::as_str)
                ),
            )),
            _ => {}
        }
        if intent == Intent::AskClarify && !await_user {
            violations.push(Violation::new(
                "awaitUser",
                "must be true for intent ask_clarify",
            ));
        }
    }

    if !violations.is_empty() {
        return Err(ContractViolations(violations));
    }

    match (intent, tool) {
        (Some(intent), Ok(tool)) => Ok(IntentContract {
            intent,
            tool,
            args,
            await_user,
            message,
        }),
        _ => Err(ContractViolations(vec![Violation::new(
            "intent",
            "is required",
        )])),
    }
}

fn validate_args(args: &Map<String, Value>, violations: &mut Vec<Violation>) -> IntentArgs {
    let mut out = IntentArgs::default();

    if let Some(value) = field(args, "aggregation") {
        match value
            .as_str()
            .and_then(|s| s.trim().to_lowercase().parse::<Aggregation>().ok())
        {
            Some(aggregation) => out.aggregation = aggregation,
            None => violations.push(Violation::new(
                "args.aggregation",
                format!(
                    "must be one of {}",
                    one_of(&Aggregation::ALL, Aggregation::as_str)
                ),
            )),
        }
    }

    match field(args, "groupBy") {
        None => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                match item.as_str() {
                    Some(column) => out.group_by.push(column.to_string()),
                    None => violations.push(Violation::new(
                        format!("args.groupBy[{i}]"),
                        "must be a column name",
                    )),
                }
            }
        }
        Some(_) => violations.push(Violation::new("args.groupBy", "must be an array")),
    }

    match field(args, "filters") {
        None => {}
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if let Some(clause) = validate_filter(item, i, violations) {
                    out.filters.push(clause);
                }
            }
        }
        Some(_) => violations.push(Violation::new("args.filters", "must be an array")),
    }

    match field(args, "column") {
        None => {}
        Some(Value::String(column)) => out.column = Some(column.clone()),
        Some(_) => violations.push(Violation::new("args.column", "must be a string")),
    }

    match field(args, "limit") {
        None => {}
        Some(value) => match value.as_u64() {
            Some(limit) if limit > 0 => out.limit = Some(limit),
            _ => violations.push(Violation::new("args.limit", "must be a positive integer")),
        },
    }

    out
}

fn validate_filter(
    item: &Value,
    index: usize,
    violations: &mut Vec<Violation>,
) -> Option<FilterClause> {
    let path = format!("args.filters[{index}]");
    let Some(object) = item.as_object() else {
        violations.push(Violation::new(path, "must be an object"));
        return None;
    };

    let column = field(object, "column").and_then(Value::as_str);
    if column.is_none() {
        violations.push(Violation::new(format!("{path}.column"), "is required"));
    }
    let op = field(object, "op")
        .and_then(Value::as_str)
        .and_then(|s| s.trim().to_lowercase().parse::<FilterOp>().ok());
    if op.is_none() {
        violations.push(Violation::new(
            format!("{path}.op"),
            format!("must be one of {}", one_of(&FilterOp::ALL, FilterOp::as_str)),
        ));
    }
    let value = field(object, "value").cloned();
    if value.is_none() {
        violations.push(Violation::new(format!("{path}.value"), "is required"));
    }

    Some(FilterClause {
        column: column?.to_string(),
        op: op?,
        value: value?,
    })
}

// =============================================================================
// Routing loop
// =============================================================================

#[derive(Debug, Error)]
pub enum IntentRoutingError {
    #[error("intent routing cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(ProviderError),
    #[error(transparent)]
    Schema(#[from] DialectError),
    #[error("no valid intent after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl From<ProviderError> for IntentRoutingError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => IntentRoutingError::Cancelled,
            other => IntentRoutingError::Provider(other),
        }
    }
}

/// Ask the model to route `question`, re-prompting with the violations of
/// the previous answer until a valid contract comes back.
pub async fn route_intent(
    gateway: &dyn ChatGateway,
    retry: &RetryPolicy,
    model: &ChatModel,
    question: &str,
    columns: &[ColumnProfile],
    cancel_flag: Option<&AtomicBool>,
) -> Result<IntentContract, IntentRoutingError> {
    let schema = SchemaName::IntentContract.compiled()?;
    let mut feedback: Option<String> = None;

    for attempt in 1..=ROUTING_ATTEMPTS {
        if is_cancelled(cancel_flag) {
            return Err(IntentRoutingError::Cancelled);
        }

        let prompt = prompts::intent_prompt(question, columns, feedback.as_deref());
        let req = ChatRequest::new(
            model.clone(),
            prompt.to_messages(),
            Attribution::new("contract::route_intent"),
        )
        .schema(schema.clone());

        let resp = retry.chat(gateway, &req, cancel_flag).await?;

        let error = match recover_object(&resp.content) {
            Ok(object) => match validate_intent(&Value::Object(object)) {
                Ok(contract) => {
                    if attempt > 1 {
                        debug!(attempt, intent = %contract.intent, "intent recovered after re-prompt");
                    }
                    return Ok(contract);
                }
                Err(violations) => violations.feedback(),
            },
            Err(err) => err.to_string(),
        };

        warn!(attempt, error = %error, "intent contract rejected");
        feedback = Some(error);
    }

    Err(IntentRoutingError::Exhausted {
        attempts: ROUTING_ATTEMPTS,
        last_error: feedback.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aggregate_with_aggregate_tool_gets_defaults() {
        let contract = validate_intent(&json!({"intent": "aggregate", "tool": "csv.aggregate"}))
            .unwrap();
        assert_eq!(contract.intent, Intent::Aggregate);
        assert_eq!(contract.tool, Some(Tool::CsvAggregate));
        assert!(!contract.await_user);
        assert_eq!(contract.args, IntentArgs::default());
        assert_eq!(contract.args.aggregation, Aggregation::Sum);
        assert_eq!(contract.message, None);
    }

    #[test]
    fn tool_outside_matrix_is_rejected() {
        let err = validate_intent(&json!({"intent": "aggregate", "tool": "csv.profile"}))
            .unwrap_err();
        assert!(err.has_path("tool"));
        assert_eq!(err.violations().len(), 1);
    }

    #[test]
    fn ask_clarify_must_wait_for_the_user() {
        let err = validate_intent(&json!({"intent": "ask_clarify", "tool": null, "awaitUser": false}))
            .unwrap_err();
        assert!(err.has_path("awaitUser"));

        let defaulted = validate_intent(&json!({"intent": "ask_clarify"})).unwrap_err();
        assert!(defaulted.has_path("awaitUser"));
    }

    #[test]
    fn ask_clarify_must_not_name_a_tool() {
        let err = validate_intent(&json!({
            "intent": "ask_clarify",
            "tool": "csv.aggregate",
            "awaitUser": true
        }))
        .unwrap_err();
        assert!(err.has_path("tool"));
        assert!(!err.has_path("awaitUser"));

        let ok = validate_intent(&json!({
            "intent": "ask_clarify",
            "tool": null,
            "awaitUser": true,
            "message": "Which year?"
        }))
        .unwrap();
        assert_eq!(ok.tool, None);
        assert_eq!(ok.message.as_deref(), Some("Which year?"));
    }

    #[test]
    fn visualize_accepts_either_tool() {
        for tool in ["chart.render", "csv.aggregate"] {
            assert!(validate_intent(&json!({"intent": "visualize", "tool": tool})).is_ok());
        }
    }

    #[test]
    fn all_violations_are_enumerated() {
        let err = validate_intent(&json!({
            "intent": "summon",
            "tool": "csv.teleport",
            "awaitUser": "yes",
            "args": {
                "aggregation": "median",
                "groupBy": ["Region", 3],
                "filters": [{"column": "Region", "op": "like", "value": "EU"}],
                "limit": 0
            }
        }))
        .unwrap_err();

        for path in [
            "intent",
            "tool",
            "awaitUser",
            "args.aggregation",
            "args.groupBy[1]",
            "args.filters[0].op",
            "args.limit",
        ] {
            assert!(err.has_path(path), "missing violation at {path}: {err}");
        }
        assert!(err.feedback().lines().count() >= 7);
    }

    #[test]
    fn args_are_normalized() {
        let contract = validate_intent(&json!({
            "intent": "filter",
            "tool": "csv.filter",
            "args": {
                "aggregation": "AVG",
                "filters": [{"column": "Region", "op": "EQ", "value": "EU"}],
                "column": "Revenue",
                "limit": 5
            }
        }))
        .unwrap();
        assert_eq!(contract.args.aggregation, Aggregation::Avg);
        assert_eq!(contract.args.filters[0].op, FilterOp::Eq);
        assert_eq!(contract.args.limit, Some(5));
        assert!(contract.args.group_by.is_empty());
    }

    #[test]
    fn wire_shape_keeps_nulls() {
        let contract = validate_intent(&json!({"intent": "profile", "tool": "csv.profile"})).unwrap();
        let wire = serde_json::to_value(&contract).unwrap();
        assert_eq!(
            wire,
            json!({
                "intent": "profile",
                "tool": "csv.profile",
                "args": {"aggregation": "sum", "groupBy": [], "filters": []},
                "awaitUser": false,
                "message": null
            })
        );
    }

    #[test]
    fn non_object_is_a_root_violation() {
        let err = validate_intent(&json!([1, 2])).unwrap_err();
        assert_eq!(err.violations()[0].path, "");
    }
}
