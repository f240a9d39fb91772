use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use async_trait::async_trait;
use insight_harness::contract::{
    route_intent, validate_intent, Intent, IntentRoutingError, Tool, ROUTING_ATTEMPTS,
};
use insight_harness::gateway::{ChatGateway, ChatModel, ChatRequest, ChatResponse, ProviderError};
use insight_harness::plan::{Aggregation, ColumnKind, ColumnProfile};
use insight_harness::RetryPolicy;
use serde_json::json;

struct ScriptedGateway {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        assert_eq!(req.attribution.caller, "contract::route_intent");
        self.prompts.lock().unwrap().push(req.prompt_text());
        let next = self.replies.lock().unwrap().pop_front();
        next.map(ChatResponse::text)
            .ok_or_else(|| ProviderError::invalid_request("script exhausted"))
    }
}

fn columns() -> Vec<ColumnProfile> {
    vec![
        ColumnProfile::new("Region", ColumnKind::Categorical),
        ColumnProfile::new("Revenue", ColumnKind::Currency),
    ]
}

async fn route(gateway: &ScriptedGateway, question: &str) -> Result<insight_harness::IntentContract, IntentRoutingError> {
    route_intent(
        gateway,
        &RetryPolicy::once(),
        &ChatModel::openai("gpt-4o-mini"),
        question,
        &columns(),
        None,
    )
    .await
}

#[test]
fn aggregate_contract_is_defaulted() {
    let contract = validate_intent(&json!({"intent": "aggregate", "tool": "csv.aggregate"})).unwrap();
    assert_eq!(contract.tool, Some(Tool::CsvAggregate));
    assert_eq!(contract.args.aggregation, Aggregation::Sum);
    assert!(contract.args.group_by.is_empty());
    assert!(contract.args.filters.is_empty());
    assert!(!contract.await_user);
}

#[test]
fn mismatched_tool_is_a_tool_violation() {
    let err = validate_intent(&json!({"intent": "aggregate", "tool": "csv.profile"})).unwrap_err();
    assert!(err.has_path("tool"));
}

#[test]
fn clarification_without_waiting_is_rejected() {
    let err = validate_intent(&json!({"intent": "ask_clarify", "tool": null, "awaitUser": false}))
        .unwrap_err();
    assert!(err.has_path("awaitUser"));
    assert!(!err.has_path("tool"));
}

#[test]
fn unknown_intent_is_rejected() {
    let err = validate_intent(&json!({"intent": "summarize", "tool": "csv.profile"})).unwrap_err();
    assert!(err.has_path("intent"));
}

#[test]
fn every_violation_is_reported_at_once() {
    let err = validate_intent(&json!({
        "intent": "filter",
        "tool": "csv.filter",
        "awaitUser": "yes",
        "args": { "limit": -3, "filters": [{ "column": "Region", "op": "like" }] }
    }))
    .unwrap_err();

    for path in [
        "awaitUser",
        "args.limit",
        "args.filters[0].op",
        "args.filters[0].value",
    ] {
        assert!(err.has_path(path), "missing violation at {path}");
    }
    assert_eq!(err.feedback().lines().count(), err.violations().len());
}

#[tokio::test]
async fn violations_are_fed_back_into_the_second_prompt() {
    let gateway = ScriptedGateway::new(&[
        r#"{"intent": "aggregate", "tool": "csv.profile", "args": {"groupBy": ["Region"]}}"#,
        r#"```json
{"intent": "aggregate", "tool": "csv.aggregate", "args": {"groupBy": ["Region"], "column": "Revenue"}}
```"#,
    ]);

    let contract = route(&gateway, "total revenue per region").await.unwrap();
    assert_eq!(contract.intent, Intent::Aggregate);
    assert_eq!(contract.args.group_by, ["Region"]);
    assert_eq!(contract.args.column.as_deref(), Some("Revenue"));

    let prompts = gateway.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("<violations>"));
    assert!(prompts[1].contains("<violations>"));
    assert!(prompts[1].contains("csv.profile is not allowed for intent aggregate"));
}

#[tokio::test]
async fn valid_first_answer_needs_one_call() {
    let gateway = ScriptedGateway::new(&[
        r#"{"intent": "ask_clarify", "tool": null, "awaitUser": true, "message": "Which year?"}"#,
    ]);

    let contract = route(&gateway, "how did we do").await.unwrap();
    assert_eq!(contract.intent, Intent::AskClarify);
    assert_eq!(contract.tool, None);
    assert_eq!(contract.message.as_deref(), Some("Which year?"));
    assert_eq!(gateway.prompts().len(), 1);
}

#[tokio::test]
async fn unrecoverable_answers_exhaust_the_loop() {
    let gateway = ScriptedGateway::new(&["no idea", r#"{"intent": "visualize"}"#]);

    let err = route(&gateway, "plot revenue").await.unwrap_err();
    match err {
        IntentRoutingError::Exhausted {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, ROUTING_ATTEMPTS);
            assert!(last_error.contains("is required for intent visualize"));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }

    let prompts = gateway.prompts();
    assert!(prompts[1].contains("no JSON object could be recovered"));
}

#[tokio::test]
async fn provider_errors_are_not_reprompted() {
    let gateway = ScriptedGateway::new(&[]);
    let err = route(&gateway, "anything").await.unwrap_err();
    assert!(matches!(err, IntentRoutingError::Provider(ProviderError::InvalidRequest { .. })));
    assert_eq!(gateway.prompts().len(), 1);
}

#[tokio::test]
async fn raised_flag_stops_routing() {
    let gateway = ScriptedGateway::new(&[r#"{"intent": "profile", "tool": "csv.profile"}"#]);
    let flag = AtomicBool::new(true);

    let err = route_intent(
        &gateway,
        &RetryPolicy::once(),
        &ChatModel::gemini("gemini-2.5-flash"),
        "profile this",
        &columns(),
        Some(&flag),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, IntentRoutingError::Cancelled));
    assert!(gateway.prompts().is_empty());
}
