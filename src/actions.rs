//! Action envelopes: the typed stream a conversational turn produces.
//!
//! On the wire an envelope is a flat object with a `type` tag and one slot
//! per payload kind. Every slot is present; all but the one matching `type`
//! are null. Inside the crate an envelope is just an enum, and the wire
//! shape only exists in [`ActionEnvelope::to_wire`] / [`ActionEnvelope::from_wire`].

use std::str::FromStr;
use std::sync::atomic::AtomicBool;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};
use crate::plan::{validate_plan, AnalysisPlan, ColumnProfile, PlanIssue, DEFAULT_MIN_DESCRIPTION_LEN};
use crate::recovery::{recover_array, recover_object, RecoveryError};
use crate::retry::RetryPolicy;
use crate::schema::{DialectError, SchemaName};

/// Wire payload slots, in wire order.
pub const PAYLOAD_SLOTS: [&str; 8] = [
    "planState",
    "text",
    "awaitUserPayload",
    "plan",
    "domAction",
    "code",
    "args",
    "clarification",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    PlanStateUpdate,
    TextResponse,
    AwaitUser,
    PlanCreation,
    DomAction,
    ExecuteJsCode,
    ProceedToAnalysis,
    FilterSpreadsheet,
    ClarificationRequest,
}

impl ActionType {
    pub const ALL: [ActionType; 9] = [
        ActionType::PlanStateUpdate,
        ActionType::TextResponse,
        ActionType::AwaitUser,
        ActionType::PlanCreation,
        ActionType::DomAction,
        ActionType::ExecuteJsCode,
        ActionType::ProceedToAnalysis,
        ActionType::FilterSpreadsheet,
        ActionType::ClarificationRequest,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::PlanStateUpdate => "plan_state_update",
            ActionType::TextResponse => "text_response",
            ActionType::AwaitUser => "await_user",
            ActionType::PlanCreation => "plan_creation",
            ActionType::DomAction => "dom_action",
            ActionType::ExecuteJsCode => "execute_js_code",
            ActionType::ProceedToAnalysis => "proceed_to_analysis",
            ActionType::FilterSpreadsheet => "filter_spreadsheet",
            ActionType::ClarificationRequest => "clarification_request",
        }
    }

    /// The wire slot carrying this type's payload.
    pub fn payload_key(self) -> &'static str {
        match self {
            ActionType::PlanStateUpdate => "planState",
            ActionType::TextResponse => "text",
            ActionType::AwaitUser => "awaitUserPayload",
            ActionType::PlanCreation => "plan",
            ActionType::DomAction => "domAction",
            ActionType::ExecuteJsCode => "code",
            ActionType::ProceedToAnalysis | ActionType::FilterSpreadsheet => "args",
            ActionType::ClarificationRequest => "clarification",
        }
    }
}

impl FromStr for ActionType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL.into_iter().find(|t| t.as_str() == s).ok_or(())
    }
}

/// Card-level operations the host UI exposes to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DomTool {
    HighlightCard,
    ClearHighlight,
    ChangeCardChartType,
    ShowCardData,
    FilterCard,
}

impl DomTool {
    pub const ALL: [DomTool; 5] = [
        DomTool::HighlightCard,
        DomTool::ClearHighlight,
        DomTool::ChangeCardChartType,
        DomTool::ShowCardData,
        DomTool::FilterCard,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DomTool::HighlightCard => "highlightCard",
            DomTool::ClearHighlight => "clearHighlight",
            DomTool::ChangeCardChartType => "changeCardChartType",
            DomTool::ShowCardData => "showCardData",
            DomTool::FilterCard => "filterCard",
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanState {
    pub goal: String,
    pub progress: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitUserPayload {
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomAction {
    pub tool_name: DomTool,
    pub card_title: String,
    #[serde(default)]
    pub target_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePayload {
    pub explanation: String,
    pub js_function_body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisArgs {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    pub options: Vec<ClarificationOption>,
}

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ActionEnvelope {
    PlanStateUpdate(PlanState),
    TextResponse(String),
    AwaitUser(AwaitUserPayload),
    PlanCreation(AnalysisPlan),
    DomAction(DomAction),
    ExecuteJsCode(CodePayload),
    ProceedToAnalysis(AnalysisArgs),
    FilterSpreadsheet(AnalysisArgs),
    ClarificationRequest(Clarification),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope is not a JSON object")]
    NotAnObject,
    #[error("envelope has no 'type' tag")]
    MissingType,
    #[error("unknown action type '{0}'")]
    UnknownType(String),
    #[error("{action} requires a non-null '{slot}' payload")]
    MissingPayload {
        action: &'static str,
        slot: &'static str,
    },
    #[error("{action} must leave '{slot}' null")]
    ForeignPayload {
        action: &'static str,
        slot: &'static str,
    },
    #[error("invalid '{slot}' payload for {action}: {message}")]
    Payload {
        action: &'static str,
        slot: &'static str,
        message: String,
    },
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanIssue),
}

impl ActionEnvelope {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionEnvelope::PlanStateUpdate(_) => ActionType::PlanStateUpdate,
            ActionEnvelope::TextResponse(_) => ActionType::TextResponse,
            ActionEnvelope::AwaitUser(_) => ActionType::AwaitUser,
            ActionEnvelope::PlanCreation(_) => ActionType::PlanCreation,
            ActionEnvelope::DomAction(_) => ActionType::DomAction,
            ActionEnvelope::ExecuteJsCode(_) => ActionType::ExecuteJsCode,
            ActionEnvelope::ProceedToAnalysis(_) => ActionType::ProceedToAnalysis,
            ActionEnvelope::FilterSpreadsheet(_) => ActionType::FilterSpreadsheet,
            ActionEnvelope::ClarificationRequest(_) => ActionType::ClarificationRequest,
        }
    }

    fn payload(&self) -> Value {
        let value = match self {
            ActionEnvelope::PlanStateUpdate(p) => serde_json::to_value(p),
            ActionEnvelope::TextResponse(text) => Ok(Value::String(text.clone())),
            ActionEnvelope::AwaitUser(p) => serde_json::to_value(p),
            ActionEnvelope::PlanCreation(p) => serde_json::to_value(p),
            ActionEnvelope::DomAction(p) => serde_json::to_value(p),
            ActionEnvelope::ExecuteJsCode(p) => serde_json::to_value(p),
            ActionEnvelope::ProceedToAnalysis(p) | ActionEnvelope::FilterSpreadsheet(p) => {
                serde_json::to_value(p)
            }
            ActionEnvelope::ClarificationRequest(p) => serde_json::to_value(p),
        };
        // Plain structs with string keys always serialize.
        value.unwrap_or(Value::Null)
    }

    /// Wire form: the tag plus every slot, unused slots null.
    pub fn to_wire(&self) -> Value {
        let action = self.action_type();
        let mut object = Map::new();
        object.insert("type".into(), Value::String(action.as_str().into()));
        for slot in PAYLOAD_SLOTS {
            object.insert(slot.into(), Value::Null);
        }
        object.insert(action.payload_key().into(), self.payload());
        Value::Object(object)
    }

    /// Decode one wire envelope. Plans are validated against `columns`.
    pub fn from_wire(value: &Value, columns: &[ColumnProfile]) -> Result<Self, EnvelopeError> {
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;
        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?;
        let action: ActionType = tag
            .trim()
            .parse()
            .map_err(|_| EnvelopeError::UnknownType(tag.to_string()))?;
        let slot = action.payload_key();

        if let Some(foreign) = PAYLOAD_SLOTS
            .into_iter()
            .filter(|s| *s != slot)
            .find(|s| object.get(*s).is_some_and(|v| !v.is_null()))
        {
            return Err(EnvelopeError::ForeignPayload {
                action: action.as_str(),
                slot: foreign,
            });
        }

        let payload = object
            .get(slot)
            .filter(|v| !v.is_null())
            .ok_or(EnvelopeError::MissingPayload {
                action: action.as_str(),
                slot,
            })?;

        let envelope = match action {
            ActionType::PlanStateUpdate => ActionEnvelope::PlanStateUpdate(typed(action, payload)?),
            ActionType::TextResponse => ActionEnvelope::TextResponse(typed(action, payload)?),
            ActionType::AwaitUser => ActionEnvelope::AwaitUser(typed(action, payload)?),
            ActionType::PlanCreation => ActionEnvelope::PlanCreation(validate_plan(
                payload,
                columns,
                DEFAULT_MIN_DESCRIPTION_LEN,
            )?),
            ActionType::DomAction => ActionEnvelope::DomAction(typed(action, payload)?),
            ActionType::ExecuteJsCode => ActionEnvelope::ExecuteJsCode(typed(action, payload)?),
            ActionType::ProceedToAnalysis => {
                ActionEnvelope::ProceedToAnalysis(typed(action, payload)?)
            }
            ActionType::FilterSpreadsheet => {
                ActionEnvelope::FilterSpreadsheet(typed(action, payload)?)
            }
            ActionType::ClarificationRequest => {
                ActionEnvelope::ClarificationRequest(typed(action, payload)?)
            }
        };
        Ok(envelope)
    }
}

fn typed<T: DeserializeOwned>(action: ActionType, payload: &Value) -> Result<T, EnvelopeError> {
    T::deserialize(payload).map_err(|e| EnvelopeError::Payload {
        action: action.as_str(),
        slot: action.payload_key(),
        message: e.to_string(),
    })
}

// =============================================================================
// Batches
// =============================================================================

/// One model turn: optional reasoning plus the ordered envelopes.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBatch {
    pub thinking: Option<String>,
    pub actions: Vec<ActionEnvelope>,
}

impl ActionBatch {
    pub fn to_wire(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "thinking".into(),
            self.thinking.clone().map(Value::String).unwrap_or(Value::Null),
        );
        object.insert(
            "actions".into(),
            Value::Array(self.actions.iter().map(ActionEnvelope::to_wire).collect()),
        );
        Value::Object(object)
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action request cancelled")]
    Cancelled,
    #[error(transparent)]
    Provider(ProviderError),
    #[error(transparent)]
    Schema(#[from] DialectError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("response contained no actions")]
    Empty,
    #[error("action {index}: {source}")]
    Envelope {
        index: usize,
        #[source]
        source: EnvelopeError,
    },
}

impl From<ProviderError> for ActionError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => ActionError::Cancelled,
            other => ActionError::Provider(other),
        }
    }
}

/// Decode a raw model response into an [`ActionBatch`].
///
/// Accepts `{ "thinking": ..., "actions": [...] }`, a bare array of
/// envelopes, or a single envelope object, each possibly wrapped in prose.
pub fn decode_action_response(
    raw: &str,
    columns: &[ColumnProfile],
) -> Result<ActionBatch, ActionError> {
    let recovered = recover_object(raw);

    let (thinking, items) = match recovered {
        Ok(ref object) if object.get("actions").is_some_and(Value::is_array) => {
            let thinking = object
                .get("thinking")
                .and_then(Value::as_str)
                .map(str::to_string);
            let items = object
                .get("actions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            (thinking, items)
        }
        _ => match recover_array(raw) {
            Ok(items) => (None, items),
            Err(err) => match recovered {
                Ok(object) if object.contains_key("type") => (None, vec![Value::Object(object)]),
                _ => return Err(err.into()),
            },
        },
    };

    if items.is_empty() {
        return Err(ActionError::Empty);
    }

    let actions = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            ActionEnvelope::from_wire(item, columns)
                .map_err(|source| ActionError::Envelope { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ActionBatch { thinking, actions })
}

/// One round-trip to the model with the action schema attached.
pub async fn request_actions(
    gateway: &dyn ChatGateway,
    retry: &RetryPolicy,
    model: &ChatModel,
    messages: Vec<Message>,
    columns: &[ColumnProfile],
    cancel_flag: Option<&AtomicBool>,
) -> Result<ActionBatch, ActionError> {
    let schema = SchemaName::ActionResponse.compiled()?;
    let req = ChatRequest::new(
        model.clone(),
        messages,
        Attribution::new("actions::request_actions"),
    )
    .schema(schema);

    let resp = retry.chat(gateway, &req, cancel_flag).await?;
    let batch = decode_action_response(&resp.content, columns)?;
    debug!(actions = batch.actions.len(), "decoded action batch");
    Ok(batch)
}
