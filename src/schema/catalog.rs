//! Canonical response schemas used by the pipelines.
//!
//! Every schema is compiled into both dialects at most once per process and
//! shared through an `Arc`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};

use super::{DialectError, PathPolicies, ResponseSchema, SchemaKind, SchemaNode};
use crate::actions::{ActionType, DomTool};
use crate::contract::{FilterOp, Intent, Tool};
use crate::plan::{Aggregation, ChartType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaName {
    ActionResponse,
    PlanList,
    RefinedPlans,
    IntentContract,
    DataTransform,
    FilterFunction,
}

static COMPILED: Lazy<[OnceCell<Arc<ResponseSchema>>; 6]> = Lazy::new(Default::default);

impl SchemaName {
    pub const ALL: [SchemaName; 6] = [
        SchemaName::ActionResponse,
        SchemaName::PlanList,
        SchemaName::RefinedPlans,
        SchemaName::IntentContract,
        SchemaName::DataTransform,
        SchemaName::FilterFunction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SchemaName::ActionResponse => "action_response",
            SchemaName::PlanList => "plan_list",
            SchemaName::RefinedPlans => "refined_plans",
            SchemaName::IntentContract => "intent_contract",
            SchemaName::DataTransform => "data_transform",
            SchemaName::FilterFunction => "filter_function",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }

    /// Canonical tree for this schema.
    pub fn tree(self) -> SchemaNode {
        match self {
            SchemaName::ActionResponse => action_response(),
            SchemaName::PlanList => SchemaNode::object([(
                "plans",
                SchemaNode::array(plan_node()).min_items(1),
            )])
            .require(&["plans"]),
            SchemaName::RefinedPlans => SchemaNode::object([(
                "plans",
                SchemaNode::array(
                    SchemaNode::object([
                        ("plan", plan_node()),
                        (
                            "rationale",
                            SchemaNode::string().describe("Why this view is worth keeping."),
                        ),
                    ])
                    .require(&["plan"]),
                ),
            )])
            .require(&["plans"]),
            SchemaName::IntentContract => intent_contract(),
            SchemaName::DataTransform => transform_node().require(&["explanation"]),
            SchemaName::FilterFunction => {
                transform_node().require(&["explanation", "jsFunctionBody"])
            }
        }
    }

    /// Policy sets for this schema.
    ///
    /// Every object is closed and lists all of its properties as required in
    /// the JSON Schema dialect; properties the canonical tree leaves optional
    /// become nullable so the model can still omit them by emitting `null`.
    pub fn policies(self) -> PathPolicies {
        strict_policies(&self.tree())
    }

    /// Both dialects, compiled on first use.
    pub fn compiled(self) -> Result<Arc<ResponseSchema>, DialectError> {
        COMPILED[self.slot()]
            .get_or_try_init(|| {
                let tree = self.tree();
                ResponseSchema::compile(self.as_str(), &tree, &strict_policies(&tree)).map(Arc::new)
            })
            .cloned()
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchemaName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = SchemaName::ALL.iter().map(|n| n.as_str()).collect();
                format!("unknown schema '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

fn strict_policies(tree: &SchemaNode) -> PathPolicies {
    let mut objects = Vec::new();
    let mut optional = Vec::new();
    for path in tree.paths() {
        let Some(node) = tree.at(&path) else { continue };
        if node.kind != SchemaKind::Object {
            continue;
        }
        optional.extend(
            node.properties
                .iter()
                .filter(|(name, _)| !node.required.contains(name))
                .map(|(name, _)| super::property_path(&path, name)),
        );
        objects.push(path);
    }
    PathPolicies::new()
        .with_closed(objects.clone())
        .with_all_required(objects)
        .with_nullable(optional)
}

fn names<T: Copy>(all: &[T], as_str: fn(T) -> &'static str) -> Vec<&'static str> {
    all.iter().map(|v| as_str(*v)).collect()
}

fn plan_node() -> SchemaNode {
    let aggregations = names(&Aggregation::ALL, Aggregation::as_str);
    SchemaNode::object([
        (
            "chartType",
            SchemaNode::enumeration(names(&ChartType::ALL, ChartType::as_str)),
        ),
        ("title", SchemaNode::string().min_length(1)),
        (
            "description",
            SchemaNode::string()
                .min_length(10)
                .describe("One or two sentences on what the chart reveals."),
        ),
        ("aggregation", SchemaNode::enumeration(aggregations.clone())),
        ("groupByColumn", SchemaNode::string()),
        ("valueColumn", SchemaNode::string()),
        ("xValueColumn", SchemaNode::string().describe("Scatter only.")),
        ("yValueColumn", SchemaNode::string().describe("Scatter only.")),
        (
            "secondaryValueColumn",
            SchemaNode::string().describe("Combo charts: the line series."),
        ),
        ("secondaryAggregation", SchemaNode::enumeration(aggregations)),
        ("defaultTopN", SchemaNode::integer()),
        ("defaultHideOthers", SchemaNode::boolean()),
    ])
    .require(&["chartType", "title", "description"])
}

fn transform_node() -> SchemaNode {
    SchemaNode::object([
        ("explanation", SchemaNode::string()),
        (
            "jsFunctionBody",
            SchemaNode::string()
                .describe("Body of a function (data, _util) returning an array of row objects."),
        ),
    ])
}

fn action_response() -> SchemaNode {
    let string_list = || SchemaNode::array(SchemaNode::string());
    let envelope = SchemaNode::object([
        (
            "type",
            SchemaNode::enumeration(names(&ActionType::ALL, ActionType::as_str)),
        ),
        (
            "planState",
            SchemaNode::object([
                ("goal", SchemaNode::string()),
                ("progress", SchemaNode::string()),
                ("nextSteps", string_list()),
            ])
            .require(&["goal", "progress", "nextSteps"]),
        ),
        ("text", SchemaNode::string()),
        (
            "awaitUserPayload",
            SchemaNode::object([("prompt", SchemaNode::string()), ("options", string_list())])
                .require(&["prompt"]),
        ),
        ("plan", plan_node()),
        (
            "domAction",
            SchemaNode::object([
                (
                    "toolName",
                    SchemaNode::enumeration(names(&DomTool::ALL, DomTool::as_str)),
                ),
                ("cardTitle", SchemaNode::string()),
                ("targetValue", SchemaNode::string()),
            ])
            .require(&["toolName", "cardTitle"]),
        ),
        (
            "code",
            SchemaNode::object([
                ("explanation", SchemaNode::string()),
                ("jsFunctionBody", SchemaNode::string()),
            ])
            .require(&["explanation", "jsFunctionBody"]),
        ),
        (
            "args",
            SchemaNode::object([("query", SchemaNode::string())]).require(&["query"]),
        ),
        (
            "clarification",
            SchemaNode::object([
                ("question", SchemaNode::string()),
                (
                    "options",
                    SchemaNode::array(
                        SchemaNode::object([
                            ("label", SchemaNode::string()),
                            ("value", SchemaNode::string()),
                        ])
                        .require(&["label", "value"]),
                    ),
                ),
            ])
            .require(&["question", "options"]),
        ),
    ])
    .require(&["type"]);

    SchemaNode::object([
        (
            "thinking",
            SchemaNode::string().describe("Short reasoning shown to the user."),
        ),
        ("actions", SchemaNode::array(envelope).min_items(1)),
    ])
    .require(&["actions"])
}

fn intent_contract() -> SchemaNode {
    let filter = SchemaNode::object([
        ("column", SchemaNode::string()),
        (
            "op",
            SchemaNode::enumeration(names(&FilterOp::ALL, FilterOp::as_str)),
        ),
        ("value", SchemaNode::string()),
    ])
    .require(&["column", "op", "value"]);

    SchemaNode::object([
        (
            "intent",
            SchemaNode::enumeration(names(&Intent::ALL, Intent::as_str)),
        ),
        (
            "tool",
            SchemaNode::enumeration(names(&Tool::ALL, Tool::as_str)),
        ),
        (
            "args",
            SchemaNode::object([
                (
                    "aggregation",
                    SchemaNode::enumeration(names(&Aggregation::ALL, Aggregation::as_str)),
                ),
                ("groupBy", SchemaNode::array(SchemaNode::string())),
                ("filters", SchemaNode::array(filter)),
                ("column", SchemaNode::string()),
                ("limit", SchemaNode::integer()),
            ]),
        ),
        ("awaitUser", SchemaNode::boolean()),
        ("message", SchemaNode::string()),
    ])
    .require(&["intent"])
}
