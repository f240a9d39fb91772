//! Chart plans: the typed model, normalization and structural validation.
//!
//! Model output is normalized before it is judged: string fields are
//! trimmed, empty strings and nulls count as absent, and enum-valued fields
//! are lowercased. A missing `groupByColumn` is inferred from the column
//! profile where the chart type allows it. Only then are the per-chart-type
//! field requirements checked.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Minimum description length applied when no configuration says otherwise.
pub const DEFAULT_MIN_DESCRIPTION_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Doughnut,
    Scatter,
    Combo,
}

impl ChartType {
    pub const ALL: [ChartType; 6] = [
        ChartType::Bar,
        ChartType::Line,
        ChartType::Pie,
        ChartType::Doughnut,
        ChartType::Scatter,
        ChartType::Combo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Pie => "pie",
            ChartType::Doughnut => "doughnut",
            ChartType::Scatter => "scatter",
            ChartType::Combo => "combo",
        }
    }

    /// Whether a missing `groupByColumn` may be inferred for this chart type.
    pub fn infers_group_by(self) -> bool {
        !matches!(self, ChartType::Scatter | ChartType::Combo)
    }
}

impl FromStr for ChartType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChartType::ALL.into_iter().find(|t| t.as_str() == s).ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
}

impl Aggregation {
    pub const ALL: [Aggregation; 3] = [Aggregation::Sum, Aggregation::Count, Aggregation::Avg];

    pub fn as_str(self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::Avg => "avg",
        }
    }
}

impl FromStr for Aggregation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Aggregation::ALL.into_iter().find(|a| a.as_str() == s).ok_or(())
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated chart descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPlan {
    pub chart_type: ChartType,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_value_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_value_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_value_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_aggregation: Option<Aggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_top_n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_hide_others: Option<bool>,
}

/// Column semantic type, as produced by the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Numerical,
    Categorical,
    Date,
    Time,
    Currency,
    Percentage,
}

impl ColumnKind {
    /// Columns that make sense on a category axis.
    pub fn is_dimension(self) -> bool {
        matches!(self, ColumnKind::Categorical | ColumnKind::Date | ColumnKind::Time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnKind,
}

impl ColumnProfile {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Why a candidate plan was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanIssue {
    #[error("plan is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unknown chart type '{0}'")]
    UnknownChartType(String),
    #[error("aggregation '{0}' is not one of sum, count, avg")]
    InvalidAggregation(String),
    #[error("description has {len} characters, at least {min} required")]
    DescriptionTooShort { len: usize, min: usize },
    #[error("malformed plan: {0}")]
    Malformed(String),
}

const STRING_FIELDS: &[&str] = &[
    "chartType",
    "title",
    "description",
    "aggregation",
    "groupByColumn",
    "valueColumn",
    "xValueColumn",
    "yValueColumn",
    "secondaryValueColumn",
    "secondaryAggregation",
];

const LOWERCASED_FIELDS: &[&str] = &["chartType", "aggregation", "secondaryAggregation"];

/// Trim strings, drop nulls and empty strings, lowercase enum fields.
pub fn normalize_plan(raw: &Map<String, Value>) -> Map<String, Value> {
    raw.iter()
        .filter_map(|(key, value)| {
            let value = match value {
                Value::Null => return None,
                Value::String(s) if STRING_FIELDS.contains(&key.as_str()) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        return None;
                    }
                    if LOWERCASED_FIELDS.contains(&key.as_str()) {
                        Value::String(trimmed.to_lowercase())
                    } else {
                        Value::String(trimmed.to_string())
                    }
                }
                other => other.clone(),
            };
            Some((key.clone(), value))
        })
        .collect()
}

/// Pick a grouping column for a plan that did not name one.
///
/// First dimension column other than the value column, then the first
/// dimension column, then any column other than the value column.
pub fn infer_group_by<'a>(
    value_column: Option<&str>,
    columns: &'a [ColumnProfile],
) -> Option<&'a str> {
    let not_value = |c: &&ColumnProfile| Some(c.name.as_str()) != value_column;
    columns
        .iter()
        .filter(|c| c.kind.is_dimension())
        .find(not_value)
        .or_else(|| columns.iter().find(|c| c.kind.is_dimension()))
        .or_else(|| columns.iter().find(not_value))
        .map(|c| c.name.as_str())
}

/// Normalize, infer and validate one candidate.
///
/// Column names are not checked against the profile; the executor reports
/// unknown columns as zero-row results.
pub fn validate_plan(
    raw: &Value,
    columns: &[ColumnProfile],
    min_description_len: usize,
) -> Result<AnalysisPlan, PlanIssue> {
    let object = raw.as_object().ok_or(PlanIssue::NotAnObject)?;
    let mut plan = normalize_plan(object);

    let chart_type = match plan.get("chartType") {
        None => return Err(PlanIssue::MissingField("chartType")),
        Some(Value::String(s)) => s
            .parse::<ChartType>()
            .map_err(|_| PlanIssue::UnknownChartType(s.clone()))?,
        Some(other) => return Err(PlanIssue::UnknownChartType(other.to_string())),
    };

    if !plan.contains_key("title") {
        return Err(PlanIssue::MissingField("title"));
    }

    let description_len = plan
        .get("description")
        .and_then(Value::as_str)
        .map(|s| s.chars().count())
        .unwrap_or(0);
    if description_len < min_description_len {
        return Err(PlanIssue::DescriptionTooShort {
            len: description_len,
            min: min_description_len,
        });
    }

    for key in ["aggregation", "secondaryAggregation"] {
        if let Some(value) = plan.get(key) {
            let known = value
                .as_str()
                .map(|s| s.parse::<Aggregation>().is_ok())
                .unwrap_or(false);
            if !known {
                let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                return Err(PlanIssue::InvalidAggregation(shown));
            }
        }
    }

    if chart_type.infers_group_by() && !plan.contains_key("groupByColumn") {
        let value_column = plan.get("valueColumn").and_then(Value::as_str);
        if let Some(inferred) = infer_group_by(value_column, columns) {
            plan.insert("groupByColumn".into(), Value::String(inferred.to_string()));
        }
    }

    if chart_type == ChartType::Scatter {
        require(&plan, "xValueColumn")?;
        require(&plan, "yValueColumn")?;
    } else {
        require(&plan, "aggregation")?;
        require(&plan, "groupByColumn")?;
        let is_count = plan.get("aggregation").and_then(Value::as_str) == Some("count");
        if !is_count {
            require(&plan, "valueColumn")?;
        }
    }

    serde_json::from_value(Value::Object(plan)).map_err(|e| PlanIssue::Malformed(e.to_string()))
}

fn require(plan: &Map<String, Value>, field: &'static str) -> Result<(), PlanIssue> {
    if plan.contains_key(field) {
        Ok(())
    } else {
        Err(PlanIssue::MissingField(field))
    }
}

/// Refinement responses may nest each plan as `{ "plan": {...} }`.
pub fn unwrap_plan(value: Value) -> Value {
    match value {
        Value::Object(mut object) if !object.contains_key("chartType") => {
            match object.remove("plan") {
                Some(inner @ Value::Object(_)) => inner,
                Some(other) => {
                    object.insert("plan".into(), other);
                    Value::Object(object)
                }
                None => Value::Object(object),
            }
        }
        other => other,
    }
}
