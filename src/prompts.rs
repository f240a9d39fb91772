//! Prompt templates for plan, transform and intent generation.
//!
//! Only the structure the pipelines depend on lives here: where the column
//! profile, the sample rows and the feedback from a failed attempt go.

use serde_json::Value;

use crate::correction::TransformKind;
use crate::gateway::Message;
use crate::plan::{AnalysisPlan, ColumnProfile};
use crate::Row;

/// Sample rows shown to the model in generation prompts.
pub const PROMPT_SAMPLE_ROWS: usize = 5;

/// Result rows shown per plan in the refinement prompt.
pub const PROMPT_RESULT_ROWS: usize = 10;

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute `vars` into both halves. Values are inserted verbatim;
    /// callers escape anything user-supplied.
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        let fill = |text: &str| {
            vars.iter()
                .fold(text.to_string(), |acc, (key, value)| {
                    acc.replace(&format!("{{{key}}}"), value)
                })
                .trim()
                .to_string()
        };
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill(self.system),
            user: fill(self.user),
        }
    }
}

fn render_columns(columns: &[ColumnProfile]) -> String {
    columns
        .iter()
        .map(|c| {
            let kind = serde_json::to_value(c.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("- {} ({kind})", escape_xml_chars(&c.name))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_rows<T: serde::Serialize>(rows: &[T], limit: usize) -> String {
    rows.iter()
        .take(limit)
        .filter_map(|row| serde_json::to_string(row).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Feedback block for a re-prompt; empty on the first attempt.
fn feedback_block(tag: &str, feedback: Option<&str>) -> String {
    match feedback {
        Some(text) => format!(
            "<{tag}>\n{}\n</{tag}>\nYour previous answer was rejected for the reason above. Fix it.",
            escape_xml_chars(text.trim())
        ),
        None => String::new(),
    }
}

// =============================================================================
// Plan generation
// =============================================================================

pub const PLAN_GENERATION: PromptTemplate = PromptTemplate {
    slug: "plan_generation_v1",
    system: r#"You are a data analyst proposing charts for a spreadsheet.
Each plan names a chartType (bar, line, pie, doughnut, scatter, combo), a short title and a description of at least ten characters.
Scatter plans set xValueColumn and yValueColumn. Every other plan sets aggregation (sum, count or avg) and groupByColumn, and valueColumn unless aggregation is count.
Only use column names from the profile. Return only JSON: {"plans": [...]}."#,
    user: r#"<columns>
{columns}
</columns>

<sample_rows>
{sample}
</sample_rows>

Propose {count} distinct chart plans."#,
};

pub fn plan_generation_prompt(
    columns: &[ColumnProfile],
    sample: &[Row],
    count: usize,
) -> PromptInstance {
    let columns = render_columns(columns);
    let sample = escape_xml_chars(&render_rows(sample, PROMPT_SAMPLE_ROWS));
    let count = count.to_string();
    PLAN_GENERATION.render(&[
        ("columns", columns.as_str()),
        ("sample", sample.as_str()),
        ("count", count.as_str()),
    ])
}

pub const PLAN_REFINEMENT: PromptTemplate = PromptTemplate {
    slug: "plan_refinement_v1",
    system: r#"You are curating a dashboard. You receive chart plans together with the rows each plan produced on a data sample.
Keep the plans whose results are informative, drop duplicates and degenerate charts, and configure a sensible default view (defaultTopN, defaultHideOthers) where a chart has many categories.
Keep between {floor} and {ceiling} plans. Return only JSON: {"plans": [{"plan": {...}, "rationale": "..."}]}."#,
    user: r#"<executed_plans>
{plans}
</executed_plans>

<columns>
{columns}
</columns>"#,
};

pub fn refinement_prompt(
    executed: &[(AnalysisPlan, Vec<Value>)],
    columns: &[ColumnProfile],
    floor: usize,
    ceiling: usize,
) -> PromptInstance {
    let plans = executed
        .iter()
        .enumerate()
        .map(|(i, (plan, rows))| {
            let plan_json = serde_json::to_string(plan).unwrap_or_default();
            format!(
                "<plan index=\"{i}\">\n{}\n<result_rows>\n{}\n</result_rows>\n</plan>",
                escape_xml_chars(&plan_json),
                escape_xml_chars(&render_rows(rows, PROMPT_RESULT_ROWS)),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let columns = render_columns(columns);
    let floor = floor.to_string();
    let ceiling = ceiling.to_string();
    PLAN_REFINEMENT.render(&[
        ("plans", plans.as_str()),
        ("columns", columns.as_str()),
        ("floor", floor.as_str()),
        ("ceiling", ceiling.as_str()),
    ])
}

// =============================================================================
// Transforms
// =============================================================================

pub const DATA_PREPARATION: PromptTemplate = PromptTemplate {
    slug: "data_preparation_v1",
    system: r#"You write the body of a JavaScript function `(data, _util) => rows` that cleans a parsed spreadsheet before analysis.
`data` is an array of row objects; `_util` offers parseNumber, parseDate and groupBy. The body must return an array of row objects.
If the data needs no preparation, set jsFunctionBody to null.
Return only JSON: {"explanation": "...", "jsFunctionBody": "..." | null}."#,
    user: r#"<request>
{request}
</request>

<columns>
{columns}
</columns>

<sample_rows>
{sample}
</sample_rows>

{feedback}"#,
};

pub const FILTER_FUNCTION: PromptTemplate = PromptTemplate {
    slug: "filter_function_v1",
    system: r#"You write the body of a JavaScript function `(data, _util) => rows` that filters spreadsheet rows for the user's request.
`data` is an array of row objects; `_util` offers parseNumber, parseDate and groupBy. The body must return an array containing a subset of `data`.
Return only JSON: {"explanation": "...", "jsFunctionBody": "..."}."#,
    user: DATA_PREPARATION.user,
};

pub fn transform_prompt(
    kind: TransformKind,
    request: &str,
    columns: &[ColumnProfile],
    sample: &[Row],
    previous_error: Option<&str>,
) -> PromptInstance {
    let template = match kind {
        TransformKind::DataPreparation => DATA_PREPARATION,
        TransformKind::Filter => FILTER_FUNCTION,
    };
    let request = escape_xml_chars(request);
    let columns = render_columns(columns);
    let sample = escape_xml_chars(&render_rows(sample, PROMPT_SAMPLE_ROWS));
    let feedback = feedback_block("previous_error", previous_error);
    template.render(&[
        ("request", request.as_str()),
        ("columns", columns.as_str()),
        ("sample", sample.as_str()),
        ("feedback", feedback.as_str()),
    ])
}

// =============================================================================
// Intent routing
// =============================================================================

pub const INTENT_ROUTING: PromptTemplate = PromptTemplate {
    slug: "intent_routing_v1",
    system: r#"You route a user's question about a spreadsheet to one intent and the tool that serves it.
Intents and their tools: profile -> csv.profile; aggregate -> csv.aggregate; filter -> csv.filter; visualize -> chart.render or csv.aggregate; explain -> csv.profile; ask_clarify -> no tool (tool null, awaitUser true, message holds the question for the user).
Return only JSON: {"intent": ..., "tool": ... | null, "args": {...}, "awaitUser": bool, "message": ... | null}."#,
    user: r#"<question>
{question}
</question>

<columns>
{columns}
</columns>

{feedback}"#,
};

pub fn intent_prompt(
    question: &str,
    columns: &[ColumnProfile],
    feedback: Option<&str>,
) -> PromptInstance {
    let question = escape_xml_chars(question);
    let columns = render_columns(columns);
    let feedback = feedback_block("violations", feedback);
    INTENT_ROUTING.render(&[
        ("question", question.as_str()),
        ("columns", columns.as_str()),
        ("feedback", feedback.as_str()),
    ])
}

// =============================================================================
// TESTS
// =============================================================================
