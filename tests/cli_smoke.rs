use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::tempdir;

fn insight(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_insight"))
        .args(args)
        .output()
        .unwrap()
}

fn insight_with_file(args: &[&str], file: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_insight"))
        .args(args)
        .arg(file)
        .output()
        .unwrap()
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn prints_gemini_dialect() {
    let output = insight(&["schema", "plan_list", "--dialect", "gemini"]);
    assert!(output.status.success());

    let schema = stdout_json(&output);
    assert_eq!(schema["type"], "OBJECT");
    assert_eq!(schema["properties"]["plans"]["type"], "ARRAY");
    assert_eq!(schema["propertyOrdering"], serde_json::json!(["plans"]));
    assert!(schema.get("additionalProperties").is_none());
}

#[test]
fn prints_openai_dialect_by_default() {
    let output = insight(&["schema", "intent_contract"]);
    assert!(output.status.success());

    let schema = stdout_json(&output);
    assert_eq!(schema["type"], "object");
    assert_eq!(schema["additionalProperties"], false);
    let required: Vec<&str> = schema["required"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert_eq!(required, ["intent", "tool", "args", "awaitUser", "message"]);
}

#[test]
fn unknown_schema_name_is_rejected() {
    let output = insight(&["schema", "nonsense"]);
    assert!(!output.status.success());
}

#[test]
fn recovers_object_from_prose() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reply.txt");
    std::fs::write(
        &path,
        "Sure! Here it is:\n```json\n{\"intent\": \"profile\", \"tool\": \"csv.profile\"}\n```\nAnything else?",
    )
    .unwrap();

    let output = insight_with_file(&["recover"], &path);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["intent"], "profile");
    assert_eq!(value["tool"], "csv.profile");
}

#[test]
fn recovers_array_from_wrapper_object() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("plans.txt");
    std::fs::write(&path, r#"{"plans": [{"title": "a"}, {"title": "b"}]}"#).unwrap();

    let output = insight_with_file(&["recover", "--array"], &path);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output).as_array().map(Vec::len), Some(2));
}

#[test]
fn recovery_failure_exits_nonzero() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reply.txt");
    std::fs::write(&path, "no json here").unwrap();

    let output = insight_with_file(&["recover"], &path);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no JSON object"));
}

#[test]
fn intent_prints_defaults_or_violations() {
    let dir = tempdir().unwrap();

    let valid = dir.path().join("valid.json");
    std::fs::write(&valid, r#"{"intent": "aggregate", "tool": "csv.aggregate"}"#).unwrap();
    let output = insight_with_file(&["intent"], &valid);
    assert!(output.status.success());
    let contract = stdout_json(&output);
    assert_eq!(contract["args"]["aggregation"], "sum");
    assert_eq!(contract["awaitUser"], false);
    assert!(contract["message"].is_null());

    let invalid = dir.path().join("invalid.json");
    std::fs::write(&invalid, r#"{"intent": "aggregate", "tool": "csv.profile"}"#).unwrap();
    let output = insight_with_file(&["intent"], &invalid);
    assert!(!output.status.success());
    let violations = stdout_json(&output);
    assert_eq!(violations[0]["path"], "tool");
}
