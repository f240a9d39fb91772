use std::collections::BTreeMap;

use insight_harness::schema::{GeminiSchema, JsonSchema, JsonType, PathPolicies, SchemaName, SchemaNode};
use proptest::prelude::*;
use proptest::sample::subsequence;
use serde_json::{json, Value};

fn openai_at<'a>(schema: &'a JsonSchema, path: &str) -> Option<&'a JsonSchema> {
    if path.is_empty() {
        return Some(schema);
    }
    let mut node = schema;
    let mut segments = path.split('.');
    while let Some(segment) = segments.next() {
        node = match segment {
            "properties" => node.property(segments.next()?)?,
            "items" => node.items.as_deref()?,
            _ => return None,
        };
    }
    Some(node)
}

fn gemini_at<'a>(schema: &'a GeminiSchema, path: &str) -> Option<&'a GeminiSchema> {
    if path.is_empty() {
        return Some(schema);
    }
    let mut node = schema;
    let mut segments = path.split('.');
    while let Some(segment) = segments.next() {
        node = match segment {
            "properties" => node.property(segments.next()?)?,
            "items" => node.items.as_deref()?,
            _ => return None,
        };
    }
    Some(node)
}

fn leaf() -> impl Strategy<Value = SchemaNode> {
    prop_oneof![
        Just(SchemaNode::string()),
        Just(SchemaNode::integer()),
        Just(SchemaNode::number()),
        Just(SchemaNode::boolean()),
        prop::collection::btree_set("[a-z]{1,5}", 1..4).prop_map(SchemaNode::enumeration),
    ]
}

/// Trees whose objects always declare at least one property.
fn tree() -> impl Strategy<Value = SchemaNode> {
    let inner = leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(SchemaNode::array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 1..4)
                .prop_map(|props: BTreeMap<String, SchemaNode>| SchemaNode::object(props)),
        ]
    });
    prop::collection::btree_map("[a-z]{1,6}", inner, 1..4).prop_map(SchemaNode::object)
}

fn tree_with_policies() -> impl Strategy<Value = (SchemaNode, PathPolicies)> {
    tree().prop_flat_map(|tree| {
        let paths: Vec<String> = tree.paths().into_iter().collect();
        let n = paths.len();
        (
            Just(tree),
            subsequence(paths.clone(), 0..=n),
            subsequence(paths.clone(), 0..=n),
            subsequence(paths, 0..=n),
        )
            .prop_map(|(tree, closed, required, nullable)| {
                let policies = PathPolicies::new()
                    .with_closed(closed)
                    .with_all_required(required)
                    .with_nullable(nullable);
                (tree, policies)
            })
    })
}

proptest! {
    #[test]
    fn compiled_dialects_are_fixed_points((tree, policies) in tree_with_policies()) {
        prop_assert!(policies.validate_against(&tree).is_ok());

        let openai = policies.compile_openai(&tree);
        prop_assert_eq!(&policies.enforce_openai(&openai), &openai);

        let gemini = policies.compile_gemini(&tree).unwrap();
        prop_assert_eq!(&policies.enforce_gemini(&gemini), &gemini);
    }

    #[test]
    fn nullable_paths_accept_null_in_both_dialects((tree, policies) in tree_with_policies()) {
        let openai = policies.compile_openai(&tree);
        let gemini = policies.compile_gemini(&tree).unwrap();

        for path in &policies.nullable {
            let json_node = openai_at(&openai, path).unwrap();
            prop_assert!(json_node.accepts_null(), "openai node at {:?} rejects null", path);
            prop_assert!(json_node.schema_type.includes(JsonType::Null), "type at {:?} rejects null", path);
            if !json_node.enum_values.is_empty() {
                prop_assert!(json_node.enum_values.contains(&Value::Null), "enum at {:?} rejects null", path);
            }
            let gemini_node = gemini_at(&gemini, path).unwrap();
            prop_assert!(gemini_node.nullable, "gemini node at {:?} not nullable", path);
        }
        for path in tree.paths() {
            if !policies.nullable.contains(&path) {
                prop_assert!(!openai_at(&openai, &path).unwrap().accepts_null());
                prop_assert!(!gemini_at(&gemini, &path).unwrap().nullable);
            }
        }
    }

    #[test]
    fn strictness_only_touches_objects((tree, policies) in tree_with_policies()) {
        let openai = policies.compile_openai(&tree);

        for path in tree.paths() {
            let canonical = tree.at(&path).unwrap();
            let node = openai_at(&openai, &path).unwrap();
            let is_object = node.schema_type.includes(JsonType::Object);

            let closed = is_object && policies.strict_additional_properties.contains(&path);
            prop_assert_eq!(node.additional_properties == Some(false), closed);

            let names: Vec<String> = canonical.properties.iter().map(|(n, _)| n.clone()).collect();
            if is_object && policies.strict_all_properties_required.contains(&path) {
                prop_assert_eq!(&node.required, &names);
            } else {
                prop_assert_eq!(&node.required, &canonical.required);
            }

            let order: Vec<String> = node.properties.iter().map(|(n, _)| n.clone()).collect();
            prop_assert_eq!(order, names);
        }
    }
}

#[test]
fn catalog_schemas_are_fixed_points() {
    for name in SchemaName::ALL {
        let compiled = name.compiled().unwrap();
        let policies = name.policies();
        assert_eq!(policies.enforce_openai(&compiled.openai), compiled.openai, "{name}");
        assert_eq!(policies.enforce_gemini(&compiled.gemini), compiled.gemini, "{name}");
    }
}

#[test]
fn catalog_openai_objects_are_closed_and_fully_required() {
    fn walk(schema: &JsonSchema, path: &str) {
        if schema.schema_type.includes(JsonType::Object) {
            assert_eq!(schema.additional_properties, Some(false), "{path}");
            let names: Vec<&str> = schema.properties.iter().map(|(n, _)| n.as_str()).collect();
            let required: Vec<&str> = schema.required.iter().map(String::as_str).collect();
            assert_eq!(required, names, "{path}");
        }
        for (name, child) in &schema.properties {
            walk(child, &format!("{path}.{name}"));
        }
        if let Some(items) = &schema.items {
            walk(items, &format!("{path}[]"));
        }
    }

    for name in SchemaName::ALL {
        walk(&name.compiled().unwrap().openai, name.as_str());
    }
}

#[test]
fn empty_object_cannot_compile_for_gemini() {
    let tree = SchemaNode::object([("meta", SchemaNode::object(Vec::<(String, SchemaNode)>::new()))]);
    let err = PathPolicies::new().compile_gemini(&tree).unwrap_err();
    assert!(err.to_string().contains("properties.meta"));
}

#[test]
fn unknown_policy_paths_are_rejected() {
    let tree = SchemaNode::object([("title", SchemaNode::string())]);
    let policies = PathPolicies::new().with_nullable(["properties.subtitle"]);
    assert!(policies.validate_against(&tree).is_err());
}

fn openai_validator(name: SchemaName) -> jsonschema::Validator {
    let schema = serde_json::to_value(&name.compiled().unwrap().openai).unwrap();
    jsonschema::validator_for(&schema).unwrap()
}

#[test]
fn openai_intent_contract_admits_null_tool() {
    let validator = openai_validator(SchemaName::IntentContract);

    let clarify = json!({
        "intent": "ask_clarify",
        "tool": null,
        "args": {
            "aggregation": null,
            "groupBy": null,
            "filters": null,
            "column": null,
            "limit": null
        },
        "awaitUser": true,
        "message": "Which year?"
    });
    assert!(validator.is_valid(&clarify));

    let mut unknown_tool = clarify.clone();
    unknown_tool["tool"] = json!("csv.pivot");
    assert!(!validator.is_valid(&unknown_tool));

    let mut null_intent = clarify;
    null_intent["intent"] = Value::Null;
    assert!(!validator.is_valid(&null_intent));
}

#[test]
fn openai_plan_list_admits_null_aggregations() {
    let validator = openai_validator(SchemaName::PlanList);

    let plans = json!({ "plans": [{
        "chartType": "scatter",
        "title": "Price against quantity",
        "description": "How unit price relates to quantity sold.",
        "aggregation": null,
        "groupByColumn": null,
        "valueColumn": null,
        "xValueColumn": "Price",
        "yValueColumn": "Quantity",
        "secondaryValueColumn": null,
        "secondaryAggregation": null,
        "defaultTopN": null,
        "defaultHideOthers": null
    }] });
    assert!(validator.is_valid(&plans));
}
