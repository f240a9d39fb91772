use insight_harness::recovery::{balanced_span, recover_array, recover_object, RecoveryError};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        // Braces, brackets, quotes and backslashes inside strings must not
        // throw off span matching.
        "[a-zA-Z0-9 {}\\[\\]\"\\\\:,]{0,16}".prop_map(Value::String),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    scalar().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,6}", value(), 1..5).prop_map(|m| m.into_iter().collect())
}

/// Prose that contains no JSON delimiters or fences.
fn prose() -> impl Strategy<Value = String> {
    "[a-zA-Z .!?:]{0,40}"
}

proptest! {
    #[test]
    fn object_survives_prose_and_fences(
        obj in object(),
        before in prose(),
        after in prose(),
        fenced in any::<bool>(),
        pretty in any::<bool>(),
    ) {
        let body = if pretty {
            serde_json::to_string_pretty(&obj).unwrap()
        } else {
            serde_json::to_string(&obj).unwrap()
        };
        let raw = if fenced {
            format!("{before}\n```json\n{body}\n```\n{after}")
        } else {
            format!("{before} {body} {after}")
        };
        prop_assert_eq!(recover_object(&raw).unwrap(), obj);
    }

    #[test]
    fn array_survives_prose(items in prop::collection::vec(object(), 0..4), before in prose(), after in prose()) {
        let values: Vec<Value> = items.into_iter().map(Value::Object).collect();
        let raw = format!("{before} {} {after}", Value::Array(values.clone()));
        prop_assert_eq!(recover_array(&raw).unwrap(), values);
    }

    #[test]
    fn prose_alone_never_recovers(text in prose()) {
        let object_err = matches!(recover_object(&text), Err(RecoveryError::NoObject { .. }));
        let array_err = matches!(recover_array(&text), Err(RecoveryError::NoArray { .. }));
        prop_assert!(object_err);
        prop_assert!(array_err);
    }

    #[test]
    fn balanced_span_of_serialized_value_is_the_whole_value(obj in object(), tail in prose()) {
        let body = Value::Object(obj).to_string();
        let raw = format!("{body}{tail}}}");
        prop_assert_eq!(balanced_span(&raw, '{', '}'), Some(body.as_str()));
    }
}
