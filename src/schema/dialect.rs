//! Path-keyed compilation of canonical trees into provider dialects.
//!
//! Both compilers are a single recursive walk that rebuilds children first
//! and then applies the policies for the current path to the freshly built
//! node. Nothing is mutated in place, so the two dialect trees never share
//! structure with each other or with the canonical tree.
//!
//! The `enforce_*` methods run the same policy walk over an already compiled
//! tree; compiled output is a fixed point of them.

use std::collections::BTreeSet;

use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use super::{items_path, property_path, serialize_properties, SchemaKind, SchemaNode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialectError {
    #[error("object at {path:?} declares no properties; Gemini rejects empty objects")]
    EmptyObject { path: String },
    #[error("policy paths missing from the schema tree: {}", paths.join(", "))]
    UnknownPolicyPaths { paths: Vec<String> },
}

// =============================================================================
// Dialect A: Gemini
// =============================================================================

/// Gemini's enumerated type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeminiType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiSchema {
    #[serde(rename = "type")]
    pub schema_type: GeminiType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    #[serde(
        serialize_with = "serialize_properties",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub properties: Vec<(String, GeminiSchema)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub property_ordering: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<GeminiSchema>>,
}

impl GeminiSchema {
    pub fn property(&self, name: &str) -> Option<&GeminiSchema> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }
}

// =============================================================================
// Dialect B: JSON Schema (OpenAI strict mode)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    Null,
}

/// The `type` keyword: absent, a single type, or a union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSpec {
    Unspecified,
    Single(JsonType),
    Union(Vec<JsonType>),
}

impl TypeSpec {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, TypeSpec::Unspecified)
    }

    pub fn includes(&self, ty: JsonType) -> bool {
        match self {
            TypeSpec::Unspecified => false,
            TypeSpec::Single(t) => *t == ty,
            TypeSpec::Union(types) => types.contains(&ty),
        }
    }

    /// Widen to also accept `null`.
    pub fn with_null(self) -> Self {
        match self {
            TypeSpec::Unspecified => TypeSpec::Union(vec![JsonType::Null]),
            TypeSpec::Single(JsonType::Null) => TypeSpec::Single(JsonType::Null),
            TypeSpec::Single(t) => TypeSpec::Union(vec![t, JsonType::Null]),
            TypeSpec::Union(mut types) => {
                if !types.contains(&JsonType::Null) {
                    types.push(JsonType::Null);
                }
                TypeSpec::Union(types)
            }
        }
    }
}

impl Serialize for TypeSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TypeSpec::Unspecified => serializer.serialize_none(),
            TypeSpec::Single(t) => t.serialize(serializer),
            TypeSpec::Union(types) => types.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSchema {
    #[serde(rename = "type", skip_serializing_if = "TypeSpec::is_unspecified")]
    pub schema_type: TypeSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
    // No `minLength`: strict structured outputs reject it. String lengths
    // are checked after decoding instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    #[serde(
        serialize_with = "serialize_properties",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub properties: Vec<(String, JsonSchema)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<JsonSchema>>,
}

impl JsonSchema {
    pub fn property(&self, name: &str) -> Option<&JsonSchema> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    /// Whether a literal `null` satisfies both this node's `type` and `enum`
    /// keywords.
    pub fn accepts_null(&self) -> bool {
        let type_ok = self.schema_type.is_unspecified() || self.schema_type.includes(JsonType::Null);
        let enum_ok = self.enum_values.is_empty() || self.enum_values.contains(&Value::Null);
        type_ok && enum_ok
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Three sets of schema paths that drive dialect strictness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathPolicies {
    /// Object nodes that get `additionalProperties: false` in the JSON Schema dialect.
    pub strict_additional_properties: BTreeSet<String>,
    /// Object nodes whose every declared property is listed in `required`
    /// in the JSON Schema dialect. Optionality is then expressed by
    /// nullability of the value.
    pub strict_all_properties_required: BTreeSet<String>,
    /// Nodes that must also accept `null`, in both dialects.
    pub nullable: BTreeSet<String>,
}

impl PathPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_closed<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strict_additional_properties
            .extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_all_required<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.strict_all_properties_required
            .extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_nullable<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nullable.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Every policy path must address a node of `root`.
    pub fn validate_against(&self, root: &SchemaNode) -> Result<(), DialectError> {
        let known = root.paths();
        let mut missing: Vec<String> = self
            .strict_additional_properties
            .iter()
            .chain(&self.strict_all_properties_required)
            .chain(&self.nullable)
            .filter(|p| !known.contains(*p))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        missing.dedup();
        Err(DialectError::UnknownPolicyPaths { paths: missing })
    }

    // -------------------------------------------------------------------------
    // Gemini
    // -------------------------------------------------------------------------

    pub fn compile_gemini(&self, root: &SchemaNode) -> Result<GeminiSchema, DialectError> {
        self.gemini_node(root, "")
    }

    /// Re-apply the Gemini policies to an already compiled tree.
    pub fn enforce_gemini(&self, schema: &GeminiSchema) -> GeminiSchema {
        self.enforce_gemini_at(schema, "")
    }

    fn gemini_node(&self, node: &SchemaNode, path: &str) -> Result<GeminiSchema, DialectError> {
        let properties = node
            .properties
            .iter()
            .map(|(name, child)| {
                let compiled = self.gemini_node(child, &property_path(path, name))?;
                Ok((name.clone(), compiled))
            })
            .collect::<Result<Vec<_>, DialectError>>()?;
        let items = node
            .items
            .as_deref()
            .map(|child| self.gemini_node(child, &items_path(path)))
            .transpose()?
            .map(Box::new);

        if node.kind == SchemaKind::Object && properties.is_empty() {
            return Err(DialectError::EmptyObject {
                path: path.to_string(),
            });
        }

        let (schema_type, format) = match node.kind {
            SchemaKind::String => (GeminiType::String, None),
            SchemaKind::Enum => (GeminiType::String, Some("enum".to_string())),
            SchemaKind::Integer => (GeminiType::Integer, None),
            SchemaKind::Number => (GeminiType::Number, None),
            SchemaKind::Boolean => (GeminiType::Boolean, None),
            SchemaKind::Array => (GeminiType::Array, None),
            SchemaKind::Object => (GeminiType::Object, None),
        };

        let rebuilt = GeminiSchema {
            schema_type,
            format,
            description: node.description.clone(),
            enum_values: node.enum_values.iter().cloned().map(Value::String).collect(),
            nullable: false,
            min_length: node.min_length,
            min_items: node.min_items,
            property_ordering: properties.iter().map(|(n, _)| n.clone()).collect(),
            properties,
            required: node.required.clone(),
            items,
        };
        Ok(self.gemini_policies(rebuilt, path))
    }

    fn enforce_gemini_at(&self, schema: &GeminiSchema, path: &str) -> GeminiSchema {
        let rebuilt = GeminiSchema {
            properties: schema
                .properties
                .iter()
                .map(|(name, child)| {
                    (
                        name.clone(),
                        self.enforce_gemini_at(child, &property_path(path, name)),
                    )
                })
                .collect(),
            items: schema
                .items
                .as_deref()
                .map(|child| Box::new(self.enforce_gemini_at(child, &items_path(path)))),
            ..schema.clone()
        };
        self.gemini_policies(rebuilt, path)
    }

    fn gemini_policies(&self, mut node: GeminiSchema, path: &str) -> GeminiSchema {
        if self.nullable.contains(path) {
            node.nullable = true;
            if !node.enum_values.is_empty() && !node.enum_values.contains(&Value::Null) {
                node.enum_values.push(Value::Null);
            }
        }
        node
    }

    // -------------------------------------------------------------------------
    // OpenAI / JSON Schema
    // -------------------------------------------------------------------------

    pub fn compile_openai(&self, root: &SchemaNode) -> JsonSchema {
        self.openai_node(root, "")
    }

    /// Re-apply the JSON Schema policies to an already compiled tree.
    pub fn enforce_openai(&self, schema: &JsonSchema) -> JsonSchema {
        self.enforce_openai_at(schema, "")
    }

    fn openai_node(&self, node: &SchemaNode, path: &str) -> JsonSchema {
        let properties = node
            .properties
            .iter()
            .map(|(name, child)| {
                (
                    name.clone(),
                    self.openai_node(child, &property_path(path, name)),
                )
            })
            .collect();
        let items = node
            .items
            .as_deref()
            .map(|child| Box::new(self.openai_node(child, &items_path(path))));

        let schema_type = TypeSpec::Single(match node.kind {
            SchemaKind::String | SchemaKind::Enum => JsonType::String,
            SchemaKind::Integer => JsonType::Integer,
            SchemaKind::Number => JsonType::Number,
            SchemaKind::Boolean => JsonType::Boolean,
            SchemaKind::Array => JsonType::Array,
            SchemaKind::Object => JsonType::Object,
        });

        let rebuilt = JsonSchema {
            schema_type,
            description: node.description.clone(),
            enum_values: node.enum_values.iter().cloned().map(Value::String).collect(),
            min_items: node.min_items,
            properties,
            required: node.required.clone(),
            additional_properties: None,
            items,
        };
        self.openai_policies(rebuilt, path)
    }

    fn enforce_openai_at(&self, schema: &JsonSchema, path: &str) -> JsonSchema {
        let rebuilt = JsonSchema {
            properties: schema
                .properties
                .iter()
                .map(|(name, child)| {
                    (
                        name.clone(),
                        self.enforce_openai_at(child, &property_path(path, name)),
                    )
                })
                .collect(),
            items: schema
                .items
                .as_deref()
                .map(|child| Box::new(self.enforce_openai_at(child, &items_path(path)))),
            ..schema.clone()
        };
        self.openai_policies(rebuilt, path)
    }

    fn openai_policies(&self, mut node: JsonSchema, path: &str) -> JsonSchema {
        let is_object = node.schema_type.includes(JsonType::Object);

        if is_object && self.strict_additional_properties.contains(path) {
            node.additional_properties = Some(false);
        }
        if is_object && self.strict_all_properties_required.contains(path) {
            node.required = node.properties.iter().map(|(n, _)| n.clone()).collect();
        }
        if self.nullable.contains(path) {
            // `type` and `enum` are checked independently; both must admit null.
            node.schema_type = node.schema_type.with_null();
            if !node.enum_values.is_empty() && !node.enum_values.contains(&Value::Null) {
                node.enum_values.push(Value::Null);
            }
        }
        node
    }
}

// =============================================================================
// Compiled pair
// =============================================================================

/// Both dialects of one canonical schema, ready to attach to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: &'static str,
    pub gemini: GeminiSchema,
    pub openai: JsonSchema,
}

impl ResponseSchema {
    pub fn compile(
        name: &'static str,
        root: &SchemaNode,
        policies: &PathPolicies,
    ) -> Result<Self, DialectError> {
        policies.validate_against(root)?;
        Ok(Self {
            name,
            gemini: policies.compile_gemini(root)?,
            openai: policies.compile_openai(root),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> SchemaNode {
        SchemaNode::object([
            ("intent", SchemaNode::enumeration(["aggregate", "profile"])),
            ("tool", SchemaNode::enumeration(["csv.aggregate"])),
            (
                "args",
                SchemaNode::object([
                    ("groupBy", SchemaNode::array(SchemaNode::string())),
                    ("limit", SchemaNode::integer()),
                ]),
            ),
            ("message", SchemaNode::string()),
        ])
        .require(&["intent"])
    }

    fn policies() -> PathPolicies {
        PathPolicies::new()
            .with_closed(["", "properties.args"])
            .with_all_required(["", "properties.args"])
            .with_nullable([
                "properties.tool",
                "properties.message",
                "properties.args.properties.limit",
            ])
    }

    #[test]
    fn openai_dialect_closes_and_requires_objects() {
        let compiled = policies().compile_openai(&tree());
        assert_eq!(compiled.additional_properties, Some(false));
        assert_eq!(compiled.required, ["intent", "tool", "args", "message"]);

        let args = compiled.property("args").unwrap();
        assert_eq!(args.additional_properties, Some(false));
        assert_eq!(args.required, ["groupBy", "limit"]);
    }

    #[test]
    fn openai_nullable_widens_type_or_enum() {
        let compiled = policies().compile_openai(&tree());

        let tool = compiled.property("tool").unwrap();
        assert_eq!(
            tool.schema_type,
            TypeSpec::Union(vec![JsonType::String, JsonType::Null])
        );
        assert_eq!(tool.enum_values, vec![json!("csv.aggregate"), Value::Null]);
        assert!(tool.accepts_null());

        let message = compiled.property("message").unwrap();
        assert_eq!(
            message.schema_type,
            TypeSpec::Union(vec![JsonType::String, JsonType::Null])
        );

        let limit = compiled
            .property("args")
            .and_then(|a| a.property("limit"))
            .unwrap();
        assert!(limit.accepts_null());

        let intent = compiled.property("intent").unwrap();
        assert!(!intent.accepts_null());
    }

    #[test]
    fn openai_serialization_shape() {
        let compiled = policies().compile_openai(&tree());
        let value = serde_json::to_value(&compiled).unwrap();
        assert_eq!(value["type"], "object");
        assert_eq!(value["additionalProperties"], false);
        assert_eq!(value["properties"]["message"]["type"], json!(["string", "null"]));
        assert_eq!(value["properties"]["tool"]["type"], json!(["string", "null"]));
        assert_eq!(value["properties"]["tool"]["enum"], json!(["csv.aggregate", null]));
        let keys: Vec<&String> = value["properties"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["intent", "tool", "args", "message"]);
    }

    #[test]
    fn gemini_dialect_uses_type_tags_and_nullable() {
        let compiled = policies().compile_gemini(&tree()).unwrap();
        let value = serde_json::to_value(&compiled).unwrap();

        assert_eq!(value["type"], "OBJECT");
        assert!(value.get("additionalProperties").is_none());
        assert_eq!(value["required"], json!(["intent"]));
        assert_eq!(value["propertyOrdering"], json!(["intent", "tool", "args", "message"]));
        assert_eq!(value["properties"]["intent"]["format"], "enum");
        assert_eq!(value["properties"]["tool"]["nullable"], true);
        assert_eq!(value["properties"]["tool"]["enum"], json!(["csv.aggregate", null]));
        assert_eq!(value["properties"]["args"]["properties"]["limit"]["type"], "INTEGER");
        assert!(value["properties"]["intent"].get("nullable").is_none());
    }

    #[test]
    fn gemini_rejects_empty_objects() {
        let tree = SchemaNode::object([("args", SchemaNode::object(Vec::<(String, _)>::new()))]);
        let err = PathPolicies::new().compile_gemini(&tree).unwrap_err();
        assert_eq!(
            err,
            DialectError::EmptyObject {
                path: "properties.args".into()
            }
        );
    }

    #[test]
    fn unspecified_type_widens_to_null_only() {
        assert_eq!(
            TypeSpec::Unspecified.with_null(),
            TypeSpec::Union(vec![JsonType::Null])
        );
        let twice = TypeSpec::Single(JsonType::Integer).with_null().with_null();
        assert_eq!(
            twice,
            TypeSpec::Union(vec![JsonType::Integer, JsonType::Null])
        );
    }

    #[test]
    fn null_must_pass_both_type_and_enum() {
        let enum_only = JsonSchema {
            schema_type: TypeSpec::Single(JsonType::String),
            description: None,
            enum_values: vec![json!("csv.profile"), Value::Null],
            min_items: None,
            properties: Vec::new(),
            required: Vec::new(),
            additional_properties: None,
            items: None,
        };
        assert!(!enum_only.accepts_null());

        let widened = JsonSchema {
            schema_type: TypeSpec::Union(vec![JsonType::String, JsonType::Null]),
            enum_values: vec![json!("csv.profile")],
            ..enum_only.clone()
        };
        assert!(!widened.accepts_null());

        let both = JsonSchema {
            enum_values: vec![json!("csv.profile"), Value::Null],
            ..widened
        };
        assert!(both.accepts_null());
    }

    #[test]
    fn compilation_does_not_touch_the_input() {
        let tree = tree();
        let before = tree.clone();
        let _ = policies().compile_openai(&tree);
        let _ = policies().compile_gemini(&tree).unwrap();
        assert_eq!(tree, before);
    }

    #[test]
    fn enforce_is_a_fixed_point_on_compiled_output() {
        let p = policies();
        let openai = p.compile_openai(&tree());
        assert_eq!(p.enforce_openai(&openai), openai);
        let gemini = p.compile_gemini(&tree()).unwrap();
        assert_eq!(p.enforce_gemini(&gemini), gemini);
    }

    #[test]
    fn unknown_policy_paths_are_reported() {
        let p = policies().with_nullable(["properties.nope", "properties.args.items"]);
        let err = p.validate_against(&tree()).unwrap_err();
        assert_eq!(
            err,
            DialectError::UnknownPolicyPaths {
                paths: vec!["properties.args.items".into(), "properties.nope".into()]
            }
        );
        assert!(policies().validate_against(&tree()).is_ok());
    }

    #[test]
    fn compile_pair_validates_policies_first() {
        let bad = policies().with_closed(["properties.ghost"]);
        assert!(ResponseSchema::compile("intent", &tree(), &bad).is_err());
        let ok = ResponseSchema::compile("intent", &tree(), &policies()).unwrap();
        assert_eq!(ok.name, "intent");
    }
}
