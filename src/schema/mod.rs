//! Canonical output schemas and their provider dialects.
//!
//! A [`SchemaNode`] tree is written once per payload shape. Each provider's
//! structured-output feature accepts a different strictness convention, so
//! the tree is compiled into two dialects ([`GeminiSchema`], [`JsonSchema`])
//! by [`PathPolicies`]. Policies are keyed by node *path* rather than node
//! kind: the same logical position can need `additionalProperties: false`
//! in one dialect and nothing in the other.
//!
//! Paths are dot-separated walks from the root through `properties.<name>`
//! and `items` segments; the root itself is the empty path.

pub mod catalog;
pub mod dialect;

use std::collections::BTreeSet;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

pub use catalog::SchemaName;
pub use dialect::{
    DialectError, GeminiSchema, GeminiType, JsonSchema, JsonType, PathPolicies, ResponseSchema,
    TypeSpec,
};

/// Node kind of the canonical tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// String-valued enumeration.
    Enum,
}

/// One node of a canonical schema tree.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub kind: SchemaKind,
    pub description: Option<String>,
    pub enum_values: Vec<String>,
    pub min_length: Option<u64>,
    pub min_items: Option<u64>,
    /// Ordered property list; order is preserved into both dialects.
    pub properties: Vec<(String, SchemaNode)>,
    /// Properties required in the canonical contract.
    pub required: Vec<String>,
    pub items: Option<Box<SchemaNode>>,
}

impl SchemaNode {
    fn of(kind: SchemaKind) -> Self {
        Self {
            kind,
            description: None,
            enum_values: Vec::new(),
            min_length: None,
            min_items: None,
            properties: Vec::new(),
            required: Vec::new(),
            items: None,
        }
    }

    pub fn string() -> Self {
        Self::of(SchemaKind::String)
    }

    pub fn integer() -> Self {
        Self::of(SchemaKind::Integer)
    }

    pub fn number() -> Self {
        Self::of(SchemaKind::Number)
    }

    pub fn boolean() -> Self {
        Self::of(SchemaKind::Boolean)
    }

    pub fn enumeration<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enum_values: values.into_iter().map(Into::into).collect(),
            ..Self::of(SchemaKind::Enum)
        }
    }

    pub fn array(items: SchemaNode) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of(SchemaKind::Array)
        }
    }

    pub fn object<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = (S, SchemaNode)>,
        S: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(name, node)| (name.into(), node))
                .collect(),
            ..Self::of(SchemaKind::Object)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn min_length(mut self, n: u64) -> Self {
        self.min_length = Some(n);
        self
    }

    pub fn min_items(mut self, n: u64) -> Self {
        self.min_items = Some(n);
        self
    }

    pub fn require(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn property(&self, name: &str) -> Option<&SchemaNode> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    /// Every path in the tree, the root included.
    pub fn paths(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_paths(self, "", &mut out);
        out
    }

    /// Node at `path`, if the tree has one.
    pub fn at(&self, path: &str) -> Option<&SchemaNode> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
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
}

fn collect_paths(node: &SchemaNode, path: &str, out: &mut BTreeSet<String>) {
    out.insert(path.to_string());
    for (name, child) in &node.properties {
        collect_paths(child, &property_path(path, name), out);
    }
    if let Some(items) = &node.items {
        collect_paths(items, &items_path(path), out);
    }
}

/// Path of property `name` under `parent`.
pub fn property_path(parent: &str, name: &str) -> String {
    join(parent, &format!("properties.{name}"))
}

/// Path of the item schema under `parent`.
pub fn items_path(parent: &str) -> String {
    join(parent, "items")
}

fn join(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}

/// Serialize an ordered property list as a JSON object.
pub(crate) fn serialize_properties<S, T>(
    properties: &[(String, T)],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    let mut map = serializer.serialize_map(Some(properties.len()))?;
    for (name, node) in properties {
        map.serialize_entry(name, node)?;
    }
    map.end()
}
