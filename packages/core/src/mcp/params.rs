//! Tool Arguments
//!
//! One typed argument struct per catalog tool. The bridge deserializes agent
//! arguments into these to validate them, generates each tool's advertised
//! input schema from the same struct, and document instances deserialize the
//! forwarded params into them again.
//!
//! Unknown properties are ignored. An absent (`null`) argument object counts
//! as `{}`. A failed deserialization is reported as the failing field's path
//! (`types[1]`, `updates.name`) plus a reason.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::num::NonZeroU32;

/// Level of detail for `get_tree`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TreeFormat {
    #[default]
    Full,
    /// Drops empty `fields` and `children`
    Agent,
    /// Ids, types and names only
    Compact,
}

/// Node types an agent may create or filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChildType {
    Phase,
    Item,
    Subtask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    Json,
    #[default]
    Outline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Append,
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetTreeParams {
    /// Level of detail (default: full)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<TreeFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GetTreeMetadataParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetSubtreeParams {
    /// Id of the subtree root
    pub node_id: String,
    /// Levels of children to include (default: all)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetNodeParams {
    /// Node id
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeParams {
    /// Id of the parent node
    pub parent_id: String,
    /// Node name
    pub name: String,
    /// Node type (default: derived from the parent)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<ChildType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Pattern-specific fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
    /// Index among the parent's children (default: last)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

/// Changes applied by `update_node`; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeUpdates {
    /// New name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New description; null clears it
    #[schemars(with = "Option<String>")]
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    /// Fields to merge in; a null value removes the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeParams {
    /// Node id
    pub node_id: String,
    /// Fields to change: name, description, fields
    pub updates: NodeUpdates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNodeParams {
    /// Node id
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchNodesParams {
    /// Text to search for
    pub query: String,
    /// Maximum results (default: 20)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<NonZeroU32>,
    /// Only return nodes of these types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<ChildType>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportParams {
    /// JSON tree or indented outline
    pub content: String,
    /// Content format (default: outline)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImportFormat>,
    /// Node to import under (default: root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Append to or replace the parent's children (default: append)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ImportMode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeginTransactionParams {
    /// Label for the undo entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Assigned by the bridge before the request reaches the document
    #[schemars(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// Arguments of `commit_transaction` and `rollback_transaction`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloseTransactionParams {
    /// Id returned by begin_transaction
    pub transaction_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetPatternSchemaParams {
    /// Pattern name (default: the document's pattern)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetActivityLogParams {
    /// Maximum entries (default: 50)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<NonZeroU32>,
}

/// Keeps an explicit `null` apart from an absent field
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// The first argument that failed to deserialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentError {
    pub field: String,
    pub reason: String,
}

impl ArgumentError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn from_path(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        let path = err.path().to_string();
        let message = err.into_inner().to_string();

        // Missing fields surface at the enclosing object
        if let Some(name) = message
            .strip_prefix("missing field `")
            .and_then(|rest| rest.strip_suffix('`'))
        {
            let field = if path == "." {
                name.to_string()
            } else {
                format!("{}.{}", path, name)
            };
            return Self::new(field, "is required");
        }

        let field = if path == "." { "arguments".to_string() } else { path };
        if message.starts_with("invalid type: null") {
            return Self::new(field, "is required");
        }
        Self::new(field, message)
    }
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ArgumentError {}

/// Deserialize a tool's argument object into its typed params
pub fn parse_arguments<T: DeserializeOwned>(arguments: Value) -> Result<T, ArgumentError> {
    let arguments = match arguments {
        Value::Null => Value::Object(Map::new()),
        Value::Object(map) => Value::Object(map),
        other => {
            return Err(ArgumentError::new(
                "arguments",
                format!("must be an object, got {}", json_type(&other)),
            ))
        }
    };
    serde_path_to_error::deserialize(arguments).map_err(ArgumentError::from_path)
}

/// Input schema generated from a params struct
///
/// Subschemas are inlined so every property is self-contained, and the
/// object always carries `properties` and `required`.
pub fn schema_for<T: JsonSchema>() -> Map<String, Value> {
    let root = schemars::generate::SchemaSettings::draft2020_12()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();

    let mut schema = match root.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    schema.remove("$schema");
    schema.remove("title");
    schema.remove("description");
    schema.insert("type".to_string(), Value::String("object".to_string()));
    schema
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    schema
        .entry("required")
        .or_insert_with(|| Value::Array(Vec::new()));
    schema
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
