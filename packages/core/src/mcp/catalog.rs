//! Tool Catalog
//!
//! The fixed set of tools the bridge exposes to the agent. The set is closed:
//! every tool is a [`ToolKind`] variant, and its name, description, input
//! schema and timeout class are derived from the variant. The schema served
//! by `tools/list` is generated from the params struct arguments are
//! deserialized into, so the advertised and enforced contracts cannot drift
//! apart.

use crate::bridge::error::BridgeError;
use crate::mcp::params::{
    parse_arguments, schema_for, ArgumentError, BeginTransactionParams, CloseTransactionParams,
    CreateNodeParams, DeleteNodeParams, GetActivityLogParams, GetNodeParams,
    GetPatternSchemaParams, GetSubtreeParams, GetTreeMetadataParams, GetTreeParams, ImportParams,
    SearchNodesParams, UpdateNodeParams,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Routing-only argument accepted by every tool
pub const TAB_ID_ARG: &str = "tabId";

/// Deadline class a tool's document round trip falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Reads and single-node writes
    Standard,
    /// Imports and transaction commit/rollback
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    GetTree,
    GetTreeMetadata,
    GetSubtree,
    GetNode,
    CreateNode,
    UpdateNode,
    DeleteNode,
    SearchNodes,
    ImportStructuredContent,
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
    GetPatternSchema,
    GetActivityLog,
}

impl ToolKind {
    pub const ALL: [ToolKind; 14] = [
        ToolKind::GetTree,
        ToolKind::GetTreeMetadata,
        ToolKind::GetSubtree,
        ToolKind::GetNode,
        ToolKind::CreateNode,
        ToolKind::UpdateNode,
        ToolKind::DeleteNode,
        ToolKind::SearchNodes,
        ToolKind::ImportStructuredContent,
        ToolKind::BeginTransaction,
        ToolKind::CommitTransaction,
        ToolKind::RollbackTransaction,
        ToolKind::GetPatternSchema,
        ToolKind::GetActivityLog,
    ];

    /// Wire name, also used as the document-side method name
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::GetTree => "get_tree",
            ToolKind::GetTreeMetadata => "get_tree_metadata",
            ToolKind::GetSubtree => "get_subtree",
            ToolKind::GetNode => "get_node",
            ToolKind::CreateNode => "create_node",
            ToolKind::UpdateNode => "update_node",
            ToolKind::DeleteNode => "delete_node",
            ToolKind::SearchNodes => "search_nodes",
            ToolKind::ImportStructuredContent => "import_structured_content",
            ToolKind::BeginTransaction => "begin_transaction",
            ToolKind::CommitTransaction => "commit_transaction",
            ToolKind::RollbackTransaction => "rollback_transaction",
            ToolKind::GetPatternSchema => "get_pattern_schema",
            ToolKind::GetActivityLog => "get_activity_log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::GetTree => {
                "Get the whole project tree. 'agent' format trims presentation-only fields, 'compact' returns ids, types and names only."
            }
            ToolKind::GetTreeMetadata => {
                "Get project-level metadata: name, pattern, node counts by type and last modification time."
            }
            ToolKind::GetSubtree => "Get a node and its descendants, optionally limited to a depth.",
            ToolKind::GetNode => "Get a single node by id, without its children.",
            ToolKind::CreateNode => {
                "Create a node under a parent. Child type follows the hierarchy root > phase > item > subtask unless given explicitly."
            }
            ToolKind::UpdateNode => "Update fields of an existing node. Only the supplied fields change.",
            ToolKind::DeleteNode => "Delete a node and all of its descendants. The root cannot be deleted.",
            ToolKind::SearchNodes => "Search node names, descriptions and fields for a text query.",
            ToolKind::ImportStructuredContent => {
                "Import a JSON tree or an indented outline under a parent node, appending to or replacing its children."
            }
            ToolKind::BeginTransaction => {
                "Start a transaction. Mutations until commit or rollback are applied as one undo step. Only one transaction may be active per document."
            }
            ToolKind::CommitTransaction => {
                "Commit the active transaction, collapsing its mutations into a single undo checkpoint."
            }
            ToolKind::RollbackTransaction => {
                "Roll back the active transaction, discarding every mutation made since it began."
            }
            ToolKind::GetPatternSchema => {
                "Get the field schema of the document's pattern, or of the named pattern."
            }
            ToolKind::GetActivityLog => "Get the most recent document activity, newest first.",
        }
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            ToolKind::ImportStructuredContent
            | ToolKind::CommitTransaction
            | ToolKind::RollbackTransaction => TimeoutClass::Bulk,
            _ => TimeoutClass::Standard,
        }
    }

    /// Tools that change the document and are tagged while a transaction is active
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            ToolKind::CreateNode
                | ToolKind::UpdateNode
                | ToolKind::DeleteNode
                | ToolKind::ImportStructuredContent
        )
    }

    /// JSON Schema of the tool's arguments
    pub fn input_schema(&self) -> Value {
        let mut schema = match self {
            ToolKind::GetTree => schema_for::<GetTreeParams>(),
            ToolKind::GetTreeMetadata => schema_for::<GetTreeMetadataParams>(),
            ToolKind::GetSubtree => schema_for::<GetSubtreeParams>(),
            ToolKind::GetNode => schema_for::<GetNodeParams>(),
            ToolKind::CreateNode => schema_for::<CreateNodeParams>(),
            ToolKind::UpdateNode => schema_for::<UpdateNodeParams>(),
            ToolKind::DeleteNode => schema_for::<DeleteNodeParams>(),
            ToolKind::SearchNodes => schema_for::<SearchNodesParams>(),
            ToolKind::ImportStructuredContent => schema_for::<ImportParams>(),
            ToolKind::BeginTransaction => schema_for::<BeginTransactionParams>(),
            ToolKind::CommitTransaction | ToolKind::RollbackTransaction => {
                schema_for::<CloseTransactionParams>()
            }
            ToolKind::GetPatternSchema => schema_for::<GetPatternSchemaParams>(),
            ToolKind::GetActivityLog => schema_for::<GetActivityLogParams>(),
        };

        if let Some(Value::Object(properties)) = schema.get_mut("properties") {
            properties.insert(
                TAB_ID_ARG.to_string(),
                json!({
                    "type": "string",
                    "description": "Document instance to target; required when several are connected"
                }),
            );
        }
        Value::Object(schema)
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }
}

/// Catalog entry as advertised by `tools/list`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Every tool, in catalog order
pub fn tool_definitions() -> Vec<ToolDefinition> {
    ToolKind::ALL.iter().map(ToolKind::definition).collect()
}

/// Typed arguments of one tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgs {
    GetTree(GetTreeParams),
    GetTreeMetadata(GetTreeMetadataParams),
    GetSubtree(GetSubtreeParams),
    GetNode(GetNodeParams),
    CreateNode(CreateNodeParams),
    UpdateNode(UpdateNodeParams),
    DeleteNode(DeleteNodeParams),
    SearchNodes(SearchNodesParams),
    ImportStructuredContent(ImportParams),
    BeginTransaction(BeginTransactionParams),
    CommitTransaction(CloseTransactionParams),
    RollbackTransaction(CloseTransactionParams),
    GetPatternSchema(GetPatternSchemaParams),
    GetActivityLog(GetActivityLogParams),
}

impl ToolArgs {
    pub fn parse(kind: ToolKind, arguments: Value) -> Result<Self, ArgumentError> {
        Ok(match kind {
            ToolKind::GetTree => ToolArgs::GetTree(parse_arguments(arguments)?),
            ToolKind::GetTreeMetadata => ToolArgs::GetTreeMetadata(parse_arguments(arguments)?),
            ToolKind::GetSubtree => ToolArgs::GetSubtree(parse_arguments(arguments)?),
            ToolKind::GetNode => ToolArgs::GetNode(parse_arguments(arguments)?),
            ToolKind::CreateNode => ToolArgs::CreateNode(parse_arguments(arguments)?),
            ToolKind::UpdateNode => ToolArgs::UpdateNode(parse_arguments(arguments)?),
            ToolKind::DeleteNode => ToolArgs::DeleteNode(parse_arguments(arguments)?),
            ToolKind::SearchNodes => ToolArgs::SearchNodes(parse_arguments(arguments)?),
            ToolKind::ImportStructuredContent => {
                ToolArgs::ImportStructuredContent(parse_arguments(arguments)?)
            }
            ToolKind::BeginTransaction => ToolArgs::BeginTransaction(parse_arguments(arguments)?),
            ToolKind::CommitTransaction => ToolArgs::CommitTransaction(parse_arguments(arguments)?),
            ToolKind::RollbackTransaction => {
                ToolArgs::RollbackTransaction(parse_arguments(arguments)?)
            }
            ToolKind::GetPatternSchema => ToolArgs::GetPatternSchema(parse_arguments(arguments)?),
            ToolKind::GetActivityLog => ToolArgs::GetActivityLog(parse_arguments(arguments)?),
        })
    }

    /// Params object as forwarded to the document
    pub fn to_params(&self) -> Result<Value, BridgeError> {
        let params = match self {
            ToolArgs::GetTree(p) => serde_json::to_value(p),
            ToolArgs::GetTreeMetadata(p) => serde_json::to_value(p),
            ToolArgs::GetSubtree(p) => serde_json::to_value(p),
            ToolArgs::GetNode(p) => serde_json::to_value(p),
            ToolArgs::CreateNode(p) => serde_json::to_value(p),
            ToolArgs::UpdateNode(p) => serde_json::to_value(p),
            ToolArgs::DeleteNode(p) => serde_json::to_value(p),
            ToolArgs::SearchNodes(p) => serde_json::to_value(p),
            ToolArgs::ImportStructuredContent(p) => serde_json::to_value(p),
            ToolArgs::BeginTransaction(p) => serde_json::to_value(p),
            ToolArgs::CommitTransaction(p) | ToolArgs::RollbackTransaction(p) => {
                serde_json::to_value(p)
            }
            ToolArgs::GetPatternSchema(p) => serde_json::to_value(p),
            ToolArgs::GetActivityLog(p) => serde_json::to_value(p),
        };
        params.map_err(|e| BridgeError::internal(format!("Failed to encode params: {}", e)))
    }
}

/// A validated tool call, ready for routing
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub kind: ToolKind,
    /// Explicit target, taken out of the arguments
    pub tab_id: Option<String>,
    pub args: ToolArgs,
}

impl PreparedCall {
    /// Look up `name` and deserialize `arguments` into its params
    ///
    /// Nothing here touches a session; a call that fails here never leaves
    /// the bridge.
    pub fn new(name: &str, mut arguments: Value) -> Result<Self, BridgeError> {
        let kind = ToolKind::from_name(name).ok_or_else(|| BridgeError::UnknownTool(name.to_string()))?;

        let tab_id = match &mut arguments {
            Value::Object(map) => match map.remove(TAB_ID_ARG) {
                None | Some(Value::Null) => None,
                Some(Value::String(tab)) => Some(tab),
                Some(other) => {
                    return Err(BridgeError::validation(
                        TAB_ID_ARG,
                        format!("expected a string, got {}", other),
                    ))
                }
            },
            _ => None,
        };
        let args = ToolArgs::parse(kind, arguments)?;

        Ok(Self { kind, tab_id, args })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_has_fourteen_unique_tools() {
        let defs = tool_definitions();
        assert_eq!(defs.len(), 14);

        let mut names: Vec<&str> = defs.iter().map(|d| d.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 14);

        for expected in [
            "get_tree",
            "get_tree_metadata",
            "get_subtree",
            "get_node",
            "create_node",
            "update_node",
            "delete_node",
            "search_nodes",
            "import_structured_content",
            "begin_transaction",
            "commit_transaction",
            "rollback_transaction",
            "get_pattern_schema",
            "get_activity_log",
        ] {
            assert!(names.contains(&expected), "missing tool {}", expected);
        }
    }

    #[test]
    fn test_schemas_keep_the_advertised_contract() {
        let create = ToolKind::CreateNode.input_schema();
        let required: Vec<&str> = create["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"parentId") && required.contains(&"name"));
        assert!(create["properties"]["type"].to_string().contains("subtask"));

        let close = ToolKind::CommitTransaction.input_schema();
        assert_eq!(close["required"], json!(["transactionId"]));
        assert_eq!(ToolKind::GetTreeMetadata.input_schema()["required"], json!([]));
        assert!(ToolKind::GetTree.input_schema()["properties"]["format"]
            .to_string()
            .contains("compact"));
    }

    #[test]
    fn test_every_schema_is_an_object_schema_with_tab_id() {
        for kind in ToolKind::ALL {
            let schema = kind.input_schema();
            assert_eq!(schema["type"], "object", "{}", kind.name());
            assert!(schema["properties"].is_object(), "{}", kind.name());
            assert!(schema["required"].is_array(), "{}", kind.name());
            assert_eq!(schema["properties"]["tabId"]["type"], "string");

            // Required fields must be declared properties
            for field in schema["required"].as_array().unwrap() {
                let field = field.as_str().unwrap();
                assert!(
                    schema["properties"].get(field).is_some(),
                    "{} requires undeclared {}",
                    kind.name(),
                    field
                );
            }
        }
    }

    #[test]
    fn test_name_round_trip_and_unknown() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("drop_database"), None);
    }

    #[test]
    fn test_timeout_classes() {
        assert_eq!(ToolKind::GetTree.timeout_class(), TimeoutClass::Standard);
        assert_eq!(ToolKind::CreateNode.timeout_class(), TimeoutClass::Standard);
        assert_eq!(
            ToolKind::ImportStructuredContent.timeout_class(),
            TimeoutClass::Bulk
        );
        assert_eq!(ToolKind::CommitTransaction.timeout_class(), TimeoutClass::Bulk);
        assert_eq!(ToolKind::RollbackTransaction.timeout_class(), TimeoutClass::Bulk);
    }

    #[test]
    fn test_mutation_set() {
        let mutations: Vec<&str> = ToolKind::ALL
            .iter()
            .filter(|k| k.is_mutation())
            .map(|k| k.name())
            .collect();
        assert_eq!(
            mutations,
            vec!["create_node", "update_node", "delete_node", "import_structured_content"]
        );
    }

    #[test]
    fn test_prepare_strips_tab_id() {
        let call = PreparedCall::new(
            "get_node",
            json!({"nodeId": "n-1", "tabId": "tab-2"}),
        )
        .unwrap();
        assert_eq!(call.kind, ToolKind::GetNode);
        assert_eq!(call.tab_id.as_deref(), Some("tab-2"));
        assert_eq!(
            call.args,
            ToolArgs::GetNode(GetNodeParams {
                node_id: "n-1".to_string()
            })
        );
        assert_eq!(call.args.to_params().unwrap(), json!({"nodeId": "n-1"}));
    }

    #[test]
    fn test_prepare_rejects_non_string_tab_id() {
        let err = PreparedCall::new("get_tree", json!({"tabId": 3})).unwrap_err();
        match err {
            BridgeError::Validation { field, .. } => assert_eq!(field, "tabId"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_forwarded_params_drop_unknown_properties() {
        let call = PreparedCall::new(
            "create_node",
            json!({"parentId": "root", "name": "Phase 1", "colour": "red"}),
        )
        .unwrap();
        assert_eq!(
            call.args.to_params().unwrap(),
            json!({"parentId": "root", "name": "Phase 1"})
        );
    }

    #[test]
    fn test_prepare_unknown_tool() {
        let err = PreparedCall::new("rm_rf", json!({})).unwrap_err();
        assert_eq!(err, BridgeError::UnknownTool("rm_rf".to_string()));
    }

    #[test]
    fn test_prepare_reports_failing_field() {
        let err = PreparedCall::new("create_node", json!({"parentId": "root"})).unwrap_err();
        assert_eq!(
            err,
            BridgeError::validation("name", "is required")
        );
    }
}
