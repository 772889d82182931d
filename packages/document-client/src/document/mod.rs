//! In-Memory Reference Document
//!
//! [`MemoryDocument`] is a complete [`DocumentAdapter`]: it holds one tree,
//! an undo/redo history of checkpoints, an activity log and a pattern name.
//! It backs the `dev-document` binary and the end-to-end tests, and pins down
//! the document-side half of the transaction contract:
//!
//! - a mutation outside a transaction pushes one undo checkpoint
//! - mutations inside a transaction push none
//! - commit pushes the single pre-transaction checkpoint
//! - rollback restores it

pub mod import;
pub mod tree;

pub use tree::{NodeType, TreeFormat, TreeNode, ROOT_ID};

use crate::adapter::DocumentAdapter;
use crate::error::{codes, AdapterError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use treelisty_mcp_core::mcp::params::{
    parse_arguments, CreateNodeParams, DeleteNodeParams, GetActivityLogParams, GetNodeParams,
    GetPatternSchemaParams, GetSubtreeParams, GetTreeParams, ImportFormat, ImportMode,
    ImportParams, NodeUpdates, SearchNodesParams, UpdateNodeParams,
};

pub const ACTIVITY_LOG_CAPACITY: usize = 200;
pub const MAX_UNDO_DEPTH: usize = 100;
pub const DEFAULT_PATTERN: &str = "generic";

const DEFAULT_SEARCH_LIMIT: u32 = 20;
const DEFAULT_ACTIVITY_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Checkpoint {
    label: String,
    tree: TreeNode,
}

#[derive(Debug)]
struct OpenTransaction {
    id: String,
    label: Option<String>,
    before: TreeNode,
    mutations: usize,
}

#[derive(Debug)]
struct DocumentState {
    root: TreeNode,
    pattern: String,
    pattern_schema: Value,
    undo: Vec<Checkpoint>,
    redo: Vec<Checkpoint>,
    activity: VecDeque<ActivityEntry>,
    transaction: Option<OpenTransaction>,
    modified_at: DateTime<Utc>,
}

/// Result of a successful mutation before it is recorded
struct Applied {
    result: Value,
    label: String,
    node_id: Option<String>,
}

pub struct MemoryDocument {
    state: Mutex<DocumentState>,
}

impl MemoryDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_tree(TreeNode::root(name))
    }

    pub fn from_tree(root: TreeNode) -> Self {
        Self {
            state: Mutex::new(DocumentState {
                root,
                pattern: DEFAULT_PATTERN.to_string(),
                pattern_schema: json!({}),
                undo: Vec::new(),
                redo: Vec::new(),
                activity: VecDeque::new(),
                transaction: None,
                modified_at: Utc::now(),
            }),
        }
    }

    /// Set the pattern name and the schema `get_pattern_schema` serves for it
    pub fn with_pattern(self, pattern: impl Into<String>, schema: Value) -> Self {
        {
            let mut state = self.lock();
            state.pattern = pattern.into();
            state.pattern_schema = schema;
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tree(&self) -> TreeNode {
        self.lock().root.clone()
    }

    pub fn pattern(&self) -> String {
        self.lock().pattern.clone()
    }

    pub fn undo_depth(&self) -> usize {
        self.lock().undo.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.lock().redo.len()
    }

    pub fn active_transaction(&self) -> Option<String> {
        self.lock().transaction.as_ref().map(|tx| tx.id.clone())
    }

    /// Activity, newest first
    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.lock().activity.iter().rev().cloned().collect()
    }

    /// Revert the latest checkpoint; unavailable while a transaction is open
    pub fn undo(&self) -> bool {
        let mut state = self.lock();
        if state.transaction.is_some() {
            return false;
        }
        let Some(checkpoint) = state.undo.pop() else {
            return false;
        };
        let current = std::mem::replace(&mut state.root, checkpoint.tree);
        state.redo.push(Checkpoint {
            label: checkpoint.label.clone(),
            tree: current,
        });
        state.touch();
        state.log("undo", checkpoint.label, None, None);
        true
    }

    pub fn redo(&self) -> bool {
        let mut state = self.lock();
        if state.transaction.is_some() {
            return false;
        }
        let Some(checkpoint) = state.redo.pop() else {
            return false;
        };
        let current = std::mem::replace(&mut state.root, checkpoint.tree);
        state.undo.push(Checkpoint {
            label: checkpoint.label.clone(),
            tree: current,
        });
        state.touch();
        state.log("redo", checkpoint.label, None, None);
        true
    }

    /// Run one catalog method other than the transaction controls
    pub fn apply(
        &self,
        method: &str,
        params: &Value,
        transaction_id: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let mut state = self.lock();
        match method {
            "get_tree" => state.get_tree(params),
            "get_tree_metadata" => Ok(state.metadata()),
            "get_subtree" => state.get_subtree(params),
            "get_node" => state.get_node(params),
            "search_nodes" => state.search(params),
            "get_pattern_schema" => state.pattern_schema(params),
            "get_activity_log" => state.activity_log(params),
            "create_node" => state.mutate(transaction_id, |s| s.create_node(params)),
            "update_node" => state.mutate(transaction_id, |s| s.update_node(params)),
            "delete_node" => state.mutate(transaction_id, |s| s.delete_node(params)),
            "import_structured_content" => state.mutate(transaction_id, |s| s.import(params)),
            other => Err(AdapterError::method_not_found(other)),
        }
    }

    pub fn begin(&self, transaction_id: &str, label: Option<&str>) -> Result<Value, AdapterError> {
        let mut state = self.lock();
        if let Some(open) = &state.transaction {
            return Err(AdapterError::new(
                codes::TRANSACTION_ALREADY_ACTIVE,
                format!("Transaction {} is already active", open.id),
            ));
        }
        let before = state.root.clone();
        state.transaction = Some(OpenTransaction {
            id: transaction_id.to_string(),
            label: label.map(str::to_string),
            before,
            mutations: 0,
        });
        state.log(
            "begin_transaction",
            label.unwrap_or("transaction").to_string(),
            None,
            Some(transaction_id.to_string()),
        );
        Ok(json!({ "transactionId": transaction_id, "began": true }))
    }

    pub fn commit(&self, transaction_id: &str) -> Result<Value, AdapterError> {
        let mut state = self.lock();
        let open = state.take_transaction(transaction_id)?;
        let label = open.label.unwrap_or_else(|| "Transaction".to_string());

        let checkpoint_created = open.before != state.root;
        if checkpoint_created {
            state.push_checkpoint(Checkpoint {
                label: label.clone(),
                tree: open.before,
            });
        }
        state.log(
            "commit_transaction",
            format!("{} ({} changes)", label, open.mutations),
            None,
            Some(open.id.clone()),
        );
        Ok(json!({
            "transactionId": open.id,
            "checkpoint": label,
            "checkpointCreated": checkpoint_created,
            "mutationCount": open.mutations,
            "undoDepth": state.undo.len(),
        }))
    }

    pub fn rollback(&self, transaction_id: &str) -> Result<Value, AdapterError> {
        let mut state = self.lock();
        let open = state.take_transaction(transaction_id)?;
        state.root = open.before;
        state.touch();
        state.log(
            "rollback_transaction",
            format!("discarded {} changes", open.mutations),
            None,
            Some(open.id.clone()),
        );
        Ok(json!({
            "transactionId": open.id,
            "restored": true,
            "discardedMutations": open.mutations,
        }))
    }
}

#[async_trait]
impl DocumentAdapter for MemoryDocument {
    async fn execute(
        &self,
        method: &str,
        params: Value,
        transaction_id: Option<&str>,
    ) -> Result<Value, AdapterError> {
        debug!("📄 {} (transaction: {:?})", method, transaction_id);
        self.apply(method, &params, transaction_id)
    }

    async fn begin_transaction(
        &self,
        transaction_id: &str,
        label: Option<&str>,
    ) -> Result<Value, AdapterError> {
        self.begin(transaction_id, label)
    }

    async fn commit_transaction(&self, transaction_id: &str) -> Result<Value, AdapterError> {
        self.commit(transaction_id)
    }

    async fn rollback_transaction(&self, transaction_id: &str) -> Result<Value, AdapterError> {
        self.rollback(transaction_id)
    }
}

impl DocumentState {
    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    fn log(
        &mut self,
        action: &str,
        detail: String,
        node_id: Option<String>,
        transaction_id: Option<String>,
    ) {
        if self.activity.len() == ACTIVITY_LOG_CAPACITY {
            self.activity.pop_front();
        }
        self.activity.push_back(ActivityEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            detail,
            node_id,
            transaction_id,
        });
    }

    fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        if self.undo.len() == MAX_UNDO_DEPTH {
            self.undo.remove(0);
        }
        self.undo.push(checkpoint);
        self.redo.clear();
    }

    fn take_transaction(&mut self, transaction_id: &str) -> Result<OpenTransaction, AdapterError> {
        let Some(open) = &self.transaction else {
            return Err(AdapterError::new(
                codes::NO_ACTIVE_TRANSACTION,
                "No transaction is active",
            ));
        };
        if open.id != transaction_id {
            return Err(AdapterError::new(
                codes::TRANSACTION_MISMATCH,
                format!(
                    "Transaction {} does not match active transaction {}",
                    transaction_id, open.id
                ),
            ));
        }
        self.transaction
            .take()
            .ok_or_else(|| AdapterError::internal("transaction vanished while closing"))
    }

    /// Apply a mutation, checkpointing it unless a transaction is open
    ///
    /// A tagged mutation must name the open transaction. Untagged mutations
    /// made while one is open (a human editing alongside) join its batch.
    fn mutate(
        &mut self,
        transaction_id: Option<&str>,
        change: impl FnOnce(&mut Self) -> Result<Applied, AdapterError>,
    ) -> Result<Value, AdapterError> {
        match (transaction_id, &self.transaction) {
            (Some(tagged), None) => {
                return Err(AdapterError::new(
                    codes::NO_ACTIVE_TRANSACTION,
                    format!("Transaction {} is not active", tagged),
                ))
            }
            (Some(tagged), Some(open)) if open.id != tagged => {
                return Err(AdapterError::new(
                    codes::TRANSACTION_MISMATCH,
                    format!("Transaction {} is not the active transaction", tagged),
                ))
            }
            _ => {}
        }

        let before = self.transaction.is_none().then(|| self.root.clone());
        let applied = change(self)?;

        let transaction_id = if let Some(open) = self.transaction.as_mut() {
            open.mutations += 1;
            Some(open.id.clone())
        } else {
            if let Some(tree) = before {
                self.push_checkpoint(Checkpoint {
                    label: applied.label.clone(),
                    tree,
                });
            }
            None
        };
        self.touch();
        self.log("mutation", applied.label, applied.node_id, transaction_id);
        Ok(applied.result)
    }

    fn find(&self, id: &str) -> Result<&TreeNode, AdapterError> {
        self.root
            .find(id)
            .ok_or_else(|| AdapterError::node_not_found(id))
    }

    fn get_tree(&self, params: &Value) -> Result<Value, AdapterError> {
        let GetTreeParams { format } = parse(params)?;
        Ok(self.root.to_view(format.unwrap_or_default()))
    }

    fn metadata(&self) -> Value {
        let (mut phases, mut items, mut subtasks) = (0usize, 0usize, 0usize);
        self.root.walk(&mut |node, _| match node.node_type {
            NodeType::Phase => phases += 1,
            NodeType::Item => items += 1,
            NodeType::Subtask => subtasks += 1,
            NodeType::Root => {}
        });

        json!({
            "id": self.root.id,
            "name": self.root.name,
            "pattern": self.pattern,
            "nodeCounts": { "phase": phases, "item": items, "subtask": subtasks },
            "totalNodes": self.root.count(),
            "modifiedAt": self.modified_at,
            "undoDepth": self.undo.len(),
            "redoDepth": self.redo.len(),
            "activeTransaction": self.transaction.as_ref().map(|tx| tx.id.clone()),
        })
    }

    fn get_subtree(&self, params: &Value) -> Result<Value, AdapterError> {
        let GetSubtreeParams { node_id, depth } = parse(params)?;
        let node = self.find(&node_id)?;
        Ok(node.truncated(depth.map(u64::from)).to_view(TreeFormat::Full))
    }

    fn get_node(&self, params: &Value) -> Result<Value, AdapterError> {
        let GetNodeParams { node_id } = parse(params)?;
        let id = node_id.as_str();
        let node = self.find(id)?;
        let mut view = node.without_children().to_view(TreeFormat::Full);
        if let Value::Object(map) = &mut view {
            map.remove("children");
            map.insert("childCount".to_string(), json!(node.children.len()));
            map.insert("parentId".to_string(), json!(self.root.parent_of(id)));
        }
        Ok(view)
    }

    fn search(&self, params: &Value) -> Result<Value, AdapterError> {
        let SearchNodesParams {
            query,
            limit,
            types,
        } = parse(params)?;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Err(AdapterError::invalid_params("query must not be empty"));
        }
        let limit = limit.map_or(DEFAULT_SEARCH_LIMIT, NonZeroU32::get) as usize;
        let types: Option<Vec<NodeType>> =
            types.map(|types| types.into_iter().map(NodeType::from).collect());

        let mut matches = Vec::new();
        self.root.walk(&mut |node, path| {
            if types.as_ref().is_some_and(|t| !t.contains(&node.node_type)) {
                return;
            }
            let matched_in = if node.name.to_lowercase().contains(&query) {
                "name"
            } else if node
                .description
                .as_ref()
                .is_some_and(|d| d.to_lowercase().contains(&query))
            {
                "description"
            } else if node.fields.values().any(|v| field_matches(v, &query)) {
                "fields"
            } else {
                return;
            };
            matches.push(json!({
                "id": node.id,
                "type": node.node_type,
                "name": node.name,
                "path": path.join(" > "),
                "matchedIn": matched_in,
            }));
        });

        let total = matches.len();
        matches.truncate(limit);
        Ok(json!({ "results": matches, "total": total }))
    }

    fn pattern_schema(&self, params: &Value) -> Result<Value, AdapterError> {
        let GetPatternSchemaParams { pattern } = parse(params)?;
        let requested = pattern.as_deref().unwrap_or(self.pattern.as_str());
        if requested != self.pattern {
            return Err(AdapterError::invalid_params(format!(
                "Unknown pattern: {}",
                requested
            )));
        }
        Ok(json!({ "pattern": self.pattern, "schema": self.pattern_schema }))
    }

    fn activity_log(&self, params: &Value) -> Result<Value, AdapterError> {
        let GetActivityLogParams { limit } = parse(params)?;
        let limit = limit.map_or(DEFAULT_ACTIVITY_LIMIT, NonZeroU32::get) as usize;
        let entries: Vec<&ActivityEntry> = self.activity.iter().rev().take(limit).collect();
        Ok(json!({ "entries": entries, "total": self.activity.len() }))
    }

    fn create_node(&mut self, params: &Value) -> Result<Applied, AdapterError> {
        let CreateNodeParams {
            parent_id,
            name,
            node_type,
            description,
            fields,
            position,
        } = parse(params)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AdapterError::invalid_params("name must not be empty"));
        }

        let parent = self
            .root
            .find_mut(&parent_id)
            .ok_or_else(|| AdapterError::node_not_found(&parent_id))?;
        let child_type = allowed_child(parent.node_type, node_type.map(NodeType::from))?;

        let mut node = TreeNode::new(child_type, name);
        node.description = description;
        node.fields = fields.unwrap_or_default();
        let result = node.to_view(TreeFormat::Full);
        let node_id = node.id.clone();

        let index = position
            .map(|p| p.min(parent.children.len()))
            .unwrap_or(parent.children.len());
        parent.children.insert(index, node);

        Ok(Applied {
            result,
            label: format!("Create {} '{}'", child_type.as_str(), name),
            node_id: Some(node_id),
        })
    }

    fn update_node(&mut self, params: &Value) -> Result<Applied, AdapterError> {
        let UpdateNodeParams { node_id, updates } = parse(params)?;
        let NodeUpdates {
            name,
            description,
            fields,
        } = updates;
        let name = match name {
            None => None,
            Some(name) if !name.trim().is_empty() => Some(name.trim().to_string()),
            Some(_) => return Err(AdapterError::invalid_params("name must be a non-empty string")),
        };
        let id = node_id.as_str();

        let node = self
            .root
            .find_mut(id)
            .ok_or_else(|| AdapterError::node_not_found(id))?;
        if let Some(name) = name {
            node.name = name;
        }
        if let Some(description) = description {
            node.description = description;
        }
        if let Some(fields) = fields {
            for (key, value) in fields {
                if value.is_null() {
                    node.fields.remove(&key);
                } else {
                    node.fields.insert(key, value);
                }
            }
        }

        Ok(Applied {
            result: node.without_children().to_view(TreeFormat::Full),
            label: format!("Update '{}'", node.name),
            node_id: Some(node.id.clone()),
        })
    }

    fn delete_node(&mut self, params: &Value) -> Result<Applied, AdapterError> {
        let DeleteNodeParams { node_id } = parse(params)?;
        let id = node_id.as_str();
        if id == self.root.id {
            return Err(AdapterError::new(
                codes::CANNOT_DELETE_ROOT,
                "The root node cannot be deleted",
            ));
        }
        let removed = self
            .root
            .remove_descendant(id)
            .ok_or_else(|| AdapterError::node_not_found(id))?;

        Ok(Applied {
            result: json!({ "deleted": removed.id, "removedCount": removed.count() }),
            label: format!("Delete '{}'", removed.name),
            node_id: Some(removed.id),
        })
    }

    fn import(&mut self, params: &Value) -> Result<Applied, AdapterError> {
        let ImportParams {
            content,
            format,
            parent_id,
            mode,
        } = parse(params)?;
        let parsed = match format.unwrap_or_default() {
            ImportFormat::Outline => import::parse_outline(&content)?,
            ImportFormat::Json => import::parse_json(&content)?,
        };
        let replace = mode.unwrap_or_default() == ImportMode::Replace;
        let parent_id = parent_id.as_deref().unwrap_or(ROOT_ID);

        let parent = self
            .root
            .find_mut(parent_id)
            .ok_or_else(|| AdapterError::node_not_found(parent_id))?;
        let nodes = import::build_nodes(parsed, parent.node_type)?;
        let imported: usize = nodes.iter().map(TreeNode::count).sum();
        if replace {
            parent.children = nodes;
        } else {
            parent.children.extend(nodes);
        }

        Ok(Applied {
            result: json!({
                "imported": imported,
                "parentId": parent_id,
                "mode": if replace { "replace" } else { "append" },
            }),
            label: format!("Import {} nodes", imported),
            node_id: Some(parent_id.to_string()),
        })
    }
}

fn allowed_child(
    parent_type: NodeType,
    requested: Option<NodeType>,
) -> Result<NodeType, AdapterError> {
    let Some(expected) = parent_type.child_type() else {
        return Err(AdapterError::new(
            codes::INVALID_CHILD_TYPE,
            format!("A {} cannot have children", parent_type.as_str()),
        ));
    };
    match requested {
        Some(requested) if requested != expected => Err(AdapterError::new(
            codes::INVALID_CHILD_TYPE,
            format!(
                "A {} can only contain {} nodes, not {}",
                parent_type.as_str(),
                expected.as_str(),
                requested.as_str()
            ),
        )),
        _ => Ok(expected),
    }
}

fn field_matches(value: &Value, query: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(query),
        Value::Array(items) => items.iter().any(|v| field_matches(v, query)),
        _ => false,
    }
}

fn parse<T: DeserializeOwned>(params: &Value) -> Result<T, AdapterError> {
    Ok(parse_arguments(params.clone())?)
}
