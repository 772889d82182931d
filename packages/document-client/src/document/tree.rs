//! Tree model held by the reference document
//!
//! Node types form a fixed hierarchy: root > phase > item > subtask.
//! Child order is significant and preserved by every operation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use treelisty_mcp_core::mcp::params::ChildType;
use uuid::Uuid;

pub use treelisty_mcp_core::mcp::params::TreeFormat;

pub const ROOT_ID: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Root,
    Phase,
    Item,
    Subtask,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Root => "root",
            NodeType::Phase => "phase",
            NodeType::Item => "item",
            NodeType::Subtask => "subtask",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "root" => Some(NodeType::Root),
            "phase" => Some(NodeType::Phase),
            "item" => Some(NodeType::Item),
            "subtask" => Some(NodeType::Subtask),
            _ => None,
        }
    }

    /// The only type a node of this type may have as children
    pub fn child_type(&self) -> Option<NodeType> {
        match self {
            NodeType::Root => Some(NodeType::Phase),
            NodeType::Phase => Some(NodeType::Item),
            NodeType::Item => Some(NodeType::Subtask),
            NodeType::Subtask => None,
        }
    }
}

impl From<ChildType> for NodeType {
    fn from(child: ChildType) -> Self {
        match child {
            ChildType::Phase => NodeType::Phase,
            ChildType::Item => NodeType::Item,
            ChildType::Subtask => NodeType::Subtask,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            id: format!("n-{}", Uuid::new_v4()),
            node_type,
            name: name.into(),
            description: None,
            fields: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn root(name: impl Into<String>) -> Self {
        Self {
            id: ROOT_ID.to_string(),
            ..Self::new(NodeType::Root, name)
        }
    }

    pub fn find(&self, id: &str) -> Option<&TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    /// Id of the node's parent, `None` for this node itself or a missing id
    pub fn parent_of(&self, id: &str) -> Option<&str> {
        for child in &self.children {
            if child.id == id {
                return Some(&self.id);
            }
            if let Some(parent) = child.parent_of(id) {
                return Some(parent);
            }
        }
        None
    }

    /// Detach a descendant; never removes `self`
    pub fn remove_descendant(&mut self, id: &str) -> Option<TreeNode> {
        if let Some(index) = self.children.iter().position(|child| child.id == id) {
            return Some(self.children.remove(index));
        }
        self.children
            .iter_mut()
            .find_map(|child| child.remove_descendant(id))
    }

    /// This node plus all descendants
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::count).sum::<usize>()
    }

    /// Pre-order walk passing each node with the names of its ancestors
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a TreeNode, &[&'a str])) {
        fn go<'a>(
            node: &'a TreeNode,
            path: &mut Vec<&'a str>,
            visit: &mut impl FnMut(&'a TreeNode, &[&'a str]),
        ) {
            visit(node, path);
            path.push(&node.name);
            for child in &node.children {
                go(child, path, visit);
            }
            path.pop();
        }
        go(self, &mut Vec::new(), visit);
    }

    /// Copy limited to `depth` levels of children (`None` keeps everything)
    pub fn truncated(&self, depth: Option<u64>) -> TreeNode {
        let children = match depth {
            None => self.children.iter().map(|c| c.truncated(None)).collect(),
            Some(0) => Vec::new(),
            Some(n) => self.children.iter().map(|c| c.truncated(Some(n - 1))).collect(),
        };
        TreeNode {
            children,
            ..self.without_children()
        }
    }

    pub fn without_children(&self) -> TreeNode {
        TreeNode {
            id: self.id.clone(),
            node_type: self.node_type,
            name: self.name.clone(),
            description: self.description.clone(),
            fields: self.fields.clone(),
            children: Vec::new(),
        }
    }

    pub fn to_view(&self, format: TreeFormat) -> Value {
        match format {
            TreeFormat::Full => serde_json::to_value(self).unwrap_or(Value::Null),
            TreeFormat::Agent => {
                let mut view = json!({
                    "id": self.id,
                    "type": self.node_type,
                    "name": self.name,
                });
                if let Some(description) = &self.description {
                    view["description"] = json!(description);
                }
                if !self.fields.is_empty() {
                    view["fields"] = Value::Object(self.fields.clone());
                }
                if !self.children.is_empty() {
                    view["children"] = self
                        .children
                        .iter()
                        .map(|c| c.to_view(format))
                        .collect();
                }
                view
            }
            TreeFormat::Compact => {
                let mut view = json!({
                    "id": self.id,
                    "type": self.node_type,
                    "name": self.name,
                });
                if !self.children.is_empty() {
                    view["children"] = self
                        .children
                        .iter()
                        .map(|c| c.to_view(format))
                        .collect();
                }
                view
            }
        }
    }
}
