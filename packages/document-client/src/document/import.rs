//! Structured content import: indented outlines and JSON trees

use super::tree::{NodeType, TreeNode};
use crate::error::{codes, AdapterError};
use serde_json::{Map, Value};

const TAB_WIDTH: usize = 4;

/// Parsed node before types are assigned
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImportedNode {
    pub name: String,
    pub node_type: Option<NodeType>,
    pub description: Option<String>,
    pub fields: Map<String, Value>,
    pub children: Vec<ImportedNode>,
}

impl ImportedNode {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ImportedNode::count).sum::<usize>()
    }
}

fn import_error(message: impl Into<String>) -> AdapterError {
    AdapterError::new(codes::IMPORT_FAILED, message)
}

/// Parse an indented outline; nesting follows indentation, bullets are optional
///
/// ```text
/// Design
///   - Wireframes
///     - Login screen
/// Build
/// ```
pub fn parse_outline(content: &str) -> Result<Vec<ImportedNode>, AdapterError> {
    let mut roots = Vec::new();
    let mut stack: Vec<(usize, ImportedNode)> = Vec::new();

    for line in content.lines() {
        let indent: usize = line
            .chars()
            .take_while(|c| c.is_whitespace())
            .map(|c| if c == '\t' { TAB_WIDTH } else { 1 })
            .sum();
        let text = strip_bullet(line.trim());
        if text.is_empty() {
            continue;
        }

        while stack.last().is_some_and(|(top, _)| *top >= indent) {
            if let Some((_, node)) = stack.pop() {
                attach(node, &mut stack, &mut roots);
            }
        }
        stack.push((indent, ImportedNode::named(text)));
    }
    while let Some((_, node)) = stack.pop() {
        attach(node, &mut stack, &mut roots);
    }

    if roots.is_empty() {
        return Err(import_error("Outline contains no entries"));
    }
    Ok(roots)
}

fn attach(node: ImportedNode, stack: &mut [(usize, ImportedNode)], roots: &mut Vec<ImportedNode>) {
    match stack.last_mut() {
        Some((_, parent)) => parent.children.push(node),
        None => roots.push(node),
    }
}

fn strip_bullet(text: &str) -> &str {
    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = text.strip_prefix(bullet) {
            return rest.trim();
        }
    }
    if text == "-" || text == "*" || text == "+" {
        return "";
    }
    text
}

/// Parse a JSON tree: a node object, an array of node objects, or an object
/// whose `children` are the nodes to import
pub fn parse_json(content: &str) -> Result<Vec<ImportedNode>, AdapterError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| import_error(format!("Invalid JSON: {}", e)))?;

    let nodes = match &value {
        Value::Array(items) => parse_json_nodes(items, "")?,
        Value::Object(map) if map.contains_key("name") || map.contains_key("title") => {
            vec![parse_json_node(&value, "")?]
        }
        Value::Object(map) => match map.get("children") {
            Some(Value::Array(items)) => parse_json_nodes(items, "children")?,
            _ => return Err(import_error("JSON object has no name and no children")),
        },
        _ => return Err(import_error("JSON content must be an object or an array")),
    };

    if nodes.is_empty() {
        return Err(import_error("JSON content contains no nodes"));
    }
    Ok(nodes)
}

fn parse_json_nodes(items: &[Value], path: &str) -> Result<Vec<ImportedNode>, AdapterError> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_json_node(item, &format!("{}[{}]", path, i)))
        .collect()
}

fn parse_json_node(value: &Value, path: &str) -> Result<ImportedNode, AdapterError> {
    let Value::Object(map) = value else {
        return Err(import_error(format!("{}: node must be an object", at(path))));
    };

    let name = map
        .get("name")
        .or_else(|| map.get("title"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| import_error(format!("{}: node needs a non-empty name", at(path))))?;

    let node_type = match map.get("type").and_then(Value::as_str) {
        None => None,
        Some(raw) => Some(NodeType::parse(raw).ok_or_else(|| {
            import_error(format!("{}: unknown node type '{}'", at(path), raw))
        })?),
    };

    let fields = match map.get("fields") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(fields)) => fields.clone(),
        Some(_) => return Err(import_error(format!("{}: fields must be an object", at(path)))),
    };

    let children = match map.get("children") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => parse_json_nodes(items, &format!("{}.children", path))?,
        Some(_) => return Err(import_error(format!("{}: children must be an array", at(path)))),
    };

    Ok(ImportedNode {
        name: name.to_string(),
        node_type,
        description: map
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        fields,
        children,
    })
}

fn at(path: &str) -> &str {
    if path.is_empty() {
        "content"
    } else {
        path
    }
}

/// Turn parsed nodes into tree nodes under a parent of `parent_type`
///
/// Types follow the hierarchy; an explicit type that disagrees with it is
/// rejected rather than coerced.
pub fn build_nodes(
    nodes: Vec<ImportedNode>,
    parent_type: NodeType,
) -> Result<Vec<TreeNode>, AdapterError> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }
    let Some(child_type) = parent_type.child_type() else {
        return Err(AdapterError::new(
            codes::INVALID_CHILD_TYPE,
            format!("A {} cannot have children", parent_type.as_str()),
        ));
    };

    nodes
        .into_iter()
        .map(|node| {
            if let Some(requested) = node.node_type {
                if requested != child_type {
                    return Err(AdapterError::new(
                        codes::INVALID_CHILD_TYPE,
                        format!(
                            "'{}' cannot be a {} under a {}; expected {}",
                            node.name,
                            requested.as_str(),
                            parent_type.as_str(),
                            child_type.as_str()
                        ),
                    ));
                }
            }
            let mut built = TreeNode::new(child_type, node.name);
            built.description = node.description;
            built.fields = node.fields;
            built.children = build_nodes(node.children, child_type)?;
            Ok(built)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outline_nesting_by_indentation() {
        let outline = "Design\n  - Wireframes\n    - Login screen\n  - Mockups\n\nBuild\n";
        let nodes = parse_outline(outline).unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "Design");
        assert_eq!(nodes[0].children.len(), 2);
        assert_eq!(nodes[0].children[0].children[0].name, "Login screen");
        assert_eq!(nodes[0].children[1].name, "Mockups");
        assert_eq!(nodes[1].name, "Build");
        assert_eq!(nodes.iter().map(ImportedNode::count).sum::<usize>(), 5);
    }

    #[test]
    fn test_outline_tabs_and_bullets() {
        let nodes = parse_outline("* Phase\n\t+ Item\n").unwrap();
        assert_eq!(nodes[0].name, "Phase");
        assert_eq!(nodes[0].children[0].name, "Item");
    }

    #[test]
    fn test_empty_outline_is_rejected() {
        let err = parse_outline("  \n -\n").unwrap_err();
        assert_eq!(err.code, codes::IMPORT_FAILED);
    }

    #[test]
    fn test_json_shapes() {
        let array = parse_json(r#"[{"name": "A"}, {"title": "B", "children": [{"name": "B1"}]}]"#)
            .unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[1].children[0].name, "B1");

        let single = parse_json(r#"{"name": "Solo", "type": "phase", "fields": {"k": 1}}"#).unwrap();
        assert_eq!(single[0].node_type, Some(NodeType::Phase));
        assert_eq!(single[0].fields["k"], 1);

        let wrapped = parse_json(r#"{"children": [{"name": "C"}]}"#).unwrap();
        assert_eq!(wrapped[0].name, "C");
    }

    #[test]
    fn test_json_errors_name_the_path() {
        let err = parse_json(r#"[{"name": "A", "children": [{"description": "x"}]}]"#).unwrap_err();
        assert!(err.message.contains("[0].children[0]"), "{}", err.message);

        assert!(parse_json("not json").is_err());
        assert!(parse_json("42").is_err());
    }

    #[test]
    fn test_build_assigns_types_from_parent() {
        let nodes = parse_outline("Phase\n  Item\n    Subtask\n").unwrap();
        let built = build_nodes(nodes, NodeType::Root).unwrap();
        assert_eq!(built[0].node_type, NodeType::Phase);
        assert_eq!(built[0].children[0].node_type, NodeType::Item);
        assert_eq!(built[0].children[0].children[0].node_type, NodeType::Subtask);
    }

    #[test]
    fn test_build_rejects_too_deep_and_wrong_types() {
        let deep = parse_outline("a\n b\n  c\n   d\n").unwrap();
        let err = build_nodes(deep, NodeType::Root).unwrap_err();
        assert_eq!(err.code, codes::INVALID_CHILD_TYPE);

        let wrong = parse_json(r#"{"name": "X", "type": "subtask"}"#).unwrap();
        let err = build_nodes(wrong, NodeType::Root).unwrap_err();
        assert_eq!(err.code, codes::INVALID_CHILD_TYPE);

        let leaf = parse_outline("a\n").unwrap();
        assert!(build_nodes(leaf, NodeType::Subtask).is_err());
        assert!(build_nodes(Vec::new(), NodeType::Subtask).unwrap().is_empty());
    }
}
