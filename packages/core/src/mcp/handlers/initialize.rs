//! MCP Initialize Handler
//!
//! Handles the MCP initialization handshake and capability discovery.
//! This is the first method called when an agent connects.

use crate::mcp::types::MCPError;
use serde_json::{json, Value};

/// Supported MCP protocol versions, newest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Server name reported in `serverInfo`
pub const SERVER_NAME: &str = "treelisty-mcp-bridge";

const INSTRUCTIONS: &str = "Tools operate on a TreeListy project open in a browser tab. \
Nodes form a hierarchy root > phase > item > subtask. \
If several tabs are connected, pass tabId to choose one. \
Wrap multi-step edits in begin_transaction / commit_transaction so the user can undo them in one step.";

/// Handle MCP initialize request
///
/// Echoes the agent's protocol version when supported; otherwise answers
/// with the newest version this server speaks and lets the agent decide
/// whether to continue.
///
/// # Errors
///
/// Returns invalid params if `protocolVersion` is missing.
pub fn handle_initialize(params: Value) -> Result<Value, MCPError> {
    let client_version = params["protocolVersion"]
        .as_str()
        .ok_or_else(|| MCPError::invalid_params("Missing protocolVersion parameter".to_string()))?;

    let negotiated = if SUPPORTED_PROTOCOL_VERSIONS.contains(&client_version) {
        client_version
    } else {
        SUPPORTED_PROTOCOL_VERSIONS[0]
    };

    Ok(json!({
        "protocolVersion": negotiated,
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {
            "tools": {
                "listChanged": false
            },
            "resources": {}
        },
        "instructions": INSTRUCTIONS
    }))
}

#[cfg(test)]
#[path = "initialize_test.rs"]
mod initialize_test;
