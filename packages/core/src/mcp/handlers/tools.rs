//! MCP Tools Handler
//!
//! Implements MCP-compliant tools/list and tools/call methods on top of the
//! bridge's fixed tool catalog.
//!
//! ## Error surfacing
//!
//! Failures found before dispatch (unknown tool, bad arguments) are JSON-RPC
//! errors. Everything that goes wrong after that (routing, timeouts,
//! disconnects, transaction state, document-reported errors) is a successful
//! response carrying `isError: true`, per the MCP tool-result convention.

use crate::bridge::{Bridge, BridgeError, InFlight, SessionId};
use crate::mcp::catalog::{tool_definitions, PreparedCall};
use crate::mcp::types::MCPError;
use serde_json::{json, Value};
use tracing::debug;

/// Handle tools/list: every catalog entry with its input schema
pub fn handle_tools_list(_params: Value) -> Result<Value, MCPError> {
    Ok(json!({ "tools": tool_definitions() }))
}

/// Synchronous half of tools/call: validate, route and send
///
/// The returned [`InFlight`] is already on the target's queue.
pub fn start_tools_call(
    bridge: &Bridge,
    origin: Option<&SessionId>,
    params: Value,
) -> Result<InFlight, BridgeError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::validation("name", "is required"))?;
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

    let call = PreparedCall::new(name, arguments)?;
    debug!("🔧 tools/call '{}' (tabId: {:?})", name, call.tab_id);
    bridge.dispatch_tool(origin, call)
}

/// Format a call outcome as a tools/call result (or JSON-RPC error)
pub fn tool_result(outcome: Result<Value, BridgeError>) -> Result<Value, MCPError> {
    match outcome {
        Err(err) if err.is_protocol_error() => Err(err.into()),
        other => Ok(tool_result_value(other)),
    }
}

/// Format a call outcome as a tool-result envelope, errors included
pub fn tool_result_value(outcome: Result<Value, BridgeError>) -> Value {
    match outcome {
        Ok(data) => {
            let text = serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());
            json!({
                "content": [{
                    "type": "text",
                    "text": text
                }],
                "isError": false,
                "structuredContent": data
            })
        }
        Err(err) => json!({
            "content": [{
                "type": "text",
                "text": err.to_string()
            }],
            "isError": true,
            "structuredContent": {
                "error": err.to_json()
            }
        }),
    }
}

#[cfg(test)]
#[path = "tools_test.rs"]
mod tools_test;
