//! Tests for MCP Tools Handler
//!
//! Tests tools/list and tools/call envelopes against the MCP protocol shape.

use super::*;
use crate::config::BridgeConfig;
use crate::mcp::types::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use serde_json::json;

async fn call(bridge: &Bridge, params: Value) -> Result<Value, MCPError> {
    let outcome = match start_tools_call(bridge, None, params) {
        Ok(in_flight) => in_flight.finish().await,
        Err(err) => Err(err),
    };
    tool_result(outcome)
}

#[test]
fn test_tools_list_returns_all_schemas() {
    let response = handle_tools_list(json!({})).unwrap();
    let tools = response["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 14);

    let tool_names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(tool_names.contains(&"get_tree"));
    assert!(tool_names.contains(&"begin_transaction"));
    assert!(tool_names.contains(&"import_structured_content"));
    assert!(tool_names.contains(&"get_activity_log"));
}

#[test]
fn test_tools_list_tool_schema_structure() {
    let result = handle_tools_list(json!({})).unwrap();

    for tool in result["tools"].as_array().unwrap() {
        assert!(tool["name"].is_string(), "Tool missing name");
        assert!(tool["description"].is_string(), "Tool missing description");
        assert!(tool["inputSchema"].is_object(), "Tool missing inputSchema");
        assert_eq!(
            tool["inputSchema"]["type"], "object",
            "inputSchema type must be object"
        );
    }
}

#[tokio::test]
async fn test_tools_call_with_unknown_tool() {
    let bridge = Bridge::new(BridgeConfig::default());
    let err = call(&bridge, json!({"name": "unknown_tool", "arguments": {}}))
        .await
        .unwrap_err();

    assert_eq!(err.code, METHOD_NOT_FOUND);
    assert!(err.message.contains("unknown_tool"));
}

#[tokio::test]
async fn test_tools_call_missing_name() {
    let bridge = Bridge::new(BridgeConfig::default());
    let err = call(&bridge, json!({"arguments": {}}))
        .await
        .unwrap_err();
    assert_eq!(err.code, INVALID_PARAMS);
    assert_eq!(err.data.unwrap()["field"], "name");
}

#[tokio::test]
async fn test_tools_call_validation_names_field() {
    let bridge = Bridge::new(BridgeConfig::default());
    let err = call(
        &bridge,
        json!({"name": "search_nodes", "arguments": {"query": "x", "limit": "ten"}}),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code, INVALID_PARAMS);
    let data = err.data.unwrap();
    assert_eq!(data["field"], "limit");
    assert!(data["reason"].as_str().unwrap().starts_with("invalid type: string"));
}

#[tokio::test]
async fn test_tools_call_without_document_is_tool_error() {
    let bridge = Bridge::new(BridgeConfig::default());
    let result = call(&bridge, json!({"name": "get_tree"}))
        .await
        .unwrap();

    assert_eq!(result["isError"], true);
    assert_eq!(
        result["content"][0]["text"],
        "No document instance connected"
    );
    assert_eq!(result["structuredContent"]["error"]["code"], "NO_TARGET");
}

#[test]
fn test_success_envelope() {
    let data = json!({"id": "root", "name": "Test Project"});
    let result = tool_result(Ok(data.clone())).unwrap();

    assert_eq!(result["isError"], false);
    assert_eq!(result["content"][0]["type"], "text");
    let text: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(text, data);
    assert_eq!(result["structuredContent"], data);
}

#[test]
fn test_transaction_error_envelope_names_active_id() {
    let result = tool_result(Err(BridgeError::TransactionAlreadyActive {
        active_id: "tx-1".to_string(),
    }))
    .unwrap();

    assert_eq!(result["isError"], true);
    let error = &result["structuredContent"]["error"];
    assert_eq!(error["code"], "TRANSACTION_ALREADY_ACTIVE");
    assert_eq!(error["transactionId"], "tx-1");
}

#[test]
fn test_timeout_and_disconnect_are_distinct() {
    let timeout = tool_result(Err(BridgeError::Timeout {
        method: "get_tree".to_string(),
        timeout_ms: 15000,
    }))
    .unwrap();
    let gone = tool_result(Err(BridgeError::PeerDisconnected {
        client_id: "tab-1".to_string(),
    }))
    .unwrap();

    assert_eq!(timeout["structuredContent"]["error"]["code"], "TIMEOUT");
    assert_eq!(gone["structuredContent"]["error"]["code"], "PEER_DISCONNECTED");
}

#[test]
fn test_internal_error_is_protocol_error() {
    let err = tool_result(Err(BridgeError::internal("boom"))).unwrap_err();
    assert_eq!(err.code, INTERNAL_ERROR);
}
