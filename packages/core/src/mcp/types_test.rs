//! JSON-RPC envelope tests for the stdio transport

use super::*;
use serde_json::json;

#[test]
fn test_parse_numeric_id_request() {
    let json_str = r#"{
        "jsonrpc": "2.0",
        "id": 123,
        "method": "tools/call",
        "params": {
            "name": "get_node",
            "arguments": {"nodeId": "phase-1"}
        }
    }"#;

    let request: MCPRequest = serde_json::from_str(json_str).unwrap();

    assert_eq!(request.jsonrpc, "2.0");
    assert_eq!(request.id, Some(RequestId::Number(123)));
    assert_eq!(request.method, "tools/call");
    assert_eq!(request.params["arguments"]["nodeId"], "phase-1");
}

#[test]
fn test_parse_string_id_request() {
    let json_str = r#"{"jsonrpc":"2.0","id":"abc-1","method":"tools/list"}"#;

    let request: MCPRequest = serde_json::from_str(json_str).unwrap();

    assert_eq!(request.id, Some(RequestId::String("abc-1".to_string())));
    assert!(request.params.is_null());
}

#[test]
fn test_parse_notification_has_no_id() {
    let json_str = r#"{"jsonrpc":"2.0","method":"notifications/initialized","params":{}}"#;

    let request: MCPRequest = serde_json::from_str(json_str).unwrap();
    assert!(request.id.is_none());
}

#[test]
fn test_parse_request_missing_jsonrpc() {
    let json_str = r#"{
        "id": 123,
        "method": "tools/list",
        "params": {}
    }"#;

    let result: Result<MCPRequest, _> = serde_json::from_str(json_str);
    assert!(result.is_err());
}

#[test]
fn test_serialize_success_response() {
    let response = MCPResponse::success(Some(RequestId::Number(42)), json!({"tools": []}));

    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["jsonrpc"], "2.0");
    assert_eq!(json["id"], 42);
    assert!(json["result"]["tools"].is_array());
    assert!(json.get("error").is_none()); // Should be omitted
}

#[test]
fn test_serialize_error_response_with_data() {
    let response = MCPResponse::error(
        Some(RequestId::String("req-9".to_string())),
        MCPError::invalid_params("Missing required field: nodeId".to_string())
            .with_data(json!({"field": "nodeId"})),
    );

    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["id"], "req-9");
    assert_eq!(json["error"]["code"], INVALID_PARAMS);
    assert_eq!(json["error"]["data"]["field"], "nodeId");
    assert!(json.get("result").is_none());
}

#[test]
fn test_parse_error_response_has_null_id() {
    let response = MCPResponse::error(None, MCPError::parse_error("Invalid JSON".to_string()));

    let json = serde_json::to_value(&response).unwrap();
    assert!(json["id"].is_null());
    assert_eq!(json["error"]["code"], PARSE_ERROR);
    assert!(json["error"].get("data").is_none());
}

#[test]
fn test_request_id_display_keeps_original_form() {
    assert_eq!(RequestId::Number(7).to_string(), "7");
    assert_eq!(RequestId::String("req-7".to_string()).to_string(), "req-7");
}

#[test]
fn test_method_not_found_names_method() {
    let err = MCPError::method_not_found("tools/explode");
    assert_eq!(err.code, METHOD_NOT_FOUND);
    assert!(err.message.contains("tools/explode"));
}
