//! Tests for MCP Initialize Handler

use super::*;
use serde_json::json;

#[test]
fn test_initialize_success() {
    let params = json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {},
        "clientInfo": {
            "name": "test-client",
            "version": "1.0.0"
        }
    });

    let result = handle_initialize(params).unwrap();

    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "treelisty-mcp-bridge");
    assert!(result["serverInfo"]["version"].is_string());
    assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    assert!(result["capabilities"]["resources"].is_object());
    assert!(result["instructions"].as_str().unwrap().contains("tabId"));
}

#[test]
fn test_initialize_each_supported_version_is_echoed() {
    for version in SUPPORTED_PROTOCOL_VERSIONS {
        let result = handle_initialize(json!({ "protocolVersion": version })).unwrap();
        assert_eq!(result["protocolVersion"], *version);
    }
}

#[test]
fn test_initialize_unknown_version_gets_latest() {
    let result = handle_initialize(json!({ "protocolVersion": "1999-01-01" })).unwrap();
    assert_eq!(result["protocolVersion"], "2025-06-18");
}

#[test]
fn test_initialize_missing_version() {
    let err = handle_initialize(json!({ "clientInfo": { "name": "test-client" } })).unwrap_err();
    assert_eq!(err.code, crate::mcp::types::INVALID_PARAMS);
    assert!(err.message.contains("protocolVersion"));
}
