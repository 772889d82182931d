//! MCP JSON-RPC 2.0 Types
//!
//! Type definitions for the agent-facing stdio transport of the bridge.
//! Requests carry either a numeric or a string id; messages without an id
//! are notifications and never receive a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC request identifier
///
/// MCP clients are free to use numbers or strings, and the response must
/// echo back exactly what was sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// JSON-RPC 2.0 request (or notification when `id` is absent)
///
/// # Example
///
/// ```json
/// {
///     "jsonrpc": "2.0",
///     "id": 7,
///     "method": "tools/call",
///     "params": {
///         "name": "get_node",
///         "arguments": { "nodeId": "phase-1" }
///     }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct MCPRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Request identifier; `None` for notifications
    #[serde(default)]
    pub id: Option<RequestId>,

    /// Method name to invoke
    pub method: String,

    /// Method parameters (defaults to `null` when omitted)
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response structure
///
/// `id` is `null` only when the request could not be parsed far enough to
/// recover it.
#[derive(Debug, Clone, Serialize)]
pub struct MCPResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches request)
    pub id: Option<RequestId>,

    /// Success result (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<MCPError>,
}

/// JSON-RPC 2.0 error structure
#[derive(Debug, Serialize, Clone)]
pub struct MCPError {
    /// Error code (standard JSON-RPC or bridge-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Optional structured detail (e.g. which argument failed validation)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// JSON-RPC 2.0 standard error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

impl MCPError {
    /// Create a parse error
    pub fn parse_error(message: String) -> Self {
        Self {
            code: PARSE_ERROR,
            message,
            data: None,
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(message: String) -> Self {
        Self {
            code: INVALID_REQUEST,
            message,
            data: None,
        }
    }

    /// Create a method not found error
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
            data: None,
        }
    }

    /// Create an invalid params error
    pub fn invalid_params(message: String) -> Self {
        Self {
            code: INVALID_PARAMS,
            message,
            data: None,
        }
    }

    /// Create an internal error
    pub fn internal_error(message: String) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message,
            data: None,
        }
    }

    /// Attach structured detail to the error
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl MCPResponse {
    /// Create a success response
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<RequestId>, error: MCPError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;
