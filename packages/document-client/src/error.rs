//! Document Client Errors
//!
//! [`ClientError`] covers the connection itself; [`AdapterError`] is what a
//! document reports for one request and travels back to the bridge as the
//! `error` of a `response` message.

use thiserror::Error;
use treelisty_mcp_core::bridge::protocol::RemoteError;
use treelisty_mcp_core::mcp::params::ArgumentError;

/// Stable codes reported by document adapters
pub mod codes {
    pub use treelisty_mcp_core::bridge::protocol::{
        CODE_NO_ACTIVE_TRANSACTION as NO_ACTIVE_TRANSACTION,
        CODE_TRANSACTION_MISMATCH as TRANSACTION_MISMATCH,
    };

    pub const NODE_NOT_FOUND: &str = "NODE_NOT_FOUND";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const INVALID_CHILD_TYPE: &str = "INVALID_CHILD_TYPE";
    pub const CANNOT_DELETE_ROOT: &str = "CANNOT_DELETE_ROOT";
    pub const IMPORT_FAILED: &str = "IMPORT_FAILED";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    pub const TRANSACTION_ALREADY_ACTIVE: &str = "TRANSACTION_ALREADY_ACTIVE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to bridge at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Bridge rejected authentication: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Another connection took over this tab: {reason}")]
    Superseded { reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether the run loop should give up instead of retrying
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::AuthenticationFailed { .. } | ClientError::Superseded { .. }
        )
    }
}

/// Failure of one document operation
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct AdapterError {
    pub code: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn node_not_found(id: &str) -> Self {
        Self::new(codes::NODE_NOT_FOUND, format!("Node not found: {}", id))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Unknown method: {}", method))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }
}

impl From<ArgumentError> for AdapterError {
    fn from(err: ArgumentError) -> Self {
        AdapterError::invalid_params(format!("Invalid parameters: {}", err))
    }
}

impl From<AdapterError> for RemoteError {
    fn from(err: AdapterError) -> Self {
        RemoteError {
            message: err.message,
            code: Some(err.code),
        }
    }
}
