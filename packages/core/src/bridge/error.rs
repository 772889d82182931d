//! Bridge Error Types
//!
//! Every failure a single tool call can hit on its way to a document
//! instance and back. None of these are fatal to the bridge process; each
//! terminates only the call (or connection) it belongs to.

use crate::mcp::params::ArgumentError;
use crate::mcp::types::{MCPError, METHOD_NOT_FOUND};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors surfaced by the bridge to the agent or to a connecting peer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Bad, missing or malformed credentials at handshake
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Tool arguments did not satisfy the tool's input schema
    #[error("Invalid argument '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Tool name is not part of the catalog
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No document instance matches the call
    #[error("{}", no_target_message(.tab_id))]
    NoTarget { tab_id: Option<String> },

    /// Several document instances are open and the call named none of them
    #[error("Ambiguous target: {} document instances are connected ({}); pass tabId to choose one", .tab_ids.len(), .tab_ids.join(", "))]
    AmbiguousTarget { tab_ids: Vec<String> },

    /// The target accepted the request but never answered in time
    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The target session went away while the request was in flight
    #[error("Document instance '{client_id}' disconnected before responding")]
    PeerDisconnected { client_id: String },

    #[error("Transaction already active: {active_id}")]
    TransactionAlreadyActive { active_id: String },

    #[error("Transaction mismatch: '{requested}' is not the active transaction (active: {active_id})")]
    TransactionMismatch {
        active_id: String,
        requested: String,
    },

    #[error("No active transaction for document instance '{client_id}'")]
    NoActiveTransaction { client_id: String },

    /// Commit or rollback of this transaction is already in flight
    #[error("Transaction {active_id} is being closed; wait for the pending commit/rollback")]
    TransactionBusy { active_id: String },

    /// The document instance executed the call and reported a failure
    #[error("{message}")]
    Document {
        message: String,
        code: Option<String>,
    },

    /// Unexpected failure inside the bridge itself
    #[error("Internal error: {0}")]
    Internal(String),
}

fn no_target_message(tab_id: &Option<String>) -> String {
    match tab_id {
        Some(tab_id) => format!("No document instance connected with tabId '{}'", tab_id),
        None => "No document instance connected".to_string(),
    }
}

impl BridgeError {
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn document(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Document {
            message: message.into(),
            code,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Authentication { .. } => "AUTHENTICATION_FAILED",
            BridgeError::Validation { .. } => "VALIDATION_ERROR",
            BridgeError::UnknownTool(_) => "UNKNOWN_TOOL",
            BridgeError::NoTarget { .. } => "NO_TARGET",
            BridgeError::AmbiguousTarget { .. } => "AMBIGUOUS_TARGET",
            BridgeError::Timeout { .. } => "TIMEOUT",
            BridgeError::PeerDisconnected { .. } => "PEER_DISCONNECTED",
            BridgeError::TransactionAlreadyActive { .. } => "TRANSACTION_ALREADY_ACTIVE",
            BridgeError::TransactionMismatch { .. } => "TRANSACTION_MISMATCH",
            BridgeError::NoActiveTransaction { .. } => "NO_ACTIVE_TRANSACTION",
            BridgeError::TransactionBusy { .. } => "TRANSACTION_BUSY",
            BridgeError::Document { .. } => "DOCUMENT_ERROR",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The peer is still connected but never answered, so the request may
    /// still run (or may already have run) on the document
    pub fn is_unanswered(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. } | BridgeError::Internal(_))
    }

    /// Whether this error is reported as a JSON-RPC protocol error rather
    /// than as a tool result with `isError: true`
    ///
    /// Only failures detected before dispatch (unknown tool, bad arguments)
    /// are protocol errors; everything downstream is a tool execution error.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownTool(_) | BridgeError::Validation { .. } | BridgeError::Internal(_)
        )
    }

    /// Structured payload placed under `structuredContent.error`
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        match self {
            BridgeError::TransactionAlreadyActive { active_id }
            | BridgeError::TransactionBusy { active_id } => {
                body["transactionId"] = json!(active_id);
            }
            BridgeError::TransactionMismatch {
                active_id,
                requested,
            } => {
                body["transactionId"] = json!(active_id);
                body["requested"] = json!(requested);
            }
            BridgeError::AmbiguousTarget { tab_ids } => {
                body["tabIds"] = json!(tab_ids);
            }
            BridgeError::Document {
                code: Some(code), ..
            } => {
                body["documentCode"] = json!(code);
            }
            _ => {}
        }
        body
    }
}

impl From<BridgeError> for MCPError {
    fn from(err: BridgeError) -> Self {
        match &err {
            BridgeError::UnknownTool(_) => MCPError {
                code: METHOD_NOT_FOUND,
                message: err.to_string(),
                data: Some(json!({ "code": err.code() })),
            },
            BridgeError::Validation { field, reason } => MCPError::invalid_params(err.to_string())
                .with_data(json!({ "field": field, "reason": reason })),
            _ => MCPError::internal_error(err.to_string()).with_data(json!({ "code": err.code() })),
        }
    }
}

impl From<ArgumentError> for BridgeError {
    fn from(err: ArgumentError) -> Self {
        BridgeError::Validation {
            field: err.field,
            reason: err.reason,
        }
    }
}
