//! WebSocket message protocol between the bridge and connected peers
//!
//! Messages are JSON objects internally tagged by `type`. Field names are
//! camelCase to match the browser side.
//!
//! IMPORTANT: the document-instance client (browser and the Rust client in
//! `treelisty-document-client`) must match these shapes exactly; the
//! contract tests at the bottom of this file pin them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Close code: authentication failed (bad/missing token or handshake)
pub const CLOSE_AUTH_FAILED: u16 = 4002;
/// Close code: another connection claimed the same tab id
pub const CLOSE_SUPERSEDED: u16 = 4003;
/// Close code: peer missed a heartbeat
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4004;
/// Close code: bridge shutting down
pub const CLOSE_NORMAL: u16 = 1000;

/// Document error code: the named transaction is not open on the document
pub const CODE_NO_ACTIVE_TRANSACTION: &str = "NO_ACTIVE_TRANSACTION";
/// Document error code: the document has a different transaction open
pub const CODE_TRANSACTION_MISMATCH: &str = "TRANSACTION_MISMATCH";

/// Process-unique id tagging one bridge → document request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of peer declared at handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    /// External tool-use agent (stdio, or WebSocket for additional agents)
    #[serde(alias = "agent")]
    ToolAgent,
    /// One running copy of the outline editor
    #[serde(alias = "treelisty", alias = "document")]
    DocumentInstance,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::ToolAgent => "tool-agent",
            ClientKind::DocumentInstance => "document-instance",
        }
    }
}

/// Error detail reported by a document instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Messages a peer sends to the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection
    Handshake {
        client_type: ClientKind,
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Result of a bridge-issued request
    Response {
        id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },

    /// Heartbeat reply
    Pong {},

    /// Peer-initiated liveness check
    Ping {},

    /// Tool call from a WebSocket tool-agent session
    ToolCall {
        id: Value,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

/// Messages the bridge sends to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    HandshakeAck {
        session_id: String,
        client_id: String,
        bridge_version: String,
        heartbeat_interval_ms: u64,
    },

    /// RPC call for a document instance to execute
    Request {
        id: CorrelationId,
        method: String,
        params: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
    },

    Ping {
        timestamp: DateTime<Utc>,
    },

    Pong {},

    /// Reply to a `tool_call` from a WebSocket tool-agent session
    ToolResult {
        id: Value,
        result: Value,
    },

    /// Non-fatal protocol complaint (e.g. unparseable message)
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Serialize for the wire; every variant is plain data so this cannot fail
    /// in practice, but a failure still surfaces as an `Err`.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One-line startup announcement written to stderr
///
/// This is the only channel through which a launcher discovers the port and
/// token of a freshly started bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReady {
    #[serde(rename = "type")]
    pub kind: String,
    pub port: u16,
    pub token: String,
    pub version: String,
}

impl BridgeReady {
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self {
            kind: "bridge_ready".to_string(),
            port,
            token: token.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
