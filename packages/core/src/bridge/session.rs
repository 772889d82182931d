//! Session Registry & Handshake
//!
//! Tracks every connected peer: the stdio agent plus zero or more
//! WebSocket peers (document instances and additional agents). A WebSocket
//! peer only becomes a registered, open session after presenting the
//! process-wide token in its handshake.
//!
//! # Targeting
//!
//! Tool calls pick their document instance with [`SessionRegistry::resolve_target`]:
//! an explicit tab id must match an open instance; without one, exactly one
//! open instance must exist. Zero or several instances without a tab id is
//! an error, never a guess.

use crate::bridge::error::BridgeError;
use crate::bridge::protocol::{ClientKind, ServerMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client id under which the stdio agent is registered
pub const STDIO_CLIENT_ID: &str = "stdio";

/// Opaque, unique id for one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport a session arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    WebSocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Frame queued for a session's socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

/// Query parameters on the WebSocket connection URL
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub tab_id: Option<String>,
}

/// Fields of a `handshake` message
#[derive(Debug, Clone)]
pub struct Handshake {
    pub client_type: ClientKind,
    pub client_id: String,
    pub token: Option<String>,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
}

#[derive(Debug)]
struct Heartbeat {
    last_seen: DateTime<Utc>,
    awaiting_pong: bool,
}

/// One connected peer
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    kind: ClientKind,
    transport: Transport,
    client_id: String,
    capabilities: Vec<String>,
    version: Option<String>,
    connected_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    heartbeat: Mutex<Heartbeat>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl Session {
    fn new(
        kind: ClientKind,
        transport: Transport,
        client_id: String,
        capabilities: Vec<String>,
        version: Option<String>,
        outbound: Option<mpsc::UnboundedSender<Outbound>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::generate(),
            kind,
            transport,
            client_id,
            capabilities,
            version,
            connected_at: now,
            state: Mutex::new(SessionState::Connecting),
            heartbeat: Mutex::new(Heartbeat {
                last_seen: now,
                awaiting_pong: false,
            }),
            outbound,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Client-chosen id; the tab id for document instances
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_seen
    }

    /// Queue a message for this peer
    ///
    /// Returns `false` when the peer's writer is gone (or the session has no
    /// socket, as for the stdio agent).
    pub fn send(&self, message: ServerMessage) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Outbound::Message(message)).is_ok(),
            None => false,
        }
    }

    /// Ask the socket writer to close the connection with `code`
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Outbound::Close {
                code,
                reason: reason.into(),
            });
        }
    }

    /// Any sign of life from the peer
    pub fn record_pong(&self) {
        let mut hb = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        hb.last_seen = Utc::now();
        hb.awaiting_pong = false;
    }

    /// Start a heartbeat round
    ///
    /// Returns `false` if the previous round's ping is still unanswered, in
    /// which case the peer is dead. Otherwise marks a ping as outstanding.
    pub fn begin_heartbeat_round(&self) -> bool {
        let mut hb = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
        if hb.awaiting_pong {
            return false;
        }
        hb.awaiting_pong = true;
        true
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            client_id: self.client_id.clone(),
            kind: self.kind,
            transport: self.transport,
            state: self.state(),
            capabilities: self.capabilities.clone(),
            version: self.version.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat(),
        }
    }
}

/// Diagnostic snapshot of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub client_id: String,
    pub kind: ClientKind,
    pub transport: Transport,
    pub state: SessionState,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// The in-process stdio agent owns this id; no WebSocket peer may claim it
fn is_reserved_client_id(client_id: &str) -> bool {
    client_id.trim() == STDIO_CLIENT_ID
}

fn reserved_client_id() -> BridgeError {
    BridgeError::authentication(format!("client id '{}' is reserved", STDIO_CLIENT_ID))
}

/// Registry of open sessions, scoped to one bridge instance
#[derive(Debug)]
pub struct SessionRegistry {
    token: String,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Compare a presented token with the bridge secret
    ///
    /// Runs over the full length regardless of where the first mismatch is.
    pub fn verify_token(&self, presented: &str) -> bool {
        let expected = self.token.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Reject a connection whose URL already carries a wrong token or
    /// claims the reserved stdio client id
    pub fn check_connect_params(&self, params: &ConnectParams) -> Result<(), BridgeError> {
        if let Some(token) = params.token.as_deref() {
            if !self.verify_token(token) {
                return Err(BridgeError::authentication(
                    "token in connection URL does not match",
                ));
            }
        }
        match params.tab_id.as_deref() {
            Some(tab_id) if is_reserved_client_id(tab_id) => Err(reserved_client_id()),
            _ => Ok(()),
        }
    }

    /// Validate a handshake and build the (not yet open) session
    pub fn authenticate(
        &self,
        handshake: Handshake,
        params: &ConnectParams,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Arc<Session>, BridgeError> {
        self.check_connect_params(params)?;

        match (handshake.token.as_deref(), params.token.as_deref()) {
            (Some(token), _) if !self.verify_token(token) => {
                return Err(BridgeError::authentication("handshake token does not match"));
            }
            (None, None) => {
                return Err(BridgeError::authentication("no token presented"));
            }
            _ => {}
        }

        if is_reserved_client_id(&handshake.client_id) {
            return Err(reserved_client_id());
        }

        let client_id = if !handshake.client_id.trim().is_empty() {
            handshake.client_id.trim().to_string()
        } else if let Some(tab_id) = params.tab_id.as_deref().filter(|t| !t.trim().is_empty()) {
            tab_id.trim().to_string()
        } else {
            format!("tab-{}", uuid::Uuid::new_v4())
        };

        Ok(Arc::new(Session::new(
            handshake.client_type,
            Transport::WebSocket,
            client_id,
            handshake.capabilities,
            handshake.version,
            Some(outbound),
        )))
    }

    /// Promote an authenticated session to open and register it
    ///
    /// Returns the session it superseded, if an open session of the same
    /// kind already used this client id. The caller is responsible for
    /// tearing that one down.
    pub fn open(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        session.set_state(SessionState::Open);

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let superseded_id = sessions
            .values()
            .find(|s| s.kind == session.kind && s.client_id == session.client_id)
            .map(|s| s.id.clone());
        let superseded = superseded_id.and_then(|id| sessions.remove(&id));

        info!(
            "✅ Session open: {} '{}' ({})",
            session.kind.as_str(),
            session.client_id,
            session.id
        );
        sessions.insert(session.id.clone(), session);

        if let Some(old) = &superseded {
            warn!(
                "Session {} for '{}' superseded by a newer connection",
                old.id, old.client_id
            );
        }
        superseded
    }

    /// Register the stdio agent session
    pub fn register_stdio_agent(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(
            ClientKind::ToolAgent,
            Transport::Stdio,
            STDIO_CLIENT_ID.to_string(),
            Vec::new(),
            None,
            None,
        ));
        self.open(session.clone());
        session
    }

    /// Remove a session and mark it closed
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(session) = &removed {
            session.set_state(SessionState::Closed);
            debug!("Session {} removed from registry", id);
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Open document-instance sessions, ordered by tab id
    pub fn document_instances(&self) -> Vec<Arc<Session>> {
        let mut instances: Vec<Arc<Session>> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.kind == ClientKind::DocumentInstance && s.is_open())
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        instances
    }

    /// Pick the document instance a call should go to
    pub fn resolve_target(&self, tab_id: Option<&str>) -> Result<Arc<Session>, BridgeError> {
        let instances = self.document_instances();

        if let Some(tab_id) = tab_id {
            return instances
                .into_iter()
                .find(|s| s.client_id == tab_id)
                .ok_or_else(|| BridgeError::NoTarget {
                    tab_id: Some(tab_id.to_string()),
                });
        }

        if instances.len() > 1 {
            return Err(BridgeError::AmbiguousTarget {
                tab_ids: instances.iter().map(|s| s.client_id.clone()).collect(),
            });
        }
        instances
            .into_iter()
            .next()
            .ok_or(BridgeError::NoTarget { tab_id: None })
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered session, for teardown
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.all().iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        infos
    }
}

/// Open WebSocket session wired to a channel, for tests elsewhere in the crate
#[cfg(test)]
pub(crate) fn test_session(
    kind: ClientKind,
    client_id: &str,
) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        kind,
        Transport::WebSocket,
        client_id.to_string(),
        Vec::new(),
        None,
        Some(tx),
    ));
    session.set_state(SessionState::Open);
    (session, rx)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
