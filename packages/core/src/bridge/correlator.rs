//! Request Correlator
//!
//! Turns the fire-and-forget WebSocket channel into request/response calls.
//! Each outbound request gets a fresh [`CorrelationId`] and an entry in the
//! pending table holding the one-shot resolver for its caller.
//!
//! # Exactly-once resolution
//!
//! The resolver is *moved out* of the table by whichever event happens first:
//! a matching response, the caller's deadline, or the target session going
//! away. Every later event finds no entry and is discarded as unmatched, so
//! a correlation id can never resolve twice.

use crate::bridge::error::BridgeError;
use crate::bridge::protocol::{CorrelationId, ServerMessage};
use crate::bridge::session::{Session, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome delivered to the waiting caller
pub type RpcOutcome = Result<Value, BridgeError>;

#[derive(Debug)]
struct PendingRequest {
    session_id: SessionId,
    client_id: String,
    origin: Option<SessionId>,
    method: String,
    created_at: DateTime<Utc>,
    deadline: Instant,
    responder: oneshot::Sender<RpcOutcome>,
}

type PendingTable = Mutex<HashMap<CorrelationId, PendingRequest>>;

/// What happened to an inbound response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Delivered to its caller
    Resolved,
    /// No such pending id (late reply after timeout, or never issued)
    Unmatched,
    /// The id exists but belongs to a different session; left untouched
    WrongSession,
}

/// Diagnostic view of one in-flight request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInfo {
    pub id: CorrelationId,
    pub session_id: SessionId,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionId>,
    pub method: String,
    pub created_at: DateTime<Utc>,
    /// Time left before the request times out
    pub remaining_ms: u64,
}

/// Correlates bridge → document requests with their responses
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a pending request against `session` and send it
    ///
    /// The request is on the wire when this returns; await the returned
    /// [`PendingResponse`] for the result. If the session's writer is already
    /// gone the entry is withdrawn and the call fails immediately.
    pub fn dispatch(
        &self,
        session: &Session,
        origin: Option<&SessionId>,
        method: &str,
        params: Value,
        transaction_id: Option<String>,
        timeout: Duration,
    ) -> Result<PendingResponse, BridgeError> {
        let id = self.next_id();
        let (responder, receiver) = oneshot::channel();
        let deadline = Instant::now() + timeout;

        self.table().insert(
            id,
            PendingRequest {
                session_id: session.id().clone(),
                client_id: session.client_id().to_string(),
                origin: origin.cloned(),
                method: method.to_string(),
                created_at: Utc::now(),
                deadline,
                responder,
            },
        );

        let sent = session.send(ServerMessage::Request {
            id,
            method: method.to_string(),
            params,
            transaction_id,
        });

        if !sent {
            self.table().remove(&id);
            return Err(BridgeError::PeerDisconnected {
                client_id: session.client_id().to_string(),
            });
        }

        debug!(
            "📤 Request {} '{}' sent to '{}'",
            id,
            method,
            session.client_id()
        );

        Ok(PendingResponse {
            id,
            method: method.to_string(),
            timeout,
            deadline,
            receiver,
            table: Arc::clone(&self.pending),
        })
    }

    /// Deliver an inbound response to its caller
    pub fn resolve(&self, from: &SessionId, id: CorrelationId, outcome: RpcOutcome) -> Resolution {
        let mut table = self.table();

        let belongs_to_sender = match table.get(&id) {
            None => {
                debug!("Discarding unmatched response {} from session {}", id, from);
                return Resolution::Unmatched;
            }
            Some(entry) => &entry.session_id == from,
        };

        if !belongs_to_sender {
            warn!(
                "Session {} answered request {} that was sent to another session",
                from, id
            );
            return Resolution::WrongSession;
        }

        let Some(entry) = table.remove(&id) else {
            return Resolution::Unmatched;
        };
        drop(table);

        // The caller may have stopped waiting; that is not an error here.
        let _ = entry.responder.send(outcome);
        Resolution::Resolved
    }

    /// Fail every request pending against `session_id` right away
    ///
    /// Returns how many requests were failed.
    pub fn fail_session(&self, session_id: &SessionId) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut table = self.table();
            let ids: Vec<CorrelationId> = table
                .iter()
                .filter(|(_, p)| &p.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };

        let count = failed.len();
        for entry in failed {
            let _ = entry.responder.send(Err(BridgeError::PeerDisconnected {
                client_id: entry.client_id,
            }));
        }
        if count > 0 {
            warn!(
                "Failed {} pending request(s) for disconnected session {}",
                count, session_id
            );
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    pub fn pending_for(&self, session_id: &SessionId) -> usize {
        self.table()
            .values()
            .filter(|p| &p.session_id == session_id)
            .count()
    }

    /// Snapshot of in-flight requests, oldest first
    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let now = Instant::now();
        let mut infos: Vec<PendingInfo> = self
            .table()
            .iter()
            .map(|(id, p)| PendingInfo {
                id: *id,
                session_id: p.session_id.clone(),
                client_id: p.client_id.clone(),
                origin: p.origin.clone(),
                method: p.method.clone(),
                created_at: p.created_at,
                remaining_ms: p.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

/// Caller's handle on one in-flight request
///
/// Dropping it without waiting withdraws the pending entry, so abandoned
/// calls never leak table slots.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    method: String,
    timeout: Duration,
    deadline: Instant,
    receiver: oneshot::Receiver<RpcOutcome>,
    table: Arc<PendingTable>,
}

impl PendingResponse {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, the deadline, or the peer's disconnect
    pub async fn wait(mut self) -> RpcOutcome {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::internal(format!(
                "resolver for request {} dropped",
                self.id
            ))),
            Err(_) => {
                let expired = self
                    .table
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&self.id);

                match expired {
                    Some(_) => {
                        warn!(
                            "⏱️ Request {} '{}' timed out after {}ms",
                            self.id,
                            self.method,
                            self.timeout.as_millis()
                        );
                        Err(BridgeError::Timeout {
                            method: self.method.clone(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        })
                    }
                    // Resolved in the same instant the deadline fired; the
                    // outcome is already sitting in the channel.
                    None => self.receiver.try_recv().unwrap_or_else(|_| {
                        Err(BridgeError::internal(format!(
                            "request {} lost its outcome",
                            self.id
                        )))
                    }),
                }
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // No-op when the request already resolved or expired.
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
#[path = "correlator_test.rs"]
mod correlator_test;
