//! MCP Bridge
//!
//! The process-level object tying the registry, correlator and transaction
//! coordinator together. One [`Bridge`] is built per bridge process (or per
//! test) and shared by the stdio loop and the WebSocket listener; nothing in
//! here is a module-level global.
//!
//! # Call flow
//!
//! ```text
//! tools/call -> PreparedCall (validate) -> resolve_target -> transaction tag
//!            -> RequestCorrelator::dispatch -> InFlight::finish -> envelope
//! ```
//!
//! [`Bridge::dispatch_tool`] is synchronous: by the time it returns, the
//! request is on the target's queue, so calls from one agent reach the
//! document in the order the agent sent them even though their responses
//! are awaited concurrently.

pub mod correlator;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transaction;
pub mod websocket;

pub use correlator::{PendingResponse, RequestCorrelator, Resolution};
pub use error::BridgeError;
pub use protocol::{BridgeReady, ClientKind, ClientMessage, CorrelationId, ServerMessage};
pub use session::{Session, SessionId, SessionRegistry};
pub use transaction::{
    CloseFailure, CloseIntent, TransactionCoordinator, TransactionInfo, TransactionState,
};

use crate::config::BridgeConfig;
use crate::mcp::catalog::{PreparedCall, TimeoutClass, ToolArgs, ToolKind};
use crate::mcp::handlers::tools::tool_result_value;
use crate::mcp::params::CloseTransactionParams;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What a finished call must do to the transaction state
#[derive(Debug)]
enum Completion {
    Plain,
    Begin {
        session_id: SessionId,
        transaction_id: String,
        label: Option<String>,
    },
    Close {
        session_id: SessionId,
        transaction_id: String,
        intent: CloseIntent,
        mutation_count: usize,
    },
}

/// A dispatched tool call whose document response is still outstanding
#[derive(Debug)]
pub struct InFlight {
    kind: ToolKind,
    pending: PendingResponse,
    completion: Completion,
    target: Arc<Session>,
    transactions: Arc<TransactionCoordinator>,
    correlator: Arc<RequestCorrelator>,
    rollback_timeout: Duration,
}

impl InFlight {
    pub fn kind(&self) -> ToolKind {
        self.kind
    }

    /// Await the document's answer and settle any transaction transition
    pub async fn finish(self) -> Result<Value, BridgeError> {
        let InFlight {
            pending,
            completion,
            target,
            transactions,
            correlator,
            rollback_timeout,
            ..
        } = self;
        let outcome = pending.wait().await;
        let rollback_behind = |transaction_id: &str, after: &str| {
            queue_rollback(&correlator, &target, rollback_timeout, transaction_id, after)
        };

        match completion {
            Completion::Plain => outcome,
            Completion::Begin {
                session_id,
                transaction_id,
                label,
            } => match outcome {
                Ok(_) => {
                    let mut result = json!({ "transactionId": transaction_id, "active": true });
                    if let Some(label) = label {
                        result["label"] = json!(label);
                    }
                    Ok(result)
                }
                Err(err) => {
                    // A begin that timed out can still run on the document;
                    // the rollback is queued before the slot frees up so no
                    // later untagged edit lands inside it.
                    if err.is_unanswered() {
                        rollback_behind(&transaction_id, ToolKind::BeginTransaction.name());
                    }
                    transactions.release(&session_id, &transaction_id);
                    Err(err)
                }
            },
            Completion::Close {
                session_id,
                transaction_id,
                intent,
                mutation_count,
            } => match outcome {
                Ok(document) => {
                    transactions.finish_close(&session_id, &transaction_id);
                    Ok(match intent {
                        CloseIntent::Commit => json!({
                            "transactionId": transaction_id,
                            "committed": true,
                            "mutationCount": mutation_count,
                            "document": document,
                        }),
                        CloseIntent::Rollback => json!({
                            "transactionId": transaction_id,
                            "rolledBack": true,
                            "mutationCount": mutation_count,
                        }),
                    })
                }
                Err(err) => {
                    match CloseFailure::classify(&err) {
                        CloseFailure::Refused => {
                            warn!(
                                "Transaction {} stays active: {:?} failed: {}",
                                transaction_id, intent, err
                            );
                            transactions.abort_close(&session_id, &transaction_id);
                        }
                        CloseFailure::NotOpen => {
                            transactions.abandon(&session_id, &transaction_id);
                        }
                        CloseFailure::Unanswered => {
                            rollback_behind(&transaction_id, intent.method());
                            transactions.abandon(&session_id, &transaction_id);
                        }
                    }
                    Err(err)
                }
            },
        }
    }
}

/// Send `rollback_transaction` behind an unanswered transaction control
///
/// The document executes requests in order, so the rollback runs after the
/// late call. Its answer is only logged.
fn queue_rollback(
    correlator: &RequestCorrelator,
    target: &Session,
    timeout: Duration,
    transaction_id: &str,
    after: &str,
) {
    let rollback = ToolArgs::RollbackTransaction(CloseTransactionParams {
        transaction_id: transaction_id.to_string(),
    });
    let dispatched = rollback.to_params().and_then(|params| {
        correlator.dispatch(
            target,
            None,
            ToolKind::RollbackTransaction.name(),
            params,
            Some(transaction_id.to_string()),
            timeout,
        )
    });
    let pending = match dispatched {
        Ok(pending) => pending,
        Err(err) => {
            debug!("Rollback of {} not sent: {}", transaction_id, err);
            return;
        }
    };

    warn!(
        "↩️ Rolling back {} on '{}' after unanswered {}",
        transaction_id,
        target.client_id(),
        after
    );
    let transaction_id = transaction_id.to_string();
    tokio::spawn(async move {
        match pending.wait().await {
            Ok(_) => info!("↩️ Transaction {} rolled back", transaction_id),
            Err(err) => debug!("Rollback of {} finished with: {}", transaction_id, err),
        }
    });
}

/// Result of tearing down one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectReport {
    pub failed_requests: usize,
    pub rolled_back: Option<TransactionInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHealth {
    pub session_id: SessionId,
    pub client_id: String,
    pub kind: ClientKind,
    pub transport: session::Transport,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub active_transaction: Option<String>,
    /// Requests sent to this session and not yet answered
    pub pending_requests: usize,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: Vec<SessionHealth>,
    pub pending_requests: usize,
    pub active_transactions: usize,
}

/// One bridge instance
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    registry: SessionRegistry,
    correlator: Arc<RequestCorrelator>,
    transactions: Arc<TransactionCoordinator>,
    shutdown_tx: watch::Sender<bool>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: SessionRegistry::new(config.token.clone()),
            correlator: Arc::new(RequestCorrelator::new()),
            transactions: Arc::new(TransactionCoordinator::new()),
            shutdown_tx,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.transactions
    }

    pub fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Standard => self.config.request_timeout,
            TimeoutClass::Bulk => self.config.bulk_timeout,
        }
    }

    /// Route a validated call to its document instance
    ///
    /// Routing and transaction-state errors are returned here, before any
    /// request goes out.
    pub fn dispatch_tool(
        &self,
        origin: Option<&SessionId>,
        call: PreparedCall,
    ) -> Result<InFlight, BridgeError> {
        let target = self.registry.resolve_target(call.tab_id.as_deref())?;
        let kind = call.kind;

        let (transaction_id, completion, args) = match call.args {
            ToolArgs::BeginTransaction(mut begin) => {
                let id = self.transactions.begin(&target, begin.label.clone())?;
                begin.transaction_id = Some(id.clone());
                (
                    Some(id.clone()),
                    Completion::Begin {
                        session_id: target.id().clone(),
                        transaction_id: id,
                        label: begin.label.clone(),
                    },
                    ToolArgs::BeginTransaction(begin),
                )
            }
            ToolArgs::CommitTransaction(close) | ToolArgs::RollbackTransaction(close) => {
                let intent = if kind == ToolKind::CommitTransaction {
                    CloseIntent::Commit
                } else {
                    CloseIntent::Rollback
                };
                let requested = close.transaction_id.clone();
                let mutation_count = self.transactions.begin_close(&target, &requested, intent)?;
                let args = if intent == CloseIntent::Commit {
                    ToolArgs::CommitTransaction(close)
                } else {
                    ToolArgs::RollbackTransaction(close)
                };
                (
                    Some(requested.clone()),
                    Completion::Close {
                        session_id: target.id().clone(),
                        transaction_id: requested,
                        intent,
                        mutation_count,
                    },
                    args,
                )
            }
            args if kind.is_mutation() => (
                self.transactions.tag_mutation(target.id())?,
                Completion::Plain,
                args,
            ),
            args => (None, Completion::Plain, args),
        };
        let dispatched = args.to_params().and_then(|params| {
            self.correlator.dispatch(
                &target,
                origin,
                kind.name(),
                params,
                transaction_id,
                self.timeout_for(kind.timeout_class()),
            )
        });

        let pending = match dispatched {
            Ok(pending) => pending,
            Err(err) => {
                match &completion {
                    Completion::Begin {
                        session_id,
                        transaction_id,
                        ..
                    } => {
                        self.transactions.release(session_id, transaction_id);
                    }
                    // The peer's writer is gone; its own teardown rolls back.
                    Completion::Close {
                        session_id,
                        transaction_id,
                        ..
                    } => {
                        self.transactions.abandon(session_id, transaction_id);
                    }
                    Completion::Plain => {}
                }
                return Err(err);
            }
        };

        Ok(InFlight {
            kind,
            pending,
            completion,
            target,
            transactions: Arc::clone(&self.transactions),
            correlator: Arc::clone(&self.correlator),
            rollback_timeout: self.timeout_for(TimeoutClass::Bulk),
        })
    }

    /// Validate, route and await one tool call
    pub async fn call_tool(
        &self,
        origin: Option<&SessionId>,
        name: &str,
        arguments: Value,
    ) -> Result<Value, BridgeError> {
        let call = PreparedCall::new(name, arguments)?;
        self.dispatch_tool(origin, call)?.finish().await
    }

    /// Handle one parsed message from an open WebSocket session
    pub fn handle_client_message(self: &Arc<Self>, session: &Arc<Session>, message: ClientMessage) {
        session.record_pong();

        match message {
            ClientMessage::Response { id, result, error } => {
                let outcome = match error {
                    Some(remote) => Err(BridgeError::document(remote.message, remote.code)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                self.correlator.resolve(session.id(), id, outcome);
            }
            ClientMessage::Pong {} => {}
            ClientMessage::Ping {} => {
                session.send(ServerMessage::Pong {});
            }
            ClientMessage::Handshake { .. } => {
                session.send(ServerMessage::Error {
                    message: "handshake already completed".to_string(),
                });
            }
            ClientMessage::ToolCall {
                id,
                name,
                arguments,
            } => self.handle_agent_tool_call(session, id, name, arguments),
        }
    }

    fn handle_agent_tool_call(
        self: &Arc<Self>,
        session: &Arc<Session>,
        id: Value,
        name: String,
        arguments: Value,
    ) {
        if session.kind() != ClientKind::ToolAgent {
            session.send(ServerMessage::Error {
                message: "tool_call is only accepted from tool-agent sessions".to_string(),
            });
            return;
        }

        debug!("🔧 tool_call '{}' from '{}'", name, session.client_id());

        // Dispatch now to keep the agent's ordering; only the wait is spawned.
        let in_flight = PreparedCall::new(&name, arguments)
            .and_then(|call| self.dispatch_tool(Some(session.id()), call));
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let outcome = match in_flight {
                Ok(in_flight) => in_flight.finish().await,
                Err(err) => Err(err),
            };
            session.send(ServerMessage::ToolResult {
                id,
                result: tool_result_value(outcome),
            });
        });
    }

    /// Tear down a session: fail its pending requests, end its transaction
    ///
    /// Safe to call more than once for the same id.
    pub fn disconnect(&self, session_id: &SessionId) -> DisconnectReport {
        let removed = self.registry.remove(session_id);
        let report = DisconnectReport {
            failed_requests: self.correlator.fail_session(session_id),
            rolled_back: self.transactions.end_session(session_id),
        };

        if let Some(session) = removed {
            info!(
                "🔌 Session closed: {} '{}' ({} pending failed{})",
                session.kind().as_str(),
                session.client_id(),
                report.failed_requests,
                if report.rolled_back.is_some() {
                    ", transaction rolled back"
                } else {
                    ""
                }
            );
        }
        report
    }

    /// Close every session with a normal closure and stop the listeners
    pub fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("🛑 Bridge shutting down");
        for session in self.registry.all() {
            session.close(protocol::CLOSE_NORMAL, "bridge shutting down");
            self.disconnect(session.id());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolves once [`Bridge::shutdown`] has been called
    pub async fn shutdown_signal(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        // The sender lives in self, so wait_for only fails if self is gone.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn health(&self) -> HealthReport {
        let sessions = self
            .registry
            .snapshot()
            .into_iter()
            .map(|info| SessionHealth {
                active_transaction: self
                    .transactions
                    .active_for(&info.session_id)
                    .map(|tx| tx.transaction_id),
                pending_requests: self.correlator.pending_for(&info.session_id),
                session_id: info.session_id,
                client_id: info.client_id,
                kind: info.kind,
                transport: info.transport,
                connected_at: info.connected_at,
                last_heartbeat: info.last_heartbeat,
            })
            .collect();

        HealthReport {
            status: if self.is_shutting_down() {
                "shutting_down"
            } else {
                "ok"
            },
            version: env!("CARGO_PKG_VERSION"),
            sessions,
            pending_requests: self.correlator.pending_count(),
            active_transactions: self.transactions.active_count(),
        }
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod bridge_test;
