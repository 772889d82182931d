//! RPC Executor
//!
//! Routes bridge `request` messages to a [`DocumentAdapter`] and turns the
//! outcome into a `response`. Transaction controls go to the adapter's
//! transaction hooks; every other catalog method goes to `execute`.
//!
//! Requests from one connection run strictly in arrival order on a single
//! worker task (see [`spawn_worker`]); the connection reader answers pings
//! itself so a slow request never delays a heartbeat.

use crate::adapter::DocumentAdapter;
use crate::error::AdapterError;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treelisty_mcp_core::bridge::protocol::{ClientMessage, CorrelationId};
use treelisty_mcp_core::mcp::params::{parse_arguments, BeginTransactionParams, CloseTransactionParams};
use treelisty_mcp_core::mcp::ToolKind;

/// A bridge request waiting for the worker
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub id: CorrelationId,
    pub method: String,
    pub params: Value,
    pub transaction_id: Option<String>,
}

pub struct RpcExecutor {
    adapter: Arc<dyn DocumentAdapter>,
    active_transaction: Mutex<Option<String>>,
}

impl RpcExecutor {
    pub fn new(adapter: Arc<dyn DocumentAdapter>) -> Self {
        Self {
            adapter,
            active_transaction: Mutex::new(None),
        }
    }

    /// Transaction this executor has seen begin and not yet close
    pub fn active_transaction(&self) -> Option<String> {
        self.active_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_active(&self, transaction_id: Option<String>) {
        *self
            .active_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = transaction_id;
    }

    pub async fn execute(
        &self,
        method: &str,
        params: Value,
        transaction_id: Option<String>,
    ) -> Result<Value, AdapterError> {
        let Some(kind) = ToolKind::from_name(method) else {
            warn!("Bridge asked for unknown method: {}", method);
            return Err(AdapterError::method_not_found(method));
        };

        match kind {
            ToolKind::BeginTransaction => {
                let begin: BeginTransactionParams = parse_arguments(params)?;
                let id = begin
                    .transaction_id
                    .or(transaction_id)
                    .ok_or_else(|| AdapterError::invalid_params("transactionId is required"))?;
                let result = self
                    .adapter
                    .begin_transaction(&id, begin.label.as_deref())
                    .await?;
                info!("🔒 Transaction {} started", id);
                self.set_active(Some(id));
                Ok(result)
            }
            ToolKind::CommitTransaction => {
                let CloseTransactionParams { transaction_id: id } = parse_arguments(params)?;
                let result = self.adapter.commit_transaction(&id).await?;
                info!("✅ Transaction {} committed", id);
                self.clear_if_active(&id);
                Ok(result)
            }
            ToolKind::RollbackTransaction => {
                let CloseTransactionParams { transaction_id: id } = parse_arguments(params)?;
                let result = self.adapter.rollback_transaction(&id).await?;
                info!("↩️  Transaction {} rolled back", id);
                self.clear_if_active(&id);
                Ok(result)
            }
            _ => {
                self.adapter
                    .execute(method, params, transaction_id.as_deref())
                    .await
            }
        }
    }

    fn clear_if_active(&self, transaction_id: &str) {
        let mut active = self
            .active_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if active.as_deref() == Some(transaction_id) {
            *active = None;
        }
    }

    /// Execute one request and build the `response` for it
    pub async fn handle(&self, request: IncomingRequest) -> ClientMessage {
        debug!("⚙️  Executing {} (id {})", request.method, request.id);
        match self
            .execute(&request.method, request.params, request.transaction_id)
            .await
        {
            Ok(result) => ClientMessage::Response {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Err(err) => {
                debug!("Request {} failed: {} ({})", request.id, err.message, err.code);
                ClientMessage::Response {
                    id: request.id,
                    result: None,
                    error: Some(err.into()),
                }
            }
        }
    }

    /// Roll back a transaction left open by a lost connection
    ///
    /// Returns the id that was rolled back, if any.
    pub async fn connection_lost(&self) -> Option<String> {
        let id = self
            .active_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match self.adapter.rollback_transaction(&id).await {
            Ok(_) => warn!("↩️  Rolled back transaction {} after losing the bridge", id),
            Err(e) => warn!(
                "Transaction {} could not be rolled back after losing the bridge: {}",
                id, e
            ),
        }
        Some(id)
    }
}

/// Start the per-connection worker that executes requests in order
///
/// Responses go to `outbound`. The worker stops when the request sender is
/// dropped or `outbound` closes.
pub fn spawn_worker(
    executor: Arc<RpcExecutor>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
) -> (mpsc::UnboundedSender<IncomingRequest>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<IncomingRequest>();
    let handle = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let response = executor.handle(request).await;
            if outbound.send(response).is_err() {
                break;
            }
        }
    });
    (tx, handle)
}
