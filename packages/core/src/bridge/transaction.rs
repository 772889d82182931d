//! Transaction Coordinator
//!
//! Per document-instance state machine enforcing a single active
//! transaction. Transactions are keyed by the owning session's id, so a
//! disconnect can end the session's transaction without knowing which call
//! opened it.
//!
//! ```text
//! Idle --begin--> Active --commit/rollback--> Closing --ok--> Idle
//!                   ^                            |
//!                   +------ document refused ----+
//!                                                |
//!                    no answer, or not open -----+--> Idle
//! ```
//!
//! A close that goes unanswered leaves the document's state unknown, so the
//! bridge returns to Idle and queues a rollback behind it (see
//! [`CloseFailure`]). Commit is processed first on the document; the
//! rollback only discards what the commit did not close.
//!
//! The coordinator never locks the document itself. A human editing the
//! same document in the UI while a transaction is active can interleave
//! with the agent's mutations.

use crate::bridge::error::BridgeError;
use crate::bridge::protocol::{CODE_NO_ACTIVE_TRANSACTION, CODE_TRANSACTION_MISMATCH};
use crate::bridge::session::{Session, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Lifecycle of a transaction as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    /// Commit or rollback has been sent and not yet answered
    Closing,
    Committed,
    RolledBack,
}

/// How a closing transaction is meant to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseIntent {
    Commit,
    Rollback,
}

impl CloseIntent {
    /// Document method carrying this close
    pub fn method(self) -> &'static str {
        match self {
            CloseIntent::Commit => "commit_transaction",
            CloseIntent::Rollback => "rollback_transaction",
        }
    }

    fn final_state(self) -> TransactionState {
        match self {
            CloseIntent::Commit => TransactionState::Committed,
            CloseIntent::Rollback => TransactionState::RolledBack,
        }
    }
}

/// Where a failed commit/rollback leaves the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseFailure {
    /// The document refused the close and still holds the transaction
    Refused,
    /// The document holds no such transaction, or its connection is gone
    NotOpen,
    /// No answer: the close may still run, or may already have run
    Unanswered,
}

impl CloseFailure {
    pub fn classify(err: &BridgeError) -> Self {
        match err {
            BridgeError::Document {
                code: Some(code), ..
            } if code == CODE_NO_ACTIVE_TRANSACTION || code == CODE_TRANSACTION_MISMATCH => {
                CloseFailure::NotOpen
            }
            BridgeError::Document { .. } => CloseFailure::Refused,
            err if err.is_unanswered() => CloseFailure::Unanswered,
            _ => CloseFailure::NotOpen,
        }
    }
}

#[derive(Debug)]
struct ActiveTransaction {
    id: String,
    client_id: String,
    label: Option<String>,
    created_at: DateTime<Utc>,
    closing: Option<CloseIntent>,
    mutation_count: usize,
}

impl ActiveTransaction {
    fn info(&self, state: TransactionState) -> TransactionInfo {
        TransactionInfo {
            transaction_id: self.id.clone(),
            client_id: self.client_id.clone(),
            label: self.label.clone(),
            state,
            created_at: self.created_at,
            mutation_count: self.mutation_count,
        }
    }

    fn state(&self) -> TransactionState {
        match self.closing {
            Some(_) => TransactionState::Closing,
            None => TransactionState::Active,
        }
    }
}

/// Snapshot of one transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
    pub mutation_count: usize,
}

/// Owner of every document instance's transaction state
#[derive(Debug, Default)]
pub struct TransactionCoordinator {
    active: Mutex<HashMap<SessionId, ActiveTransaction>>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, ActiveTransaction>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `session` from Idle to Active and return the new transaction id
    ///
    /// The reservation is taken before the document hears about it, so two
    /// racing begins can never both succeed.
    pub fn begin(&self, session: &Session, label: Option<String>) -> Result<String, BridgeError> {
        let mut table = self.table();
        if let Some(existing) = table.get(session.id()) {
            return Err(BridgeError::TransactionAlreadyActive {
                active_id: existing.id.clone(),
            });
        }

        let id = format!("tx-{}", uuid::Uuid::new_v4());
        table.insert(
            session.id().clone(),
            ActiveTransaction {
                id: id.clone(),
                client_id: session.client_id().to_string(),
                label,
                created_at: Utc::now(),
                closing: None,
                mutation_count: 0,
            },
        );
        info!(
            "🔒 Transaction {} started on '{}'",
            id,
            session.client_id()
        );
        Ok(id)
    }

    /// Drop a reservation whose begin the document refused
    pub fn release(&self, session_id: &SessionId, transaction_id: &str) -> bool {
        let mut table = self.table();
        let matches = table
            .get(session_id)
            .is_some_and(|tx| tx.id == transaction_id);
        if matches {
            table.remove(session_id);
            warn!("Transaction {} released before it started", transaction_id);
        }
        matches
    }

    /// Transaction id a mutation against `session_id` must carry, if any
    ///
    /// Counts the mutation against the active transaction. Fails while the
    /// transaction is closing so no mutation lands half inside it.
    pub fn tag_mutation(&self, session_id: &SessionId) -> Result<Option<String>, BridgeError> {
        let mut table = self.table();
        match table.get_mut(session_id) {
            None => Ok(None),
            Some(tx) if tx.closing.is_some() => Err(BridgeError::TransactionBusy {
                active_id: tx.id.clone(),
            }),
            Some(tx) => {
                tx.mutation_count += 1;
                Ok(Some(tx.id.clone()))
            }
        }
    }

    /// Move the active transaction to Closing before commit/rollback is sent
    ///
    /// Returns the mutation count so far.
    pub fn begin_close(
        &self,
        session: &Session,
        transaction_id: &str,
        intent: CloseIntent,
    ) -> Result<usize, BridgeError> {
        let mut table = self.table();
        let Some(tx) = table.get_mut(session.id()) else {
            return Err(BridgeError::NoActiveTransaction {
                client_id: session.client_id().to_string(),
            });
        };

        if tx.id != transaction_id {
            return Err(BridgeError::TransactionMismatch {
                active_id: tx.id.clone(),
                requested: transaction_id.to_string(),
            });
        }
        if tx.closing.is_some() {
            return Err(BridgeError::TransactionBusy {
                active_id: tx.id.clone(),
            });
        }

        tx.closing = Some(intent);
        Ok(tx.mutation_count)
    }

    /// Document confirmed the commit/rollback: back to Idle
    pub fn finish_close(&self, session_id: &SessionId, transaction_id: &str) -> Option<TransactionInfo> {
        let mut table = self.table();
        let intent = table
            .get(session_id)
            .filter(|tx| tx.id == transaction_id)
            .and_then(|tx| tx.closing)?;
        let tx = table.remove(session_id)?;
        let info = tx.info(intent.final_state());
        info!(
            "🔓 Transaction {} {:?} after {} mutation(s)",
            info.transaction_id, info.state, info.mutation_count
        );
        Some(info)
    }

    /// Document refused the commit/rollback: the transaction stays Active
    pub fn abort_close(&self, session_id: &SessionId, transaction_id: &str) {
        if let Some(tx) = self
            .table()
            .get_mut(session_id)
            .filter(|tx| tx.id == transaction_id)
        {
            tx.closing = None;
        }
    }

    /// Drop a closing transaction the document no longer holds open
    ///
    /// Used when the close failed in a way that leaves nothing to retry
    /// against; the session is Idle afterwards.
    pub fn abandon(&self, session_id: &SessionId, transaction_id: &str) -> Option<TransactionInfo> {
        let mut table = self.table();
        if table.get(session_id)?.id != transaction_id {
            return None;
        }
        let tx = table.remove(session_id)?;
        warn!(
            "Transaction {} on '{}' dropped after a failed close ({} mutation(s))",
            tx.id, tx.client_id, tx.mutation_count
        );
        Some(tx.info(TransactionState::RolledBack))
    }

    /// Session went away: implicit rollback of whatever it had open
    pub fn end_session(&self, session_id: &SessionId) -> Option<TransactionInfo> {
        let tx = self.table().remove(session_id)?;
        warn!(
            "↩️ Transaction {} on '{}' rolled back by disconnect ({} mutation(s) discarded)",
            tx.id, tx.client_id, tx.mutation_count
        );
        Some(tx.info(TransactionState::RolledBack))
    }

    pub fn active_for(&self, session_id: &SessionId) -> Option<TransactionInfo> {
        self.table().get(session_id).map(|tx| tx.info(tx.state()))
    }

    pub fn active_count(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ClientKind;
    use crate::bridge::session::test_session;

    #[test]
    fn test_second_begin_is_rejected_and_first_stays_active() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");

        let first = coordinator.begin(&session, Some("batch".into())).unwrap();
        assert!(first.starts_with("tx-"));

        let err = coordinator.begin(&session, None).unwrap_err();
        assert_eq!(
            err,
            BridgeError::TransactionAlreadyActive {
                active_id: first.clone()
            }
        );
        assert_eq!(
            coordinator.active_for(session.id()).unwrap().transaction_id,
            first
        );
    }

    #[test]
    fn test_sessions_have_independent_transactions() {
        let coordinator = TransactionCoordinator::new();
        let (a, _rx_a) = test_session(ClientKind::DocumentInstance, "tab-a");
        let (b, _rx_b) = test_session(ClientKind::DocumentInstance, "tab-b");

        let tx_a = coordinator.begin(&a, None).unwrap();
        let tx_b = coordinator.begin(&b, None).unwrap();
        assert_ne!(tx_a, tx_b);
        assert_eq!(coordinator.active_count(), 2);
    }

    #[test]
    fn test_mutations_are_tagged_only_while_active() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");

        assert_eq!(coordinator.tag_mutation(session.id()).unwrap(), None);

        let tx = coordinator.begin(&session, None).unwrap();
        assert_eq!(
            coordinator.tag_mutation(session.id()).unwrap(),
            Some(tx.clone())
        );
        assert_eq!(
            coordinator.tag_mutation(session.id()).unwrap(),
            Some(tx.clone())
        );

        let count = coordinator
            .begin_close(&session, &tx, CloseIntent::Commit)
            .unwrap();
        assert_eq!(count, 2);

        let err = coordinator.tag_mutation(session.id()).unwrap_err();
        assert!(matches!(err, BridgeError::TransactionBusy { .. }));
    }

    #[test]
    fn test_commit_with_mismatched_id() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();

        let err = coordinator
            .begin_close(&session, "tx-stale", CloseIntent::Commit)
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::TransactionMismatch {
                active_id: tx.clone(),
                requested: "tx-stale".to_string()
            }
        );
        assert_eq!(
            coordinator.active_for(session.id()).unwrap().state,
            TransactionState::Active
        );
    }

    #[test]
    fn test_close_without_transaction() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");

        let err = coordinator
            .begin_close(&session, "tx-1", CloseIntent::Rollback)
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoActiveTransaction { .. }));
    }

    #[test]
    fn test_concurrent_close_is_busy() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();

        coordinator
            .begin_close(&session, &tx, CloseIntent::Commit)
            .unwrap();
        let err = coordinator
            .begin_close(&session, &tx, CloseIntent::Rollback)
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransactionBusy { .. }));
    }

    #[test]
    fn test_finish_close_returns_to_idle() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();
        coordinator.tag_mutation(session.id()).unwrap();

        coordinator
            .begin_close(&session, &tx, CloseIntent::Rollback)
            .unwrap();
        let info = coordinator.finish_close(session.id(), &tx).unwrap();
        assert_eq!(info.state, TransactionState::RolledBack);
        assert_eq!(info.mutation_count, 1);
        assert!(coordinator.active_for(session.id()).is_none());

        // Idle again: a new transaction may start
        assert!(coordinator.begin(&session, None).is_ok());
    }

    #[test]
    fn test_abort_close_keeps_transaction_active() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();

        coordinator
            .begin_close(&session, &tx, CloseIntent::Commit)
            .unwrap();
        coordinator.abort_close(session.id(), &tx);

        let info = coordinator.active_for(session.id()).unwrap();
        assert_eq!(info.state, TransactionState::Active);
        assert!(coordinator
            .begin_close(&session, &tx, CloseIntent::Rollback)
            .is_ok());
    }

    #[test]
    fn test_abandon_returns_to_idle() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();
        coordinator
            .begin_close(&session, &tx, CloseIntent::Commit)
            .unwrap();

        assert!(coordinator.abandon(session.id(), "tx-other").is_none());
        assert!(coordinator.active_for(session.id()).is_some());

        let info = coordinator.abandon(session.id(), &tx).unwrap();
        assert_eq!(info.transaction_id, tx);
        assert!(coordinator.active_for(session.id()).is_none());
        assert!(coordinator.begin(&session, None).is_ok());
    }

    #[test]
    fn test_close_failures_are_classified_by_cause() {
        let not_open = BridgeError::document(
            "No active transaction",
            Some(CODE_NO_ACTIVE_TRANSACTION.to_string()),
        );
        let mismatch = BridgeError::document(
            "Transaction tx-1 is not active",
            Some(CODE_TRANSACTION_MISMATCH.to_string()),
        );
        let refused = BridgeError::document("checkpoint failed", None);
        let timeout = BridgeError::Timeout {
            method: "commit_transaction".to_string(),
            timeout_ms: 60_000,
        };
        let gone = BridgeError::PeerDisconnected {
            client_id: "tab-1".to_string(),
        };

        assert_eq!(CloseFailure::classify(&not_open), CloseFailure::NotOpen);
        assert_eq!(CloseFailure::classify(&mismatch), CloseFailure::NotOpen);
        assert_eq!(CloseFailure::classify(&refused), CloseFailure::Refused);
        assert_eq!(CloseFailure::classify(&timeout), CloseFailure::Unanswered);
        assert_eq!(CloseFailure::classify(&gone), CloseFailure::NotOpen);
    }

    #[test]
    fn test_release_only_matching_reservation() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();

        assert!(!coordinator.release(session.id(), "tx-other"));
        assert!(coordinator.release(session.id(), &tx));
        assert!(coordinator.active_for(session.id()).is_none());
    }

    #[test]
    fn test_disconnect_rolls_back_implicitly() {
        let coordinator = TransactionCoordinator::new();
        let (session, _rx) = test_session(ClientKind::DocumentInstance, "tab-1");
        let tx = coordinator.begin(&session, None).unwrap();

        let ended = coordinator.end_session(session.id()).unwrap();
        assert_eq!(ended.transaction_id, tx);
        assert_eq!(ended.state, TransactionState::RolledBack);
        assert!(coordinator.end_session(session.id()).is_none());
        assert_eq!(coordinator.active_count(), 0);
    }
}
