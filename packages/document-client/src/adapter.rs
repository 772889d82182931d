//! Document Adapter
//!
//! The seam between the bridge connection and whatever holds the document.
//! A browser tab, a test double and [`crate::MemoryDocument`] all implement
//! the same trait.

use crate::error::AdapterError;
use async_trait::async_trait;
use serde_json::Value;

/// Operations a document instance performs on behalf of the bridge
///
/// `execute` receives every catalog method other than the three transaction
/// controls. `transaction_id` is set when the bridge tagged the call as part
/// of an active transaction; such mutations must not create their own undo
/// checkpoints.
#[async_trait]
pub trait DocumentAdapter: Send + Sync {
    async fn execute(
        &self,
        method: &str,
        params: Value,
        transaction_id: Option<&str>,
    ) -> Result<Value, AdapterError>;

    /// Capture the pre-transaction checkpoint
    async fn begin_transaction(
        &self,
        transaction_id: &str,
        label: Option<&str>,
    ) -> Result<Value, AdapterError>;

    /// Collapse the transaction's mutations into one undo checkpoint
    async fn commit_transaction(&self, transaction_id: &str) -> Result<Value, AdapterError>;

    /// Restore the pre-transaction checkpoint
    async fn rollback_transaction(&self, transaction_id: &str) -> Result<Value, AdapterError>;
}
