//! TreeListy Document Client
//!
//! The document-instance side of the MCP bridge. A document connects to the
//! bridge over WebSocket, executes the requests it receives through a
//! [`DocumentAdapter`], and reconnects with backoff when the link drops.
//!
//! # Modules
//!
//! - [`client`] - Reconnecting WebSocket client and its control handle
//! - [`executor`] - Ordered request execution and client-side transaction tracking
//! - [`adapter`] - The trait a document implements
//! - [`document`] - In-memory reference document with undo checkpoints
//! - [`backoff`] - Reconnect delay policy
//!
//! # Example
//!
//! ```ignore
//! let document = Arc::new(MemoryDocument::new("My Project"));
//! let config = DocumentClientConfig::local(port, token, "tab-1");
//! let (handle, task) = DocumentClient::new(config, document).spawn();
//! ```

pub mod adapter;
pub mod backoff;
pub mod client;
pub mod document;
pub mod error;
pub mod executor;

pub use adapter::DocumentAdapter;
pub use backoff::Backoff;
pub use client::{ClientHandle, ConnectionEvent, DocumentClient, DocumentClientConfig};
pub use document::{MemoryDocument, NodeType, TreeNode};
pub use error::{AdapterError, ClientError};
pub use executor::RpcExecutor;
