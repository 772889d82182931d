//! Development Document Instance
//!
//! Stands in for a browser tab during development: an in-memory document
//! that connects to a running bridge and answers its requests, reconnecting
//! with backoff when the bridge restarts.
//!
//! # Usage
//!
//! Start the bridge, copy `port` and `token` from its `bridge_ready` line,
//! then:
//!
//! ```bash
//! TREELISTY_MCP_PORT=41234 TREELISTY_MCP_TOKEN=<token> cargo run --bin dev-document
//! ```
//!
//! `TREELISTY_TAB_ID` (default `dev-document`) and `TREELISTY_DOCUMENT_NAME`
//! (default `Dev Project`) are optional. `TREELISTY_PATTERN` names the
//! document's pattern and `TREELISTY_PATTERN_SCHEMA` (JSON) is what
//! `get_pattern_schema` serves for it. Enter on stdin reconnects at once,
//! skipping any backoff wait. Ctrl-C disconnects cleanly.

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use treelisty_document_client::{
    ConnectionEvent, DocumentClient, DocumentClientConfig, MemoryDocument,
};

const DEFAULT_TAB_ID: &str = "dev-document";
const DEFAULT_DOCUMENT_NAME: &str = "Dev Project";

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("dev_document=debug,treelisty_document_client=debug")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let port: u16 = required_env("TREELISTY_MCP_PORT")?
        .parse()
        .context("TREELISTY_MCP_PORT must be a port number")?;
    let token = required_env("TREELISTY_MCP_TOKEN")?;
    let tab_id = std::env::var("TREELISTY_TAB_ID").unwrap_or_else(|_| DEFAULT_TAB_ID.to_string());
    let name = std::env::var("TREELISTY_DOCUMENT_NAME")
        .unwrap_or_else(|_| DEFAULT_DOCUMENT_NAME.to_string());

    info!("📄 Opening in-memory document '{}' as tab {}", name, tab_id);
    let mut document = MemoryDocument::new(name);
    if let Ok(pattern) = std::env::var("TREELISTY_PATTERN") {
        let schema = match std::env::var("TREELISTY_PATTERN_SCHEMA") {
            Ok(raw) => serde_json::from_str(&raw)
                .context("TREELISTY_PATTERN_SCHEMA must be JSON")?,
            Err(_) => Value::Object(Default::default()),
        };
        info!("🧩 Using pattern '{}'", pattern);
        document = document.with_pattern(pattern, schema);
    }
    let document = Arc::new(document);
    let client = DocumentClient::new(
        DocumentClientConfig::local(port, token, tab_id),
        document.clone(),
    );

    let mut events = client.handle().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected { session_id, .. } => info!(
                    "🟢 Connected (session {}, undo depth {}, redo depth {})",
                    session_id,
                    document.undo_depth(),
                    document.redo_depth()
                ),
                ConnectionEvent::Disconnected {
                    reason,
                    retry_in: Some(delay),
                } => warn!("🟠 Disconnected ({}); retrying in {:?}", reason, delay),
                ConnectionEvent::AuthenticationFailed { reason } => {
                    error!("🔴 Token rejected: {}", reason)
                }
                _ => {}
            }
        }
    });

    let (handle, task) = client.spawn();

    let reconnect = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            info!("🔁 Reconnecting now");
            reconnect.reconnect_now();
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, disconnecting");
            handle.shutdown();
        }
    });

    task.await.context("document client task failed")??;
    info!("👋 dev-document stopped");
    Ok(())
}
