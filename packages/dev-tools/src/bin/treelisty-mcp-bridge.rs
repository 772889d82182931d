//! TreeListy MCP Bridge
//!
//! The bridge process an agent launches as its MCP server. It speaks
//! JSON-RPC on stdin/stdout and accepts document instances over WebSocket.
//!
//! ```text
//! Agent ──stdio (JSON-RPC)──▶ treelisty-mcp-bridge ◀──WebSocket── TreeListy tab(s)
//! ```
//!
//! stdout belongs to the protocol, so logs and the one-line `bridge_ready`
//! announcement (port and token for the browser side) go to stderr.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin treelisty-mcp-bridge
//!
//! # Fixed port and verbose logging
//! TREELISTY_MCP_PORT=41234 TREELISTY_MCP_DEBUG=1 cargo run --bin treelisty-mcp-bridge
//! ```
//!
//! The process exits when stdin closes.

use tracing_subscriber::EnvFilter;
use treelisty_mcp_core::{BridgeConfig, BridgeService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.debug {
            EnvFilter::new("treelisty_mcp_bridge=debug,treelisty_mcp_core=debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("🔧 Starting TreeListy MCP bridge...");

    let service = BridgeService::bind(config).await?;
    service.announce()?;
    service.serve_with_stdio().await
}
