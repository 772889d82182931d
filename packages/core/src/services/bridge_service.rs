//! Bridge Service
//!
//! Managed service wrapper for one bridge process: binds the WebSocket
//! listener, announces the port and token, and runs the listener alongside
//! the stdio MCP loop.
//!
//! # Lifecycle
//!
//! 1. [`BridgeService::bind`] binds the listener so the real port is known
//! 2. [`BridgeService::announce`] writes the `bridge_ready` line to stderr
//! 3. [`BridgeService::serve_with_stdio`] runs until stdin closes, then shuts
//!    the bridge down (sessions closed with 1000, pending requests failed)
//!
//! # Example
//!
//! ```ignore
//! let config = BridgeConfig::from_env()?;
//! let service = BridgeService::bind(config).await?;
//! service.announce()?;
//! service.serve_with_stdio().await?;
//! ```

use crate::bridge::{websocket, Bridge, BridgeReady};
use crate::config::{BridgeConfig, TokenSource};
use crate::mcp;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct BridgeService {
    bridge: Arc<Bridge>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BridgeService {
    /// Validate `config` and bind the WebSocket listener
    pub async fn bind(config: BridgeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        if config.token_source == TokenSource::Environment {
            warn!("⚠️  Using fixed auth token from environment; intended for testing only");
        }

        let addr = SocketAddr::new(config.host, config.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {}", addr))?;
        let local_addr = listener.local_addr()?;
        info!("🌐 Bridge listening on ws://{}", local_addr);

        Ok(Self {
            bridge: Arc::new(Bridge::new(config)),
            listener,
            local_addr,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn token(&self) -> &str {
        &self.bridge.config().token
    }

    pub fn bridge(&self) -> Arc<Bridge> {
        Arc::clone(&self.bridge)
    }

    /// The startup announcement for this bridge
    pub fn ready_message(&self) -> BridgeReady {
        BridgeReady::new(self.port(), self.token())
    }

    /// Write the `bridge_ready` line to stderr
    ///
    /// Printed directly rather than through tracing so it stays one bare
    /// JSON line whatever the log format is.
    pub fn announce(&self) -> anyhow::Result<()> {
        let line = serde_json::to_string(&self.ready_message())?;
        eprintln!("{}", line);
        Ok(())
    }

    /// Serve WebSocket peers until the bridge is shut down
    pub async fn serve(self) -> anyhow::Result<()> {
        websocket::serve(self.listener, self.bridge)
            .await
            .context("WebSocket listener failed")
    }

    /// Serve WebSocket peers and the stdio agent; returns when stdin closes
    pub async fn serve_with_stdio(self) -> anyhow::Result<()> {
        let bridge = Arc::clone(&self.bridge);
        let server = tokio::spawn(self.serve());

        let stdio_result = mcp::run_mcp_server(Arc::clone(&bridge)).await;
        bridge.shutdown();

        match server.await {
            Ok(result) => result?,
            Err(e) => warn!("WebSocket listener task failed: {}", e),
        }
        info!("👋 Bridge stopped");
        stdio_result
    }
}
