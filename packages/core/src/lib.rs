//! TreeListy MCP Bridge Core
//!
//! The bridge is a local process between an external tool-use agent (MCP
//! over stdio) and one or more running TreeListy document instances (over
//! WebSocket). It authenticates peers, routes tool calls to the right
//! document instance, correlates responses with timeouts, and coordinates
//! all-or-nothing transactions.
//!
//! # Modules
//!
//! - [`bridge`] - Session registry, request correlator, transaction coordinator, WebSocket listener
//! - [`mcp`] - MCP stdio server, tool catalog and typed tool arguments
//! - [`services`] - Bridge process lifecycle
//! - [`config`] - Environment-driven configuration

pub mod bridge;
pub mod config;
pub mod mcp;
pub mod services;

pub use bridge::{Bridge, BridgeError};
pub use config::BridgeConfig;
pub use services::BridgeService;
