//! Model Context Protocol (MCP) Integration
//!
//! Agent-facing side of the bridge: JSON-RPC 2.0 over stdin/stdout, the
//! fixed tool catalog, and typed tool arguments.
//!
//! # Usage
//!
//! Agents discover tools with `tools/list` and invoke them with `tools/call`:
//!
//! ```json
//! {
//!   "jsonrpc": "2.0",
//!   "id": 1,
//!   "method": "tools/call",
//!   "params": {
//!     "name": "create_node",
//!     "arguments": { "parentId": "root", "name": "Phase 1", "type": "phase" }
//!   }
//! }
//! ```

pub mod catalog;
pub mod handlers;
pub mod server;
pub mod types;
pub mod params;

pub use catalog::{PreparedCall, ToolArgs, ToolDefinition, ToolKind};
pub use server::{run_mcp_server, run_mcp_server_with_io};
pub use types::{MCPError, MCPRequest, MCPResponse};
