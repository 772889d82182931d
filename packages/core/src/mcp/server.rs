//! MCP stdio Server
//!
//! Reads line-delimited JSON-RPC 2.0 from stdin and writes responses to
//! stdout through a single writer task, so concurrently finishing tool calls
//! never interleave their output.
//!
//! Each `tools/call` is validated and dispatched inline, in the order the
//! lines arrive; only the wait for the document's answer runs on its own
//! task. A slow document therefore never stalls the loop, and a panic in one
//! call is turned into an internal-error response instead of taking the loop
//! down.

use crate::bridge::{Bridge, SessionId};
use crate::mcp::handlers::initialize::handle_initialize;
use crate::mcp::handlers::tools::{handle_tools_list, start_tools_call, tool_result};
use crate::mcp::types::{MCPError, MCPRequest, MCPResponse, RequestId};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// What the loop does with one parsed request
enum Handled {
    Respond(MCPResponse),
    /// Response arrives later; the future is already dispatched
    Pending(BoxFuture<'static, MCPResponse>),
    /// Notification: nothing goes back
    Silent,
}

/// Run the MCP stdio server on the process's stdin/stdout
///
/// Returns when stdin is closed. Closing stdin means the agent is gone, so
/// the bridge is shut down before returning.
#[instrument(skip(bridge))]
pub async fn run_mcp_server(bridge: Arc<Bridge>) -> anyhow::Result<()> {
    run_mcp_server_with_io(bridge, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Run the MCP server over arbitrary byte streams
pub async fn run_mcp_server_with_io<R, W>(
    bridge: Arc<Bridge>,
    input: R,
    output: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!("🔌 MCP stdio server started");

    let agent = bridge.registry().register_stdio_agent();
    let (tx, rx) = mpsc::unbounded_channel::<MCPResponse>();
    let writer = tokio::spawn(write_responses(output, rx));

    let mut lines = BufReader::new(input).lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("📥 MCP request: {}", line);

        let request = match parse_request(line) {
            Ok(request) => request,
            Err(response) => {
                let _ = tx.send(response);
                continue;
            }
        };

        let id = request.id.clone();
        let handled = std::panic::catch_unwind(AssertUnwindSafe(|| {
            handle_request(&bridge, agent.id(), request)
        }))
        .unwrap_or_else(|_| {
            error!("❌ MCP request handler panicked");
            Handled::Respond(MCPResponse::error(
                id.clone(),
                MCPError::internal_error("request handler panicked".to_string()),
            ))
        });

        match handled {
            Handled::Respond(response) => {
                let _ = tx.send(response);
            }
            Handled::Pending(pending) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = match AssertUnwindSafe(pending).catch_unwind().await {
                        Ok(response) => response,
                        Err(_) => {
                            error!("❌ Tool call {:?} panicked", id);
                            MCPResponse::error(
                                id,
                                MCPError::internal_error("tool call panicked".to_string()),
                            )
                        }
                    };
                    let _ = tx.send(response);
                });
            }
            Handled::Silent => {}
        }
    };

    info!("🔌 MCP stdio server stopped (stdin closed)");
    bridge.disconnect(agent.id());
    bridge.shutdown();

    drop(tx);
    match writer.await {
        Ok(result) => result?,
        Err(e) => warn!("MCP writer task failed: {}", e),
    }
    read_result?;
    Ok(())
}

/// Parse one line, producing the error response if it is not a request
fn parse_request(line: &str) -> Result<MCPRequest, MCPResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        warn!("❌ Failed to parse JSON-RPC request: {}", e);
        MCPResponse::error(None, MCPError::parse_error(format!("Invalid JSON: {}", e)))
    })?;

    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    serde_json::from_value::<MCPRequest>(value).map_err(|e| {
        warn!("❌ Not a JSON-RPC request: {}", e);
        MCPResponse::error(
            id,
            MCPError::invalid_request(format!("Invalid request: {}", e)),
        )
    })
}

/// Route one request; everything before the document hop runs here
#[instrument(skip(bridge, request), fields(method = %request.method))]
fn handle_request(bridge: &Arc<Bridge>, origin: &SessionId, request: MCPRequest) -> Handled {
    let MCPRequest {
        id, method, params, ..
    } = request;

    let Some(id) = id else {
        match method.as_str() {
            "notifications/initialized" => info!("🤝 Agent initialized"),
            other => debug!("Ignoring notification '{}'", other),
        }
        return Handled::Silent;
    };

    let result = match method.as_str() {
        "initialize" => handle_initialize(params),
        "ping" => Ok(json!({})),
        "tools/list" => handle_tools_list(params),
        "resources/list" => Ok(json!({ "resources": [] })),
        "prompts/list" => Ok(json!({ "prompts": [] })),
        "tools/call" => {
            let started = start_tools_call(bridge, Some(origin), params);
            let id = Some(id);
            return Handled::Pending(
                async move {
                    let outcome = match started {
                        Ok(in_flight) => in_flight.finish().await,
                        Err(err) => Err(err),
                    };
                    respond(id, tool_result(outcome))
                }
                .boxed(),
            );
        }
        _ => {
            warn!("⚠️  Unknown MCP method: {}", method);
            Err(MCPError::method_not_found(&method))
        }
    };

    Handled::Respond(respond(Some(id), result))
}

fn respond(id: Option<RequestId>, result: Result<Value, MCPError>) -> MCPResponse {
    match result {
        Ok(result) => MCPResponse::success(id, result),
        Err(error) => {
            debug!(
                "MCP request {:?} failed: {} (code: {})",
                id, error.message, error.code
            );
            MCPResponse::error(id, error)
        }
    }
}

/// Single writer for every response
async fn write_responses<W>(output: W, mut rx: mpsc::UnboundedReceiver<MCPResponse>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(output);
    while let Some(response) = rx.recv().await {
        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        debug!("📤 MCP response (id={:?})", response.id);
    }
    Ok(())
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
