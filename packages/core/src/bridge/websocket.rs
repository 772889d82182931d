//! WebSocket listener
//!
//! One axum router serves the document-instance socket at `/` and a
//! diagnostics snapshot at `/health`. Each connection runs a writer task fed
//! by the session's outbound queue and a reader loop that also drives the
//! heartbeat, so a connection never outlives its session by more than one
//! heartbeat interval.

use crate::bridge::error::BridgeError;
use crate::bridge::protocol::{
    ClientMessage, ServerMessage, CLOSE_AUTH_FAILED, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL,
    CLOSE_SUPERSEDED,
};
use crate::bridge::session::{ConnectParams, Handshake, Outbound, Session};
use crate::bridge::{Bridge, HealthReport};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Close reasons are limited to 123 bytes on the wire
const MAX_CLOSE_REASON: usize = 120;

/// How long the writer gets to flush a final close frame
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Router exposing the socket and health endpoints
pub fn router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(bridge)
}

/// Serve until [`Bridge::shutdown`] is called
pub async fn serve(listener: TcpListener, bridge: Arc<Bridge>) -> std::io::Result<()> {
    let app = router(Arc::clone(&bridge));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { bridge.shutdown_signal().await })
        .await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(bridge): State<Arc<Bridge>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge, params))
}

async fn health_handler(State(bridge): State<Arc<Bridge>>) -> Json<HealthReport> {
    Json(bridge.health())
}

fn close_frame(code: u16, mut reason: String) -> Message {
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn handle_socket(socket: WebSocket, bridge: Arc<Bridge>, params: ConnectParams) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                Outbound::Message(message) => match message.to_text() {
                    Ok(text) => ws_tx.send(Message::Text(text)).await,
                    Err(e) => {
                        error!("Failed to serialize message: {}", e);
                        continue;
                    }
                },
                Outbound::Close { code, reason } => {
                    let _ = ws_tx.send(close_frame(code, reason)).await;
                    break;
                }
            };

            if result.is_err() {
                debug!("WebSocket send failed, peer is gone");
                break;
            }
        }
    });

    let session = match accept_handshake(&bridge, &params, &mut ws_rx, outbound_tx.clone()).await {
        Ok(session) => session,
        Err(err) => {
            warn!(
                "❌ Connection rejected before handshake (tabId: {:?}): {}",
                params.tab_id, err
            );
            let _ = outbound_tx.send(Outbound::Close {
                code: CLOSE_AUTH_FAILED,
                reason: err.to_string(),
            });
            drop(outbound_tx);
            let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
            return;
        }
    };
    drop(outbound_tx);

    if let Some(superseded) = bridge.registry().open(Arc::clone(&session)) {
        superseded.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
        bridge.disconnect(superseded.id());
    }

    let heartbeat = bridge.config().heartbeat_interval;
    session.send(ServerMessage::HandshakeAck {
        session_id: session.id().to_string(),
        client_id: session.client_id().to_string(),
        bridge_version: env!("CARGO_PKG_VERSION").to_string(),
        heartbeat_interval_ms: heartbeat.as_millis() as u64,
    });

    read_loop(&bridge, &session, &mut ws_rx, heartbeat).await;

    if session.is_open() {
        info!(
            "📴 '{}' dropped its connection after handshake",
            session.client_id()
        );
    }
    session.close(CLOSE_NORMAL, "connection closed");
    bridge.disconnect(session.id());
    drop(session);
    let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
}

/// Wait for the first message and turn it into an authenticated session
async fn accept_handshake(
    bridge: &Bridge,
    params: &ConnectParams,
    ws_rx: &mut SplitStream<WebSocket>,
    outbound: mpsc::UnboundedSender<Outbound>,
) -> Result<Arc<Session>, BridgeError> {
    bridge.registry().check_connect_params(params)?;

    let first = tokio::time::timeout(bridge.config().handshake_timeout, next_text(ws_rx))
        .await
        .map_err(|_| BridgeError::authentication("no handshake received in time"))?
        .ok_or_else(|| BridgeError::authentication("connection closed before handshake"))?;

    match serde_json::from_str::<ClientMessage>(&first) {
        Ok(ClientMessage::Handshake {
            client_type,
            client_id,
            token,
            capabilities,
            version,
        }) => bridge.registry().authenticate(
            Handshake {
                client_type,
                client_id,
                token,
                capabilities,
                version,
            },
            params,
            outbound,
        ),
        Ok(_) => Err(BridgeError::authentication(
            "first message must be a handshake",
        )),
        Err(e) => Err(BridgeError::authentication(format!(
            "malformed handshake: {}",
            e
        ))),
    }
}

/// Next text frame, or `None` once the peer is gone
async fn next_text(ws_rx: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => return Some(text),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn read_loop(
    bridge: &Arc<Bridge>,
    session: &Arc<Session>,
    ws_rx: &mut SplitStream<WebSocket>,
    heartbeat: Duration,
) {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(bridge, session, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => handle_text(bridge, session, &text),
                    Err(_) => {
                        session.send(ServerMessage::Error {
                            message: "binary frames must carry UTF-8 JSON".to_string(),
                        });
                    }
                },
                Some(Ok(Message::Pong(_))) => session.record_pong(),
                Some(Ok(Message::Ping(_))) => session.record_pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("WebSocket error from '{}': {}", session.client_id(), e);
                    break;
                }
            },
            _ = ticker.tick() => {
                // Superseded or shut down elsewhere
                if !session.is_open() {
                    break;
                }
                if !session.begin_heartbeat_round() {
                    warn!(
                        "💔 '{}' missed a heartbeat, closing",
                        session.client_id()
                    );
                    session.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
                    bridge.disconnect(session.id());
                    break;
                }
                session.send(ServerMessage::Ping { timestamp: Utc::now() });
            },
            _ = bridge.shutdown_signal() => break,
        }
    }
}

fn handle_text(bridge: &Arc<Bridge>, session: &Arc<Session>, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => bridge.handle_client_message(session, message),
        Err(e) => {
            warn!(
                "Failed to parse message from '{}': {}",
                session.client_id(),
                e
            );
            session.send(ServerMessage::Error {
                message: format!("invalid message: {}", e),
            });
        }
    }
}
