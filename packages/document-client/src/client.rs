//! Document Client
//!
//! Keeps one document instance connected to a bridge. [`DocumentClient::run`]
//! loops over connection attempts:
//!
//! ```text
//! connect -> handshake -> serve requests -> (drop) -> backoff -> connect ...
//! ```
//!
//! Failures before the handshake completes and drops after it log
//! differently but share one [`Backoff`]. A successful handshake resets it,
//! as does [`ClientHandle::reconnect_now`]. A `4002` close ends the loop with
//! [`ClientError::AuthenticationFailed`]; a `4003` close ends it with
//! [`ClientError::Superseded`] so two copies of the same tab do not evict
//! each other forever.

use crate::adapter::DocumentAdapter;
use crate::backoff::{Backoff, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY};
use crate::error::ClientError;
use crate::executor::{spawn_worker, IncomingRequest, RpcExecutor};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use treelisty_mcp_core::bridge::protocol::{
    ClientKind, ClientMessage, ServerMessage, CLOSE_AUTH_FAILED, CLOSE_SUPERSEDED,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Stream = SplitStream<Socket>;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DocumentClientConfig {
    /// Bridge base URL, e.g. `ws://127.0.0.1:41234`
    pub url: String,
    pub token: String,
    pub tab_id: String,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    /// Limit for connecting and for receiving the `handshake_ack`
    pub handshake_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl DocumentClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            tab_id: tab_id.into(),
            capabilities: vec!["tree".to_string(), "transactions".to_string()],
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            handshake_timeout: Duration::from_secs(10),
            initial_backoff: DEFAULT_INITIAL_DELAY,
            max_backoff: DEFAULT_MAX_DELAY,
        }
    }

    /// Config for a bridge on this machine
    pub fn local(port: u16, token: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self::new(format!("ws://127.0.0.1:{}", port), token, tab_id)
    }

    /// Connection URL with the token and tab id as query parameters
    ///
    /// Values that would need percent-encoding are left to the handshake,
    /// which carries both anyway.
    pub fn connect_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let query: Vec<String> = [("token", &self.token), ("tabId", &self.tab_id)]
            .into_iter()
            .filter(|(_, value)| is_query_safe(value))
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        if query.is_empty() {
            format!("{}/", base)
        } else {
            format!("{}/?{}", base, query.join("&"))
        }
    }
}

fn is_query_safe(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
}

/// Connection lifecycle notifications for UI status displays
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting {
        attempt: u32,
    },
    Connected {
        session_id: String,
        client_id: String,
    },
    Disconnected {
        reason: String,
        retry_in: Option<Duration>,
    },
    AuthenticationFailed {
        reason: String,
    },
    Error {
        message: String,
    },
}

/// Control surface for a running [`DocumentClient`]
#[derive(Clone)]
pub struct ClientHandle {
    shutdown: Arc<watch::Sender<bool>>,
    reconnect: Arc<watch::Sender<u64>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ClientHandle {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (reconnect, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shutdown: Arc::new(shutdown),
            reconnect: Arc::new(reconnect),
            events,
        }
    }

    /// Reset backoff and connect now: cuts a pending wait short, or drops a
    /// live connection in favour of a fresh one
    pub fn reconnect_now(&self) {
        self.reconnect.send_modify(|generation| *generation += 1);
    }

    /// Close the connection and end [`DocumentClient::run`]
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// How one connection attempt ended, short of an error
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    ReconnectRequested,
    Dropped { reason: String },
}

pub struct DocumentClient {
    config: DocumentClientConfig,
    executor: Arc<RpcExecutor>,
    backoff: Backoff,
    handle: ClientHandle,
}

impl DocumentClient {
    pub fn new(config: DocumentClientConfig, adapter: Arc<dyn DocumentAdapter>) -> Self {
        let backoff = Backoff::new(config.initial_backoff, config.max_backoff);
        Self {
            config,
            executor: Arc::new(RpcExecutor::new(adapter)),
            backoff,
            handle: ClientHandle::new(),
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Run on a background task
    pub fn spawn(self) -> (ClientHandle, JoinHandle<Result<(), ClientError>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.handle.events.send(event);
    }

    /// Connect and serve until shut down or rejected by the bridge
    pub async fn run(mut self) -> Result<(), ClientError> {
        let mut shutdown = self.handle.shutdown.subscribe();
        let mut reconnect = self.handle.reconnect.subscribe();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            reconnect.borrow_and_update();
            self.emit(ConnectionEvent::Connecting {
                attempt: self.backoff.attempts() + 1,
            });

            let reason = match self.connect_once(&mut shutdown, &mut reconnect).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("👋 Document client stopped");
                    self.emit(ConnectionEvent::Disconnected {
                        reason: "shutdown".to_string(),
                        retry_in: None,
                    });
                    return Ok(());
                }
                Ok(SessionEnd::ReconnectRequested) => {
                    info!("🔄 Reconnecting on request");
                    self.backoff.reset();
                    continue;
                }
                Ok(SessionEnd::Dropped { reason }) => {
                    warn!("🔌 Connection to bridge lost after handshake: {}", reason);
                    reason
                }
                Err(err @ ClientError::AuthenticationFailed { .. }) => {
                    error!("❌ Bridge rejected this document instance: {}", err);
                    self.emit(ConnectionEvent::AuthenticationFailed {
                        reason: err.to_string(),
                    });
                    return Err(err);
                }
                Err(err) if err.is_fatal() => {
                    warn!("🔌 Stopping: {}", err);
                    self.emit(ConnectionEvent::Disconnected {
                        reason: err.to_string(),
                        retry_in: None,
                    });
                    return Err(err);
                }
                Err(err) => {
                    warn!("⚠️  Could not establish bridge connection: {}", err);
                    self.emit(ConnectionEvent::Error {
                        message: err.to_string(),
                    });
                    err.to_string()
                }
            };

            let delay = self.backoff.next_delay();
            debug!("Retrying bridge connection in {:?}", delay);
            self.emit(ConnectionEvent::Disconnected {
                reason,
                retry_in: Some(delay),
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                Ok(()) = reconnect.changed() => {
                    info!("🔄 Manual reconnect, skipping backoff");
                    self.backoff.reset();
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("👋 Document client stopped");
                    return Ok(());
                }
            }
        }
    }

    async fn connect_once(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        reconnect: &mut watch::Receiver<u64>,
    ) -> Result<SessionEnd, ClientError> {
        let url = self.config.connect_url();
        debug!("Connecting to bridge at {}", url);

        let limit = self.config.handshake_timeout;
        let socket = tokio::select! {
            connected = tokio::time::timeout(limit, connect_async(url.as_str())) => match connected {
                Ok(Ok((socket, _))) => socket,
                Ok(Err(source)) => return Err(ClientError::Connect { url: url.clone(), source }),
                Err(_) => {
                    return Err(ClientError::Handshake(format!("timed out connecting to {}", url)))
                }
            },
            _ = shutdown_requested(shutdown) => return Ok(SessionEnd::Shutdown),
        };
        let (mut sink, mut stream) = socket.split();

        let handshake = ClientMessage::Handshake {
            client_type: ClientKind::DocumentInstance,
            client_id: self.config.tab_id.clone(),
            token: Some(self.config.token.clone()),
            capabilities: self.config.capabilities.clone(),
            version: self.config.version.clone(),
        };
        sink.send(Message::Text(serde_json::to_string(&handshake)?))
            .await?;

        let (session_id, client_id) = tokio::select! {
            ack = tokio::time::timeout(limit, read_ack(&mut stream)) => match ack {
                Ok(ack) => ack?,
                Err(_) => return Err(ClientError::Handshake("no handshake_ack from bridge".to_string())),
            },
            _ = shutdown_requested(shutdown) => {
                let _ = sink.close().await;
                return Ok(SessionEnd::Shutdown);
            }
        };

        self.backoff.reset();
        info!("✅ Connected to bridge as {} (session {})", client_id, session_id);
        self.emit(ConnectionEvent::Connected {
            session_id,
            client_id,
        });

        let end = self.serve(&mut sink, &mut stream, shutdown, reconnect).await;

        if let Some(transaction_id) = self.executor.connection_lost().await {
            debug!("Discarded local state of transaction {}", transaction_id);
        }
        end
    }

    /// Serve bridge requests on an established connection
    async fn serve(
        &self,
        sink: &mut Sink,
        stream: &mut Stream,
        shutdown: &mut watch::Receiver<bool>,
        reconnect: &mut watch::Receiver<u64>,
    ) -> Result<SessionEnd, ClientError> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (requests, worker) = spawn_worker(Arc::clone(&self.executor), out_tx);

        let end = loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Some(Ok(Message::Close(frame))) => break close_outcome(frame),
                        // Transport-level ping/pong is answered by tungstenite
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Ok(SessionEnd::Dropped { reason: e.to_string() }),
                        None => break Ok(SessionEnd::Dropped { reason: "connection closed".to_string() }),
                    };
                    if let Some(reply) = handle_server_text(&text, &requests) {
                        if let Err(e) = send_message(sink, &reply).await {
                            break Ok(SessionEnd::Dropped { reason: e.to_string() });
                        }
                    }
                }
                Some(response) = out_rx.recv() => {
                    if let Err(e) = send_message(sink, &response).await {
                        break Ok(SessionEnd::Dropped { reason: e.to_string() });
                    }
                }
                Ok(()) = reconnect.changed() => {
                    let _ = sink.close().await;
                    break Ok(SessionEnd::ReconnectRequested);
                }
                _ = shutdown_requested(shutdown) => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "document instance shutting down".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break Ok(SessionEnd::Shutdown);
                }
            }
        };

        drop(requests);
        worker.abort();
        let _ = worker.await;
        end
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn send_message(sink: &mut Sink, message: &ClientMessage) -> Result<(), ClientError> {
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

/// Wait for the `handshake_ack`; returns (session id, client id)
async fn read_ack(stream: &mut Stream) -> Result<(String, String), ClientError> {
    loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                return Err(match close_outcome(frame) {
                    Err(err) => err,
                    Ok(_) => ClientError::Handshake("bridge closed before handshake_ack".to_string()),
                })
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ClientError::WebSocket(e)),
            None => return Err(ClientError::Handshake("connection closed".to_string())),
        };

        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::HandshakeAck {
                session_id,
                client_id,
                ..
            }) => return Ok((session_id, client_id)),
            Ok(ServerMessage::Error { message }) => {
                warn!("Bridge complained during handshake: {}", message)
            }
            Ok(other) => debug!("Ignoring {:?} before handshake_ack", other),
            Err(e) => warn!("Unparseable message during handshake: {}", e),
        }
    }
}

/// Classify a close frame from the bridge
fn close_outcome(frame: Option<CloseFrame<'static>>) -> Result<SessionEnd, ClientError> {
    let Some(frame) = frame else {
        return Ok(SessionEnd::Dropped {
            reason: "closed without a close code".to_string(),
        });
    };
    let code = u16::from(frame.code);
    let reason = frame.reason.to_string();
    match code {
        CLOSE_AUTH_FAILED => Err(ClientError::AuthenticationFailed { reason }),
        CLOSE_SUPERSEDED => Err(ClientError::Superseded { reason }),
        _ => Ok(SessionEnd::Dropped {
            reason: format!("closed with {}: {}", code, reason),
        }),
    }
}

/// Route one text message from the bridge; returns an immediate reply
fn handle_server_text(
    text: &str,
    requests: &mpsc::UnboundedSender<IncomingRequest>,
) -> Option<ClientMessage> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unparseable message from bridge: {}", e);
            return None;
        }
    };

    match message {
        ServerMessage::Request {
            id,
            method,
            params,
            transaction_id,
        } => {
            let request = IncomingRequest {
                id,
                method,
                params,
                transaction_id,
            };
            if requests.send(request).is_err() {
                warn!("Request {} dropped: worker stopped", id);
            }
            None
        }
        ServerMessage::Ping { .. } => Some(ClientMessage::Pong {}),
        ServerMessage::Error { message } => {
            warn!("Bridge reported an error: {}", message);
            None
        }
        ServerMessage::Pong {} | ServerMessage::HandshakeAck { .. } => None,
        ServerMessage::ToolResult { id, .. } => {
            debug!("Ignoring tool_result {} on a document connection", id);
            None
        }
    }
}
