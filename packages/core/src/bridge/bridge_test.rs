//! Tests for tool routing, transactions and session teardown

use super::*;
use crate::bridge::protocol::{RemoteError, CLOSE_NORMAL};
use crate::bridge::session::{test_session, Outbound};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

type Seen = Arc<Mutex<Vec<(String, Value, Option<String>)>>>;

fn bridge() -> Arc<Bridge> {
    Arc::new(Bridge::new(BridgeConfig::default()))
}

fn connect(bridge: &Bridge, kind: ClientKind, tab: &str) -> (Arc<Session>, UnboundedReceiver<Outbound>) {
    let (session, rx) = test_session(kind, tab);
    bridge.registry().open(Arc::clone(&session));
    (session, rx)
}

/// Fake document instance answering every request with `handler`
fn serve_document<F>(
    bridge: &Arc<Bridge>,
    session: &Arc<Session>,
    mut rx: UnboundedReceiver<Outbound>,
    handler: F,
) -> Seen
where
    F: Fn(&str, &Value) -> Result<Value, RemoteError> + Send + 'static,
{
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let bridge = Arc::clone(bridge);
    let session = Arc::clone(session);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Outbound::Message(ServerMessage::Request {
                id,
                method,
                params,
                transaction_id,
            }) = frame
            else {
                continue;
            };
            log.lock()
                .unwrap()
                .push((method.clone(), params.clone(), transaction_id));

            let (result, error) = match handler(&method, &params) {
                Ok(value) => (Some(value), None),
                Err(err) => (None, Some(err)),
            };
            bridge.handle_client_message(&session, ClientMessage::Response { id, result, error });
        }
    });
    seen
}

/// Next request the document side sees: (id, method, params, transaction tag)
async fn next_request(
    rx: &mut UnboundedReceiver<Outbound>,
) -> (CorrelationId, String, Value, Option<String>) {
    match rx.recv().await.unwrap() {
        Outbound::Message(ServerMessage::Request {
            id,
            method,
            params,
            transaction_id,
        }) => (id, method, params, transaction_id),
        other => panic!("expected request, got {:?}", other),
    }
}

fn answer(bridge: &Arc<Bridge>, session: &Arc<Session>, id: CorrelationId, outcome: Result<Value, RemoteError>) {
    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(err) => (None, Some(err)),
    };
    bridge.handle_client_message(session, ClientMessage::Response { id, result, error });
}

fn dispatch(bridge: &Bridge, name: &str, arguments: Value) -> Result<InFlight, BridgeError> {
    bridge.dispatch_tool(None, PreparedCall::new(name, arguments).unwrap())
}

/// Begin a transaction against a hand-driven document and return its id
async fn begin_answered(
    bridge: &Arc<Bridge>,
    session: &Arc<Session>,
    rx: &mut UnboundedReceiver<Outbound>,
) -> String {
    let begin = dispatch(bridge, "begin_transaction", json!({})).unwrap();
    let (id, method, params, _) = next_request(rx).await;
    assert_eq!(method, "begin_transaction");
    answer(bridge, session, id, Ok(json!({})));
    begin.finish().await.unwrap();
    params["transactionId"].as_str().unwrap().to_string()
}

fn test_tree() -> Value {
    json!({
        "id": "root",
        "type": "root",
        "name": "Test Project",
        "children": [
            { "id": "p-1", "type": "phase", "name": "Phase 1", "children": [] }
        ]
    })
}

#[tokio::test]
async fn test_no_document_instance_is_no_target() {
    let bridge = bridge();
    bridge.registry().register_stdio_agent();

    let err = bridge.call_tool(None, "get_tree", json!({})).await.unwrap_err();
    assert_eq!(err, BridgeError::NoTarget { tab_id: None });
}

#[tokio::test]
async fn test_two_instances_without_tab_id_is_ambiguous() {
    let bridge = bridge();
    let (_a, _rx_a) = connect(&bridge, ClientKind::DocumentInstance, "tab-a");
    let (_b, _rx_b) = connect(&bridge, ClientKind::DocumentInstance, "tab-b");

    let err = bridge.call_tool(None, "get_tree", json!({})).await.unwrap_err();
    assert!(matches!(err, BridgeError::AmbiguousTarget { .. }));
    assert_eq!(bridge.correlator().pending_count(), 0);
}

#[tokio::test]
async fn test_validation_fails_before_routing() {
    let bridge = bridge();
    // No instance connected: a routing error would be NoTarget
    let err = bridge
        .call_tool(None, "get_node", json!({"nodeId": 42}))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Validation { .. }));
}

#[tokio::test]
async fn test_get_tree_round_trip_unchanged() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let seen = serve_document(&bridge, &session, rx, |method, _| {
        assert_eq!(method, "get_tree");
        Ok(test_tree())
    });

    let tree = bridge
        .call_tool(None, "get_tree", json!({"format": "agent", "tabId": "tab-1"}))
        .await
        .unwrap();
    assert_eq!(tree, test_tree());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, json!({"format": "agent"}));
    assert_eq!(seen[0].2, None);
}

#[tokio::test]
async fn test_document_error_is_surfaced_with_code() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    serve_document(&bridge, &session, rx, |_, params| {
        Err(RemoteError {
            message: format!("Node not found: {}", params["nodeId"].as_str().unwrap_or("")),
            code: Some("NODE_NOT_FOUND".to_string()),
        })
    });

    let err = bridge
        .call_tool(None, "get_node", json!({"nodeId": "n-404"}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::document("Node not found: n-404", Some("NODE_NOT_FOUND".to_string()))
    );
}

#[tokio::test]
async fn test_transaction_lifecycle_tags_mutations() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let seen = serve_document(&bridge, &session, rx, |method, _| match method {
        "create_node" => Ok(json!({"id": "n-1"})),
        _ => Ok(json!({"ok": true})),
    });

    let begun = bridge
        .call_tool(None, "begin_transaction", json!({"label": "Import plan"}))
        .await
        .unwrap();
    let tx = begun["transactionId"].as_str().unwrap().to_string();
    assert_eq!(begun["label"], "Import plan");

    // Second begin is rejected and names the active transaction
    let err = bridge
        .call_tool(None, "begin_transaction", json!({}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::TransactionAlreadyActive {
            active_id: tx.clone()
        }
    );

    for name in ["A", "B"] {
        bridge
            .call_tool(None, "create_node", json!({"parentId": "root", "name": name}))
            .await
            .unwrap();
    }
    // Reads are not tagged
    bridge.call_tool(None, "get_tree", json!({})).await.unwrap();

    let committed = bridge
        .call_tool(None, "commit_transaction", json!({"transactionId": tx}))
        .await
        .unwrap();
    assert_eq!(committed["committed"], true);
    assert_eq!(committed["mutationCount"], 2);
    assert_eq!(committed["document"], json!({"ok": true}));
    assert!(bridge.transactions().active_for(session.id()).is_none());

    let seen = seen.lock().unwrap();
    let methods: Vec<&str> = seen.iter().map(|(m, _, _)| m.as_str()).collect();
    assert_eq!(
        methods,
        vec![
            "begin_transaction",
            "create_node",
            "create_node",
            "get_tree",
            "commit_transaction"
        ]
    );
    assert_eq!(seen[0].1["transactionId"], tx.as_str());
    assert_eq!(seen[1].2.as_deref(), Some(tx.as_str()));
    assert_eq!(seen[2].2.as_deref(), Some(tx.as_str()));
    assert_eq!(seen[3].2, None);
    assert_eq!(seen[4].2.as_deref(), Some(tx.as_str()));
}

#[tokio::test]
async fn test_mismatched_commit_never_reaches_document() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let seen = serve_document(&bridge, &session, rx, |_, _| Ok(json!({})));

    let begun = bridge
        .call_tool(None, "begin_transaction", json!({}))
        .await
        .unwrap();
    let err = bridge
        .call_tool(None, "rollback_transaction", json!({"transactionId": "tx-stale"}))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        BridgeError::TransactionMismatch {
            active_id: begun["transactionId"].as_str().unwrap().to_string(),
            requested: "tx-stale".to_string()
        }
    );
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_begin_releases_reservation() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    serve_document(&bridge, &session, rx, |method, _| match method {
        "begin_transaction" => Err(RemoteError {
            message: "document is read-only".to_string(),
            code: None,
        }),
        _ => Ok(json!({})),
    });

    let err = bridge
        .call_tool(None, "begin_transaction", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Document { .. }));
    assert!(bridge.transactions().active_for(session.id()).is_none());
}

#[tokio::test]
async fn test_failed_commit_keeps_transaction_active() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    serve_document(&bridge, &session, rx, |method, _| match method {
        "commit_transaction" => Err(RemoteError {
            message: "checkpoint failed".to_string(),
            code: None,
        }),
        _ => Ok(json!({})),
    });

    let begun = bridge
        .call_tool(None, "begin_transaction", json!({}))
        .await
        .unwrap();
    let tx = begun["transactionId"].clone();

    assert!(bridge
        .call_tool(None, "commit_transaction", json!({"transactionId": tx}))
        .await
        .is_err());
    let info = bridge.transactions().active_for(session.id()).unwrap();
    assert_eq!(info.state, TransactionState::Active);

    let rolled = bridge
        .call_tool(None, "rollback_transaction", json!({"transactionId": tx}))
        .await
        .unwrap();
    assert_eq!(rolled["rolledBack"], true);
}

#[tokio::test]
async fn test_disconnect_fails_pending_and_rolls_back() {
    let bridge = bridge();
    let (session, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");

    let begin = bridge
        .dispatch_tool(None, PreparedCall::new("begin_transaction", json!({})).unwrap())
        .unwrap();
    let begin_id = match rx.recv().await.unwrap() {
        Outbound::Message(ServerMessage::Request { id, .. }) => id,
        other => panic!("unexpected {:?}", other),
    };
    bridge.handle_client_message(
        &session,
        ClientMessage::Response {
            id: begin_id,
            result: Some(json!({})),
            error: None,
        },
    );
    begin.finish().await.unwrap();

    // Document never answers this one
    let stuck = bridge
        .dispatch_tool(
            None,
            PreparedCall::new("create_node", json!({"parentId": "root", "name": "x"})).unwrap(),
        )
        .unwrap();

    let report = bridge.disconnect(session.id());
    assert_eq!(report.failed_requests, 1);
    assert_eq!(
        report.rolled_back.map(|tx| tx.state),
        Some(TransactionState::RolledBack)
    );

    let err = stuck.finish().await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::PeerDisconnected {
            client_id: "tab-1".to_string()
        }
    );
    assert!(bridge.registry().is_empty());

    // Second teardown is a no-op
    assert_eq!(bridge.disconnect(session.id()), DisconnectReport::default());
}

#[tokio::test]
async fn test_agent_tool_call_over_websocket() {
    let bridge = bridge();
    let (doc, doc_rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    serve_document(&bridge, &doc, doc_rx, |_, _| Ok(test_tree()));
    let (agent, mut agent_rx) = connect(&bridge, ClientKind::ToolAgent, "agent-2");

    bridge.handle_client_message(
        &agent,
        ClientMessage::ToolCall {
            id: json!("c-1"),
            name: "get_tree".to_string(),
            arguments: json!({}),
        },
    );

    match agent_rx.recv().await.unwrap() {
        Outbound::Message(ServerMessage::ToolResult { id, result }) => {
            assert_eq!(id, json!("c-1"));
            assert_eq!(result["isError"], false);
            assert_eq!(result["structuredContent"], test_tree());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_document_instance_cannot_issue_tool_calls() {
    let bridge = bridge();
    let (doc, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");

    bridge.handle_client_message(
        &doc,
        ClientMessage::ToolCall {
            id: json!(1),
            name: "get_tree".to_string(),
            arguments: json!({}),
        },
    );
    assert!(matches!(
        rx.try_recv().unwrap(),
        Outbound::Message(ServerMessage::Error { .. })
    ));
}

#[tokio::test]
async fn test_peer_ping_is_answered() {
    let bridge = bridge();
    let (doc, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    bridge.handle_client_message(&doc, ClientMessage::Ping {});
    assert_eq!(rx.try_recv().unwrap(), Outbound::Message(ServerMessage::Pong {}));
}

#[tokio::test]
async fn test_shutdown_closes_sessions_normally() {
    let bridge = bridge();
    let (_doc, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");

    bridge.shutdown();
    assert!(bridge.is_shutting_down());
    assert!(bridge.registry().is_empty());
    assert_eq!(
        rx.try_recv().unwrap(),
        Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "bridge shutting down".to_string()
        }
    );

    // Resolves immediately once shut down
    bridge.shutdown_signal().await;
}

#[tokio::test]
async fn test_health_reports_sessions_and_transactions() {
    let bridge = bridge();
    bridge.registry().register_stdio_agent();
    let (doc, _rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let tx = bridge.transactions().begin(&doc, None).unwrap();
    let _read = dispatch(&bridge, "get_tree", json!({})).unwrap();

    let health = bridge.health();
    assert_eq!(health.status, "ok");
    assert_eq!(health.active_transactions, 1);
    assert_eq!(health.pending_requests, 1);
    assert_eq!(health.sessions.len(), 2);
    let doc_health = health
        .sessions
        .iter()
        .find(|s| s.client_id == "tab-1")
        .unwrap();
    assert_eq!(doc_health.active_transaction.as_deref(), Some(tx.as_str()));
    assert_eq!(doc_health.pending_requests, 1);
    let agent_health = health
        .sessions
        .iter()
        .find(|s| s.client_id == "stdio")
        .unwrap();
    assert_eq!(agent_health.pending_requests, 0);

    let body = serde_json::to_value(&health).unwrap();
    assert!(body["pendingRequests"].is_number());
    assert!(body["sessions"][0]["sessionId"].is_string());
}

#[tokio::test(start_paused = true)]
async fn test_commit_timeout_returns_to_idle_and_queues_rollback() {
    let bridge = bridge();
    let (session, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let tx = begin_answered(&bridge, &session, &mut rx).await;

    let commit = dispatch(&bridge, "commit_transaction", json!({"transactionId": tx})).unwrap();
    let (commit_id, method, _, _) = next_request(&mut rx).await;
    assert_eq!(method, "commit_transaction");

    let err = commit.finish().await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));
    assert!(bridge.transactions().active_for(session.id()).is_none());

    // Rollback goes out behind the unanswered commit
    let (rollback_id, method, params, tagged) = next_request(&mut rx).await;
    assert_eq!(method, "rollback_transaction");
    assert_eq!(params["transactionId"], tx.as_str());
    assert_eq!(tagged.as_deref(), Some(tx.as_str()));

    // The document commits late, then finds nothing left to roll back
    assert_eq!(
        bridge
            .correlator()
            .resolve(session.id(), commit_id, Ok(json!({"committed": true}))),
        Resolution::Unmatched
    );
    answer(
        &bridge,
        &session,
        rollback_id,
        Err(RemoteError {
            message: "No active transaction".to_string(),
            code: Some("NO_ACTIVE_TRANSACTION".to_string()),
        }),
    );

    // Idle: mutations are untagged and a new transaction may start
    let _create = dispatch(&bridge, "create_node", json!({"parentId": "root", "name": "After"})).unwrap();
    let (_, method, _, tagged) = next_request(&mut rx).await;
    assert_eq!(method, "create_node");
    assert_eq!(tagged, None);

    let next = dispatch(&bridge, "begin_transaction", json!({})).unwrap();
    let (_, method, params, _) = next_request(&mut rx).await;
    assert_eq!(method, "begin_transaction");
    assert_ne!(params["transactionId"], tx.as_str());
    assert_eq!(next.kind(), ToolKind::BeginTransaction);
}

#[tokio::test(start_paused = true)]
async fn test_begin_timeout_rolls_back_before_idle_edits() {
    let bridge = bridge();
    let (session, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");

    let begin = dispatch(&bridge, "begin_transaction", json!({})).unwrap();
    let (begin_id, _, params, _) = next_request(&mut rx).await;
    let tx = params["transactionId"].as_str().unwrap().to_string();

    let err = begin.finish().await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));
    assert!(bridge.transactions().active_for(session.id()).is_none());

    let (_, method, params, _) = next_request(&mut rx).await;
    assert_eq!(method, "rollback_transaction");
    assert_eq!(params["transactionId"], tx.as_str());

    // The late begin answer is discarded
    assert_eq!(
        bridge.correlator().resolve(session.id(), begin_id, Ok(json!({}))),
        Resolution::Unmatched
    );

    // An idle edit is queued behind the rollback, untagged
    let _create = dispatch(&bridge, "create_node", json!({"parentId": "root", "name": "Idle"})).unwrap();
    let (_, method, _, tagged) = next_request(&mut rx).await;
    assert_eq!(method, "create_node");
    assert_eq!(tagged, None);

    let next = begin_answered(&bridge, &session, &mut rx).await;
    assert_ne!(next, tx);
}

#[tokio::test(start_paused = true)]
async fn test_peer_lost_mid_commit_returns_to_idle() {
    let bridge = bridge();
    let (session, mut rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let tx = begin_answered(&bridge, &session, &mut rx).await;

    let commit = dispatch(&bridge, "commit_transaction", json!({"transactionId": tx})).unwrap();
    next_request(&mut rx).await;

    // Pending requests fail before the session itself is torn down
    assert_eq!(bridge.correlator().fail_session(session.id()), 1);
    let err = commit.finish().await.unwrap_err();
    assert!(matches!(err, BridgeError::PeerDisconnected { .. }));
    assert!(bridge.transactions().active_for(session.id()).is_none());

    // Nothing is queued for a peer that is gone
    assert!(rx.try_recv().is_err());

    let next = begin_answered(&bridge, &session, &mut rx).await;
    assert_ne!(next, tx);
}

#[tokio::test]
async fn test_commit_of_transaction_the_document_lacks_returns_to_idle() {
    let bridge = bridge();
    let (session, rx) = connect(&bridge, ClientKind::DocumentInstance, "tab-1");
    let seen = serve_document(&bridge, &session, rx, |method, _| match method {
        "commit_transaction" => Err(RemoteError {
            message: "No active transaction".to_string(),
            code: Some("NO_ACTIVE_TRANSACTION".to_string()),
        }),
        _ => Ok(json!({})),
    });

    let begun = bridge
        .call_tool(None, "begin_transaction", json!({}))
        .await
        .unwrap();
    let err = bridge
        .call_tool(
            None,
            "commit_transaction",
            json!({"transactionId": begun["transactionId"]}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Document { .. }));
    assert!(bridge.transactions().active_for(session.id()).is_none());

    assert!(bridge
        .call_tool(None, "begin_transaction", json!({}))
        .await
        .is_ok());
    // No rollback is sent for a transaction the document already lacks
    let methods: Vec<String> = seen.lock().unwrap().iter().map(|(m, _, _)| m.clone()).collect();
    assert_eq!(
        methods,
        vec!["begin_transaction", "commit_transaction", "begin_transaction"]
    );
}
