//! Relay server
//!
//! One loopback port serves both transports: `/ws` upgrades push peers to
//! a persistent WebSocket, and the REST trio (`/poll-commands`,
//! `/heartbeat`, `/command-response`) carries pull peers that cannot hold
//! an outbound socket open. `/health` answers unauthenticated relay
//! health for probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::diagnostics::health;
use crate::diagnostics::logbuf::{self, LogRingBuffer};
use crate::error::BridgeError;
use crate::ops::manager::OperationManager;
use crate::relay::frame::{frame_type, Frame};
use crate::relay::registry::{PeerRegistry, PeerRole};
use crate::relay::router::Router;
use crate::relay::transport::{PeerTransport, TransportCounters, PUSH_QUEUE_CAPACITY};
use crate::util::unix_ms;

/// How long a freshly-opened socket may stay silent before it must have
/// sent its register frame.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RelayState {
    pub config: BridgeConfig,
    pub router: Arc<Router>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl RelayState {
    pub fn new(
        config: BridgeConfig,
        ops: Arc<OperationManager>,
        logbuf: Arc<LogRingBuffer>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let router = Arc::new(Router::new(
            Arc::new(PeerRegistry::new()),
            Arc::new(DashMap::new()),
            Arc::new(TransportCounters::default()),
            ops,
            logbuf,
            unix_ms(),
        ));
        Arc::new(Self { config, router, shutdown_tx })
    }

    fn relay_health(&self) -> Value {
        let queue_length: usize =
            self.router.transports.iter().map(|t| t.value().queue_len()).sum();
        health::relay_report(
            &self.router.registry,
            &self.router.ops,
            &self.router.counters,
            queue_length,
            self.router.logbuf.len(),
            self.router.started_at_ms,
        )
    }

    /// Evict a peer: transport gone, registry updated, membership
    /// broadcast, operations put through the disconnect grace path.
    fn evict_peer(&self, peer_id: &str, reason: &str) {
        let was_extension = self
            .router
            .registry
            .get(peer_id)
            .map(|p| p.role == PeerRole::Extension)
            .unwrap_or(false);
        self.router.transports.remove(peer_id);
        if self.router.registry.unregister(peer_id) {
            info!("[RELAY] Peer {} evicted ({})", peer_id, reason);
            self.router.publish_client_list();
            self.router.ops.on_peer_disconnect(peer_id, was_extension);
        }
    }
}

pub fn build_app(state: Arc<RelayState>) -> axum::Router {
    let body_limit = state.config.frame_size_limit + 4096;
    axum::Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(http_health))
        .route("/poll-commands", get(poll_commands))
        .route("/heartbeat", post(heartbeat))
        .route("/command-response", post(command_response))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind the loopback listener and serve until shutdown. A bind failure is
/// the only fatal startup error the relay has.
pub async fn serve(state: Arc<RelayState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.relay_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("[RELAY] Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("[RELAY] Listening on {}", addr);

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let app = build_app(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await?;
    Ok(())
}

/// Background relay tasks: progress fan-out, cancel forwarding, debug-log
/// forwarding and pull-peer liveness.
pub fn spawn_pumps(state: &Arc<RelayState>, debug_settings: Arc<parking_lot::Mutex<logbuf::DebugForwardSettings>>) {
    // progress notifications to the owning peer
    {
        let state = Arc::clone(state);
        let mut rx = state.router.ops.subscribe_progress();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => {
                        let mut frame = update.to_frame();
                        frame.to = Some(update.owning_peer_id.clone());
                        if let Err(e) = state.router.send_to(&update.owning_peer_id, frame) {
                            debug!(
                                "[RELAY] Progress for {} undeliverable to {}: {}",
                                update.operation_id, update.owning_peer_id, e
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[RELAY] Progress pump lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // best-effort cancel requests toward the extension
    {
        let state = Arc::clone(state);
        let mut rx = state.router.ops.subscribe_cancel_requests();
        tokio::spawn(async move {
            while let Ok(operation_id) = rx.recv().await {
                if let Some(extension) = state.router.registry.extension_id() {
                    let frame = Frame::notification(
                        frame_type::CANCEL_OPERATION,
                        json!({"operationId": operation_id}),
                    );
                    let _ = state.router.send_to(&extension, frame);
                }
            }
        });
    }

    // batched log_notification frames for debug mode
    {
        let state = Arc::clone(state);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let shutdown_rx = state.shutdown_tx.subscribe();
        tokio::spawn(logbuf::run_debug_forwarder(
            Arc::clone(&state.router.logbuf),
            debug_settings,
            out_tx,
            shutdown_rx,
        ));
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Some(target) = frame.to.clone() {
                    let _ = state.router.send_to(&target, frame);
                }
            }
        });
    }

    // pull-peer liveness sweep
    {
        let state = Arc::clone(state);
        let mut shutdown_rx = state.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                state.config.heartbeat_ms.max(1_000),
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let deadline = unix_ms().saturating_sub(state.config.pull_liveness_ms());
                        let stale: Vec<String> = state
                            .router
                            .transports
                            .iter()
                            .filter(|t| t.value().is_pull() && t.value().last_seen_ms() < deadline)
                            .map(|t| t.key().clone())
                            .collect();
                        for peer_id in stale {
                            state.evict_peer(&peer_id, "missed heartbeats");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Push transport (WebSocket)
// ---------------------------------------------------------------------------

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<RelayState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let limit = state.config.frame_size_limit;

    // the first frame must register the peer
    let register = match tokio::time::timeout(REGISTER_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match Frame::decode(&text, limit) {
            Ok(frame) if frame.frame_type == frame_type::REGISTER => frame,
            Ok(frame) => {
                warn!("[RELAY] First frame was '{}', expected register", frame.frame_type);
                return;
            }
            Err(e) => {
                warn!("[RELAY] Unreadable register frame: {}", e);
                return;
            }
        },
        _ => {
            debug!("[RELAY] Socket closed before registering");
            return;
        }
    };

    let params = register.params.clone().unwrap_or_else(|| json!({}));
    let role = match params.get("role").and_then(|v| v.as_str()) {
        Some("extension") => PeerRole::Extension,
        Some("mcp-client") | None => PeerRole::McpClient,
        Some(other) => {
            warn!("[RELAY] Rejecting unknown peer role '{}'", other);
            let reply = Frame::error_to(
                &register,
                &BridgeError::InvalidParams(format!("unknown role '{other}'")),
            );
            if let Ok(text) = reply.encode(limit) {
                let _ = sink.send(Message::Text(text)).await;
            }
            return;
        }
    };
    let capabilities = params
        .get("capabilities")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let metadata = params.get("metadata").cloned().unwrap_or(Value::Null);
    let requested_id = params.get("peerId").and_then(|v| v.as_str()).map(String::from);
    let reconnecting = requested_id
        .as_deref()
        .map(|id| state.router.registry.contains(id))
        .unwrap_or(false);

    let registration = match state.router.registry.register(requested_id, role, capabilities, metadata) {
        Ok(registration) => registration,
        Err(e) => {
            let reply = Frame::error_to(&register, &e);
            if let Ok(text) = reply.encode(limit) {
                let _ = sink.send(Message::Text(text)).await;
            }
            return;
        }
    };
    let peer_id = registration.peer.id.clone();
    if let Some(evicted) = registration.evicted_extension {
        state.router.transports.remove(&evicted);
        state.router.counters.note_reconnect();
    }
    if reconnecting {
        state.router.counters.note_reconnect();
    }

    let (tx, mut rx) = mpsc::channel::<Frame>(PUSH_QUEUE_CAPACITY);
    let transport = Arc::new(PeerTransport::push(
        peer_id.clone(),
        tx,
        Arc::clone(&state.router.counters),
    ));
    state.router.transports.insert(peer_id.clone(), Arc::clone(&transport));

    info!("[RELAY] Peer {} registered as {:?}", peer_id, registration.peer.role);
    let ack = Frame::response_to(
        &register,
        json!({"peerId": peer_id, "role": registration.peer.role}),
    );
    if let Ok(text) = ack.encode(limit) {
        let _ = sink.send(Message::Text(text)).await;
    }
    state.router.publish_client_list();

    let mut ping_ticker =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat_ms.max(1_000)));
    ping_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_ticker.tick().await; // first tick fires immediately
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > limit {
                            let reply = Frame::error_to(
                                &Frame::new("frame"),
                                &BridgeError::FrameTooLarge { size: text.len(), limit },
                            );
                            let _ = transport.send(reply);
                            continue;
                        }
                        match Frame::decode(&text, limit) {
                            Ok(frame) => state.router.route(&peer_id, frame),
                            Err(e) => {
                                warn!("[RELAY] Bad frame from {}: {}", peer_id, e);
                                let reply = Frame::error_to(&Frame::new("frame"), &e);
                                let _ = transport.send(reply);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("[RELAY] Socket error for {}: {}", peer_id, e);
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        match frame.encode(limit) {
                            Ok(text) => {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("[RELAY] Dropping outbound frame for {}: {}", peer_id, e),
                        }
                    }
                    None => break,
                }
            }
            _ = ping_ticker.tick() => {
                // replaced by a newer registration under the same id?
                if !state.router.registry.contains(&peer_id)
                    || !state
                        .router
                        .transports
                        .get(&peer_id)
                        .map(|t| Arc::ptr_eq(t.value(), &transport))
                        .unwrap_or(false)
                {
                    debug!("[RELAY] Peer {} superseded, closing socket", peer_id);
                    break;
                }
                if transport.note_ping_sent() {
                    warn!("[RELAY] Peer {} missed {} pings, closing", peer_id, crate::relay::transport::MAX_MISSED_PONGS);
                    break;
                }
                let _ = transport.send(Frame::new(frame_type::PING));
            }
            _ = shutdown_rx.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    // only evict if this socket still owns the peer entry
    let still_owner = state
        .router
        .transports
        .get(&peer_id)
        .map(|t| Arc::ptr_eq(t.value(), &transport))
        .unwrap_or(false);
    if still_owner {
        state.evict_peer(&peer_id, "socket closed");
    }
}

// ---------------------------------------------------------------------------
// Pull transport (REST)
// ---------------------------------------------------------------------------

async fn http_health(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(state.relay_health())
}

#[derive(Deserialize)]
struct PeerQuery {
    #[serde(rename = "peerId")]
    peer_id: String,
}

async fn poll_commands(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<PeerQuery>,
) -> impl IntoResponse {
    let Some(transport) = state.router.transports.get(&query.peer_id).map(|t| Arc::clone(t.value()))
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown peer", "errorType": "UnknownTarget"})),
        );
    };
    transport.touch();
    state.router.registry.touch(&query.peer_id);
    let commands = transport.drain();
    (StatusCode::OK, Json(json!({"commands": commands})))
}

async fn heartbeat(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let role = match body.get("role").and_then(|v| v.as_str()) {
        Some("mcp-client") => PeerRole::McpClient,
        _ => PeerRole::Extension,
    };
    let requested_id = body.get("peerId").and_then(|v| v.as_str()).map(String::from);
    let capabilities = body
        .get("capabilities")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let known = requested_id
        .as_deref()
        .map(|id| state.router.transports.contains_key(id))
        .unwrap_or(false);

    let registration = match state.router.registry.register(
        requested_id,
        role,
        capabilities,
        body.get("metadata").cloned().unwrap_or(Value::Null),
    ) {
        Ok(registration) => registration,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string(), "errorType": e.error_type()})),
            );
        }
    };
    let peer_id = registration.peer.id.clone();
    if let Some(evicted) = registration.evicted_extension {
        state.router.transports.remove(&evicted);
        state.router.counters.note_reconnect();
    }

    if !known {
        let transport = Arc::new(PeerTransport::pull(
            peer_id.clone(),
            Arc::clone(&state.router.counters),
        ));
        state.router.transports.insert(peer_id.clone(), transport);
        state.router.publish_client_list();
        info!(
            "[RELAY] Pull peer {} registered as {:?} ({} peer(s) total)",
            peer_id,
            role,
            state.router.registry.len()
        );
    } else if let Some(transport) = state.router.transports.get(&peer_id) {
        transport.touch();
    }

    (
        StatusCode::OK,
        Json(json!({
            "peerId": peer_id,
            "pollIntervalMs": state.config.command_interval_ms,
            "heartbeatIntervalMs": state.config.heartbeat_ms,
        })),
    )
}

async fn command_response(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<PeerQuery>,
    body: String,
) -> impl IntoResponse {
    if !state.router.transports.contains_key(&query.peer_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown peer", "errorType": "UnknownTarget"})),
        );
    }
    match Frame::decode(&body, state.config.frame_size_limit) {
        Ok(frame) => {
            state.router.route(&query.peer_id, frame);
            (StatusCode::OK, Json(json!({"ok": true})))
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string(), "errorType": e.error_type()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::logbuf::DEFAULT_LOG_CAPACITY;
    use crate::ops::store::OperationStore;

    fn state(dir: &tempfile::TempDir) -> Arc<RelayState> {
        let config = BridgeConfig::default();
        let ops = OperationManager::new(
            OperationStore::new(dir.path().join("ops.json")),
            &config,
        );
        let (shutdown_tx, _) = broadcast::channel(4);
        RelayState::new(config, ops, LogRingBuffer::new(DEFAULT_LOG_CAPACITY), shutdown_tx)
    }

    #[tokio::test]
    async fn test_heartbeat_registers_pull_peer_and_poll_drains() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        // register via heartbeat
        let response = heartbeat(
            State(Arc::clone(&state)),
            Json(json!({"peerId": "pull-ext", "role": "extension", "capabilities": ["tabs"]})),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.router.registry.contains("pull-ext"));
        assert!(state.router.transports.get("pull-ext").unwrap().is_pull());

        // queue a frame for it, then poll
        state
            .router
            .send_to("pull-ext", Frame::new("tab.list"))
            .unwrap();
        let transport = Arc::clone(state.router.transports.get("pull-ext").unwrap().value());
        assert_eq!(transport.queue_len(), 1);
        let drained = transport.drain();
        assert_eq!(drained[0].frame_type, "tab.list");
    }

    #[tokio::test]
    async fn test_command_response_routes_inbound() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        heartbeat(
            State(Arc::clone(&state)),
            Json(json!({"peerId": "pull-ext", "role": "extension"})),
        )
        .await;

        // an observer milestone posted over the pull transport
        let frame = Frame::request(
            frame_type::REGISTER_OPERATION,
            "r1",
            json!({"operationId": "op_pull_1", "kind": "send_message", "params": {"tabId": 1}}),
        );
        let response = command_response(
            State(Arc::clone(&state)),
            Query(PeerQuery { peer_id: "pull-ext".into() }),
            serde_json::to_string(&frame).unwrap(),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.router.ops.get("op_pull_1").is_some());

        // the ack was queued for the next poll
        let transport = Arc::clone(state.router.transports.get("pull-ext").unwrap().value());
        let drained = transport.drain();
        assert!(drained.iter().any(|f| f.id.as_deref() == Some("r1")));
    }

    #[tokio::test]
    async fn test_poll_unknown_peer_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let response = poll_commands(
            State(state),
            Query(PeerQuery { peer_id: "ghost".into() }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_evict_peer_broadcasts_and_fails_operations() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        heartbeat(
            State(Arc::clone(&state)),
            Json(json!({"peerId": "pull-ext", "role": "extension"})),
        )
        .await;
        state
            .router
            .ops
            .begin(
                crate::ops::operation::OperationKind::SendMessage,
                json!({}),
                "client-1",
                Some(1),
                None,
                None,
            );

        state.evict_peer("pull-ext", "test");
        assert!(!state.router.registry.contains("pull-ext"));
        assert!(state.router.transports.get("pull-ext").is_none());
    }
}
