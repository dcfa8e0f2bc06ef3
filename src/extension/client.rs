//! Extension peer client
//!
//! Connects the extension-side stack to the relay over an outbound
//! WebSocket, registers with the extension role, pumps routed tool frames
//! into the command router and keeps reconnecting with capped exponential
//! backoff and jitter when the relay goes away.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::extension::commands::{CommandRouter, ExtensionContext};
use crate::relay::frame::{frame_type, Frame};

/// Capabilities advertised at registration.
pub const EXTENSION_CAPABILITIES: &[&str] = &[
    "tabs",
    "debugger",
    "script-injection",
    "network-monitor",
    "conversations",
];

pub struct ExtensionClient {
    ctx: Arc<ExtensionContext>,
    commands: Arc<CommandRouter>,
    relay_url: String,
    frame_size_limit: usize,
    reconnect_base_ms: u64,
    reconnect_max_ms: u64,
}

/// Exponential backoff with jitter, capped.
pub fn backoff_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16).saturating_sub(1));
    let capped = exp.min(max_ms);
    capped + rand::thread_rng().gen_range(0..=capped / 4)
}

impl ExtensionClient {
    pub fn new(ctx: Arc<ExtensionContext>, commands: Arc<CommandRouter>, config: &BridgeConfig) -> Self {
        Self {
            ctx,
            commands,
            relay_url: format!("ws://127.0.0.1:{}/ws", config.relay_port),
            frame_size_limit: config.frame_size_limit,
            reconnect_base_ms: config.reconnect_base_ms,
            reconnect_max_ms: config.reconnect_max_ms,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt: u32 = 0;
        loop {
            match connect_async(self.relay_url.as_str()).await {
                Ok((socket, _)) => {
                    info!("[EXT_CLIENT] Connected to relay at {}", self.relay_url);
                    attempt = 0;
                    if self.session(socket, &mut shutdown).await {
                        break;
                    }
                    warn!("[EXT_CLIENT] Relay connection lost");
                }
                Err(e) => {
                    debug!("[EXT_CLIENT] Connect failed: {}", e);
                }
            }

            attempt += 1;
            let delay = backoff_ms(attempt, self.reconnect_base_ms, self.reconnect_max_ms);
            debug!("[EXT_CLIENT] Reconnecting in {}ms (attempt {})", delay, attempt);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = shutdown.recv() => break,
            }
        }
        info!("[EXT_CLIENT] Stopped");
    }

    /// One connected session. Returns true when shutdown was requested.
    async fn session(
        &self,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        let register = Frame::request(
            frame_type::REGISTER,
            &Uuid::new_v4().to_string(),
            json!({
                "role": "extension",
                "capabilities": EXTENSION_CAPABILITIES,
                "metadata": {"client": "chat-bridge", "version": env!("CARGO_PKG_VERSION")},
            }),
        );
        match register.encode(self.frame_size_limit) {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                warn!("[EXT_CLIENT] Could not encode register frame: {}", e);
                return false;
            }
        }

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match Frame::decode(&text, self.frame_size_limit) {
                                Ok(frame) => self.handle_frame(frame, &out_tx),
                                Err(e) => warn!("[EXT_CLIENT] Dropping inbound frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return false,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("[EXT_CLIENT] Socket error: {}", e);
                            return false;
                        }
                    }
                }
                outbound = out_rx.recv() => {
                    if let Some(frame) = outbound {
                        match frame.encode(self.frame_size_limit) {
                            Ok(text) => {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    return false;
                                }
                            }
                            Err(e) => warn!("[EXT_CLIENT] Dropping outbound frame: {}", e),
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return true;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame, out_tx: &mpsc::UnboundedSender<Frame>) {
        let frame_type = frame.frame_type.clone();
        match frame_type.as_str() {
            frame_type::PING => {
                let mut pong = Frame::new(frame_type::PONG);
                pong.id = frame.id.clone();
                let _ = out_tx.send(pong);
            }
            frame_type::PONG | frame_type::REGISTER => {}
            frame_type::CLIENT_LIST_UPDATE => {
                if let Some(clients) = frame.clients {
                    *self.ctx.relay_info.lock() = json!({
                        "connected": true,
                        "peers": clients,
                    });
                }
            }
            frame_type::CANCEL_OPERATION => {
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    let Some(operation_id) =
                        frame.params.as_ref().and_then(|p| p["operationId"].as_str())
                    else {
                        return;
                    };
                    if let Some(tab_id) = ctx.ops.get(operation_id).and_then(|op| op.tab_id) {
                        if let Err(e) = ctx.caps.cancel_activity(tab_id).await {
                            debug!("[EXT_CLIENT] Best-effort cancel failed: {}", e);
                        }
                    }
                });
            }
            frame_type::NETWORK_EVENT => {
                if let Some(params) = &frame.params {
                    if let Some(tab_id) = params["tabId"].as_i64() {
                        let event = params.get("event").cloned().unwrap_or_default();
                        self.ctx.tabs.capture(tab_id, event);
                    }
                }
            }
            frame_type::NAVIGATION_EVENT => {
                if let Some(tab_id) = frame.params.as_ref().and_then(|p| p["tabId"].as_i64()) {
                    self.ctx.tabs.on_navigation(tab_id);
                }
            }
            _ if frame.is_request() => {
                let ctx = Arc::clone(&self.ctx);
                let commands = Arc::clone(&self.commands);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let reply = commands.dispatch(ctx, &frame).await;
                    let _ = out_tx.send(reply);
                });
            }
            other => debug!("[EXT_CLIENT] Ignoring frame type '{}'", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Pull transport fallback
// ---------------------------------------------------------------------------

/// Extension peer over the pull transport: heartbeats register us, polls
/// drain routed frames, responses are posted back. The adaptive scheduler
/// decides how often to poll; a quiet browser polls slower.
pub struct PullExtensionClient {
    ctx: Arc<ExtensionContext>,
    commands: Arc<CommandRouter>,
    base_url: String,
    peer_id: String,
    http: reqwest::Client,
}

impl PullExtensionClient {
    pub fn new(ctx: Arc<ExtensionContext>, commands: Arc<CommandRouter>, config: &BridgeConfig) -> Self {
        Self {
            ctx,
            commands,
            base_url: format!("http://127.0.0.1:{}", config.relay_port),
            peer_id: format!("extension-pull-{}", Uuid::new_v4()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let heartbeat_every = self.ctx.scheduler.heartbeat_interval();
        let health_every = self.ctx.scheduler.health_interval();
        let mut needs_heartbeat = true;
        let mut last_heartbeat = tokio::time::Instant::now();
        let mut last_health = tokio::time::Instant::now();

        info!("[EXT_PULL] Pull-transport extension peer {} starting", self.peer_id);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.scheduler.command_interval()) => {}
                _ = shutdown.recv() => break,
            }

            if needs_heartbeat || last_heartbeat.elapsed() >= heartbeat_every {
                match self.heartbeat().await {
                    Ok(()) => {
                        needs_heartbeat = false;
                        last_heartbeat = tokio::time::Instant::now();
                    }
                    Err(e) => {
                        debug!("[EXT_PULL] Heartbeat failed: {}", e);
                        continue;
                    }
                }
            }

            match self.poll().await {
                Ok(frames) => {
                    if !frames.is_empty() {
                        self.ctx.scheduler.note_activity();
                    }
                    for frame in frames {
                        self.handle_pulled(frame).await;
                    }
                }
                Err(e) => {
                    debug!("[EXT_PULL] Poll failed: {}", e);
                    // the relay may have evicted us while we slept
                    needs_heartbeat = true;
                }
            }

            if last_health.elapsed() >= health_every {
                if let Ok(health) = self.fetch_health().await {
                    *self.ctx.relay_info.lock() = health;
                }
                last_health = tokio::time::Instant::now();
            }
        }
        info!("[EXT_PULL] Stopped");
    }

    async fn heartbeat(&self) -> Result<(), reqwest::Error> {
        self.http
            .post(format!("{}/heartbeat", self.base_url))
            .json(&json!({
                "peerId": self.peer_id,
                "role": "extension",
                "capabilities": EXTENSION_CAPABILITIES,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Frame>, reqwest::Error> {
        let body: serde_json::Value = self
            .http
            .get(format!("{}/poll-commands?peerId={}", self.base_url, self.peer_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let frames = body["commands"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| serde_json::from_value::<Frame>(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(frames)
    }

    async fn fetch_health(&self) -> Result<serde_json::Value, reqwest::Error> {
        self.http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn post_frame(&self, frame: &Frame) {
        let url = format!("{}/command-response?peerId={}", self.base_url, self.peer_id);
        let Ok(body) = serde_json::to_string(frame) else { return };
        if let Err(e) = self.http.post(url).body(body).send().await {
            debug!("[EXT_PULL] Posting frame failed: {}", e);
        }
    }

    async fn handle_pulled(&self, frame: Frame) {
        let frame_type_name = frame.frame_type.clone();
        match frame_type_name.as_str() {
            frame_type::PING => {
                let mut pong = Frame::new(frame_type::PONG);
                pong.id = frame.id.clone();
                self.post_frame(&pong).await;
            }
            frame_type::PONG => {}
            frame_type::CLIENT_LIST_UPDATE => {
                if let Some(clients) = frame.clients {
                    *self.ctx.relay_info.lock() = json!({"connected": true, "peers": clients});
                }
            }
            frame_type::CANCEL_OPERATION => {
                let Some(operation_id) =
                    frame.params.as_ref().and_then(|p| p["operationId"].as_str())
                else {
                    return;
                };
                if let Some(tab_id) = self.ctx.ops.get(operation_id).and_then(|op| op.tab_id) {
                    let _ = self.ctx.caps.cancel_activity(tab_id).await;
                }
            }
            frame_type::NETWORK_EVENT => {
                if let Some(params) = &frame.params {
                    if let Some(tab_id) = params["tabId"].as_i64() {
                        let event = params.get("event").cloned().unwrap_or_default();
                        self.ctx.tabs.capture(tab_id, event);
                    }
                }
            }
            frame_type::NAVIGATION_EVENT => {
                if let Some(tab_id) = frame.params.as_ref().and_then(|p| p["tabId"].as_i64()) {
                    self.ctx.tabs.on_navigation(tab_id);
                }
            }
            _ if frame.is_request() => {
                let reply = self.commands.dispatch(Arc::clone(&self.ctx), &frame).await;
                self.post_frame(&reply).await;
            }
            other => debug!("[EXT_PULL] Ignoring frame type '{}'", other),
        }
    }
}
