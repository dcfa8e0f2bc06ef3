//! Frame router
//!
//! Every inbound frame is stamped with its origin and dispatched:
//! explicit `_to` unicasts, `_broadcast` fans out to everyone else,
//! relay-local control verbs are answered in place, and anything left
//! defaults to the extension peer. The router holds no request/response
//! state; correlation belongs to whichever peer issued the request.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, warn};

use crate::diagnostics::health;
use crate::diagnostics::logbuf::LogRingBuffer;
use crate::error::BridgeError;
use crate::extension::observer::{self, ObserverEvent};
use crate::ops::manager::OperationManager;
use crate::relay::frame::{frame_type, Frame};
use crate::relay::registry::PeerRegistry;
use crate::relay::transport::{PeerTransport, TransportCounters};

pub struct Router {
    pub registry: Arc<PeerRegistry>,
    pub transports: Arc<DashMap<String, Arc<PeerTransport>>>,
    pub counters: Arc<TransportCounters>,
    pub ops: Arc<OperationManager>,
    pub logbuf: Arc<LogRingBuffer>,
    pub started_at_ms: u64,
}

impl Router {
    pub fn new(
        registry: Arc<PeerRegistry>,
        transports: Arc<DashMap<String, Arc<PeerTransport>>>,
        counters: Arc<TransportCounters>,
        ops: Arc<OperationManager>,
        logbuf: Arc<LogRingBuffer>,
        started_at_ms: u64,
    ) -> Self {
        Self { registry, transports, counters, ops, logbuf, started_at_ms }
    }

    /// Deliver a frame to one peer.
    pub fn send_to(&self, peer_id: &str, frame: Frame) -> Result<(), BridgeError> {
        match self.transports.get(peer_id) {
            Some(transport) => transport.send(frame),
            None => Err(BridgeError::UnknownTarget(peer_id.to_string())),
        }
    }

    /// Fan a frame out to every peer except `origin`.
    pub fn broadcast_except(&self, origin: Option<&str>, frame: &Frame) {
        for entry in self.transports.iter() {
            if Some(entry.key().as_str()) == origin {
                continue;
            }
            if let Err(e) = entry.value().send(frame.clone()) {
                warn!("[ROUTER] Broadcast to {} failed: {}", entry.key(), e);
            }
        }
    }

    /// Publish the authoritative peer snapshot to everyone. Emitted on
    /// every registry mutation.
    pub fn publish_client_list(&self) {
        let snapshot = self.registry.snapshot();
        let mut frame = Frame::new(frame_type::CLIENT_LIST_UPDATE);
        frame.broadcast = Some(true);
        frame.clients = serde_json::to_value(&snapshot).ok();
        debug!("[ROUTER] Publishing client list ({} peer(s))", snapshot.len());
        self.broadcast_except(None, &frame);
    }

    /// Route one inbound frame from a registered peer.
    pub fn route(&self, origin: &str, mut frame: Frame) {
        self.counters.note_received();
        self.registry.touch(origin);
        if let Some(transport) = self.transports.get(origin) {
            transport.touch();
        }

        // origin stamp is router-owned; whatever the peer wrote is replaced
        frame.from = Some(origin.to_string());

        match frame.frame_type.as_str() {
            frame_type::PONG => return,
            frame_type::PING => {
                let mut pong = Frame::new(frame_type::PONG);
                pong.id = frame.id.clone();
                pong.to = Some(origin.to_string());
                let _ = self.send_to(origin, pong);
                return;
            }
            _ => {}
        }

        if let Some(target) = frame.to.clone() {
            match self.send_to(&target, frame.clone()) {
                Ok(()) => {}
                Err(BridgeError::UnknownTarget(_)) => {
                    self.reply_error(origin, &frame, BridgeError::UnknownTarget(target));
                }
                Err(e) => self.reply_error(origin, &frame, e),
            }
            return;
        }

        if frame.broadcast == Some(true) {
            self.broadcast_except(Some(origin), &frame);
            return;
        }

        if self.handle_local(origin, &frame) {
            return;
        }

        // implicit default target: the extension peer
        match self.registry.extension_id() {
            Some(extension) => {
                if let Err(e) = self.send_to(&extension, frame.clone()) {
                    self.reply_error(origin, &frame, e);
                }
            }
            None => self.reply_error(origin, &frame, BridgeError::ExtensionUnavailable),
        }
    }

    /// Relay-local control verbs. Returns true when the frame was consumed.
    fn handle_local(&self, origin: &str, frame: &Frame) -> bool {
        match frame.frame_type.as_str() {
            frame_type::HEALTH => {
                let queue_length: usize =
                    self.transports.iter().map(|t| t.value().queue_len()).sum();
                let report = health::relay_report(
                    &self.registry,
                    &self.ops,
                    &self.counters,
                    queue_length,
                    self.logbuf.len(),
                    self.started_at_ms,
                );
                self.reply(origin, Frame::response_to(frame, report));
                true
            }
            frame_type::PEER_LIST => {
                let result = json!({"clients": self.registry.snapshot()});
                self.reply(origin, Frame::response_to(frame, result));
                true
            }
            frame_type::CANCEL_OPERATION => {
                // a peer asked for cancellation; the manager marks the
                // operation terminal and the cancel pump nudges the
                // extension best-effort
                let result = frame
                    .param_str("operationId")
                    .and_then(|id| self.ops.cancel(&id));
                match result {
                    Ok(op) => {
                        if frame.id.is_some() {
                            let body = json!({
                                "success": true,
                                "operationId": op.operation_id,
                                "state": op.state,
                            });
                            self.reply(origin, Frame::response_to(frame, body));
                        }
                    }
                    Err(e) => self.reply_error(origin, frame, e),
                }
                true
            }
            frame_type::REGISTER_OPERATION
            | frame_type::OPERATION_MILESTONE
            | frame_type::OPERATION_COMPLETED => {
                match ObserverEvent::from_frame(frame)
                    .and_then(|event| observer::ingest(&self.ops, event, origin))
                {
                    Ok(op) => {
                        if frame.id.is_some() {
                            let result = json!({
                                "success": true,
                                "operationId": op.operation_id,
                                "state": op.state,
                            });
                            self.reply(origin, Frame::response_to(frame, result));
                        }
                    }
                    Err(e) => self.reply_error(origin, frame, e),
                }
                true
            }
            _ => false,
        }
    }

    fn reply(&self, origin: &str, frame: Frame) {
        if let Err(e) = self.send_to(origin, frame) {
            warn!("[ROUTER] Reply to {} failed: {}", origin, e);
        }
    }

    /// Every routed error is logged with origin, target and reason before
    /// being surfaced to the origin.
    fn reply_error(&self, origin: &str, request: &Frame, error: BridgeError) {
        warn!(
            "[ROUTER] Error routing '{}' from {} (target {:?}): {}",
            request.frame_type, origin, request.to, error
        );
        let mut reply = Frame::error_to(request, &error);
        reply.to = Some(origin.to_string());
        if let Err(e) = self.send_to(origin, reply) {
            warn!("[ROUTER] Error reply to {} undeliverable: {}", origin, e);
        }
    }
}
