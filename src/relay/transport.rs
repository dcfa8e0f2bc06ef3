//! Per-peer transport handles
//!
//! The registry owns peer records; this module owns the send side only.
//! Push peers get an mpsc handle pumped into their websocket by the server
//! task. Pull peers get a bounded queue drained by `/poll-commands`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::BridgeError;
use crate::relay::frame::Frame;
use crate::util::unix_ms;

/// Outbound capacity per push peer before sends start failing.
pub const PUSH_QUEUE_CAPACITY: usize = 1024;

/// Outbound capacity per pull peer before the oldest frame is dropped.
pub const PULL_QUEUE_CAPACITY: usize = 256;

/// Consecutive missed pongs before a push peer is declared dead.
pub const MAX_MISSED_PONGS: u32 = 3;

/// Relay-wide transport counters, surfaced by `health`.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub reconnects: AtomicU64,
}

impl TransportCounters {
    pub fn note_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }
}

enum PeerChannel {
    Push(mpsc::Sender<Frame>),
    Pull(Mutex<VecDeque<Frame>>),
}

/// Send handle for one connected peer.
pub struct PeerTransport {
    pub peer_id: String,
    channel: PeerChannel,
    counters: Arc<TransportCounters>,
    missed_pongs: AtomicU32,
    last_seen_ms: AtomicU64,
}

impl PeerTransport {
    pub fn push(peer_id: String, tx: mpsc::Sender<Frame>, counters: Arc<TransportCounters>) -> Self {
        Self {
            peer_id,
            channel: PeerChannel::Push(tx),
            counters,
            missed_pongs: AtomicU32::new(0),
            last_seen_ms: AtomicU64::new(unix_ms()),
        }
    }

    pub fn pull(peer_id: String, counters: Arc<TransportCounters>) -> Self {
        Self {
            peer_id,
            channel: PeerChannel::Pull(Mutex::new(VecDeque::new())),
            counters,
            missed_pongs: AtomicU32::new(0),
            last_seen_ms: AtomicU64::new(unix_ms()),
        }
    }

    pub fn is_pull(&self) -> bool {
        matches!(self.channel, PeerChannel::Pull(_))
    }

    /// Non-blocking enqueue toward the peer. Fails with `PeerUnreachable`
    /// when the push channel is closed or its queue is saturated; pull
    /// queues shed their oldest frame instead.
    pub fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        match &self.channel {
            PeerChannel::Push(tx) => match tx.try_send(frame) {
                Ok(()) => {
                    self.counters.note_sent();
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(BridgeError::PeerUnreachable(
                    format!("channel closed for peer {}", self.peer_id),
                )),
                Err(mpsc::error::TrySendError::Full(_)) => Err(BridgeError::PeerUnreachable(
                    format!("send queue saturated for peer {}", self.peer_id),
                )),
            },
            PeerChannel::Pull(queue) => {
                let mut queue = queue.lock();
                if queue.len() >= PULL_QUEUE_CAPACITY {
                    queue.pop_front();
                    warn!(
                        "[TRANSPORT] Pull queue full for peer {}, dropping oldest frame",
                        self.peer_id
                    );
                }
                queue.push_back(frame);
                self.counters.note_sent();
                Ok(())
            }
        }
    }

    /// Drain all queued frames (pull transport poll).
    pub fn drain(&self) -> Vec<Frame> {
        match &self.channel {
            PeerChannel::Pull(queue) => queue.lock().drain(..).collect(),
            PeerChannel::Push(_) => Vec::new(),
        }
    }

    pub fn queue_len(&self) -> usize {
        match &self.channel {
            PeerChannel::Pull(queue) => queue.lock().len(),
            PeerChannel::Push(tx) => PUSH_QUEUE_CAPACITY.saturating_sub(tx.capacity()),
        }
    }

    /// Record any sign of life from the peer.
    pub fn touch(&self) {
        self.last_seen_ms.store(unix_ms(), Ordering::Relaxed);
        self.missed_pongs.store(0, Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    /// Record a ping sent without an intervening pong. Returns true once
    /// the peer has missed enough pongs to be declared dead.
    pub fn note_ping_sent(&self) -> bool {
        let missed = self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1;
        missed >= MAX_MISSED_PONGS
    }
}
