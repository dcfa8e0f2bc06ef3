//! In-process log ring buffer
//!
//! A `tracing` layer mirrors every event into a bounded buffer so that
//! `get_logs` can serve recent history and debug mode can forward records
//! to an MCP peer as `log_notification` frames. The buffer is independent
//! of whatever console subscriber the binary installs.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::relay::frame::{frame_type, Frame};
use crate::util::unix_ms;

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Minimum level captured into the buffer, adjustable at runtime via
/// `set_log_level`. 0=error .. 4=trace.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(4);

pub fn level_rank(level: &str) -> Option<u8> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Some(0),
        "warn" => Some(1),
        "info" => Some(2),
        "debug" => Some(3),
        "trace" => Some(4),
        _ => None,
    }
}

pub fn set_min_level(level: &str) -> Result<(), String> {
    match level_rank(level) {
        Some(rank) => {
            MIN_LEVEL.store(rank, Ordering::Relaxed);
            Ok(())
        }
        None => Err(format!("unknown log level '{level}'")),
    }
}

pub fn min_level() -> u8 {
    MIN_LEVEL.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: u64,
    pub level: String,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub struct LogRingBuffer {
    entries: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    tx: broadcast::Sender<LogRecord>,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        })
    }

    pub fn push(&self, record: LogRecord) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record.clone());
        drop(entries);
        let _ = self.tx.send(record);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }

    /// Filtered slice for `get_logs`: minimum severity, component substring,
    /// records at or after `since`, newest-last, capped at `limit`.
    pub fn filtered(
        &self,
        level: Option<&str>,
        component: Option<&str>,
        since: Option<u64>,
        limit: usize,
    ) -> Vec<LogRecord> {
        let max_rank = level.and_then(level_rank).unwrap_or(4);
        let entries = self.entries.lock();
        let mut selected: Vec<LogRecord> = entries
            .iter()
            .filter(|r| level_rank(&r.level).map(|rank| rank <= max_rank).unwrap_or(true))
            .filter(|r| component.map(|c| r.component.contains(c)).unwrap_or(true))
            .filter(|r| since.map(|s| r.timestamp >= s).unwrap_or(true))
            .cloned()
            .collect();
        if selected.len() > limit {
            selected.drain(..selected.len() - limit);
        }
        selected
    }
}

/// Tracing layer feeding the ring buffer.
pub struct BufferLayer {
    buffer: Arc<LogRingBuffer>,
}

impl BufferLayer {
    pub fn new(buffer: Arc<LogRingBuffer>) -> Self {
        Self { buffer }
    }
}

struct MessageVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = event.metadata().level();
        let rank = match *level {
            tracing::Level::ERROR => 0,
            tracing::Level::WARN => 1,
            tracing::Level::INFO => 2,
            tracing::Level::DEBUG => 3,
            tracing::Level::TRACE => 4,
        };
        if rank > min_level() {
            return;
        }

        let mut visitor = MessageVisitor { message: String::new(), fields: Map::new() };
        event.record(&mut visitor);

        self.buffer.push(LogRecord {
            timestamp: unix_ms(),
            level: level.as_str().to_ascii_lowercase(),
            component: event.metadata().target().to_string(),
            message: visitor.message,
            data: if visitor.fields.is_empty() { None } else { Some(Value::Object(visitor.fields)) },
        });
    }
}

/// Runtime settings for debug-mode log forwarding.
#[derive(Debug, Clone, Default)]
pub struct DebugForwardSettings {
    pub enabled: bool,
    /// Only forward records whose component matches one of these.
    pub components: Option<HashSet<String>>,
    pub error_only: bool,
    /// Peer the batched `log_notification` frames are addressed to.
    pub target_peer: Option<String>,
    pub batch_ms: u64,
}

impl DebugForwardSettings {
    fn matches(&self, record: &LogRecord) -> bool {
        if self.error_only && record.level != "error" {
            return false;
        }
        if let Some(components) = &self.components {
            if !components.iter().any(|c| record.component.contains(c.as_str())) {
                return false;
            }
        }
        true
    }
}

/// Batches matching log records into `log_notification` frames.
pub async fn run_debug_forwarder(
    buffer: Arc<LogRingBuffer>,
    settings: Arc<Mutex<DebugForwardSettings>>,
    out: mpsc::UnboundedSender<Frame>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut rx = buffer.subscribe();
    let mut pending: Vec<LogRecord> = Vec::new();
    let batch_ms = { settings.lock().batch_ms.max(100) };
    let mut ticker = tokio::time::interval(Duration::from_millis(batch_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Ok(record) => {
                        let snapshot = settings.lock().clone();
                        if snapshot.enabled && snapshot.matches(&record) {
                            pending.push(record);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(dropped)) => {
                        tracing::debug!("[DEBUG_MODE] Forwarder lagged, {} record(s) dropped", dropped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let target = { settings.lock().target_peer.clone() };
                let Some(target) = target else {
                    pending.clear();
                    continue;
                };
                let batch: Vec<LogRecord> = pending.drain(..).collect();
                let mut frame = Frame::notification(
                    frame_type::LOG_NOTIFICATION,
                    serde_json::json!({ "records": batch }),
                );
                frame.to = Some(target);
                if out.send(frame).is_err() {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
