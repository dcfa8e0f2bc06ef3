//! Health report assembly
//!
//! The relay answers the `health` control verb with its own view; the
//! extension-side `system.health` tool wraps that view together with tab
//! coordinator state into the full aggregate.

use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::extension::tabs::TabCoordinator;
use crate::ops::manager::OperationManager;
use crate::relay::registry::PeerRegistry;
use crate::relay::transport::TransportCounters;
use crate::util::unix_ms;

/// Relay-side health: connectivity, peers, operation counts, transport
/// counters, log buffer size, uptime.
pub fn relay_report(
    registry: &PeerRegistry,
    ops: &OperationManager,
    counters: &TransportCounters,
    queue_length: usize,
    log_buffer_size: usize,
    started_at_ms: u64,
) -> Value {
    json!({
        "connected": true,
        "uptimeSeconds": unix_ms().saturating_sub(started_at_ms) / 1000,
        "peers": registry.snapshot(),
        "extensionConnected": registry.extension_id().is_some(),
        "operations": ops.counts_by_state(),
        "transport": {
            "messagesSent": counters.frames_sent.load(Ordering::Relaxed),
            "messagesReceived": counters.frames_received.load(Ordering::Relaxed),
            "reconnects": counters.reconnects.load(Ordering::Relaxed),
            "queueLength": queue_length,
        },
        "logBufferSize": log_buffer_size,
    })
}

/// Full aggregate for the `system.health` tool.
pub fn full_report(relay: Value, tabs: &TabCoordinator) -> Value {
    let views = tabs.snapshot();
    let observer_tabs: Vec<i64> =
        views.iter().filter(|v| v.observer_injected).map(|v| v.tab_id).collect();
    let monitor_tabs: Vec<i64> =
        views.iter().filter(|v| v.monitoring).map(|v| v.tab_id).collect();
    let debugger_sessions: Vec<Value> = views
        .iter()
        .filter(|v| v.debugger_attached)
        .map(|v| json!({"tabId": v.tab_id, "owner": v.debugger_owner}))
        .collect();

    json!({
        "relay": relay,
        "tabs": views,
        "observerTabs": observer_tabs,
        "debuggerSessions": debugger_sessions,
        "networkMonitorTabs": monitor_tabs,
    })
}
