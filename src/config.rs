//! Bridge configuration
//!
//! Layered the usual way: compiled defaults, then an optional TOML file,
//! then `BRIDGE_*` environment variables. The relay binds loopback only;
//! there is no authentication layer, so the port must never be exposed.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Runtime configuration for the relay and the extension-side stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Loopback port the relay listens on (WebSocket + pull REST).
    pub relay_port: u16,

    /// Keep-alive cadence. Push peers are pinged at this interval; a pull
    /// peer that posts no heartbeat for three intervals is evicted.
    pub heartbeat_ms: u64,

    /// Idle time after which the adaptive scheduler starts stretching the
    /// pull-transport command poll interval.
    pub idle_threshold_ms: u64,

    /// Lower bound for the pull-transport command poll interval.
    pub command_interval_ms: u64,

    /// Upper bound the command poll interval grows toward while idle.
    pub max_command_interval_ms: u64,

    /// Cadence for pull-transport health probes.
    pub health_interval_ms: u64,

    /// Maximum serialized frame size accepted on any transport.
    pub frame_size_limit: usize,

    /// Path of the operation store snapshot file.
    pub operation_store_path: PathBuf,

    /// Forward selected log records to MCP peers as `log_notification`
    /// frames from startup (can also be toggled at runtime).
    pub debug_mode: bool,

    /// Default tracing filter (overridable per-run with BRIDGE_LOG/RUST_LOG).
    pub log_level: String,

    /// Default wait before a tab lock acquisition fails with LockTimeout.
    pub lock_timeout_ms: u64,

    /// How long operations owned via a disconnected peer stay alive before
    /// being failed with PeerDisconnected.
    pub grace_window_ms: u64,

    /// How many recently-terminated operations the store keeps alongside
    /// the non-terminal set.
    pub recent_terminal_cap: usize,

    /// Keep recovered non-terminal operations alive on startup instead of
    /// failing them with ProcessRestarted.
    pub rehydrate_on_start: bool,

    /// Deadline sweeper tick.
    pub sweep_interval_ms: u64,

    /// Reconnect backoff bounds for outbound peers (exponential + jitter).
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// Run an in-process simulated extension peer against the mock browser.
    /// Useful for local development and the integration tests; a real
    /// browser extension replaces this in production.
    pub simulate_extension: bool,

    /// Make the extension peer use the pull (REST polling) transport
    /// instead of holding a WebSocket open. The adaptive scheduler
    /// governs the polling cadence.
    pub use_pull_transport: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            relay_port: 54321,
            heartbeat_ms: 15_000,
            idle_threshold_ms: 30_000,
            command_interval_ms: 500,
            max_command_interval_ms: 2_000,
            health_interval_ms: 10_000,
            frame_size_limit: 1024 * 1024,
            operation_store_path: default_store_path(),
            debug_mode: false,
            log_level: "info".to_string(),
            lock_timeout_ms: 30_000,
            grace_window_ms: 10_000,
            recent_terminal_cap: 50,
            rehydrate_on_start: false,
            sweep_interval_ms: 1_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 5_000,
            simulate_extension: false,
            use_pull_transport: false,
        }
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chat-bridge")
        .join("operations.json")
}

impl BridgeConfig {
    /// Load from an optional TOML file, then apply `BRIDGE_*` overrides.
    pub fn load(file: Option<&Path>) -> Self {
        let mut config = match file {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => match toml::from_str::<BridgeConfig>(&text) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        warn!("[CONFIG] Failed to parse {}: {} (using defaults)", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("[CONFIG] Failed to read {}: {} (using defaults)", path.display(), e);
                    Self::default()
                }
            },
            None => Self::default(),
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(val) = env::var("BRIDGE_PORT") {
            if let Ok(num) = val.parse::<u16>() {
                self.relay_port = num;
            }
        }

        if let Ok(val) = env::var("BRIDGE_HEARTBEAT_MS") {
            if let Ok(num) = val.parse::<u64>() {
                self.heartbeat_ms = num;
            }
        }

        if let Ok(val) = env::var("BRIDGE_IDLE_THRESHOLD_MS") {
            if let Ok(num) = val.parse::<u64>() {
                self.idle_threshold_ms = num;
            }
        }

        if let Ok(val) = env::var("BRIDGE_FRAME_SIZE_LIMIT") {
            if let Ok(num) = val.parse::<usize>() {
                self.frame_size_limit = num;
            }
        }

        if let Ok(val) = env::var("BRIDGE_STORE_PATH") {
            if !val.trim().is_empty() {
                self.operation_store_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("BRIDGE_DEBUG_MODE") {
            self.debug_mode = val.trim().eq_ignore_ascii_case("true") || val.trim() == "1";
        }

        if let Ok(val) = env::var("BRIDGE_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.log_level = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("BRIDGE_LOCK_TIMEOUT_MS") {
            if let Ok(num) = val.parse::<u64>() {
                self.lock_timeout_ms = num;
            }
        }

        if let Ok(val) = env::var("BRIDGE_GRACE_WINDOW_MS") {
            if let Ok(num) = val.parse::<u64>() {
                self.grace_window_ms = num;
            }
        }

        if let Ok(val) = env::var("BRIDGE_REHYDRATE") {
            self.rehydrate_on_start = val.trim().eq_ignore_ascii_case("true") || val.trim() == "1";
        }

        if let Ok(val) = env::var("BRIDGE_SIMULATE_EXTENSION") {
            self.simulate_extension = val.trim().eq_ignore_ascii_case("true") || val.trim() == "1";
        }

        if let Ok(val) = env::var("BRIDGE_PULL_TRANSPORT") {
            self.use_pull_transport = val.trim().eq_ignore_ascii_case("true") || val.trim() == "1";
        }
    }

    /// How long a pull peer may stay silent before eviction.
    pub fn pull_liveness_ms(&self) -> u64 {
        self.heartbeat_ms.saturating_mul(3)
    }
}
