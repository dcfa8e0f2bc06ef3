//! Adaptive poll scheduler
//!
//! Governs cadence for peers on the pull transport. Strictly advisory:
//! nothing breaks if a poll is late, the bridge just feels slower. While
//! the user is active the command poll runs at its floor; after the idle
//! threshold it stretches linearly toward the ceiling over one more
//! threshold-length of idleness.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::BridgeConfig;

pub struct AdaptiveScheduler {
    command_floor: Duration,
    command_ceiling: Duration,
    idle_threshold: Duration,
    health_interval: Duration,
    heartbeat_interval: Duration,
    last_activity: Mutex<Instant>,
}

impl AdaptiveScheduler {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            command_floor: Duration::from_millis(config.command_interval_ms),
            command_ceiling: Duration::from_millis(
                config.max_command_interval_ms.max(config.command_interval_ms),
            ),
            idle_threshold: Duration::from_millis(config.idle_threshold_ms),
            health_interval: Duration::from_millis(config.health_interval_ms),
            heartbeat_interval: Duration::from_millis(config.heartbeat_ms),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Any observed activity (non-empty poll, user action) snaps the
    /// command interval back to its floor.
    pub fn note_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn command_interval(&self) -> Duration {
        let idle = self.last_activity.lock().elapsed();
        self.command_interval_for(idle)
    }

    /// Pure cadence curve: floor until the idle threshold, then linear
    /// growth reaching the ceiling after a second threshold-length.
    pub fn command_interval_for(&self, idle: Duration) -> Duration {
        if idle <= self.idle_threshold {
            return self.command_floor;
        }
        let ramp = self.idle_threshold.max(Duration::from_millis(1));
        let over = idle - self.idle_threshold;
        let ratio = (over.as_millis() as f64 / ramp.as_millis() as f64).min(1.0);
        let span = self.command_ceiling.saturating_sub(self.command_floor);
        self.command_floor + span.mul_f64(ratio)
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}
