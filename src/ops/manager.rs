//! Operation manager
//!
//! Event-driven tracker of long-running browser operations. All state
//! changes flow through here: milestone ingestion, completion, timeouts,
//! cancellation, disconnect grace handling and persistence. Progress
//! updates fan out on a broadcast channel; the relay turns them into
//! `progress` frames for the owning peer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::ops::operation::{milestone, Milestone, Operation, OperationKind, OperationState};
use crate::ops::store::OperationStore;
use crate::relay::frame::{frame_type, Frame};
use crate::util::unix_ms;

/// One state-change notification, mirrored onto the wire as a `progress`
/// frame addressed to the operation's owning peer.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub operation_id: String,
    pub state: OperationState,
    pub owning_peer_id: String,
    pub milestones: Vec<Milestone>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ProgressUpdate {
    pub fn to_frame(&self) -> Frame {
        let mut params = json!({
            "operationId": self.operation_id,
            "state": self.state,
            "milestones": self.milestones,
        });
        if let Some(result) = &self.result {
            params["result"] = result.clone();
        }
        if let Some(error) = &self.error {
            params["error"] = json!(error);
        }
        Frame::notification(frame_type::PROGRESS, params)
    }
}

#[derive(Default)]
struct ManagerState {
    operations: HashMap<String, Operation>,
    /// Terminal ids retained in the store, oldest first.
    recent_terminals: VecDeque<String>,
    /// Ids scheduled for PeerDisconnected failure that a re-registering
    /// extension can still rescue by emitting a milestone.
    rebindable: HashSet<String>,
}

pub struct OperationManager {
    state: Mutex<ManagerState>,
    store: OperationStore,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    cancel_tx: broadcast::Sender<String>,
    grace_window_ms: u64,
    recent_terminal_cap: usize,
    sweep_interval_ms: u64,
}

impl OperationManager {
    /// Load the store and apply the restart-recovery policy: unless
    /// rehydration was requested, every recovered non-terminal operation is
    /// failed with ProcessRestarted.
    pub fn new(store: OperationStore, config: &BridgeConfig) -> Arc<Self> {
        let (progress_tx, _) = broadcast::channel(256);
        let (cancel_tx, _) = broadcast::channel(64);

        let doc = store.load();
        let mut state = ManagerState::default();
        let mut recovered_failed = 0usize;

        for (id, mut op) in doc.operations {
            if !op.is_terminal() && !config.rehydrate_on_start {
                op.state = OperationState::Failed;
                op.error = Some(
                    BridgeError::ProcessRestarted(id.clone()).to_string(),
                );
                op.updated_at = unix_ms();
                recovered_failed += 1;
            }
            if op.is_terminal() {
                state.recent_terminals.push_back(id.clone());
            }
            state.operations.insert(id, op);
        }

        if recovered_failed > 0 {
            info!(
                "[OPS] Recovered {} in-flight operation(s) as failed (process restarted)",
                recovered_failed
            );
        }

        let manager = Arc::new(Self {
            state: Mutex::new(state),
            store,
            progress_tx,
            cancel_tx,
            grace_window_ms: config.grace_window_ms,
            recent_terminal_cap: config.recent_terminal_cap,
            sweep_interval_ms: config.sweep_interval_ms.max(100),
        });
        manager.persist();
        manager
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    /// Best-effort cancel requests destined for the extension peer.
    pub fn subscribe_cancel_requests(&self) -> broadcast::Receiver<String> {
        self.cancel_tx.subscribe()
    }

    /// Create an operation. A client-supplied id is canonical; if it is
    /// already registered this is a no-op returning the existing record.
    pub fn begin(
        &self,
        kind: OperationKind,
        params: Value,
        owning_peer_id: &str,
        tab_id: Option<i64>,
        deadline_ms: Option<u64>,
        requested_id: Option<String>,
    ) -> Operation {
        let mut state = self.state.lock();

        if let Some(id) = &requested_id {
            if let Some(existing) = state.operations.get(id) {
                debug!("[OPS] begin({id}) found existing operation, reusing");
                return existing.clone();
            }
        }

        let id = requested_id.unwrap_or_else(|| format!("op_{}", Uuid::new_v4()));
        let op = Operation::new(
            id.clone(),
            kind,
            params,
            owning_peer_id.to_string(),
            tab_id,
            deadline_ms,
        );
        state.operations.insert(id.clone(), op.clone());
        drop(state);

        info!("[OPS] Operation {} registered ({:?}, tab {:?})", id, kind, tab_id);
        self.emit(&op);
        self.persist();
        op
    }

    pub fn get(&self, operation_id: &str) -> Option<Operation> {
        self.state.lock().operations.get(operation_id).cloned()
    }

    /// Mark execution started. Idempotent for operations already past
    /// `Registered`.
    pub fn set_in_flight(&self, operation_id: &str) -> Result<Operation, BridgeError> {
        let op = {
            let mut state = self.state.lock();
            let op = state
                .operations
                .get_mut(operation_id)
                .ok_or_else(|| BridgeError::OperationNotFound(operation_id.to_string()))?;
            if op.is_terminal() {
                return Err(BridgeError::OperationAlreadyTerminal(operation_id.to_string()));
            }
            if op.state == OperationState::Registered {
                op.state = OperationState::InFlight;
                op.updated_at = unix_ms();
            }
            op.clone()
        };
        self.emit(&op);
        self.persist();
        Ok(op)
    }

    /// Append a milestone. Milestones against a terminal operation are
    /// dropped with a warning (never an error); `response_completed`
    /// transitions to Completed with the milestone data as result. A
    /// milestone also rebinds an operation parked in the disconnect grace
    /// window.
    pub fn record_milestone(
        &self,
        operation_id: &str,
        name: &str,
        data: Option<Value>,
    ) -> Result<Operation, BridgeError> {
        let (op, changed) = {
            let mut state = self.state.lock();
            if state.rebindable.remove(operation_id) {
                info!("[OPS] Operation {} rebound by milestone '{}'", operation_id, name);
            }
            let op = state
                .operations
                .get_mut(operation_id)
                .ok_or_else(|| BridgeError::OperationNotFound(operation_id.to_string()))?;

            if op.is_terminal() {
                warn!(
                    "[OPS] Dropping milestone '{}' for terminal operation {}",
                    name, operation_id
                );
                (op.clone(), false)
            } else {
                op.push_milestone(name, data.clone());
                if name == milestone::RESPONSE_COMPLETED {
                    op.state = OperationState::Completed;
                    op.result = Some(data.unwrap_or(Value::Null));
                } else {
                    op.state = OperationState::AwaitingMilestone;
                }
                let op = op.clone();
                if op.is_terminal() {
                    Self::note_terminal(&mut state, &op.operation_id, self.recent_terminal_cap);
                }
                (op, true)
            }
        };

        if changed {
            self.emit(&op);
            self.persist();
        }
        Ok(op)
    }

    pub fn complete(&self, operation_id: &str, result: Value) -> Result<Operation, BridgeError> {
        self.finish(operation_id, OperationState::Completed, Some(result), None)
    }

    pub fn fail(&self, operation_id: &str, error: &BridgeError) -> Result<Operation, BridgeError> {
        self.finish(operation_id, OperationState::Failed, None, Some(error.to_string()))
    }

    /// Cancel marks terminal immediately and emits a best-effort cancel
    /// request toward the extension. Side effects already performed in the
    /// browser are not undone.
    pub fn cancel(&self, operation_id: &str) -> Result<Operation, BridgeError> {
        let op = self.finish(operation_id, OperationState::Cancelled, None, None)?;
        let _ = self.cancel_tx.send(operation_id.to_string());
        Ok(op)
    }

    /// Shared terminal transition. Idempotent: an already-terminal
    /// operation is returned unchanged.
    fn finish(
        &self,
        operation_id: &str,
        terminal: OperationState,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Operation, BridgeError> {
        debug_assert!(terminal.is_terminal());
        let (op, changed) = {
            let mut state = self.state.lock();
            let op = state
                .operations
                .get_mut(operation_id)
                .ok_or_else(|| BridgeError::OperationNotFound(operation_id.to_string()))?;
            if op.is_terminal() {
                (op.clone(), false)
            } else {
                op.state = terminal;
                op.result = result;
                op.error = error;
                op.updated_at = unix_ms();
                let op = op.clone();
                Self::note_terminal(&mut state, operation_id, self.recent_terminal_cap);
                (op, true)
            }
        };

        if changed {
            info!("[OPS] Operation {} -> {:?}", operation_id, op.state);
            self.emit(&op);
            self.persist();
        }
        Ok(op)
    }

    fn note_terminal(state: &mut ManagerState, operation_id: &str, cap: usize) {
        state.rebindable.remove(operation_id);
        state.recent_terminals.push_back(operation_id.to_string());
        while state.recent_terminals.len() > cap {
            if let Some(evicted) = state.recent_terminals.pop_front() {
                state.operations.remove(&evicted);
            }
        }
    }

    /// Block until the operation reaches a terminal state or the wait
    /// deadline passes. A wait timeout never affects the operation itself.
    pub async fn wait(
        &self,
        operation_id: &str,
        timeout_ms: u64,
    ) -> Result<Operation, BridgeError> {
        // Subscribe before the state check so a transition between check
        // and recv cannot be missed.
        let mut rx = self.progress_tx.subscribe();

        let op = self
            .get(operation_id)
            .ok_or_else(|| BridgeError::OperationNotFound(operation_id.to_string()))?;
        if op.is_terminal() {
            return Ok(op);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Timeout(operation_id.to_string()));
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(update)) => {
                    if update.operation_id == operation_id && update.state.is_terminal() {
                        return self
                            .get(operation_id)
                            .ok_or_else(|| BridgeError::OperationNotFound(operation_id.to_string()));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // Missed updates; re-check directly.
                    if let Some(op) = self.get(operation_id) {
                        if op.is_terminal() {
                            return Ok(op);
                        }
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BridgeError::Timeout(operation_id.to_string()));
                }
                Err(_) => return Err(BridgeError::Timeout(operation_id.to_string())),
            }
        }
    }

    /// Peer disconnect handling. Operations tied to the peer get a grace
    /// window before failing with PeerDisconnected. For the extension peer
    /// every non-terminal operation is affected, and a milestone from a
    /// re-registered extension rebinds it; for a client only its own
    /// operations are affected and nothing can rebind them.
    pub fn on_peer_disconnect(self: &Arc<Self>, peer_id: &str, is_extension: bool) {
        let affected: Vec<String> = {
            let mut state = self.state.lock();
            let ids: Vec<String> = state
                .operations
                .values()
                .filter(|op| !op.is_terminal())
                .filter(|op| is_extension || op.owning_peer_id == peer_id)
                .map(|op| op.operation_id.clone())
                .collect();
            if is_extension {
                for id in &ids {
                    state.rebindable.insert(id.clone());
                }
            }
            ids
        };

        if affected.is_empty() {
            return;
        }
        info!(
            "[OPS] Peer {} disconnected; {} operation(s) enter {}ms grace window",
            peer_id,
            affected.len(),
            self.grace_window_ms
        );

        let manager = Arc::clone(self);
        let peer_id = peer_id.to_string();
        let grace = Duration::from_millis(self.grace_window_ms);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for id in affected {
                let still_doomed = {
                    let state = manager.state.lock();
                    let non_terminal = state
                        .operations
                        .get(&id)
                        .map(|op| !op.is_terminal())
                        .unwrap_or(false);
                    non_terminal && (!is_extension || state.rebindable.contains(&id))
                };
                if still_doomed {
                    let _ = manager.fail(&id, &BridgeError::PeerDisconnected(peer_id.clone()));
                }
            }
        });
    }

    /// Counts by state for the health surface.
    pub fn counts_by_state(&self) -> HashMap<String, usize> {
        let state = self.state.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for op in state.operations.values() {
            let key = serde_json::to_value(op.state)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown".into());
            *counts.entry(key).or_default() += 1;
        }
        counts
    }

    /// Most recent operation (any state) recorded against a tab.
    pub fn latest_for_tab(&self, tab_id: i64) -> Option<Operation> {
        let state = self.state.lock();
        state
            .operations
            .values()
            .filter(|op| op.tab_id == Some(tab_id))
            .max_by_key(|op| op.created_at)
            .cloned()
    }

    /// Snapshot to disk: non-terminal operations plus the retained ring of
    /// recent terminals.
    pub fn persist(&self) {
        let snapshot = {
            let state = self.state.lock();
            state.operations.clone()
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!(
                "[OPS] Failed to persist operation store {}: {}",
                self.store.path().display(),
                e
            );
        }
    }

    fn emit(&self, op: &Operation) {
        let _ = self.progress_tx.send(ProgressUpdate {
            operation_id: op.operation_id.clone(),
            state: op.state,
            owning_peer_id: op.owning_peer_id.clone(),
            milestones: op.milestones.clone(),
            result: op.result.clone(),
            error: op.error.clone(),
        });
    }

    /// Background deadline sweeper. Fails overdue non-terminal operations
    /// with Timeout; the underlying browser action is not forcibly aborted.
    pub async fn run_timeout_sweeper(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.sweep_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("[OPS] Timeout sweeper running ({}ms tick)", self.sweep_interval_ms);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = unix_ms();
                    let overdue: Vec<String> = {
                        let state = self.state.lock();
                        state
                            .operations
                            .values()
                            .filter(|op| !op.is_terminal() && op.deadline <= now)
                            .map(|op| op.operation_id.clone())
                            .collect()
                    };
                    for id in overdue {
                        warn!("[OPS] Operation {} exceeded its deadline", id);
                        let _ = self.finish(
                            &id,
                            OperationState::TimedOut,
                            None,
                            Some(BridgeError::Timeout(id.clone()).to_string()),
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!("[OPS] Timeout sweeper stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager_with(config: BridgeConfig, dir: &tempfile::TempDir) -> Arc<OperationManager> {
        let store = OperationStore::new(dir.path().join("ops.json"));
        OperationManager::new(store, &config)
    }

    fn default_manager(dir: &tempfile::TempDir) -> Arc<OperationManager> {
        manager_with(BridgeConfig::default(), dir)
    }

    #[tokio::test]
    async fn test_begin_with_requested_id_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let first = manager.begin(
            OperationKind::SendMessage,
            json!({}),
            "client-1",
            Some(1),
            None,
            Some("op_client_chosen".into()),
        );
        let second = manager.begin(
            OperationKind::GetResponse,
            json!({"other": true}),
            "client-2",
            Some(2),
            None,
            Some("op_client_chosen".into()),
        );
        assert_eq!(first.operation_id, "op_client_chosen");
        assert_eq!(second.operation_id, first.operation_id);
        // the original record wins
        assert_eq!(second.kind, OperationKind::SendMessage);
        assert_eq!(second.owning_peer_id, "client-1");
    }

    #[tokio::test]
    async fn test_response_completed_transitions_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);

        manager.record_milestone(&op.operation_id, milestone::MESSAGE_SENT, None).unwrap();
        manager
            .record_milestone(&op.operation_id, milestone::RESPONSE_STARTED, None)
            .unwrap();
        let done = manager
            .record_milestone(
                &op.operation_id,
                milestone::RESPONSE_COMPLETED,
                Some(json!({"text": "hello back"})),
            )
            .unwrap();

        assert_eq!(done.state, OperationState::Completed);
        assert_eq!(done.result, Some(json!({"text": "hello back"})));
        assert_eq!(done.milestones.len(), 3);
    }

    #[tokio::test]
    async fn test_milestone_after_terminal_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);
        manager.complete(&op.operation_id, json!("done")).unwrap();

        let after = manager
            .record_milestone(&op.operation_id, milestone::MESSAGE_SENT, None)
            .unwrap();
        assert_eq!(after.state, OperationState::Completed);
        assert!(after.milestones.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_completion_transition_happens_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);
        manager
            .record_milestone(&op.operation_id, milestone::RESPONSE_COMPLETED, Some(json!("first")))
            .unwrap();
        let second = manager
            .record_milestone(&op.operation_id, milestone::RESPONSE_COMPLETED, Some(json!("second")))
            .unwrap();
        assert_eq!(second.result, Some(json!("first")));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_sticky() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);

        let cancelled = manager.cancel(&op.operation_id).unwrap();
        assert_eq!(cancelled.state, OperationState::Cancelled);

        // cancelling again or completing afterwards is a no-op
        let again = manager.cancel(&op.operation_id).unwrap();
        assert_eq!(again.state, OperationState::Cancelled);
        let completed = manager.complete(&op.operation_id, json!("late")).unwrap();
        assert_eq!(completed.state, OperationState::Cancelled);
        assert!(completed.result.is_none());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);

        let waiter = {
            let manager = Arc::clone(&manager);
            let id = op.operation_id.clone();
            tokio::spawn(async move { manager.wait(&id, 5_000).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.complete(&op.operation_id, json!({"ok": true})).unwrap();

        let waited = waiter.await.unwrap().unwrap();
        assert_eq!(waited.state, OperationState::Completed);
        assert_eq!(waited.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_operation_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);

        let err = manager.wait(&op.operation_id, 50).await.unwrap_err();
        assert_eq!(err.error_type(), "Timeout");
        assert!(!manager.get(&op.operation_id).unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_wait_unknown_operation() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let err = manager.wait("op_nope", 50).await.unwrap_err();
        assert_eq!(err.error_type(), "OperationNotFound");
    }

    #[tokio::test]
    async fn test_restart_recovery_fails_in_flight_operations() {
        let dir = tempfile::tempdir().unwrap();
        let op_id;
        {
            let manager = default_manager(&dir);
            let op = manager.begin(OperationKind::SendMessage, json!({}), "c", Some(1), None, None);
            op_id = op.operation_id.clone();
            manager.record_milestone(&op_id, milestone::MESSAGE_SENT, None).unwrap();
        }

        // "restart": a fresh manager over the same store
        let manager = default_manager(&dir);
        let recovered = manager.get(&op_id).expect("operation survives restart");
        assert_eq!(recovered.state, OperationState::Failed);
        assert!(recovered.error.as_deref().unwrap().contains("process restart"));

        // no further milestone can move it
        let after = manager
            .record_milestone(&op_id, milestone::RESPONSE_COMPLETED, Some(json!("x")))
            .unwrap();
        assert_eq!(after.state, OperationState::Failed);
    }

    #[tokio::test]
    async fn test_rehydrate_opt_in_keeps_operations_alive() {
        let dir = tempfile::tempdir().unwrap();
        let op_id;
        {
            let manager = default_manager(&dir);
            let op = manager.begin(OperationKind::GetResponse, json!({}), "c", Some(1), None, None);
            op_id = op.operation_id.clone();
        }

        let mut config = BridgeConfig::default();
        config.rehydrate_on_start = true;
        let manager = manager_with(config, &dir);
        assert!(!manager.get(&op_id).unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_disconnect_grace_then_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.grace_window_ms = 200;
        let manager = manager_with(config, &dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "client-1", Some(1), None, None);

        manager.on_peer_disconnect("ext-1", true);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let failed = manager.get(&op.operation_id).unwrap();
        assert_eq!(failed.state, OperationState::Failed);
        assert!(failed.error.as_deref().unwrap().contains("peer disconnected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_milestone_within_grace_window_rebinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.grace_window_ms = 500;
        let manager = manager_with(config, &dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "client-1", Some(1), None, None);

        manager.on_peer_disconnect("ext-1", true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // the re-registered extension is still making progress
        manager
            .record_milestone(&op.operation_id, milestone::RESPONSE_STARTED, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!manager.get(&op.operation_id).unwrap().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_disconnect_cannot_be_rebound() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.grace_window_ms = 200;
        let manager = manager_with(config, &dir);
        let op = manager.begin(OperationKind::SendMessage, json!({}), "client-1", Some(1), None, None);

        manager.on_peer_disconnect("client-1", false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager
            .record_milestone(&op.operation_id, milestone::RESPONSE_STARTED, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.get(&op.operation_id).unwrap().state, OperationState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_times_out_overdue_operations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.sweep_interval_ms = 100;
        let manager = manager_with(config, &dir);
        let op = manager.begin(
            OperationKind::SendMessage,
            json!({}),
            "c",
            Some(1),
            Some(1), // 1ms deadline
            None,
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let sweeper = tokio::spawn(Arc::clone(&manager).run_timeout_sweeper(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = shutdown_tx.send(());
        let _ = sweeper.await;

        let timed_out = manager.get(&op.operation_id).unwrap();
        assert_eq!(timed_out.state, OperationState::TimedOut);
        assert!(timed_out.error.is_some());
    }

    #[tokio::test]
    async fn test_recent_terminal_ring_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.recent_terminal_cap = 3;
        let manager = manager_with(config, &dir);

        let mut ids = Vec::new();
        for _ in 0..5 {
            let op = manager.begin(OperationKind::SendMessage, json!({}), "c", None, None, None);
            manager.complete(&op.operation_id, json!("ok")).unwrap();
            ids.push(op.operation_id);
        }

        // the two oldest terminals were evicted from memory and the store
        assert!(manager.get(&ids[0]).is_none());
        assert!(manager.get(&ids[1]).is_none());
        assert!(manager.get(&ids[4]).is_some());
    }

    #[tokio::test]
    async fn test_progress_updates_carry_owner_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let manager = default_manager(&dir);
        let mut rx = manager.subscribe_progress();
        let op = manager.begin(OperationKind::SendMessage, json!({}), "client-9", Some(4), None, None);

        let registered = rx.recv().await.unwrap();
        assert_eq!(registered.state, OperationState::Registered);
        assert_eq!(registered.owning_peer_id, "client-9");

        manager.complete(&op.operation_id, json!({"answer": 42})).unwrap();
        let completed = rx.recv().await.unwrap();
        assert_eq!(completed.state, OperationState::Completed);

        let frame = completed.to_frame();
        assert_eq!(frame.frame_type, "progress");
        let params = frame.params.unwrap();
        assert_eq!(params["operationId"], op.operation_id.as_str());
        assert_eq!(params["state"], "completed");
        assert_eq!(params["result"]["answer"], 42);
    }
}
