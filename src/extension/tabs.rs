//! Tab coordinator
//!
//! Serializes operations per browser tab. Writers hold the tab
//! exclusively; readonly operations may share it. Waiters queue FIFO, so
//! a pending writer also blocks readers that arrived after it (writers
//! cannot starve on a busy tab). The coordinator additionally owns the
//! debugger-session and observer-injection state for every tab; other
//! code paths must route through it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::extension::capabilities::{AttachOutcome, BrowserCapabilities};
use crate::ops::operation::ConflictGroup;
use crate::util::unix_ms;

/// Navigation within this window after injection does not clear the
/// observer; it is assumed to be the injection's own side effect.
pub const NAVIGATION_GRACE_MS: u64 = 5_000;

/// Active operations get this long to finish during cleanup.
const CLEANUP_DRAIN_MS: u64 = 5_000;

const NETWORK_BUFFER_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DebuggerOwner {
    None,
    #[serde(rename = "self")]
    SelfOwned,
    External,
}

#[derive(Debug, Clone)]
struct QueuedEntry {
    ticket: u64,
    group: ConflictGroup,
}

#[derive(Debug)]
struct TabState {
    next_ticket: u64,
    queue: VecDeque<QueuedEntry>,
    active_writer: Option<String>,
    active_readers: HashMap<String, u64>,
    debugger_attached: bool,
    debugger_owner: DebuggerOwner,
    observer_injected_at: Option<u64>,
    monitoring: bool,
    captured_network: VecDeque<Value>,
}

impl Default for TabState {
    fn default() -> Self {
        Self {
            next_ticket: 0,
            queue: VecDeque::new(),
            active_writer: None,
            active_readers: HashMap::new(),
            debugger_attached: false,
            debugger_owner: DebuggerOwner::None,
            observer_injected_at: None,
            monitoring: false,
            captured_network: VecDeque::new(),
        }
    }
}

/// Serializable view of one tab for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct TabView {
    #[serde(rename = "tabId")]
    pub tab_id: i64,
    #[serde(rename = "activeWriter")]
    pub active_writer: Option<String>,
    #[serde(rename = "readerCount")]
    pub reader_count: usize,
    #[serde(rename = "queueDepth")]
    pub queue_depth: usize,
    #[serde(rename = "debuggerAttached")]
    pub debugger_attached: bool,
    #[serde(rename = "debuggerOwner")]
    pub debugger_owner: DebuggerOwner,
    #[serde(rename = "observerInjected")]
    pub observer_injected: bool,
    pub monitoring: bool,
}

#[derive(Debug)]
pub struct TabCoordinator {
    tabs: Mutex<HashMap<i64, TabState>>,
    changed: Notify,
    lock_timeout_ms: u64,
}

/// Held lock on one tab. Dropping releases it.
#[derive(Debug)]
pub struct TabLockGuard {
    coordinator: Arc<TabCoordinator>,
    tab_id: i64,
    op_id: String,
    group: ConflictGroup,
    released: bool,
}

impl TabLockGuard {
    pub fn tab_id(&self) -> i64 {
        self.tab_id
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.coordinator.release(self.tab_id, &self.op_id, self.group);
        }
    }
}

impl Drop for TabLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl TabCoordinator {
    pub fn new(lock_timeout_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            tabs: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            lock_timeout_ms,
        })
    }

    pub fn default_lock_timeout_ms(&self) -> u64 {
        self.lock_timeout_ms
    }

    /// Acquire the tab for an operation, waiting FIFO up to `timeout_ms`
    /// (default: the configured lock timeout). On timeout the queue entry
    /// is withdrawn and the tab's active state is unchanged.
    pub async fn acquire(
        self: &Arc<Self>,
        tab_id: i64,
        op_id: &str,
        group: ConflictGroup,
        timeout_ms: Option<u64>,
    ) -> Result<TabLockGuard, BridgeError> {
        let timeout = timeout_ms.unwrap_or(self.lock_timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout);

        let ticket = {
            let mut tabs = self.tabs.lock();
            let state = tabs.entry(tab_id).or_default();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(QueuedEntry { ticket, group });
            ticket
        };

        loop {
            // register for wakeups before the eligibility check so a
            // release between check and await cannot be missed
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut tabs = self.tabs.lock();
                let state = tabs.entry(tab_id).or_default();
                if Self::eligible(state, ticket, group) {
                    state.queue.retain(|e| e.ticket != ticket);
                    match group {
                        ConflictGroup::Write => state.active_writer = Some(op_id.to_string()),
                        ConflictGroup::ReadOnly => {
                            state.active_readers.insert(op_id.to_string(), ticket);
                        }
                    }
                    debug!("[TABS] Tab {} acquired by {} ({:?})", tab_id, op_id, group);
                    return Ok(TabLockGuard {
                        coordinator: Arc::clone(self),
                        tab_id,
                        op_id: op_id.to_string(),
                        group,
                        released: false,
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                let mut tabs = self.tabs.lock();
                if let Some(state) = tabs.get_mut(&tab_id) {
                    state.queue.retain(|e| e.ticket != ticket);
                }
                drop(tabs);
                // withdrawing a queued writer may unblock readers behind it
                self.changed.notify_waiters();
                return Err(BridgeError::LockTimeout { tab_id, waited_ms: timeout });
            }
        }
    }

    fn eligible(state: &TabState, ticket: u64, group: ConflictGroup) -> bool {
        match group {
            ConflictGroup::Write => {
                state.active_writer.is_none()
                    && state.active_readers.is_empty()
                    && state.queue.front().map(|e| e.ticket == ticket).unwrap_or(false)
            }
            ConflictGroup::ReadOnly => {
                state.active_writer.is_none()
                    && state
                        .queue
                        .iter()
                        .take_while(|e| e.ticket != ticket)
                        .all(|e| e.group == ConflictGroup::ReadOnly)
            }
        }
    }

    fn release(&self, tab_id: i64, op_id: &str, group: ConflictGroup) {
        let mut tabs = self.tabs.lock();
        if let Some(state) = tabs.get_mut(&tab_id) {
            match group {
                ConflictGroup::Write => {
                    if state.active_writer.as_deref() == Some(op_id) {
                        state.active_writer = None;
                    }
                }
                ConflictGroup::ReadOnly => {
                    state.active_readers.remove(op_id);
                }
            }
        }
        drop(tabs);
        self.changed.notify_waiters();
    }

    /// Acquire several tabs in ascending id order (deadlock-free for
    /// multi-tab operations such as forwarding).
    pub async fn acquire_many(
        self: &Arc<Self>,
        tab_ids: &[i64],
        op_id: &str,
        group: ConflictGroup,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<TabLockGuard>, BridgeError> {
        let mut sorted: Vec<i64> = tab_ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for tab_id in sorted {
            match self.acquire(tab_id, op_id, group, timeout_ms).await {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    drop(guards);
                    return Err(e);
                }
            }
        }
        Ok(guards)
    }

    // ------------------------------------------------------------------
    // Debugger-session discipline
    // ------------------------------------------------------------------

    /// Idempotent attach. Probes for an already-functional session first
    /// and adopts it as externally owned instead of failing.
    pub async fn attach_debugger(
        &self,
        tab_id: i64,
        caps: &dyn BrowserCapabilities,
    ) -> Result<AttachOutcome, BridgeError> {
        {
            let tabs = self.tabs.lock();
            if let Some(state) = tabs.get(&tab_id) {
                if state.debugger_attached {
                    return Ok(AttachOutcome { already_attached: true, adopted_external: false });
                }
            }
        }

        if caps.debugger_functional(tab_id).await.unwrap_or(false) {
            let mut tabs = self.tabs.lock();
            let state = tabs.entry(tab_id).or_default();
            state.debugger_attached = true;
            state.debugger_owner = DebuggerOwner::External;
            info!("[TABS] Adopted external debugger session on tab {}", tab_id);
            return Ok(AttachOutcome { already_attached: false, adopted_external: true });
        }

        let outcome = caps.attach_debugger(tab_id).await?;
        let mut tabs = self.tabs.lock();
        let state = tabs.entry(tab_id).or_default();
        state.debugger_attached = true;
        state.debugger_owner = if outcome.adopted_external {
            DebuggerOwner::External
        } else {
            DebuggerOwner::SelfOwned
        };
        Ok(outcome)
    }

    /// Detach only sessions we own. Externally owned sessions are left
    /// alone; returns whether a detach was actually performed.
    pub async fn detach_debugger(
        &self,
        tab_id: i64,
        caps: &dyn BrowserCapabilities,
    ) -> Result<bool, BridgeError> {
        let owner = {
            let tabs = self.tabs.lock();
            tabs.get(&tab_id).map(|s| s.debugger_owner).unwrap_or(DebuggerOwner::None)
        };

        match owner {
            DebuggerOwner::SelfOwned => {
                caps.detach_debugger(tab_id).await?;
                let mut tabs = self.tabs.lock();
                if let Some(state) = tabs.get_mut(&tab_id) {
                    state.debugger_attached = false;
                    state.debugger_owner = DebuggerOwner::None;
                }
                Ok(true)
            }
            DebuggerOwner::External => {
                debug!("[TABS] Tab {} debugger is externally owned, not detaching", tab_id);
                Ok(false)
            }
            DebuggerOwner::None => Ok(false),
        }
    }

    pub fn debugger_status(&self, tab_id: i64) -> (bool, DebuggerOwner) {
        let tabs = self.tabs.lock();
        tabs.get(&tab_id)
            .map(|s| (s.debugger_attached, s.debugger_owner))
            .unwrap_or((false, DebuggerOwner::None))
    }

    // ------------------------------------------------------------------
    // Observer-injection tracking
    // ------------------------------------------------------------------

    /// Inject the observer if not already tracked. Returns whether an
    /// injection was performed.
    pub async fn ensure_observer(
        &self,
        tab_id: i64,
        caps: &dyn BrowserCapabilities,
    ) -> Result<bool, BridgeError> {
        {
            let tabs = self.tabs.lock();
            if let Some(state) = tabs.get(&tab_id) {
                if state.observer_injected_at.is_some() {
                    return Ok(false);
                }
            }
        }
        caps.inject_observer(tab_id).await?;
        let mut tabs = self.tabs.lock();
        tabs.entry(tab_id).or_default().observer_injected_at = Some(unix_ms());
        info!("[TABS] Observer injected into tab {}", tab_id);
        Ok(true)
    }

    pub fn observer_injected(&self, tab_id: i64) -> bool {
        self.tabs
            .lock()
            .get(&tab_id)
            .map(|s| s.observer_injected_at.is_some())
            .unwrap_or(false)
    }

    /// Navigation clears the observer unless it happened within the
    /// post-injection grace window (the injection itself can trigger a
    /// same-origin navigation).
    pub fn on_navigation(&self, tab_id: i64) {
        let mut tabs = self.tabs.lock();
        if let Some(state) = tabs.get_mut(&tab_id) {
            if let Some(at) = state.observer_injected_at {
                if unix_ms().saturating_sub(at) > NAVIGATION_GRACE_MS {
                    state.observer_injected_at = None;
                    info!("[TABS] Navigation cleared observer tracking for tab {}", tab_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Network capture
    // ------------------------------------------------------------------

    pub async fn start_monitoring(
        &self,
        tab_id: i64,
        caps: &dyn BrowserCapabilities,
    ) -> Result<(), BridgeError> {
        caps.start_network_monitor(tab_id).await?;
        self.tabs.lock().entry(tab_id).or_default().monitoring = true;
        Ok(())
    }

    pub async fn stop_monitoring(
        &self,
        tab_id: i64,
        caps: &dyn BrowserCapabilities,
    ) -> Result<(), BridgeError> {
        caps.stop_network_monitor(tab_id).await?;
        self.tabs.lock().entry(tab_id).or_default().monitoring = false;
        Ok(())
    }

    pub fn is_monitoring(&self, tab_id: i64) -> bool {
        self.tabs.lock().get(&tab_id).map(|s| s.monitoring).unwrap_or(false)
    }

    /// Buffer a captured network event (ignored unless monitoring).
    pub fn capture(&self, tab_id: i64, event: Value) {
        let mut tabs = self.tabs.lock();
        if let Some(state) = tabs.get_mut(&tab_id) {
            if state.monitoring {
                if state.captured_network.len() >= NETWORK_BUFFER_CAP {
                    state.captured_network.pop_front();
                }
                state.captured_network.push_back(event);
            }
        }
    }

    pub fn captured(&self, tab_id: i64) -> Vec<Value> {
        self.tabs
            .lock()
            .get(&tab_id)
            .map(|s| s.captured_network.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Ordered resource teardown for a tab. Step failures are logged and
    /// never abort the remaining steps.
    pub async fn cleanup(
        &self,
        tab_id: i64,
        close_tab: bool,
        caps: &dyn BrowserCapabilities,
    ) -> Value {
        let mut report = serde_json::Map::new();

        // 1. stop network monitoring
        let step = if self.is_monitoring(tab_id) {
            match self.stop_monitoring(tab_id, caps).await {
                Ok(()) => "stopped",
                Err(e) => {
                    warn!("[TABS] Cleanup tab {}: stop monitoring failed: {}", tab_id, e);
                    "failed"
                }
            }
        } else {
            "not-running"
        };
        report.insert("networkMonitor".into(), json!(step));

        // 2. drain active operations (bounded)
        let drained = self.drain_active(tab_id, CLEANUP_DRAIN_MS).await;
        if !drained {
            warn!("[TABS] Cleanup tab {}: active operations did not drain in time", tab_id);
        }
        report.insert("drained".into(), json!(drained));

        // 3. detach self-owned debugger
        let detached = match self.detach_debugger(tab_id, caps).await {
            Ok(did) => json!(did),
            Err(e) => {
                warn!("[TABS] Cleanup tab {}: detach failed: {}", tab_id, e);
                json!("failed")
            }
        };
        report.insert("debuggerDetached".into(), detached);

        // 4. release any remaining lock state
        {
            let mut tabs = self.tabs.lock();
            if let Some(state) = tabs.get_mut(&tab_id) {
                state.queue.clear();
                state.active_writer = None;
                state.active_readers.clear();
            }
        }
        self.changed.notify_waiters();
        report.insert("locksReleased".into(), json!(true));

        // 5. drop observer tracking
        {
            let mut tabs = self.tabs.lock();
            if let Some(state) = tabs.get_mut(&tab_id) {
                state.observer_injected_at = None;
            }
        }
        report.insert("observerCleared".into(), json!(true));

        // 6. close the tab if requested
        if close_tab {
            let closed = match caps.close_tab(tab_id).await {
                Ok(()) => json!(true),
                Err(e) => {
                    warn!("[TABS] Cleanup tab {}: close failed: {}", tab_id, e);
                    json!("failed")
                }
            };
            report.insert("tabClosed".into(), closed);
            self.tabs.lock().remove(&tab_id);
        }

        info!("[TABS] Cleanup finished for tab {}", tab_id);
        Value::Object(report)
    }

    async fn drain_active(&self, tab_id: i64, budget_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(budget_ms);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let tabs = self.tabs.lock();
                match tabs.get(&tab_id) {
                    Some(state) => {
                        if state.active_writer.is_none() && state.active_readers.is_empty() {
                            return true;
                        }
                    }
                    None => return true,
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                return false;
            }
        }
    }

    /// Per-tab view for the health surface.
    pub fn snapshot(&self) -> Vec<TabView> {
        let tabs = self.tabs.lock();
        let mut views: Vec<TabView> = tabs
            .iter()
            .map(|(id, state)| TabView {
                tab_id: *id,
                active_writer: state.active_writer.clone(),
                reader_count: state.active_readers.len(),
                queue_depth: state.queue.len(),
                debugger_attached: state.debugger_attached,
                debugger_owner: state.debugger_owner,
                observer_injected: state.observer_injected_at.is_some(),
                monitoring: state.monitoring,
            })
            .collect();
        views.sort_by_key(|v| v.tab_id);
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::capabilities::MockBrowser;

    #[tokio::test]
    async fn test_writers_are_exclusive_per_tab() {
        let coordinator = TabCoordinator::new(30_000);
        let first = coordinator
            .acquire(1, "op_a", ConflictGroup::Write, Some(1_000))
            .await
            .unwrap();

        let err = coordinator
            .acquire(1, "op_b", ConflictGroup::Write, Some(50))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "LockTimeout");

        first.release();
        let second = coordinator
            .acquire(1, "op_b", ConflictGroup::Write, Some(1_000))
            .await
            .unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_readers_share_a_tab() {
        let coordinator = TabCoordinator::new(30_000);
        let a = coordinator
            .acquire(1, "op_a", ConflictGroup::ReadOnly, Some(200))
            .await
            .unwrap();
        let b = coordinator
            .acquire(1, "op_b", ConflictGroup::ReadOnly, Some(200))
            .await
            .unwrap();
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_pending_writer_blocks_later_readers() {
        let coordinator = TabCoordinator::new(30_000);
        let reader = coordinator
            .acquire(1, "op_r1", ConflictGroup::ReadOnly, Some(200))
            .await
            .unwrap();

        // writer queues behind the active reader
        let writer_task = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.acquire(1, "op_w", ConflictGroup::Write, Some(2_000)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // a reader arriving after the queued writer must wait for it
        let late_reader = coordinator
            .acquire(1, "op_r2", ConflictGroup::ReadOnly, Some(50))
            .await;
        assert!(late_reader.is_err());

        reader.release();
        let writer = writer_task.await.unwrap().unwrap();
        writer.release();

        // after the writer is done, readers run again
        let r = coordinator
            .acquire(1, "op_r3", ConflictGroup::ReadOnly, Some(1_000))
            .await
            .unwrap();
        drop(r);
    }

    #[tokio::test]
    async fn test_lock_timeout_leaves_state_unchanged() {
        let coordinator = TabCoordinator::new(30_000);
        let guard = coordinator
            .acquire(1, "op_a", ConflictGroup::Write, Some(1_000))
            .await
            .unwrap();
        let _ = coordinator
            .acquire(1, "op_b", ConflictGroup::Write, Some(30))
            .await
            .unwrap_err();

        let view = &coordinator.snapshot()[0];
        assert_eq!(view.active_writer.as_deref(), Some("op_a"));
        assert_eq!(view.queue_depth, 0);
        drop(guard);
    }

    #[tokio::test]
    async fn test_queue_is_fifo_for_writers() {
        let coordinator = TabCoordinator::new(30_000);
        let first = coordinator
            .acquire(1, "op_1", ConflictGroup::Write, Some(1_000))
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for name in ["op_2", "op_3", "op_4"] {
            let coordinator = Arc::clone(&coordinator);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let guard = coordinator
                    .acquire(1, name, ConflictGroup::Write, Some(5_000))
                    .await
                    .unwrap();
                order.lock().push(name.to_string());
                guard.release();
            }));
            // deterministic queue order
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        first.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["op_2", "op_3", "op_4"]);
    }

    #[tokio::test]
    async fn test_multi_tab_acquisition_sorts_ids() {
        let coordinator = TabCoordinator::new(30_000);
        let guards = coordinator
            .acquire_many(&[5, 2, 9], "op_fwd", ConflictGroup::Write, Some(500))
            .await
            .unwrap();
        let ids: Vec<i64> = guards.iter().map(|g| g.tab_id()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[tokio::test]
    async fn test_attach_adopts_external_and_refuses_detach() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();
        browser.seed_external_debugger(tab);

        let outcome = coordinator.attach_debugger(tab, &browser).await.unwrap();
        assert!(outcome.adopted_external);
        assert_eq!(coordinator.debugger_status(tab), (true, DebuggerOwner::External));

        // externally owned sessions are never detached by us
        let detached = coordinator.detach_debugger(tab, &browser).await.unwrap();
        assert!(!detached);
        assert!(browser.debugger_functional(tab).await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_twice_reports_already_attached() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();

        let first = coordinator.attach_debugger(tab, &browser).await.unwrap();
        assert!(!first.already_attached);
        let second = coordinator.attach_debugger(tab, &browser).await.unwrap();
        assert!(second.already_attached);
        assert_eq!(coordinator.debugger_status(tab).1, DebuggerOwner::SelfOwned);
    }

    #[tokio::test]
    async fn test_navigation_grace_window() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();

        assert!(coordinator.ensure_observer(tab, &browser).await.unwrap());
        // navigation right after injection keeps the observer
        coordinator.on_navigation(tab);
        assert!(coordinator.observer_injected(tab));

        // force the injection timestamp outside the grace window
        {
            let mut tabs = coordinator.tabs.lock();
            tabs.get_mut(&tab).unwrap().observer_injected_at =
                Some(unix_ms() - NAVIGATION_GRACE_MS - 1_000);
        }
        coordinator.on_navigation(tab);
        assert!(!coordinator.observer_injected(tab));
    }

    #[tokio::test]
    async fn test_ensure_observer_skips_when_tracked() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();

        assert!(coordinator.ensure_observer(tab, &browser).await.unwrap());
        assert!(!coordinator.ensure_observer(tab, &browser).await.unwrap());
    }

    #[tokio::test]
    async fn test_capture_requires_monitoring() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();

        coordinator.capture(tab, json!({"url": "a"}));
        assert!(coordinator.captured(tab).is_empty());

        coordinator.start_monitoring(tab, &browser).await.unwrap();
        coordinator.capture(tab, json!({"url": "b"}));
        assert_eq!(coordinator.captured(tab).len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_runs_all_steps() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();

        coordinator.attach_debugger(tab, &browser).await.unwrap();
        coordinator.ensure_observer(tab, &browser).await.unwrap();
        coordinator.start_monitoring(tab, &browser).await.unwrap();

        let report = coordinator.cleanup(tab, true, &browser).await;
        assert_eq!(report["networkMonitor"], "stopped");
        assert_eq!(report["drained"], true);
        assert_eq!(report["debuggerDetached"], true);
        assert_eq!(report["locksReleased"], true);
        assert_eq!(report["tabClosed"], true);
        assert!(browser.list_tabs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_survives_capability_failures() {
        let coordinator = TabCoordinator::new(30_000);
        let browser = MockBrowser::new();
        // tab never created in the browser: close will fail
        let report = coordinator.cleanup(42, true, &browser).await;
        assert_eq!(report["tabClosed"], "failed");
        assert_eq!(report["locksReleased"], true);
    }
}
