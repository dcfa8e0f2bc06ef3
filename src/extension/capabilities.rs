//! Browser capability surface
//!
//! The coordination core never touches DOM selectors or injection script
//! bodies. Everything the browser can do for us is behind this trait; the
//! production implementation lives in the extension, while `MockBrowser`
//! provides a deterministic in-process stand-in for tests and the
//! `simulate_extension` mode.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::BridgeError;
use crate::extension::observer::ObserverEvent;
use crate::ops::operation::milestone;

#[derive(Debug, Clone, Serialize)]
pub struct TabDescriptor {
    pub id: i64,
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AttachOutcome {
    #[serde(rename = "alreadyAttached")]
    pub already_attached: bool,
    #[serde(rename = "adoptedExternal")]
    pub adopted_external: bool,
}

/// One conversation-API request, executed against the chat service with
/// the caller's organization id.
#[derive(Debug, Clone)]
pub enum ConversationCall {
    List { limit: usize },
    Search { query: String, limit: usize },
    Metadata { conversation_id: String },
    Url { conversation_id: String },
    Delete { conversation_ids: Vec<String> },
}

#[async_trait]
pub trait BrowserCapabilities: Send + Sync {
    async fn create_tab(&self, url: Option<&str>) -> Result<i64, BridgeError>;
    async fn close_tab(&self, tab_id: i64) -> Result<(), BridgeError>;
    async fn list_tabs(&self) -> Result<Vec<TabDescriptor>, BridgeError>;

    async fn attach_debugger(&self, tab_id: i64) -> Result<AttachOutcome, BridgeError>;
    async fn detach_debugger(&self, tab_id: i64) -> Result<(), BridgeError>;
    /// Probe whether a (possibly external) debugger session is functional.
    async fn debugger_functional(&self, tab_id: i64) -> Result<bool, BridgeError>;

    async fn execute_script(&self, tab_id: i64, script: &str) -> Result<Value, BridgeError>;
    async fn query_dom(&self, tab_id: i64, selector: &str) -> Result<Value, BridgeError>;
    async fn inject_observer(&self, tab_id: i64) -> Result<(), BridgeError>;

    async fn start_network_monitor(&self, tab_id: i64) -> Result<(), BridgeError>;
    async fn stop_network_monitor(&self, tab_id: i64) -> Result<(), BridgeError>;
    async fn network_events(&self, tab_id: i64) -> Result<Vec<Value>, BridgeError>;

    /// Submit a chat message through the page. The operation id travels
    /// with the injected call so the observer reports milestones against
    /// the exact same id.
    async fn send_chat_message(
        &self,
        tab_id: i64,
        operation_id: &str,
        message: &str,
    ) -> Result<(), BridgeError>;
    async fn latest_response(&self, tab_id: i64) -> Result<Option<String>, BridgeError>;
    async fn export_conversation(&self, tab_id: i64) -> Result<Value, BridgeError>;
    /// Best-effort abort of whatever the tab is doing.
    async fn cancel_activity(&self, tab_id: i64) -> Result<(), BridgeError>;

    async fn reload_runtime(&self) -> Result<(), BridgeError>;
    async fn read_cookie(&self, name: &str) -> Result<Option<String>, BridgeError>;
    async fn conversations(&self, org_id: &str, call: &ConversationCall)
        -> Result<Value, BridgeError>;
}

// ---------------------------------------------------------------------------
// Mock implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockTab {
    url: String,
    title: String,
    responses: Vec<String>,
}

struct MockState {
    tabs: BTreeMap<i64, MockTab>,
    next_tab_id: i64,
    attached: HashSet<i64>,
    external_sessions: HashSet<i64>,
    observers: HashSet<i64>,
    monitoring: HashSet<i64>,
    network_events: HashMap<i64, Vec<Value>>,
    cookies: HashMap<String, String>,
    conversations: Vec<Value>,
    sent: Vec<(i64, String, String)>,
    /// Remaining injected attach failures (transient-fault simulation).
    attach_failures: u32,
    response_delay_ms: u64,
    observer_tx: Option<mpsc::UnboundedSender<ObserverEvent>>,
}

impl Default for MockState {
    fn default() -> Self {
        let mut cookies = HashMap::new();
        cookies.insert("lastActiveOrg".to_string(), "org-mock-0001".to_string());
        Self {
            tabs: BTreeMap::new(),
            next_tab_id: 1,
            attached: HashSet::new(),
            external_sessions: HashSet::new(),
            observers: HashSet::new(),
            monitoring: HashSet::new(),
            network_events: HashMap::new(),
            cookies,
            conversations: vec![
                json!({"uuid": "conv-1", "name": "Trip planning", "updated_at": "2025-06-01T10:00:00Z"}),
                json!({"uuid": "conv-2", "name": "Rust questions", "updated_at": "2025-06-02T11:30:00Z"}),
            ],
            sent: Vec::new(),
            attach_failures: 0,
            response_delay_ms: 20,
            observer_tx: None,
        }
    }
}

/// Deterministic scripted browser. Sending a chat message schedules the
/// observer milestones (`message_sent`, `response_started`,
/// `response_completed`) with a configurable delay, echoing the message
/// back as the assistant response.
#[derive(Clone)]
pub struct MockBrowser {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBrowser {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(MockState::default())) }
    }

    /// Route observer events emitted by this browser into the given channel.
    pub fn set_observer_channel(&self, tx: mpsc::UnboundedSender<ObserverEvent>) {
        self.state.lock().observer_tx = Some(tx);
    }

    /// Inject `count` transient attach failures before the next success.
    pub fn inject_attach_failures(&self, count: u32) {
        self.state.lock().attach_failures = count;
    }

    /// Pretend an external tool already holds the tab's debugger session.
    pub fn seed_external_debugger(&self, tab_id: i64) {
        self.state.lock().external_sessions.insert(tab_id);
    }

    pub fn clear_cookies(&self) {
        self.state.lock().cookies.clear();
    }

    pub fn set_response_delay_ms(&self, delay: u64) {
        self.state.lock().response_delay_ms = delay;
    }

    pub fn sent_messages(&self) -> Vec<(i64, String, String)> {
        self.state.lock().sent.clone()
    }

    /// Simulate a navigation: capture an event if monitoring, and let the
    /// caller decide what happens to the observer (the tab coordinator owns
    /// that policy).
    pub fn record_network_event(&self, tab_id: i64, event: Value) {
        let mut state = self.state.lock();
        if state.monitoring.contains(&tab_id) {
            state.network_events.entry(tab_id).or_default().push(event);
        }
    }

    fn ensure_tab(state: &MockState, tab_id: i64) -> Result<(), BridgeError> {
        if state.tabs.contains_key(&tab_id) {
            Ok(())
        } else {
            Err(BridgeError::Capability(format!("no tab with id {tab_id}")))
        }
    }
}

#[async_trait]
impl BrowserCapabilities for MockBrowser {
    async fn create_tab(&self, url: Option<&str>) -> Result<i64, BridgeError> {
        let mut state = self.state.lock();
        let id = state.next_tab_id;
        state.next_tab_id += 1;
        state.tabs.insert(
            id,
            MockTab {
                url: url.unwrap_or("https://chat.example.com/new").to_string(),
                title: format!("Chat tab {id}"),
                responses: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn close_tab(&self, tab_id: i64) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        state.tabs.remove(&tab_id);
        state.attached.remove(&tab_id);
        state.observers.remove(&tab_id);
        state.monitoring.remove(&tab_id);
        Ok(())
    }

    async fn list_tabs(&self) -> Result<Vec<TabDescriptor>, BridgeError> {
        let state = self.state.lock();
        Ok(state
            .tabs
            .iter()
            .map(|(id, tab)| TabDescriptor { id: *id, url: tab.url.clone(), title: tab.title.clone() })
            .collect())
    }

    async fn attach_debugger(&self, tab_id: i64) -> Result<AttachOutcome, BridgeError> {
        let mut state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        if state.attached.contains(&tab_id) {
            return Ok(AttachOutcome { already_attached: true, adopted_external: false });
        }
        if state.external_sessions.contains(&tab_id) {
            state.attached.insert(tab_id);
            return Ok(AttachOutcome { already_attached: false, adopted_external: true });
        }
        if state.attach_failures > 0 {
            state.attach_failures -= 1;
            return Err(BridgeError::Capability("debugger attach failed: target busy".into()));
        }
        state.attached.insert(tab_id);
        Ok(AttachOutcome { already_attached: false, adopted_external: false })
    }

    async fn detach_debugger(&self, tab_id: i64) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        state.attached.remove(&tab_id);
        Ok(())
    }

    async fn debugger_functional(&self, tab_id: i64) -> Result<bool, BridgeError> {
        let state = self.state.lock();
        Ok(state.attached.contains(&tab_id) || state.external_sessions.contains(&tab_id))
    }

    async fn execute_script(&self, tab_id: i64, script: &str) -> Result<Value, BridgeError> {
        let state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        Ok(json!({"evaluated": script.len(), "tabId": tab_id}))
    }

    async fn query_dom(&self, tab_id: i64, selector: &str) -> Result<Value, BridgeError> {
        let state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        Ok(json!([{"selector": selector, "text": "mock element", "tabId": tab_id}]))
    }

    async fn inject_observer(&self, tab_id: i64) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        state.observers.insert(tab_id);
        Ok(())
    }

    async fn start_network_monitor(&self, tab_id: i64) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        state.monitoring.insert(tab_id);
        Ok(())
    }

    async fn stop_network_monitor(&self, tab_id: i64) -> Result<(), BridgeError> {
        let mut state = self.state.lock();
        state.monitoring.remove(&tab_id);
        Ok(())
    }

    async fn network_events(&self, tab_id: i64) -> Result<Vec<Value>, BridgeError> {
        Ok(self.state.lock().network_events.get(&tab_id).cloned().unwrap_or_default())
    }

    async fn send_chat_message(
        &self,
        tab_id: i64,
        operation_id: &str,
        message: &str,
    ) -> Result<(), BridgeError> {
        let (tx, delay) = {
            let mut state = self.state.lock();
            MockBrowser::ensure_tab(&state, tab_id)?;
            if !state.observers.contains(&tab_id) {
                return Err(BridgeError::ContentScriptMissing(tab_id));
            }
            state.sent.push((tab_id, message.to_string(), operation_id.to_string()));
            (state.observer_tx.clone(), state.response_delay_ms)
        };

        let Some(tx) = tx else {
            debug!("[MOCK] No observer channel wired, message sent silently");
            return Ok(());
        };

        let response = format!("Echo from tab {tab_id}: {message}");
        let operation_id = operation_id.to_string();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let step = Duration::from_millis(delay.max(1));
            let _ = tx.send(ObserverEvent::Milestone {
                operation_id: operation_id.clone(),
                name: milestone::MESSAGE_SENT.to_string(),
                data: None,
            });
            tokio::time::sleep(step).await;
            let _ = tx.send(ObserverEvent::Milestone {
                operation_id: operation_id.clone(),
                name: milestone::RESPONSE_STARTED.to_string(),
                data: None,
            });
            tokio::time::sleep(step).await;
            {
                let mut state = state.lock();
                if let Some(tab) = state.tabs.get_mut(&tab_id) {
                    tab.responses.push(response.clone());
                }
            }
            let _ = tx.send(ObserverEvent::Completed {
                operation_id,
                result: json!({"text": response, "tabId": tab_id}),
            });
        });
        Ok(())
    }

    async fn latest_response(&self, tab_id: i64) -> Result<Option<String>, BridgeError> {
        let state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        Ok(state.tabs.get(&tab_id).and_then(|t| t.responses.last().cloned()))
    }

    async fn export_conversation(&self, tab_id: i64) -> Result<Value, BridgeError> {
        let state = self.state.lock();
        MockBrowser::ensure_tab(&state, tab_id)?;
        let tab = &state.tabs[&tab_id];
        Ok(json!({
            "tabId": tab_id,
            "url": tab.url,
            "title": tab.title,
            "messages": tab.responses.iter().map(|r| json!({"role": "assistant", "text": r})).collect::<Vec<_>>(),
        }))
    }

    async fn cancel_activity(&self, tab_id: i64) -> Result<(), BridgeError> {
        debug!("[MOCK] cancel_activity on tab {}", tab_id);
        Ok(())
    }

    async fn reload_runtime(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn read_cookie(&self, name: &str) -> Result<Option<String>, BridgeError> {
        Ok(self.state.lock().cookies.get(name).cloned())
    }

    async fn conversations(
        &self,
        org_id: &str,
        call: &ConversationCall,
    ) -> Result<Value, BridgeError> {
        let mut state = self.state.lock();
        match call {
            ConversationCall::List { limit } => Ok(json!({
                "orgId": org_id,
                "conversations": state.conversations.iter().take(*limit).cloned().collect::<Vec<_>>(),
            })),
            ConversationCall::Search { query, limit } => {
                let matches: Vec<Value> = state
                    .conversations
                    .iter()
                    .filter(|c| {
                        c["name"]
                            .as_str()
                            .map(|n| n.to_lowercase().contains(&query.to_lowercase()))
                            .unwrap_or(false)
                    })
                    .take(*limit)
                    .cloned()
                    .collect();
                Ok(json!({"orgId": org_id, "conversations": matches}))
            }
            ConversationCall::Metadata { conversation_id } => state
                .conversations
                .iter()
                .find(|c| c["uuid"] == conversation_id.as_str())
                .cloned()
                .ok_or_else(|| BridgeError::Capability(format!("conversation {conversation_id} not found"))),
            ConversationCall::Url { conversation_id } => Ok(json!({
                "url": format!("https://chat.example.com/{org_id}/chat/{conversation_id}")
            })),
            ConversationCall::Delete { conversation_ids } => {
                let before = state.conversations.len();
                state
                    .conversations
                    .retain(|c| !conversation_ids.iter().any(|id| c["uuid"] == id.as_str()));
                Ok(json!({"deleted": before - state.conversations.len()}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();
        let first = browser.attach_debugger(tab).await.unwrap();
        assert!(!first.already_attached);
        let second = browser.attach_debugger(tab).await.unwrap();
        assert!(second.already_attached);
    }

    #[tokio::test]
    async fn test_attach_adopts_external_session() {
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();
        browser.seed_external_debugger(tab);
        let outcome = browser.attach_debugger(tab).await.unwrap();
        assert!(outcome.adopted_external);
        assert!(browser.debugger_functional(tab).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_attach_failures_are_transient() {
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();
        browser.inject_attach_failures(2);
        assert!(browser.attach_debugger(tab).await.is_err());
        assert!(browser.attach_debugger(tab).await.is_err());
        assert!(browser.attach_debugger(tab).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_requires_observer() {
        let browser = MockBrowser::new();
        let tab = browser.create_tab(None).await.unwrap();
        let err = browser.send_chat_message(tab, "op_1", "hi").await.unwrap_err();
        assert_eq!(err.error_type(), "ContentScriptMissing");
        browser.inject_observer(tab).await.unwrap();
        assert!(browser.send_chat_message(tab, "op_1", "hi").await.is_ok());
    }

    #[tokio::test]
    async fn test_conversation_search_filters() {
        let browser = MockBrowser::new();
        let result = browser
            .conversations("org-1", &ConversationCall::Search { query: "rust".into(), limit: 10 })
            .await
            .unwrap();
        let found = result["conversations"].as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["uuid"], "conv-2");
    }

    #[tokio::test]
    async fn test_conversation_delete_bulk() {
        let browser = MockBrowser::new();
        let result = browser
            .conversations(
                "org-1",
                &ConversationCall::Delete {
                    conversation_ids: vec!["conv-1".into(), "conv-2".into()],
                },
            )
            .await
            .unwrap();
        assert_eq!(result["deleted"], 2);
    }
}
