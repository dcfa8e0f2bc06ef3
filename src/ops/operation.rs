//! Operation records and their lifecycle
//!
//! One operation id flows end-to-end: client, relay and tab observer all
//! refer to the same string. Terminal states are sticky.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::unix_ms;

/// Well-known milestone names for send/response operations.
pub mod milestone {
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const RESPONSE_STARTED: &str = "response_started";
    pub const RESPONSE_COMPLETED: &str = "response_completed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SendMessage,
    GetResponse,
    ForwardResponse,
    Compound,
}

/// Mutual-exclusion class an operation occupies on its tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictGroup {
    Write,
    ReadOnly,
}

impl OperationKind {
    pub fn default_deadline_ms(&self) -> u64 {
        match self {
            OperationKind::SendMessage => 30_000,
            OperationKind::GetResponse => 120_000,
            OperationKind::ForwardResponse => 120_000,
            OperationKind::Compound => 300_000,
        }
    }

    pub fn conflict_group(&self) -> ConflictGroup {
        match self {
            OperationKind::GetResponse => ConflictGroup::ReadOnly,
            _ => ConflictGroup::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationState {
    Registered,
    InFlight,
    AwaitingMilestone,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed
                | OperationState::Failed
                | OperationState::Cancelled
                | OperationState::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    pub at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    pub params: Value,
    pub created_at: u64,
    pub updated_at: u64,
    /// Absolute unix-ms deadline enforced by the sweeper.
    pub deadline: u64,
    pub milestones: Vec<Milestone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub owning_peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<i64>,
}

impl Operation {
    pub fn new(
        operation_id: String,
        kind: OperationKind,
        params: Value,
        owning_peer_id: String,
        tab_id: Option<i64>,
        deadline_ms: Option<u64>,
    ) -> Self {
        let now = unix_ms();
        Self {
            operation_id,
            kind,
            state: OperationState::Registered,
            params,
            created_at: now,
            updated_at: now,
            deadline: now + deadline_ms.unwrap_or_else(|| kind.default_deadline_ms()),
            milestones: Vec::new(),
            result: None,
            error: None,
            owning_peer_id,
            tab_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Append a milestone, keeping `at` non-decreasing.
    pub fn push_milestone(&mut self, name: &str, data: Option<Value>) {
        let mut at = unix_ms();
        if let Some(last) = self.milestones.last() {
            at = at.max(last.at);
        }
        self.milestones.push(Milestone { name: name.to_string(), at, data });
        self.updated_at = at;
    }

    pub fn has_milestone(&self, name: &str) -> bool {
        self.milestones.iter().any(|m| m.name == name)
    }
}
