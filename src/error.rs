//! Bridge error taxonomy
//!
//! Every error that can cross the router boundary carries a stable
//! `errorType` code so callers can decide whether a retry makes sense.
//! Capability failures keep the browser-reported message verbatim.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Caller-side schema/validation failure. Not retried.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// `_to` named a peer that is not registered.
    #[error("unknown target peer: {0}")]
    UnknownTarget(String),

    /// No extension peer is currently registered.
    #[error("extension peer is not connected")]
    ExtensionUnavailable,

    /// The peer's transport channel is closed or its send queue overflowed.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Frame serialized above the configured size limit.
    #[error("frame too large: {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Tab lock could not be acquired before the deadline.
    #[error("tab {tab_id} is busy: lock not acquired within {waited_ms}ms")]
    LockTimeout { tab_id: i64, waited_ms: u64 },

    /// The observer script is not injected in the target tab.
    #[error("content script observer missing in tab {0}")]
    ContentScriptMissing(i64),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("operation already terminal: {0}")]
    OperationAlreadyTerminal(String),

    /// Deadline reached before the operation completed.
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// Operation was in flight when the process restarted.
    #[error("operation interrupted by process restart: {0}")]
    ProcessRestarted(String),

    /// The browser capability reported a failure. Message propagated verbatim.
    #[error("capability error: {0}")]
    Capability(String),

    /// Organization id could not be extracted from browser cookies.
    #[error("organization id unavailable: cookie extraction failed")]
    OrgIdUnavailable,

    /// forward_response refused to target its own source tab.
    #[error("refusing to forward tab {0}'s response back to itself")]
    SelfForward(i64),

    /// forward_response found no completed response on the source tab.
    #[error("no completed response available on tab {0}")]
    NoCompletedResponse(i64),
}

impl BridgeError {
    /// Stable wire code surfaced as `errorType`.
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::InvalidParams(_) => "InvalidParams",
            BridgeError::UnknownTarget(_) => "UnknownTarget",
            BridgeError::ExtensionUnavailable => "ExtensionUnavailable",
            BridgeError::PeerUnreachable(_) => "PeerUnreachable",
            BridgeError::FrameTooLarge { .. } => "FrameTooLarge",
            BridgeError::LockTimeout { .. } => "LockTimeout",
            BridgeError::ContentScriptMissing(_) => "ContentScriptMissing",
            BridgeError::OperationNotFound(_) => "OperationNotFound",
            BridgeError::OperationAlreadyTerminal(_) => "OperationAlreadyTerminal",
            BridgeError::Timeout(_) => "Timeout",
            BridgeError::PeerDisconnected(_) => "PeerDisconnected",
            BridgeError::ProcessRestarted(_) => "ProcessRestarted",
            BridgeError::Capability(_) => "CapabilityError",
            BridgeError::OrgIdUnavailable => "OrgIdUnavailable",
            BridgeError::SelfForward(_) => "SelfForward",
            BridgeError::NoCompletedResponse(_) => "NoCompletedResponse",
        }
    }

    /// Whether a caller may reasonably retry after the condition clears.
    pub fn retryable(&self) -> bool {
        match self {
            BridgeError::InvalidParams(_)
            | BridgeError::OperationNotFound(_)
            | BridgeError::OperationAlreadyTerminal(_)
            | BridgeError::SelfForward(_)
            | BridgeError::OrgIdUnavailable => false,
            BridgeError::UnknownTarget(_)
            | BridgeError::ExtensionUnavailable
            | BridgeError::PeerUnreachable(_)
            | BridgeError::FrameTooLarge { .. }
            | BridgeError::LockTimeout { .. }
            | BridgeError::ContentScriptMissing(_)
            | BridgeError::Timeout(_)
            | BridgeError::PeerDisconnected(_)
            | BridgeError::ProcessRestarted(_)
            | BridgeError::Capability(_)
            | BridgeError::NoCompletedResponse(_) => true,
        }
    }
}
