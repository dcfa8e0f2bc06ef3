//! Wire frames
//!
//! One JSON document per message on every transport. Peers author `type`,
//! `id`, `params`/`result`/`error` and may address with `_to`/`_broadcast`;
//! `_from` is router-owned and overwritten on ingress regardless of what a
//! peer claims.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::util::unix_ms;

/// Well-known frame type names.
pub mod frame_type {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const REGISTER: &str = "register";
    pub const HEALTH: &str = "health";
    pub const PEER_LIST: &str = "peer-list";
    pub const CLIENT_LIST_UPDATE: &str = "_client_list_update";
    pub const PROGRESS: &str = "progress";
    pub const LOG_NOTIFICATION: &str = "log_notification";
    pub const CANCEL_OPERATION: &str = "cancel_operation";

    // Milestone observer protocol (tab observer -> operation manager)
    pub const REGISTER_OPERATION: &str = "register_operation";
    pub const OPERATION_MILESTONE: &str = "operation_milestone";
    pub const OPERATION_COMPLETED: &str = "operation_completed";

    // Tab-side events routed to the extension stack
    pub const NETWORK_EVENT: &str = "network_event";
    pub const NAVIGATION_EVENT: &str = "navigation_event";
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Frame {
    /// Correlates a request with its response. Correlation state lives in
    /// the issuing peer, never in the router.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub frame_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    /// Router-stamped origin peer id.
    #[serde(rename = "_from", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Unicast target peer id.
    #[serde(rename = "_to", skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// Fan out to every peer except the origin.
    #[serde(rename = "_broadcast", skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<bool>,

    /// Peer snapshot carried by `_client_list_update` broadcasts.
    #[serde(rename = "_clients", skip_serializing_if = "Option::is_none")]
    pub clients: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Frame {
    pub fn new(frame_type: &str) -> Self {
        Self {
            frame_type: frame_type.to_string(),
            timestamp: Some(unix_ms()),
            ..Default::default()
        }
    }

    pub fn request(frame_type: &str, id: &str, params: Value) -> Self {
        Self {
            id: Some(id.to_string()),
            params: Some(params),
            ..Self::new(frame_type)
        }
    }

    pub fn notification(frame_type: &str, params: Value) -> Self {
        Self {
            params: Some(params),
            ..Self::new(frame_type)
        }
    }

    /// Success response correlated to `request`, addressed back to its origin.
    pub fn response_to(request: &Frame, result: Value) -> Self {
        Self {
            id: request.id.clone(),
            result: Some(result),
            to: request.from.clone(),
            ..Self::new(&request.frame_type)
        }
    }

    /// Error response correlated to `request`, addressed back to its origin.
    pub fn error_to(request: &Frame, error: &BridgeError) -> Self {
        Self {
            id: request.id.clone(),
            error: Some(error.to_string()),
            error_type: Some(error.error_type().to_string()),
            to: request.from.clone(),
            ..Self::new(&request.frame_type)
        }
    }

    pub fn is_request(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }

    /// Serialize and enforce the configured size limit.
    pub fn encode(&self, limit: usize) -> Result<String, BridgeError> {
        let text = serde_json::to_string(self)
            .map_err(|e| BridgeError::InvalidParams(format!("unserializable frame: {e}")))?;
        if text.len() > limit {
            return Err(BridgeError::FrameTooLarge { size: text.len(), limit });
        }
        Ok(text)
    }

    /// Parse an inbound frame, enforcing the size limit first.
    pub fn decode(text: &str, limit: usize) -> Result<Frame, BridgeError> {
        if text.len() > limit {
            return Err(BridgeError::FrameTooLarge { size: text.len(), limit });
        }
        serde_json::from_str(text)
            .map_err(|e| BridgeError::InvalidParams(format!("malformed frame: {e}")))
    }

    /// Required string param accessor for handlers.
    pub fn param_str(&self, key: &str) -> Result<String, BridgeError> {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BridgeError::InvalidParams(format!("missing string param '{key}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_underscore_fields_serialize_with_prefix() {
        let mut frame = Frame::new("progress");
        frame.from = Some("peer-a".into());
        frame.to = Some("peer-b".into());
        frame.broadcast = Some(true);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["_from"], "peer-a");
        assert_eq!(value["_to"], "peer-b");
        assert_eq!(value["_broadcast"], true);
        assert_eq!(value["type"], "progress");
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let frame = Frame::new("ping");
        let text = serde_json::to_string(&frame).unwrap();
        assert!(!text.contains("_from"));
        assert!(!text.contains("error"));
        assert!(!text.contains("result"));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let big = format!(r#"{{"type":"x","params":{{"blob":"{}"}}}}"#, "a".repeat(256));
        match Frame::decode(&big, 64) {
            Err(BridgeError::FrameTooLarge { size, limit }) => {
                assert!(size > limit);
                assert_eq!(limit, 64);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_error_reply_carries_type_and_correlation() {
        let mut request = Frame::request("tab.send_message", "req-7", json!({}));
        request.from = Some("client-1".into());
        let reply = Frame::error_to(&request, &BridgeError::ExtensionUnavailable);
        assert_eq!(reply.id.as_deref(), Some("req-7"));
        assert_eq!(reply.to.as_deref(), Some("client-1"));
        assert_eq!(reply.error_type.as_deref(), Some("ExtensionUnavailable"));
        assert_eq!(reply.frame_type, "tab.send_message");
    }

    #[test]
    fn test_round_trip_preserves_operation_params() {
        let frame = Frame::request(
            "register_operation",
            "1",
            json!({"operationId": "op_abc", "kind": "send_message"}),
        );
        let text = frame.encode(usize::MAX).unwrap();
        let back = Frame::decode(&text, usize::MAX).unwrap();
        assert_eq!(back.param_str("operationId").unwrap(), "op_abc");
    }
}
