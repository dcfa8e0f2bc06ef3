//! Milestone observer protocol
//!
//! The in-page observer speaks three verbs: `register_operation`,
//! `operation_milestone` and `operation_completed`. The operation id is
//! preserved verbatim in both directions; an unknown id is reported back
//! rather than silently created.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::BridgeError;
use crate::ops::manager::OperationManager;
use crate::ops::operation::{milestone, Operation, OperationKind};
use crate::relay::frame::{frame_type, Frame};

/// Parsed observer verb.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Register {
        operation_id: String,
        kind: OperationKind,
        params: Value,
    },
    Milestone {
        operation_id: String,
        name: String,
        data: Option<Value>,
    },
    Completed {
        operation_id: String,
        result: Value,
    },
}

impl ObserverEvent {
    pub fn operation_id(&self) -> &str {
        match self {
            ObserverEvent::Register { operation_id, .. }
            | ObserverEvent::Milestone { operation_id, .. }
            | ObserverEvent::Completed { operation_id, .. } => operation_id,
        }
    }

    /// Parse an observer frame arriving over the wire.
    pub fn from_frame(frame: &Frame) -> Result<Self, BridgeError> {
        let operation_id = frame.param_str("operationId")?;
        let params = frame.params.clone().unwrap_or(Value::Null);
        match frame.frame_type.as_str() {
            frame_type::REGISTER_OPERATION => {
                let kind = params
                    .get("kind")
                    .cloned()
                    .map(serde_json::from_value::<OperationKind>)
                    .transpose()
                    .map_err(|e| BridgeError::InvalidParams(format!("bad operation kind: {e}")))?
                    .unwrap_or(OperationKind::SendMessage);
                Ok(ObserverEvent::Register {
                    operation_id,
                    kind,
                    params: params.get("params").cloned().unwrap_or(Value::Null),
                })
            }
            frame_type::OPERATION_MILESTONE => Ok(ObserverEvent::Milestone {
                operation_id,
                name: frame.param_str("name")?,
                data: params.get("data").cloned(),
            }),
            frame_type::OPERATION_COMPLETED => Ok(ObserverEvent::Completed {
                operation_id,
                result: params.get("result").cloned().unwrap_or(Value::Null),
            }),
            other => Err(BridgeError::InvalidParams(format!("not an observer verb: {other}"))),
        }
    }
}

/// Apply one observer event to the operation manager.
///
/// `register_operation` is idempotent: an already-known id returns the
/// existing record untouched. `operation_completed` is the terminal
/// milestone plus completion in one step.
pub fn ingest(
    ops: &OperationManager,
    event: ObserverEvent,
    default_owner: &str,
) -> Result<Operation, BridgeError> {
    match event {
        ObserverEvent::Register { operation_id, kind, params } => {
            let tab_id = params.get("tabId").and_then(|v| v.as_i64());
            let op = ops.begin(kind, params, default_owner, tab_id, None, Some(operation_id));
            if !op.is_terminal() {
                ops.set_in_flight(&op.operation_id)?;
            }
            Ok(op)
        }
        ObserverEvent::Milestone { operation_id, name, data } => {
            ops.record_milestone(&operation_id, &name, data)
        }
        ObserverEvent::Completed { operation_id, result } => {
            ops.record_milestone(&operation_id, milestone::RESPONSE_COMPLETED, Some(result))
        }
    }
}

/// Drains in-process observer events (mock browser, simulated extension)
/// into the operation manager.
pub async fn run_pump(ops: Arc<OperationManager>, mut rx: mpsc::UnboundedReceiver<ObserverEvent>) {
    while let Some(event) = rx.recv().await {
        let id = event.operation_id().to_string();
        if let Err(e) = ingest(&ops, event, "extension") {
            warn!("[OBSERVER] Event for operation {} rejected: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::ops::operation::OperationState;
    use crate::ops::store::OperationStore;
    use serde_json::json;

    fn manager(dir: &tempfile::TempDir) -> Arc<OperationManager> {
        OperationManager::new(
            OperationStore::new(dir.path().join("ops.json")),
            &BridgeConfig::default(),
        )
    }

    #[test]
    fn test_register_is_idempotent_and_preserves_id() {
        let dir = tempfile::tempdir().unwrap();
        let ops = manager(&dir);

        let event = ObserverEvent::Register {
            operation_id: "op_exact-id-123".into(),
            kind: OperationKind::SendMessage,
            params: json!({"tabId": 7}),
        };
        let first = ingest(&ops, event.clone(), "extension").unwrap();
        assert_eq!(first.operation_id, "op_exact-id-123");
        assert_eq!(first.tab_id, Some(7));

        let second = ingest(&ops, event, "extension").unwrap();
        assert_eq!(second.operation_id, first.operation_id);
        assert_eq!(ops.get("op_exact-id-123").unwrap().state, OperationState::InFlight);
    }

    #[test]
    fn test_milestone_for_unknown_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ops = manager(&dir);
        let err = ingest(
            &ops,
            ObserverEvent::Milestone {
                operation_id: "op_ghost".into(),
                name: "message_sent".into(),
                data: None,
            },
            "extension",
        )
        .unwrap_err();
        assert_eq!(err.error_type(), "OperationNotFound");
    }

    #[test]
    fn test_completed_combines_milestone_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let ops = manager(&dir);
        let op = ops.begin(OperationKind::SendMessage, json!({}), "client-1", Some(2), None, None);

        let done = ingest(
            &ops,
            ObserverEvent::Completed {
                operation_id: op.operation_id.clone(),
                result: json!({"text": "answer"}),
            },
            "extension",
        )
        .unwrap();
        assert_eq!(done.state, OperationState::Completed);
        assert!(done.has_milestone(milestone::RESPONSE_COMPLETED));
        assert_eq!(done.result, Some(json!({"text": "answer"})));
    }

    #[test]
    fn test_frame_parsing_round_trip() {
        let frame = Frame::notification(
            frame_type::OPERATION_MILESTONE,
            json!({"operationId": "op_9", "name": "response_started", "data": {"chunk": 1}}),
        );
        match ObserverEvent::from_frame(&frame).unwrap() {
            ObserverEvent::Milestone { operation_id, name, data } => {
                assert_eq!(operation_id, "op_9");
                assert_eq!(name, "response_started");
                assert_eq!(data, Some(json!({"chunk": 1})));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_frame_missing_operation_id_is_invalid() {
        let frame = Frame::notification(frame_type::OPERATION_MILESTONE, json!({"name": "x"}));
        assert_eq!(
            ObserverEvent::from_frame(&frame).unwrap_err().error_type(),
            "InvalidParams"
        );
    }
}
