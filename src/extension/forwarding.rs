//! Response forwarding
//!
//! Reads the latest completed response from a source tab and dispatches it
//! as a new message on a target tab, optionally through a template. Every
//! step fails with its own error kind so callers can tell refusal, missing
//! observer, missing response and dispatch problems apart.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::error::BridgeError;
use crate::extension::commands::{
    opt_str, opt_u64, require_i64, send_message_op, ExtensionContext,
};
use crate::ops::operation::{ConflictGroup, OperationKind, OperationState};

pub fn validate(params: &Value) -> Result<(), BridgeError> {
    require_i64(params, "sourceTabId")?;
    require_i64(params, "targetTabId")?;
    if let Some(template) = opt_str(params, "transformTemplate") {
        if !template.contains("{response}") {
            return Err(BridgeError::InvalidParams(
                "transformTemplate must contain the '{response}' placeholder".into(),
            ));
        }
    }
    Ok(())
}

pub async fn run(
    ctx: &Arc<ExtensionContext>,
    origin: &str,
    params: &Value,
) -> Result<Value, BridgeError> {
    let source_tab = require_i64(params, "sourceTabId")?;
    let target_tab = require_i64(params, "targetTabId")?;
    let template = opt_str(params, "transformTemplate");
    let timeout_ms = opt_u64(params, "timeoutMs").unwrap_or(60_000);

    // step 1: never forward a tab's response back to itself
    if source_tab == target_tab {
        return Err(BridgeError::SelfForward(source_tab));
    }

    let forward_op = ctx.ops.begin(
        OperationKind::ForwardResponse,
        params.clone(),
        origin,
        Some(target_tab),
        None,
        None,
    );
    let forward_id = forward_op.operation_id.clone();

    let outcome = run_steps(ctx, origin, source_tab, target_tab, template, timeout_ms).await;
    match outcome {
        Ok(result) => {
            let _ = ctx.ops.complete(&forward_id, result.clone());
            let mut result = result;
            result["forwardOperationId"] = json!(forward_id);
            Ok(result)
        }
        Err(e) => {
            let _ = ctx.ops.fail(&forward_id, &e);
            Err(e)
        }
    }
}

async fn run_steps(
    ctx: &Arc<ExtensionContext>,
    origin: &str,
    source_tab: i64,
    target_tab: i64,
    template: Option<String>,
    timeout_ms: u64,
) -> Result<Value, BridgeError> {
    // step 2: the target tab must have the observer before we send into it
    ctx.tabs
        .ensure_observer(target_tab, ctx.caps.as_ref())
        .await
        .map_err(|_| BridgeError::ContentScriptMissing(target_tab))?;

    // step 3: read the latest completed response off the source tab.
    // Both tabs are locked in ascending id order for the read so neither
    // side can mutate underneath it.
    let lock_id = format!("forward-{}", uuid::Uuid::new_v4());
    let guards = ctx
        .tabs
        .acquire_many(&[source_tab, target_tab], &lock_id, ConflictGroup::Write, None)
        .await?;
    tracing::debug!(
        "[FORWARD] Holding tabs {:?} for the source read",
        guards.iter().map(|g| g.tab_id()).collect::<Vec<_>>()
    );
    let response = read_source_response(ctx, source_tab).await?;

    // step 4: optional template substitution
    let message = match template {
        Some(template) => template.replace("{response}", &response),
        None => response.clone(),
    };
    drop(guards);

    // step 5: dispatch as an async send on the target tab
    let dispatched =
        send_message_op(ctx, origin, target_tab, &message, None, false, timeout_ms).await?;

    info!(
        "[FORWARD] Tab {} response forwarded to tab {} as operation {}",
        source_tab, target_tab, dispatched["operationId"]
    );
    Ok(json!({
        "sourceTabId": source_tab,
        "targetTabId": target_tab,
        "message": message,
        "sendOperationId": dispatched["operationId"],
    }))
}

/// Caller holds the source-tab lock.
async fn read_source_response(
    ctx: &Arc<ExtensionContext>,
    source_tab: i64,
) -> Result<String, BridgeError> {
    // prefer the most recent completed operation's result text
    if let Some(op) = ctx.ops.latest_for_tab(source_tab) {
        if op.state == OperationState::Completed {
            if let Some(text) = op.result.as_ref().and_then(|r| r["text"].as_str()) {
                return Ok(text.to_string());
            }
        }
    }

    // otherwise read the page itself
    match ctx.caps.latest_response(source_tab).await {
        Ok(Some(text)) => Ok(text),
        Ok(None) => Err(BridgeError::NoCompletedResponse(source_tab)),
        Err(_) => Err(BridgeError::NoCompletedResponse(source_tab)),
    }
}
