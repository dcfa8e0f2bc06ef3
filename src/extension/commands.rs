//! Command dispatch
//!
//! Routed tool-request frames land here. Each tool name maps to a handler
//! record (validate + execute); results are always `{success: bool, ...}`
//! objects and errors never cross the router boundary as anything but a
//! structured result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::diagnostics::health;
use crate::diagnostics::logbuf::{self, DebugForwardSettings, LogRingBuffer};
use crate::error::BridgeError;
use crate::extension::capabilities::BrowserCapabilities;
use crate::extension::scheduler::AdaptiveScheduler;
use crate::extension::tabs::TabCoordinator;
use crate::extension::{conversations, forwarding};
use crate::ops::manager::OperationManager;
use crate::ops::operation::{ConflictGroup, OperationKind, OperationState};
use crate::relay::frame::Frame;

/// Default wait budget for synchronous sends and response reads.
const DEFAULT_WAIT_MS: u64 = 60_000;

/// Transient capability failures (debugger attach) are retried this many
/// times with a short backoff before surfacing.
const ATTACH_RETRIES: u32 = 3;

/// Everything a handler needs, shared across the extension side.
pub struct ExtensionContext {
    pub caps: Arc<dyn BrowserCapabilities>,
    pub tabs: Arc<TabCoordinator>,
    pub ops: Arc<OperationManager>,
    pub scheduler: Arc<AdaptiveScheduler>,
    pub logbuf: Arc<LogRingBuffer>,
    pub debug_settings: Arc<Mutex<DebugForwardSettings>>,
    /// Last relay view received over `_client_list_update` / health.
    pub relay_info: Mutex<Value>,
}

impl ExtensionContext {
    pub fn new(
        caps: Arc<dyn BrowserCapabilities>,
        tabs: Arc<TabCoordinator>,
        ops: Arc<OperationManager>,
        logbuf: Arc<LogRingBuffer>,
        config: &BridgeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            caps,
            tabs,
            ops,
            scheduler: Arc::new(AdaptiveScheduler::new(config)),
            logbuf,
            debug_settings: Arc::new(Mutex::new(DebugForwardSettings {
                enabled: config.debug_mode,
                batch_ms: 1_000,
                ..Default::default()
            })),
            relay_info: Mutex::new(json!({"connected": false})),
        })
    }
}

pub struct CommandInput {
    pub origin: String,
    pub params: Value,
}

type ValidateFn = fn(&Value) -> Result<(), BridgeError>;
type ExecuteFn =
    fn(Arc<ExtensionContext>, CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>>;

pub struct Handler {
    pub validate: ValidateFn,
    pub execute: ExecuteFn,
}

pub struct CommandRouter {
    handlers: HashMap<&'static str, Handler>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();

        // system family
        handlers.insert("system.health", Handler { validate: v_none, execute: h_health });
        handlers.insert(
            "system.wait_operation",
            Handler { validate: v_wait_operation, execute: h_wait_operation },
        );
        handlers.insert("system.get_logs", Handler { validate: v_none, execute: h_get_logs });
        handlers.insert(
            "system.set_log_level",
            Handler { validate: v_set_log_level, execute: h_set_log_level },
        );
        handlers.insert(
            "system.enable_debug_mode",
            Handler { validate: v_none, execute: h_enable_debug_mode },
        );
        handlers.insert(
            "system.disable_debug_mode",
            Handler { validate: v_none, execute: h_disable_debug_mode },
        );

        // browser control family
        handlers.insert(
            "browser.reload_extension",
            Handler { validate: v_none, execute: h_reload_extension },
        );
        handlers.insert("browser.debug_attach", Handler { validate: v_tab_id, execute: h_debug_attach });
        handlers.insert("browser.debug_detach", Handler { validate: v_tab_id, execute: h_debug_detach });
        handlers.insert("browser.debug_status", Handler { validate: v_tab_id, execute: h_debug_status });
        handlers.insert(
            "browser.execute_script",
            Handler { validate: v_execute_script, execute: h_execute_script },
        );
        handlers.insert(
            "browser.get_dom_elements",
            Handler { validate: v_selector, execute: h_get_dom_elements },
        );
        handlers.insert(
            "browser.start_network_monitoring",
            Handler { validate: v_tab_id, execute: h_start_monitoring },
        );
        handlers.insert(
            "browser.stop_network_monitoring",
            Handler { validate: v_tab_id, execute: h_stop_monitoring },
        );
        handlers.insert(
            "browser.get_network_requests",
            Handler { validate: v_tab_id, execute: h_get_network_requests },
        );

        // tab family
        handlers.insert("tab.create", Handler { validate: v_none, execute: h_tab_create });
        handlers.insert("tab.list", Handler { validate: v_none, execute: h_tab_list });
        handlers.insert("tab.close", Handler { validate: v_tab_id, execute: h_tab_close });
        handlers.insert("tab.send_message", Handler { validate: v_send_message, execute: h_send_message });
        handlers.insert("tab.get_response", Handler { validate: v_tab_id, execute: h_get_response });
        handlers.insert(
            "tab.get_response_status",
            Handler { validate: v_none, execute: h_get_response_status },
        );
        handlers.insert(
            "tab.forward_response",
            Handler { validate: forwarding::validate, execute: h_forward_response },
        );
        handlers.insert(
            "tab.extract_elements",
            Handler { validate: v_selector, execute: h_extract_elements },
        );
        handlers.insert(
            "tab.export_conversation",
            Handler { validate: v_tab_id, execute: h_export_conversation },
        );
        handlers.insert("tab.debug_page", Handler { validate: v_tab_id, execute: h_debug_page });
        handlers.insert(
            "tab.batch_operations",
            Handler { validate: v_batch, execute: h_batch_operations },
        );

        // conversation API family
        handlers.insert("conversation.list", Handler { validate: v_none, execute: conversations::h_list });
        handlers.insert(
            "conversation.search",
            Handler { validate: conversations::v_search, execute: conversations::h_search },
        );
        handlers.insert(
            "conversation.get_metadata",
            Handler { validate: conversations::v_conversation_id, execute: conversations::h_get_metadata },
        );
        handlers.insert(
            "conversation.get_url",
            Handler { validate: conversations::v_conversation_id, execute: conversations::h_get_url },
        );
        handlers.insert(
            "conversation.delete",
            Handler { validate: conversations::v_delete, execute: conversations::h_delete },
        );

        Self { handlers }
    }

    pub fn knows(&self, tool: &str) -> bool {
        self.handlers.contains_key(tool)
    }

    /// Execute a routed tool frame and build its response frame. Never
    /// returns an error: failures become `{success: false, ...}` results.
    pub async fn dispatch(&self, ctx: Arc<ExtensionContext>, frame: &Frame) -> Frame {
        ctx.scheduler.note_activity();
        let result = self.execute(ctx, frame).await;
        let body = match result {
            Ok(mut value) => {
                if value.get("success").is_none() {
                    value["success"] = json!(true);
                }
                value
            }
            Err(e) => {
                warn!("[COMMANDS] {} failed: {}", frame.frame_type, e);
                json!({
                    "success": false,
                    "error": e.to_string(),
                    "errorType": e.error_type(),
                    "retryable": e.retryable(),
                })
            }
        };
        Frame::response_to(frame, body)
    }

    async fn execute(
        &self,
        ctx: Arc<ExtensionContext>,
        frame: &Frame,
    ) -> Result<Value, BridgeError> {
        let handler = self
            .handlers
            .get(frame.frame_type.as_str())
            .ok_or_else(|| BridgeError::InvalidParams(format!("unknown tool '{}'", frame.frame_type)))?;

        let params = frame.params.clone().unwrap_or_else(|| json!({}));
        (handler.validate)(&params)?;

        let input = CommandInput {
            origin: frame.from.clone().unwrap_or_else(|| "local".to_string()),
            params,
        };
        (handler.execute)(ctx, input).await
    }
}

// ---------------------------------------------------------------------------
// Param helpers
// ---------------------------------------------------------------------------

pub fn require_i64(params: &Value, key: &str) -> Result<i64, BridgeError> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| BridgeError::InvalidParams(format!("missing integer param '{key}'")))
}

pub fn require_str(params: &Value, key: &str) -> Result<String, BridgeError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| BridgeError::InvalidParams(format!("missing string param '{key}'")))
}

pub fn opt_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub fn opt_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(|v| v.as_u64())
}

pub fn opt_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

fn v_none(_params: &Value) -> Result<(), BridgeError> {
    Ok(())
}

fn v_tab_id(params: &Value) -> Result<(), BridgeError> {
    require_i64(params, "tabId").map(|_| ())
}

fn v_wait_operation(params: &Value) -> Result<(), BridgeError> {
    require_str(params, "operationId").map(|_| ())
}

fn v_set_log_level(params: &Value) -> Result<(), BridgeError> {
    let level = require_str(params, "level")?;
    logbuf::level_rank(&level)
        .map(|_| ())
        .ok_or_else(|| BridgeError::InvalidParams(format!("unknown log level '{level}'")))
}

fn v_execute_script(params: &Value) -> Result<(), BridgeError> {
    require_i64(params, "tabId")?;
    require_str(params, "script").map(|_| ())
}

fn v_selector(params: &Value) -> Result<(), BridgeError> {
    require_i64(params, "tabId")?;
    require_str(params, "selector").map(|_| ())
}

fn v_send_message(params: &Value) -> Result<(), BridgeError> {
    require_i64(params, "tabId")?;
    require_str(params, "message").map(|_| ())
}

fn v_batch(params: &Value) -> Result<(), BridgeError> {
    let op = require_str(params, "operation")?;
    if !matches!(op.as_str(), "send_messages" | "get_responses" | "send_and_get") {
        return Err(BridgeError::InvalidParams(format!("unknown batch operation '{op}'")));
    }
    params
        .get("items")
        .and_then(|v| v.as_array())
        .filter(|items| !items.is_empty())
        .map(|_| ())
        .ok_or_else(|| BridgeError::InvalidParams("missing non-empty array param 'items'".into()))
}

// ---------------------------------------------------------------------------
// System handlers
// ---------------------------------------------------------------------------

fn h_health(ctx: Arc<ExtensionContext>, _input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let relay = ctx.relay_info.lock().clone();
        Ok(health::full_report(relay, &ctx.tabs))
    })
}

fn h_wait_operation(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let operation_id = require_str(&input.params, "operationId")?;
        let timeout_ms = opt_u64(&input.params, "timeoutMs").unwrap_or(DEFAULT_WAIT_MS);
        let op = ctx.ops.wait(&operation_id, timeout_ms).await?;
        Ok(operation_result(&op))
    })
}

fn h_get_logs(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let level = opt_str(&input.params, "level");
        let component = opt_str(&input.params, "component");
        let since = opt_u64(&input.params, "since");
        let limit = opt_u64(&input.params, "limit").unwrap_or(100).min(1_000) as usize;
        let logs = ctx.logbuf.filtered(level.as_deref(), component.as_deref(), since, limit);
        let count = logs.len();
        Ok(json!({"logs": logs, "count": count, "bufferSize": ctx.logbuf.len()}))
    })
}

fn h_set_log_level(_ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let level = require_str(&input.params, "level")?;
        logbuf::set_min_level(&level).map_err(BridgeError::InvalidParams)?;
        info!("[COMMANDS] Log capture level set to {}", level);
        Ok(json!({"level": level}))
    })
}

fn h_enable_debug_mode(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let components = input.params.get("components").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        });
        let mut settings = ctx.debug_settings.lock();
        settings.enabled = true;
        settings.components = components;
        settings.error_only = opt_bool(&input.params, "errorOnly").unwrap_or(false);
        settings.target_peer = Some(input.origin.clone());
        if let Some(batch_ms) = opt_u64(&input.params, "batchMs") {
            settings.batch_ms = batch_ms.max(100);
        }
        info!("[COMMANDS] Debug mode enabled, forwarding to {}", input.origin);
        Ok(json!({"enabled": true, "targetPeer": input.origin}))
    })
}

fn h_disable_debug_mode(ctx: Arc<ExtensionContext>, _input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let mut settings = ctx.debug_settings.lock();
        settings.enabled = false;
        settings.target_peer = None;
        Ok(json!({"enabled": false}))
    })
}

// ---------------------------------------------------------------------------
// Browser control handlers
// ---------------------------------------------------------------------------

fn h_reload_extension(ctx: Arc<ExtensionContext>, _input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        ctx.caps.reload_runtime().await?;
        Ok(json!({"reloaded": true}))
    })
}

fn h_debug_attach(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let outcome = attach_with_retry(&ctx, tab_id).await?;
        Ok(json!({
            "tabId": tab_id,
            "alreadyAttached": outcome.already_attached,
            "adoptedExternal": outcome.adopted_external,
        }))
    })
}

fn h_debug_detach(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let detached = ctx.tabs.detach_debugger(tab_id, ctx.caps.as_ref()).await?;
        Ok(json!({"tabId": tab_id, "detached": detached}))
    })
}

fn h_debug_status(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let (attached, owner) = ctx.tabs.debugger_status(tab_id);
        let functional = ctx.caps.debugger_functional(tab_id).await.unwrap_or(false);
        Ok(json!({
            "tabId": tab_id,
            "attached": attached,
            "owner": owner,
            "functional": functional,
        }))
    })
}

fn h_execute_script(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let script = require_str(&input.params, "script")?;
        let lock_id = format!("script-{}", uuid::Uuid::new_v4());
        let _guard = ctx
            .tabs
            .acquire(tab_id, &lock_id, ConflictGroup::Write, opt_u64(&input.params, "lockTimeoutMs"))
            .await?;
        let result = ctx.caps.execute_script(tab_id, &script).await?;
        Ok(json!({"tabId": tab_id, "result": result}))
    })
}

fn h_get_dom_elements(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let selector = require_str(&input.params, "selector")?;
        let lock_id = format!("dom-{}", uuid::Uuid::new_v4());
        let _guard = ctx
            .tabs
            .acquire(tab_id, &lock_id, ConflictGroup::ReadOnly, opt_u64(&input.params, "lockTimeoutMs"))
            .await?;
        let elements = ctx.caps.query_dom(tab_id, &selector).await?;
        Ok(json!({"tabId": tab_id, "elements": elements}))
    })
}

fn h_start_monitoring(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        ctx.tabs.start_monitoring(tab_id, ctx.caps.as_ref()).await?;
        Ok(json!({"tabId": tab_id, "monitoring": true}))
    })
}

fn h_stop_monitoring(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        ctx.tabs.stop_monitoring(tab_id, ctx.caps.as_ref()).await?;
        Ok(json!({"tabId": tab_id, "monitoring": false}))
    })
}

fn h_get_network_requests(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let mut requests = ctx.caps.network_events(tab_id).await?;
        requests.extend(ctx.tabs.captured(tab_id));
        Ok(json!({"tabId": tab_id, "requests": requests, "count": requests.len()}))
    })
}

// ---------------------------------------------------------------------------
// Tab handlers
// ---------------------------------------------------------------------------

fn h_tab_create(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let url = opt_str(&input.params, "url");
        let tab_id = ctx.caps.create_tab(url.as_deref()).await?;
        Ok(json!({"tabId": tab_id}))
    })
}

fn h_tab_list(ctx: Arc<ExtensionContext>, _input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tabs = ctx.caps.list_tabs().await?;
        Ok(json!({"tabs": tabs, "count": tabs.len()}))
    })
}

fn h_tab_close(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let report = ctx.tabs.cleanup(tab_id, true, ctx.caps.as_ref()).await;
        Ok(json!({"tabId": tab_id, "cleanup": report}))
    })
}

fn h_send_message(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let message = require_str(&input.params, "message")?;
        let wait_for_completion = opt_bool(&input.params, "waitForCompletion").unwrap_or(true);
        let timeout_ms = opt_u64(&input.params, "timeoutMs").unwrap_or(DEFAULT_WAIT_MS);
        send_message_op(
            &ctx,
            &input.origin,
            tab_id,
            &message,
            opt_str(&input.params, "operationId"),
            wait_for_completion,
            timeout_ms,
        )
        .await
    })
}

fn h_get_response(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let timeout_ms = opt_u64(&input.params, "timeoutMs").unwrap_or(DEFAULT_WAIT_MS);

        if let Some(operation_id) = opt_str(&input.params, "operationId") {
            let op = ctx.ops.wait(&operation_id, timeout_ms).await?;
            return Ok(operation_result(&op));
        }
        get_response_op(&ctx, &input.origin, tab_id, timeout_ms).await
    })
}

fn h_get_response_status(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        if let Some(operation_id) = opt_str(&input.params, "operationId") {
            let op = ctx
                .ops
                .get(&operation_id)
                .ok_or(BridgeError::OperationNotFound(operation_id))?;
            return Ok(status_result(&op));
        }
        let tab_id = require_i64(&input.params, "tabId")?;
        match ctx.ops.latest_for_tab(tab_id) {
            Some(op) => Ok(status_result(&op)),
            None => Ok(json!({"tabId": tab_id, "state": "none"})),
        }
    })
}

fn h_forward_response(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move { forwarding::run(&ctx, &input.origin, &input.params).await })
}

fn h_extract_elements(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let selector = require_str(&input.params, "selector")?;
        let lock_id = format!("extract-{}", uuid::Uuid::new_v4());
        let _guard = ctx
            .tabs
            .acquire(tab_id, &lock_id, ConflictGroup::ReadOnly, opt_u64(&input.params, "lockTimeoutMs"))
            .await?;
        let elements = ctx.caps.query_dom(tab_id, &selector).await?;
        Ok(json!({"tabId": tab_id, "elements": elements}))
    })
}

fn h_export_conversation(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let lock_id = format!("export-{}", uuid::Uuid::new_v4());
        let _guard = ctx
            .tabs
            .acquire(tab_id, &lock_id, ConflictGroup::ReadOnly, opt_u64(&input.params, "lockTimeoutMs"))
            .await?;
        let conversation = ctx.caps.export_conversation(tab_id).await?;
        Ok(json!({"tabId": tab_id, "conversation": conversation}))
    })
}

fn h_debug_page(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let tab_id = require_i64(&input.params, "tabId")?;
        let view = ctx.tabs.snapshot().into_iter().find(|v| v.tab_id == tab_id);
        let descriptor = ctx
            .caps
            .list_tabs()
            .await?
            .into_iter()
            .find(|t| t.id == tab_id);
        let latest = ctx.caps.latest_response(tab_id).await.ok().flatten();
        Ok(json!({
            "tabId": tab_id,
            "tab": descriptor,
            "coordinator": view,
            "observerInjected": ctx.tabs.observer_injected(tab_id),
            "latestResponsePresent": latest.is_some(),
            "latestOperation": ctx.ops.latest_for_tab(tab_id).map(|op| operation_result(&op)),
        }))
    })
}

fn h_batch_operations(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let operation = require_str(&input.params, "operation")?;
        let sequential = opt_bool(&input.params, "sequential").unwrap_or(false);
        let delay_ms = opt_u64(&input.params, "delayMs").unwrap_or(0);
        let timeout_ms = opt_u64(&input.params, "timeoutMs").unwrap_or(DEFAULT_WAIT_MS);
        let items = input
            .params
            .get("items")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        // the batch itself is tracked as a compound operation
        let batch_op = ctx.ops.begin(
            OperationKind::Compound,
            input.params.clone(),
            &input.origin,
            None,
            None,
            None,
        );
        ctx.ops.set_in_flight(&batch_op.operation_id)?;

        let mut results = Vec::with_capacity(items.len());
        if sequential {
            for (index, item) in items.iter().enumerate() {
                if index > 0 && delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                results.push(batch_item(&ctx, &input.origin, &operation, item, timeout_ms).await);
            }
        } else {
            // parallel execution relies on independent per-tab locks
            let futures = items
                .iter()
                .map(|item| batch_item(&ctx, &input.origin, &operation, item, timeout_ms));
            results = futures_util::future::join_all(futures).await;
        }

        let succeeded = results.iter().filter(|r| r["success"] == json!(true)).count();
        let total = results.len();
        let summary = json!({
            "operation": operation,
            "operationId": batch_op.operation_id,
            "results": results,
            "total": total,
            "succeeded": succeeded,
        });
        let _ = ctx.ops.complete(&batch_op.operation_id, summary.clone());
        Ok(summary)
    })
}

async fn batch_item(
    ctx: &Arc<ExtensionContext>,
    origin: &str,
    operation: &str,
    item: &Value,
    timeout_ms: u64,
) -> Value {
    let outcome = async {
        let tab_id = require_i64(item, "tabId")?;
        match operation {
            "send_messages" => {
                let message = require_str(item, "message")?;
                send_message_op(ctx, origin, tab_id, &message, None, false, timeout_ms).await
            }
            "get_responses" => get_response_op(ctx, origin, tab_id, timeout_ms).await,
            "send_and_get" => {
                let message = require_str(item, "message")?;
                send_message_op(ctx, origin, tab_id, &message, None, true, timeout_ms).await
            }
            other => Err(BridgeError::InvalidParams(format!("unknown batch operation '{other}'"))),
        }
    }
    .await;

    match outcome {
        Ok(mut value) => {
            if value.get("success").is_none() {
                value["success"] = json!(true);
            }
            value
        }
        Err(e) => json!({
            "success": false,
            "error": e.to_string(),
            "errorType": e.error_type(),
            "retryable": e.retryable(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Shared operation flows
// ---------------------------------------------------------------------------

/// Status view without waiting: milestone flags on top of the usual shape.
fn status_result(op: &crate::ops::operation::Operation) -> Value {
    let mut value = operation_result(op);
    value["messageSent"] = json!(op.has_milestone(crate::ops::operation::milestone::MESSAGE_SENT));
    value["responseStarted"] =
        json!(op.has_milestone(crate::ops::operation::milestone::RESPONSE_STARTED));
    value
}

/// Serialized operation view used in tool results.
pub fn operation_result(op: &crate::ops::operation::Operation) -> Value {
    let mut value = json!({
        "success": op.state == OperationState::Completed || !op.is_terminal(),
        "operationId": op.operation_id,
        "state": op.state,
        "milestones": op.milestones,
    });
    if let Some(result) = &op.result {
        value["result"] = result.clone();
    }
    if let Some(error) = &op.error {
        value["error"] = json!(error);
    }
    if let Some(tab_id) = op.tab_id {
        value["tabId"] = json!(tab_id);
    }
    value
}

/// The send-message operation flow, shared by the tool handler, batching
/// and forwarding: begin (unified id), acquire the tab write lock, make
/// sure the observer is in place, submit through the capability, then
/// either wait for the terminal state or hold the lock in the background
/// until the operation settles.
pub async fn send_message_op(
    ctx: &Arc<ExtensionContext>,
    origin: &str,
    tab_id: i64,
    message: &str,
    requested_id: Option<String>,
    wait_for_completion: bool,
    timeout_ms: u64,
) -> Result<Value, BridgeError> {
    let op = ctx.ops.begin(
        OperationKind::SendMessage,
        json!({"tabId": tab_id, "message": message}),
        origin,
        Some(tab_id),
        None,
        requested_id,
    );
    if op.state != OperationState::Registered {
        // duplicate submission of an already-known operation id
        return Ok(operation_result(&op));
    }
    let operation_id = op.operation_id.clone();

    let guard = match ctx
        .tabs
        .acquire(tab_id, &operation_id, ConflictGroup::Write, Some(timeout_ms.min(ctx.tabs.default_lock_timeout_ms())))
        .await
    {
        Ok(guard) => guard,
        Err(e) => {
            let _ = ctx.ops.fail(&operation_id, &e);
            return Err(e);
        }
    };

    if let Err(e) = ctx.tabs.ensure_observer(tab_id, ctx.caps.as_ref()).await {
        let _ = ctx.ops.fail(&operation_id, &e);
        return Err(e);
    }

    ctx.ops.set_in_flight(&operation_id)?;
    if let Err(e) = ctx.caps.send_chat_message(tab_id, &operation_id, message).await {
        let _ = ctx.ops.fail(&operation_id, &e);
        return Err(e);
    }

    if wait_for_completion {
        match ctx.ops.wait(&operation_id, timeout_ms).await {
            Ok(op) => {
                guard.release();
                return Ok(operation_result(&op));
            }
            Err(e) => {
                // the wait gave up but the browser action may still be
                // running; keep the tab held until the operation settles
                hold_until_settled(ctx, guard, operation_id, timeout_ms);
                return Err(e);
            }
        }
    }

    // async mode: the write lock stays held until the operation settles so
    // another send cannot interleave DOM mutations mid-response
    let current = ctx.ops.get(&operation_id).unwrap_or_else(|| op.clone());
    hold_until_settled(ctx, guard, operation_id, timeout_ms.max(op.deadline.saturating_sub(op.created_at)));
    Ok(operation_result(&current))
}

/// Park a held tab lock on a background task until the operation reaches
/// a terminal state (or the hold budget runs out).
fn hold_until_settled(
    ctx: &Arc<ExtensionContext>,
    guard: crate::extension::tabs::TabLockGuard,
    operation_id: String,
    budget_ms: u64,
) {
    let ops = Arc::clone(&ctx.ops);
    tokio::spawn(async move {
        let _guard = guard;
        let _ = ops.wait(&operation_id, budget_ms).await;
    });
}

/// The get-response flow: wait out any in-flight operation on the tab,
/// otherwise read the latest completed response under a readonly lock.
pub async fn get_response_op(
    ctx: &Arc<ExtensionContext>,
    origin: &str,
    tab_id: i64,
    timeout_ms: u64,
) -> Result<Value, BridgeError> {
    if let Some(latest) = ctx.ops.latest_for_tab(tab_id) {
        if !latest.is_terminal() {
            let op = ctx.ops.wait(&latest.operation_id, timeout_ms).await?;
            return Ok(operation_result(&op));
        }
        if latest.state == OperationState::Completed && latest.result.is_some() {
            return Ok(operation_result(&latest));
        }
    }

    let op = ctx.ops.begin(
        OperationKind::GetResponse,
        json!({"tabId": tab_id}),
        origin,
        Some(tab_id),
        None,
        None,
    );
    let operation_id = op.operation_id.clone();
    let _guard = ctx
        .tabs
        .acquire(tab_id, &operation_id, ConflictGroup::ReadOnly, Some(timeout_ms))
        .await
        .map_err(|e| {
            let _ = ctx.ops.fail(&operation_id, &e);
            e
        })?;
    ctx.ops.set_in_flight(&operation_id)?;

    match ctx.caps.latest_response(tab_id).await {
        Ok(Some(text)) => {
            let op = ctx
                .ops
                .complete(&operation_id, json!({"text": text, "tabId": tab_id}))?;
            Ok(operation_result(&op))
        }
        Ok(None) => {
            let e = BridgeError::NoCompletedResponse(tab_id);
            let _ = ctx.ops.fail(&operation_id, &e);
            Err(e)
        }
        Err(e) => {
            let _ = ctx.ops.fail(&operation_id, &e);
            Err(e)
        }
    }
}

/// Debugger attach with bounded retries for transient capability errors.
async fn attach_with_retry(
    ctx: &Arc<ExtensionContext>,
    tab_id: i64,
) -> Result<crate::extension::capabilities::AttachOutcome, BridgeError> {
    let mut last_err = None;
    for attempt in 1..=ATTACH_RETRIES {
        match ctx.tabs.attach_debugger(tab_id, ctx.caps.as_ref()).await {
            Ok(outcome) => return Ok(outcome),
            Err(e @ BridgeError::Capability(_)) => {
                warn!("[COMMANDS] debug_attach tab {} attempt {}/{} failed: {}", tab_id, attempt, ATTACH_RETRIES, e);
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| BridgeError::Capability("attach failed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::logbuf::DEFAULT_LOG_CAPACITY;
    use crate::extension::capabilities::MockBrowser;
    use crate::extension::observer;
    use crate::ops::store::OperationStore;
    use tokio::sync::mpsc;

    struct Fixture {
        ctx: Arc<ExtensionContext>,
        router: CommandRouter,
        browser: MockBrowser,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::default();
        let browser = MockBrowser::new();
        let ops = OperationManager::new(
            OperationStore::new(dir.path().join("ops.json")),
            &config,
        );

        // wire the mock's observer events straight into the manager
        let (tx, rx) = mpsc::unbounded_channel();
        browser.set_observer_channel(tx);
        tokio::spawn(observer::run_pump(Arc::clone(&ops), rx));

        let ctx = ExtensionContext::new(
            Arc::new(browser.clone()),
            TabCoordinator::new(config.lock_timeout_ms),
            ops,
            LogRingBuffer::new(DEFAULT_LOG_CAPACITY),
            &config,
        );
        Fixture { ctx, router: CommandRouter::new(), browser, _dir: dir }
    }

    async fn call(f: &Fixture, tool: &str, params: Value) -> Value {
        let mut frame = Frame::request(tool, "t1", params);
        frame.from = Some("client-1".into());
        let reply = f.router.dispatch(Arc::clone(&f.ctx), &frame).await;
        reply.result.unwrap()
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_params() {
        let f = fixture();
        let result = call(&f, "tab.frobnicate", json!({})).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["errorType"], "InvalidParams");
    }

    #[tokio::test]
    async fn test_validation_failure_is_structured() {
        let f = fixture();
        let result = call(&f, "tab.send_message", json!({"tabId": 1})).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["errorType"], "InvalidParams");
        assert!(result["error"].as_str().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn test_send_message_sync_completes_with_milestones() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();

        let result = call(
            &f,
            "tab.send_message",
            json!({"tabId": tab, "message": "hello", "waitForCompletion": true}),
        )
        .await;

        assert_eq!(result["success"], true);
        assert_eq!(result["state"], "completed");
        assert!(result["operationId"].as_str().unwrap().starts_with("op_"));
        let names: Vec<&str> = result["milestones"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"message_sent"));
        assert_eq!(*names.last().unwrap(), "response_completed");
        assert!(result["result"]["text"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_send_message_async_then_wait_operation() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        // slow the scripted response so the async submit observably
        // returns before completion
        f.browser.set_response_delay_ms(100);

        let submitted = call(
            &f,
            "tab.send_message",
            json!({"tabId": tab, "message": "async hi", "waitForCompletion": false}),
        )
        .await;
        assert_eq!(submitted["success"], true);
        let operation_id = submitted["operationId"].as_str().unwrap().to_string();
        assert_ne!(submitted["state"], "completed");

        let waited = call(
            &f,
            "system.wait_operation",
            json!({"operationId": operation_id, "timeoutMs": 5_000}),
        )
        .await;
        assert_eq!(waited["success"], true);
        assert_eq!(waited["state"], "completed");
        assert_eq!(waited["operationId"], operation_id.as_str());
    }

    #[tokio::test]
    async fn test_client_supplied_operation_id_is_preserved() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        let result = call(
            &f,
            "tab.send_message",
            json!({
                "tabId": tab,
                "message": "hi",
                "operationId": "op_client_supplied_42",
                "waitForCompletion": true,
            }),
        )
        .await;
        assert_eq!(result["operationId"], "op_client_supplied_42");
        // the mock observer reported milestones against the same id
        assert!(f.ctx.ops.get("op_client_supplied_42").unwrap().has_milestone("message_sent"));
    }

    #[tokio::test]
    async fn test_concurrent_sends_on_same_tab_serialize() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();

        let first = tokio::spawn({
            let ctx = Arc::clone(&f.ctx);
            async move {
                send_message_op(&ctx, "client-1", tab, "one", None, true, 5_000).await
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = tokio::spawn({
            let ctx = Arc::clone(&f.ctx);
            async move {
                send_message_op(&ctx, "client-1", tab, "two", None, true, 5_000).await
            }
        });

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first["state"], "completed");
        assert_eq!(second["state"], "completed");

        // no interleaving: both messages went through, in order
        let sent = f.browser.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, "one");
        assert_eq!(sent[1].1, "two");
    }

    #[tokio::test]
    async fn test_get_response_returns_latest_completed() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        call(&f, "tab.send_message", json!({"tabId": tab, "message": "q"})).await;

        let response = call(&f, "tab.get_response", json!({"tabId": tab})).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["state"], "completed");
        assert!(response["result"]["text"].as_str().unwrap().contains("q"));
    }

    #[tokio::test]
    async fn test_get_response_without_any_response_fails() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        let response = call(&f, "tab.get_response", json!({"tabId": tab})).await;
        assert_eq!(response["success"], false);
        assert_eq!(response["errorType"], "NoCompletedResponse");
    }

    #[tokio::test]
    async fn test_debug_attach_retries_transient_failures() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        f.browser.inject_attach_failures(2);

        let result = call(&f, "browser.debug_attach", json!({"tabId": tab})).await;
        assert_eq!(result["success"], true);
        assert_eq!(result["alreadyAttached"], false);

        // attach again: idempotent
        let again = call(&f, "browser.debug_attach", json!({"tabId": tab})).await;
        assert_eq!(again["alreadyAttached"], true);
    }

    #[tokio::test]
    async fn test_batch_send_and_get_parallel() {
        let f = fixture();
        let tab_a = f.browser.create_tab(None).await.unwrap();
        let tab_b = f.browser.create_tab(None).await.unwrap();

        let result = call(
            &f,
            "tab.batch_operations",
            json!({
                "operation": "send_and_get",
                "items": [
                    {"tabId": tab_a, "message": "to a"},
                    {"tabId": tab_b, "message": "to b"},
                ],
                "sequential": false,
            }),
        )
        .await;

        assert_eq!(result["success"], true);
        assert_eq!(result["total"], 2);
        assert_eq!(result["succeeded"], 2);
    }

    #[tokio::test]
    async fn test_batch_rejects_unknown_operation() {
        let f = fixture();
        let result = call(
            &f,
            "tab.batch_operations",
            json!({"operation": "explode", "items": [{"tabId": 1}]}),
        )
        .await;
        assert_eq!(result["success"], false);
        assert_eq!(result["errorType"], "InvalidParams");
    }

    #[tokio::test]
    async fn test_network_monitoring_round_trip() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();

        let started = call(&f, "browser.start_network_monitoring", json!({"tabId": tab})).await;
        assert_eq!(started["monitoring"], true);

        // events seen by the capability layer and by the coordinator both
        // surface through get_network_requests
        f.browser.record_network_event(tab, json!({"url": "https://chat.example.com/api"}));
        f.ctx.tabs.capture(tab, json!({"url": "wss://chat.example.com/stream"}));

        let requests = call(&f, "browser.get_network_requests", json!({"tabId": tab})).await;
        assert_eq!(requests["count"], 2);

        let stopped = call(&f, "browser.stop_network_monitoring", json!({"tabId": tab})).await;
        assert_eq!(stopped["monitoring"], false);
    }

    #[tokio::test]
    async fn test_get_response_status_reports_milestones() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        call(&f, "tab.send_message", json!({"tabId": tab, "message": "q"})).await;

        let status = call(&f, "tab.get_response_status", json!({"tabId": tab})).await;
        assert_eq!(status["state"], "completed");
        assert_eq!(status["messageSent"], true);
        assert_eq!(status["responseStarted"], true);

        let none = call(&f, "tab.get_response_status", json!({"tabId": tab + 1})).await;
        assert_eq!(none["state"], "none");
    }

    #[tokio::test]
    async fn test_get_logs_filters() {
        let f = fixture();
        f.ctx.logbuf.push(crate::diagnostics::logbuf::LogRecord {
            timestamp: crate::util::unix_ms(),
            level: "error".into(),
            component: "relay".into(),
            message: "boom".into(),
            data: None,
        });
        let result = call(&f, "system.get_logs", json!({"level": "error"})).await;
        assert_eq!(result["count"], 1);
        assert_eq!(result["logs"][0]["message"], "boom");
    }

    #[tokio::test]
    async fn test_debug_mode_round_trip() {
        let f = fixture();
        let enabled = call(
            &f,
            "system.enable_debug_mode",
            json!({"components": ["relay"], "errorOnly": true}),
        )
        .await;
        assert_eq!(enabled["enabled"], true);
        {
            let settings = f.ctx.debug_settings.lock();
            assert!(settings.enabled);
            assert!(settings.error_only);
            assert_eq!(settings.target_peer.as_deref(), Some("client-1"));
        }
        let disabled = call(&f, "system.disable_debug_mode", json!({})).await;
        assert_eq!(disabled["enabled"], false);
    }

    #[tokio::test]
    async fn test_health_tool_reports_tab_state() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        call(&f, "browser.debug_attach", json!({"tabId": tab})).await;
        call(&f, "browser.start_network_monitoring", json!({"tabId": tab})).await;

        let report = call(&f, "system.health", json!({})).await;
        assert_eq!(report["success"], true);
        assert_eq!(report["debuggerSessions"][0]["tabId"], tab);
        assert_eq!(report["networkMonitorTabs"][0], tab);
    }

    #[tokio::test]
    async fn test_tab_close_runs_cleanup() {
        let f = fixture();
        let tab = f.browser.create_tab(None).await.unwrap();
        call(&f, "browser.debug_attach", json!({"tabId": tab})).await;

        let result = call(&f, "tab.close", json!({"tabId": tab})).await;
        assert_eq!(result["success"], true);
        assert_eq!(result["cleanup"]["tabClosed"], true);
        assert!(f.browser.list_tabs().await.unwrap().is_empty());
    }
}
