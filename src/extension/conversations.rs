//! Conversation API handlers
//!
//! These operations run against the chat service's conversation endpoints
//! and need the organization id scraped from the browser's cookies. If the
//! cookie cannot be read, the operation fails with `OrgIdUnavailable`;
//! there is deliberately no fallback value.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};

use crate::error::BridgeError;
use crate::extension::capabilities::{BrowserCapabilities, ConversationCall};
use crate::extension::commands::{opt_u64, require_str, CommandInput, ExtensionContext};

const ORG_COOKIE: &str = "lastActiveOrg";
const DEFAULT_LIST_LIMIT: usize = 25;

pub async fn org_id(caps: &dyn BrowserCapabilities) -> Result<String, BridgeError> {
    caps.read_cookie(ORG_COOKIE)
        .await?
        .filter(|v| !v.trim().is_empty())
        .ok_or(BridgeError::OrgIdUnavailable)
}

pub fn v_search(params: &Value) -> Result<(), BridgeError> {
    require_str(params, "query").map(|_| ())
}

pub fn v_conversation_id(params: &Value) -> Result<(), BridgeError> {
    require_str(params, "conversationId").map(|_| ())
}

/// Delete accepts either a single id or a bulk list.
pub fn v_delete(params: &Value) -> Result<(), BridgeError> {
    if params.get("conversationId").and_then(|v| v.as_str()).is_some() {
        return Ok(());
    }
    let ids = params.get("conversationIds").and_then(|v| v.as_array());
    match ids {
        Some(ids) if !ids.is_empty() && ids.iter().all(|v| v.is_string()) => Ok(()),
        _ => Err(BridgeError::InvalidParams(
            "expected 'conversationId' or non-empty 'conversationIds'".into(),
        )),
    }
}

pub fn h_list(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let org = org_id(ctx.caps.as_ref()).await?;
        let limit = opt_u64(&input.params, "limit").unwrap_or(DEFAULT_LIST_LIMIT as u64) as usize;
        ctx.caps.conversations(&org, &ConversationCall::List { limit }).await
    })
}

pub fn h_search(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let org = org_id(ctx.caps.as_ref()).await?;
        let query = require_str(&input.params, "query")?;
        let limit = opt_u64(&input.params, "limit").unwrap_or(DEFAULT_LIST_LIMIT as u64) as usize;
        ctx.caps.conversations(&org, &ConversationCall::Search { query, limit }).await
    })
}

pub fn h_get_metadata(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let org = org_id(ctx.caps.as_ref()).await?;
        let conversation_id = require_str(&input.params, "conversationId")?;
        let metadata = ctx
            .caps
            .conversations(&org, &ConversationCall::Metadata { conversation_id })
            .await?;
        Ok(json!({"metadata": metadata}))
    })
}

pub fn h_get_url(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let org = org_id(ctx.caps.as_ref()).await?;
        let conversation_id = require_str(&input.params, "conversationId")?;
        ctx.caps.conversations(&org, &ConversationCall::Url { conversation_id }).await
    })
}

pub fn h_delete(ctx: Arc<ExtensionContext>, input: CommandInput) -> BoxFuture<'static, Result<Value, BridgeError>> {
    Box::pin(async move {
        let org = org_id(ctx.caps.as_ref()).await?;
        let ids: Vec<String> = match input.params.get("conversationId").and_then(|v| v.as_str()) {
            Some(id) => vec![id.to_string()],
            None => input
                .params
                .get("conversationIds")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
                .unwrap_or_default(),
        };
        ctx.caps
            .conversations(&org, &ConversationCall::Delete { conversation_ids: ids })
            .await
    })
}
