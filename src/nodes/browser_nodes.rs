//! Browser interaction nodes: navigate, click, wait.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::{NodeExecutor, NodeOutput};
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ErrorKind};

fn require_lease(ctx: &ExecutionContext) -> EngineResult<std::sync::Arc<crate::browser::BrowserLease>> {
    ctx.lease()
        .cloned()
        .ok_or_else(|| EngineError::internal("node requires a browser lease"))
}

/// Navigate the task's page. Defaults to the task URL when `url` is absent.
pub struct NavigateNode;

#[async_trait]
impl NodeExecutor for NavigateNode {
    fn node_type(&self) -> &'static str {
        "navigate"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        if let Some(url) = params.get("url") {
            if !url.is_string() {
                return Err(EngineError::validation("navigate.url must be a string"));
            }
        }
        if let Some(timeout) = params.get("timeout") {
            if !timeout.is_u64() {
                return Err(EngineError::validation("navigate.timeout must be milliseconds"));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let params = input;
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(&ctx.task.url)
            .to_string();
        let timeout = Duration::from_millis(params.get("timeout").and_then(Value::as_u64).unwrap_or(30_000));

        let lease = require_lease(ctx)?;
        let page = lease.navigate(&url, timeout).await?;
        let final_url = page.url().await.ok().flatten().unwrap_or_else(|| url.clone());

        ctx.metadata.insert("current_url".into(), json!(final_url));
        Ok(NodeOutput::value(json!({ "url": final_url })))
    }
}

/// Click an element by selector.
pub struct ClickNode;

#[async_trait]
impl NodeExecutor for ClickNode {
    fn node_type(&self) -> &'static str {
        "click"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        match params.get("selector").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err(EngineError::validation("click.selector is required")),
        }
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let selector = input
            .get("selector")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation("click.selector is required"))?;

        let lease = require_lease(ctx)?;
        let page = lease.page().await.map_err(EngineError::from)?;
        let element = page.find_element(selector).await.map_err(|e| {
            EngineError::new(
                ErrorKind::LayoutChanged,
                format!("selector {selector} matched no node: {e}"),
            )
        })?;
        element
            .click()
            .await
            .map_err(|e| EngineError::classified(format!("click on {selector} failed: {e}")))?;

        Ok(NodeOutput::value(json!({ "clicked": selector })))
    }
}

/// Wait for a duration or for a selector to appear.
pub struct WaitNode;

#[async_trait]
impl NodeExecutor for WaitNode {
    fn node_type(&self) -> &'static str {
        "wait"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        let has_ms = params.get("ms").and_then(Value::as_u64).is_some();
        let has_selector = params
            .get("selector")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if !has_ms && !has_selector {
            return Err(EngineError::validation("wait needs ms or selector"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        if let Some(ms) = input.get("ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = ctx.cancel.cancelled() => return Err(EngineError::cancelled()),
            }
            return Ok(NodeOutput::value(json!({ "waited_ms": ms })));
        }

        let selector = input
            .get("selector")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation("wait needs ms or selector"))?;
        let timeout_ms = input
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(10_000);

        let lease = require_lease(ctx)?;
        let page = lease.page().await.map_err(EngineError::from)?;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        // Poll rather than subscribing to DOM mutation events; selectors
        // appear within a few frames on real pages.
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(NodeOutput::value(json!({ "appeared": selector })));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::timeout(format!(
                    "wait for {selector} timed out after {timeout_ms}ms"
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = ctx.cancel.cancelled() => return Err(EngineError::cancelled()),
            }
        }
    }
}
