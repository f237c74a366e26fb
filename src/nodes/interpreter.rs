//! Node-tree interpreter.
//!
//! Drives one task's node graph through a phase: topological dispatch,
//! control-flow handling, node-execution records, event emission and the
//! recovery hook. Control-flow nodes recurse through the interpreter itself;
//! leaf nodes dispatch to their registered executor.
//!
//! Node state machine: pending → running → (completed | failed | skipped).
//! Terminal states are immutable; an `optional` node that fails is demoted
//! to skipped for its parent's aggregation.

use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::control::{self, LoopParams, Predicate};
use super::{DiscoveredUrl, NodeOutput, NodeRegistry, is_control_type};
use crate::browser::{BrowserLease, BrowserPool, BrowserProfile};
use crate::config::WorkerConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::{ExecutionEvent, ExecutionEventBus};
use crate::model::{NodeExecution, NodeExecutionUpdate, NodeRunStatus, NodeSpec, Phase};
use crate::proxy::ProxyPool;
use crate::recovery::{RecoveryDirective, RecoveryEngine, RetryDirective, failure_context};
use crate::sink::{SinkHandle, SinkRecord};

/// How the task leaves the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    Completed,
    /// Return to queue, visible again after the delay.
    Deferred { delay: Duration },
    Dlq { category: String },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Default)]
pub struct PhaseOutcome {
    pub disposition: Option<TaskDisposition>,
    pub discovered: Vec<DiscoveredUrl>,
    pub items: Vec<Value>,
    pub nodes_completed: u32,
    pub nodes_failed: u32,
    pub nodes_skipped: u32,
}

impl PhaseOutcome {
    #[must_use]
    pub fn disposition(&self) -> TaskDisposition {
        self.disposition.clone().unwrap_or(TaskDisposition::Completed)
    }
}

enum NodeRunOutcome {
    Completed(NodeOutput),
    Skipped,
    Abort(TaskDisposition),
}

pub struct Interpreter {
    registry: Arc<NodeRegistry>,
    events: Arc<ExecutionEventBus>,
    sink: SinkHandle,
    recovery: Arc<RecoveryEngine>,
    pool: Option<Arc<BrowserPool>>,
    proxies: Arc<ProxyPool>,
    config: WorkerConfig,
}

impl Interpreter {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        events: Arc<ExecutionEventBus>,
        sink: SinkHandle,
        recovery: Arc<RecoveryEngine>,
        pool: Option<Arc<BrowserPool>>,
        proxies: Arc<ProxyPool>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            events,
            sink,
            recovery,
            pool,
            proxies,
            config,
        }
    }

    /// Run a phase's node tree for one task.
    pub async fn run_phase(
        &self,
        ctx: &mut ExecutionContext,
        phase: &Phase,
    ) -> EngineResult<PhaseOutcome> {
        let ordered: Vec<NodeSpec> = phase.topo_order()?.into_iter().cloned().collect();
        let mut outcome = PhaseOutcome::default();
        let mut prev = Value::Null;

        for spec in &ordered {
            match self.run_node(ctx, spec, &phase.id, prev.clone()).await? {
                NodeRunOutcome::Completed(output) => {
                    outcome.nodes_completed += 1;
                    outcome.discovered.extend(output.discovered);
                    outcome.items.extend(output.items);
                    prev = output.value;
                }
                NodeRunOutcome::Skipped => {
                    outcome.nodes_skipped += 1;
                    prev = Value::Null;
                }
                NodeRunOutcome::Abort(disposition) => {
                    outcome.nodes_failed += 1;
                    outcome.disposition = Some(disposition);
                    return Ok(outcome);
                }
            }
        }
        Ok(outcome)
    }

    /// Execute one node (recursing through control-flow containers), with
    /// record keeping, events, timeout and the recovery loop.
    fn run_node<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        spec: &'a NodeSpec,
        phase_id: &'a str,
        prev: Value,
    ) -> BoxFuture<'a, EngineResult<NodeRunOutcome>> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::cancelled());
            }

            let parent_id = ctx.parent_stack.last().copied();
            let mut record = NodeExecution::open(
                ctx.execution_id,
                ctx.task.task_id,
                &spec.id,
                &spec.node_type,
                parent_id,
                spec.params.clone(),
            );
            // The first record opened for a task is its tree root; siblings
            // at the top level hang off it.
            let is_root = ctx.parent_stack.is_empty();
            if is_root {
                ctx.parent_stack.push(record.id);
            }

            self.sink.submit(SinkRecord::NodeOpen(record.clone())).await;
            self.events.publish(ExecutionEvent::node_started(
                ctx.execution_id,
                record.id,
                phase_id,
                &spec.id,
                &spec.node_type,
            ));

            let input = merge_input(&spec.params, &prev);
            let timeout = Duration::from_millis(spec.timeout_ms.unwrap_or(self.config.node_timeout_ms));

            let result = loop {
                let attempt_result = self
                    .dispatch(ctx, spec, phase_id, &input, timeout, record.id)
                    .await;
                match attempt_result {
                    Ok(output) => break Ok(output),
                    Err(error) if error.is_cancelled() => {
                        // Cancelled work is dropped silently; the task is
                        // nacked without retry by the worker.
                        record.error = Some("cancelled".to_string());
                        record.close(NodeRunStatus::Failed);
                        self.push_update(&record).await;
                        return Err(error);
                    }
                    Err(error)
                        if error.kind == ErrorKind::Internal
                            && error.message.starts_with("dlq:") =>
                    {
                        // A nested child already went through recovery and
                        // was dead-lettered; propagate, don't re-recover.
                        let category = error
                            .message
                            .strip_prefix("dlq:")
                            .unwrap_or("unknown")
                            .to_string();
                        record.error = Some(error.message.clone());
                        record.close(NodeRunStatus::Failed);
                        self.finish_events(ctx, &record, phase_id).await;
                        return Ok(NodeRunOutcome::Abort(TaskDisposition::Dlq { category }));
                    }
                    Err(error)
                        if error.kind == ErrorKind::Internal
                            && error.message.starts_with("defer:") =>
                    {
                        break Err(error);
                    }
                    Err(error) => {
                        let attempt = ctx.next_attempt();
                        let fctx = failure_context(
                            ctx.execution_id,
                            &ctx.task,
                            &spec.id,
                            &error,
                            attempt,
                        );
                        match self.recovery.handle_failure(&fctx).await {
                            RecoveryDirective::Retry(directive) => {
                                record.retry_count += 1;
                                debug!(
                                    node = spec.id,
                                    attempt,
                                    delay_ms = directive.delay.as_millis() as u64,
                                    "retrying node after recovery directive"
                                );
                                if let Err(e) = self.apply_retry(ctx, &directive).await {
                                    break Err(e);
                                }
                            }
                            RecoveryDirective::Defer { delay } => {
                                record.error = Some(error.message.clone());
                                break Err(error.defer(delay));
                            }
                            RecoveryDirective::Dlq { category } => {
                                self.open_incident(ctx, &fctx).await;
                                record.error = Some(error.message.clone());
                                record.close(NodeRunStatus::Failed);
                                self.finish_events(ctx, &record, phase_id).await;
                                return Ok(NodeRunOutcome::Abort(TaskDisposition::Dlq {
                                    category,
                                }));
                            }
                            RecoveryDirective::Exhausted => {
                                if !spec.optional {
                                    self.open_incident(ctx, &fctx).await;
                                }
                                break Err(error);
                            }
                        }
                    }
                }
            };

            match result {
                Ok(output) => {
                    record.urls_discovered = output.discovered.len() as u32;
                    record.items_extracted = output.items.len() as u32;
                    record.output = Some(output.value.clone());
                    record.close(NodeRunStatus::Completed);
                    self.finish_events(ctx, &record, phase_id).await;
                    Ok(NodeRunOutcome::Completed(output))
                }
                Err(error) if error.kind == ErrorKind::Internal && error.message.starts_with("defer:") => {
                    record.close(NodeRunStatus::Failed);
                    self.finish_events(ctx, &record, phase_id).await;
                    let delay = error.defer_delay().unwrap_or(Duration::from_secs(60));
                    Ok(NodeRunOutcome::Abort(TaskDisposition::Deferred { delay }))
                }
                Err(error) => {
                    record.error = Some(error.message.clone());
                    if spec.optional {
                        record.close(NodeRunStatus::Skipped);
                        self.finish_events(ctx, &record, phase_id).await;
                        warn!(node = spec.id, "optional node failed, skipped: {error}");
                        Ok(NodeRunOutcome::Skipped)
                    } else {
                        record.close(NodeRunStatus::Failed);
                        self.finish_events(ctx, &record, phase_id).await;
                        Ok(NodeRunOutcome::Abort(TaskDisposition::Dlq {
                            category: error.kind.as_str().to_string(),
                        }))
                    }
                }
            }
        })
    }

    /// One dispatch attempt: control-flow inline, leaves via the registry,
    /// bounded by the node timeout.
    async fn dispatch(
        &self,
        ctx: &mut ExecutionContext,
        spec: &NodeSpec,
        phase_id: &str,
        input: &Value,
        timeout: Duration,
        record_id: uuid::Uuid,
    ) -> EngineResult<NodeOutput> {
        if is_control_type(&spec.node_type) {
            // Containers manage their own children's timeouts.
            return self.run_control(ctx, spec, phase_id, input, record_id).await;
        }

        let executor = self.registry.get(&spec.node_type).ok_or_else(|| {
            EngineError::validation(format!("unknown node type {}", spec.node_type))
        })?;

        let cancel = ctx.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::cancelled()),
            result = tokio::time::timeout(timeout, executor.execute(ctx, input)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::timeout(format!(
                        "node {} timed out after {}ms",
                        spec.id,
                        timeout.as_millis()
                    ))),
                }
            }
        }
    }

    async fn run_control(
        &self,
        ctx: &mut ExecutionContext,
        spec: &NodeSpec,
        phase_id: &str,
        input: &Value,
        record_id: uuid::Uuid,
    ) -> EngineResult<NodeOutput> {
        let pushed = ctx.parent_stack.last() != Some(&record_id);
        if pushed {
            ctx.parent_stack.push(record_id);
        }
        let result = match spec.node_type.as_str() {
            "sequence" => self.run_children(ctx, &spec.children, phase_id).await,
            "conditional" => self.run_conditional(ctx, spec, phase_id, input).await,
            "loop" => self.run_loop(ctx, spec, phase_id, input).await,
            "parallel" => self.run_parallel(ctx, &spec.children, phase_id).await,
            other => Err(EngineError::internal(format!("not a control node: {other}"))),
        };
        if pushed {
            ctx.parent_stack.pop();
        }
        result
    }

    /// Children in declared order, outputs propagating forward. A child
    /// abort surfaces as an error carrying the disposition.
    async fn run_children(
        &self,
        ctx: &mut ExecutionContext,
        children: &[NodeSpec],
        phase_id: &str,
    ) -> EngineResult<NodeOutput> {
        let mut aggregate = NodeOutput::default();
        let mut prev = Value::Null;
        for child in children {
            match self.run_node(ctx, child, phase_id, prev.clone()).await? {
                NodeRunOutcome::Completed(output) => {
                    aggregate.discovered.extend(output.discovered);
                    aggregate.items.extend(output.items);
                    prev = output.value;
                }
                NodeRunOutcome::Skipped => prev = Value::Null,
                NodeRunOutcome::Abort(disposition) => {
                    return Err(abort_error(disposition));
                }
            }
        }
        aggregate.value = prev;
        Ok(aggregate)
    }

    async fn run_conditional(
        &self,
        ctx: &mut ExecutionContext,
        spec: &NodeSpec,
        phase_id: &str,
        input: &Value,
    ) -> EngineResult<NodeOutput> {
        let predicate: Predicate = serde_json::from_value(
            input
                .get("predicate")
                .cloned()
                .ok_or_else(|| EngineError::validation("conditional.predicate is required"))?,
        )
        .map_err(|e| EngineError::validation(format!("conditional.predicate: {e}")))?;

        let branch_key = if control::evaluate_predicate(ctx, &predicate).await? {
            "then"
        } else {
            "else"
        };
        let children: Vec<NodeSpec> = match input.get(branch_key) {
            Some(raw) => serde_json::from_value(raw.clone())
                .map_err(|e| EngineError::validation(format!("conditional.{branch_key}: {e}")))?,
            None => Vec::new(),
        };
        debug!(node = spec.id, branch = branch_key, "conditional branch taken");
        let mut output = self.run_children(ctx, &children, phase_id).await?;
        if output.value.is_null() {
            output.value = serde_json::json!({ "branch": branch_key });
        }
        Ok(output)
    }

    /// Iterate children over a selector's matches, each iteration in a
    /// sub-context that is merged back.
    async fn run_loop(
        &self,
        ctx: &mut ExecutionContext,
        spec: &NodeSpec,
        phase_id: &str,
        input: &Value,
    ) -> EngineResult<NodeOutput> {
        let params: LoopParams = serde_json::from_value(input.clone())
            .map_err(|e| EngineError::validation(format!("loop params: {e}")))?;

        let matches = match ctx.lease() {
            Some(lease) => {
                let page = lease.page().await.map_err(EngineError::from)?;
                page.find_elements(&params.selector)
                    .await
                    .map(|els| els.len() as u64)
                    .unwrap_or(0)
            }
            None => 0,
        };
        let iterations = matches.min(params.max_iterations);

        let mut aggregate = NodeOutput::default();
        for index in 0..iterations {
            let mut fork = ctx.fork();
            fork.variables
                .insert("loop_index".to_string(), index.to_string());
            fork.set("loop_index", serde_json::json!(index));
            fork.set("loop_selector", serde_json::json!(params.selector));

            let result = self.run_children(&mut fork, &spec.children, phase_id).await;
            ctx.absorb(fork);
            let output = result?;
            aggregate.discovered.extend(output.discovered);
            aggregate.items.extend(output.items);
        }
        aggregate.value = serde_json::json!({ "iterations": iterations });
        Ok(aggregate)
    }

    /// Bounded fan-out over forked contexts; forks merge back in declared
    /// order so the merge is deterministic.
    async fn run_parallel(
        &self,
        ctx: &mut ExecutionContext,
        children: &[NodeSpec],
        phase_id: &str,
    ) -> EngineResult<NodeOutput> {
        let limit = self.config.parallel_node_limit.max(1);
        let mut tasks = Vec::with_capacity(children.len());
        for (index, child) in children.iter().enumerate() {
            let mut fork = ctx.fork();
            tasks.push(async move {
                let result = self.run_node(&mut fork, child, phase_id, Value::Null).await;
                (index, fork, result)
            });
        }

        let mut results: Vec<(usize, ExecutionContext, EngineResult<NodeRunOutcome>)> =
            futures::stream::iter(tasks)
                .buffer_unordered(limit)
                .collect()
                .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut aggregate = NodeOutput::default();
        let mut first_error = None;
        for (_, fork, result) in results {
            ctx.absorb(fork);
            match result {
                Ok(NodeRunOutcome::Completed(output)) => {
                    aggregate.discovered.extend(output.discovered);
                    aggregate.items.extend(output.items);
                }
                Ok(NodeRunOutcome::Skipped) => {}
                Ok(NodeRunOutcome::Abort(disposition)) => {
                    if first_error.is_none() {
                        first_error = Some(abort_error(disposition));
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        aggregate.value = serde_json::json!({ "children": children.len() });
        Ok(aggregate)
    }

    /// Apply a retry directive's side effects before re-running the node.
    async fn apply_retry(
        &self,
        ctx: &mut ExecutionContext,
        directive: &RetryDirective,
    ) -> EngineResult<()> {
        if !directive.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(directive.delay) => {}
                _ = ctx.cancel.cancelled() => return Err(EngineError::cancelled()),
            }
        }
        if directive.clear_cookies {
            if let Some(lease) = ctx.lease() {
                lease.clear_cookies().await?;
            }
        }
        if directive.switch_browser {
            self.swap_browser(ctx, directive).await?;
        }
        Ok(())
    }

    /// Discard the current lease and acquire a fresh context, optionally on
    /// a rotated user agent or a different proxy.
    async fn swap_browser(
        &self,
        ctx: &mut ExecutionContext,
        directive: &RetryDirective,
    ) -> EngineResult<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        let mut profile = BrowserProfile::default();
        let current_proxy = if let Some(lease) = ctx.lease() {
            profile.fingerprint = lease.fingerprint();
            lease.mark_discard();
            ctx.metadata
                .get("proxy")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };
        if directive.rotate_user_agent {
            profile.rotate_user_agent();
        }
        if directive.switch_proxy {
            profile.proxy = self.proxies.next(current_proxy.as_deref());
        } else {
            profile.proxy = current_proxy;
        }
        if let Some(proxy) = &profile.proxy {
            ctx.metadata.insert("proxy".into(), serde_json::json!(proxy));
        }

        let lease: Arc<BrowserLease> = Arc::new(
            pool.acquire(&profile, &ctx.cancel)
                .await
                .map_err(EngineError::from)?,
        );
        ctx.set_lease(lease);
        Ok(())
    }

    /// Capture page state while the lease is live and persist the incident.
    async fn open_incident(&self, ctx: &ExecutionContext, fctx: &crate::recovery::FailureContext) {
        let mut dom_snapshot = None;
        let mut screenshot_ref = None;
        if let Some(lease) = ctx.lease() {
            if let Ok(page) = lease.page().await {
                dom_snapshot = page.content().await.ok();
                screenshot_ref = capture_screenshot(&page, fctx.task.task_id).await;
            }
        }
        let headers = ctx
            .metadata
            .get("response_headers")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        let incident = self
            .recovery
            .build_incident(fctx, dom_snapshot, screenshot_ref, headers, serde_json::json!({}))
            .await;
        self.events.publish(ExecutionEvent::log(
            ctx.execution_id,
            format!("incident {} opened for {}", incident.id, fctx.task.url),
        ));
    }

    async fn push_update(&self, record: &NodeExecution) {
        self.sink
            .submit(SinkRecord::NodeUpdate(NodeExecutionUpdate::from(record)))
            .await;
    }

    async fn finish_events(&self, ctx: &ExecutionContext, record: &NodeExecution, phase_id: &str) {
        self.push_update(record).await;
        let status = match record.status {
            NodeRunStatus::Completed => "completed",
            NodeRunStatus::Failed => "failed",
            NodeRunStatus::Skipped => "skipped",
            NodeRunStatus::Running => "running",
            NodeRunStatus::Pending => "pending",
        };
        self.events.publish(ExecutionEvent::node_finished(
            ctx.execution_id,
            record.id,
            phase_id,
            &record.node_id,
            status,
            record.duration_ms.unwrap_or(0),
        ));
    }
}

/// Save an incident screenshot under the local artifact dir; returns the
/// path for the incident record, or `None` when capture fails (the incident
/// is still written without it).
async fn capture_screenshot(page: &chromiumoxide::Page, task_id: uuid::Uuid) -> Option<String> {
    use chromiumoxide_cdp::cdp::browser_protocol::page::{
        CaptureScreenshotFormat, CaptureScreenshotParams,
    };

    let params = CaptureScreenshotParams {
        format: Some(CaptureScreenshotFormat::Png),
        ..Default::default()
    };
    let bytes = match page.screenshot(params).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("incident screenshot capture failed: {e}");
            return None;
        }
    };

    let dir = std::env::temp_dir().join("crawlflow_incidents");
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("cannot create incident artifact dir: {e}");
        return None;
    }
    let path = dir.join(format!("{task_id}.png"));
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => Some(path.to_string_lossy().to_string()),
        Err(e) => {
            warn!("incident screenshot write failed: {e}");
            None
        }
    }
}

/// Node params plus the previous sibling's output under `_input`.
fn merge_input(params: &Value, prev: &Value) -> Value {
    match (params, prev) {
        (Value::Object(map), prev) if !prev.is_null() => {
            let mut merged = map.clone();
            merged.insert("_input".to_string(), prev.clone());
            Value::Object(merged)
        }
        (params, _) => params.clone(),
    }
}

/// Thread a child abort through the error channel of `run_children`.
fn abort_error(disposition: TaskDisposition) -> EngineError {
    match disposition {
        TaskDisposition::Dlq { category } => {
            EngineError::new(ErrorKind::Internal, format!("dlq:{category}"))
        }
        TaskDisposition::Deferred { delay } => {
            EngineError::new(ErrorKind::Internal, format!("defer:{}", delay.as_secs()))
        }
        TaskDisposition::Failed { kind, message } => EngineError::new(kind, message),
        TaskDisposition::Completed => EngineError::internal("abort with completed disposition"),
    }
}

impl EngineError {
    /// Encode a defer disposition through the error channel.
    #[must_use]
    pub(crate) fn defer(self, delay: Duration) -> EngineError {
        EngineError::new(
            ErrorKind::Internal,
            format!("defer:{} ({})", delay.as_secs(), self.message),
        )
    }

    pub(crate) fn defer_delay(&self) -> Option<Duration> {
        let rest = self.message.strip_prefix("defer:")?;
        let secs: u64 = rest
            .split_whitespace()
            .next()?
            .parse()
            .ok()?;
        Some(Duration::from_secs(secs))
    }
}
