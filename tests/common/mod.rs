//! Shared test harness: browserless node executors and workflow builders.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crawlflow::context::ExecutionContext;
use crawlflow::error::{EngineError, EngineResult, ErrorKind};
use crawlflow::model::{
    NodeSpec, Phase, PhaseTransition, PhaseType, TransitionCondition, UrlFilter, Workflow,
    WorkflowConfig, WorkflowStatus,
};
use crawlflow::nodes::{DiscoveredUrl, NodeExecutor, NodeOutput, NodeRegistry};
use chrono::Utc;
use uuid::Uuid;

/// Emits the URLs listed in its params, annotated with an optional marker.
/// Params: `{"links": [{"url": "...", "marker": "product"}]}`
pub struct StaticLinksNode;

#[async_trait]
impl NodeExecutor for StaticLinksNode {
    fn node_type(&self) -> &'static str {
        "mock_links"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        if params.get("links").and_then(Value::as_array).is_none() {
            return Err(EngineError::validation("mock_links.links required"));
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let links = input
            .get("links")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let discovered = links
            .iter()
            .filter_map(|entry| {
                let url = entry.get("url")?.as_str()?.to_string();
                let marker = entry
                    .get("marker")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(DiscoveredUrl { url, marker })
            })
            .collect::<Vec<_>>();
        Ok(NodeOutput {
            value: json!({"links_found": discovered.len()}),
            discovered,
            items: Vec::new(),
        })
    }
}

/// Writes its `data` object into the context and emits it as an item.
/// Params: `{"data": {"title": "..."}}`
pub struct StaticExtractNode;

#[async_trait]
impl NodeExecutor for StaticExtractNode {
    fn node_type(&self) -> &'static str {
        "mock_extract"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        if params.get("data").and_then(Value::as_object).is_none() {
            return Err(EngineError::validation("mock_extract.data required"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let data = input.get("data").cloned().unwrap_or(json!({}));
        if let Some(map) = data.as_object() {
            for (key, value) in map {
                ctx.set(key.clone(), value.clone());
            }
        }
        Ok(NodeOutput {
            value: data.clone(),
            discovered: Vec::new(),
            items: vec![data],
        })
    }
}

/// Fails `failures` times with the given kind, then succeeds.
pub struct FlakyNode {
    pub kind: ErrorKind,
    pub failures: u32,
    seen: AtomicU32,
}

impl FlakyNode {
    pub fn new(kind: ErrorKind, failures: u32) -> Self {
        Self {
            kind,
            failures,
            seen: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl NodeExecutor for FlakyNode {
    fn node_type(&self) -> &'static str {
        "mock_flaky"
    }

    fn validate(&self, _params: &Value) -> EngineResult<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &mut ExecutionContext, _input: &Value) -> EngineResult<NodeOutput> {
        let attempt = self.seen.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(EngineError::new(
                self.kind,
                format!("induced failure {} of {}", attempt + 1, self.failures),
            ))
        } else {
            Ok(NodeOutput::value(json!({"recovered_after": attempt})))
        }
    }
}

/// Sleeps for `ms` (default 10s), aborting promptly on cancellation.
/// Params: `{"ms": 30000}`
pub struct SlowNode;

#[async_trait]
impl NodeExecutor for SlowNode {
    fn node_type(&self) -> &'static str {
        "mock_slow"
    }

    fn validate(&self, _params: &Value) -> EngineResult<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(10_000);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                Ok(NodeOutput::value(json!({"slept_ms": ms})))
            }
            _ = ctx.cancel.cancelled() => Err(EngineError::cancelled()),
        }
    }
}

/// Always fails with its configured kind.
pub struct AlwaysFailNode {
    pub kind: ErrorKind,
}

#[async_trait]
impl NodeExecutor for AlwaysFailNode {
    fn node_type(&self) -> &'static str {
        "mock_fail"
    }

    fn validate(&self, _params: &Value) -> EngineResult<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &mut ExecutionContext, _input: &Value) -> EngineResult<NodeOutput> {
        Err(EngineError::new(self.kind, "induced permanent failure"))
    }
}

/// Registry with builtins plus the mock catalog.
pub fn mock_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins();
    registry.register(Arc::new(StaticLinksNode));
    registry.register(Arc::new(StaticExtractNode));
    registry.register(Arc::new(SlowNode));
    registry.register(Arc::new(FlakyNode::new(ErrorKind::Timeout, 0)));
    registry.register(Arc::new(AlwaysFailNode {
        kind: ErrorKind::Captcha,
    }));
    registry
}

pub fn node(id: &str, node_type: &str, params: Value) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        node_type: node_type.to_string(),
        name: String::new(),
        params,
        dependencies: Vec::new(),
        optional: false,
        timeout_ms: None,
        children: Vec::new(),
    }
}

pub fn phase(
    id: &str,
    phase_type: PhaseType,
    url_filter: Option<UrlFilter>,
    nodes: Vec<NodeSpec>,
    condition: TransitionCondition,
    next_phase: Option<&str>,
) -> Phase {
    Phase {
        id: id.to_string(),
        phase_type,
        name: format!("{id} phase"),
        url_filter,
        nodes,
        transition: PhaseTransition {
            condition,
            next_phase: next_phase.map(str::to_string),
        },
    }
}

/// The canonical two-phase fixture: discovery finds three product links,
/// extraction emits one item per product page.
pub fn two_phase_workflow(max_depth: u32) -> Workflow {
    let discovery = phase(
        "p1",
        PhaseType::Discovery,
        Some(UrlFilter::Depth(0)),
        vec![node(
            "n1",
            "mock_links",
            json!({"links": [
                {"url": "https://ex.test/item/1", "marker": "product"},
                {"url": "https://ex.test/item/2", "marker": "product"},
                {"url": "https://ex.test/item/3", "marker": "product"},
            ]}),
        )],
        TransitionCondition::AllNodesComplete,
        Some("p2"),
    );
    let extraction = phase(
        "p2",
        PhaseType::Extraction,
        Some(UrlFilter::Markers(vec!["product".to_string()])),
        vec![node(
            "n1",
            "mock_extract",
            json!({"data": {"title": "Widget", "price": "9.99"}}),
        )],
        TransitionCondition::QueueEmpty,
        None,
    );
    workflow_with_phases(vec![discovery, extraction], max_depth)
}

pub fn workflow_with_phases(phases: Vec<Phase>, max_depth: u32) -> Workflow {
    let now = Utc::now();
    Workflow {
        id: Uuid::new_v4(),
        name: "fixture".to_string(),
        version: 1,
        config: WorkflowConfig {
            start_urls: vec!["https://ex.test/list".to_string()],
            max_depth,
            rate_limit_delay: 0,
            storage: Default::default(),
            phases,
        },
        status: WorkflowStatus::Active,
        created_at: now,
        updated_at: now,
    }
}
