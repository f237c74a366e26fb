//! Node registry and executor contract.
//!
//! Every node type the interpreter can dispatch is registered here; new node
//! types require registration, not dynamic loading. Control-flow types
//! (sequence, conditional, loop, parallel) are validated through the registry
//! like any other node but are interpreted by the interpreter itself, since
//! they recurse into child nodes.

mod browser_nodes;
mod control;
mod discovery;
mod extract;
pub mod interpreter;

pub use browser_nodes::{ClickNode, NavigateNode, WaitNode};
pub use control::{Predicate, evaluate_predicate};
pub use discovery::{ExtractLinksNode, PaginateNode};
pub use extract::ExtractNode;
pub use interpreter::{Interpreter, PhaseOutcome, TaskDisposition};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::model::{NodeSpec, Phase};

/// Node types the interpreter handles inline because they recurse.
pub const CONTROL_TYPES: &[&str] = &["sequence", "conditional", "loop", "parallel"];

#[must_use]
pub fn is_control_type(node_type: &str) -> bool {
    CONTROL_TYPES.contains(&node_type)
}

/// A URL produced by a discovery node, annotated for phase routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredUrl {
    pub url: String,
    pub marker: Option<String>,
}

/// What a node run produced.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// Value propagated as the next sibling's input.
    pub value: Value,
    pub discovered: Vec<DiscoveredUrl>,
    pub items: Vec<Value>,
}

impl NodeOutput {
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node_type(&self) -> &'static str;

    /// Static parameter validation, run at workflow intake and by health
    /// checks. Must not touch the browser.
    fn validate(&self, params: &Value) -> EngineResult<()>;

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput>;

    /// Offline schema validation against a sample input, for health checks.
    fn validate_for_health_check(&self, input: &Value) -> EngineResult<()> {
        let _ = input;
        Ok(())
    }
}

/// Marker executor for control-flow types: participates in validation, never
/// executes (the interpreter intercepts these types first).
struct ControlNode {
    tag: &'static str,
}

#[async_trait]
impl NodeExecutor for ControlNode {
    fn node_type(&self) -> &'static str {
        self.tag
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        control::validate_control_params(self.tag, params)
    }

    async fn execute(&self, _ctx: &mut ExecutionContext, _input: &Value) -> EngineResult<NodeOutput> {
        Err(EngineError::internal(format!(
            "control node {} must be dispatched by the interpreter",
            self.tag
        )))
    }
}

#[derive(Default)]
pub struct NodeRegistry {
    executors: HashMap<&'static str, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in node catalog.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NavigateNode));
        registry.register(Arc::new(ClickNode));
        registry.register(Arc::new(WaitNode));
        registry.register(Arc::new(ExtractNode));
        registry.register(Arc::new(ExtractLinksNode));
        registry.register(Arc::new(PaginateNode));
        for tag in CONTROL_TYPES.iter().copied() {
            registry.register(Arc::new(ControlNode { tag }));
        }
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.node_type(), executor);
    }

    #[must_use]
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    #[must_use]
    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Validate every node of a phase (recursively) against the registry:
    /// the type must be registered, params must validate, and the dependency
    /// graph must be acyclic.
    pub fn validate_phase(&self, phase: &Phase) -> EngineResult<()> {
        phase.topo_order()?;
        for node in &phase.nodes {
            self.validate_node(node)?;
        }
        Ok(())
    }

    fn validate_node(&self, node: &NodeSpec) -> EngineResult<()> {
        let executor = self.get(&node.node_type).ok_or_else(|| {
            EngineError::validation(format!(
                "unknown node type {} (node {})",
                node.node_type, node.id
            ))
        })?;
        executor.validate(&node.params).map_err(|e| {
            EngineError::validation(format!("node {}: {}", node.id, e.message))
        })?;
        for child in &node.children {
            self.validate_node(child)?;
        }
        // Conditional branches carry their children inside params.
        if node.node_type == "conditional" {
            for branch in ["then", "else"] {
                if let Some(raw) = node.params.get(branch) {
                    let children: Vec<NodeSpec> = serde_json::from_value(raw.clone())
                        .map_err(|e| {
                            EngineError::validation(format!(
                                "node {}: malformed {branch} branch: {e}",
                                node.id
                            ))
                        })?;
                    for child in &children {
                        self.validate_node(child)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PhaseTransition, PhaseType, TransitionCondition};
    use serde_json::json;

    fn phase(nodes: Vec<NodeSpec>) -> Phase {
        Phase {
            id: "p1".into(),
            phase_type: PhaseType::Discovery,
            name: String::new(),
            url_filter: None,
            nodes,
            transition: PhaseTransition {
                condition: TransitionCondition::QueueEmpty,
                next_phase: None,
            },
        }
    }

    fn spec(node_type: &str, params: Value) -> NodeSpec {
        NodeSpec {
            id: "n1".into(),
            node_type: node_type.into(),
            name: String::new(),
            params,
            dependencies: vec![],
            optional: false,
            timeout_ms: None,
            children: vec![],
        }
    }

    #[test]
    fn builtins_cover_the_catalog() {
        let registry = NodeRegistry::with_builtins();
        for tag in [
            "navigate",
            "click",
            "wait",
            "extract",
            "extract_links",
            "paginate",
            "sequence",
            "conditional",
            "loop",
            "parallel",
        ] {
            assert!(registry.get(tag).is_some(), "missing builtin {tag}");
        }
    }

    #[test]
    fn unknown_type_fails_validation() {
        let registry = NodeRegistry::with_builtins();
        let err = registry
            .validate_phase(&phase(vec![spec("teleport", json!({}))]))
            .unwrap_err();
        assert!(err.message.contains("unknown node type"));
    }

    #[test]
    fn click_requires_selector() {
        let registry = NodeRegistry::with_builtins();
        assert!(registry
            .validate_phase(&phase(vec![spec("click", json!({}))]))
            .is_err());
        assert!(registry
            .validate_phase(&phase(vec![spec("click", json!({"selector": "#go"}))]))
            .is_ok());
    }
}
