//! Workflow definitions: phases, nodes, filters and transitions.
//!
//! A workflow is the user-authored description of a crawl: an ordered list of
//! phases, each holding a node graph plus a URL filter and a transition
//! predicate. The config is snapshotted (frozen) when an execution starts so
//! later edits never affect in-flight runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    /// Monotonic per workflow id; bumped on every config change.
    pub version: u32,
    pub config: WorkflowConfig,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where extracted items are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageTarget {
    Database,
    File { dir: String },
    Webhook { endpoint: String },
}

impl Default for StorageTarget {
    fn default() -> Self {
        Self::Database
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub start_urls: Vec<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Per-domain politeness delay hint, milliseconds.
    #[serde(default)]
    pub rate_limit_delay: u64,
    #[serde(default)]
    pub storage: StorageTarget,
    pub phases: Vec<Phase>,
}

fn default_max_depth() -> u32 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Discovery,
    Extraction,
    Processing,
    Custom,
}

/// Selects which queued URLs belong to a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlFilter {
    /// URL carries at least one of these markers
    Markers(Vec<String>),
    /// URL sits at exactly this depth
    Depth(u32),
}

impl UrlFilter {
    #[must_use]
    pub fn matches(&self, markers: &[String], depth: u32) -> bool {
        match self {
            Self::Markers(wanted) => wanted.iter().any(|m| markers.contains(m)),
            Self::Depth(d) => *d == depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCondition {
    /// Queue drained, no leases, and every node execution of the phase terminal
    AllNodesComplete,
    /// Queue drained and no outstanding leases
    QueueEmpty,
    /// Named predicate evaluated by the orchestrator's custom hook
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub condition: TransitionCondition,
    #[serde(default)]
    pub next_phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    #[serde(rename = "type")]
    pub phase_type: PhaseType,
    pub name: String,
    #[serde(default)]
    pub url_filter: Option<UrlFilter>,
    pub nodes: Vec<NodeSpec>,
    pub transition: PhaseTransition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: Value,
    /// Sibling node ids that must complete before this node runs.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Failed optional nodes are demoted to skipped instead of failing the task.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Child nodes of control-flow containers (sequence, loop, parallel,
    /// conditional branches live in params for conditional).
    #[serde(default)]
    pub children: Vec<NodeSpec>,
}

impl Phase {
    /// Order nodes topologically, honouring `dependencies` and preserving
    /// declared order among nodes whose dependencies are already met.
    ///
    /// Returns `Validation` if dependencies reference unknown siblings or the
    /// graph contains a cycle.
    pub fn topo_order(&self) -> EngineResult<Vec<&NodeSpec>> {
        let by_id: HashMap<&str, &NodeSpec> =
            self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        for node in &self.nodes {
            for dep in &node.dependencies {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(EngineError::validation(format!(
                        "node {} in phase {} depends on unknown node {dep}",
                        node.id, self.id
                    )));
                }
                if dep == &node.id {
                    return Err(EngineError::validation(format!(
                        "node {} in phase {} depends on itself",
                        node.id, self.id
                    )));
                }
            }
        }

        // Kahn's algorithm, scanning in declared order for stability.
        let mut done: HashSet<&str> = HashSet::new();
        let mut ordered: Vec<&NodeSpec> = Vec::with_capacity(self.nodes.len());
        while ordered.len() < self.nodes.len() {
            let before = ordered.len();
            for node in &self.nodes {
                if done.contains(node.id.as_str()) {
                    continue;
                }
                if node.dependencies.iter().all(|d| done.contains(d.as_str())) {
                    done.insert(node.id.as_str());
                    ordered.push(node);
                }
            }
            if ordered.len() == before {
                return Err(EngineError::validation(format!(
                    "dependency cycle among nodes of phase {}",
                    self.id
                )));
            }
        }
        Ok(ordered)
    }
}

impl WorkflowConfig {
    /// Structural validation performed at execution intake, before any task
    /// is enqueued. Node-type validation happens separately against the
    /// registry.
    pub fn validate(&self) -> EngineResult<()> {
        if self.phases.is_empty() {
            return Err(EngineError::validation("workflow has no phases"));
        }
        let mut ids = HashSet::new();
        for phase in &self.phases {
            if !ids.insert(phase.id.as_str()) {
                return Err(EngineError::validation(format!(
                    "duplicate phase id {}",
                    phase.id
                )));
            }
            phase.topo_order()?;
            if let Some(next) = &phase.transition.next_phase {
                let Some(next_index) = self.phases.iter().position(|p| &p.id == next) else {
                    return Err(EngineError::validation(format!(
                        "phase {} transitions to unknown phase {next}",
                        phase.id
                    )));
                };
                // The phase index only increases within an execution.
                let this_index = self
                    .phases
                    .iter()
                    .position(|p| p.id == phase.id)
                    .unwrap_or(0);
                if next_index <= this_index {
                    return Err(EngineError::validation(format!(
                        "phase {} transitions backward to {next}",
                        phase.id
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    #[must_use]
    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Pick the phase a discovered URL belongs to, by filter match. The first
    /// phase whose filter accepts the URL wins; URLs matching nothing stay in
    /// the phase that discovered them.
    #[must_use]
    pub fn assign_phase<'a>(
        &'a self,
        markers: &[String],
        depth: u32,
        discovering_phase: &'a str,
    ) -> &'a str {
        for phase in &self.phases {
            if let Some(filter) = &phase.url_filter {
                if filter.matches(markers, depth) {
                    return &phase.id;
                }
            }
        }
        discovering_phase
    }
}

/// Cron-driven health check registration for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSchedule {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// cron expression, seconds field included (`0 30 9 * * *`)
    pub cron: String,
    #[serde(default)]
    pub notification_config: Option<Value>,
    pub enabled: bool,
}
