//! Recovery rules, learned actions and incidents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of recovery actions a rule or the AI fallback may select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum RecoveryAction {
    SwitchProxy,
    AddDelay { seconds: u64 },
    Retry,
    RetryWithBrowser,
    RotateUserAgent,
    ClearCookies,
    SkipDomain { block_duration: u64 },
    SendToDlq { category: String },
}

impl RecoveryAction {
    /// Stable name used in learned-action signatures and logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SwitchProxy => "switch_proxy",
            Self::AddDelay { .. } => "add_delay",
            Self::Retry => "retry",
            Self::RetryWithBrowser => "retry_with_browser",
            Self::RotateUserAgent => "rotate_user_agent",
            Self::ClearCookies => "clear_cookies",
            Self::SkipDomain { .. } => "skip_domain",
            Self::SendToDlq { .. } => "send_to_dlq",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Regex,
    Gt,
    Lt,
}

/// A single rule condition evaluated against the failure context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Field name in the failure context (`domain`, `retry_count`, `depth`,
    /// `message`, `status_code`, ...)
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    Builtin,
    User,
    Learned,
}

/// Declarative recovery directive. Lower `priority` numeric is evaluated
/// first; ties break on rule id so selection is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    /// Error pattern this rule matches (`ErrorKind::as_str()` values).
    pub pattern: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(flatten)]
    pub action: RecoveryAction,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in seconds applied before a retry this rule triggers.
    #[serde(default)]
    pub retry_delay: u64,
    #[serde(default = "default_origin")]
    pub origin: RuleOrigin,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_origin() -> RuleOrigin {
    RuleOrigin::User
}

/// Aggregated outcome of AI-suggested actions, keyed by signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedAction {
    pub pattern: String,
    pub domain: String,
    pub action: RecoveryAction,
    pub occurrences: u64,
    pub successes: u64,
    pub promoted_rule_id: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl LearnedAction {
    /// Stable signature used for dedup and promotion bookkeeping.
    #[must_use]
    pub fn signature(pattern: &str, domain: &str, action: &RecoveryAction) -> String {
        format!("{pattern}|{domain}|{}", action.name())
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.occurrences == 0 {
            return 0.0;
        }
        self.successes as f64 / self.occurrences as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    InProgress,
    Resolved,
}

/// One attempt entry in an incident's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub pattern: String,
    pub action: Option<RecoveryAction>,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Assembled when all recovery attempts for a task are exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub task_id: Uuid,
    pub url: String,
    pub domain: String,
    pub pattern: String,
    /// Page HTML captured at final failure, when a page was available.
    pub dom_snapshot: Option<String>,
    /// Path or key of the screenshot artifact.
    pub screenshot_ref: Option<String>,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub cookies: Value,
    pub attempts: Vec<AttemptRecord>,
    /// Human follow-ups suggested by the AI fallback, if it was consulted.
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    pub priority: IncidentPriority,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rule_json_shape() {
        let raw = json!({
            "id": "r-rate-limit",
            "name": "back off on 429",
            "priority": 10,
            "enabled": true,
            "pattern": "rate_limited",
            "conditions": [
                {"field": "retry_count", "operator": "lt", "value": 5}
            ],
            "action": "add_delay",
            "params": {"seconds": 30},
            "max_retries": 5
        });
        let rule: RecoveryRule = serde_json::from_value(raw).unwrap();
        assert_eq!(rule.action, RecoveryAction::AddDelay { seconds: 30 });
        assert_eq!(rule.origin, RuleOrigin::User);
    }

    #[test]
    fn learned_signature_is_stable() {
        let sig = LearnedAction::signature("blocked", "a.test", &RecoveryAction::RotateUserAgent);
        assert_eq!(sig, "blocked|a.test|rotate_user_agent");
    }
}
