//! Declarative recovery rule evaluation.
//!
//! Rules are evaluated in ascending priority order; the first enabled rule
//! whose pattern equals the detected pattern and whose conditions all hold
//! wins. Ties on priority break on rule id, so selection is deterministic
//! for a given rule set and context.

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::model::{Condition, ConditionOperator, RecoveryAction, RecoveryRule, RuleOrigin};

/// Flat field map a rule's conditions are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    fields: Map<String, Value>,
}

impl RuleContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
        self.fields.insert(field.into(), value);
        self
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

pub struct RuleEngine {
    rules: RwLock<Vec<RecoveryRule>>,
}

impl RuleEngine {
    #[must_use]
    pub fn new(mut rules: Vec<RecoveryRule>) -> Self {
        sort_rules(&mut rules);
        Self {
            rules: RwLock::new(rules),
        }
    }

    #[must_use]
    pub fn with_builtins() -> Self {
        Self::new(builtin_rules())
    }

    /// Replace the rule set (config reload).
    pub fn load(&self, mut rules: Vec<RecoveryRule>) {
        sort_rules(&mut rules);
        *self.rules.write() = rules;
    }

    /// Add one rule, keeping evaluation order. Replaces an existing rule
    /// with the same id.
    pub fn add(&self, rule: RecoveryRule) {
        let mut rules = self.rules.write();
        rules.retain(|r| r.id != rule.id);
        rules.push(rule);
        sort_rules(&mut rules);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<RecoveryRule> {
        self.rules.read().clone()
    }

    /// Select the first matching rule for a pattern and context.
    #[must_use]
    pub fn select(&self, pattern: &str, ctx: &RuleContext) -> Option<RecoveryRule> {
        let rules = self.rules.read();
        rules
            .iter()
            .find(|rule| {
                rule.enabled
                    && rule.pattern == pattern
                    && rule.conditions.iter().all(|c| condition_matches(c, ctx))
            })
            .cloned()
    }

    pub fn record_outcome(&self, rule_id: &str, success: bool) {
        let mut rules = self.rules.write();
        if let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) {
            if success {
                rule.success_count += 1;
            } else {
                rule.failure_count += 1;
            }
        }
    }
}

fn sort_rules(rules: &mut [RecoveryRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
}

fn condition_matches(condition: &Condition, ctx: &RuleContext) -> bool {
    let Some(actual) = ctx.get(&condition.field) else {
        return false;
    };
    match condition.operator {
        ConditionOperator::Equals => actual == &condition.value,
        ConditionOperator::Contains => match (actual.as_str(), condition.value.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        ConditionOperator::Regex => match (actual.as_str(), condition.value.as_str()) {
            (Some(haystack), Some(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(haystack))
                .unwrap_or(false),
            _ => false,
        },
        ConditionOperator::Gt => match (actual.as_f64(), condition.value.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::Lt => match (actual.as_f64(), condition.value.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

/// Rules shipped with the engine. Users and the learning promoter layer
/// their own on top; builtins sit at high priority numbers so custom rules
/// win ties of intent.
#[must_use]
pub fn builtin_rules() -> Vec<RecoveryRule> {
    fn rule(
        id: &str,
        priority: i32,
        pattern: &str,
        action: RecoveryAction,
        max_retries: u32,
    ) -> RecoveryRule {
        RecoveryRule {
            id: id.to_string(),
            name: id.replace('-', " "),
            priority,
            enabled: true,
            pattern: pattern.to_string(),
            conditions: Vec::new(),
            action,
            max_retries,
            retry_delay: 0,
            origin: RuleOrigin::Builtin,
            success_count: 0,
            failure_count: 0,
        }
    }

    vec![
        rule(
            "builtin-rate-limited-delay",
            100,
            "rate_limited",
            RecoveryAction::AddDelay { seconds: 30 },
            5,
        ),
        rule(
            "builtin-captcha-dlq",
            100,
            "captcha",
            RecoveryAction::SendToDlq {
                category: "captcha".to_string(),
            },
            0,
        ),
        rule(
            "builtin-blocked-rotate-ua",
            110,
            "blocked",
            RecoveryAction::RotateUserAgent,
            3,
        ),
        rule(
            "builtin-server-error-delay",
            120,
            "server_error",
            RecoveryAction::AddDelay { seconds: 10 },
            4,
        ),
        rule(
            "builtin-connection-retry",
            120,
            "connection_error",
            RecoveryAction::Retry,
            4,
        ),
        rule(
            "builtin-timeout-fresh-browser",
            130,
            "timeout",
            RecoveryAction::RetryWithBrowser,
            3,
        ),
        rule(
            "builtin-auth-dlq",
            140,
            "auth_required",
            RecoveryAction::SendToDlq {
                category: "auth_required".to_string(),
            },
            0,
        ),
        rule(
            "builtin-not-found-dlq",
            140,
            "not_found",
            RecoveryAction::SendToDlq {
                category: "not_found".to_string(),
            },
            0,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(field: &str, value: Value) -> RuleContext {
        let mut ctx = RuleContext::new();
        ctx.set(field, value);
        ctx
    }

    #[test]
    fn selects_lowest_priority_first_with_id_tiebreak() {
        let mk = |id: &str, priority: i32| RecoveryRule {
            id: id.to_string(),
            name: String::new(),
            priority,
            enabled: true,
            pattern: "blocked".to_string(),
            conditions: vec![],
            action: RecoveryAction::Retry,
            max_retries: 3,
            retry_delay: 0,
            origin: RuleOrigin::User,
            success_count: 0,
            failure_count: 0,
        };
        let engine = RuleEngine::new(vec![mk("zed", 10), mk("abc", 10), mk("first", 1)]);
        let ctx = RuleContext::new();

        let selected = engine.select("blocked", &ctx).unwrap();
        assert_eq!(selected.id, "first");

        // Deterministic: repeated selection returns the same rule.
        for _ in 0..5 {
            assert_eq!(engine.select("blocked", &ctx).unwrap().id, "first");
        }

        // Remove the winner; the id tiebreak decides between the two at 10.
        let remaining: Vec<_> = engine
            .snapshot()
            .into_iter()
            .filter(|r| r.id != "first")
            .collect();
        let engine = RuleEngine::new(remaining);
        assert_eq!(engine.select("blocked", &ctx).unwrap().id, "abc");
    }

    #[test]
    fn conditions_gate_matching() {
        let rule = RecoveryRule {
            id: "only-deep".to_string(),
            name: String::new(),
            priority: 1,
            enabled: true,
            pattern: "timeout".to_string(),
            conditions: vec![Condition {
                field: "retry_count".to_string(),
                operator: ConditionOperator::Lt,
                value: json!(3),
            }],
            action: RecoveryAction::Retry,
            max_retries: 3,
            retry_delay: 0,
            origin: RuleOrigin::User,
            success_count: 0,
            failure_count: 0,
        };
        let engine = RuleEngine::new(vec![rule]);

        assert!(engine.select("timeout", &ctx_with("retry_count", json!(1))).is_some());
        assert!(engine.select("timeout", &ctx_with("retry_count", json!(5))).is_none());
        // Missing field never matches.
        assert!(engine.select("timeout", &RuleContext::new()).is_none());
    }

    #[test]
    fn operator_semantics() {
        let cond = |op, value| Condition {
            field: "domain".to_string(),
            operator: op,
            value,
        };
        let ctx = ctx_with("domain", json!("shop.example.test"));

        assert!(condition_matches(&cond(ConditionOperator::Contains, json!("example")), &ctx));
        assert!(!condition_matches(&cond(ConditionOperator::Contains, json!("other")), &ctx));
        assert!(condition_matches(
            &cond(ConditionOperator::Regex, json!(r"^shop\..*\.test$")),
            &ctx
        ));
        assert!(condition_matches(
            &cond(ConditionOperator::Equals, json!("shop.example.test")),
            &ctx
        ));
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut rules = builtin_rules();
        for rule in &mut rules {
            rule.enabled = false;
        }
        let engine = RuleEngine::new(rules);
        assert!(engine.select("captcha", &RuleContext::new()).is_none());
    }

    #[test]
    fn builtin_captcha_goes_to_dlq() {
        let engine = RuleEngine::with_builtins();
        let selected = engine.select("captcha", &RuleContext::new()).unwrap();
        assert!(matches!(
            selected.action,
            RecoveryAction::SendToDlq { ref category } if category == "captcha"
        ));
    }
}
