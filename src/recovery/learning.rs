//! Learning loop: AI suggestions become rules once they earn it.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::config::LearningConfig;
use crate::model::{LearnedAction, RecoveryAction, RecoveryRule, RuleOrigin};

/// Priority assigned to promoted rules: ahead of builtins, behind
/// user-authored rules at default priorities.
const LEARNED_RULE_PRIORITY: i32 = 50;

pub struct LearningLog {
    entries: DashMap<String, LearnedAction>,
    config: LearningConfig,
}

impl LearningLog {
    #[must_use]
    pub fn new(config: LearningConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Seed from persisted state at startup.
    pub fn load(&self, actions: Vec<LearnedAction>) {
        for action in actions {
            let signature =
                LearnedAction::signature(&action.pattern, &action.domain, &action.action);
            self.entries.insert(signature, action);
        }
    }

    /// Record that the AI suggested `action` for `(pattern, domain)`.
    /// Returns the signature used for later outcome attribution.
    pub fn record_suggestion(
        &self,
        pattern: &str,
        domain: &str,
        action: &RecoveryAction,
    ) -> String {
        let signature = LearnedAction::signature(pattern, domain, action);
        let now = Utc::now();
        self.entries
            .entry(signature.clone())
            .and_modify(|entry| {
                entry.occurrences += 1;
                entry.last_seen = now;
            })
            .or_insert_with(|| LearnedAction {
                pattern: pattern.to_string(),
                domain: domain.to_string(),
                action: action.clone(),
                occurrences: 1,
                successes: 0,
                promoted_rule_id: None,
                first_seen: now,
                last_seen: now,
            });
        signature
    }

    /// Attribute a task outcome to a previously-suggested action.
    pub fn record_outcome(&self, signature: &str, success: bool) {
        if let Some(mut entry) = self.entries.get_mut(signature) {
            if success {
                entry.successes += 1;
            }
            entry.last_seen = Utc::now();
        }
    }

    #[must_use]
    pub fn get(&self, signature: &str) -> Option<LearnedAction> {
        self.entries.get(signature).map(|e| e.clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<LearnedAction> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Materialize rules for signatures past the promotion bar. Marks the
    /// entries promoted; returns the new rules for registration/persistence.
    pub fn promote_ready(&self) -> Vec<RecoveryRule> {
        let mut promoted = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if entry.promoted_rule_id.is_some() {
                continue;
            }
            if entry.successes < self.config.promotion_threshold
                || entry.success_rate() < self.config.min_success_rate
            {
                continue;
            }
            let rule_id = format!(
                "learned-{}-{}-{}",
                entry.pattern,
                entry.domain.replace('.', "-"),
                entry.action.name()
            );
            let rule = RecoveryRule {
                id: rule_id.clone(),
                name: format!("learned: {} on {}", entry.action.name(), entry.domain),
                priority: LEARNED_RULE_PRIORITY,
                enabled: true,
                pattern: entry.pattern.clone(),
                conditions: vec![crate::model::Condition {
                    field: "domain".to_string(),
                    operator: crate::model::ConditionOperator::Equals,
                    value: serde_json::Value::String(entry.domain.clone()),
                }],
                action: entry.action.clone(),
                max_retries: 3,
                retry_delay: 0,
                origin: RuleOrigin::Learned,
                success_count: entry.successes,
                failure_count: entry.occurrences - entry.successes,
            };
            entry.promoted_rule_id = Some(rule_id);
            promoted.push(rule);
        }
        promoted
    }

    /// Discard unpromoted signatures idle past the cleanup window. Returns
    /// the removed signatures so persisted copies can be deleted too.
    pub fn cleanup(&self) -> Vec<String> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(self.config.cleanup_days));
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.promoted_rule_id.is_none() && e.last_seen < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for signature in &stale {
            self.entries.remove(signature);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(threshold: u64, rate: f64) -> LearningLog {
        LearningLog::new(LearningConfig {
            enabled: true,
            promotion_threshold: threshold,
            min_success_rate: rate,
            cleanup_days: 14,
            promoter_interval_secs: 300,
        })
    }

    #[test]
    fn promotion_after_threshold_successes() {
        let log = log(3, 0.7);
        let action = RecoveryAction::RotateUserAgent;

        for _ in 0..3 {
            let sig = log.record_suggestion("blocked", "a.test", &action);
            log.record_outcome(&sig, true);
        }

        let rules = log.promote_ready();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.origin, RuleOrigin::Learned);
        assert_eq!(rule.pattern, "blocked");
        assert_eq!(rule.action, RecoveryAction::RotateUserAgent);
        // Scoped to the domain it was learned on.
        assert_eq!(rule.conditions.len(), 1);

        // Second pass promotes nothing new.
        assert!(log.promote_ready().is_empty());
    }

    #[test]
    fn low_success_rate_blocks_promotion() {
        let log = log(3, 0.7);
        let action = RecoveryAction::Retry;
        for i in 0..10 {
            let sig = log.record_suggestion("timeout", "b.test", &action);
            log.record_outcome(&sig, i < 3); // 3 of 10
        }
        assert!(log.promote_ready().is_empty());
    }

    #[test]
    fn cleanup_removes_stale_unpromoted() {
        let log = log(99, 0.99);
        let sig = log.record_suggestion("blocked", "c.test", &RecoveryAction::Retry);
        // Backdate the entry past the cleanup window.
        if let Some(mut entry) = log.entries.get_mut(&sig) {
            entry.last_seen = Utc::now() - ChronoDuration::days(30);
        }
        let removed = log.cleanup();
        assert_eq!(removed, vec![sig.clone()]);
        assert!(log.get(&sig).is_none());
    }
}
