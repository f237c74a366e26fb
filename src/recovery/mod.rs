//! Error-recovery decision engine.
//!
//! Three layers: the analyzer watches per-domain failure windows, the rule
//! engine maps detected patterns to declarative actions, and an optional AI
//! fallback covers patterns no rule matches. AI suggestions feed the
//! learning loop, which promotes consistently-successful suggestions into
//! real rules. Each task has a total attempt budget; exhausting it opens an
//! incident and dead-letters the task.

pub mod ai;
pub mod analyzer;
pub mod learning;
pub mod rules;

pub use ai::{AiClient, AiProblem, AiSuggestion};
pub use analyzer::{DetectedPattern, DomainHealthSnapshot, PatternAnalyzer};
pub use learning::LearningLog;
pub use rules::{RuleContext, RuleEngine, builtin_rules};

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, ErrorKind};
use crate::model::{
    AttemptRecord, Incident, IncidentPriority, IncidentStatus, RecoveryAction, UrlTask,
};
use crate::proxy::ProxyPool;
use crate::store::MetadataStore;

/// Everything the engine needs to decide a failure's disposition.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub execution_id: Uuid,
    pub task: UrlTask,
    pub node_id: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    /// 1-based attempt number within this task (node retries included).
    pub attempt: u32,
}

impl FailureContext {
    #[must_use]
    pub fn domain(&self) -> String {
        self.task.domain()
    }
}

/// Browser/profile side effects a retry carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryDirective {
    pub delay: Duration,
    pub switch_browser: bool,
    pub switch_proxy: bool,
    pub rotate_user_agent: bool,
    pub clear_cookies: bool,
}

/// The decision handed back to the interpreter/worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDirective {
    /// Re-run the failed node after applying the directive's side effects.
    Retry(RetryDirective),
    /// Release the task back to the queue, visible again after `delay`.
    Defer { delay: Duration },
    /// Dead-letter the task under a category.
    Dlq { category: String },
    /// Budget exhausted or unrecoverable; caller opens an incident.
    Exhausted,
}

pub struct RecoveryEngine {
    analyzer: PatternAnalyzer,
    rules: RuleEngine,
    ai: Option<AiClient>,
    learning: LearningLog,
    proxies: Arc<ProxyPool>,
    store: Option<Arc<MetadataStore>>,
    config: EngineConfig,
    /// Last applied AI suggestion per domain, awaiting outcome attribution.
    pending_attribution: DashMap<String, String>,
    /// Attempt histories per task, folded into incidents on exhaustion.
    attempt_log: DashMap<Uuid, Vec<AttemptRecord>>,
    /// Human follow-ups suggested by the AI per task.
    suggested_actions: DashMap<Uuid, Vec<String>>,
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        proxies: Arc<ProxyPool>,
        store: Option<Arc<MetadataStore>>,
    ) -> Self {
        let ai = if config.ai.enabled {
            match AiClient::new(config.ai.clone()) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("ai fallback disabled: {e}");
                    None
                }
            }
        } else {
            None
        };
        Self {
            analyzer: PatternAnalyzer::new(config.recovery.clone()),
            rules: RuleEngine::with_builtins(),
            ai,
            learning: LearningLog::new(config.learning.clone()),
            proxies,
            store,
            config,
            pending_attribution: DashMap::new(),
            attempt_log: DashMap::new(),
            suggested_actions: DashMap::new(),
        }
    }

    /// Load persisted user/learned rules and learned-action state.
    pub async fn load_persisted(&self) -> crate::error::EngineResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut rules = builtin_rules();
        rules.extend(store.list_rules().await?);
        self.rules.load(rules);
        self.learning.load(store.list_learned_actions().await?);
        Ok(())
    }

    #[must_use]
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    #[must_use]
    pub fn analyzer(&self) -> &PatternAnalyzer {
        &self.analyzer
    }

    #[must_use]
    pub fn learning(&self) -> &LearningLog {
        &self.learning
    }

    /// Remaining skip-domain block, if any. Workers consult this before
    /// touching a task.
    #[must_use]
    pub fn domain_blocked(&self, domain: &str) -> Option<Duration> {
        self.analyzer.blocked_remaining(domain)
    }

    /// Record a task-level success for its domain; closes the attribution
    /// window for any pending AI suggestion there.
    pub async fn record_success(&self, domain: &str) {
        self.analyzer.record_success(domain);
        if let Some((_, signature)) = self.pending_attribution.remove(domain) {
            self.learning.record_outcome(&signature, true);
            self.persist_learned(&signature).await;
        }
    }

    /// Drop per-task scratch state once a task reaches a terminal status.
    pub fn forget_task(&self, task_id: Uuid) {
        self.attempt_log.remove(&task_id);
        self.suggested_actions.remove(&task_id);
    }

    /// Decide what happens after a failed attempt.
    pub async fn handle_failure(&self, fctx: &FailureContext) -> RecoveryDirective {
        let domain = fctx.domain();
        let pattern = fctx.error_kind.as_str();

        // Failed attempt closes a pending AI attribution as unsuccessful.
        if let Some((_, signature)) = self.pending_attribution.remove(&domain) {
            self.learning.record_outcome(&signature, false);
            self.persist_learned(&signature).await;
        }

        self.log_attempt(fctx, None);

        if fctx.error_kind == ErrorKind::Cancelled {
            return RecoveryDirective::Exhausted;
        }

        // The window sees every real failure, budget-exhausted ones included.
        let detected = self.analyzer.record_failure(&domain, fctx.error_kind);

        if fctx.attempt >= self.config.recovery.max_attempts {
            debug!(
                task = %fctx.task.task_id,
                attempt = fctx.attempt,
                "recovery budget exhausted"
            );
            return RecoveryDirective::Exhausted;
        }

        // Rules fire on analyzer activation, and immediately for kinds that
        // are pointless to blind-retry (captcha, auth walls, 404s, blocks).
        let consult_rules = detected.is_some() || !fctx.error_kind.is_retryable();
        if consult_rules {
            let rule_ctx = self.rule_context(fctx, &domain);
            if let Some(rule) = self.rules.select(pattern, &rule_ctx) {
                info!(
                    rule = rule.id,
                    pattern, domain, "recovery rule selected"
                );
                self.amend_last_attempt(fctx.task.task_id, rule.action.clone());
                return self.apply_action(&rule.action, fctx, &domain, rule.retry_delay);
            }
            if let Some(ai) = &self.ai {
                if let Some(directive) = self.consult_ai(ai, fctx, &domain, pattern).await {
                    return directive;
                }
            }
        }

        // Default disposition: plain retry with kind-weighted backoff.
        if fctx.error_kind.is_retryable() {
            RecoveryDirective::Retry(RetryDirective {
                delay: default_backoff(fctx.attempt, fctx.error_kind),
                ..RetryDirective::default()
            })
        } else {
            RecoveryDirective::Exhausted
        }
    }

    async fn consult_ai(
        &self,
        ai: &AiClient,
        fctx: &FailureContext,
        domain: &str,
        pattern: &str,
    ) -> Option<RecoveryDirective> {
        let history = self
            .attempt_log
            .get(&fctx.task.task_id)
            .map(|log| {
                log.iter()
                    .map(|a| format!("attempt {}: {} ({})", a.attempt, a.pattern, a.error))
                    .collect()
            })
            .unwrap_or_default();
        let problem = AiProblem {
            pattern: pattern.to_string(),
            domain: domain.to_string(),
            url: fctx.task.url.clone(),
            error_message: fctx.message.clone(),
            retry_count: fctx.task.retry_count,
            history,
            page_excerpt: None,
        };
        match ai.suggest(&problem).await {
            Ok(suggestion) => {
                info!(
                    action = suggestion.action.name(),
                    domain, pattern, "ai fallback suggested action"
                );
                let signature =
                    self.learning
                        .record_suggestion(pattern, domain, &suggestion.action);
                self.pending_attribution
                    .insert(domain.to_string(), signature.clone());
                self.persist_learned(&signature).await;
                if !suggestion.suggested_human_actions.is_empty() {
                    self.suggested_actions
                        .entry(fctx.task.task_id)
                        .or_default()
                        .extend(suggestion.suggested_human_actions);
                }
                self.amend_last_attempt(fctx.task.task_id, suggestion.action.clone());
                Some(self.apply_action(&suggestion.action, fctx, domain, 0))
            }
            Err(e) => {
                warn!("ai fallback failed: {e}");
                None
            }
        }
    }

    /// Map an action to its declarative effect on the task disposition and
    /// shared state.
    fn apply_action(
        &self,
        action: &RecoveryAction,
        fctx: &FailureContext,
        domain: &str,
        rule_delay_secs: u64,
    ) -> RecoveryDirective {
        let base_delay = Duration::from_secs(rule_delay_secs);
        match action {
            RecoveryAction::Retry => RecoveryDirective::Retry(RetryDirective {
                delay: base_delay.max(default_backoff(fctx.attempt, fctx.error_kind)),
                ..RetryDirective::default()
            }),
            RecoveryAction::AddDelay { seconds } => RecoveryDirective::Retry(RetryDirective {
                delay: Duration::from_secs(*seconds),
                ..RetryDirective::default()
            }),
            RecoveryAction::RetryWithBrowser => RecoveryDirective::Retry(RetryDirective {
                delay: base_delay,
                switch_browser: true,
                ..RetryDirective::default()
            }),
            RecoveryAction::RotateUserAgent => RecoveryDirective::Retry(RetryDirective {
                delay: base_delay,
                rotate_user_agent: true,
                switch_browser: true,
                ..RetryDirective::default()
            }),
            RecoveryAction::ClearCookies => RecoveryDirective::Retry(RetryDirective {
                delay: base_delay,
                clear_cookies: true,
                ..RetryDirective::default()
            }),
            RecoveryAction::SwitchProxy => {
                if self.proxies.enabled() {
                    RecoveryDirective::Retry(RetryDirective {
                        delay: base_delay,
                        switch_proxy: true,
                        switch_browser: true,
                        ..RetryDirective::default()
                    })
                } else {
                    // No proxies configured; degrade to a fresh browser.
                    RecoveryDirective::Retry(RetryDirective {
                        delay: base_delay,
                        switch_browser: true,
                        ..RetryDirective::default()
                    })
                }
            }
            RecoveryAction::SkipDomain { block_duration } => {
                let duration = self.analyzer.block(
                    domain,
                    Duration::from_secs(*block_duration),
                    Duration::from_secs(self.config.domain.max_block_duration),
                );
                RecoveryDirective::Defer { delay: duration }
            }
            RecoveryAction::SendToDlq { category } => RecoveryDirective::Dlq {
                category: category.clone(),
            },
        }
    }

    fn rule_context(&self, fctx: &FailureContext, domain: &str) -> RuleContext {
        let mut ctx = RuleContext::new();
        ctx.set("domain", serde_json::json!(domain))
            .set("url", serde_json::json!(fctx.task.url))
            .set("depth", serde_json::json!(fctx.task.depth))
            .set("retry_count", serde_json::json!(fctx.task.retry_count))
            .set("attempt", serde_json::json!(fctx.attempt))
            .set("message", serde_json::json!(fctx.message))
            .set("node_id", serde_json::json!(fctx.node_id));
        if let Some(status) = fctx.status_code {
            ctx.set("status_code", serde_json::json!(status));
        }
        ctx
    }

    fn log_attempt(&self, fctx: &FailureContext, action: Option<RecoveryAction>) {
        self.attempt_log
            .entry(fctx.task.task_id)
            .or_default()
            .push(AttemptRecord {
                attempt: fctx.attempt,
                pattern: fctx.error_kind.as_str().to_string(),
                action,
                error: fctx.message.clone(),
                at: Utc::now(),
            });
    }

    fn amend_last_attempt(&self, task_id: Uuid, action: RecoveryAction) {
        if let Some(mut log) = self.attempt_log.get_mut(&task_id) {
            if let Some(last) = log.last_mut() {
                last.action = Some(action);
            }
        }
    }

    /// Assemble the incident for an exhausted task. The caller captured page
    /// state while it still held the browser lease.
    pub async fn build_incident(
        &self,
        fctx: &FailureContext,
        dom_snapshot: Option<String>,
        screenshot_ref: Option<String>,
        headers: serde_json::Value,
        cookies: serde_json::Value,
    ) -> Incident {
        let attempts = self
            .attempt_log
            .get(&fctx.task.task_id)
            .map(|log| log.clone())
            .unwrap_or_default();
        let suggested_actions = self
            .suggested_actions
            .get(&fctx.task.task_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        let priority = match fctx.error_kind {
            ErrorKind::Captcha | ErrorKind::Blocked | ErrorKind::AuthRequired => {
                IncidentPriority::High
            }
            ErrorKind::LayoutChanged => IncidentPriority::Medium,
            _ => IncidentPriority::Low,
        };

        let incident = Incident {
            id: Uuid::new_v4(),
            execution_id: fctx.execution_id,
            task_id: fctx.task.task_id,
            url: fctx.task.url.clone(),
            domain: fctx.domain(),
            pattern: fctx.error_kind.as_str().to_string(),
            dom_snapshot,
            screenshot_ref,
            headers,
            cookies,
            attempts,
            suggested_actions,
            priority,
            status: IncidentStatus::Open,
            created_at: Utc::now(),
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_incident(&incident).await {
                warn!("failed to persist incident {}: {e}", incident.id);
            }
        }
        incident
    }

    async fn persist_learned(&self, signature: &str) {
        let (Some(store), Some(action)) = (&self.store, self.learning.get(signature)) else {
            return;
        };
        if let Err(e) = store.upsert_learned_action(&action).await {
            warn!("failed to persist learned action {signature}: {e}");
        }
    }

    /// Background learning promoter: periodically materialize earned rules
    /// and discard stale learned actions.
    pub fn spawn_promoter(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.learning.enabled {
                return;
            }
            let interval =
                Duration::from_secs(self.config.learning.promoter_interval_secs.max(5));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                self.run_promotion_pass().await;
            }
        })
    }

    /// One promoter pass, also callable directly (tests, shutdown flush).
    pub async fn run_promotion_pass(&self) {
        for rule in self.learning.promote_ready() {
            info!(rule = rule.id, pattern = rule.pattern, "promoting learned action to rule");
            self.rules.add(rule.clone());
            if let Some(store) = &self.store {
                if let Err(e) = store.upsert_rule(&rule).await {
                    warn!("failed to persist promoted rule {}: {e}", rule.id);
                }
            }
        }
        for signature in self.learning.cleanup() {
            if let Some(store) = &self.store {
                if let Err(e) = store.delete_learned_action(&signature).await {
                    warn!("failed to delete learned action {signature}: {e}");
                }
            }
        }
    }
}

/// Exponential backoff with jitter, weighted by failure kind.
#[must_use]
pub fn default_backoff(attempt: u32, kind: ErrorKind) -> Duration {
    const BASE_DELAY_MS: u64 = 1000;
    const MAX_DELAY_MS: u64 = 30_000;
    const JITTER: f64 = 0.2;

    let exp = BASE_DELAY_MS.saturating_mul(1 << attempt.min(5));
    let weighted = (exp as f64 * kind.delay_multiplier()) as u64;
    let jitter = rand::rng().random_range(-JITTER..=JITTER);
    let jittered = (weighted as f64 * (1.0 + jitter)) as u64;
    Duration::from_millis(jittered.min(MAX_DELAY_MS))
}

/// Convenience: build a failure context from an engine error.
#[must_use]
pub fn failure_context(
    execution_id: Uuid,
    task: &UrlTask,
    node_id: &str,
    error: &EngineError,
    attempt: u32,
) -> FailureContext {
    FailureContext {
        execution_id,
        task: task.clone(),
        node_id: node_id.to_string(),
        error_kind: error.kind,
        message: error.message.clone(),
        status_code: error.status_code,
        attempt,
    }
}
