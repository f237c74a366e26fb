//! Recovery engine integration: AI fallback, learning promotion, incident
//! persistence.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crawlflow::canon::CanonicalUrl;
use crawlflow::config::EngineConfig;
use crawlflow::error::ErrorKind;
use crawlflow::model::{RecoveryAction, RuleOrigin, UrlTask};
use crawlflow::proxy::ProxyPool;
use crawlflow::recovery::{FailureContext, RecoveryDirective, RecoveryEngine, RetryDirective};
use crawlflow::store::MetadataStore;

fn failure(kind: ErrorKind, attempt: u32, url: &str) -> FailureContext {
    let canonical = CanonicalUrl::parse(url).unwrap();
    let task = UrlTask::new(Uuid::new_v4(), &canonical, "p1", 0, vec![], Uuid::new_v4());
    FailureContext {
        execution_id: Uuid::new_v4(),
        task,
        node_id: "n1".to_string(),
        error_kind: kind,
        message: format!("{kind} induced"),
        status_code: None,
        attempt,
    }
}

async fn store() -> (tempfile::TempDir, Arc<MetadataStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open(&dir.path().join("meta.sqlite"), Default::default())
        .await
        .unwrap();
    (dir, Arc::new(store))
}

/// Learning promotion end to end: the AI suggests the same action three
/// times with success, a learned rule materializes and outranks the AI path
/// thereafter.
#[tokio::test]
async fn ai_suggestions_promote_to_learned_rule() {
    let mut server = mockito::Server::new_async().await;
    let ai_mock = server
        .mock("POST", "/advise")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"action": "rotate_user_agent", "params": null}"#)
        .expect(3)
        .create_async()
        .await;

    let (_dir, store) = store().await;
    let mut config = EngineConfig::default();
    config.ai.enabled = true;
    config.ai.endpoint = format!("{}/advise", server.url());
    config.learning.enabled = true;
    config.learning.promotion_threshold = 3;
    config.learning.min_success_rate = 0.7;

    let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
    let engine = Arc::new(RecoveryEngine::new(config, proxies, Some(store.clone())));

    // layout_changed has no builtin rule, so the AI fallback is consulted.
    // Three suggest→succeed cycles on the same (pattern, domain).
    for attempt in 1..=3 {
        let fctx = failure(ErrorKind::LayoutChanged, attempt, "https://a.test/page");
        let directive = engine.handle_failure(&fctx).await;
        assert_eq!(
            directive,
            RecoveryDirective::Retry(RetryDirective {
                rotate_user_agent: true,
                switch_browser: true,
                ..RetryDirective::default()
            })
        );
        engine.record_success("a.test").await;
    }
    ai_mock.assert_async().await;

    engine.run_promotion_pass().await;

    // The learned rule exists, scoped to the domain it was learned on.
    let learned: Vec<_> = engine
        .rules()
        .snapshot()
        .into_iter()
        .filter(|r| r.origin == RuleOrigin::Learned)
        .collect();
    assert_eq!(learned.len(), 1);
    assert_eq!(learned[0].pattern, "layout_changed");
    assert_eq!(learned[0].action, RecoveryAction::RotateUserAgent);

    // Persisted alongside the in-memory copy.
    let persisted = store.list_rules().await.unwrap();
    assert!(persisted.iter().any(|r| r.origin == RuleOrigin::Learned));

    // Next failure on that domain hits the rule, not the AI endpoint
    // (expect(3) above would fail the mock otherwise).
    let fctx = failure(ErrorKind::LayoutChanged, 1, "https://a.test/other");
    let directive = engine.handle_failure(&fctx).await;
    assert_eq!(
        directive,
        RecoveryDirective::Retry(RetryDirective {
            rotate_user_agent: true,
            switch_browser: true,
            ..RetryDirective::default()
        })
    );
}

/// Exhaustion opens an incident that survives in the store with its attempt
/// history and DOM snapshot.
#[tokio::test]
async fn exhaustion_persists_incident() {
    let (_dir, store) = store().await;
    let mut config = EngineConfig::default();
    config.recovery.max_attempts = 2;
    let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
    let engine = RecoveryEngine::new(config, proxies, Some(store.clone()));

    let first = failure(ErrorKind::Captcha, 1, "https://cap.test/login");
    // Captcha rule sends to DLQ immediately.
    let directive = engine.handle_failure(&first).await;
    assert_eq!(
        directive,
        RecoveryDirective::Dlq {
            category: "captcha".to_string()
        }
    );

    let incident = engine
        .build_incident(
            &first,
            Some("<html><body>prove you are human</body></html>".to_string()),
            Some("/artifacts/cap.png".to_string()),
            serde_json::json!({"server": "nginx"}),
            serde_json::json!({}),
        )
        .await;
    assert_eq!(
        incident.priority,
        crawlflow::model::IncidentPriority::High
    );
    assert_eq!(incident.attempts.len(), 1);

    assert_eq!(store.count_incidents(first.execution_id).await.unwrap(), 1);
}

/// Failed attempts after an AI suggestion count against the signature, so a
/// losing action never promotes.
#[tokio::test]
async fn failed_attribution_blocks_promotion() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/advise")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"action": "clear_cookies"}"#)
        .create_async()
        .await;

    let mut config = EngineConfig::default();
    config.ai.enabled = true;
    config.ai.endpoint = format!("{}/advise", server.url());
    config.learning.enabled = true;
    config.learning.promotion_threshold = 2;
    let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
    let engine = RecoveryEngine::new(config, proxies, None);

    // Suggest, then fail again on the same domain: attribution is negative.
    for attempt in 1..=4 {
        let fctx = failure(ErrorKind::LayoutChanged, attempt, "https://b.test/x");
        let _ = engine.handle_failure(&fctx).await;
    }
    engine.run_promotion_pass().await;
    assert!(
        engine
            .rules()
            .snapshot()
            .iter()
            .all(|r| r.origin != RuleOrigin::Learned)
    );
}

/// skip_domain blocks are visible to every caller of the engine.
#[tokio::test]
async fn skip_domain_is_shared_state() {
    let mut config = EngineConfig::default();
    config.domain.max_block_duration = 120;
    let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
    let engine = RecoveryEngine::new(config, proxies, None);

    engine.rules().add(crawlflow::model::RecoveryRule {
        id: "block-on-server-error".into(),
        name: String::new(),
        priority: 1,
        enabled: true,
        pattern: "server_error".into(),
        conditions: vec![],
        action: RecoveryAction::SkipDomain { block_duration: 60 },
        max_retries: 0,
        retry_delay: 0,
        origin: RuleOrigin::User,
        success_count: 0,
        failure_count: 0,
    });

    assert!(engine.domain_blocked("flaky.test").is_none());
    let fctx = failure(ErrorKind::ServerError, 1, "https://flaky.test/x");
    let directive = engine.handle_failure(&fctx).await;
    assert!(matches!(directive, RecoveryDirective::Defer { .. }));

    let remaining = engine.domain_blocked("flaky.test").unwrap();
    assert!(remaining <= Duration::from_secs(60));
    assert!(remaining > Duration::from_secs(50));
}
