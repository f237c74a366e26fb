//! AI fallback for failures no rule covers.
//!
//! Presents a structured problem description to the configured endpoint and
//! expects a suggested action from the same closed action set rules use.
//! Suggestions are recorded as learned actions; the learning promoter turns
//! consistently-successful ones into real rules.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::AiConfig;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::model::RecoveryAction;

/// Structured failure description sent to the advisor.
#[derive(Debug, Clone, Serialize)]
pub struct AiProblem {
    pub pattern: String,
    pub domain: String,
    pub url: String,
    pub error_message: String,
    pub retry_count: u32,
    /// Recent attempt summaries, oldest first.
    pub history: Vec<String>,
    /// Truncated page text at failure time, when a page was live.
    pub page_excerpt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AiResponse {
    action: String,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default)]
    suggested_human_actions: Vec<String>,
}

/// Parsed advisor verdict.
#[derive(Debug, Clone)]
pub struct AiSuggestion {
    pub action: RecoveryAction,
    pub suggested_human_actions: Vec<String>,
}

pub struct AiClient {
    http: reqwest::Client,
    config: AiConfig,
}

impl AiClient {
    pub fn new(config: AiConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()
            .map_err(|e| EngineError::internal(format!("ai client build: {e}")))?;
        Ok(Self { http, config })
    }

    pub async fn suggest(&self, problem: &AiProblem) -> EngineResult<AiSuggestion> {
        let body = json!({
            "provider": self.config.provider,
            "model": self.config.model,
            "problem": problem,
        });

        let response = self
            .http
            .post(&self.config.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EngineError::new(ErrorKind::ConnectionError, format!("ai endpoint: {e}"))
            })?;
        if !response.status().is_success() {
            return Err(EngineError::internal(format!(
                "ai endpoint returned {}",
                response.status()
            )));
        }

        let parsed: AiResponse = response
            .json()
            .await
            .map_err(|e| EngineError::internal(format!("ai response parse: {e}")))?;

        let action = parse_action(&parsed.action, &parsed.params)?;
        Ok(AiSuggestion {
            action,
            suggested_human_actions: parsed.suggested_human_actions,
        })
    }
}

/// Map the advisor's `{action, params}` pair onto the closed action set.
/// Anything outside the set is rejected rather than guessed at.
fn parse_action(action: &str, params: &serde_json::Value) -> EngineResult<RecoveryAction> {
    serde_json::from_value(json!({ "action": action, "params": params }))
        .or_else(|_| serde_json::from_value(json!({ "action": action })))
        .map_err(|_| {
            EngineError::internal(format!("ai suggested unknown action {action}"))
        })
}
