//! Control-flow predicates and parameter validation.
//!
//! The interpreter dispatches sequence/conditional/loop/parallel inline;
//! this module holds the pieces it shares with registry validation.

use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult};
use crate::model::NodeSpec;

/// Conditional predicates evaluated against the live browser and context.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    ElementExists { selector: String },
    ElementVisible { selector: String },
    UrlMatches { pattern: String },
    ContextValueEquals { key: String, value: Value },
}

/// Evaluate a predicate. Browser-backed predicates need a lease; a missing
/// lease evaluates element predicates to false rather than erroring, so
/// conditionals degrade sanely in offline validation runs.
pub async fn evaluate_predicate(
    ctx: &ExecutionContext,
    predicate: &Predicate,
) -> EngineResult<bool> {
    match predicate {
        Predicate::ElementExists { selector } => {
            let Some(lease) = ctx.lease() else {
                return Ok(false);
            };
            let page = lease.page().await.map_err(EngineError::from)?;
            Ok(page.find_element(selector).await.is_ok())
        }
        Predicate::ElementVisible { selector } => {
            let Some(lease) = ctx.lease() else {
                return Ok(false);
            };
            let page = lease.page().await.map_err(EngineError::from)?;
            let js = format!(
                "(() => {{ const el = document.querySelector({}); \
                 return !!(el && el.offsetParent !== null); }})()",
                serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".into())
            );
            let result = page
                .evaluate(js)
                .await
                .map_err(|e| EngineError::classified(format!("visibility check: {e}")))?;
            Ok(result.into_value::<bool>().unwrap_or(false))
        }
        Predicate::UrlMatches { pattern } => {
            let regex = regex::Regex::new(pattern)
                .map_err(|e| EngineError::validation(format!("url_matches pattern: {e}")))?;
            let current = ctx
                .metadata
                .get("current_url")
                .and_then(Value::as_str)
                .unwrap_or(&ctx.task.url);
            Ok(regex.is_match(current))
        }
        Predicate::ContextValueEquals { key, value } => {
            Ok(ctx.get(key).is_some_and(|v| v == value))
        }
    }
}

/// Loop node parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopParams {
    pub selector: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
}

fn default_max_iterations() -> u64 {
    10
}

/// Static validation for control-flow node params, shared with the registry.
pub fn validate_control_params(tag: &str, params: &Value) -> EngineResult<()> {
    match tag {
        "sequence" | "parallel" => Ok(()),
        "conditional" => {
            let predicate = params
                .get("predicate")
                .ok_or_else(|| EngineError::validation("conditional.predicate is required"))?;
            let parsed: Predicate = serde_json::from_value(predicate.clone())
                .map_err(|e| EngineError::validation(format!("conditional.predicate: {e}")))?;
            if let Predicate::UrlMatches { pattern } = &parsed {
                regex::Regex::new(pattern)
                    .map_err(|e| EngineError::validation(format!("url_matches pattern: {e}")))?;
            }
            for branch in ["then", "else"] {
                if let Some(raw) = params.get(branch) {
                    let _: Vec<NodeSpec> = serde_json::from_value(raw.clone()).map_err(|e| {
                        EngineError::validation(format!("conditional.{branch}: {e}"))
                    })?;
                }
            }
            Ok(())
        }
        "loop" => {
            let parsed: LoopParams = serde_json::from_value(params.clone())
                .map_err(|e| EngineError::validation(format!("loop params: {e}")))?;
            if parsed.selector.is_empty() {
                return Err(EngineError::validation("loop.selector must not be empty"));
            }
            if parsed.max_iterations == 0 {
                return Err(EngineError::validation("loop.max_iterations must be >= 1"));
            }
            Ok(())
        }
        other => Err(EngineError::validation(format!(
            "unknown control node type {other}"
        ))),
    }
}
