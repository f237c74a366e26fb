//! Declarative field extraction.
//!
//! An extract node declares a `fields` array; each field runs its optional
//! pre-extraction actions, then applies selector/type/transform with a
//! `default` fallback. Results land in `ctx.data` keyed by field name, and
//! the assembled object is emitted as an extracted item unless `emit_item`
//! is false.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;

use super::{NodeExecutor, NodeOutput};
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ErrorKind};

/// Closed transform set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    None,
    Trim,
    CleanHtml,
    Lowercase,
    Uppercase,
}

impl Transform {
    #[must_use]
    pub fn apply(&self, raw: &str) -> String {
        match self {
            Self::None => raw.to_string(),
            Self::Trim => raw.trim().to_string(),
            Self::CleanHtml => clean_html(raw),
            Self::Lowercase => raw.to_lowercase(),
            Self::Uppercase => raw.to_uppercase(),
        }
    }
}

/// Strip tags from an HTML fragment, collapsing whitespace.
fn clean_html(fragment: &str) -> String {
    let parsed = scraper::Html::parse_fragment(fragment);
    let text: Vec<&str> = parsed.root_element().text().collect();
    text.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FieldKind {
    #[default]
    Text,
    Attribute,
    Html,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldAction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSpec {
    name: String,
    selector: String,
    #[serde(default, rename = "type")]
    kind: FieldKind,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    transform: Transform,
    #[serde(default)]
    default: Option<Value>,
    #[serde(default)]
    actions: Vec<FieldAction>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExtractParams {
    fields: Vec<FieldSpec>,
    #[serde(default = "default_emit")]
    emit_item: bool,
}

fn default_emit() -> bool {
    true
}

pub struct ExtractNode;

#[async_trait]
impl NodeExecutor for ExtractNode {
    fn node_type(&self) -> &'static str {
        "extract"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        let parsed: ExtractParams = serde_json::from_value(params.clone())
            .map_err(|e| EngineError::validation(format!("extract params: {e}")))?;
        if parsed.fields.is_empty() {
            return Err(EngineError::validation("extract.fields must not be empty"));
        }
        for field in &parsed.fields {
            if field.name.is_empty() || field.selector.is_empty() {
                return Err(EngineError::validation(
                    "extract field needs name and selector",
                ));
            }
            if field.kind == FieldKind::Attribute && field.attribute.is_none() {
                return Err(EngineError::validation(format!(
                    "field {} extracts an attribute but names none",
                    field.name
                )));
            }
            for action in &field.actions {
                match action.kind.as_str() {
                    "click" if action.selector.is_some() => {}
                    "wait" if action.ms.is_some() => {}
                    other => {
                        return Err(EngineError::validation(format!(
                            "field {}: unsupported action {other}",
                            field.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_for_health_check(&self, input: &Value) -> EngineResult<()> {
        self.validate(input)
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let params: ExtractParams = serde_json::from_value(input.clone())
            .map_err(|e| EngineError::validation(format!("extract params: {e}")))?;

        let lease = ctx
            .lease()
            .cloned()
            .ok_or_else(|| EngineError::internal("extract requires a browser lease"))?;
        let page = lease.page().await.map_err(EngineError::from)?;

        let mut record = Map::new();
        let mut missing_required = Vec::new();

        for field in &params.fields {
            for action in &field.actions {
                run_field_action(&page, ctx, action).await?;
            }

            let extracted = extract_field(&page, field).await;
            let value = match extracted {
                Some(raw) => Value::String(field.transform.apply(&raw)),
                None => match &field.default {
                    Some(default) => default.clone(),
                    None => {
                        missing_required.push(field.name.clone());
                        Value::Null
                    }
                },
            };
            ctx.set(field.name.clone(), value.clone());
            record.insert(field.name.clone(), value);
        }

        // Every declared selector missing on a previously-working page is the
        // layout-change signature the recovery engine keys on.
        if !missing_required.is_empty() && missing_required.len() == params.fields.len() {
            return Err(EngineError::new(
                ErrorKind::LayoutChanged,
                format!("no extract selector matched: {}", missing_required.join(", ")),
            ));
        }

        let value = Value::Object(record.clone());
        let items = if params.emit_item {
            vec![Value::Object(record)]
        } else {
            Vec::new()
        };

        Ok(NodeOutput {
            value,
            discovered: Vec::new(),
            items,
        })
    }
}

async fn run_field_action(
    page: &chromiumoxide::Page,
    ctx: &ExecutionContext,
    action: &FieldAction,
) -> EngineResult<()> {
    match action.kind.as_str() {
        "click" => {
            let selector = action.selector.as_deref().unwrap_or_default();
            if let Ok(element) = page.find_element(selector).await {
                element
                    .click()
                    .await
                    .map_err(|e| EngineError::classified(format!("field action click: {e}")))?;
            }
            Ok(())
        }
        "wait" => {
            let ms = action.ms.unwrap_or(0);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
                _ = ctx.cancel.cancelled() => Err(EngineError::cancelled()),
            }
        }
        other => Err(EngineError::validation(format!("unsupported field action {other}"))),
    }
}

async fn extract_field(page: &chromiumoxide::Page, field: &FieldSpec) -> Option<String> {
    let element = page.find_element(&field.selector).await.ok()?;
    match field.kind {
        FieldKind::Text => element.inner_text().await.ok().flatten(),
        FieldKind::Html => element.inner_html().await.ok().flatten(),
        FieldKind::Attribute => {
            let name = field.attribute.as_deref()?;
            element.attribute(name).await.ok().flatten()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transforms() {
        assert_eq!(Transform::Trim.apply("  x  "), "x");
        assert_eq!(Transform::Lowercase.apply("ABC"), "abc");
        assert_eq!(Transform::Uppercase.apply("abc"), "ABC");
        assert_eq!(Transform::None.apply(" x "), " x ");
        assert_eq!(
            Transform::CleanHtml.apply("<p>Hello <b>world</b></p>"),
            "Hello world"
        );
    }

    #[test]
    fn validate_rejects_attribute_without_name() {
        let node = ExtractNode;
        let params = json!({
            "fields": [{"name": "link", "selector": "a", "type": "attribute"}]
        });
        assert!(node.validate(&params).is_err());
    }

    #[test]
    fn validate_accepts_catalog_shape() {
        let node = ExtractNode;
        let params = json!({
            "fields": [
                {"name": "title", "selector": ".t", "transform": "trim"},
                {"name": "price", "selector": ".p", "default": "0",
                 "actions": [{"type": "wait", "ms": 50}]}
            ]
        });
        node.validate(&params).unwrap();
    }
}
