//! Discovery nodes: extract_links and paginate.
//!
//! Discovered URLs are resolved against the current page, canonicalized and
//! locally de-duplicated before being emitted upward; the queue and dedup
//! cache do the cross-task work.

use async_trait::async_trait;
use chromiumoxide::Page;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::time::Duration;

use super::{DiscoveredUrl, NodeExecutor, NodeOutput};
use crate::canon::CanonicalUrl;
use crate::context::ExecutionContext;
use crate::error::{EngineError, EngineResult, ErrorKind};

/// Collect anchor targets matching a selector.
pub struct ExtractLinksNode;

#[async_trait]
impl NodeExecutor for ExtractLinksNode {
    fn node_type(&self) -> &'static str {
        "extract_links"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        if let Some(selector) = params.get("selector") {
            if !selector.as_str().is_some_and(|s| !s.is_empty()) {
                return Err(EngineError::validation(
                    "extract_links.selector must be a non-empty string",
                ));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let selector = input
            .get("selector")
            .and_then(Value::as_str)
            .unwrap_or("a");
        let attribute = input
            .get("attribute")
            .and_then(Value::as_str)
            .unwrap_or("href");
        let marker = input
            .get("marker")
            .and_then(Value::as_str)
            .map(str::to_string);
        let same_domain_only = input
            .get("same_domain_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let lease = ctx
            .lease()
            .cloned()
            .ok_or_else(|| EngineError::internal("extract_links requires a browser lease"))?;
        let page = lease.page().await.map_err(EngineError::from)?;

        let discovered = collect_links(
            &page,
            &ctx.task.url,
            selector,
            attribute,
            marker.as_deref(),
            same_domain_only,
        )
        .await?;

        let count = discovered.len();
        tracing::debug!(selector, count, "extract_links collected URLs");
        Ok(NodeOutput {
            value: json!({ "links_found": count }),
            discovered,
            items: Vec::new(),
        })
    }
}

/// Walk a paginated listing, collecting links from each page.
///
/// The initial page's links count as page 1; `max_pages = 1` degrades to the
/// current page only.
pub struct PaginateNode;

#[async_trait]
impl NodeExecutor for PaginateNode {
    fn node_type(&self) -> &'static str {
        "paginate"
    }

    fn validate(&self, params: &Value) -> EngineResult<()> {
        if params
            .get("next_selector")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty)
        {
            return Err(EngineError::validation("paginate.next_selector is required"));
        }
        if let Some(max_pages) = params.get("max_pages") {
            if !max_pages.as_u64().is_some_and(|n| n >= 1) {
                return Err(EngineError::validation("paginate.max_pages must be >= 1"));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext, input: &Value) -> EngineResult<NodeOutput> {
        let link_selector = input
            .get("link_selector")
            .and_then(Value::as_str)
            .unwrap_or("a");
        let next_selector = input
            .get("next_selector")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation("paginate.next_selector is required"))?;
        let max_pages = input
            .get("max_pages")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1);
        let marker = input
            .get("marker")
            .and_then(Value::as_str)
            .map(str::to_string);

        let lease = ctx
            .lease()
            .cloned()
            .ok_or_else(|| EngineError::internal("paginate requires a browser lease"))?;
        let page = lease.page().await.map_err(EngineError::from)?;

        let mut discovered = Vec::new();
        let mut seen = HashSet::new();
        let mut pages_walked = 0u64;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::cancelled());
            }
            pages_walked += 1;

            let base = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| ctx.task.url.clone());
            for link in collect_links(&page, &base, link_selector, "href", marker.as_deref(), false)
                .await?
            {
                if seen.insert(link.url.clone()) {
                    discovered.push(link);
                }
            }

            if pages_walked >= max_pages {
                break;
            }

            // Advance. A missing next element means the listing ran out
            // before max_pages; that is a normal stop, not a failure.
            let Ok(next) = page.find_element(next_selector).await else {
                break;
            };
            next.click()
                .await
                .map_err(|e| EngineError::classified(format!("paginate next click: {e}")))?;
            let wait = page.wait_for_navigation();
            if tokio::time::timeout(Duration::from_secs(30), wait)
                .await
                .is_err()
            {
                return Err(EngineError::timeout("pagination navigation timed out"));
            }
        }

        let count = discovered.len();
        Ok(NodeOutput {
            value: json!({ "links_found": count, "pages_walked": pages_walked }),
            discovered,
            items: Vec::new(),
        })
    }
}

/// Shared link collection: query anchors, resolve, canonicalize, dedupe.
async fn collect_links(
    page: &Page,
    base_url: &str,
    selector: &str,
    attribute: &str,
    marker: Option<&str>,
    same_domain_only: bool,
) -> EngineResult<Vec<DiscoveredUrl>> {
    let elements = page.find_elements(selector).await.map_err(|e| {
        EngineError::new(
            ErrorKind::LayoutChanged,
            format!("link selector {selector} failed: {e}"),
        )
    })?;

    let base = url::Url::parse(base_url)
        .map_err(|e| EngineError::internal(format!("invalid base URL {base_url}: {e}")))?;
    let base_host = base.host_str().map(str::to_string);

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in elements {
        let Ok(Some(href)) = element.attribute(attribute).await else {
            continue;
        };
        let Ok(resolved) = base.join(href.trim()) else {
            continue;
        };
        let Ok(canonical) = CanonicalUrl::parse(resolved.as_str()) else {
            continue; // mailto:, javascript:, malformed
        };
        if same_domain_only && canonical.domain() != base_host {
            continue;
        }
        if seen.insert(canonical.hash().to_string()) {
            links.push(DiscoveredUrl {
                url: canonical.as_str().to_string(),
                marker: marker.map(str::to_string),
            });
        }
    }
    Ok(links)
}
