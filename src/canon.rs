//! URL canonicalization and hashing for cross-execution deduplication.
//!
//! Two inputs yield the same hash iff they address the same resource:
//! - scheme and host are lowercased
//! - default ports are stripped
//! - query parameters are sorted (stable) and tracking parameters removed
//! - fragments are always dropped
//!
//! Canonicalization is idempotent: `canon(canon(u)) == canon(u)`.

use url::Url;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{EngineError, EngineResult, ErrorKind};

/// Query parameters that never change the addressed resource.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "utm_id",
    "gclid",
    "fbclid",
    "msclkid",
    "mc_eid",
    "mc_cid",
    "ref",
    "ref_src",
    "igshid",
    "spm",
];

/// A canonicalized URL plus its deterministic hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalUrl {
    url: String,
    hash: String,
}

impl CanonicalUrl {
    /// Canonicalize a raw URL string.
    pub fn parse(input: &str) -> EngineResult<Self> {
        let url = canonicalize(input)?;
        let hash = hash_canonical(&url);
        Ok(Self { url, hash })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Hex-encoded xxh3-64 of the canonical form.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Host portion of the canonical URL, used as the recovery domain key.
    #[must_use]
    pub fn domain(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }

    #[must_use]
    pub fn into_parts(self) -> (String, String) {
        (self.url, self.hash)
    }
}

impl std::fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Normalize a URL into its canonical string form.
pub fn canonicalize(input: &str) -> EngineResult<String> {
    let mut url = Url::parse(input.trim())
        .map_err(|e| EngineError::new(ErrorKind::Validation, format!("invalid URL {input}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::new(
            ErrorKind::Validation,
            format!("unsupported scheme in {input}"),
        ));
    }

    // The url crate already lowercases scheme and host on parse; dropping the
    // explicit default port and fragment is on us.
    if let Some(port) = url.port() {
        let default = match url.scheme() {
            "http" => 80,
            "https" => 443,
            _ => 0,
        };
        if port == default {
            let _ = url.set_port(None);
        }
    }
    url.set_fragment(None);

    // Sorted, tracking-free query. An empty result removes the `?` entirely.
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut query = String::new();
        for (i, (k, v)) in pairs.iter().enumerate() {
            if i > 0 {
                query.push('&');
            }
            query.push_str(&urlencoding::encode(k));
            if !v.is_empty() {
                query.push('=');
                query.push_str(&urlencoding::encode(v));
            }
        }
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || key.starts_with("utm_")
}

/// Hash a canonical URL string. Deterministic across workers and restarts.
#[must_use]
pub fn hash_canonical(canonical: &str) -> String {
    hex::encode(xxh3_64(canonical.as_bytes()).to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lowercases_scheme_and_host() {
        let a = canonicalize("HTTPS://Example.COM/Path").unwrap();
        assert_eq!(a, "https://example.com/Path");
    }

    #[test]
    fn strips_fragment_and_default_port() {
        let a = canonicalize("https://example.com:443/page#section").unwrap();
        assert_eq!(a, "https://example.com/page");
        let b = canonicalize("http://example.com:80/").unwrap();
        assert_eq!(b, "http://example.com/");
        // Non-default port survives
        let c = canonicalize("http://example.com:8080/").unwrap();
        assert_eq!(c, "http://example.com:8080/");
    }

    #[test]
    fn sorts_query_and_strips_tracking() {
        let a = canonicalize("https://ex.test/p?b=2&a=1&utm_source=mail&gclid=xyz").unwrap();
        let b = canonicalize("https://ex.test/p?a=1&b=2").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn equivalence_classes_share_a_hash() {
        let a = CanonicalUrl::parse("https://Shop.test/item?b=2&a=1#frag").unwrap();
        let b = CanonicalUrl::parse("https://shop.test/item?a=1&b=2").unwrap();
        assert_eq!(a.hash(), b.hash());

        let c = CanonicalUrl::parse("https://shop.test/other?a=1&b=2").unwrap();
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(canonicalize("ftp://example.com/file").is_err());
        assert!(canonicalize("javascript:alert(1)").is_err());
        assert!(canonicalize("not a url").is_err());
    }

    proptest! {
        #[test]
        fn canonicalization_is_idempotent(
            host in "[a-z]{1,10}\\.(com|test|org)",
            path in "(/[a-zA-Z0-9]{0,8}){0,3}",
            q in prop::collection::vec(("[a-z]{1,5}", "[a-z0-9]{0,5}"), 0..4),
        ) {
            let query = q.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            let raw = if query.is_empty() {
                format!("https://{host}{path}")
            } else {
                format!("https://{host}{path}?{query}")
            };
            let once = canonicalize(&raw).unwrap();
            let twice = canonicalize(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
