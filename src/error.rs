//! Engine error types and failure classification.
//!
//! Every failure surfaced by the engine carries one of a closed set of
//! [`ErrorKind`]s. The kind drives the recovery engine: it is the `pattern`
//! that rules match against, and it decides default retryability and backoff
//! weighting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure kinds recognized across the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Operation exceeded its deadline (navigation, node, task ceiling)
    Timeout,
    /// The target site actively refused us (403, bot wall)
    Blocked,
    /// HTTP 429 or equivalent throttling signal
    RateLimited,
    /// A captcha interstitial was detected
    Captcha,
    /// DNS/TCP/TLS level failure
    ConnectionError,
    /// Upstream 5xx
    ServerError,
    /// Expected selectors no longer match the page
    LayoutChanged,
    /// Login wall or 401
    AuthRequired,
    /// HTTP 404/410
    NotFound,
    /// Workflow or node parameters failed validation
    Validation,
    /// Bug or unexpected state inside the engine
    Internal,
    /// Work was cancelled by shutdown, stop, or deadline propagation
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case name, used as the recovery pattern string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
            Self::Captcha => "captcha",
            Self::ConnectionError => "connection_error",
            Self::ServerError => "server_error",
            Self::LayoutChanged => "layout_changed",
            Self::AuthRequired => "auth_required",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this kind is worth retrying without an explicit rule saying so.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout
            | Self::RateLimited
            | Self::ConnectionError
            | Self::ServerError
            | Self::Blocked => true,
            Self::Captcha
            | Self::LayoutChanged
            | Self::AuthRequired
            | Self::NotFound
            | Self::Validation
            | Self::Internal
            | Self::Cancelled => false,
        }
    }

    /// Backoff weighting applied on top of exponential retry delay.
    #[must_use]
    pub const fn delay_multiplier(&self) -> f64 {
        match self {
            Self::RateLimited => 3.0,
            Self::Blocked => 2.0,
            Self::ServerError => 1.5,
            _ => 1.0,
        }
    }

    /// Classify a raw browser/network error message into a kind.
    ///
    /// Message-pattern matching is inherently lossy; checks are ordered so
    /// the more specific signals win (429 before generic network).
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("429") || msg.contains("too many requests") || msg.contains("rate limit") {
            return Self::RateLimited;
        }
        if msg.contains("captcha") || msg.contains("challenge-platform") {
            return Self::Captcha;
        }
        if msg.contains("403") || msg.contains("forbidden") || msg.contains("access denied") {
            return Self::Blocked;
        }
        if msg.contains("401") || msg.contains("unauthorized") || msg.contains("login required") {
            return Self::AuthRequired;
        }
        if msg.contains("404") || msg.contains("410") || msg.contains("not found") {
            return Self::NotFound;
        }
        if msg.contains("500") || msg.contains("502") || msg.contains("503") || msg.contains("504")
        {
            return Self::ServerError;
        }
        if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
            return Self::Timeout;
        }
        if msg.contains("dns")
            || msg.contains("connection refused")
            || msg.contains("connection reset")
            || msg.contains("unreachable")
            || msg.contains("eof")
            || msg.contains("network")
        {
            return Self::ConnectionError;
        }
        if msg.contains("selector") || msg.contains("element not found") || msg.contains("no node")
        {
            return Self::LayoutChanged;
        }
        if msg.contains("cancelled") || msg.contains("canceled") {
            return Self::Cancelled;
        }
        Self::Internal
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-wide error type.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status observed at failure time, when one exists
    pub status_code: Option<u16>,
}

impl EngineError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Classify an arbitrary error message into an `EngineError`.
    #[must_use]
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::classify(&message),
            message,
            status_code: None,
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        // {:#} preserves the full context chain
        Self::classified(format!("{err:#}"))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("store error: {err}"))
    }
}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_before_server_error() {
        assert_eq!(
            ErrorKind::classify("HTTP 429 Too Many Requests"),
            ErrorKind::RateLimited
        );
        assert_eq!(ErrorKind::classify("HTTP 503 unavailable"), ErrorKind::ServerError);
    }

    #[test]
    fn classify_navigation_failures() {
        assert_eq!(
            ErrorKind::classify("Page navigation timeout after 30 seconds"),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify("connection refused by peer"),
            ErrorKind::ConnectionError
        );
        assert_eq!(
            ErrorKind::classify("selector '.price' matched no node"),
            ErrorKind::LayoutChanged
        );
    }

    #[test]
    fn retryability_defaults() {
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Captcha.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
