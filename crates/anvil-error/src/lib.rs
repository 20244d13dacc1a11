//! Typed error types for the upstream dispatch layer.
//!
//! Provides [`DispatchError`], the error type returned by every
//! `UpstreamDispatcher` implementation when an HTTP exchange with the
//! upstream API could not be completed. HTTP error *statuses* are not
//! dispatch errors: they are delivered to sandbox code as ordinary responses.

use thiserror::Error;

/// Canonical error type for upstream dispatch operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The request targeted a URL outside the sandbox's egress allowance.
    #[error("egress denied: '{url}' is outside the permitted API base")]
    EgressDenied {
        /// The rejected URL.
        url: String,
    },

    /// The request could not be built (bad method, malformed URL, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The exchange did not finish within the configured deadline.
    #[error("upstream timeout after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The connection failed or the response body could not be read.
    #[error("upstream transport error: {message}")]
    Transport {
        /// What went wrong on the wire.
        message: String,
    },

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EgressDenied { .. } => "EGRESS_DENIED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Transport { .. } => "TRANSPORT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { .. } => true,
            Self::EgressDenied { .. } => false,
            Self::InvalidRequest(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Convert to a structured JSON error object.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, `retryable`,
    /// and optionally `suggested_fix`.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let suggested_fix = match self {
            Self::Timeout { .. } => Some("Retry with fewer or smaller requests"),
            Self::Transport { .. } => Some("Retry after a delay"),
            Self::EgressDenied { .. } => {
                Some("Pass a path relative to the API base, e.g. \"/accounts\"")
            }
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix.to_string());
        }

        obj
    }
}
