//! Error types for the Anvil sandbox.

use thiserror::Error;

/// Errors that can occur while building, caching or invoking a sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Code failed validation checks.
    #[error("code validation failed: {reason}")]
    ValidationFailed {
        /// What went wrong.
        reason: String,
    },

    /// Code exceeds the configured maximum size.
    #[error("code exceeds maximum size of {max} bytes (got {actual})")]
    CodeTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// A banned code pattern was detected during validation.
    #[error("banned pattern detected: `{pattern}`. The sandbox has no filesystem or module access; use request() to reach the API.")]
    BannedPattern {
        /// The pattern that was matched.
        pattern: String,
    },

    /// The hosting capability could not create the sandbox (including
    /// syntax errors in the submitted code).
    #[error("sandbox instantiation failed: {reason}")]
    Instantiation {
        /// Why the sandbox could not be created.
        reason: String,
    },

    /// The submitted code threw, or a request it made failed.
    #[error("javascript error: {message}")]
    JsError {
        /// The error message from JavaScript.
        message: String,
        /// The JavaScript stack trace, empty when none was available.
        trace: String,
    },

    /// The sandbox reported something other than exactly one of
    /// `result` / `error`.
    #[error("bridge protocol violation: {reason}")]
    Protocol {
        /// What was wrong with the envelope.
        reason: String,
    },

    /// Execution timed out (async event loop or CPU-bound watchdog).
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// V8 heap memory limit was exceeded.
    #[error("V8 heap limit exceeded")]
    HeapLimitExceeded,

    /// The sandbox was terminated earlier and can no longer serve calls.
    #[error("sandbox '{id}' has been retired")]
    Retired {
        /// Identity of the retired sandbox.
        id: String,
    },

    /// Too many concurrent sandbox executions.
    #[error("concurrency limit reached (max {max} concurrent executions)")]
    ConcurrencyLimit {
        /// Maximum allowed concurrent executions.
        max: usize,
    },

    /// Result or literal serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::CodeTooLarge { .. } => "CODE_TOO_LARGE",
            Self::BannedPattern { .. } => "BANNED_PATTERN",
            Self::Instantiation { .. } => "INSTANTIATION_FAILED",
            Self::JsError { .. } => "JS_ERROR",
            Self::Protocol { .. } => "PROTOCOL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HeapLimitExceeded => "HEAP_LIMIT",
            Self::Retired { .. } => "RETIRED",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Execution(_) => "INTERNAL",
        }
    }

    /// Whether the failure came from the sandbox being forcibly stopped.
    /// Such a sandbox must not serve further calls.
    pub fn is_fatal_to_sandbox(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::HeapLimitExceeded)
    }

    /// Convert to a structured JSON error object.
    ///
    /// Returns a JSON object with `error`, `code`, `message` and optionally
    /// `trace` and `suggested_fix`.
    pub fn to_structured_error(&self) -> serde_json::Value {
        let suggested_fix = match self {
            Self::Timeout { .. } => Some("Reduce the work done per call or split it up"),
            Self::HeapLimitExceeded => Some("Return smaller values; filter data inside the sandbox"),
            Self::ConcurrencyLimit { .. } => Some("Retry after a short delay"),
            Self::BannedPattern { .. } => Some("Remove the banned construct and retry"),
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
        });

        if let Self::JsError { trace, .. } = self {
            if !trace.is_empty() {
                obj["trace"] = serde_json::Value::String(trace.clone());
            }
        }
        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix.to_string());
        }

        obj
    }
}
