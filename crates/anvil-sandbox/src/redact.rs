//! Redaction of error text leaving the subsystem.
//!
//! Error messages can quote upstream responses, request URLs or host paths.
//! Before they are handed to a caller, credentials are replaced with
//! `[REDACTED]`, local paths with `[path]` and JavaScript stack frames are
//! dropped. API URLs are kept since they are the caller's own requests; only
//! credentials embedded in them are removed.

use std::sync::LazyLock;

use regex::Regex;

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api_key\s*[=:]\s*\S+|token\s*[=:]\s*\S+|password\s*[=:]\s*\S+|secret\s*[=:]\s*\S+)",
    )
    .unwrap()
});

/// JWTs (three base64url segments).
static JWT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").unwrap());

/// Long hex strings (40+ chars) that look like API tokens or keys.
static HEX_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{40,}\b").unwrap());

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|root|srv|proc|run)(/[\w.\-]+)+").unwrap()
});

static STACK_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*at\s+.+$").unwrap());

/// Redact sensitive patterns from an error message.
pub fn redact_error_message(error: &str) -> String {
    let mut msg = JWT_RE.replace_all(error, "[REDACTED]").to_string();
    msg = CREDENTIAL_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = HEX_TOKEN_RE.replace_all(&msg, "[REDACTED]").to_string();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").to_string();
    msg = STACK_FRAME_RE.replace_all(&msg, "").to_string();

    let lines: Vec<&str> = msg.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.join("\n")
}

/// Redact the `message` and `trace` fields of a structured error in place.
pub fn redact_structured_error(error: &mut serde_json::Value) {
    for field in ["message", "trace"] {
        if let Some(text) = error.get(field).and_then(|m| m.as_str()).map(str::to_string) {
            error[field] = serde_json::Value::String(redact_error_message(&text));
        }
    }
}
