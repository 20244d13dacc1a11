//! The call/response contract across the isolation boundary.
//!
//! Code inside a sandbox never reports back through an exception. A fixed
//! wrapper runs the user function and always hands the host one envelope:
//!
//! ```json
//! {"result": <value>}
//! {"error": {"message": "...", "stack": "..."}}
//! ```
//!
//! [`decode_envelope`] turns that text into an [`Outcome`] and rejects
//! anything carrying both fields or neither.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SandboxError;

/// A fault reported by code running inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeFault {
    /// Non-empty error message.
    pub message: String,
    /// JavaScript stack trace, empty when none was available.
    pub trace: String,
}

/// Exactly one of a value or a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The user function returned normally.
    Value(Value),
    /// The user function threw, or something it called failed.
    Error(BridgeFault),
}

impl Outcome {
    /// Re-raise a reported fault as a [`SandboxError::JsError`].
    pub fn into_result(self) -> Result<Value, SandboxError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Error(fault) => Err(SandboxError::JsError {
                message: fault.message,
                trace: fault.trace,
            }),
        }
    }
}

/// Decode the envelope text a sandbox reported.
pub fn decode_envelope(raw: &str) -> Result<Outcome, SandboxError> {
    let envelope: Map<String, Value> =
        serde_json::from_str(raw).map_err(|e| SandboxError::Protocol {
            reason: format!("envelope is not a JSON object: {e}"),
        })?;

    match (envelope.get("result"), envelope.get("error")) {
        (Some(_), Some(_)) => Err(SandboxError::Protocol {
            reason: "envelope carries both result and error".into(),
        }),
        (None, None) => Err(SandboxError::Protocol {
            reason: "envelope carries neither result nor error".into(),
        }),
        (Some(value), None) => Ok(Outcome::Value(value.clone())),
        (None, Some(error)) => Ok(Outcome::Error(decode_fault(error))),
    }
}

fn decode_fault(error: &Value) -> BridgeFault {
    let message = match error.get("message") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let trace = error
        .get("stack")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    BridgeFault {
        message: if message.is_empty() {
            "uncaught exception".to_string()
        } else {
            message
        },
        trace,
    }
}
