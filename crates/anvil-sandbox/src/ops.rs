//! deno_core op definitions for the Anvil sandbox.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anvil_error::DispatchError;
use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;

use crate::template::Egress;
use crate::{UpstreamDispatcher, UpstreamRequest};

/// Envelope reported by one invocation, tagged with its invocation id.
pub struct Completion(pub u32, pub String);

/// Credential for the invocation currently running. Replaced before every
/// invocation and never visible to JavaScript.
pub struct InvocationCredential(pub Option<String>);

/// Log a message from sandbox code.
#[op2(fast)]
pub fn op_anvil_log(#[string] msg: &str) {
    tracing::info!(target: "anvil::sandbox::js", "{}", msg);
}

/// Store the outcome envelope of invocation `id` in OpState.
#[op2(fast)]
pub fn op_anvil_set_result(state: &mut OpState, #[smi] id: u32, #[string] json: &str) {
    state.put(Completion(id, json.to_string()));
}

/// Perform an HTTP exchange with the upstream API.
///
/// Rejects URLs outside the sandbox's [`Egress`] and attaches the current
/// [`InvocationCredential`] as a bearer token. Returns
/// `{"status", "contentType", "body"}` as JSON text; HTTP error statuses are
/// ordinary responses.
#[op2(async)]
#[string]
pub async fn op_anvil_fetch(
    op_state: Rc<RefCell<OpState>>,
    #[string] method: String,
    #[string] url: String,
    has_body: bool,
    #[string] body: String,
) -> Result<String, JsErrorBox> {
    tracing::debug!(method = %method, body_len = body.len(), "fetch dispatched");

    let (dispatcher, bearer) = {
        let st = op_state.borrow();
        let egress = st
            .try_borrow::<Egress>()
            .ok_or_else(|| JsErrorBox::generic("network access is not available in this sandbox"))?;
        if !egress.allows(&url) {
            return Err(JsErrorBox::generic(dispatch_failure_message(
                &DispatchError::EgressDenied { url },
            )));
        }
        let dispatcher = st
            .try_borrow::<Arc<dyn UpstreamDispatcher>>()
            .cloned()
            .ok_or_else(|| JsErrorBox::generic("no upstream is configured"))?;
        let bearer = st
            .try_borrow::<InvocationCredential>()
            .and_then(|c| c.0.clone());
        (dispatcher, bearer)
    };

    let request = UpstreamRequest {
        method,
        url,
        bearer,
        body: has_body.then_some(body),
    };

    let response = dispatcher
        .send(request)
        .await
        .map_err(|e| JsErrorBox::generic(dispatch_failure_message(&e)))?;

    serde_json::to_string(&serde_json::json!({
        "status": response.status,
        "contentType": response.content_type,
        "body": response.body,
    }))
    .map_err(|e| JsErrorBox::generic(format!("response serialization failed: {e}")))
}

/// Render a failed exchange as the message of the error `request(...)` throws.
///
/// Built from the redacted structured form: `CODE: message`, then a
/// retryable marker and the suggested fix when there is one.
pub fn dispatch_failure_message(err: &DispatchError) -> String {
    let mut structured = err.to_structured_error();
    crate::redact::redact_structured_error(&mut structured);

    let code = structured["code"].as_str().unwrap_or("INTERNAL");
    let message = structured["message"].as_str().unwrap_or_default();
    let mut text = format!("{code}: {message}");
    if structured["retryable"].as_bool() == Some(true) {
        text.push_str(" (retryable)");
    }
    if let Some(fix) = structured["suggested_fix"].as_str() {
        text.push_str(". ");
        text.push_str(fix);
    }
    text
}

deno_core::extension!(
    anvil_ext,
    ops = [op_anvil_log, op_anvil_set_result, op_anvil_fetch],
);
