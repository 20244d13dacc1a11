//! Per-call timeout wrapper for upstream dispatchers.

use std::sync::Arc;
use std::time::Duration;

use anvil_error::DispatchError;
use anvil_sandbox::{UpstreamDispatcher, UpstreamRequest, UpstreamResponse};

/// An [`UpstreamDispatcher`] that enforces a per-call timeout on the inner dispatcher.
pub struct TimeoutUpstream {
    inner: Arc<dyn UpstreamDispatcher>,
    timeout: Duration,
}

impl TimeoutUpstream {
    /// Wrap an inner dispatcher with a per-call timeout.
    pub fn new(inner: Arc<dyn UpstreamDispatcher>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait::async_trait]
impl UpstreamDispatcher for TimeoutUpstream {
    #[tracing::instrument(skip_all, fields(method = %request.method))]
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, DispatchError> {
        match tokio::time::timeout(self.timeout, self.inner.send(request)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "upstream call timed out");
                Err(DispatchError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}
