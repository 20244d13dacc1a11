#![warn(missing_docs)]

//! # anvil-upstream
//!
//! HTTP access to the upstream REST API for Anvil API sandboxes.
//!
//! Provides [`HttpUpstream`], a reqwest-backed [`UpstreamDispatcher`], and
//! [`TimeoutUpstream`], which bounds every exchange of an inner dispatcher.
//! HTTP error statuses are returned as ordinary [`UpstreamResponse`]s; only
//! failures to complete the exchange become [`DispatchError`]s.

pub mod timeout;

use std::time::Duration;

use anvil_error::DispatchError;
use anvil_sandbox::{UpstreamDispatcher, UpstreamRequest, UpstreamResponse};
use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;

pub use timeout::TimeoutUpstream;

/// Default per-request timeout for upstream calls.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on an upstream response body. Larger bodies are refused.
pub const DEFAULT_MAX_RESPONSE_BODY_SIZE: usize = 10_485_760; // 10 MB

/// A reqwest client bound to one tokio runtime.
///
/// Sandboxes run their fetch ops on private single-threaded runtimes, so the
/// exchange itself is spawned onto the runtime that was current when the
/// dispatcher was built. Pooled connections therefore always live on one
/// long-lived runtime.
pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
    max_body_size: usize,
    handle: Option<tokio::runtime::Handle>,
}

impl HttpUpstream {
    /// Build a dispatcher with the given per-request timeout.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("anvil/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let handle = tokio::runtime::Handle::try_current().ok();
        if handle.is_none() {
            tracing::debug!("no runtime at construction; upstream calls run on the caller's runtime");
        }

        Ok(Self {
            client,
            timeout,
            max_body_size: DEFAULT_MAX_RESPONSE_BODY_SIZE,
            handle,
        })
    }

    /// Refuse response bodies larger than `bytes`.
    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }
}

#[async_trait::async_trait]
impl UpstreamDispatcher for HttpUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, DispatchError> {
        let exchange = exchange(
            self.client.clone(),
            request,
            self.timeout.as_millis() as u64,
            self.max_body_size,
        );
        match &self.handle {
            Some(handle) => handle
                .spawn(exchange)
                .await
                .map_err(|e| DispatchError::Internal(anyhow::anyhow!("upstream task failed: {e}")))?,
            None => exchange.await,
        }
    }
}

/// Perform one HTTP exchange.
async fn exchange(
    client: reqwest::Client,
    request: UpstreamRequest,
    timeout_ms: u64,
    max_body_size: usize,
) -> Result<UpstreamResponse, DispatchError> {
    let fail = |err: reqwest::Error| classify(err, timeout_ms);
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| DispatchError::InvalidRequest(format!("invalid method '{}'", request.method)))?;
    let url = reqwest::Url::parse(&request.url)
        .map_err(|e| DispatchError::InvalidRequest(format!("invalid url: {e}")))?;

    if url.scheme() == "http" && request.bearer.is_some() {
        tracing::warn!(host = ?url.host_str(), "sending credential over plain HTTP");
    }

    tracing::debug!(method = %method, path = %url.path(), "upstream request");

    let mut builder = client.request(method, url);
    if let Some(token) = &request.bearer {
        builder = builder.bearer_auth(token);
    }
    if let Some(body) = request.body {
        builder = builder.header(CONTENT_TYPE, "application/json").body(body);
    }

    let mut response = builder.send().await.map_err(fail)?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if let Some(declared) = response.content_length() {
        if declared > max_body_size as u64 {
            return Err(too_large(declared, max_body_size));
        }
    }

    // Read chunk by chunk so an undeclared oversized body is cut off early.
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(fail)? {
        if bytes.len() + chunk.len() > max_body_size {
            return Err(too_large((bytes.len() + chunk.len()) as u64, max_body_size));
        }
        bytes.extend_from_slice(&chunk);
    }
    let body = String::from_utf8_lossy(&bytes).into_owned();

    tracing::debug!(status, body_len = body.len(), "upstream response");

    Ok(UpstreamResponse {
        status,
        content_type,
        body,
    })
}

fn too_large(size: u64, limit: usize) -> DispatchError {
    tracing::warn!(size, limit, "upstream response refused");
    DispatchError::Transport {
        message: format!("upstream response too large ({size} bytes, limit {limit})"),
    }
}

/// Map a reqwest failure onto the dispatch taxonomy.
fn classify(err: reqwest::Error, timeout_ms: u64) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout { timeout_ms }
    } else if err.is_builder() {
        DispatchError::InvalidRequest(err.without_url().to_string())
    } else {
        DispatchError::Transport {
            message: err.without_url().to_string(),
        }
    }
}
