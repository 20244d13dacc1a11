#![warn(missing_docs)]

//! # anvil-sandbox
//!
//! Cached V8 sandboxes for the Anvil code execution service.
//!
//! Caller code is templated into a sandbox definition together with its bound
//! parameters, instantiated once by a [`SandboxHost`] and then reused for
//! every request with the same identity until it falls out of a bounded LRU
//! [`SandboxCache`]. Each invocation returns exactly one [`Outcome`]: a value
//! or a fault with a message and trace.
//!
//! ## Security model
//!
//! - **V8 isolate**: one isolate per sandbox on its own thread
//! - **No ambient capabilities**: no fs, env or module access; network only
//!   through the fetch op and only under the sandbox's API base
//! - **Credentials stay in Rust**: the bearer token is attached by the fetch op
//!   for the duration of one invocation and never reaches JavaScript
//! - **Timeout and heap enforcement**: a stopped sandbox is retired, never reused
//! - **Bounded output**: results are cut to a token budget by [`Truncator`]

pub mod bridge;
pub mod cache;
pub mod error;
pub mod host;
pub mod key;
pub mod ops;
pub mod redact;
pub mod template;
pub mod truncate;
pub mod validator;

use std::sync::Arc;

pub use bridge::{BridgeFault, Outcome};
pub use cache::{CacheStats, SandboxCache};
pub use error::SandboxError;
pub use host::{DenoHost, HostConfig};
pub use key::{CacheKey, ExecutionKind, SandboxIdentity};
pub use template::{SandboxDefinition, TemplateBuilder};
pub use truncate::Truncator;

/// Produces a sandbox definition on demand. Hosts call it only when they
/// actually need to create (or verify) a sandbox.
pub type DefinitionFactory =
    Box<dyn FnOnce() -> Result<SandboxDefinition, SandboxError> + Send>;

/// The hosting capability: creates isolated execution contexts.
///
/// Instantiation is idempotent by identity from the caller's point of view:
/// asking again for a live sandbox with the same id and definition may return
/// the existing one.
#[async_trait::async_trait]
pub trait SandboxHost: Send + Sync {
    /// Create (or reuse) the sandbox registered under `id`.
    async fn instantiate(
        &self,
        id: &str,
        factory: DefinitionFactory,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError>;
}

/// A live sandbox.
#[async_trait::async_trait]
pub trait SandboxHandle: Send + Sync {
    /// The identity this sandbox was instantiated under.
    fn id(&self) -> &str;

    /// Run the embedded code once. `credential` is visible to the fetch op
    /// for this invocation only.
    ///
    /// Faults raised by the code come back as [`Outcome::Error`]; `Err` is
    /// reserved for the sandbox itself failing (timeout, heap limit,
    /// retirement, protocol violations).
    ///
    /// Time spent waiting for the sandbox to finish other invocations does
    /// not count against the timeout. Dropping the future before the
    /// invocation starts cancels it.
    async fn invoke(&self, credential: Option<String>) -> Result<Outcome, SandboxError>;

    /// Whether the sandbox was forcibly stopped and can no longer serve calls.
    fn is_retired(&self) -> bool;
}

/// One HTTP exchange requested by sandbox code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// HTTP method, upper case.
    pub method: String,
    /// Absolute URL, already checked against the sandbox's egress.
    pub url: String,
    /// Credential to send as `Authorization: Bearer`.
    pub bearer: Option<String>,
    /// JSON request body.
    pub body: Option<String>,
}

/// Response handed back to sandbox code. Any HTTP status is a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the `Content-Type` header, empty if absent.
    pub content_type: String,
    /// Raw body text.
    pub body: String,
}

/// Trait for performing upstream HTTP exchanges on behalf of sandboxes.
///
/// Implementations own the HTTP client. Sandbox code never sees the client,
/// the credential or the connection; it calls `request(...)`, which routes
/// here through the fetch op.
#[async_trait::async_trait]
pub trait UpstreamDispatcher: Send + Sync {
    /// Perform one exchange.
    async fn send(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, anvil_error::DispatchError>;
}
