//! Cache key derivation.
//!
//! A [`CacheKey`] is a short deterministic token: the execution kind followed
//! by the first 16 bytes of a SHA-256 digest over the length-prefixed
//! identity material. The full [`SandboxIdentity`] is kept next to every
//! cache entry and compared on each hit, so two identities that share a key
//! can never be served each other's sandbox.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// Which execution service a sandbox belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionKind {
    /// Runs code against the embedded specification snapshot.
    Search,
    /// Runs code that may call the upstream API.
    Api,
}

impl ExecutionKind {
    /// Prefix used for keys and sandbox ids.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Api => "api",
        }
    }
}

/// Everything that determines what a sandbox contains: the code plus every
/// bound parameter that is embedded at construction. The credential is never
/// part of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxIdentity {
    kind: ExecutionKind,
    code: Arc<str>,
    params: Vec<String>,
}

impl SandboxIdentity {
    /// Identity of a search sandbox. `snapshot_fingerprint` changes whenever
    /// the embedded snapshot does.
    pub fn search(code: &str, snapshot_fingerprint: &str) -> Self {
        Self {
            kind: ExecutionKind::Search,
            code: Arc::from(code),
            params: vec![snapshot_fingerprint.to_string()],
        }
    }

    /// Identity of an API sandbox bound to one account and API base.
    pub fn api(code: &str, account_id: &str, api_base: &str) -> Self {
        Self {
            kind: ExecutionKind::Api,
            code: Arc::from(code),
            params: vec![account_id.to_string(), api_base.to_string()],
        }
    }

    /// The execution kind.
    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    /// The submitted code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Derive the cache key for this identity.
    pub fn key(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        update_prefixed(&mut hasher, self.code.as_bytes());
        for param in &self.params {
            update_prefixed(&mut hasher, param.as_bytes());
        }
        let digest = hasher.finalize();

        let mut token = String::with_capacity(self.kind.as_str().len() + 33);
        token.push_str(self.kind.as_str());
        token.push(':');
        for byte in &digest[..16] {
            token.push_str(&format!("{:02x}", byte));
        }
        CacheKey(token)
    }
}

// Length prefixes keep ("ab", "c") and ("a", "bc") apart.
fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Short token indexing the sandbox caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a raw token. Mostly useful in tests that need two
    /// identities to share a key.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
