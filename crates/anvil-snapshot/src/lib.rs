#![warn(missing_docs)]

//! # anvil-snapshot
//!
//! Read-only model of the API specification snapshot searched by sandbox code.
//!
//! The snapshot is a pre-built JSON file with one shape:
//!
//! ```json
//! {
//!   "paths": {
//!     "/accounts/{account_id}/workers/scripts": {
//!       "get": {
//!         "summary": "List Workers",
//!         "tags": ["Worker Script"],
//!         "parameters": [{"name": "account_id", "in": "path", "required": true}]
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! It is serialized once per service and embedded into every search sandbox
//! as the frozen global `spec`, so the agent never needs the full API
//! description in its own context.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// HTTP methods accepted as operation keys.
pub const HTTP_METHODS: &[&str] = &["get", "put", "post", "delete", "options", "head", "patch", "trace"];

/// Maximum length of a summary or description kept by the builder.
const MAX_DESCRIPTION_LENGTH: usize = 2048;

/// Errors from loading a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Failed to read the snapshot file.
    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a valid snapshot document.
    #[error("failed to parse snapshot: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document parsed but is structurally wrong.
    #[error("invalid snapshot: {0}")]
    Invalid(String),
}

/// One API operation (a path + method pair).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Short summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Grouping tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Parameter descriptors, kept as raw JSON.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<serde_json::Value>,
    /// Request body shape, kept as raw JSON.
    #[serde(
        rename = "requestBody",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_body: Option<serde_json::Value>,
}

/// The complete snapshot: path → method → operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecSnapshot {
    /// Operations keyed by path, then by lower-case HTTP method
    /// (BTreeMap for deterministic ordering).
    #[serde(default)]
    pub paths: BTreeMap<String, BTreeMap<String, Operation>>,
}

impl SpecSnapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a snapshot from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, SnapshotError> {
        let snapshot: SpecSnapshot = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Load a snapshot from a file.
    pub fn from_file(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path)?;
        let snapshot = Self::from_json_str(&content)?;
        tracing::info!(
            path = %path.display(),
            paths = snapshot.total_paths(),
            operations = snapshot.total_operations(),
            "snapshot loaded"
        );
        Ok(snapshot)
    }

    /// Number of distinct paths.
    pub fn total_paths(&self) -> usize {
        self.paths.len()
    }

    /// Number of operations across all paths.
    pub fn total_operations(&self) -> usize {
        self.paths.values().map(BTreeMap::len).sum()
    }

    /// Every tag used by at least one operation.
    pub fn tags(&self) -> BTreeSet<&str> {
        self.paths
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(|op| op.tags.iter().map(String::as_str))
            .collect()
    }

    /// Look up one operation.
    pub fn operation(&self, path: &str, method: &str) -> Option<&Operation> {
        self.paths.get(path)?.get(&method.to_ascii_lowercase())
    }

    /// Compact JSON text of the snapshot, as embedded into sandboxes.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Hex SHA-256 over [`Self::to_json`]. Changes whenever the content does.
    pub fn fingerprint(&self) -> Result<String, SnapshotError> {
        Ok(fingerprint_json(&self.to_json()?))
    }

    fn validate(&self) -> Result<(), SnapshotError> {
        for (path, methods) in &self.paths {
            if !path.starts_with('/') {
                return Err(SnapshotError::Invalid(format!(
                    "path '{}' must start with '/'",
                    path
                )));
            }
            if let Some(method) = methods.keys().find(|m| !HTTP_METHODS.contains(&m.as_str())) {
                return Err(SnapshotError::Invalid(format!(
                    "'{}' under '{}' is not a lower-case HTTP method",
                    method, path
                )));
            }
        }
        Ok(())
    }
}

/// Hex SHA-256 of snapshot JSON text.
pub fn fingerprint_json(json: &str) -> String {
    let digest = Sha256::digest(json.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest.iter() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Builder for constructing snapshots in code.
#[derive(Default)]
pub struct SnapshotBuilder {
    snapshot: SpecSnapshot,
}

impl SnapshotBuilder {
    /// Create a new snapshot builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the operation at `path` + `method`.
    pub fn operation(mut self, path: impl Into<String>, method: &str, mut op: Operation) -> Self {
        op.summary = op.summary.map(|s| clamp_text(&s));
        op.description = op.description.map(|s| clamp_text(&s));
        self.snapshot
            .paths
            .entry(path.into())
            .or_default()
            .insert(method.to_ascii_lowercase(), op);
        self
    }

    /// Build the snapshot.
    pub fn build(self) -> SpecSnapshot {
        self.snapshot
    }
}

/// Truncate to [`MAX_DESCRIPTION_LENGTH`] bytes on a char boundary.
fn clamp_text(text: &str) -> String {
    if text.len() <= MAX_DESCRIPTION_LENGTH {
        return text.to_string();
    }
    let mut end = MAX_DESCRIPTION_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
