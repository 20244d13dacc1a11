#![warn(missing_docs)]

//! # anvil-config
//!
//! Configuration loading for the Anvil code execution service.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [upstream]
//! base_url = "https://api.example.com/client/v4"
//! timeout_secs = 30
//!
//! [snapshot]
//! path = "openapi-snapshot.json"
//!
//! [sandbox]
//! timeout_secs = 30
//! max_heap_mb = 128
//! max_concurrent = 16
//!
//! [cache]
//! api_max_entries = 100
//! search_max_entries = 10
//!
//! [response]
//! max_tokens = 10000
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default upstream API base used when the config does not name one.
pub const DEFAULT_BASE_URL: &str = "https://api.cloudflare.com/client/v4";

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level Anvil configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnvilConfig {
    /// Upstream HTTP API settings.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Where to find the API specification snapshot.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Sandbox cache sizes.
    #[serde(default)]
    pub cache: CacheOverrides,

    /// Response size budget.
    #[serde(default)]
    pub response: ResponseOverrides,
}

/// Upstream API configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL every sandbox request is resolved against.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl UpstreamConfig {
    /// The configured base URL, or [`DEFAULT_BASE_URL`].
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }
}

/// Snapshot location.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotConfig {
    /// Path to the JSON snapshot file. Relative paths resolve against the
    /// working directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum size of submitted code in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum concurrent executions across both caches.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl SandboxOverrides {
    /// `max_heap_mb` in bytes.
    pub fn max_heap_bytes(&self) -> Result<Option<usize>, ConfigError> {
        scaled("sandbox.max_heap_mb", self.max_heap_mb, 1024 * 1024)
    }

    /// `max_code_size_kb` in bytes.
    pub fn max_code_size_bytes(&self) -> Result<Option<usize>, ConfigError> {
        scaled("sandbox.max_code_size_kb", self.max_code_size_kb, 1024)
    }
}

fn scaled(name: &str, value: Option<usize>, unit: usize) -> Result<Option<usize>, ConfigError> {
    value
        .map(|v| {
            v.checked_mul(unit)
                .ok_or_else(|| ConfigError::Invalid(format!("{} is too large", name)))
        })
        .transpose()
}

/// Cache size overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheOverrides {
    /// Maximum live API-execution sandboxes.
    #[serde(default)]
    pub api_max_entries: Option<usize>,

    /// Maximum live search sandboxes. Each embeds the full snapshot, so keep
    /// this small.
    #[serde(default)]
    pub search_max_entries: Option<usize>,
}

/// Response budget overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseOverrides {
    /// Maximum result size in token-equivalents.
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

impl AnvilConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: AnvilConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let base = self.upstream.base_url();
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(ConfigError::Invalid(format!(
                "upstream.base_url must be an http(s) URL, got '{}'",
                base
            )));
        }

        for (name, value) in [
            ("cache.api_max_entries", self.cache.api_max_entries),
            ("cache.search_max_entries", self.cache.search_max_entries),
            ("response.max_tokens", self.response.max_tokens),
            ("sandbox.max_concurrent", self.sandbox.max_concurrent),
            ("sandbox.max_heap_mb", self.sandbox.max_heap_mb),
            ("sandbox.max_code_size_kb", self.sandbox.max_code_size_kb),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }

        if self.sandbox.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_secs must be at least 1".into(),
            ));
        }

        self.sandbox.max_heap_bytes()?;
        self.sandbox.max_code_size_bytes()?;

        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
