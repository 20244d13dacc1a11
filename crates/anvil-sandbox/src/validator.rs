//! Pre-execution checks on submitted code.
//!
//! The isolate is the security boundary. These checks reject oversized or
//! empty submissions and a handful of escape idioms before any sandbox is
//! built, so obviously hostile code never costs an isolate or a cache slot.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SandboxError;

/// Default maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Globals that must not be called. Matched as whole identifiers, so
/// `isFunction(` or `retrieval(` pass.
const BANNED_CALLS: &[&str] = &["eval", "Function", "import", "require"];

/// Global references matched from an identifier boundary.
const BANNED_NAMES: &[&str] = &[
    "Deno.",
    "Reflect.construct",
    "globalThis[",
    "String.fromCharCode",
    "process.env",
    "process.exit",
    "process.binding",
];

/// Fragments banned wherever they appear.
const BANNED_FRAGMENTS: &[&str] = &[
    "__proto__",
    "__anvil",
    "constructor[",
    "constructor.constructor",
];

static BANNED: LazyLock<Vec<(String, Regex)>> = LazyLock::new(|| {
    let calls = BANNED_CALLS.iter().map(|name| {
        let re = Regex::new(&format!(r"(?:^|[^\w$]){}\s*\(", name)).unwrap();
        (format!("{name}("), re)
    });
    let names = BANNED_NAMES.iter().map(|name| {
        let re = Regex::new(&format!(r"(?:^|[^\w$]){}", regex::escape(name))).unwrap();
        (name.to_string(), re)
    });
    let fragments = BANNED_FRAGMENTS
        .iter()
        .map(|f| (f.to_string(), Regex::new(&regex::escape(f)).unwrap()));
    calls.chain(names).chain(fragments).collect()
});

/// Validate code before it is templated into a sandbox.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    if code.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "code is empty".into(),
        });
    }

    if let Some((pattern, _)) = BANNED.iter().find(|(_, re)| re.is_match(code)) {
        return Err(SandboxError::BannedPattern {
            pattern: pattern.clone(),
        });
    }

    Ok(())
}
