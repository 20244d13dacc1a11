//! Sandbox definition synthesis.
//!
//! [`TemplateBuilder`] assembles a fixed skeleton from three kinds of slots:
//!
//! - **literal slots**: named bindings whose values are embedded as JSON and
//!   deep-frozen inside the sandbox;
//! - **capability slots**: fixed JavaScript snippets authored in this crate,
//!   such as the `request` helper;
//! - **one code slot**: the caller's code, embedded verbatim and always
//!   invoked as a zero-argument async function.
//!
//! Data only ever enters through serialization. The code slot is the only
//! place where caller text becomes program text.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::SandboxError;

/// Name under which the embedded specification snapshot is exposed.
pub const SNAPSHOT_BINDING: &str = "spec";
/// Name under which the bound account identifier is exposed.
pub const ACCOUNT_BINDING: &str = "accountId";
/// Name under which the upstream API base is exposed.
pub const API_BASE_BINDING: &str = "apiBase";

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").unwrap());

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
    "undefined", "NaN", "Infinity", "globalThis", "log", "request",
];

/// A crate-authored snippet that can be placed in a capability slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// `request(...)` over the fetch op, resolved against [`API_BASE_BINDING`].
    Request,
}

impl Capability {
    fn source(self) -> &'static str {
        match self {
            Self::Request => REQUEST_CAPABILITY,
        }
    }

    fn requires(self) -> &'static [&'static str] {
        match self {
            Self::Request => &[API_BASE_BINDING],
        }
    }
}

/// URL prefix a sandbox may reach through the fetch op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Egress {
    base_url: String,
}

impl Egress {
    /// Allow requests under `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The permitted base, without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether `url` stays under the permitted base.
    pub fn allows(&self, url: &str) -> bool {
        let Some(rest) = url.strip_prefix(self.base_url.as_str()) else {
            return false;
        };
        if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')) {
            return false;
        }
        if rest.contains('\\') {
            return false;
        }

        let path = rest.split(['?', '#']).next().unwrap_or_default();
        !path.split('/').any(|segment| {
            let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
            decoded == "." || decoded == ".."
        })
    }
}

/// Everything a host needs to create a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxDefinition {
    /// Identity the sandbox is registered under.
    pub id: String,
    /// Complete bootstrap source.
    pub source: String,
    /// Network allowance, `None` for no egress at all.
    pub egress: Option<Egress>,
}

impl SandboxDefinition {
    /// Hex SHA-256 of the source, used to tell apart definitions that share an id.
    pub fn digest(&self) -> String {
        sha256_hex(&self.source)
    }
}

enum LiteralValue {
    Owned(String),
    Shared(Arc<str>),
}

impl LiteralValue {
    fn as_str(&self) -> &str {
        match self {
            Self::Owned(s) => s,
            Self::Shared(s) => s,
        }
    }
}

/// Builder for [`SandboxDefinition`]s.
pub struct TemplateBuilder {
    id: String,
    literals: Vec<(String, LiteralValue)>,
    capabilities: Vec<Capability>,
    code: Option<String>,
    egress: Option<Egress>,
}

impl TemplateBuilder {
    /// Start a definition for the sandbox identified by `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            literals: Vec::new(),
            capabilities: Vec::new(),
            code: None,
            egress: None,
        }
    }

    /// Embed `value` as a frozen global named `name`.
    pub fn literal<T: Serialize + ?Sized>(
        mut self,
        name: &str,
        value: &T,
    ) -> Result<Self, SandboxError> {
        self.check_name(name)?;
        let json = serde_json::to_string(value)?;
        self.literals
            .push((name.to_string(), LiteralValue::Owned(json)));
        Ok(self)
    }

    /// Embed JSON text that was already produced by `serde_json`. Lets a
    /// large value be serialized once and shared by many definitions.
    pub fn serialized_literal(mut self, name: &str, json: Arc<str>) -> Result<Self, SandboxError> {
        self.check_name(name)?;
        self.literals
            .push((name.to_string(), LiteralValue::Shared(json)));
        Ok(self)
    }

    /// Add a capability snippet.
    pub fn capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set the caller's code.
    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Permit fetches under `base_url`.
    pub fn egress(mut self, base_url: &str) -> Self {
        self.egress = Some(Egress::new(base_url));
        self
    }

    /// Assemble the definition.
    pub fn build(self) -> Result<SandboxDefinition, SandboxError> {
        let code = self.code.as_deref().ok_or_else(|| SandboxError::ValidationFailed {
            reason: "no code supplied".into(),
        })?;
        // A trailing statement terminator would break the expression slot.
        let code = code.trim_end().trim_end_matches(';');

        let bound: HashSet<&str> = self.literals.iter().map(|(n, _)| n.as_str()).collect();
        for capability in &self.capabilities {
            for needed in capability.requires() {
                if !bound.contains(needed) {
                    return Err(SandboxError::Execution(anyhow::anyhow!(
                        "capability {capability:?} needs literal '{needed}'"
                    )));
                }
            }
        }

        let literal_len: usize = self.literals.iter().map(|(_, v)| v.as_str().len()).sum();
        let mut source = String::with_capacity(literal_len + code.len() + 4096);

        source.push_str(PRELUDE);
        for (name, value) in &self.literals {
            source.push_str("    const ");
            source.push_str(name);
            source.push_str(" = __anvilFreeze(");
            source.push_str(value.as_str());
            source.push_str(");\n    __anvilExpose(\"");
            source.push_str(name);
            source.push_str("\", ");
            source.push_str(name);
            source.push_str(");\n");
        }
        for capability in &self.capabilities {
            source.push_str(capability.source());
        }
        source.push_str(LOCKDOWN);
        source.push_str("    const __anvilUser = ((ops, __anvilExpose) => (\n");
        source.push_str(code);
        source.push_str("\n    ))();\n");
        source.push_str(INVOKER);

        Ok(SandboxDefinition {
            id: self.id,
            source,
            egress: self.egress,
        })
    }

    fn check_name(&self, name: &str) -> Result<(), SandboxError> {
        if !IDENTIFIER_RE.is_match(name) || name.starts_with("__anvil") {
            return Err(SandboxError::ValidationFailed {
                reason: format!("'{name}' is not a usable binding name"),
            });
        }
        if RESERVED_WORDS.contains(&name) {
            return Err(SandboxError::ValidationFailed {
                reason: format!("'{name}' is reserved"),
            });
        }
        if self.literals.iter().any(|(existing, _)| existing == name) {
            return Err(SandboxError::ValidationFailed {
                reason: format!("'{name}' is bound twice"),
            });
        }
        Ok(())
    }
}

/// Definition of a search sandbox: the snapshot bound as `spec`, no egress.
pub fn search_definition(
    id: &str,
    snapshot_json: Arc<str>,
    code: &str,
) -> Result<SandboxDefinition, SandboxError> {
    TemplateBuilder::new(id)
        .serialized_literal(SNAPSHOT_BINDING, snapshot_json)?
        .code(code)
        .build()
}

/// Definition of an API sandbox: `accountId`, `apiBase` and `request(...)`,
/// with egress limited to `api_base`.
pub fn api_definition(
    id: &str,
    account_id: &str,
    api_base: &str,
    code: &str,
) -> Result<SandboxDefinition, SandboxError> {
    TemplateBuilder::new(id)
        .literal(ACCOUNT_BINDING, account_id)?
        .literal(API_BASE_BINDING, api_base)?
        .capability(Capability::Request)
        .egress(api_base)
        .code(code)
        .build()
}

/// Hex SHA-256 of a string.
pub(crate) fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest.iter() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

const PRELUDE: &str = r#"((ops) => {
    const __anvilFreeze = (value) => {
        if (value !== null && typeof value === "object" && !Object.isFrozen(value)) {
            Object.freeze(value);
            for (const key of Object.keys(value)) __anvilFreeze(value[key]);
        }
        return value;
    };
    const __anvilExpose = (name, value) => Object.defineProperty(globalThis, name, {
        value, enumerable: true, writable: false, configurable: false,
    });
    __anvilExpose("log", (...args) => ops.op_anvil_log(args.map(String).join(" ")));
"#;

const REQUEST_CAPABILITY: &str = r#"    const __anvilBase = apiBase.replace(/\/+$/, "");
    const __anvilRequest = async (...args) => {
        const opts = (args.length === 1 && args[0] !== null && typeof args[0] === "object")
            ? args[0]
            : { method: args[0], path: args[1], query: args[2], body: args[3] };
        const method = String(opts.method || "GET").toUpperCase();
        const path = String(opts.path || "");
        let url = __anvilBase + (path.startsWith("/") ? path : "/" + path);
        if (opts.query) {
            const qs = Object.entries(opts.query)
                .filter(([, v]) => v !== undefined && v !== null)
                .map(([k, v]) => encodeURIComponent(k) + "=" + encodeURIComponent(String(v)))
                .join("&");
            if (qs) url += (url.includes("?") ? "&" : "?") + qs;
        }
        const hasBody = opts.body !== undefined;
        const raw = await ops.op_anvil_fetch(
            method, url, hasBody, hasBody ? JSON.stringify(opts.body) : ""
        );
        const res = JSON.parse(raw);
        const isJson = /^application\/([\w.+-]*\+)?json\b/i.test(res.contentType || "");
        if (!isJson) {
            if (res.status >= 200 && res.status < 300) {
                return { success: true, result: res.body, errors: [], messages: [] };
            }
            throw new Error(`HTTP ${res.status}: ${res.body}`);
        }
        const data = JSON.parse(res.body);
        if (data !== null && typeof data === "object" && data.success === false) {
            const errors = Array.isArray(data.errors) ? data.errors : [];
            const joined = errors.map((e) => `${e && e.code}: ${e && e.message}`).join(", ");
            throw new Error(joined || `HTTP ${res.status}: request failed`);
        }
        return data;
    };
    __anvilExpose("request", __anvilRequest);
"#;

const LOCKDOWN: &str = r#"    delete globalThis.Deno;
    delete globalThis.eval;
    const AsyncFunction = (async function(){}).constructor;
    const GeneratorFunction = (function*(){}).constructor;
    Object.defineProperty(Function.prototype, "constructor", {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(AsyncFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false
    });
    Object.defineProperty(GeneratorFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false
    });
"#;

const INVOKER: &str = r#"    const __anvilFn = typeof __anvilUser === "function" ? __anvilUser : async () => __anvilUser;
    const __anvilDescribe = (e) => {
        try {
            const message = (e !== null && typeof e === "object" && e.message !== undefined)
                ? String(e.message)
                : String(e);
            const stack = (e !== null && typeof e === "object" && e.stack) ? String(e.stack) : "";
            return { message: message || String(e) || "uncaught exception", stack };
        } catch (_) {
            return { message: "uncaught exception", stack: "" };
        }
    };
    Object.defineProperty(globalThis, "__anvilInvoke", {
        value: async (id) => {
            let envelope;
            try {
                let value = await __anvilFn();
                if (value === undefined || typeof value === "function" || typeof value === "symbol") {
                    value = null;
                }
                envelope = JSON.stringify({ result: value });
            } catch (e) {
                envelope = JSON.stringify({ error: __anvilDescribe(e) });
            }
            ops.op_anvil_set_result(id, envelope);
        },
        enumerable: false, writable: false, configurable: false,
    });
})(Deno.core.ops);
"#;
