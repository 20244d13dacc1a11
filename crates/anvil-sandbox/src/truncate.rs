//! Bounding the size of execution results.
//!
//! Budgets are expressed in token-equivalents, counted as four bytes of
//! compact JSON each. A result that fits is returned untouched. Otherwise the
//! structure is kept and cut down with progressively tighter limits; every cut
//! leaves a marker naming the original size or count. If no structural form
//! fits, the compact JSON text itself is cut to a prefix.

use serde_json::{Map, Value};

/// Default budget in token-equivalents.
pub const DEFAULT_MAX_TOKENS: usize = 10_000;

/// Bytes of compact JSON counted as one token.
pub const BYTES_PER_TOKEN: usize = 4;

/// Smallest accepted budget; below this not even a marker fits.
const MIN_TOKENS: usize = 32;

const MIN_STRING_CHARS: usize = 16;

/// Cuts values down to a size budget.
#[derive(Debug, Clone, Copy)]
pub struct Truncator {
    max_tokens: usize,
}

impl Default for Truncator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    string_chars: usize,
    items: usize,
    keys: usize,
    depth: usize,
}

impl Limits {
    fn tighten(self) -> Option<Self> {
        let next = Self {
            string_chars: (self.string_chars / 2).max(MIN_STRING_CHARS),
            items: (self.items / 2).max(1),
            keys: (self.keys / 2).max(1),
            depth: self.depth.saturating_sub(1),
        };
        let unchanged = next.string_chars == self.string_chars
            && next.items == self.items
            && next.keys == self.keys
            && next.depth == self.depth;
        (!unchanged).then_some(next)
    }
}

impl Truncator {
    /// A truncator with a budget of `max_tokens` token-equivalents.
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(MIN_TOKENS),
        }
    }

    /// The budget in token-equivalents.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// The budget in bytes of compact JSON.
    pub fn budget_bytes(&self) -> usize {
        self.max_tokens * BYTES_PER_TOKEN
    }

    /// Bound `value` to the budget.
    pub fn truncate(&self, value: Value) -> Value {
        let budget = self.budget_bytes();
        let original_len = compact_len(&value);
        if original_len <= budget {
            return value;
        }

        let mut limits = Limits {
            string_chars: budget / 2,
            items: 64,
            keys: 64,
            depth: 12,
        };
        loop {
            let candidate = shrink(&value, limits, 0);
            if compact_len(&candidate) <= budget {
                tracing::debug!(
                    original_bytes = original_len,
                    budget_bytes = budget,
                    "result truncated structurally"
                );
                return candidate;
            }
            match limits.tighten() {
                Some(next) => limits = next,
                None => break,
            }
        }

        tracing::debug!(
            original_bytes = original_len,
            budget_bytes = budget,
            "result truncated to text prefix"
        );
        text_prefix(&value, original_len, budget)
    }
}

fn compact_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(usize::MAX)
}

fn shrink(value: &Value, limits: Limits, depth: usize) -> Value {
    match value {
        Value::String(s) => Value::String(shrink_string(s, limits.string_chars)),
        Value::Array(items) if depth >= limits.depth && !items.is_empty() => {
            Value::String(format!("[array of {} items]", items.len()))
        }
        Value::Object(map) if depth >= limits.depth && !map.is_empty() => {
            Value::String(format!("{{object with {} keys}}", map.len()))
        }
        Value::Array(items) => {
            let mut out: Vec<Value> = items
                .iter()
                .take(limits.items)
                .map(|item| shrink(item, limits, depth + 1))
                .collect();
            if items.len() > limits.items {
                out.push(Value::String(format!(
                    "… {} more items ({} total)",
                    items.len() - limits.items,
                    items.len()
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map.iter().take(limits.keys) {
                out.insert(key.clone(), shrink(item, limits, depth + 1));
            }
            if map.len() > limits.keys {
                out.insert(
                    "…".to_string(),
                    Value::String(format!(
                        "{} more keys ({} total)",
                        map.len() - limits.keys,
                        map.len()
                    )),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn shrink_string(s: &str, max_chars: usize) -> String {
    let total = s.chars().count();
    if total <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str(&format!("…[truncated, {} chars total]", total));
    out
}

fn text_prefix(value: &Value, original_len: usize, budget: usize) -> Value {
    let text = serde_json::to_string(value).unwrap_or_default();
    let note = format!("…[truncated, {} bytes total]", original_len);
    let chars: Vec<char> = text.chars().collect();

    let mut keep = chars.len().min(budget);
    loop {
        let mut candidate: String = chars[..keep].iter().collect();
        candidate.push_str(&note);
        let candidate = Value::String(candidate);
        let len = compact_len(&candidate);
        if len <= budget || keep == 0 {
            return candidate;
        }
        keep = keep.saturating_sub((len - budget).max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_values_pass_untouched() {
        let t = Truncator::new(100);
        let value = json!({"a": [1, 2, 3], "b": "short"});
        assert_eq!(t.truncate(value.clone()), value);
    }

    #[test]
    fn long_string_keeps_prefix_and_total() {
        let t = Truncator::new(64);
        let long = "x".repeat(5_000);
        let out = t.truncate(json!(long));
        let s = out.as_str().unwrap();
        assert!(s.starts_with("xxxx"));
        assert!(s.contains("5000 chars total"), "{s}");
        assert!(compact_len(&out) <= t.budget_bytes());
    }

    #[test]
    fn long_array_keeps_prefix_and_count() {
        let t = Truncator::new(100);
        let items: Vec<Value> = (0..1_000).map(|i| json!({"id": i, "name": format!("item-{i}")})).collect();
        let out = t.truncate(Value::Array(items));
        let arr = out.as_array().unwrap();
        assert_eq!(arr[0]["id"], 0);
        let marker = arr.last().unwrap().as_str().unwrap();
        assert!(marker.contains("(1000 total)"), "{marker}");
        assert!(compact_len(&out) <= t.budget_bytes());
    }

    #[test]
    fn wide_object_notes_omitted_keys() {
        let t = Truncator::new(64);
        let mut map = Map::new();
        for i in 0..500 {
            map.insert(format!("key{i:04}"), json!(i));
        }
        let out = t.truncate(Value::Object(map));
        let marker = out["…"].as_str().unwrap();
        assert!(marker.contains("(500 total)"), "{marker}");
        assert!(compact_len(&out) <= t.budget_bytes());
    }

    #[test]
    fn deep_nesting_is_summarized() {
        let t = Truncator::new(32);
        let mut value = json!("leaf".repeat(200));
        for _ in 0..40 {
            value = json!({ "child": value, "pad": "p".repeat(50) });
        }
        let out = t.truncate(value);
        assert!(compact_len(&out) <= t.budget_bytes());
        let text = serde_json::to_string(&out).unwrap();
        assert!(text.contains("total") || text.contains("object with"), "{text}");
    }

    #[test]
    fn tiny_budgets_are_raised_to_minimum() {
        assert_eq!(Truncator::new(0).max_tokens(), MIN_TOKENS);
    }

    #[test]
    fn text_prefix_respects_budget() {
        let value = json!(["\"quoted\"".repeat(100)]);
        let out = text_prefix(&value, 900, 128);
        assert!(compact_len(&out) <= 128);
        assert!(out.as_str().unwrap().contains("900 bytes total"));
    }
}
