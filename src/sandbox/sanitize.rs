/// Value sanitization for data crossing the sandbox boundary
///
/// Every value is deep-copied. Prototype-style keys are dropped, oversized
/// strings truncated and nesting capped. JSON carries no functions or symbols;
/// Lua functions, threads and userdata are dropped on the way out in `lua.rs`.

use serde_json::{Map, Value};

pub const FORBIDDEN_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

#[derive(Debug, Clone, Copy)]
pub struct SanitizeLimits {
    pub max_string_bytes: usize,
    pub max_depth: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_string_bytes: 64 * 1024,
            max_depth: 32,
        }
    }
}

/// Deep-clone `value` applying the limits
pub fn sanitize_value(value: &Value, limits: SanitizeLimits) -> Value {
    sanitize_at(value, limits, 0)
}

fn sanitize_at(value: &Value, limits: SanitizeLimits, depth: usize) -> Value {
    if depth > limits.max_depth {
        return Value::Null;
    }
    match value {
        Value::String(s) => Value::String(truncate_utf8(s, limits.max_string_bytes)),
        Value::Array(items) => Value::Array(
            items.iter().map(|item| sanitize_at(item, limits, depth + 1)).collect(),
        ),
        Value::Object(obj) => {
            let mut clean = Map::new();
            for (key, val) in obj {
                if FORBIDDEN_KEYS.contains(&key.as_str()) {
                    tracing::debug!("🧹 Dropping forbidden key '{}' at depth {}", key, depth);
                    continue;
                }
                clean.insert(key.clone(), sanitize_at(val, limits, depth + 1));
            }
            Value::Object(clean)
        }
        other => other.clone(),
    }
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence
pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forbidden_keys_are_dropped_at_every_level() {
        let dirty = json!({
            "__proto__": { "admin": true },
            "user": { "constructor": "x", "name": "ada", "tags": [{ "prototype": 1, "ok": 2 }] }
        });
        let clean = sanitize_value(&dirty, SanitizeLimits::default());
        assert_eq!(clean, json!({ "user": { "name": "ada", "tags": [{ "ok": 2 }] } }));
    }

    #[test]
    fn long_strings_are_truncated_on_char_boundaries() {
        let limits = SanitizeLimits { max_string_bytes: 2, max_depth: 8 };
        let clean = sanitize_value(&json!({ "s": "héllo world" }), limits);
        // 'é' spans bytes 1..3, so a two byte cut falls back to "h"
        assert_eq!(clean["s"], "h");
    }

    #[test]
    fn deep_nesting_is_cut() {
        let limits = SanitizeLimits { max_string_bytes: 16, max_depth: 1 };
        let clean = sanitize_value(&json!({ "a": { "b": { "c": 1 } } }), limits);
        assert_eq!(clean, json!({ "a": { "b": null } }));
    }
}
