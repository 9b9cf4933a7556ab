//! Deterministic content IDs for blueprint entities.
//!
//! The wire format identifies containers by a hash of their attribute
//! content rather than by insertion order, so that attribute-equal
//! blueprints produced on different runs (or different machines) carry
//! identical IDs. Sensitive attributes such as SSH keys are excluded by
//! the callers before hashing.

use sha1::{Digest, Sha1};

/// Render a JSON value as a canonical string: object keys sorted, no
/// insignificant whitespace. Two structurally equal values always render
/// identically.
pub fn canonical_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape(k), canonical_string(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_string).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// SHA-1 of the canonical form of `attrs`, disambiguated by `ref_id` so
/// that otherwise-identical entities referenced more than once get
/// distinct IDs.
pub fn content_id(attrs: &serde_json::Value, ref_id: u32) -> String {
    let mut hasher = Sha1::new();
    hasher.update(canonical_string(attrs).as_bytes());
    hasher.update(b"|");
    hasher.update(ref_id.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
