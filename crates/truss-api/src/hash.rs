//! Canonical content hashing for JSON values.
//!
//! The value is first written out in a canonical, kind-tagged encoding:
//! object keys are sorted, every leaf is prefixed with its kind, and strings
//! and containers carry their length so distinct values never share an
//! encoding. The encoding is then digested with SHA-256.
//!
//! Two values that differ only in object key insertion order hash
//! identically, which is what the transaction protocol relies on to detect
//! staleness.

use std::fmt::Write;

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

// ── Kind tags ──────────────────────────────────────────────────────────────

const NULL_TAG: &str = "null";
const BOOL_TAG: char = 'b';
const NUMBER_TAG: char = 'n';
const STRING_TAG: char = 's';
const ARRAY_TAG: char = 'a';
const OBJECT_TAG: char = 'o';

/// Hash a JSON value, returning a lowercase hex digest.
pub fn hash(value: &Value) -> String {
    let mut encoded = String::new();
    encode(&mut encoded, value);
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// Write the canonical encoding of `value` into `out`.
///
/// Exposed for diagnostics; callers comparing values should use [`hash`].
pub fn encode(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str(NULL_TAG),
        Value::Bool(b) => {
            let _ = write!(out, "{BOOL_TAG}:{b}");
        }
        Value::Number(n) => {
            out.push(NUMBER_TAG);
            out.push(':');
            encode_number(out, n);
        }
        Value::String(s) => encode_str(out, s),
        Value::Array(items) => {
            let _ = write!(out, "{ARRAY_TAG}:{}[", items.len());
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => encode_object(out, map),
    }
}

fn encode_str(out: &mut String, s: &str) {
    let _ = write!(out, "{STRING_TAG}:{}:{s}", s.len());
}

fn encode_object(out: &mut String, map: &Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let _ = write!(out, "{OBJECT_TAG}:{}{{", keys.len());
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_str(out, key);
        out.push('=');
        encode(out, &map[key]);
    }
    out.push('}');
}

/// Numbers are compared by value, so `1` and `1.0` share an encoding.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn encode_number(out: &mut String, n: &Number) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            let _ = write!(out, "{}", f as i64);
        } else {
            let _ = write!(out, "{f}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(value: &Value) -> String {
        let mut out = String::new();
        encode(&mut out, value);
        out
    }

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn kinds_are_tagged() {
        assert_ne!(hash(&json!("1")), hash(&json!(1)));
        assert_ne!(hash(&json!(true)), hash(&json!("true")));
        assert_ne!(hash(&json!([])), hash(&json!({})));
        assert_ne!(hash(&json!(null)), hash(&json!("null")));
    }

    #[test]
    fn integral_floats_match_integers() {
        assert_eq!(hash(&json!(1.0)), hash(&json!(1)));
        assert_ne!(hash(&json!(1.5)), hash(&json!(1)));
    }

    #[test]
    fn strings_are_length_prefixed() {
        assert_ne!(hash(&json!(["a,b"])), hash(&json!(["a", "b"])));
        assert_eq!(encoded(&json!({"k": "v"})), "o:1{s:1:k=s:1:v}");
    }

    #[test]
    fn nested_values_hash_structurally() {
        let a = json!({"x": {"p": [1, 2], "q": null}, "y": "z"});
        let b = json!({"y": "z", "x": {"q": null, "p": [1, 2]}});
        assert_eq!(hash(&a), hash(&b));
        assert_eq!(hash(&a).len(), 64);
    }
}
