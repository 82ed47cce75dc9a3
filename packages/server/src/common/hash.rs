//! Content fingerprinting and idempotency-key handling.
//!
//! Fingerprints are sha256 hashes over a canonical JSON rendering (object
//! keys sorted recursively) so that semantically identical parameter maps
//! hash identically regardless of key order.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::{ResearchError, Result};

/// Maximum accepted length of a client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 64;

/// Render a JSON value with all object keys sorted, recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Stable content hash of a normalized parameter map.
pub fn fingerprint(value: &Value) -> String {
    content_hash(&canonical_json(value))
}

/// sha256 hex digest of a string.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate a client-supplied idempotency key: `[A-Za-z0-9_-]`, at most 64.
pub fn validate_idempotency_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > IDEMPOTENCY_KEY_MAX_LEN {
        return Err(ResearchError::Validation(format!(
            "idempotency key must be 1-{} characters",
            IDEMPOTENCY_KEY_MAX_LEN
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ResearchError::Validation(
            "idempotency key may only contain [A-Za-z0-9_-]".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let v = json!({"items": [3, 1, 2]});
        assert_eq!(canonical_json(&v), r#"{"items":[3,1,2]}"#);
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = json!({"query": "capital of France", "costPreference": "low"});
        let b = json!({"costPreference": "low", "query": "capital of France"});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_differs_for_different_params() {
        let a = json!({"query": "capital of France"});
        let b = json!({"query": "capital of Spain"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn idempotency_key_charset() {
        assert!(validate_idempotency_key("abc_DEF-123").is_ok());
        assert!(validate_idempotency_key("has space").is_err());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key(&"x".repeat(65)).is_err());
        assert!(validate_idempotency_key(&"x".repeat(64)).is_ok());
    }
}
