//! Redaction of credentials from JSON documents.
//!
//! Profile snapshots are persisted to the lakehouse and printed by the CLI,
//! so anything that looks like a credential is replaced before it leaves the
//! process. Secret handles (`secret://...`) are redacted as well: they are
//! not secrets themselves but they name where one lives.

use serde_json::{Map, Value};

use crate::variables::SECRET_SCHEME;

/// Redaction placeholder.
pub const REDACTED: &str = "[REDACTED]";

/// Key fragments that mark a value as sensitive (lowercase).
static SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
    "client_secret",
    "connection_string",
    "passphrase",
];

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase().replace('-', "_");
    SENSITIVE_KEYS
        .iter()
        .any(|sensitive| key_lower.contains(sensitive))
}

fn is_sensitive_value(value: &str) -> bool {
    let lower = value.to_lowercase();
    if lower.starts_with(SECRET_SCHEME) || lower.starts_with("bearer ") || lower.starts_with("basic ") {
        return true;
    }

    // JWT (header.payload.signature)
    if value.starts_with("eyJ") && value.chars().filter(|&c| c == '.').count() == 2 && value.len() > 50 {
        return true;
    }

    value.contains("-----BEGIN") && value.contains("PRIVATE KEY-----")
}

/// Nesting depth past which whole subtrees are redacted unread.
const MAX_DEPTH: usize = 20;

/// Return a copy of `value` with sensitive entries replaced by [`REDACTED`].
pub fn sanitize_sensitive_data(value: &Value) -> Value {
    sanitize_recursive(value, 0, MAX_DEPTH)
}

fn sanitize_recursive(value: &Value, depth: usize, max_depth: usize) -> Value {
    if depth >= max_depth {
        return Value::String(REDACTED.to_string());
    }

    match value {
        Value::Object(map) => {
            let mut result = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_null() {
                    result.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    result.insert(key.clone(), sanitize_recursive(val, depth + 1, max_depth));
                }
            }
            Value::Object(result)
        }
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|item| sanitize_recursive(item, depth + 1, max_depth))
                .collect(),
        ),
        Value::String(s) if is_sensitive_value(s) => Value::String(REDACTED.to_string()),
        _ => value.clone(),
    }
}

/// Redact `KEY=value` pairs in process environment listings.
pub fn sanitize_env_pairs(pairs: &[(String, String)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| {
            if is_sensitive_key(k) || is_sensitive_value(v) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}
